//! SQLite-backed exam store.

use super::{page_bounds, ExamPage, ExamStore, SourceRecords};
use crate::error::IngestError;
use crate::output::{sort_questions, NormalizedExamRecord, QuestionAnswer, StoredExam};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS exams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_key TEXT,
    exam_name TEXT NOT NULL CHECK (length(trim(exam_name)) > 0),
    examiner TEXT,
    subject TEXT,
    class TEXT,
    term INTEGER,
    year TEXT,
    curriculum TEXT,
    type TEXT,
    processing_time REAL,
    answers TEXT,
    image TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_exams_source_key ON exams(source_key);
CREATE INDEX IF NOT EXISTS idx_exams_created_at ON exams(created_at);

CREATE TABLE IF NOT EXISTS exam_question_answers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exam_id INTEGER NOT NULL REFERENCES exams(id) ON DELETE CASCADE,
    question_number INTEGER NOT NULL CHECK (question_number >= 1),
    question_sub_part VARCHAR(10),
    question TEXT NOT NULL,
    answer TEXT NOT NULL,
    has_image BOOLEAN NOT NULL DEFAULT 0,
    image TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_questions_exam_id ON exam_question_answers(exam_id);
"#;

#[derive(Debug, sqlx::FromRow)]
struct ExamRow {
    id: i64,
    source_key: Option<String>,
    exam_name: String,
    examiner: Option<String>,
    subject: Option<String>,
    class: Option<String>,
    term: Option<i64>,
    year: Option<String>,
    curriculum: Option<String>,
    #[sqlx(rename = "type")]
    exam_type: Option<String>,
    processing_time: Option<f64>,
    answers: Option<String>,
    image: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct QuestionRow {
    question_number: i64,
    question_sub_part: Option<String>,
    question: String,
    answer: String,
    has_image: bool,
    image: Option<String>,
}

impl QuestionRow {
    fn into_question(self) -> Result<QuestionAnswer, IngestError> {
        let question_number = u32::try_from(self.question_number).map_err(|_| {
            IngestError::Persistence(format!(
                "stored question number {} is out of range",
                self.question_number
            ))
        })?;
        Ok(QuestionAnswer {
            question_number,
            question_sub_part: self.question_sub_part,
            question_text: self.question,
            answer_text: self.answer,
            has_image: self.has_image,
            image_ref: self.image,
        })
    }
}

/// Exam store on an SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteExamStore {
    pool: SqlitePool,
}

impl SqliteExamStore {
    /// Open (creating if missing) the database at `database_url` and make
    /// sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, IngestError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database. One connection, never recycled, so the
    /// data lives as long as the store.
    pub async fn in_memory() -> Result<Self, IngestError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, IngestError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        debug!("Exam schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn questions_for(&self, exam_id: i64) -> Result<Vec<QuestionAnswer>, IngestError> {
        let rows = sqlx::query_as::<_, QuestionRow>(
            r#"
            SELECT question_number, question_sub_part, question, answer, has_image, image
            FROM exam_question_answers
            WHERE exam_id = ?
            ORDER BY question_number ASC, question_sub_part ASC
            "#,
        )
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;

        let mut questions = rows
            .into_iter()
            .map(QuestionRow::into_question)
            .collect::<Result<Vec<_>, _>>()?;
        sort_questions(&mut questions);
        Ok(questions)
    }
}

#[async_trait]
impl ExamStore for SqliteExamStore {
    async fn contains_source(&self, source_key: &str) -> Result<bool, IngestError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM exams WHERE source_key = ?")
            .bind(source_key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn source_records(
        &self,
        source_key: &str,
    ) -> Result<Option<SourceRecords>, IngestError> {
        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM exams WHERE source_key = ? ORDER BY id")
                .bind(source_key)
                .fetch_all(&self.pool)
                .await?;
        if ids.is_empty() {
            return Ok(None);
        }
        let (questions,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM exam_question_answers q
            JOIN exams e ON e.id = q.exam_id
            WHERE e.source_key = ?
            "#,
        )
        .bind(source_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(SourceRecords {
            exam_ids: ids.into_iter().map(|(id,)| id).collect(),
            questions: questions.max(0) as usize,
        }))
    }

    async fn insert_exams(
        &self,
        source_key: &str,
        records: &[NormalizedExamRecord],
    ) -> Result<Vec<i64>, IngestError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let now = Utc::now();
            let exam_id = sqlx::query(
                r#"
                INSERT INTO exams (source_key, exam_name, examiner, subject, class, term,
                                   year, curriculum, type, processing_time, answers, image,
                                   created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(source_key)
            .bind(&record.exam_name)
            .bind(&record.examiner)
            .bind(&record.subject)
            .bind(&record.class)
            .bind(record.term)
            .bind(&record.year)
            .bind(&record.curriculum)
            .bind(&record.exam_type)
            .bind(record.processing_time)
            .bind(&record.answers_artifact_ref)
            .bind(&record.image_ref)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for q in &record.questions {
                sqlx::query(
                    r#"
                    INSERT INTO exam_question_answers (exam_id, question_number, question_sub_part,
                                                       question, answer, has_image, image,
                                                       created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(exam_id)
                .bind(i64::from(q.question_number))
                .bind(&q.question_sub_part)
                .bind(&q.question_text)
                .bind(&q.answer_text)
                .bind(q.has_image)
                .bind(&q.image_ref)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            ids.push(exam_id);
        }

        tx.commit().await?;
        info!(
            "Persisted {} exam(s) for source {}",
            ids.len(),
            source_key.chars().take(12).collect::<String>()
        );
        Ok(ids)
    }

    async fn list_exams(&self, page: u32, per_page: u32) -> Result<ExamPage, IngestError> {
        let (page, per_page, offset) = page_bounds(page, per_page);
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM exams")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, ExamRow>(
            r#"
            SELECT id, source_key, exam_name, examiner, subject, class, term, year,
                   curriculum, type, processing_time, answers, image, created_at
            FROM exams
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(i64::from(per_page))
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut exams = Vec::with_capacity(rows.len());
        for row in rows {
            let questions = self.questions_for(row.id).await?;
            exams.push(StoredExam {
                id: row.id,
                source_key: row.source_key,
                created_at: row.created_at,
                record: NormalizedExamRecord {
                    exam_name: row.exam_name,
                    examiner: row.examiner,
                    subject: row.subject,
                    class: row.class,
                    term: row.term,
                    year: row.year,
                    curriculum: row.curriculum,
                    exam_type: row.exam_type,
                    processing_time: row.processing_time,
                    questions,
                    answers_artifact_ref: row.answers,
                    image_ref: row.image,
                    generated_answers: None,
                },
            });
        }

        Ok(ExamPage {
            exams,
            page,
            per_page,
            total: total.max(0) as u64,
        })
    }

    async fn delete_exam(&self, id: i64) -> Result<bool, IngestError> {
        let result = sqlx::query("DELETE FROM exams WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(n: u32, sub: Option<&str>) -> QuestionAnswer {
        QuestionAnswer {
            question_number: n,
            question_sub_part: sub.map(str::to_string),
            question_text: format!("Question {n}"),
            answer_text: format!("Answer {n}"),
            has_image: false,
            image_ref: None,
        }
    }

    fn record(name: &str, questions: Vec<QuestionAnswer>) -> NormalizedExamRecord {
        NormalizedExamRecord {
            exam_name: name.into(),
            term: Some(2),
            curriculum: Some("CBC".into()),
            questions,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_then_list_round_trip() {
        let store = SqliteExamStore::in_memory().await.unwrap();
        let ids = store
            .insert_exams(
                "k1",
                &[record(
                    "Science",
                    vec![question(2, None), question(1, Some("b")), question(1, Some("a"))],
                )],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(store.contains_source("k1").await.unwrap());
        assert!(!store.contains_source("k2").await.unwrap());
        assert_eq!(
            store.source_records("k1").await.unwrap(),
            Some(SourceRecords {
                exam_ids: ids.clone(),
                questions: 3,
            })
        );
        assert_eq!(store.source_records("k2").await.unwrap(), None);

        let page = store.list_exams(1, 15).await.unwrap();
        assert_eq!(page.total, 1);
        let exam = &page.exams[0];
        assert_eq!(exam.id, ids[0]);
        assert_eq!(exam.record.term, Some(2));
        let order: Vec<_> = exam
            .record
            .questions
            .iter()
            .map(|q| (q.question_number, q.question_sub_part.clone()))
            .collect();
        assert_eq!(
            order,
            vec![(1, Some("a".into())), (1, Some("b".into())), (2, None)]
        );
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_every_record() {
        let store = SqliteExamStore::in_memory().await.unwrap();
        let bad = record("Broken", vec![question(0, None)]);
        let err = store
            .insert_exams("k1", &[record("Fine", vec![question(1, None)]), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));
        assert_eq!(store.list_exams(1, 15).await.unwrap().total, 0);
        assert!(!store.contains_source("k1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_cascades_to_questions() {
        let store = SqliteExamStore::in_memory().await.unwrap();
        let ids = store
            .insert_exams("k1", &[record("Maths", vec![question(1, None), question(2, None)])])
            .await
            .unwrap();
        assert!(store.delete_exam(ids[0]).await.unwrap());
        assert!(!store.delete_exam(ids[0]).await.unwrap());

        let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM exam_question_answers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_paginated() {
        let store = SqliteExamStore::in_memory().await.unwrap();
        for i in 0..5 {
            store
                .insert_exams(&format!("k{i}"), &[record(&format!("Exam {i}"), vec![])])
                .await
                .unwrap();
        }
        let first = store.list_exams(1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.last_page(), 3);
        assert_eq!(first.exams[0].record.exam_name, "Exam 4");
        assert_eq!(first.exams[1].record.exam_name, "Exam 3");

        let last = store.list_exams(3, 2).await.unwrap();
        assert_eq!(last.exams.len(), 1);
        assert_eq!(last.exams[0].record.exam_name, "Exam 0");
    }

    #[tokio::test]
    async fn file_database_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("exams.db").display());
        let store = SqliteExamStore::connect(&url).await.unwrap();
        store.insert_exams("k", &[record("A", vec![])]).await.unwrap();
        assert!(dir.path().join("exams.db").exists());
    }
}
