//! In-process exam store with the same contract as the SQLite one.

use super::{check_record, page_bounds, ExamPage, ExamStore, SourceRecords};
use crate::error::IngestError;
use crate::output::{sort_questions, NormalizedExamRecord, StoredExam};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    exams: Vec<StoredExam>,
}

#[derive(Debug, Default)]
pub struct MemoryExamStore {
    inner: Mutex<Inner>,
}

impl MemoryExamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored exams.
    pub fn len(&self) -> usize {
        self.lock().map(|g| g.exams.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored exam, in insertion order.
    pub fn all(&self) -> Vec<StoredExam> {
        self.lock().map(|g| g.exams.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, IngestError> {
        self.inner
            .lock()
            .map_err(|_| IngestError::Internal("exam store lock poisoned".into()))
    }
}

#[async_trait]
impl ExamStore for MemoryExamStore {
    async fn contains_source(&self, source_key: &str) -> Result<bool, IngestError> {
        Ok(self
            .lock()?
            .exams
            .iter()
            .any(|e| e.source_key.as_deref() == Some(source_key)))
    }

    async fn source_records(
        &self,
        source_key: &str,
    ) -> Result<Option<SourceRecords>, IngestError> {
        let inner = self.lock()?;
        let found: Vec<&StoredExam> = inner
            .exams
            .iter()
            .filter(|e| e.source_key.as_deref() == Some(source_key))
            .collect();
        if found.is_empty() {
            return Ok(None);
        }
        Ok(Some(SourceRecords {
            exam_ids: found.iter().map(|e| e.id).collect(),
            questions: found.iter().map(|e| e.record.questions.len()).sum(),
        }))
    }

    async fn insert_exams(
        &self,
        source_key: &str,
        records: &[NormalizedExamRecord],
    ) -> Result<Vec<i64>, IngestError> {
        // Validate everything first so a bad record leaves nothing behind.
        for record in records {
            check_record(record)?;
        }

        let mut inner = self.lock()?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            inner.next_id += 1;
            let id = inner.next_id;
            let mut record = record.clone();
            record.generated_answers = None;
            sort_questions(&mut record.questions);
            inner.exams.push(StoredExam {
                id,
                source_key: Some(source_key.to_string()),
                created_at: Utc::now(),
                record,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn list_exams(&self, page: u32, per_page: u32) -> Result<ExamPage, IngestError> {
        let (page, per_page, offset) = page_bounds(page, per_page);
        let inner = self.lock()?;
        let exams = inner
            .exams
            .iter()
            .rev()
            .skip(offset as usize)
            .take(per_page as usize)
            .cloned()
            .collect();
        Ok(ExamPage {
            exams,
            page,
            per_page,
            total: inner.exams.len() as u64,
        })
    }

    async fn delete_exam(&self, id: i64) -> Result<bool, IngestError> {
        let mut inner = self.lock()?;
        let before = inner.exams.len();
        inner.exams.retain(|e| e.id != id);
        Ok(inner.exams.len() < before)
    }
}
