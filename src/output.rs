//! Output types: normalised exam records and per-job outcomes.

use crate::error::FailureKind;
use crate::job::Stage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One question/answer pair belonging to an exam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    /// Always ≥ 1.
    pub question_number: u32,
    /// At most 10 characters, e.g. "a", "ii".
    pub question_sub_part: Option<String>,
    pub question_text: String,
    pub answer_text: String,
    pub has_image: bool,
    /// Public-disk locator of the copied image; set by the persistence mapper.
    pub image_ref: Option<String>,
}

impl QuestionAnswer {
    /// Presentation order: number ascending, then sub-part with `None` first.
    pub fn display_order(&self, other: &Self) -> Ordering {
        self.question_number
            .cmp(&other.question_number)
            .then_with(|| self.question_sub_part.cmp(&other.question_sub_part))
    }
}

/// Sort questions into presentation order in place.
pub fn sort_questions(questions: &mut [QuestionAnswer]) {
    questions.sort_by(QuestionAnswer::display_order);
}

/// Canonical structured output of one pipeline run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedExamRecord {
    /// Never empty: falls back to the upload's original name.
    pub exam_name: String,
    pub examiner: Option<String>,
    pub subject: Option<String>,
    pub class: Option<String>,
    pub term: Option<i64>,
    pub year: Option<String>,
    /// "CBC" or "844" by convention.
    pub curriculum: Option<String>,
    pub exam_type: Option<String>,
    /// Seconds elapsed in the run up to persistence.
    pub processing_time: Option<f64>,
    pub questions: Vec<QuestionAnswer>,
    pub answers_artifact_ref: Option<String>,
    pub image_ref: Option<String>,
    /// Consolidated answer key; rendered to an artifact, never stored as text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_answers: Option<String>,
}

/// An exam as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExam {
    pub id: i64,
    pub source_key: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub record: NormalizedExamRecord,
}

/// A question the normaliser dropped because required data was missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedQuestion {
    /// Index of the exam within the response.
    pub exam_index: usize,
    /// Index of the question within that exam's `questions` array.
    pub question_index: usize,
    pub reason: String,
}

/// Final result of one ingestion job. Errors never escape a job; they end up here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub original_name: String,
    pub storage_key: String,
    /// Attempts made, including the one that produced this outcome.
    pub attempts: u32,
    pub duration_ms: u64,
    pub skipped: Vec<SkippedQuestion>,
    #[serde(flatten)]
    pub status: JobStatus,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.status, JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Completed { exam_ids: Vec<i64>, questions: usize },
    /// The store already holds records for this upload; nothing was inserted.
    Duplicate,
    Failed {
        stage: Stage,
        kind: FailureKind,
        message: String,
        retryable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(n: u32, sub: Option<&str>) -> QuestionAnswer {
        QuestionAnswer {
            question_number: n,
            question_sub_part: sub.map(str::to_string),
            question_text: format!("Q{n}"),
            answer_text: "A".into(),
            has_image: false,
            image_ref: None,
        }
    }

    #[test]
    fn sorts_by_number_then_sub_part_with_none_first() {
        let mut qs = vec![q(2, None), q(1, Some("b")), q(1, Some("a"))];
        sort_questions(&mut qs);
        let keys: Vec<_> = qs
            .iter()
            .map(|q| (q.question_number, q.question_sub_part.as_deref()))
            .collect();
        assert_eq!(keys, vec![(1, Some("a")), (1, Some("b")), (2, None)]);

        let mut qs = vec![q(3, Some("a")), q(3, None)];
        sort_questions(&mut qs);
        assert_eq!(qs[0].question_sub_part, None);
    }

    #[test]
    fn outcome_serialises_with_status_tag() {
        let outcome = JobOutcome {
            original_name: "paper.pdf".into(),
            storage_key: "uploads/x.pdf".into(),
            attempts: 1,
            duration_ms: 12,
            skipped: vec![],
            status: JobStatus::Failed {
                stage: Stage::Calling,
                kind: FailureKind::Upstream,
                message: "HTTP 503".into(),
                retryable: true,
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "calling");
        assert_eq!(json["kind"], "upstream");
        assert!(!outcome.is_success());
    }
}
