//! Exam persistence.
//!
//! [`ExamStore`] is the seam between the pipeline and the database.
//! [`SqliteExamStore`] is the production implementation; [`MemoryExamStore`]
//! honours the same contract without I/O and is what the tests use when
//! they do not care about SQL.
//!
//! ## Contract
//!
//! * `insert_exams` writes all records of one run (and their questions) in a
//!   single transaction: either every row lands or none does.
//! * Every inserted exam is tagged with the run's `source_key`, so
//!   `contains_source` can tell a retry from a first attempt, and
//!   `source_records` can tell a cancelled run whether its insert landed.
//! * `list_exams` is newest first; each exam's questions are sorted by
//!   `(question_number, question_sub_part)` with a missing sub-part first.
//! * Deleting an exam deletes its questions.

mod memory;
mod sqlite;

pub use memory::MemoryExamStore;
pub use sqlite::SqliteExamStore;

use crate::error::IngestError;
use crate::output::{NormalizedExamRecord, StoredExam};
use async_trait::async_trait;
use serde::Serialize;

/// Page size used by the listing when none is given.
pub const DEFAULT_PER_PAGE: u32 = 15;

#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Whether any exam was already persisted for this source key.
    async fn contains_source(&self, source_key: &str) -> Result<bool, IngestError>;

    /// The exams (and their question count) stored for this source key, or
    /// `None` if there are none.
    async fn source_records(&self, source_key: &str) -> Result<Option<SourceRecords>, IngestError>;

    /// Insert all records of one run atomically. Returns the new exam ids in
    /// input order.
    async fn insert_exams(
        &self,
        source_key: &str,
        records: &[NormalizedExamRecord],
    ) -> Result<Vec<i64>, IngestError>;

    /// One page of exams, newest first. `page` is 1-based; 0 is treated as 1.
    async fn list_exams(&self, page: u32, per_page: u32) -> Result<ExamPage, IngestError>;

    /// Delete an exam and its questions. Returns whether it existed.
    async fn delete_exam(&self, id: i64) -> Result<bool, IngestError>;
}

/// What a source key already has in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecords {
    pub exam_ids: Vec<i64>,
    pub questions: usize,
}

/// One page of the exam listing.
#[derive(Debug, Clone, Serialize)]
pub struct ExamPage {
    pub exams: Vec<StoredExam>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl ExamPage {
    pub fn last_page(&self) -> u32 {
        if self.per_page == 0 {
            return 1;
        }
        (self.total.div_ceil(self.per_page as u64)).max(1) as u32
    }
}

/// Validate the invariants the schema enforces, before touching storage.
pub(crate) fn check_record(record: &NormalizedExamRecord) -> Result<(), IngestError> {
    if record.exam_name.trim().is_empty() {
        return Err(IngestError::Persistence("exam name must not be empty".into()));
    }
    if let Some(q) = record.questions.iter().find(|q| q.question_number == 0) {
        return Err(IngestError::Persistence(format!(
            "question number must be at least 1 (question '{}')",
            q.question_text
        )));
    }
    Ok(())
}

pub(crate) fn page_bounds(page: u32, per_page: u32) -> (u32, u32, u64) {
    let page = page.max(1);
    let per_page = per_page.max(1);
    let offset = u64::from(page - 1) * u64::from(per_page);
    (page, per_page, offset)
}
