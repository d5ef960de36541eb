//! Persistence mapping: normalised records → stored exams plus their files.
//!
//! Files are written before the database transaction, and every file lands
//! in the run's [`ArtifactLedger`]. If the transaction fails, or anything
//! later kills the run, the failure callback purges the ledger, so a
//! persisted record never points at a missing file and a failed run never
//! leaves files behind.

use crate::config::PromptVariant;
use crate::document::UploadedDocument;
use crate::error::IngestError;
use crate::output::NormalizedExamRecord;
use crate::pipeline::artifact::{render_answer_pdf, ArtifactLedger};
use crate::storage::{Storage, ANSWERS_DIR, EXAM_IMAGES_DIR};
use crate::store::ExamStore;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// What the Persisting stage did.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Inserted { exam_ids: Vec<i64>, questions: usize },
    /// Records for this source key already exist; nothing was written.
    Duplicate,
}

/// Everything the Persisting stage needs from the run.
pub struct PersistRequest<'a> {
    pub doc: &'a UploadedDocument,
    pub source_key: &'a str,
    pub variant: PromptVariant,
    pub started: Instant,
}

pub async fn persist(
    storage: &Storage,
    store: &dyn ExamStore,
    ledger: &ArtifactLedger,
    req: PersistRequest<'_>,
    mut records: Vec<NormalizedExamRecord>,
) -> Result<PersistOutcome, IngestError> {
    if store.contains_source(req.source_key).await? {
        info!(
            "Records for '{}' already persisted; skipping insert",
            req.doc.original_name
        );
        return Ok(PersistOutcome::Duplicate);
    }

    let source_image = match req.doc.public_image_path.as_deref() {
        Some(path) => {
            if storage.public_exists(path).await {
                Some(path)
            } else {
                warn!("Image file not found at public path: {}", path);
                None
            }
        }
        None => None,
    };

    for record in &mut records {
        if let Some(image) = req.doc.public_image_path.as_deref() {
            record.image_ref = Some(image.to_string());
        }

        for q in record.questions.iter_mut().filter(|q| q.has_image) {
            let Some(src) = source_image else { continue };
            let dest = question_image_path(src);
            storage.copy_public(src, &dest).await?;
            ledger.record(dest.clone());
            info!(
                "Saved image for question {} of '{}' to {}",
                q.question_number, record.exam_name, dest
            );
            q.image_ref = Some(dest);
        }

        if req.variant == PromptVariant::AnswerKey {
            if let Some(answers) = record.generated_answers.as_deref() {
                let bytes = render_answer_pdf(&record.exam_name, answers)?;
                let rel = format!("{ANSWERS_DIR}/{}.pdf", Uuid::new_v4());
                storage
                    .write_public(&rel, &bytes)
                    .await
                    .map_err(|e| IngestError::ArtifactRender(e.to_string()))?;
                ledger.record(rel.clone());
                info!("Rendered answer key for '{}' to {}", record.exam_name, rel);
                record.answers_artifact_ref = Some(rel);
            }
        }
    }

    // Measured here so it covers extraction and the model call.
    let elapsed = req.started.elapsed().as_secs_f64();
    for record in &mut records {
        record.processing_time = Some(elapsed);
    }

    let exam_ids = store.insert_exams(req.source_key, &records).await?;
    ledger.commit();

    let questions = records.iter().map(|r| r.questions.len()).sum();
    info!(
        "Persisted {} exam(s) with {} question(s) for '{}' in {:.2}s",
        exam_ids.len(),
        questions,
        req.doc.original_name,
        elapsed
    );
    Ok(PersistOutcome::Inserted { exam_ids, questions })
}

/// `exam_images/<uuid>_<basename of src>`
fn question_image_path(src: &str) -> String {
    let base = Path::new(src)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image");
    format!("{EXAM_IMAGES_DIR}/{}_{}", Uuid::new_v4(), base)
}
