//! Text extraction: turn a stored upload into plain text.
//!
//! ## Why spawn_blocking?
//!
//! Both `lopdf` and the zip/XML readers are synchronous and CPU-bound on
//! large files. Running them on the blocking pool keeps Tokio worker threads
//! free for the LLM calls of other jobs.
//!
//! Extraction is read-only. It never raises on a well-formed file: an empty
//! PDF or DOCX yields `""` from the format readers and
//! [`ExtractionResult::NoText`] from [`extract`].

use crate::document::{DocumentFormat, ExtractionFailure, ExtractionResult, UploadedDocument};
use crate::error::IngestError;
use crate::pipeline::ocr::TextRecognizer;
use crate::storage::Storage;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Extract text from an uploaded document.
///
/// Returns `Err(UnsupportedFormat)` when the declared extension is not a
/// known format; that is a defect of the upload boundary and is never retried.
pub async fn extract(
    storage: &Storage,
    doc: &UploadedDocument,
    recognizer: &dyn TextRecognizer,
) -> Result<ExtractionResult, IngestError> {
    let format = doc.format().ok_or_else(|| IngestError::UnsupportedFormat {
        name: doc.original_name.clone(),
        extension: doc.declared_extension.clone(),
    })?;
    let path = storage.private_path(&doc.storage_key);

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        warn!("Source for '{}' missing at {}", doc.original_name, path.display());
        return Ok(ExtractionResult::Failed(ExtractionFailure::MissingSource { path }));
    }

    let raw = match format {
        DocumentFormat::Pdf => run_blocking(path, pdf_text).await?,
        DocumentFormat::Docx => run_blocking(path, docx_text).await?,
        DocumentFormat::Jpg | DocumentFormat::Jpeg | DocumentFormat::Png => {
            match recognizer.recognize(&path, format).await {
                Ok(Some(text)) => Ok(text),
                Ok(None) => {
                    info!(
                        "Recognizer '{}' produced no text for image '{}'",
                        recognizer.name(),
                        doc.original_name
                    );
                    Ok(String::new())
                }
                Err(e) => Err(ExtractionFailure::Unreadable {
                    detail: e.to_string(),
                }),
            }
        }
    };

    Ok(match raw {
        Ok(text) => {
            let result = ExtractionResult::from_text(text);
            if let ExtractionResult::Text(ref t) = result {
                debug!(
                    "Extracted {} characters from '{}'",
                    t.chars().count(),
                    doc.original_name
                );
            }
            result
        }
        Err(failure) => ExtractionResult::Failed(failure),
    })
}

async fn run_blocking(
    path: PathBuf,
    f: fn(&Path) -> Result<String, ExtractionFailure>,
) -> Result<Result<String, ExtractionFailure>, IngestError> {
    tokio::task::spawn_blocking(move || f(&path))
        .await
        .map_err(|e| IngestError::Internal(format!("Extraction task panicked: {}", e)))
}

// ── PDF ──────────────────────────────────────────────────────────────────

/// Text of every page, in page order.
///
/// Pages whose content cannot be decoded are skipped with a warning; the
/// document only counts as unreadable when it fails to load or no page
/// decodes at all.
pub fn pdf_text(path: &Path) -> Result<String, ExtractionFailure> {
    let document = lopdf::Document::load(path).map_err(|e| ExtractionFailure::Unreadable {
        detail: format!("failed to load PDF: {e}"),
    })?;

    let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
    let mut parts = Vec::with_capacity(page_numbers.len());
    let mut failures = 0usize;

    for page in &page_numbers {
        match document.extract_text(&[*page]) {
            Ok(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            Err(e) => {
                failures += 1;
                warn!("PDF page {} of {}: text extraction failed: {}", page, path.display(), e);
            }
        }
    }

    if failures > 0 && failures == page_numbers.len() {
        return Err(ExtractionFailure::Unreadable {
            detail: format!("no page of {} could be decoded", path.display()),
        });
    }
    Ok(parts.join("\n"))
}

// ── DOCX ─────────────────────────────────────────────────────────────────

/// Paragraph text of a DOCX body, joined by single spaces.
///
/// Every `w:p` (plain paragraphs, list items, table cells) contributes the
/// concatenation of its `w:t` runs in document order. `w:tab` and `w:br`
/// become a space.
pub fn docx_text(path: &Path) -> Result<String, ExtractionFailure> {
    let unreadable = |detail: String| ExtractionFailure::Unreadable { detail };

    let file = std::fs::File::open(path)
        .map_err(|e| unreadable(format!("failed to open DOCX: {e}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| unreadable(format!("not a DOCX archive: {e}")))?;
    let mut document = archive
        .by_name("word/document.xml")
        .map_err(|e| unreadable(format!("missing word/document.xml: {e}")))?;

    let mut xml = String::new();
    document
        .read_to_string(&mut xml)
        .map_err(|e| unreadable(format!("failed to read DOCX XML: {e}")))?;

    docx_xml_text(&xml).map_err(unreadable)
}

fn docx_xml_text(xml: &str) -> Result<String, String> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text_node = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"w:t" => in_text_node = true,
                // Paragraphs nest inside text boxes; keep the enclosing text.
                b"w:p" => flush_paragraph(&mut current, &mut paragraphs),
                b"w:tab" | b"w:br" => current.push(' '),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if matches!(e.name().as_ref(), b"w:tab" | b"w:br") {
                    current.push(' ');
                }
            }
            Ok(Event::Text(e)) => {
                if in_text_node {
                    let value = e.unescape().map_err(|err| err.to_string())?;
                    current.push_str(&value);
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"w:t" => in_text_node = false,
                b"w:p" => flush_paragraph(&mut current, &mut paragraphs),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("failed to parse DOCX XML: {err}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs.join(" ").trim().to_string())
}

fn flush_paragraph(current: &mut String, paragraphs: &mut Vec<String>) {
    let para = current.trim();
    if !para.is_empty() {
        paragraphs.push(para.to_string());
    }
    current.clear();
}
