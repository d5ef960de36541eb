//! Answer-key rendering: a consolidated answer string → a downloadable PDF.
//!
//! The document is deliberately plain: built-in Courier (no font embedding),
//! WinAnsi encoding, A4 pages, greedy word wrap. Characters outside WinAnsi
//! are replaced with `?`.

use crate::error::IngestError;
use crate::storage::Storage;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::sync::Mutex;
use tracing::{info, warn};

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 50;
const FONT_SIZE: i64 = 10;
const TITLE_SIZE: i64 = 14;
const LEADING: i64 = 14;
/// Courier glyphs are 0.6 em wide: (595 - 2·50) / 6 ≈ 82 columns.
const COLUMNS: usize = 80;
const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2 * MARGIN) / LEADING) as usize;

/// Render `answers` under a title into PDF bytes.
pub fn render_answer_pdf(title: &str, answers: &str) -> Result<Vec<u8>, IngestError> {
    let mut lines = vec![format!("Answer key: {}", title.trim()), String::new()];
    lines.extend(wrap_lines(answers, COLUMNS));

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for (page_index, chunk) in lines.chunks(LINES_PER_PAGE).enumerate() {
        let page_id = add_page(&mut doc, pages_id, resources_id, chunk, page_index == 0)?;
        kids.push(page_id.into());
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| IngestError::ArtifactRender(format!("failed to serialise PDF: {e}")))?;
    Ok(bytes)
}

fn add_page(
    doc: &mut Document,
    pages_id: ObjectId,
    resources_id: ObjectId,
    lines: &[String],
    first_page: bool,
) -> Result<ObjectId, IngestError> {
    let mut operations = Vec::with_capacity(lines.len() * 5);
    let mut y = PAGE_HEIGHT - MARGIN;
    for (i, line) in lines.iter().enumerate() {
        y -= LEADING;
        if line.is_empty() {
            continue;
        }
        let size = if first_page && i == 0 { TITLE_SIZE } else { FONT_SIZE };
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), size.into()]));
        operations.push(Operation::new("Td", vec![MARGIN.into(), y.into()]));
        operations.push(Operation::new(
            "Tj",
            vec![Object::String(win_ansi_bytes(line), StringFormat::Literal)],
        ));
        operations.push(Operation::new("ET", vec![]));
    }

    let content = Content { operations }
        .encode()
        .map_err(|e| IngestError::ArtifactRender(format!("failed to encode page content: {e}")))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));
    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
    }))
}

/// Greedy word wrap. Input line breaks are kept; words longer than
/// `width` are split.
pub fn wrap_lines(text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let raw = raw.trim_end();
        if raw.is_empty() {
            out.push(String::new());
            continue;
        }
        let mut line = String::new();
        let mut line_len = 0usize;
        for word in raw.split_whitespace() {
            let word_len = word.chars().count();
            if line_len > 0 && line_len + 1 + word_len > width {
                out.push(std::mem::take(&mut line));
                line_len = 0;
            }
            if word_len > width {
                let chars: Vec<char> = word.chars().collect();
                for piece in chars.chunks(width) {
                    if line_len > 0 {
                        out.push(std::mem::take(&mut line));
                    }
                    line = piece.iter().collect();
                    line_len = piece.len();
                }
                continue;
            }
            if line_len > 0 {
                line.push(' ');
                line_len += 1;
            }
            line.push_str(word);
            line_len += word_len;
        }
        if line_len > 0 {
            out.push(line);
        }
    }
    out
}

fn win_ansi_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| match c as u32 {
            0x20..=0x7E | 0xA0..=0xFF => c as u32 as u8,
            0x2018 | 0x2019 => b'\'',
            0x201C | 0x201D => b'"',
            0x2013 | 0x2014 => b'-',
            0x2022 => 0x95,
            _ => b'?',
        })
        .collect()
}

// ── Ledger ───────────────────────────────────────────────────────────────

/// Public-disk files created by one attempt of one job.
///
/// Shared between the job and the worker pool so the failure callback can
/// remove everything the attempt wrote, even when the attempt itself was
/// cancelled by a timeout or died in a panic. Once the records referencing
/// the files are committed, [`commit`](Self::commit) pins them and
/// [`purge`](Self::purge) becomes a no-op.
#[derive(Debug, Default)]
pub struct ArtifactLedger {
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    paths: Vec<String>,
    committed: bool,
}

impl ArtifactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, public_path: impl Into<String>) {
        if let Ok(mut state) = self.inner.lock() {
            state.paths.push(public_path.into());
        }
    }

    /// Mark every recorded file as referenced by persisted records.
    pub fn commit(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.committed = true;
        }
    }

    pub fn is_committed(&self) -> bool {
        self.inner.lock().map(|s| s.committed).unwrap_or(false)
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|s| s.paths.clone())
            .unwrap_or_default()
    }

    /// Delete every uncommitted file. Returns how many were removed.
    ///
    /// Individual delete failures are logged and skipped so one stuck file
    /// does not keep the rest around.
    pub async fn purge(&self, storage: &Storage) -> usize {
        let paths = match self.inner.lock() {
            Ok(mut state) if !state.committed => std::mem::take(&mut state.paths),
            _ => return 0,
        };
        let mut removed = 0;
        for path in paths {
            match storage.delete_public(&path).await {
                Ok(true) => {
                    removed += 1;
                    info!("Deleted orphaned artifact {}", path);
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to delete artifact {}: {}", path, e),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_long_lines_and_keeps_breaks() {
        let text = "1. Nairobi\n\n2a. The quick brown fox jumps over the lazy dog";
        let lines = wrap_lines(text, 20);
        assert_eq!(lines[0], "1. Nairobi");
        assert_eq!(lines[1], "");
        assert!(lines.iter().all(|l| l.chars().count() <= 20));
        assert_eq!(lines[2..].join(" "), "2a. The quick brown fox jumps over the lazy dog");

        let long = wrap_lines(&"x".repeat(45), 20);
        assert_eq!(long.len(), 3);
        assert_eq!(long[2].len(), 5);
    }

    #[test]
    fn non_latin_characters_are_replaced() {
        assert_eq!(win_ansi_bytes("é–ok"), vec![0xE9, b'-', b'o', b'k']);
        assert_eq!(win_ansi_bytes("水"), vec![b'?']);
    }

    #[test]
    fn renders_a_loadable_paginated_pdf() {
        let answers = (1..=200)
            .map(|i| format!("{i}. Answer number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let bytes = render_answer_pdf("Grade 6 Science", &answers).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));

        let doc = Document::load_mem(&bytes).unwrap();
        let expected_pages = (200 + 2 + LINES_PER_PAGE - 1) / LINES_PER_PAGE;
        assert_eq!(doc.get_pages().len(), expected_pages);
        assert!(expected_pages > 1);
    }

    #[test]
    fn rendered_text_is_extractable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("answers.pdf");
        let bytes = render_answer_pdf("Geography", "1. Nairobi\n2. Mombasa").unwrap();
        std::fs::write(&path, bytes).unwrap();

        let text = crate::pipeline::extract::pdf_text(&path).unwrap();
        assert!(text.contains("Nairobi"), "extracted: {text:?}");
    }

    #[tokio::test]
    async fn ledger_purges_until_committed() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.write_public("answers/a.pdf", b"a").await.unwrap();
        storage.write_public("answers/b.pdf", b"b").await.unwrap();

        let ledger = ArtifactLedger::new();
        ledger.record("answers/a.pdf");
        ledger.record("answers/missing.pdf");
        assert_eq!(ledger.purge(&storage).await, 1);
        assert!(!storage.public_exists("answers/a.pdf").await);

        ledger.record("answers/b.pdf");
        ledger.commit();
        assert_eq!(ledger.purge(&storage).await, 0);
        assert!(storage.public_exists("answers/b.pdf").await);
    }
}
