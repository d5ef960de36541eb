//! Input-side types: the uploaded document a run owns and what extraction
//! made of it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Jpg,
    Jpeg,
    Png,
}

impl DocumentFormat {
    /// Parse a declared extension, case-insensitively. A leading dot is ignored.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "jpg" => Some(Self::Jpg),
            "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, Self::Jpg | Self::Jpeg | Self::Png)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One accepted upload, owned by exactly one pipeline run.
///
/// `storage_key` is a locator on the private disk. Image uploads live on the
/// public disk and their key carries the `public/` prefix; `public_image_path`
/// is then the same file relative to the public disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub storage_key: String,
    pub original_name: String,
    /// Raw extension as declared at upload; parsed by the Extracting stage.
    pub declared_extension: String,
    pub public_image_path: Option<String>,
}

impl UploadedDocument {
    pub fn format(&self) -> Option<DocumentFormat> {
        DocumentFormat::from_extension(&self.declared_extension)
    }

    pub fn is_image(&self) -> bool {
        self.public_image_path.is_some() || self.format().is_some_and(DocumentFormat::is_image)
    }
}

/// Why the extractor could not read a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionFailure {
    MissingSource { path: PathBuf },
    Unreadable { detail: String },
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSource { path } => write!(f, "source file missing: {}", path.display()),
            Self::Unreadable { detail } => write!(f, "{detail}"),
        }
    }
}

/// Outcome of text extraction for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionResult {
    /// Non-empty after trimming.
    Text(String),
    /// Well-formed input with nothing to read (empty document, image without OCR).
    NoText,
    Failed(ExtractionFailure),
}

impl ExtractionResult {
    /// Wrap raw extracted text, folding whitespace-only output into `NoText`.
    pub fn from_text(text: String) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            Self::NoText
        } else if trimmed.len() == text.len() {
            Self::Text(text)
        } else {
            Self::Text(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_extensions_case_insensitively() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension(".docx"), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_extension("JpEg"), Some(DocumentFormat::Jpeg));
        assert_eq!(DocumentFormat::from_extension("txt"), None);
        assert_eq!(DocumentFormat::from_extension(""), None);
    }

    #[test]
    fn image_formats() {
        assert!(DocumentFormat::Png.is_image());
        assert!(!DocumentFormat::Pdf.is_image());
    }

    #[test]
    fn whitespace_only_text_is_no_text() {
        assert_eq!(ExtractionResult::from_text("  \n\t ".into()), ExtractionResult::NoText);
        assert_eq!(
            ExtractionResult::from_text("  Q1 \n".into()),
            ExtractionResult::Text("Q1".into())
        );
    }
}
