//! Text recognition capability for image uploads.
//!
//! Image uploads carry no text layer. Reading them needs an OCR engine,
//! which this crate does not ship: [`NoopRecognizer`] is wired in by
//! default and always reports "no text", so an image run fails at the
//! Prompting stage with [`crate::IngestError::NoExtractableText`].
//! Inject a real recognizer to make image runs succeed.

use crate::document::DocumentFormat;
use crate::error::IngestError;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Recognise text in an image file.
    ///
    /// `Ok(None)` means the recognizer produced nothing usable.
    async fn recognize(
        &self,
        image_path: &Path,
        format: DocumentFormat,
    ) -> Result<Option<String>, IngestError>;

    /// Short identifier for log lines.
    fn name(&self) -> &str;
}

/// Recognizer that never produces text.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecognizer;

#[async_trait]
impl TextRecognizer for NoopRecognizer {
    async fn recognize(
        &self,
        _image_path: &Path,
        _format: DocumentFormat,
    ) -> Result<Option<String>, IngestError> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_returns_nothing() {
        let r = NoopRecognizer;
        let out = r
            .recognize(Path::new("/nonexistent.png"), DocumentFormat::Png)
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(r.name(), "noop");
    }
}
