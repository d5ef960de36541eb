//! Pipeline stages for exam ingestion.
//!
//! Each submodule implements one transformation step, so each can be tested
//! alone and swapped (another OCR engine, another model provider) without
//! touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ prompts ──▶ gateway ──▶ normalize ──▶ persist
//! (pdf/docx/   (template   (LLM HTTP)  (tiered JSON  (files + one
//!  ocr)         + text)                 recovery)     transaction)
//! ```
//!
//! 1. [`extract`]   turns the stored upload into plain text; the PDF and DOCX
//!    parsers are blocking, so they run in `spawn_blocking`
//! 2. [`ocr`]       the optional image recogniser capability used by `extract`
//! 3. [`gateway`]   the only stage with network I/O
//! 4. [`normalize`] recovers exam JSON from the model reply and maps it to
//!    typed records, dropping incomplete questions
//! 5. [`persist`]   copies images, renders answer keys ([`artifact`]) and
//!    inserts the records
//!
//! Prompt construction lives in [`crate::prompts`].

pub mod artifact;
pub mod extract;
pub mod gateway;
pub mod normalize;
pub mod ocr;
pub mod persist;
