//! Instruction templates for exam extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — the JSON contract the normaliser expects is
//!    spelled out in exactly one place per [`PromptVariant`].
//!
//! 2. **Testability** — [`build_prompt`] is a pure function, so truncation and
//!    template selection are checked without a model in the loop.
//!
//! Truncation to `max_chars` is lossy: questions past the bound never reach
//! the model. The bound exists to stay inside upstream token limits.

use crate::config::PromptVariant;
use tracing::debug;

const METADATA_RULES: &str = "First, extract metadata (examName, examiner, subject, class, term, year, curriculum, type). \
For examiner, it's usually the first description in bold at the top of the paper. \
For curriculum, CBC papers are labelled CBC; if not labelled CBC, it's 844.";

/// Variant (i): one exam object with flat metadata only.
pub const FLAT_TEMPLATE: &str = r#"Analyze the following exam paper content. {metadata}
Provide the output strictly in JSON format (double quotes) with the following structure:

{
  "examName": "...",
  "examiner": "...",
  "subject": "...",
  "class": "...",
  "term": "...",
  "year": "...",
  "curriculum": "...",
  "type": "..."
}

Use null if a field is not found."#;

/// Variant (ii): array of exams, each with a nested `questions` array.
pub const QUESTION_SET_TEMPLATE: &str = r#"Analyze the following exam paper content. {metadata}
Second, identify each question, including any sub-parts (e.g., 1a, 1b). Be careful: some questions have multiple answer lines below them, which are not sub-parts.
For each identified question, provide a concise answer in the 'answer' field:
- True/False questions are answered 'True' or 'False'.
- Fill-in-the-blank questions (indicated by underscores) are answered with the missing word(s).
- Any other question is answered from your knowledge of the subject matter.
If one paper contains several subjects, return one exam object per subject. If a question refers to an image, set has_image to true.
Provide the output strictly in JSON format (double quotes) as an array with the following structure:

[
  {
    "examName": "...",
    "examiner": "...",
    "subject": "...",
    "class": "...",
    "term": "...",
    "year": "...",
    "curriculum": "...",
    "type": "...",
    "questions": [
      {
        "question_number": 1,
        "question_sub_part": null,
        "question": "What is the capital of Kenya?",
        "answer": "Nairobi.",
        "has_image": false
      },
      {
        "question_number": 2,
        "question_sub_part": "a",
        "question": "Identify the parts labelled A and B in the diagram.",
        "answer": "A: ..., B: ...",
        "has_image": true
      }
    ]
  }
]

Use null if metadata or sub-part is not found. Ensure 'question_number' is an integer and 'has_image' is a boolean."#;

/// Variant (iii): one exam object plus a consolidated answer key.
pub const ANSWER_KEY_TEMPLATE: &str = r#"Analyze the following exam paper content. {metadata}
Second, answer every question in the paper in order, numbering each answer like the question it belongs to (e.g. 1, 2a, 2b).
Provide the output strictly in JSON format (double quotes) with the following structure:

{
  "examName": "...",
  "examiner": "...",
  "subject": "...",
  "class": "...",
  "term": "...",
  "year": "...",
  "curriculum": "...",
  "type": "...",
  "generatedAnswers": "1. ...\n2a. ...\n2b. ..."
}

Use null if metadata is not found. 'generatedAnswers' must be a single string with one answer per line."#;

/// Template text for a variant, with the shared metadata rules filled in.
pub fn template(variant: PromptVariant) -> String {
    let raw = match variant {
        PromptVariant::Flat => FLAT_TEMPLATE,
        PromptVariant::QuestionSet => QUESTION_SET_TEMPLATE,
        PromptVariant::AnswerKey => ANSWER_KEY_TEMPLATE,
    };
    raw.replace("{metadata}", METADATA_RULES)
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Build the full prompt for one document.
///
/// Deterministic: no I/O, no randomness. The embedded content never exceeds
/// `max_chars` characters.
pub fn build_prompt(
    text: &str,
    original_name: &str,
    variant: PromptVariant,
    max_chars: usize,
) -> String {
    let content = truncate_chars(text, max_chars);
    if content.len() < text.len() {
        debug!(
            "Truncated extracted text of '{}' from {} to {} characters",
            original_name,
            text.chars().count(),
            max_chars
        );
    }
    format!(
        "{}\n\nFile name: {}\n\nExam Content:\n```\n{}\n```\n\nJSON Output:",
        template(variant),
        original_name,
        content
    )
}
