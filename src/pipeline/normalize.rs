//! Response normalisation: raw LLM body → validated exam records.
//!
//! ## Why so many fallbacks?
//!
//! LLM output is not a contract. Providers wrap the generated text in
//! different envelopes, models wrap JSON in markdown fences despite being
//! told not to, and trailing commas slip through. Treating each of these as
//! a hard failure would fail most runs; accepting them blindly would persist
//! garbage. The normaliser therefore works in tiers, each strictly less
//! precise than the one before, and logs which tier produced the payload so
//! operators can see prompt/model drift.
//!
//! ## Candidate tiers
//!
//! 1. **Envelope** — `candidates[0].content.parts[0].text` (Gemini) or
//!    `choices[0].message.content` (OpenAI-compatible); a fence around that
//!    text is peeled.
//! 2. **Fenced block** — the first ```` ```json { … } ``` ```` block in the raw body.
//! 3. **Brace span** — first `{` to last `}` in the raw body.
//!
//! ## Shape decoding
//!
//! The parsed value is decoded into an [`ExamPayload`], trying each known
//! top-level shape in the order implied by the [`ResponseShape`] hint.

use crate::config::ResponseShape;
use crate::error::IngestError;
use crate::output::{NormalizedExamRecord, QuestionAnswer, SkippedQuestion};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Longest sub-part label the schema can hold.
pub const MAX_SUB_PART_CHARS: usize = 10;

/// Which tier located the JSON candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateTier {
    Envelope,
    FencedBlock,
    BraceSpan,
}

/// Top-level shapes the model is known to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// `[ {examName, …}, … ]`
    List,
    /// `[ {text: "<JSON-encoded List>"} ]`
    Wrapped,
    /// `{examName, …}`
    Single,
}

/// Result of the tagged shape decode. Each variant holds the exam objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ExamPayload {
    List(Vec<Map<String, Value>>),
    Wrapped(Vec<Map<String, Value>>),
    Single(Map<String, Value>),
}

impl ExamPayload {
    pub fn shape(&self) -> PayloadShape {
        match self {
            ExamPayload::List(_) => PayloadShape::List,
            ExamPayload::Wrapped(_) => PayloadShape::Wrapped,
            ExamPayload::Single(_) => PayloadShape::Single,
        }
    }

    pub fn into_exams(self) -> Vec<Map<String, Value>> {
        match self {
            ExamPayload::List(exams) | ExamPayload::Wrapped(exams) => exams,
            ExamPayload::Single(exam) => vec![exam],
        }
    }
}

/// Normalised output of one LLM response.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub records: Vec<NormalizedExamRecord>,
    pub skipped: Vec<SkippedQuestion>,
    pub tier: CandidateTier,
    pub shape: PayloadShape,
}

/// Run every normalisation step on a raw response body.
///
/// `original_name` is the fallback exam name for records that lack one.
pub fn normalize(
    raw_body: &str,
    hint: ResponseShape,
    original_name: &str,
) -> Result<Normalized, IngestError> {
    let (candidate, tier) = locate_candidate(raw_body).ok_or_else(|| {
        warn!("No JSON candidate found in LLM response for '{}'", original_name);
        IngestError::ResponseStructureInvalid
    })?;
    match tier {
        CandidateTier::Envelope => debug!("JSON candidate found at primary envelope path"),
        CandidateTier::FencedBlock => warn!(
            "Primary extraction failed for '{}'; JSON extracted from markdown block",
            original_name
        ),
        CandidateTier::BraceSpan => warn!(
            "Primary extraction failed for '{}'; JSON extracted from raw brace span",
            original_name
        ),
    }

    let sanitized = sanitize(&candidate);
    let value: Value = serde_json::from_str(sanitized).map_err(|e| IngestError::JsonDecode {
        detail: e.to_string(),
        raw_text: sanitized.to_string(),
    })?;

    let payload = decode_payload(value, hint)?;
    let shape = payload.shape();

    let mut skipped = Vec::new();
    let records: Vec<NormalizedExamRecord> = payload
        .into_exams()
        .iter()
        .enumerate()
        .map(|(i, exam)| to_record(exam, original_name, i, &mut skipped))
        .collect();

    info!(
        "Normalised {} exam record(s) with {} question(s) for '{}' ({:?} tier, {:?} shape, {} skipped)",
        records.len(),
        records.iter().map(|r| r.questions.len()).sum::<usize>(),
        original_name,
        tier,
        shape,
        skipped.len()
    );

    Ok(Normalized {
        records,
        skipped,
        tier,
        shape,
    })
}

// ── Candidate location ───────────────────────────────────────────────────

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*([\{\[].*?[\}\]])\s*```").unwrap());

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").unwrap());

/// Find the JSON candidate text and the tier that found it.
pub fn locate_candidate(raw_body: &str) -> Option<(String, CandidateTier)> {
    if let Some(text) = envelope_text(raw_body) {
        return Some((peel_fence(&text).to_string(), CandidateTier::Envelope));
    }
    if let Some(caps) = RE_FENCED_BLOCK.captures(raw_body) {
        return Some((caps[1].to_string(), CandidateTier::FencedBlock));
    }
    let start = raw_body.find('{')?;
    let end = raw_body.rfind('}')?;
    (start < end).then(|| (raw_body[start..=end].to_string(), CandidateTier::BraceSpan))
}

fn envelope_text(raw_body: &str) -> Option<String> {
    let envelope: Value = serde_json::from_str(raw_body).ok()?;
    ["/candidates/0/content/parts/0/text", "/choices/0/message/content"]
        .iter()
        .filter_map(|path| envelope.pointer(path).and_then(Value::as_str))
        .find(|text| !text.trim().is_empty())
        .map(str::to_string)
}

fn peel_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match RE_OUTER_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => trimmed,
    }
}

/// Trim whitespace and strip one trailing comma.
pub fn sanitize(candidate: &str) -> &str {
    let trimmed = candidate.trim();
    trimmed.strip_suffix(',').unwrap_or(trimmed)
}

// ── Shape decoding ───────────────────────────────────────────────────────

/// Decode the top-level value, trying shapes in the hint's priority order.
pub fn decode_payload(value: Value, hint: ResponseShape) -> Result<ExamPayload, IngestError> {
    let (order, expected) = match hint {
        ResponseShape::ExamList => (
            [PayloadShape::List, PayloadShape::Wrapped, PayloadShape::Single],
            PayloadShape::List,
        ),
        ResponseShape::SingleExam => (
            [PayloadShape::Single, PayloadShape::List, PayloadShape::Wrapped],
            PayloadShape::Single,
        ),
    };

    for shape in order {
        let decoded = match shape {
            PayloadShape::List => as_list(&value).map(ExamPayload::List),
            PayloadShape::Single => as_single(&value).map(ExamPayload::Single),
            PayloadShape::Wrapped => match wrapped_text(&value) {
                Some(text) => Some(decode_wrapped(text)?),
                None => None,
            },
        };
        if let Some(payload) = decoded {
            if shape != expected {
                warn!(
                    "Response shape drift: expected {:?}, decoded {:?}",
                    expected, shape
                );
            }
            return Ok(payload);
        }
    }

    Err(IngestError::UnexpectedResponseShape {
        detail: describe_value(&value),
    })
}

fn has_exam_name(obj: &Map<String, Value>) -> bool {
    obj.get("examName").is_some_and(|v| !v.is_null())
}

fn as_list(value: &Value) -> Option<Vec<Map<String, Value>>> {
    let items = value.as_array()?;
    let first = items.first()?.as_object()?;
    if !has_exam_name(first) {
        return None;
    }
    Some(
        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item.as_object() {
                Some(obj) => Some(obj.clone()),
                None => {
                    warn!("Ignoring exam entry {} that is not an object", i);
                    None
                }
            })
            .collect(),
    )
}

fn as_single(value: &Value) -> Option<Map<String, Value>> {
    let obj = value.as_object()?;
    has_exam_name(obj).then(|| obj.clone())
}

fn wrapped_text(value: &Value) -> Option<&str> {
    value.as_array()?.first()?.get("text")?.as_str()
}

fn decode_wrapped(text: &str) -> Result<ExamPayload, IngestError> {
    let inner: Value =
        serde_json::from_str(sanitize(text)).map_err(|e| IngestError::UnexpectedResponseShape {
            detail: format!("nested 'text' payload is not JSON: {e}"),
        })?;
    as_list(&inner)
        .map(ExamPayload::Wrapped)
        .ok_or_else(|| IngestError::UnexpectedResponseShape {
            detail: format!(
                "nested 'text' payload is not an exam list: {}",
                describe_value(&inner)
            ),
        })
}

fn describe_value(value: &Value) -> String {
    let rendered = value.to_string();
    let cut = crate::prompts::truncate_chars(&rendered, 200);
    if cut.len() < rendered.len() {
        format!("{cut}…")
    } else {
        rendered
    }
}

// ── Record mapping ───────────────────────────────────────────────────────

/// Map one exam object onto a record, validating its questions.
pub fn to_record(
    exam: &Map<String, Value>,
    original_name: &str,
    exam_index: usize,
    skipped: &mut Vec<SkippedQuestion>,
) -> NormalizedExamRecord {
    let exam_name = text_field(exam, "examName")
        .or_else(|| Some(original_name.trim().to_string()).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "Untitled exam".to_string());

    let mut questions = Vec::new();
    if let Some(items) = exam.get("questions").and_then(Value::as_array) {
        for (question_index, item) in items.iter().enumerate() {
            match to_question(item) {
                Ok(q) => questions.push(q),
                Err(reason) => {
                    warn!(
                        "Skipping question {} of exam {}: {} ({})",
                        question_index, exam_index, reason, item
                    );
                    skipped.push(SkippedQuestion {
                        exam_index,
                        question_index,
                        reason,
                    });
                }
            }
        }
    }

    NormalizedExamRecord {
        exam_name,
        examiner: text_field(exam, "examiner"),
        subject: text_field(exam, "subject"),
        class: text_field(exam, "class"),
        term: coerce_term(exam.get("term")),
        year: text_field(exam, "year"),
        curriculum: text_field(exam, "curriculum"),
        exam_type: text_field(exam, "type"),
        processing_time: None,
        questions,
        answers_artifact_ref: None,
        image_ref: None,
        generated_answers: text_field(exam, "generatedAnswers"),
    }
}

fn to_question(item: &Value) -> Result<QuestionAnswer, String> {
    let obj = item
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;

    let question_number = obj
        .get("question_number")
        .and_then(coerce_question_number)
        .ok_or_else(|| "missing or invalid question_number".to_string())?;
    let question_text =
        text_field(obj, "question").ok_or_else(|| "missing question text".to_string())?;
    let answer_text = text_field(obj, "answer").ok_or_else(|| "missing answer".to_string())?;

    let question_sub_part = text_field(obj, "question_sub_part").map(|sub| {
        if sub.chars().count() > MAX_SUB_PART_CHARS {
            let cut = crate::prompts::truncate_chars(&sub, MAX_SUB_PART_CHARS).to_string();
            warn!("Truncating question_sub_part '{}' to '{}'", sub, cut);
            cut
        } else {
            sub
        }
    });

    Ok(QuestionAnswer {
        question_number,
        question_sub_part,
        question_text,
        answer_text,
        has_image: obj.get("has_image").is_some_and(truthy),
        image_ref: None,
    })
}

/// Non-blank text of a field. Numbers and booleans are rendered as text;
/// null, blank strings, objects and arrays count as absent.
fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Coerce a `term` value to an integer when it is numeric.
///
/// Integers pass through, floats and numeric strings are truncated toward
/// zero; anything else (including absence) is `None`.
pub fn coerce_term(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(float_to_i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_to_i64))
        }
        _ => None,
    }
}

fn float_to_i64(f: f64) -> Option<i64> {
    (f.is_finite() && f.abs() < i64::MAX as f64).then(|| f.trunc() as i64)
}

fn coerce_question_number(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 1.0)
                .map(|f| f as u64)
        })?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok().filter(|n| *n >= 1)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}
