//! Conversation record decoding and reply extraction
//!
//! The poll endpoint nests a JSON-encoded string inside its envelope, and
//! the device's own reply lives in one of several fields depending on the
//! skill that answered. Each shape is modelled as a typed field, and the
//! reply is produced by the first extractor in a fixed chain that yields a
//! non-empty value.

use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::Value;

use crate::{Error, Result};

/// Latest spoken query and the device's native reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    /// Record time in milliseconds
    pub timestamp: i64,
    pub query: String,
    /// Native reply, empty when none could be extracted
    pub reply: String,
}

/// Decoded `data` payload
#[derive(Debug, Deserialize)]
struct RecordsPayload {
    #[serde(default)]
    records: Vec<Value>,
}

/// A field that is either a bare string or an object carrying `text`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextField {
    Plain(String),
    Object { text: Option<String> },
    Other(IgnoredAny),
}

impl TextField {
    fn text(&self) -> Option<&str> {
        match self {
            Self::Plain(s) => Some(s.as_str()),
            Self::Object { text } => text.as_deref(),
            Self::Other(_) => None,
        }
    }
}

/// One entry of the typed `answers` list
#[derive(Debug, Default, Deserialize)]
struct AnswerEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    llm: Option<TextField>,
    #[serde(default)]
    tts: Option<TextField>,
    #[serde(default)]
    text: Option<TextField>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    time: i64,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    answer: Option<TextField>,
    #[serde(default)]
    answers: Option<Vec<Value>>,
    #[serde(default)]
    response: Option<TextField>,
    #[serde(default)]
    result: Option<TextField>,
    #[serde(default)]
    content: Option<TextField>,
}

type Extractor = fn(&RawRecord) -> Option<String>;

/// Reply sources in priority order
const EXTRACTORS: &[Extractor] = &[
    direct_answer,
    typed_answers,
    response_field,
    result_text,
    content_field,
];

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn direct_answer(record: &RawRecord) -> Option<String> {
    non_empty(record.answer.as_ref().and_then(TextField::text))
}

/// LLM-typed entry first, then any TTS field, then any plain text field
fn typed_answers(record: &RawRecord) -> Option<String> {
    let entries: Vec<AnswerEntry> = record
        .answers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|v| serde_json::from_value(v.clone()).ok())
        .collect();

    let llm = entries.iter().find_map(|e| {
        let is_llm = e.kind.as_deref().is_some_and(|k| k.eq_ignore_ascii_case("llm"));
        if is_llm {
            non_empty(e.llm.as_ref().and_then(TextField::text))
        } else {
            None
        }
    });

    llm.or_else(|| {
        entries
            .iter()
            .find_map(|e| non_empty(e.tts.as_ref().and_then(TextField::text)))
    })
    .or_else(|| {
        entries
            .iter()
            .find_map(|e| non_empty(e.text.as_ref().and_then(TextField::text)))
    })
}

fn response_field(record: &RawRecord) -> Option<String> {
    non_empty(record.response.as_ref().and_then(TextField::text))
}

/// Only the object form of `result` counts
fn result_text(record: &RawRecord) -> Option<String> {
    match &record.result {
        Some(TextField::Object { text }) => non_empty(text.as_deref()),
        _ => None,
    }
}

fn content_field(record: &RawRecord) -> Option<String> {
    non_empty(record.content.as_ref().and_then(TextField::text))
}

/// Decode the envelope and return its most recent record
///
/// `Ok(None)` means the envelope carried no records.
///
/// # Errors
///
/// Returns `MalformedResponse` if the nested payload cannot be decoded
pub fn latest_record(envelope: &Value) -> Result<Option<ConversationRecord>> {
    let payload = match envelope.get("data") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => serde_json::from_str::<RecordsPayload>(s)
            .map_err(|e| Error::MalformedResponse(format!("conversation data: {e}")))?,
        Some(other) => serde_json::from_value::<RecordsPayload>(other.clone())
            .map_err(|e| Error::MalformedResponse(format!("conversation data: {e}")))?,
    };

    let Some(first) = payload.records.into_iter().next() else {
        return Ok(None);
    };

    let raw: RawRecord = serde_json::from_value(first)
        .map_err(|e| Error::MalformedResponse(format!("conversation record: {e}")))?;

    let reply = EXTRACTORS
        .iter()
        .find_map(|extract| extract(&raw))
        .unwrap_or_default();

    Ok(Some(ConversationRecord {
        timestamp: raw.time,
        query: raw.query.unwrap_or_default().trim().to_string(),
        reply,
    }))
}
