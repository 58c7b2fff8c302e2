//! Parsing of the vision model's free-form reply.
//!
//! The model is asked for bare JSON but routinely wraps it in commentary,
//! so extraction is staged: find a brace-delimited object inside the text,
//! fall back to parsing the whole reply, and degrade to a sentinel when
//! neither works. This function never errors: an unusable reply still
//! produces fields a filename can be built from.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder value for a field the model could not provide.
pub const UNKNOWN_FIELD: &str = "Unknown";

const KEY_COMPANY: &str = "company_name";
const KEY_NUMBER: &str = "invoice_number";
const KEY_DATE: &str = "invoice_date";

/// The three fields read off a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFields {
    pub company_name: String,
    #[serde(rename = "invoice_number")]
    pub document_id: String,
    /// Usually MM/DD/YYYY, but whatever the model produced.
    #[serde(rename = "invoice_date")]
    pub document_date: String,
}

impl DocumentFields {
    /// Sentinel substituted when analysis cannot yield real data.
    pub fn sentinel() -> Self {
        Self {
            company_name: UNKNOWN_FIELD.to_string(),
            document_id: UNKNOWN_FIELD.to_string(),
            document_date: Local::now().format("%m/%d/%Y").to_string(),
        }
    }
}

/// Outcome of a parse attempt. Callers can tell a real extraction from the
/// fallback without comparing field values against a magic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Fields parsed out of a well-formed model reply.
    Parsed(DocumentFields),
    /// Sentinel fields substituted because the reply was unusable.
    Degraded { fields: DocumentFields, reason: String },
}

impl Extraction {
    pub fn fields(&self) -> &DocumentFields {
        match self {
            Self::Parsed(fields) | Self::Degraded { fields, .. } => fields,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    fn degraded(reason: impl Into<String>) -> Self {
        Self::Degraded {
            fields: DocumentFields::sentinel(),
            reason: reason.into(),
        }
    }
}

/// Extract the three document fields from the model's reply.
pub fn parse_reply(reply: Option<&str>) -> Extraction {
    let Some(text) = reply else {
        return Extraction::degraded("empty model reply");
    };

    // First pass: a brace-delimited object somewhere inside the prose.
    let candidate = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    };

    let value: Value = match serde_json::from_str(candidate).or_else(|_| serde_json::from_str(text))
    {
        Ok(value) => value,
        Err(err) => return Extraction::degraded(format!("malformed JSON in reply: {err}")),
    };

    let Some(object) = value.as_object() else {
        return Extraction::degraded("reply JSON is not an object");
    };

    let company = field_text(object, KEY_COMPANY);
    let number = field_text(object, KEY_NUMBER);
    let date = field_text(object, KEY_DATE);

    match (company, number, date) {
        (Some(company_name), Some(document_id), Some(document_date)) => {
            Extraction::Parsed(DocumentFields {
                company_name,
                document_id,
                document_date,
            })
        }
        _ => Extraction::degraded("reply JSON is missing required keys"),
    }
}

/// String form of a field, tolerating the numeric ids the model sometimes
/// emits. Null or structured values count as missing.
fn field_text(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
