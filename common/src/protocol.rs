//! Messages exchanged over the scanner WebSocket.
//!
//! A request is one binary message carrying a JPEG. A response is one text
//! message holding a JSON object discriminated by `status`:
//!
//! ```text
//! {"status": "success",  "data": {"document_number": "...", ...}}
//! {"status": "scanning", "message": "No MRZ found"}
//! {"status": "error",    "message": "..."}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Recognised document fields, keyed by field name.
pub type FieldMap = BTreeMap<String, String>;

pub const NO_DETECTION_MESSAGE: &str = "No MRZ found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScanResponse {
    Success {
        #[serde(deserialize_with = "lenient_fields")]
        data: FieldMap,
    },
    Scanning {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ScanResponse {
    pub fn no_detection() -> Self {
        Self::Scanning {
            message: NO_DETECTION_MESSAGE.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Scanning { .. } => "scanning",
            Self::Error { .. } => "error",
        }
    }
}

/// Render a JSON field value as the string stored in a [`FieldMap`].
/// Strings pass through untouched, `null` becomes empty.
pub fn field_value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert an arbitrary JSON object into a [`FieldMap`].
pub fn fields_from_json(object: serde_json::Map<String, Value>) -> FieldMap {
    object
        .into_iter()
        .map(|(k, v)| (k, field_value_to_string(v)))
        .collect()
}

// Engines do not always emit strings (check digits, ages), so accept any
// scalar and stringify it.
fn lenient_fields<'de, D>(deserializer: D) -> Result<FieldMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Map::<String, Value>::deserialize(deserializer)?;
    Ok(fields_from_json(raw))
}
