//! Typed payload fragments carried inside a message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Deepest nesting accepted inside a `data` part.
pub const MAX_DATA_DEPTH: usize = 64;

/// A typed payload fragment.
///
/// Serializes as `{"kind": "...", ...kind-specific fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum Part {
    Text {
        text: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Structured key-value payload. Always an object at the top level.
    Data {
        data: Value,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Reference to content stored elsewhere.
    File {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    /// Inline bytes, base64 on the wire.
    Binary {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            mime_type: None,
        }
    }

    pub fn data(data: Value) -> Self {
        Part::Data {
            data,
            mime_type: None,
        }
    }

    pub fn file(uri: impl Into<String>) -> Self {
        Part::File {
            uri: uri.into(),
            name: None,
            mime_type: None,
            size: None,
        }
    }

    pub fn binary(bytes: Vec<u8>, mime_type: Option<String>) -> Self {
        Part::Binary { bytes, mime_type }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Part::Text { .. } => "text",
            Part::Data { .. } => "data",
            Part::File { .. } => "file",
            Part::Binary { .. } => "binary",
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Part::Text { mime_type, .. }
            | Part::Data { mime_type, .. }
            | Part::File { mime_type, .. }
            | Part::Binary { mime_type, .. } => mime_type.as_deref(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Check that the payload conforms to its declared kind.
    pub fn validate(&self) -> Result<()> {
        if let Some(mime) = self.mime_type() {
            validate_mime(mime)?;
        }

        match self {
            Part::Text { text, .. } => {
                if text.is_empty() {
                    return Err(Error::validation("text part is empty"));
                }
            }
            Part::Data { data, .. } => {
                if !data.is_object() {
                    return Err(Error::validation("data part must be a key-value object"));
                }
                validate_value(data, 0)?;
            }
            Part::File { uri, .. } => validate_uri(uri)?,
            Part::Binary { bytes, .. } => {
                if bytes.is_empty() {
                    return Err(Error::validation("binary part is empty"));
                }
            }
        }
        Ok(())
    }
}

fn validate_mime(mime: &str) -> Result<()> {
    match mime.split_once('/') {
        Some((top, sub)) if !top.is_empty() && !sub.is_empty() && !mime.contains(char::is_whitespace) => {
            Ok(())
        }
        _ => Err(Error::validation(format!("invalid mime type '{}'", mime))),
    }
}

fn validate_uri(uri: &str) -> Result<()> {
    let scheme = uri.split_once(':').map(|(s, _)| s).unwrap_or("");
    let scheme_ok = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok || uri.len() == scheme.len() + 1 {
        return Err(Error::validation(format!("file part uri '{}' has no scheme", uri)));
    }
    Ok(())
}

fn validate_value(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DATA_DEPTH {
        return Err(Error::validation(format!(
            "data part nested deeper than {}",
            MAX_DATA_DEPTH
        )));
    }
    match value {
        Value::Number(n) => {
            if n.as_f64().map_or(false, |f| !f.is_finite()) {
                return Err(Error::validation("data part contains a non-finite number"));
            }
        }
        Value::Array(items) => {
            for item in items {
                validate_value(item, depth + 1)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                validate_value(item, depth + 1)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::String(_) => {}
    }
    Ok(())
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let part = Part::text("hello");
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v, json!({"kind": "text", "text": "hello"}));

        let part = Part::binary(vec![1, 2, 3], Some("application/octet-stream".into()));
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["kind"], "binary");
        assert_eq!(v["bytes"], "AQID");
        assert_eq!(v["mimeType"], "application/octet-stream");
    }

    #[test]
    fn test_data_must_be_object() {
        assert!(Part::data(json!({"region": "eu", "score": 0.4})).validate().is_ok());
        assert!(Part::data(json!([1, 2, 3])).validate().is_err());
        assert!(Part::data(json!("scalar")).validate().is_err());
    }

    #[test]
    fn test_data_depth_limit() {
        let mut value = json!({});
        for _ in 0..(MAX_DATA_DEPTH + 2) {
            value = json!({ "nested": value });
        }
        let err = Part::data(value).validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_file_uri_requires_scheme() {
        assert!(Part::file("s3://bucket/report.pdf").validate().is_ok());
        assert!(Part::file("file:///tmp/a.csv").validate().is_ok());
        assert!(Part::file("report.pdf").validate().is_err());
        assert!(Part::file("s3:").validate().is_err());
    }

    #[test]
    fn test_rejects_empty_payloads_and_bad_mime() {
        assert!(Part::text("").validate().is_err());
        assert!(Part::binary(Vec::new(), None).validate().is_err());
        let part = Part::Text {
            text: "x".into(),
            mime_type: Some("plain".into()),
        };
        assert!(part.validate().is_err());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = r#"{"kind": "video", "uri": "x://y"}"#;
        assert!(serde_json::from_str::<Part>(raw).is_err());
    }

    #[test]
    fn test_unknown_part_field_is_rejected() {
        let raw = r#"{"kind": "text", "text": "x", "confidence": 0.9}"#;
        assert!(serde_json::from_str::<Part>(raw).is_err());
    }
}
