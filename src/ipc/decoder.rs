//! Engine stdout line protocol.
//!
//! Each structured line looks like `{"type":"transcription","data":{...}}`.
//! Anything else is a [`DecodeError`]; callers log and drop it.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Typed record emitted by the engine on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Transcription {
        text: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Translation {
        text: String,
        original: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    LanguageDetected {
        language: String,
    },
    Status {
        message: String,
    },
    Error {
        message: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transcription { .. } => "transcription",
            Self::Translation { .. } => "translation",
            Self::LanguageDetected { .. } => "language_detected",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }
}

const KNOWN_KINDS: &[&str] = &[
    "transcription",
    "translation",
    "language_detected",
    "status",
    "error",
];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("line is not a JSON object")]
    NotStructured,
    #[error("record has no \"type\" discriminant")]
    MissingKind,
    #[error("unknown record type '{0}'")]
    UnknownKind(String),
    #[error("malformed '{kind}' record: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse one stdout line.
pub fn decode_line(line: &str) -> Result<EngineEvent, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    if !trimmed.starts_with('{') {
        return Err(DecodeError::NotStructured);
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|_| DecodeError::NotStructured)?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingKind),
    };
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

/// Normalize one stderr diagnostic line: drop ANSI styling and surrounding whitespace.
pub fn clean_diagnostic(raw: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&stripped).trim().to_string()
}
