//! Stage outputs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::content_store::ContentId;

/// Value produced by a processor.
///
/// Large byte payloads are replaced with [`StageOutput::Reference`] before
/// they are stored in the pipeline context, so checkpoints stay small.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StageOutput {
    Empty,
    Text(String),
    Json(serde_json::Value),
    Bytes(Bytes),
    Reference(ContentId),
}

impl StageOutput {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ContentId> {
        match self {
            Self::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Approximate number of bytes this output occupies inline.
    pub fn inline_size(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(s) => s.len(),
            Self::Json(v) => v.to_string().len(),
            Self::Bytes(b) => b.len(),
            Self::Reference(id) => id.as_str().len(),
        }
    }
}

impl From<String> for StageOutput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for StageOutput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<serde_json::Value> for StageOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for StageOutput {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}
