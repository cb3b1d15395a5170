//! Documents flowing through a pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a document run. Also the key for checkpoints and progress.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A document submitted for processing.
///
/// `source` is opaque to the engine: a path, URL or inline text that the
/// first stage's processor knows how to read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub source: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<DocumentId>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// A document whose source is its own identifier.
    pub fn from_id(id: &DocumentId) -> Self {
        Self::new(id.clone(), id.as_str())
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_display() {
        let id = DocumentId::new("doc-1");
        assert_eq!(id.to_string(), "doc-1");
        assert_eq!(format!("{:?}", id), "DocumentId(doc-1)");
    }

    #[test]
    fn test_from_id_uses_id_as_source() {
        let doc = Document::from_id(&DocumentId::new("a.pdf"));
        assert_eq!(doc.source, "a.pdf");
    }

    #[test]
    fn test_attributes() {
        let doc = Document::new("d", "s").with_attribute("lang", "en");
        assert_eq!(doc.attribute("lang"), Some("en"));
        assert_eq!(doc.attribute("missing"), None);
    }
}
