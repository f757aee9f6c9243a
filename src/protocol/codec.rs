//! Document encoding on the wire.

use thiserror::Error;

use super::Document;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("element {element} has invalid value {value:?}")]
    InvalidValue { element: String, value: String },
}

/// Converts documents to and from request/response bodies.
pub trait DocumentCodec: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn encode(&self, document: &Document) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, body: &[u8]) -> Result<Document, CodecError>;
}

/// JSON rendering of the document tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, document: &Document) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(document).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<Document, CodecError> {
        serde_json::from_slice(body).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::document::{Element, ns};

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            JsonCodec.decode(b"<xml/>"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_leaf_without_children_omits_empty_fields() {
        let doc = Document::new(Element::leaf(ns::PING, "Status", "1"));
        let body = String::from_utf8(JsonCodec.encode(&doc).unwrap()).unwrap();
        assert!(!body.contains("children"));
        assert_eq!(JsonCodec.decode(body.as_bytes()).unwrap(), doc);
    }
}
