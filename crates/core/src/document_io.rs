//! Document I/O: loading, saving and content-store access.
//!
//! The engine is format-agnostic; everything it needs from the on-disk
//! representation goes through [`DocumentIo`]. [`JsonDocumentIo`] is the
//! stock implementation: one pretty-printed JSON file per document with the
//! attachment content store embedded as base64.

use std::path::Path;

use tracing::{debug, info};

use crate::errors::DocumentError;
use crate::model::Document;

/// Contract between the engine and whoever owns the document format.
pub trait DocumentIo: Send + Sync {
    /// Load a document from `path`.
    fn load(&self, path: &Path) -> Result<Document, DocumentError>;

    /// Persist `document` at `path`, replacing any existing file.
    fn save(&self, document: &Document, path: &Path) -> Result<(), DocumentError>;

    /// Bytes of an attachment, or `None` when the content store lacks it.
    fn attachment_bytes<'a>(&self, document: &'a Document, path: &str) -> Option<&'a [u8]> {
        document.attachments().get(path).map(Vec::as_slice)
    }

    /// Add (or replace) an attachment in the document's content store.
    fn add_attachment(&self, document: &mut Document, path: &str, bytes: Vec<u8>) {
        document.attachments_mut().insert(path.to_string(), bytes);
    }

    /// Independent copy for speculative editing during a merge.
    fn clone_document(&self, document: &Document) -> Document {
        document.clone()
    }
}

/// JSON-backed [`DocumentIo`].
#[derive(Debug, Clone, Default)]
pub struct JsonDocumentIo;

impl DocumentIo for JsonDocumentIo {
    fn load(&self, path: &Path) -> Result<Document, DocumentError> {
        debug!(path = %path.display(), "loading document");
        let contents = std::fs::read_to_string(path)?;
        let document: Document =
            serde_json::from_str(&contents).map_err(|e| DocumentError::ParseError(e.to_string()))?;
        if !document.contains(document.root()) {
            return Err(DocumentError::MissingRoot(document.root().to_string()));
        }
        Ok(document)
    }

    fn save(&self, document: &Document, path: &Path) -> Result<(), DocumentError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut json = serde_json::to_string_pretty(document)
            .map_err(|e| DocumentError::SerializeError(e.to_string()))?;
        json.push('\n');
        std::fs::write(path, json)?;
        info!(path = %path.display(), nodes = document.len(), "document saved");
        Ok(())
    }
}

/// Serde adapter storing attachment bytes as base64 strings.
pub(crate) mod base64_map {
    use std::collections::BTreeMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(map: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: BTreeMap<&str, String> = map
            .iter()
            .map(|(path, bytes)| (path.as_str(), STANDARD.encode(bytes)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(path, text)| match STANDARD.decode(text.as_bytes()) {
                Ok(bytes) => Ok((path, bytes)),
                Err(e) => Err(D::Error::custom(format!(
                    "attachment '{}' is not valid base64: {}",
                    path, e
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::sample;
    use crate::model::{Node, Value};

    #[test]
    fn test_save_and_load_with_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.json");
        let io = JsonDocumentIo;

        let mut doc = sample();
        io.add_attachment(&mut doc, "images/logo.png", vec![0x89, b'P', b'N', b'G', 0]);
        doc.node_mut(&"a".into())
            .unwrap()
            .attributes
            .insert("icon".into(), Value::Attachment("images/logo.png".into()));

        io.save(&doc, &path).unwrap();
        let loaded = io.load(&path).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(
            io.attachment_bytes(&loaded, "images/logo.png"),
            Some(&[0x89, b'P', b'N', b'G', 0][..])
        );
        assert_eq!(io.attachment_bytes(&loaded, "missing.png"), None);
    }

    #[test]
    fn test_load_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{"root":"r","nodes":{}}"#).unwrap();
        let result = JsonDocumentIo.load(&path);
        assert!(matches!(result, Err(DocumentError::MissingRoot(ref r)) if r == "r"));
    }

    #[test]
    fn test_load_rejects_bad_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(
            &path,
            r#"{"root":"r","nodes":{"r":{"id":"r","kind":"model"}},"attachments":{"x":"!!"}}"#,
        )
        .unwrap();
        assert!(matches!(
            JsonDocumentIo.load(&path),
            Err(DocumentError::ParseError(_))
        ));
    }

    #[test]
    fn test_clone_is_independent() {
        let io = JsonDocumentIo;
        let doc = sample();
        let mut copy = io.clone_document(&doc);
        copy.add_child(&"model".into(), Node::new("x", "element"));
        assert!(!doc.contains(&"x".into()));
        assert!(copy.contains(&"x".into()));
    }
}
