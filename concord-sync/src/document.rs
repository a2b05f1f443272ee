//! Document content types and the doctype descriptor.
//!
//! A [`Document`] is an immutable content value that can diff itself against
//! another value into a patch and apply such a patch. The sync engine is
//! generic over it; [`DocType`] is the closed set of content types the
//! engine knows how to instantiate by name.

use std::fmt;
use std::str::FromStr;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::Record;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("unknown document type '{0}'")]
    UnknownDocType(String),
    #[error("cannot parse document: {0}")]
    Parse(String),
    #[error("invalid document options: {0}")]
    InvalidOptions(String),
}

/// Content types the engine can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocType {
    String,
    Db,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::String => "string",
            DocType::Db => "db",
        }
    }
}

impl FromStr for DocType {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(DocType::String),
            "db" => Ok(DocType::Db),
            other => Err(DocumentError::UnknownDocType(other.to_string())),
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content representation a synchronized document is built on.
pub trait Document: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Patch: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Options: Clone + fmt::Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    const DOCTYPE: DocType;

    fn empty(options: &Self::Options) -> Self;

    fn from_str(text: &str, options: &Self::Options) -> Result<Self, DocumentError>;

    fn to_str(&self) -> String;

    /// Patch turning `self` into `target`.
    fn make_patch(&self, target: &Self) -> Self::Patch;

    /// Must be deterministic: the same patch on the same content always
    /// yields the same result, wherever it runs.
    fn apply_patch(&self, patch: &Self::Patch) -> Self;

    fn is_noop(patch: &Self::Patch) -> bool;

    fn validate(_options: &Self::Options) -> Result<(), DocumentError> {
        Ok(())
    }
}

/// Resolved `{type, opts}` descriptor stored in a syncstrings row.
#[derive(Debug, Clone, PartialEq)]
pub struct DocTypeSpec {
    pub doctype: DocType,
    pub opts: Record,
}

impl Default for DocTypeSpec {
    fn default() -> Self {
        Self {
            doctype: DocType::String,
            opts: Record::new(),
        }
    }
}

impl DocTypeSpec {
    pub fn new(doctype: DocType, opts: Record) -> Self {
        Self { doctype, opts }
    }

    /// Resolve the stored descriptor, never failing.
    ///
    /// Accepts the JSON text form or an already decoded object. Malformed
    /// JSON counts as `{}`; a missing or unknown type resolves to `string`.
    pub fn resolve(raw: Option<&Value>) -> Self {
        let decoded = match raw {
            Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|err| {
                warn!("ignoring malformed doctype {text:?}: {err}");
                Value::Object(Record::new())
            }),
            Some(Value::Object(object)) => Value::Object(object.clone()),
            _ => Value::Object(Record::new()),
        };

        let doctype = match decoded.get("type").and_then(Value::as_str) {
            Some(name) => name.parse().unwrap_or_else(|err: DocumentError| {
                warn!("{err}; opening as string");
                DocType::String
            }),
            None => DocType::String,
        };
        let opts = decoded
            .get("opts")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self { doctype, opts }
    }

    /// JSON text form as stored in the syncstrings row.
    pub fn to_json_string(&self) -> String {
        let value = if self.opts.is_empty() {
            json!({"type": self.doctype.as_str()})
        } else {
            json!({"type": self.doctype.as_str(), "opts": self.opts})
        };
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doctype_names() {
        assert_eq!("db".parse::<DocType>().unwrap(), DocType::Db);
        assert_eq!(DocType::String.to_string(), "string");
        assert_eq!(
            "sagews".parse::<DocType>().unwrap_err(),
            DocumentError::UnknownDocType("sagews".into())
        );
    }

    #[test]
    fn test_resolve_text_form() {
        let raw = json!(r#"{"type":"db","opts":{"primary_keys":["id"]}}"#);
        let spec = DocTypeSpec::resolve(Some(&raw));
        assert_eq!(spec.doctype, DocType::Db);
        assert_eq!(spec.opts["primary_keys"], json!(["id"]));
    }

    #[test]
    fn test_resolve_falls_back_to_string() {
        for raw in [
            Some(json!("{not json")),
            Some(json!(r#"{"type":"sagews"}"#)),
            Some(json!({"opts": {}})),
            Some(json!(42)),
            None,
        ] {
            assert_eq!(DocTypeSpec::resolve(raw.as_ref()).doctype, DocType::String);
        }
    }

    #[test]
    fn test_json_string_resolves_back() {
        let mut opts = Record::new();
        opts.insert("snapshot_interval".into(), json!(3));
        let spec = DocTypeSpec::new(DocType::Db, opts);
        let stored = Value::String(spec.to_json_string());
        assert_eq!(DocTypeSpec::resolve(Some(&stored)), spec);

        assert_eq!(DocTypeSpec::default().to_json_string(), r#"{"type":"string"}"#);
    }
}
