//! Keyed record sets ("databases as documents").
//!
//! Content is a set of records identified by the configured primary key
//! fields. The text form is one JSON object per line, in key order. Patches
//! work per record and per field, so concurrent edits to different fields of
//! the same record both survive. A `null` field value means "absent".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::doc::{DocError, SyncDoc};
use crate::document::{DocType, Document, DocumentError};
use crate::patch::PatchId;
use crate::protocol::Record;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbOptions {
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

impl DbOptions {
    pub fn new<I, S>(primary_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary_keys: primary_keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DbOp {
    /// Merge fields into the record with the same key; `null` drops a field.
    Set { record: Record },
    Remove { key: Record },
}

pub type DbPatch = Vec<DbOp>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbDocument {
    primary_keys: Vec<String>,
    records: BTreeMap<String, Record>,
}

impl DbDocument {
    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Records having every field of `filter`.
    pub fn get<'a>(&'a self, filter: &'a Record) -> impl Iterator<Item = &'a Record> + 'a {
        self.records
            .values()
            .filter(move |record| matches_filter(record, filter))
    }

    /// The first record having every field of `filter`. The result borrows
    /// only `self`, so the filter may be a temporary.
    pub fn get_one(&self, filter: &Record) -> Option<&Record> {
        self.records
            .values()
            .find(|record| matches_filter(record, filter))
    }

    /// A copy with `record` merged into the record sharing its key.
    pub fn set(&self, record: Record) -> Result<Self, DocumentError> {
        let key = self.key_of(&record).ok_or_else(|| {
            DocumentError::Parse(format!(
                "record is missing primary keys {:?}",
                self.primary_keys
            ))
        })?;
        let mut next = self.clone();
        next.merge(key, &record);
        Ok(next)
    }

    /// A copy without the records matching `filter`.
    pub fn delete(&self, filter: &Record) -> Self {
        let mut next = self.clone();
        next.records.retain(|_, record| !matches_filter(record, filter));
        next
    }

    fn key_of(&self, record: &Record) -> Option<String> {
        let mut values = Vec::with_capacity(self.primary_keys.len());
        for field in &self.primary_keys {
            match record.get(field) {
                None | Some(Value::Null) => return None,
                Some(value) => values.push(value.clone()),
            }
        }
        serde_json::to_string(&values).ok()
    }

    fn key_fields(&self, record: &Record) -> Record {
        self.primary_keys
            .iter()
            .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
            .collect()
    }

    fn merge(&mut self, key: String, fields: &Record) {
        let record = self.records.entry(key).or_default();
        for (field, value) in fields {
            if value.is_null() {
                record.remove(field);
            } else {
                record.insert(field.clone(), value.clone());
            }
        }
    }
}

fn matches_filter(record: &Record, filter: &Record) -> bool {
    filter.iter().all(|(k, v)| record.get(k) == Some(v))
}

impl Document for DbDocument {
    type Patch = DbPatch;
    type Options = DbOptions;

    const DOCTYPE: DocType = DocType::Db;

    fn empty(options: &DbOptions) -> Self {
        Self {
            primary_keys: options.primary_keys.clone(),
            records: BTreeMap::new(),
        }
    }

    fn from_str(text: &str, options: &DbOptions) -> Result<Self, DocumentError> {
        let mut doc = Self::empty(options);
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line)
                .map_err(|err| DocumentError::Parse(format!("line {}: {err}", number + 1)))?;
            let key = doc.key_of(&record).ok_or_else(|| {
                DocumentError::Parse(format!("line {}: missing primary key", number + 1))
            })?;
            doc.merge(key, &record);
        }
        Ok(doc)
    }

    fn to_str(&self) -> String {
        self.records
            .values()
            .map(|record| Value::Object(record.clone()).to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn make_patch(&self, target: &Self) -> DbPatch {
        let mut ops = Vec::new();
        for (key, record) in &self.records {
            if !target.records.contains_key(key) {
                ops.push(DbOp::Remove {
                    key: self.key_fields(record),
                });
            }
        }
        for (key, wanted) in &target.records {
            match self.records.get(key) {
                None => ops.push(DbOp::Set {
                    record: wanted.clone(),
                }),
                Some(current) if current != wanted => {
                    let mut fields = target.key_fields(wanted);
                    for (field, value) in wanted {
                        if current.get(field) != Some(value) {
                            fields.insert(field.clone(), value.clone());
                        }
                    }
                    for field in current.keys() {
                        if !wanted.contains_key(field) {
                            fields.insert(field.clone(), Value::Null);
                        }
                    }
                    ops.push(DbOp::Set { record: fields });
                }
                Some(_) => {}
            }
        }
        ops
    }

    fn apply_patch(&self, patch: &DbPatch) -> Self {
        let mut next = self.clone();
        for op in patch {
            match op {
                DbOp::Set { record } => {
                    if let Some(key) = next.key_of(record) {
                        next.merge(key, record);
                    }
                }
                DbOp::Remove { key } => {
                    if let Some(key) = next.key_of(key) {
                        next.records.remove(&key);
                    }
                }
            }
        }
        next
    }

    fn is_noop(patch: &DbPatch) -> bool {
        patch.is_empty()
    }

    fn validate(options: &DbOptions) -> Result<(), DocumentError> {
        if options.primary_keys.is_empty() {
            return Err(DocumentError::InvalidOptions(
                "a db document needs at least one primary key".into(),
            ));
        }
        Ok(())
    }
}

/// Synchronized record set, stored with doctype `{"type": "db"}`.
pub type SyncDB = SyncDoc<DbDocument>;

impl SyncDoc<DbDocument> {
    /// Merge `record` into the record with the same key and commit it.
    pub async fn set_record(&self, record: Record) -> Result<Option<PatchId>, DocError> {
        self.update(move |doc| doc.set(record).map_err(DocError::from))
            .await
    }

    /// Remove every record matching `filter` and commit.
    pub async fn delete_records(&self, filter: Record) -> Result<Option<PatchId>, DocError> {
        self.update(move |doc| Ok(doc.delete(&filter))).await
    }

    pub fn get_record(&self, filter: &Record) -> Option<Record> {
        self.get_doc().get_one(filter).cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        self.get_doc().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn options() -> DbOptions {
        DbOptions::new(["id"])
    }

    #[test]
    fn test_text_form_round_trip() {
        let text = "{\"id\":2,\"name\":\"b\"}\n{\"id\":1,\"name\":\"a\"}";
        let doc = DbDocument::from_str(text, &options()).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(
            doc.to_str(),
            "{\"id\":1,\"name\":\"a\"}\n{\"id\":2,\"name\":\"b\"}"
        );
    }

    #[test]
    fn test_from_str_rejects_keyless_lines() {
        let err = DbDocument::from_str("{\"name\":\"x\"}", &options()).unwrap_err();
        assert!(matches!(err, DocumentError::Parse(_)));
        assert!(DbDocument::from_str("not json", &options()).is_err());
    }

    #[test]
    fn test_patch_reproduces_target() {
        let base = DbDocument::empty(&options())
            .set(record(json!({"id": 1, "a": 1, "b": 2})))
            .unwrap()
            .set(record(json!({"id": 2, "a": 5})))
            .unwrap();
        let target = base
            .delete(&record(json!({"id": 2})))
            .set(record(json!({"id": 1, "b": null, "c": 3})))
            .unwrap()
            .set(record(json!({"id": 3})))
            .unwrap();

        let patch = base.make_patch(&target);
        assert_eq!(base.apply_patch(&patch), target);
        assert!(DbDocument::is_noop(&target.make_patch(&target)));
    }

    #[test]
    fn test_concurrent_field_edits_both_survive() {
        let base = DbDocument::empty(&options())
            .set(record(json!({"id": 1, "x": 0, "y": 0})))
            .unwrap();
        let mine = base.make_patch(&base.set(record(json!({"id": 1, "x": 1}))).unwrap());
        let theirs = base.make_patch(&base.set(record(json!({"id": 1, "y": 2}))).unwrap());

        let merged = base.apply_patch(&mine).apply_patch(&theirs);
        assert_eq!(
            merged.get_one(&record(json!({"id": 1}))),
            Some(&record(json!({"id": 1, "x": 1, "y": 2})))
        );
    }

    fn lookup(doc: &DbDocument, id: i64) -> Option<&Record> {
        let filter = record(json!({"id": id}));
        doc.get_one(&filter)
    }

    #[test]
    fn test_get_one_outlives_its_filter() {
        let doc = DbDocument::empty(&options())
            .set(record(json!({"id": 1, "tag": "a"})))
            .unwrap()
            .set(record(json!({"id": 2, "tag": "b"})))
            .unwrap();

        assert_eq!(lookup(&doc, 2).unwrap()["tag"], json!("b"));
        assert_eq!(lookup(&doc, 3), None);
        assert_eq!(doc.get(&record(json!({"tag": "a"}))).count(), 1);
    }

    #[test]
    fn test_validate_requires_primary_keys() {
        assert!(DbDocument::validate(&DbOptions::default()).is_err());
        assert!(DbDocument::validate(&options()).is_ok());
    }

    #[test]
    fn test_patch_json_shape() {
        let patch = vec![DbOp::Remove {
            key: record(json!({"id": 1})),
        }];
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "remove", "key": {"id": 1}}])
        );
    }
}
