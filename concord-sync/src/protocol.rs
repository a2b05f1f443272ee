//! Query protocol shared by the data layer and its changefeed consumers.
//!
//! Queries travel as JSON in the shape the data layer expects:
//! ```text
//! get:  { "patches": [ { "string_id": "abc", "time": null, "patch": null } ] }
//! set:  { "patches":   { "string_id": "abc", "time": 17, "patch": [..] } }
//! ```
//! A `null` field in a get query selects that field; a non-null field is an
//! equality filter. A query selecting no fields returns whole rows.
//!
//! Every query pushes its responses into one [`ResponseSink`]. For a
//! changefeed (`changes: true`) the first response carries the initial rows
//! and every later one is a delta `{action, new_val?, old_val?}` or a
//! terminator (`{event: "query_cancel"}` or an error).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// A row as it travels on the wire: an arbitrary field map.
pub type Record = Map<String, Value>;

/// Event name the data layer sends when a changefeed has been cancelled.
pub const QUERY_CANCEL: &str = "query_cancel";

/// Option key of a conditional write: the fields the stored row must still
/// hold for the write to apply. A `null` value means "absent".
pub const IF_MATCH: &str = "if_match";

/// Default timeout attached to changefeed queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of a changefeed delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// Errors reported by the data layer through a response sink.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("malformed query: {0}")]
    Malformed(String),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("unknown query id '{0}'")]
    UnknownQuery(String),
    #[error("transport disconnected")]
    Disconnected,
    #[error("server error: {0}")]
    Server(String),
    #[error("row in '{0}' changed since it was read")]
    Conflict(String),
}

/// Primary key contract of a table.
///
/// The schema mechanism itself lives elsewhere; the engine only needs the
/// table name and which fields identify a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new<I, S>(name: impl Into<String>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            primary_key: primary_key.into_iter().map(Into::into).collect(),
        }
    }

    /// Stable string key of a record, or `None` if a key field is missing.
    ///
    /// The key is the JSON array of the primary key values, so
    /// `{"string_id": "a", "time": 3}` keys as `["a",3]`.
    pub fn key_of(&self, record: &Record) -> Option<String> {
        let mut values = Vec::with_capacity(self.primary_key.len());
        for field in &self.primary_key {
            match record.get(field) {
                Some(Value::Null) | None => return None,
                Some(v) => values.push(v.clone()),
            }
        }
        serde_json::to_string(&Value::Array(values)).ok()
    }

    /// The primary key fields of `record` only.
    pub fn key_fields(&self, record: &Record) -> Record {
        self.primary_key
            .iter()
            .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
            .collect()
    }
}

/// A get query against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    filter: Record,
    fields: Vec<String>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Record::new(),
            fields: Vec::new(),
        }
    }

    /// Only rows whose `field` equals `value`.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    /// Fields to return. An empty selection returns whole rows.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filters(&self) -> &Record {
        &self.filter
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Whether `record` passes every equality filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.filter
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }

    /// Restrict `record` to the selected fields plus filter and key fields.
    pub fn project(&self, record: &Record, schema: &TableSchema) -> Record {
        if self.fields.is_empty() {
            return record.clone();
        }
        record
            .iter()
            .filter(|(field, _)| {
                self.fields.iter().any(|f| f == *field)
                    || self.filter.contains_key(*field)
                    || schema.primary_key.iter().any(|f| f == *field)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Render as the JSON get query.
    pub fn to_value(&self) -> Value {
        let mut template = self.filter.clone();
        for field in &self.fields {
            template.entry(field.clone()).or_insert(Value::Null);
        }
        let mut outer = Record::new();
        outer.insert(self.table.clone(), Value::Array(vec![Value::Object(template)]));
        Value::Object(outer)
    }
}

/// A parsed JSON query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    Get(Query),
    Set { table: String, row: Record },
}

impl QueryShape {
    pub fn parse(query: &Value) -> Result<Self, QueryError> {
        let outer = query
            .as_object()
            .ok_or_else(|| QueryError::Malformed("query must be an object".into()))?;
        if outer.len() != 1 {
            return Err(QueryError::Malformed(format!(
                "query must name exactly one table, got {}",
                outer.len()
            )));
        }
        let Some((table, body)) = outer.iter().next() else {
            return Err(QueryError::Malformed("empty query".into()));
        };
        match body {
            Value::Array(items) => {
                let template = match items.as_slice() {
                    [] => Record::new(),
                    [Value::Object(t)] => t.clone(),
                    _ => {
                        return Err(QueryError::Malformed(
                            "get query must hold a single template object".into(),
                        ))
                    }
                };
                let mut q = Query::new(table.clone());
                for (field, value) in template {
                    if value.is_null() {
                        q.fields.push(field);
                    } else {
                        q.filter.insert(field, value);
                    }
                }
                Ok(QueryShape::Get(q))
            }
            Value::Object(row) => Ok(QueryShape::Set {
                table: table.clone(),
                row: row.clone(),
            }),
            _ => Err(QueryError::Malformed(format!(
                "query body for '{table}' must be an array or an object"
            ))),
        }
    }
}

/// Request handed to a [`QueryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: Value,
    pub changes: bool,
    pub timeout: Duration,
    pub options: Vec<Value>,
}

impl QueryRequest {
    /// A changefeed query.
    pub fn changefeed(query: &Query, timeout: Duration, options: Vec<Value>) -> Self {
        Self {
            query: query.to_value(),
            changes: true,
            timeout,
            options,
        }
    }

    /// A one-shot write of `row` into `table`.
    pub fn set(table: &str, row: Record, timeout: Duration) -> Self {
        let mut outer = Record::new();
        outer.insert(table.to_string(), Value::Object(row));
        Self {
            query: Value::Object(outer),
            changes: false,
            timeout,
            options: Vec::new(),
        }
    }

    /// A write of `row` that applies only while the stored row still has
    /// the fields of `expected`.
    pub fn set_if(table: &str, row: Record, expected: Record, timeout: Duration) -> Self {
        let mut option = Record::new();
        option.insert(IF_MATCH.to_string(), Value::Object(expected));
        let mut request = Self::set(table, row, timeout);
        request.options.push(Value::Object(option));
        request
    }

    /// The precondition of a conditional write, if any.
    pub fn precondition(&self) -> Option<&Record> {
        self.options
            .iter()
            .find_map(|option| option.get(IF_MATCH).and_then(Value::as_object))
    }
}

/// Whether `row` (absent counts as empty) still has every field of `expected`.
pub fn row_matches(row: Option<&Record>, expected: &Record) -> bool {
    expected.iter().all(|(field, value)| {
        let stored = row.and_then(|row| row.get(field)).unwrap_or(&Value::Null);
        stored == value
    })
}

/// One response envelope as delivered by the data layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_val: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_val: Option<Record>,
}

impl QueryResponse {
    /// Initial result of a get query.
    pub fn initial(id: Option<String>, table: &str, rows: Vec<Record>) -> Self {
        let mut query = Record::new();
        query.insert(
            table.to_string(),
            Value::Array(rows.into_iter().map(Value::Object).collect()),
        );
        Self {
            id,
            query: Some(query),
            ..Self::default()
        }
    }

    /// A changefeed delta.
    pub fn change(action: Action, new_val: Option<Record>, old_val: Option<Record>) -> Self {
        Self {
            action: Some(action),
            new_val,
            old_val,
            ..Self::default()
        }
    }

    /// Terminator sent once a changefeed is cancelled.
    pub fn cancelled() -> Self {
        Self {
            event: Some(QUERY_CANCEL.to_string()),
            ..Self::default()
        }
    }

    /// Acknowledgement of a write.
    pub fn ack() -> Self {
        Self::default()
    }

    pub fn is_cancel(&self) -> bool {
        self.event.as_deref() == Some(QUERY_CANCEL)
    }

    /// Rows of `table` in an initial result, or `None` if the key is absent.
    pub fn rows(&self, table: &str) -> Option<Vec<Record>> {
        match self.query.as_ref()?.get(table)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_object().cloned())
                    .collect(),
            ),
            Value::Object(row) => Some(vec![row.clone()]),
            _ => None,
        }
    }

    /// Strip the envelope down to the delta, if this is one.
    pub fn into_change(self) -> Option<Change> {
        let action = self.action?;
        Some(Change {
            action,
            new_val: self.new_val,
            old_val: self.old_val,
        })
    }
}

/// A changefeed delta with the protocol envelope removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_val: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_val: Option<Record>,
}

/// Where a backend pushes the responses of one query.
pub type ResponseSink = mpsc::UnboundedSender<Result<QueryResponse, QueryError>>;

/// The data layer seen from the engine: query with optional changefeed, and
/// cancellation of a changefeed by id.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Start `request`; responses are pushed into `sink`.
    ///
    /// A changefeed keeps its sink until it is cancelled or the transport
    /// drops; dropping the sink signals the end of the feed.
    fn query(&self, request: QueryRequest, sink: ResponseSink);

    /// Stop the changefeed with the given id.
    async fn query_cancel(&self, id: &str) -> Result<(), QueryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_renders_template() {
        let q = Query::new("patches")
            .filter("string_id", "abc")
            .select(["time", "patch"]);
        assert_eq!(
            q.to_value(),
            json!({"patches": [{"string_id": "abc", "time": null, "patch": null}]})
        );
    }

    #[test]
    fn test_parse_get_query() {
        let shape = QueryShape::parse(&json!({"syncstrings": [{"string_id": "x", "path": null}]}))
            .unwrap();
        match shape {
            QueryShape::Get(q) => {
                assert_eq!(q.table(), "syncstrings");
                assert_eq!(q.filters().get("string_id"), Some(&json!("x")));
                assert_eq!(q.fields(), ["path".to_string()]);
            }
            other => panic!("expected get query, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_query() {
        let shape = QueryShape::parse(&json!({"patches": {"string_id": "x", "time": 1}})).unwrap();
        assert!(matches!(shape, QueryShape::Set { ref table, .. } if table == "patches"));
    }

    #[test]
    fn test_parse_rejects_multiple_tables() {
        let err = QueryShape::parse(&json!({"a": [], "b": []})).unwrap_err();
        assert!(matches!(err, QueryError::Malformed(_)));
        assert!(QueryShape::parse(&json!([1, 2])).is_err());
        assert!(QueryShape::parse(&json!({"a": 5})).is_err());
    }

    #[test]
    fn test_conditional_set_carries_precondition() {
        let expected = record(json!({"users": null}));
        let request = QueryRequest::set_if(
            "syncstrings",
            record(json!({"string_id": "s", "users": ["a"]})),
            expected.clone(),
            Duration::from_secs(1),
        );
        assert_eq!(request.precondition(), Some(&expected));
        assert_eq!(
            QueryRequest::set("t", Record::new(), Duration::from_secs(1)).precondition(),
            None
        );

        assert!(row_matches(None, &expected));
        assert!(row_matches(Some(&record(json!({"string_id": "s"}))), &expected));
        assert!(!row_matches(Some(&record(json!({"users": ["b"]}))), &expected));
        assert!(row_matches(
            Some(&record(json!({"users": ["b"], "path": "x"}))),
            &record(json!({"users": ["b"]}))
        ));
    }

    #[test]
    fn test_schema_key_of() {
        let schema = TableSchema::new("patches", ["string_id", "time", "user_id"]);
        let row = record(json!({"string_id": "a", "time": 3, "user_id": 0, "patch": "p"}));
        assert_eq!(schema.key_of(&row).as_deref(), Some(r#"["a",3,0]"#));

        let partial = record(json!({"string_id": "a", "time": 3}));
        assert!(schema.key_of(&partial).is_none());
        assert_eq!(schema.key_fields(&row).len(), 3);
    }

    #[test]
    fn test_query_matches_and_projects() {
        let schema = TableSchema::new("t", ["id"]);
        let q = Query::new("t").filter("owner", "ann").select(["title"]);
        let row = record(json!({"id": 1, "owner": "ann", "title": "x", "secret": true}));
        assert!(q.matches(&row));
        let projected = q.project(&row, &schema);
        assert_eq!(projected, record(json!({"id": 1, "owner": "ann", "title": "x"})));

        let other = record(json!({"id": 2, "owner": "bob"}));
        assert!(!q.matches(&other));
    }

    #[test]
    fn test_response_envelope_is_stripped() {
        let resp = QueryResponse {
            id: Some("feed".into()),
            action: Some(Action::Update),
            new_val: Some(record(json!({"id": 1}))),
            ..QueryResponse::default()
        };
        let change = resp.into_change().unwrap();
        assert_eq!(change.action, Action::Update);
        assert!(change.old_val.is_none());

        assert!(QueryResponse::ack().into_change().is_none());
    }

    #[test]
    fn test_response_serializes_without_empty_fields() {
        let encoded = serde_json::to_value(QueryResponse::cancelled()).unwrap();
        assert_eq!(encoded, json!({"event": "query_cancel"}));

        let decoded: QueryResponse =
            serde_json::from_value(json!({"action": "delete", "old_val": {"id": 1}})).unwrap();
        assert_eq!(decoded.action, Some(Action::Delete));
    }

    #[test]
    fn test_initial_rows() {
        let resp = QueryResponse::initial(None, "t", vec![record(json!({"id": 1}))]);
        assert_eq!(resp.rows("t").unwrap().len(), 1);
        assert!(resp.rows("other").is_none());
    }
}
