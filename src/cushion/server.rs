//! The document server seam.
//!
//! A document server is an external service; everything here is
//! callback-based. Replies are typed, and [`Cushion`](super::Cushion) turns
//! them into generic completion arguments.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::Document;
use crate::error::Result;

/// Typed reply callback used by servers and databases.
pub type Reply<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Server-level operations.
pub trait DocumentServer: Send + Sync {
    /// Create database `name`. Fails if it already exists.
    fn create(&self, name: &str, reply: Reply<String>);

    /// Get a handle to database `name`, creating it first when `create` is set.
    fn get(&self, name: &str, create: bool, reply: Reply<Arc<dyn Database>>);

    /// Delete database `name`.
    fn delete(&self, name: &str, reply: Reply<()>);
}

/// Operations on one open database.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch a document by id; `None` when there is no such document.
    fn get(&self, id: &str, reply: Reply<Option<Document>>);

    /// Store a document, returning it with its `_id` and new `_rev`.
    fn set(&self, doc: Document, reply: Reply<Document>);

    /// Delete a document; it must carry `_id` and the current `_rev`.
    fn delete(&self, doc: &Document, reply: Reply<Document>);

    /// Query view `design/view` (an empty design names a built-in view).
    fn view(&self, design: &str, view: &str, params: &ViewParams, reply: Reply<Vec<ViewRow>>);
}

/// Query parameters of a view request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewParams {
    /// Only rows emitted with exactly this key.
    pub key: Option<Value>,
    pub limit: Option<usize>,
    pub skip: usize,
    pub descending: bool,
    /// Attach the full document to each row.
    pub include_docs: bool,
}

impl ViewParams {
    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }
}

/// One row of a view result.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    pub value: Value,
    pub doc: Option<Document>,
}

impl ViewRow {
    /// `{"id", "key", "value"}` plus `"doc"` when present.
    pub fn into_value(self) -> Value {
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), Value::String(self.id));
        row.insert("key".to_string(), self.key);
        row.insert("value".to_string(), self.value);
        if let Some(doc) = self.doc {
            row.insert("doc".to_string(), doc.into_value());
        }
        Value::Object(row)
    }
}
