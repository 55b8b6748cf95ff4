//! Document-store access over completion callbacks.
//!
//! [`Cushion`] keeps a pool of open databases on top of a
//! [`DocumentServer`] and exposes convenience operations whose callbacks
//! receive plain [`CompletionArgs`]; that makes them suspension points for
//! coroutine bodies. [`CushionSession`] is the per-handler layer that opens
//! databases on demand.
//!
//! Failures follow one convention: the callback receives the named
//! arguments `error` and `reason`. [`check`] turns such a resumption value
//! into [`YieldError::OperationFailed`].

mod config;
mod document;
mod memory;
mod server;
mod session;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::coroutine::Callback;
use crate::error::{Result, YieldError};
use crate::value::{CompletionArgs, ResumeValue};

pub use config::CushionConfig;
pub use document::{Document, ID_FIELD, REV_FIELD};
pub use memory::{MapFn, MemoryServer, MemoryServerBuilder, ALL_DOCS};
pub use server::{Database, DocumentServer, Reply, ViewParams, ViewRow};
pub use session::CushionSession;

/// Turn a resumption value into a result, surfacing the failure convention.
pub fn check(value: ResumeValue) -> Result<Value> {
    match value {
        ResumeValue::Mapping(map) if map.contains_key("error") => {
            let text = |key: &str| match map.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Err(YieldError::operation_failed(text("error"), text("reason")))
        }
        other => Ok(other.into_value()),
    }
}

/// Completion arguments reporting `err` to a callback.
pub(crate) fn failure_args(err: &YieldError) -> CompletionArgs {
    match err {
        YieldError::OperationFailed { error, reason } => CompletionArgs::new()
            .named_arg("error", error.as_str())
            .named_arg("reason", reason.as_str()),
        other => CompletionArgs::new()
            .named_arg("error", "internal")
            .named_arg("reason", other.to_string()),
    }
}

/// Split `design/view`. An empty design addresses a built-in view.
pub(crate) fn split_resource(resource: &str) -> Result<(&str, &str)> {
    resource.split_once('/').ok_or_else(|| {
        YieldError::Validation(format!(
            "view resource must look like design/view, got {:?}",
            resource
        ))
    })
}

pub(crate) fn check_deletable(doc: &Document) -> Result<()> {
    if doc.id().is_some() && doc.rev().is_some() {
        Ok(())
    } else {
        Err(YieldError::Validation(
            "record missing _id and _rev, can't delete".to_string(),
        ))
    }
}

/// Callback used when a save or delete is fired without one.
fn logging_callback(operation: &'static str) -> Callback {
    Callback::new(move |args| {
        if let Err(e) = check(ResumeValue::from(args)) {
            tracing::error!("Unhandled {} failure: {}", operation, e);
        }
    })
}

fn reply_with<T, F>(callback: Callback, convert: F) -> Reply<T>
where
    T: 'static,
    F: FnOnce(T) -> CompletionArgs + Send + 'static,
{
    Box::new(move |result: Result<T>| match result {
        Ok(value) => callback.invoke(convert(value)),
        Err(e) => callback.invoke(failure_args(&e)),
    })
}

/// A pool of open databases on one document server.
pub struct Cushion {
    server: Arc<dyn DocumentServer>,
    pool: Arc<Mutex<HashMap<String, Arc<dyn Database>>>>,
}

impl Cushion {
    pub fn new(server: Arc<dyn DocumentServer>) -> Self {
        Self {
            server,
            pool: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying server connection.
    pub fn server(&self) -> &Arc<dyn DocumentServer> {
        &self.server
    }

    /// Create database `name`; fails if it already exists.
    pub fn create(&self, name: &str, callback: impl Into<Callback>) {
        self.server
            .create(name, reply_with(callback.into(), |created: String| {
                CompletionArgs::single(created)
            }));
    }

    /// Call back with whether `name` exists, without pooling it.
    pub fn exists(&self, name: &str, callback: impl Into<Callback>) {
        let callback = callback.into();
        if self.contains(name) {
            callback.invoke(CompletionArgs::single(true));
            return;
        }
        self.server.get(
            name,
            false,
            Box::new(move |result: Result<Arc<dyn Database>>| {
                callback.invoke(CompletionArgs::single(result.is_ok()))
            }),
        );
    }

    /// Open `name` and add it to the pool, then call back with its name.
    ///
    /// A pooled database calls back right away, before this returns.
    pub fn open(&self, name: &str, create: bool, callback: impl Into<Callback>) {
        let callback = callback.into();
        if self.contains(name) {
            tracing::debug!("Database {} already open", name);
            callback.invoke(CompletionArgs::single(name));
            return;
        }

        let pool = Arc::clone(&self.pool);
        let opened = name.to_string();
        self.server.get(
            name,
            create,
            Box::new(move |result: Result<Arc<dyn Database>>| match result {
                Ok(db) => {
                    pool.lock().insert(opened.clone(), db);
                    tracing::info!("Database {} opened", opened);
                    callback.invoke(CompletionArgs::single(opened));
                }
                Err(e) => {
                    tracing::error!("Failed to open database {}: {}", opened, e);
                    callback.invoke(failure_args(&e));
                }
            }),
        );
    }

    /// Drop `name` from the pool. Returns whether it was pooled.
    pub fn close(&self, name: &str) -> bool {
        self.pool.lock().remove(name).is_some()
    }

    /// The pooled database `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Database>> {
        self.pool
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| YieldError::NotReady(format!("{} not open yet", name)))
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.pool.lock().contains_key(name)
    }

    /// Whether `name` is open and usable.
    pub fn ready(&self, name: &str) -> bool {
        self.contains(name)
    }

    /// Fetch document `id`; the callback gets the document or `null`.
    pub fn one(&self, db: &str, id: &str, callback: impl Into<Callback>) -> Result<()> {
        let database = self.get(db)?;
        database.get(
            id,
            reply_with(callback.into(), |doc: Option<Document>| {
                CompletionArgs::single(doc.map_or(Value::Null, Document::into_value))
            }),
        );
        Ok(())
    }

    /// Query `design/view`; the callback gets the array of rows.
    pub fn view(
        &self,
        db: &str,
        resource: &str,
        params: &ViewParams,
        callback: impl Into<Callback>,
    ) -> Result<()> {
        let (design, view) = split_resource(resource)?;
        let database = self.get(db)?;
        database.view(
            design,
            view,
            params,
            reply_with(callback.into(), |rows: Vec<ViewRow>| {
                CompletionArgs::single(Value::Array(
                    rows.into_iter().map(ViewRow::into_value).collect(),
                ))
            }),
        );
        Ok(())
    }

    /// Store `doc`; the callback gets the saved document.
    pub fn save(&self, db: &str, doc: Document, callback: Option<Callback>) -> Result<()> {
        let database = self.get(db)?;
        let callback = callback.unwrap_or_else(|| logging_callback("save"));
        database.set(
            doc,
            reply_with(callback, |saved: Document| {
                CompletionArgs::single(saved.into_value())
            }),
        );
        Ok(())
    }

    /// Delete `doc`, which must carry `_id` and `_rev`.
    pub fn delete(&self, db: &str, doc: &Document, callback: Option<Callback>) -> Result<()> {
        check_deletable(doc)?;
        let database = self.get(db)?;
        let callback = callback.unwrap_or_else(|| logging_callback("delete"));
        database.delete(
            doc,
            reply_with(callback, |receipt: Document| {
                CompletionArgs::single(receipt.into_value())
            }),
        );
        Ok(())
    }
}

impl fmt::Debug for Cushion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.pool.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("Cushion").field("pool", &names).finish()
    }
}
