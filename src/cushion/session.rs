//! Per-handler document-store access.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{
    check, check_deletable, failure_args, logging_callback, split_resource, Cushion,
    CushionConfig, Document, ViewParams,
};
use crate::coroutine::Callback;
use crate::error::{Result, YieldError};
use crate::value::ResumeValue;

/// Database operations for a handler, with a default database.
///
/// Every `db_*` operation first opens its database if the pool does not hold
/// it yet, then issues itself again once the open completes. When opening
/// fails, the operation's callback receives the failure.
///
/// The callbacks are usually [`Completion`](crate::Completion)s, which makes
/// each operation a suspension point:
///
/// ```ignore
/// let doc = co.suspend(|cb| session.db_one("user:1", None, cb)).await?;
/// ```
pub struct CushionSession {
    cushion: Arc<Cushion>,
    default_db: RwLock<String>,
    create_missing: bool,
}

impl CushionSession {
    pub fn new(cushion: Arc<Cushion>) -> Self {
        Self {
            cushion,
            default_db: RwLock::new(String::new()),
            create_missing: false,
        }
    }

    /// Session using the default database and create policy of `config`.
    pub fn from_config(cushion: Arc<Cushion>, config: &CushionConfig) -> Self {
        Self {
            cushion,
            default_db: RwLock::new(config.default_db.clone()),
            create_missing: config.create_missing,
        }
    }

    pub fn cushion(&self) -> &Arc<Cushion> {
        &self.cushion
    }

    pub fn default_db(&self) -> String {
        self.default_db.read().clone()
    }

    /// Make `dbname` the default database and open it.
    pub fn db_setup(&self, dbname: &str, create: bool, callback: impl Into<Callback>) {
        *self.default_db.write() = dbname.to_string();
        self.cushion.open(dbname, create, callback);
    }

    /// Fetch document `key`; the callback gets the document or `null`.
    pub fn db_one(&self, key: &str, db: Option<&str>, callback: impl Into<Callback>) -> Result<()> {
        let key = key.to_string();
        self.with_db(db, callback.into(), move |cushion, db, callback| {
            cushion.one(db, &key, callback)
        })
    }

    /// Query view `resource` (`design/view`).
    pub fn db_view(
        &self,
        resource: &str,
        db: Option<&str>,
        params: ViewParams,
        callback: impl Into<Callback>,
    ) -> Result<()> {
        split_resource(resource)?;
        let resource = resource.to_string();
        self.with_db(db, callback.into(), move |cushion, db, callback| {
            cushion.view(db, &resource, &params, callback)
        })
    }

    /// Save `doc`. Without a callback, failures are logged.
    ///
    /// Pass `Some(Callback::ignored())` to drop the result silently.
    pub fn db_save(&self, doc: Document, db: Option<&str>, callback: Option<Callback>) -> Result<()> {
        let callback = callback.unwrap_or_else(|| logging_callback("save"));
        self.with_db(db, callback, move |cushion, db, callback| {
            cushion.save(db, doc, Some(callback))
        })
    }

    /// Delete `doc`, which must carry `_id` and `_rev`.
    pub fn db_delete(&self, doc: Document, db: Option<&str>, callback: Option<Callback>) -> Result<()> {
        check_deletable(&doc)?;
        let callback = callback.unwrap_or_else(|| logging_callback("delete"));
        self.with_db(db, callback, move |cushion, db, callback| {
            cushion.delete(db, &doc, Some(callback))
        })
    }

    fn with_db<F>(&self, db: Option<&str>, callback: Callback, op: F) -> Result<()>
    where
        F: FnOnce(&Cushion, &str, Callback) -> Result<()> + Send + 'static,
    {
        let db = match db {
            Some(db) => db.to_string(),
            None => self.default_db(),
        };
        if db.is_empty() {
            return Err(YieldError::Validation(
                "no database given and no default database set".to_string(),
            ));
        }

        if self.cushion.contains(&db) {
            return op(&self.cushion, &db, callback);
        }

        tracing::debug!("Database {} not open, opening before retrying", db);
        let cushion = Arc::clone(&self.cushion);
        let target = db.clone();
        self.cushion.open(
            &db,
            self.create_missing,
            Callback::new(move |args| match check(ResumeValue::from(args)) {
                Ok(_) => {
                    // The operation owns the relay; on error the callback is still ours.
                    let pending = Arc::new(Mutex::new(Some(callback)));
                    let forward = Arc::clone(&pending);
                    let relay = Callback::new(move |args| {
                        let callback = forward.lock().take();
                        if let Some(callback) = callback {
                            callback.invoke(args);
                        }
                    });
                    if let Err(e) = op(&cushion, &target, relay) {
                        tracing::error!("Retried operation on {} failed: {}", target, e);
                        let callback = pending.lock().take();
                        if let Some(callback) = callback {
                            callback.invoke(failure_args(&e));
                        }
                    }
                }
                Err(e) => callback.invoke(failure_args(&e)),
            }),
        );
        Ok(())
    }
}

impl fmt::Debug for CushionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CushionSession")
            .field("default_db", &*self.default_db.read())
            .field("create_missing", &self.create_missing)
            .field("cushion", &self.cushion)
            .finish()
    }
}
