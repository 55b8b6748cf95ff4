//! In-memory document server.
//!
//! Behaves like a small CouchDB: documents are stored msgpack-encoded,
//! every write bumps an `N-hash` revision, writes against a stale revision
//! fail with `conflict`, and views are Rust map functions. Replies are never
//! made re-entrantly; they are posted to the [`IoLoop`](crate::IoLoop),
//! optionally after a simulated latency.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use super::document::{ID_FIELD, REV_FIELD};
use super::server::{Database, DocumentServer, Reply, ViewParams, ViewRow};
use super::{CushionConfig, Document};
use crate::codec::MsgPackCodec;
use crate::error::{Result, YieldError};
use crate::ioloop::LoopHandle;

/// Map function of a view: the `(key, value)` rows emitted for one document.
pub type MapFn = Arc<dyn Fn(&Document) -> Vec<(Value, Value)> + Send + Sync>;

/// The built-in view listing every document by id.
pub const ALL_DOCS: &str = "_all_docs";

fn not_found(reason: &str) -> YieldError {
    YieldError::operation_failed("not_found", reason)
}

fn conflict() -> YieldError {
    YieldError::operation_failed("conflict", "Document update conflict.")
}

fn unauthorized() -> YieldError {
    YieldError::operation_failed("unauthorized", "Name or password is incorrect.")
}

/// Next revision after `current` for a document whose encoded body is `body`.
fn next_rev(current: Option<&str>, body: &[u8]) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);

    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{}-{:016x}", generation + 1, hasher.finish())
}

/// Total order on view keys: null < booleans < numbers < strings < arrays < objects.
fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(p, q)| collate(p, q))
            .find(|order| order.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Posts replies back to the I/O loop.
#[derive(Clone)]
struct Delivery {
    io: LoopHandle,
    latency: Option<Duration>,
}

impl Delivery {
    fn send<T: Send + 'static>(&self, reply: Reply<T>, result: Result<T>) {
        let posted = match self.latency {
            Some(delay) => self.io.call_later(delay, move || reply(result)),
            None => self.io.add_callback(move || reply(result)),
        };
        if let Err(e) = posted {
            tracing::warn!("Dropping document server reply: {}", e);
        }
    }
}

struct Stored {
    rev: String,
    body: Bytes,
}

#[derive(Default)]
struct Store {
    docs: BTreeMap<String, Stored>,
    /// Source of generated document ids.
    seq: u64,
}

struct MemoryDatabase {
    name: String,
    store: Mutex<Store>,
    views: RwLock<HashMap<String, MapFn>>,
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: Mutex::new(Store::default()),
            views: RwLock::new(HashMap::new()),
        }
    }

    fn load(&self, id: &str) -> Result<Option<Document>> {
        let store = self.store.lock();
        store
            .docs
            .get(id)
            .map(|stored| MsgPackCodec::decode(&stored.body))
            .transpose()
    }

    fn save(&self, mut doc: Document) -> Result<Document> {
        let mut store = self.store.lock();

        let id = match doc.id() {
            Some(id) => id.to_string(),
            None => {
                store.seq += 1;
                format!("{:016x}", store.seq)
            }
        };

        let current = store.docs.get(&id).map(|stored| stored.rev.clone());
        if current.as_deref() != doc.rev() {
            return Err(conflict());
        }

        doc.insert(ID_FIELD, id.clone());
        let rev = next_rev(current.as_deref(), &MsgPackCodec::encode(&doc)?);
        doc.insert(REV_FIELD, rev.clone());

        let body = Bytes::from(MsgPackCodec::encode(&doc)?);
        store.docs.insert(id, Stored { rev, body });
        Ok(doc)
    }

    fn remove(&self, doc: &Document) -> Result<Document> {
        let (id, rev) = match (doc.id(), doc.rev()) {
            (Some(id), Some(rev)) => (id, rev),
            _ => {
                return Err(YieldError::Validation(
                    "document needs _id and _rev to be deleted".to_string(),
                ))
            }
        };

        let mut store = self.store.lock();
        let current = store.docs.get(id).map(|stored| stored.rev.clone());
        match current {
            None => Err(not_found("deleted")),
            Some(current) if current != rev => Err(conflict()),
            Some(_) => {
                store.docs.remove(id);
                Ok(Document::new()
                    .with("ok", true)
                    .with("id", id)
                    .with("rev", next_rev(Some(rev), id.as_bytes())))
            }
        }
    }

    fn documents(&self) -> Result<Vec<(String, String, Document)>> {
        let store = self.store.lock();
        store
            .docs
            .iter()
            .map(|(id, stored)| {
                let doc: Document = MsgPackCodec::decode(&stored.body)?;
                Ok((id.clone(), stored.rev.clone(), doc))
            })
            .collect()
    }

    fn query(&self, design: &str, view: &str, params: &ViewParams) -> Result<Vec<ViewRow>> {
        let documents = self.documents()?;

        let mut rows: Vec<ViewRow> = if design.is_empty() {
            if view != ALL_DOCS {
                return Err(not_found("missing_named_view"));
            }
            documents
                .into_iter()
                .map(|(id, rev, doc)| ViewRow {
                    key: Value::String(id.clone()),
                    id,
                    value: json!({ "rev": rev }),
                    doc: Some(doc),
                })
                .collect()
        } else {
            let map = self
                .views
                .read()
                .get(&format!("{}/{}", design, view))
                .cloned()
                .ok_or_else(|| not_found("missing_named_view"))?;

            let mut rows = Vec::new();
            for (id, _rev, doc) in documents {
                for (key, value) in map(&doc) {
                    rows.push(ViewRow {
                        id: id.clone(),
                        key,
                        value,
                        doc: Some(doc.clone()),
                    });
                }
            }
            rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
            rows
        };

        if let Some(key) = &params.key {
            rows.retain(|row| &row.key == key);
        }
        if params.descending {
            rows.reverse();
        }

        Ok(rows
            .into_iter()
            .skip(params.skip)
            .take(params.limit.unwrap_or(usize::MAX))
            .map(|mut row| {
                if !params.include_docs {
                    row.doc = None;
                }
                row
            })
            .collect())
    }
}

struct Inner {
    uri: String,
    credentials: Option<(String, String)>,
    delivery: Delivery,
    databases: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
}

impl Inner {
    fn create(&self, name: &str) -> Result<Arc<MemoryDatabase>> {
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(YieldError::operation_failed(
                "file_exists",
                "The database could not be created, the file already exists.",
            ));
        }
        let db = Arc::new(MemoryDatabase::new(name));
        databases.insert(name.to_string(), Arc::clone(&db));
        tracing::debug!("Created database {}", name);
        Ok(db)
    }

    fn lookup(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.databases.read().get(name).cloned()
    }
}

/// Builder for [`MemoryServer`].
#[derive(Debug, Default)]
pub struct MemoryServerBuilder {
    uri: Option<String>,
    credentials: Option<(String, String)>,
    latency: Option<Duration>,
}

impl MemoryServerBuilder {
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Require these credentials from every connection.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Delay every reply by `latency`. Needs a tokio runtime.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn build(self, io: LoopHandle) -> MemoryServer {
        MemoryServer {
            inner: Arc::new(Inner {
                uri: self
                    .uri
                    .unwrap_or_else(|| CushionConfig::default().uri),
                credentials: self.credentials,
                delivery: Delivery {
                    io,
                    latency: self.latency,
                },
                databases: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// An in-memory document server whose replies arrive on an I/O loop.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<Inner>,
}

impl MemoryServer {
    /// Server without credentials or latency.
    pub fn new(io: LoopHandle) -> Self {
        Self::builder().build(io)
    }

    pub fn builder() -> MemoryServerBuilder {
        MemoryServerBuilder::default()
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Open a connection with the credentials in `config`.
    ///
    /// A connection with wrong credentials is still returned; every
    /// operation on it fails with `unauthorized`.
    pub fn connect(&self, config: &CushionConfig) -> Arc<dyn DocumentServer> {
        let authorized = match &self.inner.credentials {
            None => true,
            Some((username, password)) => {
                config.username.as_deref() == Some(username.as_str())
                    && config.password.as_deref() == Some(password.as_str())
            }
        };
        if config.uri != self.inner.uri {
            tracing::warn!("Connecting to {} through {}", self.inner.uri, config.uri);
        }
        if !authorized {
            tracing::warn!(
                "Rejecting credentials for {:?} on {}",
                config.username,
                self.inner.uri
            );
        }

        Arc::new(Connection {
            server: Arc::clone(&self.inner),
            authorized,
        })
    }

    /// Register the map function of view `design/view` on database `db`.
    pub fn define_view<F>(&self, db: &str, design: &str, view: &str, map: F) -> Result<()>
    where
        F: Fn(&Document) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        if design.is_empty() {
            return Err(YieldError::Validation(
                "views need a design document name".to_string(),
            ));
        }
        let database = self
            .inner
            .lookup(db)
            .ok_or_else(|| not_found("no_db_file"))?;
        database
            .views
            .write()
            .insert(format!("{}/{}", design, view), Arc::new(map));
        Ok(())
    }

    /// Names of all databases, sorted.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of documents in `db`, if it exists.
    pub fn document_count(&self, db: &str) -> Option<usize> {
        self.inner
            .lookup(db)
            .map(|database| database.store.lock().docs.len())
    }
}

/// One client's view of a [`MemoryServer`].
struct Connection {
    server: Arc<Inner>,
    authorized: bool,
}

impl Connection {
    fn reply<T: Send + 'static>(&self, reply: Reply<T>, result: Result<T>) {
        self.server.delivery.send(reply, result);
    }

    fn check_auth(&self) -> Result<()> {
        if self.authorized {
            Ok(())
        } else {
            Err(unauthorized())
        }
    }
}

impl DocumentServer for Connection {
    fn create(&self, name: &str, reply: Reply<String>) {
        let result = self
            .check_auth()
            .and_then(|_| self.server.create(name))
            .map(|db| db.name.clone());
        self.reply(reply, result);
    }

    fn get(&self, name: &str, create: bool, reply: Reply<Arc<dyn Database>>) {
        let result = self.check_auth().and_then(|_| {
            let database = match self.server.lookup(name) {
                Some(database) => database,
                None if create => self.server.create(name)?,
                None => return Err(not_found("no_db_file")),
            };
            let handle: Arc<dyn Database> = Arc::new(DatabaseHandle {
                db: database,
                delivery: self.server.delivery.clone(),
            });
            Ok(handle)
        });
        self.reply(reply, result);
    }

    fn delete(&self, name: &str, reply: Reply<()>) {
        let result = self.check_auth().and_then(|_| {
            match self.server.databases.write().remove(name) {
                Some(_) => {
                    tracing::debug!("Deleted database {}", name);
                    Ok(())
                }
                None => Err(not_found("missing")),
            }
        });
        self.reply(reply, result);
    }
}

struct DatabaseHandle {
    db: Arc<MemoryDatabase>,
    delivery: Delivery,
}

impl Database for DatabaseHandle {
    fn name(&self) -> &str {
        &self.db.name
    }

    fn get(&self, id: &str, reply: Reply<Option<Document>>) {
        self.delivery.send(reply, self.db.load(id));
    }

    fn set(&self, doc: Document, reply: Reply<Document>) {
        self.delivery.send(reply, self.db.save(doc));
    }

    fn delete(&self, doc: &Document, reply: Reply<Document>) {
        self.delivery.send(reply, self.db.remove(doc));
    }

    fn view(&self, design: &str, view: &str, params: &ViewParams, reply: Reply<Vec<ViewRow>>) {
        self.delivery.send(reply, self.db.query(design, view, params));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioloop::IoLoop;

    fn capture<T: Send + 'static>() -> (Arc<Mutex<Option<Result<T>>>>, Reply<T>) {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        (slot, Box::new(move |result: Result<T>| *sink.lock() = Some(result)))
    }

    fn open(io_loop: &mut IoLoop, server: &MemoryServer, name: &str) -> Arc<dyn Database> {
        let connection = server.connect(&CushionConfig::default());
        let (slot, reply) = capture();
        connection.get(name, true, reply);
        io_loop.run_pending();
        let opened = slot.lock().take();
        opened.unwrap().unwrap()
    }

    fn failure_kind<T>(result: Result<T>) -> String {
        match result {
            Err(YieldError::OperationFailed { error, .. }) => error,
            Err(other) => panic!("expected an operation failure, got {}", other),
            Ok(_) => panic!("expected an operation failure"),
        }
    }

    #[test]
    fn test_next_rev() {
        assert!(next_rev(None, b"a").starts_with("1-"));
        assert!(next_rev(Some("7-abc"), b"a").starts_with("8-"));
        assert_eq!(next_rev(None, b"a"), next_rev(None, b"a"));
        assert_ne!(next_rev(None, b"a"), next_rev(None, b"b"));
    }

    #[test]
    fn test_collate() {
        assert_eq!(collate(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(collate(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(collate(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(collate(&json!([1, "a"]), &json!([1, "b"])), Ordering::Less);
        assert_eq!(collate(&json!(99), &json!("1")), Ordering::Less);
    }

    #[test]
    fn test_replies_are_posted_not_immediate() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let connection = server.connect(&CushionConfig::default());

        let (slot, reply) = capture();
        connection.create("posted", reply);
        assert!(slot.lock().is_none());

        io_loop.run_pending();
        assert_eq!(slot.lock().take().unwrap().unwrap(), "posted");
    }

    #[test]
    fn test_create_twice_fails() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let connection = server.connect(&CushionConfig::default());

        let (_, first) = capture();
        connection.create("dup", first);
        let (slot, second) = capture::<String>();
        connection.create("dup", second);
        io_loop.run_pending();

        assert_eq!(failure_kind(slot.lock().take().unwrap()), "file_exists");
    }

    #[test]
    fn test_get_missing_without_create() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let connection = server.connect(&CushionConfig::default());

        let (slot, reply) = capture();
        connection.get("nowhere", false, reply);
        io_loop.run_pending();

        assert_eq!(failure_kind(slot.lock().take().unwrap()), "not_found");
        assert!(server.database_names().is_empty());
    }

    #[test]
    fn test_save_assigns_id_and_rev() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let db = open(&mut io_loop, &server, "docs");

        let (slot, reply) = capture();
        db.set(Document::new().with("fake", "data"), reply);
        io_loop.run_pending();

        let saved = slot.lock().take().unwrap().unwrap();
        assert!(saved.id().is_some());
        assert!(saved.rev().unwrap().starts_with("1-"));
        assert_eq!(saved.get("fake"), Some(&json!("data")));
        assert_eq!(server.document_count("docs"), Some(1));
    }

    #[test]
    fn test_stale_revision_conflicts() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let db = open(&mut io_loop, &server, "docs");

        let (slot, reply) = capture();
        db.set(Document::new().with("_id", "a").with("n", 1), reply);
        io_loop.run_pending();
        let first = slot.lock().take().unwrap().unwrap();

        let (slot, reply) = capture();
        db.set(first.clone().with("n", 2), reply);
        io_loop.run_pending();
        let second = slot.lock().take().unwrap().unwrap();
        assert!(second.rev().unwrap().starts_with("2-"));

        // Writing on top of the first revision again is a conflict.
        let (slot, reply) = capture();
        db.set(first.with("n", 3), reply);
        io_loop.run_pending();
        assert_eq!(failure_kind(slot.lock().take().unwrap()), "conflict");
    }

    #[test]
    fn test_get_and_delete() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let db = open(&mut io_loop, &server, "docs");

        let (slot, reply) = capture();
        db.set(Document::new().with("_id", "gone"), reply);
        io_loop.run_pending();
        let saved = slot.lock().take().unwrap().unwrap();

        let (slot, reply) = capture();
        db.get("gone", reply);
        io_loop.run_pending();
        assert_eq!(slot.lock().take().unwrap().unwrap(), Some(saved.clone()));

        let (slot, reply) = capture();
        db.delete(&saved, reply);
        io_loop.run_pending();
        let receipt = slot.lock().take().unwrap().unwrap();
        assert_eq!(receipt.get("ok"), Some(&json!(true)));

        let (slot, reply) = capture();
        db.get("gone", reply);
        io_loop.run_pending();
        assert_eq!(slot.lock().take().unwrap().unwrap(), None);
    }

    #[test]
    fn test_views() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let db = open(&mut io_loop, &server, "people");
        server
            .define_view("people", "people", "by_age", |doc| {
                doc.get("age")
                    .map(|age| vec![(age.clone(), doc.get("name").cloned().unwrap_or(Value::Null))])
                    .unwrap_or_default()
            })
            .unwrap();

        for (name, age) in [("carol", 40), ("alice", 30), ("bob", 35)] {
            db.set(Document::new().with("name", name).with("age", age), Box::new(|_: Result<Document>| {}));
        }
        db.set(Document::new().with("name", "ageless"), Box::new(|_: Result<Document>| {}));
        io_loop.run_pending();

        let (slot, reply) = capture();
        db.view("people", "by_age", &ViewParams::default(), reply);
        io_loop.run_pending();
        let rows = slot.lock().take().unwrap().unwrap();
        let names: Vec<&Value> = rows.iter().map(|row| &row.value).collect();
        assert_eq!(names, [&json!("alice"), &json!("bob"), &json!("carol")]);
        assert!(rows.iter().all(|row| row.doc.is_none()));

        let (slot, reply) = capture();
        db.view("people", "by_age", &ViewParams::default().descending().limit(1), reply);
        io_loop.run_pending();
        let rows = slot.lock().take().unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, json!("carol"));

        let (slot, reply) = capture();
        db.view("people", "by_age", &ViewParams::default().key(35).include_docs(), reply);
        io_loop.run_pending();
        let rows = slot.lock().take().unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.as_ref().and_then(|d| d.get("name")), Some(&json!("bob")));
    }

    #[test]
    fn test_all_docs_and_missing_view() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::new(io_loop.handle());
        let db = open(&mut io_loop, &server, "docs");

        db.set(Document::new().with("_id", "b"), Box::new(|_: Result<Document>| {}));
        db.set(Document::new().with("_id", "a"), Box::new(|_: Result<Document>| {}));
        io_loop.run_pending();

        let (slot, reply) = capture();
        db.view("", ALL_DOCS, &ViewParams::default(), reply);
        io_loop.run_pending();
        let ids: Vec<String> = slot
            .lock()
            .take()
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(ids, ["a", "b"]);

        let (slot, reply) = capture();
        db.view("nope", "nothing", &ViewParams::default(), reply);
        io_loop.run_pending();
        assert_eq!(failure_kind(slot.lock().take().unwrap()), "not_found");
    }

    #[test]
    fn test_credentials_checked() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::builder()
            .credentials("admin", "secret")
            .build(io_loop.handle());

        let anonymous = server.connect(&CushionConfig::default());
        let (slot, reply) = capture::<String>();
        anonymous.create("locked", reply);
        io_loop.run_pending();
        assert_eq!(failure_kind(slot.lock().take().unwrap()), "unauthorized");

        let config = CushionConfig {
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..CushionConfig::default()
        };
        let admin = server.connect(&config);
        let (slot, reply) = capture();
        admin.create("locked", reply);
        io_loop.run_pending();
        assert!(slot.lock().take().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_latency_delays_reply() {
        let mut io_loop = IoLoop::new();
        let server = MemoryServer::builder()
            .latency(Duration::from_millis(5))
            .build(io_loop.handle());
        let connection = server.connect(&CushionConfig::default());

        let (slot, reply) = capture();
        connection.create("slow", reply);
        assert_eq!(io_loop.run_pending(), 0);

        io_loop.run().await;
        assert!(slot.lock().take().unwrap().is_ok());
    }
}
