//! A guestbook handler written as straight-line code.
//!
//! Each request signs the book and answers with the latest entries. Every
//! database call is a suspension point; the handler never nests callbacks.
//!
//! Run with `cargo run --example guestbook`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use yieldpoint::cushion::{check, ViewParams};
use yieldpoint::{
    async_yield, Co, Cushion, CushionConfig, CushionSession, Document, HandlerContext,
    Invocation, IoLoop, MemoryServer, Method, RequestContext, YieldHandler,
};

struct Guestbook {
    ctx: HandlerContext,
    request: RequestContext,
    db: CushionSession,
}

impl YieldHandler for Guestbook {
    fn context(&self) -> &HandlerContext {
        &self.ctx
    }
}

fn sign() -> Method<Guestbook, (u64, String), ()> {
    async_yield("sign", |book: Arc<Guestbook>, (at, name): (u64, String), co: Co| {
        Invocation::coroutine(async move {
            let entry = Document::new()
                .with("kind", "entry")
                .with("name", name.as_str())
                .with("at", at);
            let saved = co
                .suspend(|cb| book.db.db_save(entry, None, Some(cb.into())))
                .await?;
            check(saved)?;

            let latest = co
                .suspend(|cb| {
                    book.db.db_view(
                        "entries/by_time",
                        None,
                        ViewParams::default().descending().limit(3),
                        cb,
                    )
                })
                .await?;
            let names: Vec<Value> = check(latest)?
                .as_array()
                .map(|rows| rows.iter().map(|row| row["value"].clone()).collect())
                .unwrap_or_default();

            book.request.respond(&json!({ "signed": name, "latest": names }))?;
            book.request.finish();
            Ok(())
        })
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> yieldpoint::Result<()> {
    let mut io_loop = IoLoop::new();
    let server = MemoryServer::builder()
        .latency(Duration::from_millis(2))
        .build(io_loop.handle());
    let config = CushionConfig::from_json(r#"{"default_db": "guestbook", "create_missing": true}"#)?;
    let cushion = Arc::new(Cushion::new(server.connect(&config)));

    // Opening first so the view can be defined before any request runs.
    cushion.open("guestbook", true, yieldpoint::Callback::ignored());
    io_loop.run().await;
    server.define_view("guestbook", "entries", "by_time", |doc| {
        match (doc.get("at"), doc.get("name")) {
            (Some(at), Some(name)) => vec![(at.clone(), name.clone())],
            _ => Vec::new(),
        }
    })?;

    let sign = sign();
    for (at, name) in ["ada", "grace", "barbara", "frances"].into_iter().enumerate() {
        let request = RequestContext::new(at as u32);
        let book = Arc::new(Guestbook {
            ctx: HandlerContext::new(request.clone()),
            request: request.clone(),
            db: CushionSession::from_config(Arc::clone(&cushion), &config),
        });

        let outcome = sign.call(&book, (at as u64, name.to_string()))?;
        println!("request {}: in flight = {}", at, outcome.is_in_flight());

        io_loop.run().await;
        let state = request.wait_finished().await;
        let reply: Option<Value> = request.decode_chunk(0)?;
        println!("request {}: {:?} {}", at, state, reply.unwrap_or(Value::Null));
    }

    Ok(())
}
