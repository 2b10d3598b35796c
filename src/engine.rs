//! The public engine surface.
//!
//! [`Engine::open`] wires the two views and the forwarding controller over
//! a node and spawns their tasks; the engine handle then exposes the
//! control API (`share`, `unshare`, `position`, `messages`, `cursor`,
//! `context_stream`, `close`). Must be called from within a tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{info, warn};

use relay_index::indexer::{IndexSpec, Indexer, ReadOptions};
use relay_index::keys::composite;
use relay_types::entry::{Payload, ShareCtx, UnshareCtx};
use relay_types::kv::Kv;
use relay_types::node::{Feed, Node};

use crate::controller::Controller;
use crate::error::EngineError;
use crate::hooks::{default_context, default_message_seq, ContextFn, MessageSeqFn};
use crate::views::{
    cfr_index_key, context_index_key, context_tail_bounds, MessageProjection, MessageRow,
    ShareProjection, ShareRow, CFR_INDEX, CONTEXT_INDEX,
};
use crate::worker::{SendWorker, Worker};

/// Engine construction options.
pub struct Options {
    /// Base name of the engine's KV namespaces (`msg-<db>` / `ctx-<db>`).
    pub db: String,
    /// Context extraction hook; defaults to the body `context` field.
    pub get_context: Option<ContextFn>,
    /// Sequence derivation hook; defaults to the feed index.
    pub get_message_seq: Option<MessageSeqFn>,
    /// Delivery worker; defaults to wrapping and sending through the node.
    pub worker: Option<Arc<dyn Worker>>,
    /// Run the forwarding controller. Disable to maintain the views
    /// without forwarding anything.
    pub autostart: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            db: "contexts.db".to_owned(),
            get_context: None,
            get_message_seq: None,
            worker: None,
            autostart: true,
        }
    }
}

/// A share request. `seq` is the starting cursor and applies only on the
/// first share for the pair.
#[derive(Debug, Clone, Default)]
pub struct ShareRequest {
    pub context: String,
    pub recipient: String,
    pub seq: u64,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    label: String,
    feed: Arc<dyn Feed>,
    messages: Arc<Indexer<MessageProjection>>,
    shares: Arc<Indexer<ShareProjection>>,
    msg_kv: Arc<dyn Kv>,
    ctx_kv: Arc<dyn Kv>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Open the engine over `node`: reopen both view namespaces, resume the
    /// indexers from their high-water marks, and start forwarding.
    pub fn open(node: &dyn Node, options: Options) -> Result<Engine, EngineError> {
        let label = node.shortlink();
        let db = options.db;
        let msg_kv = node.create_db(&format!("msg-{db}"))?;
        let ctx_kv = node.create_db(&format!("ctx-{db}"))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let get_context = options.get_context.unwrap_or_else(|| Arc::new(default_context));
        let get_message_seq = options
            .get_message_seq
            .unwrap_or_else(|| Arc::new(default_message_seq));

        let messages = Indexer::new(
            format!("msg-{db}@{label}"),
            Arc::clone(&msg_kv),
            MessageProjection::new(
                node.keeper(),
                Arc::clone(&get_context),
                Arc::clone(&get_message_seq),
                Arc::clone(&closed),
            ),
            vec![IndexSpec {
                name: CONTEXT_INDEX,
                key: context_index_key,
            }],
        );
        let shares = Indexer::new(
            format!("ctx-{db}@{label}"),
            Arc::clone(&ctx_kv),
            ShareProjection::new(
                node.keeper(),
                node.objects(),
                get_context,
                get_message_seq,
                Arc::clone(&closed),
            ),
            vec![IndexSpec {
                name: CFR_INDEX,
                key: cfr_index_key,
            }],
        );

        let feed = node.feed();
        tokio::spawn(Arc::clone(&messages).run(Arc::clone(&feed), shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&shares).run(Arc::clone(&feed), shutdown_rx.clone()));

        if options.autostart {
            let worker = options
                .worker
                .unwrap_or_else(|| Arc::new(SendWorker::new(node.sender())));
            let controller = Controller::new(
                label.clone(),
                Arc::clone(&shares),
                Arc::clone(&messages),
                worker,
            );
            tokio::spawn(controller.run(shutdown_rx));
        }

        let inner = Arc::new(EngineInner {
            label: label.clone(),
            feed,
            messages,
            shares,
            msg_kv,
            ctx_kv,
            closed,
            shutdown_tx,
        });

        // Close the engine when the node is destroyed; stand down once the
        // engine itself shuts down.
        let mut destroying = node.shutdown();
        let mut engine_down = inner.shutdown_tx.subscribe();
        let watcher = Arc::clone(&inner);
        tokio::spawn(async move {
            if *destroying.borrow() {
                watcher.shutdown();
                return;
            }
            loop {
                tokio::select! {
                    changed = destroying.changed() => {
                        if changed.is_err() || *destroying.borrow() {
                            watcher.shutdown();
                            break;
                        }
                    }
                    changed = engine_down.changed() => {
                        if changed.is_err() || *engine_down.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        info!(node = %node.name(), shortlink = %label, db = %db, "context relay engine open");
        Ok(Engine { inner })
    }

    /// Declare that `context` is shared with `recipient`, starting at
    /// `seq`. Appends a control record to the feed; state changes land once
    /// the record re-enters the views. Returns the record's feed index.
    pub async fn share(&self, request: ShareRequest) -> Result<u64, EngineError> {
        self.inner.check_open()?;
        validate_pair(&request.context, &request.recipient)?;
        let change = self
            .inner
            .feed
            .append(Payload::ShareCtx(ShareCtx {
                context: request.context,
                recipient: request.recipient,
                seq: request.seq,
                timestamp: Utc::now(),
            }))
            .await?;
        Ok(change)
    }

    /// Stop sharing `context` with `recipient`. The pair's cursor is kept;
    /// re-sharing resumes above it.
    pub async fn unshare(&self, context: &str, recipient: &str) -> Result<u64, EngineError> {
        self.inner.check_open()?;
        validate_pair(context, recipient)?;
        let change = self
            .inner
            .feed
            .append(Payload::UnshareCtx(UnshareCtx {
                context: context.to_owned(),
                recipient: recipient.to_owned(),
                timestamp: Utc::now(),
            }))
            .await?;
        Ok(change)
    }

    /// The pair's cursor, or [`EngineError::NotShared`] when no active
    /// share exists.
    pub fn position(&self, context: &str, recipient: &str) -> Result<u64, EngineError> {
        self.inner.check_open()?;
        validate_pair(context, recipient)?;
        let (rows, _) = self.inner.shares.snapshot(
            CFR_INDEX,
            &ReadOptions {
                eq: Some(composite(&[context, recipient]).into_bytes()),
                ..ReadOptions::default()
            },
        )?;
        rows.into_iter()
            .next()
            .map(|entry| entry.state.seq)
            .ok_or(EngineError::NotShared)
    }

    /// The messages of a shared context still ahead of the pair's cursor.
    /// Fails with [`EngineError::NotShared`] when the pair is not active.
    pub fn messages(
        &self,
        context: &str,
        recipient: &str,
        live: bool,
    ) -> Result<BoxStream<'static, Result<MessageRow, EngineError>>, EngineError> {
        let seq = self.position(context, recipient)?;
        Ok(self.context_stream(context, seq, live))
    }

    /// Tail of the message view for one context, strictly above `seq`.
    pub fn context_stream(
        &self,
        context: &str,
        seq: u64,
        live: bool,
    ) -> BoxStream<'static, Result<MessageRow, EngineError>> {
        let (gt, lt) = context_tail_bounds(context, seq);
        Arc::clone(&self.inner.messages)
            .by(CONTEXT_INDEX)
            .read(ReadOptions {
                gt: Some(gt),
                lt: Some(lt),
                live,
                ..ReadOptions::default()
            })
            .map(|item| item.map(|entry| entry.state).map_err(EngineError::from))
            .boxed()
    }

    /// Raw stream of active share states.
    pub fn cursor(&self, live: bool) -> BoxStream<'static, Result<ShareRow, EngineError>> {
        Arc::clone(&self.inner.shares)
            .by(CFR_INDEX)
            .read(ReadOptions {
                live,
                ..ReadOptions::default()
            })
            .map(|item| item.map(|entry| entry.state).map_err(EngineError::from))
            .boxed()
    }

    /// Close the engine: stop the controller and sessions, end live
    /// streams, and close both namespaces. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl EngineInner {
    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.shares.close();
        self.messages.close();
        if let Err(e) = self.msg_kv.close() {
            warn!(node = %self.label, error = %e, "message namespace close failed");
        }
        if let Err(e) = self.ctx_kv.close() {
            warn!(node = %self.label, error = %e, "share namespace close failed");
        }
        info!(node = %self.label, "context relay engine closed");
    }
}

fn validate_pair(context: &str, recipient: &str) -> Result<(), EngineError> {
    if context.is_empty() {
        return Err(EngineError::InvalidRequest("context is required"));
    }
    if recipient.is_empty() {
        return Err(EngineError::InvalidRequest("recipient is required"));
    }
    if !relay_index::keys::fragment_ok(context) {
        return Err(EngineError::InvalidRequest(
            "context contains the reserved separator",
        ));
    }
    if !relay_index::keys::fragment_ok(recipient) {
        return Err(EngineError::InvalidRequest(
            "recipient contains the reserved separator",
        ));
    }
    Ok(())
}
