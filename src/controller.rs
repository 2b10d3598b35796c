//! Forwarding controller.
//!
//! Watches the share view for active pairs and keeps exactly one
//! forwarding session per pair alive within the process.  A session tails
//! the message view's context index strictly above the pair's cursor and
//! hands each row to the worker.  Delivery acknowledgements do not advance
//! the cursor; the outbound wrapper's own feed entry does, through the
//! share view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use relay_index::indexer::{Indexer, ReadOptions};

use crate::views::{
    context_tail_bounds, MessageProjection, ShareProjection, ShareRow, CFR_INDEX, CONTEXT_INDEX,
};
use crate::worker::{Delivery, Worker};

pub(crate) struct Controller {
    label: String,
    shares: Arc<Indexer<ShareProjection>>,
    messages: Arc<Indexer<MessageProjection>>,
    worker: Arc<dyn Worker>,
    inflight: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        label: String,
        shares: Arc<Indexer<ShareProjection>>,
        messages: Arc<Indexer<MessageProjection>>,
        worker: Arc<dyn Worker>,
    ) -> Arc<Self> {
        Arc::new(Controller {
            label,
            shares,
            messages,
            worker,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Run until shutdown: start sessions for every currently active pair,
    /// then follow share-state commits live.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // Subscribe before snapshotting so no activation can fall between.
        let mut commits = UnboundedReceiverStream::new(self.shares.subscribe());
        let (snapshot, fence) = match self.shares.snapshot(CFR_INDEX, &ReadOptions::default()) {
            Ok(v) => v,
            Err(e) => {
                error!(node = %self.label, error = %e, "cannot list active shares");
                return;
            }
        };
        for entry in snapshot {
            Self::activate(&self, entry.state);
        }

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender means the engine is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                commit = commits.next() => {
                    let Some(commit) = commit else { break };
                    if commit.tick <= fence {
                        continue;
                    }
                    match commit.state.active {
                        Some(true) => Self::activate(&self, commit.state),
                        Some(false) => self.cancel(&commit.state),
                        None => {}
                    }
                }
            }
        }

        let sessions: Vec<_> = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inflight.drain().collect()
        };
        for (_, handle) in sessions {
            handle.abort();
        }
        debug!(node = %self.label, "forwarding controller stopped");
    }

    /// Start a session for `row` unless one is already in flight.
    ///
    /// Cursor advances re-emit active pairs; the in-flight check makes
    /// those a no-op.
    fn activate(this: &Arc<Self>, row: ShareRow) {
        let key = (row.context.clone(), row.recipient.clone());
        let mut inflight = this
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if inflight.contains_key(&key) {
            return;
        }
        info!(
            node = %this.label,
            context = %row.context,
            recipient = %row.recipient,
            from_seq = row.seq,
            "forwarding session start"
        );
        let session_owner = Arc::clone(this);
        let handle = tokio::spawn(async move { session_owner.session(row).await });
        inflight.insert(key, handle);
    }

    /// Tear down the session for a deactivated pair. Duplicate
    /// cancellations are no-ops.
    fn cancel(&self, row: &ShareRow) {
        let key = (row.context.clone(), row.recipient.clone());
        let handle = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inflight.remove(&key)
        };
        if let Some(handle) = handle {
            handle.abort();
            info!(
                node = %self.label,
                context = %row.context,
                recipient = %row.recipient,
                "forwarding session cancelled"
            );
        }
    }

    async fn session(self: Arc<Self>, row: ShareRow) {
        let (gt, lt) = context_tail_bounds(&row.context, row.seq);
        let mut stream = Arc::clone(&self.messages).by(CONTEXT_INDEX).read(ReadOptions {
            gt: Some(gt),
            lt: Some(lt),
            live: true,
            ..ReadOptions::default()
        });
        while let Some(item) = stream.next().await {
            match item {
                Ok(entry) => {
                    let message = entry.state;
                    debug!(
                        node = %self.label,
                        context = %row.context,
                        recipient = %row.recipient,
                        permalink = %message.permalink,
                        seq = message.seq,
                        "forwarding message"
                    );
                    let delivery = Delivery {
                        context: row.context.clone(),
                        recipient: row.recipient.clone(),
                        link: message.permalink.clone(),
                        permalink: message.permalink,
                    };
                    if let Err(e) = self.worker.deliver(delivery).await {
                        warn!(
                            node = %self.label,
                            context = %row.context,
                            recipient = %row.recipient,
                            error = %e,
                            "delivery failed; session ends"
                        );
                        break;
                    }
                }
                Err(e) => {
                    error!(node = %self.label, error = %e, "context tail failed");
                    break;
                }
            }
        }
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inflight.remove(&(row.context, row.recipient));
    }
}
