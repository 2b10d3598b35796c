//! The materialized indexer.
//!
//! One indexer owns one KV namespace and one projection.  It tails the
//! change feed from its durable high-water mark, runs each entry through
//! the projection pipeline (filter → preprocess → primary key → reduce),
//! and commits the new state row, all secondary-index mutations, and the
//! advanced high-water mark in a single atomic batch.  Entries are
//! processed strictly one at a time in feed order, which makes replay
//! deterministic.
//!
//! # Live tailing
//! Every committed state is published to subscribers together with a
//! process-local commit tick.  A read stream snapshots the index range and
//! the current tick under the same lock that serializes commits, so the
//! snapshot/live hand-off neither drops nor duplicates entries.
//!
//! # High-water mark
//! Deterministic skips (filtered entries, no primary key, reduce drop,
//! unchanged state) advance the mark.  A transient preprocess drop (blob or
//! metadata not yet resolvable) freezes the mark for the rest of the run:
//! the entry, and everything after it, is re-processed on the next open.
//! Re-applying an already-committed entry reproduces the same state, so the
//! re-run converges.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use relay_types::entry::ChangeEntry;
use relay_types::kv::{KeyRange, Kv, KvError, KvOp};
use relay_types::node::Feed;

use crate::keys::{KEY_END, SEP};

// ---------------------------------------------------------------------------
// Projection contract
// ---------------------------------------------------------------------------

/// A projection folds feed entries into per-key state.
///
/// `reduce` must be a pure function of `(prev, entry)`: replaying a feed
/// suffix against durable state is the crash-recovery path.  Anything that
/// needs I/O (body hydration, metadata lookups) belongs in `preprocess`.
pub trait Projection: Send + Sync + 'static {
    type State: Clone
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Entries failing the filter are skipped before any I/O.
    fn filter(&self, entry: &ChangeEntry) -> bool {
        let _ = entry;
        true
    }

    /// Hydrate the entry (resolve bodies, attach referenced records).
    /// Returning `None` drops the entry as transiently unresolvable; a
    /// later replay retries it.
    fn preprocess(
        &self,
        entry: ChangeEntry,
    ) -> impl Future<Output = Option<ChangeEntry>> + Send;

    /// Route the entry to a state row; `None` skips it.
    fn primary_key(&self, entry: &ChangeEntry) -> Option<String>;

    /// Fold the entry into the row. `None` skips; a result deep-equal to
    /// `prev` is also skipped, without touching the namespace.
    fn reduce(&self, prev: Option<&Self::State>, entry: &ChangeEntry) -> Option<Self::State>;
}

/// Declaration of one ordered secondary index.
///
/// `key` maps a state to its composed index key (fragments joined with
/// [`SEP`]); `None` keeps the state out of this index.
pub struct IndexSpec<S> {
    pub name: &'static str,
    pub key: fn(&S) -> Option<String>,
}

// ---------------------------------------------------------------------------
// Commits and subscriptions
// ---------------------------------------------------------------------------

/// A committed state change, as seen by live subscribers.
#[derive(Debug, Clone)]
pub struct Commit<S> {
    /// Feed index of the entry that produced this state.
    pub change: u64,
    /// Process-local commit tick; strictly increasing per indexer.
    pub tick: u64,
    /// Primary key of the row.
    pub primary: String,
    pub state: S,
    /// Composed key per declared index (declaration order); `None` when the
    /// state is absent from that index.
    pub index_keys: Vec<Option<Vec<u8>>>,
}

/// One entry yielded by an index read stream.
#[derive(Debug, Clone)]
pub struct IndexEntry<S> {
    /// Composed index key (without namespace prefix).
    pub key: Vec<u8>,
    pub state: S,
}

/// Options for [`IndexHandle::read`]. Bounds apply to composed index keys.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub gt: Option<Vec<u8>>,
    pub gte: Option<Vec<u8>>,
    pub lt: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,
    /// Exact-prefix convenience: expands to `gte = eq, lte = eq + SEP`.
    pub eq: Option<Vec<u8>>,
    /// Emit existing entries.
    pub old: bool,
    /// Continue emitting as new entries match.
    pub live: bool,
    /// Reverse the snapshot order. Live entries always arrive in commit
    /// order.
    pub reverse: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            eq: None,
            old: true,
            live: false,
            reverse: false,
        }
    }
}

impl ReadOptions {
    fn range(&self) -> KeyRange {
        if let Some(eq) = &self.eq {
            let mut upper = eq.clone();
            upper.push(SEP);
            return KeyRange {
                gte: Some(eq.clone()),
                lte: Some(upper),
                ..KeyRange::default()
            };
        }
        KeyRange {
            gt: self.gt.clone(),
            gte: self.gte.clone(),
            lt: self.lt.clone(),
            lte: self.lte.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Namespace layout
// ---------------------------------------------------------------------------

// r <SEP> <primary key>           -> serialized state
// i <SEP> <index name> <SEP> <composed key> -> primary key
// m <SEP> hwm                     -> big-endian u64

fn row_key(primary: &str) -> Vec<u8> {
    let mut k = vec![b'r', SEP];
    k.extend_from_slice(primary.as_bytes());
    k
}

fn index_prefix(name: &str) -> Vec<u8> {
    let mut k = vec![b'i', SEP];
    k.extend_from_slice(name.as_bytes());
    k.push(SEP);
    k
}

fn index_key(name: &str, composed: &[u8]) -> Vec<u8> {
    let mut k = index_prefix(name);
    k.extend_from_slice(composed);
    k
}

fn meta_hwm_key() -> Vec<u8> {
    let mut k = vec![b'm', SEP];
    k.extend_from_slice(b"hwm");
    k
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

pub struct Indexer<P: Projection> {
    label: String,
    projection: P,
    kv: Arc<dyn Kv>,
    indexes: Vec<IndexSpec<P::State>>,
    /// Serializes commits against snapshot reads.
    sync: RwLock<()>,
    /// Process-local commit tick, bumped under the write half of `sync`.
    ticks: AtomicU64,
    subs: Mutex<Vec<mpsc::UnboundedSender<Commit<P::State>>>>,
    closed: AtomicBool,
}

impl<P: Projection> Indexer<P> {
    pub fn new(
        label: impl Into<String>,
        kv: Arc<dyn Kv>,
        projection: P,
        indexes: Vec<IndexSpec<P::State>>,
    ) -> Arc<Self> {
        Arc::new(Indexer {
            label: label.into(),
            projection,
            kv,
            indexes,
            sync: RwLock::new(()),
            ticks: AtomicU64::new(0),
            subs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Greatest feed index already consumed; 0 when the namespace is fresh.
    pub fn high_water_mark(&self) -> Result<u64, KvError> {
        match self.kv.get(&meta_hwm_key())? {
            None => Ok(0),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KvError::Corrupt("high-water mark width".to_owned()))?;
                Ok(u64::from_be_bytes(arr))
            }
        }
    }

    /// Current state for a primary key.
    pub fn get(&self, primary: &str) -> Result<Option<P::State>, KvError> {
        let _read = self.sync.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.load_row(primary)
    }

    fn load_row(&self, primary: &str) -> Result<Option<P::State>, KvError> {
        match self.kv.get(&row_key(primary))? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Codec(e.to_string())),
        }
    }

    /// Handle to a declared secondary index.
    ///
    /// The name must match an [`IndexSpec`] passed at construction.
    pub fn by(self: Arc<Self>, name: &'static str) -> IndexHandle<P> {
        let pos = self.index_pos(name);
        IndexHandle {
            indexer: self,
            pos,
            name,
        }
    }

    fn index_pos(&self, name: &str) -> usize {
        self.indexes
            .iter()
            .position(|i| i.name == name)
            .expect("index name matches a declared IndexSpec")
    }

    /// Subscribe to every commit this indexer performs from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Commit<P::State>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Snapshot an index range together with the commit tick fencing it.
    /// Live events with `tick` beyond the fence are exactly the commits not
    /// yet visible in the snapshot.
    fn snapshot_index(
        &self,
        pos: usize,
        range: &KeyRange,
        reverse: bool,
        want_rows: bool,
    ) -> Result<(Vec<IndexEntry<P::State>>, u64), KvError> {
        let _read = self.sync.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let fence = self.ticks.load(Ordering::Acquire);
        if !want_rows {
            return Ok((Vec::new(), fence));
        }

        let name = self.indexes[pos].name;
        let prefix = index_prefix(name);
        let namespaced = namespace_range(&prefix, range);
        let mut out = Vec::new();
        for (full_key, primary) in self.kv.scan(&namespaced, reverse)? {
            let composed = full_key[prefix.len()..].to_vec();
            let primary = String::from_utf8(primary)
                .map_err(|e| KvError::Codec(e.to_string()))?;
            match self.load_row(&primary)? {
                Some(state) => out.push(IndexEntry {
                    key: composed,
                    state,
                }),
                // Rows are never deleted; a dangling pointer would mean a
                // namespace shared between two instances.
                None => debug!(label = %self.label, primary = %primary, "index row without state row"),
            }
        }
        Ok((out, fence))
    }

    /// Snapshot an index range (old entries only), with its fence tick.
    pub fn snapshot(
        &self,
        name: &str,
        opts: &ReadOptions,
    ) -> Result<(Vec<IndexEntry<P::State>>, u64), KvError> {
        let pos = self.index_pos(name);
        self.snapshot_index(pos, &opts.range(), opts.reverse, true)
    }

    /// Stop publishing and drop all live subscribers. The namespace itself
    /// is closed by its owner.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Tail the feed from above the high-water mark until shutdown.
    pub async fn run(self: Arc<Self>, feed: Arc<dyn Feed>, mut shutdown: watch::Receiver<bool>) {
        let from = match self.high_water_mark() {
            Ok(hwm) => hwm + 1,
            Err(e) => {
                error!(label = %self.label, error = %e, "cannot read high-water mark");
                return;
            }
        };
        info!(label = %self.label, from, "indexer resuming");
        let mut entries = feed.tail(from);
        let mut frozen = false;
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender means the engine is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = entries.next() => {
                    let Some(entry) = next else { break };
                    if self.closed.load(Ordering::Acquire) {
                        break;
                    }
                    match self.apply(entry, frozen).await {
                        Ok(now_frozen) => frozen = now_frozen,
                        Err(KvError::Closed) => break,
                        Err(e) => {
                            error!(label = %self.label, error = %e, "indexer pipeline failed");
                            break;
                        }
                    }
                }
            }
        }
        debug!(label = %self.label, "indexer stopped");
    }

    /// Process one entry. Returns the (possibly newly set) frozen flag.
    pub(crate) async fn apply(&self, entry: ChangeEntry, frozen: bool) -> Result<bool, KvError> {
        let change = entry.change;
        if !self.projection.filter(&entry) {
            self.advance(change, frozen)?;
            return Ok(frozen);
        }
        let Some(entry) = self.projection.preprocess(entry).await else {
            debug!(label = %self.label, change, "entry dropped in preprocess; will retry on replay");
            return Ok(true);
        };
        let Some(primary) = self.projection.primary_key(&entry) else {
            self.advance(change, frozen)?;
            return Ok(frozen);
        };

        let _write = self.sync.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let prev = self.load_row(&primary)?;
        let Some(next) = self.projection.reduce(prev.as_ref(), &entry) else {
            drop(_write);
            self.advance(change, frozen)?;
            return Ok(frozen);
        };
        if prev.as_ref() == Some(&next) {
            drop(_write);
            self.advance(change, frozen)?;
            return Ok(frozen);
        }

        let mut batch = vec![KvOp::Put {
            key: row_key(&primary),
            value: serde_json::to_vec(&next).map_err(|e| KvError::Codec(e.to_string()))?,
        }];
        let mut index_keys = Vec::with_capacity(self.indexes.len());
        for spec in &self.indexes {
            let old_key = prev.as_ref().and_then(|s| (spec.key)(s));
            let new_key = (spec.key)(&next);
            if old_key != new_key {
                if let Some(old) = &old_key {
                    batch.push(KvOp::Del {
                        key: index_key(spec.name, old.as_bytes()),
                    });
                }
                if let Some(new) = &new_key {
                    batch.push(KvOp::Put {
                        key: index_key(spec.name, new.as_bytes()),
                        value: primary.as_bytes().to_vec(),
                    });
                }
            }
            index_keys.push(new_key.map(String::into_bytes));
        }
        if !frozen {
            batch.push(KvOp::Put {
                key: meta_hwm_key(),
                value: change.to_be_bytes().to_vec(),
            });
        }
        self.kv.write(batch)?;
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(label = %self.label, change, primary = %primary, tick, "committed");
        self.publish(Commit {
            change,
            tick,
            primary,
            state: next,
            index_keys,
        });
        Ok(frozen)
    }

    /// Record a deterministic skip in the high-water mark.
    fn advance(&self, change: u64, frozen: bool) -> Result<(), KvError> {
        if frozen {
            return Ok(());
        }
        self.kv.write(vec![KvOp::Put {
            key: meta_hwm_key(),
            value: change.to_be_bytes().to_vec(),
        }])
    }

    fn publish(&self, commit: Commit<P::State>) {
        let mut subs = self
            .subs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.retain(|tx| tx.send(commit.clone()).is_ok());
    }
}

fn namespace_range(prefix: &[u8], range: &KeyRange) -> KeyRange {
    let with_prefix = |bound: &Option<Vec<u8>>| {
        bound.as_ref().map(|b| {
            let mut k = prefix.to_vec();
            k.extend_from_slice(b);
            k
        })
    };
    let mut out = KeyRange {
        gt: with_prefix(&range.gt),
        gte: with_prefix(&range.gte),
        lt: with_prefix(&range.lt),
        lte: with_prefix(&range.lte),
    };
    if out.gt.is_none() && out.gte.is_none() {
        out.gte = Some(prefix.to_vec());
    }
    if out.lt.is_none() && out.lte.is_none() {
        let mut upper = prefix.to_vec();
        upper.push(KEY_END);
        out.lt = Some(upper);
    }
    out
}

// ---------------------------------------------------------------------------
// Index read streams
// ---------------------------------------------------------------------------

/// Handle to one declared secondary index.
pub struct IndexHandle<P: Projection> {
    indexer: Arc<Indexer<P>>,
    pos: usize,
    name: &'static str,
}

impl<P: Projection> IndexHandle<P> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ordered read over the index.
    ///
    /// With `old`, existing entries are emitted first (snapshot order);
    /// with `live`, entries keep arriving as commits land in the range.
    /// The snapshot and the live tail are fenced by the same commit tick,
    /// so the hand-off neither drops nor duplicates an entry.
    pub fn read(
        &self,
        opts: ReadOptions,
    ) -> BoxStream<'static, Result<IndexEntry<P::State>, KvError>> {
        let indexer = Arc::clone(&self.indexer);
        let pos = self.pos;
        let range = opts.range();
        let rx = opts.live.then(|| indexer.subscribe());
        let want_rows = opts.old;
        let reverse = opts.reverse;
        Box::pin(async_stream::stream! {
            let (snapshot, fence) =
                match indexer.snapshot_index(pos, &range, reverse, want_rows) {
                    Ok(v) => v,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
            for entry in snapshot {
                yield Ok(entry);
            }
            if let Some(mut rx) = rx {
                while let Some(commit) = rx.recv().await {
                    if commit.tick <= fence {
                        continue;
                    }
                    let Some(key) = commit.index_keys[pos].clone() else {
                        continue;
                    };
                    if !range.contains(&key) {
                        continue;
                    }
                    yield Ok(IndexEntry { key, state: commit.state });
                }
            }
        })
    }
}
