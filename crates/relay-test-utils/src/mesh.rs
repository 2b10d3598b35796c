//! The in-memory peer mesh.
//!
//! Every node logs each object it observes exactly once (the store is
//! content-addressed), appends a `newobj` entry to its own feed, and keeps
//! the resolved body for keeper lookups.  Delivering a message wrapper logs
//! the wrapped inner message first, so metadata lookups for the inner
//! object always succeed by the time the wrapper's entry is processed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use relay_index::SqliteKv;
use relay_types::entry::{
    ChangeEntry, ObjectInfo, ObjectRecord, ObjectValue, Payload, MESSAGE_TYPE, TYPE_FIELD,
};
use relay_types::kv::Kv;
use relay_types::node::{Feed, Keeper, Node, NodeError, Objects, Sender};

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

type Registry = Arc<Mutex<HashMap<String, Arc<MeshNode>>>>;

/// A full mesh of in-process nodes sharing one temp directory.
pub struct Mesh {
    dir: tempfile::TempDir,
    registry: Registry,
}

impl Mesh {
    pub fn new() -> std::io::Result<Mesh> {
        Ok(Mesh {
            dir: tempfile::tempdir()?,
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create (or fetch) the node named `name`. All mesh nodes are
    /// mutually connected.
    pub fn node(&self, name: &str) -> Arc<MeshNode> {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(node) = registry.get(name) {
            return Arc::clone(node);
        }
        let node = Arc::new(MeshNode::new(
            name,
            self.dir.path().join(name),
            Arc::clone(&self.registry),
        ));
        registry.insert(name.to_owned(), Arc::clone(&node));
        node
    }
}

// ---------------------------------------------------------------------------
// MeshNode
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    /// permalink -> resolved body (keeper).
    bodies: HashMap<String, Value>,
    /// link -> indexed record with its feed index (metadata store).
    records: HashMap<String, ObjectRecord>,
}

/// One in-process peer.
pub struct MeshNode {
    name: String,
    home: PathBuf,
    feed: Arc<MemFeed>,
    store: Arc<Mutex<StoreInner>>,
    registry: Registry,
    /// Uniquifies envelopes so repeated sends are distinct objects.
    envelope_counter: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl MeshNode {
    fn new(name: &str, home: PathBuf, registry: Registry) -> MeshNode {
        let (shutdown_tx, _) = watch::channel(false);
        MeshNode {
            name: name.to_owned(),
            home,
            feed: Arc::new(MemFeed::default()),
            store: Arc::new(Mutex::new(StoreInner::default())),
            registry,
            envelope_counter: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Compose a message envelope around `payload`, log it, and deliver it
    /// to `to`. Returns the envelope as observed on this node's feed.
    pub async fn send_message(
        &self,
        to: &str,
        payload: Value,
        context: Option<&str>,
    ) -> Result<ObjectValue, NodeError> {
        let mut body = json!({
            TYPE_FIELD: MESSAGE_TYPE,
            "author": self.name,
            "recipient": to,
            "n": self.envelope_counter.fetch_add(1, Ordering::Relaxed),
            "object": payload,
        });
        if let Some(ctx) = context {
            body["context"] = json!(ctx);
        }
        let value = self.observe(body.clone()).await?;
        self.deliver(to, body).await?;
        Ok(value)
    }

    /// Wrap the previously observed message at `link` and send the wrapper
    /// to `recipient`. This is the node-level delivery primitive the
    /// engine's default worker uses.
    pub async fn forward(&self, link: &str, recipient: &str) -> Result<(), NodeError> {
        let inner_body = {
            let store = self
                .store
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let record = store
                .records
                .get(link)
                .ok_or_else(|| NodeError::Lookup(format!("no object at {link}")))?;
            record
                .value
                .object
                .clone()
                .ok_or_else(|| NodeError::Lookup(format!("no body for {link}")))?
        };
        let wrapper = json!({
            TYPE_FIELD: MESSAGE_TYPE,
            "author": self.name,
            "recipient": recipient,
            "n": self.envelope_counter.fetch_add(1, Ordering::Relaxed),
            "object": inner_body,
        });
        self.observe(wrapper.clone()).await?;
        self.deliver(recipient, wrapper).await?;
        Ok(())
    }

    /// Log a message envelope on this node, innermost wrapped message
    /// first. Already-observed objects are not logged again.
    pub async fn observe(&self, body: Value) -> Result<ObjectValue, NodeError> {
        let mut chain = vec![body];
        loop {
            let inner = chain
                .last()
                .and_then(|b| b.get("object"))
                .cloned()
                .unwrap_or(Value::Null);
            if inner.get(TYPE_FIELD).and_then(Value::as_str) == Some(MESSAGE_TYPE) {
                chain.push(inner);
            } else {
                break;
            }
        }
        let mut observed = None;
        for body in chain.into_iter().rev() {
            observed = Some(self.log_one(body).await?);
        }
        observed.ok_or_else(|| NodeError::Lookup("empty envelope chain".to_owned()))
    }

    async fn log_one(&self, body: Value) -> Result<ObjectValue, NodeError> {
        let permalink = permalink_of(&body);
        {
            let store = self
                .store
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(record) = store.records.get(&permalink) {
                return Ok(record.value.clone());
            }
        }

        let inner = body.get("object").cloned().unwrap_or(Value::Null);
        let inner_permalink = permalink_of(&inner);
        let objectinfo = ObjectInfo {
            object_type: inner
                .get(TYPE_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            permalink: inner_permalink.clone(),
            link: inner_permalink.clone(),
            entry: None,
        };
        let value = ObjectValue {
            object_type: body
                .get(TYPE_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            permalink: permalink.clone(),
            link: permalink.clone(),
            author: body
                .get("author")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            recipient: body
                .get("recipient")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            objectinfo: Some(Box::new(objectinfo)),
            object: None,
        };

        // Bodies must be resolvable before the feed entry is visible.
        {
            let mut store = self
                .store
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            store.bodies.entry(permalink.clone()).or_insert(body.clone());
            store.bodies.entry(inner_permalink).or_insert(inner);
        }

        let change = self.feed.append(Payload::NewObj(value.clone())).await?;
        debug!(node = %self.name, change, permalink = %permalink, "object observed");

        let mut hydrated = value.clone();
        hydrated.object = Some(body);
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        store
            .records
            .entry(value.link.clone())
            .or_insert(ObjectRecord {
                change,
                value: hydrated,
            });
        Ok(value)
    }

    async fn deliver(&self, to: &str, body: Value) -> Result<(), NodeError> {
        let peer = {
            let registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.get(to).cloned()
        };
        let peer = peer.ok_or_else(|| NodeError::Delivery(format!("unknown peer {to}")))?;
        peer.observe(body).await?;
        Ok(())
    }

    /// Trigger the node's shutdown signal.
    pub fn destroy(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Snapshot of this node's feed, for assertions.
    pub fn observed_entries(&self) -> Vec<ChangeEntry> {
        self.feed.entries()
    }

    /// Resolved body for a permalink, if stored.
    pub fn body(&self, permalink: &str) -> Option<Value> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        store.bodies.get(permalink).cloned()
    }

    /// Indexed record for a link, if observed.
    pub fn record(&self, link: &str) -> Option<ObjectRecord> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        store.records.get(link).cloned()
    }

    /// Wrappers this node has received around the message at `inner_link`.
    pub fn wrappers_of(&self, inner_link: &str) -> Vec<ObjectValue> {
        self.observed_entries()
            .into_iter()
            .filter_map(|entry| match entry.value {
                Payload::NewObj(value) => Some(value),
                _ => None,
            })
            .filter(|value| {
                value
                    .objectinfo
                    .as_deref()
                    .is_some_and(|info| info.object_type == MESSAGE_TYPE && info.link == inner_link)
            })
            .collect()
    }

    /// Delete a KV namespace from disk, including its WAL sidecars. Only
    /// meaningful while no engine holds it open.
    pub fn wipe_db(&self, name: &str) -> std::io::Result<()> {
        let path = self.db_path(name);
        for suffix in ["", "-wal", "-shm"] {
            let mut target = path.clone().into_os_string();
            target.push(suffix);
            let target = PathBuf::from(target);
            if target.exists() {
                std::fs::remove_file(target)?;
            }
        }
        Ok(())
    }

    /// On-disk path of a KV namespace.
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.home.join(format!("{name}.sqlite"))
    }
}

impl MeshNode {
    /// This node's own entry in the mesh registry, by which `Arc<MeshNode>`
    /// handles are recovered from `&self` for the `Node` trait methods
    /// below (orphan rules forbid implementing the foreign `Node` trait
    /// directly for the foreign `Arc<MeshNode>`).
    fn self_arc(&self) -> Arc<MeshNode> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&self.name)
            .cloned()
            .expect("node is registered in its own mesh")
    }
}

impl Node for MeshNode {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn shortlink(&self) -> String {
        self.name.clone()
    }

    fn feed(&self) -> Arc<dyn Feed> {
        Arc::clone(&self.feed) as Arc<dyn Feed>
    }

    fn keeper(&self) -> Arc<dyn Keeper> {
        Arc::new(NodeHandle(self.self_arc()))
    }

    fn objects(&self) -> Arc<dyn Objects> {
        Arc::new(NodeHandle(self.self_arc()))
    }

    fn sender(&self) -> Arc<dyn Sender> {
        Arc::new(NodeHandle(self.self_arc()))
    }

    fn create_db(&self, name: &str) -> Result<Arc<dyn Kv>, NodeError> {
        std::fs::create_dir_all(&self.home).map_err(|e| NodeError::Lookup(e.to_string()))?;
        let kv = SqliteKv::open(&self.db_path(name))?;
        Ok(Arc::new(kv))
    }

    fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Service adapter handing the node's store and delivery out as the
/// engine-facing contracts.
struct NodeHandle(Arc<MeshNode>);

#[async_trait]
impl Keeper for NodeHandle {
    async fn get(&self, permalink: &str) -> Result<Option<Value>, NodeError> {
        Ok(self.0.body(permalink))
    }
}

#[async_trait]
impl Objects for NodeHandle {
    async fn get(&self, link: &str) -> Result<Option<ObjectRecord>, NodeError> {
        Ok(self.0.record(link))
    }
}

#[async_trait]
impl Sender for NodeHandle {
    async fn send(&self, link: &str, recipient: &str) -> Result<(), NodeError> {
        self.0.forward(link, recipient).await
    }
}

fn permalink_of(body: &Value) -> String {
    // serde_json maps are sorted, so serialization is canonical.
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// MemFeed
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FeedInner {
    entries: Vec<ChangeEntry>,
    subs: Vec<mpsc::UnboundedSender<ChangeEntry>>,
}

/// In-memory append-only change feed. Indices start at 1.
#[derive(Default)]
pub struct MemFeed {
    inner: Mutex<FeedInner>,
}

impl MemFeed {
    pub fn entries(&self) -> Vec<ChangeEntry> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .clone()
    }
}

#[async_trait]
impl Feed for MemFeed {
    async fn append(&self, value: Payload) -> Result<u64, NodeError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let change = inner.entries.len() as u64 + 1;
        let entry = ChangeEntry { change, value };
        inner.entries.push(entry.clone());
        inner.subs.retain(|tx| tx.send(entry.clone()).is_ok());
        Ok(change)
    }

    fn tail(&self, from: u64) -> BoxStream<'static, ChangeEntry> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Register and snapshot under one lock so no entry is dropped or
        // duplicated across the hand-off.
        let backlog: Vec<ChangeEntry> = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.subs.push(tx);
            inner
                .entries
                .iter()
                .filter(|e| e.change >= from)
                .cloned()
                .collect()
        };
        Box::pin(async_stream::stream! {
            for entry in backlog {
                yield entry;
            }
            while let Some(entry) = rx.recv().await {
                if entry.change >= from {
                    yield entry;
                }
            }
        })
    }
}
