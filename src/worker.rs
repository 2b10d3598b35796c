//! Delivery workers.
//!
//! A worker is handed one `(context, recipient, message)` triple per
//! invocation.  Workers must tolerate duplicate inputs: after a crash, a
//! message whose outbound wrapper was never observed on the feed is handed
//! out again.

use std::sync::Arc;

use async_trait::async_trait;

use relay_types::node::{NodeError, Sender};

/// One forwarding instruction.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub context: String,
    pub recipient: String,
    /// Address of the message to forward. Equal to `permalink` for
    /// immutable messages.
    pub link: String,
    pub permalink: String,
}

/// Pluggable delivery. Implementations may batch or delay, but must
/// resolve exactly once per invocation.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn deliver(&self, delivery: Delivery) -> Result<(), NodeError>;
}

/// Default worker: wrap and send through the node.
pub struct SendWorker {
    sender: Arc<dyn Sender>,
}

impl SendWorker {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        SendWorker { sender }
    }
}

#[async_trait]
impl Worker for SendWorker {
    async fn deliver(&self, delivery: Delivery) -> Result<(), NodeError> {
        self.sender.send(&delivery.link, &delivery.recipient).await
    }
}
