// relay-test-utils: In-memory peer mesh for integration testing.
//
// Provides a full mesh of in-process nodes implementing the engine's node
// contract: a content-addressed object store, an append-only change feed,
// message-envelope wrapping on send, and SQLite-backed KV namespaces in a
// per-mesh temp directory (so engine restarts find their durable state).

pub mod mesh;

use std::time::Duration;

pub use mesh::{Mesh, MeshNode, MemFeed};

/// Install the env-filtered log subscriber once per test process.
/// `RUST_LOG=debug` surfaces the engine's structured logs.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `check` every few milliseconds until it returns true or `timeout`
/// elapses. Returns whether the condition was met.
pub async fn wait_for<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
