//! Shared helpers for the integration tests.
#![allow(dead_code)]

use bandstand_crdt::{DocName, Replica};
use std::time::Duration;

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Lets spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn song(id: &str) -> Replica {
    Replica::new(DocName::song(id).unwrap())
}
