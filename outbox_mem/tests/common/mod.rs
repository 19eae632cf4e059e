#![allow(dead_code)]

use outbox_core::{ManualClock, NewOutboxMessage, OutboxKey};
use outbox_mem::{
    InMemoryBatchFetcher, InMemoryLeaseStore, InMemoryOutboxConfig, InMemoryOutboxStore,
};
use std::sync::Arc;

pub struct Fixture {
    pub key: OutboxKey,
    pub store: InMemoryOutboxStore,
    pub leases: Arc<InMemoryLeaseStore>,
    pub clock: ManualClock,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            key: OutboxKey::new("memory", "orders"),
            store: InMemoryOutboxStore::new(),
            leases: Arc::new(InMemoryLeaseStore::new()),
            clock: ManualClock::default(),
        }
    }

    pub fn fetcher(&self, config: InMemoryOutboxConfig) -> InMemoryBatchFetcher {
        InMemoryBatchFetcher::new(
            &self.key,
            self.store.clone(),
            self.leases.clone(),
            Arc::new(self.clock.clone()),
            config,
        )
        .unwrap()
    }

    pub async fn seed(&self, count: usize) {
        for i in 0..count {
            self.store
                .insert(NewOutboxMessage::new("order.created", format!("order-{i}")))
                .await;
        }
    }
}

pub fn batch_of(size: usize) -> InMemoryOutboxConfig {
    InMemoryOutboxConfig {
        batch_size: size,
        ..Default::default()
    }
}

/// Lets spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}
