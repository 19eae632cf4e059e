//! Writes a few messages to an in-memory outbox and lets the host deliver them.
//!
//! Run with `RUST_LOG=debug cargo run --example hello-outbox`.

use async_trait::async_trait;
use log::info;
use outbox::mem::{InMemoryLeaseStore, InMemoryMessage, InMemoryOutboxConfig};
use outbox::prelude::*;
use outbox::{BoxError, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stands in for a Kafka/RabbitMQ client.
struct StdoutBroker;

#[async_trait]
impl BatchProducer<InMemoryMessage> for StdoutBroker {
    async fn produce(
        &self,
        key: &OutboxKey,
        messages: &[InMemoryMessage],
        _cancel: &CancellationToken,
    ) -> Result<ProduceResult<InMemoryMessage>, BoxError> {
        for message in messages {
            println!(
                "[{}] {} #{}: {}",
                key,
                message.message_type,
                message.id,
                String::from_utf8_lossy(&message.payload)
            );
        }
        Ok(ProduceResult::all(messages))
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let key = OutboxKey::new("memory", "orders");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = InMemoryOutboxStore::new();
    let config = InMemoryOutboxConfig {
        batch_size: 2,
        ..Default::default()
    };
    let fetcher = InMemoryBatchFetcher::new(
        &key,
        store.clone(),
        Arc::new(InMemoryLeaseStore::new()),
        clock.clone(),
        config.clone(),
    )?;
    let retrier = InMemoryCompletionRetrier::new(store.clone(), clock, &config);

    let mut host = OutboxHost::builder()
        .add::<InMemoryMessage>(
            key.clone(),
            Arc::new(fetcher),
            Arc::new(StdoutBroker),
            Arc::new(retrier),
        )
        .build()?;
    host.start();

    for order in 1..=5 {
        store
            .insert(NewOutboxMessage::new(
                "order.created",
                format!("{{\"order\":{order}}}"),
            ))
            .await;
    }
    // The application would do this right after committing its transaction.
    host.on_new_messages(&key)?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("{} messages left in the outbox", store.pending_count().await);
    host.shutdown().await;
    Ok(())
}
