mod common;

use common::{Fixture, batch_of, settle};
use outbox_core::lock::LeaseStore;
use outbox_core::prelude::*;
use outbox_core::{Cleaner, Clock};
use outbox_mem::{InMemoryCleaner, InMemoryCompletionRetrier, InMemoryOutboxConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ids(messages: &[outbox_mem::InMemoryMessage]) -> Vec<u64> {
    messages.iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn drains_ten_messages_in_two_batches() {
    let fx = Fixture::new();
    fx.seed(10).await;
    let fetcher = fx.fetcher(batch_of(5));
    let cancel = CancellationToken::new();

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    assert_eq!(ids(batch.messages()), vec![1, 2, 3, 4, 5]);
    let messages = batch.messages().to_vec();
    batch.complete(&messages, &cancel).await.unwrap();
    assert!(batch.has_next(&cancel).await.unwrap());
    batch.dispose().await;

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    assert_eq!(ids(batch.messages()), vec![6, 7, 8, 9, 10]);
    let messages = batch.messages().to_vec();
    batch.complete(&messages, &cancel).await.unwrap();
    assert!(!batch.has_next(&cancel).await.unwrap());
    batch.dispose().await;

    assert_eq!(fx.store.pending_count().await, 0);
    assert!(fx.store.all().await.is_empty());
}

#[tokio::test]
async fn disposing_without_completion_loses_nothing() {
    let fx = Fixture::new();
    fx.seed(3).await;
    let fetcher = fx.fetcher(batch_of(5));
    let cancel = CancellationToken::new();

    let batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    assert_eq!(batch.messages().len(), 3);
    batch.dispose().await;

    assert_eq!(fx.store.pending_count().await, 3);
    assert!(fx.leases.get(fetcher.lock_id()).await.unwrap().is_none());
}

#[tokio::test]
async fn only_one_fetcher_holds_a_batch() {
    let fx = Fixture::new();
    fx.seed(4).await;
    let first = fx.fetcher(batch_of(2));
    let second = fx.fetcher(batch_of(2));
    let cancel = CancellationToken::new();

    let mut held = first.fetch_and_hold(&cancel).await.unwrap();
    assert_eq!(ids(held.messages()), vec![1, 2]);

    let contended = second.fetch_and_hold(&cancel).await.unwrap();
    assert!(contended.messages().is_empty());
    contended.dispose().await;

    let messages = held.messages().to_vec();
    held.complete(&messages, &cancel).await.unwrap();
    held.dispose().await;

    let next = second.fetch_and_hold(&cancel).await.unwrap();
    assert_eq!(ids(next.messages()), vec![3, 4]);
    next.dispose().await;
}

#[tokio::test]
async fn empty_outbox_releases_the_lock() {
    let fx = Fixture::new();
    let fetcher = fx.fetcher(batch_of(5));

    let batch = fetcher
        .fetch_and_hold(&CancellationToken::new())
        .await
        .unwrap();
    assert!(batch.messages().is_empty());
    assert!(fx.leases.get(fetcher.lock_id()).await.unwrap().is_none());
}

#[tokio::test]
async fn partial_completion_keeps_the_rest_pending() {
    let fx = Fixture::new();
    fx.seed(3).await;
    let fetcher = fx.fetcher(batch_of(5));
    let cancel = CancellationToken::new();

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    let first = batch.messages()[..1].to_vec();
    batch.complete(&first, &cancel).await.unwrap();
    batch.dispose().await;

    let left: Vec<u64> = fx.store.all().await.iter().map(|m| m.id).collect();
    assert_eq!(left, vec![2, 3]);
}

#[tokio::test]
async fn completion_mismatch_is_reported() {
    let fx = Fixture::new();
    fx.seed(3).await;
    let fetcher = fx.fetcher(batch_of(5));
    let cancel = CancellationToken::new();

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    let messages = batch.messages().to_vec();
    assert!(fx.store.remove(2).await);

    let result = batch.complete(&messages, &cancel).await;
    assert!(matches!(
        result,
        Err(OutboxError::CompletionMismatch {
            expected: 3,
            actual: 2
        })
    ));
    // The lease is released whatever the outcome.
    assert!(fx.leases.get(fetcher.lock_id()).await.unwrap().is_none());
    batch.dispose().await;
}

#[tokio::test]
async fn update_mode_stamps_and_cleaner_purges() {
    let fx = Fixture::new();
    fx.seed(2).await;
    let fetcher = fx.fetcher(InMemoryOutboxConfig {
        batch_size: 5,
        completion_mode: CompletionMode::Update,
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    let messages = batch.messages().to_vec();
    batch.complete(&messages, &cancel).await.unwrap();
    batch.dispose().await;

    let completed_at = fx.clock.now();
    let stored = fx.store.all().await;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|m| m.processed_at == Some(completed_at)));
    assert_eq!(fx.store.pending_count().await, 0);

    let cleaner = InMemoryCleaner::new(fx.store.clone(), Arc::new(fx.clock.clone()));
    let max_age = Duration::from_secs(3600);
    assert_eq!(cleaner.clean(max_age, &cancel).await.unwrap(), 0);

    fx.clock.advance(Duration::from_secs(3601));
    assert_eq!(cleaner.clean(max_age, &cancel).await.unwrap(), 2);
    assert!(fx.store.all().await.is_empty());
}

#[tokio::test]
async fn completing_after_losing_the_lease_fails() {
    let fx = Fixture::new();
    fx.seed(2).await;
    let fetcher = fx.fetcher(batch_of(5));
    let cancel = CancellationToken::new();

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    settle().await;

    // Someone whose clock says the lease expired takes it over.
    let far_future = fx.clock.now() + chrono::TimeDelta::hours(1);
    assert!(
        fx.leases
            .try_upsert(
                fetcher.lock_id(),
                "intruder",
                far_future,
                far_future + chrono::TimeDelta::hours(1)
            )
            .await
            .unwrap()
    );
    settle().await;

    let messages = batch.messages().to_vec();
    let result = batch.complete(&messages, &cancel).await;
    assert!(matches!(result, Err(OutboxError::LockLost(_))));
    assert_eq!(fx.store.pending_count().await, 2);
    // The intruder's lease is not ours to delete.
    assert_eq!(
        fx.leases
            .get(fetcher.lock_id())
            .await
            .unwrap()
            .unwrap()
            .owner,
        "intruder"
    );
}

#[tokio::test]
async fn retry_complete_is_idempotent() {
    let fx = Fixture::new();
    fx.seed(3).await;
    let fetcher = fx.fetcher(batch_of(5));
    let retrier = InMemoryCompletionRetrier::new(
        fx.store.clone(),
        Arc::new(fx.clock.clone()),
        &InMemoryOutboxConfig::default(),
    );
    let cancel = CancellationToken::new();

    let mut batch = fetcher.fetch_and_hold(&cancel).await.unwrap();
    let messages = batch.messages().to_vec();
    fx.store.fail_next_completions(1).await;
    assert!(matches!(
        batch.complete(&messages, &cancel).await,
        Err(OutboxError::Storage(_))
    ));
    batch.dispose().await;
    assert_eq!(fx.store.pending_count().await, 3);

    retrier.retry_complete(&messages, &cancel).await.unwrap();
    assert_eq!(fx.store.pending_count().await, 0);

    // Completing again is not an error.
    retrier.retry_complete(&messages, &cancel).await.unwrap();
}

#[tokio::test]
async fn retry_complete_surfaces_storage_failures() {
    let fx = Fixture::new();
    fx.seed(1).await;
    let retrier = InMemoryCompletionRetrier::new(
        fx.store.clone(),
        Arc::new(fx.clock.clone()),
        &InMemoryOutboxConfig::default(),
    );
    let cancel = CancellationToken::new();
    let messages = fx.store.all().await;

    fx.store.fail_next_completions(1).await;
    assert!(retrier.retry_complete(&messages, &cancel).await.is_err());
    assert_eq!(fx.store.pending_count().await, 1);
}
