//! In-process wake-ups letting producers skip the rest of a polling interval.
//!
//! Each gate is edge triggered: a signal that arrives while nobody waits is remembered,
//! but only once, so the next wait returns immediately and the one after blocks again.

use crate::error::OutboxError;
use crate::key::OutboxKey;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The waiting side, used by background services.
#[async_trait]
pub trait OutboxListener: Send + Sync {
    /// Waits until `key` is signalled or `cancel` fires.
    async fn wait_for_messages(
        &self,
        key: &OutboxKey,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError>;
}

/// The signalling side, called by the application right after committing new messages.
pub trait OutboxTrigger: Send + Sync {
    /// Wakes the poller of `key`.
    fn on_new_messages(&self, key: &OutboxKey) -> Result<(), OutboxError>;
}

async fn wait_on(gate: &Notify, cancel: &CancellationToken) -> Result<(), OutboxError> {
    tokio::select! {
        biased;
        _ = gate.notified() => Ok(()),
        _ = cancel.cancelled() => Err(OutboxError::Cancelled),
    }
}

/// Listener for a process that runs a single outbox.
#[derive(Debug, Default)]
pub struct SingleOutboxListener {
    gate: Notify,
}

impl SingleOutboxListener {
    /// Creates a listener with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the waiter, or arms the next wait if nobody is waiting.
    pub fn on_new_messages(&self) {
        self.gate.notify_one();
    }

    /// Waits for a signal.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), OutboxError> {
        wait_on(&self.gate, cancel).await
    }
}

#[async_trait]
impl OutboxListener for SingleOutboxListener {
    async fn wait_for_messages(
        &self,
        _key: &OutboxKey,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        self.wait(cancel).await
    }
}

impl OutboxTrigger for SingleOutboxListener {
    fn on_new_messages(&self, _key: &OutboxKey) -> Result<(), OutboxError> {
        SingleOutboxListener::on_new_messages(self);
        Ok(())
    }
}

/// One independent gate per outbox key, fixed at construction.
#[derive(Debug)]
pub struct KeyedOutboxListener {
    gates: HashMap<OutboxKey, Notify>,
}

impl KeyedOutboxListener {
    /// Creates a gate for each key.
    pub fn new(keys: impl IntoIterator<Item = OutboxKey>) -> Self {
        Self {
            gates: keys.into_iter().map(|key| (key, Notify::new())).collect(),
        }
    }

    fn gate(&self, key: &OutboxKey) -> Result<&Notify, OutboxError> {
        self.gates
            .get(key)
            .ok_or_else(|| OutboxError::UnknownKey(key.clone()))
    }

    /// The keys this listener was built with.
    pub fn keys(&self) -> impl Iterator<Item = &OutboxKey> {
        self.gates.keys()
    }
}

#[async_trait]
impl OutboxListener for KeyedOutboxListener {
    async fn wait_for_messages(
        &self,
        key: &OutboxKey,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        wait_on(self.gate(key)?, cancel).await
    }
}

impl OutboxTrigger for KeyedOutboxListener {
    fn on_new_messages(&self, key: &OutboxKey) -> Result<(), OutboxError> {
        self.gate(key)?.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(client: &str) -> OutboxKey {
        OutboxKey::new("test", client)
    }

    async fn returns_within(
        listener: &KeyedOutboxListener,
        key: &OutboxKey,
        ms: u64,
    ) -> bool {
        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_millis(ms),
            listener.wait_for_messages(key, &cancel),
        )
        .await
        .is_ok()
    }

    #[tokio::test(start_paused = true)]
    async fn signal_before_wait_is_remembered_once() {
        let listener = KeyedOutboxListener::new([key("a")]);
        listener.on_new_messages(&key("a")).unwrap();
        listener.on_new_messages(&key("a")).unwrap();

        assert!(returns_within(&listener, &key("a"), 10).await);
        assert!(!returns_within(&listener, &key("a"), 10).await);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let listener = KeyedOutboxListener::new([key("a"), key("b")]);
        listener.on_new_messages(&key("a")).unwrap();
        assert!(!returns_within(&listener, &key("b"), 10).await);
        assert!(returns_within(&listener, &key("a"), 10).await);
    }

    #[tokio::test]
    async fn unknown_key_is_a_configuration_error() {
        let listener = KeyedOutboxListener::new([key("a")]);
        assert!(matches!(
            listener.on_new_messages(&key("nope")),
            Err(OutboxError::UnknownKey(k)) if k == key("nope")
        ));
        let cancel = CancellationToken::new();
        assert!(matches!(
            listener.wait_for_messages(&key("nope"), &cancel).await,
            Err(OutboxError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn signal_wakes_a_sleeping_waiter() {
        let listener = std::sync::Arc::new(SingleOutboxListener::new());
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait(&CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        listener.on_new_messages();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let listener = SingleOutboxListener::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            listener.wait(&cancel).await,
            Err(OutboxError::Cancelled)
        ));
    }
}
