//! Registry of outbox instances running in one process.

use crate::batch::{BatchCompleteRetrier, BatchFetcher, BatchProducer};
use crate::clock::{Clock, SystemClock};
use crate::config::PollingConfig;
use crate::error::OutboxError;
use crate::key::OutboxKey;
use crate::listener::{KeyedOutboxListener, OutboxListener, OutboxTrigger};
use crate::message::Message;
use crate::observer::{NoopObserver, OutboxObserver};
use crate::producer::PollingProducer;
use crate::retrier::CompletionRetrier;
use crate::service::PollingBackgroundService;
use log::{error, info};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Spawner = Box<dyn FnOnce(Arc<dyn OutboxListener>, CancellationToken) -> JoinHandle<()> + Send>;

struct Registration {
    key: OutboxKey,
    config: PollingConfig,
    spawn: Spawner,
}

/// Collects outbox instances and their collaborators, then validates everything at once.
///
/// ```rust,ignore
/// let host = OutboxHost::builder()
///     .add(key, fetcher, producer, retrier)
///     .build()?;
/// host.start();
/// // after committing an outbox row:
/// host.on_new_messages(&key)?;
/// host.shutdown().await;
/// ```
pub struct OutboxHostBuilder {
    config: PollingConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn OutboxObserver>,
    registrations: Vec<Registration>,
}

impl Default for OutboxHostBuilder {
    fn default() -> Self {
        Self {
            config: PollingConfig::default(),
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            registrations: Vec::new(),
        }
    }
}

impl OutboxHostBuilder {
    /// Polling configuration applied to instances added after this call.
    pub fn with_config(mut self, config: PollingConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock shared by instances added after this call.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observer shared by instances added after this call.
    pub fn with_observer(mut self, observer: Arc<dyn OutboxObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Registers one outbox instance.
    pub fn add<M: Message>(
        mut self,
        key: OutboxKey,
        fetcher: Arc<dyn BatchFetcher<M>>,
        producer: Arc<dyn BatchProducer<M>>,
        retrier: Arc<dyn BatchCompleteRetrier<M>>,
    ) -> Self {
        let config = self.config.clone();
        let clock = self.clock.clone();
        let observer = self.observer.clone();
        let service_key = key.clone();
        let service_config = config.clone();
        let spawn: Spawner = Box::new(move |listener, cancel| {
            let polling = PollingProducer::new(
                service_key.clone(),
                fetcher,
                producer,
                observer.clone(),
            );
            let retrier = CompletionRetrier::new(
                service_key,
                retrier,
                clock.clone(),
                service_config.completion_retry.clone(),
                observer.clone(),
            );
            let service = PollingBackgroundService::new(
                polling,
                retrier,
                listener,
                clock,
                observer,
                service_config,
            );
            tokio::spawn(service.run(cancel))
        });
        self.registrations.push(Registration { key, config, spawn });
        self
    }

    /// Validates the registrations and builds a host that is not yet running.
    pub fn build(self) -> Result<OutboxHost, OutboxError> {
        if self.registrations.is_empty() {
            return Err(OutboxError::configuration("no outbox registered"));
        }
        let mut keys = HashSet::new();
        for registration in &self.registrations {
            registration.config.validate()?;
            if !keys.insert(registration.key.clone()) {
                return Err(OutboxError::configuration(format!(
                    "outbox '{}' registered twice",
                    registration.key
                )));
            }
        }
        let listener = Arc::new(KeyedOutboxListener::new(keys));
        Ok(OutboxHost {
            listener,
            cancel: CancellationToken::new(),
            pending: self.registrations,
            tasks: HashMap::new(),
        })
    }
}

/// Runs one background task per registered outbox key.
pub struct OutboxHost {
    listener: Arc<KeyedOutboxListener>,
    cancel: CancellationToken,
    pending: Vec<Registration>,
    tasks: HashMap<OutboxKey, JoinHandle<()>>,
}

impl OutboxHost {
    /// Starts building a host.
    pub fn builder() -> OutboxHostBuilder {
        OutboxHostBuilder::default()
    }

    /// Spawns a task for every registered outbox. Must run inside a tokio runtime.
    /// Calling it again is a no-op.
    pub fn start(&mut self) {
        for registration in self.pending.drain(..) {
            info!("Starting outbox '{}'", registration.key);
            let listener: Arc<dyn OutboxListener> = self.listener.clone();
            let handle = (registration.spawn)(listener, self.cancel.child_token());
            self.tasks.insert(registration.key, handle);
        }
    }

    /// Wakes the poller of `key` right away.
    pub fn on_new_messages(&self, key: &OutboxKey) -> Result<(), OutboxError> {
        self.listener.on_new_messages(key)
    }

    /// A handle applications can keep to trigger outboxes.
    pub fn trigger(&self) -> Arc<dyn OutboxTrigger> {
        self.listener.clone()
    }

    /// Keys of the running instances.
    pub fn keys(&self) -> impl Iterator<Item = &OutboxKey> {
        self.tasks.keys()
    }

    /// Signals every task to stop and waits for in-flight cycles to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for (key, handle) in self.tasks.drain() {
            if let Err(e) = handle.await {
                error!("Outbox '{}': task ended abnormally: {}", key, e);
            }
        }
        info!("All outboxes stopped");
    }
}

impl Drop for OutboxHost {
    /// Stops the tasks of a host that was never shut down. Does not wait for them.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
