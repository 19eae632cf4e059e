//! Side-effect port for metrics and tracing.

use crate::key::OutboxKey;
use crate::producer::OutcomeKind;
use std::fmt;

/// Receives notifications about what the engine is doing.
///
/// Every method has an empty default, so implementations only override what they
/// export. Calls happen inline on the outbox task: keep them cheap.
///
/// ```rust,ignore
/// struct Metrics;
///
/// impl OutboxObserver for Metrics {
///     fn on_batch_produced(&self, key: &OutboxKey, produced: usize, fetched: usize) {
///         metrics::counter!("outbox_produced", produced as u64, "client" => key.client_key().to_owned());
///     }
/// }
/// ```
pub trait OutboxObserver: Send + Sync {
    /// A batch was claimed.
    fn on_batch_fetched(&self, _key: &OutboxKey, _count: usize) {}

    /// The broker accepted `produced` of the `fetched` messages.
    fn on_batch_produced(&self, _key: &OutboxKey, _produced: usize, _fetched: usize) {}

    /// A full drain cycle finished.
    fn on_cycle_completed(&self, _key: &OutboxKey, _outcome: OutcomeKind) {}

    /// The completion retrier attempted to complete `count` messages.
    fn on_completion_retry(&self, _key: &OutboxKey, _count: usize, _succeeded: bool) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl OutboxObserver for NoopObserver {}

impl fmt::Debug for dyn OutboxObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<observer>")
    }
}
