//! The message capability the engine works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// A message stored in an outbox.
///
/// The engine never looks inside a message: it only needs to identify it so the
/// provider can complete exactly the messages the broker accepted.
pub trait Message: Clone + Debug + Send + Sync + 'static {
    /// Provider specific identifier (`i64`, an object id...).
    type Id: Clone + Debug + Eq + Hash + Send + Sync + 'static;

    /// Returns the identifier of this message.
    fn id(&self) -> &Self::Id;
}

/// The message shape used by the bundled providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage<I> {
    /// Storage assigned identifier.
    pub id: I,
    /// Type tag used by consumers to route/deserialize the payload.
    pub message_type: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// When the application wrote the message.
    pub created_at: DateTime<Utc>,
    /// Serialized trace context captured when the message was written.
    pub trace_context: Option<Vec<u8>>,
    /// Set when the outbox completes messages by stamping them instead of deleting them.
    pub processed_at: Option<DateTime<Utc>>,
}

impl<I> Message for OutboxMessage<I>
where
    I: Clone + Debug + Eq + Hash + Send + Sync + 'static,
{
    type Id = I;

    fn id(&self) -> &I {
        &self.id
    }
}

/// A message as written by the application, before storage assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    /// Type tag.
    pub message_type: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Creation time. Defaults to now.
    pub created_at: DateTime<Utc>,
    /// Serialized trace context.
    pub trace_context: Option<Vec<u8>>,
}

impl NewOutboxMessage {
    /// Creates a new message stamped with the current time.
    pub fn new(message_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type: message_type.into(),
            payload: payload.into(),
            created_at: Utc::now(),
            trace_context: None,
        }
    }

    /// Overrides the creation time.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attaches a serialized trace context.
    pub fn trace_context(mut self, trace_context: impl Into<Vec<u8>>) -> Self {
        self.trace_context = Some(trace_context.into());
        self
    }
}

/// Collects the ids of `messages`.
pub fn ids_of<M: Message>(messages: &[M]) -> Vec<M::Id> {
    messages.iter().map(|m| m.id().clone()).collect()
}
