#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use outbox_core::prelude::*;
use outbox_core::{BoxError, EmptyBatch};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

pub type Msg = OutboxMessage<i64>;

pub fn msg(id: i64) -> Msg {
    OutboxMessage {
        id,
        message_type: "test".to_string(),
        payload: id.to_le_bytes().to_vec(),
        created_at: Utc::now(),
        trace_context: None,
        processed_at: None,
    }
}

/// Lets spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// A fake outbox table shared by the fetcher, its batches and the retrier.
#[derive(Default)]
pub struct Table {
    pub pending: Mutex<VecDeque<Msg>>,
    pub completed: Mutex<Vec<i64>>,
    pub fetches: AtomicUsize,
    pub complete_failures_left: AtomicUsize,
    pub retry_failures_left: AtomicUsize,
    pub retried: Mutex<Vec<i64>>,
}

impl Table {
    pub fn insert(&self, ids: impl IntoIterator<Item = i64>) {
        self.pending.lock().unwrap().extend(ids.into_iter().map(msg));
    }

    pub fn completed(&self) -> Vec<i64> {
        self.completed.lock().unwrap().clone()
    }

    fn remove(&self, ids: &[i64]) {
        self.pending.lock().unwrap().retain(|m| !ids.contains(&m.id));
        self.completed.lock().unwrap().extend_from_slice(ids);
    }
}

struct TableBatch {
    table: Arc<Table>,
    messages: Vec<Msg>,
}

#[async_trait]
impl BatchContext<Msg> for TableBatch {
    fn messages(&self) -> &[Msg] {
        &self.messages
    }

    async fn complete(&mut self, ok: &[Msg], _cancel: &CancellationToken) -> Result<(), OutboxError> {
        let left = self.table.complete_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.table
                .complete_failures_left
                .store(left - 1, Ordering::SeqCst);
            return Err(OutboxError::storage("completion failed"));
        }
        let ids: Vec<i64> = ok.iter().map(|m| m.id).collect();
        self.table.remove(&ids);
        Ok(())
    }

    async fn has_next(&mut self, _cancel: &CancellationToken) -> Result<bool, OutboxError> {
        Ok(!self.table.pending.lock().unwrap().is_empty())
    }

    async fn dispose(self: Box<Self>) {}
}

pub struct TableFetcher {
    pub table: Arc<Table>,
    pub batch_size: usize,
}

#[async_trait]
impl BatchFetcher<Msg> for TableFetcher {
    async fn fetch_and_hold(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn BatchContext<Msg>>, OutboxError> {
        self.table.fetches.fetch_add(1, Ordering::SeqCst);
        let messages: Vec<Msg> = self
            .table
            .pending
            .lock()
            .unwrap()
            .iter()
            .take(self.batch_size)
            .cloned()
            .collect();
        if messages.is_empty() {
            return Ok(EmptyBatch::boxed());
        }
        Ok(Box::new(TableBatch {
            table: self.table.clone(),
            messages,
        }))
    }
}

#[async_trait]
impl BatchCompleteRetrier<Msg> for Table {
    async fn retry_complete(
        &self,
        messages: &[Msg],
        _cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        let left = self.retry_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.retry_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(OutboxError::storage("completion retry failed"));
        }
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        self.retried.lock().unwrap().extend_from_slice(&ids);
        self.remove(&ids);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    /// Accepts only the first message of every batch.
    Partial,
    Fail,
    Panic,
}

/// Broker fake whose behaviour can be switched while the service runs.
pub struct Broker {
    pub mode: Mutex<Mode>,
    pub calls: AtomicUsize,
    pub produced: Mutex<Vec<i64>>,
}

impl Broker {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            produced: Mutex::new(vec![]),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchProducer<Msg> for Broker {
    async fn produce(
        &self,
        _key: &OutboxKey,
        messages: &[Msg],
        _cancel: &CancellationToken,
    ) -> Result<ProduceResult<Msg>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Accept => {
                self.produced
                    .lock()
                    .unwrap()
                    .extend(messages.iter().map(|m| m.id));
                Ok(ProduceResult::all(messages))
            }
            Mode::Partial => {
                let accepted: Vec<Msg> = messages.iter().take(1).cloned().collect();
                self.produced
                    .lock()
                    .unwrap()
                    .extend(accepted.iter().map(|m| m.id));
                Ok(ProduceResult::partial(accepted))
            }
            Mode::Fail => Err("broker unavailable".into()),
            Mode::Panic => panic!("broker client bug"),
        }
    }
}
