use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::events::GatewayCommand;

/// Outcome delivered to whoever enqueued a command.
pub type AckResult = Result<serde_json::Value, CommandError>;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Upstream answered with an `error` frame.
    Rejected(serde_json::Value),
    /// The last attempt was never acknowledged.
    AckTimeout,
    /// Every send attempt failed.
    RetriesExhausted,
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Rejected(_) => "COMMAND_REJECTED",
            CommandError::AckTimeout => "ACK_TIMEOUT",
            CommandError::RetriesExhausted => "RETRIES_EXHAUSTED",
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Rejected(data) => write!(f, "command rejected upstream: {data}"),
            CommandError::AckTimeout => write!(f, "command was not acknowledged in time"),
            CommandError::RetriesExhausted => write!(f, "command retries exhausted"),
        }
    }
}

impl std::error::Error for CommandError {}

/// A command waiting to be sent or acknowledged.
#[derive(Debug)]
pub struct QueueItem {
    pub id: String,
    pub command: GatewayCommand,
    pub retry_count: u32,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Unix milliseconds.
    pub created_at: u64,
    seq: u64,
    not_before: Option<Instant>,
    ack: Option<oneshot::Sender<AckResult>>,
}

impl QueueItem {
    pub fn new(
        seq: u64,
        command: GatewayCommand,
        max_retries: u32,
        backoff_ms: u64,
        created_at: u64,
        ack: oneshot::Sender<AckResult>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
            retry_count: 0,
            max_retries,
            backoff_ms,
            created_at,
            seq,
            not_before: None,
            ack: Some(ack),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    /// Count a failed attempt. Returns `false` once retries are exhausted,
    /// otherwise delays the next attempt by `backoff_ms * retry_count`.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count >= self.max_retries {
            return false;
        }
        let delay = self.backoff_ms.saturating_mul(u64::from(self.retry_count));
        self.not_before = Some(now + Duration::from_millis(delay));
        true
    }

    /// Complete the ack future. Receivers that were dropped are ignored.
    pub fn resolve(mut self, result: AckResult) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug)]
pub enum Popped {
    Empty,
    /// The head item is backing off until this instant.
    Waiting(Instant),
    Ready(QueueItem),
}

/// Bounded FIFO of outbound commands. Only [`CommandQueue::try_push`]
/// enforces the bound; retries go back to the head regardless of size.
#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<QueueItem>,
    max_size: usize,
}

impl CommandQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    /// Append at the tail, handing the item back when the queue is full.
    pub fn try_push(&mut self, item: QueueItem) -> Result<(), QueueItem> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn push_front(&mut self, item: QueueItem) {
        self.items.push_front(item);
    }

    /// Put previously dequeued items back at the head, oldest first.
    pub fn requeue_front(&mut self, mut items: Vec<QueueItem>) {
        items.sort_by_key(|item| std::cmp::Reverse(item.seq));
        for item in items {
            self.items.push_front(item);
        }
    }

    pub fn pop_ready(&mut self, now: Instant) -> Popped {
        match self.items.front() {
            None => Popped::Empty,
            Some(head) if !head.is_ready(now) => match head.not_before {
                Some(at) => Popped::Waiting(at),
                None => Popped::Empty,
            },
            Some(_) => match self.items.pop_front() {
                Some(item) => Popped::Ready(item),
                None => Popped::Empty,
            },
        }
    }
}
