//! In-process broker.
//!
//! Every topic is an append-only log. Consumer groups track one offset per
//! topic, so subscribers sharing a group split the messages between them and
//! a new group starts from the earliest record. Offsets advance as soon as a
//! poll returns, matching an auto-committing consumer.
//!
//! Nothing is ever evicted: every payload stays in memory for the life of the
//! process. This backend is for tests and local development only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BlockingConsumer, BlockingProducer, DeliveryReceipt, Message, SettledReceipt};
use crate::error::{Error, Result};

/// Maximum records handed out by one poll
pub const MAX_POLL_RECORDS: usize = 500;

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<Vec<u8>>>,
    // (group, topic) -> next offset
    offsets: HashMap<(String, String), usize>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    arrived: Condvar,
    fail_sends: AtomicBool,
    failing_polls: AtomicUsize,
}

/// A process-local broker. Clones share the same logs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the logs intact
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a raw payload to any topic, known to the pipeline or not
    pub fn append(&self, topic: &str, payload: Vec<u8>) {
        self.lock()
            .logs
            .entry(topic.to_string())
            .or_default()
            .push(payload);
        self.shared.arrived.notify_all();
    }

    /// Join `group_id` on `topics`
    pub fn subscribe(&self, group_id: &str, topics: &[&str]) -> Arc<MemorySubscription> {
        Arc::new(MemorySubscription {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Every payload ever appended to `topic`
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock().logs.get(topic).cloned().unwrap_or_default()
    }

    /// Payloads of `topic` decoded as JSON strings; undecodable ones are skipped
    pub fn published_values(&self, topic: &str) -> Vec<String> {
        self.published(topic)
            .iter()
            .filter_map(|payload| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Make every following send fail until reset
    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` polls fail
    pub fn fail_next_polls(&self, count: usize) {
        self.shared.failing_polls.store(count, Ordering::SeqCst);
    }

    fn take_poll_failure(&self) -> bool {
        self.shared
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn drain(&self, state: &mut State, group_id: &str, topics: &[String]) -> Vec<Message> {
        let mut batch = Vec::new();
        for topic in topics {
            let Some(log) = state.logs.get(topic) else {
                continue;
            };
            let offset = state
                .offsets
                .entry((group_id.to_string(), topic.clone()))
                .or_insert(0);
            let room = MAX_POLL_RECORDS - batch.len();
            let end = log.len().min(*offset + room);
            for (position, payload) in log[*offset..end].iter().enumerate() {
                batch.push(
                    Message::new(topic.clone(), payload.clone())
                        .with_position(0, (*offset + position) as i64),
                );
            }
            *offset = end;
            if batch.len() == MAX_POLL_RECORDS {
                break;
            }
        }
        batch
    }
}

impl BlockingProducer for MemoryBroker {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<Box<dyn DeliveryReceipt>> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::broker(format!("send to {} rejected", topic)));
        }
        self.append(topic, payload);
        Ok(Box::new(SettledReceipt(Ok(()))))
    }
}

/// One member of a consumer group on a [`MemoryBroker`].
pub struct MemorySubscription {
    broker: MemoryBroker,
    group_id: String,
    topics: Vec<String>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MemorySubscription {
    /// How many times `close` was called
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl BlockingConsumer for MemorySubscription {
    fn poll(&self, timeout: Duration) -> Result<Vec<Message>> {
        if self.is_closed() {
            return Err(Error::broker("subscription is closed"));
        }
        if self.broker.take_poll_failure() {
            return Err(Error::broker("broker unreachable"));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock();
        loop {
            let batch = self.broker.drain(&mut state, &self.group_id, &self.topics);
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            state = self
                .broker
                .shared
                .arrived
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
