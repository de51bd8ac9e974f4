//! In-process broker.
//!
//! Topics are plain FIFO queues. Received messages stay in flight until
//! acknowledged; published messages land on their topic like any other, so a
//! test can play both requester and worker against one instance.

use jsexec_common::Headers;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, InboundMessage, OutboundMessage, Receipt};
use crate::error::{AdapterError, Result};

/// A message sitting on a [`MemoryBroker`] topic.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Set for published messages.
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, VecDeque<StoredMessage>>,
    in_flight: HashMap<Receipt, (String, StoredMessage)>,
    provisioned: HashSet<String>,
    published: usize,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    next_receipt: AtomicU64,
    failing_publishes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a raw message on `topic`.
    pub fn push(&self, topic: &str, payload: Vec<u8>, headers: Headers) {
        self.enqueue(
            topic,
            StoredMessage {
                key: None,
                payload,
                headers,
            },
        );
    }

    /// Removes and returns everything currently queued on `topic`.
    pub fn take(&self, topic: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .topics
            .get_mut(topic)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Waits until `topic` holds at least `count` messages, then takes them
    /// all. Returns whatever is there once `timeout` expires.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> Vec<StoredMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.queued(topic) >= count {
                return self.take(topic);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(topic);
            }
        }
    }

    pub fn queued(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map_or(0, VecDeque::len)
    }

    /// Messages received but not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Total messages accepted by `publish`.
    pub fn published_count(&self) -> usize {
        self.state.lock().published
    }

    pub fn is_provisioned(&self, topic: &str) -> bool {
        self.state.lock().provisioned.contains(topic)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes the next `count` calls to `publish` fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Puts every unacknowledged message back at the front of its topic, as a
    /// broker does when a consumer goes away.
    pub fn redeliver_unacked(&self) -> usize {
        let mut state = self.state.lock();
        let mut receipts: Vec<Receipt> = state.in_flight.keys().copied().collect();
        receipts.sort_unstable_by(|a, b| b.cmp(a));

        let count = receipts.len();
        for receipt in receipts {
            if let Some((topic, message)) = state.in_flight.remove(&receipt) {
                state.topics.entry(topic).or_default().push_front(message);
            }
        }
        drop(state);
        self.notify.notify_waiters();
        count
    }

    fn enqueue(&self, topic: &str, message: StoredMessage) {
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AdapterError::Closed);
        }
        Ok(())
    }

    fn try_receive(&self, topic: &str, max: usize) -> Vec<InboundMessage> {
        let mut state = self.state.lock();
        let mut batch = Vec::new();

        while batch.len() < max {
            let Some(message) = state.topics.get_mut(topic).and_then(VecDeque::pop_front) else {
                break;
            };
            let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed);
            batch.push(InboundMessage {
                payload: message.payload.clone(),
                headers: message.headers.clone(),
                receipt,
            });
            state.in_flight.insert(receipt, (topic.to_string(), message));
        }
        batch
    }
}

impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.topics.entry(topic.to_string()).or_default();
        state.provisioned.insert(topic.to_string());
        Ok(())
    }

    async fn receive(&self, topic: &str, max: usize, wait: Duration) -> Result<Vec<InboundMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_open()?;
            let batch = self.try_receive(topic, max.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, _topic: &str, receipts: &[Receipt]) -> Result<()> {
        let mut state = self.state.lock();
        for receipt in receipts {
            if state.in_flight.remove(receipt).is_none() {
                return Err(AdapterError::Ack(format!("unknown receipt {}", receipt)));
            }
        }
        Ok(())
    }

    async fn publish(&self, messages: &[OutboundMessage]) -> Result<()> {
        self.check_open()?;
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AdapterError::Send("injected publish failure".into()));
        }

        {
            let mut state = self.state.lock();
            for message in messages {
                state
                    .topics
                    .entry(message.topic.clone())
                    .or_default()
                    .push_back(StoredMessage {
                        key: Some(message.key.clone()),
                        payload: message.payload.clone(),
                        headers: message.headers.clone(),
                    });
            }
            state.published += messages.len();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}
