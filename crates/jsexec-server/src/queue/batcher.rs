//! Outbound batching shared by every broker kind.
//!
//! Sends are queued and published by one background task, either when
//! `batch_size` messages are waiting or when the oldest has waited `linger`.
//! A batch the broker rejects goes back to the front of the queue and is
//! retried after a short pause.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use super::{Broker, OutboundMessage};
use crate::error::{AdapterError, Result};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const DRAIN_ATTEMPTS: usize = 3;

pub(crate) struct Batcher<B: Broker> {
    broker: Arc<B>,
    pending: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    batch_size: usize,
    linger: Duration,
    closed: AtomicBool,
}

impl<B: Broker> Batcher<B> {
    pub(crate) fn new(broker: Arc<B>, batch_size: usize, linger: Duration) -> Self {
        Self {
            broker,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            batch_size: batch_size.max(1),
            linger,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn enqueue(&self, message: OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdapterError::Closed);
        }
        let len = {
            let mut pending = self.pending.lock();
            pending.push_back(message);
            pending.len()
        };
        // Wake the flusher when a batch starts and again when it fills up
        if len == 1 || len >= self.batch_size {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Refuses further sends. Already queued messages stay queued.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Flush loop. Runs until `shutdown` flips, then drains what is left.
    pub(crate) async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => break,
            }

            if !self.linger.is_zero() && self.pending() < self.batch_size {
                tokio::select! {
                    _ = tokio::time::sleep(self.linger) => {}
                    _ = self.notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }

            if let Err(e) = self.flush().await {
                tracing::warn!(
                    pending = self.pending(),
                    "Publishing response batch failed, will retry: {}",
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_BACKOFF) => self.notify.notify_one(),
                    _ = shutdown.changed() => break,
                }
            }
        }

        self.drain().await;
    }

    /// Publishes everything queued, one batch at a time.
    pub(crate) async fn flush(&self) -> Result<()> {
        loop {
            let batch: Vec<OutboundMessage> = {
                let mut pending = self.pending.lock();
                let n = pending.len().min(self.batch_size);
                pending.drain(..n).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }

            if let Err(e) = self.broker.publish(&batch).await {
                let mut pending = self.pending.lock();
                for message in batch.into_iter().rev() {
                    pending.push_front(message);
                }
                return Err(e);
            }
            tracing::trace!(count = batch.len(), "Published response batch");
        }
    }

    /// Stops accepting sends and makes a last attempt at flushing.
    async fn drain(&self) {
        self.close();

        for attempt in 1..=DRAIN_ATTEMPTS {
            match self.flush().await {
                Ok(()) => return,
                Err(e) if attempt < DRAIN_ATTEMPTS => {
                    tracing::warn!("Final flush attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => {
                    tracing::error!(
                        dropped = self.pending(),
                        "Giving up on pending responses at shutdown: {}",
                        e
                    );
                }
            }
        }
    }
}
