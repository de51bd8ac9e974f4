use jsexec_common::Headers;
use jsexec_metrics::ProcessorStats;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::batcher::Batcher;
use super::{AckMode, BackendProfile, Broker, InboundMessage, OutboundMessage, Receipt};
use crate::cache::ScriptCache;
use crate::error::{AdapterError, Result};
use crate::processor::{Disposition, ProcessorConfig, RequestProcessor, ResponseSink};
use crate::runtime::Engine;

/// Receive-side settings of a [`QueueAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub request_topic: String,
    pub profile: BackendProfile,
    /// Longest a receive call waits for messages before checking shutdown.
    pub poll_interval: Duration,
    /// Concurrent receive loops.
    pub consumers: usize,
}

/// [`ResponseSink`] that hands responses to the outbound batcher.
pub struct AdapterSink<B: Broker> {
    batcher: Arc<Batcher<B>>,
}

impl<B: Broker> ResponseSink for AdapterSink<B> {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>, headers: Headers) -> Result<()> {
        self.batcher.enqueue(OutboundMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            headers,
        })
    }
}

type Processor<B, E> = RequestProcessor<E, AdapterSink<B>>;

/// Connects a [`Broker`] to a [`RequestProcessor`].
///
/// Lifecycle: [`init`](Self::init) connects, provisions the request topic and
/// starts the receive loops and the outbound batcher;
/// [`destroy`](Self::destroy) stops receiving, lets in-flight messages finish,
/// flushes outstanding responses and closes the broker. A non-retryable broker error is published through
/// [`wait_fatal`](Self::wait_fatal) so the owner can run the same teardown.
pub struct QueueAdapter<B: Broker, E: Engine> {
    broker: Arc<B>,
    config: AdapterConfig,
    processor: Arc<Processor<B, E>>,
    batcher: Arc<Batcher<B>>,
    shutdown: watch::Sender<bool>,
    flush_shutdown: watch::Sender<bool>,
    fatal: Arc<watch::Sender<Option<String>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl<B: Broker, E: Engine> QueueAdapter<B, E> {
    pub fn new(
        broker: Arc<B>,
        cache: Arc<ScriptCache<E>>,
        stats: ProcessorStats,
        config: AdapterConfig,
        processor_config: ProcessorConfig,
    ) -> Self {
        let batcher = Arc::new(Batcher::new(
            broker.clone(),
            config.profile.send_batch_size,
            config.profile.linger,
        ));
        let sink = AdapterSink {
            batcher: batcher.clone(),
        };
        let processor = Arc::new(RequestProcessor::new(cache, sink, stats, processor_config));

        Self {
            broker,
            config,
            processor,
            batcher,
            shutdown: watch::channel(false).0,
            flush_shutdown: watch::channel(false).0,
            fatal: Arc::new(watch::channel(None).0),
            consumers: Mutex::new(Vec::new()),
            flusher: Mutex::new(None),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn processor(&self) -> &Arc<Processor<B, E>> {
        &self.processor
    }

    pub fn stats(&self) -> &ProcessorStats {
        self.processor.stats()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Connects to the broker and starts consuming.
    pub async fn init(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.broker.connect().await?;
        if self.config.profile.provision_topic {
            self.broker
                .ensure_topic(&self.config.request_topic)
                .await
                .map_err(|e| AdapterError::Provision {
                    topic: self.config.request_topic.clone(),
                    reason: e.to_string(),
                })?;
        }

        let batcher = self.batcher.clone();
        let shutdown = self.flush_shutdown.subscribe();
        *self.flusher.lock() = Some(tokio::spawn(async move { batcher.run(shutdown).await }));

        let consumers = self.config.consumers.max(1);
        let mut handles = Vec::with_capacity(consumers);
        for index in 0..consumers {
            let consumer = Consumer {
                index,
                broker: self.broker.clone(),
                processor: self.processor.clone(),
                topic: self.config.request_topic.clone(),
                profile: self.config.profile.clone(),
                poll_interval: self.config.poll_interval,
                fatal: self.fatal.clone(),
            };
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move { consumer.run(shutdown).await }));
        }
        self.consumers.lock().extend(handles);

        tracing::info!(
            topic = %self.config.request_topic,
            consumers,
            receive_batch = self.config.profile.receive_batch_size,
            send_batch = self.config.profile.send_batch_size,
            linger_ms = self.config.profile.linger.as_millis() as u64,
            "Queue adapter started"
        );
        Ok(())
    }

    /// Hands a response to the outbound batcher.
    pub async fn send(&self, topic: &str, key: &str, payload: Vec<u8>, headers: Headers) -> Result<()> {
        self.processor.sink().send(topic, key, payload, headers).await
    }

    /// Stops the receive loops, flushes pending responses and closes the
    /// broker. Safe to call more than once; later calls return immediately.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down queue adapter");
        self.shutdown.send_replace(true);

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for handle in consumers {
            if let Err(e) = handle.await {
                tracing::error!("Receive loop ended abnormally: {}", e);
            }
        }

        // Only once no consumer can produce another response
        self.flush_shutdown.send_replace(true);
        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                tracing::error!("Response flusher ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.broker.close().await {
            tracing::warn!("Failed to close broker: {}", e);
        }
        tracing::info!("Queue adapter stopped");
    }

    /// Resolves with the reason once a receive loop hits a non-retryable
    /// broker error. Never resolves otherwise.
    pub async fn wait_fatal(&self) -> String {
        let mut fatal = self.fatal.subscribe();
        loop {
            if let Some(reason) = fatal.borrow_and_update().clone() {
                return reason;
            }
            if fatal.changed().await.is_err() {
                return std::future::pending::<String>().await;
            }
        }
    }
}

struct Consumer<B: Broker, E: Engine> {
    index: usize,
    broker: Arc<B>,
    processor: Arc<Processor<B, E>>,
    topic: String,
    profile: BackendProfile,
    poll_interval: Duration,
    fatal: Arc<watch::Sender<Option<String>>>,
}

impl<B: Broker, E: Engine> Consumer<B, E> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(consumer = self.index, topic = %self.topic, "Receive loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                received = self.broker.receive(&self.topic, self.profile.receive_batch_size, self.poll_interval) => received,
                _ = shutdown.changed() => break,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(AdapterError::Closed) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!(consumer = self.index, "Fatal broker error: {}", e);
                    self.fatal.send_replace(Some(e.to_string()));
                    break;
                }
                Err(e) => {
                    tracing::warn!(consumer = self.index, "Receive failed: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if !self.handle_batch(messages).await {
                break;
            }
        }

        tracing::debug!(consumer = self.index, "Receive loop stopped");
    }

    /// Processes one receive batch and acknowledges it. Returns `false` when
    /// the loop must stop.
    ///
    /// A message whose response could not be handed on is left
    /// unacknowledged together with the rest of its batch.
    async fn handle_batch(&self, messages: Vec<InboundMessage>) -> bool {
        let mut receipts = Vec::with_capacity(messages.len());

        for message in messages {
            let disposition = self.processor.on_message(&message.payload, &message.headers).await;
            if disposition == Disposition::Unsent {
                tracing::warn!(consumer = self.index, "Response not sent; leaving message for redelivery");
                if !receipts.is_empty() {
                    self.ack(&receipts).await;
                }
                return false;
            }
            match self.profile.ack_mode {
                AckMode::PerMessage => {
                    if !self.ack(&[message.receipt]).await {
                        return false;
                    }
                }
                AckMode::PerBatch => receipts.push(message.receipt),
            }
        }

        receipts.is_empty() || self.ack(&receipts).await
    }

    async fn ack(&self, receipts: &[Receipt]) -> bool {
        match self.broker.ack(&self.topic, receipts).await {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                tracing::error!(consumer = self.index, "Fatal broker error on ack: {}", e);
                self.fatal.send_replace(Some(e.to_string()));
                false
            }
            Err(e) => {
                // Unacknowledged messages are redelivered; processing is idempotent
                tracing::error!(consumer = self.index, count = receipts.len(), "Ack failed: {}", e);
                true
            }
        }
    }
}
