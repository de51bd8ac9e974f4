//! Queue plumbing between a message broker and the request processor.
//!
//! A concrete broker is reduced to the handful of primitives in [`Broker`].
//! Everything else (receive loops, acknowledgement, outbound batching,
//! shutdown) is shared and lives in [`QueueAdapter`], tuned per broker kind
//! by a [`BackendProfile`].

mod adapter;
mod batcher;
mod kafka;
mod memory;
mod profile;

pub use adapter::{AdapterConfig, AdapterSink, QueueAdapter};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use kafka::{KafkaSettings, DEFAULT_KAFKA_GROUP_ID, DEFAULT_KAFKA_SERVERS};
pub use memory::{MemoryBroker, StoredMessage};
pub use profile::{AckMode, BackendProfile, QueueType};

use jsexec_common::Headers;
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Broker-assigned handle used to acknowledge a received message.
pub type Receipt = u64;

/// A message pulled from the request topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub receipt: Receipt,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Partitioning / correlation key.
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Black-box primitives of a message broker.
///
/// Implementations own their connections. All methods may be called
/// concurrently from several receive loops and the outbound batcher.
pub trait Broker: Send + Sync + 'static {
    /// Establishes connectivity.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Creates `topic` if it does not exist yet. Must be idempotent.
    fn ensure_topic(&self, topic: &str) -> impl Future<Output = Result<()>> + Send;

    /// Pulls up to `max` messages, waiting at most `wait` when none are
    /// available. An empty batch is not an error.
    fn receive(
        &self,
        topic: &str,
        max: usize,
        wait: Duration,
    ) -> impl Future<Output = Result<Vec<InboundMessage>>> + Send;

    /// Acknowledges (commits / deletes) received messages.
    fn ack(&self, topic: &str, receipts: &[Receipt]) -> impl Future<Output = Result<()>> + Send;

    /// Publishes a batch. Either every message is accepted or an error is
    /// returned and the caller may retry the whole batch.
    fn publish(&self, messages: &[OutboundMessage]) -> impl Future<Output = Result<()>> + Send;

    /// Releases connections. Further calls may fail with `AdapterError::Closed`.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}
