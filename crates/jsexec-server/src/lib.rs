//! jsexec Server
//!
//! This crate provides the script worker: a Boa-backed script engine, the
//! bounded script cache, the request processor and the queue adapter that
//! feeds it.
//!
//! # Components
//!
//! - [`runtime`] - [`Engine`] trait and the Boa implementation
//! - [`cache`] - [`ScriptCache`], least-invoked eviction with single-flight compiles
//! - [`processor`] - [`RequestProcessor`], one queue message in, one response out
//! - [`queue`] - [`Broker`] contract, [`QueueAdapter`], batching, the in-memory
//!   broker and (with the `kafka` feature) the Kafka broker
//! - [`http_server`] - liveness probe
//! - [`config`] - [`WorkerConfig`]

pub mod cache;
pub mod config;
pub mod error;
pub mod http_server;
pub mod processor;
pub mod queue;
pub mod resource_limits;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use cache::{Resolved, ScriptCache};
pub use config::WorkerConfig;
pub use error::{AdapterError, CacheError, EngineError};
pub use processor::{Disposition, ProcessorConfig, RequestProcessor, ResponseSink};
#[cfg(feature = "kafka")]
pub use queue::KafkaBroker;
pub use queue::{
    AckMode, AdapterConfig, BackendProfile, Broker, InboundMessage, KafkaSettings, MemoryBroker,
    OutboundMessage, QueueAdapter, QueueType, Receipt,
};
pub use resource_limits::ResourceLimits;
pub use runtime::{BoaEngine, CompiledScript, Engine, EngineMode};
