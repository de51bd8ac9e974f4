//! jsexec worker statistics
//!
//! Lock-free counters and latency histograms for the request processor.
//! Everything on the hot path is a relaxed atomic increment; reading is done
//! through [`StatsSnapshot`], which serializes to the JSON served on
//! `/metrics` and feeds the periodic stats log line.
//!
//! - [`ProcessorStats`]: shareable handle used by the processor
//! - [`StatsRegistry`]: the underlying atomic store
//! - [`StatsSnapshot`]: serializable point-in-time view

mod collector;
mod registry;
mod snapshot;

pub use collector::ProcessorStats;
pub use registry::{FailureKind, Operation, Outcome, StatsRegistry};
pub use snapshot::{FailureCounts, OperationMetrics, StatsSnapshot};
