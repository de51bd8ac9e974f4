//! Payload encoding for queue transports.
//!
//! Queue brokers move opaque bytes; this module turns them into request
//! envelopes and response envelopes back into bytes.

pub mod codec;

pub use codec::{Codec, JsonCodec};
