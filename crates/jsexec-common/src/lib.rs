//! jsexec Common Types
//!
//! This crate provides the wire protocol shared by the jsexec script worker
//! and its clients.
//!
//! # Overview
//!
//! Requests reach the worker through a message queue. Each message is a
//! binary payload plus a header map:
//!
//! - **Payload**: a JSON envelope holding one of `compileRequest`,
//!   `invokeRequest` or `releaseRequest`
//! - **Headers**: `requestId` (16 bytes), `responseTopic` (UTF-8) and an
//!   optional `expireTs` (8-byte big-endian epoch millis)
//!
//! Responses travel back as a JSON envelope keyed by the request id halves.
//!
//! # Components
//!
//! - [`protocol`] - Identifiers, envelopes, headers and errors
//! - [`transport`] - Payload codecs
//!
//! # Example
//!
//! ```
//! use jsexec_common::{CompileRequest, RemoteRequest, RequestId, ScriptId, TransportHeaders};
//!
//! let script = ScriptId::random();
//! let request = RemoteRequest::CompileRequest(CompileRequest::new(script, "x => x + 1"));
//! let headers = TransportHeaders::new(RequestId::random(), "js_eval.responses").to_headers();
//! # let _ = (request, headers);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
pub use transport::Codec;
