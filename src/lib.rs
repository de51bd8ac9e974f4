//! jsexec - remote JavaScript execution worker
//!
//! Umbrella crate re-exporting the workspace members. The worker binary lives
//! in `jsexec-cli`; this crate exists so the end-to-end tests in `tests/` can
//! reach every layer through one dependency.

pub use jsexec_common as common;
pub use jsexec_metrics as metrics;
pub use jsexec_server as server;
