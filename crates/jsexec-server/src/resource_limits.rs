//! Resource limits for script execution.
//!
//! The wall-clock bounds are checked by the engine thread between slices of
//! VM work. The loop and recursion ceilings are handed to Boa's
//! `RuntimeLimits`; they also stop code the deadline cannot reach, such as a
//! callback running inside a native builtin. Threads still busy with such
//! code after their caller gave up are capped by `stray_thread_limit`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits for script compilation and execution.
///
/// # Example
///
/// ```
/// use jsexec_server::ResourceLimits;
/// use std::time::Duration;
///
/// let limits = ResourceLimits::new()
///     .with_execution_timeout(Duration::from_secs(5))
///     .with_recursion_limit(256);
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Execution bound used when a request does not carry its own timeout
    pub execution_timeout: Duration,
    /// Upper bound on compiling a single script body
    pub compile_timeout: Duration,
    /// Maximum iterations of any single loop
    pub loop_iteration_limit: u64,
    /// Maximum call depth
    pub recursion_limit: usize,
    /// Engine threads allowed to keep running past a timeout before new
    /// work is rejected
    pub stray_thread_limit: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            compile_timeout: Duration::from_secs(10),
            loop_iteration_limit: 100_000_000,
            recursion_limit: 512,
            stray_thread_limit: 8,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = limit;
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_stray_thread_limit(mut self, limit: usize) -> Self {
        self.stray_thread_limit = limit;
        self
    }

    /// Validates the resource limits configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Either timeout is zero or longer than one hour
    /// - The loop, recursion or stray thread ceiling is zero
    pub fn validate(&self) -> Result<(), String> {
        for (name, timeout) in [
            ("execution timeout", self.execution_timeout),
            ("compile timeout", self.compile_timeout),
        ] {
            if timeout.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
            if timeout.as_secs() > 3600 {
                return Err(format!(
                    "{} must be <= 1 hour (got {} seconds)",
                    name,
                    timeout.as_secs()
                ));
            }
        }

        if self.loop_iteration_limit == 0 {
            return Err("loop iteration limit must be greater than zero".to_string());
        }
        if self.recursion_limit == 0 {
            return Err("recursion limit must be greater than zero".to_string());
        }
        if self.stray_thread_limit == 0 {
            return Err("stray thread limit must be greater than zero".to_string());
        }

        Ok(())
    }
}
