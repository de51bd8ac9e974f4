//! Inbound request envelopes.
//!
//! The envelope is a JSON object holding exactly one of `compileRequest`,
//! `invokeRequest` or `releaseRequest`. It maps onto an externally tagged
//! enum, so an envelope with no recognised key (or more than one) fails to
//! decode instead of being probed field by field.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::Result;
use super::ids::{decode_halves, encode_halves, DecimalU64, ScriptId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RemoteRequest {
    CompileRequest(CompileRequest),
    InvokeRequest(InvokeRequest),
    ReleaseRequest(ReleaseRequest),
}

impl RemoteRequest {
    /// Short name of the request kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteRequest::CompileRequest(_) => "compile",
            RemoteRequest::InvokeRequest(_) => "invoke",
            RemoteRequest::ReleaseRequest(_) => "release",
        }
    }

    /// Decodes the identifier of the script this request refers to.
    pub fn script_id(&self) -> Result<ScriptId> {
        match self {
            RemoteRequest::CompileRequest(r) => r.script_id(),
            RemoteRequest::InvokeRequest(r) => r.script_id(),
            RemoteRequest::ReleaseRequest(r) => r.script_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    #[serde(rename = "scriptIdMSB")]
    pub script_id_msb: DecimalU64,
    #[serde(rename = "scriptIdLSB")]
    pub script_id_lsb: DecimalU64,
    pub script_body: String,
}

impl CompileRequest {
    pub fn new(id: ScriptId, body: impl Into<String>) -> Self {
        let (script_id_msb, script_id_lsb) = encode_halves(&id);
        Self {
            script_id_msb,
            script_id_lsb,
            script_body: body.into(),
        }
    }

    pub fn script_id(&self) -> Result<ScriptId> {
        decode_halves(&self.script_id_msb, &self.script_id_lsb)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    #[serde(rename = "scriptIdMSB")]
    pub script_id_msb: DecimalU64,
    #[serde(rename = "scriptIdLSB")]
    pub script_id_lsb: DecimalU64,
    /// Inline body, compiled on a cache miss. Absent when the caller expects
    /// the script to be resident already.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_body: Option<String>,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Execution bound in milliseconds. Zero or absent means the worker default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl InvokeRequest {
    pub fn new(id: ScriptId, args: Vec<String>) -> Self {
        let (script_id_msb, script_id_lsb) = encode_halves(&id);
        Self {
            script_id_msb,
            script_id_lsb,
            script_body: None,
            function_name: String::new(),
            args,
            timeout: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.script_body = Some(body.into());
        self
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn script_id(&self) -> Result<ScriptId> {
        decode_halves(&self.script_id_msb, &self.script_id_lsb)
    }

    /// Inline body, treating an empty or blank string as absent.
    pub fn body(&self) -> Option<&str> {
        self.script_body.as_deref().filter(|b| !b.trim().is_empty())
    }

    /// Requested execution bound, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| *t > 0).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    #[serde(rename = "scriptIdMSB")]
    pub script_id_msb: DecimalU64,
    #[serde(rename = "scriptIdLSB")]
    pub script_id_lsb: DecimalU64,
    #[serde(default)]
    pub function_name: String,
}

impl ReleaseRequest {
    pub fn new(id: ScriptId) -> Self {
        let (script_id_msb, script_id_lsb) = encode_halves(&id);
        Self {
            script_id_msb,
            script_id_lsb,
            function_name: String::new(),
        }
    }

    pub fn script_id(&self) -> Result<ScriptId> {
        decode_halves(&self.script_id_msb, &self.script_id_lsb)
    }
}
