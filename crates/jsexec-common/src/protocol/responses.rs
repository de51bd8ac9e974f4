//! Outbound response envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::Result;
use super::ids::{decode_halves, encode_halves, DecimalU64, RequestId, ScriptId};

/// Failure classification carried in responses.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ErrorCode {
    Compilation = 0,
    Runtime = 1,
    Timeout = 2,
    NotFound = 3,
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Compilation),
            1 => Ok(ErrorCode::Runtime),
            2 => Ok(ErrorCode::Timeout),
            3 => Ok(ErrorCode::NotFound),
            other => Err(format!("unknown error code {}", other)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Compilation => "COMPILATION_ERROR",
            ErrorCode::Runtime => "RUNTIME_ERROR",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::NotFound => "NOT_FOUND_ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    pub success: bool,
    #[serde(rename = "scriptIdMSB")]
    pub script_id_msb: DecimalU64,
    #[serde(rename = "scriptIdLSB")]
    pub script_id_lsb: DecimalU64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl CompileResponse {
    pub fn success(id: &ScriptId) -> Self {
        let (script_id_msb, script_id_lsb) = encode_halves(id);
        Self {
            success: true,
            script_id_msb,
            script_id_lsb,
            error_code: None,
            error_details: None,
        }
    }

    pub fn failure(id: &ScriptId, code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code),
            error_details: Some(details.into()),
            ..Self::success(id)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl InvokeResponse {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error_code: None,
            error_details: None,
        }
    }

    pub fn failure(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error_code: Some(code),
            error_details: Some(details.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub success: bool,
    #[serde(rename = "scriptIdMSB")]
    pub script_id_msb: DecimalU64,
    #[serde(rename = "scriptIdLSB")]
    pub script_id_lsb: DecimalU64,
}

impl ReleaseResponse {
    pub fn success(id: &ScriptId) -> Self {
        let (script_id_msb, script_id_lsb) = encode_halves(id);
        Self {
            success: true,
            script_id_msb,
            script_id_lsb,
        }
    }
}

/// Payload of a response, mirroring the kind of request that was processed.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Compile(CompileResponse),
    Invoke(InvokeResponse),
    Release(ReleaseResponse),
}

impl ResponseBody {
    pub fn is_success(&self) -> bool {
        match self {
            ResponseBody::Compile(r) => r.success,
            ResponseBody::Invoke(r) => r.success,
            ResponseBody::Release(r) => r.success,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ResponseBody::Compile(r) => r.error_code,
            ResponseBody::Invoke(r) => r.error_code,
            ResponseBody::Release(_) => None,
        }
    }
}

/// A response envelope as sent back to the requester.
///
/// At most one of the three payload fields is populated; construct it with
/// [`RemoteResponse::new`] to keep it that way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    #[serde(rename = "requestIdMSB")]
    pub request_id_msb: DecimalU64,
    #[serde(rename = "requestIdLSB")]
    pub request_id_lsb: DecimalU64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_response: Option<CompileResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_response: Option<InvokeResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_response: Option<ReleaseResponse>,
}

impl RemoteResponse {
    pub fn new(request_id: &RequestId, body: ResponseBody) -> Self {
        let (request_id_msb, request_id_lsb) = encode_halves(request_id);
        let mut response = Self {
            request_id_msb,
            request_id_lsb,
            compile_response: None,
            invoke_response: None,
            release_response: None,
        };
        match body {
            ResponseBody::Compile(r) => response.compile_response = Some(r),
            ResponseBody::Invoke(r) => response.invoke_response = Some(r),
            ResponseBody::Release(r) => response.release_response = Some(r),
        }
        response
    }

    /// Decodes the identifier of the request this answers.
    pub fn request_id(&self) -> Result<RequestId> {
        decode_halves(&self.request_id_msb, &self.request_id_lsb)
    }

    /// Returns the populated payload, if any.
    pub fn body(&self) -> Option<ResponseBody> {
        if let Some(r) = &self.compile_response {
            return Some(ResponseBody::Compile(r.clone()));
        }
        if let Some(r) = &self.invoke_response {
            return Some(ResponseBody::Invoke(r.clone()));
        }
        self.release_response.clone().map(ResponseBody::Release)
    }
}
