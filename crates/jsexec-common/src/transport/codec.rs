use crate::protocol::error::Result;
use crate::protocol::{RemoteRequest, RemoteResponse};

/// Codec for envelope payloads
///
/// Currently only JSON is supported, but the enum allows for future
/// extensibility (e.g., a protobuf encoding some brokers prefer).
///
/// # Example
///
/// ```
/// use jsexec_common::transport::Codec;
/// use jsexec_common::protocol::{CompileRequest, RemoteRequest, ScriptId};
///
/// let codec = Codec::new();
/// let request = RemoteRequest::CompileRequest(CompileRequest::new(ScriptId::random(), "x => x"));
///
/// let encoded = codec.encode_request(&request).unwrap();
/// let decoded = codec.decode_request(&encoded).unwrap();
/// assert_eq!(decoded, request);
/// ```
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    /// JSON codec (currently the only supported format)
    Json(JsonCodec),
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Codec::Json(JsonCodec)
    }

    pub fn encode_request(&self, request: &RemoteRequest) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode_request(request),
        }
    }

    pub fn decode_request(&self, data: &[u8]) -> Result<RemoteRequest> {
        match self {
            Codec::Json(_) => JsonCodec::decode_request(data),
        }
    }

    pub fn encode_response(&self, response: &RemoteResponse) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode_response(response),
        }
    }

    pub fn decode_response(&self, data: &[u8]) -> Result<RemoteResponse> {
        match self {
            Codec::Json(_) => JsonCodec::decode_response(data),
        }
    }
}

/// JSON codec for envelope payloads (UTF-8 bytes on the wire).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &RemoteRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    pub fn decode_request(data: &[u8]) -> Result<RemoteRequest> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode_response(response: &RemoteResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<RemoteResponse> {
        Ok(serde_json::from_slice(data)?)
    }
}
