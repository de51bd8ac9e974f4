//! Transport headers shared by every queue backend.
//!
//! Header values are raw bytes:
//! - `requestId`: 16 bytes, canonical UUID byte order
//! - `responseTopic`: UTF-8 topic name
//! - `expireTs`: 8-byte big-endian signed epoch milliseconds (optional)

use std::collections::HashMap;

use super::error::{ProtocolError, Result};
use super::ids::RequestId;

pub const REQUEST_ID_HEADER: &str = "requestId";
pub const RESPONSE_TOPIC_HEADER: &str = "responseTopic";
pub const EXPIRE_TS_HEADER: &str = "expireTs";

/// Broker-neutral header map.
pub type Headers = HashMap<String, Vec<u8>>;

/// The headers the worker interprets, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeaders {
    pub request_id: RequestId,
    pub response_topic: String,
    pub expire_ts: Option<i64>,
}

impl TransportHeaders {
    pub fn new(request_id: RequestId, response_topic: impl Into<String>) -> Self {
        Self {
            request_id,
            response_topic: response_topic.into(),
            expire_ts: None,
        }
    }

    pub fn with_expire_ts(mut self, expire_ts: i64) -> Self {
        self.expire_ts = Some(expire_ts);
        self
    }

    /// Decodes the worker headers from a raw header map.
    ///
    /// # Errors
    ///
    /// Fails when `requestId` or `responseTopic` is missing or malformed, or
    /// when `expireTs` is present but not exactly 8 bytes.
    pub fn parse(headers: &Headers) -> Result<Self> {
        let raw_id = headers
            .get(REQUEST_ID_HEADER)
            .ok_or(ProtocolError::MissingHeader(REQUEST_ID_HEADER))?;
        let request_id = RequestId::from_bytes(raw_id).map_err(|e| ProtocolError::MalformedHeader {
            name: REQUEST_ID_HEADER,
            reason: e.to_string(),
        })?;

        let raw_topic = headers
            .get(RESPONSE_TOPIC_HEADER)
            .ok_or(ProtocolError::MissingHeader(RESPONSE_TOPIC_HEADER))?;
        let response_topic = String::from_utf8(raw_topic.clone()).map_err(|e| ProtocolError::MalformedHeader {
            name: RESPONSE_TOPIC_HEADER,
            reason: e.to_string(),
        })?;
        if response_topic.is_empty() {
            return Err(ProtocolError::MalformedHeader {
                name: RESPONSE_TOPIC_HEADER,
                reason: "empty topic".into(),
            });
        }

        let expire_ts = match headers.get(EXPIRE_TS_HEADER) {
            None => None,
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| ProtocolError::MalformedHeader {
                    name: EXPIRE_TS_HEADER,
                    reason: format!("expected 8 bytes, got {}", raw.len()),
                })?;
                Some(i64::from_be_bytes(bytes))
            }
        };

        Ok(Self {
            request_id,
            response_topic,
            expire_ts,
        })
    }

    /// Whether the requester has already given up on this message.
    ///
    /// A message expires once `expireTs <= now`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_ts, Some(ts) if ts <= now_ms)
    }

    /// Encodes the headers into a raw header map.
    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(REQUEST_ID_HEADER.to_string(), self.request_id.to_bytes().to_vec());
        headers.insert(RESPONSE_TOPIC_HEADER.to_string(), self.response_topic.as_bytes().to_vec());
        if let Some(ts) = self.expire_ts {
            headers.insert(EXPIRE_TS_HEADER.to_string(), ts.to_be_bytes().to_vec());
        }
        headers
    }
}
