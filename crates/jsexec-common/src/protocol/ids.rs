//! 128-bit identifiers and their wire forms.
//!
//! Script and request identifiers are UUIDs. JSON payloads carry them as two
//! unsigned 64-bit halves written in decimal (JSON numbers lose precision past
//! 2^53), while transport headers carry the raw 16 big-endian bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::{ProtocolError, Result};

/// Identifier of a compiled script, used as the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(Uuid);

/// Correlation identifier of a single request. Same shape as a [`ScriptId`].
pub type RequestId = ScriptId;

impl ScriptId {
    /// Builds an identifier from its most- and least-significant halves.
    pub fn from_halves(msb: u64, lsb: u64) -> Self {
        ScriptId(Uuid::from_u64_pair(msb, lsb))
    }

    /// Returns the `(msb, lsb)` halves.
    pub fn halves(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }

    /// Generates a random (v4) identifier.
    pub fn random() -> Self {
        ScriptId(Uuid::new_v4())
    }

    /// Reconstructs an identifier from two decimal-encoded halves.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedIdentifier` if either half is not a
    /// valid unsigned 64-bit decimal.
    pub fn decode(msb: &str, lsb: &str) -> Result<Self> {
        Ok(Self::from_halves(parse_half(msb)?, parse_half(lsb)?))
    }

    /// Encodes the identifier as `(msb, lsb)` decimal strings.
    pub fn encode(&self) -> (String, String) {
        let (msb, lsb) = self.halves();
        (msb.to_string(), lsb.to_string())
    }

    /// Reads an identifier from its 16-byte big-endian representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Uuid::from_slice(buf)
            .map(ScriptId)
            .map_err(|_| ProtocolError::MalformedIdentifier(format!(
                "expected 16 bytes, got {}",
                buf.len()
            )))
    }

    /// Returns the 16-byte big-endian representation.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Standard hyphenated textual form, used in logs and as correlation key.
    pub fn to_canonical_string(&self) -> String {
        self.0.hyphenated().to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// Parses one half: ASCII digits only, no sign, no surrounding whitespace.
fn parse_half(half: &str) -> Result<u64> {
    if half.is_empty() || !half.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedIdentifier(format!(
            "'{}': expected an unsigned decimal",
            half
        )));
    }
    half.parse::<u64>()
        .map_err(|e| ProtocolError::MalformedIdentifier(format!("'{}': {}", half, e)))
}

impl From<Uuid> for ScriptId {
    fn from(uuid: Uuid) -> Self {
        ScriptId(uuid)
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for ScriptId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(ScriptId)
            .map_err(|e| ProtocolError::MalformedIdentifier(format!("'{}': {}", s, e)))
    }
}

/// One decimal half of an identifier as it appears in a JSON envelope.
///
/// Senders normally write a string; plain JSON numbers are accepted too.
/// Serializes back as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DecimalRepr", into = "String")]
pub struct DecimalU64(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum DecimalRepr {
    Text(String),
    Number(u64),
}

impl From<DecimalRepr> for DecimalU64 {
    fn from(repr: DecimalRepr) -> Self {
        match repr {
            DecimalRepr::Text(s) => DecimalU64(s),
            DecimalRepr::Number(n) => DecimalU64(n.to_string()),
        }
    }
}

impl From<DecimalU64> for String {
    fn from(value: DecimalU64) -> Self {
        value.0
    }
}

impl From<u64> for DecimalU64 {
    fn from(value: u64) -> Self {
        DecimalU64(value.to_string())
    }
}

/// Decodes a pair of wire halves into a [`ScriptId`].
pub fn decode_halves(msb: &DecimalU64, lsb: &DecimalU64) -> Result<ScriptId> {
    ScriptId::decode(&msb.0, &lsb.0)
}

/// Encodes a [`ScriptId`] into a pair of wire halves.
pub fn encode_halves(id: &ScriptId) -> (DecimalU64, DecimalU64) {
    let (msb, lsb) = id.halves();
    (msb.into(), lsb.into())
}
