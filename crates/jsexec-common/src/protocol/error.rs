use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("Malformed header '{name}': {reason}")]
    MalformedHeader { name: &'static str, reason: String },

    #[error("Missing header '{0}'")]
    MissingHeader(&'static str),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
