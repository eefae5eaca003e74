use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to connect to {addr}: {source}")]
    Connect {
        source: std::io::Error,
        addr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid greeting from server: {0}")]
    Handshake(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Response sync {received} does not match request sync {expected}")]
    SyncMismatch { expected: u64, received: u64 },

    #[error("Store error {code}: {message}")]
    Store { code: u32, message: String },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Malformed tuple: {0}")]
    MalformedTuple(String),

    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Connection is out of step with the store after an earlier transport failure")]
    Broken,

    #[error("Invalid value '{value}' for property {key}: {reason}")]
    InvalidProperty {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unable to read properties file {filename}: {source}")]
    PropertiesFile {
        source: std::io::Error,
        filename: String,
    },

    #[error("Unable to encode request: {0}")]
    Encode(String),

    #[error("Unable to decode response: {0}")]
    Decode(#[from] rmpv::decode::Error),
}

impl Error {
    /// Whether the error came from the transport rather than the store itself.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::SyncMismatch { .. }
                | Error::Decode(_)
                | Error::MalformedFrame(_)
                | Error::NotConnected
                | Error::Broken
        )
    }
}
