//! Error types for each layer of the bridge.

use thiserror::Error;

/// Errors raised while framing or unframing MLLP data.
#[derive(Debug, Error)]
pub enum MllpError {
    /// A content byte outside the printable range (and not a CR) was found.
    /// Content is never silently fixed, the caller must sanitise it first.
    #[error("invalid MLLP content byte 0x{byte:02X} at offset {offset}")]
    InvalidContent { offset: usize, byte: u8 },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer stopped taking data before a write could finish.
    #[error("write did not finish within {0:?}")]
    WriteTimeout(std::time::Duration),
}

/// The inbound text could not be read as an HL7 message.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,

    #[error("message must start with an MSH segment, found '{0}'")]
    MissingHeader(String),

    #[error("MSH segment is too short to declare its separators")]
    MissingSeparators,

    #[error("invalid segment code '{0}'")]
    InvalidSegment(String),
}

/// Failure reported by an application handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Internal dispatch failures. Every variant ends up as an `AE` NAK on the wire.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered under the name '{0}'")]
    UnknownHandler(String),

    #[error("handler for rule '{rule}' returned no response")]
    NoResponse { rule: String },

    #[error("handler for rule '{rule}' failed: {source}")]
    Handler {
        rule: String,
        #[source]
        source: HandlerError,
    },

    #[error("handler for rule '{rule}' panicked: {message}")]
    Panicked { rule: String, message: String },
}

/// Startup configuration problems. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid listener address '{0}'")]
    InvalidAddress(String),

    #[error("unable to listen on {address}: {source}")]
    Bind {
        address: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid rule pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Why an outbound message could not be queued.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("outbound message rejected: {0}")]
    Invalid(#[from] MllpError),

    #[error("the server owning this outbound queue has stopped")]
    Closed,
}
