//! Error types for the tilestream crate.

use std::fmt;

use crate::types::ConsumerId;

/// Result type for tilestream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading tile content.
#[derive(Debug)]
pub enum Error {
    /// Container decoding failed.
    Decode(tilestream_decode::DecodeError),
    /// No registered format supports the key.
    Dispatch {
        /// The key that could not be dispatched.
        key: String,
    },
    /// The consumer is already waiting on this key.
    DuplicateRegistration {
        /// The key the consumer is registered for.
        key: String,
        /// The duplicate consumer.
        consumer: ConsumerId,
    },
    /// Fetching the resource failed.
    Fetch {
        /// The key that failed.
        key: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// Reading a local resource failed.
    Io {
        /// The path that failed.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },
    /// Strict validation rejected a decoded container.
    Validation {
        /// The key that failed validation.
        key: String,
        /// One message per error finding.
        findings: Vec<String>,
    },
    /// The load was cancelled before it completed.
    Cancelled {
        /// The cancelled key.
        key: String,
    },
    /// Invalid loader configuration.
    Config {
        /// Description of what was invalid.
        message: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::Dispatch { key } => write!(f, "no format supports {key}"),
            Error::DuplicateRegistration { key, consumer } => {
                write!(f, "consumer {consumer} is already registered for {key}")
            }
            Error::Fetch { key, message } => write!(f, "fetching {key} failed: {message}"),
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Io { path, source } => write!(f, "failed to read {path}: {source}"),
            Error::Validation { key, findings } => {
                write!(f, "{key} failed validation: {}", findings.join("; "))
            }
            Error::Cancelled { key } => write!(f, "load of {key} was cancelled"),
            Error::Config { message } => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(e) => Some(e),
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<tilestream_decode::DecodeError> for Error {
    fn from(e: tilestream_decode::DecodeError) -> Self {
        Error::Decode(e)
    }
}
