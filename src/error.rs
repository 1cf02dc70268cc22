//! Error types for ratecord.

use std::num::{ParseFloatError, ParseIntError};

use http::StatusCode;
use thiserror::Error;

/// Main error type for ratecord operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A rate limit header contained bytes that are not visible ASCII
    #[error("header {header} is not valid ASCII")]
    NonAsciiHeader { header: &'static str },

    /// A rate limit header did not hold a float
    #[error("header {header} has invalid float value {value:?}: {source}")]
    InvalidFloat {
        header: &'static str,
        value: String,
        #[source]
        source: ParseFloatError,
    },

    /// A rate limit header held NaN or an infinity
    #[error("header {header} has non-finite value {value:?}")]
    NonFiniteFloat { header: &'static str, value: String },

    /// A wait or deadline too large to represent
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: String },

    /// A rate limit header did not hold an integer
    #[error("header {header} has invalid integer value {value:?}: {source}")]
    InvalidInteger {
        header: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },

    /// The `Date` header could not be parsed as an HTTP date
    #[error("invalid Date header {value:?}: {source}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// A custom rate limit rule cannot be enforced
    #[error("invalid custom rate limit for suffix {suffix:?}: {reason}")]
    InvalidCustomRule { suffix: String, reason: String },

    /// The server kept answering 429/502 past the retry budget
    #[error("gave up on {route} after {attempts} attempts")]
    TooManyRetries { route: String, attempts: u32 },

    /// A non-success status that is not retried
    #[error("unsuccessful response {status}: {body}")]
    UnsuccessfulResponse { status: StatusCode, body: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratecord operations.
pub type Result<T> = std::result::Result<T, Error>;
