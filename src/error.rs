//! Error types shared across the crate.

use thiserror::Error;

/// Why a restore point could not be used.
///
/// Every variant is a distinct diagnosis so operators can tell a missing file
/// from a corrupted one.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// No restore file exists.
    #[error("no restore point saved")]
    Missing,

    /// The restore file exists but could not be read or written.
    #[error("restore file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Content is not valid JSON, e.g. truncated mid-write.
    #[error("restore file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Content parsed but is not a JSON object.
    #[error("restore file does not hold an object")]
    NotAnObject,

    /// A required field is absent.
    #[error("restore file is missing field `{0}`")]
    MissingField(&'static str),

    /// The playback field holds an unknown state.
    #[error("unknown playback state `{0}`")]
    InvalidPlayback(String),

    /// A numeric field holds something that does not parse as an integer.
    #[error("field `{field}` is not a number: {value}")]
    InvalidNumber { field: &'static str, value: String },

    /// A numeric field is outside the range it can describe.
    #[error("field `{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    /// A field holds a value of the wrong kind.
    #[error("field `{field}` has an unexpected value: {value}")]
    InvalidField { field: &'static str, value: String },

    /// The referenced event is not in the current rundown.
    #[error("event `{0}` does not exist in the rundown")]
    UnknownEvent(String),
}

/// Failures while measuring a remote time source.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time source unreachable: {0}")]
    Unreachable(#[from] std::io::Error),

    #[error("time source did not answer within {0} ms")]
    Timeout(u64),

    #[error("invalid time source reply: {0}")]
    InvalidReply(&'static str),
}

/// Configuration could not be assembled.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),

    #[error("unknown time zone `{name}`: {source}")]
    TimeZone {
        name: String,
        #[source]
        source: jiff::Error,
    },
}
