// src/error.rs
//
// Structured error taxonomy for the kmlink CAN/SLCAN link.
// Mirrors the shape of the teacher's io::error::IoError: one enum,
// one variant per failure mode, with device/context carried inline
// rather than a single stringly-typed error.

use thiserror::Error;

/// Errors surfaced by the kmlink library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("permission denied opening {device}")]
    DevicePermission { device: String },

    #[error("device unavailable: {device}: {details}")]
    DeviceUnavailable { device: String, details: String },

    #[error("device disconnected: {device}")]
    DeviceDisconnected { device: String },

    #[error("protocol error: {details}")]
    Protocol { details: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("read-only: {details}")]
    ReadOnly { details: String },

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("value {value} out of range [{min}, {max}] for {parameter}")]
    OutOfRange {
        parameter: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("parameter {0} has an inconsistent range (max < min) and is write-blocked")]
    InconsistentRange(String),

    #[error("could not decode {format} payload: {details}")]
    DecodeError { format: String, details: String },

    #[error("discovery incomplete: received {received} of {declared} declared elements ({fraction:.1}%)")]
    DiscoveryIncomplete {
        received: usize,
        declared: usize,
        fraction: f64,
    },

    #[error("underlying I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
