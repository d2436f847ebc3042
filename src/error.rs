//! Stable error identifiers surfaced to callers of the core.
//!
//! [`CoreError::code`] returns the snake_case identifier from the external
//! interface contract (section 6 of the spec) so logs and any diagnostic
//! JSON responses carry a stable string regardless of the `Display` wording.

use thiserror::Error;

/// Errors returned by transport drivers (section 4.B).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("CRC check failed")]
    Crc,
    #[error("device returned an unsupported/exception function code")]
    BadFunction,
    #[error("transport is closed")]
    TransportClosed,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Errors from the codec layer (section 4.A).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: expected {expected} register(s), got {got}")]
    MalformedFrame { expected: usize, got: usize },
    #[error("value cannot be encoded (non-finite float or out of range)")]
    EncodingFailed,
}

/// The core-wide error type surfaced by the Manager's public API.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("data point '{0}' not found")]
    NotFound(String),
    #[error("data point '{0}' has no read function")]
    NoReadFn(String),
    #[error("data point '{0}' has no write function")]
    NoWriteFn(String),
    #[error("data point '{0}' has never been polled")]
    NoData(String),
    #[error("request timed out")]
    Timeout,
    #[error("command timed out")]
    CommandTimeout,
    #[error("device returned an exception response")]
    CommandException,
    #[error("device '{port}'/{slave} is skipped after repeated timeouts")]
    DeviceOfflineSkipped { port: String, slave: u8 },
    #[error("port '{0}' not found")]
    PortNotFound(String),
    #[error("port '{0}' is not connected")]
    PortNotConnected(String),
    #[error("port '{0}' is already in use")]
    PortInUse(String),
    #[error("operation not valid on a virtual port")]
    VirtualPort,
    #[error("port is not backed by a persisted record")]
    NoDbPort,
    #[error("invalid response from device: {0}")]
    InvalidResponse(String),
    #[error("unknown field '{0}' in register-map template")]
    UnknownField(String),
    #[error("field '{0}' is read-only")]
    ReadOnlyField(String),
    #[error("failed to encode value for transmission")]
    EncodingFailed,
    #[error("port is disconnected")]
    Disconnected,
}

impl CoreError {
    /// Stable snake_case identifier, per section 6 of the spec.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::NoReadFn(_) => "no_read_function",
            CoreError::NoWriteFn(_) => "no_write_function",
            CoreError::NoData(_) => "no_data",
            CoreError::Timeout => "timeout",
            CoreError::CommandTimeout => "command_timeout",
            CoreError::CommandException => "command_exception",
            CoreError::DeviceOfflineSkipped { .. } => "device_offline_skipped",
            CoreError::PortNotFound(_) => "port_not_found",
            CoreError::PortNotConnected(_) => "port_not_connected",
            CoreError::PortInUse(_) => "port_in_use",
            CoreError::VirtualPort => "virtual_port",
            CoreError::NoDbPort => "no_db_port",
            CoreError::InvalidResponse(_) => "invalid_response",
            CoreError::UnknownField(_) => "unknown_field",
            CoreError::ReadOnlyField(_) => "read_only_field",
            CoreError::EncodingFailed => "encoding_failed",
            CoreError::Disconnected => "disconnected",
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => CoreError::Timeout,
            TransportError::Crc | TransportError::BadFunction | TransportError::Malformed(_) => {
                CoreError::InvalidResponse(err.to_string())
            }
            TransportError::TransportClosed => CoreError::Disconnected,
        }
    }
}

impl From<CodecError> for CoreError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedFrame { .. } => CoreError::InvalidResponse(err.to_string()),
            CodecError::EncodingFailed => CoreError::EncodingFailed,
        }
    }
}
