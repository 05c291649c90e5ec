/*!
Common error types for the GPS-timed exposure acquisition components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// A framed packet was recognised but its contents are unusable
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A busy device did not produce a usable reply within its budget
    #[error("Timed out after {waited_ms} ms waiting for {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    /// The timing unit reported a non-recoverable status
    #[error("Hard device error: {0}")]
    HardDevice(String),

    /// A reply did not match the request that was sent
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Exposure time outside the range the timing hardware supports
    #[error("Invalid exposure time {seconds} s (valid range is 0 to {max} s)")]
    InvalidExposureTime { seconds: u32, max: u32 },

    /// No synchronisation pulse arrived while starting acquisition
    #[error("No initial synchronisation pulse within {waited_ms} ms")]
    InitialSyncFailure { waited_ms: u64 },

    /// A device could not be opened
    #[error("Failed to open device {path}: {reason}")]
    DeviceOpen { path: String, reason: String },

    /// Device level failures (serial line errors, camera faults)
    #[error("Device error: {0}")]
    Device(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The cooperative stop flag was cleared while an operation was pending
    #[error("Operation stopped")]
    Stopped,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SharedError {
    /// Create a new malformed packet error
    pub fn malformed_packet(msg: impl Into<String>) -> Self {
        Self::MalformedPacket(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(operation: impl Into<String>, waited_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_ms,
        }
    }

    /// Create a new hard device error
    pub fn hard_device(msg: impl Into<String>) -> Self {
        Self::HardDevice(msg.into())
    }

    /// Create a new invalid response error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create a new device open error
    pub fn device_open(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<serialport::Error> for SharedError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::Io(kind) => Self::Io(std::io::Error::new(kind, e.description)),
            _ => Self::Device(e.description),
        }
    }
}
