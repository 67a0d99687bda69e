//! Error types for adapter and cartridge operations

use std::io;

use crate::session::SessionState;

/// Result type for adapter operations
pub type Result<T> = core::result::Result<T, MigError>;

/// Errors that can occur while talking to the adapter
///
/// The type is `Clone` so it can travel inside controller events. OS
/// errors are flattened into [`MigError::IoError`] keeping the raw code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigError {
    /// Path does not exist or no adapter was discovered
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// OS refused exclusive access (mounted, in use, or permissions)
    #[error("device busy or access denied: {0}")]
    DeviceBusy(String),

    /// Partition signature did not match the adapter's identity GUID
    #[error("not a supported cartridge adapter")]
    NotSupportedDevice,

    /// Transport failure on a read or write
    #[error("I/O error: {message}")]
    IoError {
        /// Raw OS error code, when the OS supplied one
        code: Option<i32>,
        /// Error classification
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The OS accepted fewer bytes than requested
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Requested length
        expected: usize,
        /// Bytes actually written
        written: usize,
    },

    /// The device returned fewer bytes than requested
    #[error("short read: {read} of {expected} bytes")]
    ShortRead {
        /// Requested length
        expected: usize,
        /// Bytes actually read
        read: usize,
    },

    /// Sector helpers only accept exactly one sector
    #[error("invalid sector buffer size: {0} (expected 512)")]
    InvalidSectorSize(usize),

    /// Session has no open device
    #[error("not connected")]
    NotConnected,

    /// No cartridge present in the slot
    #[error("no cartridge inserted")]
    NoCartridge,

    /// Cartridge header failed validation
    #[error("cartridge authentication failed")]
    AuthenticationFailed,

    /// Operation requires a prior successful authentication
    #[error("cartridge not authenticated")]
    NotAuthenticated,

    /// Read extends past the declared image size
    #[error("read of {length} bytes at {offset} exceeds image size {total}")]
    OutOfRange {
        /// Image-relative offset
        offset: u64,
        /// Requested length
        length: u64,
        /// Declared image size
        total: u64,
    },

    /// Header buffer is smaller than the header structure
    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),

    /// Capacity class code is unknown, so the image size cannot be trusted
    #[error("unknown cartridge capacity class {0:#04x}")]
    UnknownCapacity(u8),

    /// Controller already runs an operation
    #[error("another operation is in progress")]
    Busy,

    /// Dump aborted cooperatively
    #[error("operation cancelled")]
    Cancelled,

    /// State machine refused the transition
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Status register stayed busy past the command timeout
    #[error("adapter did not answer command {0:#04x}")]
    CommandTimeout(u8),

    /// Status register reported an error
    #[error("adapter reported fault status {0:#04x}")]
    DeviceFault(u8),
}

impl MigError {
    /// Whether the error came from the transport rather than from
    /// validation or caller misuse
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::IoError { .. } | Self::ShortRead { .. } | Self::ShortWrite { .. }
        )
    }
}

impl From<io::Error> for MigError {
    fn from(err: io::Error) -> Self {
        Self::IoError {
            code: err.raw_os_error(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
