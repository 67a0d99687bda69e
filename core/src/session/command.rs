//! Command and status register codes
//!
//! A command is one sector written to the COMMAND offset whose first byte is
//! the code; the adapter answers through the first byte of the STATUS sector.

/// Command codes accepted by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Nop = 0x00,
    GetStatus = 0x01,
    GetCartInfo = 0x02,
    AuthStart = 0x10,
    AuthStatus = 0x11,
    ReadXci = 0x20,
    ReadCert = 0x21,
    ReadUid = 0x22,
    Abort = 0xFF,
}

impl Command {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Status register values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Busy,
    Ready,
    AuthRequired,
    AuthInProgress,
    AuthSuccess,
    AuthFailed,
    NoCart,
    CartInserted,
    Error,
    Unknown(u8),
}

impl Status {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Idle,
            0x01 => Self::Busy,
            0x02 => Self::Ready,
            0x10 => Self::AuthRequired,
            0x11 => Self::AuthInProgress,
            0x12 => Self::AuthSuccess,
            0x13 => Self::AuthFailed,
            0x20 => Self::NoCart,
            0x21 => Self::CartInserted,
            0xFF => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            Self::Idle => 0x00,
            Self::Busy => 0x01,
            Self::Ready => 0x02,
            Self::AuthRequired => 0x10,
            Self::AuthInProgress => 0x11,
            Self::AuthSuccess => 0x12,
            Self::AuthFailed => 0x13,
            Self::NoCart => 0x20,
            Self::CartInserted => 0x21,
            Self::Error => 0xFF,
            Self::Unknown(code) => code,
        }
    }

    /// The adapter is still working on the last command
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy)
    }
}
