//! Stable error codes for the orchestrator's public API, and the crate's
//! internal error type.

use thiserror::Error;

/// Stable numeric result codes returned by [`crate::orchestrator::do_action`].
///
/// Values are fixed so a caller can match on the integer without depending on
/// enum discriminant layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    UnknownFail = -1,
    Internal = -2,
    SetBaud = -16,
    EnterPpm = -17,
    Calibration = -18,
    Unlock = -19,
    ChipNotSupported = -20,
    ActionNotSupported = -21,
    InvalidHex = -22,
    MissingData = -23,
    ProgrammingFailed = -24,
    VerifyFailed = -25,
}

impl ErrorCode {
    /// Human-readable string for this code, retrievable independent of the
    /// `Error` that produced it.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::UnknownFail => "unknown failure",
            ErrorCode::Internal => "internal error",
            ErrorCode::SetBaud => "failed to configure bitrate",
            ErrorCode::EnterPpm => "failed to enter PPM programming mode",
            ErrorCode::Calibration => "calibration frame rejected",
            ErrorCode::Unlock => "unlock session failed",
            ErrorCode::ChipNotSupported => "chip not supported",
            ErrorCode::ActionNotSupported => "action not supported for this memory",
            ErrorCode::InvalidHex => "HEX image invalid for the requested memory",
            ErrorCode::MissingData => "HEX image has no data in the requested range",
            ErrorCode::ProgrammingFailed => "programming failed",
            ErrorCode::VerifyFailed => "verification failed",
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Errors surfaced above the wire layer. `DecodeFraming`/`DecodeTiming` never
/// reach here: they're handled and discarded inside `codec`/`line`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("{}", .0.message())]
    Code(ErrorCode),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArg(_) => ErrorCode::UnknownFail,
            Error::Code(code) => *code,
        }
    }
}
