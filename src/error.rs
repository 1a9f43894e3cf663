// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy, from the wire up to the dispatch boundary.

use core::fmt;

/// In-band status byte reported by the chip in a 4-byte reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    CheckMacMiscompare,
    ParseError,
    EccFault,
    SelfTestError,
    HealthTestError,
    ExecutionError,
    AfterWake,
    WatchdogExpiring,
    CommsError,
    Unknown(u8),
}

impl From<u8> for StatusCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::CheckMacMiscompare,
            0x03 => Self::ParseError,
            0x05 => Self::EccFault,
            0x07 => Self::SelfTestError,
            0x08 => Self::HealthTestError,
            0x0f => Self::ExecutionError,
            0x11 => Self::AfterWake,
            0xee => Self::WatchdogExpiring,
            0xff => Self::CommsError,
            other => Self::Unknown(other),
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> u8 {
        match code {
            StatusCode::Success => 0x00,
            StatusCode::CheckMacMiscompare => 0x01,
            StatusCode::ParseError => 0x03,
            StatusCode::EccFault => 0x05,
            StatusCode::SelfTestError => 0x07,
            StatusCode::HealthTestError => 0x08,
            StatusCode::ExecutionError => 0x0f,
            StatusCode::AfterWake => 0x11,
            StatusCode::WatchdogExpiring => 0xee,
            StatusCode::CommsError => 0xff,
            StatusCode::Unknown(other) => other,
        }
    }
}

/// Why a received packet could not be turned into a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the packet header promised. Usually the chip is still busy.
    ShortRead,
    /// The packet has a valid CRC but the wrong size. `status` is set when it was a
    /// 4-byte status reply, which means the chip refused the command.
    LengthMismatch { status: Option<StatusCode> },
    CrcMismatch,
    /// Command data does not fit in one packet.
    TooLong,
}

impl FrameError {
    /// Transient framing problems are worth another read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ShortRead | Self::CrcMismatch => true,
            Self::LengthMismatch { status } => status.is_none(),
            Self::TooLong => false,
        }
    }
}

/// Physical bus failure: hardware byte-timeout flag or poll ceiling reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTimeout;

/// Failure of one chip command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    BusTimeout,
    /// Transient errors kept coming until the retry budget ran out.
    RetriesExhausted,
    /// The chip rejected the command. Never retried automatically.
    Chip(StatusCode),
    /// The command could not be framed.
    BadCommand,
}

impl From<BusTimeout> for LinkError {
    fn from(_: BusTimeout) -> Self {
        Self::BusTimeout
    }
}

/// Generic failure of a session-crypto step.
///
/// Deliberately opaque: a wrong secret and a glitched bus look the same from here.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SeFailure {
    cause: Cause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Link(LinkError),
    Refused,
    Mitm,
}

impl SeFailure {
    /// The chip answered, but not with what we expected.
    pub(crate) fn refused() -> Self {
        Self {
            cause: Cause::Refused,
        }
    }

    /// A value read in clear did not match its authenticated digest.
    pub(crate) fn mitm() -> Self {
        Self { cause: Cause::Mitm }
    }

    pub fn is_mitm(&self) -> bool {
        self.cause == Cause::Mitm
    }
}

impl From<LinkError> for SeFailure {
    fn from(e: LinkError) -> Self {
        Self {
            cause: Cause::Link(e),
        }
    }
}

impl fmt::Debug for SeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeFailure({:?})", self.cause)
    }
}

/// Outcome of a PIN operation that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    HmacFail,
    BadMagic,
    RangeError,
    BadRequest,
    IAmBrick,
    SeFail,
    WrongSuccess,
    AuthFail,
    OldAuthFail,
}

impl PinError {
    /// Code reported across the dispatch boundary.
    pub fn code(&self) -> i32 {
        match self {
            Self::HmacFail => -100,
            Self::BadMagic => -102,
            Self::RangeError => -103,
            Self::BadRequest => -104,
            Self::IAmBrick => -105,
            Self::SeFail => -106,
            Self::WrongSuccess => -109,
            Self::AuthFail => -112,
            Self::OldAuthFail => -113,
        }
    }
}

impl From<SeFailure> for PinError {
    fn from(_: SeFailure) -> Self {
        Self::SeFail
    }
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::HmacFail => "attempt record signature is wrong",
            Self::BadMagic => "attempt record has the wrong magic",
            Self::RangeError => "attempt record field out of range",
            Self::BadRequest => "bad request",
            Self::IAmBrick => "no attempts left",
            Self::SeFail => "secure element failure",
            Self::WrongSuccess => "attempt record in the wrong state",
            Self::AuthFail => "wrong PIN",
            Self::OldAuthFail => "wrong old PIN",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_round_trips_known_and_unknown_values() {
        for code in [0x00u8, 0x01, 0x03, 0x05, 0x07, 0x08, 0x0f, 0x11, 0xee, 0xff, 0x42] {
            assert_eq!(u8::from(StatusCode::from(code)), code);
        }
        assert_eq!(StatusCode::from(0x42), StatusCode::Unknown(0x42));
    }

    #[test]
    fn chip_status_replies_are_not_retried() {
        assert!(FrameError::ShortRead.is_retryable());
        assert!(FrameError::CrcMismatch.is_retryable());
        assert!(FrameError::LengthMismatch { status: None }.is_retryable());
        assert!(!FrameError::LengthMismatch {
            status: Some(StatusCode::ExecutionError)
        }
        .is_retryable());
    }

    #[test]
    fn se_failure_hides_its_cause_from_pin_layer() {
        let e: PinError = SeFailure::from(LinkError::Chip(StatusCode::CheckMacMiscompare)).into();
        assert_eq!(e, PinError::SeFail);
        assert_eq!(PinError::from(SeFailure::mitm()).code(), -106);
        assert!(SeFailure::mitm().is_mitm());
    }
}
