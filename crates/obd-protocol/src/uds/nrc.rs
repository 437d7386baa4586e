//! UDS negative response codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason byte of a `7F <sid> <nrc>` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnet,
    FailurePreventsExecution,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    /// Request accepted, final answer follows later
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    RpmTooHigh,
    RpmTooLow,
    EngineRunning,
    EngineNotRunning,
    VehicleSpeedTooHigh,
    VoltageTooHigh,
    VoltageTooLow,
    /// Reserved or manufacturer-specific value
    Unknown(u8),
}

impl NegativeResponseCode {
    /// ISO 14229 mnemonic
    pub fn name(&self) -> &'static str {
        match self {
            Self::GeneralReject => "generalReject",
            Self::ServiceNotSupported => "serviceNotSupported",
            Self::SubFunctionNotSupported => "subFunctionNotSupported",
            Self::IncorrectMessageLengthOrFormat => "incorrectMessageLengthOrInvalidFormat",
            Self::ResponseTooLong => "responseTooLong",
            Self::BusyRepeatRequest => "busyRepeatRequest",
            Self::ConditionsNotCorrect => "conditionsNotCorrect",
            Self::RequestSequenceError => "requestSequenceError",
            Self::NoResponseFromSubnet => "noResponseFromSubnetComponent",
            Self::FailurePreventsExecution => "failurePreventsExecutionOfRequestedAction",
            Self::RequestOutOfRange => "requestOutOfRange",
            Self::SecurityAccessDenied => "securityAccessDenied",
            Self::InvalidKey => "invalidKey",
            Self::ExceededNumberOfAttempts => "exceededNumberOfAttempts",
            Self::RequiredTimeDelayNotExpired => "requiredTimeDelayNotExpired",
            Self::UploadDownloadNotAccepted => "uploadDownloadNotAccepted",
            Self::TransferDataSuspended => "transferDataSuspended",
            Self::GeneralProgrammingFailure => "generalProgrammingFailure",
            Self::WrongBlockSequenceCounter => "wrongBlockSequenceCounter",
            Self::ResponsePending => "requestCorrectlyReceivedResponsePending",
            Self::SubFunctionNotSupportedInActiveSession => {
                "subFunctionNotSupportedInActiveSession"
            }
            Self::ServiceNotSupportedInActiveSession => "serviceNotSupportedInActiveSession",
            Self::RpmTooHigh => "rpmTooHigh",
            Self::RpmTooLow => "rpmTooLow",
            Self::EngineRunning => "engineIsRunning",
            Self::EngineNotRunning => "engineIsNotRunning",
            Self::VehicleSpeedTooHigh => "vehicleSpeedTooHigh",
            Self::VoltageTooHigh => "voltageTooHigh",
            Self::VoltageTooLow => "voltageTooLow",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x25 => Self::NoResponseFromSubnet,
            0x26 => Self::FailurePreventsExecution,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::ResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            0x81 => Self::RpmTooHigh,
            0x82 => Self::RpmTooLow,
            0x83 => Self::EngineRunning,
            0x84 => Self::EngineNotRunning,
            0x88 => Self::VehicleSpeedTooHigh,
            0x92 => Self::VoltageTooHigh,
            0x93 => Self::VoltageTooLow,
            other => Self::Unknown(other),
        }
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        use NegativeResponseCode::*;
        match nrc {
            GeneralReject => 0x10,
            ServiceNotSupported => 0x11,
            SubFunctionNotSupported => 0x12,
            IncorrectMessageLengthOrFormat => 0x13,
            ResponseTooLong => 0x14,
            BusyRepeatRequest => 0x21,
            ConditionsNotCorrect => 0x22,
            RequestSequenceError => 0x24,
            NoResponseFromSubnet => 0x25,
            FailurePreventsExecution => 0x26,
            RequestOutOfRange => 0x31,
            SecurityAccessDenied => 0x33,
            InvalidKey => 0x35,
            ExceededNumberOfAttempts => 0x36,
            RequiredTimeDelayNotExpired => 0x37,
            UploadDownloadNotAccepted => 0x70,
            TransferDataSuspended => 0x71,
            GeneralProgrammingFailure => 0x72,
            WrongBlockSequenceCounter => 0x73,
            ResponsePending => 0x78,
            SubFunctionNotSupportedInActiveSession => 0x7E,
            ServiceNotSupportedInActiveSession => 0x7F,
            RpmTooHigh => 0x81,
            RpmTooLow => 0x82,
            EngineRunning => 0x83,
            EngineNotRunning => 0x84,
            VehicleSpeedTooHigh => 0x88,
            VoltageTooHigh => 0x92,
            VoltageTooLow => 0x93,
            Unknown(value) => value,
        }
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), u8::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for byte in 0..=u8::MAX {
            assert_eq!(u8::from(NegativeResponseCode::from(byte)), byte);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            NegativeResponseCode::from(0x31).to_string(),
            "requestOutOfRange (0x31)"
        );
        assert_eq!(NegativeResponseCode::from(0xF0).to_string(), "unknown (0xF0)");
    }
}
