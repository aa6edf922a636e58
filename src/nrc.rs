//! Negative response codes (sid 0x7F rejections)
//!
//! When an ECU rejects a request, the command's status switches to
//! [`CommandStatus`](crate::CommandStatus)`::Error` and its buffer holds the
//! one-byte NRC. This type gives that byte a name.

use std::fmt;

use serde::Serialize;

/// The subset of ISO 14229-1 negative response codes OBD-II traffic runs
/// into; everything else stays readable through [`Nrc::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Nrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestOutOfRange,
    SecurityAccessDenied,
    ResponsePending,
    ServiceNotSupportedInActiveSession,
    Unknown(u8),
}

impl From<u8> for Nrc {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Nrc::GeneralReject,
            0x11 => Nrc::ServiceNotSupported,
            0x12 => Nrc::SubFunctionNotSupported,
            0x13 => Nrc::IncorrectMessageLengthOrFormat,
            0x21 => Nrc::BusyRepeatRequest,
            0x22 => Nrc::ConditionsNotCorrect,
            0x31 => Nrc::RequestOutOfRange,
            0x33 => Nrc::SecurityAccessDenied,
            0x78 => Nrc::ResponsePending,
            0x7F => Nrc::ServiceNotSupportedInActiveSession,
            other => Nrc::Unknown(other),
        }
    }
}

impl From<Nrc> for u8 {
    fn from(nrc: Nrc) -> Self {
        match nrc {
            Nrc::GeneralReject => 0x10,
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLengthOrFormat => 0x13,
            Nrc::BusyRepeatRequest => 0x21,
            Nrc::ConditionsNotCorrect => 0x22,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::ResponsePending => 0x78,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
            Nrc::Unknown(value) => value,
        }
    }
}

impl fmt::Display for Nrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nrc::GeneralReject => write!(f, "GeneralReject"),
            Nrc::ServiceNotSupported => write!(f, "ServiceNotSupported"),
            Nrc::SubFunctionNotSupported => write!(f, "SubFunctionNotSupported"),
            Nrc::IncorrectMessageLengthOrFormat => {
                write!(f, "IncorrectMessageLengthOrFormat")
            }
            Nrc::BusyRepeatRequest => write!(f, "BusyRepeatRequest"),
            Nrc::ConditionsNotCorrect => write!(f, "ConditionsNotCorrect"),
            Nrc::RequestOutOfRange => write!(f, "RequestOutOfRange"),
            Nrc::SecurityAccessDenied => write!(f, "SecurityAccessDenied"),
            Nrc::ResponsePending => write!(f, "ResponsePending"),
            Nrc::ServiceNotSupportedInActiveSession => {
                write!(f, "ServiceNotSupportedInActiveSession")
            }
            Nrc::Unknown(value) => write!(f, "Unknown(0x{value:02X})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for byte in [0x10, 0x11, 0x12, 0x13, 0x21, 0x22, 0x31, 0x33, 0x78, 0x7F, 0x99] {
            let nrc = Nrc::from(byte);
            assert_eq!(u8::from(nrc), byte);
        }
    }

    #[test]
    fn request_out_of_range_is_named() {
        assert_eq!(Nrc::from(0x31), Nrc::RequestOutOfRange);
        assert_eq!(Nrc::from(0x31).to_string(), "RequestOutOfRange");
    }

    #[test]
    fn unknown_codes_stay_visible() {
        assert_eq!(Nrc::from(0xEE).to_string(), "Unknown(0xEE)");
    }
}
