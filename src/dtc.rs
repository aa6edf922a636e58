//! Diagnostic trouble codes (OBD-II services 0x03, 0x07 and 0x0A)
//!
//! A DTC travels as two bytes on the bus: the top two bits of the first byte
//! select the category, the remaining 14 bits are the numeric code printed
//! as four hex nibbles (`P0143`).

use std::fmt;

use serde::Serialize;

use crate::obd::service;

/// DTC category encoded in the top two bits of the first raw byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    /// P codes - engine and transmission
    Powertrain,
    /// C codes - ABS, steering, suspension
    Chassis,
    /// B codes - airbags, climate, lighting
    Body,
    /// U codes - bus communication
    Network,
}

impl DtcCategory {
    /// Category from the first raw DTC byte.
    pub fn from_high_byte(byte: u8) -> Self {
        match (byte >> 6) & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    /// Letter prefix used in the printed code.
    pub fn prefix(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// Storage state of a trouble code. Each state is reported by its own
/// OBD-II service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcStatus {
    Stored,
    Pending,
    Permanent,
}

impl DtcStatus {
    /// All states, in query order.
    pub const ALL: [DtcStatus; 3] = [DtcStatus::Stored, DtcStatus::Pending, DtcStatus::Permanent];

    /// The service that reports codes in this state.
    pub fn service(&self) -> u8 {
        match self {
            DtcStatus::Stored => service::STORED_DTCS,
            DtcStatus::Pending => service::PENDING_DTCS,
            DtcStatus::Permanent => service::PERMANENT_DTCS,
        }
    }
}

impl fmt::Display for DtcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DtcStatus::Stored => "Stored",
            DtcStatus::Pending => "Pending",
            DtcStatus::Permanent => "Permanent",
        };
        f.write_str(s)
    }
}

/// A decoded diagnostic trouble code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dtc {
    pub category: DtcCategory,
    /// 14-bit numeric code, printed as four hex nibbles.
    pub code: u16,
    pub status: DtcStatus,
}

impl Dtc {
    /// Decode from the two raw bytes as they appear in the response.
    pub fn from_bytes(high: u8, low: u8, status: DtcStatus) -> Self {
        Self {
            category: DtcCategory::from_high_byte(high),
            code: u16::from_be_bytes([high & 0x3F, low]),
            status,
        }
    }

    /// Standard printed form, e.g. `P0143`.
    pub fn code_string(&self) -> String {
        format!(
            "{}{:01X}{:01X}{:01X}{:01X}",
            self.category.prefix(),
            (self.code >> 12) & 0x3,
            (self.code >> 8) & 0xF,
            (self.code >> 4) & 0xF,
            self.code & 0xF
        )
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code_string(), self.status)
    }
}

/// Decode a DTC response payload into codes. The payload is consumed as
/// byte pairs; all-zero pairs are padding and are skipped, as is a trailing
/// odd byte.
pub(crate) fn decode_dtc_pairs(data: &[u8], status: DtcStatus) -> Vec<Dtc> {
    data.chunks_exact(2)
        .filter(|pair| pair[0] != 0 || pair[1] != 0)
        .map(|pair| Dtc::from_bytes(pair[0], pair[1], status))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powertrain_code() {
        let dtc = Dtc::from_bytes(0x01, 0x43, DtcStatus::Stored);
        assert_eq!(dtc.category, DtcCategory::Powertrain);
        assert_eq!(dtc.code_string(), "P0143");
    }

    #[test]
    fn chassis_code() {
        let dtc = Dtc::from_bytes(0x44, 0x20, DtcStatus::Pending);
        assert_eq!(dtc.category, DtcCategory::Chassis);
        assert_eq!(dtc.code_string(), "C0420");
    }

    #[test]
    fn body_code() {
        let dtc = Dtc::from_bytes(0x92, 0x34, DtcStatus::Stored);
        assert_eq!(dtc.category, DtcCategory::Body);
        assert_eq!(dtc.code_string(), "B1234");
    }

    #[test]
    fn network_code() {
        let dtc = Dtc::from_bytes(0xC1, 0x00, DtcStatus::Permanent);
        assert_eq!(dtc.category, DtcCategory::Network);
        assert_eq!(dtc.code_string(), "U0100");
    }

    #[test]
    fn display_includes_status() {
        let dtc = Dtc::from_bytes(0x01, 0x43, DtcStatus::Stored);
        assert_eq!(dtc.to_string(), "P0143 (Stored)");
    }

    #[test]
    fn pair_decoding_skips_padding() {
        let dtcs = decode_dtc_pairs(&[0x01, 0x43, 0x00, 0x00, 0x44, 0x20], DtcStatus::Stored);
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].code_string(), "P0143");
        assert_eq!(dtcs[1].code_string(), "C0420");
    }

    #[test]
    fn pair_decoding_ignores_trailing_byte() {
        let dtcs = decode_dtc_pairs(&[0x01, 0x43, 0x00], DtcStatus::Stored);
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code_string(), "P0143");
    }

    #[test]
    fn status_service_mapping() {
        assert_eq!(DtcStatus::Stored.service(), 0x03);
        assert_eq!(DtcStatus::Pending.service(), 0x07);
        assert_eq!(DtcStatus::Permanent.service(), 0x0A);
    }
}
