//! Vehicle-level information gathered from the primary ECU.

use std::fmt;

use serde::Serialize;

/// Engine ignition type, derived from which live-data PIDs the primary ECU
/// advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnitionType {
    Spark,
    Compression,
    #[default]
    Unknown,
}

impl fmt::Display for IgnitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnitionType::Spark => "Spark",
            IgnitionType::Compression => "Compression",
            IgnitionType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// VIN and ignition type of the connected vehicle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VehicleInfo {
    /// 17-character VIN, empty when the vehicle never reported one.
    pub vin: String,
    pub ignition: IgnitionType,
}
