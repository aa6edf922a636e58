//! OBD-II service and PID constants

/// Standard OBD-II service identifiers handled by this crate.
pub mod service {
    /// Current (live) data
    pub const LIVE_DATA: u8 = 0x01;
    /// Freeze-frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Stored diagnostic trouble codes
    pub const STORED_DTCS: u8 = 0x03;
    /// Clear diagnostic information
    pub const CLEAR_DTCS: u8 = 0x04;
    /// Pending diagnostic trouble codes
    pub const PENDING_DTCS: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent diagnostic trouble codes
    pub const PERMANENT_DTCS: u8 = 0x0A;
}

/// Well-known PIDs the standardized queries rely on.
pub mod pid {
    /// First supported-PID range of every service.
    pub const SUPPORTED_BASE: u8 = 0x00;
    /// VIN (service 0x09)
    pub const VIN: u8 = 0x02;
    /// ECU name (service 0x09)
    pub const ECU_NAME: u8 = 0x0A;
    /// Commanded secondary air status; advertised only by spark engines
    /// (service 0x01)
    pub const SPARK_MARKER: u8 = 0x08;
    /// Intake manifold pressure; the compression-engine fallback marker
    /// (service 0x01)
    pub const COMPRESSION_MARKER: u8 = 0x0B;
}
