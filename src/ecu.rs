//! ECU records assembled during bus discovery.

use std::collections::HashMap;

use serde::Serialize;

/// One ECU discovered on the bus: its request id, an optional name reported
/// through service 0x09 PID 0x0A, and the supported-PID lists fetched so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EcuRecord {
    id: u32,
    name: Option<String>,
    /// service => PIDs advertised by the supported-PID ranges
    supported_pids: HashMap<u8, Vec<u8>>,
}

impl EcuRecord {
    pub(crate) fn new(id: u32, name: Option<String>) -> Self {
        Self {
            id,
            name,
            supported_pids: HashMap::new(),
        }
    }

    pub(crate) fn set_supported_pids(&mut self, service: u8, pids: Vec<u8>) {
        self.supported_pids.insert(service, pids);
    }

    /// Request CAN id of this ECU (0x7E0..=0x7E7).
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// PIDs the ECU advertises for a service; empty when never fetched.
    pub fn supported_pids(&self, service: u8) -> &[u8] {
        self.supported_pids
            .get(&service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_service_reads_empty() {
        let ecu = EcuRecord::new(0x7E0, None);
        assert!(ecu.supported_pids(0x01).is_empty());
    }

    #[test]
    fn stored_pids_are_returned() {
        let mut ecu = EcuRecord::new(0x7E0, Some("ECM".into()));
        ecu.set_supported_pids(0x01, vec![0x0C, 0x0D]);

        assert_eq!(ecu.id(), 0x7E0);
        assert_eq!(ecu.name(), Some("ECM"));
        assert_eq!(ecu.supported_pids(0x01), &[0x0C, 0x0D]);
    }
}
