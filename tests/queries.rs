//! Discovery, vehicle info, supported-PID and DTC scenarios.

use std::time::Duration;

use pretty_assertions::assert_eq;

use obd2_poll::transport::mock::MockBus;
use obd2_poll::{DtcStatus, Error, IgnitionType, Obd2};

const REFRESH_MS: u32 = 10;

fn client(bus: &MockBus) -> Obd2 {
    let obd = Obd2::with_transport(Box::new(bus.clone()), REFRESH_MS, true);
    obd.set_query_timeout(Duration::from_millis(200));
    obd
}

fn vin_frame() -> Vec<u8> {
    let mut frame = vec![0x49, 0x02];
    frame.extend_from_slice(b"1HGCM82633A123456");
    frame.push(0x00);
    frame
}

#[tokio::test]
async fn connection_probe_discovers_ecus_and_vehicle_info() {
    let bus = MockBus::new();
    // Primary ECU: live-data PID 0x08 only (spark ignition marker).
    bus.respond(0x7E0, &[0x01, 0x00], &[0x41, 0x00, 0x01, 0x00, 0x00, 0x00]);
    // Service 0x09: PIDs 2, 4, 6 - VIN supported, no ECU name.
    bus.respond(0x7E0, &[0x09, 0x00], &[0x49, 0x00, 0x54, 0x00, 0x00, 0x00]);
    bus.respond(0x7E0, &[0x09, 0x02], &vin_frame());

    let obd = client(&bus);
    assert!(obd.is_connection_active().await);

    let info = obd.get_vehicle_info().await;
    assert_eq!(info.vin, "1HGCM82633A123456");
    assert_eq!(info.ignition, IgnitionType::Spark);

    let ecus = obd.get_ecus().await;
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].id(), 0x7E0);
    assert_eq!(ecus[0].supported_pids(0x09), &[0x02, 0x04, 0x06]);
    assert_eq!(ecus[0].supported_pids(0x01), &[0x08]);
}

#[tokio::test]
async fn dead_bus_reports_inactive_and_clears_caches() {
    let bus = MockBus::new();
    let obd = client(&bus);

    assert!(!obd.is_connection_active().await);
    assert!(obd.get_ecus().await.is_empty());
    assert_eq!(obd.get_vehicle_info().await.ignition, IgnitionType::Unknown);
}

#[tokio::test]
async fn ecu_name_is_read_from_service_09_pid_0a() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x00], &[0x41, 0x00, 0x01, 0x00, 0x00, 0x00]);
    // Service 0x09: PIDs 2 and 10 (0x0A) supported.
    bus.respond(0x7E0, &[0x09, 0x00], &[0x49, 0x00, 0x40, 0x40, 0x00, 0x00]);
    bus.respond(0x7E0, &[0x09, 0x02], &vin_frame());
    bus.respond(0x7E0, &[0x09, 0x0A], &[0x49, 0x0A, b'E', b'C', b'M', 0x00]);

    let obd = client(&bus);
    assert!(obd.is_connection_active().await);

    let ecus = obd.get_ecus().await;
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].name(), Some("ECM"));
}

#[tokio::test]
async fn supported_pid_iteration_follows_range_boundaries() {
    let bus = MockBus::new();
    // Range 0x00: PID 1 plus the boundary PID 0x20.
    bus.respond(0x7E0, &[0x01, 0x00], &[0x41, 0x00, 0x80, 0x00, 0x00, 0x01]);
    // Range 0x20: PID 0x21 only, boundary absent - iteration stops.
    bus.respond(0x7E0, &[0x01, 0x20], &[0x41, 0x20, 0x80, 0x00, 0x00, 0x00]);

    let obd = client(&bus);
    let pids = obd.get_supported_pids(0x7E0, 0x01).await.unwrap();

    assert_eq!(pids, vec![0x01, 0x20, 0x21]);
    assert!(bus.sent(0x7E0).iter().any(|f| f == &[0x01, 0x20]));
    assert!(!bus.sent(0x7E0).iter().any(|f| f == &[0x01, 0x40]));
}

#[tokio::test]
async fn silent_ecu_yields_no_supported_pids() {
    let bus = MockBus::new();
    let obd = client(&bus);

    let pids = obd.get_supported_pids(0x7E0, 0x01).await.unwrap();
    assert!(pids.is_empty());

    // The empty first range stops the iteration immediately.
    assert_eq!(bus.sent(0x7E0), vec![vec![0x01, 0x00]]);
}

#[tokio::test]
async fn supported_pids_are_cached_after_first_query() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x00], &[0x41, 0x00, 0x01, 0x00, 0x00, 0x00]);
    bus.respond(0x7E0, &[0x09, 0x00], &[0x49, 0x00, 0x54, 0x00, 0x00, 0x00]);

    let obd = client(&bus);
    let first = obd.get_supported_pids(0x7E0, 0x01).await.unwrap();
    let polls = bus.sent(0x7E0).len();

    let second = obd.get_supported_pids(0x7E0, 0x01).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(bus.sent(0x7E0).len(), polls, "cached query went on the bus");
}

#[tokio::test]
async fn unsupported_service_is_rejected() {
    let bus = MockBus::new();
    let obd = client(&bus);

    let result = obd.get_supported_pids(0x7E0, 0x22).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn pid_supported_checks_membership() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x00], &[0x41, 0x00, 0x01, 0x00, 0x00, 0x00]);

    let obd = client(&bus);
    assert!(obd.pid_supported(0x7E0, 0x01, 0x08).await.unwrap());
    assert!(!obd.pid_supported(0x7E0, 0x01, 0x0C).await.unwrap());
    assert!(!obd.pid_supported(0x7E0, 0x01, 0x1234).await.unwrap());
}

#[tokio::test]
async fn dtc_query_decodes_stored_codes() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x03], &[0x43, 0x01, 0x43, 0x00]);
    bus.respond(0x7E0, &[0x07], &[0x47, 0x00, 0x00]);
    // Permanent query (0x0A) stays silent.

    let obd = client(&bus);
    let dtcs = obd.get_dtcs(0x7E0).await.unwrap();

    assert_eq!(dtcs.len(), 1);
    assert_eq!(dtcs[0].code_string(), "P0143");
    assert_eq!(dtcs[0].status, DtcStatus::Stored);
}

#[tokio::test]
async fn dtc_statuses_come_from_their_own_services() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x03], &[0x43, 0x01, 0x43, 0x00, 0x00]);
    bus.respond(0x7E0, &[0x07], &[0x47, 0x44, 0x20]);
    bus.respond(0x7E0, &[0x0A], &[0x4A, 0xC1, 0x00]);

    let obd = client(&bus);
    let dtcs = obd.get_dtcs(0x7E0).await.unwrap();

    assert_eq!(dtcs.len(), 3);
    assert_eq!(dtcs[0].code_string(), "P0143");
    assert_eq!(dtcs[0].status, DtcStatus::Stored);
    assert_eq!(dtcs[1].code_string(), "C0420");
    assert_eq!(dtcs[1].status, DtcStatus::Pending);
    assert_eq!(dtcs[2].code_string(), "U0100");
    assert_eq!(dtcs[2].status, DtcStatus::Permanent);
}

#[tokio::test]
async fn clear_dtcs_sends_service_04() {
    let bus = MockBus::new();
    let obd = client(&bus);

    obd.clear_dtcs(0x7E0).unwrap();
    assert_eq!(bus.sent(0x7E0), vec![vec![0x04]]);
}

#[tokio::test]
async fn query_apis_reject_out_of_range_ecus() {
    let bus = MockBus::new();
    let obd = client(&bus);

    assert!(matches!(
        obd.get_supported_pids(0x7DF, 0x01).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        obd.get_dtcs(0x7E8).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        obd.clear_dtcs(0x123),
        Err(Error::InvalidArgument(_))
    ));
}
