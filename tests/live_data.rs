//! End-to-end polling scenarios over the in-memory bus.

use std::time::Duration;

use obd2_poll::transport::mock::MockBus;
use obd2_poll::{Error, Obd2};

const REFRESH_MS: u32 = 10;

fn client(bus: &MockBus) -> Obd2 {
    let obd = Obd2::with_transport(Box::new(bus.clone()), REFRESH_MS, true);
    obd.set_query_timeout(Duration::from_millis(200));
    obd
}

/// Poll a condition until it holds or ~3 s pass.
async fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..600 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn live_rpm_request_is_polled_and_decoded() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x0C], &[0x41, 0x0C, 0x1A, 0xF8]);

    let obd = client(&bus);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();

    assert!(wait_for(|| rpm.value().map(|v| !v.is_nan()).unwrap_or(false)).await);

    assert_eq!(rpm.value().unwrap(), 1726.0);
    assert_eq!(rpm.raw().unwrap(), vec![0x1A, 0xF8]);
    assert_eq!(bus.sent(0x7E0)[0], vec![0x01, 0x0C]);
}

#[tokio::test]
async fn negative_response_yields_nan_and_empty_raw() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x0C], &[0x7F, 0x01, 0x31]);

    let obd = client(&bus);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();

    // Give the poller a few cycles to see the rejection.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(rpm.value().unwrap().is_nan());
    assert!(rpm.raw().unwrap().is_empty());
}

#[tokio::test]
async fn chained_pids_share_one_frame() {
    let bus = MockBus::new();
    bus.respond(
        0x7E0,
        &[0x01, 0x0C, 0x0D],
        &[0x41, 0x0C, 0x1A, 0xF8, 0x0D, 0x37],
    );

    let obd = client(&bus);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();
    let speed = obd.add_request(0x7E0, 0x01, 0x0D, "a", true).unwrap();

    assert!(wait_for(|| speed.raw().map(|r| !r.is_empty()).unwrap_or(false)).await);

    assert_eq!(rpm.raw().unwrap(), vec![0x1A, 0xF8]);
    assert_eq!(rpm.value().unwrap(), 1726.0);
    assert_eq!(speed.raw().unwrap(), vec![0x37]);
    assert_eq!(speed.value().unwrap(), 55.0);

    assert!(bus.sent(0x7E0).iter().any(|f| f == &[0x01, 0x0C, 0x0D]));
}

#[tokio::test]
async fn chaining_disabled_keeps_commands_separate() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x0C], &[0x41, 0x0C, 0x1A, 0xF8]);
    bus.respond(0x7E0, &[0x01, 0x0D], &[0x41, 0x0D, 0x37]);

    let obd = Obd2::with_transport(Box::new(bus.clone()), REFRESH_MS, false);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();
    let speed = obd.add_request(0x7E0, 0x01, 0x0D, "a", true).unwrap();

    assert!(wait_for(|| {
        let rpm_live = rpm.raw().map(|r| !r.is_empty()).unwrap_or(false);
        let speed_live = speed.raw().map(|r| !r.is_empty()).unwrap_or(false);
        rpm_live && speed_live
    })
    .await);

    assert_eq!(rpm.value().unwrap(), 1726.0);
    assert_eq!(speed.value().unwrap(), 55.0);
    assert!(!bus.sent(0x7E0).iter().any(|f| f.len() > 2));
}

#[tokio::test]
async fn at_most_six_pids_ride_one_command() {
    let bus = MockBus::new();
    let obd = client(&bus);

    let mut requests = Vec::new();
    for pid in 1..=7u16 {
        requests.push(obd.add_request(0x7E0, 0x01, pid, "a", true).unwrap());
    }

    assert!(wait_for(|| {
        let sent = bus.sent(0x7E0);
        sent.iter().any(|f| f.len() == 7) && sent.iter().any(|f| f == &[0x01, 0x07])
    })
    .await);

    // The six-PID frame never grows an extra PID.
    assert!(!bus.sent(0x7E0).iter().any(|f| f.len() > 7));
}

#[tokio::test]
async fn one_shot_request_keeps_first_payload() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x05], &[0x41, 0x05, 0x5A]);

    let obd = client(&bus);
    let coolant = obd.add_request(0x7E0, 0x01, 0x05, "a-40", false).unwrap();

    assert!(wait_for(|| coolant.raw().map(|r| !r.is_empty()).unwrap_or(false)).await);

    assert_eq!(coolant.value().unwrap(), 50.0);
    let first = coolant.raw().unwrap();
    assert_eq!(first, vec![0x5A]);

    // A one-shot command stops being polled once it has answered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let polls = bus.sent(0x7E0).len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.sent(0x7E0).len(), polls);

    assert_eq!(coolant.raw().unwrap(), first);
}

#[tokio::test]
async fn stop_halts_polling_and_resume_restarts_it() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x0C], &[0x41, 0x0C, 0x00, 0x64]);

    let obd = client(&bus);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();

    assert!(wait_for(|| rpm.value().map(|v| !v.is_nan()).unwrap_or(false)).await);

    rpm.stop().unwrap();
    assert!(!rpm.refresh());

    // Let in-flight polls drain, then the bus must go quiet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let polls = bus.sent(0x7E0).len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.sent(0x7E0).len(), polls, "stopped request still polled");

    rpm.resume().unwrap();
    assert!(wait_for(|| bus.sent(0x7E0).len() > polls).await);
}

#[tokio::test]
async fn remove_request_tears_down_the_command() {
    let bus = MockBus::new();
    bus.respond(0x7E0, &[0x01, 0x0C], &[0x41, 0x0C, 0x1A, 0xF8]);

    let obd = client(&bus);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();
    obd.remove_request(rpm).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let polls = bus.sent(0x7E0).len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.sent(0x7E0).len(), polls, "removed request still polled");

    // The identity is free again.
    let _rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();
}

#[tokio::test]
async fn duplicate_requests_are_rejected() {
    let bus = MockBus::new();
    let obd = client(&bus);

    let _rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();

    let duplicate = obd.add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true);
    assert!(matches!(duplicate, Err(Error::InvalidArgument(_))));

    // A different formula is a different request.
    let _raw = obd.add_request(0x7E0, 0x01, 0x0C, "", true).unwrap();
}

#[tokio::test]
async fn out_of_range_ecu_ids_are_rejected() {
    let bus = MockBus::new();
    let obd = client(&bus);

    for ecu_id in [0x7DF, 0x7E8, 0x123] {
        let result = obd.add_request(ecu_id, 0x01, 0x0C, "a", true);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}

#[tokio::test]
async fn bad_formula_is_rejected_at_add() {
    let bus = MockBus::new();
    let obd = client(&bus);

    let result = obd.add_request(0x7E0, 0x01, 0x0C, "a+*2", true);
    assert!(matches!(result, Err(Error::Parse { .. })));
}

#[tokio::test]
async fn dropped_client_detaches_requests() {
    let bus = MockBus::new();
    let obd = client(&bus);
    let rpm = obd
        .add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)
        .unwrap();

    drop(obd);

    assert!(matches!(rpm.value(), Err(Error::Detached)));
    assert!(matches!(rpm.raw(), Err(Error::Detached)));
    assert!(matches!(rpm.stop(), Err(Error::Detached)));
}

#[tokio::test]
async fn refreshed_callback_fires_every_tick() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let bus = MockBus::new();
    let obd = client(&bus);

    let ticks = Arc::new(AtomicU32::new(0));
    let counter = ticks.clone();
    obd.set_refreshed_cb(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    assert!(wait_for(|| ticks.load(Ordering::Relaxed) >= 3).await);
}
