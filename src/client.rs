//! Top-level OBD-II client facade.
//!
//! [`Obd2`] owns the polling engine and deduplicates user requests into the
//! minimum set of on-bus commands. It also runs the standardized queries:
//! ECU discovery, supported-PID enumeration, vehicle info and DTC handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::combination::{ReqCombination, MAX_CHAINED_PIDS};
use crate::dtc::{decode_dtc_pairs, Dtc, DtcStatus};
use crate::ecu::EcuRecord;
use crate::error::{Error, Result};
use crate::formula::Formula;
use crate::obd::{pid, service};
use crate::protocol::{CommandStatus, Protocol, DEFAULT_SAMPLE_INTERVAL};
use crate::request::{Request, RequestState};
use crate::transport::Transport;
use crate::vehicle::{IgnitionType, VehicleInfo};

/// First unicast ECU request id; also the primary ECU used for vehicle info.
pub const ECU_ID_FIRST: u32 = 0x7E0;
/// Last unicast ECU request id.
pub const ECU_ID_LAST: u32 = 0x7E7;
/// Functional broadcast id, reserved for internal use.
pub const ECU_ID_BROADCAST: u32 = 0x7DF;

/// Responses arrive on the request id plus this offset.
const ECU_ID_RESPONSE_OFFSET: u32 = 0x08;

/// Each supported-PID range covers 0x20 PIDs.
const PID_SUPPORT_RANGE: u8 = 0x20;

/// Default deadline for the one-shot standard queries.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Asynchronous OBD-II client over one CAN interface. Move-only; dropping
/// it stops the poller and detaches all outstanding [`Request`] handles.
pub struct Obd2 {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    self_weak: Weak<ClientInner>,
    requests: Mutex<RequestTable>,
    discovery: Mutex<DiscoveryCache>,
    enable_pid_chaining: AtomicBool,
    query_timeout_ms: AtomicU64,
    protocol: Protocol,
}

#[derive(Default)]
struct RequestTable {
    states: Vec<Arc<RequestState>>,
    combinations: Vec<Arc<Mutex<ReqCombination>>>,
    by_request: HashMap<u64, Arc<Mutex<ReqCombination>>>,
}

#[derive(Default)]
struct DiscoveryCache {
    ecus: HashMap<u32, EcuRecord>,
    vehicle: Option<VehicleInfo>,
}

impl Obd2 {
    /// Open a client on a named CAN interface. Fails when the interface
    /// does not exist.
    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    pub fn new(interface: &str, refresh_ms: u32, enable_pid_chaining: bool) -> Result<Self> {
        let transport = crate::transport::socketcan::SocketCanTransport::new(interface)?;
        Ok(Self::with_transport(
            Box::new(transport),
            refresh_ms,
            enable_pid_chaining,
        ))
    }

    /// Open a client over any transport, e.g. the in-memory mock bus.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        refresh_ms: u32,
        enable_pid_chaining: bool,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_weak| ClientInner {
                self_weak: self_weak.clone(),
                requests: Mutex::new(RequestTable::default()),
                discovery: Mutex::new(DiscoveryCache::default()),
                enable_pid_chaining: AtomicBool::new(enable_pid_chaining),
                query_timeout_ms: AtomicU64::new(DEFAULT_QUERY_TIMEOUT.as_millis() as u64),
                protocol: Protocol::new(transport, refresh_ms),
            }),
        }
    }

    /// Change the polling period; takes effect from the next tick.
    pub fn set_refresh_ms(&self, refresh_ms: u32) {
        self.inner.protocol.set_refresh_ms(refresh_ms);
    }

    /// Allow or forbid packing multiple service 0x01/0x02 PIDs into one
    /// frame. Only affects combinations created afterwards.
    pub fn set_enable_pid_chaining(&self, enable: bool) {
        self.inner
            .enable_pid_chaining
            .store(enable, Ordering::Release);
    }

    /// Deadline for the one-shot standard queries (discovery, VIN, DTCs).
    pub fn set_query_timeout(&self, timeout: Duration) {
        self.inner
            .query_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Install a callback invoked after every polling tick.
    pub fn set_refreshed_cb(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.protocol.set_refreshed_cb(callback);
    }

    /// Register a request. Rejects duplicates of the same
    /// (ECU, service, PID, formula) tuple and ECU ids outside the unicast
    /// range 0x7E0..=0x7E7.
    pub fn add_request(
        &self,
        ecu_id: u32,
        service: u8,
        pid: u16,
        formula: &str,
        refresh: bool,
    ) -> Result<Request> {
        check_ecu_id(ecu_id)?;
        let parsed = Formula::parse(formula)?;

        let chain = refresh
            && !formula.trim().is_empty()
            && self.inner.enable_pid_chaining.load(Ordering::Acquire);

        let (state, combination) = {
            let mut table = self.inner.requests.lock();

            let duplicate = table.states.iter().any(|s| {
                s.ecu_id == ecu_id
                    && s.service == service
                    && s.pid == pid
                    && s.formula_str == formula
            });
            if duplicate {
                return Err(Error::InvalidArgument(
                    "a request with these parameters already exists".to_string(),
                ));
            }

            let state = Arc::new(RequestState::new(ecu_id, service, pid, parsed, refresh));
            let combination =
                self.inner
                    .find_or_create_combination(&mut table, ecu_id, service, pid, chain)?;

            combination.lock().add_request(state.clone());
            table.states.push(state.clone());
            table.by_request.insert(state.id, combination.clone());

            (state, combination)
        };

        // One-shot requests leave their command stopped once it answers.
        if !refresh {
            combination.lock().request_stopped()?;
        }

        debug!(
            ecu_id = format_args!("0x{ecu_id:03X}"),
            service = format_args!("0x{service:02X}"),
            pid = format_args!("0x{pid:02X}"),
            refresh,
            "request added"
        );

        Ok(Request::new(state, Arc::downgrade(&self.inner)))
    }

    /// Unregister a request, dropping its combination (and command) when it
    /// was the last member.
    pub fn remove_request(&self, request: Request) -> Result<()> {
        let state = request.state().clone();

        // Stopping first mirrors teardown on the ECU side; a detached
        // protocol is fine here since we are removing anyway.
        let _ = self.inner.stop_request(&state);

        let mut table = self.inner.requests.lock();
        let combination = table
            .by_request
            .remove(&state.id)
            .ok_or_else(|| Error::InvalidArgument("request is not registered".to_string()))?;
        table.states.retain(|s| s.id != state.id);

        if combination.lock().remove_request(&state) {
            table
                .combinations
                .retain(|c| !Arc::ptr_eq(c, &combination));
        }

        Ok(())
    }

    /// Probe the primary ECU. On first success the ECU map and vehicle info
    /// are populated; on failure both caches are cleared.
    pub async fn is_connection_active(&self) -> bool {
        self.inner.connection_active().await
    }

    /// Discovered ECUs, refreshing the connection state first.
    pub async fn get_ecus(&self) -> Vec<EcuRecord> {
        self.inner.connection_active().await;

        let mut ecus: Vec<EcuRecord> = {
            let discovery = self.inner.discovery.lock();
            discovery.ecus.values().cloned().collect()
        };
        ecus.sort_by_key(EcuRecord::id);
        ecus
    }

    /// VIN and ignition type, refreshing the connection state first.
    pub async fn get_vehicle_info(&self) -> VehicleInfo {
        self.inner.connection_active().await;

        let discovery = self.inner.discovery.lock();
        discovery.vehicle.clone().unwrap_or_default()
    }

    /// PIDs an ECU advertises for service 0x01, 0x02 or 0x09; cached after
    /// the first query.
    pub async fn get_supported_pids(&self, ecu_id: u32, service: u8) -> Result<Vec<u8>> {
        check_ecu_id(ecu_id)?;
        self.inner.supported_pids(ecu_id, service).await
    }

    /// Whether an ECU advertises a PID for a service.
    pub async fn pid_supported(&self, ecu_id: u32, service: u8, pid: u16) -> Result<bool> {
        let pids = self.get_supported_pids(ecu_id, service).await?;
        Ok(u8::try_from(pid).map_or(false, |p| pids.contains(&p)))
    }

    /// Stored, pending and permanent trouble codes of one ECU.
    pub async fn get_dtcs(&self, ecu_id: u32) -> Result<Vec<Dtc>> {
        check_ecu_id(ecu_id)?;

        let mut dtcs = Vec::new();
        for status in DtcStatus::ALL {
            let (cmd_status, data) = self
                .inner
                .one_shot(ecu_id, status.service(), Vec::new())
                .await?;

            if cmd_status != CommandStatus::Ok || data.len() < 2 {
                continue;
            }
            dtcs.extend(decode_dtc_pairs(&data, status));
        }

        debug!(
            ecu_id = format_args!("0x{ecu_id:03X}"),
            count = dtcs.len(),
            "DTC query finished"
        );
        Ok(dtcs)
    }

    /// Clear an ECU's trouble codes (service 0x04). Fire and forget: the
    /// acknowledgement is not awaited.
    pub fn clear_dtcs(&self, ecu_id: u32) -> Result<()> {
        check_ecu_id(ecu_id)?;

        // Registering the one-shot sends the frame; dropping the handle
        // tears it down again.
        let _cmd = self.inner.protocol.command(
            ecu_id,
            ecu_id + ECU_ID_RESPONSE_OFFSET,
            service::CLEAR_DTCS,
            Vec::new(),
            false,
        )?;
        Ok(())
    }

}

fn check_ecu_id(ecu_id: u32) -> Result<()> {
    if !(ECU_ID_FIRST..=ECU_ID_LAST).contains(&ecu_id) {
        return Err(Error::InvalidArgument(format!(
            "ECU id 0x{ecu_id:03X} outside 0x{ECU_ID_FIRST:03X}..=0x{ECU_ID_LAST:03X}"
        )));
    }
    Ok(())
}

/// Only the live-data services pack multiple PIDs into one frame.
fn chainable_service(service: u8) -> bool {
    matches!(service, service::LIVE_DATA | service::FREEZE_FRAME)
}

impl ClientInner {
    /// Select the combination a new request joins: first one whose command
    /// already polls the PID, then (when chaining) one with room for it,
    /// otherwise a fresh combination.
    fn find_or_create_combination(
        &self,
        table: &mut RequestTable,
        ecu_id: u32,
        service: u8,
        pid: u16,
        chain: bool,
    ) -> Result<Arc<Mutex<ReqCombination>>> {
        for combination in &table.combinations {
            let c = combination.lock();
            if c.command().tx_id() == ecu_id && c.command().sid() == service && c.contains_pid(pid)
            {
                return Ok(combination.clone());
            }
        }

        if chain && chainable_service(service) {
            for combination in &table.combinations {
                let c = combination.lock();
                if c.command().tx_id() != ecu_id || c.command().sid() != service {
                    continue;
                }
                if !c.allow_pid_chain() {
                    continue;
                }
                if c.pid_count() >= MAX_CHAINED_PIDS && !c.contains_pid(pid) {
                    continue;
                }
                return Ok(combination.clone());
            }
        }

        let cmd = self.protocol.command(
            ecu_id,
            ecu_id + ECU_ID_RESPONSE_OFFSET,
            service,
            vec![pid],
            true,
        )?;
        let combination = Arc::new(Mutex::new(ReqCombination::new(
            cmd,
            chain && chainable_service(service),
        )));
        table.combinations.push(combination.clone());
        Ok(combination)
    }

    pub(crate) fn stop_request(&self, state: &Arc<RequestState>) -> Result<()> {
        if !state.refresh() {
            return Ok(());
        }
        state.set_refresh(false);

        let combination = self
            .requests
            .lock()
            .by_request
            .get(&state.id)
            .cloned()
            .ok_or(Error::Detached)?;
        let combination = combination.lock();
        combination.request_stopped()
    }

    pub(crate) fn resume_request(&self, state: &Arc<RequestState>) -> Result<()> {
        if state.refresh() {
            return Ok(());
        }
        state.set_refresh(true);

        let combination = self
            .requests
            .lock()
            .by_request
            .get(&state.id)
            .cloned()
            .ok_or(Error::Detached)?;
        let combination = combination.lock();
        combination.request_resumed()
    }

    /// Payload bytes for one request, decoded out of its combination's
    /// shared response buffer.
    pub(crate) fn get_data(&self, state: &Arc<RequestState>) -> Result<Vec<u8>> {
        let combination = self
            .requests
            .lock()
            .by_request
            .get(&state.id)
            .cloned()
            .ok_or(Error::Detached)?;
        let combination = combination.lock();
        let cmd = combination.command();

        if cmd.status() == CommandStatus::Error {
            return Ok(Vec::new());
        }

        let data = cmd.buffer();
        if data.is_empty() {
            return Ok(data);
        }

        // Single PID: strip the echoed PID byte off the front.
        if combination.pid_count() == 1 {
            return Ok(data[1..].to_vec());
        }

        // Chained response: [pid, payload...] groups in frame order.
        let mut i = 0;
        while i < data.len() {
            if u16::from(data[i]) == state.pid {
                let start = i + 1;
                let end = (start + state.expected_size()).min(data.len());
                return Ok(data[start..end].to_vec());
            }
            i += combination.var_count(u16::from(data[i])) + 1;
        }

        Ok(Vec::new())
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.load(Ordering::Acquire))
    }

    /// Issue a one-shot command and wait out its answer.
    pub(crate) async fn one_shot(
        &self,
        ecu_id: u32,
        sid: u8,
        pids: Vec<u16>,
    ) -> Result<(CommandStatus, Vec<u8>)> {
        let cmd = self.protocol.command(
            ecu_id,
            ecu_id + ECU_ID_RESPONSE_OFFSET,
            sid,
            pids,
            false,
        )?;

        let status = cmd
            .wait_for_response_with(self.query_timeout(), DEFAULT_SAMPLE_INTERVAL)
            .await;
        let data = cmd.buffer();
        Ok((status, data))
    }

    pub(crate) async fn connection_active(&self) -> bool {
        let probe = self
            .one_shot(
                ECU_ID_FIRST,
                service::LIVE_DATA,
                vec![u16::from(pid::SUPPORTED_BASE)],
            )
            .await;

        let alive = matches!(probe, Ok((CommandStatus::Ok, _)));
        if !alive {
            let mut discovery = self.discovery.lock();
            discovery.ecus.clear();
            discovery.vehicle = None;
            return false;
        }

        let discovered = { !self.discovery.lock().ecus.is_empty() };
        if !discovered {
            self.query_standard_ecus().await;
            self.query_vehicle_info().await;
        }

        true
    }

    /// Probe every unicast ECU id in parallel, keeping the responders.
    async fn query_standard_ecus(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let mut queries = JoinSet::new();

        for ecu_id in ECU_ID_FIRST..=ECU_ID_LAST {
            let inner = this.clone();
            queries.spawn(async move { inner.query_ecu(ecu_id, service::VEHICLE_INFO).await });
        }

        while let Some(result) = queries.join_next().await {
            let ecu = match result {
                Ok(Ok(ecu)) => ecu,
                // Per-ECU failures just leave the ECU out of the map.
                Ok(Err(e)) => {
                    warn!(error = %e, "ECU query failed");
                    continue;
                }
                Err(_) => continue,
            };

            if ecu.id() == 0 {
                continue;
            }

            debug!(
                ecu_id = format_args!("0x{:03X}", ecu.id()),
                name = ecu.name().unwrap_or("-"),
                "ECU discovered"
            );
            self.discovery.lock().ecus.insert(ecu.id(), ecu);
        }
    }

    /// Full probe of one ECU: supported-PID lists for the query service and
    /// the standard services, plus the ECU name when advertised. A record
    /// with id 0 means the ECU never answered.
    async fn query_ecu(&self, ecu_id: u32, query_service: u8) -> Result<EcuRecord> {
        let query_pids = self.supported_pids_uncached(ecu_id, query_service).await?;
        if query_pids.is_empty() {
            return Ok(EcuRecord::default());
        }

        let service09_pids = if query_service == service::VEHICLE_INFO {
            query_pids.clone()
        } else {
            self.supported_pids_uncached(ecu_id, service::VEHICLE_INFO).await?
        };

        // ECU name travels in service 0x09 PID 0x0A.
        let mut name = None;
        if service09_pids.contains(&pid::ECU_NAME) {
            let (status, data) = self
                .one_shot(ecu_id, service::VEHICLE_INFO, vec![u16::from(pid::ECU_NAME)])
                .await?;
            if status == CommandStatus::Ok && data.len() > 1 {
                name = Some(decode_text(&data[1..]));
            }
        }

        let mut record = EcuRecord::new(ecu_id, name);
        if query_service != service::LIVE_DATA {
            let pids = self.supported_pids_uncached(ecu_id, service::LIVE_DATA).await?;
            record.set_supported_pids(service::LIVE_DATA, pids);
        }
        if query_service != service::FREEZE_FRAME {
            let pids = self
                .supported_pids_uncached(ecu_id, service::FREEZE_FRAME)
                .await?;
            record.set_supported_pids(service::FREEZE_FRAME, pids);
        }
        record.set_supported_pids(service::VEHICLE_INFO, service09_pids);
        if query_service != service::VEHICLE_INFO {
            record.set_supported_pids(query_service, query_pids);
        }

        Ok(record)
    }

    async fn query_vehicle_info(&self) {
        let mut info = VehicleInfo::default();

        let vin_pids = self
            .supported_pids(ECU_ID_FIRST, service::VEHICLE_INFO)
            .await
            .unwrap_or_default();
        if vin_pids.contains(&pid::VIN) {
            if let Ok((CommandStatus::Ok, data)) = self
                .one_shot(ECU_ID_FIRST, service::VEHICLE_INFO, vec![u16::from(pid::VIN)])
                .await
            {
                if data.len() > 1 {
                    info.vin = decode_text(&data[1..]);
                }
            }
        }

        let live_pids = self
            .supported_pids(ECU_ID_FIRST, service::LIVE_DATA)
            .await
            .unwrap_or_default();
        info.ignition = if live_pids.contains(&pid::SPARK_MARKER) {
            IgnitionType::Spark
        } else if live_pids.contains(&pid::COMPRESSION_MARKER) {
            IgnitionType::Compression
        } else {
            IgnitionType::Unknown
        };

        debug!(vin = %info.vin, ignition = %info.ignition, "vehicle info queried");
        self.discovery.lock().vehicle = Some(info);
    }

    /// Cached supported-PID lookup; misses fall through to the bus.
    async fn supported_pids(&self, ecu_id: u32, service: u8) -> Result<Vec<u8>> {
        if !matches!(
            service,
            service::LIVE_DATA | service::FREEZE_FRAME | service::VEHICLE_INFO
        ) {
            return Err(Error::InvalidArgument(format!(
                "service 0x{service:02X} has no supported-PID ranges"
            )));
        }

        let cached = {
            let discovery = self.discovery.lock();
            discovery
                .ecus
                .get(&ecu_id)
                .map(|e| e.supported_pids(service).to_vec())
        };

        match cached {
            Some(pids) if !pids.is_empty() => Ok(pids),
            Some(_) => {
                // ECU known but this service never fetched.
                let pids = self.supported_pids_uncached(ecu_id, service).await?;
                if let Some(ecu) = self.discovery.lock().ecus.get_mut(&ecu_id) {
                    ecu.set_supported_pids(service, pids.clone());
                }
                Ok(pids)
            }
            None => {
                let record = self.query_ecu(ecu_id, service).await?;
                if record.id() == 0 {
                    return Ok(Vec::new());
                }
                let pids = record.supported_pids(service).to_vec();
                self.discovery.lock().ecus.insert(ecu_id, record);
                Ok(pids)
            }
        }
    }

    /// Walk the supported-PID ranges (0x00, 0x20, 0x40, ...) until a range
    /// comes back empty or stops advertising the next boundary PID.
    async fn supported_pids_uncached(&self, ecu_id: u32, service: u8) -> Result<Vec<u8>> {
        let mut pids = Vec::new();
        let mut offset: u8 = 0;

        loop {
            let in_range = self.supported_pid_range(ecu_id, service, offset).await?;
            if in_range.is_empty() {
                break;
            }
            pids.extend_from_slice(&in_range);

            let Some(next) = offset.checked_add(PID_SUPPORT_RANGE) else {
                break;
            };
            // The boundary PID doubles as "next range exists".
            if pids.last() != Some(&next) {
                break;
            }
            offset = next;
        }

        Ok(pids)
    }

    /// One supported-PID range query; empty when the ECU stays silent or
    /// rejects the request.
    async fn supported_pid_range(&self, ecu_id: u32, service: u8, offset: u8) -> Result<Vec<u8>> {
        let (status, data) = self
            .one_shot(ecu_id, service, vec![u16::from(offset)])
            .await?;

        if status != CommandStatus::Ok || data.len() < 2 {
            return Ok(Vec::new());
        }

        // Skip the echoed range PID.
        Ok(decode_supported_pids(&data[1..], offset))
    }
}

/// Expand a supported-PID bitmap: each byte's bits map MSB-first onto the
/// eight PIDs after the preceding ones.
fn decode_supported_pids(data: &[u8], offset: u8) -> Vec<u8> {
    let mut pids = Vec::new();
    let mut pid = offset;

    for &byte in data {
        for bit in (0..8).rev() {
            pid = pid.wrapping_add(1);
            if byte & (1 << bit) != 0 {
                pids.push(pid);
            }
        }
    }

    pids
}

/// Decode nul-terminated ASCII out of a response payload.
fn decode_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
