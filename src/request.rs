//! User-facing request handles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::formula::Formula;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state behind a [`Request`] handle. The client's maps and the
/// request's combination both reference it.
pub(crate) struct RequestState {
    pub(crate) id: u64,
    pub(crate) ecu_id: u32,
    pub(crate) service: u8,
    pub(crate) pid: u16,
    pub(crate) formula_str: String,
    pub(crate) formula: Formula,
    refresh: AtomicBool,
    value: Mutex<ValueCache>,
}

struct ValueCache {
    raw: Option<Vec<u8>>,
    value: f64,
}

impl RequestState {
    pub(crate) fn new(
        ecu_id: u32,
        service: u8,
        pid: u16,
        formula: Formula,
        refresh: bool,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            ecu_id,
            service,
            pid,
            formula_str: formula.source().to_string(),
            formula,
            refresh: AtomicBool::new(refresh),
            value: Mutex::new(ValueCache {
                raw: None,
                value: f64::NAN,
            }),
        }
    }

    pub(crate) fn refresh(&self) -> bool {
        self.refresh.load(Ordering::Acquire)
    }

    pub(crate) fn set_refresh(&self, refresh: bool) {
        self.refresh.store(refresh, Ordering::Release);
    }

    pub(crate) fn expected_size(&self) -> usize {
        self.formula.expected_size()
    }
}

/// One live data point: an (ECU, service, PID) triple with an optional
/// decoding formula. Handles stay valid while their client lives; every
/// accessor that needs the client reports [`Error::Detached`] afterwards.
pub struct Request {
    state: Arc<RequestState>,
    client: Weak<ClientInner>,
}

impl Request {
    pub(crate) fn new(state: Arc<RequestState>, client: Weak<ClientInner>) -> Self {
        Self { state, client }
    }

    pub(crate) fn state(&self) -> &Arc<RequestState> {
        &self.state
    }

    pub fn ecu_id(&self) -> u32 {
        self.state.ecu_id
    }

    pub fn service(&self) -> u8 {
        self.state.service
    }

    pub fn pid(&self) -> u16 {
        self.state.pid
    }

    pub fn formula(&self) -> &str {
        &self.state.formula_str
    }

    /// Payload bytes the decoding formula addresses.
    pub fn expected_size(&self) -> usize {
        self.state.expected_size()
    }

    /// Whether this request is being refreshed by the poller.
    pub fn refresh(&self) -> bool {
        self.state.refresh()
    }

    /// Stop periodic polling for this request. The shared command keeps
    /// running while other requests on it are still live.
    pub fn stop(&self) -> Result<()> {
        self.client()?.stop_request(&self.state)
    }

    /// Resume periodic polling.
    pub fn resume(&self) -> Result<()> {
        self.client()?.resume_request(&self.state)
    }

    /// Decoded value of the latest response. NaN while no payload has been
    /// seen (or the ECU rejected the request). Raw-mode requests (empty
    /// formula) should use [`Request::raw`] instead.
    pub fn value(&self) -> Result<f64> {
        let client = self.client()?;
        let mut cache = self.state.value.lock();

        self.refetch(&client, &mut cache)?;

        cache.value = match cache.raw.as_deref() {
            Some([]) | None => f64::NAN,
            Some(raw) => self.state.formula.eval(raw),
        };

        Ok(cache.value)
    }

    /// Raw payload bytes of the latest response; empty while none arrived.
    pub fn raw(&self) -> Result<Vec<u8>> {
        let client = self.client()?;
        let mut cache = self.state.value.lock();

        self.refetch(&client, &mut cache)?;

        Ok(cache.raw.clone().unwrap_or_default())
    }

    /// Refresh the cached payload. Non-refresh requests keep the first
    /// non-empty payload they ever saw.
    fn refetch(&self, client: &Arc<ClientInner>, cache: &mut ValueCache) -> Result<()> {
        let stale = self.state.refresh() || cache.raw.as_deref().map_or(true, <[u8]>::is_empty);
        if stale {
            cache.raw = Some(client.get_data(&self.state)?);
        }
        Ok(())
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.client.upgrade().ok_or(Error::Detached)
    }
}
