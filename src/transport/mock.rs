//! In-memory transport for tests and off-vehicle development

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{IsoTpEndpoint, Transport};
use crate::error::Result;

#[derive(Default)]
struct BusState {
    /// Per tx id: request (exact or prefix) => response to queue.
    responses: HashMap<u32, Vec<(Vec<u8>, Vec<u8>)>>,
    /// Frames waiting to be read, per (tx, rx) endpoint.
    queues: HashMap<(u32, u32), VecDeque<Vec<u8>>>,
    /// Everything sent, per tx id, in order.
    sent: HashMap<u32, Vec<Vec<u8>>>,
}

/// A simulated ISO-TP bus. Cloning shares the bus, so a test can keep a
/// handle while the client owns the transport.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to requests on `tx_id` that equal or start with `request`.
    /// Exact matches win over prefix matches; an empty response simulates an
    /// ECU that swallows the request.
    pub fn respond(&self, tx_id: u32, request: &[u8], response: &[u8]) {
        self.state
            .lock()
            .responses
            .entry(tx_id)
            .or_default()
            .push((request.to_vec(), response.to_vec()));
    }

    /// Queue an unsolicited frame on the (tx, rx) endpoint.
    pub fn inject(&self, tx_id: u32, rx_id: u32, frame: &[u8]) {
        self.state
            .lock()
            .queues
            .entry((tx_id, rx_id))
            .or_default()
            .push_back(frame.to_vec());
    }

    /// All frames sent to `tx_id` so far.
    pub fn sent(&self, tx_id: u32) -> Vec<Vec<u8>> {
        self.state.lock().sent.get(&tx_id).cloned().unwrap_or_default()
    }
}

impl Transport for MockBus {
    fn open(&self, tx_id: u32, rx_id: u32) -> Result<Box<dyn IsoTpEndpoint>> {
        Ok(Box::new(MockEndpoint {
            tx_id,
            rx_id,
            state: self.state.clone(),
        }))
    }
}

struct MockEndpoint {
    tx_id: u32,
    rx_id: u32,
    state: Arc<Mutex<BusState>>,
}

impl MockEndpoint {
    fn find_response(state: &BusState, tx_id: u32, request: &[u8]) -> Option<Vec<u8>> {
        let table = state.responses.get(&tx_id)?;

        if let Some((_, response)) = table.iter().find(|(req, _)| req == request) {
            return Some(response.clone());
        }

        table
            .iter()
            .find(|(req, _)| request.starts_with(req))
            .map(|(_, response)| response.clone())
    }
}

impl IsoTpEndpoint for MockEndpoint {
    fn tx_id(&self) -> u32 {
        self.tx_id
    }

    fn rx_id(&self) -> u32 {
        self.rx_id
    }

    fn send(&mut self, payload: &[u8]) {
        let mut state = self.state.lock();
        state.sent.entry(self.tx_id).or_default().push(payload.to_vec());

        let Some(response) = Self::find_response(&state, self.tx_id, payload) else {
            trace!(tx_id = self.tx_id, "mock bus: no response configured");
            return;
        };

        if !response.is_empty() {
            state
                .queues
                .entry((self.tx_id, self.rx_id))
                .or_default()
                .push_back(response);
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        let Some(frame) = state
            .queues
            .get_mut(&(self.tx_id, self.rx_id))
            .and_then(VecDeque::pop_front)
        else {
            return 0;
        };

        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        n
    }
}
