//! Background polling engine.
//!
//! A [`Protocol`] owns the socket pool and the command registry for one CAN
//! interface and runs a dedicated listener thread. Each tick the listener
//! drains the polling queue (sending one frame per queued command and
//! spinning on its socket for the reply), sweeps every socket for stray
//! responses, fires the optional refreshed callback and sleeps out the rest
//! of the refresh period.

mod command;

pub use command::{
    CommandHandle, CommandStatus, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SAMPLE_INTERVAL,
};

pub(crate) use command::CommandCore;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::transport::{IsoTpEndpoint, Transport};

/// How long a queued command's reply is awaited within one tick.
const COMMAND_PROCESS_TIMEOUT: Duration = Duration::from_millis(1000);

/// Reduced wait for commands already marked [`CommandStatus::NoResponse`],
/// so one dead ECU cannot stall the whole queue.
const NO_RESPONSE_RETRY_TIMEOUT: Duration = Duration::from_millis(1);

/// Sleep between socket read attempts while spinning on a reply.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on one logical ISO-TP message.
const MSG_MAX: usize = 1024;

const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
const RESPONSE_SID_OFFSET: u8 = 0x40;

/// Response sids that carry DTC listings and therefore no PID byte.
const DTC_RESPONSE_SIDS: [u8; 3] = [0x43, 0x47, 0x4A];

struct SocketEntry {
    tx_id: u32,
    rx_id: u32,
    io: Mutex<Box<dyn IsoTpEndpoint>>,
}

struct CommandEntry {
    core: Arc<CommandCore>,
    socket: Arc<SocketEntry>,
    /// Live [`CommandHandle`]s referencing this core.
    handles: usize,
}

#[derive(Default)]
struct CommandTable {
    entries: Vec<CommandEntry>,
    pending: VecDeque<Arc<CommandCore>>,
}

type RefreshedCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct ProtocolInner {
    self_weak: Weak<ProtocolInner>,
    transport: Box<dyn Transport>,
    refresh_ms: AtomicU32,
    running: AtomicBool,
    sockets: Mutex<Vec<Arc<SocketEntry>>>,
    commands: Mutex<CommandTable>,
    refreshed_cb: Mutex<Option<RefreshedCallback>>,
}

/// Background poller for one bus. Move-only; dropping it stops and joins
/// the listener thread, detaching any commands still held by user code.
pub struct Protocol {
    inner: Arc<ProtocolInner>,
    listener: Option<thread::JoinHandle<()>>,
}

impl Protocol {
    /// Create a poller over `transport` and start its listener thread.
    pub fn new(transport: Box<dyn Transport>, refresh_ms: u32) -> Self {
        let inner = Arc::new_cyclic(|self_weak| ProtocolInner {
            self_weak: self_weak.clone(),
            transport,
            refresh_ms: AtomicU32::new(refresh_ms),
            running: AtomicBool::new(true),
            sockets: Mutex::new(Vec::new()),
            commands: Mutex::new(CommandTable::default()),
            refreshed_cb: Mutex::new(None),
        });

        let listener_inner = inner.clone();
        let listener = thread::spawn(move || {
            debug!("listener started");
            while listener_inner.running.load(Ordering::Acquire) {
                listener_inner.tick();
            }
            debug!("listener stopped");
        });

        Self {
            inner,
            listener: Some(listener),
        }
    }

    /// Change the polling period; takes effect from the next tick.
    pub fn set_refresh_ms(&self, refresh_ms: u32) {
        self.inner.refresh_ms.store(refresh_ms, Ordering::Release);
    }

    /// Install a callback invoked at the end of every polling tick.
    pub fn set_refreshed_cb(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.refreshed_cb.lock() = Some(Arc::new(callback));
    }

    /// Find or create the command with this identity and hand out a
    /// reference-counted handle to it. New commands get their first frame
    /// sent immediately; recurring ones additionally join the polling queue.
    pub fn command(
        &self,
        tx_id: u32,
        rx_id: u32,
        sid: u8,
        pids: Vec<u16>,
        refresh: bool,
    ) -> Result<CommandHandle> {
        self.inner.command(tx_id, rx_id, sid, pids, refresh)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ProtocolInner> {
        &self.inner
    }

    /// Test-only variant without a listener thread, so dispatch and queue
    /// state can be driven deterministically.
    #[cfg(test)]
    pub(crate) fn new_paused(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_weak| ProtocolInner {
                self_weak: self_weak.clone(),
                transport,
                refresh_ms: AtomicU32::new(1000),
                running: AtomicBool::new(false),
                sockets: Mutex::new(Vec::new()),
                commands: Mutex::new(CommandTable::default()),
                refreshed_cb: Mutex::new(None),
            }),
            listener: None,
        }
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

impl ProtocolInner {
    fn command(
        &self,
        tx_id: u32,
        rx_id: u32,
        sid: u8,
        pids: Vec<u16>,
        refresh: bool,
    ) -> Result<CommandHandle> {
        let (core, socket) = {
            let mut table = self.commands.lock();

            if let Some(entry) = table.entries.iter_mut().find(|e| {
                e.core.tx_id() == tx_id
                    && e.core.rx_id() == rx_id
                    && e.core.sid() == sid
                    && e.core.pids() == pids
            }) {
                entry.handles += 1;
                let core = entry.core.clone();
                drop(table);

                // A recurring handle upgrades a one-shot core.
                if refresh && !core.refresh() {
                    core.set_refresh(true);
                    self.enqueue(&core);
                }

                return Ok(CommandHandle::new(core, self.self_weak.clone()));
            }

            let socket = self.socket_for(tx_id, rx_id)?;
            let core = Arc::new(CommandCore::new(
                tx_id,
                rx_id,
                sid,
                pids,
                refresh,
                self.self_weak.clone(),
            ));

            table.entries.push(CommandEntry {
                core: core.clone(),
                socket: socket.clone(),
                handles: 1,
            });
            if refresh {
                table.pending.push_back(core.clone());
            }

            (core, socket)
        };

        // First frame goes out right away so one-shots do not have to wait
        // for the next tick.
        let frame = core.frame();
        socket.io.lock().send(&frame);
        trace!(
            tx_id = format_args!("0x{tx_id:03X}"),
            frame = %hex::encode(&frame),
            "registered command"
        );

        Ok(CommandHandle::new(core, self.self_weak.clone()))
    }

    fn socket_for(&self, tx_id: u32, rx_id: u32) -> Result<Arc<SocketEntry>> {
        let mut sockets = self.sockets.lock();

        if let Some(socket) = sockets.iter().find(|s| s.tx_id == tx_id && s.rx_id == rx_id) {
            return Ok(socket.clone());
        }

        let io = self.transport.open(tx_id, rx_id)?;
        let entry = Arc::new(SocketEntry {
            tx_id,
            rx_id,
            io: Mutex::new(io),
        });
        sockets.push(entry.clone());

        Ok(entry)
    }

    pub(crate) fn retain_command(&self, core: &Arc<CommandCore>) {
        let mut table = self.commands.lock();
        if let Some(entry) = table.entries.iter_mut().find(|e| Arc::ptr_eq(&e.core, core)) {
            entry.handles += 1;
        }
    }

    pub(crate) fn release_command(&self, core: &Arc<CommandCore>) {
        let mut table = self.commands.lock();
        let Some(index) = table
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.core, core))
        else {
            return;
        };

        table.entries[index].handles -= 1;
        if table.entries[index].handles == 0 {
            table.entries.swap_remove(index);
            table.pending.retain(|c| !Arc::ptr_eq(c, core));
            trace!(
                tx_id = format_args!("0x{:03X}", core.tx_id()),
                sid = core.sid(),
                "command removed"
            );
        }
    }

    /// Put a registered command back onto the polling queue.
    pub(crate) fn enqueue(&self, core: &Arc<CommandCore>) {
        let mut table = self.commands.lock();
        let registered = table.entries.iter().any(|e| Arc::ptr_eq(&e.core, core));
        let queued = table.pending.iter().any(|c| Arc::ptr_eq(c, core));

        if registered && !queued {
            table.pending.push_back(core.clone());
        }
    }

    /// One polling cycle.
    fn tick(&self) {
        let tick_start = Instant::now();

        self.process_commands();
        self.process_sockets();

        let callback = self.refreshed_cb.lock().clone();
        if let Some(callback) = callback {
            callback();
        }

        let period = Duration::from_millis(u64::from(self.refresh_ms.load(Ordering::Acquire)));
        let deadline = tick_start + period;

        // Sleep in short slices so teardown does not wait out a long period.
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }

    /// Drain the polling queue once, sending each queued command and reading
    /// back its reply. Recurring commands re-enter the queue for the next
    /// tick; an errored command leaves the remainder queued as-is.
    fn process_commands(&self) {
        let mut batch: VecDeque<Arc<CommandCore>> = {
            let mut table = self.commands.lock();
            table.pending.drain(..).collect()
        };

        while let Some(core) = batch.pop_front() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let errored = self.process_command(&core);

            if core.refresh() {
                self.enqueue(&core);
            }

            if errored {
                let mut table = self.commands.lock();
                while let Some(core) = batch.pop_front() {
                    if !table.pending.iter().any(|c| Arc::ptr_eq(c, &core)) {
                        table.pending.push_back(core);
                    }
                }
                break;
            }
        }
    }

    /// Send one command's frame and spin on its socket until a matching
    /// frame arrives or the per-command timeout lapses. Returns whether the
    /// command ended in [`CommandStatus::Error`].
    fn process_command(&self, core: &Arc<CommandCore>) -> bool {
        let socket = {
            let table = self.commands.lock();
            table
                .entries
                .iter()
                .find(|e| Arc::ptr_eq(&e.core, core))
                .map(|e| e.socket.clone())
        };
        // Unregistered while queued; nothing to do.
        let Some(socket) = socket else { return false };

        let frame = core.frame();
        socket.io.lock().send(&frame);
        trace!(
            tx_id = format_args!("0x{:03X}", socket.tx_id),
            frame = %hex::encode(&frame),
            "polled command"
        );

        let timeout = if core.status() == CommandStatus::NoResponse {
            NO_RESPONSE_RETRY_TIMEOUT
        } else {
            COMMAND_PROCESS_TIMEOUT
        };
        let deadline = Instant::now() + timeout;

        let mut answered = false;
        loop {
            if self.drain_socket(&socket, Some(core)) {
                answered = true;
                break;
            }
            if Instant::now() >= deadline || !self.running.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(READ_POLL_INTERVAL);
        }

        if !answered {
            core.set_status(CommandStatus::NoResponse);
            core.clear_response();
            return false;
        }

        core.status() == CommandStatus::Error
    }

    /// Best-effort read pass across every socket, catching responses whose
    /// command was not being polled this tick.
    pub(crate) fn process_sockets(&self) {
        let sockets: Vec<Arc<SocketEntry>> = self.sockets.lock().clone();
        for socket in sockets {
            self.drain_socket(&socket, None);
        }
    }

    /// Read every pending frame off a socket and dispatch each one. Returns
    /// whether any frame was delivered to the command of interest.
    fn drain_socket(
        &self,
        socket: &Arc<SocketEntry>,
        interest: Option<&Arc<CommandCore>>,
    ) -> bool {
        let mut buf = [0u8; MSG_MAX];
        let mut hit = false;

        loop {
            let n = socket.io.lock().recv(&mut buf);
            if n == 0 {
                return hit;
            }
            if self.dispatch_frame(socket, &buf[..n], interest) {
                hit = true;
            }
        }
    }

    /// Classify one incoming frame and fan it out to every matching command.
    fn dispatch_frame(
        &self,
        socket: &Arc<SocketEntry>,
        frame: &[u8],
        interest: Option<&Arc<CommandCore>>,
    ) -> bool {
        if frame.is_empty() {
            return false;
        }

        let first = frame[0];
        let negative = first == NEGATIVE_RESPONSE_SID;
        if negative && frame.len() < 3 {
            return false;
        }

        // Effective response sid: echoed request sid + 0x40 either way.
        let (sid, nrc) = if negative {
            (frame[1].wrapping_add(RESPONSE_SID_OFFSET), Some(frame[2]))
        } else {
            (first, None)
        };
        let dtc_response = DTC_RESPONSE_SIDS.contains(&first);
        let pid = frame.get(1).copied();

        trace!(
            rx_id = format_args!("0x{:03X}", socket.rx_id),
            frame = %hex::encode(frame),
            "incoming frame"
        );

        let matching: Vec<Arc<CommandCore>> = {
            let table = self.commands.lock();
            table
                .entries
                .iter()
                .filter(|e| {
                    let core = &e.core;
                    core.tx_id() == socket.tx_id
                        && core.rx_id() == socket.rx_id
                        && core.sid() == sid.wrapping_sub(RESPONSE_SID_OFFSET)
                        && (negative
                            || dtc_response
                            || pid.is_some_and(|p| core.contains_pid(u16::from(p))))
                })
                .map(|e| e.core.clone())
                .collect()
        };

        let mut hit = false;
        for core in matching {
            match nrc {
                Some(nrc) => {
                    if core.status() == CommandStatus::Ok {
                        // Transient glitch on a healthy channel.
                        trace!(
                            tx_id = format_args!("0x{:03X}", core.tx_id()),
                            nrc = format_args!("0x{nrc:02X}"),
                            "ignoring negative response on healthy command"
                        );
                    } else {
                        core.store_response(&[nrc], CommandStatus::Error);
                        debug!(
                            tx_id = format_args!("0x{:03X}", core.tx_id()),
                            sid = format_args!("0x{:02X}", core.sid()),
                            nrc = %crate::nrc::Nrc::from(nrc),
                            "negative response"
                        );
                    }
                }
                // The PID byte stays in the buffer so chained responses can
                // be walked by the consumer.
                None => core.store_response(&frame[1..], CommandStatus::Ok),
            }

            if !core.refresh() && core.status() != CommandStatus::Waiting {
                self.complete_command(&core);
            }

            if let Some(interest) = interest {
                if Arc::ptr_eq(interest, &core) {
                    hit = true;
                }
            }
        }

        hit
    }

    /// A one-shot command got its answer: take it off the polling queue.
    /// Its registry entry lives on until the last handle drops.
    fn complete_command(&self, core: &Arc<CommandCore>) {
        let mut table = self.commands.lock();
        table.pending.retain(|c| !Arc::ptr_eq(c, core));
    }
}
