//! On-bus poll targets and the shared handles over them.
//!
//! A [`CommandCore`] is one poll target: a (tx, rx, sid, PID list) identity
//! plus double-buffered response state. Cores are owned by their protocol's
//! registry; user code only ever sees [`CommandHandle`]s. Handles with an
//! identical identity share one core, and the core is torn down when the
//! last handle goes away.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::ProtocolInner;
use crate::error::{Error, Result};
use crate::nrc::Nrc;

/// Default deadline for [`CommandHandle::wait_for_response`].
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default status sampling interval while waiting.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_micros(1000);

/// Response state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    /// No response classified yet.
    Waiting = 0,
    /// A positive response is buffered.
    Ok = 1,
    /// The ECU rejected the request; the buffer holds the one-byte NRC.
    Error = 2,
    /// The last poll cycle timed out without any matching frame.
    NoResponse = 3,
}

impl CommandStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CommandStatus::Ok,
            2 => CommandStatus::Error,
            3 => CommandStatus::NoResponse,
            _ => CommandStatus::Waiting,
        }
    }
}

#[derive(Default)]
struct ResponseBuffers {
    front: Vec<u8>,
    back: Vec<u8>,
}

pub(crate) struct CommandCore {
    tx_id: u32,
    rx_id: u32,
    sid: u8,
    pids: Mutex<Vec<u16>>,

    buffers: Mutex<ResponseBuffers>,
    updated: AtomicBool,
    status: AtomicU8,
    refresh: AtomicBool,

    parent: Weak<ProtocolInner>,
}

impl CommandCore {
    pub(crate) fn new(
        tx_id: u32,
        rx_id: u32,
        sid: u8,
        pids: Vec<u16>,
        refresh: bool,
        parent: Weak<ProtocolInner>,
    ) -> Self {
        Self {
            tx_id,
            rx_id,
            sid,
            pids: Mutex::new(pids),
            buffers: Mutex::new(ResponseBuffers::default()),
            updated: AtomicBool::new(false),
            status: AtomicU8::new(CommandStatus::Waiting as u8),
            refresh: AtomicBool::new(refresh),
            parent,
        }
    }

    pub(crate) fn tx_id(&self) -> u32 {
        self.tx_id
    }

    pub(crate) fn rx_id(&self) -> u32 {
        self.rx_id
    }

    pub(crate) fn sid(&self) -> u8 {
        self.sid
    }

    pub(crate) fn pids(&self) -> Vec<u16> {
        self.pids.lock().clone()
    }

    pub(crate) fn pid_count(&self) -> usize {
        self.pids.lock().len()
    }

    pub(crate) fn contains_pid(&self, pid: u16) -> bool {
        self.pids.lock().contains(&pid)
    }

    pub(crate) fn add_pid(&self, pid: u16) {
        self.pids.lock().push(pid);
    }

    pub(crate) fn remove_pid(&self, pid: u16) {
        self.pids.lock().retain(|&p| p != pid);
    }

    pub(crate) fn set_pids(&self, pids: Vec<u16>) {
        *self.pids.lock() = pids;
    }

    pub(crate) fn status(&self) -> CommandStatus {
        CommandStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: CommandStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn refresh(&self) -> bool {
        self.refresh.load(Ordering::Acquire)
    }

    pub(crate) fn set_refresh(&self, refresh: bool) {
        self.refresh.store(refresh, Ordering::Release);
    }

    pub(crate) fn parent(&self) -> Result<Arc<ProtocolInner>> {
        self.parent.upgrade().ok_or(Error::Detached)
    }

    /// Outbound frame: the service byte followed by each PID's low byte,
    /// with the high byte appended only for 16-bit PIDs.
    pub(crate) fn frame(&self) -> Vec<u8> {
        let pids = self.pids.lock();
        let mut buf = Vec::with_capacity(1 + pids.len() * 2);
        buf.push(self.sid);

        for &pid in pids.iter() {
            buf.push(pid as u8);
            if pid > 0xFF {
                buf.push((pid >> 8) as u8);
            }
        }

        buf
    }

    /// Listener-side write into the back buffer. One-shot cores keep their
    /// first terminal response; later frames are dropped.
    pub(crate) fn store_response(&self, payload: &[u8], status: CommandStatus) {
        if !self.refresh()
            && matches!(self.status(), CommandStatus::Ok | CommandStatus::Error)
        {
            return;
        }

        let mut buffers = self.buffers.lock();
        buffers.back.clear();
        buffers.back.extend_from_slice(payload);
        self.updated.store(true, Ordering::Release);
        self.set_status(status);
    }

    /// Drop any buffered response, front and back.
    pub(crate) fn clear_response(&self) {
        let mut buffers = self.buffers.lock();
        buffers.back.clear();
        buffers.front.clear();
        self.updated.store(false, Ordering::Release);
    }

    /// Snapshot of the latest response payload. The first read after a
    /// write cycles the back buffer to the front.
    pub(crate) fn buffer(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock();

        if self.updated.swap(false, Ordering::AcqRel) {
            buffers.front = std::mem::take(&mut buffers.back);
        }

        buffers.front.clone()
    }

    /// Poll the status until it leaves [`CommandStatus::Waiting`] or the
    /// deadline passes, sampling every `sample`.
    pub(crate) async fn wait_for_response(
        &self,
        timeout: Duration,
        sample: Duration,
    ) -> CommandStatus {
        let deadline = Instant::now() + timeout;

        loop {
            let status = self.status();
            if status != CommandStatus::Waiting || Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(sample).await;
        }
    }
}

/// A reference-counted view onto a poll target. Creating a handle with the
/// parameters of an existing one shares the underlying core; dropping the
/// last handle removes the core from its protocol.
pub struct CommandHandle {
    core: Arc<CommandCore>,
    proto: Weak<ProtocolInner>,
}

impl CommandHandle {
    pub(crate) fn new(core: Arc<CommandCore>, proto: Weak<ProtocolInner>) -> Self {
        Self { core, proto }
    }

    pub(crate) fn core(&self) -> &Arc<CommandCore> {
        &self.core
    }

    pub fn tx_id(&self) -> u32 {
        self.core.tx_id()
    }

    pub fn rx_id(&self) -> u32 {
        self.core.rx_id()
    }

    pub fn sid(&self) -> u8 {
        self.core.sid()
    }

    pub fn pids(&self) -> Vec<u16> {
        self.core.pids()
    }

    pub fn pid_count(&self) -> usize {
        self.core.pid_count()
    }

    pub fn contains_pid(&self, pid: u16) -> bool {
        self.core.contains_pid(pid)
    }

    /// Extend the poll target with another PID; it rides along from the
    /// next frame.
    pub fn add_pid(&self, pid: u16) {
        self.core.add_pid(pid);
    }

    pub fn remove_pid(&self, pid: u16) {
        self.core.remove_pid(pid);
    }

    /// Replace the PID list wholesale.
    pub fn set_pids(&self, pids: Vec<u16>) {
        self.core.set_pids(pids);
    }

    /// Whether the command sits on the polling queue.
    pub fn refresh(&self) -> bool {
        self.core.refresh()
    }

    pub fn status(&self) -> CommandStatus {
        self.core.status()
    }

    /// Snapshot of the latest response payload.
    pub fn buffer(&self) -> Vec<u8> {
        self.core.buffer()
    }

    /// The rejection code when the ECU answered negatively.
    pub fn nrc(&self) -> Option<Nrc> {
        if self.core.status() != CommandStatus::Error {
            return None;
        }
        self.core.buffer().first().map(|&byte| Nrc::from(byte))
    }

    /// Take the command off the polling queue after its next cycle.
    pub fn stop(&self) -> Result<()> {
        self.core.parent()?;
        self.core.set_refresh(false);
        Ok(())
    }

    /// Put the command back onto the polling queue.
    pub fn resume(&self) -> Result<()> {
        let proto = self.core.parent()?;
        self.core.set_refresh(true);
        proto.enqueue(&self.core);
        Ok(())
    }

    /// Wait with the default 5 s deadline and 1 ms sampling.
    pub async fn wait_for_response(&self) -> CommandStatus {
        self.wait_for_response_with(DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SAMPLE_INTERVAL)
            .await
    }

    pub async fn wait_for_response_with(
        &self,
        timeout: Duration,
        sample: Duration,
    ) -> CommandStatus {
        self.core.wait_for_response(timeout, sample).await
    }
}

impl Clone for CommandHandle {
    fn clone(&self) -> Self {
        if let Some(proto) = self.proto.upgrade() {
            proto.retain_command(&self.core);
        }

        Self {
            core: self.core.clone(),
            proto: self.proto.clone(),
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        if let Some(proto) = self.proto.upgrade() {
            proto.release_command(&self.core);
        }
    }
}
