//! Request combinations: groups of user requests served by one command.
//!
//! PID chaining packs up to six service 0x01/0x02 PIDs into one frame; the
//! combination tracks which requests ride on the shared command and how many
//! payload bytes each chained PID occupies in the response.

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::CommandHandle;
use crate::request::RequestState;

/// A chained frame carries at most six distinct PIDs.
pub(crate) const MAX_CHAINED_PIDS: usize = 6;

pub(crate) struct ReqCombination {
    cmd: CommandHandle,
    requests: Vec<Arc<RequestState>>,
    allow_pid_chain: bool,
}

impl ReqCombination {
    pub(crate) fn new(cmd: CommandHandle, allow_pid_chain: bool) -> Self {
        Self {
            cmd,
            requests: Vec::new(),
            allow_pid_chain,
        }
    }

    pub(crate) fn command(&self) -> &CommandHandle {
        &self.cmd
    }

    pub(crate) fn allow_pid_chain(&self) -> bool {
        self.allow_pid_chain
    }

    pub(crate) fn pid_count(&self) -> usize {
        self.cmd.pid_count()
    }

    pub(crate) fn contains_pid(&self, pid: u16) -> bool {
        self.cmd.contains_pid(pid)
    }

    pub(crate) fn add_request(&mut self, request: Arc<RequestState>) {
        if !self.cmd.contains_pid(request.pid) {
            self.cmd.add_pid(request.pid);
        }
        self.requests.push(request);
    }

    /// Detach a request; the PID leaves the command once no member uses it.
    /// Returns whether the combination is now empty.
    pub(crate) fn remove_request(&mut self, request: &Arc<RequestState>) -> bool {
        self.requests.retain(|r| !Arc::ptr_eq(r, request));

        if !self.requests.iter().any(|r| r.pid == request.pid) {
            self.cmd.remove_pid(request.pid);
        }

        self.requests.is_empty()
    }

    /// Stop the shared command once every member request is stopped.
    pub(crate) fn request_stopped(&self) -> Result<()> {
        if self.requests.iter().any(|r| r.refresh()) {
            return Ok(());
        }
        self.cmd.stop()
    }

    pub(crate) fn request_resumed(&self) -> Result<()> {
        self.cmd.resume()
    }

    /// Payload bytes a chained PID occupies: the largest expected size among
    /// the member requests reading it.
    pub(crate) fn var_count(&self, pid: u16) -> usize {
        self.requests
            .iter()
            .filter(|r| r.pid == pid)
            .map(|r| r.expected_size())
            .max()
            .unwrap_or(0)
    }
}
