//! ISO-TP transport seam.
//!
//! The polling engine never touches the kernel directly; it talks to
//! endpoints through these traits. Two implementations ship with the crate:
//!
//! - [`socketcan::SocketCanTransport`] - real ISO-TP sockets on a SocketCAN
//!   interface (Linux only, `socketcan` feature)
//! - [`mock::MockBus`] - an in-memory bus with programmable responses, used
//!   by the test suite and for development off the vehicle

pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use crate::error::Result;

/// One bound ISO-TP endpoint: a (tx, rx) CAN id pair on one interface,
/// carrying whole logical messages.
pub trait IsoTpEndpoint: Send {
    /// CAN id used for outgoing frames.
    fn tx_id(&self) -> u32;

    /// CAN id responses arrive on.
    fn rx_id(&self) -> u32;

    /// Send one logical message. Transient back-pressure is retried briefly;
    /// any other failure drops the frame (the next poll cycle retries).
    fn send(&mut self, payload: &[u8]);

    /// Non-blocking read of one logical message into `buf`. Returns the
    /// message length, or 0 when nothing is pending or the read failed.
    fn recv(&mut self, buf: &mut [u8]) -> usize;
}

/// Endpoint factory for one bus. A protocol instance opens endpoints on
/// demand, at most one per (tx, rx) pair.
pub trait Transport: Send + Sync {
    fn open(&self, tx_id: u32, rx_id: u32) -> Result<Box<dyn IsoTpEndpoint>>;
}
