//! SocketCAN ISO-TP endpoints (Linux only)

use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

use socketcan::StandardId;
use socketcan_isotp::{IsoTpBehaviour, IsoTpOptions, IsoTpSocket};
use tracing::{debug, trace};

use super::{IsoTpEndpoint, Transport};
use crate::error::{Error, Result};

/// Outgoing frames are padded with 0xCC, incoming padding is expected to
/// be 0x00. Both paddings are enforced by the kernel ISO-TP stack.
const TX_PADDING: u8 = 0xCC;
const RX_PADDING: u8 = 0x00;

/// Back-off between retries when the kernel reports transient back-pressure.
const SEND_RETRY_DELAY: Duration = Duration::from_micros(100);

/// Opens ISO-TP endpoints on one named CAN interface (e.g. "can0").
pub struct SocketCanTransport {
    interface: String,
}

impl SocketCanTransport {
    /// Resolve the interface immediately so an unknown name fails at
    /// construction rather than on first use.
    pub fn new(interface: &str) -> Result<Self> {
        let index = nix::net::if_::if_nametoindex(interface)
            .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))?;

        debug!(interface, index, "resolved CAN interface");

        Ok(Self {
            interface: interface.to_string(),
        })
    }

    /// The interface this transport binds endpoints to.
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl Transport for SocketCanTransport {
    fn open(&self, tx_id: u32, rx_id: u32) -> Result<Box<dyn IsoTpEndpoint>> {
        let tx = standard_id(tx_id)?;
        let rx = standard_id(rx_id)?;

        let mut options = IsoTpOptions::default();
        options.set_flags(IsoTpBehaviour::CAN_ISOTP_TX_PADDING | IsoTpBehaviour::CAN_ISOTP_RX_PADDING);
        options.set_txpad_content(TX_PADDING);
        options.set_rxpad_content(RX_PADDING);

        let socket = IsoTpSocket::open_with_opts(&self.interface, rx, tx, Some(options), None, None)
            .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::Other, e.to_string())))?;
        socket.set_nonblocking(true)?;

        debug!(
            interface = %self.interface,
            tx_id = format_args!("0x{tx_id:03X}"),
            rx_id = format_args!("0x{rx_id:03X}"),
            "opened ISO-TP endpoint"
        );

        Ok(Box::new(SocketCanEndpoint { tx_id, rx_id, socket }))
    }
}

fn standard_id(id: u32) -> Result<StandardId> {
    u16::try_from(id)
        .ok()
        .and_then(StandardId::new)
        .ok_or_else(|| Error::InvalidArgument(format!("0x{id:X} is not an 11-bit CAN id")))
}

struct SocketCanEndpoint {
    tx_id: u32,
    rx_id: u32,
    socket: IsoTpSocket,
}

impl IsoTpEndpoint for SocketCanEndpoint {
    fn tx_id(&self) -> u32 {
        self.tx_id
    }

    fn rx_id(&self) -> u32 {
        self.rx_id
    }

    fn send(&mut self, payload: &[u8]) {
        loop {
            match self.socket.write(payload) {
                Ok(()) => return,
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(SEND_RETRY_DELAY),
                Err(e) => {
                    trace!(
                        tx_id = format_args!("0x{:03X}", self.tx_id),
                        error = %e,
                        "dropping frame after send failure"
                    );
                    return;
                }
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        match self.socket.read() {
            Ok(data) if !data.is_empty() => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            Ok(_) => 0,
            Err(e) => {
                if e.kind() != ErrorKind::WouldBlock {
                    trace!(
                        rx_id = format_args!("0x{:03X}", self.rx_id),
                        error = %e,
                        "socket read error"
                    );
                }
                0
            }
        }
    }
}
