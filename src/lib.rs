//! obd2-poll - asynchronous OBD-II / UDS-over-ISO-TP polling client
//!
//! This crate reads live data, vehicle information and trouble codes from
//! the ECUs on a vehicle CAN bus. Users declare *requests* - an (ECU,
//! service, PID) triple with an optional decoding formula - and read a
//! continuously refreshed value; the crate handles the periodic polling,
//! ISO-TP framing, negative responses and the multiplexing of many requests
//! onto few bus commands.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Obd2                               │
//! │  facade: request lifecycle + standardized queries            │
//! │                                                              │
//! │  Request ──► ReqCombination ──► CommandHandle                │
//! │  (user)      (PID chaining)     (shared, refcounted)         │
//! │                                      │                       │
//! │                              ┌───────┴────────┐              │
//! │                              │    Protocol    │              │
//! │                              │ listener thread│              │
//! │                              │ socket pool    │              │
//! │                              └───────┬────────┘              │
//! │                              ┌───────┴────────┐              │
//! │                              │   Transport    │              │
//! │                              │ (SocketCAN ISO-TP / mock)     │
//! │                              └────────────────┘              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use obd2_poll::Obd2;
//!
//! let obd = Obd2::new("can0", 1000, true)?;
//! let rpm = obd.add_request(0x7E0, 0x01, 0x0C, "(a*256+b)/4", true)?;
//!
//! loop {
//!     println!("engine speed: {:.0} rpm", rpm.value()?);
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! ```

mod client;
mod combination;
mod dtc;
mod ecu;
mod error;
mod formula;
mod nrc;
mod request;
mod vehicle;

pub mod obd;
pub mod protocol;
pub mod transport;

pub use client::{Obd2, ECU_ID_BROADCAST, ECU_ID_FIRST, ECU_ID_LAST};
pub use dtc::{Dtc, DtcCategory, DtcStatus};
pub use ecu::EcuRecord;
pub use error::{Error, Result};
pub use formula::Formula;
pub use nrc::Nrc;
pub use protocol::{CommandHandle, CommandStatus, Protocol};
pub use request::Request;
pub use vehicle::{IgnitionType, VehicleInfo};
