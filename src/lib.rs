//! AT-command driver for u-blox SARA-G350 cellular modems.
//!
//! The driver multiplexes many logical operations — socket I/O, SMS,
//! network registration, DNS, the real-time clock, TLS configuration —
//! over a single serial byte stream that interleaves command responses
//! with unsolicited result codes (URCs). It consists of:
//!
//! - a reader thread with exclusive access to the serial port in input,
//!   classifying each line and dispatching URCs
//! - a slot mechanism such that each task calling into the driver waits
//!   its turn to issue an AT command; the reader completes, fails or
//!   times out the slot, so no exchange can stall the loop
//! - a fixed table of socket structures mapped onto the modem's indexed
//!   socket resources, with URC-driven receive readiness
//! - the [`at`] libraries for generating requests and parsing responses
//!   in a streaming fashion
//!
//! Clients hold a cloneable [`Driver`] handle with an async API; one
//! driver instance owns one serial device.
//!
//! ```no_run
//! # async fn demo() -> g350::Result<()> {
//! let driver = g350::Driver::open(g350::Config::load(None)?)?;
//! driver.start().await?;
//! let addr = driver.resolve("example.com").await?;
//! println!("resolved: {addr}");
//! # Ok(())
//! # }
//! ```

pub mod at;
mod cmd;
mod config;
mod driver;
mod error;
mod net;
mod reader;
mod slot;
mod sms;
mod socket;
mod transport;
mod urc;

pub use config::{Config, PinConfig, SerialConfig, TimeoutConfig};
pub use driver::{Bypass, ControlLines, Driver, NullControlLines};
pub use error::{Error, ParseError, Result};
pub use net::{CellInfo, LinkInfo, NetInfo, Operator, Timestamp, MAX_OPS};
pub use sms::SmsRecord;
pub use socket::{CertVerify, Proto, TlsConfig, MAX_SOCKS};
pub use transport::{SerialPort, Transport};
pub use urc::{RegStatus, RAT_GPRS, RAT_GSM};
