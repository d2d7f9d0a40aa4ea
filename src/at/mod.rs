//! AT request generation and response parsing.
//!
//! Two small libraries shared by the driver: [`writer`] builds well-formed
//! AT requests incrementally, [`parser`] matches responses in a streaming
//! fashion with commit/rollback, and [`args`] types the comma-delimited
//! argument lists of buffered reply lines. All three are usable on their
//! own; the driver wires them to the serial transport.

pub mod args;
pub mod parser;
pub mod writer;
