//! Bridge between a Modbus field device and a WebSocket cloud channel.
//!
//! The bridge polls a block of holding registers from a device (RTU over a
//! serial port, or TCP) and pushes each sample upstream as
//!
//! ```text
//! {"action":"update","data":[v0,v1,...]}
//! ```
//!
//! Commands arriving on the channel are handed to a
//! [`CommandHandler`](commands::CommandHandler). Both links reconnect on their
//! own; samples produced while the channel is down are dropped.

pub mod bridge;
pub mod channel;
pub mod commands;
pub mod config;
pub mod field;

#[cfg(test)]
mod testing;
