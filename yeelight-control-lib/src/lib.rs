//! # Yeelight Control Library
//!
//! `yeelight-control-lib` is a Rust library for controlling Yeelight smart lights over the
//! local network. It discovers lights with the multicast search protocol and talks to each
//! light over its line based JSON TCP protocol.
//!
//! This library is designed to be used by command-line tools or other client applications
//! that control lights without the vendor cloud.
//!
//! ## Features
//!
//! - Device discovery, both one-shot scans and continuous listening for announcements
//! - Manual and self-opening connections, with an interceptor pipeline for replies
//! - A connection pool handing out one connection per device
//! - Command builders for the common methods and a typed property model
//!
//! ## Example
//!
//! Scan the network and turn every light on:
//!
//! ```no_run
//! use std::sync::Arc;
//! use yeelight_control_lib::connection::{ConnectionConfig, ConnectionPool};
//! use yeelight_control_lib::util::discovery::{Scanner, ScannerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = Arc::new(ConnectionPool::auto(ConnectionConfig::default()));
//!     let scanner = Scanner::new(ScannerConfig::default()).with_provider(pool);
//!     let result = scanner.scan().await;
//!
//!     for device in result.devices.values() {
//!         let command = device.set_power(true, None, None)?;
//!         device.send(command)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `connection` module holds the TCP transport, the reply decoder and the
// connection types built on them.
//
// Example usage:
//
// ```
// use yeelight_control_lib::connection::{BasicConnection, Connection, ConnectionConfig};
//
// #[tokio::main]
// async fn main() {
//     let connection = BasicConnection::new(1, "192.168.1.5", 55443, ConnectionConfig::default());
//     connection.connect_sync().await.unwrap();
// }
// ```
pub mod connection;

// The `device` module models a light: its identity, capabilities and last
// known properties, plus builders for the commands it understands.
pub mod device;

pub mod error;

// The `util` module provides device discovery.
pub mod util;

pub use connection::{Connection, ConnectionListener};
pub use device::Device;
pub use error::{Error, Result};
