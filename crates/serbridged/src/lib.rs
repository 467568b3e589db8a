//! Serial port to network bridge daemon.
//!
//! This crate implements `serbridged`, which exposes local serial devices
//! on TCP ports. Each configured port listens for one client at a time,
//! opens its device when a client connects and relays bytes both ways,
//! optionally speaking telnet on the network side.
//!
//! # Responsibilities
//!
//! - Per-port session state machine and data relay with backpressure
//! - Telnet option negotiation, IAC escaping and serial break
//! - Device configuration, RS-485 and modem control lines
//! - Advisory device locks shared by all ports
//! - Data monitors copying traffic to administrative controllers
//! - Port registry with generation based reconfiguration
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`port`] | Port model and per-port task |
//! | [`device`] | Device opener and control seams |
//! | [`serial`] | Real serial devices |
//! | [`monitor`] | Traffic monitors |
//! | [`controller`] | Administrative controller capability |
//! | [`config_file`] | TOML configuration |
//! | [`show`] | `showports` rendering |
//!
//! # Example
//!
//! ```no_run
//! use serbridge_common::LogSink;
//! use serbridged::PortMgr;
//!
//! # async fn demo() -> serbridge_common::BridgeResult<()> {
//! let mut mgr = PortMgr::new();
//! mgr.portconfig(&mut LogSink, "2000", "telnet", "600", "/dev/ttyS0", "9600 LOCK", 1)?;
//! mgr.clear_old_port_config(1);
//! # Ok(())
//! # }
//! ```

pub mod config_file;
pub mod controller;
mod dataxfer;
pub mod defaults;
pub mod device;
pub mod monitor;
pub mod port;
mod port_mgr;
pub mod serial;
pub mod show;

pub use config_file::{BridgeConfig, DaemonConfig, PortLine};
pub use controller::{Controller, ControllerId};
pub use device::{DeviceIo, DeviceOpener, LineControl, OpenedDevice};
pub use monitor::{MonitorDirection, MonitorId};
pub use port::{EnableMode, ListenSpec, PortConfig, PortOptions, PortState, PortStatus};
pub use port_mgr::PortMgr;
