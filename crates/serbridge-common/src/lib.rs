//! Common infrastructure for the serbridge serial-to-network bridge.
//!
//! This crate holds the leaf layers the port engine in `serbridged` is built
//! on:
//!
//! - [`error`]: Error taxonomy shared by every layer
//! - [`sink`]: Error reporting capabilities ([`ErrorSink`])
//! - [`devcfg`]: Device configuration strings, RS-485 and control lines
//! - [`lock`]: Process-wide advisory device locks
//! - [`telnet`]: Telnet command stripping and option negotiation
//!
//! # Example
//!
//! ```
//! use serbridge_common::{devcfg, CollectSink, DevConfig};
//!
//! let mut cfg = DevConfig::default();
//! let mut sink = CollectSink::new();
//!
//! assert!(devcfg::devcfg_init(&mut cfg, &mut sink, "115200 RS485=5:0", |_| false));
//! assert_eq!(cfg.line.baud_rate, 115200);
//! assert_eq!(devcfg::get_rs485_conf(&cfg).unwrap().delay_rts_before_send, 5);
//!
//! assert!(!devcfg::devcfg_init(&mut cfg, &mut sink, "FAST", |_| false));
//! assert!(sink.contains("FAST"));
//! ```

pub mod devcfg;
pub mod error;
pub mod lock;
pub mod sink;
pub mod telnet;

// Re-export commonly used items at crate root
pub use devcfg::{ControlLines, DevConfig, LineSettings, LockMode, Rs485Config};
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use lock::{DeviceLock, DeviceLocks};
pub use sink::{CollectSink, ErrorSink, LogSink};
pub use telnet::{TelnetEvent, TelnetSession};
