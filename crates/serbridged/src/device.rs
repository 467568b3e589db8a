//! Device control layer.
//!
//! A port never touches a serial driver directly. It asks a [`DeviceOpener`]
//! for an [`OpenedDevice`]: a byte stream plus a [`LineControl`] handle for
//! the out-of-band side (modem lines, break, line settings). The daemon uses
//! [`SerialOpener`](crate::serial::SerialOpener); tests plug in in-memory
//! devices.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use serbridge_common::{BridgeError, BridgeResult, DevConfig, DeviceLock, DeviceLocks, LockMode};

/// Byte stream half of an open device.
pub trait DeviceIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DeviceIo for T {}

/// Out-of-band control of an open device.
pub trait LineControl: Send {
    /// Drives DTR.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Drives RTS.
    fn set_rts(&mut self, level: bool) -> io::Result<()>;

    /// Starts (`true`) or ends (`false`) a break condition.
    fn set_break(&mut self, on: bool) -> io::Result<()>;

    /// Applies a complete device configuration to the open device.
    ///
    /// An absent RS-485 tuple switches RS-485 off.
    fn apply(&mut self, cfg: &DevConfig) -> io::Result<()>;
}

/// A device as returned by a [`DeviceOpener`].
pub struct OpenedDevice {
    pub io: Box<dyn DeviceIo>,
    pub control: Box<dyn LineControl>,
}

/// Opens devices by path.
pub trait DeviceOpener: Send + Sync {
    /// Opens `path` and applies `cfg` to it.
    fn open(&self, path: &str, cfg: &DevConfig) -> io::Result<OpenedDevice>;
}

/// An open device together with its lock claim.
///
/// Field order matters for drop order: the stream and control handle close
/// before the lock is released.
pub struct DeviceEndpoint {
    pub(crate) io: Box<dyn DeviceIo>,
    pub(crate) control: Box<dyn LineControl>,
    pub(crate) lock: Option<DeviceLock>,
}

/// Claims (when locking is on) and opens a port's device.
///
/// The claim is taken first, so a contended device is never opened. If the
/// open fails the claim is released before returning.
pub fn open_endpoint(
    opener: &dyn DeviceOpener,
    locks: &DeviceLocks,
    holder: &str,
    path: &str,
    cfg: &DevConfig,
) -> BridgeResult<DeviceEndpoint> {
    let lock = match cfg.lock {
        LockMode::On => Some(locks.acquire(path, holder)?),
        LockMode::Off => None,
    };

    let opened = opener
        .open(path, cfg)
        .map_err(|e| BridgeError::device_open(path, e))?;
    debug!(device = path, "device opened");

    Ok(DeviceEndpoint {
        io: opened.io,
        control: opened.control,
        lock,
    })
}
