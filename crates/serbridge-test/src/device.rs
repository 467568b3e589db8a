//! In-memory serial devices.
//!
//! Every device registered with a [`FakeOpener`] is backed by a
//! `tokio::io::duplex` pipe per open. The test keeps the far end of each
//! pipe through [`FakeDevice::next_open`] and reads back what the daemon did
//! to the control lines through [`FakeDevice::line_state`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use serbridge_common::DevConfig;
use serbridged::{DeviceOpener, LineControl, OpenedDevice};

use crate::fixtures::WAIT;

/// Default pipe capacity of a fake device, in bytes.
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Everything the daemon did to a fake device, across all opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineState {
    /// Last DTR level driven, if any.
    pub dtr: Option<bool>,
    /// Last RTS level driven, if any.
    pub rts: Option<bool>,
    /// Number of breaks started.
    pub breaks: usize,
    /// True while a break condition is held.
    pub break_on: bool,
    /// Configurations applied to an already open device.
    pub applied: Vec<DevConfig>,
    /// Configuration given with the most recent open.
    pub open_config: Option<DevConfig>,
    /// Successful opens.
    pub opens: usize,
}

fn lock_state(state: &Mutex<LineState>) -> MutexGuard<'_, LineState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Slot {
    capacity: usize,
    failing: Arc<AtomicBool>,
    state: Arc<Mutex<LineState>>,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

/// Device opener serving registered in-memory devices.
#[derive(Default)]
pub struct FakeOpener {
    devices: Mutex<HashMap<String, Slot>>,
}

impl FakeOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a device at `path`.
    pub fn add(&self, path: &str) -> FakeDevice {
        self.add_with_capacity(path, DEFAULT_CAPACITY)
    }

    /// Registers a device whose pipe buffers at most `capacity` bytes per
    /// direction, so a device side that stops reading pushes back.
    pub fn add_with_capacity(&self, path: &str, capacity: usize) -> FakeDevice {
        let (tx, rx) = mpsc::unbounded_channel();
        let failing = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(LineState::default()));
        let slot = Slot {
            capacity,
            failing: Arc::clone(&failing),
            state: Arc::clone(&state),
            peers: tx,
        };
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), slot);
        FakeDevice {
            path: path.to_string(),
            failing,
            state,
            peers: rx,
        }
    }
}

impl DeviceOpener for FakeOpener {
    fn open(&self, path: &str, cfg: &DevConfig) -> io::Result<OpenedDevice> {
        let devices = self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = devices
            .get(path)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{}: no such device", path))
            })?;
        if slot.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "device failure injected"));
        }

        let (daemon_side, test_side) = tokio::io::duplex(slot.capacity);
        // The test may have dropped its handle; the open still succeeds.
        let _ = slot.peers.send(test_side);
        {
            let mut state = lock_state(&slot.state);
            state.opens += 1;
            state.open_config = Some(*cfg);
        }

        Ok(OpenedDevice {
            io: Box::new(daemon_side),
            control: Box::new(FakeControl {
                state: Arc::clone(&slot.state),
            }),
        })
    }
}

struct FakeControl {
    state: Arc<Mutex<LineState>>,
}

impl LineControl for FakeControl {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        lock_state(&self.state).dtr = Some(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        lock_state(&self.state).rts = Some(level);
        Ok(())
    }

    fn set_break(&mut self, on: bool) -> io::Result<()> {
        let mut state = lock_state(&self.state);
        if on && !state.break_on {
            state.breaks += 1;
        }
        state.break_on = on;
        Ok(())
    }

    fn apply(&mut self, cfg: &DevConfig) -> io::Result<()> {
        lock_state(&self.state).applied.push(*cfg);
        Ok(())
    }
}

/// Test side of a registered fake device.
pub struct FakeDevice {
    path: String,
    failing: Arc<AtomicBool>,
    state: Arc<Mutex<LineState>>,
    peers: mpsc::UnboundedReceiver<DuplexStream>,
}

impl FakeDevice {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the daemon to open the device and returns the far end of
    /// the new pipe. Panics if no open happens in time.
    pub async fn next_open(&mut self) -> DuplexStream {
        match timeout(WAIT, self.peers.recv()).await {
            Ok(Some(peer)) => peer,
            Ok(None) => panic!("{}: opener dropped", self.path),
            Err(_) => panic!("{}: device was never opened", self.path),
        }
    }

    /// Returns true if an open happened that `next_open` has not consumed.
    pub fn has_pending_open(&mut self) -> bool {
        !self.peers.is_empty()
    }

    /// Makes every following open fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns a copy of the recorded line state.
    pub fn line_state(&self) -> LineState {
        lock_state(&self.state).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serbridge_common::devcfg::parse_devcfg;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_unknown_device_fails() {
        let opener = FakeOpener::new();
        let err = opener.open("/dev/none", &DevConfig::default()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_open_connects_pipe_and_records() {
        let opener = FakeOpener::new();
        let mut dev = opener.add("/dev/fake0");
        let cfg = parse_devcfg("19200 EVEN", |_| false).unwrap();

        let mut opened = opener.open("/dev/fake0", &cfg).unwrap();
        let mut peer = dev.next_open().await;

        opened.io.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        opened.control.set_dtr(true).unwrap();
        opened.control.set_break(true).unwrap();
        opened.control.set_break(true).unwrap();
        opened.control.apply(&cfg).unwrap();

        let state = dev.line_state();
        assert_eq!(state.opens, 1);
        assert_eq!(state.open_config, Some(cfg));
        assert_eq!(state.dtr, Some(true));
        assert_eq!(state.rts, None);
        assert_eq!(state.breaks, 1);
        assert!(state.break_on);
        assert_eq!(state.applied, vec![cfg]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let opener = FakeOpener::new();
        let mut dev = opener.add("/dev/fake0");
        dev.set_failing(true);
        assert!(opener.open("/dev/fake0", &DevConfig::default()).is_err());
        assert!(!dev.has_pending_open());

        dev.set_failing(false);
        assert!(opener.open("/dev/fake0", &DevConfig::default()).is_ok());
        assert!(dev.has_pending_open());
    }
}
