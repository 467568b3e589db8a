//! Advisory device locks.
//!
//! [`DeviceLocks`] is the process-wide table of claimed device paths. A port
//! acquires its device before opening it and holds the returned
//! [`DeviceLock`] for as long as the device stays open; dropping the guard
//! releases the claim on every exit path.
//!
//! With a lock directory configured the table also maintains UUCP style lock
//! files (`LCK..ttyS0` holding the owner's PID), so other programs that honour
//! the convention stay off the device too. Lock files left behind by dead
//! processes are reclaimed.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Default)]
struct LockTable {
    /// device path -> holder description
    held: HashMap<String, String>,
    uucp_dir: Option<PathBuf>,
}

/// Shared table of locked devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    inner: Arc<Mutex<LockTable>>,
}

impl DeviceLocks {
    /// Creates a table that only tracks locks inside this process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table that also writes UUCP lock files into `dir`.
    pub fn with_uucp_dir(dir: impl Into<PathBuf>) -> Self {
        let table = LockTable {
            held: HashMap::new(),
            uucp_dir: Some(dir.into()),
        };
        Self {
            inner: Arc::new(Mutex::new(table)),
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        lock_table(&self.inner)
    }

    /// Claims `device` on behalf of `holder`.
    ///
    /// Fails with [`BridgeError::LockContention`] if another port or another
    /// live process already holds it.
    pub fn acquire(&self, device: &str, holder: &str) -> BridgeResult<DeviceLock> {
        let mut table = self.table();

        if let Some(current) = table.held.get(device) {
            return Err(BridgeError::lock_contention(device, current.clone()));
        }

        let lock_file = match &table.uucp_dir {
            Some(dir) => Some(create_uucp_lock(dir, device)?),
            None => None,
        };

        table.held.insert(device.to_string(), holder.to_string());
        debug!(device, holder, "device lock acquired");

        Ok(DeviceLock {
            table: Arc::clone(&self.inner),
            device: device.to_string(),
            lock_file,
        })
    }

    /// Returns true if `device` is currently claimed in this process.
    pub fn is_locked(&self, device: &str) -> bool {
        self.table().held.contains_key(device)
    }

    /// Returns who holds `device`, if anyone.
    pub fn holder(&self, device: &str) -> Option<String> {
        self.table().held.get(device).cloned()
    }

    /// Returns the number of devices currently claimed.
    pub fn held_count(&self) -> usize {
        self.table().held.len()
    }
}

fn lock_table(inner: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Claim on one device; released on drop.
#[derive(Debug)]
pub struct DeviceLock {
    table: Arc<Mutex<LockTable>>,
    device: String,
    lock_file: Option<PathBuf>,
}

impl DeviceLock {
    /// Returns the locked device path.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the UUCP lock file backing this claim, if any.
    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_file {
            if let Err(e) = fs::remove_file(path) {
                warn!("Unable to remove lock file {}: {}", path.display(), e);
            }
        }
        lock_table(&self.table).held.remove(&self.device);
        debug!(device = %self.device, "device lock released");
    }
}

/// Returns the UUCP lock file path for `device` inside `dir`.
pub fn uucp_lock_path(dir: &Path, device: &str) -> PathBuf {
    let base = Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.replace('/', "_"));
    dir.join(format!("LCK..{}", base))
}

fn create_uucp_lock(dir: &Path, device: &str) -> BridgeResult<PathBuf> {
    let path = uucp_lock_path(dir, device);

    // One retry after clearing a stale file.
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let content = format!("{:10}\n", std::process::id());
                if let Err(source) = file.write_all(content.as_bytes()) {
                    let _ = fs::remove_file(&path);
                    return Err(BridgeError::LockFile { path, source });
                }
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_lock_pid(&path) {
                Some(pid) if pid != std::process::id() as i32 && process_alive(pid) => {
                    return Err(BridgeError::lock_contention(device, format!("pid {}", pid)));
                }
                _ => {
                    info!("Removing stale lock file {}", path.display());
                    fs::remove_file(&path)
                        .map_err(|source| BridgeError::LockFile {
                            path: path.clone(),
                            source,
                        })?;
                }
            },
            Err(source) => return Err(BridgeError::LockFile { path, source }),
        }
    }

    Err(BridgeError::LockFile {
        path,
        source: io::Error::new(io::ErrorKind::AlreadyExists, "lock file keeps reappearing"),
    })
}

fn read_lock_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
