//! Administrative controller capability.
//!
//! The admin front-end (console, control socket, test harness) is outside
//! this crate. It talks to [`PortMgr`](crate::PortMgr) by passing itself as a
//! [`Controller`]: a place for rendered output, a place for errors, and the
//! receiving ends of the monitors it starts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use serbridge_common::ErrorSink;

use crate::defaults::MONITOR_QUEUE;
use crate::monitor::MonitorId;

/// Identity of one controller session, used to scope monitor ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(u64);

impl ControllerId {
    /// Allocates a process-unique identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctl{}", self.0)
    }
}

/// A controller session issuing administrative operations.
pub trait Controller: ErrorSink {
    /// Returns this session's identity.
    fn id(&self) -> ControllerId;

    /// Receives rendered text such as `showports` output.
    fn output(&mut self, text: &str);

    /// Returns how many chunks each monitor of this controller may queue.
    ///
    /// Copies are offered with `try_send`; when a monitor's channel is full
    /// the chunk is dropped for that monitor only.
    fn monitor_queue(&self) -> usize {
        MONITOR_QUEUE
    }

    /// Takes the receiving end of a monitor this controller just started.
    ///
    /// The port holds the only sender. The receiver yields `None` once the
    /// monitor ends, whether it was stopped or its session closed.
    fn monitor_attached(&mut self, id: MonitorId, rx: mpsc::Receiver<Bytes>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_ids_are_unique() {
        let a = ControllerId::next();
        let b = ControllerId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
        assert!(a.to_string().starts_with("ctl"));
    }
}
