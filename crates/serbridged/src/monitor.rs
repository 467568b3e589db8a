//! Data monitors.
//!
//! A monitor copies one direction of a port's traffic to a controller.
//! Handles are generational indices into a [`MonitorTable`], so a stale
//! handle (already stopped, or reused slot) is recognised instead of
//! touching someone else's monitor.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use serbridge_common::BridgeError;

use crate::controller::ControllerId;

/// Which side of the port a monitor watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorDirection {
    /// `"tcp"`: bytes received from the network client, after telnet decoding.
    Tcp,
    /// `"term"`: bytes received from the serial device.
    Term,
}

impl MonitorDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorDirection::Tcp => "tcp",
            MonitorDirection::Term => "term",
        }
    }
}

impl fmt::Display for MonitorDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorDirection {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(MonitorDirection::Tcp),
            "term" => Ok(MonitorDirection::Term),
            _ => Err(BridgeError::invalid_config(
                "monitor type",
                s,
                "expected 'tcp' or 'term'",
            )),
        }
    }
}

/// Handle returned by `data_monitor_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Registry record of an active monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MonitorEntry {
    pub owner: ControllerId,
    pub port: String,
    pub direction: MonitorDirection,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<MonitorEntry>,
}

/// Arena of monitor records.
#[derive(Debug, Default)]
pub(crate) struct MonitorTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl MonitorTable {
    pub fn insert(&mut self, entry: MonitorEntry) -> MonitorId {
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.entry = Some(entry);
            return MonitorId {
                slot,
                generation: s.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        MonitorId {
            slot,
            generation: 0,
        }
    }

    pub fn get(&self, id: MonitorId) -> Option<&MonitorEntry> {
        let s = self.slots.get(id.slot as usize)?;
        if s.generation != id.generation {
            return None;
        }
        s.entry.as_ref()
    }

    pub fn remove(&mut self, id: MonitorId) -> Option<MonitorEntry> {
        let s = self.slots.get_mut(id.slot as usize)?;
        if s.generation != id.generation {
            return None;
        }
        let entry = s.entry.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.free.push(id.slot);
        Some(entry)
    }

    /// Drops every record for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(MonitorId, &MonitorEntry) -> bool) {
        let doomed: Vec<MonitorId> = self
            .iter()
            .filter(|(id, entry)| !keep(*id, entry))
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.remove(id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MonitorId, &MonitorEntry)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.entry.as_ref().map(|e| {
                (
                    MonitorId {
                        slot: slot as u32,
                        generation: s.generation,
                    },
                    e,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

/// The port side of a monitor: where copies of traffic go.
#[derive(Debug, Clone)]
pub(crate) struct MonitorTap {
    pub id: MonitorId,
    pub direction: MonitorDirection,
    tx: mpsc::Sender<Bytes>,
}

impl MonitorTap {
    pub fn new(id: MonitorId, direction: MonitorDirection, tx: mpsc::Sender<Bytes>) -> Self {
        Self { id, direction, tx }
    }

    /// Offers a copy of `data`. Returns false once the receiver is gone.
    fn offer(&self, data: &[u8]) -> bool {
        match self.tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(monitor = %self.id, len = data.len(), "monitor lagging, chunk dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Copies `data` to every tap watching `direction`, forgetting taps whose
/// receiver has gone away.
pub(crate) fn deliver(taps: &mut Vec<MonitorTap>, direction: MonitorDirection, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    taps.retain(|tap| tap.direction != direction || tap.offer(data));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(port: &str) -> MonitorEntry {
        MonitorEntry {
            owner: ControllerId::next(),
            port: port.to_string(),
            direction: MonitorDirection::Tcp,
        }
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("tcp".parse::<MonitorDirection>().unwrap(), MonitorDirection::Tcp);
        assert_eq!("TERM".parse::<MonitorDirection>().unwrap(), MonitorDirection::Term);
        assert!("both".parse::<MonitorDirection>().is_err());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table = MonitorTable::default();
        let a = table.insert(entry("2000"));
        assert_eq!(table.remove(a).unwrap().port, "2000");

        // Slot is reused with a new generation.
        let b = table.insert(entry("2001"));
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.get(b).unwrap().port, "2001");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_retain() {
        let mut table = MonitorTable::default();
        let a = table.insert(entry("2000"));
        let b = table.insert(entry("2001"));
        table.retain(|_, e| e.port == "2001");
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn test_deliver_filters_by_direction() {
        let mut table = MonitorTable::default();
        let (tcp_tx, mut tcp_rx) = mpsc::channel(4);
        let (term_tx, mut term_rx) = mpsc::channel(4);
        let mut taps = vec![
            MonitorTap::new(table.insert(entry("p")), MonitorDirection::Tcp, tcp_tx),
            MonitorTap::new(table.insert(entry("p")), MonitorDirection::Term, term_tx),
        ];

        deliver(&mut taps, MonitorDirection::Tcp, b"from net");
        deliver(&mut taps, MonitorDirection::Term, b"from dev");

        assert_eq!(&tcp_rx.try_recv().unwrap()[..], b"from net");
        assert!(tcp_rx.try_recv().is_err());
        assert_eq!(&term_rx.try_recv().unwrap()[..], b"from dev");
    }

    #[test]
    fn test_full_channel_drops_chunk_keeps_tap() {
        let mut table = MonitorTable::default();
        let (tx, mut rx) = mpsc::channel(1);
        let mut taps = vec![MonitorTap::new(table.insert(entry("p")), MonitorDirection::Tcp, tx)];

        deliver(&mut taps, MonitorDirection::Tcp, b"one");
        deliver(&mut taps, MonitorDirection::Tcp, b"two");
        assert_eq!(taps.len(), 1);
        assert_eq!(&rx.try_recv().unwrap()[..], b"one");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_removes_tap() {
        let mut table = MonitorTable::default();
        let (tx, rx) = mpsc::channel(1);
        let mut taps = vec![MonitorTap::new(table.insert(entry("p")), MonitorDirection::Term, tx)];
        drop(rx);

        deliver(&mut taps, MonitorDirection::Term, b"x");
        assert!(taps.is_empty());
    }
}
