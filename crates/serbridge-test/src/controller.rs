//! Controller that records everything the registry sends it.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use serbridge_common::{BridgeError, CollectSink, ErrorSink};
use serbridged::{Controller, ControllerId, MonitorId};

use crate::fixtures::WAIT;

/// Monitor queue depth used by [`RecordingController::new`].
const DEFAULT_QUEUE: usize = 64;

/// Controller that keeps its output, errors and monitor channels.
///
/// Monitored reads come from the most recently started monitor.
pub struct RecordingController {
    id: ControllerId,
    errors: CollectSink,
    text: String,
    queue: usize,
    monitors: Vec<(MonitorId, mpsc::Receiver<Bytes>)>,
}

impl Default for RecordingController {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingController {
    pub fn new() -> Self {
        Self::with_queue(DEFAULT_QUEUE)
    }

    /// Creates a controller whose monitor channels hold `depth` chunks.
    pub fn with_queue(depth: usize) -> Self {
        Self {
            id: ControllerId::next(),
            errors: CollectSink::new(),
            text: String::new(),
            queue: depth,
            monitors: Vec::new(),
        }
    }

    fn latest(&mut self) -> &mut mpsc::Receiver<Bytes> {
        match self.monitors.last_mut() {
            Some((_, rx)) => rx,
            None => panic!("no monitor started by this controller"),
        }
    }

    pub fn errors(&self) -> &CollectSink {
        &self.errors
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the recorded output and starts over.
    pub fn take_text(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    /// Waits until `len` monitored bytes arrived and returns them.
    ///
    /// Panics if the bytes do not arrive in time.
    pub async fn monitored(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match timeout(WAIT, self.latest().recv()).await {
                Ok(Some(chunk)) => out.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => panic!("expected {} monitored bytes, got {:?}", len, out),
            }
        }
        out
    }

    /// Returns whatever monitored bytes arrive within `wait`.
    pub async fn monitored_within(&mut self, wait: Duration) -> Vec<u8> {
        let rx = self.latest();
        let mut out = Vec::new();
        while let Ok(Some(chunk)) = timeout(wait, rx.recv()).await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Waits for the channel of monitor `id` to close, discarding anything
    /// still queued. Returns false if it stays open.
    pub async fn monitor_ended(&mut self, id: MonitorId) -> bool {
        let Some((_, rx)) = self.monitors.iter_mut().find(|(m, _)| *m == id) else {
            panic!("monitor {} was not started by this controller", id);
        };
        timeout(WAIT, async { while rx.recv().await.is_some() {} })
            .await
            .is_ok()
    }
}

impl ErrorSink for RecordingController {
    fn report(&mut self, err: &BridgeError) {
        self.errors.report(err);
    }
}

impl Controller for RecordingController {
    fn id(&self) -> ControllerId {
        self.id
    }

    fn output(&mut self, text: &str) {
        self.text.push_str(text);
    }

    fn monitor_queue(&self) -> usize {
        self.queue
    }

    fn monitor_attached(&mut self, id: MonitorId, rx: mpsc::Receiver<Bytes>) {
        self.monitors.push((id, rx));
    }
}
