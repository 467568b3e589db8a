//! Test fixtures for driving a port registry end to end
//!
//! Ports in tests listen on loopback with a port number picked by
//! [`free_listen_spec`]; clients reach them through [`connect`].

use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use serbridge_common::CollectSink;
use serbridged::{PortMgr, PortState};

use crate::device::FakeOpener;

/// Longest time any single expectation may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Port task polling interval used in tests.
pub const TEST_TICK: Duration = Duration::from_millis(20);

const POLL: Duration = Duration::from_millis(10);

/// Installs a test log writer once per process. `RUST_LOG` picks the level.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Returns a loopback listen spec, `127.0.0.1,<port>`, for a port that was
/// free a moment ago.
pub fn free_listen_spec() -> String {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind scratch listener");
    let port = listener.local_addr().expect("scratch address").port();
    format!("127.0.0.1,{}", port)
}

/// Creates a registry serving devices from `opener`.
pub fn test_mgr(opener: &Arc<FakeOpener>) -> PortMgr {
    init_logging();
    PortMgr::new().with_opener(opener.clone()).with_tick(TEST_TICK)
}

/// Declares a port and asserts the declaration was accepted.
pub fn add_port(
    mgr: &mut PortMgr,
    portnum: &str,
    state: &str,
    timeout: &str,
    device: &str,
    devcfg: &str,
    generation: u64,
) {
    let mut sink = CollectSink::new();
    let result = mgr.portconfig(&mut sink, portnum, state, timeout, device, devcfg, generation);
    assert!(result.is_ok(), "portconfig {} failed: {:?}", portnum, sink.reports());
}

/// Polls `check` until it holds. Panics after [`WAIT`].
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(POLL).await;
    }
}

/// Waits until the port matching `spec` is in `state`.
pub async fn wait_for_state(mgr: &PortMgr, spec: &str, state: PortState) {
    let deadline = Instant::now() + WAIT;
    loop {
        let current = mgr.port_state(spec);
        if current == Some(state) {
            return;
        }
        if Instant::now() >= deadline {
            panic!("port {} stuck in {:?}, expected {:?}", spec, current, state);
        }
        sleep(POLL).await;
    }
}

/// Address clients use to reach a listening port.
pub async fn listen_addr(mgr: &PortMgr, spec: &str) -> SocketAddr {
    let mut addr = None;
    wait_until("port to listen", || {
        addr = mgr.port_status(spec).and_then(|s| s.local_addr);
        addr.is_some()
    })
    .await;
    addr.expect("checked above")
}

/// Connects a client to the port matching `spec`.
pub async fn connect(mgr: &PortMgr, spec: &str) -> TcpStream {
    let addr = listen_addr(mgr, spec).await;
    timeout(WAIT, TcpStream::connect(addr))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

/// Reads exactly `len` bytes. Panics if they do not arrive in time.
pub async fn read_exactly<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, reader.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Reads until the other side closes and returns everything received.
pub async fn read_to_close<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(WAIT, reader.read_to_end(&mut buf))
        .await
        .expect("peer never closed")
        .expect("read failed");
    buf
}

/// Asserts nothing arrives on `reader` for `quiet`.
pub async fn assert_silent<R: AsyncRead + Unpin>(reader: &mut R, quiet: Duration) {
    let mut buf = [0u8; 64];
    if let Ok(res) = timeout(quiet, reader.read(&mut buf)).await {
        match res {
            Ok(0) => panic!("peer closed while expected to stay silent"),
            Ok(n) => panic!("unexpected data: {:?}", &buf[..n]),
            Err(e) => panic!("read failed: {}", e),
        }
    }
}
