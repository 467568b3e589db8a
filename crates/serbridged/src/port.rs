//! Port model and the per-port task.
//!
//! Each enabled port runs one task that owns its listener, accepts clients,
//! opens the device and hands the pair to the data transfer engine. The
//! registry talks to the task through [`PortCommand`]s and reads its
//! progress from the shared [`PortShared`] snapshot.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use serbridge_common::{BridgeError, BridgeResult, ControlLines, DevConfig, DeviceLocks};

use crate::dataxfer::{run_session, Next};
use crate::defaults::{messages, ACCEPT_RETRY, DRAIN_LIMIT, LISTEN_RETRY};
use crate::device::{open_endpoint, DeviceOpener};
use crate::monitor::MonitorTap;

/// How a port serves its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnableMode {
    /// Not listening.
    #[default]
    Off,
    /// Bytes relayed unchanged in both directions.
    Raw,
    /// Bytes relayed from the network to the device only.
    RawLp,
    /// Telnet command processing on the network side.
    Telnet,
}

impl EnableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnableMode::Off => "off",
            EnableMode::Raw => "raw",
            EnableMode::RawLp => "rawlp",
            EnableMode::Telnet => "telnet",
        }
    }

    /// Returns true for every mode that listens.
    pub fn is_enabled(&self) -> bool {
        *self != EnableMode::Off
    }
}

impl fmt::Display for EnableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnableMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(EnableMode::Off),
            "raw" => Ok(EnableMode::Raw),
            "rawlp" => Ok(EnableMode::RawLp),
            "telnet" => Ok(EnableMode::Telnet),
            _ => Err(BridgeError::invalid_config(
                "port state",
                s,
                "expected off, raw, rawlp or telnet",
            )),
        }
    }
}

/// Lifecycle state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    /// No listener.
    #[default]
    Disabled,
    /// Waiting for a client.
    Listening,
    /// Client accepted and device opened, session starting.
    OpenIdle,
    /// Telnet options being negotiated.
    Negotiating,
    /// Data is flowing.
    Connected,
    /// Session is draining and closing.
    Closing,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Disabled => "disabled",
            PortState::Listening => "listening",
            PortState::OpenIdle => "open",
            PortState::Negotiating => "negotiating",
            PortState::Connected => "connected",
            PortState::Closing => "closing",
        }
    }

    /// Returns true while a client session holds the device open.
    pub fn in_session(&self) -> bool {
        matches!(
            self,
            PortState::OpenIdle | PortState::Negotiating | PortState::Connected | PortState::Closing
        )
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listen address of a port, written `[host,]tcpport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub host: Option<String>,
    pub port: u16,
}

impl ListenSpec {
    /// Returns the address to bind, all interfaces when no host is given.
    pub fn bind_addr(&self) -> String {
        match self.host.as_deref() {
            Some(host) if host.contains(':') => format!("[{}]:{}", host, self.port),
            Some(host) => format!("{}:{}", host, self.port),
            None => format!("0.0.0.0:{}", self.port),
        }
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{},{}", host, self.port),
            None => write!(f, "{}", self.port),
        }
    }
}

impl FromStr for ListenSpec {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(',') {
            Some((host, port)) => (Some(host.trim()), port.trim()),
            None => (None, s),
        };
        if host == Some("") {
            return Err(BridgeError::invalid_config("port", s, "empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BridgeError::invalid_config("port", s, "expected [host,]tcpport"))?;
        Ok(ListenSpec {
            host: host.map(str::to_string),
            port,
        })
    }
}

/// Per-port options carried in the device configuration string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortOptions {
    /// A new client replaces the current one instead of being turned away.
    pub kick_old_user: bool,
    /// Ignore telnet break requests.
    pub no_break: bool,
    /// Text sent to each client on connect, escapes not yet expanded.
    pub banner: Option<String>,
}

impl PortOptions {
    /// Accepts a token the device configuration parser did not recognise.
    ///
    /// Returns false if the token is not a port option either.
    pub fn accept_token(&mut self, token: &str) -> bool {
        if let Some(text) = strip_prefix_ignore_case(token, "BANNER=") {
            self.banner = Some(text.to_string());
            return true;
        }
        match token.to_ascii_uppercase().as_str() {
            "KICKOLDUSER" => self.kick_old_user = true,
            "-KICKOLDUSER" => self.kick_old_user = false,
            "NOBREAK" => self.no_break = true,
            "-NOBREAK" => self.no_break = false,
            _ => return false,
        }
        true
    }

    /// Expands the banner for a session on `port` using `device`.
    ///
    /// Supported escapes: `\r`, `\n`, `\t`, `\s` (space), `\\`, `\p` (port
    /// name) and `\d` (device path). Unknown escapes are kept literally.
    pub fn expand_banner(&self, port: &str, device: &str) -> Option<String> {
        let raw = self.banner.as_deref()?;
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('s') => out.push(' '),
                Some('\\') => out.push('\\'),
                Some('p') => out.push_str(port),
                Some('d') => out.push_str(device),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        Some(out)
    }
}

impl fmt::Display for PortOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.kick_old_user {
            parts.push("kickolduser".to_string());
        }
        if self.no_break {
            parts.push("NOBREAK".to_string());
        }
        if let Some(banner) = &self.banner {
            parts.push(format!("BANNER={}", banner));
        }
        f.write_str(&parts.join(" "))
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Parses an idle timeout in whole seconds; zero disables it.
pub fn parse_timeout(s: &str) -> BridgeResult<Duration> {
    s.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| BridgeError::invalid_config("timeout", s, "expected seconds"))
}

/// Complete configuration of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Registry key, the portnum string as given.
    pub name: String,
    pub listen: ListenSpec,
    pub enable: EnableMode,
    /// Idle timeout, zero for none.
    pub timeout: Duration,
    pub device: String,
    pub devcfg: DevConfig,
    pub options: PortOptions,
}

impl PortConfig {
    /// Parses the five configuration strings of a port.
    pub fn parse(
        portnum: &str,
        state: &str,
        timeout: &str,
        devname: &str,
        devcfg: &str,
    ) -> BridgeResult<Self> {
        let listen: ListenSpec = portnum.parse()?;
        let enable: EnableMode = state.parse()?;
        let timeout = parse_timeout(timeout)?;

        let device = devname.trim();
        if device.is_empty() {
            return Err(BridgeError::invalid_config("device", devname, "empty device name"));
        }

        let mut options = PortOptions::default();
        let devcfg = serbridge_common::devcfg::parse_devcfg(devcfg, |t| options.accept_token(t))?;

        Ok(PortConfig {
            name: portnum.trim().to_string(),
            listen,
            enable,
            timeout,
            device: device.to_string(),
            devcfg,
            options,
        })
    }

    /// Returns the device configuration and port options as one string.
    pub fn devcfg_string(&self) -> String {
        let options = self.options.to_string();
        if options.is_empty() {
            self.devcfg.to_string()
        } else {
            format!("{} {}", self.devcfg, options)
        }
    }
}

/// Runtime status of a port.
#[derive(Debug, Clone, Default)]
pub struct PortStatus {
    pub state: PortState,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Bytes read from the network client, telnet commands included.
    pub tcp_bytes_in: u64,
    /// Bytes written to the network client.
    pub tcp_bytes_out: u64,
    /// Bytes read from the device.
    pub dev_bytes_in: u64,
    /// Bytes written to the device.
    pub dev_bytes_out: u64,
    pub last_activity: Option<Instant>,
    /// Number of monitors attached.
    pub monitors: usize,
    /// Why the listener could not be bound, while the bind is retried.
    pub listen_error: Option<String>,
}

/// State shared between a port task and the registry.
#[derive(Debug)]
pub(crate) struct PortShared {
    pub config: PortConfig,
    pub status: PortStatus,
    pub taps: Vec<MonitorTap>,
}

impl PortShared {
    pub fn new(config: PortConfig) -> Self {
        Self {
            config,
            status: PortStatus::default(),
            taps: Vec::new(),
        }
    }

    /// Returns the status with derived fields filled in.
    pub fn snapshot(&self) -> PortStatus {
        let mut status = self.status.clone();
        status.monitors = self.taps.len();
        status
    }
}

pub(crate) type SharedPort = Arc<Mutex<PortShared>>;

pub(crate) fn lock_shared(shared: &SharedPort) -> MutexGuard<'_, PortShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a stop request treats an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Close any session and exit.
    Now,
    /// Stop listening, let the current session finish, then exit.
    AfterSession,
}

/// Requests from the registry to a port task.
#[derive(Debug)]
pub(crate) enum PortCommand {
    /// Close the current session.
    Disconnect,
    /// Re-apply the device configuration found in the shared config.
    ApplyDevConfig,
    SetControl(ControlLines),
    Stop(StopMode),
}

/// Everything a port task needs.
pub(crate) struct PortContext {
    pub name: String,
    pub shared: SharedPort,
    pub opener: Arc<dyn DeviceOpener>,
    pub locks: DeviceLocks,
    pub tick: Duration,
}

impl PortContext {
    pub fn lock(&self) -> MutexGuard<'_, PortShared> {
        lock_shared(&self.shared)
    }

    pub fn config(&self) -> PortConfig {
        self.lock().config.clone()
    }

    pub fn set_state(&self, state: PortState) {
        let mut shared = self.lock();
        if shared.status.state != state {
            debug!(from = %shared.status.state, to = %state, "port state");
            shared.status.state = state;
        }
    }
}

/// Registry side of a running port task.
#[derive(Debug)]
pub(crate) struct PortHandle {
    cmd_tx: UnboundedSender<PortCommand>,
    join: JoinHandle<()>,
}

impl PortHandle {
    pub fn send(&self, cmd: PortCommand) {
        // A send error means the task already exited; reaping handles that.
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Starts the task for one port. Must be called inside a tokio runtime.
pub(crate) fn spawn_port(ctx: PortContext) -> PortHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let span = info_span!("port", name = %ctx.name);
    let join = tokio::spawn(run_port(ctx, cmd_rx).instrument(span));
    PortHandle { cmd_tx, join }
}

async fn bind(ctx: &PortContext) -> BridgeResult<TcpListener> {
    let addr = ctx.config().listen.bind_addr();
    TcpListener::bind(addr.as_str())
        .await
        .map_err(|source| BridgeError::ListenFailed { addr, source })
}

/// Accepts on `listener`, or waits forever when there is none.
pub(crate) async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Writes `message` to a client that cannot be served, then closes it.
pub(crate) async fn reject(mut stream: TcpStream, message: &'static [u8]) {
    let _ = timeout(DRAIN_LIMIT, stream.write_all(message)).await;
    let _ = timeout(DRAIN_LIMIT, stream.shutdown()).await;
}

async fn run_port(ctx: PortContext, mut cmds: UnboundedReceiver<PortCommand>) {
    let mut handoff: Option<(TcpStream, SocketAddr)> = None;

    'listen: loop {
        let listener = match bind(&ctx).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("{}, retrying in {:?}", e, LISTEN_RETRY);
                {
                    let mut shared = ctx.lock();
                    shared.status.state = PortState::Disabled;
                    shared.status.local_addr = None;
                    shared.status.listen_error = Some(e.to_string());
                }
                tokio::select! {
                    _ = sleep(LISTEN_RETRY) => continue 'listen,
                    cmd = cmds.recv() => match cmd {
                        None | Some(PortCommand::Stop(_)) => break 'listen,
                        Some(_) => continue 'listen,
                    },
                }
            }
        };

        let local = listener.local_addr().ok();
        {
            let mut shared = ctx.lock();
            shared.status.state = PortState::Listening;
            shared.status.local_addr = local;
            shared.status.listen_error = None;
        }
        if let Some(addr) = local {
            info!("Listening on {}", addr);
        }
        let mut listener = Some(listener);

        loop {
            let (stream, peer) = match handoff.take() {
                Some(client) => client,
                None => tokio::select! {
                    res = accept(listener.as_ref()) => match res {
                        Ok(client) => client,
                        Err(e) => {
                            // Out of descriptors and the like; do not spin.
                            warn!("accept failed: {}, pausing {:?}", e, ACCEPT_RETRY);
                            sleep(ACCEPT_RETRY).await;
                            continue;
                        }
                    },
                    cmd = cmds.recv() => match cmd {
                        None | Some(PortCommand::Stop(_)) => break 'listen,
                        Some(other) => {
                            debug!("ignoring {:?}, no session", other);
                            continue;
                        }
                    },
                },
            };

            match serve_client(&ctx, stream, peer, &mut listener, &mut cmds).await {
                Next::Listen => {}
                Next::Handoff(stream, peer) => handoff = Some((stream, peer)),
                Next::Exit => break 'listen,
            }
            ctx.set_state(PortState::Listening);
        }
    }

    {
        let mut shared = ctx.lock();
        shared.status.state = PortState::Disabled;
        shared.status.local_addr = None;
        shared.status.remote_addr = None;
        shared.taps.clear();
    }
    info!("Port stopped");
}

async fn serve_client(
    ctx: &PortContext,
    stream: TcpStream,
    peer: SocketAddr,
    listener: &mut Option<TcpListener>,
    cmds: &mut UnboundedReceiver<PortCommand>,
) -> Next {
    let config = ctx.config();
    {
        let mut shared = ctx.lock();
        shared.status.state = PortState::OpenIdle;
        shared.status.remote_addr = Some(peer);
    }

    let endpoint = match open_endpoint(
        ctx.opener.as_ref(),
        &ctx.locks,
        &ctx.name,
        &config.device,
        &config.devcfg,
    ) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(%peer, "{}", e);
            reject(stream, messages::DEVICE_UNAVAILABLE).await;
            ctx.lock().status.remote_addr = None;
            return Next::Listen;
        }
    };

    info!(%peer, device = %config.device, "Client connected");
    let next = run_session(ctx, &config, stream, endpoint, listener, cmds).await;

    let mut shared = ctx.lock();
    shared.status.remote_addr = None;
    shared.taps.clear();
    next
}
