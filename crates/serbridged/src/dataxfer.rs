//! Data transfer engine.
//!
//! One session relays bytes between a network client and the port's device
//! until either side closes, the idle timeout fires, or the registry asks it
//! to stop. Each direction has a single pending buffer and a side is only
//! read once the buffer toward the other side is empty, so a slow consumer
//! throttles the producer instead of growing memory.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use serbridge_common::telnet::escape_iac;
use serbridge_common::{ControlLines, DeviceLock, LockMode, TelnetEvent, TelnetSession};

use crate::defaults::{
    messages, ACCEPT_RETRY, BREAK_LENGTH, BUFFER_SIZE, DRAIN_LIMIT, NEGOTIATION_GRACE,
};
use crate::device::{DeviceEndpoint, LineControl};
use crate::monitor::{deliver, MonitorDirection};
use crate::port::{
    accept, reject, EnableMode, PortCommand, PortConfig, PortContext, PortState, StopMode,
};

/// What the port task does after a session ends.
pub(crate) enum Next {
    /// Go back to accepting clients.
    Listen,
    /// Serve this client next, it replaced the previous one.
    Handoff(TcpStream, SocketAddr),
    /// The port is stopping.
    Exit,
}

#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    NetError(io::Error),
    DeviceClosed,
    DeviceError(io::Error),
    IdleTimeout,
    Disconnected,
    Replaced,
    Stopped,
}

impl CloseReason {
    /// Whether output queued for the client is still worth sending.
    fn drains_net(&self) -> bool {
        !matches!(self, CloseReason::PeerClosed | CloseReason::NetError(_))
    }

    /// Whether output queued for the device is still worth sending.
    fn drains_device(&self) -> bool {
        !matches!(self, CloseReason::DeviceClosed | CloseReason::DeviceError(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("client closed the connection"),
            CloseReason::NetError(e) => write!(f, "network error: {}", e),
            CloseReason::DeviceClosed => f.write_str("device closed"),
            CloseReason::DeviceError(e) => write!(f, "device error: {}", e),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Disconnected => f.write_str("disconnected by administrator"),
            CloseReason::Replaced => f.write_str("replaced by a new client"),
            CloseReason::Stopped => f.write_str("port stopped"),
        }
    }
}

/// Bytes accepted from one side and not yet written to the other.
#[derive(Debug, Default)]
struct Pending {
    buf: Vec<u8>,
    pos: usize,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        if self.is_empty() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= BUFFER_SIZE {
            // Appends can race a slow writer; keep the sent prefix from piling up.
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Protocol layer between the socket and the device.
struct Transfer {
    telnet: Option<TelnetSession>,
    to_dev: Pending,
    to_net: Pending,
    reply: Vec<u8>,
    events: Vec<TelnetEvent>,
}

impl Transfer {
    fn new(mode: EnableMode) -> Self {
        Self {
            telnet: (mode == EnableMode::Telnet).then(TelnetSession::new),
            to_dev: Pending::default(),
            to_net: Pending::default(),
            reply: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Queues the opening telnet offers and the banner for the client.
    fn start(&mut self, banner: Option<&str>) {
        if let Some(telnet) = self.telnet.as_mut() {
            telnet.start(&mut self.to_net.buf);
        }
        if let Some(banner) = banner {
            self.push_to_net(banner.as_bytes());
        }
    }

    fn push_to_net(&mut self, data: &[u8]) {
        match self.telnet {
            Some(_) => escape_iac(data, &mut self.to_net.buf),
            None => self.to_net.buf.extend_from_slice(data),
        }
    }

    /// Decodes client bytes into the device queue. Returns the number of
    /// break requests seen.
    fn from_net(&mut self, input: &[u8]) -> usize {
        let Some(telnet) = self.telnet.as_mut() else {
            self.to_dev.buf.extend_from_slice(input);
            return 0;
        };

        self.reply.clear();
        self.events.clear();
        telnet.process(input, &mut self.to_dev.buf, &mut self.reply, &mut self.events);
        self.to_net.buf.extend_from_slice(&self.reply);

        let mut breaks = 0;
        for event in &self.events {
            match event {
                TelnetEvent::Break => breaks += 1,
                TelnetEvent::Ignored(cmd) => debug!(command = cmd, "telnet command ignored"),
            }
        }
        breaks
    }

    fn from_dev(&mut self, input: &[u8]) {
        self.push_to_net(input);
    }

    /// Whether client input may be read now. Telnet replies go toward the
    /// client, so a client that does not read is not read from either.
    fn accepts_net(&self) -> bool {
        self.to_dev.is_empty()
            && (self.telnet.is_none() || self.to_net.remaining().len() < BUFFER_SIZE)
    }

    fn negotiation_complete(&self) -> bool {
        self.telnet.as_ref().map_or(true, |t| t.negotiation_complete())
    }
}

fn idle_expired(ctx: &PortContext) -> bool {
    let shared = ctx.lock();
    let limit = shared.config.timeout;
    !limit.is_zero()
        && shared
            .status
            .last_activity
            .map_or(false, |at| at.elapsed() >= limit)
}

fn apply_control(control: &mut dyn LineControl, lines: ControlLines) {
    if let Some(level) = lines.dtr {
        match control.set_dtr(level) {
            Ok(()) => info!("DTR set {}", if level { "high" } else { "low" }),
            Err(e) => warn!("Unable to set DTR: {}", e),
        }
    }
    if let Some(level) = lines.rts {
        match control.set_rts(level) {
            Ok(()) => info!("RTS set {}", if level { "high" } else { "low" }),
            Err(e) => warn!("Unable to set RTS: {}", e),
        }
    }
}

/// Takes or gives up the device lock after `LOCK` was switched during a session.
fn sync_lock(ctx: &PortContext, device: &str, mode: LockMode, held: &mut Option<DeviceLock>) {
    match (mode, held.is_some()) {
        (LockMode::On, false) => match ctx.locks.acquire(device, &ctx.name) {
            Ok(guard) => {
                info!("Device {} locked", device);
                *held = Some(guard);
            }
            Err(e) => warn!("{}, session continues unlocked", e),
        },
        (LockMode::Off, true) => {
            *held = None;
            info!("Device {} unlocked", device);
        }
        _ => {}
    }
}

/// Relays one client session until it closes.
pub(crate) async fn run_session(
    ctx: &PortContext,
    config: &PortConfig,
    net: TcpStream,
    endpoint: DeviceEndpoint,
    listener: &mut Option<TcpListener>,
    cmds: &mut UnboundedReceiver<PortCommand>,
) -> Next {
    let DeviceEndpoint { io, mut control, mut lock } = endpoint;
    let (mut dev_rd, mut dev_wr) = tokio::io::split(io);
    let (mut net_rd, mut net_wr) = net.into_split();

    let mut xfer = Transfer::new(config.enable);
    let banner = config.options.expand_banner(&config.name, &config.device);
    xfer.start(banner.as_deref());

    let reads_device = config.enable != EnableMode::RawLp;
    let mut state = if xfer.telnet.is_some() {
        PortState::Negotiating
    } else {
        PortState::Connected
    };
    let started = Instant::now();
    {
        let mut shared = ctx.lock();
        let status = &mut shared.status;
        status.state = state;
        status.last_activity = Some(started);
        status.tcp_bytes_in = 0;
        status.tcp_bytes_out = 0;
        status.dev_bytes_in = 0;
        status.dev_bytes_out = 0;
    }

    let mut net_buf = vec![0u8; BUFFER_SIZE];
    let mut dev_buf = vec![0u8; BUFFER_SIZE];
    let mut ticker = interval(ctx.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut break_until: Option<Instant> = None;
    let mut retiring = false;
    // The ticker re-evaluates this gate while accepting is paused.
    let mut accept_after: Option<Instant> = None;
    let mut successor: Option<(TcpStream, SocketAddr)> = None;

    let reason = 'relay: loop {
        tokio::select! {
            res = net_rd.read(&mut net_buf), if xfer.accepts_net() => match res {
                Ok(0) => break 'relay CloseReason::PeerClosed,
                Ok(n) => {
                    let breaks = xfer.from_net(&net_buf[..n]);
                    let no_break = {
                        let mut shared = ctx.lock();
                        shared.status.tcp_bytes_in += n as u64;
                        shared.status.last_activity = Some(Instant::now());
                        deliver(&mut shared.taps, MonitorDirection::Tcp, xfer.to_dev.remaining());
                        shared.config.options.no_break
                    };
                    if breaks > 0 {
                        if no_break {
                            debug!("break request ignored");
                        } else {
                            match control.set_break(true) {
                                Ok(()) => break_until = Some(Instant::now() + BREAK_LENGTH),
                                Err(e) => warn!("Unable to send break: {}", e),
                            }
                        }
                    }
                    if state == PortState::Negotiating && xfer.negotiation_complete() {
                        state = PortState::Connected;
                        ctx.set_state(state);
                    }
                }
                Err(e) => break 'relay CloseReason::NetError(e),
            },

            res = dev_rd.read(&mut dev_buf),
                if reads_device && state == PortState::Connected && xfer.to_net.is_empty() =>
            match res {
                Ok(0) => break 'relay CloseReason::DeviceClosed,
                Ok(n) => {
                    let data = &dev_buf[..n];
                    {
                        let mut shared = ctx.lock();
                        shared.status.dev_bytes_in += n as u64;
                        shared.status.last_activity = Some(Instant::now());
                        deliver(&mut shared.taps, MonitorDirection::Term, data);
                    }
                    xfer.from_dev(data);
                }
                Err(e) => break 'relay CloseReason::DeviceError(e),
            },

            res = dev_wr.write(xfer.to_dev.remaining()), if !xfer.to_dev.is_empty() => match res {
                Ok(0) => break 'relay CloseReason::DeviceError(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    xfer.to_dev.advance(n);
                    ctx.lock().status.dev_bytes_out += n as u64;
                }
                Err(e) => break 'relay CloseReason::DeviceError(e),
            },

            res = net_wr.write(xfer.to_net.remaining()), if !xfer.to_net.is_empty() => match res {
                Ok(0) => break 'relay CloseReason::NetError(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    xfer.to_net.advance(n);
                    ctx.lock().status.tcp_bytes_out += n as u64;
                }
                Err(e) => break 'relay CloseReason::NetError(e),
            },

            _ = sleep_until(break_until.unwrap_or_else(Instant::now)), if break_until.is_some() => {
                break_until = None;
                if let Err(e) = control.set_break(false) {
                    warn!("Unable to end break: {}", e);
                }
            },

            _ = sleep_until(started + NEGOTIATION_GRACE), if state == PortState::Negotiating => {
                debug!("telnet negotiation incomplete, starting data flow");
                state = PortState::Connected;
                ctx.set_state(state);
            },

            _ = ticker.tick() => {
                if idle_expired(ctx) {
                    break 'relay CloseReason::IdleTimeout;
                }
            },

            cmd = cmds.recv() => match cmd {
                None => {
                    retiring = true;
                    break 'relay CloseReason::Stopped;
                }
                Some(PortCommand::Disconnect) => break 'relay CloseReason::Disconnected,
                Some(PortCommand::Stop(StopMode::Now)) => {
                    retiring = true;
                    break 'relay CloseReason::Stopped;
                }
                Some(PortCommand::Stop(StopMode::AfterSession)) => {
                    retiring = true;
                    *listener = None;
                    info!("Port retired, finishing current session");
                }
                Some(PortCommand::ApplyDevConfig) => {
                    let devcfg = ctx.lock().config.devcfg;
                    match control.apply(&devcfg) {
                        Ok(()) => info!(config = %devcfg, "Device reconfigured"),
                        Err(e) => warn!("Unable to apply device configuration: {}", e),
                    }
                    sync_lock(ctx, &config.device, devcfg.lock, &mut lock);
                }
                Some(PortCommand::SetControl(lines)) => apply_control(control.as_mut(), lines),
            },

            res = accept(listener.as_ref()),
                if listener.is_some() && accept_after.map_or(true, |at| Instant::now() >= at) =>
            match res {
                Ok((stream, peer)) => {
                    if ctx.lock().config.options.kick_old_user {
                        info!(%peer, "New client replaces current session");
                        successor = Some((stream, peer));
                        break 'relay CloseReason::Replaced;
                    }
                    info!(%peer, "Rejecting client, port in use");
                    tokio::spawn(reject(stream, messages::PORT_IN_USE));
                }
                Err(e) => {
                    warn!("accept failed: {}, pausing {:?}", e, ACCEPT_RETRY);
                    accept_after = Some(Instant::now() + ACCEPT_RETRY);
                }
            },
        }
    };

    ctx.set_state(PortState::Closing);
    info!("Closing session: {}", reason);

    if reason.drains_net() && !xfer.to_net.is_empty() {
        match timeout(DRAIN_LIMIT, net_wr.write_all(xfer.to_net.remaining())).await {
            Ok(Ok(())) => ctx.lock().status.tcp_bytes_out += xfer.to_net.remaining().len() as u64,
            _ => debug!("client output discarded"),
        }
    }
    if reason.drains_device() && !xfer.to_dev.is_empty() {
        match timeout(DRAIN_LIMIT, dev_wr.write_all(xfer.to_dev.remaining())).await {
            Ok(Ok(())) => ctx.lock().status.dev_bytes_out += xfer.to_dev.remaining().len() as u64,
            _ => debug!("device output discarded"),
        }
    }
    let _ = timeout(DRAIN_LIMIT, net_wr.shutdown()).await;

    if break_until.is_some() {
        let _ = control.set_break(false);
    }
    if ctx.lock().config.devcfg.line.hangup_when_done {
        if let Err(e) = control.set_dtr(false) {
            debug!("Unable to drop DTR: {}", e);
        }
    }

    // Close the device before giving up its lock.
    drop(dev_rd);
    drop(dev_wr);
    drop(control);
    drop(lock);

    if retiring {
        Next::Exit
    } else if let Some((stream, peer)) = successor {
        Next::Handoff(stream, peer)
    } else {
        Next::Listen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serbridge_common::telnet::{option, BREAK, DO, DONT, IAC, WILL, WONT};

    #[test]
    fn test_pending_advance_resets() {
        let mut p = Pending::default();
        p.buf.extend_from_slice(b"hello");
        p.advance(2);
        assert_eq!(p.remaining(), b"llo");
        p.advance(3);
        assert!(p.is_empty());
        assert!(p.buf.is_empty());
    }

    #[test]
    fn test_pending_compacts_sent_prefix() {
        let mut p = Pending::default();
        p.buf.resize(BUFFER_SIZE + 10, b'x');
        p.advance(BUFFER_SIZE);
        assert_eq!(p.pos, 0);
        assert_eq!(p.remaining().len(), 10);
    }

    #[test]
    fn test_telnet_input_paused_while_replies_back_up() {
        let mut x = Transfer::new(EnableMode::Telnet);
        x.start(None);
        assert!(x.accepts_net());

        // Each DO/DONT pair toggles BINARY and earns a WILL/WONT pair.
        let toggles =
            [IAC, DO, option::BINARY, IAC, DONT, option::BINARY].repeat(BUFFER_SIZE / 6 + 1);
        x.from_net(&toggles);
        assert!(x.to_dev.is_empty());
        assert!(x.to_net.remaining().len() >= BUFFER_SIZE);
        assert!(!x.accepts_net());

        let backlog = x.to_net.remaining().len();
        x.to_net.advance(backlog);
        assert!(x.accepts_net());
    }

    #[test]
    fn test_raw_input_ignores_client_backlog() {
        let mut x = Transfer::new(EnableMode::Raw);
        x.from_dev(&[b'z'; BUFFER_SIZE]);
        assert!(x.accepts_net());
        x.from_net(b"q");
        assert!(!x.accepts_net());
    }

    #[test]
    fn test_raw_passthrough() {
        let mut x = Transfer::new(EnableMode::Raw);
        x.start(None);
        assert!(x.to_net.is_empty());
        assert!(x.negotiation_complete());

        assert_eq!(x.from_net(&[IAC, BREAK, b'a']), 0);
        assert_eq!(x.to_dev.remaining(), &[IAC, BREAK, b'a']);

        x.from_dev(&[0xff, b'b']);
        assert_eq!(x.to_net.remaining(), &[0xff, b'b']);
    }

    #[rustfmt::skip]
    #[test]
    fn test_telnet_start_and_banner() {
        let mut x = Transfer::new(EnableMode::Telnet);
        x.start(Some("hi\u{ff}"));
        let expected: Vec<u8> = [
            &[IAC, WILL, option::SUPPRESS_GO_AHEAD, IAC, WILL, option::ECHO, IAC, DONT, option::LINEMODE][..],
            "hi".as_bytes(),
            &[0xc3, 0xbf][..],
        ]
        .concat();
        assert_eq!(x.to_net.remaining(), expected.as_slice());
        assert!(!x.negotiation_complete());
    }

    #[rustfmt::skip]
    #[test]
    fn test_telnet_strips_commands_and_counts_breaks() {
        let mut x = Transfer::new(EnableMode::Telnet);
        x.start(None);
        let offers = x.to_net.remaining().len();
        x.to_net.advance(offers);

        let input = [
            IAC, DO, option::SUPPRESS_GO_AHEAD,
            IAC, DO, option::ECHO,
            IAC, WONT, option::LINEMODE,
            b'o', b'k', IAC, IAC, IAC, BREAK,
        ];
        assert_eq!(x.from_net(&input), 1);
        assert_eq!(x.to_dev.remaining(), &[b'o', b'k', 0xff]);
        assert!(x.negotiation_complete());
    }

    #[test]
    fn test_telnet_escapes_device_output() {
        let mut x = Transfer::new(EnableMode::Telnet);
        x.from_dev(&[b'a', 0xff, b'b']);
        assert_eq!(x.to_net.remaining(), &[b'a', IAC, IAC, b'b']);
    }

    #[test]
    fn test_close_reason_drain_policy() {
        assert!(!CloseReason::PeerClosed.drains_net());
        assert!(CloseReason::PeerClosed.drains_device());
        assert!(CloseReason::IdleTimeout.drains_net());
        assert!(!CloseReason::DeviceClosed.drains_device());
        assert!(CloseReason::Disconnected.drains_device());
    }
}
