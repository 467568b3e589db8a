//! PortMgr implementation - the port registry and reconfiguration coordinator.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use serbridge_common::devcfg::parse_devcfg;
use serbridge_common::{
    BridgeError, BridgeResult, ControlLines, DeviceLocks, ErrorSink, Rs485Config,
};

use crate::controller::{Controller, ControllerId};
use crate::defaults::DEFAULT_TICK;
use crate::device::DeviceOpener;
use crate::monitor::{MonitorDirection, MonitorEntry, MonitorId, MonitorTable, MonitorTap};
use crate::port::{
    lock_shared, parse_timeout, spawn_port, EnableMode, PortCommand, PortConfig, PortContext,
    PortHandle, PortOptions, PortShared, PortState, PortStatus, SharedPort, StopMode,
};
use crate::serial::SerialOpener;
use crate::show;

/// Returns true if `port` still carries the tap of monitor `id`.
fn tap_attached(ports: &BTreeMap<String, PortEntry>, port: &str, id: MonitorId) -> bool {
    ports
        .get(port)
        .map_or(false, |e| lock_shared(&e.shared).taps.iter().any(|t| t.id == id))
}

/// Reports `result`'s error, if any, to `sink` and passes it on.
fn reported<S: ErrorSink + ?Sized, T>(sink: &mut S, result: BridgeResult<T>) -> BridgeResult<T> {
    if let Err(e) = &result {
        sink.report(e);
    }
    result
}

/// What new port tasks are built from.
struct PortRuntime {
    opener: Arc<dyn DeviceOpener>,
    locks: DeviceLocks,
    tick: Duration,
}

/// Registry record of one port.
struct PortEntry {
    shared: SharedPort,
    /// Configuration generation that last declared this port.
    generation: u64,
    handle: Option<PortHandle>,
    /// Dropped from the configuration, waiting for its session to end.
    retiring: bool,
}

impl PortEntry {
    fn new(config: PortConfig, generation: u64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(PortShared::new(config))),
            generation,
            handle: None,
            retiring: false,
        }
    }

    fn config(&self) -> PortConfig {
        lock_shared(&self.shared).config.clone()
    }

    fn state(&self) -> PortState {
        lock_shared(&self.shared).status.state
    }

    fn enabled(&self) -> bool {
        lock_shared(&self.shared).config.enable.is_enabled()
    }

    fn start(&mut self, name: &str, runtime: &PortRuntime) {
        if self.handle.is_some() {
            return;
        }
        self.handle = Some(spawn_port(PortContext {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            opener: Arc::clone(&runtime.opener),
            locks: runtime.locks.clone(),
            tick: runtime.tick,
        }));
    }

    fn send(&self, cmd: PortCommand) {
        if let Some(handle) = &self.handle {
            handle.send(cmd);
        }
    }
}

/// Port specification as typed by an administrator.
///
/// `*` or `all` selects every port. Otherwise the selector is compared with the
/// port name, its TCP port number, its device path and the device's base
/// name; `*` inside a spec matches any run of characters.
#[derive(Debug)]
enum PortMatcher {
    All,
    Exact(String),
    Pattern(Regex),
}

impl PortMatcher {
    fn new(spec: &str) -> BridgeResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(BridgeError::port_not_found(spec));
        }
        if spec == "*" || spec.eq_ignore_ascii_case("all") {
            return Ok(PortMatcher::All);
        }
        if spec.contains('*') {
            let pattern = format!("^{}$", regex::escape(spec).replace(r"\*", ".*"));
            let re = Regex::new(&pattern)
                .map_err(|e| BridgeError::invalid_config("port", spec, e.to_string()))?;
            return Ok(PortMatcher::Pattern(re));
        }
        Ok(PortMatcher::Exact(spec.to_string()))
    }

    fn matches(&self, config: &PortConfig) -> bool {
        let number = config.listen.port.to_string();
        let base = Path::new(&config.device)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(config.device.as_str());
        let candidates = [config.name.as_str(), number.as_str(), config.device.as_str(), base];

        match self {
            PortMatcher::All => true,
            PortMatcher::Exact(spec) => candidates.contains(&spec.as_str()),
            PortMatcher::Pattern(re) => candidates.iter().any(|c| re.is_match(c)),
        }
    }
}

/// Port registry.
///
/// Owns every configured port, starts and stops their tasks, and carries out
/// the administrative operations. All methods are synchronous; the ones that
/// start ports must be called from inside a tokio runtime.
pub struct PortMgr {
    ports: BTreeMap<String, PortEntry>,
    /// Tasks detached from the registry that are still winding down.
    draining: Vec<PortHandle>,
    monitors: MonitorTable,
    runtime: PortRuntime,
    shutting_down: bool,
}

impl Default for PortMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl PortMgr {
    /// Creates an empty registry using real serial devices.
    pub fn new() -> Self {
        Self {
            ports: BTreeMap::new(),
            draining: Vec::new(),
            monitors: MonitorTable::default(),
            runtime: PortRuntime {
                opener: Arc::new(SerialOpener),
                locks: DeviceLocks::new(),
                tick: DEFAULT_TICK,
            },
            shutting_down: false,
        }
    }

    /// Uses `opener` to open devices for ports started from now on.
    pub fn with_opener(mut self, opener: Arc<dyn DeviceOpener>) -> Self {
        self.runtime.opener = opener;
        self
    }

    /// Uses `locks` as the device lock table.
    pub fn with_locks(mut self, locks: DeviceLocks) -> Self {
        self.runtime.locks = locks;
        self
    }

    /// Sets the polling interval of port tasks started from now on.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.runtime.tick = tick;
        self
    }

    /// Returns the device lock table.
    pub fn locks(&self) -> &DeviceLocks {
        &self.runtime.locks
    }

    /// Creates or updates a port.
    ///
    /// # Arguments
    ///
    /// * `portnum` - Listen address, `[host,]tcpport`; also the port's name
    /// * `state` - `off`, `raw`, `rawlp` or `telnet`
    /// * `timeout` - Idle timeout in seconds, `0` for none
    /// * `devname` - Device path
    /// * `devcfg` - Device configuration and port options
    /// * `generation` - Configuration generation declaring the port
    ///
    /// If any string is malformed the error goes to `sink` and the registry
    /// is left as it was. Updating a port keeps its session unless the
    /// device changed; a changed device configuration is applied to the open
    /// device and a changed address rebinds the listener.
    #[instrument(skip(self, sink))]
    pub fn portconfig(
        &mut self,
        sink: &mut dyn ErrorSink,
        portnum: &str,
        state: &str,
        timeout: &str,
        devname: &str,
        devcfg: &str,
        generation: u64,
    ) -> BridgeResult<()> {
        let result = PortConfig::parse(portnum, state, timeout, devname, devcfg)
            .map(|config| self.apply_port_config(config, generation));
        reported(sink, result)
    }

    fn apply_port_config(&mut self, config: PortConfig, generation: u64) {
        self.maintain();
        let name = config.name.clone();

        // A port coming back while its retired predecessor still runs gets
        // a fresh entry; the old task finishes on its own.
        if self.ports.get(&name).map_or(false, |e| e.retiring) {
            if let Some(old) = self.ports.remove(&name) {
                self.draining.extend(old.handle);
            }
        }

        let Some(entry) = self.ports.get_mut(&name) else {
            let enabled = config.enable.is_enabled();
            let mut entry = PortEntry::new(config, generation);
            if enabled && !self.shutting_down {
                entry.start(&name, &self.runtime);
            }
            info!("Added port {}", name);
            self.ports.insert(name, entry);
            return;
        };

        let old = std::mem::replace(&mut lock_shared(&entry.shared).config, config.clone());
        entry.generation = generation;

        if !config.enable.is_enabled() {
            if let Some(handle) = entry.handle.take() {
                handle.send(PortCommand::Stop(StopMode::Now));
                self.draining.push(handle);
            }
        } else if entry.handle.is_none() {
            if !self.shutting_down {
                entry.start(&name, &self.runtime);
            }
        } else if old.device != config.device {
            info!("Port {} device changed to {}", name, config.device);
            entry.send(PortCommand::Disconnect);
        } else if old.devcfg != config.devcfg {
            entry.send(PortCommand::ApplyDevConfig);
        }
        info!("Updated port {}", name);
    }

    /// Retires every port declared by a generation older than `generation`.
    ///
    /// Idle ports go away immediately. Ports with a session stop listening
    /// and are removed once the session ends.
    #[instrument(skip(self))]
    pub fn clear_old_port_config(&mut self, generation: u64) {
        let mut gone = Vec::new();
        for (name, entry) in self.ports.iter_mut() {
            if entry.generation >= generation || entry.retiring {
                continue;
            }
            entry.retiring = true;
            entry.send(PortCommand::Stop(StopMode::AfterSession));
            if entry.state().in_session() {
                info!("Port {} no longer configured, waiting for session to end", name);
            } else {
                gone.push(name.clone());
            }
        }
        for name in gone {
            if let Some(entry) = self.ports.remove(&name) {
                self.draining.extend(entry.handle);
                info!("Removed port {}", name);
            }
        }
        self.maintain();
    }

    /// Forgets finished tasks, removes retired ports whose session ended and
    /// drops records of monitors that are no longer attached to a port.
    pub fn maintain(&mut self) {
        self.draining.retain(|h| !h.is_finished());

        let mut gone = Vec::new();
        for (name, entry) in self.ports.iter_mut() {
            if entry.handle.as_ref().map_or(false, PortHandle::is_finished) {
                entry.handle = None;
                if !entry.retiring && entry.enabled() && !self.shutting_down {
                    warn!("Port {} task ended unexpectedly, restarting", name);
                    entry.start(name, &self.runtime);
                }
            }
            if entry.retiring && entry.handle.is_none() {
                gone.push(name.clone());
            }
        }
        for name in gone {
            self.ports.remove(&name);
            info!("Removed port {}", name);
        }

        // Sessions drop their taps when they end; forget those monitors too.
        let ports = &self.ports;
        self.monitors.retain(|id, m| tap_attached(ports, &m.port, id));
    }

    /// Asks every port to close its session and stop.
    pub fn shutdown_ports(&mut self) {
        if !self.shutting_down {
            info!("Shutting down {} ports", self.ports.len());
        }
        self.shutting_down = true;
        for entry in self.ports.values() {
            entry.send(PortCommand::Stop(StopMode::Now));
        }
        for handle in &self.draining {
            handle.send(PortCommand::Stop(StopMode::Now));
        }
    }

    /// Returns true once no port task is running and no device is locked.
    pub fn check_ports_shutdown(&mut self) -> bool {
        self.maintain();
        let running = self.ports.values().any(|e| e.handle.is_some()) || !self.draining.is_empty();
        !running && self.runtime.locks.held_count() == 0
    }

    fn matching(&self, spec: &str) -> BridgeResult<Vec<String>> {
        let matcher = PortMatcher::new(spec)?;
        let names: Vec<String> = self
            .ports
            .iter()
            .filter(|(_, e)| matcher.matches(&e.config()))
            .map(|(name, _)| name.clone())
            .collect();
        if names.is_empty() {
            return Err(BridgeError::port_not_found(spec));
        }
        Ok(names)
    }

    fn find(&self, spec: &str) -> Option<&PortEntry> {
        let name = self.matching(spec).ok()?.into_iter().next()?;
        self.ports.get(&name)
    }

    /// Writes the detailed view of the matching ports, or of every port
    /// when `spec` is `None`.
    #[instrument(skip(self, ctl))]
    pub fn showports(&mut self, ctl: &mut dyn Controller, spec: Option<&str>) -> BridgeResult<()> {
        let names = match spec {
            Some(spec) => reported(ctl, self.matching(spec))?,
            None => self.ports.keys().cloned().collect(),
        };
        for name in names {
            let entry = &self.ports[&name];
            let shared = lock_shared(&entry.shared);
            ctl.output(&show::port_long(&shared.config, &shared.snapshot()));
        }
        Ok(())
    }

    /// Writes the one-line-per-port view.
    #[instrument(skip(self, ctl))]
    pub fn showshortports(
        &mut self,
        ctl: &mut dyn Controller,
        spec: Option<&str>,
    ) -> BridgeResult<()> {
        let names = match spec {
            Some(spec) => reported(ctl, self.matching(spec))?,
            None => self.ports.keys().cloned().collect(),
        };
        ctl.output(&show::short_header());
        for name in names {
            let entry = &self.ports[&name];
            let shared = lock_shared(&entry.shared);
            ctl.output(&show::port_short(&shared.config, &shared.snapshot()));
        }
        Ok(())
    }

    /// Changes the idle timeout. An active session's idle clock restarts.
    #[instrument(skip(self, ctl))]
    pub fn setporttimeout(
        &mut self,
        ctl: &mut dyn Controller,
        spec: &str,
        timeout: &str,
    ) -> BridgeResult<()> {
        let result = self.set_timeout(spec, timeout);
        reported(ctl, result)
    }

    fn set_timeout(&mut self, spec: &str, timeout: &str) -> BridgeResult<()> {
        let limit = parse_timeout(timeout)?;
        for name in self.matching(spec)? {
            let mut shared = lock_shared(&self.ports[&name].shared);
            shared.config.timeout = limit;
            if shared.status.state.in_session() {
                shared.status.last_activity = Some(Instant::now());
            }
            info!("Port {} timeout set to {}s", name, limit.as_secs());
        }
        Ok(())
    }

    /// Replaces the device configuration.
    ///
    /// The string is a complete description: settings it leaves out return
    /// to their defaults, RS-485 included. An open device is reconfigured
    /// immediately, and switching `LOCK` takes or releases its lock at once.
    #[instrument(skip(self, ctl))]
    pub fn setportdevcfg(
        &mut self,
        ctl: &mut dyn Controller,
        spec: &str,
        devcfg: &str,
    ) -> BridgeResult<()> {
        let result = self.set_devcfg(spec, devcfg);
        reported(ctl, result)
    }

    fn set_devcfg(&mut self, spec: &str, text: &str) -> BridgeResult<()> {
        let mut options = PortOptions::default();
        let devcfg = parse_devcfg(text, |t| options.accept_token(t))?;
        for name in self.matching(spec)? {
            let entry = &self.ports[&name];
            let live = {
                let mut shared = lock_shared(&entry.shared);
                shared.config.devcfg = devcfg;
                shared.config.options = options.clone();
                shared.status.state.in_session()
            };
            if live {
                entry.send(PortCommand::ApplyDevConfig);
            }
            info!("Port {} device configuration set to {}", name, devcfg);
        }
        Ok(())
    }

    /// Drives DTR and RTS of connected ports.
    #[instrument(skip(self, ctl))]
    pub fn setportcontrol(
        &mut self,
        ctl: &mut dyn Controller,
        spec: &str,
        controls: &str,
    ) -> BridgeResult<()> {
        let result = self.set_control(spec, controls);
        reported(ctl, result)
    }

    fn set_control(&mut self, spec: &str, text: &str) -> BridgeResult<()> {
        let lines: ControlLines = text.parse()?;
        let names = self.matching(spec)?;
        let mut applied = 0;
        for name in &names {
            let entry = &self.ports[name];
            if entry.state().in_session() {
                entry.send(PortCommand::SetControl(lines));
                applied += 1;
            }
        }
        if applied == 0 {
            return Err(BridgeError::port_state(&names[0], "is not currently connected"));
        }
        Ok(())
    }

    /// Changes how a port serves clients.
    ///
    /// `off` closes any session and the listener. Switching between enabled
    /// modes takes effect with the next session.
    #[instrument(skip(self, ctl))]
    pub fn setportenable(
        &mut self,
        ctl: &mut dyn Controller,
        spec: &str,
        enable: &str,
    ) -> BridgeResult<()> {
        let result = self.set_enable(spec, enable);
        reported(ctl, result)
    }

    fn set_enable(&mut self, spec: &str, text: &str) -> BridgeResult<()> {
        let mode: EnableMode = text.parse()?;
        for name in self.matching(spec)? {
            let Some(entry) = self.ports.get_mut(&name) else {
                continue;
            };
            lock_shared(&entry.shared).config.enable = mode;
            if !mode.is_enabled() {
                if let Some(handle) = entry.handle.take() {
                    handle.send(PortCommand::Stop(StopMode::Now));
                    self.draining.push(handle);
                }
            } else if !entry.retiring && !self.shutting_down {
                entry.start(&name, &self.runtime);
            }
            info!("Port {} enable state set to {}", name, mode);
        }
        Ok(())
    }

    /// Closes the active session of the matching ports.
    #[instrument(skip(self, ctl))]
    pub fn disconnect_port(&mut self, ctl: &mut dyn Controller, spec: &str) -> BridgeResult<()> {
        let result = self.disconnect(spec);
        reported(ctl, result)
    }

    fn disconnect(&mut self, spec: &str) -> BridgeResult<()> {
        let names = self.matching(spec)?;
        let mut closed = 0;
        for name in &names {
            let entry = &self.ports[name];
            if entry.state().in_session() {
                entry.send(PortCommand::Disconnect);
                closed += 1;
            }
        }
        if closed == 0 {
            return Err(BridgeError::port_state(&names[0], "is not currently connected"));
        }
        Ok(())
    }

    /// Starts copying one direction of a port's traffic to `ctl`.
    ///
    /// `kind` is `"tcp"` (client to device) or `"term"` (device to client).
    /// The port must be enabled; the monitor ends when the current or next
    /// session closes, or when it is stopped.
    #[instrument(skip(self, ctl))]
    pub fn data_monitor_start(
        &mut self,
        ctl: &mut dyn Controller,
        kind: &str,
        spec: &str,
    ) -> Option<MonitorId> {
        let result = self.monitor_start(ctl, kind, spec);
        reported(ctl, result).ok()
    }

    fn monitor_start(
        &mut self,
        ctl: &mut dyn Controller,
        kind: &str,
        spec: &str,
    ) -> BridgeResult<MonitorId> {
        let direction: MonitorDirection = kind.parse()?;
        let names = self.matching(spec)?;
        let [name] = names.as_slice() else {
            return Err(BridgeError::invalid_config("port", spec, "matches more than one port"));
        };

        let entry = &self.ports[name];
        if entry.retiring || !entry.enabled() {
            return Err(BridgeError::port_state(name, "is not enabled"));
        }

        let id = self.monitors.insert(MonitorEntry {
            owner: ctl.id(),
            port: name.clone(),
            direction,
        });
        let (tx, rx) = mpsc::channel(ctl.monitor_queue().max(1));
        lock_shared(&entry.shared)
            .taps
            .push(MonitorTap::new(id, direction, tx));
        ctl.monitor_attached(id, rx);
        info!(monitor = %id, "Monitoring {} data of port {}", direction, name);
        Ok(id)
    }

    /// Stops a monitor started by `ctl`. Unknown or stale handles are ignored.
    #[instrument(skip(self, ctl))]
    pub fn data_monitor_stop(&mut self, ctl: &mut dyn Controller, id: MonitorId) {
        match self.monitors.get(id) {
            Some(m) if m.owner == ctl.id() => {}
            Some(_) => {
                debug!(monitor = %id, "monitor belongs to another controller");
                return;
            }
            None => {
                debug!(monitor = %id, "monitor already stopped");
                return;
            }
        }
        if let Some(m) = self.monitors.remove(id) {
            if let Some(entry) = self.ports.get(&m.port) {
                lock_shared(&entry.shared).taps.retain(|t| t.id != id);
            }
            info!(monitor = %id, "Stopped monitoring port {}", m.port);
        }
    }

    /// Stops every monitor owned by a controller that went away.
    pub fn release_controller(&mut self, owner: ControllerId) {
        let owned: Vec<(MonitorId, String)> = self
            .monitors
            .iter()
            .filter(|(_, m)| m.owner == owner)
            .map(|(id, m)| (id, m.port.clone()))
            .collect();
        for (id, port) in owned {
            self.monitors.remove(id);
            if let Some(entry) = self.ports.get(&port) {
                lock_shared(&entry.shared).taps.retain(|t| t.id != id);
            }
        }
    }

    /// Returns true while the monitor is attached to its port.
    pub fn monitor_active(&self, id: MonitorId) -> bool {
        self.monitors
            .get(id)
            .map_or(false, |m| tap_attached(&self.ports, &m.port, id))
    }

    /// Returns the number of monitor records the registry holds.
    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Returns the RS-485 settings of the first matching port.
    pub fn get_rs485_conf(&self, spec: &str) -> Option<Rs485Config> {
        self.find(spec)?.config().devcfg.rs485
    }

    /// Returns the state of the first matching port.
    pub fn port_state(&self, spec: &str) -> Option<PortState> {
        Some(self.find(spec)?.state())
    }

    /// Returns the runtime status of the first matching port.
    pub fn port_status(&self, spec: &str) -> Option<PortStatus> {
        Some(lock_shared(&self.find(spec)?.shared).snapshot())
    }

    /// Returns the configuration of the first matching port.
    pub fn port_config(&self, spec: &str) -> Option<PortConfig> {
        Some(self.find(spec)?.config())
    }

    /// Returns the names of all registered ports.
    pub fn port_names(&self) -> Vec<String> {
        self.ports.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serbridge_common::{CollectSink, DevConfig, ErrorKind};
    use std::io;
    use tokio::sync::mpsc;

    use crate::device::OpenedDevice;

    struct NoDevices;

    impl DeviceOpener for NoDevices {
        fn open(&self, _path: &str, _cfg: &DevConfig) -> io::Result<OpenedDevice> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no devices in unit tests"))
        }
    }

    struct TestController {
        id: ControllerId,
        sink: CollectSink,
        text: String,
        monitors: Vec<(MonitorId, mpsc::Receiver<Bytes>)>,
    }

    impl TestController {
        fn new() -> Self {
            Self {
                id: ControllerId::next(),
                sink: CollectSink::new(),
                text: String::new(),
                monitors: Vec::new(),
            }
        }
    }

    impl ErrorSink for TestController {
        fn report(&mut self, err: &BridgeError) {
            self.sink.report(err);
        }
    }

    impl Controller for TestController {
        fn id(&self) -> ControllerId {
            self.id
        }
        fn output(&mut self, text: &str) {
            self.text.push_str(text);
        }
        fn monitor_attached(&mut self, id: MonitorId, rx: mpsc::Receiver<Bytes>) {
            self.monitors.push((id, rx));
        }
    }

    fn test_mgr() -> PortMgr {
        PortMgr::new()
            .with_opener(Arc::new(NoDevices))
            .with_tick(Duration::from_millis(20))
    }

    fn add(
        mgr: &mut PortMgr,
        port: &str,
        state: &str,
        device: &str,
        devcfg: &str,
        generation: u64,
    ) {
        let mut sink = CollectSink::new();
        mgr.portconfig(&mut sink, port, state, "0", device, devcfg, generation)
            .unwrap();
        assert!(sink.is_empty());
    }

    async fn wait_for_state(mgr: &PortMgr, spec: &str, state: PortState) {
        for _ in 0..200 {
            if mgr.port_state(spec) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("port {} never reached {:?}", spec, state);
    }

    #[test]
    fn test_portconfig_disabled_port() {
        let mut mgr = test_mgr();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);

        assert_eq!(mgr.port_names(), vec!["2000".to_string()]);
        assert_eq!(mgr.port_state("2000"), Some(PortState::Disabled));
        let config = mgr.port_config("2000").unwrap();
        assert_eq!(config.enable, EnableMode::Off);
        assert_eq!(config.device, "/dev/ttyS0");
    }

    #[test]
    fn test_malformed_portconfig_leaves_registry_unchanged() {
        let mut mgr = test_mgr();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "115200", 1);

        let mut sink = CollectSink::new();
        let cases = [
            ("2000", "sideways", "0", "/dev/ttyS0", "9600"),
            ("2000", "off", "ten", "/dev/ttyS0", "9600"),
            ("2000", "off", "0", "/dev/ttyS0", "9600 FAST"),
            ("2000", "off", "0", "/dev/ttyS0", "RS485=x:y"),
            ("notaport", "off", "0", "/dev/ttyS1", "9600"),
        ];
        for (port, state, timeout, dev, cfg) in cases {
            assert!(mgr.portconfig(&mut sink, port, state, timeout, dev, cfg, 2).is_err());
        }

        assert_eq!(sink.reports().len(), cases.len());
        assert!(sink.reports().iter().all(|(kind, _)| *kind == ErrorKind::Configuration));
        assert_eq!(mgr.port_names(), vec!["2000".to_string()]);
        assert_eq!(mgr.port_config("2000").unwrap().devcfg.line.baud_rate, 115200);
    }

    #[test]
    fn test_port_spec_matching() {
        let mut mgr = test_mgr();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);
        add(&mut mgr, "127.0.0.1,2001", "off", "/dev/ttyUSB0", "9600", 1);

        assert!(mgr.find("2000").is_some());
        assert_eq!(mgr.port_config("2001").unwrap().name, "127.0.0.1,2001");
        assert_eq!(mgr.port_config("ttyUSB0").unwrap().name, "127.0.0.1,2001");
        assert_eq!(mgr.port_config("/dev/ttyS0").unwrap().name, "2000");
        assert_eq!(mgr.matching("all").unwrap().len(), 2);
        assert_eq!(mgr.matching("*").unwrap().len(), 2);
        assert_eq!(mgr.matching("200*").unwrap().len(), 2);
        assert_eq!(mgr.matching("ttyUSB*").unwrap(), vec!["127.0.0.1,2001".to_string()]);
        assert!(matches!(mgr.matching("3000"), Err(BridgeError::PortNotFound { .. })));
        assert!(mgr.matching("").is_err());
    }

    #[test]
    fn test_setportdevcfg_resets_omitted_rs485() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600 RS485=5:0:RTSONSEND", 1);
        assert_eq!(mgr.get_rs485_conf("2000").unwrap().delay_rts_before_send, 5);

        mgr.setportdevcfg(&mut ctl, "2000", "19200 EVEN").unwrap();
        assert!(mgr.get_rs485_conf("2000").is_none());
        assert_eq!(mgr.port_config("2000").unwrap().devcfg.line.baud_rate, 19200);

        // A malformed string changes nothing.
        assert!(mgr.setportdevcfg(&mut ctl, "2000", "19200 RS485=1").is_err());
        assert!(mgr.setportdevcfg(&mut ctl, "2000", "57600 BOGUS").is_err());
        assert_eq!(mgr.port_config("2000").unwrap().devcfg.line.baud_rate, 19200);
        assert_eq!(ctl.sink.reports().len(), 2);
    }

    #[test]
    fn test_setporttimeout() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);

        mgr.setporttimeout(&mut ctl, "2000", "45").unwrap();
        assert_eq!(mgr.port_config("2000").unwrap().timeout, Duration::from_secs(45));

        assert!(mgr.setporttimeout(&mut ctl, "2000", "-5").is_err());
        assert!(mgr.setporttimeout(&mut ctl, "9999", "5").is_err());
        assert!(ctl.sink.contains("Invalid port number: 9999"));
        assert_eq!(mgr.port_config("2000").unwrap().timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_control_and_disconnect_need_a_session() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);

        assert!(mgr.setportcontrol(&mut ctl, "2000", "DTRHI").is_err());
        assert!(mgr.setportcontrol(&mut ctl, "2000", "LOUD").is_err());
        assert!(mgr.disconnect_port(&mut ctl, "2000").is_err());
        assert!(ctl.sink.contains("Port 2000 is not currently connected"));
    }

    #[test]
    fn test_monitor_requires_enabled_port() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);

        assert!(mgr.data_monitor_start(&mut ctl, "tcp", "2000").is_none());
        assert!(ctl.sink.contains("is not enabled"));
        assert!(mgr.data_monitor_start(&mut ctl, "sideways", "2000").is_none());
    }

    #[tokio::test]
    async fn test_monitor_lifecycle() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        let mut other = TestController::new();
        add(&mut mgr, "127.0.0.1,0", "raw", "/dev/ttyS0", "9600", 1);

        let id = mgr.data_monitor_start(&mut ctl, "term", "127.0.0.1,0").unwrap();
        assert!(mgr.monitor_active(id));
        assert_eq!(mgr.port_status("127.0.0.1,0").unwrap().monitors, 1);

        // Only the owner can stop it.
        mgr.data_monitor_stop(&mut other, id);
        assert!(mgr.monitor_active(id));

        mgr.data_monitor_stop(&mut ctl, id);
        assert!(!mgr.monitor_active(id));
        // Stopping twice is harmless.
        mgr.data_monitor_stop(&mut ctl, id);

        let again = mgr.data_monitor_start(&mut ctl, "tcp", "127.0.0.1,0").unwrap();
        mgr.release_controller(ctl.id());
        assert!(!mgr.monitor_active(again));

        mgr.shutdown_ports();
    }

    #[tokio::test]
    async fn test_detached_monitors_are_reaped() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "127.0.0.1,0", "raw", "/dev/ttyS0", "9600", 1);

        for _ in 0..100 {
            mgr.data_monitor_start(&mut ctl, "tcp", "127.0.0.1,0").unwrap();
        }
        assert_eq!(mgr.monitor_count(), 100);

        // What the port task does when a session ends.
        lock_shared(&mgr.ports["127.0.0.1,0"].shared).taps.clear();
        mgr.maintain();
        assert_eq!(mgr.monitor_count(), 0);

        for (id, rx) in ctl.monitors.iter_mut() {
            assert!(!mgr.monitor_active(*id));
            assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        }

        mgr.shutdown_ports();
    }

    #[tokio::test]
    async fn test_stopped_monitor_closes_its_channel() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "127.0.0.1,0", "raw", "/dev/ttyS0", "9600", 1);

        let id = mgr.data_monitor_start(&mut ctl, "term", "127.0.0.1,0").unwrap();
        let kept = mgr.data_monitor_start(&mut ctl, "tcp", "127.0.0.1,0").unwrap();
        mgr.data_monitor_stop(&mut ctl, id);

        let (_, rx) = ctl.monitors.iter_mut().find(|(m, _)| *m == id).unwrap();
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        let (_, rx) = ctl.monitors.iter_mut().find(|(m, _)| *m == kept).unwrap();
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
        assert_eq!(mgr.monitor_count(), 1);

        mgr.shutdown_ports();
    }

    #[tokio::test]
    async fn test_enabled_port_listens_and_shuts_down() {
        let mut mgr = test_mgr();
        add(&mut mgr, "127.0.0.1,0", "telnet", "/dev/ttyS0", "9600", 1);
        wait_for_state(&mgr, "127.0.0.1,0", PortState::Listening).await;
        assert!(mgr.port_status("127.0.0.1,0").unwrap().local_addr.is_some());

        mgr.shutdown_ports();
        mgr.shutdown_ports();
        for _ in 0..200 {
            if mgr.check_ports_shutdown() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mgr.check_ports_shutdown());
        assert_eq!(mgr.port_state("127.0.0.1,0"), Some(PortState::Disabled));
    }

    #[tokio::test]
    async fn test_setportenable_toggles_listener() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "127.0.0.1,0", "off", "/dev/ttyS0", "9600", 1);

        mgr.setportenable(&mut ctl, "127.0.0.1,0", "raw").unwrap();
        wait_for_state(&mgr, "127.0.0.1,0", PortState::Listening).await;

        mgr.setportenable(&mut ctl, "127.0.0.1,0", "off").unwrap();
        wait_for_state(&mgr, "127.0.0.1,0", PortState::Disabled).await;
        assert!(mgr.setportenable(&mut ctl, "127.0.0.1,0", "maybe").is_err());
    }

    #[test]
    fn test_clear_old_port_config_removes_idle_ports() {
        let mut mgr = test_mgr();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);
        add(&mut mgr, "2001", "off", "/dev/ttyS1", "9600", 1);

        // Generation 2 only re-declares 2001.
        add(&mut mgr, "2001", "off", "/dev/ttyS1", "19200", 2);
        mgr.clear_old_port_config(2);

        assert_eq!(mgr.port_names(), vec!["2001".to_string()]);
        assert_eq!(mgr.port_config("2001").unwrap().devcfg.line.baud_rate, 19200);
        assert!(mgr.check_ports_shutdown());
    }

    #[test]
    fn test_show_output() {
        let mut mgr = test_mgr();
        let mut ctl = TestController::new();
        add(&mut mgr, "2000", "off", "/dev/ttyS0", "9600", 1);
        add(&mut mgr, "2001", "off", "/dev/ttyS1", "9600", 1);

        mgr.showports(&mut ctl, Some("2001")).unwrap();
        assert!(ctl.text.contains("TCP Port 2001"));
        assert!(!ctl.text.contains("TCP Port 2000"));

        ctl.text.clear();
        mgr.showshortports(&mut ctl, None).unwrap();
        assert_eq!(ctl.text.lines().count(), 3);
        assert!(ctl.text.starts_with("Port name"));

        assert!(mgr.showports(&mut ctl, Some("4000")).is_err());
    }
}
