//! Configuration file support for serbridged
//!
//! Loads the daemon settings and the port list from a TOML file.
//! Default location: /etc/serbridge/serbridged.toml
//!
//! ```toml
//! [daemon]
//! tick_ms = 1000
//! lock_dir = "/var/lock"
//!
//! [[port]]
//! port = "2000"
//! state = "telnet"
//! timeout = "600"
//! device = "/dev/ttyS0"
//! options = "9600 NONE 1STOPBIT 8DATABITS LOCK"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use serbridge_common::{BridgeError, BridgeResult, ErrorSink};

use crate::defaults::DEFAULT_TIMEOUT;
use crate::port::PortConfig;
use crate::port_mgr::PortMgr;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/serbridge/serbridged.toml";

/// Daemon-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port task polling interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Directory for UUCP lock files; no lock files when unset
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

/// One port, the same five fields `portconfig` takes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLine {
    /// Listen address, `[host,]tcpport`
    pub port: String,

    /// off, raw, rawlp or telnet
    #[serde(default = "default_state")]
    pub state: String,

    /// Idle timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: String,

    /// Device path
    pub device: String,

    /// Device configuration and port options
    #[serde(default)]
    pub options: String,
}

/// Complete serbridged configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Configured ports
    #[serde(default, rename = "port")]
    pub ports: Vec<PortLine>,
}

// Default functions
fn default_tick_ms() -> u64 {
    1000
}

fn default_state() -> String {
    "raw".to_string()
}

fn default_timeout() -> String {
    DEFAULT_TIMEOUT.to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            lock_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Returns the settings that differ from `running`. These are read only
    /// at startup, so a reload cannot apply them.
    pub fn startup_only_changes(&self, running: &DaemonConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.tick_ms != running.tick_ms {
            changed.push("tick_ms");
        }
        if self.lock_dir != running.lock_dir {
            changed.push("lock_dir");
        }
        changed
    }
}

impl FromStr for PortLine {
    type Err = BridgeError;

    /// Parses the command line form `port:state:timeout:device:options`.
    ///
    /// The options field is optional and may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(5, ':');
        let mut next = |what: &str| {
            fields
                .next()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    BridgeError::invalid_config("port line", s, format!("missing {}", what))
                })
        };

        let port = next("port")?;
        let state = next("state")?;
        let timeout = next("timeout")?;
        let device = next("device")?;
        let options = next("options").unwrap_or_default();

        Ok(PortLine {
            port,
            state,
            timeout,
            device,
            options,
        })
    }
}

impl BridgeConfig {
    /// Parses TOML `content`; `origin` names the source in errors.
    pub fn from_toml_str(content: &str, origin: &str) -> BridgeResult<Self> {
        toml::from_str(content)
            .map_err(|e| BridgeError::invalid_config("config file", origin, e.to_string()))
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BridgeError::invalid_config("config file", path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> BridgeResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::internal(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the port task polling interval as Duration
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.daemon.tick_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.daemon.tick_ms == 0 {
            return Err(BridgeError::invalid_config("tick_ms", "0", "must be > 0"));
        }

        let mut seen = HashSet::new();
        for line in &self.ports {
            let config = PortConfig::parse(
                &line.port,
                &line.state,
                &line.timeout,
                &line.device,
                &line.options,
            )?;
            if !seen.insert(config.name.clone()) {
                return Err(BridgeError::invalid_config("port", &line.port, "declared twice"));
            }
        }

        Ok(())
    }

    /// Declares every port as `generation` and retires ports the previous
    /// generations declared but this one does not.
    ///
    /// Ports that fail to parse are reported to `sink` and skipped. Returns
    /// the number of ports accepted.
    pub fn apply(&self, mgr: &mut PortMgr, sink: &mut dyn ErrorSink, generation: u64) -> usize {
        let mut accepted = 0;
        for line in &self.ports {
            let result = mgr.portconfig(
                sink,
                &line.port,
                &line.state,
                &line.timeout,
                &line.device,
                &line.options,
                generation,
            );
            if result.is_ok() {
                accepted += 1;
            }
        }
        mgr.clear_old_port_config(generation);
        info!(
            "Configuration generation {}: {} of {} ports accepted",
            generation,
            accepted,
            self.ports.len()
        );
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serbridge_common::CollectSink;

    #[test]
    fn test_startup_only_changes() {
        let running = DaemonConfig::default();
        assert!(running.startup_only_changes(&running).is_empty());

        let reloaded = DaemonConfig {
            tick_ms: 250,
            lock_dir: Some(PathBuf::from("/var/lock")),
        };
        assert_eq!(reloaded.startup_only_changes(&running), vec!["tick_ms", "lock_dir"]);
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.daemon.tick_ms, 1000);
        assert_eq!(config.tick(), Duration::from_secs(1));
        assert!(config.daemon.lock_dir.is_none());
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[daemon]
lock_dir = "/var/lock"

[[port]]
port = "2000"
state = "telnet"
timeout = "600"
device = "/dev/ttyS0"
options = "9600 LOCK"

[[port]]
port = "127.0.0.1,2001"
device = "/dev/ttyUSB0"
"#;
        let config = BridgeConfig::from_toml_str(toml_str, "test").unwrap();
        assert_eq!(config.daemon.lock_dir, Some(PathBuf::from("/var/lock")));
        // Unspecified values should use defaults
        assert_eq!(config.daemon.tick_ms, 1000);
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].state, "telnet");
        assert_eq!(config.ports[1].state, "raw");
        assert_eq!(config.ports[1].timeout, "0");
        assert_eq!(config.ports[1].options, "");
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_parse_error() {
        let err = BridgeConfig::from_toml_str("[[port]]\nport = 2000", "bad.toml").unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_ports() {
        let mut config = BridgeConfig::default();
        config.ports.push("2000:raw:0:/dev/ttyS0".parse().unwrap());
        config.validate().unwrap();

        config.ports.push("2000:telnet:0:/dev/ttyS1".parse().unwrap());
        assert!(config.validate().unwrap_err().to_string().contains("declared twice"));

        config.ports.pop();
        config.ports.push("2001:raw:0:/dev/ttyS1:9600 TURBO".parse().unwrap());
        assert!(config.validate().unwrap_err().to_string().contains("TURBO"));

        let config = BridgeConfig {
            daemon: DaemonConfig {
                tick_ms: 0,
                lock_dir: None,
            },
            ports: Vec::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_line_parse() {
        let line: PortLine = "2000:telnet:600:/dev/ttyS0:9600 RS485=5:0".parse().unwrap();
        assert_eq!(line.port, "2000");
        assert_eq!(line.state, "telnet");
        assert_eq!(line.timeout, "600");
        assert_eq!(line.device, "/dev/ttyS0");
        assert_eq!(line.options, "9600 RS485=5:0");

        let line: PortLine = "2001:raw:0:/dev/ttyS1".parse().unwrap();
        assert_eq!(line.options, "");

        assert!("2000:raw".parse::<PortLine>().is_err());
        assert!("2000:raw::/dev/ttyS0".parse::<PortLine>().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serbridged.toml");

        let mut config = BridgeConfig::default();
        config.daemon.tick_ms = 250;
        config.ports.push("2000:raw:30:/dev/ttyS0:19200".parse().unwrap());
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = BridgeConfig::load_or_default("/nonexistent/serbridged.toml").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(BridgeConfig::load("/nonexistent/serbridged.toml").is_err());
    }

    #[test]
    fn test_apply_generations() {
        let mut mgr = PortMgr::new();
        let mut sink = CollectSink::new();

        let mut config = BridgeConfig::default();
        config.ports.push("2000:off:0:/dev/ttyS0".parse().unwrap());
        config.ports.push("2001:off:0:/dev/ttyS1".parse().unwrap());
        config.ports.push("2002:off:0:/dev/ttyS2:BOGUS".parse().unwrap());
        assert_eq!(config.apply(&mut mgr, &mut sink, 1), 2);
        assert!(sink.contains("BOGUS"));
        assert_eq!(mgr.port_names(), vec!["2000".to_string(), "2001".to_string()]);

        config.ports.remove(0);
        config.apply(&mut mgr, &mut sink, 2);
        assert_eq!(mgr.port_names(), vec!["2001".to_string()]);
    }
}
