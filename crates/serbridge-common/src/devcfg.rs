//! Device configuration strings.
//!
//! A port's device configuration is a list of tokens separated by whitespace
//! or commas, e.g. `"115200 EVEN 1STOPBIT 7DATABITS RTSCTS RS485=5:0:RTSONSEND"`.
//! This module turns such a string into a [`DevConfig`]. Tokens this layer
//! does not own are offered to a caller-supplied hook, so the daemon can hang
//! its own per-port options off the same string.
//!
//! Every string is a complete description: tokens that are left out take
//! their default value. Re-applying a string without an `RS485=` token
//! therefore turns RS-485 off.

use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, BridgeResult};
use crate::sink::ErrorSink;

/// Baud rates accepted in a device configuration string.
pub const BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000, 2500000,
    3000000, 3500000, 4000000,
];

/// Baud rate used when the string does not name one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// `serial_rs485.flags` bit: RS-485 mode enabled.
pub const SER_RS485_ENABLED: u32 = 1 << 0;
/// `serial_rs485.flags` bit: RTS level while sending.
pub const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
/// `serial_rs485.flags` bit: RTS level after sending.
pub const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
/// `serial_rs485.flags` bit: keep receiving while transmitting.
pub const SER_RS485_RX_DURING_TX: u32 = 1 << 4;

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    /// Returns the bit count.
    pub fn bits(&self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Whether a port claims its device in the lock table before opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Off,
    On,
}

/// Serial line settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
    /// Software flow control.
    pub xonxoff: bool,
    /// Hardware flow control.
    pub rtscts: bool,
    /// Ignore modem status lines (CLOCAL).
    pub local: bool,
    /// Drop DTR when the session ends (HUPCL).
    pub hangup_when_done: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
            xonxoff: false,
            rtscts: false,
            local: false,
            hangup_when_done: false,
        }
    }
}

/// RS-485 driver-enable parameters, mirroring the kernel's `serial_rs485`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rs485Config {
    pub enabled: bool,
    /// Delay between raising RTS and sending, in milliseconds.
    pub delay_rts_before_send: u32,
    /// Delay between the end of sending and dropping RTS, in milliseconds.
    pub delay_rts_after_send: u32,
    pub rts_on_send: bool,
    pub rts_after_send: bool,
    pub rx_during_tx: bool,
}

impl Rs485Config {
    /// Returns the `serial_rs485.flags` word for this configuration.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.enabled {
            flags |= SER_RS485_ENABLED;
        }
        if self.rts_on_send {
            flags |= SER_RS485_RTS_ON_SEND;
        }
        if self.rts_after_send {
            flags |= SER_RS485_RTS_AFTER_SEND;
        }
        if self.rx_during_tx {
            flags |= SER_RS485_RX_DURING_TX;
        }
        flags
    }

    /// Builds a configuration from the raw kernel structure fields.
    pub fn from_raw(flags: u32, delay_rts_before_send: u32, delay_rts_after_send: u32) -> Self {
        Self {
            enabled: flags & SER_RS485_ENABLED != 0,
            delay_rts_before_send,
            delay_rts_after_send,
            rts_on_send: flags & SER_RS485_RTS_ON_SEND != 0,
            rts_after_send: flags & SER_RS485_RTS_AFTER_SEND != 0,
            rx_during_tx: flags & SER_RS485_RX_DURING_TX != 0,
        }
    }

    /// Parses the part after `RS485=`: `<before>:<after>[:<flag>]...`.
    fn parse_body(body: &str) -> Result<Self, String> {
        let mut parts = body.split(':');
        let before = parse_delay(parts.next(), "delay before send")?;
        let after = parse_delay(parts.next(), "delay after send")?;

        let mut conf = Rs485Config {
            enabled: true,
            delay_rts_before_send: before,
            delay_rts_after_send: after,
            ..Default::default()
        };

        for flag in parts {
            match flag.to_ascii_uppercase().as_str() {
                "RTSONSEND" => conf.rts_on_send = true,
                "RTSAFTERSEND" => conf.rts_after_send = true,
                "RXDURINGTX" => conf.rx_during_tx = true,
                other => return Err(format!("unknown RS485 flag '{}'", other)),
            }
        }

        Ok(conf)
    }
}

fn parse_delay(part: Option<&str>, what: &str) -> Result<u32, String> {
    let part = part.ok_or_else(|| format!("missing {}", what))?;
    part.parse::<u32>()
        .map_err(|_| format!("{} '{}' is not a number of milliseconds", what, part))
}

impl fmt::Display for Rs485Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.enabled {
            return write!(f, "-RS485");
        }
        write!(
            f,
            "RS485={}:{}",
            self.delay_rts_before_send, self.delay_rts_after_send
        )?;
        if self.rts_on_send {
            write!(f, ":RTSONSEND")?;
        }
        if self.rts_after_send {
            write!(f, ":RTSAFTERSEND")?;
        }
        if self.rx_during_tx {
            write!(f, ":RXDURINGTX")?;
        }
        Ok(())
    }
}

impl FromStr for Rs485Config {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper == "-RS485" {
            return Ok(Rs485Config::default());
        }
        let body = upper
            .strip_prefix("RS485=")
            .ok_or_else(|| BridgeError::invalid_config("rs485", s, "expected RS485=..."))?;
        Rs485Config::parse_body(body).map_err(|msg| BridgeError::invalid_config("rs485", s, msg))
    }
}

/// Parsed device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevConfig {
    pub line: LineSettings,
    /// RS-485 settings; `None` leaves the driver in RS-232 mode.
    pub rs485: Option<Rs485Config>,
    pub lock: LockMode,
}

impl DevConfig {
    /// Returns the RS-485 tuple, if RS-485 is configured.
    pub fn rs485(&self) -> Option<&Rs485Config> {
        self.rs485.as_ref()
    }
}

impl fmt::Display for DevConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = &self.line;
        let parity = match line.parity {
            Parity::None => "NONE",
            Parity::Odd => "ODD",
            Parity::Even => "EVEN",
        };
        let stop = match line.stop_bits {
            StopBits::One => "1STOPBIT",
            StopBits::Two => "2STOPBITS",
        };
        write!(
            f,
            "{} {} {} {}DATABITS",
            line.baud_rate,
            parity,
            stop,
            line.data_bits.bits()
        )?;
        if line.xonxoff {
            write!(f, " XONXOFF")?;
        }
        if line.rtscts {
            write!(f, " RTSCTS")?;
        }
        if line.local {
            write!(f, " LOCAL")?;
        }
        if line.hangup_when_done {
            write!(f, " HANGUP_WHEN_DONE")?;
        }
        if self.lock == LockMode::On {
            write!(f, " LOCK")?;
        }
        if let Some(rs485) = &self.rs485 {
            write!(f, " {}", rs485)?;
        }
        Ok(())
    }
}

/// Splits a configuration string into its tokens.
pub fn tokens(input: &str) -> impl Iterator<Item = &str> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
}

/// Parses a device configuration string.
///
/// Tokens that are not line settings, lock mode or RS-485 are passed to
/// `other`, which returns `true` if it accepted the token. A token rejected
/// by both fails the whole parse.
pub fn parse_devcfg<F>(input: &str, mut other: F) -> BridgeResult<DevConfig>
where
    F: FnMut(&str) -> bool,
{
    let mut cfg = DevConfig::default();

    for token in tokens(input) {
        let upper = token.to_ascii_uppercase();
        let line = &mut cfg.line;

        match upper.as_str() {
            "NONE" => line.parity = Parity::None,
            "ODD" => line.parity = Parity::Odd,
            "EVEN" => line.parity = Parity::Even,
            "1STOPBIT" => line.stop_bits = StopBits::One,
            "2STOPBITS" => line.stop_bits = StopBits::Two,
            "5DATABITS" => line.data_bits = DataBits::Five,
            "6DATABITS" => line.data_bits = DataBits::Six,
            "7DATABITS" => line.data_bits = DataBits::Seven,
            "8DATABITS" => line.data_bits = DataBits::Eight,
            "XONXOFF" => line.xonxoff = true,
            "-XONXOFF" => line.xonxoff = false,
            "RTSCTS" => line.rtscts = true,
            "-RTSCTS" => line.rtscts = false,
            "LOCAL" => line.local = true,
            "-LOCAL" => line.local = false,
            "HANGUP_WHEN_DONE" => line.hangup_when_done = true,
            "-HANGUP_WHEN_DONE" => line.hangup_when_done = false,
            "LOCK" => cfg.lock = LockMode::On,
            "-LOCK" => cfg.lock = LockMode::Off,
            "-RS485" => cfg.rs485 = None,
            _ => {
                if let Some(body) = upper.strip_prefix("RS485=") {
                    let conf = Rs485Config::parse_body(body)
                        .map_err(|msg| BridgeError::invalid_config("rs485", token, msg))?;
                    cfg.rs485 = Some(conf);
                } else if let Some(baud) = parse_baud(&upper) {
                    line.baud_rate = baud;
                } else if !other(token) {
                    return Err(BridgeError::invalid_config(
                        "device configuration",
                        token,
                        "unknown setting",
                    ));
                }
            }
        }
    }

    Ok(cfg)
}

fn parse_baud(token: &str) -> Option<u32> {
    let baud = token.parse::<u32>().ok()?;
    BAUD_RATES.contains(&baud).then_some(baud)
}

/// Parses `input` into `io`, reporting failures through `sink`.
///
/// Returns `true` on success. On failure `io` is left exactly as it was so
/// the caller can retry with a corrected string.
pub fn devcfg_init<F>(io: &mut DevConfig, sink: &mut dyn ErrorSink, input: &str, other: F) -> bool
where
    F: FnMut(&str) -> bool,
{
    match parse_devcfg(input, other) {
        Ok(cfg) => {
            *io = cfg;
            true
        }
        Err(err) => {
            sink.report(&err);
            false
        }
    }
}

/// Returns the RS-485 tuple of a parsed configuration.
pub fn get_rs485_conf(cfg: &DevConfig) -> Option<&Rs485Config> {
    cfg.rs485()
}

/// Requested modem control line changes (`setportcontrol`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlLines {
    /// New DTR level, if the string mentioned DTR.
    pub dtr: Option<bool>,
    /// New RTS level, if the string mentioned RTS.
    pub rts: Option<bool>,
}

impl ControlLines {
    /// Returns true if the request changes nothing.
    pub fn is_empty(&self) -> bool {
        self.dtr.is_none() && self.rts.is_none()
    }
}

impl FromStr for ControlLines {
    type Err = BridgeError;

    /// Parses `DTRHI`, `DTRLO`, `RTSHI` and `RTSLO` tokens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = ControlLines::default();
        for token in tokens(s) {
            match token.to_ascii_uppercase().as_str() {
                "DTRHI" => lines.dtr = Some(true),
                "DTRLO" => lines.dtr = Some(false),
                "RTSHI" => lines.rts = Some(true),
                "RTSLO" => lines.rts = Some(false),
                _ => {
                    return Err(BridgeError::invalid_config(
                        "control",
                        token,
                        "expected DTRHI, DTRLO, RTSHI or RTSLO",
                    ))
                }
            }
        }
        if lines.is_empty() {
            return Err(BridgeError::invalid_config("control", s, "no control given"));
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use pretty_assertions::assert_eq;

    fn no_other(_: &str) -> bool {
        false
    }

    #[test]
    fn test_defaults() {
        let cfg = parse_devcfg("", no_other).unwrap();
        assert_eq!(cfg, DevConfig::default());
        assert_eq!(cfg.line.baud_rate, 9600);
        assert_eq!(cfg.to_string(), "9600 NONE 1STOPBIT 8DATABITS");
    }

    #[test]
    fn test_full_line_settings() {
        let cfg = parse_devcfg(
            "115200 even 2STOPBITS 7DATABITS XONXOFF RTSCTS LOCAL HANGUP_WHEN_DONE",
            no_other,
        )
        .unwrap();

        assert_eq!(cfg.line.baud_rate, 115200);
        assert_eq!(cfg.line.parity, Parity::Even);
        assert_eq!(cfg.line.stop_bits, StopBits::Two);
        assert_eq!(cfg.line.data_bits, DataBits::Seven);
        assert!(cfg.line.xonxoff);
        assert!(cfg.line.rtscts);
        assert!(cfg.line.local);
        assert!(cfg.line.hangup_when_done);
        assert_eq!(cfg.lock, LockMode::Off);
    }

    #[test]
    fn test_commas_and_negations() {
        let cfg = parse_devcfg("19200,RTSCTS,-RTSCTS,LOCK", no_other).unwrap();
        assert_eq!(cfg.line.baud_rate, 19200);
        assert!(!cfg.line.rtscts);
        assert_eq!(cfg.lock, LockMode::On);
    }

    #[test]
    fn test_rs485_token() {
        let cfg = parse_devcfg("9600 RS485=5:10:RTSONSEND:RXDURINGTX", no_other).unwrap();
        let rs485 = get_rs485_conf(&cfg).unwrap();

        assert!(rs485.enabled);
        assert_eq!(rs485.delay_rts_before_send, 5);
        assert_eq!(rs485.delay_rts_after_send, 10);
        assert!(rs485.rts_on_send);
        assert!(!rs485.rts_after_send);
        assert!(rs485.rx_during_tx);
        assert_eq!(
            rs485.flags(),
            SER_RS485_ENABLED | SER_RS485_RTS_ON_SEND | SER_RS485_RX_DURING_TX
        );
    }

    #[test]
    fn test_rs485_round_trip() {
        for text in [
            "RS485=0:0",
            "RS485=5:0:RTSONSEND",
            "RS485=1:2:RTSAFTERSEND:RXDURINGTX",
            "RS485=100:250:RTSONSEND:RTSAFTERSEND:RXDURINGTX",
        ] {
            let cfg = parse_devcfg(text, no_other).unwrap();
            let rs485 = cfg.rs485.unwrap();
            let reparsed = parse_devcfg(&rs485.to_string(), no_other).unwrap();
            assert_eq!(reparsed.rs485, Some(rs485), "round trip of {}", text);

            let raw = Rs485Config::from_raw(
                rs485.flags(),
                rs485.delay_rts_before_send,
                rs485.delay_rts_after_send,
            );
            assert_eq!(raw, rs485);
        }
    }

    #[test]
    fn test_whole_config_round_trip() {
        let cfg = parse_devcfg("57600 ODD 2STOPBITS 6DATABITS LOCK RS485=3:4:RTSONSEND", no_other)
            .unwrap();
        let again = parse_devcfg(&cfg.to_string(), no_other).unwrap();
        assert_eq!(again, cfg);
    }

    #[test]
    fn test_rs485_disable() {
        let cfg = parse_devcfg("RS485=5:5 -RS485", no_other).unwrap();
        assert!(cfg.rs485.is_none());
        let disabled: Rs485Config = "-RS485".parse().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.to_string(), "-RS485");
    }

    #[test]
    fn test_rs485_malformed() {
        for bad in ["RS485=", "RS485=5", "RS485=x:1", "RS485=1:2:BOGUS"] {
            let err = parse_devcfg(bad, no_other).unwrap_err();
            assert!(err.to_string().contains("rs485"), "{}", err);
        }
    }

    #[test]
    fn test_unknown_token_offered_to_hook() {
        let mut seen = Vec::new();
        let cfg = parse_devcfg("9600 kickolduser NOBREAK", |t| {
            seen.push(t.to_string());
            true
        })
        .unwrap();

        assert_eq!(cfg.line.baud_rate, 9600);
        assert_eq!(seen, vec!["kickolduser".to_string(), "NOBREAK".to_string()]);
    }

    #[test]
    fn test_unsupported_baud_goes_to_hook() {
        let err = parse_devcfg("12345", no_other).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid device configuration '12345': unknown setting"
        );
    }

    #[test]
    fn test_devcfg_init_leaves_descriptor_on_failure() {
        let mut io = parse_devcfg("115200 RS485=5:0", no_other).unwrap();
        let before = io;
        let mut sink = CollectSink::new();

        assert!(!devcfg_init(&mut io, &mut sink, "9600 BOGUS", no_other));
        assert_eq!(io, before);
        assert!(sink.contains("BOGUS"));

        assert!(devcfg_init(&mut io, &mut sink, "19200", no_other));
        assert_eq!(io.line.baud_rate, 19200);
        // Omitted settings revert to defaults.
        assert!(io.rs485.is_none());
    }

    #[test]
    fn test_control_lines() {
        let lines: ControlLines = "DTRHI rtslo".parse().unwrap();
        assert_eq!(lines.dtr, Some(true));
        assert_eq!(lines.rts, Some(false));

        let lines: ControlLines = "RTSHI".parse().unwrap();
        assert_eq!(lines.dtr, None);
        assert_eq!(lines.rts, Some(true));

        assert!("DTRHI RTSMAYBE".parse::<ControlLines>().is_err());
        assert!("".parse::<ControlLines>().is_err());
    }
}
