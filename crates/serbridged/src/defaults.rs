//! Timing and buffer constants for the port engine.

use std::time::Duration;

/// Default polling interval of a port task. Idle timeouts, break release and
/// the telnet negotiation grace period are checked at this granularity.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// How long a telnet session may stay in negotiation before data flows anyway.
pub const NEGOTIATION_GRACE: Duration = Duration::from_millis(500);

/// How long a break condition requested over telnet is held.
pub const BREAK_LENGTH: Duration = Duration::from_millis(250);

/// Upper bound for flushing queued output when a session closes.
pub const DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Delay between attempts to bind a listener that failed to bind.
pub const LISTEN_RETRY: Duration = Duration::from_secs(2);

/// Pause after a failed accept before accepting again.
pub const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Size of each direction's transfer buffer.
pub const BUFFER_SIZE: usize = 1024;

/// Default capacity of each monitor's channel.
pub const MONITOR_QUEUE: usize = 64;

/// Default idle timeout string for ports that do not give one.
pub const DEFAULT_TIMEOUT: &str = "0";

/// Messages written to network clients that cannot be served.
pub mod messages {
    /// Sent to a second client while a session is active.
    pub const PORT_IN_USE: &[u8] = b"Port already in use\r\n";

    /// Sent when the serial device cannot be opened or locked.
    pub const DEVICE_UNAVAILABLE: &[u8] = b"Port's device is unavailable\r\n";
}
