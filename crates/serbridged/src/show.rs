//! Text rendering for `showports` and `showshortports`.

use std::fmt::Write;

use crate::port::{PortConfig, PortStatus};

fn remote(status: &PortStatus) -> String {
    status
        .remote_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unconnected".to_string())
}

/// Renders the detailed view of one port.
pub fn port_long(config: &PortConfig, status: &PortStatus) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(out, "TCP Port {}", config.name);
    let _ = writeln!(out, "  enable state: {}", config.enable);
    let _ = writeln!(out, "  timeout: {}", config.timeout.as_secs());
    let _ = writeln!(out, "  connected to: {}", remote(status));
    if let Some(local) = status.local_addr {
        let _ = writeln!(out, "  listening on: {}", local);
    }
    if let Some(err) = &status.listen_error {
        let _ = writeln!(out, "  listen error: {}", err);
    }
    let _ = writeln!(out, "  device: {}", config.device);
    let _ = writeln!(out, "  device config: {}", config.devcfg_string());
    let _ = writeln!(out, "  port state: {}", status.state);
    let _ = writeln!(out, "  bytes read from TCP: {}", status.tcp_bytes_in);
    let _ = writeln!(out, "  bytes written to TCP: {}", status.tcp_bytes_out);
    let _ = writeln!(out, "  bytes read from device: {}", status.dev_bytes_in);
    let _ = writeln!(out, "  bytes written to device: {}", status.dev_bytes_out);
    let _ = writeln!(out, "  monitors: {}", status.monitors);
    out
}

/// Renders the column header of the short view.
pub fn short_header() -> String {
    format!(
        "{:<22} {:<7} {:>7} {:<22} {:<16} {:<12} {:>10} {:>10} {:>10} {:>10} {}\n",
        "Port name",
        "Type",
        "Timeout",
        "Remote address",
        "Device",
        "State",
        "TCP in",
        "TCP out",
        "Dev in",
        "Dev out",
        "Config"
    )
}

/// Renders one port as a line of the short view.
pub fn port_short(config: &PortConfig, status: &PortStatus) -> String {
    format!(
        "{:<22} {:<7} {:>7} {:<22} {:<16} {:<12} {:>10} {:>10} {:>10} {:>10} {}\n",
        config.name,
        config.enable.as_str(),
        config.timeout.as_secs(),
        remote(status),
        config.device,
        status.state.as_str(),
        status.tcp_bytes_in,
        status.tcp_bytes_out,
        status.dev_bytes_in,
        status.dev_bytes_out,
        config.devcfg_string()
    )
}
