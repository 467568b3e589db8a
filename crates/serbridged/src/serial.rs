//! Serial device backend.
//!
//! Data flows through a non-blocking [`tokio_serial::SerialStream`]. The
//! control handle is a second [`serialport::TTYPort`] on a duplicate of the
//! same descriptor, so modem lines and break can be driven while the stream
//! is split between the two relay directions. Settings the portable API does
//! not cover (CLOCAL, HUPCL, RS-485) go through termios and ioctls directly.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use nix::sys::termios::{self, ControlFlags, SetArg};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use serbridge_common::devcfg::{self, LineSettings};
use serbridge_common::{DevConfig, Rs485Config};

use crate::device::{DeviceOpener, LineControl, OpenedDevice};

/// Opens real serial devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl DeviceOpener for SerialOpener {
    fn open(&self, path: &str, cfg: &DevConfig) -> io::Result<OpenedDevice> {
        let line = &cfg.line;
        let stream = tokio_serial::new(path, line.baud_rate)
            .data_bits(data_bits(line.data_bits))
            .parity(parity(line.parity))
            .stop_bits(stop_bits(line.stop_bits))
            .flow_control(flow_control(line))
            .timeout(Duration::ZERO)
            .open_native_async()?;

        // SAFETY: the descriptor belongs to `stream`, which is alive here.
        let dup = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) }.try_clone_to_owned()?;
        // SAFETY: `dup` is a freshly duplicated descriptor we own.
        let port = unsafe { TTYPort::from_raw_fd(dup.into_raw_fd()) };

        let mut control = SerialControl { port };
        control.apply_extras(cfg)?;
        debug!(device = path, config = %cfg, "serial device configured");

        Ok(OpenedDevice {
            io: Box::new(stream),
            control: Box::new(control),
        })
    }
}

/// Control handle of an open serial device.
pub struct SerialControl {
    port: TTYPort,
}

impl SerialControl {
    fn fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    /// Applies the settings outside the portable serial API.
    fn apply_extras(&mut self, cfg: &DevConfig) -> io::Result<()> {
        apply_modem_flags(self.fd(), &cfg.line)?;
        apply_rs485(self.fd(), cfg.rs485())
    }
}

impl LineControl for SerialControl {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        Ok(self.port.write_data_terminal_ready(level)?)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        Ok(self.port.write_request_to_send(level)?)
    }

    fn set_break(&mut self, on: bool) -> io::Result<()> {
        if on {
            self.port.set_break()?;
        } else {
            self.port.clear_break()?;
        }
        Ok(())
    }

    fn apply(&mut self, cfg: &DevConfig) -> io::Result<()> {
        let line = &cfg.line;
        self.port.set_baud_rate(line.baud_rate)?;
        self.port.set_data_bits(data_bits(line.data_bits))?;
        self.port.set_parity(parity(line.parity))?;
        self.port.set_stop_bits(stop_bits(line.stop_bits))?;
        self.port.set_flow_control(flow_control(line))?;
        self.apply_extras(cfg)
    }
}

fn data_bits(bits: devcfg::DataBits) -> DataBits {
    match bits {
        devcfg::DataBits::Five => DataBits::Five,
        devcfg::DataBits::Six => DataBits::Six,
        devcfg::DataBits::Seven => DataBits::Seven,
        devcfg::DataBits::Eight => DataBits::Eight,
    }
}

fn parity(p: devcfg::Parity) -> Parity {
    match p {
        devcfg::Parity::None => Parity::None,
        devcfg::Parity::Odd => Parity::Odd,
        devcfg::Parity::Even => Parity::Even,
    }
}

fn stop_bits(s: devcfg::StopBits) -> StopBits {
    match s {
        devcfg::StopBits::One => StopBits::One,
        devcfg::StopBits::Two => StopBits::Two,
    }
}

fn flow_control(line: &LineSettings) -> FlowControl {
    match (line.rtscts, line.xonxoff) {
        (true, true) => {
            warn!("RTSCTS and XONXOFF both requested, using RTSCTS");
            FlowControl::Hardware
        }
        (true, false) => FlowControl::Hardware,
        (false, true) => FlowControl::Software,
        (false, false) => FlowControl::None,
    }
}

fn apply_modem_flags(fd: RawFd, line: &LineSettings) -> io::Result<()> {
    // SAFETY: callers pass a descriptor owned by a live `TTYPort`.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut attrs = termios::tcgetattr(fd)?;
    attrs.control_flags.set(ControlFlags::CLOCAL, line.local);
    attrs.control_flags.set(ControlFlags::HUPCL, line.hangup_when_done);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

#[cfg(target_os = "linux")]
mod rs485 {
    /// `struct serial_rs485` from `<linux/serial.h>`.
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SerialRs485 {
        pub flags: u32,
        pub delay_rts_before_send: u32,
        pub delay_rts_after_send: u32,
        pub padding: [u32; 5],
    }

    nix::ioctl_read_bad!(tiocgrs485, nix::libc::TIOCGRS485, SerialRs485);
    nix::ioctl_write_ptr_bad!(tiocsrs485, nix::libc::TIOCSRS485, SerialRs485);
}

#[cfg(target_os = "linux")]
fn apply_rs485(fd: RawFd, conf: Option<&Rs485Config>) -> io::Result<()> {
    use rs485::{tiocgrs485, tiocsrs485, SerialRs485};

    match conf {
        Some(conf) => {
            let raw = SerialRs485 {
                flags: conf.flags(),
                delay_rts_before_send: conf.delay_rts_before_send,
                delay_rts_after_send: conf.delay_rts_after_send,
                ..Default::default()
            };
            // SAFETY: `raw` is a valid serial_rs485 for the duration of the call.
            unsafe { tiocsrs485(fd, &raw) }?;
            Ok(())
        }
        None => {
            let mut current = SerialRs485::default();
            // SAFETY: `current` is a valid out-parameter for the duration of the call.
            if unsafe { tiocgrs485(fd, &mut current) }.is_err() {
                // The driver has no RS-485 support, so it is already off.
                return Ok(());
            }
            if current.flags & devcfg::SER_RS485_ENABLED != 0 {
                let off = SerialRs485::default();
                // SAFETY: as above.
                unsafe { tiocsrs485(fd, &off) }?;
                debug!("RS-485 switched off");
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_rs485(_fd: RawFd, conf: Option<&Rs485Config>) -> io::Result<()> {
    match conf {
        Some(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "RS-485 is only supported on Linux",
        )),
        None => Ok(()),
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use nix::pty::{openpty, OpenptyResult};
    use serbridge_common::devcfg::parse_devcfg;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn slave_path(fd: RawFd) -> String {
        std::fs::read_link(format!("/proc/self/fd/{}", fd))
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_flow_control_mapping() {
        let mut line = LineSettings::default();
        assert_eq!(flow_control(&line), FlowControl::None);
        line.xonxoff = true;
        assert_eq!(flow_control(&line), FlowControl::Software);
        line.rtscts = true;
        assert_eq!(flow_control(&line), FlowControl::Hardware);
    }

    #[tokio::test]
    async fn test_relay_through_pty() {
        let OpenptyResult { master, slave } = openpty(None, None).unwrap();
        let path = slave_path(slave.as_raw_fd());
        let cfg = parse_devcfg("115200 LOCAL", |_| false).unwrap();

        let mut dev = SerialOpener.open(&path, &cfg).unwrap();
        let mut master = std::fs::File::from(master);

        master.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), dev.io.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        dev.io.write_all(b"pong").await.unwrap();
        dev.io.flush().await.unwrap();
        let mut back = [0u8; 4];
        master.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"pong");

        drop(slave);
    }

    #[tokio::test]
    async fn test_modem_flags_follow_config() {
        let OpenptyResult { master: _master, slave } = openpty(None, None).unwrap();
        let path = slave_path(slave.as_raw_fd());

        let cfg = parse_devcfg("9600 LOCAL HANGUP_WHEN_DONE", |_| false).unwrap();
        let _dev = SerialOpener.open(&path, &cfg).unwrap();
        let attrs = termios::tcgetattr(&slave).unwrap();
        assert!(attrs.control_flags.contains(ControlFlags::CLOCAL));
        assert!(attrs.control_flags.contains(ControlFlags::HUPCL));
    }
}
