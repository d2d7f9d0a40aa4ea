//! Byte transport over a raw serial device.
//!
//! The driver talks to the modem through the [`Transport`] trait: blocking
//! complete writes, single-byte reads with a deadline, and input flushing.
//! [`SerialPort`] is the production implementation (termios, raw 8N1, no
//! flow control); tests substitute a scripted mock.
//!
//! Ownership discipline: exactly one thread (the I/O loop) calls
//! [`Transport::read_byte`]; writes may come from any task and are guarded
//! by the driver's write lock, not here.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;

use crate::config::SerialConfig;

/// Byte-level access to the modem.
pub trait Transport: Send + Sync {
    /// Write the whole buffer, retrying partial writes until complete.
    fn write(&self, buf: &[u8]) -> io::Result<()>;
    /// Read one byte, waiting up to `timeout`. `Ok(None)` means the deadline
    /// elapsed with no data.
    fn read_byte(&self, timeout: Duration) -> io::Result<Option<u8>>;
    /// Number of bytes that can be read without waiting.
    fn available(&self) -> io::Result<usize>;
    /// Discard any buffered and immediately-available input.
    fn flush_input(&self) -> io::Result<()>;
}

/// Helper to get a `BorrowedFd` from a `RawFd` for nix calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

/// A raw serial port configured for AT traffic.
///
/// Reads use `VMIN=0`, `VTIME=1`, so each `read(2)` returns after at most
/// 100 ms of silence; [`Transport::read_byte`] loops on that until its own
/// deadline. The fd is closed on drop.
pub struct SerialPort {
    fd: RawFd,
    device: String,
}

impl SerialPort {
    /// Open and configure the device named in `cfg` (raw mode, 8N1,
    /// `CLOCAL|CREAD`, no CRTSCTS), then flush any stale bytes.
    pub fn open(cfg: &SerialConfig) -> io::Result<Self> {
        let fd = fcntl::open(
            cfg.device.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| io::Error::other(format!("open {}: {e}", cfg.device)))?;

        let port = SerialPort {
            fd,
            device: cfg.device.clone(),
        };

        // Clear O_NONBLOCK now that we have the fd — we want blocking reads
        // with the VTIME timeout.
        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
            .map_err(|e| io::Error::other(format!("F_GETFL: {e}")))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
            .map_err(|e| io::Error::other(format!("F_SETFL: {e}")))?;

        port.configure(baud_rate(cfg.baud)?)?;
        port.flush_input()?;
        Ok(port)
    }

    /// Device path this port is bound to.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    fn configure(&self, baud: BaudRate) -> io::Result<()> {
        // SAFETY: fd is valid — we just opened it and hold it until drop.
        let bfd = unsafe { borrow_fd(self.fd) };

        let mut tio =
            termios::tcgetattr(bfd).map_err(|e| io::Error::other(format!("tcgetattr: {e}")))?;

        termios::cfmakeraw(&mut tio);
        termios::cfsetispeed(&mut tio, baud)
            .map_err(|e| io::Error::other(format!("cfsetispeed: {e}")))?;
        termios::cfsetospeed(&mut tio, baud)
            .map_err(|e| io::Error::other(format!("cfsetospeed: {e}")))?;

        // 8N1, CLOCAL (ignore modem control lines), CREAD (enable receiver)
        tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
        tio.control_flags &= !termios::ControlFlags::CRTSCTS;

        // VMIN=0, VTIME=1 — read returns after 100 ms idle or when data arrives
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

        termios::tcsetattr(bfd, SetArg::TCSANOW, &tio)
            .map_err(|e| io::Error::other(format!("tcsetattr: {e}")))
    }
}

impl Transport for SerialPort {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        // SAFETY: fd is valid for the lifetime of self.
        let bfd = unsafe { borrow_fd(self.fd) };
        let mut off = 0;
        while off < buf.len() {
            match unistd::write(bfd, &buf[off..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "serial write")),
                Ok(n) => off += n,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(io::Error::other(format!("write {}: {e}", self.device))),
            }
        }
        Ok(())
    }

    fn read_byte(&self, timeout: Duration) -> io::Result<Option<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1];
        loop {
            // Each read blocks for at most one VTIME unit (100 ms).
            match unistd::read(self.fd, &mut buf) {
                Ok(1) => return Ok(Some(buf[0])),
                Ok(_) | Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(io::Error::other(format!("read {}: {e}", self.device))),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn available(&self) -> io::Result<usize> {
        let mut n: nix::libc::c_int = 0;
        // SAFETY: FIONREAD with a valid fd and an int out-parameter.
        let rc = unsafe { nix::libc::ioctl(self.fd, nix::libc::FIONREAD, &mut n) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n.max(0) as usize)
    }

    fn flush_input(&self) -> io::Result<()> {
        // SAFETY: fd is valid for the lifetime of self.
        let bfd = unsafe { borrow_fd(self.fd) };
        termios::tcflush(bfd, termios::FlushArg::TCIFLUSH)
            .map_err(|e| io::Error::other(format!("tcflush: {e}")))
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}
