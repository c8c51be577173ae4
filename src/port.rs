//! Byte-level serial I/O for the Wi-SUN modem.
//!
//! [`LinePort`] is the contract the modem driver programs against: a
//! bidirectional byte stream with push-back and a bounded-timeout poll.
//! [`TtyPort`] implements it over a raw termios fd (raw mode, 8N1, no flow
//! control). Reads block until at least one byte arrives; timeouts are the
//! caller's job via [`LinePort::poll`].

use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::fcntl::{self, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;

/// Outcome of a [`LinePort::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Input is (probably) available. Treat as a hint — a subsequent read
    /// may still block on spurious wakeups.
    ReadReady,
    /// The timeout elapsed with no input.
    Timeout,
    /// The peer hung up; the port is unusable.
    Disconnected,
}

/// I/O failure on the port. Both variants are fatal for the current scrape.
#[derive(Debug)]
pub enum PortError {
    /// Hang-up: the device vanished or the line closed.
    Disconnected,
    /// Any other I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::Disconnected => write!(f, "port disconnected"),
            PortError::Io(e) => write!(f, "port I/O error: {e}"),
        }
    }
}

impl From<nix::errno::Errno> for PortError {
    fn from(e: nix::errno::Errno) -> Self {
        PortError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

/// A bidirectional byte stream with push-back and timed poll.
///
/// Push-back ordering: `unread("AB")` makes the next read return `A` then
/// `B`; successive `unread` calls stack LIFO with respect to each other
/// while each call's bytes keep their internal order.
pub trait LinePort: Send {
    /// Deliver all bytes or fail.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), PortError>;

    /// Read at least one byte (blocking), or fail. Short reads are allowed.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PortError>;

    /// Push bytes back so the next `read` returns them first.
    fn unread(&mut self, bytes: &[u8]);

    /// Wait up to `timeout_ms` for input; `-1` blocks forever.
    fn poll(&mut self, timeout_ms: i32) -> Result<PollStatus, PortError>;

    /// Read exactly one byte.
    fn read_byte(&mut self) -> Result<u8, PortError> {
        let mut b = [0u8; 1];
        loop {
            if self.read(&mut b)? == 1 {
                return Ok(b[0]);
            }
        }
    }

    /// Fill `buf` completely, looping over short reads.
    fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<(), PortError> {
        let mut off = 0;
        while off < buf.len() {
            off += self.read(&mut buf[off..])?;
        }
        Ok(())
    }

    /// Consume bytes up to and including the next LF.
    fn skip_line(&mut self) -> Result<(), PortError> {
        while self.read_byte()? != b'\n' {}
        Ok(())
    }
}

/// Helper to get a `BorrowedFd` from a `RawFd` for nix calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Map a numeric baud rate to the termios constant.
fn baud_rate(baud: u32) -> Result<termios::BaudRate, String> {
    match baud {
        9600 => Ok(termios::BaudRate::B9600),
        19200 => Ok(termios::BaudRate::B19200),
        38400 => Ok(termios::BaudRate::B38400),
        57600 => Ok(termios::BaudRate::B57600),
        115200 => Ok(termios::BaudRate::B115200),
        230400 => Ok(termios::BaudRate::B230400),
        other => Err(format!("unsupported baud rate {other}")),
    }
}

/// Configure termios: raw mode, 8N1, no flow control.
/// VMIN=1, VTIME=0 — reads block until at least one byte; timeouts come
/// from `poll(2)`.
fn configure_termios(fd: RawFd, baud: u32) -> Result<(), String> {
    // SAFETY: fd is valid — caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate).map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, rate).map_err(|e| format!("cfsetospeed: {e}"))?;

    // 8N1, CLOCAL (ignore modem control), CREAD (enable receiver)
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS; // no hardware flow control

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;

    Ok(())
}

/// Serial port implementation of [`LinePort`] over a raw fd.
pub struct TtyPort {
    fd: RawFd,
    pushback: VecDeque<u8>,
}

impl TtyPort {
    /// Open a serial device path (e.g. `/dev/ttyUSB0`) in raw 8N1 mode.
    ///
    /// Returns `Err` if the device cannot be opened or termios
    /// configuration fails.
    pub fn open(device: &str, baud: u32) -> Result<Self, String> {
        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| format!("open {device}: {e}"))?;

        // Clear O_NONBLOCK now that we have the fd — reads should block and
        // rely on poll() for timeouts.
        let flags =
            fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).map_err(|e| format!("F_GETFL: {e}"))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags)).map_err(|e| format!("F_SETFL: {e}"))?;

        configure_termios(fd, baud)?;

        // Flush any stale data
        // SAFETY: fd is valid — we just opened it
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| format!("tcflush: {e}"))?;
        }

        Ok(Self {
            fd,
            pushback: VecDeque::new(),
        })
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

impl LinePort for TtyPort {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), PortError> {
        // SAFETY: fd is valid for the lifetime of self
        let bfd = unsafe { borrow_fd(self.fd) };
        let mut off = 0;
        while off < buf.len() {
            match unistd::write(bfd, &buf[off..]) {
                Ok(0) => return Err(PortError::Disconnected),
                Ok(n) => off += n,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PortError> {
        if !self.pushback.is_empty() {
            let n = buf.len().min(self.pushback.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pushback.pop_front().unwrap_or_default();
            }
            return Ok(n);
        }
        loop {
            match unistd::read(self.fd, buf) {
                Ok(0) => return Err(PortError::Disconnected),
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn unread(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.pushback.push_front(b);
        }
    }

    fn poll(&mut self, timeout_ms: i32) -> Result<PollStatus, PortError> {
        if !self.pushback.is_empty() {
            return Ok(PollStatus::ReadReady);
        }
        // SAFETY: fd is valid for the lifetime of self
        let bfd = unsafe { borrow_fd(self.fd) };
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
        };
        loop {
            let mut fds = [PollFd::new(bfd, PollFlags::POLLIN)];
            match nix::poll::poll(&mut fds, timeout) {
                Ok(0) => return Ok(PollStatus::Timeout),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(
                        PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
                    ) {
                        return Ok(PollStatus::Disconnected);
                    }
                    return Ok(PollStatus::ReadReady);
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::{LinePort, PollStatus};

    #[test]
    fn test_unread_preserves_order_within_call() {
        let mut port = MockPort::new();
        port.unread(b"AB");
        assert_eq!(port.read_byte().unwrap(), b'A');
        assert_eq!(port.read_byte().unwrap(), b'B');
    }

    #[test]
    fn test_unread_calls_stack_lifo() {
        let mut port = MockPort::new();
        port.unread(b"AB");
        port.unread(b"CD");
        let mut out = [0u8; 4];
        port.read_exact_buf(&mut out).unwrap();
        assert_eq!(&out, b"CDAB");
    }

    #[test]
    fn test_unread_served_before_script() {
        let mut port = MockPort::new();
        port.push_rx(b"XY");
        port.unread(b"E");
        assert_eq!(port.read_byte().unwrap(), b'E');
        assert_eq!(port.read_byte().unwrap(), b'X');
    }

    #[test]
    fn test_poll_ready_with_pushback_only() {
        let mut port = MockPort::new();
        assert_eq!(port.poll(0).unwrap(), PollStatus::Timeout);
        port.unread(b"Z");
        assert_eq!(port.poll(0).unwrap(), PollStatus::ReadReady);
    }

    #[test]
    fn test_skip_line_consumes_through_lf() {
        let mut port = MockPort::new();
        port.push_rx(b"SKRESET\r\nOK");
        port.skip_line().unwrap();
        assert_eq!(port.read_byte().unwrap(), b'O');
    }
}
