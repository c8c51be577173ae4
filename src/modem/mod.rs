//! SK-command driver for serial Wi-SUN modules.
//!
//! The modem speaks a line protocol that mixes three things on one
//! character stream: synchronous command results (`OK` / `FAIL ERnn`),
//! solicited multi-line structures (`EPANDESC`), and unsolicited events
//! (`EVENT`, `ERXUDP`) that may arrive *while* a command's result is being
//! read. The driver turns this into typed command operations plus a FIFO
//! event queue: events seen mid-result are parsed and queued, never
//! dropped.
//!
//! All TX lines are CRLF-terminated, uppercase hex without a `0x` prefix,
//! IPv6 as 8 uppercase 4-digit groups with no zero compression.

mod event;

pub use event::{ModemEvent, PanDescriptor, ReceivedDatagram, Side};

use std::collections::VecDeque;
use std::net::Ipv6Addr;

use tracing::{debug, warn};

use crate::port::{LinePort, PollStatus, PortError};

/// Typed `FAIL ERnn` result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// ER04 — the command is not supported by this firmware.
    CommandNotSupported,
    /// ER05 — wrong number of arguments.
    InvalidArgument,
    /// ER06 — argument format or value out of range.
    InvalidFormatOrOutOfRange,
    /// ER09 — UART input error.
    UartInputError,
    /// ER10 — the command was accepted but execution failed.
    ExecutionFailed,
    /// Any other code the firmware chooses to emit.
    Reserved(u8),
}

impl ErrorKind {
    fn from_code(code: u8) -> Self {
        match code {
            4 => ErrorKind::CommandNotSupported,
            5 => ErrorKind::InvalidArgument,
            6 => ErrorKind::InvalidFormatOrOutOfRange,
            9 => ErrorKind::UartInputError,
            10 => ErrorKind::ExecutionFailed,
            other => ErrorKind::Reserved(other),
        }
    }

    fn code(self) -> u8 {
        match self {
            ErrorKind::CommandNotSupported => 4,
            ErrorKind::InvalidArgument => 5,
            ErrorKind::InvalidFormatOrOutOfRange => 6,
            ErrorKind::UartInputError => 9,
            ErrorKind::ExecutionFailed => 10,
            ErrorKind::Reserved(code) => code,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detail = match self {
            ErrorKind::CommandNotSupported => "command not supported",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidFormatOrOutOfRange => "invalid format or out of range",
            ErrorKind::UartInputError => "UART input error",
            ErrorKind::ExecutionFailed => "execution failed",
            ErrorKind::Reserved(_) => "reserved error code",
        };
        write!(f, "ER{:02} {detail}", self.code())
    }
}

/// Failure of a modem operation.
#[derive(Debug)]
pub enum ModemError {
    /// The modem answered `FAIL ERnn`.
    Command(ErrorKind),
    /// The underlying port failed.
    Port(PortError),
}

impl std::fmt::Display for ModemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModemError::Command(kind) => write!(f, "modem returned {kind}"),
            ModemError::Port(e) => write!(f, "{e}"),
        }
    }
}

impl From<PortError> for ModemError {
    fn from(e: PortError) -> Self {
        ModemError::Port(e)
    }
}

/// The closed set of writable modem registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SRegister {
    /// Logical channel number.
    S02,
    /// PAN ID.
    S03,
    S07,
    S0A,
    S0B,
    S15,
    S16,
    S17,
    S1C,
    SA1,
    SA2,
    SA9,
    SF0,
    SFB,
    SFD,
    /// Command echoback flag (0 disables the echo).
    SFE,
    SFF,
}

impl SRegister {
    /// The register's wire name.
    pub fn name(self) -> &'static str {
        match self {
            SRegister::S02 => "S02",
            SRegister::S03 => "S03",
            SRegister::S07 => "S07",
            SRegister::S0A => "S0A",
            SRegister::S0B => "S0B",
            SRegister::S15 => "S15",
            SRegister::S16 => "S16",
            SRegister::S17 => "S17",
            SRegister::S1C => "S1C",
            SRegister::SA1 => "SA1",
            SRegister::SA2 => "SA2",
            SRegister::SA9 => "SA9",
            SRegister::SF0 => "SF0",
            SRegister::SFB => "SFB",
            SRegister::SFD => "SFD",
            SRegister::SFE => "SFE",
            SRegister::SFF => "SFF",
        }
    }
}

/// Scan mode argument of `SKSCAN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Energy detect.
    Ed = 0,
    /// Active scan, beacons with information elements.
    ActiveWithIe = 2,
    /// Active scan without information elements.
    ActiveWithoutIe = 3,
}

/// Security mode argument of `SKSENDTO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Plain = 0,
    Encrypted = 1,
    /// Encrypted, falling back to plain when no key is established.
    EncryptedFallback = 2,
}

/// Canonical IPv6 text: 8 uppercase 4-hex-digit groups, no zero compression.
pub(crate) fn format_ipv6(addr: Ipv6Addr) -> String {
    let s = addr.segments();
    format!(
        "{:04X}:{:04X}:{:04X}:{:04X}:{:04X}:{:04X}:{:04X}:{:04X}",
        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]
    )
}

/// Parse the modem's canonical IPv6 text. Width violations abort — they
/// indicate a firmware version mismatch, not recoverable input.
pub(crate) fn parse_ipv6(text: &str) -> Ipv6Addr {
    assert_eq!(
        text.len(),
        39,
        "IPv6 text field must be 39 chars, got {text:?}"
    );
    let mut segs = [0u16; 8];
    let mut count = 0;
    for (i, group) in text.split(':').enumerate() {
        assert!(i < 8, "too many IPv6 groups in {text:?}");
        assert_eq!(group.len(), 4, "IPv6 group must be 4 hex digits in {text:?}");
        segs[i] = u16::from_str_radix(group, 16)
            .unwrap_or_else(|_| panic!("malformed IPv6 group in {text:?}"));
        count = i + 1;
    }
    assert_eq!(count, 8, "IPv6 text must have 8 groups, got {text:?}");
    Ipv6Addr::new(
        segs[0], segs[1], segs[2], segs[3], segs[4], segs[5], segs[6], segs[7],
    )
}

/// Driver for an SK-style Wi-SUN modem on a [`LinePort`].
///
/// Owns the port exclusively. Events that arrive while a command result is
/// being read are queued and delivered FIFO by [`SkModem::poll_event`].
pub struct SkModem<P: LinePort> {
    port: P,
    events: VecDeque<ModemEvent>,
}

impl<P: LinePort> SkModem<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            events: VecDeque::new(),
        }
    }

    /// `SKRESET` — software-reset the module.
    pub fn reset(&mut self) -> Result<(), ModemError> {
        self.command("SKRESET")
    }

    /// `SKSREG` — write a register value (uppercase hex, caller-rendered).
    pub fn set_register(&mut self, reg: SRegister, value: &str) -> Result<(), ModemError> {
        self.command(&format!("SKSREG {} {value}", reg.name()))
    }

    /// `SKSETRBID` — configure the Route-B ID (32 hex chars).
    pub fn set_route_b_id(&mut self, rbid: &str) -> Result<(), ModemError> {
        assert_eq!(rbid.len(), 32, "Route-B ID must be 32 hex chars");
        self.command(&format!("SKSETRBID {rbid}"))
    }

    /// `SKSETPWD` — configure the Route-B password (length in hex, then
    /// the ASCII password).
    pub fn set_route_b_password(&mut self, pwd: &str) -> Result<(), ModemError> {
        assert!(
            !pwd.is_empty() && pwd.len() <= 32 && pwd.is_ascii(),
            "Route-B password must be 1-32 ASCII chars"
        );
        self.command(&format!("SKSETPWD {:X} {pwd}", pwd.len()))
    }

    /// `SKSCAN` — start a channel scan. `OK` only acknowledges the start;
    /// the scan itself reports through events.
    pub fn scan(
        &mut self,
        mode: ScanMode,
        channel_mask: u32,
        duration: u8,
        side: Side,
    ) -> Result<(), ModemError> {
        self.command(&format!(
            "SKSCAN {:X} {channel_mask:08X} {duration:X} {:X}",
            mode as u8,
            side.code()
        ))
    }

    /// `SKLL64` — resolve a 64-bit MAC address to its IPv6 link-local.
    /// The result is a bare address line, not `OK`.
    pub fn resolve_link_local(&mut self, addr64: [u8; 8]) -> Result<Ipv6Addr, ModemError> {
        let mac: String = addr64.iter().map(|b| format!("{b:02X}")).collect();
        self.write_line(&format!("SKLL64 {mac}"))?;
        let line = self.read_line_result()?;
        Ok(parse_ipv6(&line))
    }

    /// `SKJOIN` — start PANA authentication with the coordinator. `OK`
    /// only acknowledges the start; completion reports through events.
    pub fn join(&mut self, addr: Ipv6Addr) -> Result<(), ModemError> {
        self.command(&format!("SKJOIN {}", format_ipv6(addr)))
    }

    /// `SKSENDTO` — transmit a UDP datagram. The payload is raw binary on
    /// the wire, terminated by CRLF after exactly `len` bytes.
    pub fn send_datagram(
        &mut self,
        handle: u8,
        dest: Ipv6Addr,
        port: u16,
        security: SecurityMode,
        side: Side,
        payload: &[u8],
    ) -> Result<(), ModemError> {
        assert!(payload.len() <= 0xFFFF, "datagram payload too large");
        let mut line = format!(
            "SKSENDTO {handle:X} {} {port:04X} {:X} {:X} {:04X} ",
            format_ipv6(dest),
            security as u8,
            side.code(),
            payload.len()
        )
        .into_bytes();
        line.extend_from_slice(payload);
        line.extend_from_slice(b"\r\n");
        debug!("tx: SKSENDTO ({} byte payload)", payload.len());
        self.port.write_all(&line)?;
        self.wait_result()
    }

    /// `SKTERM` — tear down the PANA session.
    pub fn terminate(&mut self) -> Result<(), ModemError> {
        self.command("SKTERM")
    }

    /// Deliver the oldest pending event, reading the wire for up to
    /// `timeout_ms` (`-1` blocks forever) if the queue is empty. `None`
    /// means the timeout elapsed.
    pub fn poll_event(&mut self, timeout_ms: i32) -> Result<Option<ModemEvent>, ModemError> {
        if let Some(ev) = self.events.pop_front() {
            return Ok(Some(ev));
        }
        match self.port.poll(timeout_ms)? {
            PollStatus::Timeout => Ok(None),
            PollStatus::Disconnected => Err(ModemError::Port(PortError::Disconnected)),
            PollStatus::ReadReady => Ok(Some(event::read_event(&mut self.port)?)),
        }
    }

    /// Block until the next event.
    pub fn wait_event(&mut self) -> Result<ModemEvent, ModemError> {
        loop {
            if let Some(ev) = self.poll_event(-1)? {
                return Ok(ev);
            }
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), ModemError> {
        debug!("tx: {line}");
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r\n")?;
        Ok(())
    }

    fn command(&mut self, line: &str) -> Result<(), ModemError> {
        self.write_line(line)?;
        self.wait_result()
    }

    /// Read bytes until a result code, queueing any events that arrive
    /// first. Grammar: `OK`, `FAIL ERnn`, an echoed `SK…` line (consumed
    /// and discarded), an event line (queued), or a stray CRLF (skipped
    /// and logged — the hardware occasionally emits one unexplained).
    fn wait_result(&mut self) -> Result<(), ModemError> {
        loop {
            match self.port.read_byte()? {
                b'\r' => {
                    self.expect(b"\n")?;
                    warn!("stray CRLF before result code");
                }
                b'O' => {
                    self.expect(b"K\r\n")?;
                    return Ok(());
                }
                b'F' => {
                    self.expect(b"AIL ")?;
                    let kind = self.read_error_code()?;
                    return Err(ModemError::Command(kind));
                }
                b'S' => {
                    // The modem echoed the command back: echo suppression
                    // races the first post-reset SFE write.
                    debug!("discarding echoed command line");
                    self.port.skip_line()?;
                }
                b'E' => {
                    self.port.unread(b"E");
                    let ev = event::read_event(&mut self.port)?;
                    debug!("event arrived during command result, queueing");
                    self.events.push_back(ev);
                }
                other => {
                    panic!("unexpected byte {other:#04X} while waiting for result — firmware mismatch?")
                }
            }
        }
    }

    /// Read a bare result line (the `SKLL64` response shape), filtering
    /// echoes, events, and stray CRLFs the same way as [`Self::wait_result`].
    fn read_line_result(&mut self) -> Result<String, ModemError> {
        loop {
            match self.port.read_byte()? {
                b'\r' => {
                    self.expect(b"\n")?;
                    warn!("stray CRLF before result line");
                }
                b'S' => {
                    debug!("discarding echoed command line");
                    self.port.skip_line()?;
                }
                b'E' => {
                    self.port.unread(b"E");
                    let ev = event::read_event(&mut self.port)?;
                    debug!("event arrived during command result, queueing");
                    self.events.push_back(ev);
                }
                first => {
                    let mut line = vec![first];
                    loop {
                        match self.port.read_byte()? {
                            b'\r' => {
                                self.expect(b"\n")?;
                                break;
                            }
                            b => line.push(b),
                        }
                    }
                    assert!(line.is_ascii(), "non-ASCII bytes in result line");
                    let line = String::from_utf8(line).unwrap_or_default();
                    if let Some(code) = line.strip_prefix("FAIL ER") {
                        let code = code
                            .parse::<u8>()
                            .unwrap_or_else(|_| panic!("malformed FAIL line {line:?}"));
                        return Err(ModemError::Command(ErrorKind::from_code(code)));
                    }
                    return Ok(line);
                }
            }
        }
    }

    /// Consume exactly `bytes`; anything else is a firmware mismatch.
    fn expect(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        for &want in bytes {
            let got = self.port.read_byte()?;
            assert_eq!(
                got, want,
                "expected {want:#04X}, got {got:#04X} — firmware mismatch?"
            );
        }
        Ok(())
    }

    /// Read `ERnn<CRLF>` after `FAIL `.
    fn read_error_code(&mut self) -> Result<ErrorKind, ModemError> {
        self.expect(b"ER")?;
        let hi = self.port.read_byte()?;
        let lo = self.port.read_byte()?;
        self.expect(b"\r\n")?;
        assert!(
            hi.is_ascii_digit() && lo.is_ascii_digit(),
            "malformed error code ER{}{} — firmware mismatch?",
            hi as char,
            lo as char
        );
        let code = (hi - b'0') * 10 + (lo - b'0');
        Ok(ErrorKind::from_code(code))
    }
}

#[cfg(test)]
impl<P: LinePort> SkModem<P> {
    pub(crate) fn port_ref(&self) -> &P {
        &self.port
    }

    pub(crate) fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}
