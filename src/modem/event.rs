//! Wire-level parsers for asynchronous modem events.
//!
//! The modem interleaves three event shapes on the command stream: `EVENT`
//! (numeric, single line), `EPANDESC` (multi-line scan descriptor), and
//! `ERXUDP` (single line with a binary payload tail). Parsers read directly
//! from the port, one field at a time; field-width violations indicate a
//! firmware mismatch and abort.

use std::net::Ipv6Addr;

use tracing::warn;

use crate::port::{LinePort, PortError};

/// Radio interface selector: B-route upstream or HAN downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Wi-SUN B-route (to the meter).
    B = 0,
    /// HAN (home area network).
    H = 1,
}

impl Side {
    /// Single-digit wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => Side::B,
            1 => Side::H,
            other => panic!("unknown side code {other:#04X} — firmware mismatch?"),
        }
    }
}

/// A Wi-SUN coordinator discovered during an active scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanDescriptor {
    pub channel: u8,
    pub channel_page: u8,
    pub pan_id: u16,
    /// 64-bit MAC address of the coordinator.
    pub addr64: [u8; 8],
    /// Link quality indicator of the received beacon.
    pub lqi: u8,
    pub side: Side,
    /// Pairing identifier — exactly 8 printable characters.
    pub pair_id: [u8; 8],
}

/// An inbound UDP datagram announced by the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram {
    pub sender: Ipv6Addr,
    pub dest: Ipv6Addr,
    /// Remote (sender-side) UDP port.
    pub rport: u16,
    /// Local UDP port.
    pub lport: u16,
    /// Link-layer address of the sender.
    pub sender_lla: [u8; 8],
    /// Whether the datagram arrived on the secured PANA channel.
    pub secured: bool,
    pub side: Side,
    /// Raw payload, owned by the consumer once delivered.
    pub payload: Vec<u8>,
}

/// An asynchronous event materialized off the command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    /// `EVENT nn sender side [param]` — `param` is present iff
    /// `num ∈ {0x21, 0x45}`.
    Numeric {
        num: u8,
        sender: Ipv6Addr,
        side: Side,
        param: Option<u8>,
    },
    /// `EPANDESC` block from an active scan.
    PanDescriptor(PanDescriptor),
    /// `ERXUDP` with its binary payload.
    ReceivedDatagram(ReceivedDatagram),
}

/// Delimiter that terminated a whitespace-separated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delim {
    Space,
    /// CRLF (the LF has been consumed).
    Eol,
}

/// Read one field up to the next space or CRLF.
fn read_field<P: LinePort + ?Sized>(port: &mut P) -> Result<(String, Delim), PortError> {
    let mut field = Vec::new();
    loop {
        match port.read_byte()? {
            b' ' => return Ok((into_ascii(field), Delim::Space)),
            b'\r' => {
                let lf = port.read_byte()?;
                assert_eq!(lf, b'\n', "CR not followed by LF — firmware mismatch?");
                return Ok((into_ascii(field), Delim::Eol));
            }
            b => field.push(b),
        }
    }
}

fn into_ascii(bytes: Vec<u8>) -> String {
    assert!(bytes.is_ascii(), "non-ASCII bytes in event field");
    // ASCII checked above, so this cannot fail.
    String::from_utf8(bytes).unwrap_or_default()
}

fn parse_hex_u8(field: &str) -> u8 {
    u8::from_str_radix(field, 16)
        .unwrap_or_else(|_| panic!("malformed hex field {field:?} — firmware mismatch?"))
}

fn parse_hex_u16(field: &str) -> u16 {
    u16::from_str_radix(field, 16)
        .unwrap_or_else(|_| panic!("malformed hex field {field:?} — firmware mismatch?"))
}

/// Parse 16 hex characters into 8 bytes (64-bit address fields).
fn parse_hex_addr64(field: &str) -> [u8; 8] {
    assert_eq!(field.len(), 16, "64-bit address field must be 16 hex chars");
    let mut out = [0u8; 8];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = parse_hex_u8(&field[i * 2..i * 2 + 2]);
    }
    out
}

/// Read the next event off the wire. The caller has established that an
/// event line is next (first byte `E`, possibly after a stray CRLF).
pub(super) fn read_event<P: LinePort + ?Sized>(port: &mut P) -> Result<ModemEvent, PortError> {
    // Tolerate the modem's occasional stray CRLF here too; it is an anomaly
    // worth surfacing, not an expected part of the grammar.
    loop {
        let b = port.read_byte()?;
        if b == b'\r' {
            let lf = port.read_byte()?;
            assert_eq!(lf, b'\n', "CR not followed by LF — firmware mismatch?");
            warn!("stray CRLF before event head");
            continue;
        }
        port.unread(&[b]);
        break;
    }

    let (head, delim) = read_field(port)?;
    match head.as_str() {
        "EVENT" => {
            assert_eq!(delim, Delim::Space, "EVENT head must be space-delimited");
            read_numeric(port)
        }
        "EPANDESC" => {
            assert_eq!(delim, Delim::Eol, "EPANDESC head must end the line");
            read_pan_descriptor(port)
        }
        "ERXUDP" => {
            assert_eq!(delim, Delim::Space, "ERXUDP head must be space-delimited");
            read_datagram(port)
        }
        other => panic!("unknown event head {other:?} — firmware mismatch?"),
    }
}

/// `EVENT num sender side [param]` — the tail after the head token.
fn read_numeric<P: LinePort + ?Sized>(port: &mut P) -> Result<ModemEvent, PortError> {
    let (num, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "EVENT num must be space-delimited");
    let num = parse_hex_u8(&num);

    let (sender, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "EVENT sender must be space-delimited");
    let sender = super::parse_ipv6(&sender);

    let (side, delim) = read_field(port)?;
    let side = Side::from_code(parse_hex_u8(&side));

    let param = match delim {
        Delim::Eol => None,
        Delim::Space => {
            let (param, delim) = read_field(port)?;
            assert_eq!(delim, Delim::Eol, "EVENT param must end the line");
            Some(parse_hex_u8(&param))
        }
    };

    Ok(ModemEvent::Numeric {
        num,
        sender,
        side,
        param,
    })
}

/// One `  Name:VALUE` property line of an EPANDESC block.
fn read_descriptor_line<P: LinePort + ?Sized>(
    port: &mut P,
    expected: &str,
) -> Result<String, PortError> {
    for _ in 0..2 {
        let b = port.read_byte()?;
        assert_eq!(b, b' ', "EPANDESC property line must start with two spaces");
    }
    let mut name = Vec::new();
    loop {
        match port.read_byte()? {
            b':' => break,
            b => name.push(b),
        }
    }
    let name = into_ascii(name);
    assert_eq!(
        name, expected,
        "EPANDESC property out of order — firmware mismatch?"
    );
    let mut value = Vec::new();
    loop {
        match port.read_byte()? {
            b'\r' => {
                let lf = port.read_byte()?;
                assert_eq!(lf, b'\n', "CR not followed by LF — firmware mismatch?");
                return Ok(into_ascii(value));
            }
            b => value.push(b),
        }
    }
}

/// Seven fixed-order property lines following `EPANDESC`.
fn read_pan_descriptor<P: LinePort + ?Sized>(port: &mut P) -> Result<ModemEvent, PortError> {
    let channel = parse_hex_u8(&read_descriptor_line(port, "Channel")?);
    let channel_page = parse_hex_u8(&read_descriptor_line(port, "Channel Page")?);
    let pan_id = parse_hex_u16(&read_descriptor_line(port, "Pan ID")?);
    let addr64 = parse_hex_addr64(&read_descriptor_line(port, "Addr")?);
    let lqi = parse_hex_u8(&read_descriptor_line(port, "LQI")?);
    let side = Side::from_code(parse_hex_u8(&read_descriptor_line(port, "Side")?));

    let pair = read_descriptor_line(port, "PairID")?;
    assert_eq!(pair.len(), 8, "PairID must be exactly 8 characters");
    assert!(
        pair.bytes().all(|b| (0x20..0x7F).contains(&b)),
        "PairID must be printable"
    );
    let mut pair_id = [0u8; 8];
    pair_id.copy_from_slice(pair.as_bytes());

    Ok(ModemEvent::PanDescriptor(PanDescriptor {
        channel,
        channel_page,
        pan_id,
        addr64,
        lqi,
        side,
        pair_id,
    }))
}

/// `ERXUDP sender dest rport lport sender-lla secured side len <payload>`.
fn read_datagram<P: LinePort + ?Sized>(port: &mut P) -> Result<ModemEvent, PortError> {
    let (sender, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP sender must be space-delimited");
    let sender = super::parse_ipv6(&sender);

    let (dest, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP dest must be space-delimited");
    let dest = super::parse_ipv6(&dest);

    let (rport, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP rport must be space-delimited");
    let rport = parse_hex_u16(&rport);

    let (lport, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP lport must be space-delimited");
    let lport = parse_hex_u16(&lport);

    let (lla, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP sender-lla must be space-delimited");
    let sender_lla = parse_hex_addr64(&lla);

    let (secured, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP secured must be space-delimited");
    let secured = parse_hex_u8(&secured) != 0;

    let (side, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP side must be space-delimited");
    let side = Side::from_code(parse_hex_u8(&side));

    let (len, delim) = read_field(port)?;
    assert_eq!(delim, Delim::Space, "ERXUDP length must be space-delimited");
    let len = parse_hex_u16(&len) as usize;

    // The payload is raw binary: CR/LF bytes inside it carry no framing
    // meaning, so read exactly `len` bytes and then the terminator.
    let mut payload = vec![0u8; len];
    port.read_exact_buf(&mut payload)?;
    let cr = port.read_byte()?;
    let lf = port.read_byte()?;
    assert_eq!(
        (cr, lf),
        (b'\r', b'\n'),
        "ERXUDP payload not followed by CRLF — length mismatch?"
    );

    Ok(ModemEvent::ReceivedDatagram(ReceivedDatagram {
        sender,
        dest,
        rport,
        lport,
        sender_lla,
        secured,
        side,
        payload,
    }))
}
