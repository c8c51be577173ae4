//! PANA session management for the B-route link.
//!
//! [`WisunSession`] drives the modem from `Disconnected` to `Connected`
//! (credentials → active scan → descriptor → register writes → join) and
//! then exposes a datagram send/recv pair filtered to the meter's address
//! and the ECHONET port. The whole dance is event-driven: `SKSCAN` and
//! `SKJOIN` acknowledge with `OK` and then report progress through numeric
//! events.

use std::net::Ipv6Addr;

use tracing::{debug, info, warn};

use crate::modem::{
    ModemError, ModemEvent, ScanMode, SecurityMode, Side, SkModem, SRegister,
};
use crate::port::LinePort;

/// ECHONET Lite's UDP port, used on both ends of the link.
pub const ECHONET_PORT: u16 = 3610;

/// UDP handle for `SKSENDTO`; handle 1 is the one bound to 3610.
const SEND_HANDLE: u8 = 1;

// Numeric event codes driving the state machine.
const EVENT_BEACON_RECEIVED: u8 = 0x20;
const EVENT_SCAN_COMPLETED: u8 = 0x22;
const EVENT_JOIN_FAILED: u8 = 0x24;
const EVENT_JOIN_COMPLETED: u8 = 0x25;

/// Session lifecycle. `Terminated` is terminal: a closed session never
/// comes back, the owner rebuilds a fresh one around the same driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Scanning,
    DescriptorSelected,
    Joining,
    Connected,
    Terminated,
}

/// Route-B authentication pair.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Route-B ID, 32 hex chars.
    pub rbid: String,
    /// Route-B password, ASCII.
    pub pwd: String,
}

/// Static parameters of the scan/join dance.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Option<Credentials>,
    pub scan_channel_mask: u32,
    pub scan_duration: u8,
}

/// Session-level failure.
#[derive(Debug)]
pub enum SessionError {
    /// The scan completed without finding any coordinator.
    CoordinatorNotFound,
    /// PANA authentication failed (join event 0x24).
    ConnectionFailed,
    /// Operation before `connect()` or after `close()`.
    NotConnected,
    /// `connect()` on a session that is already up or mid-handshake.
    AlreadyConnected,
    /// The driver or port failed underneath.
    Modem(ModemError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::CoordinatorNotFound => write!(f, "no coordinator found in scan"),
            SessionError::ConnectionFailed => write!(f, "PANA authentication failed"),
            SessionError::NotConnected => write!(f, "session not connected"),
            SessionError::AlreadyConnected => write!(f, "session already connected"),
            SessionError::Modem(e) => write!(f, "{e}"),
        }
    }
}

impl From<ModemError> for SessionError {
    fn from(e: ModemError) -> Self {
        SessionError::Modem(e)
    }
}

/// A B-route session over an SK modem.
pub struct WisunSession<P: LinePort> {
    modem: SkModem<P>,
    config: SessionConfig,
    state: SessionState,
    remote_addr: Option<Ipv6Addr>,
}

impl<P: LinePort> WisunSession<P> {
    pub fn new(modem: SkModem<P>, config: SessionConfig) -> Self {
        Self {
            modem,
            config,
            state: SessionState::Disconnected,
            remote_addr: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// The meter's link-local address; set on connect, immutable until
    /// teardown.
    pub fn remote_addr(&self) -> Option<Ipv6Addr> {
        self.remote_addr
    }

    /// Recover the driver to rebuild a fresh session after a failure.
    pub fn into_modem(self) -> SkModem<P> {
        self.modem
    }

    /// Driver access for the owner (module init, register pokes).
    pub(crate) fn modem_mut(&mut self) -> &mut SkModem<P> {
        &mut self.modem
    }

    /// Owner-side recovery: forget the link state after a transport
    /// failure so the next `connect()` re-runs the scan. Does not touch
    /// the wire; a `Terminated` session stays terminated.
    pub(crate) fn mark_disconnected(&mut self) {
        if self.state != SessionState::Terminated {
            self.state = SessionState::Disconnected;
            self.remote_addr = None;
        }
    }

    /// Bring the session up: credentials, scan, join.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Terminated => return Err(SessionError::NotConnected),
            _ => return Err(SessionError::AlreadyConnected),
        }

        if let Some(creds) = self.config.credentials.clone() {
            self.modem.set_route_b_id(&creds.rbid)?;
            self.modem.set_route_b_password(&creds.pwd)?;
        }

        info!(
            "scanning (mask {:08X}, duration {})",
            self.config.scan_channel_mask, self.config.scan_duration
        );
        self.state = SessionState::Scanning;
        self.modem.scan(
            ScanMode::ActiveWithIe,
            self.config.scan_channel_mask,
            self.config.scan_duration,
            Side::B,
        )?;

        // A beacon (0x20) means at least one descriptor follows; scan
        // completion (0x22) first means the band is empty.
        loop {
            match self.modem.wait_event()? {
                ModemEvent::Numeric {
                    num: EVENT_BEACON_RECEIVED,
                    ..
                } => break,
                ModemEvent::Numeric {
                    num: EVENT_SCAN_COMPLETED,
                    ..
                } => {
                    self.state = SessionState::Disconnected;
                    return Err(SessionError::CoordinatorNotFound);
                }
                other => debug!("skipping event during scan: {other:?}"),
            }
        }

        // The descriptor is the next framed structure on the wire.
        let desc = loop {
            match self.modem.wait_event()? {
                ModemEvent::PanDescriptor(desc) => break desc,
                other => debug!("skipping event while waiting for descriptor: {other:?}"),
            }
        };
        self.state = SessionState::DescriptorSelected;
        info!(
            "coordinator found: channel {:02X}, PAN ID {:04X}, LQI {:02X}",
            desc.channel, desc.pan_id, desc.lqi
        );

        // Let the scan run out; we join the first coordinator seen.
        loop {
            match self.modem.wait_event()? {
                ModemEvent::Numeric {
                    num: EVENT_SCAN_COMPLETED,
                    ..
                } => break,
                ModemEvent::PanDescriptor(_) => debug!("discarding additional descriptor"),
                other => debug!("skipping event during scan drain: {other:?}"),
            }
        }

        let remote = self.modem.resolve_link_local(desc.addr64)?;
        self.modem
            .set_register(SRegister::S02, &format!("{:02X}", desc.channel))?;
        self.modem
            .set_register(SRegister::S03, &format!("{:04X}", desc.pan_id))?;

        self.state = SessionState::Joining;
        self.modem.join(remote)?;
        loop {
            match self.modem.wait_event()? {
                ModemEvent::Numeric {
                    num: EVENT_JOIN_FAILED,
                    ..
                } => {
                    self.state = SessionState::Disconnected;
                    return Err(SessionError::ConnectionFailed);
                }
                ModemEvent::Numeric {
                    num: EVENT_JOIN_COMPLETED,
                    ..
                } => break,
                other => debug!("skipping event during join: {other:?}"),
            }
        }

        self.remote_addr = Some(remote);
        self.state = SessionState::Connected;
        info!("session established with {}", remote);
        Ok(())
    }

    fn remote(&self) -> Result<Ipv6Addr, SessionError> {
        if self.state == SessionState::Connected {
            self.remote_addr.ok_or(SessionError::NotConnected)
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Send one datagram to the meter on the secured channel.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let remote = self.remote()?;
        self.modem.send_datagram(
            SEND_HANDLE,
            remote,
            ECHONET_PORT,
            SecurityMode::Encrypted,
            Side::B,
            payload,
        )?;
        Ok(())
    }

    /// Receive the next datagram from the meter on port 3610/3610.
    /// Anything else (other events, other peers, other ports) is discarded.
    /// `Ok(None)` means the timeout elapsed.
    ///
    /// Each inner event poll gets the full `timeout_ms`, so a flood of
    /// unrelated events can stretch the call past the nominal deadline.
    pub fn recv(&mut self, timeout_ms: i32) -> Result<Option<Vec<u8>>, SessionError> {
        let remote = self.remote()?;
        loop {
            let Some(event) = self.modem.poll_event(timeout_ms)? else {
                return Ok(None);
            };
            match event {
                ModemEvent::ReceivedDatagram(dg)
                    if dg.sender == remote
                        && dg.rport == ECHONET_PORT
                        && dg.lport == ECHONET_PORT =>
                {
                    return Ok(Some(dg.payload));
                }
                other => debug!("discarding event while receiving: {other:?}"),
            }
        }
    }

    /// Best-effort teardown. The session is unusable afterwards.
    pub fn close(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        if let Err(e) = self.modem.terminate() {
            warn!("SKTERM failed during close: {e}");
        }
        self.state = SessionState::Terminated;
        self.remote_addr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    const PEER: &str = "FE80:0000:0000:0000:021D:1290:1234:5678";
    const COORD: &str = "FE80:0000:0000:0000:021D:1290:0003:C890";

    fn config() -> SessionConfig {
        SessionConfig {
            credentials: None,
            scan_channel_mask: 0xFFFF_FFFF,
            scan_duration: 6,
        }
    }

    fn session_with_rx(script: &[u8]) -> WisunSession<MockPort> {
        let mut port = MockPort::new();
        port.push_rx(script);
        WisunSession::new(SkModem::new(port), config())
    }

    fn epandesc() -> Vec<u8> {
        b"EPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:12345678ABCDEF01\r\n  LQI:E1\r\n  Side:0\r\n  PairID:AABBCCDD\r\n"
            .to_vec()
    }

    /// RX script for a full successful connect.
    fn connect_script() -> Vec<u8> {
        let mut script = Vec::new();
        script.extend_from_slice(b"OK\r\n"); // SKSCAN
        script.extend_from_slice(format!("EVENT 20 {COORD} 0\r\n").as_bytes());
        script.extend_from_slice(&epandesc());
        script.extend_from_slice(format!("EVENT 22 {COORD} 0\r\n").as_bytes());
        script.extend_from_slice(format!("{PEER}\r\n").as_bytes()); // SKLL64
        script.extend_from_slice(b"OK\r\n"); // S02
        script.extend_from_slice(b"OK\r\n"); // S03
        script.extend_from_slice(b"OK\r\n"); // SKJOIN
        script.extend_from_slice(format!("EVENT 25 {PEER} 0\r\n").as_bytes());
        script
    }

    fn connected_session() -> WisunSession<MockPort> {
        let mut session = session_with_rx(&connect_script());
        session.connect().unwrap();
        session
    }

    /// One scripted ERXUDP line.
    fn erxudp(sender: &str, rport: u16, lport: u16, payload: &[u8]) -> Vec<u8> {
        let mut line = format!(
            "ERXUDP {sender} {PEER} {rport:04X} {lport:04X} 001D129012345678 1 0 {:04X} ",
            payload.len()
        )
        .into_bytes();
        line.extend_from_slice(payload);
        line.extend_from_slice(b"\r\n");
        line
    }

    #[test]
    fn test_connect_success() {
        let session = connected_session();
        assert!(session.is_connected());
        assert_eq!(
            session.remote_addr().unwrap(),
            "fe80::21d:1290:1234:5678".parse::<std::net::Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_connect_writes_channel_and_pan_id() {
        let mut session = connected_session();
        let tx = session.modem.port_mut().tx_string();
        assert!(tx.contains("SKSCAN 2 FFFFFFFF 6 0\r\n"));
        assert!(tx.contains("SKLL64 12345678ABCDEF01\r\n"));
        assert!(tx.contains("SKSREG S02 21\r\n"));
        assert!(tx.contains("SKSREG S03 8888\r\n"));
        assert!(tx.contains(&format!("SKJOIN {PEER}\r\n")));
    }

    #[test]
    fn test_connect_sets_credentials_first() {
        let mut port = MockPort::new();
        port.push_rx(b"OK\r\nOK\r\nOK\r\n"); // SKSETRBID, SKSETPWD, SKSCAN
        port.push_rx(format!("EVENT 22 {COORD} 0\r\n").as_bytes());
        let mut session = WisunSession::new(
            SkModem::new(port),
            SessionConfig {
                credentials: Some(Credentials {
                    rbid: "00112233445566778899AABBCCDDEEFF".into(),
                    pwd: "0123456789AB".into(),
                }),
                scan_channel_mask: 0xFFFF_FFFF,
                scan_duration: 6,
            },
        );
        match session.connect() {
            Err(SessionError::CoordinatorNotFound) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        let tx = session.modem.port_mut().tx_string();
        assert!(tx.starts_with(
            "SKSETRBID 00112233445566778899AABBCCDDEEFF\r\nSKSETPWD C 0123456789AB\r\nSKSCAN"
        ));
    }

    #[test]
    fn test_scan_without_coordinator() {
        let mut script = Vec::new();
        script.extend_from_slice(b"OK\r\n");
        script.extend_from_slice(format!("EVENT 22 {COORD} 0\r\n").as_bytes());
        let mut session = session_with_rx(&script);
        match session.connect() {
            Err(SessionError::CoordinatorNotFound) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_join_failure() {
        let mut script = Vec::new();
        script.extend_from_slice(b"OK\r\n");
        script.extend_from_slice(format!("EVENT 20 {COORD} 0\r\n").as_bytes());
        script.extend_from_slice(&epandesc());
        script.extend_from_slice(format!("EVENT 22 {COORD} 0\r\n").as_bytes());
        script.extend_from_slice(format!("{PEER}\r\n").as_bytes());
        script.extend_from_slice(b"OK\r\nOK\r\nOK\r\n");
        script.extend_from_slice(format!("EVENT 24 {PEER} 0\r\n").as_bytes());
        let mut session = session_with_rx(&script);
        match session.connect() {
            Err(SessionError::ConnectionFailed) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mut session = connected_session();
        match session.connect() {
            Err(SessionError::AlreadyConnected) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_recv_returns_matching_datagram() {
        let mut session = connected_session();
        let dg = erxudp(PEER, ECHONET_PORT, ECHONET_PORT, &[0x10, 0x81, 0x00, 0x01]);
        session.modem.port_mut().push_rx(&dg);
        let payload = session.recv(1000).unwrap().unwrap();
        assert_eq!(payload, vec![0x10, 0x81, 0x00, 0x01]);
    }

    #[test]
    fn test_recv_filters_wrong_sender() {
        let mut session = connected_session();
        let dg = erxudp(COORD, ECHONET_PORT, ECHONET_PORT, &[0xAA]);
        session.modem.port_mut().push_rx(&dg);
        assert!(session.recv(0).unwrap().is_none());
    }

    #[test]
    fn test_recv_filters_wrong_ports() {
        let mut session = connected_session();
        let wrong_rport = erxudp(PEER, 0x0E1B, ECHONET_PORT, &[0xAA]);
        let wrong_lport = erxudp(PEER, ECHONET_PORT, 0x0E1B, &[0xBB]);
        session.modem.port_mut().push_rx(&wrong_rport);
        session.modem.port_mut().push_rx(&wrong_lport);
        assert!(session.recv(0).unwrap().is_none());
    }

    #[test]
    fn test_recv_skips_unrelated_events() {
        let mut session = connected_session();
        session
            .modem
            .port_mut()
            .push_rx(format!("EVENT 21 {PEER} 0 00\r\n").as_bytes());
        let dg = erxudp(PEER, ECHONET_PORT, ECHONET_PORT, &[0xCC]);
        session.modem.port_mut().push_rx(&dg);
        assert_eq!(session.recv(1000).unwrap().unwrap(), vec![0xCC]);
    }

    #[test]
    fn test_recv_timeout() {
        let mut session = connected_session();
        assert!(session.recv(0).unwrap().is_none());
    }

    #[test]
    fn test_operations_before_connect() {
        let mut session = session_with_rx(b"");
        match session.send(&[0x00]) {
            Err(SessionError::NotConnected) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        match session.recv(0) {
            Err(SessionError::NotConnected) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_close_is_terminal() {
        let mut session = connected_session();
        session.modem.port_mut().push_rx(b"OK\r\n"); // SKTERM
        session.close();
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.modem.port_mut().tx_string().ends_with("SKTERM\r\n"));
        match session.send(&[0x00]) {
            Err(SessionError::NotConnected) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_close_ignores_modem_failure() {
        let mut session = connected_session();
        session.modem.port_mut().push_rx(b"FAIL ER10\r\n");
        session.close();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn test_send_uses_secured_channel() {
        let mut session = connected_session();
        session.modem.port_mut().push_rx(b"OK\r\n");
        session.send(&[0x10, 0x81]).unwrap();
        let tx = session.modem.port_mut().tx_string();
        assert!(tx.contains(&format!("SKSENDTO 1 {PEER} 0E1A 1 0 0002 ")));
    }
}
