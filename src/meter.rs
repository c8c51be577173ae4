//! The scrape pipeline: ECHONET request/response correlation over a
//! B-route session.
//!
//! [`MeterReader`] is the synchronous core — it owns the session (and
//! through it the serial port) and turns one scrape into one Get frame,
//! one TID, and one correlated Get_Res. [`Meter`] is the cloneable async
//! handle the HTTP side uses: requests go through an `mpsc` channel to a
//! dedicated I/O thread and come back via `oneshot` — no mutex, and the
//! channel serializes scrapes.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Measure, MeterConfig, WisunConfig};
use crate::echonet::{
    read_fields, CodecError, EData, Eoj, Frame, Property, TidAllocator, CONTROLLER, ESV_GET,
    ESV_GET_RES,
};
use crate::modem::{ModemError, SRegister, SkModem};
use crate::port::{LinePort, PortError, TtyPort};
use crate::session::{Credentials, SessionConfig, SessionError, WisunSession};

/// One exported reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: String,
    pub value: i64,
    pub help: Option<String>,
}

/// Failure of one scrape, structured for the HTTP status mapping.
#[derive(Debug)]
pub enum MeterError {
    /// No correlated response within the receive deadline.
    Timeout,
    Session(SessionError),
    Codec(CodecError),
}

impl MeterError {
    /// True for the failures the frontend reports as 504 Gateway Timeout:
    /// the meter (or the link to it) did not answer.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            MeterError::Timeout
                | MeterError::Session(SessionError::ConnectionFailed)
                | MeterError::Session(SessionError::Modem(ModemError::Port(
                    PortError::Disconnected
                )))
        )
    }

    /// True when the port itself failed and the session must be assumed
    /// dead regardless of its state machine.
    fn is_transport(&self) -> bool {
        matches!(
            self,
            MeterError::Session(SessionError::Modem(ModemError::Port(_)))
        )
    }
}

impl std::fmt::Display for MeterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeterError::Timeout => write!(f, "no response from meter within deadline"),
            MeterError::Session(e) => write!(f, "{e}"),
            MeterError::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl From<SessionError> for MeterError {
    fn from(e: SessionError) -> Self {
        MeterError::Session(e)
    }
}

impl From<CodecError> for MeterError {
    fn from(e: CodecError) -> Self {
        MeterError::Codec(e)
    }
}

impl From<ModemError> for MeterError {
    fn from(e: ModemError) -> Self {
        MeterError::Session(SessionError::Modem(e))
    }
}

/// Synchronous scrape core. Single-threaded: one in-flight command or
/// event read at a time, suspension only inside port reads and polls.
pub struct MeterReader<P: LinePort> {
    session: WisunSession<P>,
    tids: TidAllocator,
    target: Eoj,
    measures: Vec<Measure>,
    recv_timeout_ms: i32,
}

impl<P: LinePort> MeterReader<P> {
    pub fn new(
        modem: SkModem<P>,
        session_config: SessionConfig,
        target: Eoj,
        measures: Vec<Measure>,
        recv_timeout_ms: i32,
    ) -> Self {
        Self {
            session: WisunSession::new(modem, session_config),
            tids: TidAllocator::new(),
            target,
            measures,
            recv_timeout_ms,
        }
    }

    /// Reset the module and disable command echoback. Runs on the I/O
    /// thread: an unresponsive modem must never stall the async runtime.
    pub fn init_modem(&mut self) -> Result<(), MeterError> {
        self.session.modem_mut().reset()?;
        self.session.modem_mut().set_register(SRegister::SFE, "0")?;
        Ok(())
    }

    /// Forget the link after a transport failure so the next scrape
    /// re-runs the scan/join dance.
    pub fn reset_link(&mut self) {
        self.session.mark_disconnected();
    }

    /// Send `frame` and read datagrams until one decodes to a frame with
    /// the same TID. `Ok(None)` means the receive deadline passed. Frames
    /// with unrelated TIDs are logged and skipped.
    pub fn request(&mut self, frame: &Frame, timeout_ms: i32) -> Result<Option<Frame>, MeterError> {
        let bytes = frame.encode();
        self.session.send(&bytes)?;
        loop {
            let Some(data) = self.session.recv(timeout_ms)? else {
                return Ok(None);
            };
            let resp = Frame::decode(&data)?;
            if resp.tid() == frame.tid() {
                return Ok(Some(resp));
            }
            debug!(
                "discarding frame with unrelated TID {:04X} (want {:04X})",
                resp.tid(),
                frame.tid()
            );
        }
    }

    /// One scrape: connect if needed, Get every configured EPC in a single
    /// frame, map the Get_Res properties through the measure layouts.
    pub fn scrape(&mut self) -> Result<Vec<Sample>, MeterError> {
        if !self.session.is_connected() {
            self.session.connect()?;
        }

        let tid = self.tids.next();
        let frame = Frame::Format1 {
            tid,
            edata: EData {
                seoj: CONTROLLER,
                deoj: self.target,
                esv: ESV_GET,
                props: self
                    .measures
                    .iter()
                    .map(|m| Property::request(m.epc))
                    .collect(),
            },
        };

        let resp = match self.request(&frame, self.recv_timeout_ms)? {
            Some(resp) => resp,
            None => return Err(MeterError::Timeout),
        };

        let Frame::Format1 { edata, .. } = resp else {
            // A Format 2 response carries no readable properties.
            warn!("meter answered with an opaque Format 2 frame");
            return Ok(Vec::new());
        };
        if edata.esv != ESV_GET_RES {
            warn!("unexpected ESV {:02X} in response", edata.esv);
        }

        let mut samples = Vec::new();
        for measure in &self.measures {
            let Some(prop) = edata.props.iter().find(|p| p.epc == measure.epc) else {
                warn!(
                    "response carries no EPC {:02X} ({})",
                    measure.epc, measure.name
                );
                continue;
            };
            let fields: Vec<_> = read_fields(prop, &measure.layout).collect();
            if fields.len() < measure.layout.len() {
                warn!(
                    "EDT for {} shorter than its layout ({} of {} fields)",
                    measure.name,
                    fields.len(),
                    measure.layout.len()
                );
            }
            for (name, value) in fields {
                samples.push(Sample {
                    name: name.to_string(),
                    value,
                    help: measure.help.clone(),
                });
            }
        }
        Ok(samples)
    }
}

/// Scrape failure as seen by the HTTP handler, pre-classified for the
/// status code.
#[derive(Debug)]
pub enum ScrapeError {
    /// The meter did not answer — 504 Gateway Timeout.
    Unavailable(String),
    /// Anything else — 500 with a logged diagnostic.
    Internal(String),
}

impl std::fmt::Display for ScrapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrapeError::Unavailable(msg) | ScrapeError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

fn classify(e: &MeterError) -> ScrapeError {
    if e.is_unavailable() {
        ScrapeError::Unavailable(e.to_string())
    } else {
        ScrapeError::Internal(e.to_string())
    }
}

struct ScrapeRequest {
    reply: oneshot::Sender<Result<Vec<Sample>, ScrapeError>>,
}

/// Cloneable handle to the meter I/O thread.
///
/// Internally holds an `mpsc::Sender` — cloning just clones the sender.
/// All scrapes are serialized through the channel.
#[derive(Clone)]
pub struct Meter {
    tx: mpsc::Sender<ScrapeRequest>,
    device: String,
}

impl Meter {
    /// Open the serial device and spawn the I/O thread.
    ///
    /// Returns `Err` if the device cannot be opened or configured; the
    /// session itself is brought up lazily on the first scrape.
    pub fn open(wisun: &WisunConfig, meter: &MeterConfig) -> Result<Self, String> {
        let port = TtyPort::open(&wisun.device, wisun.baud)?;

        let credentials = match (&wisun.rbid, &wisun.pwd) {
            (Some(rbid), Some(pwd)) => Some(Credentials {
                rbid: rbid.clone(),
                pwd: pwd.clone(),
            }),
            _ => None,
        };
        let reader = MeterReader::new(
            SkModem::new(port),
            SessionConfig {
                credentials,
                scan_channel_mask: wisun.scan_channel_mask,
                scan_duration: wisun.scan_duration,
            },
            meter.target,
            meter.measures.clone(),
            wisun.recv_timeout_ms,
        );

        let (tx, rx) = mpsc::channel::<ScrapeRequest>(8);
        let device = wisun.device.clone();
        let dev_name = device.clone();

        std::thread::Builder::new()
            .name(format!("wisun-{dev_name}"))
            .spawn(move || meter_thread(reader, rx, &dev_name))
            .map_err(|e| format!("spawn meter thread: {e}"))?;

        info!(
            "Wi-SUN modem {device}: opened ({} baud), init on I/O thread",
            wisun.baud
        );

        Ok(Self { tx, device })
    }

    /// Run one scrape on the I/O thread and wait for its samples.
    pub async fn scrape(&self) -> Result<Vec<Sample>, ScrapeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScrapeRequest { reply: reply_tx })
            .await
            .map_err(|_| ScrapeError::Internal(format!("meter {} I/O thread gone", self.device)))?;

        reply_rx
            .await
            .map_err(|_| ScrapeError::Internal(format!("meter {} reply channel dropped", self.device)))?
    }

    /// Device path this meter is attached to.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }
}

/// Blocking I/O thread: receives scrape requests from the channel and runs
/// them against the serial fd, one at a time.
fn meter_thread(
    mut reader: MeterReader<TtyPort>,
    mut rx: mpsc::Receiver<ScrapeRequest>,
    device: &str,
) {
    // Reset + echoback-off on THIS thread so an unresponsive modem never
    // blocks the tokio runtime.
    match reader.init_modem() {
        Ok(()) => info!("Wi-SUN modem {device}: initialized (SKRESET, echoback off)"),
        Err(e) => warn!("Wi-SUN modem {device}: init failed ({e}), continuing anyway"),
    }

    while let Some(req) = rx.blocking_recv() {
        let result = reader.scrape();
        match &result {
            Ok(samples) => debug!("meter {device}: scrape ok, {} samples", samples.len()),
            Err(e) => {
                warn!("meter {device}: scrape failed: {e}");
                if e.is_transport() {
                    reader.reset_link();
                }
            }
        }
        let _ = req.reply.send(result.map_err(|e| classify(&e)));
    }

    // Channel closed — the exporter is shutting down.
    debug!("meter {device} I/O thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echonet::FieldKind;
    use crate::echonet::FieldLayout;
    use crate::port::mock::MockPort;

    const PEER: &str = "FE80:0000:0000:0000:021D:1290:1234:5678";
    const COORD: &str = "FE80:0000:0000:0000:021D:1290:0003:C890";

    fn smart_meter() -> Eoj {
        Eoj {
            class_group: 0x02,
            class_code: 0x88,
            instance: 0x01,
        }
    }

    fn power_measure() -> Measure {
        Measure {
            name: "instantaneous_power".into(),
            help: Some("Instantaneous electric power in watts.".into()),
            epc: 0xE7,
            layout: vec![FieldLayout {
                name: "echonet_instantaneous_power_watts".into(),
                kind: FieldKind::I32,
            }],
        }
    }

    fn connect_script() -> Vec<u8> {
        let mut script = Vec::new();
        script.extend_from_slice(b"OK\r\n"); // SKSCAN
        script.extend_from_slice(format!("EVENT 20 {COORD} 0\r\n").as_bytes());
        script.extend_from_slice(
            b"EPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:12345678ABCDEF01\r\n  LQI:E1\r\n  Side:0\r\n  PairID:AABBCCDD\r\n",
        );
        script.extend_from_slice(format!("EVENT 22 {COORD} 0\r\n").as_bytes());
        script.extend_from_slice(format!("{PEER}\r\n").as_bytes()); // SKLL64
        script.extend_from_slice(b"OK\r\nOK\r\nOK\r\n"); // S02, S03, SKJOIN
        script.extend_from_slice(format!("EVENT 25 {PEER} 0\r\n").as_bytes());
        script
    }

    /// ERXUDP from the meter carrying an ECHONET frame.
    fn response_datagram(frame_bytes: &[u8]) -> Vec<u8> {
        let mut line = format!(
            "ERXUDP {PEER} {COORD} 0E1A 0E1A 001D129012345678 1 0 {:04X} ",
            frame_bytes.len()
        )
        .into_bytes();
        line.extend_from_slice(frame_bytes);
        line.extend_from_slice(b"\r\n");
        line
    }

    /// Get_Res with one E7 = 300 W property.
    fn get_res(tid: u16) -> Vec<u8> {
        let mut bytes = vec![0x10, 0x81];
        bytes.extend_from_slice(&tid.to_be_bytes());
        bytes.extend_from_slice(&[
            0x02, 0x88, 0x01, 0x05, 0xFF, 0x01, 0x63, 0x01, 0xE7, 0x04, 0x00, 0x00, 0x01, 0x2C,
        ]);
        bytes
    }

    fn reader_with_rx(script: &[u8]) -> MeterReader<MockPort> {
        let mut port = MockPort::new();
        port.push_rx(script);
        MeterReader::new(
            SkModem::new(port),
            SessionConfig {
                credentials: None,
                scan_channel_mask: 0xFFFF_FFFF,
                scan_duration: 6,
            },
            smart_meter(),
            vec![power_measure()],
            1000,
        )
    }

    #[test]
    fn test_scrape_correlated_get_res() {
        let mut script = connect_script();
        script.extend_from_slice(b"OK\r\n"); // SKSENDTO
        script.extend_from_slice(&response_datagram(&get_res(1))); // first TID is 1
        let mut reader = reader_with_rx(&script);

        let samples = reader.scrape().unwrap();
        assert_eq!(
            samples,
            vec![Sample {
                name: "echonet_instantaneous_power_watts".into(),
                value: 300,
                help: Some("Instantaneous electric power in watts.".into()),
            }]
        );
    }

    #[test]
    fn test_scrape_sends_get_for_configured_epc() {
        let mut script = connect_script();
        script.extend_from_slice(b"OK\r\n");
        script.extend_from_slice(&response_datagram(&get_res(1)));
        let mut reader = reader_with_rx(&script);
        reader.scrape().unwrap();

        // 10 81 00 01 05 FF 01 02 88 01 62 01 E7 00, framed by SKSENDTO.
        let tx = reader.session.modem_mut().port_mut().tx.clone();
        let needle: &[u8] = &[
            0x10, 0x81, 0x00, 0x01, 0x05, 0xFF, 0x01, 0x02, 0x88, 0x01, 0x62, 0x01, 0xE7, 0x00,
        ];
        assert!(tx.windows(needle.len()).any(|window| window == needle));
    }

    #[test]
    fn test_scrape_discards_unrelated_tid() {
        let mut script = connect_script();
        script.extend_from_slice(b"OK\r\n");
        script.extend_from_slice(&response_datagram(&get_res(0))); // request TID - 1
        script.extend_from_slice(&response_datagram(&get_res(1)));
        let mut reader = reader_with_rx(&script);

        let samples = reader.scrape().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 300);
    }

    #[test]
    fn test_scrape_timeout() {
        let mut script = connect_script();
        script.extend_from_slice(b"OK\r\n"); // SKSENDTO, then silence
        let mut reader = reader_with_rx(&script);

        match reader.scrape() {
            Err(MeterError::Timeout) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_scrape_missing_epc_yields_no_sample() {
        // Get_Res that answers a different EPC than configured.
        let mut frame = vec![0x10, 0x81, 0x00, 0x01];
        frame.extend_from_slice(&[
            0x02, 0x88, 0x01, 0x05, 0xFF, 0x01, 0x63, 0x01, 0xE8, 0x02, 0x00, 0x64,
        ]);
        let mut script = connect_script();
        script.extend_from_slice(b"OK\r\n");
        script.extend_from_slice(&response_datagram(&frame));
        let mut reader = reader_with_rx(&script);

        assert!(reader.scrape().unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(MeterError::Timeout.is_unavailable());
        assert!(MeterError::Session(SessionError::ConnectionFailed).is_unavailable());
        assert!(
            MeterError::Session(SessionError::Modem(ModemError::Port(PortError::Disconnected)))
                .is_unavailable()
        );
        assert!(!MeterError::Session(SessionError::CoordinatorNotFound).is_unavailable());
        assert!(!MeterError::Codec(CodecError::Truncated).is_unavailable());
    }
}
