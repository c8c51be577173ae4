//! ECHONET Lite frame codec.
//!
//! Frames are `EHD1 (0x10)` `EHD2` `TID (u16 BE)` `EDATA`. EHD2 selects the
//! variant: `0x81` is the structured Format 1 (`SEOJ DEOJ ESV OPC` followed
//! by OPC properties, each `EPC PDC EDT`), `0x82` is Format 2 with an
//! opaque EDATA. Everything is big-endian.

use std::sync::atomic::{AtomicU16, Ordering};

use serde::Deserialize;

/// Get property value(s).
pub const ESV_GET: u8 = 0x62;
/// Response to [`ESV_GET`].
pub const ESV_GET_RES: u8 = 0x63;

/// The controller object this exporter speaks as (`05 FF 01`).
pub const CONTROLLER: Eoj = Eoj {
    class_group: 0x05,
    class_code: 0xFF,
    instance: 0x01,
};

const EHD1_ECHONET: u8 = 0x10;
const EHD2_FORMAT1: u8 = 0x81;
const EHD2_FORMAT2: u8 = 0x82;

/// Decode failure. Both variants are fatal for the datagram at hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// EHD1 was not `0x10`, or EHD2 selected no known format.
    InvalidEhd { ehd1: u8, ehd2: u8 },
    /// The payload ended before the declared structure did.
    Truncated,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidEhd { ehd1, ehd2 } => {
                write!(f, "invalid ECHONET header {ehd1:02X} {ehd2:02X}")
            }
            CodecError::Truncated => write!(f, "truncated ECHONET frame"),
        }
    }
}

/// ECHONET object identifier: class group, class code, instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Eoj {
    pub class_group: u8,
    pub class_code: u8,
    pub instance: u8,
}

/// One property: code plus optional data. An absent `edt` serializes with
/// `PDC = 0` and is how Get requests name the properties they want.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub epc: u8,
    pub edt: Option<Vec<u8>>,
}

impl Property {
    /// A data-less property, as carried in Get requests.
    pub fn request(epc: u8) -> Self {
        Self { epc, edt: None }
    }
}

/// Format 1 EDATA: source/destination objects, service code, properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EData {
    pub seoj: Eoj,
    pub deoj: Eoj,
    pub esv: u8,
    pub props: Vec<Property>,
}

impl EData {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.seoj.class_group, self.seoj.class_code, self.seoj.instance]);
        out.extend_from_slice(&[self.deoj.class_group, self.deoj.class_code, self.deoj.instance]);
        out.push(self.esv);
        assert!(self.props.len() <= 0xFF, "more than 255 properties in frame");
        out.push(self.props.len() as u8);
        for prop in &self.props {
            out.push(prop.epc);
            match &prop.edt {
                None => out.push(0),
                Some(edt) => {
                    assert!(edt.len() <= 0xFF, "property EDT longer than 255 bytes");
                    out.push(edt.len() as u8);
                    out.extend_from_slice(edt);
                }
            }
        }
    }
}

/// An ECHONET Lite frame, tagged by EHD2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// EHD2 `0x81` — structured EDATA.
    Format1 { tid: u16, edata: EData },
    /// EHD2 `0x82` — opaque EDATA.
    Format2 { tid: u16, edata: Vec<u8> },
}

impl Frame {
    /// The transaction id, common to both formats.
    pub fn tid(&self) -> u16 {
        match self {
            Frame::Format1 { tid, .. } | Frame::Format2 { tid, .. } => *tid,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Format1 { tid, edata } => {
                let mut out = vec![EHD1_ECHONET, EHD2_FORMAT1];
                out.extend_from_slice(&tid.to_be_bytes());
                edata.encode_into(&mut out);
                out
            }
            Frame::Format2 { tid, edata } => {
                let mut out = vec![EHD1_ECHONET, EHD2_FORMAT2];
                out.extend_from_slice(&tid.to_be_bytes());
                out.extend_from_slice(edata);
                out
            }
        }
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
        let mut r = Reader::new(bytes);
        let ehd1 = r.u8()?;
        let ehd2 = r.u8()?;
        if ehd1 != EHD1_ECHONET || !matches!(ehd2, EHD2_FORMAT1 | EHD2_FORMAT2) {
            return Err(CodecError::InvalidEhd { ehd1, ehd2 });
        }
        let tid = r.u16_be()?;
        if ehd2 == EHD2_FORMAT2 {
            return Ok(Frame::Format2 {
                tid,
                edata: r.rest().to_vec(),
            });
        }

        let seoj = r.eoj()?;
        let deoj = r.eoj()?;
        let esv = r.u8()?;
        let opc = r.u8()?;
        let mut props = Vec::with_capacity(usize::from(opc));
        for _ in 0..opc {
            let epc = r.u8()?;
            let pdc = r.u8()?;
            let edt = if pdc == 0 {
                None
            } else {
                Some(r.take(usize::from(pdc))?.to_vec())
            };
            props.push(Property { epc, edt });
        }
        Ok(Frame::Format1 {
            tid,
            edata: EData {
                seoj,
                deoj,
                esv,
                props,
            },
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(CodecError::Truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn eoj(&mut self) -> Result<Eoj, CodecError> {
        let b = self.take(3)?;
        Ok(Eoj {
            class_group: b[0],
            class_code: b[1],
            instance: b[2],
        })
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Integer encoding of one exported field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::I8 | FieldKind::U8 => 1,
            FieldKind::I16 | FieldKind::U16 => 2,
            FieldKind::I32 | FieldKind::U32 => 4,
        }
    }
}

/// One exported field: metric name plus its wire encoding.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldLayout {
    /// Exported metric name.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
}

/// Read typed big-endian fields off the head of a property's EDT, in the
/// declared layout order. An absent EDT yields an empty iterator; a short
/// EDT ends the iteration at the last complete field.
pub fn read_fields<'a>(prop: &'a Property, layouts: &'a [FieldLayout]) -> Fields<'a> {
    Fields {
        edt: prop.edt.as_deref().unwrap_or(&[]),
        layouts: layouts.iter(),
        offset: 0,
    }
}

/// Iterator over `(metric_name, value)` pairs; see [`read_fields`].
pub struct Fields<'a> {
    edt: &'a [u8],
    layouts: std::slice::Iter<'a, FieldLayout>,
    offset: usize,
}

impl<'a> Iterator for Fields<'a> {
    type Item = (&'a str, i64);

    fn next(&mut self) -> Option<Self::Item> {
        let layout = self.layouts.next()?;
        let width = layout.kind.width();
        let bytes = self.edt.get(self.offset..self.offset + width)?;
        self.offset += width;
        Some((layout.name.as_str(), decode_int(layout.kind, bytes)))
    }
}

#[allow(clippy::cast_possible_wrap)]
fn decode_int(kind: FieldKind, bytes: &[u8]) -> i64 {
    let mut acc: u64 = 0;
    for &b in bytes {
        acc = (acc << 8) | u64::from(b);
    }
    match kind {
        FieldKind::U8 | FieldKind::U16 | FieldKind::U32 => acc as i64,
        FieldKind::I8 => i64::from(acc as u8 as i8),
        FieldKind::I16 => i64::from(acc as u16 as i16),
        FieldKind::I32 => i64::from(acc as u32 as i32),
    }
}

/// Process-wide transaction-id source: strictly increasing, wrapping u16.
/// Release-acquire fetch-add so a future concurrent caller could share it
/// unchanged.
pub struct TidAllocator(AtomicU16);

impl TidAllocator {
    pub fn new() -> Self {
        Self(AtomicU16::new(1))
    }

    /// Take the next transaction id. Each scrape takes exactly one.
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }
}

impl Default for TidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
