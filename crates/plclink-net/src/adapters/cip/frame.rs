//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EtherNet/IP encapsulation and CIP message framing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! All multi-byte fields are little-endian. Requests are built into owned
//! buffers; replies are parsed from complete frames.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use plclink_core::{WireType, WireValue};
use thiserror::Error;

pub const REGISTER_SESSION: u16 = 0x0065;
pub const UNREGISTER_SESSION: u16 = 0x0066;
pub const SEND_RR_DATA: u16 = 0x006F;

pub const HEADER_LEN: usize = 24;

const PROTOCOL_VERSION: u16 = 1;
const NULL_ADDRESS_ITEM: u16 = 0x0000;
const UNCONNECTED_DATA_ITEM: u16 = 0x00B2;

const SERVICE_READ_TAG: u8 = 0x4C;
const SERVICE_WRITE_TAG: u8 = 0x4D;
const SERVICE_READ_MODIFY_WRITE: u8 = 0x4E;
const SERVICE_UNCONNECTED_SEND: u8 = 0x52;
const REPLY_FLAG: u8 = 0x80;

/// Connection manager object, class 0x06 instance 1.
const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];
const BACKPLANE_PORT: u8 = 0x01;
const PRIORITY_TIME_TICK: u8 = 0x0A;
const TIMEOUT_TICKS: u8 = 0x0E;

pub const TYPE_BOOL: u16 = 0x00C1;
pub const TYPE_SINT: u16 = 0x00C2;
pub const TYPE_INT: u16 = 0x00C3;
pub const TYPE_DINT: u16 = 0x00C4;
pub const TYPE_REAL: u16 = 0x00CA;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unexpected encapsulation command 0x{0:04X}")]
    UnexpectedCommand(u16),
    #[error("encapsulation status 0x{0:08X}")]
    EncapsulationStatus(u32),
    #[error("CIP status {}", describe_status(.general, .extended))]
    CipStatus { general: u8, extended: Vec<u16> },
    #[error("unsupported CIP data type 0x{0:04X}")]
    UnsupportedType(u16),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

fn describe_status(general: &u8, extended: &[u16]) -> String {
    let mut text = format!("0x{general:02X} ({})", status_text(*general));
    if !extended.is_empty() {
        let codes: Vec<String> = extended.iter().map(|code| format!("0x{code:04X}")).collect();
        text.push_str(&format!(", extended {}", codes.join(" ")));
    }
    text
}

/// Short description of a CIP general status code.
pub fn status_text(code: u8) -> &'static str {
    match code {
        0x00 => "success",
        0x01 => "connection failure",
        0x04 => "path segment error",
        0x05 => "path destination unknown",
        0x06 => "partial transfer",
        0x08 => "service not supported",
        0x0F => "privilege violation",
        0x10 => "device state conflict",
        0x13 => "not enough data",
        0x15 => "too much data",
        0x1E => "embedded service error",
        0x26 => "invalid path size",
        0xFF => "general error",
        _ => "unrecognised status",
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Fixed 24-byte encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn new(command: u16, session: u32, length: usize) -> Self {
        Self {
            command,
            length: length as u16,
            session,
            status: 0,
            context: *b"plclink\0",
            options: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.session);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.context);
        buf.put_u32_le(self.options);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, FrameError> {
        ensure(buf, HEADER_LEN)?;
        let command = buf.get_u16_le();
        let length = buf.get_u16_le();
        let session = buf.get_u32_le();
        let status = buf.get_u32_le();
        let mut context = [0u8; 8];
        buf.copy_to_slice(&mut context);
        let options = buf.get_u32_le();
        Ok(Self {
            command,
            length,
            session,
            status,
            context,
            options,
        })
    }
}

fn frame(command: u16, session: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    EncapHeader::new(command, session, payload.len()).encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn register_session() -> Bytes {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u16_le(PROTOCOL_VERSION);
    payload.put_u16_le(0);
    frame(REGISTER_SESSION, 0, &payload)
}

pub fn unregister_session(session: u32) -> Bytes {
    frame(UNREGISTER_SESSION, session, &[])
}

/// Wrap a CIP message in SendRRData with a null address item.
pub fn send_rr_data(session: u32, cip: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(16 + cip.len());
    payload.put_u32_le(0); // interface handle
    payload.put_u16_le(0); // timeout, governed by the unconnected send
    payload.put_u16_le(2);
    payload.put_u16_le(NULL_ADDRESS_ITEM);
    payload.put_u16_le(0);
    payload.put_u16_le(UNCONNECTED_DATA_ITEM);
    payload.put_u16_le(cip.len() as u16);
    payload.put_slice(cip);
    frame(SEND_RR_DATA, session, &payload)
}

/// Check the header of a reply and return its session handle.
pub fn check_header(header: &EncapHeader, expected: u16) -> Result<u32, FrameError> {
    if header.command != expected {
        return Err(FrameError::UnexpectedCommand(header.command));
    }
    if header.status != 0 {
        return Err(FrameError::EncapsulationStatus(header.status));
    }
    Ok(header.session)
}

/// Extract the CIP reply from a SendRRData payload (the bytes after the header).
pub fn parse_send_rr_data(mut payload: &[u8]) -> Result<Bytes, FrameError> {
    ensure(payload, 8)?;
    payload.advance(6);
    let items = payload.get_u16_le();
    for _ in 0..items {
        ensure(payload, 4)?;
        let kind = payload.get_u16_le();
        let length = payload.get_u16_le() as usize;
        ensure(payload, length)?;
        if kind == UNCONNECTED_DATA_ITEM {
            return Ok(Bytes::copy_from_slice(&payload[..length]));
        }
        payload.advance(length);
    }
    Err(FrameError::Malformed("no unconnected data item".into()))
}

/// Route `embedded` through the connection manager to the CPU in `slot`.
pub fn unconnected_send(slot: u8, embedded: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + embedded.len());
    buf.put_u8(SERVICE_UNCONNECTED_SEND);
    buf.put_u8((CONNECTION_MANAGER_PATH.len() / 2) as u8);
    buf.put_slice(&CONNECTION_MANAGER_PATH);
    buf.put_u8(PRIORITY_TIME_TICK);
    buf.put_u8(TIMEOUT_TICKS);
    buf.put_u16_le(embedded.len() as u16);
    buf.put_slice(embedded);
    if embedded.len() % 2 == 1 {
        buf.put_u8(0);
    }
    buf.put_u8(1); // route path size in words
    buf.put_u8(0);
    buf.put_u8(BACKPLANE_PORT);
    buf.put_u8(slot);
    buf.freeze()
}

fn request(service: u8, path: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + path.len() + 16);
    buf.put_u8(service);
    buf.put_u8((path.len() / 2) as u8);
    buf.put_slice(path);
    buf
}

pub fn read_tag(path: &[u8]) -> Bytes {
    let mut buf = request(SERVICE_READ_TAG, path);
    buf.put_u16_le(1);
    buf.freeze()
}

pub fn write_tag(path: &[u8], value: WireValue) -> Bytes {
    let mut buf = request(SERVICE_WRITE_TAG, path);
    buf.put_u16_le(type_code(value.wire_type()));
    buf.put_u16_le(1);
    match value {
        WireValue::Bool(b) => buf.put_u8(if b { 0xFF } else { 0x00 }),
        WireValue::Sint(v) => buf.put_i8(v),
        WireValue::Dint(v) => buf.put_i32_le(v),
        WireValue::Real(v) => buf.put_f32_le(v),
    }
    buf.freeze()
}

/// Set or clear one bit of a `width`-bit integer word without disturbing its
/// neighbours. The masks are sized to the word: 1, 2 or 4 bytes.
pub fn set_bit(path: &[u8], width: u8, bit: u8, value: bool) -> Bytes {
    let size = usize::from(width / 8);
    let word = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    let mask = 1u32 << bit;
    let (or_mask, and_mask) = if value { (mask, word) } else { (0, word & !mask) };
    let mut buf = request(SERVICE_READ_MODIFY_WRITE, path);
    buf.put_u16_le(size as u16);
    buf.put_slice(&or_mask.to_le_bytes()[..size]);
    buf.put_slice(&and_mask.to_le_bytes()[..size]);
    buf.freeze()
}

/// Bit width of an integer word type, `None` for anything that cannot carry
/// a bit selector.
pub fn word_width(code: u16) -> Option<u8> {
    match code {
        TYPE_SINT => Some(8),
        TYPE_INT => Some(16),
        TYPE_DINT => Some(32),
        _ => None,
    }
}

pub fn type_code(wire_type: WireType) -> u16 {
    match wire_type {
        WireType::Bool => TYPE_BOOL,
        WireType::Sint => TYPE_SINT,
        WireType::Dint => TYPE_DINT,
        WireType::Real => TYPE_REAL,
    }
}

/// Parsed CIP message router reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    pub service: u8,
    pub general_status: u8,
    pub extended_status: Vec<u16>,
    pub data: Bytes,
}

impl CipReply {
    pub fn parse(mut buf: &[u8]) -> Result<Self, FrameError> {
        ensure(buf, 4)?;
        let service = buf.get_u8();
        if service & REPLY_FLAG == 0 {
            return Err(FrameError::Malformed(format!(
                "service 0x{service:02X} is not a reply"
            )));
        }
        buf.advance(1);
        let general_status = buf.get_u8();
        let words = buf.get_u8() as usize;
        ensure(buf, words * 2)?;
        let extended_status = (0..words).map(|_| buf.get_u16_le()).collect();
        Ok(Self {
            service,
            general_status,
            extended_status,
            data: Bytes::copy_from_slice(buf),
        })
    }

    /// Fail unless the reply answers `request_service` with success.
    pub fn into_success(self, request_service: u8) -> Result<Bytes, FrameError> {
        if self.general_status != 0 {
            return Err(FrameError::CipStatus {
                general: self.general_status,
                extended: self.extended_status,
            });
        }
        if self.service != request_service | REPLY_FLAG {
            return Err(FrameError::Malformed(format!(
                "reply service 0x{:02X} does not answer 0x{request_service:02X}",
                self.service
            )));
        }
        Ok(self.data)
    }
}

pub fn service_of(embedded: &[u8]) -> u8 {
    embedded.first().copied().unwrap_or_default()
}

/// Read Tag reply data: the controller's type code and the decoded value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadData {
    pub code: u16,
    pub value: WireValue,
}

impl ReadData {
    /// Raw bits of an integer word, zero-extended from its own width.
    pub fn word_bits(&self) -> Option<u32> {
        match (self.code, self.value) {
            (TYPE_SINT, WireValue::Sint(v)) => Some(u32::from(v as u8)),
            (TYPE_INT, WireValue::Dint(v)) => Some(u32::from(v as u16)),
            (TYPE_DINT, WireValue::Dint(v)) => Some(v as u32),
            _ => None,
        }
    }
}

/// Decode Read Tag reply data. INT is widened to a DINT value; the type code
/// keeps the original width.
pub fn decode_read_data(mut data: &[u8]) -> Result<ReadData, FrameError> {
    ensure(data, 2)?;
    let code = data.get_u16_le();
    let value = match code {
        TYPE_BOOL => {
            ensure(data, 1)?;
            WireValue::Bool(data.get_u8() != 0)
        }
        TYPE_SINT => {
            ensure(data, 1)?;
            WireValue::Sint(data.get_i8())
        }
        TYPE_INT => {
            ensure(data, 2)?;
            WireValue::Dint(i32::from(data.get_i16_le()))
        }
        TYPE_DINT => {
            ensure(data, 4)?;
            WireValue::Dint(data.get_i32_le())
        }
        TYPE_REAL => {
            ensure(data, 4)?;
            WireValue::Real(data.get_f32_le())
        }
        other => return Err(FrameError::UnsupportedType(other)),
    };
    Ok(ReadData { code, value })
}
