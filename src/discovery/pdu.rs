// src/discovery/pdu.rs

//! NVMe/TCP PDU layouts for the discovery controller: little-endian fixed
//! structures with exact byte widths, plus a `tokio_util` codec that frames
//! whole PDUs out of the byte stream.

use crate::core::errors::GwError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

// PDU types.
pub const PDU_ICREQ: u8 = 0x0;
pub const PDU_ICRESP: u8 = 0x1;
pub const PDU_CMD: u8 = 0x4;
pub const PDU_RSP: u8 = 0x5;
pub const PDU_C2H_DATA: u8 = 0x7;

// Admin opcodes.
pub const OPC_GET_LOG_PAGE: u8 = 0x2;
pub const OPC_IDENTIFY: u8 = 0x6;
pub const OPC_SET_FEATURES: u8 = 0x9;
pub const OPC_GET_FEATURES: u8 = 0xa;
pub const OPC_ASYNC_EVENT_REQ: u8 = 0xc;
pub const OPC_KEEP_ALIVE: u8 = 0x18;
pub const OPC_FABRIC: u8 = 0x7f;

// Fabric command subtypes.
pub const FCTYPE_PROP_SET: u8 = 0x0;
pub const FCTYPE_CONNECT: u8 = 0x1;
pub const FCTYPE_PROP_GET: u8 = 0x4;

// Controller register offsets.
pub const REG_CAP: u32 = 0x00;
pub const REG_VS: u32 = 0x08;
pub const REG_CC: u32 = 0x14;
pub const REG_CSTS: u32 = 0x1c;

// Discovery log entry constants.
pub const TRTYPE_TCP: u8 = 0x3;
pub const ADRFAM_IPV4: u8 = 0x1;
pub const ADRFAM_IPV6: u8 = 0x2;
pub const SUBTYPE_NVME: u8 = 0x2;
pub const TREQ_NOT_REQUIRED: u8 = 0x2;

pub const LID_DISCOVERY: u8 = 0x70;

/// Submission queue head wraps after this many entries.
pub const SQ_HEAD_MAX: u16 = 128;

/// Discovery log pages are carved into units of this size.
pub const LOG_PAGE_UNIT: usize = 1024;

/// A hostile peer must not make us buffer unbounded PDUs.
const MAX_PDU_LENGTH: usize = 1024 * 1024;

const PDU_HEADER_LEN: usize = 8;

/// The 8-byte common header present on every NVMe/TCP PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub pdu_type: u8,
    pub flags: u8,
    pub header_length: u8,
    pub data_offset: u8,
    pub packet_length: u32,
}

impl PduHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PDU_HEADER_LEN {
            return None;
        }
        Some(Self {
            pdu_type: data[0],
            flags: data[1],
            header_length: data[2],
            data_offset: data[3],
            packet_length: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// Frames complete PDUs (header included) out of the inbound byte stream.
#[derive(Debug, Default)]
pub struct PduCodec;

impl Decoder for PduCodec {
    type Item = Bytes;
    type Error = GwError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, GwError> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }
        let packet_length =
            u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if packet_length < PDU_HEADER_LEN || packet_length > MAX_PDU_LENGTH {
            return Err(GwError::InvalidArgument(format!(
                "malformed PDU length {packet_length}"
            )));
        }
        if src.len() < packet_length {
            src.reserve(packet_length - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(packet_length).freeze()))
    }
}

// --- Field accessors over a whole command PDU (absolute byte offsets) ---

pub fn get_u16_le(data: &[u8], off: usize) -> u16 {
    let mut b = &data[off..off + 2];
    b.get_u16_le()
}

pub fn get_u32_le(data: &[u8], off: usize) -> u32 {
    let mut b = &data[off..off + 4];
    b.get_u32_le()
}

pub fn get_u64_le(data: &[u8], off: usize) -> u64 {
    let mut b = &data[off..off + 8];
    b.get_u64_le()
}

/// NUL/space-stripped string out of a fixed-width field.
pub fn get_padded_str(data: &[u8], off: usize, len: usize) -> String {
    let raw = &data[off..off + len];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
}

// --- Reply builders ---

fn put_pdu_header(
    dst: &mut BytesMut,
    pdu_type: u8,
    flags: u8,
    header_length: u8,
    data_offset: u8,
    packet_length: u32,
) {
    dst.put_u8(pdu_type);
    dst.put_u8(flags);
    dst.put_u8(header_length);
    dst.put_u8(data_offset);
    dst.put_u32_le(packet_length);
}

/// ICResp: 128 bytes total, advertising the data-capsule budget.
pub fn icresp_reply() -> Bytes {
    let mut dst = BytesMut::with_capacity(128);
    put_pdu_header(&mut dst, PDU_ICRESP, 0, 128, 0, 128);
    dst.put_u16_le(0); // pdu version format
    dst.put_u8(0); // data alignment
    dst.put_u8(0); // digest types enabled
    dst.put_u32_le(131072); // maximum data capsules per r2t
    dst.resize(128, 0);
    dst.freeze()
}

/// Connect response CQE.
pub fn cqe_connect_reply(controller_id: u16, sq_head_ptr: u16, cmd_id: u16) -> Bytes {
    let mut dst = BytesMut::with_capacity(24);
    put_pdu_header(&mut dst, PDU_RSP, 0, 24, 0, 24);
    dst.put_u16_le(controller_id);
    dst.put_u16_le(0); // authentication
    dst.put_u32_le(0); // reserved
    dst.put_u16_le(sq_head_ptr);
    dst.put_u16_le(0); // sq id
    dst.put_u16_le(cmd_id);
    dst.put_u16_le(0); // status
    dst.freeze()
}

/// Property get/set response CQE carrying 8 bytes of register data.
pub fn cqe_property_reply(property_data: [u8; 8], sq_head_ptr: u16, cmd_id: u16) -> Bytes {
    let mut dst = BytesMut::with_capacity(24);
    put_pdu_header(&mut dst, PDU_RSP, 0, 24, 0, 24);
    dst.put_slice(&property_data);
    dst.put_u16_le(sq_head_ptr);
    dst.put_u16_le(0);
    dst.put_u16_le(cmd_id);
    dst.put_u16_le(0);
    dst.freeze()
}

/// Generic admin CQE (set features, keep alive, async event).
pub fn cqe_nvme_reply(dword0: u32, dword1: u32, sq_head_ptr: u16, cmd_id: u16) -> Bytes {
    let mut dst = BytesMut::with_capacity(24);
    put_pdu_header(&mut dst, PDU_RSP, 0, 24, 0, 24);
    dst.put_u32_le(dword0);
    dst.put_u32_le(dword1);
    dst.put_u16_le(sq_head_ptr);
    dst.put_u16_le(0);
    dst.put_u16_le(cmd_id);
    dst.put_u16_le(0);
    dst.freeze()
}

/// The asynchronous-event completion announcing a discovery log change:
/// event type 0x2, info 0xF0, log page 0x70.
pub fn aen_dword0() -> u32 {
    u32::from_le_bytes([0x02, 0xf0, 0x70, 0x00])
}

/// C2HData PDU wrapping `payload`.
pub fn c2h_data_reply(cmd_id: u16, payload: &[u8]) -> Bytes {
    let header_len = 8 + 16;
    let mut dst = BytesMut::with_capacity(header_len as usize + payload.len());
    // 0x0c: pdu-data-last and pdu-data-success flags.
    put_pdu_header(
        &mut dst,
        PDU_C2H_DATA,
        0x0c,
        header_len,
        header_len,
        header_len as u32 + payload.len() as u32,
    );
    dst.put_u16_le(cmd_id);
    dst.put_u16_le(0); // transfer tag
    dst.put_u32_le(0); // data offset
    dst.put_u32_le(payload.len() as u32);
    dst.put_u32_le(0); // reserved
    dst.put_slice(payload);
    dst.freeze()
}

/// The 4096-byte Identify Controller payload of the discovery controller.
pub fn identify_payload(controller_id: u16, subnqn: &[u8; 256]) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    // Firmware revision, space padded.
    buf[64..72].copy_from_slice(b"00.01   ");
    // Maximum data transfer size: 2^5 = 32 pages.
    buf[77] = 0x05;
    buf[78..80].copy_from_slice(&controller_id.to_le_bytes());
    // NVMe version 1.3.
    buf[80..84].copy_from_slice(&[0x00, 0x30, 0x01, 0x00]);
    // Optional asynchronous events supported: discovery log change.
    buf[92..96].copy_from_slice(&[0x00, 0x00, 0x00, 0x80]);
    // Asynchronous event request limit: 4 events (3 + 1).
    buf[259] = 0x03;
    // Log page attributes: extended get log page supported.
    buf[261] = 0x04;
    // Error log page entries: 128 (127 + 1).
    buf[262] = 0x7f;
    // Maximum outstanding commands.
    buf[514..516].copy_from_slice(&128u16.to_le_bytes());
    // Fused operation support.
    buf[522..524].copy_from_slice(&1u16.to_le_bytes());
    // SGL support.
    buf[536..540].copy_from_slice(&[0x05, 0x00, 0x10, 0x00]);
    buf[768..1024].copy_from_slice(subnqn);
    buf
}

/// The 1024-byte discovery log page header.
pub fn log_page_header(genctr: u64, numrec: u64) -> Vec<u8> {
    let mut buf = vec![0u8; LOG_PAGE_UNIT];
    buf[0..8].copy_from_slice(&genctr.to_le_bytes());
    buf[8..16].copy_from_slice(&numrec.to_le_bytes());
    // recfmt at 16..18 stays zero.
    buf
}

/// One 1024-byte discovery log entry. `trsvcid` and `traddr` are space
/// padded, `subnqn` is NUL padded.
pub fn log_page_entry(
    adrfam: u8,
    port_id: u16,
    trsvcid: &str,
    subnqn: &str,
    traddr: &str,
) -> Vec<u8> {
    let mut buf = vec![0u8; LOG_PAGE_UNIT];
    buf[0] = TRTYPE_TCP;
    buf[1] = adrfam;
    buf[2] = SUBTYPE_NVME;
    buf[3] = TREQ_NOT_REQUIRED;
    buf[4..6].copy_from_slice(&port_id.to_le_bytes());
    buf[6..8].copy_from_slice(&0xffffu16.to_le_bytes());
    buf[8..10].copy_from_slice(&128u16.to_le_bytes()); // admin max SQ size
    put_field(&mut buf, 32, 32, trsvcid.as_bytes(), 0x20);
    put_field(&mut buf, 256, 256, subnqn.as_bytes(), 0x00);
    put_field(&mut buf, 512, 256, traddr.as_bytes(), 0x20);
    buf
}

fn put_field(buf: &mut [u8], off: usize, width: usize, value: &[u8], pad: u8) {
    let len = value.len().min(width);
    buf[off..off + len].copy_from_slice(&value[..len]);
    for b in &mut buf[off + len..off + width] {
        *b = pad;
    }
}
