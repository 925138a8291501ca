//! DCE RPC PDU (Protocol Data Unit) types
//!
//! This module implements the connection-oriented DCE RPC wire format as
//! defined in:
//! - DCE 1.1: Remote Procedure Call (C706)
//! - MS-RPCE: Remote Procedure Call Protocol Extensions
//!
//! DCE RPC PDU Header Format:
//! ```text
//! +--------+--------+--------+--------+
//! |  vers  |vers_min| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |        data representation        |
//! +--------+--------+--------+--------+
//! |   frag_len      |   auth_len      |
//! +--------+--------+--------+--------+
//! |             call_id               |
//! +--------+--------+--------+--------+
//! ```
//!
//! Only the PDU bodies live here. Stub data, the verification trailer and
//! the security trailer are laid out around them by [`crate::codec`].

use crate::error::{Result, RpcError};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// DCE RPC protocol version
pub const DCE_RPC_VERSION: u8 = 5;
/// DCE RPC protocol minor version
pub const DCE_RPC_VERSION_MINOR: u8 = 0;

/// Fragment size every implementation must accept before negotiation
pub const MUST_RECV_FRAG_SIZE: u16 = 1432;

/// Connection-oriented packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Request PDU
    Request = 0,
    /// Response PDU
    Response = 2,
    /// Fault PDU
    Fault = 3,
    /// Bind PDU
    Bind = 11,
    /// Bind-ack PDU
    BindAck = 12,
    /// Bind-nak PDU
    BindNak = 13,
    /// Alter-context PDU
    AlterContext = 14,
    /// Alter-context-response PDU
    AlterContextResp = 15,
    /// Auth3 PDU (MS-RPCE extension for odd-leg auth completion)
    Auth3 = 16,
    /// Shutdown PDU
    Shutdown = 17,
    /// Co-cancel PDU
    CoCancel = 18,
    /// Orphaned PDU
    Orphaned = 19,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Fault),
            11 => Some(Self::Bind),
            12 => Some(Self::BindAck),
            13 => Some(Self::BindNak),
            14 => Some(Self::AlterContext),
            15 => Some(Self::AlterContextResp),
            16 => Some(Self::Auth3),
            17 => Some(Self::Shutdown),
            18 => Some(Self::CoCancel),
            19 => Some(Self::Orphaned),
            _ => None,
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// First fragment
    pub const FIRST_FRAG: u8 = 0x01;
    /// Last fragment
    pub const LAST_FRAG: u8 = 0x02;
    /// Cancel pending
    pub const PENDING_CANCEL: u8 = 0x04;
    /// Header signing supported (bind/alter-context only, shares the cancel bit)
    pub const SUPPORT_HEADER_SIGN: u8 = 0x04;
    /// Reserved (must be zero)
    pub const RESERVED: u8 = 0x08;
    /// Supports concurrent multiplexing
    pub const CONC_MPX: u8 = 0x10;
    /// Did not execute
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    /// Maybe semantics requested
    pub const MAYBE: u8 = 0x40;
    /// Object UUID present in a request
    pub const OBJECT_UUID: u8 = 0x80;

    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags for a complete (non-fragmented) PDU
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn set_first_frag(&mut self) -> &mut Self {
        self.0 |= Self::FIRST_FRAG;
        self
    }

    pub fn set_last_frag(&mut self) -> &mut Self {
        self.0 |= Self::LAST_FRAG;
        self
    }

    pub fn set(&mut self, flag: u8) -> &mut Self {
        self.0 |= flag;
        self
    }

    pub fn clear(&mut self, flag: u8) -> &mut Self {
        self.0 &= !flag;
        self
    }

    pub fn contains(&self, flag: u8) -> bool {
        (self.0 & flag) == flag
    }

    pub fn is_first_frag(&self) -> bool {
        (self.0 & Self::FIRST_FRAG) != 0
    }

    pub fn is_last_frag(&self) -> bool {
        (self.0 & Self::LAST_FRAG) != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Data Representation Format Label
///
/// Format:
/// - Byte 0: Integer representation (bits 4-7) and character set (bits 0-3)
/// - Byte 1: Floating point representation
/// - Bytes 2-3: Reserved (must be zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    /// Integer representation: 0 = big-endian, 1 = little-endian
    pub int_rep: IntRep,
    /// Character representation: 0 = ASCII, 1 = EBCDIC
    pub char_rep: CharRep,
    /// Floating point representation: 0 = IEEE, 1 = VAX, 2 = Cray, 3 = IBM
    pub float_rep: FloatRep,
}

/// Integer representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntRep {
    BigEndian = 0,
    LittleEndian = 1,
}

/// Character representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharRep {
    Ascii = 0,
    Ebcdic = 1,
}

/// Floating point representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRep {
    Ieee = 0,
    Vax = 1,
    Cray = 2,
    Ibm = 3,
}

impl DataRepresentation {
    /// NDR format: little-endian, ASCII, IEEE
    pub fn ndr() -> Self {
        Self {
            int_rep: IntRep::LittleEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    /// Big-endian representation
    pub fn big_endian() -> Self {
        Self {
            int_rep: IntRep::BigEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    /// Encode to the 4-byte wire label.
    ///
    /// For little-endian ASCII IEEE: [0x10, 0x00, 0x00, 0x00]
    pub fn encode(&self) -> [u8; 4] {
        let byte0 = (self.char_rep as u8) | ((self.int_rep as u8) << 4);
        let byte1 = self.float_rep as u8;
        [byte0, byte1, 0, 0]
    }

    /// Decode from the 4-byte wire label
    pub fn decode(data: [u8; 4]) -> Self {
        let int_rep = if (data[0] & 0xF0) == 0 {
            IntRep::BigEndian
        } else {
            IntRep::LittleEndian
        };
        let char_rep = if (data[0] & 0x0F) == 0 {
            CharRep::Ascii
        } else {
            CharRep::Ebcdic
        };
        let float_rep = match data[1] {
            0 => FloatRep::Ieee,
            1 => FloatRep::Vax,
            2 => FloatRep::Cray,
            _ => FloatRep::Ibm,
        };
        Self {
            int_rep,
            char_rep,
            float_rep,
        }
    }

    /// Returns true if using little-endian byte order
    pub fn is_little_endian(&self) -> bool {
        self.int_rep == IntRep::LittleEndian
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::ndr()
    }
}

pub(crate) fn put_u16(buf: &mut BytesMut, value: u16, little_endian: bool) {
    if little_endian {
        buf.put_u16_le(value);
    } else {
        buf.put_u16(value);
    }
}

pub(crate) fn put_u32(buf: &mut BytesMut, value: u32, little_endian: bool) {
    if little_endian {
        buf.put_u32_le(value);
    } else {
        buf.put_u32(value);
    }
}

pub(crate) fn get_u8(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u8> {
    if cursor.remaining() < 1 {
        return Err(RpcError::eof(what));
    }
    Ok(cursor.get_u8())
}

pub(crate) fn get_u16(cursor: &mut Cursor<&[u8]>, little_endian: bool, what: &str) -> Result<u16> {
    if cursor.remaining() < 2 {
        return Err(RpcError::eof(what));
    }
    Ok(if little_endian {
        cursor.get_u16_le()
    } else {
        cursor.get_u16()
    })
}

pub(crate) fn get_u32(cursor: &mut Cursor<&[u8]>, little_endian: bool, what: &str) -> Result<u32> {
    if cursor.remaining() < 4 {
        return Err(RpcError::eof(what));
    }
    Ok(if little_endian {
        cursor.get_u32_le()
    } else {
        cursor.get_u32()
    })
}

/// UUID structure (128 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_hi_and_reserved: u8,
    pub clock_seq_low: u8,
    pub node: [u8; 6],
}

impl Uuid {
    /// Parse from string format "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 36 {
            return None;
        }
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 || parts[0].len() != 8 || parts[1].len() != 4 {
            return None;
        }
        if parts[2].len() != 4 || parts[3].len() != 4 || parts[4].len() != 12 {
            return None;
        }

        let time_low = u32::from_str_radix(parts[0], 16).ok()?;
        let time_mid = u16::from_str_radix(parts[1], 16).ok()?;
        let time_hi_and_version = u16::from_str_radix(parts[2], 16).ok()?;
        let clock = u16::from_str_radix(parts[3], 16).ok()?;

        let mut node = [0u8; 6];
        for (i, byte) in node.iter_mut().enumerate() {
            *byte = u8::from_str_radix(parts[4].get(i * 2..i * 2 + 2)?, 16).ok()?;
        }

        Some(Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved: (clock >> 8) as u8,
            clock_seq_low: clock as u8,
            node,
        })
    }

    /// Encode UUID in wire format (respecting byte order)
    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u32(buf, self.time_low, little_endian);
        put_u16(buf, self.time_mid, little_endian);
        put_u16(buf, self.time_hi_and_version, little_endian);
        buf.put_u8(self.clock_seq_hi_and_reserved);
        buf.put_u8(self.clock_seq_low);
        buf.put_slice(&self.node);
    }

    /// Decode UUID from wire format
    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        if cursor.remaining() < 16 {
            return Err(RpcError::eof("UUID"));
        }
        let time_low = get_u32(cursor, little_endian, "UUID")?;
        let time_mid = get_u16(cursor, little_endian, "UUID")?;
        let time_hi_and_version = get_u16(cursor, little_endian, "UUID")?;
        let clock_seq_hi_and_reserved = cursor.get_u8();
        let clock_seq_low = cursor.get_u8();
        let mut node = [0u8; 6];
        cursor.copy_to_slice(&mut node);

        Ok(Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved,
            clock_seq_low,
            node,
        })
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            self.clock_seq_hi_and_reserved,
            self.clock_seq_low,
            self.node[0],
            self.node[1],
            self.node[2],
            self.node[3],
            self.node[4],
            self.node[5]
        )
    }
}

/// Syntax ID - interface UUID with version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32, // major in lower 16 bits, minor in upper 16 bits
}

impl SyntaxId {
    /// Wire size of an encoded syntax identifier
    pub const SIZE: usize = 20;

    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major_version(&self) -> u16 {
        self.version as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        self.uuid.encode(buf, little_endian);
        put_u32(buf, self.version, little_endian);
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let uuid = Uuid::decode(cursor, little_endian)?;
        let version = get_u32(cursor, little_endian, "syntax version")?;
        Ok(Self { uuid, version })
    }
}

impl std::fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid,
            self.major_version(),
            self.minor_version()
        )
    }
}

/// Common PDU header (16 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    /// RPC version (must be 5)
    pub version: u8,
    /// RPC minor version (0 or 1)
    pub version_minor: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Packet flags
    pub packet_flags: PacketFlags,
    /// Data representation
    pub data_rep: DataRepresentation,
    /// Total length of the PDU fragment
    pub frag_length: u16,
    /// Length of the authentication value
    pub auth_length: u16,
    /// Call identifier
    pub call_id: u32,
}

impl PduHeader {
    /// PDU header size in bytes
    pub const SIZE: usize = 16;

    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version: DCE_RPC_VERSION,
            version_minor: DCE_RPC_VERSION_MINOR,
            packet_type,
            packet_flags: PacketFlags::complete(),
            data_rep: DataRepresentation::ndr(),
            frag_length: 0, // set when the fragment is finalized
            auth_length: 0,
            call_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.version_minor);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.packet_flags.as_u8());
        buf.put_slice(&self.data_rep.encode());
        // frag_length and auth_length use endianness from data_rep
        let le = self.data_rep.is_little_endian();
        put_u16(buf, self.frag_length, le);
        put_u16(buf, self.auth_length, le);
        put_u32(buf, self.call_id, le);
    }

    /// Write the header over the first [`PduHeader::SIZE`] bytes of `out`.
    pub fn write_into(&self, out: &mut [u8]) {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        out[..Self::SIZE].copy_from_slice(&buf);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("PDU header too short: {} bytes", data.len()),
            )));
        }

        let version = data[0];
        let version_minor = data[1];
        if version != DCE_RPC_VERSION || version_minor > 1 {
            return Err(RpcError::VersionMismatch {
                major: version,
                minor: version_minor,
            });
        }

        let packet_type =
            PacketType::from_u8(data[2]).ok_or(RpcError::InvalidPacketType(data[2]))?;
        let packet_flags = PacketFlags::from_u8(data[3]);
        let data_rep = DataRepresentation::decode([data[4], data[5], data[6], data[7]]);

        let le = data_rep.is_little_endian();
        let mut cursor = Cursor::new(&data[8..Self::SIZE]);
        let frag_length = get_u16(&mut cursor, le, "frag_length")?;
        let auth_length = get_u16(&mut cursor, le, "auth_length")?;
        let call_id = get_u32(&mut cursor, le, "call_id")?;

        Ok(Self {
            version,
            version_minor,
            packet_type,
            packet_flags,
            data_rep,
            frag_length,
            auth_length,
            call_id,
        })
    }
}

/// Presentation context element (p_cont_elem_t)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![transfer_syntax],
        }
    }

    pub fn size(&self) -> usize {
        4 + SyntaxId::SIZE * (1 + self.transfer_syntaxes.len())
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u16(buf, self.context_id, little_endian);
        buf.put_u8(self.transfer_syntaxes.len() as u8);
        buf.put_u8(0); // reserved

        self.abstract_syntax.encode(buf, little_endian);
        for ts in &self.transfer_syntaxes {
            ts.encode(buf, little_endian);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let context_id = get_u16(cursor, little_endian, "context element")?;
        let num_transfer_syntaxes = get_u8(cursor, "context element")?;
        let _reserved = get_u8(cursor, "context element")?;

        let abstract_syntax = SyntaxId::decode(cursor, little_endian)?;
        let mut transfer_syntaxes = Vec::with_capacity(num_transfer_syntaxes as usize);
        for _ in 0..num_transfer_syntaxes {
            transfer_syntaxes.push(SyntaxId::decode(cursor, little_endian)?);
        }

        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }
}

/// Presentation context negotiation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResult {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
    /// Reply to the bind-time feature negotiation context
    NegotiateAck = 3,
}

impl ContextResult {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            3 => Self::NegotiateAck,
            _ => Self::ProviderRejection,
        }
    }
}

/// One entry of a bind-ack result list (p_result_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextResultEntry {
    pub result: ContextResult,
    /// Provider reason, or the granted feature bitmask for `NegotiateAck`
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

/// Bind and AlterContext body.
///
/// The alter-context PDU is byte-for-byte a bind; the fragment sizes and
/// association group are ignored by the peer on alter-context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
}

impl BindPdu {
    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u16(buf, self.max_xmit_frag, little_endian);
        put_u16(buf, self.max_recv_frag, little_endian);
        put_u32(buf, self.assoc_group_id, little_endian);

        // p_cont_list_t
        buf.put_u8(self.context_list.len() as u8);
        buf.put_u8(0); // reserved
        put_u16(buf, 0, little_endian); // reserved2

        for ctx in &self.context_list {
            ctx.encode(buf, little_endian);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let max_xmit_frag = get_u16(cursor, little_endian, "bind")?;
        let max_recv_frag = get_u16(cursor, little_endian, "bind")?;
        let assoc_group_id = get_u32(cursor, little_endian, "bind")?;

        let num_contexts = get_u8(cursor, "bind context list")?;
        let _reserved = get_u8(cursor, "bind context list")?;
        let _reserved2 = get_u16(cursor, little_endian, "bind context list")?;

        let mut context_list = Vec::with_capacity(num_contexts as usize);
        for _ in 0..num_contexts {
            context_list.push(ContextElement::decode(cursor, little_endian)?);
        }

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
        })
    }
}

/// BindAck and AlterContextResponse body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAckPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Secondary address (port spec); empty on alter-context responses
    pub secondary_addr: String,
    pub results: Vec<ContextResultEntry>,
}

impl BindAckPdu {
    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        let start = buf.len();
        put_u16(buf, self.max_xmit_frag, little_endian);
        put_u16(buf, self.max_recv_frag, little_endian);
        put_u32(buf, self.assoc_group_id, little_endian);

        // port_any_t, null terminated when present
        let sec_addr_bytes = self.secondary_addr.as_bytes();
        if sec_addr_bytes.is_empty() {
            put_u16(buf, 0, little_endian);
        } else {
            put_u16(buf, sec_addr_bytes.len() as u16 + 1, little_endian);
            buf.put_slice(sec_addr_bytes);
            buf.put_u8(0);
        }

        // Align to 4-byte boundary (the body starts 4-aligned after the header)
        let padding = (4 - ((buf.len() - start) % 4)) % 4;
        buf.put_bytes(0, padding);

        // p_result_list_t
        buf.put_u8(self.results.len() as u8);
        buf.put_u8(0); // reserved
        put_u16(buf, 0, little_endian); // reserved2

        for entry in &self.results {
            put_u16(buf, entry.result as u16, little_endian);
            put_u16(buf, entry.reason, little_endian);
            entry.transfer_syntax.encode(buf, little_endian);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let start = cursor.position();
        let max_xmit_frag = get_u16(cursor, little_endian, "bind ack")?;
        let max_recv_frag = get_u16(cursor, little_endian, "bind ack")?;
        let assoc_group_id = get_u32(cursor, little_endian, "bind ack")?;

        let sec_addr_len = get_u16(cursor, little_endian, "secondary address")? as usize;
        if cursor.remaining() < sec_addr_len {
            return Err(RpcError::eof("secondary address"));
        }
        let mut sec_addr_bytes = vec![0u8; sec_addr_len];
        cursor.copy_to_slice(&mut sec_addr_bytes);
        if sec_addr_bytes.last() == Some(&0) {
            sec_addr_bytes.pop();
        }
        let secondary_addr = String::from_utf8_lossy(&sec_addr_bytes).to_string();

        // Skip alignment padding
        let consumed = (cursor.position() - start) as usize;
        let padding = (4 - (consumed % 4)) % 4;
        if cursor.remaining() < padding {
            return Err(RpcError::eof("bind ack padding"));
        }
        cursor.advance(padding);

        let num_results = get_u8(cursor, "result list")?;
        let _reserved = get_u8(cursor, "result list")?;
        let _reserved2 = get_u16(cursor, little_endian, "result list")?;

        let mut results = Vec::with_capacity(num_results as usize);
        for _ in 0..num_results {
            let result = ContextResult::from_u16(get_u16(cursor, little_endian, "result")?);
            let reason = get_u16(cursor, little_endian, "result")?;
            let transfer_syntax = SyntaxId::decode(cursor, little_endian)?;
            results.push(ContextResultEntry {
                result,
                reason,
                transfer_syntax,
            });
        }

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
        })
    }
}

/// Bind-nak reject reasons (MS-RPCE 2.2.2.5)
pub mod reject_reason {
    pub const REASON_NOT_SPECIFIED: u16 = 0;
    pub const TEMPORARY_CONGESTION: u16 = 1;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 2;
    pub const CALLED_PADDR_UNKNOWN: u16 = 3;
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u16 = 4;
    pub const DEFAULT_CONTEXT_NOT_SUPPORTED: u16 = 5;
    pub const USER_DATA_NOT_READABLE: u16 = 6;
    pub const NO_PSAP_AVAILABLE: u16 = 7;
    pub const AUTHENTICATION_TYPE_NOT_RECOGNIZED: u16 = 8;
    pub const INVALID_CHECKSUM: u16 = 9;
}

/// BindNak body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindNakPdu {
    pub reason: u16,
    /// Supported (major, minor) protocol versions
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPdu {
    pub fn message(&self) -> &'static str {
        use reject_reason::*;
        match self.reason {
            TEMPORARY_CONGESTION => "temporary congestion",
            LOCAL_LIMIT_EXCEEDED => "local limit exceeded",
            CALLED_PADDR_UNKNOWN => "called presentation address unknown",
            PROTOCOL_VERSION_NOT_SUPPORTED => "protocol version not supported",
            DEFAULT_CONTEXT_NOT_SUPPORTED => "default context not supported",
            USER_DATA_NOT_READABLE => "user data not readable",
            NO_PSAP_AVAILABLE => "no psap available",
            AUTHENTICATION_TYPE_NOT_RECOGNIZED => "authentication type not recognized",
            INVALID_CHECKSUM => "invalid checksum",
            _ => "reason not specified",
        }
    }

    pub fn into_error(&self) -> RpcError {
        RpcError::BindRejected {
            reason: self.reason,
            message: self.message(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u16(buf, self.reason, little_endian);
        buf.put_u8(self.versions.len() as u8);
        for (major, minor) in &self.versions {
            buf.put_u8(*major);
            buf.put_u8(*minor);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let reason = get_u16(cursor, little_endian, "bind nak")?;
        // The version list is optional on the wire
        let count = if cursor.has_remaining() {
            cursor.get_u8()
        } else {
            0
        };
        let mut versions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let major = get_u8(cursor, "bind nak versions")?;
            let minor = get_u8(cursor, "bind nak versions")?;
            versions.push((major, minor));
        }
        Ok(Self { reason, versions })
    }
}

/// Request body header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    /// Present iff the header carries `OBJECT_UUID`
    pub object: Option<Uuid>,
}

impl RequestPdu {
    /// alloc_hint(4) + context_id(2) + opnum(2)
    pub const BODY_HEADER_SIZE: usize = 8;
    /// Object UUID size
    pub const OBJECT_UUID_SIZE: usize = 16;

    pub fn size(&self) -> usize {
        Self::BODY_HEADER_SIZE + self.object.map_or(0, |_| Self::OBJECT_UUID_SIZE)
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u32(buf, self.alloc_hint, little_endian);
        put_u16(buf, self.context_id, little_endian);
        put_u16(buf, self.opnum, little_endian);
        if let Some(ref uuid) = self.object {
            uuid.encode(buf, little_endian);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool, has_object: bool) -> Result<Self> {
        let alloc_hint = get_u32(cursor, little_endian, "request")?;
        let context_id = get_u16(cursor, little_endian, "request")?;
        let opnum = get_u16(cursor, little_endian, "request")?;
        let object = if has_object {
            Some(Uuid::decode(cursor, little_endian)?)
        } else {
            None
        };
        Ok(Self {
            alloc_hint,
            context_id,
            opnum,
            object,
        })
    }
}

/// Response body header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
}

impl ResponsePdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u32(buf, self.alloc_hint, little_endian);
        put_u16(buf, self.context_id, little_endian);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0); // reserved
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let alloc_hint = get_u32(cursor, little_endian, "response")?;
        let context_id = get_u16(cursor, little_endian, "response")?;
        let cancel_count = get_u8(cursor, "response")?;
        let _reserved = get_u8(cursor, "response")?;
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
        })
    }
}

/// Well-known fault status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultStatus {
    /// Stub-defined exception carried in the stub data
    None = 0,
    /// Access denied
    AccessDenied = 0x0000_0005,
    /// Bad stub data
    BadStubData = 0x0000_06f7,
    /// Integer divide by zero in the server
    IntDivByZero = 0x1c00_0001,
    /// Call cancelled
    Cancel = 0x1c00_000d,
    /// Context mismatch
    ContextMismatch = 0x1c00_001a,
    /// Operation number out of range
    OpRngError = 0x1c01_0002,
    /// Unknown interface
    UnkIf = 0x1c01_0003,
    /// Protocol error
    ProtoError = 0x1c01_000b,
    /// Server too busy
    ServerTooBusy = 0x1c01_0014,
}

impl FaultStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            0x0000_0005 => Some(Self::AccessDenied),
            0x0000_06f7 => Some(Self::BadStubData),
            0x1c00_0001 => Some(Self::IntDivByZero),
            0x1c00_000d => Some(Self::Cancel),
            0x1c00_001a => Some(Self::ContextMismatch),
            0x1c01_0002 => Some(Self::OpRngError),
            0x1c01_0003 => Some(Self::UnkIf),
            0x1c01_000b => Some(Self::ProtoError),
            0x1c01_0014 => Some(Self::ServerTooBusy),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "stub exception",
            Self::AccessDenied => "access denied",
            Self::BadStubData => "bad stub data",
            Self::IntDivByZero => "nca_s_fault_int_div_by_zero",
            Self::Cancel => "nca_s_fault_cancel",
            Self::ContextMismatch => "nca_s_fault_context_mismatch",
            Self::OpRngError => "nca_s_op_rng_error",
            Self::UnkIf => "nca_s_unk_if",
            Self::ProtoError => "nca_s_proto_error",
            Self::ServerTooBusy => "nca_s_server_too_busy",
        }
    }
}

/// Fault body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub flags: u8,
    pub status: u32,
}

impl FaultPdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + flags(1) + status(4) + reserved(4)
    pub const BODY_HEADER_SIZE: usize = 16;

    pub fn new(status: u32) -> Self {
        Self {
            alloc_hint: 0,
            context_id: 0,
            cancel_count: 0,
            flags: 0,
            status,
        }
    }

    pub fn into_error(&self) -> RpcError {
        let name = FaultStatus::from_u32(self.status)
            .map(|s| s.name())
            .unwrap_or("unknown status");
        RpcError::Fault {
            status: self.status,
            name,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u32(buf, self.alloc_hint, little_endian);
        put_u16(buf, self.context_id, little_endian);
        buf.put_u8(self.cancel_count);
        buf.put_u8(self.flags);
        put_u32(buf, self.status, little_endian);
        buf.put_u32(0); // reserved
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let alloc_hint = get_u32(cursor, little_endian, "fault")?;
        let context_id = get_u16(cursor, little_endian, "fault")?;
        let cancel_count = get_u8(cursor, "fault")?;
        let flags = get_u8(cursor, "fault")?;
        let status = get_u32(cursor, little_endian, "fault")?;
        // Some peers omit the trailing reserved word
        let reserved = cursor.remaining().min(4);
        cursor.advance(reserved);
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            flags,
            status,
        })
    }
}

/// Any connection-oriented PDU body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    AlterContext(BindPdu),
    AlterContextResp(BindAckPdu),
    /// Auth3 carries four pad bytes before the security trailer
    Auth3,
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    Shutdown,
    Cancel,
    Orphaned,
}

impl Pdu {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Pdu::Bind(_) => PacketType::Bind,
            Pdu::BindAck(_) => PacketType::BindAck,
            Pdu::BindNak(_) => PacketType::BindNak,
            Pdu::AlterContext(_) => PacketType::AlterContext,
            Pdu::AlterContextResp(_) => PacketType::AlterContextResp,
            Pdu::Auth3 => PacketType::Auth3,
            Pdu::Request(_) => PacketType::Request,
            Pdu::Response(_) => PacketType::Response,
            Pdu::Fault(_) => PacketType::Fault,
            Pdu::Shutdown => PacketType::Shutdown,
            Pdu::Cancel => PacketType::CoCancel,
            Pdu::Orphaned => PacketType::Orphaned,
        }
    }

    /// Returns true if stub data may follow the PDU body
    pub fn carries_stub(&self) -> bool {
        matches!(self, Pdu::Request(_) | Pdu::Response(_) | Pdu::Fault(_))
    }

    /// Encode the PDU body (everything between the common header and stub data)
    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        match self {
            Pdu::Bind(pdu) | Pdu::AlterContext(pdu) => pdu.encode(buf, little_endian),
            Pdu::BindAck(pdu) | Pdu::AlterContextResp(pdu) => pdu.encode(buf, little_endian),
            Pdu::BindNak(pdu) => pdu.encode(buf, little_endian),
            Pdu::Auth3 => buf.put_u32(0),
            Pdu::Request(pdu) => pdu.encode(buf, little_endian),
            Pdu::Response(pdu) => pdu.encode(buf, little_endian),
            Pdu::Fault(pdu) => pdu.encode(buf, little_endian),
            Pdu::Shutdown | Pdu::Cancel | Pdu::Orphaned => {}
        }
    }

    /// Decode a PDU body, dispatching on the header's packet type
    pub fn decode(header: &PduHeader, cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let le = header.data_rep.is_little_endian();
        Ok(match header.packet_type {
            PacketType::Bind => Pdu::Bind(BindPdu::decode(cursor, le)?),
            PacketType::AlterContext => Pdu::AlterContext(BindPdu::decode(cursor, le)?),
            PacketType::BindAck => Pdu::BindAck(BindAckPdu::decode(cursor, le)?),
            PacketType::AlterContextResp => Pdu::AlterContextResp(BindAckPdu::decode(cursor, le)?),
            PacketType::BindNak => Pdu::BindNak(BindNakPdu::decode(cursor, le)?),
            PacketType::Auth3 => {
                let pad = cursor.remaining().min(4);
                cursor.advance(pad);
                Pdu::Auth3
            }
            PacketType::Request => {
                let has_object = header.packet_flags.contains(PacketFlags::OBJECT_UUID);
                Pdu::Request(RequestPdu::decode(cursor, le, has_object)?)
            }
            PacketType::Response => Pdu::Response(ResponsePdu::decode(cursor, le)?),
            PacketType::Fault => Pdu::Fault(FaultPdu::decode(cursor, le)?),
            PacketType::Shutdown => Pdu::Shutdown,
            PacketType::CoCancel => Pdu::Cancel,
            PacketType::Orphaned => Pdu::Orphaned,
        })
    }
}
