//! Verification trailer (MS-RPCE 2.2.2.13)
//!
//! The trailer follows the stub data of the last request fragment,
//! 4-byte aligned, and lets the server verify that the security-relevant
//! parts of the request were not tampered with:
//!
//! ```text
//! +-------------------------------+
//! | signature (8)                 |  8A E3 13 71 02 F4 36 71
//! +-------+-------+---------------+
//! | command (2)   | length (2)    |  repeated, last one flagged END
//! +-------+-------+---------------+
//! | value (length)                |
//! +-------------------------------+
//! ```

use crate::dcerpc::{get_u16, get_u32, put_u16, put_u32, DataRepresentation, PacketType, SyntaxId};
use crate::error::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Trailer signature
pub const SIGNATURE: [u8; 8] = [0x8a, 0xe3, 0x13, 0x71, 0x02, 0xf4, 0x36, 0x71];

pub const SEC_VT_COMMAND_BITMASK_1: u16 = 0x0001;
pub const SEC_VT_COMMAND_PCONTEXT: u16 = 0x0002;
pub const SEC_VT_COMMAND_HEADER2: u16 = 0x0003;
pub const SEC_VT_COMMAND_END: u16 = 0x4000;
pub const SEC_VT_MUST_PROCESS_COMMAND: u16 = 0x8000;

/// BITMASK_1 bit: the client supports header signing
pub const SEC_VT_CLIENT_SUPPORTS_HEADER_SIGNING: u32 = 0x0000_0001;

const COMMAND_MASK: u16 = 0x3fff;

/// One verification command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationCommand {
    Bitmask1(u32),
    PContext {
        interface: SyntaxId,
        transfer_syntax: SyntaxId,
    },
    Header2 {
        packet_type: PacketType,
        data_rep: DataRepresentation,
        call_id: u32,
        context_id: u16,
        opnum: u16,
    },
    /// A command this client does not interpret
    Unknown { command: u16, value: Bytes },
}

impl VerificationCommand {
    fn command(&self) -> u16 {
        match self {
            Self::Bitmask1(_) => SEC_VT_COMMAND_BITMASK_1,
            Self::PContext { .. } => SEC_VT_COMMAND_PCONTEXT | SEC_VT_MUST_PROCESS_COMMAND,
            Self::Header2 { .. } => SEC_VT_COMMAND_HEADER2 | SEC_VT_MUST_PROCESS_COMMAND,
            Self::Unknown { command, .. } => *command & COMMAND_MASK,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Self::Bitmask1(_) => 4,
            Self::PContext { .. } => 2 * SyntaxId::SIZE,
            Self::Header2 { .. } => 16,
            Self::Unknown { value, .. } => value.len(),
        }
    }

    fn encode_value(&self, buf: &mut BytesMut, little_endian: bool) {
        match self {
            Self::Bitmask1(bits) => put_u32(buf, *bits, little_endian),
            Self::PContext {
                interface,
                transfer_syntax,
            } => {
                interface.encode(buf, little_endian);
                transfer_syntax.encode(buf, little_endian);
            }
            Self::Header2 {
                packet_type,
                data_rep,
                call_id,
                context_id,
                opnum,
            } => {
                buf.put_u8(*packet_type as u8);
                buf.put_bytes(0, 3);
                buf.put_slice(&data_rep.encode());
                put_u32(buf, *call_id, little_endian);
                put_u16(buf, *context_id, little_endian);
                put_u16(buf, *opnum, little_endian);
            }
            Self::Unknown { value, .. } => buf.put_slice(value),
        }
    }

    fn decode_value(command: u16, value: &[u8], little_endian: bool) -> Result<Self> {
        let mut cursor = Cursor::new(value);
        Ok(match command & COMMAND_MASK {
            SEC_VT_COMMAND_BITMASK_1 => {
                Self::Bitmask1(get_u32(&mut cursor, little_endian, "bitmask command")?)
            }
            SEC_VT_COMMAND_PCONTEXT => Self::PContext {
                interface: SyntaxId::decode(&mut cursor, little_endian)?,
                transfer_syntax: SyntaxId::decode(&mut cursor, little_endian)?,
            },
            SEC_VT_COMMAND_HEADER2 => {
                if value.len() < 16 {
                    return Err(RpcError::eof("header2 command"));
                }
                let packet_type = PacketType::from_u8(value[0])
                    .ok_or(RpcError::InvalidPacketType(value[0]))?;
                let data_rep = DataRepresentation::decode([value[4], value[5], value[6], value[7]]);
                cursor.set_position(8);
                Self::Header2 {
                    packet_type,
                    data_rep,
                    call_id: get_u32(&mut cursor, little_endian, "header2 command")?,
                    context_id: get_u16(&mut cursor, little_endian, "header2 command")?,
                    opnum: get_u16(&mut cursor, little_endian, "header2 command")?,
                }
            }
            _ => Self::Unknown {
                command,
                value: Bytes::copy_from_slice(value),
            },
        })
    }
}

/// A verification trailer: the signature and a non-empty command list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationTrailer {
    pub commands: Vec<VerificationCommand>,
}

impl VerificationTrailer {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Encoded size, excluding alignment padding before the signature
    pub fn size(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        SIGNATURE.len()
            + self
                .commands
                .iter()
                .map(|c| 4 + c.value_len())
                .sum::<usize>()
    }

    /// Encode the trailer. The caller has already aligned `buf` to 4 bytes.
    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        if self.is_empty() {
            return;
        }
        buf.put_slice(&SIGNATURE);
        let last = self.commands.len() - 1;
        for (i, cmd) in self.commands.iter().enumerate() {
            let mut command = cmd.command();
            if i == last {
                command |= SEC_VT_COMMAND_END;
            }
            put_u16(buf, command, little_endian);
            put_u16(buf, cmd.value_len() as u16, little_endian);
            cmd.encode_value(buf, little_endian);
        }
    }

    /// Offset of the trailer signature within `data`, if present
    pub fn find(data: &[u8]) -> Option<usize> {
        data.windows(SIGNATURE.len()).position(|w| w == SIGNATURE)
    }

    /// Decode a trailer starting at its signature
    pub fn decode(data: &[u8], little_endian: bool) -> Result<Self> {
        if !data.starts_with(&SIGNATURE) {
            return Err(RpcError::InvalidPdu(
                "verification trailer signature mismatch".into(),
            ));
        }
        let mut cursor = Cursor::new(&data[SIGNATURE.len()..]);
        let mut commands = Vec::new();
        loop {
            let command = get_u16(&mut cursor, little_endian, "verification command")?;
            let length = get_u16(&mut cursor, little_endian, "verification command")? as usize;
            if cursor.remaining() < length {
                return Err(RpcError::eof("verification command value"));
            }
            let start = cursor.position() as usize;
            let value = &cursor.get_ref()[start..start + length];
            commands.push(VerificationCommand::decode_value(command, value, little_endian)?);
            cursor.advance(length);
            if command & SEC_VT_COMMAND_END != 0 {
                break;
            }
        }
        Ok(Self { commands })
    }
}
