//! One-fragment encoding and decoding
//!
//! Fragment layout:
//! ```text
//! +----------------+  0
//! | common header  |
//! +----------------+  16
//! | PDU body       |
//! +----------------+  stub_start
//! | stub data      |
//! | [vt padding]   |
//! | [vt trailer]   |  last request fragment only
//! | [auth padding] |
//! +----------------+  trailer_start
//! | sec trailer    |  8 bytes, present iff auth_length > 0
//! | auth value     |  auth_length bytes
//! +----------------+  frag_length
//! ```
//!
//! Security wrap runs after the fragment is fully laid out and the header
//! finalized, so signing and sealing never change a length.

use crate::dcerpc::{
    PacketFlags, PacketType, Pdu, PduHeader, RequestPdu, ResponsePdu, FaultPdu,
};
use crate::error::{Result, RpcError};
use crate::security::{calculate_auth_padding, AuthVerifier, Protection, Security, WrapRegions};
use crate::verification::VerificationTrailer;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// One fragment: header, PDU body and the byte ranges around it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PduHeader,
    pub pdu: Pdu,
    /// Stub data of this fragment (excluding auth padding)
    pub stub: Bytes,
    /// Encoded after the stub; only set on the last request fragment
    pub verification: Option<VerificationTrailer>,
    /// Security trailer as decoded from the wire
    pub auth: Option<AuthVerifier>,
}

/// What to put in the security trailer of an outgoing fragment
pub enum AuthTrailer<'a> {
    None,
    /// A handshake token (bind, alter-context, auth3)
    Verifier(AuthVerifier),
    /// Sign or seal with an established context
    Protect(&'a Security, Protection),
}

impl Packet {
    pub fn new(header: PduHeader, pdu: Pdu) -> Self {
        Self {
            header,
            pdu,
            stub: Bytes::new(),
            verification: None,
            auth: None,
        }
    }

    pub fn with_stub(mut self, stub: Bytes) -> Self {
        self.stub = stub;
        self
    }

    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Encode the fragment. Derived header fields (frag_length,
    /// auth_length, the object UUID flag) are recomputed every time.
    pub fn encode(&self, trailer: AuthTrailer<'_>) -> Result<Bytes> {
        let le = self.header.data_rep.is_little_endian();
        let mut buf = BytesMut::with_capacity(PduHeader::SIZE + 64 + self.stub.len());
        buf.put_bytes(0, PduHeader::SIZE);
        self.pdu.encode(&mut buf, le);

        let stub_start = buf.len();
        buf.put_slice(&self.stub);
        if let Some(vt) = self.verification.as_ref().filter(|vt| !vt.is_empty()) {
            let pad = calculate_auth_padding(buf.len() - stub_start, 4);
            buf.put_bytes(0, pad);
            vt.encode(&mut buf, le);
        }

        let mut header = self.header.clone();
        if let Pdu::Request(request) = &self.pdu {
            if request.object.is_some() {
                header.packet_flags.set(PacketFlags::OBJECT_UUID);
            } else {
                header.packet_flags.clear(PacketFlags::OBJECT_UUID);
            }
        }

        let mut protect = None;
        let auth_length = match trailer {
            AuthTrailer::None | AuthTrailer::Protect(_, Protection::None) => 0,
            AuthTrailer::Verifier(mut verifier) => {
                // handshake bodies need not end aligned; pad the trailer itself
                let pad = calculate_auth_padding(buf.len(), 4);
                buf.put_bytes(0, pad);
                verifier.auth_pad_length = pad as u8;
                verifier.encode(&mut buf, le);
                verifier.auth_value.len()
            }
            AuthTrailer::Protect(security, protection) => {
                let signature_size = security.auth_length(protection);
                let pad = calculate_auth_padding(buf.len() - stub_start, security.block_size());
                buf.put_bytes(0, pad);
                let trailer_start = buf.len();
                security
                    .verifier(pad, Bytes::new())
                    .encode_header(&mut buf, le);
                buf.put_bytes(0, signature_size);
                protect = Some((security, protection, trailer_start));
                signature_size
            }
        };

        if buf.len() > u16::MAX as usize {
            return Err(RpcError::FragmentTooLarge {
                size: buf.len(),
                max: u16::MAX as usize,
            });
        }
        header.frag_length = buf.len() as u16;
        header.auth_length = auth_length as u16;
        header.write_into(&mut buf);

        if let Some((security, protection, trailer_start)) = protect {
            let header_sign = security.header_sign();
            let mut guard = security.lock()?;
            let (head, rest) = buf.split_at_mut(stub_start);
            let (data, trailer) = rest.split_at_mut(trailer_start - stub_start);
            let (trailer_header, slot) = trailer.split_at_mut(AuthVerifier::HEADER_SIZE);
            let signature = guard.wrap(
                protection,
                WrapRegions {
                    header: if header_sign { &*head } else { &[] },
                    data,
                    trailer: if header_sign { &*trailer_header } else { &[] },
                },
            )?;
            if signature.len() != slot.len() {
                return Err(RpcError::Security(format!(
                    "signature is {} bytes, {} were reserved",
                    signature.len(),
                    slot.len()
                )));
            }
            slot.copy_from_slice(&signature);
        }

        Ok(buf.freeze())
    }

    /// Decode a fragment without verifying its security trailer
    pub fn decode(frame: &[u8]) -> Result<Self> {
        parse(Bytes::copy_from_slice(frame))
    }
}

/// Byte ranges of a received fragment, computed from its header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLayout {
    pub stub_start: usize,
    pub stub_end: usize,
    /// Start of the security trailer, or the fragment end without one
    pub trailer_start: usize,
    pub auth_len: usize,
}

impl FragmentLayout {
    pub fn of(header: &PduHeader, frame: &[u8]) -> Result<Self> {
        let frag_len = header.frag_length as usize;
        if frame.len() != frag_len || frag_len < PduHeader::SIZE {
            return Err(RpcError::InvalidPdu(format!(
                "fragment length {} does not match {} bytes read",
                frag_len,
                frame.len()
            )));
        }

        let auth_len = header.auth_length as usize;
        let trailer_start = if auth_len == 0 {
            frag_len
        } else {
            frag_len
                .checked_sub(auth_len + AuthVerifier::HEADER_SIZE)
                .filter(|start| *start >= PduHeader::SIZE)
                .ok_or_else(|| RpcError::InvalidPdu("auth length exceeds fragment".into()))?
        };

        let body = match header.packet_type {
            PacketType::Request => {
                RequestPdu::BODY_HEADER_SIZE
                    + if header.packet_flags.contains(PacketFlags::OBJECT_UUID) {
                        RequestPdu::OBJECT_UUID_SIZE
                    } else {
                        0
                    }
            }
            PacketType::Response => ResponsePdu::BODY_HEADER_SIZE,
            PacketType::Fault => {
                FaultPdu::BODY_HEADER_SIZE.min(trailer_start - PduHeader::SIZE)
            }
            // everything up to the trailer is PDU body
            _ => trailer_start - PduHeader::SIZE,
        };
        let stub_start = PduHeader::SIZE + body;
        if stub_start > trailer_start {
            return Err(RpcError::InvalidPdu(format!(
                "{:?} body truncated",
                header.packet_type
            )));
        }

        let pad = if auth_len > 0 && stub_start < trailer_start {
            frame[trailer_start + 2] as usize
        } else {
            0
        };
        let stub_end = trailer_start
            .checked_sub(pad)
            .filter(|end| *end >= stub_start)
            .ok_or_else(|| RpcError::InvalidPdu("auth padding exceeds stub".into()))?;

        Ok(Self {
            stub_start,
            stub_end,
            trailer_start,
            auth_len,
        })
    }
}

fn parse(frame: Bytes) -> Result<Packet> {
    let header = PduHeader::decode(&frame)?;
    let layout = FragmentLayout::of(&header, &frame)?;
    let le = header.data_rep.is_little_endian();

    let mut cursor = Cursor::new(&frame[PduHeader::SIZE..layout.stub_start]);
    let pdu = Pdu::decode(&header, &mut cursor)?;

    let auth = if layout.auth_len > 0 {
        Some(AuthVerifier::decode(
            &frame[layout.trailer_start..],
            layout.auth_len,
            le,
        )?)
    } else {
        None
    };

    Ok(Packet {
        stub: frame.slice(layout.stub_start..layout.stub_end),
        header,
        pdu,
        verification: None,
        auth,
    })
}

/// Decode a fragment read into a shared buffer.
///
/// The fragment is copied into an owned buffer and `release` is invoked
/// exactly once, after the copy and before any provider work. When the
/// fragment is protected the copy is made under the security lock, so
/// releasing the shared buffer is ordered against other unwraps.
///
/// Fault, shutdown and bind-nak PDUs are mapped to their errors.
pub fn decode_fragment<F: FnOnce()>(
    frame: &[u8],
    security: Option<&Security>,
    release: F,
) -> Result<Packet> {
    let mut release = Some(release);
    let result = decode_owned(frame, security, &mut release);
    if let Some(release) = release.take() {
        release();
    }
    result
}

fn decode_owned<F: FnOnce()>(
    frame: &[u8],
    security: Option<&Security>,
    release: &mut Option<F>,
) -> Result<Packet> {
    let header = PduHeader::decode(frame)?;
    let layout = FragmentLayout::of(&header, frame)?;
    let first = header.packet_flags.is_first_frag();

    let expected = security
        .map(|s| s.protection(header.packet_type, first))
        .unwrap_or(Protection::None);
    if header.packet_type == PacketType::Response
        && expected != Protection::None
        && layout.auth_len == 0
    {
        if let Some(release) = release.take() {
            release();
        }
        return Err(RpcError::Security(
            "response is missing its security trailer".into(),
        ));
    }

    let packet = match security {
        Some(security) if expected != Protection::None && layout.auth_len > 0 => {
            let header_sign = security.header_sign();
            let mut guard = security.lock()?;
            let mut owned = BytesMut::from(frame);
            if let Some(release) = release.take() {
                release();
            }
            let (head, rest) = owned.split_at_mut(layout.stub_start);
            let (data, trailer) = rest.split_at_mut(layout.trailer_start - layout.stub_start);
            let (trailer_header, signature) = trailer.split_at_mut(AuthVerifier::HEADER_SIZE);
            guard.unwrap(
                expected,
                WrapRegions {
                    header: if header_sign { &*head } else { &[] },
                    data,
                    trailer: if header_sign { &*trailer_header } else { &[] },
                },
                &*signature,
            )?;
            drop(guard);
            parse(owned.freeze())?
        }
        _ => {
            let owned = Bytes::copy_from_slice(frame);
            if let Some(release) = release.take() {
                release();
            }
            parse(owned)?
        }
    };

    match &packet.pdu {
        Pdu::Shutdown => Err(RpcError::ServerTerminated),
        Pdu::BindNak(nak) => Err(nak.into_error()),
        Pdu::Fault(fault) => {
            let mut fault = fault.clone();
            // status 0: the exception code travels in the stub
            if fault.status == 0 && packet.stub.len() >= 4 {
                let bytes = [packet.stub[0], packet.stub[1], packet.stub[2], packet.stub[3]];
                fault.status = if packet.header.data_rep.is_little_endian() {
                    u32::from_le_bytes(bytes)
                } else {
                    u32::from_be_bytes(bytes)
                };
            }
            if fault.status == 0 {
                return Ok(packet);
            }
            Err(fault.into_error())
        }
        _ => Ok(packet),
    }
}
