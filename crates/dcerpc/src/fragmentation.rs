//! DCE RPC PDU Fragmentation Support
//!
//! This module implements multi-PDU fragmentation for DCE RPC as defined in:
//! - DCE 1.1: Remote Procedure Call (C706) Section 12.5
//! - MS-RPCE: Remote Procedure Call Protocol Extensions
//!
//! Request bodies are never materialized in full: the marshaler writes into
//! a bounded hand-off buffer and the [`Fragmenter`] drains it into
//! fragment-sized stub chunks as the bytes arrive. Each fragment carries:
//! - The same call_id
//! - FIRST_FRAG flag on first fragment
//! - LAST_FRAG flag on last fragment
//! - Fragment of the stub data
//!
//! # Fragment Structure
//!
//! ```text
//! max_frag size limit (e.g., 4280 bytes)
//! ├── PDU Header (16 bytes)
//! ├── Request/Response body header (8 bytes)
//! ├── Object UUID (16 bytes, optional, request only)
//! ├── Stub data fragment (variable)
//! ├── Verification trailer (last request fragment only)
//! ├── Auth padding (0-15 bytes, if authenticated)
//! └── Auth verifier (8 + auth_value bytes, if authenticated)
//! ```

use crate::dcerpc::{PduHeader, RequestPdu};
use crate::error::{Result, RpcError};
use crate::security::{calculate_auth_padding, AuthVerifier};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fragment size arithmetic.
pub struct FragmentGenerator;

impl FragmentGenerator {
    /// Calculate the maximum stub data size that can fit in a single fragment.
    ///
    /// # Arguments
    /// * `max_frag` - Maximum fragment size negotiated during bind (e.g., 4280)
    /// * `auth_len` - Length of the signature (0 if fragments are not protected)
    /// * `has_object_uuid` - Whether the request has an object UUID
    /// * `block_size` - Padding alignment required by the security provider
    ///
    /// The result is aligned down to the block size, so a full fragment never
    /// needs auth padding.
    pub fn max_stub_size(
        max_frag: u16,
        auth_len: usize,
        has_object_uuid: bool,
        block_size: usize,
    ) -> usize {
        let header_size = PduHeader::SIZE; // 16 bytes
        let body_header_size = RequestPdu::BODY_HEADER_SIZE; // 8 bytes (alloc_hint + ctx_id + opnum)
        let object_uuid_size = if has_object_uuid {
            RequestPdu::OBJECT_UUID_SIZE
        } else {
            0
        };

        let auth_overhead = if auth_len > 0 {
            AuthVerifier::HEADER_SIZE + auth_len
        } else {
            0
        };

        let overhead = header_size + body_header_size + object_uuid_size + auth_overhead;
        let available = (max_frag as usize).saturating_sub(overhead);
        let alignment = if auth_len > 0 { block_size.max(4) } else { 4 };
        available - available % alignment
    }
}

/// One chunk of stub data produced by the [`Fragmenter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub stub: Bytes,
    pub first: bool,
    pub last: bool,
    /// Bytes buffered when the fragment was cut, this fragment included.
    /// The body is streamed, so this is a lower bound on what remains and
    /// never exceeds one fragment plus one byte.
    pub alloc_hint: u32,
}

/// Drains a body stream into fragment-sized stub chunks.
///
/// The fragmenter reads until it holds more than one fragment's worth of
/// data or the stream ends. At end of stream, the remainder becomes the
/// last fragment if it still fits together with the verification trailer;
/// otherwise a full chunk is emitted and the trailer moves to a later
/// (possibly empty) last fragment.
pub struct Fragmenter<R> {
    reader: R,
    pending: BytesMut,
    max_stub: usize,
    trailer_size: usize,
    first: bool,
    eof: bool,
    done: bool,
}

impl<R: AsyncRead + Unpin> Fragmenter<R> {
    pub fn new(reader: R, max_stub: usize, trailer_size: usize) -> Result<Self> {
        // room for the trailer and its alignment in an otherwise empty fragment
        if max_stub == 0 || trailer_size + 3 > max_stub {
            return Err(RpcError::FragmentTooLarge {
                size: trailer_size + 3,
                max: max_stub,
            });
        }
        Ok(Self {
            reader,
            pending: BytesMut::with_capacity(max_stub + 1),
            max_stub,
            trailer_size,
            first: true,
            eof: false,
            done: false,
        })
    }

    fn fits_with_trailer(&self, len: usize) -> bool {
        if self.trailer_size == 0 {
            return len <= self.max_stub;
        }
        len + calculate_auth_padding(len, 4) + self.trailer_size <= self.max_stub
    }

    /// Produce the next fragment, or `None` after the last one.
    pub async fn next(&mut self) -> Result<Option<Fragment>> {
        if self.done {
            return Ok(None);
        }

        while !self.eof && self.pending.len() <= self.max_stub {
            self.pending.reserve(self.max_stub + 1 - self.pending.len());
            if self.reader.read_buf(&mut self.pending).await? == 0 {
                self.eof = true;
            }
        }

        let alloc_hint = self.pending.len() as u32;
        let first = std::mem::replace(&mut self.first, false);

        if self.eof && self.fits_with_trailer(self.pending.len()) {
            self.done = true;
            return Ok(Some(Fragment {
                stub: self.pending.split().freeze(),
                first,
                last: true,
                alloc_hint,
            }));
        }

        let take = self.max_stub.min(self.pending.len());
        Ok(Some(Fragment {
            stub: self.pending.split_to(take).freeze(),
            first,
            last: false,
            alloc_hint,
        }))
    }
}

/// Ordering checks for the fragments of one incoming message.
///
/// Stub bytes are streamed to the unmarshaler as they arrive; the assembler
/// only enforces FIRST_FRAG..LAST_FRAG ordering and context consistency.
pub struct FragmentAssembler {
    /// Call ID for this assembly session
    call_id: u32,
    /// Context ID from the first fragment
    context_id: u16,
    /// Whether we've received the first fragment
    received_first: bool,
    /// Whether we've received the last fragment
    received_last: bool,
    /// Stub bytes seen so far
    received: usize,
}

impl FragmentAssembler {
    /// Create a new fragment assembler for the given call ID.
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            context_id: 0,
            received_first: false,
            received_last: false,
            received: 0,
        }
    }

    /// Get the call ID this assembler is tracking.
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Check if assembly is complete.
    pub fn is_complete(&self) -> bool {
        self.received_first && self.received_last
    }

    /// Total stub bytes accepted so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Accept one fragment. Returns true when it was the last one.
    pub fn accept(&mut self, header: &PduHeader, context_id: u16, stub_len: usize) -> Result<bool> {
        if header.call_id != self.call_id {
            return Err(RpcError::ProtocolError(format!(
                "call id mismatch: expected {}, got {}",
                self.call_id, header.call_id
            )));
        }
        if self.received_last {
            return Err(RpcError::FragmentOutOfOrder);
        }

        if header.packet_flags.is_first_frag() {
            if self.received_first {
                return Err(RpcError::FragmentOutOfOrder);
            }
            self.received_first = true;
            self.context_id = context_id;
        } else if !self.received_first {
            return Err(RpcError::FragmentOutOfOrder);
        }

        if context_id != self.context_id {
            return Err(RpcError::ProtocolError(format!(
                "context id changed from {} to {} within call {}",
                self.context_id, context_id, self.call_id
            )));
        }

        self.received += stub_len;
        if header.packet_flags.is_last_frag() {
            self.received_last = true;
        }
        Ok(self.received_last)
    }
}
