//! Error types for the DCE RPC client engine

use crate::dcerpc::PacketType;
use std::sync::Arc;
use thiserror::Error;

/// RPC error types
///
/// Errors fall into five groups: parse errors (nothing was mutated),
/// protocol rejections by the peer, transport-fatal errors (the transport
/// is closed and every later operation fails fast with
/// [`RpcError::TransportBroken`]), security provider errors and usage
/// errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DCE RPC version mismatch: {major}.{minor}")]
    VersionMismatch { major: u8, minor: u8 },

    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("unexpected {0:?} PDU")]
    UnexpectedPdu(PacketType),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("bind rejected: {message} (reason {reason})")]
    BindRejected { reason: u16, message: &'static str },

    #[error("presentation context {context_id} rejected (reason {reason})")]
    ContextRejected { context_id: u16, reason: u16 },

    #[error("fault: {name} (status 0x{status:08x})")]
    Fault { status: u32, name: &'static str },

    #[error("server terminated the connection")]
    ServerTerminated,

    #[error("fragment out of order")]
    FragmentOutOfOrder,

    #[error("fragment too large: {size} bytes exceeds maximum {max}")]
    FragmentTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("transport broken: {0}")]
    TransportBroken(Arc<RpcError>),

    #[error("security: {0}")]
    Security(String),

    #[error("no presentation context is bound")]
    NoPresentation,

    #[error("no security context is established")]
    NoSecurityContext,

    #[error("client connection is closed")]
    ClientClosed,

    #[error("unknown sub-connection {0}")]
    UnknownSubConn(u64),

    #[error("binding has no endpoint and no endpoint mapper is configured")]
    NoEndpoint,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no binding candidate could be dialed: {0}")]
    NoCandidates(String),
}

impl RpcError {
    /// Returns true if the error leaves the transport unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::Timeout
                | RpcError::ConnectionClosed
                | RpcError::TransportBroken(_)
                | RpcError::ServerTerminated
                | RpcError::VersionMismatch { .. }
                | RpcError::InvalidPacketType(_)
                | RpcError::FragmentTooLarge { .. }
        )
    }

    pub(crate) fn eof(what: &str) -> Self {
        RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("not enough data for {}", what),
        ))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
