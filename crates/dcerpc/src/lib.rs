//! DCE RPC (MS-RPCE) connection-oriented client engine
//!
//! This crate provides the connection, transport and call-multiplexing
//! engine of a DCE RPC client, wire-compatible with the DCE 1.1 RPC
//! specification and MS-RPCE.
//!
//! # Features
//!
//! - String bindings in the native and URL grammars
//! - Transport reuse and binding candidate iteration
//! - Bind / alter-context handshake with bind-time feature negotiation
//! - Streaming fragmentation and reassembly
//! - Many concurrent calls over one connection, with or without
//!   concurrent multiplexing
//! - Pluggable security providers (sign and seal per auth level)
//! - Verification trailer and header signing
//!
//! NDR marshaling is supplied by the caller through [`Operation`];
//! authentication mechanisms through [`Mechanism`].
//!
//! # Example
//!
//! ```no_run
//! use dcerpc::{dial, BindOptions, DialOptions, RawOperation, SyntaxId, Uuid};
//!
//! #[tokio::main]
//! async fn main() -> dcerpc::Result<()> {
//!     let interface = SyntaxId::new(
//!         Uuid::parse("12345678-1234-abcd-ef00-0123456789ab").unwrap(),
//!         1,
//!         0,
//!     );
//!
//!     let conn = dial("ncacn_ip_tcp:192.0.2.1[49667]", DialOptions::new()).await?;
//!     let client = conn.bind(BindOptions::new(interface)).await?;
//!
//!     // opnum 0 with a pre-marshaled body
//!     let mut op = RawOperation::new(0, &b"\x00\x00\x00\x00"[..]);
//!     client.invoke(&mut op).await?;
//!     println!("{} bytes back", op.response().len());
//!
//!     client.close().await
//! }
//! ```

pub mod error;

// Wire format
pub mod codec;
pub mod dcerpc;
pub mod fragmentation;
pub mod framing;
pub mod verification;

// Security
pub mod security;

// Negotiation
pub mod ids;
pub mod operation;
pub mod presentation;

// Addressing and configuration
pub mod binding;
pub mod config;
pub mod dialer;
pub mod epm;

// Engine
mod call;
pub mod client;
pub mod conn;
pub mod transport;

// Re-export error types
pub use error::{Result, RpcError};

// Wire format exports
pub use codec::{decode_fragment, AuthTrailer, FragmentLayout, Packet};
pub use dcerpc::{
    reject_reason,
    BindAckPdu,
    BindNakPdu,
    BindPdu,
    CharRep,
    ContextElement,
    ContextResult,
    ContextResultEntry,
    DataRepresentation,
    FaultPdu,
    FaultStatus,
    FloatRep,
    IntRep,
    PacketFlags,
    PacketType,
    Pdu,
    PduHeader,
    RequestPdu,
    ResponsePdu,
    SyntaxId,
    Uuid,
    DCE_RPC_VERSION,
    DCE_RPC_VERSION_MINOR,
    MUST_RECV_FRAG_SIZE,
};
pub use fragmentation::{Fragment, FragmentAssembler, FragmentGenerator, Fragmenter};
pub use framing::{FrameReader, FrameWriter, DEFAULT_MAX_FRAG_SIZE};
pub use verification::{VerificationCommand, VerificationTrailer};

// Security exports
pub use security::{
    calculate_auth_padding, AuthLevel, AuthType, AuthVerifier, ContextRequest, Credential,
    ImpersonationLevel, InitOutput, Mechanism, Protection, Secret, Security, SecurityProvider,
    WrapRegions,
};

// Negotiation exports
pub use ids::IdGenerator;
pub use operation::{Operation, RawOperation, RequestWriter, ResponseReader};
pub use presentation::{BindFeatures, Presentation, TransferEncoding, NDR20, NDR64};

// Addressing and configuration exports
pub use binding::{ProtocolSequence, ServerAddr, StringBinding};
pub use config::{
    BindOptions, CallOptions, DialOptions, SecurityOptions, VerifyOptions, DEFAULT_MAX_FRAG,
    DEFAULT_TIMEOUT,
};
pub use dialer::{pipe_path, BoxedConn, DefaultDialer, Dialer, RawConn, TcpDialer};
#[cfg(windows)]
pub use dialer::NamedPipeDialer;
pub use epm::{well_known, EndpointMapper, StaticEndpointMapper, EPM_INTERFACE, EPM_PIPE_NAME, EPM_PORT};

// Engine exports
pub use client::ClientConn;
pub use conn::{dial, Conn};
pub use transport::{Negotiated, Transport};
