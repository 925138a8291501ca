//! Raw byte-stream connections
//!
//! The engine never opens sockets itself; it asks a [`Dialer`] for a byte
//! stream that reaches a complete binding. [`DefaultDialer`] covers TCP on
//! every platform and named pipes on Windows (`\\server\pipe\name`).

use crate::binding::{ProtocolSequence, StringBinding};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, PipeMode};

/// A full-duplex byte stream
pub trait RawConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawConn for T {}

pub type BoxedConn = Box<dyn RawConn>;

/// Opens the raw connection for a complete binding
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, binding: &StringBinding) -> Result<BoxedConn>;
}

/// TCP, plus named pipes on Windows
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDialer;

#[async_trait]
impl Dialer for DefaultDialer {
    async fn dial(&self, binding: &StringBinding) -> Result<BoxedConn> {
        match binding.protocol {
            ProtocolSequence::Tcp => TcpDialer.dial(binding).await,
            #[cfg(windows)]
            ProtocolSequence::NamedPipe => NamedPipeDialer.dial(binding).await,
            other => Err(RpcError::InvalidBinding(format!(
                "no dialer for protocol sequence {}",
                other
            ))),
        }
    }
}

/// ncacn_ip_tcp
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, binding: &StringBinding) -> Result<BoxedConn> {
        let port: u16 = binding
            .endpoint
            .parse()
            .map_err(|_| RpcError::NoEndpoint)?;
        let host = binding.host();
        let host = if host.is_empty() { "localhost" } else { host };
        trace!("Dialing TCP: {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Path of the pipe a named-pipe binding refers to: `\\.\pipe\name` for
/// the local machine, `\\server\pipe\name` otherwise.
pub fn pipe_path(binding: &StringBinding) -> Result<String> {
    if binding.endpoint.is_empty() {
        return Err(RpcError::NoEndpoint);
    }
    let endpoint = binding.endpoint.trim_start_matches('\\');
    let name = match endpoint.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("pipe\\") => &endpoint[5..],
        _ => endpoint,
    };
    let server = match binding.host() {
        "" | "localhost" | "127.0.0.1" | "::1" => ".",
        host => host,
    };
    Ok(format!(r"\\{}\pipe\{}", server, name))
}

/// ncacn_np over the Windows pipe client (SMB for remote servers)
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedPipeDialer;

#[cfg(windows)]
#[async_trait]
impl Dialer for NamedPipeDialer {
    async fn dial(&self, binding: &StringBinding) -> Result<BoxedConn> {
        let path = pipe_path(binding)?;
        trace!("Opening pipe: {}", path);
        let client = ClientOptions::new()
            .pipe_mode(PipeMode::Message)
            .open(&path)?;
        Ok(Box::new(client))
    }
}
