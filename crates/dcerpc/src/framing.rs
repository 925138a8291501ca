//! Fragment framing over a byte stream
//!
//! Connection-oriented PDUs are self-delimiting via the frag_length field
//! in the header. The reader half buffers partial fragments across reads so
//! that [`FrameReader::read_frame`] can be raced against a deadline and
//! resumed without losing bytes.

use crate::dcerpc::PduHeader;
use crate::error::{Result, RpcError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default receive limit before negotiation has completed
pub const DEFAULT_MAX_FRAG_SIZE: usize = 65535;

/// Reading half: yields one complete fragment at a time
pub struct FrameReader<R> {
    inner: R,
    max_frag_size: usize,
    read_buf: BytesMut,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frag_size: DEFAULT_MAX_FRAG_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_frag_size(mut self, max_size: usize) -> Self {
        self.max_frag_size = max_size;
        self
    }

    pub fn set_max_frag_size(&mut self, max_size: usize) {
        self.max_frag_size = max_size;
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read one complete fragment.
    ///
    /// Cancel safe: bytes read before cancellation stay buffered and the
    /// next call resumes where this one stopped.
    pub async fn read_frame(&mut self) -> Result<(PduHeader, Bytes)> {
        // First, read enough for the header (16 bytes)
        while self.read_buf.len() < PduHeader::SIZE {
            if self.fill_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Err(RpcError::ConnectionClosed);
                }
                return Err(RpcError::eof("PDU header"));
            }
        }

        // Parse header to get fragment length
        let header = PduHeader::decode(&self.read_buf)?;
        let frag_length = header.frag_length as usize;

        if frag_length < PduHeader::SIZE {
            return Err(RpcError::InvalidPdu(format!(
                "invalid fragment length: {} < header size",
                frag_length
            )));
        }

        if frag_length > self.max_frag_size {
            return Err(RpcError::FragmentTooLarge {
                size: frag_length,
                max: self.max_frag_size,
            });
        }

        // Read the rest of the fragment
        while self.read_buf.len() < frag_length {
            if self.fill_buf().await? == 0 {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete PDU: expected {} bytes, got {}",
                        frag_length,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        let frame = self.read_buf.split_to(frag_length).freeze();
        Ok((header, frame))
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

/// Writing half: writes already-encoded fragments
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write a complete fragment (already encoded)
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
