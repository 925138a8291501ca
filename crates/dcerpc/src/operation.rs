//! The marshaling seam
//!
//! Generated stub code implements [`Operation`]: it writes the request body
//! into a bounded stream as it marshals, and reads the response body back
//! out of one. The engine never sees typed parameters.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writer handed to [`Operation::marshal_request`]
pub type RequestWriter<'a> = dyn AsyncWrite + Send + Unpin + 'a;
/// Reader handed to [`Operation::unmarshal_response`]
pub type ResponseReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// One remote procedure call: request marshaler and response unmarshaler.
///
/// `marshal_request` runs concurrently with the fragment pump and blocks
/// whenever the hand-off buffer is full. `unmarshal_response` runs
/// concurrently with response reception and sees end-of-stream after the
/// last fragment's stub; bytes it leaves unread are checked for a
/// verification trailer.
#[async_trait]
pub trait Operation: Send + Sync {
    fn opnum(&self) -> u16;

    async fn marshal_request(&self, w: &mut RequestWriter<'_>) -> Result<()>;

    async fn unmarshal_response(&mut self, r: &mut ResponseReader<'_>) -> Result<()>;
}

/// An operation over pre-marshaled bytes
#[derive(Debug, Clone, Default)]
pub struct RawOperation {
    opnum: u16,
    request: Bytes,
    response: Bytes,
}

impl RawOperation {
    pub fn new(opnum: u16, request: impl Into<Bytes>) -> Self {
        Self {
            opnum,
            request: request.into(),
            response: Bytes::new(),
        }
    }

    /// The response body received by the last invocation
    pub fn response(&self) -> &Bytes {
        &self.response
    }

    pub fn into_response(self) -> Bytes {
        self.response
    }
}

#[async_trait]
impl Operation for RawOperation {
    fn opnum(&self) -> u16 {
        self.opnum
    }

    async fn marshal_request(&self, w: &mut RequestWriter<'_>) -> Result<()> {
        w.write_all(&self.request).await?;
        Ok(())
    }

    async fn unmarshal_response(&mut self, r: &mut ResponseReader<'_>) -> Result<()> {
        let mut body = Vec::new();
        r.read_to_end(&mut body).await?;
        self.response = Bytes::from(body);
        Ok(())
    }
}
