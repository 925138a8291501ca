//! Calls
//!
//! A [`Call`] is one exchange on a transport: a request with its response,
//! or one handshake leg. It talks to the transport's two tasks through
//! hand-off channels:
//!
//! - *submit*: the caller passes one encoded fragment to the sender task
//!   and waits on a per-fragment *ack* for the result of the write.
//! - *deliver*: the receiver task passes each fragment addressed to this
//!   call and does not read the next fragment until the call releases it.
//!
//! Dropping a call is its completion signal. A sender without concurrent
//! multiplexing waits for it before taking the next call.

use crate::dcerpc::PduHeader;
use crate::error::Result;
use crate::transport::Shared;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// One fragment on its way to the sender task
pub(crate) struct Outgoing {
    pub frame: Bytes,
    /// No fragment of this call follows
    pub last: bool,
    pub ack: oneshot::Sender<Result<()>>,
}

/// One fragment handed over by the receiver task
pub(crate) struct Delivery {
    pub header: PduHeader,
    pub frame: Bytes,
    /// Lets the receiver read the next fragment
    pub release: oneshot::Sender<()>,
}

impl Delivery {
    /// Split into the fragment and a callback releasing the receiver
    pub fn into_parts(self) -> (PduHeader, Bytes, impl FnOnce()) {
        let release = self.release;
        (self.header, self.frame, move || {
            let _ = release.send(());
        })
    }
}

/// The sender task's view of a call
pub(crate) struct CallHandle {
    pub id: u32,
    pub frames: mpsc::Receiver<Outgoing>,
    /// Resolves when the call is dropped
    pub done: oneshot::Receiver<()>,
}

/// The receiver task's view of a call
pub(crate) struct Registration {
    pub id: u32,
    pub deliveries: mpsc::Sender<Delivery>,
}

pub(crate) struct Call {
    id: u32,
    frames: mpsc::Sender<Outgoing>,
    deliveries: mpsc::Receiver<Delivery>,
    _done: oneshot::Sender<()>,
    shared: Arc<Shared>,
}

impl Call {
    pub fn new(id: u32, shared: Arc<Shared>) -> (Self, CallHandle, Registration) {
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (deliver_tx, deliver_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                id,
                frames: frames_tx,
                deliveries: deliver_rx,
                _done: done_tx,
                shared,
            },
            CallHandle {
                id,
                frames: frames_rx,
                done: done_rx,
            },
            Registration {
                id,
                deliveries: deliver_tx,
            },
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Submit one fragment and wait until it has been written
    pub async fn send(&mut self, frame: Bytes, last: bool) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        self.frames
            .send(Outgoing { frame, last, ack })
            .await
            .map_err(|_| self.shared.broken())?;
        acked.await.map_err(|_| self.shared.broken())?
    }

    /// Wait for the next fragment addressed to this call
    pub async fn recv(&mut self) -> Result<Delivery> {
        self.deliveries
            .recv()
            .await
            .ok_or_else(|| self.shared.broken())
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("id", &self.id).finish()
    }
}
