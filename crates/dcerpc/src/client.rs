//! Client connections
//!
//! A [`ClientConn`] is one bound presentation context on a transport.
//! Sub-connections created with [`ClientConn::sub_conn`] share the
//! transport, the security context (unless overridden) and one lock: the
//! lock is held for reading by every invocation and for writing while an
//! alter-context replaces a pairing, so calls in flight see either the old
//! or the new presentation and security, never a mix.

use crate::config::{BindOptions, CallOptions, VerifyOptions};
use crate::conn::Conn;
use crate::dcerpc::Uuid;
use crate::error::{Result, RpcError};
use crate::operation::Operation;
use crate::presentation::Presentation;
use crate::security::Security;
use crate::transport::{InvokeRequest, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// The pairing a sub-connection invokes through
#[derive(Debug, Clone)]
pub(crate) struct SubConn {
    pub presentation: Arc<Presentation>,
    pub security: Arc<Security>,
    pub verify: VerifyOptions,
    pub object: Option<Uuid>,
}

struct Group {
    conn: Conn,
    transport: Transport,
    subs: RwLock<HashMap<u64, SubConn>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// A bound presentation context
#[derive(Clone)]
pub struct ClientConn {
    id: u64,
    group: Arc<Group>,
}

impl ClientConn {
    pub(crate) fn new(conn: Conn, transport: Transport, sub: SubConn) -> Self {
        let subs = HashMap::from([(0, sub)]);
        Self {
            id: 0,
            group: Arc::new(Group {
                conn,
                transport,
                subs: RwLock::new(subs),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Sub-connection id, unique among siblings
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &Transport {
        &self.group.transport
    }

    pub fn is_closed(&self) -> bool {
        self.group.closed.load(Ordering::Acquire) || self.group.transport.is_closed()
    }

    fn lookup<'a>(&self, subs: &'a HashMap<u64, SubConn>) -> Result<&'a SubConn> {
        if self.group.closed.load(Ordering::Acquire) {
            return Err(RpcError::ClientClosed);
        }
        subs.get(&self.id).ok_or(RpcError::UnknownSubConn(self.id))
    }

    /// The presentation context this handle invokes through
    pub async fn presentation(&self) -> Result<Arc<Presentation>> {
        let subs = self.group.subs.read().await;
        Ok(self.lookup(&subs)?.presentation.clone())
    }

    pub async fn security(&self) -> Result<Arc<Security>> {
        let subs = self.group.subs.read().await;
        Ok(self.lookup(&subs)?.security.clone())
    }

    pub async fn invoke(&self, op: &mut dyn Operation) -> Result<()> {
        self.invoke_with(op, &CallOptions::default()).await
    }

    /// Invoke on a specific object
    pub async fn invoke_object(&self, object: Uuid, op: &mut dyn Operation) -> Result<()> {
        self.invoke_with(op, &CallOptions::new().with_object(object))
            .await
    }

    pub async fn invoke_with(&self, op: &mut dyn Operation, opts: &CallOptions) -> Result<()> {
        let subs = self.group.subs.read().await;
        let sub = self.lookup(&subs)?;
        let request = InvokeRequest {
            presentation: &sub.presentation,
            security: &sub.security,
            verify: sub.verify,
            object: opts.object.or(sub.object),
        };
        let invoke = self.group.transport.invoke(&request, op);
        match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, invoke)
                .await
                .map_err(|_| RpcError::Timeout)?,
            None => invoke.await,
        }
    }

    /// Replace this handle's presentation (and, with a security override,
    /// its security context) through an alter-context exchange.
    pub async fn alter_context(&self, opts: BindOptions) -> Result<()> {
        let mut subs = self.group.subs.write().await;
        let current = self.lookup(&subs)?.security.clone();
        let (_, sub) = self.group.conn.prepare(opts, Some(&current))?;
        self.group
            .transport
            .alter_context(&[sub.presentation.clone()], &sub.security)
            .await?;
        debug!(
            "Altered context: sub_conn={}, context_id={}",
            self.id,
            sub.presentation.id()
        );
        subs.insert(self.id, sub);
        Ok(())
    }

    /// Bind another presentation context on the same transport
    pub async fn sub_conn(&self, opts: BindOptions) -> Result<ClientConn> {
        let mut subs = self.group.subs.write().await;
        let current = self.lookup(&subs)?.security.clone();
        let (_, sub) = self.group.conn.prepare(opts, Some(&current))?;
        self.group
            .transport
            .alter_context(&[sub.presentation.clone()], &sub.security)
            .await?;

        let id = self.group.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "New sub-connection: sub_conn={}, context_id={}",
            id,
            sub.presentation.id()
        );
        subs.insert(id, sub);
        Ok(ClientConn {
            id,
            group: self.group.clone(),
        })
    }

    /// Close this handle, every sibling and the transport under them
    pub async fn close(&self) -> Result<()> {
        if self.group.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.group.subs.write().await.clear();
        debug!("Closing client connection: sub_conn={}", self.id);
        self.group.conn.forget(&self.group.transport);
        self.group.transport.close().await
    }

    /// Detach only this sub-connection. The last one out closes the
    /// transport unless the connection group keeps it for reuse.
    pub async fn release(&self) -> Result<()> {
        let mut subs = self.group.subs.write().await;
        if subs.remove(&self.id).is_none() {
            return Err(RpcError::UnknownSubConn(self.id));
        }
        if !subs.is_empty() {
            return Ok(());
        }
        self.group.closed.store(true, Ordering::Release);
        drop(subs);
        if self.group.conn.holds(&self.group.transport) {
            return Ok(());
        }
        self.group.transport.close().await
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("transport", &self.group.transport)
            .field("closed", &self.group.closed.load(Ordering::Acquire))
            .finish()
    }
}
