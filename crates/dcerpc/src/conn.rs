//! Connection groups
//!
//! [`dial`] resolves a server address without touching the network.
//! [`Conn::bind`] collects candidate bindings, reuses a live transport to
//! the same binding when it can, and otherwise dials the candidates in
//! order until one of them completes the handshake.

use crate::binding::{ProtocolSequence, ServerAddr, StringBinding};
use crate::client::{ClientConn, SubConn};
use crate::config::{BindOptions, DialOptions};
use crate::dcerpc::SyntaxId;
use crate::error::{Result, RpcError};
use crate::presentation::Presentation;
use crate::security::Security;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Resolve `addr` (IP, host name or string binding) into a connection group
pub async fn dial(addr: &str, opts: DialOptions) -> Result<Conn> {
    opts.validate()?;
    let addr = ServerAddr::parse(addr)?;
    debug!(
        "Dialing {}: binding={:?}, target={}",
        addr.host,
        addr.binding.as_ref().map(ToString::to_string),
        addr.target_name
    );
    Ok(Conn {
        inner: Arc::new(Inner {
            addr,
            opts,
            transports: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }),
    })
}

struct Inner {
    addr: ServerAddr,
    opts: DialOptions,
    /// Live transports by binding reuse key
    transports: Mutex<HashMap<String, Transport>>,
    closed: AtomicBool,
}

/// A connection group to one server
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl Conn {
    pub fn addr(&self) -> &ServerAddr {
        &self.inner.addr
    }

    pub fn options(&self) -> &DialOptions {
        &self.inner.opts
    }

    /// Number of transports held for reuse
    pub fn transports(&self) -> usize {
        self.inner.transports.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Bind a presentation context and return its client connection
    pub async fn bind(&self, opts: BindOptions) -> Result<ClientConn> {
        if self.is_closed() {
            return Err(RpcError::ClientClosed);
        }
        let (opts, sub) = self.prepare(opts, None)?;
        let transport = self.connect(&opts, &sub).await?;
        Ok(ClientConn::new(self.clone(), transport, sub))
    }

    /// Resolve bind options into a presentation and security context.
    /// Without a security override the context in `inherit` is shared.
    pub(crate) fn prepare(
        &self,
        mut opts: BindOptions,
        inherit: Option<&Arc<Security>>,
    ) -> Result<(BindOptions, SubConn)> {
        if let Some(binding) = &self.inner.addr.binding {
            opts.apply_extras(&binding.extras, &self.inner.opts.security);
        }
        opts.validate()?;
        let abstract_syntax = opts
            .abstract_syntax
            .ok_or_else(|| RpcError::InvalidConfig("abstract syntax is required".into()))?;

        let presentation = Arc::new(Presentation::new(
            self.inner.opts.ids.next_presentation()?,
            abstract_syntax,
            opts.transfer_syntaxes.clone(),
        ));
        let security = match (inherit, &opts.security, &opts.target_name) {
            (Some(security), None, None) => security.clone(),
            _ => Arc::new(self.security(&opts)?),
        };

        let sub = SubConn {
            presentation,
            security,
            verify: opts.verify,
            object: opts.object,
        };
        Ok((opts, sub))
    }

    fn security(&self, opts: &BindOptions) -> Result<Security> {
        let mut security = opts
            .security
            .clone()
            .unwrap_or_else(|| self.inner.opts.security.clone());
        if security.credential.is_none() {
            security.credential = self.inner.addr.credential.clone();
        }
        if let Some(target_name) = &opts.target_name {
            security.target_name = Some(target_name.clone());
        }
        security.validate()?;
        security.context(self.inner.opts.ids.next_security(), &self.inner.addr.target_name)
    }

    /// Candidate bindings, those on the target host first
    async fn candidates(&self, opts: &BindOptions, syntax: &SyntaxId) -> Result<Vec<StringBinding>> {
        let dial = &self.inner.opts;
        let addr = &self.inner.addr;

        let mut found = dial.bindings.clone();
        if found.is_empty() {
            found.extend(addr.binding.clone());
        }
        if let Some(endpoint) = &opts.endpoint {
            if found.is_empty() {
                let protocol = if endpoint.parse::<u16>().is_ok() {
                    ProtocolSequence::Tcp
                } else {
                    ProtocolSequence::NamedPipe
                };
                found.push(StringBinding::new(protocol, &addr.host, ""));
            }
            for binding in found.iter_mut().filter(|b| !b.is_complete()) {
                binding.set_endpoint(endpoint);
            }
        }
        for binding in found.iter_mut().filter(|b| b.host().is_empty()) {
            binding.set_host(&addr.host);
        }

        let incomplete = found.iter().any(|b| !b.is_complete());
        if incomplete || found.is_empty() {
            match &dial.endpoint_mapper {
                Some(mapper) => {
                    let mapped = mapper.map(addr, syntax).await?;
                    debug!(
                        "Endpoint mapper returned {} bindings for {}",
                        mapped.len(),
                        syntax
                    );
                    found = if found.is_empty() {
                        mapped
                    } else {
                        let mut resolved = Vec::with_capacity(found.len());
                        for binding in found {
                            if binding.is_complete() {
                                resolved.push(binding);
                            } else {
                                resolved.extend(
                                    mapped
                                        .iter()
                                        .filter(|m| m.protocol == binding.protocol)
                                        .cloned(),
                                );
                            }
                        }
                        resolved
                    };
                }
                None => found.retain(StringBinding::is_complete),
            }
        }
        if found.is_empty() {
            return Err(RpcError::NoEndpoint);
        }

        let target = opts
            .target_name
            .as_deref()
            .or(opts.security.as_ref().and_then(|s| s.target_name.as_deref()))
            .or(dial.security.target_name.as_deref())
            .unwrap_or(&addr.target_name);
        let host = target_host(target);
        let (mut ordered, rest): (Vec<_>, Vec<_>) = found
            .into_iter()
            .partition(|b| b.host().eq_ignore_ascii_case(host));
        ordered.extend(rest);
        Ok(ordered)
    }

    /// Reuse or dial a transport for the sub-connection's context
    async fn connect(&self, opts: &BindOptions, sub: &SubConn) -> Result<Transport> {
        let dial = &self.inner.opts;
        let candidates = self
            .candidates(opts, sub.presentation.abstract_syntax())
            .await?;
        let presentations = [sub.presentation.clone()];
        let mut failures = Vec::new();

        for binding in candidates {
            let key = binding.reuse_key();
            if dial.reuse {
                let live = self
                    .inner
                    .transports
                    .lock()
                    .get(&key)
                    .filter(|t| !t.is_closed())
                    .cloned();
                if let Some(transport) = live {
                    match transport.alter_context(&presentations, &sub.security).await {
                        Ok(()) => {
                            debug!("Reusing transport: binding={}", binding);
                            return Ok(transport);
                        }
                        Err(err) if err.is_fatal() => {
                            debug!("Reused transport failed: binding={}: {}", binding, err);
                            self.inner.transports.lock().remove(&key);
                        }
                        Err(err) => {
                            debug!("Reused transport rejected context: binding={}: {}", binding, err);
                            failures.push((binding, err));
                            continue;
                        }
                    }
                }
            }

            let conn = match tokio::time::timeout(dial.timeout, dial.dialer.dial(&binding)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(err)) => {
                    debug!("Dial failed: binding={}: {}", binding, err);
                    failures.push((binding, err));
                    continue;
                }
                Err(_) => {
                    debug!("Dial timed out: binding={}", binding);
                    failures.push((binding, RpcError::Timeout));
                    continue;
                }
            };

            let transport = match Transport::connect(
                conn,
                binding.clone(),
                dial,
                &presentations,
                &sub.security,
            )
            .await
            {
                Ok(transport) => transport,
                Err(err) => {
                    debug!("Handshake failed: binding={}: {}", binding, err);
                    failures.push((binding, err));
                    continue;
                }
            };
            if dial.reuse {
                if let Some(stale) = self.inner.transports.lock().insert(key, transport.clone()) {
                    debug!("Replacing stale transport: binding={}", stale.binding());
                }
            }
            return Ok(transport);
        }

        // a lone candidate keeps its own error
        if failures.len() == 1 {
            if let Some((_, err)) = failures.pop() {
                return Err(err);
            }
        }
        let failures: Vec<String> = failures
            .iter()
            .map(|(binding, err)| format!("{}: {}", binding, err))
            .collect();
        Err(RpcError::NoCandidates(failures.join("; ")))
    }

    /// True if the group keeps `transport` for reuse
    pub(crate) fn holds(&self, transport: &Transport) -> bool {
        self.inner
            .transports
            .lock()
            .values()
            .any(|held| held.same(transport))
    }

    pub(crate) fn forget(&self, transport: &Transport) {
        self.inner
            .transports
            .lock()
            .retain(|_, held| !held.same(transport));
    }

    /// Close every transport of the group
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let transports: Vec<Transport> = self
            .inner
            .transports
            .lock()
            .drain()
            .map(|(_, transport)| transport)
            .collect();
        debug!("Closing connection group: transports={}", transports.len());
        for transport in transports {
            transport.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("addr", &self.inner.addr.host)
            .field("transports", &self.transports())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Host part of a service principal name: `service/host[:port][@realm]`
fn target_host(target: &str) -> &str {
    let host = target.split_once('/').map_or(target, |(_, rest)| rest);
    let host = host.split_once('@').map_or(host, |(host, _)| host);
    host.split_once(':').map_or(host, |(host, _)| host)
}
