//! Connection-oriented transport
//!
//! A [`Transport`] owns one raw connection. It negotiates the bind
//! handshake directly over the stream, then hands the two halves to a
//! sender task and a receiver task that multiplex [`Call`]s:
//!
//! ```text
//!  callers ──submit──▶ [calls, depth 1] ──▶ sender ──▶ socket
//!  callers ◀─deliver── receiver ◀── socket
//!           [registrations, depth 64] ──▶ receiver
//! ```
//!
//! The sender writes the fragments of one call at a time, acknowledging
//! each write. Without concurrent multiplexing it then waits for the call
//! to complete before taking the next one. The receiver reads one fragment,
//! hands it to the call with that id (unknown ids are discarded), and waits
//! for the call to release it before reading on.
//!
//! The first fatal error is kept and shuts both tasks down; every later
//! operation fails with it.

use crate::binding::StringBinding;
use crate::call::{Call, CallHandle, Delivery, Registration};
use crate::codec::{decode_fragment, AuthTrailer, Packet};
use crate::config::{DialOptions, TrailerFields, VerifyOptions};
use crate::dcerpc::{
    BindAckPdu, BindPdu, ContextElement, DataRepresentation, PacketFlags, PacketType, Pdu,
    PduHeader, RequestPdu, Uuid,
};
use crate::dialer::BoxedConn;
use crate::error::{Result, RpcError};
use crate::fragmentation::{FragmentAssembler, FragmentGenerator, Fragmenter};
use crate::framing::{FrameReader, FrameWriter};
use crate::ids::IdGenerator;
use crate::operation::Operation;
use crate::presentation::{BindFeatures, Presentation};
use crate::security::{Protection, Security};
use crate::verification::VerificationTrailer;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, warn, Instrument, Span};

/// Calls waiting for the sender
const SUBMIT_QUEUE_DEPTH: usize = 1;

/// Calls waiting to be registered with the receiver
const RESPONSE_QUEUE_DEPTH: usize = 64;

type Reader = FrameReader<ReadHalf<BoxedConn>>;
type Writer = FrameWriter<WriteHalf<BoxedConn>>;

/// Parameters settled by the bind exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub group_id: u32,
    /// Concurrent multiplexing (the peer echoed PFC_CONC_MPX)
    pub multiplexing: bool,
    pub features: BindFeatures,
    pub secondary_addr: String,
}

pub(crate) struct Shared {
    binding: StringBinding,
    idle: Duration,
    requested: Negotiated,
    ids: Arc<IdGenerator>,
    negotiated: RwLock<Negotiated>,
    call_id: AtomicU32,
    bound: AtomicBool,
    error: OnceLock<Arc<RpcError>>,
    shutdown: watch::Sender<bool>,
    calls: mpsc::Sender<CallHandle>,
    registrations: mpsc::Sender<Registration>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn next_call_id(&self) -> u32 {
        self.call_id.fetch_add(1, Ordering::Relaxed)
    }

    fn multiplexing(&self) -> bool {
        self.negotiated.read().multiplexing
    }

    /// Record the first fatal error and stop both tasks
    fn fail(&self, err: RpcError) {
        let err = Arc::new(err);
        if self.error.set(err.clone()).is_ok() {
            warn!("Transport failed: {}", err);
        }
        let _ = self.shutdown.send(true);
    }

    /// The error seen by operations on a stopped transport
    pub(crate) fn broken(&self) -> RpcError {
        match self.error.get() {
            Some(err) if matches!(**err, RpcError::ClientClosed) => RpcError::ClientClosed,
            Some(err) => RpcError::TransportBroken(err.clone()),
            None => RpcError::Cancelled,
        }
    }

    async fn deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.idle, fut)
            .await
            .map_err(|_| RpcError::Timeout)?
    }
}

/// Where a handshake leg runs
enum Link<'a> {
    /// Over the raw stream, before the tasks exist
    Direct {
        reader: &'a mut Reader,
        writer: &'a mut Writer,
    },
    /// As a call through the running tasks
    Loops,
}

/// What one invocation needs from its client connection
pub(crate) struct InvokeRequest<'a> {
    pub presentation: &'a Presentation,
    pub security: &'a Security,
    pub verify: VerifyOptions,
    pub object: Option<Uuid>,
}

/// Stops the tasks once the last [`Transport`] handle is gone
struct Owner(Arc<Shared>);

impl Drop for Owner {
    fn drop(&mut self) {
        let _ = self.0.error.set(Arc::new(RpcError::ClientClosed));
        let _ = self.0.shutdown.send(true);
    }
}

/// A bound connection shared by every presentation context on it
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    span: Span,
    _owner: Arc<Owner>,
}

impl Transport {
    /// Run the bind handshake over `conn` and start the send and receive
    /// tasks. On failure the connection is shut down and no task is left
    /// behind.
    pub(crate) async fn connect(
        conn: BoxedConn,
        binding: StringBinding,
        opts: &DialOptions,
        presentations: &[Arc<Presentation>],
        security: &Security,
    ) -> Result<Self> {
        let span = match &opts.span {
            Some(parent) => info_span!(parent: parent, "transport", binding = %binding),
            None => info_span!("transport", binding = %binding),
        };
        let requested = Negotiated {
            max_xmit_frag: opts.max_xmit_frag,
            max_recv_frag: opts.max_recv_frag,
            group_id: opts.group_id,
            multiplexing: opts.multiplexing,
            features: opts.features,
            secondary_addr: String::new(),
        };

        let (calls_tx, calls_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (registrations_tx, registrations_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            binding,
            idle: opts.timeout,
            negotiated: RwLock::new(requested.clone()),
            requested,
            ids: opts.ids.clone(),
            call_id: AtomicU32::new(1),
            bound: AtomicBool::new(false),
            error: OnceLock::new(),
            shutdown,
            calls: calls_tx,
            registrations: registrations_tx,
            tasks: Mutex::new(Vec::new()),
        });
        let transport = Self {
            _owner: Arc::new(Owner(shared.clone())),
            shared,
            span,
        };

        let (read_half, write_half) = tokio::io::split(conn);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let negotiated = transport
            .negotiate(
                &mut Link::Direct {
                    reader: &mut reader,
                    writer: &mut writer,
                },
                presentations,
                security,
            )
            .instrument(transport.span.clone())
            .await;
        if let Err(err) = negotiated {
            debug!(parent: &transport.span, "Bind failed: {}", err);
            let _ = writer.shutdown().await;
            return Err(err);
        }

        reader.set_max_frag_size(transport.negotiated().max_recv_frag as usize);
        transport.start(reader, writer, calls_rx, registrations_rx);
        Ok(transport)
    }

    fn start(
        &self,
        reader: Reader,
        writer: Writer,
        calls: mpsc::Receiver<CallHandle>,
        registrations: mpsc::Receiver<Registration>,
    ) {
        let sender = tokio::spawn(
            send_loop(
                self.shared.clone(),
                writer,
                calls,
                self.shared.shutdown.subscribe(),
            )
            .instrument(self.span.clone()),
        );
        let receiver = tokio::spawn(
            recv_loop(
                self.shared.clone(),
                reader,
                registrations,
                self.shared.shutdown.subscribe(),
            )
            .instrument(self.span.clone()),
        );
        self.shared.tasks.lock().extend([sender, receiver]);
        self.shared.bound.store(true, Ordering::Release);

        let negotiated = self.negotiated();
        debug!(
            parent: &self.span,
            "Transport bound: max_xmit={}, max_recv={}, group_id={}, mpx={}, features=0x{:x}",
            negotiated.max_xmit_frag,
            negotiated.max_recv_frag,
            negotiated.group_id,
            negotiated.multiplexing,
            negotiated.features.bits()
        );
    }

    pub fn binding(&self) -> &StringBinding {
        &self.shared.binding
    }

    pub fn negotiated(&self) -> Negotiated {
        self.shared.negotiated.read().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.shared.bound.load(Ordering::Acquire)
    }

    /// True once the transport failed or was closed
    pub fn is_closed(&self) -> bool {
        self.shared.error.get().is_some()
    }

    /// The error that stopped the transport
    pub fn error(&self) -> Option<Arc<RpcError>> {
        self.shared.error.get().cloned()
    }

    fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.shared.broken());
        }
        Ok(())
    }

    /// Stop both tasks and wait for them to exit
    pub async fn close(&self) -> Result<()> {
        if self.shared.error.set(Arc::new(RpcError::ClientClosed)).is_ok() {
            debug!(parent: &self.span, "Closing transport");
        }
        let _ = self.shared.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Register a new call with both tasks
    pub(crate) async fn new_call(&self) -> Result<Call> {
        self.check()?;
        let id = self.shared.next_call_id();
        let (call, handle, registration) = Call::new(id, self.shared.clone());
        self.shared
            .registrations
            .send(registration)
            .await
            .map_err(|_| self.shared.broken())?;
        self.shared
            .calls
            .send(handle)
            .await
            .map_err(|_| self.shared.broken())?;
        Ok(call)
    }

    /// Negotiate more presentation contexts, or a new security context,
    /// on the bound transport
    pub(crate) async fn alter_context(
        &self,
        presentations: &[Arc<Presentation>],
        security: &Security,
    ) -> Result<()> {
        self.check()?;
        let result = self
            .negotiate(&mut Link::Loops, presentations, security)
            .instrument(self.span.clone())
            .await;
        self.escalate(result)
    }

    /// Peer rejections close the transport like fatal I/O does
    fn escalate<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(RpcError::BindRejected { reason, message }) => {
                self.shared.fail(RpcError::BindRejected {
                    reason: *reason,
                    message: *message,
                });
            }
            Err(RpcError::ServerTerminated) => self.shared.fail(RpcError::ServerTerminated),
            _ => {}
        }
        result
    }

    pub(crate) fn same(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    async fn exchange(
        &self,
        link: &mut Link<'_>,
        mut packet: Packet,
        trailer: AuthTrailer<'_>,
        reply: bool,
    ) -> Result<Option<Packet>> {
        match link {
            Link::Direct { reader, writer } => {
                let call_id = self.shared.next_call_id();
                packet.header.call_id = call_id;
                let frame = packet.encode(trailer)?;
                trace!(
                    "Sending {:?}: call_id={}, len={}",
                    packet.header.packet_type,
                    call_id,
                    frame.len()
                );
                self.shared.deadline(writer.write_frame(&frame)).await?;
                if !reply {
                    return Ok(None);
                }
                loop {
                    let (header, frame) = self.shared.deadline(reader.read_frame()).await?;
                    if header.call_id != call_id {
                        warn!(
                            "Discarding fragment: call_id={}, expected call_id={}",
                            header.call_id, call_id
                        );
                        continue;
                    }
                    return decode_fragment(&frame, None, || {}).map(Some);
                }
            }
            Link::Loops => {
                let mut call = self.new_call().await?;
                packet.header.call_id = call.id();
                let frame = packet.encode(trailer)?;
                trace!(
                    "Sending {:?}: call_id={}, len={}",
                    packet.header.packet_type,
                    call.id(),
                    frame.len()
                );
                call.send(frame, true).await?;
                if !reply {
                    return Ok(None);
                }
                let (_, frame, release) = call.recv().await?.into_parts();
                decode_fragment(&frame, None, release).map(Some)
            }
        }
    }

    /// The bind or alter-context exchange, followed by as many security
    /// legs as the provider needs.
    async fn negotiate(
        &self,
        link: &mut Link<'_>,
        presentations: &[Arc<Presentation>],
        security: &Security,
    ) -> Result<()> {
        let initial = matches!(link, Link::Direct { .. });
        let requested = &self.shared.requested;

        let mut contexts: Vec<ContextElement> =
            presentations.iter().map(|p| p.context_element()).collect();
        let features = match presentations.first() {
            Some(first) if initial && !requested.features.is_empty() => {
                let id = self.shared.ids.next_presentation()?;
                contexts.push(requested.features.context(id, *first.abstract_syntax()));
                true
            }
            _ => false,
        };

        let needs_auth = !security.is_insecure() && !security.is_established();
        let token = if needs_auth {
            Some(security.init(None)?.token)
        } else {
            None
        };

        let mut header = PduHeader::new(
            if initial {
                PacketType::Bind
            } else {
                PacketType::AlterContext
            },
            0,
        );
        if initial && requested.multiplexing {
            header.packet_flags.set(PacketFlags::CONC_MPX);
        }
        if needs_auth && security.requests_header_sign() {
            header.packet_flags.set(PacketFlags::SUPPORT_HEADER_SIGN);
        }
        let body = self.bind_body(contexts);
        let pdu = if initial {
            Pdu::Bind(body)
        } else {
            Pdu::AlterContext(body)
        };
        let trailer = match token {
            Some(token) => AuthTrailer::Verifier(security.verifier(0, token)),
            None => AuthTrailer::None,
        };

        debug!(
            "Sending {}: contexts={}, security_context={}, auth_type={:?}",
            if initial { "bind" } else { "alter context" },
            presentations.len(),
            security.context_id(),
            security.auth_type()
        );
        let reply = self
            .exchange(link, Packet::new(header, pdu), trailer, true)
            .await?
            .ok_or_else(|| RpcError::ProtocolError("bind exchange without reply".into()))?;
        let ack = match (&reply.pdu, initial) {
            (Pdu::BindAck(ack), true) | (Pdu::AlterContextResp(ack), false) => ack,
            (other, _) => return Err(RpcError::UnexpectedPdu(other.packet_type())),
        };

        if initial {
            self.apply_bind_ack(&reply.header, ack);
        }
        if needs_auth {
            security.set_header_sign(
                reply
                    .header
                    .packet_flags
                    .contains(PacketFlags::SUPPORT_HEADER_SIGN),
            );
        }
        self.apply_results(presentations, ack, features)?;

        let mut input = reply.auth.map(|auth| auth.auth_value);
        while needs_auth && !security.is_established() {
            let output = security.init(input.as_deref())?;
            if output.complete {
                if !output.token.is_empty() {
                    // the last token travels in auth3, which has no reply
                    debug!("Sending auth3: security_context={}", security.context_id());
                    self.exchange(
                        link,
                        Packet::new(PduHeader::new(PacketType::Auth3, 0), Pdu::Auth3),
                        AuthTrailer::Verifier(security.verifier(0, output.token)),
                        false,
                    )
                    .await?;
                }
                break;
            }
            if output.token.is_empty() {
                return Err(RpcError::Security(
                    "security provider is incomplete but produced no token".into(),
                ));
            }

            debug!(
                "Sending security leg: security_context={}",
                security.context_id()
            );
            let body =
                self.bind_body(presentations.iter().map(|p| p.context_element()).collect());
            let reply = self
                .exchange(
                    link,
                    Packet::new(
                        PduHeader::new(PacketType::AlterContext, 0),
                        Pdu::AlterContext(body),
                    ),
                    AuthTrailer::Verifier(security.verifier(0, output.token)),
                    true,
                )
                .await?
                .ok_or_else(|| RpcError::ProtocolError("security leg without reply".into()))?;
            let Pdu::AlterContextResp(ack) = &reply.pdu else {
                return Err(RpcError::UnexpectedPdu(reply.pdu.packet_type()));
            };
            self.apply_results(presentations, ack, false)?;
            input = reply.auth.map(|auth| auth.auth_value);
        }

        debug!(
            "Negotiated: security_context={}, established={}, header_sign={}",
            security.context_id(),
            security.is_established(),
            security.header_sign()
        );
        Ok(())
    }

    fn bind_body(&self, context_list: Vec<ContextElement>) -> BindPdu {
        let negotiated = self.shared.negotiated.read();
        BindPdu {
            max_xmit_frag: negotiated.max_xmit_frag,
            max_recv_frag: negotiated.max_recv_frag,
            assoc_group_id: negotiated.group_id,
            context_list,
        }
    }

    fn apply_bind_ack(&self, header: &PduHeader, ack: &BindAckPdu) {
        let requested = &self.shared.requested;
        let mut negotiated = self.shared.negotiated.write();
        // the peer's receive size bounds what we send and vice versa
        if ack.max_recv_frag != 0 {
            negotiated.max_xmit_frag = requested.max_xmit_frag.min(ack.max_recv_frag);
        }
        if ack.max_xmit_frag != 0 {
            negotiated.max_recv_frag = requested.max_recv_frag.min(ack.max_xmit_frag);
        }
        negotiated.group_id = ack.assoc_group_id;
        negotiated.multiplexing =
            requested.multiplexing && header.packet_flags.contains(PacketFlags::CONC_MPX);
        negotiated.secondary_addr = ack.secondary_addr.clone();
        negotiated.features = BindFeatures::default();
    }

    fn apply_results(
        &self,
        presentations: &[Arc<Presentation>],
        ack: &BindAckPdu,
        features: bool,
    ) -> Result<()> {
        if ack.results.len() < presentations.len() {
            return Err(RpcError::ProtocolError(format!(
                "{} context results for {} proposed contexts",
                ack.results.len(),
                presentations.len()
            )));
        }

        let mut first_err = None;
        for (presentation, result) in presentations.iter().zip(&ack.results) {
            match presentation.apply_result(result) {
                Ok(()) => debug!(
                    "Context accepted: context_id={}, abstract={}, transfer={}",
                    presentation.id(),
                    presentation.abstract_syntax(),
                    result.transfer_syntax
                ),
                Err(err) => {
                    debug!("Context rejected: context_id={}: {}", presentation.id(), err);
                    first_err.get_or_insert(err);
                }
            }
        }

        if features {
            if let Some(granted) = ack
                .results
                .get(presentations.len())
                .and_then(BindFeatures::from_result)
            {
                self.shared.negotiated.write().features = granted;
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stream one request through the transport and stream its response
    /// back into `op`.
    pub(crate) async fn invoke(
        &self,
        request: &InvokeRequest<'_>,
        op: &mut dyn Operation,
    ) -> Result<()> {
        let result = self.call(request, op).instrument(self.span.clone()).await;
        self.escalate(result)
    }

    async fn call(&self, request: &InvokeRequest<'_>, op: &mut dyn Operation) -> Result<()> {
        self.check()?;
        let presentation = request.presentation;
        let security = request.security;
        let transfer_syntax = presentation.transfer_syntax()?;
        if !security.is_established() {
            return Err(RpcError::NoSecurityContext);
        }

        let negotiated = self.negotiated();
        let auth_len = security.auth_length(security.protection(PacketType::Request, true));
        let max_stub = FragmentGenerator::max_stub_size(
            negotiated.max_xmit_frag,
            auth_len,
            request.object.is_some(),
            security.block_size(),
        );

        let mut call = self.new_call().await?;
        let call_id = call.id();
        let opnum = op.opnum();
        let data_rep = DataRepresentation::ndr();
        let trailer = request.verify.trailer(&TrailerFields {
            header_sign: security.header_sign(),
            interface: *presentation.abstract_syntax(),
            transfer_syntax,
            data_rep,
            call_id,
            context_id: presentation.id(),
            opnum,
        });
        let trailer_size = if trailer.is_empty() { 0 } else { trailer.size() };

        debug!(
            "Sending request: call_id={}, opnum={}, context_id={}, max_stub={}",
            call_id,
            opnum,
            presentation.id(),
            max_stub
        );

        let (mut body_tx, body_rx) = tokio::io::duplex(max_stub.max(1));
        let marshaler: &dyn Operation = &*op;
        let marshal = async move {
            marshaler.marshal_request(&mut body_tx).await?;
            body_tx.shutdown().await?;
            Ok::<_, RpcError>(())
        };
        let call_ref = &mut call;
        let pump = async move {
            let mut fragmenter = Fragmenter::new(body_rx, max_stub, trailer_size)?;
            while let Some(fragment) = fragmenter.next().await? {
                let mut header = PduHeader::new(PacketType::Request, call_id);
                header.packet_flags = PacketFlags::new();
                if fragment.first {
                    header.packet_flags.set_first_frag();
                }
                if fragment.last {
                    header.packet_flags.set_last_frag();
                }
                let mut packet = Packet::new(
                    header,
                    Pdu::Request(RequestPdu {
                        alloc_hint: fragment.alloc_hint,
                        context_id: presentation.id(),
                        opnum,
                        object: request.object,
                    }),
                )
                .with_stub(fragment.stub);
                if fragment.last && trailer_size > 0 {
                    packet.verification = Some(trailer.clone());
                }

                let protection = security.protection(PacketType::Request, fragment.first);
                let frame = packet.encode(match protection {
                    Protection::None => AuthTrailer::None,
                    protection => AuthTrailer::Protect(security, protection),
                })?;
                trace!(
                    "Sending fragment: call_id={}, len={}, first={}, last={}",
                    call_id,
                    frame.len(),
                    fragment.first,
                    fragment.last
                );
                call_ref.send(frame, fragment.last).await?;
            }
            Ok::<_, RpcError>(())
        };
        futures::try_join!(marshal, pump)?;

        let (mut stream_tx, mut stream_rx) =
            tokio::io::duplex(negotiated.max_recv_frag.max(1) as usize);
        let unmarshal = async move {
            op.unmarshal_response(&mut stream_rx).await?;
            let mut rest = Vec::new();
            stream_rx.read_to_end(&mut rest).await?;
            Ok::<_, RpcError>(rest)
        };
        let call_ref = &mut call;
        let receive = async move {
            let mut assembler = FragmentAssembler::new(call_id);
            loop {
                let (_, frame, release) = call_ref.recv().await?.into_parts();
                let packet = decode_fragment(&frame, Some(security), release)?;
                let response = match &packet.pdu {
                    Pdu::Response(response) => response,
                    Pdu::Fault(_) => {
                        return Err(RpcError::ProtocolError(format!(
                            "fault without status: call_id={}",
                            call_id
                        )))
                    }
                    other => return Err(RpcError::UnexpectedPdu(other.packet_type())),
                };
                let last = assembler.accept(&packet.header, response.context_id, packet.stub.len())?;
                trace!(
                    "Received fragment: call_id={}, stub_len={}, last={}",
                    call_id,
                    packet.stub.len(),
                    last
                );
                stream_tx.write_all(&packet.stub).await?;
                if last {
                    break;
                }
            }
            stream_tx.shutdown().await?;
            Ok::<_, RpcError>(assembler.received())
        };
        let (rest, received) = futures::try_join!(unmarshal, receive)?;

        if !rest.is_empty() {
            check_response_trailer(call_id, &rest);
        }
        debug!("Call succeeded: call_id={}, {} bytes result", call_id, received);
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("binding", &self.shared.binding.to_string())
            .field("bound", &self.is_bound())
            .field("error", &self.shared.error.get())
            .finish()
    }
}

/// Bytes the unmarshaler left over may hold a verification trailer
fn check_response_trailer(call_id: u32, rest: &[u8]) {
    let Some(offset) = VerificationTrailer::find(rest) else {
        trace!("Unconsumed response bytes: call_id={}, len={}", call_id, rest.len());
        return;
    };
    match VerificationTrailer::decode(&rest[offset..], true) {
        Ok(trailer) => trace!(
            "Response verification trailer: call_id={}, commands={}",
            call_id,
            trailer.commands.len()
        ),
        Err(err) => warn!(
            "Malformed verification trailer: call_id={}: {}",
            call_id, err
        ),
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    mut writer: Writer,
    mut calls: mpsc::Receiver<CallHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let handle = tokio::select! {
            _ = shutdown.changed() => break,
            handle = calls.recv() => match handle {
                Some(handle) => handle,
                None => break,
            },
        };
        if !send_call(&shared, &mut writer, handle, &mut shutdown).await {
            break;
        }
    }
    let _ = writer.shutdown().await;
    trace!("Sender stopped");
}

/// Write the fragments of one call. Returns false when the sender must stop.
async fn send_call(
    shared: &Shared,
    writer: &mut Writer,
    handle: CallHandle,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let CallHandle {
        id,
        mut frames,
        done,
    } = handle;
    let mut sent = false;

    loop {
        let outgoing = tokio::select! {
            _ = shutdown.changed() => return false,
            outgoing = frames.recv() => outgoing,
        };
        let Some(outgoing) = outgoing else {
            // abandoned; tell the server if part of the request went out
            if sent {
                debug!("Call abandoned mid-request, sending orphaned: call_id={}", id);
                let mut header = PduHeader::new(PacketType::Orphaned, id);
                header.packet_flags = PacketFlags::complete();
                let orphaned = Packet::new(header, Pdu::Orphaned).encode(AuthTrailer::None);
                let written = match orphaned {
                    Ok(frame) => shared.deadline(writer.write_frame(&frame)).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = written {
                    shared.fail(err);
                    return false;
                }
            }
            return true;
        };

        if let Err(err) = shared.deadline(writer.write_frame(&outgoing.frame)).await {
            shared.fail(err);
            let _ = outgoing.ack.send(Err(shared.broken()));
            return false;
        }
        sent = true;
        let _ = outgoing.ack.send(Ok(()));
        if outgoing.last {
            break;
        }
    }

    if !shared.multiplexing() {
        tokio::select! {
            _ = shutdown.changed() => return false,
            _ = done => {}
        }
    }
    true
}

async fn recv_loop(
    shared: Arc<Shared>,
    mut reader: Reader,
    mut registrations: mpsc::Receiver<Registration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut calls: HashMap<u32, mpsc::Sender<Delivery>> = HashMap::new();

    loop {
        drain(&mut registrations, &mut calls);
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = tokio::time::timeout(shared.idle, reader.read_frame()) => read,
        };
        let (header, frame) = match read {
            Err(_) => {
                drain(&mut registrations, &mut calls);
                if calls.is_empty() {
                    continue;
                }
                shared.fail(RpcError::Timeout);
                break;
            }
            Ok(Err(err)) => {
                shared.fail(err);
                break;
            }
            Ok(Ok(fragment)) => fragment,
        };

        drain(&mut registrations, &mut calls);
        let call_id = header.call_id;
        let Some(deliveries) = calls.get(&call_id).cloned() else {
            warn!(
                "Discarding fragment for unknown call: call_id={}, type={:?}",
                call_id, header.packet_type
            );
            continue;
        };
        trace!(
            "Received {:?}: call_id={}, len={}",
            header.packet_type,
            call_id,
            frame.len()
        );

        let last = header.packet_flags.is_last_frag();
        let (release, released) = oneshot::channel();
        if deliveries
            .send(Delivery {
                header,
                frame,
                release,
            })
            .await
            .is_err()
        {
            calls.remove(&call_id);
            continue;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = released => {}
        }
        if last {
            calls.remove(&call_id);
        }
    }
    trace!("Receiver stopped");
}

fn drain(
    registrations: &mut mpsc::Receiver<Registration>,
    calls: &mut HashMap<u32, mpsc::Sender<Delivery>>,
) {
    while let Ok(registration) = registrations.try_recv() {
        calls.insert(registration.id, registration.deliveries);
    }
    calls.retain(|_, deliveries| !deliveries.is_closed());
}
