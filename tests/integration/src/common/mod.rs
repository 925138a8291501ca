//! Common test utilities
//!
//! - [`MockPeer`]: a scripted DCE/RPC server speaking the connection-oriented
//!   protocol over in-memory streams, built on the crate's own codec.
//! - [`MockDialer`]: hands every dial a fresh stream to a [`MockPeer`].
//! - [`MockMechanism`]: a toy security mechanism (checksum signatures,
//!   XOR sealing, one to three token legs).

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dcerpc::{
    decode_fragment, AuthLevel, AuthTrailer, AuthType, AuthVerifier, BindAckPdu, BindFeatures,
    BindNakPdu, BoxedConn, ClientConn, Conn, ContextElement, ContextRequest, ContextResult,
    ContextResultEntry, DialOptions, Dialer, FaultPdu, FragmentGenerator, FrameReader,
    FrameWriter, IdGenerator, ImpersonationLevel, InitOutput, Mechanism, PacketFlags, PacketType,
    Packet, Pdu, PduHeader, Protection, ResponsePdu, RpcError, Security, SecurityProvider,
    StringBinding, SyntaxId, Uuid, VerificationTrailer, WrapRegions, NDR20, NDR64,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// Initialize logging for tests (`RUST_LOG=debug` for handshake traces)
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub const TEST_UUID: &str = "12345678-1234-abcd-ef00-0123456789ab";
pub const SECOND_UUID: &str = "12345778-1234-abcd-ef00-0123456789ac";

/// Operations the peer implements
pub mod opnum {
    /// Returns the request body
    pub const ECHO: u16 = 0;
    /// Body: u32 LE size; returns that many pattern bytes
    pub const GENERATE: u16 = 1;
    /// Returns the u64 LE checksum of the body
    pub const CHECKSUM: u16 = 2;
    /// Answers with nca_s_op_rng_error
    pub const FAULT: u16 = 3;
    /// Answers with a shutdown PDU and hangs up
    pub const SHUTDOWN: u16 = 4;
    /// Body: u32 LE delay in milliseconds, then anything; echoes the body
    pub const DELAYED_ECHO: u16 = 5;
    /// Never answers
    pub const HANG: u16 = 6;
}

pub const NCA_S_OP_RNG_ERROR: u32 = 0x1c01_0002;

pub fn test_interface() -> SyntaxId {
    SyntaxId::new(Uuid::parse(TEST_UUID).unwrap(), 1, 0)
}

pub fn second_interface() -> SyntaxId {
    SyntaxId::new(Uuid::parse(SECOND_UUID).unwrap(), 2, 0)
}

/// Deterministic test data
pub fn pattern(len: usize) -> Bytes {
    let mut data = BytesMut::with_capacity(len);
    for i in 0..len {
        data.put_u8((i % 251) as u8);
    }
    data.freeze()
}

/// Simple checksum for data verification
pub fn compute_checksum(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Body for [`opnum::DELAYED_ECHO`]
pub fn delayed(ms: u32, payload: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.put_u32_le(ms);
    body.put_slice(payload);
    body.freeze()
}

/// Body for [`opnum::GENERATE`]
pub fn generate(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_le_bytes())
}

// ============================================================================
// Scripted peer
// ============================================================================

/// How the peer answers binds
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub max_frag: u16,
    pub group_id: u32,
    /// Echo PFC_CONC_MPX when the client asks for it
    pub multiplexing: bool,
    /// Feature bits granted out of those requested
    pub grant_features: u16,
    /// Echo PFC_SUPPORT_HEADER_SIGN when the client asks for it
    pub header_sign: bool,
    /// Answer binds with a bind-nak carrying this reason
    pub bind_nak: Option<u16>,
    pub transfer_syntaxes: Vec<SyntaxId>,
    /// Abstract syntaxes rejected with reason 1
    pub rejected: Vec<Uuid>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_frag: 4280,
            group_id: 0x5a5a,
            multiplexing: true,
            grant_features: BindFeatures::SECURITY_CONTEXT_MULTIPLEXING
                | BindFeatures::KEEP_CONNECTION_ON_ORPHAN,
            header_sign: true,
            bind_nak: None,
            transfer_syntaxes: vec![NDR20, NDR64],
            rejected: Vec::new(),
        }
    }
}

impl PeerConfig {
    pub fn with_max_frag(mut self, max_frag: u16) -> Self {
        self.max_frag = max_frag;
        self
    }

    pub fn with_multiplexing(mut self, multiplexing: bool) -> Self {
        self.multiplexing = multiplexing;
        self
    }

    pub fn with_bind_nak(mut self, reason: u16) -> Self {
        self.bind_nak = Some(reason);
        self
    }

    pub fn with_header_sign(mut self, header_sign: bool) -> Self {
        self.header_sign = header_sign;
        self
    }

    pub fn with_grant_features(mut self, bits: u16) -> Self {
        self.grant_features = bits;
        self
    }

    pub fn with_transfer_syntaxes(mut self, syntaxes: Vec<SyntaxId>) -> Self {
        self.transfer_syntaxes = syntaxes;
        self
    }

    pub fn rejecting(mut self, uuid: Uuid) -> Self {
        self.rejected.push(uuid);
        self
    }
}

/// Ordering events seen by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// First request fragment of a call arrived
    RequestStart(u32),
    /// About to write the last response fragment of a call
    ResponseEnd(u32),
}

#[derive(Debug, Default)]
pub struct PeerStats {
    pub connections: AtomicUsize,
    pub binds: AtomicUsize,
    pub alter_contexts: AtomicUsize,
    pub auth3s: AtomicUsize,
    pub requests: AtomicUsize,
    pub request_fragments: AtomicUsize,
    pub orphaned: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Handshake tokens in arrival order
    pub tokens: Mutex<Vec<Bytes>>,
    /// frag_length of every request fragment
    pub fragment_sizes: Mutex<Vec<usize>>,
    /// auth_length of every request fragment
    pub auth_lengths: Mutex<Vec<u16>>,
    pub objects: Mutex<Vec<Option<Uuid>>>,
    pub trailers: Mutex<Vec<VerificationTrailer>>,
    /// Flags of every bind and alter-context
    pub bind_flags: Mutex<Vec<(PacketType, PacketFlags)>>,
    /// Context elements proposed by binds and alter-contexts
    pub contexts: Mutex<Vec<ContextElement>>,
    pub events: Mutex<Vec<Event>>,
}

impl PeerStats {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct MockPeer {
    config: PeerConfig,
    stats: PeerStats,
}

impl MockPeer {
    pub fn new(config: PeerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: PeerStats::default(),
        })
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Serve one connection until the client hangs up
    pub fn serve(self: &Arc<Self>, stream: DuplexStream) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(stream))
    }

    async fn run(self: Arc<Self>, stream: DuplexStream) {
        self.stats.connections.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);
        let mut session = Session {
            peer: self.clone(),
            writer: Arc::new(AsyncMutex::new(FrameWriter::new(write_half))),
            max_frag: self.config.max_frag,
            securities: HashMap::new(),
            calls: HashMap::new(),
        };
        while let Ok((header, frame)) = reader.read_frame().await {
            match session.handle(header, frame).await {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
        }
    }
}

type PeerWriter = Arc<AsyncMutex<FrameWriter<WriteHalf<DuplexStream>>>>;

struct PendingCall {
    opnum: u16,
    context_id: u16,
    body: BytesMut,
    security: Option<Arc<Security>>,
}

struct Session {
    peer: Arc<MockPeer>,
    writer: PeerWriter,
    max_frag: u16,
    securities: HashMap<u32, Arc<Security>>,
    calls: HashMap<u32, PendingCall>,
}

impl Session {
    async fn handle(&mut self, header: PduHeader, frame: Bytes) -> dcerpc::Result<bool> {
        match header.packet_type {
            PacketType::Bind | PacketType::AlterContext => self.bind(header, &frame).await,
            PacketType::Auth3 => {
                let packet = Packet::decode(&frame)?;
                self.peer.stats.auth3s.fetch_add(1, Ordering::SeqCst);
                if let Some(auth) = packet.auth {
                    self.peer.stats.tokens.lock().push(auth.auth_value);
                }
                Ok(true)
            }
            PacketType::Request => self.request(header, &frame).await,
            PacketType::Orphaned => {
                self.peer.stats.orphaned.fetch_add(1, Ordering::SeqCst);
                self.calls.remove(&header.call_id);
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    async fn write(&self, packet: &Packet, trailer: AuthTrailer<'_>) -> dcerpc::Result<()> {
        let frame = packet.encode(trailer)?;
        self.writer.lock().await.write_frame(&frame).await
    }

    /// Server side of a security context: a one-leg provider, established
    /// as soon as the client's first token arrives.
    fn security(&mut self, auth: &AuthVerifier) -> dcerpc::Result<Arc<Security>> {
        if let Some(security) = self.securities.get(&auth.auth_context_id) {
            return Ok(security.clone());
        }
        let security = Security::new(
            auth.auth_context_id,
            &MockMechanism::new(auth.auth_type, 1),
            &ContextRequest {
                target_name: "",
                level: auth.auth_level,
                impersonation: ImpersonationLevel::Impersonate,
                credential: None,
            },
            false,
        )?;
        if !security.is_insecure() {
            security.init(None)?;
        }
        let security = Arc::new(security);
        self.securities
            .insert(auth.auth_context_id, security.clone());
        Ok(security)
    }

    fn result(&self, ctx: &ContextElement) -> ContextResultEntry {
        let config = &self.peer.config;
        let Some(first) = ctx.transfer_syntaxes.first() else {
            return ContextResultEntry {
                result: ContextResult::ProviderRejection,
                reason: 2,
                transfer_syntax: SyntaxId::default(),
            };
        };
        if BindFeatures::is_feature_syntax(first) {
            let requested =
                u16::from_le_bytes([first.uuid.clock_seq_hi_and_reserved, first.uuid.clock_seq_low]);
            return ContextResultEntry {
                result: ContextResult::NegotiateAck,
                reason: requested & config.grant_features,
                transfer_syntax: SyntaxId::default(),
            };
        }
        if config.rejected.contains(&ctx.abstract_syntax.uuid) {
            return ContextResultEntry {
                result: ContextResult::ProviderRejection,
                reason: 1,
                transfer_syntax: SyntaxId::default(),
            };
        }
        match ctx
            .transfer_syntaxes
            .iter()
            .find(|s| config.transfer_syntaxes.contains(s))
        {
            Some(syntax) => ContextResultEntry {
                result: ContextResult::Acceptance,
                reason: 0,
                transfer_syntax: *syntax,
            },
            None => ContextResultEntry {
                result: ContextResult::ProviderRejection,
                reason: 2,
                transfer_syntax: SyntaxId::default(),
            },
        }
    }

    async fn bind(&mut self, header: PduHeader, frame: &[u8]) -> dcerpc::Result<bool> {
        let packet = Packet::decode(frame)?;
        let initial = header.packet_type == PacketType::Bind;
        let (Pdu::Bind(body) | Pdu::AlterContext(body)) = &packet.pdu else {
            return Ok(true);
        };

        let stats = &self.peer.stats;
        stats
            .bind_flags
            .lock()
            .push((header.packet_type, header.packet_flags));
        stats.contexts.lock().extend(body.context_list.iter().cloned());
        if initial {
            stats.binds.fetch_add(1, Ordering::SeqCst);
        } else {
            stats.alter_contexts.fetch_add(1, Ordering::SeqCst);
        }

        let config = self.peer.config.clone();
        if let (true, Some(reason)) = (initial, config.bind_nak) {
            let nak = Packet::new(
                PduHeader::new(PacketType::BindNak, header.call_id),
                Pdu::BindNak(BindNakPdu {
                    reason,
                    versions: vec![(5, 0)],
                }),
            );
            self.write(&nak, AuthTrailer::None).await?;
            return Ok(true);
        }

        let results = body.context_list.iter().map(|ctx| self.result(ctx)).collect();
        let mut flags = PacketFlags::complete();
        if initial {
            self.max_frag = config.max_frag.min(body.max_recv_frag);
            if config.multiplexing && header.packet_flags.contains(PacketFlags::CONC_MPX) {
                flags.set(PacketFlags::CONC_MPX);
            }
        }
        if config.header_sign && header.packet_flags.contains(PacketFlags::SUPPORT_HEADER_SIGN) {
            flags.set(PacketFlags::SUPPORT_HEADER_SIGN);
        }

        let ack = BindAckPdu {
            max_xmit_frag: self.max_frag,
            max_recv_frag: config.max_frag.min(body.max_xmit_frag),
            assoc_group_id: config.group_id,
            secondary_addr: "135".into(),
            results,
        };
        let mut reply_header = PduHeader::new(
            if initial {
                PacketType::BindAck
            } else {
                PacketType::AlterContextResp
            },
            header.call_id,
        );
        reply_header.packet_flags = flags;
        let reply = Packet::new(
            reply_header,
            if initial {
                Pdu::BindAck(ack)
            } else {
                Pdu::AlterContextResp(ack)
            },
        );

        let trailer = match &packet.auth {
            Some(auth) => {
                stats.tokens.lock().push(auth.auth_value.clone());
                self.security(auth)?;
                let mut token = b"ACK:".to_vec();
                token.extend_from_slice(&auth.auth_value);
                AuthTrailer::Verifier(AuthVerifier::new(
                    auth.auth_type,
                    auth.auth_level,
                    auth.auth_context_id,
                    Bytes::from(token),
                ))
            }
            None => AuthTrailer::None,
        };
        self.write(&reply, trailer).await?;
        Ok(true)
    }

    async fn request(&mut self, header: PduHeader, frame: &[u8]) -> dcerpc::Result<bool> {
        let stats = &self.peer.stats;
        let call_id = header.call_id;
        stats.request_fragments.fetch_add(1, Ordering::SeqCst);
        stats.fragment_sizes.lock().push(frame.len());
        stats.auth_lengths.lock().push(header.auth_length);

        let raw = Packet::decode(frame)?;
        let security = match &raw.auth {
            Some(auth) => Some(self.security(auth)?),
            None => self
                .calls
                .get(&call_id)
                .and_then(|call| call.security.clone()),
        };
        let packet = decode_fragment(frame, security.as_deref(), || {})?;
        let Pdu::Request(request) = &packet.pdu else {
            return Ok(true);
        };

        let stats = &self.peer.stats;
        if header.packet_flags.is_first_frag() {
            stats.events.lock().push(Event::RequestStart(call_id));
            stats.objects.lock().push(request.object);
            self.calls.insert(
                call_id,
                PendingCall {
                    opnum: request.opnum,
                    context_id: request.context_id,
                    body: BytesMut::new(),
                    security,
                },
            );
        }
        let Some(call) = self.calls.get_mut(&call_id) else {
            return Ok(true);
        };
        call.body.extend_from_slice(&packet.stub);
        if !header.packet_flags.is_last_frag() {
            return Ok(true);
        }
        let Some(call) = self.calls.remove(&call_id) else {
            return Ok(true);
        };
        stats.requests.fetch_add(1, Ordering::SeqCst);

        let mut body = call.body.freeze();
        if let Some(offset) = VerificationTrailer::find(&body) {
            if let Ok(trailer) = VerificationTrailer::decode(&body[offset..], true) {
                stats.trailers.lock().push(trailer);
                body.truncate(offset);
            }
        }

        let responder = Responder {
            peer: self.peer.clone(),
            writer: self.writer.clone(),
            max_frag: self.max_frag,
            call_id,
            context_id: call.context_id,
            security: call.security,
        };
        match call.opnum {
            opnum::HANG => Ok(true),
            opnum::SHUTDOWN => {
                responder.shutdown().await?;
                Ok(false)
            }
            op => {
                tokio::spawn(responder.respond(op, body));
                Ok(true)
            }
        }
    }
}

struct Responder {
    peer: Arc<MockPeer>,
    writer: PeerWriter,
    max_frag: u16,
    call_id: u32,
    context_id: u16,
    security: Option<Arc<Security>>,
}

impl Responder {
    async fn respond(self, opnum: u16, body: Bytes) {
        let stats = &self.peer.stats;
        let in_flight = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let head = |body: &Bytes| {
            body.get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };
        let reply = match opnum {
            opnum::ECHO => Ok(body),
            opnum::GENERATE => Ok(pattern(head(&body) as usize)),
            opnum::CHECKSUM => Ok(Bytes::copy_from_slice(
                &compute_checksum(&body).to_le_bytes(),
            )),
            opnum::DELAYED_ECHO => {
                tokio::time::sleep(Duration::from_millis(head(&body) as u64)).await;
                Ok(body)
            }
            _ => Err(NCA_S_OP_RNG_ERROR),
        };
        let _ = match reply {
            Ok(stub) => self.response(stub).await,
            Err(status) => self.fault(status).await,
        };
    }

    /// Bookkeeping done before the last fragment leaves
    fn finish(&self) {
        let stats = &self.peer.stats;
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        stats.events.lock().push(Event::ResponseEnd(self.call_id));
    }

    async fn response(&self, mut stub: Bytes) -> dcerpc::Result<()> {
        let security = self.security.as_deref();
        let (auth_len, block) = match security {
            Some(s) => (
                s.auth_length(s.protection(PacketType::Response, true)),
                s.block_size(),
            ),
            None => (0, 4),
        };
        let max_stub = FragmentGenerator::max_stub_size(self.max_frag, auth_len, false, block);

        let mut writer = self.writer.lock().await;
        let mut first = true;
        loop {
            let chunk = stub.split_to(stub.len().min(max_stub));
            let last = stub.is_empty();
            let mut header = PduHeader::new(PacketType::Response, self.call_id);
            header.packet_flags = PacketFlags::new();
            if first {
                header.packet_flags.set_first_frag();
            }
            if last {
                header.packet_flags.set_last_frag();
            }
            let packet = Packet::new(
                header,
                Pdu::Response(ResponsePdu {
                    alloc_hint: (chunk.len() + stub.len()) as u32,
                    context_id: self.context_id,
                    cancel_count: 0,
                }),
            )
            .with_stub(chunk);
            let trailer = match security {
                Some(s) => match s.protection(PacketType::Response, first) {
                    Protection::None => AuthTrailer::None,
                    protection => AuthTrailer::Protect(s, protection),
                },
                None => AuthTrailer::None,
            };
            let frame = packet.encode(trailer)?;
            if last {
                self.finish();
            }
            writer.write_frame(&frame).await?;
            if last {
                return Ok(());
            }
            first = false;
        }
    }

    async fn fault(&self, status: u32) -> dcerpc::Result<()> {
        let packet = Packet::new(
            PduHeader::new(PacketType::Fault, self.call_id),
            Pdu::Fault(FaultPdu {
                context_id: self.context_id,
                ..FaultPdu::new(status)
            }),
        );
        let frame = packet.encode(AuthTrailer::None)?;
        self.finish();
        self.writer.lock().await.write_frame(&frame).await
    }

    async fn shutdown(&self) -> dcerpc::Result<()> {
        let packet = Packet::new(
            PduHeader::new(PacketType::Shutdown, self.call_id),
            Pdu::Shutdown,
        );
        let frame = packet.encode(AuthTrailer::None)?;
        self.writer.lock().await.write_frame(&frame).await
    }
}

// ============================================================================
// Dialer
// ============================================================================

/// Connects every binding to the same peer over an in-memory stream
pub struct MockDialer {
    peer: Arc<MockPeer>,
    refused: Mutex<Vec<String>>,
    hung_up: Mutex<Vec<String>>,
    routes: Mutex<Vec<(String, Arc<MockPeer>)>>,
    dialed: Mutex<Vec<String>>,
}

fn listed(hosts: &[String], host: &str) -> bool {
    hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
}

impl MockDialer {
    pub fn new(peer: Arc<MockPeer>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            refused: Mutex::new(Vec::new()),
            hung_up: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            dialed: Mutex::new(Vec::new()),
        })
    }

    /// Refuse connections to `host`
    pub fn refuse(&self, host: &str) {
        self.refused.lock().push(host.to_string());
    }

    /// Accept connections to `host` and close them before any reply
    pub fn hang_up(&self, host: &str) {
        self.hung_up.lock().push(host.to_string());
    }

    /// Serve connections to `host` from `peer` instead of the default one
    pub fn route(&self, host: &str, peer: Arc<MockPeer>) {
        self.routes.lock().push((host.to_string(), peer));
    }

    /// Bindings dialed so far, in order
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, binding: &StringBinding) -> dcerpc::Result<BoxedConn> {
        self.dialed.lock().push(binding.to_string());
        let host = binding.host();
        if listed(&self.refused.lock(), host) {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        if listed(&self.hung_up.lock(), host) {
            drop(server);
            return Ok(Box::new(client));
        }
        let routed = self
            .routes
            .lock()
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(host))
            .map(|(_, peer)| peer.clone());
        routed.unwrap_or_else(|| self.peer.clone()).serve(server);
        Ok(Box::new(client))
    }
}

/// Dial options wired to `dialer`, with a private id space
pub fn dial_options(dialer: Arc<MockDialer>) -> DialOptions {
    DialOptions::new()
        .with_dialer(dialer)
        .with_timeout(Duration::from_secs(5))
        .with_ids(Arc::new(IdGenerator::new()))
}

/// A peer, its dialer, a connection group and a client bound to the test
/// interface over `ncacn_ip_tcp:srv[1025]`
pub async fn bound_client(
    config: PeerConfig,
    opts: impl FnOnce(DialOptions) -> DialOptions,
) -> (Arc<MockPeer>, Arc<MockDialer>, Conn, ClientConn) {
    let peer = MockPeer::new(config);
    let dialer = MockDialer::new(peer.clone());
    let conn = dcerpc::dial("ncacn_ip_tcp:srv[1025]", opts(dial_options(dialer.clone())))
        .await
        .unwrap();
    let client = conn
        .bind(dcerpc::BindOptions::new(test_interface()))
        .await
        .unwrap();
    (peer, dialer, conn, client)
}

// ============================================================================
// Security mechanism
// ============================================================================

/// Checksum signatures and XOR sealing. `legs` is the number of client
/// tokens: 1 completes with the bind, 2 finishes with auth3, 3 needs an
/// extra alter-context leg.
pub struct MockMechanism {
    auth_type: AuthType,
    legs: usize,
    wraps: Arc<AtomicUsize>,
    unwraps: Arc<AtomicUsize>,
}

impl MockMechanism {
    pub fn new(auth_type: AuthType, legs: usize) -> Self {
        Self {
            auth_type,
            legs,
            wraps: Arc::new(AtomicUsize::new(0)),
            unwraps: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn wraps(&self) -> usize {
        self.wraps.load(Ordering::SeqCst)
    }

    pub fn unwraps(&self) -> usize {
        self.unwraps.load(Ordering::SeqCst)
    }
}

impl Mechanism for MockMechanism {
    fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    fn new_context(&self, _request: &ContextRequest<'_>) -> dcerpc::Result<Box<dyn SecurityProvider>> {
        Ok(Box::new(MockProvider {
            legs: self.legs,
            step: 0,
            wraps: self.wraps.clone(),
            unwraps: self.unwraps.clone(),
        }))
    }
}

struct MockProvider {
    legs: usize,
    step: usize,
    wraps: Arc<AtomicUsize>,
    unwraps: Arc<AtomicUsize>,
}

const SEAL_KEY: u8 = 0xa5;

fn mock_signature(data: &[u8]) -> Bytes {
    let mut sig = BytesMut::with_capacity(16);
    sig.put_u64_le(compute_checksum(data));
    sig.put_slice(b"MOCKSIG!");
    sig.freeze()
}

impl SecurityProvider for MockProvider {
    fn init(&mut self, input: Option<&[u8]>) -> dcerpc::Result<InitOutput> {
        if self.step > 0 && !input.is_some_and(|token| token.starts_with(b"ACK:")) {
            return Err(RpcError::Security("unexpected server token".into()));
        }
        self.step += 1;
        let complete = self.step >= self.legs;
        let token = if complete && self.legs >= 3 {
            Bytes::new()
        } else {
            Bytes::from(format!("LEG{}", self.step))
        };
        Ok(InitOutput { token, complete })
    }

    fn signature_size(&self) -> usize {
        16
    }

    fn block_size(&self) -> usize {
        8
    }

    fn wrap(&mut self, protection: Protection, regions: WrapRegions<'_>) -> dcerpc::Result<Bytes> {
        self.wraps.fetch_add(1, Ordering::SeqCst);
        let signature = mock_signature(regions.data);
        if protection == Protection::Seal {
            regions.data.iter_mut().for_each(|b| *b ^= SEAL_KEY);
        }
        Ok(signature)
    }

    fn unwrap(
        &mut self,
        protection: Protection,
        regions: WrapRegions<'_>,
        signature: &[u8],
    ) -> dcerpc::Result<()> {
        self.unwraps.fetch_add(1, Ordering::SeqCst);
        if protection == Protection::Seal {
            regions.data.iter_mut().for_each(|b| *b ^= SEAL_KEY);
        }
        if mock_signature(regions.data).as_ref() != signature {
            return Err(RpcError::Security("signature mismatch".into()));
        }
        Ok(())
    }
}

/// Security options using `mechanism` at `level`
pub fn security_options(mechanism: Arc<MockMechanism>, level: AuthLevel) -> dcerpc::SecurityOptions {
    dcerpc::SecurityOptions::new()
        .with_mechanism(mechanism)
        .with_level(level)
}
