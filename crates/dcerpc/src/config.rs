//! Dial, bind, security and call options
//!
//! Options are plain structs with public fields, `Default` values and
//! `with_*` setters. Each struct is validated once, before any network
//! activity; binding extras (`[..,privacy,ndr64]`, `?krb5`) are folded in
//! with [`BindOptions::apply_extras`].

use crate::binding::StringBinding;
use crate::dcerpc::{DataRepresentation, PacketType, SyntaxId, Uuid, MUST_RECV_FRAG_SIZE};
use crate::dialer::{DefaultDialer, Dialer};
use crate::epm::EndpointMapper;
use crate::error::{Result, RpcError};
use crate::ids::IdGenerator;
use crate::presentation::{BindFeatures, TransferEncoding};
use crate::security::{
    AuthLevel, AuthType, ContextRequest, Credential, ImpersonationLevel, Mechanism, Security,
};
use crate::verification::{
    VerificationCommand, VerificationTrailer, SEC_VT_CLIENT_SUPPORTS_HEADER_SIGNING,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Span};

/// Idle and dial deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default fragment size proposed in bind
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// Security context parameters
#[derive(Clone)]
pub struct SecurityOptions {
    /// Available mechanisms
    pub mechanisms: Vec<Arc<dyn Mechanism>>,
    /// Preferred auth types, in order. Empty picks the first mechanism.
    pub auth_types: Vec<AuthType>,
    pub credential: Option<Credential>,
    pub level: AuthLevel,
    pub impersonation: ImpersonationLevel,
    /// Service principal name; defaults to `host/<server>`
    pub target_name: Option<String>,
    /// Advertise header signing in the first bind
    pub header_sign: bool,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            mechanisms: Vec::new(),
            auth_types: Vec::new(),
            credential: None,
            level: AuthLevel::default(),
            impersonation: ImpersonationLevel::default(),
            target_name: None,
            header_sign: true,
        }
    }
}

impl fmt::Debug for SecurityOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mechanisms: Vec<AuthType> = self.mechanisms.iter().map(|m| m.auth_type()).collect();
        f.debug_struct("SecurityOptions")
            .field("mechanisms", &mechanisms)
            .field("auth_types", &self.auth_types)
            .field("credential", &self.credential)
            .field("level", &self.level)
            .field("impersonation", &self.impersonation)
            .field("target_name", &self.target_name)
            .field("header_sign", &self.header_sign)
            .finish()
    }
}

impl SecurityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mechanism(mut self, mechanism: Arc<dyn Mechanism>) -> Self {
        self.mechanisms.push(mechanism);
        self
    }

    pub fn with_auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_types.push(auth_type);
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_level(mut self, level: AuthLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_impersonation(mut self, impersonation: ImpersonationLevel) -> Self {
        self.impersonation = impersonation;
        self
    }

    pub fn with_target_name(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = Some(target_name.into());
        self
    }

    pub fn with_header_sign(mut self, header_sign: bool) -> Self {
        self.header_sign = header_sign;
        self
    }

    /// Mechanism serving the preferred auth types, if any is configured
    pub fn mechanism(&self) -> Result<Option<&Arc<dyn Mechanism>>> {
        if self.level.is_insecure() || self.mechanisms.is_empty() {
            return Ok(None);
        }
        if self.auth_types.is_empty() {
            return Ok(self.mechanisms.first());
        }
        self.auth_types
            .iter()
            .find_map(|t| self.mechanisms.iter().find(|m| m.auth_type() == *t))
            .map(Some)
            .ok_or_else(|| {
                RpcError::InvalidConfig(format!(
                    "no mechanism provides any of {:?}",
                    self.auth_types
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        let mechanism = self.mechanism()?;
        if mechanism.is_none() && (self.level.requires_signing() || self.level.requires_encryption())
        {
            return Err(RpcError::InvalidConfig(format!(
                "auth level {:?} requires a security mechanism",
                self.level
            )));
        }
        Ok(())
    }

    /// Create the security context. Without a mechanism the context is
    /// insecure.
    pub(crate) fn context(&self, context_id: u32, default_target: &str) -> Result<Security> {
        let Some(mechanism) = self.mechanism()? else {
            return Ok(Security::insecure(context_id));
        };
        let target_name = self.target_name.as_deref().unwrap_or(default_target);
        debug!(
            "Creating security context: context_id={}, auth_type={:?}, level={:?}, target={}",
            context_id,
            mechanism.auth_type(),
            self.level,
            target_name
        );
        Security::new(
            context_id,
            mechanism.as_ref(),
            &ContextRequest {
                target_name,
                level: self.level,
                impersonation: self.impersonation,
                credential: self.credential.as_ref(),
            },
            self.header_sign,
        )
    }
}

/// Verification trailer commands to send with each request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    pub bitmask: bool,
    pub presentation: bool,
    pub header2: bool,
}

impl VerifyOptions {
    pub fn all() -> Self {
        Self {
            bitmask: true,
            presentation: true,
            header2: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.bitmask || self.presentation || self.header2)
    }

    /// Build the trailer for one request
    pub fn trailer(&self, fields: &TrailerFields) -> VerificationTrailer {
        let mut commands = Vec::new();
        if self.bitmask {
            commands.push(VerificationCommand::Bitmask1(if fields.header_sign {
                SEC_VT_CLIENT_SUPPORTS_HEADER_SIGNING
            } else {
                0
            }));
        }
        if self.presentation {
            commands.push(VerificationCommand::PContext {
                interface: fields.interface,
                transfer_syntax: fields.transfer_syntax,
            });
        }
        if self.header2 {
            commands.push(VerificationCommand::Header2 {
                packet_type: PacketType::Request,
                data_rep: fields.data_rep,
                call_id: fields.call_id,
                context_id: fields.context_id,
                opnum: fields.opnum,
            });
        }
        VerificationTrailer { commands }
    }
}

/// Request fields the verification commands repeat
#[derive(Debug, Clone, Copy)]
pub struct TrailerFields {
    pub header_sign: bool,
    pub interface: SyntaxId,
    pub transfer_syntax: SyntaxId,
    pub data_rep: DataRepresentation,
    pub call_id: u32,
    pub context_id: u16,
    pub opnum: u16,
}

/// Per-presentation-context options
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub abstract_syntax: Option<SyntaxId>,
    /// Proposed transfer syntaxes; empty proposes NDR20
    pub transfer_syntaxes: Vec<SyntaxId>,
    /// Replaces the dial-level security options
    pub security: Option<SecurityOptions>,
    pub verify: VerifyOptions,
    /// Endpoint override for the server's binding
    pub endpoint: Option<String>,
    /// Default object UUID for invocations
    pub object: Option<Uuid>,
    pub target_name: Option<String>,
}

impl BindOptions {
    pub fn new(abstract_syntax: SyntaxId) -> Self {
        Self {
            abstract_syntax: Some(abstract_syntax),
            ..Default::default()
        }
    }

    pub fn with_transfer_syntax(mut self, syntax: SyntaxId) -> Self {
        if !self.transfer_syntaxes.contains(&syntax) {
            self.transfer_syntaxes.push(syntax);
        }
        self
    }

    pub fn with_transfer_encoding(self, encoding: TransferEncoding) -> Self {
        self.with_transfer_syntax(encoding.syntax())
    }

    pub fn with_security(mut self, security: SecurityOptions) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_verify(mut self, verify: VerifyOptions) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_object(mut self, object: Uuid) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_target_name(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = Some(target_name.into());
        self
    }

    /// Fold binding keywords into the options. `dial_security` seeds the
    /// security override when a keyword changes a security setting.
    pub fn apply_extras(&mut self, extras: &[String], dial_security: &SecurityOptions) {
        let has = |k: &str| extras.iter().any(|e| e.eq_ignore_ascii_case(k));
        let mut security = self.security.take();

        // an explicit mechanism keyword replaces the preference list
        if has("krb5") || has("ntlm") {
            security
                .get_or_insert_with(|| dial_security.clone())
                .auth_types
                .clear();
        }

        for extra in extras {
            if let Ok(encoding) = extra.parse::<TransferEncoding>() {
                self.transfer_syntaxes = vec![encoding.syntax()];
            } else if let Ok(level) = extra.parse::<AuthLevel>() {
                security.get_or_insert_with(|| dial_security.clone()).level = level;
            } else if let Ok(impersonation) = extra.parse::<ImpersonationLevel>() {
                security
                    .get_or_insert_with(|| dial_security.clone())
                    .impersonation = impersonation;
            } else if let Ok(auth_type) = extra.parse::<AuthType>() {
                let opts = security.get_or_insert_with(|| dial_security.clone());
                if !opts.auth_types.contains(&auth_type) {
                    if auth_type == AuthType::GssNegotiate {
                        opts.auth_types.insert(0, auth_type);
                    } else {
                        opts.auth_types.push(auth_type);
                    }
                }
            } else {
                match extra.to_ascii_lowercase().as_str() {
                    "presentation" => self.verify.presentation = true,
                    "header2" => self.verify.header2 = true,
                    "bitmask" => self.verify.bitmask = true,
                    _ => debug!("Ignoring binding option: {}", extra),
                }
            }
        }

        self.security = security;
    }

    pub fn validate(&self) -> Result<()> {
        if self.abstract_syntax.is_none() {
            return Err(RpcError::InvalidConfig("abstract syntax is required".into()));
        }
        if let Some(security) = &self.security {
            security.validate()?;
        }
        Ok(())
    }
}

/// Per-invocation options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Object UUID carried in every request fragment
    pub object: Option<Uuid>,
    /// Deadline for the whole exchange
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, object: Uuid) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Connection group options
#[derive(Clone)]
pub struct DialOptions {
    /// Dial deadline and idle deadline of the transport loops
    pub timeout: Duration,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    /// Association group to join; 0 asks for a new one
    pub group_id: u32,
    /// Request concurrent multiplexing (PFC_CONC_MPX)
    pub multiplexing: bool,
    /// Bind-time features to negotiate
    pub features: BindFeatures,
    /// Reuse live transports to the same binding
    pub reuse: bool,
    /// Candidate bindings tried before any other source
    pub bindings: Vec<StringBinding>,
    pub endpoint_mapper: Option<Arc<dyn EndpointMapper>>,
    pub dialer: Arc<dyn Dialer>,
    /// Parent span of every transport span
    pub span: Option<Span>,
    pub security: SecurityOptions,
    pub ids: Arc<IdGenerator>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            group_id: 0,
            multiplexing: false,
            features: BindFeatures::new(
                BindFeatures::SECURITY_CONTEXT_MULTIPLEXING
                    | BindFeatures::KEEP_CONNECTION_ON_ORPHAN,
            ),
            reuse: true,
            bindings: Vec::new(),
            endpoint_mapper: None,
            dialer: Arc::new(DefaultDialer),
            span: None,
            security: SecurityOptions::default(),
            ids: IdGenerator::process(),
        }
    }
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("timeout", &self.timeout)
            .field("max_xmit_frag", &self.max_xmit_frag)
            .field("max_recv_frag", &self.max_recv_frag)
            .field("group_id", &self.group_id)
            .field("multiplexing", &self.multiplexing)
            .field("features", &self.features)
            .field("reuse", &self.reuse)
            .field("bindings", &self.bindings)
            .field("endpoint_mapper", &self.endpoint_mapper.is_some())
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fragment_size(mut self, max_xmit_frag: u16, max_recv_frag: u16) -> Self {
        self.max_xmit_frag = max_xmit_frag;
        self.max_recv_frag = max_recv_frag;
        self
    }

    pub fn with_group_id(mut self, group_id: u32) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_multiplexing(mut self, multiplexing: bool) -> Self {
        self.multiplexing = multiplexing;
        self
    }

    pub fn with_features(mut self, features: BindFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_binding(mut self, binding: StringBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_endpoint_mapper(mut self, mapper: Arc<dyn EndpointMapper>) -> Self {
        self.endpoint_mapper = Some(mapper);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_security(mut self, security: SecurityOptions) -> Self {
        self.security = security;
        self
    }

    pub fn with_ids(mut self, ids: Arc<IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(RpcError::InvalidConfig("timeout must be non-zero".into()));
        }
        for (name, size) in [
            ("max_xmit_frag", self.max_xmit_frag),
            ("max_recv_frag", self.max_recv_frag),
        ] {
            if size < MUST_RECV_FRAG_SIZE {
                return Err(RpcError::InvalidConfig(format!(
                    "{} {} is below the minimum of {}",
                    name, size, MUST_RECV_FRAG_SIZE
                )));
            }
        }
        self.security.validate()
    }
}
