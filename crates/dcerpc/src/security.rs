//! DCE RPC security integration
//!
//! This module adapts an external security provider (a GSSAPI-style
//! mechanism such as NTLM, Kerberos or SPNEGO) to the connection-oriented
//! protocol. The provider owns the cryptography and token exchange; this
//! module decides whether and how each fragment is protected based on the
//! negotiated auth level, and reports the expected trailer length.
//!
//! Wire format of the security trailer follows MS-RPCE 2.2.2.11.

use crate::dcerpc::{get_u32, put_u32, PacketType};
use crate::error::{Result, RpcError};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Authentication types (MS-RPCE Section 2.2.1.1.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthType {
    /// No authentication
    None = 0,
    /// OSF DCE private key authentication (deprecated)
    DcePrivate = 1,
    /// OSF DCE public key authentication (deprecated)
    DcePublic = 2,
    /// GSS Negotiate (SPNEGO)
    GssNegotiate = 9,
    /// Windows NT LAN Manager (NTLM)
    Ntlm = 10,
    /// GSS Kerberos (also known as DCE Kerberos, auth type 16)
    GssKerberos = 16,
    /// Netlogon secure channel
    Netlogon = 68,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::DcePrivate),
            2 => Some(Self::DcePublic),
            9 => Some(Self::GssNegotiate),
            10 => Some(Self::Ntlm),
            16 => Some(Self::GssKerberos),
            68 => Some(Self::Netlogon),
            _ => None,
        }
    }
}

impl FromStr for AuthType {
    type Err = RpcError;

    /// Parses the mechanism keywords accepted in binding extras.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "spnego" | "negotiate" => Ok(Self::GssNegotiate),
            "ntlm" => Ok(Self::Ntlm),
            "krb5" | "kerberos" => Ok(Self::GssKerberos),
            "netlogon" => Ok(Self::Netlogon),
            _ => Err(RpcError::InvalidConfig(format!("invalid auth type: {}", s))),
        }
    }
}

/// Authentication levels (MS-RPCE Section 2.2.1.1.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AuthLevel {
    /// Let the provider choose (treated as connect)
    Default = 0,
    /// No authentication
    None = 1,
    /// Connect-level authentication (authenticate at connection)
    Connect = 2,
    /// Call-level authentication (protect the first fragment of each call)
    Call = 3,
    /// Packet-level authentication (authenticate each packet)
    Pkt = 4,
    /// Packet integrity (sign each packet)
    PktIntegrity = 5,
    /// Packet privacy (encrypt each packet)
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Default),
            1 => Some(Self::None),
            2 => Some(Self::Connect),
            3 => Some(Self::Call),
            4 => Some(Self::Pkt),
            5 => Some(Self::PktIntegrity),
            6 => Some(Self::PktPrivacy),
            _ => None,
        }
    }

    /// Returns true if this level requires message signing
    pub fn requires_signing(&self) -> bool {
        matches!(self, Self::Call | Self::Pkt | Self::PktIntegrity)
    }

    /// Returns true if this level requires message encryption
    pub fn requires_encryption(&self) -> bool {
        matches!(self, Self::PktPrivacy)
    }

    /// Returns true if no security context is negotiated at all
    pub fn is_insecure(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl Default for AuthLevel {
    fn default() -> Self {
        Self::Connect
    }
}

impl FromStr for AuthLevel {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "connect" => Ok(Self::Connect),
            "call" => Ok(Self::Call),
            "pkt" => Ok(Self::Pkt),
            "integrity" => Ok(Self::PktIntegrity),
            "privacy" => Ok(Self::PktPrivacy),
            _ => Err(RpcError::InvalidConfig(format!("invalid auth level: {}", s))),
        }
    }
}

/// Impersonation levels granted to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ImpersonationLevel {
    Default = 0,
    Anonymous = 1,
    Identify = 2,
    Impersonate = 3,
    Delegate = 4,
}

impl Default for ImpersonationLevel {
    fn default() -> Self {
        Self::Impersonate
    }
}

impl FromStr for ImpersonationLevel {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Self::Anonymous),
            "identify" => Ok(Self::Identify),
            "impersonate" => Ok(Self::Impersonate),
            "delegate" => Ok(Self::Delegate),
            _ => Err(RpcError::InvalidConfig(format!(
                "invalid impersonation level: {}",
                s
            ))),
        }
    }
}

/// Authentication verifier (appended to authenticated PDUs)
///
/// Wire format (MS-RPCE 2.2.2.11):
/// ```text
/// +------------------+
/// | auth_type (1)    |
/// +------------------+
/// | auth_level (1)   |
/// +------------------+
/// | auth_pad_len (1) |
/// +------------------+
/// | reserved (1)     |
/// +------------------+
/// | auth_context_id  |
/// | (4 bytes)        |
/// +------------------+
/// | auth_value       |
/// | (variable)       |
/// +------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerifier {
    /// Authentication type
    pub auth_type: AuthType,
    /// Authentication level
    pub auth_level: AuthLevel,
    /// Number of padding bytes before this verifier
    pub auth_pad_length: u8,
    /// Authentication context identifier
    pub auth_context_id: u32,
    /// Authentication token or signature
    pub auth_value: Bytes,
}

impl AuthVerifier {
    /// Size of the fixed header portion (8 bytes)
    pub const HEADER_SIZE: usize = 8;

    pub fn new(
        auth_type: AuthType,
        auth_level: AuthLevel,
        auth_context_id: u32,
        auth_value: Bytes,
    ) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_pad_length: 0,
            auth_context_id,
            auth_value,
        }
    }

    /// Total size including header and auth value
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.auth_value.len()
    }

    /// Encode the fixed trailer header (without the auth value)
    pub fn encode_header(&self, buf: &mut BytesMut, little_endian: bool) {
        buf.put_u8(self.auth_type as u8);
        buf.put_u8(self.auth_level as u8);
        buf.put_u8(self.auth_pad_length);
        buf.put_u8(0); // reserved
        put_u32(buf, self.auth_context_id, little_endian);
    }

    /// Encode the auth verifier
    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        self.encode_header(buf, little_endian);
        buf.put_slice(&self.auth_value);
    }

    /// Decode an auth verifier; `data` starts at the trailer and holds
    /// exactly `HEADER_SIZE + auth_length` bytes.
    pub fn decode(data: &[u8], auth_length: usize, little_endian: bool) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE + auth_length {
            return Err(RpcError::eof("security trailer"));
        }

        let auth_type = AuthType::from_u8(data[0])
            .ok_or_else(|| RpcError::InvalidPdu(format!("unknown auth type {}", data[0])))?;
        let auth_level = AuthLevel::from_u8(data[1])
            .ok_or_else(|| RpcError::InvalidPdu(format!("unknown auth level {}", data[1])))?;
        let auth_pad_length = data[2];
        let mut cursor = Cursor::new(&data[4..Self::HEADER_SIZE]);
        let auth_context_id = get_u32(&mut cursor, little_endian, "auth context id")?;

        let auth_value =
            Bytes::copy_from_slice(&data[Self::HEADER_SIZE..Self::HEADER_SIZE + auth_length]);

        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_length,
            auth_context_id,
            auth_value,
        })
    }
}

/// Calculate the number of padding bytes needed to align stub data
/// before the auth verifier
pub fn calculate_auth_padding(stub_len: usize, alignment: usize) -> usize {
    let alignment = alignment.max(4);
    let remainder = stub_len % alignment;
    if remainder == 0 {
        0
    } else {
        alignment - remainder
    }
}

/// Per-fragment protection decided from the negotiated auth level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No security trailer
    None,
    /// Integrity: signature over the covered ranges
    Sign,
    /// Privacy: stub sealed in place, signature over the covered ranges
    Seal,
}

/// Output of one token-exchange leg
#[derive(Debug, Clone, Default)]
pub struct InitOutput {
    /// Token to send to the server; empty when nothing is left to send
    pub token: Bytes,
    /// True once the provider considers the context established
    pub complete: bool,
}

/// The byte ranges of one fragment handed to the provider.
///
/// `header` and `trailer` are empty when header signing was not
/// negotiated; `data` is the stub including padding and is sealed or
/// unsealed in place.
pub struct WrapRegions<'a> {
    pub header: &'a [u8],
    pub data: &'a mut [u8],
    pub trailer: &'a [u8],
}

/// Credentials handed to a mechanism
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub domain: Option<String>,
    pub username: String,
    pub secret: Secret,
}

/// Secret half of a credential
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Secret {
    #[default]
    None,
    Password(String),
    /// Hex encoded NT hash (`hash:` prefix in a binding URL)
    NtHash(String),
    /// Kerberos key (`key:type:value` in a binding URL)
    EncryptionKey { key_type: String, value: String },
}

impl Credential {
    /// Parse `user`, `domain\user` or `user@realm` plus an optional secret
    /// using the `hash:` / `key:` prefixes of binding URLs.
    pub fn parse(user: &str, secret: Option<&str>) -> Result<Self> {
        let (domain, username) = match user.split_once('\\') {
            Some((domain, name)) => (Some(domain.to_string()), name.to_string()),
            None => match user.split_once('@') {
                Some((name, realm)) => (Some(realm.to_string()), name.to_string()),
                None => (None, user.to_string()),
            },
        };

        let secret = match secret {
            None | Some("") => Secret::None,
            Some(s) => {
                if let Some(hash) = s.strip_prefix("hash:") {
                    Secret::NtHash(hash.to_string())
                } else if let Some(key) = s.strip_prefix("key:") {
                    let (key_type, value) = key.split_once(':').ok_or_else(|| {
                        RpcError::InvalidConfig(format!("invalid encryption key: {}", s))
                    })?;
                    Secret::EncryptionKey {
                        key_type: key_type.to_string(),
                        value: value.to_string(),
                    }
                } else {
                    Secret::Password(s.to_string())
                }
            }
        };

        Ok(Self {
            domain,
            username,
            secret,
        })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Password(_) => f.write_str("Password(..)"),
            Self::NtHash(_) => f.write_str("NtHash(..)"),
            Self::EncryptionKey { key_type, .. } => f
                .debug_struct("EncryptionKey")
                .field("key_type", key_type)
                .finish_non_exhaustive(),
        }
    }
}

/// Parameters for creating a new provider context
#[derive(Debug, Clone)]
pub struct ContextRequest<'a> {
    pub target_name: &'a str,
    pub level: AuthLevel,
    pub impersonation: ImpersonationLevel,
    pub credential: Option<&'a Credential>,
}

/// An authentication mechanism able to create provider contexts
pub trait Mechanism: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn new_context(&self, request: &ContextRequest<'_>) -> Result<Box<dyn SecurityProvider>>;
}

/// A security provider context (one per security context id).
///
/// Calls are serialized by the owning [`Security`]; implementations need
/// not be internally synchronized.
pub trait SecurityProvider: Send {
    /// Run one token-exchange leg. `input` is the server's last token.
    fn init(&mut self, input: Option<&[u8]>) -> Result<InitOutput>;

    /// Size of the signature appended to protected fragments
    fn signature_size(&self) -> usize;

    /// Alignment the stub must be padded to before the security trailer
    fn block_size(&self) -> usize {
        4
    }

    /// Sign or seal one fragment, returning the signature
    fn wrap(&mut self, protection: Protection, regions: WrapRegions<'_>) -> Result<Bytes>;

    /// Verify or unseal one fragment in place
    fn unwrap(
        &mut self,
        protection: Protection,
        regions: WrapRegions<'_>,
        signature: &[u8],
    ) -> Result<()>;
}

/// A security context shared by sibling presentation contexts
pub struct Security {
    context_id: u32,
    auth_type: AuthType,
    level: AuthLevel,
    impersonation: ImpersonationLevel,
    target_name: String,
    request_header_sign: bool,
    header_sign: AtomicBool,
    established: AtomicBool,
    provider: Option<Mutex<Box<dyn SecurityProvider>>>,
}

impl Security {
    /// A context that never protects anything
    pub fn insecure(context_id: u32) -> Self {
        Self {
            context_id,
            auth_type: AuthType::None,
            level: AuthLevel::None,
            impersonation: ImpersonationLevel::Default,
            target_name: String::new(),
            request_header_sign: false,
            header_sign: AtomicBool::new(false),
            established: AtomicBool::new(true),
            provider: None,
        }
    }

    pub fn new(
        context_id: u32,
        mechanism: &dyn Mechanism,
        request: &ContextRequest<'_>,
        request_header_sign: bool,
    ) -> Result<Self> {
        if request.level.is_insecure() {
            return Ok(Self::insecure(context_id));
        }
        let provider = mechanism.new_context(request)?;
        Ok(Self {
            context_id,
            auth_type: mechanism.auth_type(),
            level: request.level,
            impersonation: request.impersonation,
            target_name: request.target_name.to_string(),
            request_header_sign,
            header_sign: AtomicBool::new(false),
            established: AtomicBool::new(false),
            provider: Some(Mutex::new(provider)),
        })
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn impersonation(&self) -> ImpersonationLevel {
        self.impersonation
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn is_insecure(&self) -> bool {
        self.provider.is_none()
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub(crate) fn set_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// True when the bind should advertise header signing
    pub fn requests_header_sign(&self) -> bool {
        self.request_header_sign && !self.is_insecure()
    }

    /// True once the peer echoed header-signing support
    pub fn header_sign(&self) -> bool {
        self.header_sign.load(Ordering::Acquire)
    }

    pub(crate) fn set_header_sign(&self, negotiated: bool) {
        self.header_sign
            .store(negotiated && self.request_header_sign, Ordering::Release);
    }

    /// Protection applied to one fragment of the given type
    pub fn protection(&self, packet_type: PacketType, first_fragment: bool) -> Protection {
        if self.is_insecure() || !self.is_established() {
            return Protection::None;
        }
        if !matches!(
            packet_type,
            PacketType::Request | PacketType::Response | PacketType::Fault
        ) {
            return Protection::None;
        }
        match self.level {
            AuthLevel::Default | AuthLevel::None | AuthLevel::Connect => Protection::None,
            AuthLevel::Call if first_fragment => Protection::Sign,
            AuthLevel::Call => Protection::None,
            AuthLevel::Pkt | AuthLevel::PktIntegrity => Protection::Sign,
            AuthLevel::PktPrivacy => Protection::Seal,
        }
    }

    /// Expected auth value length for a fragment with this protection
    pub fn auth_length(&self, protection: Protection) -> usize {
        match (protection, &self.provider) {
            (Protection::None, _) | (_, None) => 0,
            (_, Some(provider)) => provider.lock().signature_size(),
        }
    }

    /// Padding alignment for protected stubs
    pub fn block_size(&self) -> usize {
        match &self.provider {
            Some(provider) => provider.lock().block_size().max(4),
            None => 4,
        }
    }

    /// Take the provider lock for the span of a wrap or unwrap
    pub fn lock(&self) -> Result<SecurityGuard<'_>> {
        let provider = self.provider.as_ref().ok_or(RpcError::NoSecurityContext)?;
        Ok(SecurityGuard {
            provider: provider.lock(),
        })
    }

    /// Run one token-exchange leg
    pub fn init(&self, input: Option<&[u8]>) -> Result<InitOutput> {
        let mut guard = self.lock()?;
        let output = guard.provider.init(input)?;
        if output.complete {
            self.set_established();
        }
        Ok(output)
    }

    /// Build the security trailer for a fragment
    pub fn verifier(&self, pad: usize, auth_value: Bytes) -> AuthVerifier {
        let mut verifier = AuthVerifier::new(self.auth_type, self.level, self.context_id, auth_value);
        verifier.auth_pad_length = pad as u8;
        verifier
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Security")
            .field("context_id", &self.context_id)
            .field("auth_type", &self.auth_type)
            .field("level", &self.level)
            .field("established", &self.is_established())
            .field("header_sign", &self.header_sign())
            .finish()
    }
}

/// Exclusive access to the provider context
pub struct SecurityGuard<'a> {
    provider: MutexGuard<'a, Box<dyn SecurityProvider>>,
}

impl SecurityGuard<'_> {
    pub fn wrap(&mut self, protection: Protection, regions: WrapRegions<'_>) -> Result<Bytes> {
        self.provider.wrap(protection, regions)
    }

    pub fn unwrap(
        &mut self,
        protection: Protection,
        regions: WrapRegions<'_>,
        signature: &[u8],
    ) -> Result<()> {
        self.provider.unwrap(protection, regions, signature)
    }
}
