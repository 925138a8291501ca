//! String bindings and server addresses
//!
//! Two grammars locate an RPC endpoint:
//!
//! ```text
//! native:  ['ObjectUUID'@]ProtSeq:Address['['Endpoint[,extra]*']']
//! url:     scheme://[user[:password]@]host[:port][/path][/objectUUID][/ifaceUUID/vM.m][?extra&extra]
//! ```
//!
//! A bare `host:port` is a TCP binding. An endpoint of `*` or `?`, or a
//! non-numeric TCP endpoint, is an option rather than an address: it moves
//! to the extras list and leaves the endpoint empty.

use crate::dcerpc::{SyntaxId, Uuid};
use crate::error::{Result, RpcError};
use crate::security::Credential;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Protocol sequence of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolSequence {
    /// ncacn_ip_tcp
    Tcp,
    /// ncacn_np (SMB named pipes)
    NamedPipe,
    /// ncacn_http
    Http,
    /// ncalrpc
    Lrpc,
}

impl ProtocolSequence {
    /// Native protocol sequence name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "ncacn_ip_tcp",
            Self::NamedPipe => "ncacn_np",
            Self::Http => "ncacn_http",
            Self::Lrpc => "ncalrpc",
        }
    }

    /// Canonical URL scheme
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::NamedPipe => "smb",
            Self::Http => "http",
            Self::Lrpc => "alpc",
        }
    }

    fn has_port(&self) -> bool {
        matches!(self, Self::Tcp | Self::Http)
    }
}

impl FromStr for ProtocolSequence {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ncacn_ip_tcp" | "tcp" => Ok(Self::Tcp),
            "ncacn_np" | "np" | "smb" => Ok(Self::NamedPipe),
            "ncacn_http" | "http" => Ok(Self::Http),
            "ncalrpc" | "alpc" | "lrpc" => Ok(Self::Lrpc),
            _ => Err(RpcError::InvalidBinding(format!(
                "unknown protocol sequence: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ProtocolSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed string binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringBinding {
    pub username: String,
    pub password: String,
    pub object: Option<Uuid>,
    pub protocol: ProtocolSequence,
    /// Literal IP address
    pub network_address: String,
    /// Host name when the address is not an IP
    pub computer_name: String,
    pub endpoint: String,
    pub extras: Vec<String>,
    /// Interface named in a URL path
    pub interface: Option<SyntaxId>,
}

impl StringBinding {
    pub fn new(protocol: ProtocolSequence, host: &str, endpoint: &str) -> Self {
        let mut binding = Self {
            username: String::new(),
            password: String::new(),
            object: None,
            protocol,
            network_address: String::new(),
            computer_name: String::new(),
            endpoint: String::new(),
            extras: Vec::new(),
            interface: None,
        };
        binding.set_host(host);
        binding.set_endpoint(endpoint);
        binding
    }

    /// Parse either grammar
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RpcError::InvalidBinding("empty binding".into()));
        }
        if s.contains("://") {
            Self::parse_url(s)
        } else {
            Self::parse_native(s)
        }
    }

    /// True iff the binding names an endpoint
    pub fn is_complete(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Network address if literal, computer name otherwise
    pub fn host(&self) -> &str {
        if self.network_address.is_empty() {
            &self.computer_name
        } else {
            &self.network_address
        }
    }

    pub fn set_host(&mut self, host: &str) {
        let host = host.trim_start_matches("\\\\");
        let unbracketed = host.trim_start_matches('[').trim_end_matches(']');
        if unbracketed.parse::<IpAddr>().is_ok() {
            self.network_address = unbracketed.to_string();
            self.computer_name.clear();
        } else {
            self.computer_name = host.to_string();
            self.network_address.clear();
        }
    }

    /// Set the endpoint, normalizing pipe names and folding option-like
    /// endpoints into the extras list.
    pub fn set_endpoint(&mut self, endpoint: &str) {
        let endpoint = endpoint.trim();
        let is_option = endpoint == "*"
            || endpoint == "?"
            || (self.protocol == ProtocolSequence::Tcp
                && !endpoint.is_empty()
                && endpoint.parse::<u16>().is_err());
        if is_option {
            self.extras.insert(0, endpoint.to_string());
            self.endpoint.clear();
            return;
        }
        self.endpoint = match self.protocol {
            ProtocolSequence::NamedPipe if !endpoint.is_empty() => normalize_pipe(endpoint),
            _ => endpoint.to_string(),
        };
    }

    /// Key identifying a transport for reuse
    pub fn reuse_key(&self) -> String {
        format!(
            "{}:{}[{}]",
            self.protocol.name(),
            self.host().to_ascii_lowercase(),
            self.endpoint
        )
    }

    /// True if any extra equals `keyword`, ignoring case
    pub fn has_extra(&self, keyword: &str) -> bool {
        self.extras.iter().any(|e| e.eq_ignore_ascii_case(keyword))
    }

    fn parse_native(s: &str) -> Result<Self> {
        let (object, rest) = match s.split_once('@') {
            Some((uuid, rest)) => {
                let object = Uuid::parse(uuid).ok_or_else(|| {
                    RpcError::InvalidBinding(format!("invalid object uuid: {}", uuid))
                })?;
                (Some(object), rest)
            }
            None => (None, s),
        };

        let (address_part, endpoint_part) = match rest.find('[') {
            Some(open) => {
                let inner = rest[open + 1..].strip_suffix(']').ok_or_else(|| {
                    RpcError::InvalidBinding(format!("unterminated endpoint in {}", s))
                })?;
                (&rest[..open], Some(inner))
            }
            None => (rest, None),
        };

        let (protocol, address, endpoint_part) = match address_part.split_once(':') {
            Some((protseq, address)) => match protseq.parse::<ProtocolSequence>() {
                Ok(protocol) => (protocol, address, endpoint_part),
                // bare host:port
                Err(_) if endpoint_part.is_none() && address.parse::<u16>().is_ok() => {
                    (ProtocolSequence::Tcp, protseq, Some(address))
                }
                Err(err) => return Err(err),
            },
            None => {
                return Err(RpcError::InvalidBinding(format!(
                    "missing protocol sequence in {}",
                    s
                )))
            }
        };

        let mut binding = Self::new(protocol, address, "");
        binding.object = object;
        if let Some(list) = endpoint_part {
            let mut items = list.split(',');
            let endpoint = items.next().unwrap_or_default();
            binding.extras = items
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            binding.set_endpoint(endpoint);
        }
        Ok(binding)
    }

    fn parse_url(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| RpcError::InvalidBinding(format!("not a url: {}", s)))?;
        let protocol: ProtocolSequence = scheme.parse()?;

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash + 1..]),
            None => (rest, ""),
        };

        let mut binding = Self::new(protocol, "", "");

        let host_port = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let (user, password) = match userinfo.split_once(':') {
                    Some((user, password)) => (user, password),
                    None => (userinfo, ""),
                };
                binding.username = percent_decode(user)?;
                binding.password = percent_decode(password)?;
                host_port
            }
            None => authority,
        };

        let (host, port) = split_host_port(host_port)?;
        binding.set_host(host);
        if let Some(port) = port {
            if !protocol.has_port() {
                return Err(RpcError::InvalidBinding(format!(
                    "port is not allowed for {}",
                    protocol.scheme()
                )));
            }
            port.parse::<u16>()
                .map_err(|_| RpcError::InvalidBinding(format!("invalid port: {}", port)))?;
            binding.endpoint = port.to_string();
        }

        let mut uuids: Vec<(Uuid, Option<(u16, u16)>)> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for segment in path.split('/').filter(|p| !p.is_empty()) {
            let segment = percent_decode(segment)?;
            if let Some(uuid) = Uuid::parse(&segment) {
                uuids.push((uuid, None));
            } else if let Some(version) = parse_version(&segment) {
                match uuids.last_mut() {
                    Some((_, slot @ None)) => *slot = Some(version),
                    _ => {
                        return Err(RpcError::InvalidBinding(format!(
                            "version {} does not follow an interface uuid",
                            segment
                        )))
                    }
                }
            } else if !uuids.is_empty() {
                return Err(RpcError::InvalidBinding(format!(
                    "unexpected path segment {}",
                    segment
                )));
            } else {
                names.push(segment);
            }
        }

        match uuids.as_slice() {
            [] => {}
            [(uuid, None)] => binding.object = Some(*uuid),
            [(uuid, Some((major, minor)))] => {
                binding.interface = Some(SyntaxId::new(*uuid, *major, *minor))
            }
            [(object, None), (iface, version)] => {
                let (major, minor) = version.unwrap_or((1, 0));
                binding.object = Some(*object);
                binding.interface = Some(SyntaxId::new(*iface, major, minor));
            }
            _ => {
                return Err(RpcError::InvalidBinding(format!(
                    "too many uuids in {}",
                    path
                )))
            }
        }

        if !names.is_empty() {
            match protocol {
                ProtocolSequence::NamedPipe | ProtocolSequence::Lrpc => {
                    binding.set_endpoint(&names.join("\\"));
                }
                _ => {
                    return Err(RpcError::InvalidBinding(format!(
                        "{} bindings take a port, not a path",
                        protocol.scheme()
                    )))
                }
            }
        }

        if let Some(query) = query {
            for extra in query.split('&').filter(|e| !e.is_empty()) {
                binding.extras.push(percent_decode(extra)?);
            }
        }

        Ok(binding)
    }

    /// Render as a URL (for display and logging)
    pub fn to_url(&self) -> String {
        let mut url = format!("{}://", self.protocol.scheme());
        if !self.username.is_empty() {
            url.push_str(&percent_encode(&self.username));
            if !self.password.is_empty() {
                url.push(':');
                url.push_str(&percent_encode(&self.password));
            }
            url.push('@');
        }
        if self.network_address.contains(':') {
            url.push_str(&format!("[{}]", self.network_address));
        } else {
            url.push_str(self.host());
        }
        if !self.endpoint.is_empty() {
            if self.protocol.has_port() {
                url.push(':');
                url.push_str(&self.endpoint);
            } else {
                let name = strip_pipe_prefix(&self.endpoint);
                for part in name.split('\\').filter(|p| !p.is_empty()) {
                    url.push('/');
                    url.push_str(&percent_encode(part));
                }
            }
        }
        match (&self.object, &self.interface) {
            (Some(object), Some(iface)) => {
                url.push_str(&format!(
                    "/{}/{}/v{}.{}",
                    object,
                    iface.uuid,
                    iface.major_version(),
                    iface.minor_version()
                ));
            }
            (Some(object), None) => url.push_str(&format!("/{}", object)),
            (None, Some(iface)) => url.push_str(&format!(
                "/{}/v{}.{}",
                iface.uuid,
                iface.major_version(),
                iface.minor_version()
            )),
            (None, None) => {}
        }
        if !self.extras.is_empty() {
            url.push('?');
            let extras: Vec<String> = self.extras.iter().map(|e| percent_encode(e)).collect();
            url.push_str(&extras.join("&"));
        }
        url
    }
}

impl fmt::Display for StringBinding {
    /// Native grammar, without credentials
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(object) = &self.object {
            write!(f, "{}@", object)?;
        }
        write!(f, "{}:{}", self.protocol.name(), self.host())?;
        if !self.endpoint.is_empty() || !self.extras.is_empty() {
            write!(f, "[{}", self.endpoint)?;
            for extra in &self.extras {
                write!(f, ",{}", extra)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl FromStr for StringBinding {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn normalize_pipe(endpoint: &str) -> String {
    format!("\\PIPE\\{}", strip_pipe_prefix(endpoint))
}

fn strip_pipe_prefix(endpoint: &str) -> &str {
    let trimmed = endpoint.trim_start_matches('\\');
    match trimmed.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("pipe\\") => &trimmed[5..],
        _ => trimmed,
    }
}

fn parse_version(segment: &str) -> Option<(u16, u16)> {
    let version = segment.strip_prefix('v').or_else(|| segment.strip_prefix('V'))?;
    let (major, minor) = version.split_once('.').unwrap_or((version, "0"));
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn split_host_port(host_port: &str) -> Result<(&str, Option<&str>)> {
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| RpcError::InvalidBinding(format!("unterminated ipv6 host {}", host_port)))?;
        return Ok((host, after.strip_prefix(':')));
    }
    Ok(match host_port.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (host_port, None),
    })
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~=".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| RpcError::InvalidBinding(format!("bad percent escape in {}", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| RpcError::InvalidBinding(format!("invalid utf-8 in {}", s)))
}

/// A server address: a literal IP, a host name or a full string binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Address to connect to
    pub host: String,
    pub ip: Option<IpAddr>,
    /// The binding, when the address was given as one
    pub binding: Option<StringBinding>,
    /// Default service principal name, `host/<name>`
    pub target_name: String,
    /// Credential embedded in a binding URL
    pub credential: Option<Credential>,
}

impl ServerAddr {
    /// Resolve the address syntactically; no name lookup or dial happens here.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RpcError::InvalidBinding("server is required".into()));
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self {
                host: s.to_string(),
                ip: Some(ip),
                binding: None,
                target_name: format!("host/{}", s),
                credential: None,
            });
        }

        let is_hostname = s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
        if is_hostname {
            return Ok(Self {
                host: s.to_string(),
                ip: None,
                binding: None,
                target_name: format!("host/{}", s),
                credential: None,
            });
        }

        let binding = StringBinding::parse(s)?;
        let host = binding.host().to_string();
        let credential = if binding.username.is_empty() {
            None
        } else {
            let password = (!binding.password.is_empty()).then_some(binding.password.as_str());
            Some(Credential::parse(&binding.username, password)?)
        };
        Ok(Self {
            ip: host.parse().ok(),
            target_name: format!("host/{}", host),
            host,
            binding: Some(binding),
            credential,
        })
    }
}
