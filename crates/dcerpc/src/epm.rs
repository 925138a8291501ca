//! Endpoint mapping
//!
//! The Endpoint Mapper allows DCE RPC services to register their endpoints
//! and allows clients to look up where services are located. A client
//! without an explicit endpoint asks an [`EndpointMapper`] for candidate
//! bindings; the tower encoding of a remote `ept_map` query lives with the
//! generated stubs, so the engine only sees the resulting bindings.
//!
//! Well-known port: 135 (TCP)
//! Interface UUID: e1af8308-5d1f-11c9-91a4-08002b14a0fa

use crate::binding::{ProtocolSequence, ServerAddr, StringBinding};
use crate::dcerpc::{SyntaxId, Uuid};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

/// Well-known port for the Endpoint Mapper
pub const EPM_PORT: u16 = 135;

/// Well-known pipe for the Endpoint Mapper
pub const EPM_PIPE_NAME: &str = r"\PIPE\epmapper";

/// Endpoint Mapper interface, v3.0
pub const EPM_INTERFACE: SyntaxId = SyntaxId {
    uuid: Uuid {
        time_low: 0xe1af_8308,
        time_mid: 0x5d1f,
        time_hi_and_version: 0x11c9,
        clock_seq_hi_and_reserved: 0x91,
        clock_seq_low: 0xa4,
        node: [0x08, 0x00, 0x2b, 0x14, 0xa0, 0xfa],
    },
    version: 3,
};

/// Resolves an abstract syntax to candidate bindings on a server
#[async_trait]
pub trait EndpointMapper: Send + Sync {
    async fn map(&self, addr: &ServerAddr, syntax: &SyntaxId) -> Result<Vec<StringBinding>>;
}

struct Entry {
    syntax: SyntaxId,
    binding: StringBinding,
}

/// A fixed table of endpoints.
///
/// Entries match on interface uuid and major version. Entries without a
/// host take the host of the address being mapped.
#[derive(Default)]
pub struct StaticEndpointMapper {
    entries: RwLock<Vec<Entry>>,
}

impl StaticEndpointMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, syntax: SyntaxId, binding: StringBinding) {
        self.entries.write().push(Entry { syntax, binding });
    }

    pub fn with_entry(self, syntax: SyntaxId, binding: StringBinding) -> Self {
        self.register(syntax, binding);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl EndpointMapper for StaticEndpointMapper {
    async fn map(&self, addr: &ServerAddr, syntax: &SyntaxId) -> Result<Vec<StringBinding>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|e| {
                e.syntax.uuid == syntax.uuid && e.syntax.major_version() == syntax.major_version()
            })
            .map(|e| {
                let mut binding = e.binding.clone();
                if binding.host().is_empty() {
                    binding.set_host(&addr.host);
                }
                binding
            })
            .collect())
    }
}

/// The endpoints every server exposes: the Endpoint Mapper itself
pub fn well_known() -> StaticEndpointMapper {
    StaticEndpointMapper::new()
        .with_entry(
            EPM_INTERFACE,
            StringBinding::new(ProtocolSequence::Tcp, "", &EPM_PORT.to_string()),
        )
        .with_entry(
            EPM_INTERFACE,
            StringBinding::new(ProtocolSequence::NamedPipe, "", EPM_PIPE_NAME),
        )
}
