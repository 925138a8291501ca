//! Presentation contexts
//!
//! A presentation context pairs an abstract syntax (interface and version)
//! with the transfer syntax the server picked from the proposed list. Each
//! record is created when bind options are parsed and filled in exactly
//! once, by the bind-ack or alter-context response that answers it.

use crate::dcerpc::{ContextElement, ContextResult, ContextResultEntry, SyntaxId, Uuid};
use crate::error::{Result, RpcError};
use std::str::FromStr;
use std::sync::OnceLock;

/// NDR 2.0 transfer syntax: 8a885d04-1ceb-11c9-9fe8-08002b104860 v2.0
pub const NDR20: SyntaxId = SyntaxId {
    uuid: Uuid {
        time_low: 0x8a88_5d04,
        time_mid: 0x1ceb,
        time_hi_and_version: 0x11c9,
        clock_seq_hi_and_reserved: 0x9f,
        clock_seq_low: 0xe8,
        node: [0x08, 0x00, 0x2b, 0x10, 0x48, 0x60],
    },
    version: 2,
};

/// NDR64 transfer syntax: 71710533-beba-4937-8319-b5dbef9ccc36 v1.0
pub const NDR64: SyntaxId = SyntaxId {
    uuid: Uuid {
        time_low: 0x7171_0533,
        time_mid: 0xbeba,
        time_hi_and_version: 0x4937,
        clock_seq_hi_and_reserved: 0x83,
        clock_seq_low: 0x19,
        node: [0xb5, 0xdb, 0xef, 0x9c, 0xcc, 0x36],
    },
    version: 1,
};

/// Transfer encoding keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    Ndr20,
    Ndr64,
}

impl TransferEncoding {
    pub fn syntax(&self) -> SyntaxId {
        match self {
            Self::Ndr20 => NDR20,
            Self::Ndr64 => NDR64,
        }
    }
}

impl FromStr for TransferEncoding {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ndr20" => Ok(Self::Ndr20),
            "ndr64" => Ok(Self::Ndr64),
            _ => Err(RpcError::InvalidConfig(format!(
                "invalid transfer encoding: {}",
                s
            ))),
        }
    }
}

/// Bind-time feature negotiation bits (MS-RPCE 3.3.1.5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindFeatures(u16);

impl BindFeatures {
    pub const SECURITY_CONTEXT_MULTIPLEXING: u16 = 0x0001;
    pub const KEEP_CONNECTION_ON_ORPHAN: u16 = 0x0002;

    pub fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit == bit
    }

    /// Transfer syntax 6cb71c2c-9812-4540-XXXX-XXXXXXXXXXXX v1.0 whose last
    /// eight bytes carry the requested bits, little-endian.
    pub fn syntax(&self) -> SyntaxId {
        let bits = (self.0 as u64).to_le_bytes();
        SyntaxId::new(
            Uuid {
                time_low: 0x6cb7_1c2c,
                time_mid: 0x9812,
                time_hi_and_version: 0x4540,
                clock_seq_hi_and_reserved: bits[0],
                clock_seq_low: bits[1],
                node: [bits[2], bits[3], bits[4], bits[5], bits[6], bits[7]],
            },
            1,
            0,
        )
    }

    /// Returns true if `syntax` is a feature negotiation syntax
    pub fn is_feature_syntax(syntax: &SyntaxId) -> bool {
        let uuid = &syntax.uuid;
        uuid.time_low == 0x6cb7_1c2c && uuid.time_mid == 0x9812 && uuid.time_hi_and_version == 0x4540
    }

    /// The synthetic context element appended to a bind while unbound
    pub fn context(&self, context_id: u16, abstract_syntax: SyntaxId) -> ContextElement {
        ContextElement::new(context_id, abstract_syntax, self.syntax())
    }

    /// Granted features from the matching bind-ack result
    pub fn from_result(entry: &ContextResultEntry) -> Option<Self> {
        (entry.result == ContextResult::NegotiateAck).then_some(Self(entry.reason))
    }
}

/// One negotiated abstract-syntax/transfer-syntax pairing
#[derive(Debug)]
pub struct Presentation {
    id: u16,
    abstract_syntax: SyntaxId,
    transfer_syntaxes: Vec<SyntaxId>,
    negotiated: OnceLock<SyntaxId>,
    error: OnceLock<(ContextResult, u16)>,
}

impl Presentation {
    pub fn new(id: u16, abstract_syntax: SyntaxId, transfer_syntaxes: Vec<SyntaxId>) -> Self {
        let transfer_syntaxes = if transfer_syntaxes.is_empty() {
            vec![NDR20]
        } else {
            transfer_syntaxes
        };
        Self {
            id,
            abstract_syntax,
            transfer_syntaxes,
            negotiated: OnceLock::new(),
            error: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn abstract_syntax(&self) -> &SyntaxId {
        &self.abstract_syntax
    }

    pub fn proposed(&self) -> &[SyntaxId] {
        &self.transfer_syntaxes
    }

    /// The accepted transfer syntax
    pub fn transfer_syntax(&self) -> Result<SyntaxId> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.negotiated.get().copied().ok_or(RpcError::NoPresentation)
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated.get().is_some()
    }

    /// The rejection recorded by negotiation, if any
    pub fn error(&self) -> Option<RpcError> {
        self.error.get().map(|(_, reason)| RpcError::ContextRejected {
            context_id: self.id,
            reason: *reason,
        })
    }

    pub fn context_element(&self) -> ContextElement {
        ContextElement {
            context_id: self.id,
            abstract_syntax: self.abstract_syntax,
            transfer_syntaxes: self.transfer_syntaxes.clone(),
        }
    }

    /// Record the server's answer for this context. Later answers for an
    /// already negotiated context are ignored.
    pub fn apply_result(&self, entry: &ContextResultEntry) -> Result<()> {
        if self.is_negotiated() || self.error.get().is_some() {
            return self.transfer_syntax().map(|_| ());
        }
        match entry.result {
            ContextResult::Acceptance => {
                if !self.transfer_syntaxes.contains(&entry.transfer_syntax) {
                    return Err(RpcError::ProtocolError(format!(
                        "server accepted context {} with unproposed transfer syntax {}",
                        self.id, entry.transfer_syntax
                    )));
                }
                let _ = self.negotiated.set(entry.transfer_syntax);
                Ok(())
            }
            result => {
                let _ = self.error.set((result, entry.reason));
                Err(RpcError::ContextRejected {
                    context_id: self.id,
                    reason: entry.reason,
                })
            }
        }
    }
}
