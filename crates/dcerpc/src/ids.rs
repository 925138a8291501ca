//! Monotonic identifier generation
//!
//! Presentation context ids and security context ids must be unique and
//! strictly increasing within the scope that shares transports. A generator
//! is injected through the dial options; [`IdGenerator::process`] returns
//! the process-wide default.

use crate::error::{Result, RpcError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
pub struct IdGenerator {
    presentation: AtomicU32,
    security: AtomicU32,
}

static PROCESS: OnceLock<Arc<IdGenerator>> = OnceLock::new();

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generator shared by every connection group of this process
    pub fn process() -> Arc<IdGenerator> {
        PROCESS.get_or_init(|| Arc::new(IdGenerator::new())).clone()
    }

    /// Next presentation context id. Ids are never reused; the space of
    /// 16-bit ids is exhausted rather than wrapped.
    pub fn next_presentation(&self) -> Result<u16> {
        let id = self.presentation.fetch_add(1, Ordering::Relaxed);
        u16::try_from(id)
            .map_err(|_| RpcError::InvalidConfig("presentation context ids exhausted".into()))
    }

    /// Next security context id
    pub fn next_security(&self) -> u32 {
        self.security.fetch_add(1, Ordering::Relaxed)
    }
}
