use async_trait::async_trait;
use miette::{Diagnostic, Result};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::{
    config::{CfgStore, StoreBackend},
    fingerprint::Fingerprint,
    hardening::Access,
};

pub mod memory;
pub mod redis;

/// Outcome of one atomic check-and-update of a greylist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// First sighting; the pair is now pending.
    New,
    /// Seen before, but too recently to be let through.
    Pending,
    /// Retried successfully; the pair is cleared.
    Allow,
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("Redis error")]
    #[diagnostic(code(qdgrey::store::redis))]
    Redis(#[from] ::redis::RedisError),

    #[error("Store did not answer within {0:?}")]
    #[diagnostic(code(qdgrey::store::timeout))]
    Timeout(Duration),

    #[error("Unexpected greylist outcome {0}")]
    #[diagnostic(code(qdgrey::store::unexpected_outcome))]
    UnexpectedOutcome(i64),
}

/// The only way greylist entries are read or written.
#[async_trait]
pub trait GreylistStore: Send + Sync {
    async fn decide(&self, fingerprint: &Fingerprint) -> Result<Decision, StoreError>;
    fn name(&self) -> &'static str;
}

/// Builds the configured store, along with the resources it needs once the
/// process has been restricted.
pub fn open(cfg: &CfgStore) -> Result<(Box<dyn GreylistStore>, Access)> {
    match cfg.backend {
        StoreBackend::Memory => {
            let retry_delay = Duration::from_secs(cfg.retry_delay_secs.unwrap_or(0));
            info!(
                ?retry_delay,
                "Using in-memory greylist, state is lost on exit and not shared with other processes"
            );
            Ok((
                Box::new(memory::MemoryStore::new(retry_delay)),
                Access::StdioOnly,
            ))
        }
        StoreBackend::Redis => {
            let addr = redis::StoreAddr::parse(cfg.addr.as_deref().unwrap_or_default());
            let access = addr.access();
            let store = redis::RedisStore::open(&addr, cfg)?;
            info!(%addr, "Using Redis greylist");
            Ok((Box::new(store), access))
        }
    }
}
