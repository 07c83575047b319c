use async_trait::async_trait;
use camino::Utf8PathBuf;
use redis::{aio::ConnectionManager, Client, Script};
use std::{fmt, time::Duration};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Decision, GreylistStore, StoreError};
use crate::{config::CfgStore, fingerprint::Fingerprint, hardening::Access};

const GREYLIST_SCRIPT: &str = include_str!("greylist.lua");

/// Where the Redis server lives, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAddr {
    /// `HOST:PORT`
    Tcp(String),
    /// `/path/to/socket`
    Unix(Utf8PathBuf),
    /// A full `redis://` or `rediss://` URL.
    Url(String),
}

impl StoreAddr {
    pub fn parse(addr: &str) -> Self {
        if addr.starts_with('/') {
            return StoreAddr::Unix(Utf8PathBuf::from(addr));
        }
        for scheme in ["redis+unix://", "unix://"] {
            if let Some(path) = addr.strip_prefix(scheme) {
                return StoreAddr::Unix(Utf8PathBuf::from(path));
            }
        }
        if addr.contains("://") {
            StoreAddr::Url(addr.to_string())
        } else {
            StoreAddr::Tcp(addr.to_string())
        }
    }

    pub fn connection_url(&self) -> String {
        match self {
            StoreAddr::Tcp(addr) => format!("redis://{}", addr),
            StoreAddr::Unix(path) => format!("redis+unix://{}", path),
            StoreAddr::Url(url) => url.clone(),
        }
    }

    pub fn access(&self) -> Access {
        match self {
            StoreAddr::Unix(path) => Access::Socket(path.clone()),
            StoreAddr::Tcp(_) | StoreAddr::Url(_) => Access::Network,
        }
    }
}

impl fmt::Display for StoreAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreAddr::Tcp(addr) => f.write_str(addr),
            StoreAddr::Unix(path) => f.write_str(path.as_str()),
            StoreAddr::Url(url) => f.write_str(url),
        }
    }
}

/// The pair of keys one fingerprint occupies.
#[derive(Debug, PartialEq, Eq)]
pub struct GreylistKeys {
    pub pending: String,
    pub cleared: String,
}

impl GreylistKeys {
    /// Both keys share the `{fingerprint}` hash tag so they land in the same
    /// cluster slot, which the script requires.
    pub fn new(prefix: &str, fingerprint: &Fingerprint) -> Self {
        GreylistKeys {
            pending: format!("{}{{{}}}grey", prefix, fingerprint),
            cleared: format!("{}{{{}}}white", prefix, fingerprint),
        }
    }
}

/// Greylist shared through Redis.
///
/// Entries expire on their own: a pair left alone past its TTLs is
/// greylisted afresh on its next sighting.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
    timeout: Duration,
    retry_delay: u64,
    retry_window: u64,
    whitelist_ttl: u64,
}

impl RedisStore {
    /// Does not connect; the connection is made on first use.
    pub fn open(addr: &StoreAddr, cfg: &CfgStore) -> Result<Self, StoreError> {
        let client = Client::open(addr.connection_url())?;

        Ok(RedisStore {
            client,
            connection: OnceCell::new(),
            script: Script::new(GREYLIST_SCRIPT),
            key_prefix: cfg.key_prefix.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            retry_delay: cfg.retry_delay_secs.unwrap_or(300),
            retry_window: cfg.retry_window_secs,
            whitelist_ttl: cfg.whitelist_ttl_secs,
        })
    }

    pub fn keys(&self, fingerprint: &Fingerprint) -> GreylistKeys {
        GreylistKeys::new(&self.key_prefix, fingerprint)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(connection.clone())
    }

    async fn run_script(&self, keys: &GreylistKeys) -> Result<i64, StoreError> {
        let mut connection = self.connection().await?;

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&keys.pending)
            .key(&keys.cleared)
            .arg(self.retry_delay)
            .arg(self.retry_window)
            .arg(self.whitelist_ttl);

        let outcome: i64 = invocation.invoke_async(&mut connection).await?;
        Ok(outcome)
    }
}

impl Decision {
    fn from_outcome(outcome: i64) -> Result<Self, StoreError> {
        match outcome {
            0 => Ok(Decision::New),
            1 => Ok(Decision::Pending),
            2 => Ok(Decision::Allow),
            other => Err(StoreError::UnexpectedOutcome(other)),
        }
    }
}

#[async_trait]
impl GreylistStore for RedisStore {
    async fn decide(&self, fingerprint: &Fingerprint) -> Result<Decision, StoreError> {
        let keys = self.keys(fingerprint);
        let outcome = tokio::time::timeout(self.timeout, self.run_script(&keys))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        Decision::from_outcome(outcome)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
