use camino::Utf8Path;
use config::{Config, File, FileFormat, Value};
use miette::{bail, IntoDiagnostic, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Cfg {
    #[serde(default)]
    pub store: CfgStore,
    #[serde(default)]
    pub filter: CfgFilter,
    #[serde(default)]
    pub log: CfgLog,
    /// Restrict process privileges before reading any input.
    #[serde(default = "default_hardening")]
    pub hardening: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgStore {
    pub backend: StoreBackend,
    /// `HOST:PORT`, `/SOCKET` or a `redis://` URL.
    pub addr: Option<String>,
    pub key_prefix: String,
    pub timeout_secs: u64,
    /// Minimum wait before a retry is let through. Defaults to 0 for the
    /// memory backend and 300 for Redis.
    pub retry_delay_secs: Option<u64>,
    /// How long after the first sighting a retry still counts (Redis only).
    pub retry_window_secs: u64,
    /// How long a cleared pair stays cleared after its last sighting
    /// (Redis only).
    pub whitelist_ttl_secs: u64,
}

impl Default for CfgStore {
    fn default() -> Self {
        CfgStore {
            backend: StoreBackend::Memory,
            addr: None,
            key_prefix: "opensmtpd-filter-qdgrey".to_string(),
            timeout_secs: 5,
            retry_delay_secs: None,
            retry_window_secs: 60 * 60 * 24,
            whitelist_ttl_secs: 60 * 60 * 24 * 7,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgFilter {
    pub reject_code: u16,
    pub reject_message: String,
}

impl Default for CfgFilter {
    fn default() -> Self {
        CfgFilter {
            reject_code: 450,
            reject_message: "Greylisted".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgLog {
    /// An `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

fn default_hardening() -> bool {
    true
}

impl Cfg {
    /// Loads the optional TOML file at `cfg_path`, then applies `overrides`
    /// (dotted keys, e.g. `store.addr`) on top.
    pub fn load(cfg_path: Option<&Utf8Path>, overrides: Vec<(&str, Value)>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = cfg_path {
            builder = builder.add_source(File::from(path.as_std_path()).format(FileFormat::Toml));
        }

        for (key, value) in overrides {
            builder = builder.set_override(key, value).into_diagnostic()?;
        }

        let settings = builder.build().into_diagnostic()?;
        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let store = &self.store;

        if store.backend == StoreBackend::Redis && store.addr.as_deref().unwrap_or("").is_empty() {
            bail!("store.addr is required for the redis backend");
        }
        if store.timeout_secs == 0 {
            bail!("store.timeout_secs must be positive");
        }
        if store.whitelist_ttl_secs == 0 {
            bail!("store.whitelist_ttl_secs must be positive");
        }
        if store.backend == StoreBackend::Redis
            && store.retry_window_secs <= store.retry_delay_secs.unwrap_or(300)
        {
            bail!("store.retry_window_secs must exceed store.retry_delay_secs");
        }
        if !(400..500).contains(&self.filter.reject_code) {
            bail!(
                "filter.reject_code {} is not a temporary failure (4xx)",
                self.filter.reject_code
            );
        }

        Ok(())
    }
}
