use camino::Utf8PathBuf;
use clap::Parser;
use ::config::Value;
use filter::FilterServer;
use miette::{Context, Result};
use tokio::io::{stdin, stdout, BufReader};
use tracing::{error, info};

mod callbacks;
mod config;
mod fingerprint;
mod hardening;
mod logging;
mod sessions;
mod storage;

use callbacks::Greylister;
use crate::config::{Cfg, LogFormat};

/// Greylisting filter for the OpenSMTPD filter protocol.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Redis server as HOST:PORT, /SOCKET or redis:// URL; selects the Redis greylist
    #[arg(long, value_name = "ADDR")]
    redis: Option<String>,

    /// Log filter directive, e.g. "info" or "qdgrey=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Skip restricting process privileges
    #[arg(long)]
    no_hardening: bool,
}

impl Args {
    fn overrides(&self) -> Vec<(&'static str, Value)> {
        let mut overrides = Vec::new();

        if let Some(addr) = &self.redis {
            overrides.push(("store.backend", Value::from("redis".to_string())));
            overrides.push(("store.addr", Value::from(addr.clone())));
        }
        if let Some(level) = &self.log_level {
            overrides.push(("log.level", Value::from(level.clone())));
        }
        if let Some(format) = self.log_format {
            let format = match format {
                LogFormat::Text => "text",
                LogFormat::Json => "json",
            };
            overrides.push(("log.format", Value::from(format.to_string())));
        }
        if self.no_hardening {
            overrides.push(("hardening", Value::from(false)));
        }

        overrides
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Cfg::load(args.config.as_deref(), args.overrides())
        .wrap_err("error loading configuration")?;

    logging::init(&cfg.log)?;

    let (store, access) = storage::open(&cfg.store).wrap_err("error opening greylist store")?;

    if cfg.hardening {
        hardening::restrict(&access).wrap_err("error restricting process privileges")?;
    }

    let mut server = FilterServer::new(Greylister::new(store, &cfg.filter));
    if let Err(e) = server.run(BufReader::new(stdin()), stdout()).await {
        error!(error = ?e, "Couldn't read stdin");
        return Err(e).wrap_err("filter protocol stream failed");
    }

    info!(
        open_sessions = server.callbacks().sessions().len(),
        "Terminated"
    );
    Ok(())
}
