use miette::{miette, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{CfgLog, LogFormat};

/// Installs the global subscriber. Logs always go to stderr: stdout belongs
/// to the filter protocol.
pub fn init(cfg: &CfgLog) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level).into_diagnostic()?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match cfg.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| miette!("failed to install log subscriber: {}", e))
}
