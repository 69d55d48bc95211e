//! CLI command implementations.

mod info;
mod pair;
mod run;

pub use info::show_info;
pub use pair::{pair, unpair, PairMode};
pub use run::run_service;

use hypo_core::Config;

/// Fold CLI flags into the service configuration
pub fn build_config(
    name: String,
    relay_url: Option<String>,
    relay_fingerprint: Option<String>,
    relay_api_url: Option<String>,
) -> anyhow::Result<Config> {
    let mut config = Config {
        device_name: Some(name),
        ..Config::default()
    };

    if let Some(raw) = relay_url {
        config.relay_url = Some(raw.parse()?);
    }
    config.relay_fingerprint_sha256 = relay_fingerprint;
    if let Some(raw) = relay_api_url {
        config.relay_api_url = Some(raw.parse()?);
    }

    Ok(config)
}
