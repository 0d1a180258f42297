use crate::chain::FilterChain;
use crate::config::Config;
use crate::error::{ConfigError, Error, Result};
use crate::plugin::StartOptions;
use tracing::{error, info, warn};

/// Validate the configuration, start every plugin and report the chain.
///
/// Plugins that fail to start are skipped by the chain builder, so the check
/// compares the number of loaded filters with the number of candidates.
pub async fn run_chain_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    if !config.filters.is_enabled() {
        warn!("! No plugin directory configured, filtering is disabled");
        return Ok(());
    }

    let dir = &config.filters.plugin_dir;
    let candidates = crate::chain::discovery::plugin_candidates(dir)?;
    info!(
        "Found {} plugin candidate(s) in {}",
        candidates.len(),
        dir.display()
    );

    let chain = FilterChain::build_with(dir, &StartOptions::from(&config.filters)).await?;
    for (position, name) in chain.names().iter().enumerate() {
        info!("  {}. {}", position + 1, name);
    }

    let loaded = chain.len();
    chain.close().await?;

    if loaded == candidates.len() {
        info!("\n✓ All {} plugin(s) started", loaded);
        Ok(())
    } else {
        error!(
            "✗ {} of {} plugin(s) failed to start",
            candidates.len() - loaded,
            candidates.len()
        );
        Err(Error::Config(ConfigError::Validation(
            "One or more plugins failed to start".to_string(),
        )))
    }
}
