//! `bastion check` command implementation.
//!
//! Loads and validates a configuration file, then prints the effective
//! configuration (defaults filled in) as YAML.

use anyhow::{Context, Result};
use bastion_core::GatewayConfig;
use std::path::Path;

pub fn check(config_path: &Path) -> Result<()> {
    let rendered = render(config_path)?;
    println!("# {} is valid", config_path.display());
    print!("{}", rendered);
    Ok(())
}

/// Effective configuration of `config_path` as YAML.
pub fn render(config_path: &Path) -> Result<String> {
    let config = GatewayConfig::from_file(config_path)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    config
        .to_yaml()
        .context("failed to serialize effective configuration")
}
