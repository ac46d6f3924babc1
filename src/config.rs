//! Configuration loading and schema definitions for charmguard.
//!
//! Configuration comes from an optional TOML file. Every setting has a
//! default, and the environment lists can additionally be overridden through
//! `CHARM_TEST_ENVS` and `BUNDLE_TEST_ENVS`.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads charmguard configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use charmguard::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("charmguard.toml"))?;
/// println!("Max parallel: {}", config.guardian.max_parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads charmguard configuration from a TOML string.
///
/// # Example
///
/// ```
/// use charmguard::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [environments]
///     charm = ["local", "amazon"]
/// "#)?;
///
/// assert_eq!(config.environments.charm.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
