//! Configuration schema definitions for charmguard.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every table and field has a default, so an empty
//! file (or no file at all) yields a working configuration that tests against
//! the single `local` environment.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── GuardianConfig         - Parallelism, recursion depth, deployment policy
//! ├── EnvironmentsConfig     - Environment lists for charm and bundle runs
//! ├── SuiteConfig            - How the external suite binary is invoked
//! └── StoreConfig            - Bundle catalogue used for recursive testing
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::artifact::Kind;

/// Environment variable overriding the charm environment list.
pub const CHARM_ENVS_VAR: &str = "CHARM_TEST_ENVS";

/// Environment variable overriding the bundle environment list.
pub const BUNDLE_ENVS_VAR: &str = "BUNDLE_TEST_ENVS";

/// Root configuration structure for charmguard.
///
/// # TOML Structure
///
/// ```toml
/// [guardian]
/// max_parallel = 4
/// deployments = "all"
///
/// [environments]
/// charm = ["local", "amazon"]
/// bundle = ["local"]
///
/// [suite]
/// program = "/usr/local/bin/bundletester"
///
/// [store]
/// url = "https://manage.jujucharms.com"
/// ```
///
/// # Example
///
/// ```
/// use charmguard::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [guardian]
///     max_parallel = 2
/// "#).unwrap();
/// assert_eq!(config.guardian.max_parallel, 2);
/// assert_eq!(config.environments.charm, vec!["local".to_string()]);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core orchestration settings.
    #[serde(default)]
    pub guardian: GuardianConfig,

    /// Environment lists for charm and bundle runs.
    #[serde(default)]
    pub environments: EnvironmentsConfig,

    /// External suite binary settings.
    #[serde(default)]
    pub suite: SuiteConfig,

    /// Bundle catalogue settings.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Core orchestration settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | number of available CPUs |
/// | `max_depth` | 2 |
/// | `deployments` | `random` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuardianConfig {
    /// Maximum number of suite invocations running at once within one fan-out.
    ///
    /// Default: one per available processing unit.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Maximum recursion depth of the charm → bundle pipeline.
    ///
    /// The top-level artifact is depth 0. A charm at depth `d` only tests
    /// related bundles when `d < max_depth`.
    ///
    /// Default: 2
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// How a deployment is chosen when a bundle declares several.
    #[serde(default)]
    pub deployments: DeploymentPolicy,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_depth: default_max_depth(),
            deployments: DeploymentPolicy::default(),
        }
    }
}

fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_max_depth() -> usize {
    2
}

/// Selection policy for bundles declaring multiple deployments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPolicy {
    /// Test one deployment chosen uniformly at random.
    #[default]
    Random,
    /// Test every declared deployment, in file order.
    All,
}

/// Named execution environments, in the order verdicts are reduced.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentsConfig {
    /// Environments a charm's own suite runs against.
    ///
    /// Overridden by `CHARM_TEST_ENVS`. Default: `["local"]`
    #[serde(default = "default_environments")]
    pub charm: Vec<String>,

    /// Environments each bundle deployment runs against.
    ///
    /// Overridden by `BUNDLE_TEST_ENVS`. Default: `["local"]`
    #[serde(default = "default_environments")]
    pub bundle: Vec<String>,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            charm: default_environments(),
            bundle: default_environments(),
        }
    }
}

fn default_environments() -> Vec<String> {
    vec!["local".to_string()]
}

impl EnvironmentsConfig {
    /// Returns the environments to test an artifact of `kind` against.
    ///
    /// The process environment takes precedence over the configured lists.
    pub fn resolve(&self, kind: Kind) -> Vec<String> {
        self.resolve_with(kind, |var| std::env::var(var).ok())
    }

    /// Like [`resolve`](Self::resolve), reading variables through `lookup`.
    pub fn resolve_with(&self, kind: Kind, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let (var, configured) = match kind {
            Kind::Charm => (CHARM_ENVS_VAR, &self.charm),
            Kind::Bundle => (BUNDLE_ENVS_VAR, &self.bundle),
        };

        let envs = match lookup(var) {
            Some(value) => parse_env_list(&value),
            None => dedup_envs(configured.iter().cloned()),
        };

        if envs.is_empty() {
            default_environments()
        } else {
            envs
        }
    }
}

/// Splits a comma-separated environment list, trimming whitespace.
///
/// Repeated names are dropped, keeping the first occurrence; results are
/// keyed by environment so a repeat would overwrite an earlier verdict.
pub fn parse_env_list(value: &str) -> Vec<String> {
    dedup_envs(
        value
            .split(',')
            .map(str::trim)
            .filter(|env| !env.is_empty())
            .map(str::to_string),
    )
}

fn dedup_envs(envs: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    envs.into_iter()
        .filter(|env| seen.insert(env.clone()))
        .collect()
}

/// Settings for the external suite binary.
///
/// # Example
///
/// ```toml
/// [suite]
/// program = "bundletester"
/// environment_variable = "JUJU_ENV"
/// no_tests_exit_code = 3
/// max_output_bytes = 65536
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Program to execute. Default: `bundletester`
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Variable naming the target environment for the child process.
    ///
    /// Default: `JUJU_ENV`
    #[serde(default = "default_environment_variable")]
    pub environment_variable: String,

    /// Exit status meaning "no applicable tests were found". Default: 3
    #[serde(default = "default_no_tests_exit_code")]
    pub no_tests_exit_code: i32,

    /// Upper bound on captured output replayed into a synthesized outcome.
    ///
    /// Only the tail of the output is kept. Default: 1 MiB
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Turn a swapped-in charm directory into a bzr branch before testing
    /// a bundle with it. Default: true
    #[serde(default = "default_true")]
    pub init_charm_branch: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            environment_variable: default_environment_variable(),
            no_tests_exit_code: default_no_tests_exit_code(),
            max_output_bytes: default_max_output_bytes(),
            init_charm_branch: true,
        }
    }
}

fn default_program() -> PathBuf {
    PathBuf::from("bundletester")
}

fn default_environment_variable() -> String {
    "JUJU_ENV".to_string()
}

fn default_no_tests_exit_code() -> i32 {
    3
}

fn default_max_output_bytes() -> u64 {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Settings for the bundle catalogue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Base URL of the catalogue API.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// HTTP timeout in seconds. Default: 30
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            timeout_secs: default_store_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "https://manage.jujucharms.com".to_string()
}

fn default_store_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.environments.charm, vec!["local"]);
        assert_eq!(config.environments.bundle, vec!["local"]);
        assert_eq!(config.guardian.deployments, DeploymentPolicy::Random);
        assert_eq!(config.suite.no_tests_exit_code, 3);
        assert!(config.guardian.max_parallel >= 1);
    }

    #[test]
    fn test_deployment_policy_parses() {
        let config: Config = toml::from_str(
            r#"
            [guardian]
            deployments = "all"
            "#,
        )
        .unwrap();
        assert_eq!(config.guardian.deployments, DeploymentPolicy::All);
    }

    #[test]
    fn test_env_var_overrides_configured_list() {
        let envs = EnvironmentsConfig::default();
        let resolved = envs.resolve_with(Kind::Charm, |var| {
            (var == CHARM_ENVS_VAR).then(|| "local, amazon ,".to_string())
        });
        assert_eq!(resolved, vec!["local", "amazon"]);

        let bundle = envs.resolve_with(Kind::Bundle, |var| {
            (var == CHARM_ENVS_VAR).then(|| "amazon".to_string())
        });
        assert_eq!(bundle, vec!["local"]);
    }

    #[test]
    fn test_configured_list_order_is_kept() {
        let envs = EnvironmentsConfig {
            charm: vec!["hp".into(), "amazon".into(), "local".into()],
            bundle: vec![],
        };
        assert_eq!(
            envs.resolve_with(Kind::Charm, |_| None),
            vec!["hp", "amazon", "local"]
        );
        assert_eq!(envs.resolve_with(Kind::Bundle, |_| None), vec!["local"]);
    }

    #[test]
    fn test_repeated_environments_run_once() {
        assert_eq!(
            parse_env_list("local,amazon,local, amazon"),
            vec!["local", "amazon"]
        );

        let envs = EnvironmentsConfig {
            charm: vec!["hp".into(), "hp".into(), "local".into()],
            bundle: vec![],
        };
        assert_eq!(envs.resolve_with(Kind::Charm, |_| None), vec!["hp", "local"]);
    }
}
