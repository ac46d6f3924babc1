//! charmguard CLI - test a charm or bundle and print the result as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use charmguard::config::{self, Config, DeploymentPolicy};
use charmguard::fetch::VcsFetcher;
use charmguard::orchestrator::{Orchestrator, TestError, TestOptions};
use charmguard::report::{ResultNode, print_summary};
use charmguard::store::CharmworldIndex;
use charmguard::suite::BundletesterRunner;

const DEFAULT_CONFIG: &str = "charmguard.toml";

/// Time allowed for running suites to be torn down after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const EXIT_FAIL: i32 = 1;
const EXIT_ERROR: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

const EXAMPLES: &str = "\
Use CHARM_TEST_ENVS and BUNDLE_TEST_ENVS to control which Juju environments
are used for tests (default is 'local').

EXAMPLES

  # Test a Launchpad branch at tip
  charmguard lp:~charmers/charms/precise/ghost/trunk

  # Test a Launchpad merge proposal
  charmguard lp:~user/charms/precise/apache2/fix/+merge/221102

  # Test a Github repo at a specific revision
  charmguard gh:charms/apache2 52e73d

  # Test a local directory without related bundles
  charmguard --shallow local:~/src/charms/precise/meteor";

#[derive(Parser)]
#[command(name = "charmguard")]
#[command(about = "Test runner for Juju charms and bundles", long_about = None)]
#[command(version, after_help = EXAMPLES)]
struct Cli {
    /// URL of the charm, bundle or merge proposal to test
    url: String,

    /// Revision to test. Defaults to the head of the branch implied by the URL
    revision: Option<String>,

    /// Configuration file path [default: charmguard.toml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fetch into this directory and keep it after the run
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Do not test bundles that deploy the charm
    #[arg(long)]
    shallow: bool,

    /// Deployment constraints passed to the suite binary
    #[arg(long)]
    constraints: Option<String>,

    /// Bundle deployment to test
    #[arg(short, long)]
    deployment: Option<String>,

    /// Test every deployment a bundle declares instead of a random one
    #[arg(long, conflicts_with = "deployment")]
    all_deployments: bool,

    /// Override maximum parallel suite runs
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Write the JSON result here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; stdout is reserved for the result document.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = load(cli.config.as_deref())?;
    if let Some(parallel) = cli.parallel {
        config.guardian.max_parallel = parallel.max(1);
    }
    if cli.all_deployments {
        config.guardian.deployments = DeploymentPolicy::All;
    }

    let token = CancellationToken::new();
    let listener = tokio::spawn(forward_interrupt(token.clone()));

    let orchestrator = Orchestrator::new(
        config.clone(),
        VcsFetcher::new(),
        BundletesterRunner::new(config.suite.clone()),
        CharmworldIndex::new(&config.store),
    )
    .with_cancellation(token.clone());

    let options = TestOptions {
        shallow: cli.shallow,
        workspace: cli.workspace,
        constraints: cli.constraints,
        deployment: cli.deployment,
    };

    let outcome = tokio::select! {
        outcome = orchestrator.test(&cli.url, cli.revision.as_deref(), &options) => outcome,
        _ = async {
            token.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => Err(TestError::Cancelled),
    };
    listener.abort();

    match outcome {
        Ok(node) => {
            write_result(&node, cli.output.as_deref())?;
            print_summary(&node);
            Ok(if node.is_fail() { EXIT_FAIL } else { 0 })
        }
        Err(TestError::Cancelled) => {
            warn!("Test run of {} interrupted", cli.url);
            Ok(EXIT_INTERRUPTED)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to test {}", cli.url)),
    }
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            info!("Loaded configuration from {}", DEFAULT_CONFIG);
            config::load_config(Path::new(DEFAULT_CONFIG))
        }
        None => {
            debug!("No {} found, using defaults", DEFAULT_CONFIG);
            Ok(Config::default())
        }
    }
}

fn write_result(node: &ResultNode, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(node).context("Failed to serialize result")?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))
                .with_context(|| format!("Failed to write result to {}", path.display()))?;
            info!("Result written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Cancels `token` on the first SIGINT or SIGTERM.
async fn forward_interrupt(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut interrupt), Ok(mut terminate)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("Failed to install signal handlers, interrupts will not be graceful");
            return;
        };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }

    warn!("Interrupted, stopping test run");
    token.cancel();
}
