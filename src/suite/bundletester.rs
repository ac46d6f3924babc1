//! Suite runner driving the external `bundletester` binary.
//!
//! Each invocation gets its own scratch directory holding the JSON report
//! and the captured process output, so concurrent invocations never write
//! to the same path. The target environment is passed to the child through
//! its environment (`JUJU_ENV` by default); the parent process environment
//! is never modified.
//!
//! # Command Line
//!
//! ```text
//! bundletester -F -r json -t <dir> -e <env> -o <report> -l <ERROR|DEBUG>
//!              [-d <deployment>] [-x <exclude>] [-s] [--constraints <c>]
//! ```

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, warn};

use super::{SuiteError, SuiteResult, SuiteRunner, TestCaseOutcome, TestInvocation};
use crate::config::SuiteConfig;

/// Time a terminated child gets to exit before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Runs suites with the `bundletester` binary.
pub struct BundletesterRunner {
    config: SuiteConfig,
}

impl BundletesterRunner {
    /// Creates a runner using the given suite settings.
    pub fn new(config: SuiteConfig) -> Self {
        Self { config }
    }

    /// Builds the argument list for `invocation`, writing its report to `report`.
    pub fn command_args(&self, invocation: &TestInvocation, report: &Path) -> Vec<String> {
        let log_level = if tracing::enabled!(Level::DEBUG) {
            "DEBUG"
        } else {
            "ERROR"
        };

        let mut args = vec![
            "-F".to_string(),
            "-r".to_string(),
            "json".to_string(),
            "-t".to_string(),
            invocation.dir.display().to_string(),
            "-e".to_string(),
            invocation.env.clone(),
            "-o".to_string(),
            report.display().to_string(),
            "-l".to_string(),
            log_level.to_string(),
        ];
        if let Some(deployment) = &invocation.deployment {
            args.push("-d".to_string());
            args.push(deployment.clone());
        }
        if let Some(exclude) = &invocation.exclude {
            args.push("-x".to_string());
            args.push(exclude.clone());
        }
        if invocation.skip_implicit {
            args.push("-s".to_string());
        }
        if let Some(constraints) = &invocation.constraints {
            args.push("--constraints".to_string());
            args.push(constraints.clone());
        }
        args
    }
}

#[async_trait]
impl SuiteRunner for BundletesterRunner {
    async fn run(
        &self,
        invocation: &TestInvocation,
        cancel: &CancellationToken,
    ) -> SuiteResult<Vec<TestCaseOutcome>> {
        let scratch = tempfile::Builder::new()
            .prefix("charmguard-suite-")
            .tempdir()?;
        let report_path = scratch.path().join("result.json");
        let output_path = scratch.path().join("output.log");

        let args = self.command_args(invocation, &report_path);
        let program = self.config.program.display().to_string();
        let mut executable = vec![program.clone()];
        executable.extend(args.iter().cloned());
        debug!("Running {}: {}", self.name(), shell_words::join(&executable));

        let output = std::fs::File::create(&output_path)?;
        let output_err = output.try_clone()?;

        let mut process = tokio::process::Command::new(&self.config.program);
        process
            .args(&args)
            .env(&self.config.environment_variable, &invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(output_err))
            .kill_on_drop(true);

        // Own process group: terminal interrupts go to us, not the suite.
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(|source| SuiteError::Spawn {
            program: program.clone(),
            source,
        })?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                debug!("Terminating {} in env {}", self.name(), invocation.env);
                terminate(&mut child).await;
                return Err(SuiteError::Cancelled);
            }
        };

        let code = status.code().unwrap_or(-1);
        debug!(
            "{} exited with {} for env {}",
            self.name(),
            code,
            invocation.env
        );

        if code == self.config.no_tests_exit_code {
            debug!("No tests found in {}", invocation.dir.display());
            return Ok(Vec::new());
        }

        // A non-zero exit always fails the run, even if the report it left
        // behind only holds passing records.
        let mut outcomes = match read_report(&report_path).await {
            Ok(Some(outcomes)) if code == 0 || outcomes.iter().any(|o| o.is_failure()) => {
                return Ok(outcomes);
            }
            Ok(Some(outcomes)) => {
                warn!(
                    "{} exited with {} but reported no failing test",
                    self.name(),
                    code
                );
                outcomes
            }
            Ok(None) if code == 0 => {
                warn!("{} exited cleanly without writing a report", self.name());
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(e) if code == 0 => return Err(e),
            Err(e) => {
                debug!("Ignoring unusable report after failure: {}", e);
                Vec::new()
            }
        };

        let captured = read_tail(&output_path, self.config.max_output_bytes).await?;
        let detail = if captured.trim().is_empty() {
            "see stderr".to_string()
        } else {
            captured
        };

        outcomes.push(TestCaseOutcome::invocation_failure(
            executable,
            code,
            format!("{} failed: {}", self.name(), detail),
            invocation.dir.display().to_string(),
        ));
        Ok(outcomes)
    }

    fn name(&self) -> &str {
        "bundletester"
    }
}

/// Reads the JSON report, returning `None` if it was never written.
async fn read_report(path: &Path) -> SuiteResult<Option<Vec<TestCaseOutcome>>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| SuiteError::Report {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads at most the last `max_bytes` bytes of a file.
async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len > max_bytes {
        file.seek(std::io::SeekFrom::Start(len - max_bytes)).await?;
    }

    let mut buf = Vec::with_capacity(len.min(max_bytes) as usize);
    file.take(max_bytes).read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Terminates the child's whole process group: SIGTERM first, then SIGKILL
/// for whatever is left of the group after [`TERMINATE_GRACE`].
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    let pgid = child.id().map(|pid| pid as libc::pid_t);

    #[cfg(unix)]
    if let Some(pgid) = pgid {
        // SAFETY: signalling a process group we created; no memory is shared.
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }
    }

    let exited = tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_ok();

    // The leader may be gone while grandchildren ignoring SIGTERM live on.
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        // SAFETY: as above.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }

    if !exited {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill suite process: {}", e);
        }
    }
}
