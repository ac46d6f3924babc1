//! Thin wrappers around the bzr, git, hg and charm command-line tools.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use super::{FetchError, FetchResult};

/// Version-control system of a checked-out tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vcs {
    Bzr,
    Git,
    Hg,
}

impl Vcs {
    /// Detects the VCS of `dir` from its metadata directory.
    pub fn detect(dir: &Path) -> Option<Self> {
        if dir.join(".bzr").is_dir() {
            Some(Vcs::Bzr)
        } else if dir.join(".git").exists() {
            Some(Vcs::Git)
        } else if dir.join(".hg").is_dir() {
            Some(Vcs::Hg)
        } else {
            None
        }
    }

    /// Returns the revision currently checked out in `dir`.
    pub async fn revision(self, dir: &Path) -> FetchResult<String> {
        match self {
            Vcs::Bzr => {
                // "<revno> <revision-id>"
                let info = run("bzr", &["revision-info"], Some(dir)).await?;
                let mut fields = info.split_whitespace();
                let revno = fields.next().unwrap_or_default();
                Ok(fields.next().unwrap_or(revno).to_string())
            }
            Vcs::Git => run("git", &["rev-parse", "HEAD"], Some(dir)).await,
            Vcs::Hg => {
                run(
                    "hg",
                    &["log", "-l", "1", "--template", "{node}", "-r", "."],
                    Some(dir),
                )
                .await
            }
        }
    }
}

/// Runs `program` with `args`, returning trimmed stdout.
pub(crate) async fn run(program: &str, args: &[&str], cwd: Option<&Path>) -> FetchResult<String> {
    let mut argv = vec![program];
    argv.extend_from_slice(args);
    let command = shell_words::join(&argv);
    debug!("Running: {}", command);

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let output = cmd.output().await.map_err(|source| FetchError::Spawn {
        command: command.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(FetchError::Command {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("{}: {}", command, stdout);
    Ok(stdout)
}

pub(crate) async fn bzr_branch(branch: &str, dir: &Path, revision: Option<&str>) -> FetchResult<()> {
    let dir = dir.to_string_lossy();
    let mut args = vec!["branch", "--use-existing-dir", branch, dir.as_ref()];
    if let Some(revision) = revision {
        args.extend(["-r", revision]);
    }
    run("bzr", &args, None).await.map(drop)
}

pub(crate) async fn git_clone(remote: &str, dir: &Path, revision: Option<&str>) -> FetchResult<()> {
    let target = dir.to_string_lossy();
    run("git", &["clone", remote, target.as_ref()], None).await?;
    if let Some(revision) = revision {
        run("git", &["checkout", revision], Some(dir)).await?;
    }
    Ok(())
}

pub(crate) async fn hg_clone(remote: &str, dir: &Path, revision: Option<&str>) -> FetchResult<()> {
    let target = dir.to_string_lossy();
    let mut args = vec!["clone", remote, target.as_ref()];
    if let Some(revision) = revision {
        args.extend(["-u", revision]);
    }
    run("hg", &args, None).await.map(drop)
}

/// Turns `dir` into a standalone bzr branch with everything committed.
///
/// The deployer only accepts branch references for local charms. A
/// directory that already has `.bzr` is left alone.
pub async fn init_bzr_branch(dir: &Path) -> FetchResult<()> {
    if dir.join(".bzr").exists() {
        return Ok(());
    }

    debug!("Creating local bzr branch in {}", dir.display());
    run("bzr", &["init"], Some(dir)).await?;
    run("bzr", &["add", "."], Some(dir)).await?;
    run(
        "bzr",
        &[
            "commit",
            "--unchanged",
            "-m",
            "Creating local branch for deployer",
        ],
        Some(dir),
    )
    .await?;
    Ok(())
}
