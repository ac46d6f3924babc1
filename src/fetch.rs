//! Fetching charms and bundles into a local workspace.
//!
//! An artifact URL selects one [`Source`] variant, resolved once when the URL
//! is parsed:
//!
//! | URL form | Source | Fetched with |
//! |----------|--------|--------------|
//! | `lp:`, `launchpad:`, `https://code.launchpad.net/...` | [`Source::Bzr`] | `bzr branch` |
//! | same, path containing `/+merge/` | [`Source::MergeProposal`] | Launchpad API + `bzr merge` |
//! | `gh:`, `github:`, `https://github.com/...` | [`Source::Github`] | `git clone` |
//! | `bb:`, `bitbucket:`, `https://bitbucket.org/...` | [`Source::Bitbucket`] | `git clone` or `hg clone` |
//! | `local:<path>` | [`Source::Local`] | directory copy |
//! | `cs:<charm>` | [`Source::CharmStore`] | `charm get` |

pub mod vcs;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::artifact::copy_tree;

pub use vcs::{Vcs, init_bzr_branch};

/// Result type for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors that prevent an artifact from being obtained.
///
/// Any of these short-circuits testing of the artifact into an error node.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to look up merge proposal {url}: {source}")]
    MergeProposal {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Merge proposal {url} has an unexpected {field}: {value}")]
    MergeProposalLink {
        url: String,
        field: &'static str,
        value: String,
    },

    #[error("Local path {} is not a directory", .0.display())]
    MissingPath(PathBuf),

    #[error("Fetching {0} produced no directory")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A Launchpad bzr branch, e.g. `~charmers/charms/precise/mysql/trunk`.
    Bzr { repo: String },
    /// A Launchpad merge proposal: the target branch with the source merged.
    MergeProposal { proposal: String },
    Github { repo: String },
    /// Git when the repository ends in `.git`, Mercurial otherwise.
    Bitbucket { repo: String },
    /// A local directory, `~` expanded.
    Local { path: String },
    CharmStore { charm: String },
}

static LAUNCHPAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:lp:|launchpad:|https?://(?:(?:code|www)\.)?launchpad\.net/)(?P<repo>.+)$")
        .unwrap()
});
static GITHUB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:gh:|github:|https?://(?:www\.)?github\.com/)(?P<repo>.+)$").unwrap()
});
static BITBUCKET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:bb:|bitbucket:|https?://(?:www\.)?bitbucket\.org/)(?P<repo>.+)$").unwrap()
});
static LOCAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^local:(?P<path>.+)$").unwrap());
static CHARM_STORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cs:(?P<charm>.+)$").unwrap());

impl Source {
    /// Parses an artifact URL.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::UnsupportedUrl`] if no scheme matches.
    ///
    /// # Example
    ///
    /// ```
    /// use charmguard::fetch::Source;
    ///
    /// let source = Source::parse("gh:charms/apache2")?;
    /// assert_eq!(source, Source::Github { repo: "charms/apache2".into() });
    /// # Ok::<(), charmguard::fetch::FetchError>(())
    /// ```
    pub fn parse(url: &str) -> FetchResult<Self> {
        let url = url.trim();
        let capture = |re: &Regex, name: &str| {
            re.captures(url)
                .and_then(|c| c.name(name))
                .map(|m| m.as_str().to_string())
        };

        if let Some(repo) = capture(&LAUNCHPAD, "repo") {
            return Ok(if repo.contains("/+merge/") {
                Source::MergeProposal { proposal: repo }
            } else {
                Source::Bzr { repo }
            });
        }
        if let Some(repo) = capture(&GITHUB, "repo") {
            return Ok(Source::Github { repo });
        }
        if let Some(repo) = capture(&BITBUCKET, "repo") {
            return Ok(Source::Bitbucket { repo });
        }
        if let Some(path) = capture(&LOCAL, "path") {
            return Ok(Source::Local { path });
        }
        if let Some(charm) = capture(&CHARM_STORE, "charm") {
            return Ok(Source::CharmStore { charm });
        }

        Err(FetchError::UnsupportedUrl(url.to_string()))
    }
}

/// Obtains artifacts and reports their resolved revision.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `url` at `revision` (latest when `None`) into a new directory
    /// under `dest`, returning the artifact directory.
    async fn fetch(&self, url: &str, revision: Option<&str>, dest: &Path) -> FetchResult<PathBuf>;

    /// Resolves the revision of an artifact previously fetched into `dir`.
    async fn revision(
        &self,
        url: &str,
        revision: Option<&str>,
        dir: &Path,
    ) -> FetchResult<Option<String>>;
}

/// Default Launchpad API root used to resolve merge proposals.
pub const LAUNCHPAD_API: &str = "https://api.launchpad.net/devel/";

/// Fetches artifacts with the version-control tools on `PATH`.
pub struct VcsFetcher {
    client: reqwest::Client,
    launchpad_api: String,
}

#[derive(Debug, Deserialize)]
struct MergeProposalLinks {
    target_branch_link: String,
    source_branch_link: String,
}

impl VcsFetcher {
    pub fn new() -> Self {
        Self::with_api(LAUNCHPAD_API)
    }

    /// Uses `launchpad_api` (ending in `/`) to resolve merge proposals.
    pub fn with_api(launchpad_api: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            launchpad_api: launchpad_api.into(),
        }
    }

    async fn fetch_merge_proposal(&self, proposal: &str, dir: &Path) -> FetchResult<()> {
        let url = format!("{}{}", self.launchpad_api, proposal);
        let links: MergeProposalLinks = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| FetchError::MergeProposal {
                url: url.clone(),
                source,
            })?
            .json()
            .await
            .map_err(|source| FetchError::MergeProposal {
                url: url.clone(),
                source,
            })?;

        let target = self.branch_of(&url, "target_branch_link", &links.target_branch_link)?;
        let source = self.branch_of(&url, "source_branch_link", &links.source_branch_link)?;
        info!("Merging {} into {}", source, target);

        vcs::bzr_branch(&target, dir, None).await?;
        vcs::run("bzr", &["merge", source.as_str()], Some(dir)).await?;
        Ok(())
    }

    fn branch_of(&self, url: &str, field: &'static str, link: &str) -> FetchResult<String> {
        link.strip_prefix(&self.launchpad_api)
            .map(|branch| format!("lp:{}", branch))
            .ok_or_else(|| FetchError::MergeProposalLink {
                url: url.to_string(),
                field,
                value: link.to_string(),
            })
    }
}

impl Default for VcsFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for VcsFetcher {
    async fn fetch(&self, url: &str, revision: Option<&str>, dest: &Path) -> FetchResult<PathBuf> {
        let source = Source::parse(url)?;
        debug!("Fetching {:?} at {:?}", source, revision);

        match source {
            Source::Bzr { repo } => {
                let dir = fresh_dir(dest).await?;
                vcs::bzr_branch(&format!("lp:{}", repo), &dir, revision).await?;
                Ok(dir)
            }
            Source::MergeProposal { proposal } => {
                let dir = fresh_dir(dest).await?;
                self.fetch_merge_proposal(&proposal, &dir).await?;
                Ok(dir)
            }
            Source::Github { repo } => {
                let dir = fresh_dir(dest).await?;
                vcs::git_clone(&format!("https://github.com/{}", repo), &dir, revision).await?;
                Ok(dir)
            }
            Source::Bitbucket { repo } => {
                let dir = fresh_dir(dest).await?;
                let remote = format!("https://bitbucket.org/{}", repo);
                if remote.ends_with(".git") {
                    vcs::git_clone(&remote, &dir, revision).await?;
                } else {
                    vcs::hg_clone(&remote, &dir, revision).await?;
                }
                Ok(dir)
            }
            Source::Local { path } => {
                let src = PathBuf::from(shellexpand::tilde(&path).as_ref());
                if !src.is_dir() {
                    return Err(FetchError::MissingPath(src));
                }
                let name = src
                    .file_name()
                    .map(|n| n.to_os_string())
                    .ok_or_else(|| FetchError::MissingPath(src.clone()))?;
                let dst = fresh_dir(dest).await?.join(name);
                copy_tree(&src, &dst, None).await?;
                Ok(dst)
            }
            Source::CharmStore { charm } => {
                let dir = fresh_dir(dest).await?;
                let target = dir.to_string_lossy().into_owned();
                vcs::run("charm", &["get", url, target.as_str()], None).await?;

                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        return Ok(entry.path());
                    }
                }
                Err(FetchError::Empty(format!("cs:{}", charm)))
            }
        }
    }

    async fn revision(
        &self,
        url: &str,
        revision: Option<&str>,
        dir: &Path,
    ) -> FetchResult<Option<String>> {
        if let Ok(Source::CharmStore { charm }) = Source::parse(url) {
            return Ok(charm_store_revision(&charm).or_else(|| revision.map(str::to_string)));
        }

        match Vcs::detect(dir) {
            Some(vcs) => vcs.revision(dir).await.map(Some),
            None => Ok(revision.map(str::to_string)),
        }
    }
}

/// Returns the numeric revision suffix of a charm store id, e.g. `42` for
/// `precise/mysql-42`.
pub fn charm_store_revision(charm: &str) -> Option<String> {
    let name = charm.rsplit('/').next().unwrap_or(charm);
    name.rsplit_once('-')
        .map(|(_, rev)| rev)
        .filter(|rev| !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
}

/// Creates a new, uniquely named directory under `dest`.
async fn fresh_dir(dest: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dest).await?;
    loop {
        let dir = dest.join(format!("fetch-{:08x}", rand::random::<u32>()));
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}
