//! Fetched artifact inspection: classification, charm metadata and bundle
//! descriptors.
//!
//! A fetched directory is a **bundle** when it contains `bundles.yaml` and a
//! **charm** when it contains `metadata.yaml`. The bundle descriptor is
//! checked first, so a directory carrying both is tested as a bundle.
//!
//! ```text
//! bundles.yaml
//! ├── <deployment>            one named topology combination
//! │   └── services
//! │       └── <service>
//! │           ├── charm: cs:precise/mysql-42     ← swapped for a local branch
//! │           └── ...
//! └── <deployment>
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::config::DeploymentPolicy;

/// Bundle descriptor file name.
pub const BUNDLE_FILE: &str = "bundles.yaml";

/// Charm metadata file name.
pub const METADATA_FILE: &str = "metadata.yaml";

/// Result type for artifact operations.
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Errors that can occur while inspecting an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The directory is neither a charm nor a bundle.
    #[error("No charm or bundle found in {}", .0.display())]
    Unrecognized(PathBuf),

    /// The artifact was not of the kind the caller required.
    #[error("Expected a {expected} in {}, found a {found}", path.display())]
    UnexpectedKind {
        path: PathBuf,
        expected: Kind,
        found: Kind,
    },

    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The bundle descriptor is not shaped like one.
    #[error("Malformed bundle {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("Bundle {} declares no deployments", .0.display())]
    NoDeployments(PathBuf),

    #[error("Deployment '{name}' is not declared in {}", path.display())]
    UnknownDeployment { path: PathBuf, name: String },
}

/// What a fetched directory contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Charm,
    Bundle,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Charm => write!(f, "charm"),
            Kind::Bundle => write!(f, "bundle"),
        }
    }
}

/// Decides whether `dir` holds a bundle or a charm.
///
/// # Errors
///
/// Returns [`ArtifactError::Unrecognized`] if neither descriptor is present.
pub fn classify(dir: &Path) -> ArtifactResult<Kind> {
    if dir.join(BUNDLE_FILE).is_file() {
        Ok(Kind::Bundle)
    } else if dir.join(METADATA_FILE).is_file() {
        Ok(Kind::Charm)
    } else {
        Err(ArtifactError::Unrecognized(dir.to_path_buf()))
    }
}

/// The subset of `metadata.yaml` the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CharmMetadata {
    pub name: String,
}

impl CharmMetadata {
    /// Reads the metadata of the charm in `dir`.
    pub fn load(dir: &Path) -> ArtifactResult<Self> {
        let path = dir.join(METADATA_FILE);
        let content = read(&path)?;
        serde_yaml::from_str(&content).map_err(|source| ArtifactError::Yaml { path, source })
    }
}

/// A bundle descriptor loaded for inspection and in-place rewriting.
///
/// Deployment order is the order of the file, and is preserved on save.
#[derive(Debug, Clone)]
pub struct BundleFile {
    path: PathBuf,
    data: Mapping,
}

impl BundleFile {
    /// Loads `bundles.yaml` from the bundle in `dir`.
    pub fn load(dir: &Path) -> ArtifactResult<Self> {
        let path = dir.join(BUNDLE_FILE);
        let content = read(&path)?;
        let data = match serde_yaml::from_str::<Value>(&content) {
            Ok(Value::Mapping(data)) => data,
            Ok(_) => {
                return Err(ArtifactError::Malformed {
                    path,
                    reason: "top level is not a mapping".to_string(),
                });
            }
            Err(source) => return Err(ArtifactError::Yaml { path, source }),
        };

        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the declared deployment names in file order.
    pub fn deployments(&self) -> Vec<String> {
        self.data.keys().filter_map(key_name).collect()
    }

    /// Picks the deployments to test.
    ///
    /// An explicit name wins over the policy but must be declared.
    pub fn select(
        &self,
        policy: DeploymentPolicy,
        explicit: Option<&str>,
    ) -> ArtifactResult<Vec<String>> {
        let declared = self.deployments();
        debug!("Deployments in {}: {:?}", self.path.display(), declared);

        if let Some(name) = explicit {
            return if declared.iter().any(|d| d == name) {
                Ok(vec![name.to_string()])
            } else {
                Err(ArtifactError::UnknownDeployment {
                    path: self.path.clone(),
                    name: name.to_string(),
                })
            };
        }

        match policy {
            DeploymentPolicy::All if !declared.is_empty() => Ok(declared),
            DeploymentPolicy::All => Err(ArtifactError::NoDeployments(self.path.clone())),
            DeploymentPolicy::Random => declared
                .choose(&mut rand::thread_rng())
                .map(|name| vec![name.clone()])
                .ok_or_else(|| ArtifactError::NoDeployments(self.path.clone())),
        }
    }

    /// Replaces every service reference to `charm_name` with a branch
    /// pointing at `charm_dir`, across all deployments.
    ///
    /// Returns the number of services rewritten.
    pub fn swap_charm(&mut self, charm_name: &str, charm_dir: &Path) -> ArtifactResult<usize> {
        let mut swapped = 0;

        for (deployment, body) in self.data.iter_mut() {
            let Some(services) = body
                .as_mapping_mut()
                .and_then(|body| body.get_mut("services"))
                .and_then(Value::as_mapping_mut)
            else {
                debug!("Deployment {:?} has no services", deployment);
                continue;
            };

            for (service, spec) in services.iter_mut() {
                let Some(spec) = spec.as_mapping_mut() else {
                    return Err(ArtifactError::Malformed {
                        path: self.path.clone(),
                        reason: format!("service {:?} is not a mapping", service),
                    });
                };

                let matches = spec
                    .get("charm")
                    .and_then(Value::as_str)
                    .is_some_and(|reference| charm_ref_matches(reference, charm_name));
                if !matches {
                    continue;
                }

                spec.remove("charm");
                spec.insert(
                    Value::from("branch"),
                    Value::from(charm_dir.display().to_string()),
                );
                swapped += 1;
            }
        }

        Ok(swapped)
    }

    /// Writes the (possibly rewritten) descriptor back to disk.
    pub fn save(&self) -> ArtifactResult<()> {
        let content = serde_yaml::to_string(&self.data).map_err(|source| ArtifactError::Yaml {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, content).map_err(|source| ArtifactError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Returns `true` if a service's charm reference names `charm_name`.
///
/// Only the final path segment is compared, with any store scheme and
/// trailing `-<revision>` removed.
///
/// ```
/// use charmguard::artifact::charm_ref_matches;
///
/// assert!(charm_ref_matches("cs:precise/mysql-42", "mysql"));
/// assert!(charm_ref_matches("cs:mysql", "mysql"));
/// assert!(!charm_ref_matches("cs:precise/mysql-proxy", "mysql"));
/// ```
pub fn charm_ref_matches(reference: &str, charm_name: &str) -> bool {
    let segment = reference.rsplit('/').next().unwrap_or(reference);
    let segment = segment.rsplit(':').next().unwrap_or(segment);
    let base = match segment.rsplit_once('-') {
        Some((base, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => base,
        _ => segment,
    };
    base == charm_name
}

/// Recursively copies `src` into `dst`, preserving symlinks.
///
/// Entries of `src` whose path equals `skip` are not copied, which allows
/// copying a tree into one of its own subdirectories.
pub async fn copy_tree(src: &Path, dst: &Path, skip: Option<&Path>) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let src_path = entry.path();
        if skip == Some(src_path.as_path()) {
            continue;
        }

        let ty = entry.file_type().await?;
        let dst_path = dst.join(entry.file_name());

        if ty.is_symlink() {
            let target = tokio::fs::read_link(&src_path).await?;
            symlink(&target, &dst_path).await?;
        } else if ty.is_dir() {
            Box::pin(copy_tree(&src_path, &dst_path, skip)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::copy(target, link).await.map(|_| ())
}

fn read(path: &Path) -> ArtifactResult<String> {
    std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn key_name(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
