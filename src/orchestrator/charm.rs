//! Testing a charm alone and inside every bundle that deploys it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{CharmSwap, Lineage, Orchestrator, OrchestratorResult, TestOptions, WorkerPool};
use crate::artifact::{CharmMetadata, Kind, copy_tree};
use crate::fetch::Fetcher;
use crate::report::{CharmTests, ResultNode, Verdict};
use crate::store::{BundleIndex, PublishedBundle};
use crate::suite::{SuiteRunner, TestInvocation};

/// Tests one fetched charm.
pub struct CharmTester<'a, F, R, I> {
    orchestrator: &'a Orchestrator<F, R, I>,
    name: String,
    dir: PathBuf,
}

impl<'a, F, R, I> CharmTester<'a, F, R, I>
where
    F: Fetcher,
    R: SuiteRunner,
    I: BundleIndex,
{
    /// Reads the charm in `dir` and normalizes its directory name.
    pub async fn new(orchestrator: &'a Orchestrator<F, R, I>, dir: &Path) -> OrchestratorResult<Self> {
        let name = CharmMetadata::load(dir)?.name;
        let dir = normalize_dir(dir, &name).await?;
        Ok(Self {
            orchestrator,
            name,
            dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs the charm's suite in every charm environment, then, unless
    /// `shallow`, every promulgated bundle deploying the charm.
    ///
    /// Bundles are still tested after a failure; they are recorded but the
    /// verdict stays `fail`.
    pub async fn test(
        &self,
        options: &TestOptions,
        lineage: &Lineage,
    ) -> OrchestratorResult<ResultNode> {
        let config = &self.orchestrator.config;
        let envs = config.environments.resolve(Kind::Charm);

        let invocations = envs
            .iter()
            .map(|env| {
                debug!("Testing charm {} in env {}", self.name, env);
                TestInvocation::new(&self.dir, env).with_constraints(options.constraints.clone())
            })
            .collect();
        let pool = WorkerPool::new(config.guardian.max_parallel, &self.orchestrator.token);
        let charm = pool.run(&self.orchestrator.runner, invocations).await?;

        let mut result = Verdict::reduce_envs(&envs, &charm);
        let mut bundles = BTreeMap::new();

        if !options.shallow {
            let swap = CharmSwap {
                name: self.name.clone(),
                dir: self.dir.clone(),
            };
            let bundle_options = TestOptions {
                deployment: None,
                ..options.clone()
            };

            for bundle in self.related_bundles(lineage).await? {
                info!("Testing bundle {} with {}", bundle.id, self.name);
                let node = self
                    .orchestrator
                    .test_artifact(&bundle.url, None, &bundle_options, Some(&swap), lineage)
                    .await?;
                result = result.and(node.result);
                bundles.insert(bundle.id, node);
            }
        }

        Ok(ResultNode::charm(
            result,
            CharmTests {
                charm,
                bundle: bundles,
            },
        ))
    }

    /// Promulgated bundles deploying this charm that are safe to re-enter.
    async fn related_bundles(&self, lineage: &Lineage) -> OrchestratorResult<Vec<PublishedBundle>> {
        let max_depth = self.orchestrator.config.guardian.max_depth;
        if lineage.depth() >= max_depth {
            warn!(
                "Not testing bundles of {}: depth {} reached the limit of {}",
                self.name,
                lineage.depth(),
                max_depth
            );
            return Ok(Vec::new());
        }

        let mut seen = BTreeMap::new();
        for bundle in self.orchestrator.index.bundles_for(&self.name).await? {
            if !bundle.hosts(&self.name) {
                continue;
            }
            if lineage.contains(&bundle.url) {
                warn!("Skipping bundle {}: {} is already under test", bundle.id, bundle.url);
                continue;
            }
            seen.entry(bundle.id.clone()).or_insert(bundle);
        }

        let bundles: Vec<_> = seen.into_values().collect();
        debug!(
            "Promulgated bundles that contain {}: {}",
            self.name,
            if bundles.is_empty() {
                "None".to_string()
            } else {
                bundles
                    .iter()
                    .map(|b| format!("{}/{}", b.basket, b.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        );
        Ok(bundles)
    }
}

/// Makes the charm's directory name match its declared name, copying the
/// tree into `<dir>/<name>` if it does not.
async fn normalize_dir(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    if dir.file_name().is_some_and(|base| base == name) {
        return Ok(dir.to_path_buf());
    }

    let target = dir.join(name);
    debug!("Copying {} to {}", dir.display(), target.display());
    copy_tree(dir, &target, Some(&target)).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_normalize_keeps_matching_dir() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("mysql");
        std::fs::create_dir(&dir).unwrap();

        assert_eq!(normalize_dir(&dir, "mysql").await.unwrap(), dir);
        assert!(!dir.join("mysql").exists());
    }

    #[tokio::test]
    async fn test_normalize_copies_into_named_subdir() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("trunk");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("metadata.yaml"), "name: mysql\n").unwrap();

        let normalized = normalize_dir(&dir, "mysql").await.unwrap();
        assert_eq!(normalized, dir.join("mysql"));
        assert!(normalized.join("metadata.yaml").is_file());
    }

    #[test]
    fn test_lineage() {
        let root = Lineage::default().child("lp:charm");
        assert_eq!(root.depth(), 0);
        let child = root.child("lp:bundle");
        assert_eq!(child.depth(), 1);
        assert!(child.contains("lp:charm"));
        assert!(!root.contains("lp:bundle"));
    }
}
