//! Testing a bundle's deployments across the bundle environments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CharmSwap, OrchestratorResult, TestError, TestOptions, WorkerPool};
use crate::artifact::{BundleFile, Kind};
use crate::config::Config;
use crate::fetch::init_bzr_branch;
use crate::report::{ResultNode, Verdict};
use crate::suite::{SuiteRunner, TestInvocation};

/// Runs the selected deployments of the bundle in one directory.
pub struct BundleTester<'a> {
    dir: PathBuf,
    config: &'a Config,
    runner: &'a dyn SuiteRunner,
    token: &'a CancellationToken,
}

impl<'a> BundleTester<'a> {
    pub fn new(
        dir: &Path,
        config: &'a Config,
        runner: &'a dyn SuiteRunner,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config,
            runner,
            token,
        }
    }

    /// Tests the bundle.
    ///
    /// With a `swap`, the bundle is hosting an in-flight charm: services
    /// deploying that charm are rewritten to use its directory, and the
    /// charm's own suite is excluded from the run.
    pub async fn test(
        &self,
        options: &TestOptions,
        swap: Option<&CharmSwap>,
    ) -> OrchestratorResult<ResultNode> {
        let mut bundle = BundleFile::load(&self.dir)?;

        let exclude = match swap {
            Some(swap) => {
                if self.config.suite.init_charm_branch {
                    init_bzr_branch(&swap.dir).await.map_err(TestError::Branch)?;
                }
                let swapped = bundle.swap_charm(&swap.name, &swap.dir)?;
                bundle.save()?;
                info!(
                    "Swapped {} into {} service(s) of {}",
                    swap.name,
                    swapped,
                    self.dir.display()
                );
                Some(swap.name.clone())
            }
            None => None,
        };

        let deployments = bundle.select(
            self.config.guardian.deployments,
            options.deployment.as_deref(),
        )?;
        let envs = self.config.environments.resolve(Kind::Bundle);

        let mut result = Verdict::Pass;
        let mut tests = BTreeMap::new();

        for deployment in deployments {
            debug!("Testing deployment {} in {:?}", deployment, envs);
            let invocations = envs
                .iter()
                .map(|env| {
                    TestInvocation::new(&self.dir, env)
                        .with_deployment(&deployment)
                        .with_exclude(exclude.clone())
                        .skip_implicit()
                        .with_constraints(options.constraints.clone())
                })
                .collect();

            let pool = WorkerPool::new(self.config.guardian.max_parallel, self.token);
            let outcomes = pool.run(self.runner, invocations).await?;

            if !result.is_fail() {
                result = Verdict::reduce_envs(&envs, &outcomes);
            }
            tests.insert(deployment, outcomes);
        }

        Ok(ResultNode::bundle(result, tests))
    }
}
