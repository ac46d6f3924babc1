//! The result document and verdict reduction.
//!
//! A test run produces one [`ResultNode`] tree. Charm nodes own the outcomes
//! of the charm's own suite plus one child node per related bundle; bundle
//! nodes own outcomes per deployment and environment. The serialized tree is
//! the contract consumed by reporting tools:
//!
//! ```json
//! {
//!   "type": "charm",
//!   "result": "fail",
//!   "tests": {
//!     "charm": { "local": [ ... ], "amazon": [ ... ] },
//!     "bundle": { "~charmers/mysql/1/mysql-cluster": { "type": "bundle", ... } }
//!   },
//!   "url": "lp:~charmers/charms/precise/mysql/trunk",
//!   "revision": "142",
//!   "started": "2014-06-03T18:01:22.123456Z",
//!   "finished": "2014-06-03T18:25:07.654321Z"
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::suite::TestCaseOutcome;

/// Outcomes keyed by environment name.
pub type EnvOutcomes = BTreeMap<String, Vec<TestCaseOutcome>>;

/// Overall pass/fail state of a node. `Fail` dominates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[default]
    Pass,
    Fail,
}

impl Verdict {
    /// `Fail` iff any outcome has a non-zero status. Empty lists pass.
    pub fn from_outcomes(outcomes: &[TestCaseOutcome]) -> Self {
        if outcomes.iter().any(TestCaseOutcome::is_failure) {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }

    /// Reduces per-environment outcomes, walking `envs` in order and
    /// stopping at the first failing environment.
    ///
    /// Environments missing from `outcomes` count as passing.
    pub fn reduce_envs(envs: &[String], outcomes: &EnvOutcomes) -> Self {
        envs.iter()
            .filter_map(|env| outcomes.get(env))
            .map(|list| Verdict::from_outcomes(list))
            .find(|verdict| verdict.is_fail())
            .unwrap_or(Verdict::Pass)
    }

    /// Combines two verdicts.
    pub fn and(self, other: Verdict) -> Self {
        if self.is_fail() || other.is_fail() {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }

    pub fn is_fail(self) -> bool {
        self == Verdict::Fail
    }
}

/// What a node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Charm,
    Bundle,
    /// The artifact could not be fetched; no tests ran.
    Error,
}

/// Outcomes owned by a charm node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CharmTests {
    /// The charm's own suite, per environment.
    pub charm: EnvOutcomes,

    /// Related bundles, keyed by bundle id.
    pub bundle: BTreeMap<String, ResultNode>,
}

/// The `tests` field of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeTests {
    Charm(CharmTests),
    /// Deployment name → environment → outcomes.
    Bundle(BTreeMap<String, EnvOutcomes>),
}

/// One node of the result tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultNode {
    #[serde(rename = "type")]
    pub kind: NodeType,

    pub result: Verdict,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<NodeTests>,

    /// Failure message of an error node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Resolved revision of an independently fetched artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
}

impl ResultNode {
    fn new(kind: NodeType, result: Verdict, tests: Option<NodeTests>) -> Self {
        Self {
            kind,
            result,
            tests,
            error: None,
            url: None,
            revision: None,
            started: None,
            finished: None,
        }
    }

    /// Creates a charm node.
    pub fn charm(result: Verdict, tests: CharmTests) -> Self {
        Self::new(NodeType::Charm, result, Some(NodeTests::Charm(tests)))
    }

    /// Creates a bundle node.
    pub fn bundle(result: Verdict, tests: BTreeMap<String, EnvOutcomes>) -> Self {
        Self::new(NodeType::Bundle, result, Some(NodeTests::Bundle(tests)))
    }

    /// Creates the terminal node for an artifact that could not be fetched.
    pub fn error(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            url: Some(url.into()),
            finished: Some(timestamp()),
            ..Self::new(NodeType::Error, Verdict::Fail, None)
        }
    }

    /// Attaches the artifact's source and run times.
    pub fn with_run(
        mut self,
        url: impl Into<String>,
        revision: Option<String>,
        started: String,
        finished: String,
    ) -> Self {
        self.url = Some(url.into());
        self.revision = revision;
        self.started = Some(started);
        self.finished = Some(finished);
        self
    }

    pub fn is_fail(&self) -> bool {
        self.result.is_fail()
    }

    /// Returns every leaf outcome in the tree, depth first.
    pub fn outcomes(&self) -> Vec<&TestCaseOutcome> {
        let mut out = Vec::new();
        self.collect_outcomes(&mut out);
        out
    }

    fn collect_outcomes<'a>(&'a self, out: &mut Vec<&'a TestCaseOutcome>) {
        match &self.tests {
            Some(NodeTests::Charm(tests)) => {
                out.extend(tests.charm.values().flatten());
                for child in tests.bundle.values() {
                    child.collect_outcomes(out);
                }
            }
            Some(NodeTests::Bundle(deployments)) => {
                out.extend(deployments.values().flat_map(|envs| envs.values().flatten()));
            }
            None => {}
        }
    }

    /// Recomputes the verdict bottom-up from owned outcomes and children,
    /// ignoring the stored `result` fields.
    pub fn recomputed_verdict(&self) -> Verdict {
        match &self.tests {
            Some(NodeTests::Charm(tests)) => tests
                .charm
                .values()
                .map(|list| Verdict::from_outcomes(list))
                .chain(tests.bundle.values().map(ResultNode::recomputed_verdict))
                .fold(Verdict::Pass, Verdict::and),
            Some(NodeTests::Bundle(deployments)) => deployments
                .values()
                .flat_map(BTreeMap::values)
                .map(|list| Verdict::from_outcomes(list))
                .fold(Verdict::Pass, Verdict::and),
            None if self.kind == NodeType::Error => Verdict::Fail,
            None => Verdict::Pass,
        }
    }

    /// Returns `true` if every node's stored verdict matches its recomputed
    /// one, at every depth.
    pub fn is_consistent(&self) -> bool {
        if self.result != self.recomputed_verdict() {
            return false;
        }
        match &self.tests {
            Some(NodeTests::Charm(tests)) => tests.bundle.values().all(ResultNode::is_consistent),
            _ => true,
        }
    }
}

/// Current UTC time as ISO-8601 with a `Z` suffix.
pub fn timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// Prints a one-line verdict summary to stderr.
pub fn print_summary(node: &ResultNode) {
    let outcomes = node.outcomes();
    let failed = outcomes.iter().filter(|o| o.is_failure()).count();

    eprintln!();
    match node.kind {
        NodeType::Error => eprintln!(
            "{} {}",
            console::style("Error:").red().bold(),
            node.error.as_deref().unwrap_or("unknown error")
        ),
        _ if node.is_fail() => eprintln!(
            "{} {} of {} test(s) failed",
            console::style("FAIL").red().bold(),
            failed,
            outcomes.len()
        ),
        _ => eprintln!(
            "{} {} test(s) passed",
            console::style("PASS").green().bold(),
            outcomes.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn outcomes(pairs: &[(&str, &[i32])]) -> EnvOutcomes {
        pairs
            .iter()
            .map(|(env, codes)| {
                (
                    env.to_string(),
                    codes.iter().map(|c| TestCaseOutcome::new("t", *c)).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_from_outcomes() {
        assert_eq!(Verdict::from_outcomes(&[]), Verdict::Pass);
        assert_eq!(
            Verdict::from_outcomes(&[TestCaseOutcome::new("a", 0)]),
            Verdict::Pass
        );
        assert_eq!(
            Verdict::from_outcomes(&[TestCaseOutcome::new("a", 0), TestCaseOutcome::new("b", 2)]),
            Verdict::Fail
        );
    }

    #[test]
    fn test_reduce_envs_fail_dominates() {
        let results = outcomes(&[("local", &[0]), ("amazon", &[1])]);
        assert_eq!(
            Verdict::reduce_envs(&envs(&["local", "amazon"]), &results),
            Verdict::Fail
        );
        assert_eq!(
            Verdict::reduce_envs(&envs(&["amazon", "local"]), &results),
            Verdict::Fail
        );
        assert_eq!(Verdict::reduce_envs(&envs(&["local"]), &results), Verdict::Pass);
    }

    #[test]
    fn test_error_node_shape() {
        let node = ResultNode::error("foo:bar", "Unsupported URL: foo:bar");
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["result"], "fail");
        assert_eq!(json["error"], "Unsupported URL: foo:bar");
        assert_eq!(json["url"], "foo:bar");
        assert!(json["finished"].as_str().unwrap().ends_with('Z'));
        assert!(json.get("tests").is_none());
        assert!(json.get("revision").is_none());
        assert_eq!(node.recomputed_verdict(), Verdict::Fail);
    }

    #[test]
    fn test_charm_node_round_trips() {
        let bundle = ResultNode::bundle(
            Verdict::Fail,
            BTreeMap::from([(
                "single".to_string(),
                outcomes(&[("local", &[0, 1])]),
            )]),
        )
        .with_run("lp:~charmers/bundle", Some("7".into()), timestamp(), timestamp());

        let node = ResultNode::charm(
            Verdict::Fail,
            CharmTests {
                charm: outcomes(&[("local", &[0])]),
                bundle: BTreeMap::from([("basket/bundle".to_string(), bundle)]),
            },
        );

        let json = serde_json::to_string(&node).unwrap();
        let parsed: ResultNode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
        assert!(matches!(parsed.tests, Some(NodeTests::Charm(_))));
    }

    #[test]
    fn test_outcomes_walks_whole_tree() {
        let bundle = ResultNode::bundle(
            Verdict::Pass,
            BTreeMap::from([("d".to_string(), outcomes(&[("local", &[0, 0])]))]),
        );
        let node = ResultNode::charm(
            Verdict::Pass,
            CharmTests {
                charm: outcomes(&[("local", &[0]), ("amazon", &[0])]),
                bundle: BTreeMap::from([("b".to_string(), bundle)]),
            },
        );
        assert_eq!(node.outcomes().len(), 4);
        assert!(node.is_consistent());
    }

    #[test]
    fn test_inconsistent_tree_is_detected() {
        let failing_bundle = ResultNode::bundle(
            Verdict::Fail,
            BTreeMap::from([("d".to_string(), outcomes(&[("local", &[1])]))]),
        );
        let node = ResultNode::charm(
            Verdict::Pass,
            CharmTests {
                charm: outcomes(&[("local", &[0])]),
                bundle: BTreeMap::from([("b".to_string(), failing_bundle)]),
            },
        );
        assert_eq!(node.recomputed_verdict(), Verdict::Fail);
        assert!(!node.is_consistent());
    }
}
