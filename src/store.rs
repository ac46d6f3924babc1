//! Lookup of published bundles that reference a charm.
//!
//! When a charm is tested deeply, every promulgated bundle that deploys it
//! is fetched and tested again with the in-flight charm swapped in. The
//! [`BundleIndex`] trait is the seam to the catalogue; [`CharmworldIndex`]
//! queries the charm catalogue's search API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::StoreConfig;

/// Result type for catalogue operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Bundle search for {charm} failed: {source}")]
    Request {
        charm: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected bundle search response: {0}")]
    Response(#[from] serde_json::Error),
}

/// A bundle as listed in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBundle {
    /// Catalogue id, used as the key of the bundle's result node.
    pub id: String,
    pub name: String,
    pub basket: String,
    /// Fetchable URL of the bundle's branch.
    pub url: String,
    pub promulgated: bool,
    /// Names of the charms the bundle deploys.
    pub charms: Vec<String>,
}

impl PublishedBundle {
    /// Returns `true` if this is a promulgated bundle deploying `charm_name`.
    pub fn hosts(&self, charm_name: &str) -> bool {
        self.promulgated && self.charms.iter().any(|c| c == charm_name)
    }
}

/// Finds published bundles by charm name.
#[async_trait]
pub trait BundleIndex: Send + Sync {
    /// Returns the bundles matching a search for `charm_name`.
    ///
    /// Results may include bundles that do not deploy the charm; callers
    /// filter with [`PublishedBundle::hosts`].
    async fn bundles_for(&self, charm_name: &str) -> StoreResult<Vec<PublishedBundle>>;
}

/// [`BundleIndex`] backed by the charm catalogue search API.
pub struct CharmworldIndex {
    client: reqwest::Client,
    base_url: String,
}

impl CharmworldIndex {
    pub fn new(config: &StoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BundleIndex for CharmworldIndex {
    async fn bundles_for(&self, charm_name: &str) -> StoreResult<Vec<PublishedBundle>> {
        let url = format!("{}/api/3/search", self.base_url);
        debug!("Searching {} for bundles with {}", url, charm_name);

        let request_error = |source: reqwest::Error| StoreError::Request {
            charm: charm_name.to_string(),
            source,
        };
        let body = self
            .client
            .get(&url)
            .query(&[("text", charm_name), ("type", "bundle")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(request_error)?
            .text()
            .await
            .map_err(request_error)?;

        parse_search(&body)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    bundle: Option<BundleRecord>,
}

#[derive(Debug, Deserialize)]
struct BundleRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    basket_name: String,
    branch_spec: String,
    #[serde(default)]
    promulgated: bool,
    #[serde(default)]
    charms: serde_json::Value,
}

/// Parses a search API response body.
pub fn parse_search(body: &str) -> StoreResult<Vec<PublishedBundle>> {
    let response: SearchResponse = serde_json::from_str(body)?;

    Ok(response
        .result
        .into_iter()
        .filter_map(|hit| hit.bundle)
        .map(|record| PublishedBundle {
            url: format!("lp:{}", record.branch_spec),
            charms: charm_names(&record.charms),
            id: record.id,
            name: record.name,
            basket: record.basket_name,
            promulgated: record.promulgated,
        })
        .collect())
}

/// Charm lists come either as an object keyed by charm name or as a list
/// of names.
fn charm_names(charms: &serde_json::Value) -> Vec<String> {
    match charms {
        serde_json::Value::Object(map) => map.keys().cloned().collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
        "result": [
            {
                "bundle": {
                    "id": "~charmers/mysql/1/mysql-cluster",
                    "name": "mysql-cluster",
                    "basket_name": "mysql",
                    "branch_spec": "~charmers/charms/bundles/mysql/bundle",
                    "promulgated": true,
                    "charms": {"mysql": {"id": "cs:precise/mysql-42"}, "haproxy": {}}
                }
            },
            {
                "bundle": {
                    "id": "~someone/wiki/3/wiki",
                    "name": "wiki",
                    "basket_name": "wiki",
                    "branch_spec": "~someone/charms/bundles/wiki/bundle",
                    "promulgated": false,
                    "charms": ["mysql", "mediawiki"]
                }
            },
            {"charm": {"id": "cs:precise/mysql-42"}}
        ]
    }"#;

    #[test]
    fn test_parse_search() {
        let bundles = parse_search(RESPONSE).unwrap();
        assert_eq!(bundles.len(), 2);

        let cluster = &bundles[0];
        assert_eq!(cluster.id, "~charmers/mysql/1/mysql-cluster");
        assert_eq!(cluster.url, "lp:~charmers/charms/bundles/mysql/bundle");
        assert_eq!(cluster.basket, "mysql");
        assert!(cluster.charms.contains(&"haproxy".to_string()));
        assert!(cluster.hosts("mysql"));
        assert!(!cluster.hosts("mediawiki"));

        let wiki = &bundles[1];
        assert_eq!(wiki.charms, vec!["mysql", "mediawiki"]);
        assert!(!wiki.hosts("mysql"));
    }

    #[test]
    fn test_empty_response() {
        assert!(parse_search("{}").unwrap().is_empty());
        assert!(matches!(
            parse_search("not json"),
            Err(StoreError::Response(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let index = CharmworldIndex::new(&StoreConfig {
            url: "https://store.example/".into(),
            timeout_secs: 5,
        });
        assert_eq!(index.base_url, "https://store.example");
    }
}
