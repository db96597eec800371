//! Default-branch resolution for git repositories.
//!
//! The configured default branch is used when the upstream reports one.
//! Otherwise the alphabetically first branch is chosen. A repository with no
//! branches at all yields [`ConnectorError::RepositoryState`], which callers
//! treat as a per-repository skip.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::client::{ApiRequest, DevOpsClient};
use crate::error::{ConnectorError, Result};
use crate::paginate::Paginator;

/// A repository as returned by `git/repositories`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub is_disabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    name: String,
}

/// Strip the `refs/heads/` prefix from a ref name.
pub fn short_branch_name(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}

/// Resolves and caches default branches for the lifetime of one sync run.
pub struct BranchResolver<'a> {
    client: &'a DevOpsClient,
    page_size: usize,
    cache: HashMap<String, String>,
}

impl<'a> BranchResolver<'a> {
    pub fn new(client: &'a DevOpsClient, page_size: usize) -> Self {
        Self {
            client,
            page_size,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve_default_branch(&mut self, repository: &GitRepository) -> Result<String> {
        if let Some(branch) = self.cache.get(&repository.id) {
            return Ok(branch.clone());
        }

        let branch = match self.configured_default(repository).await? {
            Some(branch) => branch,
            None => self.first_branch(repository).await?,
        };

        debug!(repository = %repository.name, branch = %branch, "resolved default branch");
        self.cache.insert(repository.id.clone(), branch.clone());
        Ok(branch)
    }

    /// The repository's configured default, from the listing or a detail fetch.
    async fn configured_default(&self, repository: &GitRepository) -> Result<Option<String>> {
        let declared = match non_empty(repository.default_branch.as_deref()) {
            Some(branch) => Some(branch.to_string()),
            None => {
                let request = ApiRequest::get(format!("git/repositories/{}", repository.id));
                let details: GitRepository = self.client.get_json(&request).await?;
                non_empty(details.default_branch.as_deref()).map(str::to_string)
            }
        };
        Ok(declared.map(|b| short_branch_name(&b).to_string()))
    }

    async fn first_branch(&self, repository: &GitRepository) -> Result<String> {
        let request = ApiRequest::get(format!("git/repositories/{}/refs", repository.id))
            .query("filter", "heads/");
        let refs = Paginator::new(self.client, request, self.page_size)
            .collect_all()
            .await?;

        let mut names: Vec<String> = refs
            .into_iter()
            .filter_map(|r| serde_json::from_value::<GitRef>(r).ok())
            .map(|r| short_branch_name(&r.name).to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();

        names
            .into_iter()
            .next()
            .ok_or_else(|| ConnectorError::RepositoryState {
                repository: repository.name.clone(),
                reason: "repository has no branches".to_string(),
            })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
