//! Configuration parsing and validation.
//!
//! The configuration file is TOML:
//!
//! ```toml
//! [db]
//! path = "./data/azdo.sqlite"
//!
//! [connector]
//! organization = "contoso"
//! project = "Fabrikam"
//! content_scope = "everything"
//! credential = "env:AZURE_DEVOPS_PAT"
//!
//! [http]
//! max_attempts = 4
//!
//! [output]
//! path = "./data/documents.jsonl"
//! ```
//!
//! [`load_config`] checks the file as a whole. [`ConnectorSettings::validate`]
//! turns the `[connector]` and `[http]` sections into the typed settings a
//! sync run uses, and is what the orchestrator calls while validating.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientOptions;
use crate::credentials::CredentialRef;
use crate::error::ConnectorError;
use crate::models::ContentScope;
use crate::retry::RetryPolicy;

/// Largest id batch accepted by the work-item batch endpoint.
pub const MAX_DETAIL_BATCH: usize = 200;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_content_scope")]
    pub content_scope: String,
    #[serde(default = "default_work_item_types")]
    pub work_item_types: Vec<String>,
    #[serde(default = "default_true")]
    pub include_comments: bool,
    #[serde(default)]
    pub include_attachments: bool,
    /// Glob patterns matched against repository names. Empty means all.
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default = "default_credential")]
    pub credential: String,
}

fn default_content_scope() -> String {
    "work_items_only".to_string()
}
fn default_work_item_types() -> Vec<String> {
    ["Bug", "Epic", "Feature", "Issue", "Task", "Test Case", "User Story"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_true() -> bool {
    true
}
fn default_credential() -> String {
    "env:AZURE_DEVOPS_PAT".to_string()
}

impl ConnectorConfig {
    pub fn new(organization: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            content_scope: default_content_scope(),
            work_item_types: default_work_item_types(),
            include_comments: true,
            include_attachments: false,
            repositories: Vec::new(),
            credential: default_credential(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_release_base_url")]
    pub release_base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_detail_batch_size")]
    pub detail_batch_size: usize,
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            release_base_url: default_release_base_url(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            page_size: default_page_size(),
            detail_batch_size: default_detail_batch_size(),
            detail_concurrency: default_detail_concurrency(),
            max_in_flight: default_max_in_flight(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_base_url() -> String {
    "https://dev.azure.com".to_string()
}
fn default_release_base_url() -> String {
    "https://vsrm.dev.azure.com".to_string()
}
fn default_api_version() -> String {
    "7.0".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    crate::retry::DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    crate::retry::DEFAULT_MAX_DELAY_MS
}
fn default_page_size() -> usize {
    crate::paginate::DEFAULT_PAGE_SIZE
}
fn default_detail_batch_size() -> usize {
    MAX_DETAIL_BATCH
}
fn default_detail_concurrency() -> usize {
    4
}
fn default_max_in_flight() -> usize {
    crate::rate_limit::DEFAULT_MAX_IN_FLIGHT
}
fn default_max_pages() -> usize {
    crate::paginate::DEFAULT_MAX_PAGES
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// JSONL destination. Documents go to stdout when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_output_batch_size")]
    pub batch_size: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            batch_size: default_output_batch_size(),
        }
    }
}

fn default_output_batch_size() -> usize {
    100
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.connector.organization.trim().is_empty() {
        anyhow::bail!("connector.organization must be set");
    }
    if config.connector.project.trim().is_empty() {
        anyhow::bail!("connector.project must be set");
    }

    config
        .connector
        .content_scope
        .parse::<ContentScope>()
        .with_context(|| "connector.content_scope")?;
    config
        .connector
        .credential
        .parse::<CredentialRef>()
        .with_context(|| "connector.credential")?;
    build_repository_filter(&config.connector.repositories)
        .with_context(|| "connector.repositories")?;

    if config.http.max_attempts == 0 {
        anyhow::bail!("http.max_attempts must be >= 1");
    }
    if config.http.page_size == 0 {
        anyhow::bail!("http.page_size must be > 0");
    }
    if config.http.detail_batch_size == 0 {
        anyhow::bail!("http.detail_batch_size must be > 0");
    }
    if config.http.detail_concurrency == 0 || config.http.max_in_flight == 0 {
        anyhow::bail!("http.detail_concurrency and http.max_in_flight must be > 0");
    }
    if config.http.base_delay_ms > config.http.max_delay_ms {
        anyhow::bail!("http.base_delay_ms must not exceed http.max_delay_ms");
    }
    if config.output.batch_size == 0 {
        anyhow::bail!("output.batch_size must be > 0");
    }

    Ok(config)
}

/// Validated, typed settings for one sync run. Immutable for the run.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub organization: String,
    pub project: String,
    pub scope: ContentScope,
    /// Empty means every work-item type.
    pub work_item_types: Vec<String>,
    pub include_comments: bool,
    pub include_attachments: bool,
    pub repository_patterns: Vec<String>,
    repository_filter: Option<GlobSet>,
    pub credential: CredentialRef,
    pub http: HttpConfig,
}

impl ConnectorSettings {
    pub fn validate(
        connector: &ConnectorConfig,
        http: &HttpConfig,
    ) -> std::result::Result<Self, ConnectorError> {
        let organization = connector.organization.trim();
        if organization.is_empty() {
            return Err(ConnectorError::configuration("organization is missing"));
        }
        let project = connector.project.trim();
        if project.is_empty() {
            return Err(ConnectorError::configuration("project is missing"));
        }
        let scope: ContentScope = connector.content_scope.parse()?;
        let credential: CredentialRef = connector.credential.parse()?;
        let repository_filter = build_repository_filter(&connector.repositories)?;

        let mut http = http.clone();
        http.detail_batch_size = http.detail_batch_size.clamp(1, MAX_DETAIL_BATCH);
        http.page_size = http.page_size.max(1);
        http.detail_concurrency = http.detail_concurrency.max(1);

        Ok(Self {
            organization: organization.to_string(),
            project: project.to_string(),
            scope,
            work_item_types: connector
                .work_item_types
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            include_comments: connector.include_comments,
            include_attachments: connector.include_attachments,
            repository_patterns: connector.repositories.clone(),
            repository_filter,
            credential,
            http,
        })
    }

    pub fn repository_allowed(&self, name: &str) -> bool {
        match &self.repository_filter {
            Some(set) => set.is_match(name),
            None => true,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.http.base_url.clone(),
            release_base_url: self.http.release_base_url.clone(),
            organization: self.organization.clone(),
            project: self.project.clone(),
            api_version: self.http.api_version.clone(),
        }
    }

    /// Stable project key, `{organization}/{project}`. Stored cursors add the
    /// document mode through [`cursor_source`](crate::checkpoint::cursor_source).
    pub fn checkpoint_key(&self) -> String {
        format!("{}/{}", self.organization, self.project)
    }
}

fn build_repository_filter(
    patterns: &[String],
) -> std::result::Result<Option<GlobSet>, ConnectorError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            ConnectorError::configuration(format!("invalid repository pattern '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| ConnectorError::configuration(e.to_string()))
}
