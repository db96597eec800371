//! Credential lookup.
//!
//! The connector never stores the personal access token itself. Configuration
//! carries a [`CredentialRef`] and a [`CredentialProvider`] resolves it at the
//! start of each run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;

use crate::error::{ConnectorError, Result};

/// Where to find the access token.
///
/// Written in configuration as `env:VAR_NAME` or `file:/path/to/token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    Env(String),
    File(PathBuf),
}

impl FromStr for CredentialRef {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once(':') {
            Some(("env", name)) if !name.trim().is_empty() => {
                Ok(CredentialRef::Env(name.trim().to_string()))
            }
            Some(("file", path)) if !path.trim().is_empty() => {
                Ok(CredentialRef::File(PathBuf::from(path.trim())))
            }
            _ => Err(ConnectorError::configuration(format!(
                "invalid credential reference '{}'. Expected 'env:NAME' or 'file:PATH'",
                s
            ))),
        }
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRef::Env(name) => write!(f, "env:{}", name),
            CredentialRef::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// A personal access token. Never printed.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Value for the `Authorization` header (Basic auth with an empty user name).
    pub fn basic_auth_header(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!(":{}", self.0));
        format!("Basic {}", encoded)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, reference: &CredentialRef) -> Result<AccessToken>;
}

/// Resolves `env:` references from the process environment and `file:`
/// references from disk.
#[derive(Debug, Default, Clone)]
pub struct DefaultCredentialProvider;

#[async_trait]
impl CredentialProvider for DefaultCredentialProvider {
    async fn get_token(&self, reference: &CredentialRef) -> Result<AccessToken> {
        let raw = match reference {
            CredentialRef::Env(name) => std::env::var(name).map_err(|_| {
                ConnectorError::credential(format!("environment variable {} is not set", name))
            })?,
            CredentialRef::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                ConnectorError::credential(format!(
                    "cannot read token file {}: {}",
                    path.display(),
                    e
                ))
            })?,
        };

        let token = raw.trim();
        if token.is_empty() {
            return Err(ConnectorError::credential(format!(
                "credential {} is empty",
                reference
            )));
        }
        Ok(AccessToken::new(token))
    }
}

/// Always returns the same token, whatever the reference.
#[derive(Clone)]
pub struct StaticCredentialProvider {
    token: Option<AccessToken>,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(AccessToken::new(token)),
        }
    }

    /// A provider with no token, for exercising the missing-credential path.
    pub fn missing() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_token(&self, reference: &CredentialRef) -> Result<AccessToken> {
        self.token
            .clone()
            .ok_or_else(|| ConnectorError::credential(format!("no token for {}", reference)))
    }
}
