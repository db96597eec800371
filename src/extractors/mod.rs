//! Entity extractors.
//!
//! One [`Extractor`] per [`EntityType`]. Each pages through its upstream
//! listing and hands normalized records to a [`RecordSink`] one page at a
//! time; the orchestrator turns those into documents. Extractors are looked
//! up by entity type through an [`ExtractorRegistry`].
//!
//! Cancellation is checked before each page is requested, never in the
//! middle of one.

pub mod commits;
pub mod releases;
pub mod test_runs;
pub mod wikis;
pub mod work_items;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::DevOpsClient;
use crate::config::ConnectorSettings;
use crate::error::{ConnectorError, Result};
use crate::models::{DocumentMode, EntityType, NormalizedRecord, Person};

/// Everything an extractor needs for one pass.
pub struct ExtractContext<'a> {
    pub client: &'a DevOpsClient,
    pub settings: &'a ConnectorSettings,
    pub mode: DocumentMode,
    /// Lower bound of the query window (the stored cursor); `None` on the first run.
    pub since: Option<DateTime<Utc>>,
    /// Upper bound of the query window (the run start).
    pub until: DateTime<Utc>,
    pub cancel: &'a CancellationToken,
}

impl ExtractContext<'_> {
    pub fn is_full(&self) -> bool {
        self.mode == DocumentMode::Full
    }

    /// `Err(Cancelled)` once the run has been asked to stop.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ConnectorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives normalized records page by page.
#[async_trait]
pub trait RecordSink: Send {
    async fn accept(&mut self, records: Vec<NormalizedRecord>) -> Result<()>;
}

/// What an extraction pass produced besides records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub records: usize,
    pub pages: usize,
    /// Human-readable notes about records or repositories that were skipped.
    pub warnings: Vec<String>,
}

impl ExtractSummary {
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn entity_type(&self) -> EntityType;

    async fn extract(
        &self,
        ctx: &ExtractContext<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<ExtractSummary>;
}

/// Extractors keyed by entity type.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Registry holding the five built-in extractors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(work_items::WorkItemExtractor));
        registry.register(Box::new(commits::CommitExtractor));
        registry.register(Box::new(test_runs::TestRunExtractor));
        registry.register(Box::new(releases::ReleaseExtractor));
        registry.register(Box::new(wikis::WikiExtractor));
        registry
    }

    /// Add an extractor, replacing any existing one for the same entity type.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        let entity_type = extractor.entity_type();
        self.extractors.retain(|e| e.entity_type() != entity_type);
        self.extractors.push(extractor);
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.entity_type() == entity_type)
            .map(|e| e.as_ref())
    }
}

// ---------- helpers shared by the extractors ----------

/// Parse an upstream timestamp; anything unparseable becomes `None`.
pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Timestamp format used in query parameters and WIQL.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// String view of a JSON field; numbers are stringified.
pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An identity reference (`displayName`, `uniqueName`) as a [`Person`].
pub(crate) fn person(value: Option<&Value>) -> Option<Person> {
    let value = value?;
    let display_name = str_field(value, "displayName");
    let unique_name = str_field(value, "uniqueName").or_else(|| str_field(value, "emailAddress"));
    if display_name.is_none() && unique_name.is_none() {
        return None;
    }
    Some(Person {
        display_name,
        unique_name,
    })
}
