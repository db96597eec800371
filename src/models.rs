//! Core data models used throughout the connector.
//!
//! Extractors produce [`NormalizedRecord`]s; the document builder turns them
//! into [`Document`]s (full sync) or [`SlimDocument`]s (slim sync) that are
//! handed to the indexing pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// The record types the connector can pull.
///
/// Declaration order is the fixed processing order of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    WorkItem,
    Commit,
    TestResult,
    Release,
    WikiPage,
}

impl EntityType {
    /// All entity types in processing order.
    pub const ALL: [EntityType; 5] = [
        EntityType::WorkItem,
        EntityType::Commit,
        EntityType::TestResult,
        EntityType::Release,
        EntityType::WikiPage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::WorkItem => "work_item",
            EntityType::Commit => "commit",
            EntityType::TestResult => "test_result",
            EntityType::Release => "release",
            EntityType::WikiPage => "wiki_page",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_token(s);
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                ConnectorError::configuration(format!(
                    "unknown entity type '{}'. Must be one of work_item, commit, test_result, release, wiki_page",
                    s
                ))
            })
    }
}

/// Which entity types a run visits.
///
/// Parsed case-insensitively; `-` and spaces are treated like `_`, so
/// `"Everything"`, `"work-items-only"` and `"Work Items Only"` are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentScope {
    WorkItemsOnly,
    Everything,
}

impl ContentScope {
    /// Entity types enabled by this scope, in processing order.
    pub fn enabled_entity_types(&self) -> Vec<EntityType> {
        EntityType::ALL
            .into_iter()
            .filter(|t| self.enables(*t))
            .collect()
    }

    pub fn enables(&self, entity_type: EntityType) -> bool {
        match self {
            ContentScope::Everything => true,
            ContentScope::WorkItemsOnly => entity_type == EntityType::WorkItem,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentScope::WorkItemsOnly => "work_items_only",
            ContentScope::Everything => "everything",
        }
    }
}

impl FromStr for ContentScope {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "everything" => Ok(ContentScope::Everything),
            "work_items_only" | "workitems_only" | "work_items" => Ok(ContentScope::WorkItemsOnly),
            _ => Err(ConnectorError::configuration(format!(
                "unrecognized content scope '{}'. Must be 'work_items_only' or 'everything'",
                s
            ))),
        }
    }
}

fn normalize_token(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

/// Whether a full document or a slim (existence/permission) document is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentMode {
    Full,
    Slim,
}

impl DocumentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentMode::Full => "full",
            DocumentMode::Slim => "slim",
        }
    }
}

/// A person referenced by a record (creator, assignee, author).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub display_name: Option<String>,
    pub unique_name: Option<String>,
}

/// A comment attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub text: String,
}

/// Reference to an attachment. Content is never fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: Option<String>,
    pub url: String,
}

/// Entity-type-tagged intermediate record produced by an extractor.
///
/// Metadata values are kept as raw JSON here; the document builder coerces
/// them to strings.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub entity_type: EntityType,
    /// Stable upstream identifier, unique within the entity type.
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    pub owners: Vec<Person>,
    pub last_modified: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub attachments: Vec<Attachment>,
    pub comments: Vec<Comment>,
}

impl NormalizedRecord {
    /// A record with only identity fields set.
    pub fn new(entity_type: EntityType, source_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            source_id: source_id.into(),
            title: String::new(),
            body: String::new(),
            author: None,
            owners: Vec::new(),
            last_modified: None,
            url: None,
            metadata: BTreeMap::new(),
            attachments: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Insert a metadata entry, ignoring JSON nulls.
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.insert_meta(key, value);
        self
    }

    pub fn insert_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        let value = value.into();
        if !value.is_null() {
            self.metadata.insert(key.to_string(), value);
        }
    }
}

/// Last-modified state of a document.
///
/// Upstream records frequently omit this field; that case is carried
/// explicitly as `Unknown` rather than a sentinel date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "snake_case")]
pub enum LastModified {
    Known(DateTime<Utc>),
    Unknown,
}

impl From<Option<DateTime<Utc>>> for LastModified {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(ts) => LastModified::Known(ts),
            None => LastModified::Unknown,
        }
    }
}

/// Full document handed to the indexing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// `{entity_type}:{organization}:{project}:{source_id}`
    pub id: String,
    pub entity_type: EntityType,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub owners: Vec<Person>,
    pub last_modified: LastModified,
    pub metadata: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
    /// SHA-256 of the indexable content, used by the pipeline to skip unchanged documents.
    pub content_hash: String,
}

/// Minimal document used for deletion and permission reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlimDocument {
    pub id: String,
    pub entity_type: EntityType,
    pub source_id: String,
    pub last_modified: LastModified,
    /// Only the metadata that drives access-control checks.
    pub metadata: BTreeMap<String, String>,
}

/// Output of the document builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BuiltDocument {
    Full(Document),
    Slim(SlimDocument),
}

impl BuiltDocument {
    pub fn id(&self) -> &str {
        match self {
            BuiltDocument::Full(doc) => &doc.id,
            BuiltDocument::Slim(doc) => &doc.id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            BuiltDocument::Full(doc) => doc.entity_type,
            BuiltDocument::Slim(doc) => doc.entity_type,
        }
    }
}

/// A source-control repository with its resolved default branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    pub id: String,
    pub name: String,
    pub default_branch: String,
    pub web_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parsing_ignores_case() {
        for s in ["everything", "Everything", "EVERYTHING", " everything "] {
            assert_eq!(s.parse::<ContentScope>().unwrap(), ContentScope::Everything);
        }
        for s in ["work_items_only", "Work_Items_Only", "work-items-only", "Work Items Only"] {
            assert_eq!(
                s.parse::<ContentScope>().unwrap(),
                ContentScope::WorkItemsOnly
            );
        }
    }

    #[test]
    fn scope_case_variants_enable_identical_sets() {
        let variants = ["everything", "Everything", "eVeRyThInG"];
        let expected = ContentScope::Everything.enabled_entity_types();
        for v in variants {
            let scope: ContentScope = v.parse().unwrap();
            assert_eq!(scope.enabled_entity_types(), expected);
        }
    }

    #[test]
    fn unknown_scope_is_a_configuration_error() {
        let err = "some".parse::<ContentScope>().unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[test]
    fn everything_is_superset_of_work_items_only() {
        let narrow = ContentScope::WorkItemsOnly.enabled_entity_types();
        let wide = ContentScope::Everything.enabled_entity_types();
        assert_eq!(narrow, vec![EntityType::WorkItem]);
        assert!(narrow.iter().all(|t| wide.contains(t)));
        assert_eq!(wide, EntityType::ALL.to_vec());
    }

    #[test]
    fn entity_type_round_trips_through_str() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert_eq!("Wiki-Page".parse::<EntityType>().unwrap(), EntityType::WikiPage);
    }

    #[test]
    fn null_metadata_is_not_stored() {
        let record = NormalizedRecord::new(EntityType::WorkItem, "1")
            .with_meta("state", "Active")
            .with_meta("severity", serde_json::Value::Null);
        assert_eq!(record.metadata.len(), 1);
        assert!(record.metadata.contains_key("state"));
    }

    #[test]
    fn last_modified_serializes_unknown_explicitly() {
        let json = serde_json::to_value(LastModified::Unknown).unwrap();
        assert_eq!(json, serde_json::json!({"state": "unknown"}));
        let known: LastModified = Some(chrono::Utc::now()).into();
        assert!(matches!(known, LastModified::Known(_)));
    }
}
