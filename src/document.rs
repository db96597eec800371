//! Document builder: [`NormalizedRecord`] → [`Document`] / [`SlimDocument`].
//!
//! Document ids are derived only from the entity type, organization, project
//! and upstream id, so a record keeps its id across runs and across full and
//! slim builds.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{
    BuiltDocument, Document, DocumentMode, EntityType, LastModified, NormalizedRecord,
    SlimDocument,
};

/// Upper bound on indexable content per document.
pub const MAX_CONTENT_BYTES: usize = 500_000;

/// Metadata keys carried on slim documents, per entity type.
pub fn slim_metadata_keys(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::WorkItem => &["area_path", "type"],
        EntityType::Commit => &["repository_id", "repository_name"],
        EntityType::TestResult => &["run_id", "build_id"],
        EntityType::Release => &["definition_id", "definition_name"],
        EntityType::WikiPage => &["wiki_id", "page_path"],
    }
}

#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    organization: String,
    project: String,
    include_comments: bool,
}

impl DocumentBuilder {
    pub fn new(organization: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            include_comments: true,
        }
    }

    pub fn include_comments(mut self, include: bool) -> Self {
        self.include_comments = include;
        self
    }

    /// `{entity_type}:{organization}:{project}:{source_id}`
    pub fn document_id(&self, entity_type: EntityType, source_id: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            entity_type, self.organization, self.project, source_id
        )
    }

    pub fn build(&self, record: &NormalizedRecord, mode: DocumentMode) -> BuiltDocument {
        match mode {
            DocumentMode::Full => BuiltDocument::Full(self.build_full(record)),
            DocumentMode::Slim => BuiltDocument::Slim(self.build_slim(record)),
        }
    }

    pub fn build_full(&self, record: &NormalizedRecord) -> Document {
        let content = truncate_utf8(self.render_content(record), MAX_CONTENT_BYTES);
        let content_hash = hex::encode(Sha256::digest(content.as_bytes()));

        Document {
            id: self.document_id(record.entity_type, &record.source_id),
            entity_type: record.entity_type,
            source_id: record.source_id.clone(),
            title: record.title.clone(),
            content,
            url: record.url.clone(),
            author: record.author.clone(),
            owners: record.owners.clone(),
            last_modified: LastModified::from(record.last_modified),
            metadata: coerce_metadata(&record.metadata),
            attachments: record.attachments.clone(),
            content_hash,
        }
    }

    pub fn build_slim(&self, record: &NormalizedRecord) -> SlimDocument {
        let keys = slim_metadata_keys(record.entity_type);
        let metadata = coerce_metadata(&record.metadata)
            .into_iter()
            .filter(|(k, _)| keys.contains(&k.as_str()))
            .collect();

        SlimDocument {
            id: self.document_id(record.entity_type, &record.source_id),
            entity_type: record.entity_type,
            source_id: record.source_id.clone(),
            last_modified: LastModified::from(record.last_modified),
            metadata,
        }
    }

    fn render_content(&self, record: &NormalizedRecord) -> String {
        let mut content = format!("Title: {}\n", record.title);
        if !record.body.trim().is_empty() {
            content.push('\n');
            content.push_str(record.body.trim_end());
            content.push('\n');
        }
        if self.include_comments && !record.comments.is_empty() {
            content.push_str("\nComments:\n");
            for comment in &record.comments {
                let author = comment.author.as_deref().unwrap_or("Unknown");
                content.push_str(&format!("- {}: {}\n", author, comment.text));
            }
        }
        content
    }
}

/// Coerce raw metadata values to strings. Nulls are dropped, lists are
/// joined with `", "`, and objects are rendered as compact JSON.
pub fn coerce_metadata(raw: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|(k, v)| coerce_value(v).map(|s| (k.clone(), s)))
        .collect()
}

fn coerce_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(coerce_value).collect();
            Some(parts.join(", "))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}
