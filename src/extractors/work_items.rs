//! Work-item extractor.
//!
//! A WIQL query returns only ids, paged with a continuation token. Details
//! are fetched in batches of at most 200 ids with `errorPolicy=omit`, so a
//! deleted or inaccessible item comes back as `null` instead of failing the
//! batch. Batches run on a small worker pool; results are put back into
//! query order before they are emitted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    format_timestamp, parse_timestamp, person, str_field, ExtractContext, ExtractSummary,
    Extractor, RecordSink,
};
use crate::client::{ApiRequest, DevOpsClient};
use crate::error::{ConnectorError, Result};
use crate::models::{Attachment, Comment, EntityType, NormalizedRecord};
use crate::paginate::Paginator;

/// Fields requested for a full sync.
pub const FULL_FIELDS: &[&str] = &[
    "System.Id",
    "System.Title",
    "System.Description",
    "System.WorkItemType",
    "System.State",
    "System.CreatedBy",
    "System.CreatedDate",
    "System.ChangedBy",
    "System.ChangedDate",
    "System.Tags",
    "System.AssignedTo",
    "System.AreaPath",
    "System.IterationPath",
    "Microsoft.VSTS.Common.Priority",
    "Microsoft.VSTS.Common.Severity",
    "Microsoft.VSTS.Common.ResolvedDate",
    "Microsoft.VSTS.Common.ClosedDate",
    "Microsoft.VSTS.Common.Resolution",
];

/// Fields requested for a slim sync.
pub const SLIM_FIELDS: &[&str] = &[
    "System.Id",
    "System.WorkItemType",
    "System.AreaPath",
    "System.ChangedDate",
];

const COMMENTS_API_VERSION: &str = "7.0-preview.3";
const RESOLVED_SUFFIX: &str = " [Resolved]";

const RESOLVED_STATES: &[&str] = &["resolved", "closed", "done", "completed", "removed"];
const OPEN_STATES: &[&str] = &[
    "new",
    "active",
    "proposed",
    "in progress",
    "to do",
    "committed",
    "approved",
    "open",
    "design",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Resolved,
    NotResolved,
    Unknown,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Resolved => "Resolved",
            ResolutionStatus::NotResolved => "Not Resolved",
            ResolutionStatus::Unknown => "Unknown",
        }
    }
}

/// Classify a work item from its state and resolution fields.
pub fn resolution_status(fields: &Value) -> ResolutionStatus {
    let has = |key: &str| {
        fields
            .get(key)
            .map(|v| !v.is_null() && v.as_str() != Some(""))
            .unwrap_or(false)
    };
    if has("Microsoft.VSTS.Common.ResolvedDate")
        || has("Microsoft.VSTS.Common.ClosedDate")
        || has("Microsoft.VSTS.Common.Resolution")
    {
        return ResolutionStatus::Resolved;
    }
    let state = fields
        .get("System.State")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase());
    match state.as_deref() {
        Some(s) if RESOLVED_STATES.contains(&s) => ResolutionStatus::Resolved,
        Some(s) if OPEN_STATES.contains(&s) => ResolutionStatus::NotResolved,
        _ => ResolutionStatus::Unknown,
    }
}

/// The WIQL text for one extraction window.
pub fn build_wiql(ctx: &ExtractContext<'_>) -> String {
    let mut query =
        "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = @project".to_string();
    let types = &ctx.settings.work_item_types;
    if !types.is_empty() {
        let quoted: Vec<String> = types
            .iter()
            .map(|t| format!("'{}'", t.replace('\'', "''")))
            .collect();
        query.push_str(&format!(" AND [System.WorkItemType] IN ({})", quoted.join(", ")));
    }
    if let Some(since) = ctx.since {
        query.push_str(&format!(
            " AND [System.ChangedDate] >= '{}'",
            format_timestamp(since)
        ));
    }
    query.push_str(&format!(
        " AND [System.ChangedDate] < '{}'",
        format_timestamp(ctx.until)
    ));
    query.push_str(" ORDER BY [System.ChangedDate] ASC, [System.Id] ASC");
    query
}

pub fn wiql_request(ctx: &ExtractContext<'_>) -> ApiRequest {
    ApiRequest::post("wit/wiql", json!({ "query": build_wiql(ctx) })).query("timePrecision", true)
}

/// What to ask for when fetching details.
#[derive(Debug, Clone)]
struct DetailPlan {
    full: bool,
    fields: Option<String>,
    expand_relations: bool,
    comments: bool,
    attachments: bool,
    page_size: usize,
}

impl DetailPlan {
    fn for_context(ctx: &ExtractContext<'_>) -> Self {
        let full = ctx.is_full();
        let attachments = full && ctx.settings.include_attachments;
        let fields = if full { FULL_FIELDS } else { SLIM_FIELDS };
        Self {
            full,
            // The batch endpoint rejects `fields` together with `$expand`.
            fields: (!attachments).then(|| fields.join(",")),
            expand_relations: attachments,
            comments: full && ctx.settings.include_comments,
            attachments,
            page_size: ctx.settings.http.page_size,
        }
    }

    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        if let Some(fields) = &self.fields {
            request = request.query("fields", fields);
        }
        if self.expand_relations {
            request = request.query("$expand", "relations");
        }
        request
    }
}

fn batch_request(ids: &[i64], plan: &DetailPlan) -> ApiRequest {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let request = ApiRequest::get("wit/workitems").query("ids", ids.join(","));
    plan.apply(request).query("errorPolicy", "omit")
}

fn single_request(id: i64, plan: &DetailPlan) -> ApiRequest {
    plan.apply(ApiRequest::get(format!("wit/workitems/{}", id)))
}

fn comments_request(id: i64) -> ApiRequest {
    ApiRequest::get(format!("wit/workItems/{}/comments", id))
        .query("api-version", COMMENTS_API_VERSION)
}

pub struct WorkItemExtractor;

#[async_trait]
impl Extractor for WorkItemExtractor {
    fn entity_type(&self) -> EntityType {
        EntityType::WorkItem
    }

    async fn extract(
        &self,
        ctx: &ExtractContext<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();
        let plan = DetailPlan::for_context(ctx);
        let mut pages = Paginator::new(ctx.client, wiql_request(ctx), ctx.settings.http.page_size)
            .items_field("workItems")
            .max_pages(ctx.settings.http.max_pages);

        loop {
            ctx.checkpoint()?;
            let Some(page) = pages.next_page().await? else {
                break;
            };
            summary.pages += 1;

            let ids: Vec<i64> = page
                .items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_i64))
                .collect();
            if ids.is_empty() {
                continue;
            }

            let records = fetch_details(ctx, &ids, &plan, &mut summary).await?;
            summary.records += records.len();
            sink.accept(records).await?;
        }

        Ok(summary)
    }
}

struct BatchOutcome {
    records: Vec<(i64, NormalizedRecord)>,
    missing: Vec<i64>,
    comment_failures: Vec<i64>,
}

/// Fetch details for one page of ids on a bounded worker pool and return
/// records in query order.
async fn fetch_details(
    ctx: &ExtractContext<'_>,
    ids: &[i64],
    plan: &DetailPlan,
    summary: &mut ExtractSummary,
) -> Result<Vec<NormalizedRecord>> {
    let workers = Arc::new(Semaphore::new(ctx.settings.http.detail_concurrency));
    let mut tasks = JoinSet::new();

    for chunk in ids.chunks(ctx.settings.http.detail_batch_size) {
        let client = ctx.client.clone();
        let chunk = chunk.to_vec();
        let plan = plan.clone();
        let workers = Arc::clone(&workers);
        tasks.spawn(async move {
            let _slot = workers
                .acquire_owned()
                .await
                .map_err(|_| ConnectorError::Cancelled)?;
            fetch_batch(&client, &chunk, &plan).await
        });
    }

    let mut by_id: HashMap<i64, NormalizedRecord> = HashMap::with_capacity(ids.len());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| ConnectorError::transient(format!("work item detail worker failed: {}", e)))??;
        for id in outcome.missing {
            warn!(work_item_id = id, "work item not returned by detail fetch, skipping");
            summary.warn(format!("work item {} not found; skipped", id));
        }
        for id in outcome.comment_failures {
            summary.warn(format!("comments for work item {} unavailable", id));
        }
        by_id.extend(outcome.records);
    }

    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

async fn fetch_batch(client: &DevOpsClient, ids: &[i64], plan: &DetailPlan) -> Result<BatchOutcome> {
    let items: Vec<Value> = match client.send(&batch_request(ids, plan)).await {
        Ok(response) => response.value_array(),
        Err(e) if e.is_not_found() => {
            debug!(batch = ids.len(), "batch detail fetch returned 404, fetching individually");
            let mut items = Vec::new();
            for id in ids {
                match client.send(&single_request(*id, plan)).await {
                    Ok(response) => items.push(response.body),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            items
        }
        Err(e) => return Err(e),
    };

    let mut records = Vec::with_capacity(items.len());
    let mut comment_failures = Vec::new();
    for item in items {
        // errorPolicy=omit yields nulls for missing ids.
        let Some(id) = item.get("id").and_then(Value::as_i64) else {
            continue;
        };
        let mut record = build_record(client, &item, plan);
        if plan.comments {
            match fetch_comments(client, id, plan.page_size).await {
                Ok(comments) => record.comments = comments,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(work_item_id = id, error = %e, "failed to fetch comments");
                    comment_failures.push(id);
                }
            }
        }
        records.push((id, record));
    }

    let missing = ids
        .iter()
        .copied()
        .filter(|id| !records.iter().any(|(found, _)| found == id))
        .collect();

    Ok(BatchOutcome {
        records,
        missing,
        comment_failures,
    })
}

async fn fetch_comments(client: &DevOpsClient, id: i64, page_size: usize) -> Result<Vec<Comment>> {
    let raw = Paginator::new(client, comments_request(id), page_size)
        .items_field("comments")
        .collect_all()
        .await?;
    Ok(raw
        .iter()
        .filter_map(|c| {
            let text = str_field(c, "text")?;
            Some(Comment {
                author: c
                    .get("createdBy")
                    .and_then(|p| str_field(p, "displayName")),
                created_at: parse_timestamp(c.get("createdDate")),
                text,
            })
        })
        .collect())
}

fn build_record(client: &DevOpsClient, item: &Value, plan: &DetailPlan) -> NormalizedRecord {
    let empty = Value::Object(Default::default());
    let fields = item.get("fields").unwrap_or(&empty);
    let id = item
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let text = |key: &str| str_field(fields, key);

    let work_item_type = text("System.WorkItemType").unwrap_or_default();
    let status = resolution_status(fields);

    let mut record = NormalizedRecord::new(EntityType::WorkItem, id.clone());
    let title = text("System.Title").unwrap_or_default();
    record.title = format!("{} {}: {}", work_item_type, id, title)
        .trim()
        .to_string();
    if status == ResolutionStatus::Resolved && !record.title.ends_with(RESOLVED_SUFFIX) {
        record.title.push_str(RESOLVED_SUFFIX);
    }
    if let Some(description) = text("System.Description") {
        record.body = format!("Description:\n{}", description);
    }
    record.url = Some(client.web_url(&format!("_workitems/edit/{}", id)));
    record.last_modified = parse_timestamp(fields.get("System.ChangedDate"));

    let creator = person(fields.get("System.CreatedBy"));
    let assignee = person(fields.get("System.AssignedTo"));
    record.author = creator.as_ref().and_then(|p| p.display_name.clone());
    for owner in [creator, assignee].into_iter().flatten() {
        if !record.owners.contains(&owner) {
            record.owners.push(owner);
        }
    }

    record.insert_meta("type", fields.get("System.WorkItemType").cloned().unwrap_or(Value::Null));
    record.insert_meta("state", fields.get("System.State").cloned().unwrap_or(Value::Null));
    record.insert_meta(
        "priority",
        fields.get("Microsoft.VSTS.Common.Priority").cloned().unwrap_or(Value::Null),
    );
    record.insert_meta(
        "severity",
        fields.get("Microsoft.VSTS.Common.Severity").cloned().unwrap_or(Value::Null),
    );
    if let Some(tags) = text("System.Tags") {
        let tags: Vec<Value> = tags
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Value::from)
            .collect();
        record.insert_meta("tags", Value::Array(tags));
    }
    record.insert_meta("area_path", fields.get("System.AreaPath").cloned().unwrap_or(Value::Null));
    record.insert_meta(
        "iteration_path",
        fields.get("System.IterationPath").cloned().unwrap_or(Value::Null),
    );

    if plan.full {
        record.insert_meta("resolution_status", status.as_str());
        record.insert_meta("is_resolved", status == ResolutionStatus::Resolved);
        for (key, field) in [
            ("resolution", "Microsoft.VSTS.Common.Resolution"),
            ("resolved_date", "Microsoft.VSTS.Common.ResolvedDate"),
            ("closed_date", "Microsoft.VSTS.Common.ClosedDate"),
        ] {
            record.insert_meta(key, fields.get(field).cloned().unwrap_or(Value::Null));
        }
    }

    if plan.attachments {
        record.attachments = attachments(item);
    }
    record
}

fn attachments(item: &Value) -> Vec<Attachment> {
    item.get("relations")
        .and_then(Value::as_array)
        .map(|relations| {
            relations
                .iter()
                .filter(|r| r.get("rel").and_then(Value::as_str) == Some("AttachedFile"))
                .filter_map(|r| {
                    let url = str_field(r, "url")?;
                    let id = url.rsplit('/').next().unwrap_or_default().to_string();
                    Some(Attachment {
                        id,
                        name: r.get("attributes").and_then(|a| str_field(a, "name")),
                        url,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One cheap query used to verify credentials and project access.
pub async fn verify_access(client: &DevOpsClient) -> Result<()> {
    let request = ApiRequest::post(
        "wit/wiql",
        json!({ "query": "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = @project" }),
    )
    .query("$top", 1);
    client.send(&request).await.map(|_| ())
}
