//! Commit extractor.
//!
//! Walks every repository that passes the name filter, resolves its default
//! branch, and pages through that branch's history within the query window.
//! Repositories that cannot be read (no branches, gone) are skipped with a
//! warning and do not fail the pass.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{
    format_timestamp, parse_timestamp, str_field, ExtractContext, ExtractSummary, Extractor,
    RecordSink,
};
use crate::branch::{BranchResolver, GitRepository};
use crate::client::{ApiRequest, DevOpsClient};
use crate::error::{ConnectorError, Result};
use crate::models::{EntityType, NormalizedRecord, RepositoryDescriptor};
use crate::paginate::Paginator;

const RELATED_FIELDS: &str = "System.Id,System.Title,System.WorkItemType,System.State";

pub struct CommitExtractor;

#[async_trait]
impl Extractor for CommitExtractor {
    fn entity_type(&self) -> EntityType {
        EntityType::Commit
    }

    async fn extract(
        &self,
        ctx: &ExtractContext<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();
        let repositories = list_repositories(ctx).await?;
        let mut resolver = BranchResolver::new(ctx.client, ctx.settings.http.page_size);

        for repository in repositories {
            ctx.checkpoint()?;
            let branch = match resolver.resolve_default_branch(&repository).await {
                Ok(branch) => branch,
                Err(e) if repository_gone(&e) => {
                    skip_repository(&repository.name, &e, &mut summary);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let descriptor = RepositoryDescriptor {
                id: repository.id.clone(),
                name: repository.name.clone(),
                default_branch: branch,
                web_url: repository.web_url.clone(),
            };
            let count = match extract_repository(ctx, &descriptor, sink, &mut summary).await {
                Ok(count) => count,
                Err(e) if repository_gone(&e) => {
                    skip_repository(&descriptor.name, &e, &mut summary);
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!(repository = %descriptor.name, branch = %descriptor.default_branch, commits = count, "repository done");
        }

        Ok(summary)
    }
}

/// Errors that end one repository's walk without failing the pass.
fn repository_gone(error: &ConnectorError) -> bool {
    matches!(
        error,
        ConnectorError::RepositoryState { .. } | ConnectorError::NotFound(_)
    )
}

fn skip_repository(name: &str, error: &ConnectorError, summary: &mut ExtractSummary) {
    warn!(repository = %name, error = %error, "skipping repository");
    summary.warn(format!("repository {} skipped: {}", name, error));
}

async fn list_repositories(ctx: &ExtractContext<'_>) -> Result<Vec<GitRepository>> {
    let raw = Paginator::new(
        ctx.client,
        ApiRequest::get("git/repositories"),
        ctx.settings.http.page_size,
    )
    .max_pages(ctx.settings.http.max_pages)
    .collect_all()
    .await?;

    let mut repositories: Vec<GitRepository> = raw
        .into_iter()
        .filter_map(|r| serde_json::from_value::<GitRepository>(r).ok())
        .filter(|r| r.is_disabled != Some(true))
        .filter(|r| ctx.settings.repository_allowed(&r.name))
        .collect();
    repositories.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(repositories)
}

pub fn commits_request(ctx: &ExtractContext<'_>, repository: &RepositoryDescriptor) -> ApiRequest {
    ApiRequest::get(format!("git/repositories/{}/commits", repository.id))
        .query("searchCriteria.itemVersion.version", &repository.default_branch)
        .query("searchCriteria.itemVersion.versionType", "branch")
        .query_opt("searchCriteria.fromDate", ctx.since.map(format_timestamp))
        .query("searchCriteria.toDate", format_timestamp(ctx.until))
        .query("searchCriteria.includeWorkItems", true)
}

async fn extract_repository(
    ctx: &ExtractContext<'_>,
    repository: &RepositoryDescriptor,
    sink: &mut dyn RecordSink,
    summary: &mut ExtractSummary,
) -> Result<usize> {
    let mut pages = Paginator::new(
        ctx.client,
        commits_request(ctx, repository),
        ctx.settings.http.page_size,
    )
    .max_pages(ctx.settings.http.max_pages);
    let mut count = 0;

    loop {
        ctx.checkpoint()?;
        let Some(page) = pages.next_page().await? else {
            break;
        };
        summary.pages += 1;

        let mut records: Vec<NormalizedRecord> = page
            .items
            .iter()
            .filter_map(|commit| build_record(ctx.client, repository, commit))
            .collect();

        if ctx.is_full() {
            let related = related_ids(&page.items);
            if !related.is_empty() {
                match fetch_related(ctx.client, &related).await {
                    Ok(lines) => attach_related(&mut records, &page.items, &lines),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(repository = %repository.name, error = %e, "related work items unavailable");
                        summary.warn(format!(
                            "related work items for {} unavailable: {}",
                            repository.name, e
                        ));
                    }
                }
            }
        }

        count += records.len();
        summary.records += records.len();
        if !records.is_empty() {
            sink.accept(records).await?;
        }
    }
    Ok(count)
}

fn build_record(
    client: &DevOpsClient,
    repository: &RepositoryDescriptor,
    commit: &Value,
) -> Option<NormalizedRecord> {
    let commit_id = str_field(commit, "commitId")?;
    let message = str_field(commit, "comment").unwrap_or_default();
    let first_line = message.lines().next().unwrap_or_default();
    let short: String = commit_id.chars().take(8).collect();
    let author = commit.get("author");
    let committer = commit.get("committer");

    let mut record = NormalizedRecord::new(
        EntityType::Commit,
        format!("{}/{}", repository.id, commit_id),
    );
    record.title = format!("Commit {}: {}", short, first_line).trim_end().to_string();
    record.author = author.and_then(|a| str_field(a, "name"));
    record.last_modified = parse_timestamp(committer.and_then(|c| c.get("date")))
        .or_else(|| parse_timestamp(author.and_then(|a| a.get("date"))));
    let url = str_field(commit, "remoteUrl").unwrap_or_else(|| {
        client.web_url(&format!("_git/{}/commit/{}", repository.name, commit_id))
    });
    record.url = Some(url.clone());

    let mut body = message.clone();
    if let Some(counts) = commit.get("changeCounts") {
        let count = |k: &str| counts.get(k).and_then(Value::as_i64).unwrap_or(0);
        body.push_str(&format!(
            "\n\nChanges: {} added, {} edited, {} deleted",
            count("Add"),
            count("Edit"),
            count("Delete")
        ));
    }
    record.body = body;

    let related: Vec<String> = related_for(commit).iter().map(|id| id.to_string()).collect();
    record.insert_meta("repository_name", repository.name.as_str());
    record.insert_meta("repository_id", repository.id.as_str());
    record.insert_meta("commit_id", commit_id.as_str());
    record.insert_meta("author_name", author.and_then(|a| a.get("name")).cloned().unwrap_or(Value::Null));
    record.insert_meta("author_email", author.and_then(|a| a.get("email")).cloned().unwrap_or(Value::Null));
    record.insert_meta("commit_url", url);
    let commit_date = record.last_modified.map(format_timestamp);
    record.insert_meta("commit_date", commit_date.map(Value::from).unwrap_or(Value::Null));
    record.insert_meta("branch", repository.default_branch.as_str());
    if !related.is_empty() {
        record.insert_meta("related_work_items", related.join(","));
    }
    Some(record)
}

fn related_for(commit: &Value) -> Vec<i64> {
    commit
        .get("workItems")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| match r.get("id") {
                    Some(Value::Number(n)) => n.as_i64(),
                    Some(Value::String(s)) => s.parse().ok(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn related_ids(commits: &[Value]) -> Vec<i64> {
    let mut ids: Vec<i64> = commits.iter().flat_map(related_for).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.truncate(crate::config::MAX_DETAIL_BATCH);
    ids
}

pub fn related_request(ids: &[i64]) -> ApiRequest {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    ApiRequest::get("wit/workitems")
        .query("ids", ids.join(","))
        .query("fields", RELATED_FIELDS)
        .query("errorPolicy", "omit")
}

/// `[Type] #id: title (state)` per related work item, keyed by id.
async fn fetch_related(client: &DevOpsClient, ids: &[i64]) -> Result<Vec<(i64, String)>> {
    let response = client.send(&related_request(ids)).await?;
    Ok(response
        .value_array()
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_i64)?;
            let fields = item.get("fields")?;
            Some((
                id,
                format!(
                    "[{}] #{}: {} ({})",
                    str_field(fields, "System.WorkItemType").unwrap_or_default(),
                    id,
                    str_field(fields, "System.Title").unwrap_or_default(),
                    str_field(fields, "System.State").unwrap_or_default()
                ),
            ))
        })
        .collect())
}

fn attach_related(records: &mut [NormalizedRecord], commits: &[Value], lines: &[(i64, String)]) {
    for record in records.iter_mut() {
        let commit_id = record.metadata.get("commit_id").and_then(Value::as_str);
        let Some(commit) = commits
            .iter()
            .find(|c| c.get("commitId").and_then(Value::as_str) == commit_id)
        else {
            continue;
        };
        let block: Vec<&str> = related_for(commit)
            .iter()
            .filter_map(|id| lines.iter().find(|(found, _)| found == id))
            .map(|(_, line)| line.as_str())
            .collect();
        if !block.is_empty() {
            record.body.push_str("\n\nRelated Work Items:\n");
            record.body.push_str(&block.join("\n"));
        }
    }
}
