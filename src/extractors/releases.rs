//! Release extractor.
//!
//! Releases live on the release-management host. The listing is windowed on
//! creation time, so a release is picked up once, in the window it was
//! created in.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{
    format_timestamp, parse_timestamp, person, str_field, ExtractContext, ExtractSummary,
    Extractor, RecordSink,
};
use crate::client::{ApiHost, ApiRequest, DevOpsClient};
use crate::error::Result;
use crate::models::{EntityType, NormalizedRecord};
use crate::paginate::Paginator;

pub struct ReleaseExtractor;

pub fn releases_request(ctx: &ExtractContext<'_>) -> ApiRequest {
    ApiRequest::get("release/releases")
        .on(ApiHost::Release)
        .query("$expand", "environments,artifacts")
        .query("queryOrder", "ascending")
        .query_opt("minCreatedTime", ctx.since.map(format_timestamp))
        .query("maxCreatedTime", format_timestamp(ctx.until))
}

fn detail_request(release_id: &str) -> ApiRequest {
    ApiRequest::get(format!("release/releases/{}", release_id)).on(ApiHost::Release)
}

fn approvals_request(release_id: &str) -> ApiRequest {
    ApiRequest::get("release/approvals")
        .on(ApiHost::Release)
        .query("releaseIdsFilter", release_id)
        .query("statusFilter", "all")
}

#[async_trait]
impl Extractor for ReleaseExtractor {
    fn entity_type(&self) -> EntityType {
        EntityType::Release
    }

    async fn extract(
        &self,
        ctx: &ExtractContext<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();
        let mut pages =
            Paginator::new(ctx.client, releases_request(ctx), ctx.settings.http.page_size)
                .max_pages(ctx.settings.http.max_pages);

        loop {
            ctx.checkpoint()?;
            let Some(page) = pages.next_page().await? else {
                break;
            };
            summary.pages += 1;

            let mut records = Vec::with_capacity(page.items.len());
            for listed in &page.items {
                let Some(release_id) = str_field(listed, "id") else {
                    continue;
                };
                let mut release = listed.clone();
                if ctx.is_full() {
                    match ctx.client.send(&detail_request(&release_id)).await {
                        Ok(response) => release = response.body,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(release_id = %release_id, error = %e, "release details unavailable");
                            summary.warn(format!("details for release {} unavailable", release_id));
                        }
                    }
                }

                let mut record = build_record(ctx.client, &release_id, &release);
                if ctx.is_full() {
                    match fetch_approvals(ctx.client, &release_id).await {
                        Ok(lines) if !lines.is_empty() => {
                            record.body.push_str("\n\nApprovals:\n");
                            record.body.push_str(&lines.join("\n"));
                        }
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(release_id = %release_id, error = %e, "release approvals unavailable");
                            summary.warn(format!("approvals for release {} unavailable", release_id));
                        }
                    }
                }
                records.push(record);
            }

            summary.records += records.len();
            if !records.is_empty() {
                sink.accept(records).await?;
            }
        }

        Ok(summary)
    }
}

async fn fetch_approvals(client: &DevOpsClient, release_id: &str) -> Result<Vec<String>> {
    let response = client.send(&approvals_request(release_id)).await?;
    Ok(response
        .value_array()
        .iter()
        .map(|approval| {
            let approver = person(approval.get("approver"))
                .and_then(|p| p.display_name)
                .unwrap_or_else(|| "Unknown".to_string());
            let kind = str_field(approval, "approvalType").unwrap_or_else(|| "approval".to_string());
            let status = str_field(approval, "status").unwrap_or_else(|| "unknown".to_string());
            let environment = approval
                .get("releaseEnvironment")
                .and_then(|env| str_field(env, "name"));
            match environment {
                Some(env) => format!("- {} ({} on {}): {}", approver, kind, env, status),
                None => format!("- {} ({}): {}", approver, kind, status),
            }
        })
        .collect())
}

fn build_record(client: &DevOpsClient, release_id: &str, release: &Value) -> NormalizedRecord {
    let name = str_field(release, "name").unwrap_or_else(|| format!("Release {}", release_id));
    let status = str_field(release, "status");
    let definition = release.get("releaseDefinition");
    let definition_name = definition.and_then(|d| str_field(d, "name"));
    let created_by = person(release.get("createdBy"));

    let mut record = NormalizedRecord::new(EntityType::Release, release_id);
    record.title = match &definition_name {
        Some(def) => format!("{} ({})", name, def),
        None => name.clone(),
    };
    record.last_modified = parse_timestamp(release.get("modifiedOn"))
        .or_else(|| parse_timestamp(release.get("createdOn")));
    record.author = created_by.as_ref().and_then(|p| p.display_name.clone());
    record.owners.extend(created_by.clone());
    let release_url = release
        .get("_links")
        .and_then(|links| links.get("web"))
        .and_then(|web| str_field(web, "href"))
        .unwrap_or_else(|| {
            client.web_url(&format!("_release?releaseId={}&_a=release-summary", release_id))
        });
    record.url = Some(release_url.clone());

    let mut body = Vec::new();
    if let Some(description) = str_field(release, "description") {
        body.push(format!("Description:\n{}", description));
    }
    if let Some(status) = &status {
        body.push(format!("Status: {}", status));
    }

    let environments = release
        .get("environments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !environments.is_empty() {
        let lines: Vec<String> = environments
            .iter()
            .map(|env| {
                format!(
                    "- {}: {}",
                    str_field(env, "name").unwrap_or_else(|| "Unnamed stage".to_string()),
                    str_field(env, "status").unwrap_or_else(|| "unknown".to_string())
                )
            })
            .collect();
        body.push(format!("Environments:\n{}", lines.join("\n")));
    }

    let artifacts: Vec<String> = release
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|a| str_field(a, "alias"))
                .collect()
        })
        .unwrap_or_default();
    if !artifacts.is_empty() {
        body.push(format!("Artifacts: {}", artifacts.join(", ")));
    }
    record.body = body.join("\n\n");

    record.insert_meta("release_id", release_id);
    record.insert_meta("name", name.as_str());
    record.insert_meta("status", status.map(Value::from).unwrap_or(Value::Null));
    record.insert_meta(
        "created_by",
        created_by.and_then(|p| p.display_name).map(Value::from).unwrap_or(Value::Null),
    );
    record.insert_meta(
        "definition_id",
        definition.and_then(|d| str_field(d, "id")).map(Value::from).unwrap_or(Value::Null),
    );
    record.insert_meta(
        "definition_name",
        definition_name.map(Value::from).unwrap_or(Value::Null),
    );
    record.insert_meta("release_url", release_url);
    for (i, env) in environments.iter().enumerate() {
        record.insert_meta(
            &format!("environment_{}_name", i),
            str_field(env, "name").map(Value::from).unwrap_or(Value::Null),
        );
        record.insert_meta(
            &format!("environment_{}_status", i),
            str_field(env, "status").map(Value::from).unwrap_or(Value::Null),
        );
    }
    if !artifacts.is_empty() {
        record.insert_meta("artifacts", artifacts);
    }
    record
}
