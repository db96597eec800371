//! Test-run extractor.
//!
//! One record per test run. Full sync adds outcome statistics and a line per
//! test result; either sub-fetch may fail without dropping the run.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{
    format_timestamp, parse_timestamp, person, str_field, ExtractContext, ExtractSummary,
    Extractor, RecordSink,
};
use crate::client::{ApiRequest, DevOpsClient};
use crate::error::Result;
use crate::models::{EntityType, NormalizedRecord};
use crate::paginate::Paginator;

pub struct TestRunExtractor;

pub fn runs_request(ctx: &ExtractContext<'_>) -> ApiRequest {
    let request = ApiRequest::get("test/runs").query("includeRunDetails", true);
    match ctx.since {
        Some(since) => request
            .query("minLastUpdatedDate", format_timestamp(since))
            .query("maxLastUpdatedDate", format_timestamp(ctx.until)),
        None => request,
    }
}

fn statistics_request(run_id: &str) -> ApiRequest {
    ApiRequest::get(format!("test/runs/{}/statistics", run_id))
}

fn results_request(run_id: &str) -> ApiRequest {
    ApiRequest::get(format!("test/runs/{}/results", run_id))
}

/// Outcome counts for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total: i64,
}

impl RunStats {
    fn from_statistics(body: &Value) -> Self {
        let mut stats = RunStats::default();
        let entries = body
            .get("runStatistics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let count = entry.get("count").and_then(Value::as_i64).unwrap_or(0);
            match entry.get("outcome").and_then(Value::as_str).unwrap_or_default() {
                "Passed" => stats.passed += count,
                "Failed" | "Aborted" | "Error" | "Timeout" => stats.failed += count,
                "NotExecuted" | "NotApplicable" | "Inconclusive" | "Blocked" => {
                    stats.skipped += count
                }
                _ => {}
            }
            stats.total += count;
        }
        stats
    }
}

#[async_trait]
impl Extractor for TestRunExtractor {
    fn entity_type(&self) -> EntityType {
        EntityType::TestResult
    }

    async fn extract(
        &self,
        ctx: &ExtractContext<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();
        let mut pages = Paginator::new(ctx.client, runs_request(ctx), ctx.settings.http.page_size)
            .max_pages(ctx.settings.http.max_pages);

        loop {
            ctx.checkpoint()?;
            let Some(page) = pages.next_page().await? else {
                break;
            };
            summary.pages += 1;

            let mut records = Vec::with_capacity(page.items.len());
            for run in &page.items {
                let Some(mut record) = build_record(ctx.client, run) else {
                    continue;
                };
                if ctx.is_full() {
                    enrich(ctx, &mut record, &mut summary).await?;
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

fn build_record(client: &DevOpsClient, run: &Value) -> Option<NormalizedRecord> {
    let run_id = str_field(run, "id")?;
    let name = str_field(run, "name").unwrap_or_default();
    let state = str_field(run, "state");
    let build = run.get("build");

    let mut record = NormalizedRecord::new(EntityType::TestResult, run_id.clone());
    record.title = format!("Test Run {}: {}", run_id, name).trim_end().to_string();
    record.last_modified = parse_timestamp(run.get("lastUpdatedDate"))
        .or_else(|| parse_timestamp(run.get("completedDate")));
    let owner = person(run.get("owner"));
    record.author = owner.as_ref().and_then(|p| p.display_name.clone());
    record.owners.extend(owner);
    record.url = Some(
        str_field(run, "webAccessUrl")
            .unwrap_or_else(|| client.web_url(&format!("_testManagement/runs?runId={}", run_id))),
    );

    let mut body = Vec::new();
    if let Some(state) = &state {
        body.push(format!("State: {}", state));
    }
    if let Some(build_name) = build.and_then(|b| str_field(b, "name")) {
        body.push(format!("Build: {}", build_name));
    }
    if let Some(comment) = str_field(run, "comment") {
        body.push(format!("Comment: {}", comment));
    }
    record.body = body.join("\n");

    record.insert_meta("run_id", run_id.as_str());
    record.insert_meta("name", name.as_str());
    record.insert_meta("state", state.map(Value::from).unwrap_or(Value::Null));
    record.insert_meta("build_id", build.and_then(|b| str_field(b, "id")).map(Value::from).unwrap_or(Value::Null));
    record.insert_meta("is_automated", run.get("isAutomated").cloned().unwrap_or(Value::Null));
    record.insert_meta("total_tests", run.get("totalTests").cloned().unwrap_or(Value::Null));
    Some(record)
}

async fn enrich(
    ctx: &ExtractContext<'_>,
    record: &mut NormalizedRecord,
    summary: &mut ExtractSummary,
) -> Result<()> {
    let run_id = record.source_id.clone();

    match ctx.client.send(&statistics_request(&run_id)).await {
        Ok(response) => {
            let stats = RunStats::from_statistics(&response.body);
            record.insert_meta("stats_passed", stats.passed);
            record.insert_meta("stats_failed", stats.failed);
            record.insert_meta("stats_skipped", stats.skipped);
            record.insert_meta("stats_total", stats.total);
            record.body.push_str(&format!(
                "\nResults: {} passed, {} failed, {} skipped, {} total",
                stats.passed, stats.failed, stats.skipped, stats.total
            ));
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "test run statistics unavailable");
            summary.warn(format!("statistics for test run {} unavailable", run_id));
        }
    }

    let results = Paginator::new(ctx.client, results_request(&run_id), ctx.settings.http.page_size)
        .max_pages(ctx.settings.http.max_pages)
        .collect_all()
        .await;
    match results {
        Ok(results) if !results.is_empty() => {
            record.body.push_str("\n\nTest Results:\n");
            let lines: Vec<String> = results
                .iter()
                .map(|r| {
                    format!(
                        "- {}: {}",
                        str_field(r, "testCaseTitle")
                            .or_else(|| str_field(r, "automatedTestName"))
                            .unwrap_or_else(|| "Unnamed test".to_string()),
                        str_field(r, "outcome").unwrap_or_else(|| "Unknown".to_string())
                    )
                })
                .collect();
            record.body.push_str(&lines.join("\n"));
        }
        Ok(_) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "test results unavailable");
            summary.warn(format!("results for test run {} unavailable", run_id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::client;
    use crate::extractors::test_support::{settings, window_end, VecSink};
    use crate::http::{HttpMethod, MockTransport};
    use crate::models::DocumentMode;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn full_mode_adds_statistics_and_results() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let settings = settings(|_, _| {});
        let cancel = CancellationToken::new();
        let ctx = ExtractContext {
            client: &client,
            settings: &settings,
            mode: DocumentMode::Full,
            since: None,
            until: window_end(),
            cancel: &cancel,
        };
        let page = settings.http.page_size;

        transport.push_json(
            HttpMethod::Get,
            client.build_url(&runs_request(&ctx).query("$top", page)).unwrap(),
            json!({"value": [
                {"id": 7, "name": "Nightly", "state": "Completed", "build": {"id": "88", "name": "20240501.1"}, "owner": {"displayName": "Ada"}},
                {"id": 8, "name": "Smoke", "state": "InProgress", "lastUpdatedDate": null}
            ]}),
        );
        transport.push_json(
            HttpMethod::Get,
            client.build_url(&statistics_request("7")).unwrap(),
            json!({"runStatistics": [{"outcome": "Passed", "count": 9}, {"outcome": "Failed", "count": 1}]}),
        );
        transport.push_json(
            HttpMethod::Get,
            client.build_url(&results_request("7").query("$top", page)).unwrap(),
            json!({"value": [{"testCaseTitle": "login works", "outcome": "Passed"}]}),
        );
        transport.push_status(HttpMethod::Get, client.build_url(&statistics_request("8")).unwrap(), 500);
        transport.push_json(
            HttpMethod::Get,
            client.build_url(&results_request("8").query("$top", page)).unwrap(),
            json!({"value": []}),
        );

        let mut sink = VecSink::default();
        let summary = TestRunExtractor.extract(&ctx, &mut sink).await.unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);

        let nightly = records[0];
        assert_eq!(nightly.title, "Test Run 7: Nightly");
        assert_eq!(nightly.metadata["stats_passed"], json!(9));
        assert_eq!(nightly.metadata["stats_total"], json!(10));
        assert_eq!(nightly.metadata["build_id"], json!("88"));
        assert!(nightly.body.contains("- login works: Passed"));

        let smoke = records[1];
        assert!(smoke.last_modified.is_none());
        assert!(!smoke.metadata.contains_key("stats_total"));
        assert_eq!(summary.warnings, vec!["statistics for test run 8 unavailable".to_string()]);
    }

    #[tokio::test]
    async fn cursor_bounds_the_listing() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let settings = settings(|_, _| {});
        let cancel = CancellationToken::new();
        let ctx = ExtractContext {
            client: &client,
            settings: &settings,
            mode: DocumentMode::Slim,
            since: Some(window_end() - chrono::Duration::days(2)),
            until: window_end(),
            cancel: &cancel,
        };
        let url = client
            .build_url(&runs_request(&ctx).query("$top", settings.http.page_size))
            .unwrap();
        assert!(url.contains("minLastUpdatedDate=2024-05-30T00%3A00%3A00Z"));
        assert!(url.contains("maxLastUpdatedDate=2024-06-01T00%3A00%3A00Z"));
        transport.push_json(HttpMethod::Get, url, json!({"value": [{"id": 1, "name": "r"}]}));

        let mut sink = VecSink::default();
        TestRunExtractor.extract(&ctx, &mut sink).await.unwrap();
        assert_eq!(sink.source_ids(), vec!["1"]);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn listing_past_the_page_limit_fails_the_pass() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let settings = settings(|_, http| http.max_pages = 1);
        let cancel = CancellationToken::new();
        let ctx = ExtractContext {
            client: &client,
            settings: &settings,
            mode: DocumentMode::Slim,
            since: None,
            until: window_end(),
            cancel: &cancel,
        };
        let url = client
            .build_url(&runs_request(&ctx).query("$top", settings.http.page_size))
            .unwrap();
        let mut first = crate::http::HttpResponse::json(&json!({"value": [{"id": 1, "name": "r"}]}));
        first
            .headers
            .push(("x-ms-continuationtoken".to_string(), "more".to_string()));
        transport.push_response(HttpMethod::Get, url, first);

        let mut sink = VecSink::default();
        let err = TestRunExtractor.extract(&ctx, &mut sink).await.unwrap_err();
        assert!(matches!(err, crate::error::ConnectorError::PageLimit { max_pages: 1, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn statistics_are_bucketed() {
        let stats = RunStats::from_statistics(&json!({"runStatistics": [
            {"outcome": "Passed", "count": 3},
            {"outcome": "Failed", "count": 2},
            {"outcome": "NotExecuted", "count": 1},
            {"outcome": "Warning", "count": 4}
        ]}));
        assert_eq!(stats, RunStats { passed: 3, failed: 2, skipped: 1, total: 10 });
    }
}
