//! Wiki page extractor.
//!
//! Wiki pages carry no modification time in the batch listing, so every page
//! is emitted on every run with an unknown last-modified time. Content is only
//! fetched in full mode, one request per page.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{str_field, ExtractContext, ExtractSummary, Extractor, RecordSink};
use crate::client::{ApiRequest, DevOpsClient};
use crate::error::Result;
use crate::models::{EntityType, NormalizedRecord};
use crate::paginate::Paginator;

pub struct WikiExtractor;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wiki {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub remote_url: Option<String>,
}

fn wikis_request() -> ApiRequest {
    ApiRequest::get("wiki/wikis")
}

fn pages_batch_request(wiki_id: &str) -> ApiRequest {
    ApiRequest::post(format!("wiki/wikis/{}/pagesbatch", wiki_id), json!({}))
}

fn page_content_request(wiki_id: &str, path: &str) -> ApiRequest {
    ApiRequest::get(format!("wiki/wikis/{}/pages", wiki_id))
        .query("path", path)
        .query("includeContent", true)
}

#[async_trait]
impl Extractor for WikiExtractor {
    fn entity_type(&self) -> EntityType {
        EntityType::WikiPage
    }

    async fn extract(
        &self,
        ctx: &ExtractContext<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();

        ctx.checkpoint()?;
        let mut wikis: Vec<Wiki> = ctx.client.get_json::<WikiList>(&wikis_request()).await?.value;
        wikis.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = wikis.len(), "listed wikis");

        for wiki in &wikis {
            let mut pages = Paginator::new(
                ctx.client,
                pages_batch_request(&wiki.id),
                ctx.settings.http.page_size,
            )
            .max_pages(ctx.settings.http.max_pages);

            loop {
                ctx.checkpoint()?;
                let Some(page) = pages.next_page().await? else {
                    break;
                };
                summary.pages += 1;

                let mut records = Vec::with_capacity(page.items.len());
                for item in &page.items {
                    let Some(path) = str_field(item, "path") else {
                        continue;
                    };
                    let mut record = build_record(ctx.client, wiki, &path, item);
                    if ctx.is_full() {
                        match ctx.client.send(&page_content_request(&wiki.id, &path)).await {
                            Ok(response) => apply_content(&mut record, &response.body),
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                warn!(wiki = %wiki.name, path = %path, error = %e, "wiki page content unavailable");
                                summary.warn(format!(
                                    "content for wiki page {}{} unavailable",
                                    wiki.name, path
                                ));
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
        }

        Ok(summary)
    }
}

#[derive(Deserialize)]
struct WikiList {
    #[serde(default)]
    value: Vec<Wiki>,
}

fn build_record(client: &DevOpsClient, wiki: &Wiki, path: &str, item: &Value) -> NormalizedRecord {
    let page_id = str_field(item, "id");
    let mut record = NormalizedRecord::new(EntityType::WikiPage, format!("{}/{}", wiki.id, path.trim_start_matches('/')));
    record.title = match path.rsplit('/').find(|s| !s.is_empty()) {
        Some(leaf) => format!("{}: {}", wiki.name, leaf),
        None => wiki.name.clone(),
    };
    record.last_modified = None;
    let page_url = match &page_id {
        Some(id) => client.web_url(&format!("_wiki/wikis/{}/{}", wiki.name, id)),
        None => client.web_url(&format!("_wiki/wikis/{}?pagePath={}", wiki.name, path)),
    };
    record.url = Some(page_url.clone());

    record.insert_meta("wiki_id", wiki.id.as_str());
    record.insert_meta("wiki_name", wiki.name.as_str());
    record.insert_meta("page_id", page_id.map(Value::from).unwrap_or(Value::Null));
    record.insert_meta("page_path", path);
    record.insert_meta("page_url", page_url);
    record
}

fn apply_content(record: &mut NormalizedRecord, body: &Value) {
    if let Some(content) = body.get("content").and_then(Value::as_str) {
        record.body = content.to_string();
    }
    if let Some(remote) = str_field(body, "remoteUrl") {
        record.url = Some(remote);
    }
    if let Some(git_path) = str_field(body, "gitItemPath") {
        record.insert_meta("git_item_path", git_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::client;
    use crate::extractors::test_support::{settings, window_end, VecSink};
    use crate::http::{HttpMethod, HttpResponse, MockTransport};
    use crate::models::DocumentMode;
    use tokio_util::sync::CancellationToken;

    fn context<'a>(
        client: &'a DevOpsClient,
        settings: &'a crate::config::ConnectorSettings,
        cancel: &'a CancellationToken,
        mode: DocumentMode,
    ) -> ExtractContext<'a> {
        ExtractContext {
            client,
            settings,
            mode,
            since: None,
            until: window_end(),
            cancel,
        }
    }

    #[tokio::test]
    async fn pages_batch_follows_body_token_and_fetches_content() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let settings = settings(|_, _| {});
        let cancel = CancellationToken::new();
        let ctx = context(&client, &settings, &cancel, DocumentMode::Full);

        transport.push_json(
            HttpMethod::Get,
            client.build_url(&wikis_request()).unwrap(),
            json!({"value": [{"id": "w1", "name": "Team"}]}),
        );
        let batch_url = client.build_url(&pages_batch_request("w1")).unwrap();
        transport.push_json(
            HttpMethod::Post,
            batch_url.clone(),
            json!({"value": [{"id": 1, "path": "/Home"}], "continuationToken": "next"}),
        );
        transport.push_json(
            HttpMethod::Post,
            batch_url,
            json!({"value": [{"id": 2, "path": "/Home/Setup"}]}),
        );
        transport.push_json(
            HttpMethod::Get,
            client.build_url(&page_content_request("w1", "/Home")).unwrap(),
            json!({"content": "# Welcome", "path": "/Home"}),
        );
        transport.push_status(
            HttpMethod::Get,
            client.build_url(&page_content_request("w1", "/Home/Setup")).unwrap(),
            404,
        );

        let mut sink = VecSink::default();
        let summary = WikiExtractor.extract(&ctx, &mut sink).await.unwrap();
        assert_eq!(sink.source_ids(), vec!["w1/Home", "w1/Home/Setup"]);
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.warnings, vec!["content for wiki page Team/Home/Setup unavailable".to_string()]);

        let records = sink.records();
        assert_eq!(records[0].body, "# Welcome");
        assert_eq!(records[0].title, "Team: Home");
        assert_eq!(records[1].title, "Team: Setup");
        assert!(records[1].last_modified.is_none());
        assert_eq!(records[1].metadata["page_path"], json!("/Home/Setup"));

        let posts: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.method == HttpMethod::Post)
            .collect();
        assert_eq!(posts.len(), 2);
        let second: Value = serde_json::from_slice(&posts[1].body).unwrap();
        assert_eq!(second["continuationToken"], json!("next"));
    }

    #[tokio::test]
    async fn slim_mode_skips_content() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let settings = settings(|_, _| {});
        let cancel = CancellationToken::new();
        let ctx = context(&client, &settings, &cancel, DocumentMode::Slim);

        transport.push_json(
            HttpMethod::Get,
            client.build_url(&wikis_request()).unwrap(),
            json!({"value": [{"id": "w1", "name": "Team"}]}),
        );
        transport.push_response(
            HttpMethod::Post,
            client.build_url(&pages_batch_request("w1")).unwrap(),
            HttpResponse::json(&json!({"value": [{"id": 1, "path": "/Home"}]})),
        );

        let mut sink = VecSink::default();
        WikiExtractor.extract(&ctx, &mut sink).await.unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].metadata["page_url"], json!("https://dev.azure.com/org/proj/_wiki/wikis/Team/1"));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_listing() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let settings = settings(|_, _| {});
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = context(&client, &settings, &cancel, DocumentMode::Slim);

        let mut sink = VecSink::default();
        let err = WikiExtractor.extract(&ctx, &mut sink).await.unwrap_err();
        assert!(matches!(err, crate::error::ConnectorError::Cancelled));
        assert!(transport.requests().is_empty());
    }
}
