//! A fake Azure DevOps project served by axum on an ephemeral port.
//!
//! Work items 1..=3 exist in the query results; item 2 has been deleted, so
//! the detail endpoint returns `null` for it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::{json, Value};

pub const PAT: &str = "test-pat";

#[derive(Default)]
pub struct Upstream {
    /// Answer the next `n` WIQL queries with 429.
    pub throttle_wiql: AtomicUsize,
    pub wiql_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
    /// WIQL text of every accepted query, in arrival order.
    pub queries: Mutex<Vec<String>>,
}

impl Upstream {
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

pub struct FakeServer {
    pub addr: SocketAddr,
    pub upstream: Arc<Upstream>,
}

impl FakeServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!(":{}", PAT))
    );
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

fn work_item(id: i64) -> Value {
    json!({
        "id": id,
        "fields": {
            "System.Id": id,
            "System.Title": format!("Item {}", id),
            "System.Description": format!("Details for item {}", id),
            "System.WorkItemType": "Bug",
            "System.State": if id == 3 { "Closed" } else { "Active" },
            "System.AreaPath": "proj\\Web",
            "System.ChangedDate": "2024-05-10T12:00:00Z",
            "System.CreatedBy": {"displayName": "Ada", "uniqueName": "ada@contoso.com"},
            "System.Tags": "ui; regression"
        }
    })
}

async fn wiql(
    State(upstream): State<Arc<Upstream>>,
    Path((_org, _project)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    upstream.wiql_calls.fetch_add(1, Ordering::SeqCst);
    let throttled = upstream
        .throttle_wiql
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if throttled {
        return (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "0")]).into_response();
    }
    let query = body["query"].as_str().unwrap_or_default().to_string();
    assert!(query.contains("[System.TeamProject]"));
    upstream.queries.lock().unwrap().push(query);
    Json(json!({"workItems": [{"id": 1}, {"id": 2}, {"id": 3}]})).into_response()
}

async fn work_items(
    State(upstream): State<Arc<Upstream>>,
    Path((_org, _project)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    upstream.detail_calls.fetch_add(1, Ordering::SeqCst);
    let items: Vec<Value> = query
        .get("ids")
        .map(|ids| {
            ids.split(',')
                .filter_map(|id| id.parse::<i64>().ok())
                .map(|id| if id == 2 { Value::Null } else { work_item(id) })
                .collect()
        })
        .unwrap_or_default();
    Json(json!({"count": items.len(), "value": items})).into_response()
}

async fn comments(
    Path((_org, _project, id)): Path<(String, String, i64)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "totalCount": 1,
        "comments": [{
            "text": format!("Looks good for {}", id),
            "createdBy": {"displayName": "Grace"},
            "createdDate": "2024-05-11T09:00:00Z"
        }]
    }))
    .into_response()
}

pub async fn start() -> FakeServer {
    let upstream = Arc::new(Upstream::default());
    let app = Router::new()
        .route("/{org}/{project}/_apis/wit/wiql", post(wiql))
        .route("/{org}/{project}/_apis/wit/workitems", get(work_items))
        .route("/{org}/{project}/_apis/wit/workItems/{id}/comments", get(comments))
        .with_state(upstream.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FakeServer { addr, upstream }
}
