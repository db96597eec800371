//! Continuation-token pagination.
//!
//! Every Azure DevOps listing the connector reads is paged with a
//! server-provided continuation token: returned in the
//! `x-ms-continuationtoken` header (GET listings) or a `continuationToken`
//! body field (POST queries), and sent back as a query parameter or body
//! field respectively. A [`Paginator`] wraps one listing and yields one page
//! per HTTP round trip.
//!
//! A paginator can be resumed from a saved token with
//! [`Paginator::resume_from`], which makes a partially read listing
//! restartable.

use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{ApiRequest, DevOpsClient};
use crate::error::{ConnectorError, Result};
use crate::http::HttpMethod;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// One page of raw records.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number within this listing.
    pub number: usize,
    pub items: Vec<Value>,
    /// Token for the page after this one, if any.
    pub continuation: Option<String>,
}

/// Lazily pages through one listing.
pub struct Paginator<'a> {
    client: &'a DevOpsClient,
    request: ApiRequest,
    items_field: &'static str,
    batch_size: usize,
    next_token: Option<String>,
    pages_fetched: usize,
    max_pages: usize,
    finished: bool,
}

/// Start paging `request`. `continuation` resumes a previously interrupted
/// listing; `None` starts from the first page.
pub fn fetch<'a>(
    client: &'a DevOpsClient,
    request: ApiRequest,
    batch_size: usize,
    continuation: Option<String>,
) -> Paginator<'a> {
    Paginator::new(client, request, batch_size).resume_from(continuation)
}

impl<'a> Paginator<'a> {
    pub fn new(client: &'a DevOpsClient, request: ApiRequest, batch_size: usize) -> Self {
        Self {
            client,
            request,
            items_field: "value",
            batch_size: batch_size.max(1),
            next_token: None,
            pages_fetched: 0,
            max_pages: DEFAULT_MAX_PAGES,
            finished: false,
        }
    }

    /// Name of the array field holding the page's records (default `value`).
    pub fn items_field(mut self, field: &'static str) -> Self {
        self.items_field = field;
        self
    }

    /// Upper bound on pages read from this listing.
    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn resume_from(mut self, token: Option<String>) -> Self {
        self.next_token = token;
        self
    }

    /// Token that would fetch the next page. `None` once the listing is
    /// exhausted or before the first page of a fresh listing.
    pub fn continuation(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetch the next page, or `Ok(None)` when the listing is exhausted.
    ///
    /// Fails with [`ConnectorError::PageLimit`] when the listing has more
    /// pages than `max_pages` allows. The token stays available through
    /// [`continuation`](Self::continuation).
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.finished {
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            warn!(
                operation = %self.request.operation(),
                max_pages = self.max_pages,
                "page limit reached with pages pending"
            );
            return Err(ConnectorError::PageLimit {
                operation: self.request.operation(),
                max_pages: self.max_pages,
            });
        }

        let request = self.page_request();
        let response = self.client.send(&request).await?;
        self.pages_fetched += 1;

        let items = response
            .body
            .get(self.items_field)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let next = response.continuation_token();

        if next.is_some() && next == self.next_token {
            warn!(
                operation = %self.request.operation(),
                "server repeated the continuation token, stopping listing"
            );
            self.next_token = None;
            self.finished = true;
        } else {
            self.finished = next.is_none();
            self.next_token = next;
        }

        debug!(
            operation = %self.request.operation(),
            page = self.pages_fetched,
            items = items.len(),
            more = !self.finished,
            "fetched page"
        );

        Ok(Some(Page {
            number: self.pages_fetched,
            items,
            continuation: self.next_token.clone(),
        }))
    }

    /// Drain every remaining page into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page.items);
        }
        Ok(all)
    }

    fn page_request(&self) -> ApiRequest {
        let mut request = self.request.clone();
        match request.method {
            HttpMethod::Get => {
                request = request.query("$top", self.batch_size);
                if let Some(token) = &self.next_token {
                    request = request.query("continuationToken", token);
                }
            }
            HttpMethod::Post => {
                let mut body = request.body.take().unwrap_or_else(|| Value::Object(Default::default()));
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("top".to_string(), Value::from(self.batch_size));
                    if let Some(token) = &self.next_token {
                        obj.insert("continuationToken".to_string(), Value::from(token.as_str()));
                    }
                }
                request.body = Some(body);
            }
        }
        request
    }
}
