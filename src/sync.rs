//! Sync orchestration.
//!
//! A run moves through `Idle → Validating → Running(entity) → Completed`, or
//! ends in `Failed`. Entity types are visited one at a time in
//! [`EntityType::ALL`] order; only the ones enabled by the content scope run.
//!
//! - A fatal error (bad configuration, rejected credential) or a broken sink
//!   stops the run. Cursors already advanced for earlier entity types stay
//!   advanced in the returned [`CursorSet`].
//! - Any other error fails only the entity type that raised it; its cursor is
//!   left where it was so the next run retries the same window.
//! - Cancellation is honoured between pages. The run ends `Completed`, the
//!   interrupted and unstarted entity types are reported `Skipped`, and their
//!   cursors do not move.
//!
//! Cursors are passed in and handed back; nothing here persists them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::CursorSet;
use crate::client::DevOpsClient;
use crate::config::{ConnectorConfig, ConnectorSettings, HttpConfig};
use crate::credentials::CredentialProvider;
use crate::document::DocumentBuilder;
use crate::error::{ConnectorError, Result};
use crate::extractors::{ExtractContext, ExtractSummary, ExtractorRegistry, RecordSink};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::models::{BuiltDocument, DocumentMode, EntityType, NormalizedRecord};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::rate_limit::RequestBudget;
use crate::sink::DocumentSink;

/// Default number of documents per emitted batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "entity", rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Validating,
    Running(EntityType),
    Completed,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("idle"),
            SyncState::Validating => f.write_str("validating"),
            SyncState::Running(et) => write!(f, "running({})", et),
            SyncState::Completed => f.write_str("completed"),
            SyncState::Failed => f.write_str("failed"),
        }
    }
}

/// How one entity type ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EntityStatus {
    Succeeded,
    Skipped(String),
    Failed(String),
}

impl EntityStatus {
    pub fn label(&self) -> &'static str {
        match self {
            EntityStatus::Succeeded => "succeeded",
            EntityStatus::Skipped(_) => "skipped",
            EntityStatus::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            EntityStatus::Succeeded => None,
            EntityStatus::Skipped(r) | EntityStatus::Failed(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub entity_type: EntityType,
    #[serde(flatten)]
    pub status: EntityStatus,
    pub records: usize,
    pub documents: u64,
    pub pages: usize,
    pub warnings: Vec<String>,
}

impl EntityReport {
    fn new(entity_type: EntityType, status: EntityStatus) -> Self {
        Self {
            entity_type,
            status,
            records: 0,
            documents: 0,
            pages: 0,
            warnings: Vec::new(),
        }
    }
}

/// Result of one run. Always returned, even when the run failed.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub run_id: String,
    pub mode: DocumentMode,
    pub state: SyncState,
    /// Message of the error that failed the run, if any.
    pub error: Option<String>,
    pub reports: Vec<EntityReport>,
    pub cursors: CursorSet,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requests: u64,
    pub throttled_responses: u64,
    /// Every state the run passed through, in order.
    pub transitions: Vec<SyncState>,
}

impl SyncOutcome {
    pub fn report(&self, entity_type: EntityType) -> Option<&EntityReport> {
        self.reports.iter().find(|r| r.entity_type == entity_type)
    }

    pub fn documents(&self) -> u64 {
        self.reports.iter().map(|r| r.documents).sum()
    }
}

pub struct SyncOrchestrator {
    connector: ConnectorConfig,
    http: HttpConfig,
    credentials: Arc<dyn CredentialProvider>,
    transport: Option<Arc<dyn HttpTransport>>,
    registry: ExtractorRegistry,
    progress: Box<dyn SyncProgressReporter>,
    batch_size: usize,
    window_end: Option<DateTime<Utc>>,
    state: SyncState,
}

impl SyncOrchestrator {
    pub fn new(
        connector: ConnectorConfig,
        http: HttpConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            connector,
            http,
            credentials,
            transport: None,
            registry: ExtractorRegistry::with_defaults(),
            progress: Box::new(NoProgress),
            batch_size: DEFAULT_BATCH_SIZE,
            window_end: None,
            state: SyncState::Idle,
        }
    }

    /// Use `transport` instead of a reqwest client built from the HTTP settings.
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fix the end of the query window instead of using the wall clock.
    pub fn with_window_end(mut self, until: DateTime<Utc>) -> Self {
        self.window_end = Some(until);
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub async fn full_sync(
        &mut self,
        cursors: CursorSet,
        sink: &mut dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        self.run(DocumentMode::Full, cursors, sink, cancel).await
    }

    pub async fn slim_sync(
        &mut self,
        cursors: CursorSet,
        sink: &mut dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        self.run(DocumentMode::Slim, cursors, sink, cancel).await
    }

    /// Run every enabled entity type once and return the updated cursors.
    pub async fn run(
        &mut self,
        mode: DocumentMode,
        cursors: CursorSet,
        sink: &mut dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let started_at = Utc::now();
        let until = self.window_end.unwrap_or(started_at);
        let mut outcome = SyncOutcome {
            run_id: Uuid::new_v4().to_string(),
            mode,
            state: SyncState::Idle,
            error: None,
            reports: Vec::new(),
            cursors,
            started_at,
            finished_at: started_at,
            requests: 0,
            throttled_responses: 0,
            transitions: vec![SyncState::Idle],
        };
        self.state = SyncState::Idle;

        self.enter(&mut outcome, SyncState::Validating);
        let (settings, client) = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "sync validation failed");
                outcome.error = Some(e.to_string());
                self.enter(&mut outcome, SyncState::Failed);
                outcome.finished_at = Utc::now();
                return outcome;
            }
        };

        info!(
            run_id = %outcome.run_id,
            organization = %settings.organization,
            project = %settings.project,
            scope = settings.scope.as_str(),
            mode = mode.as_str(),
            until = %until,
            "starting sync"
        );

        let builder = DocumentBuilder::new(&settings.organization, &settings.project)
            .include_comments(settings.include_comments);
        let mut stop: Option<String> = None;
        let mut aborted = false;

        for entity_type in EntityType::ALL {
            if !settings.scope.enables(entity_type) {
                outcome.reports.push(EntityReport::new(
                    entity_type,
                    EntityStatus::Skipped("not in content scope".to_string()),
                ));
                continue;
            }
            if stop.is_none() && cancel.is_cancelled() {
                stop = Some("cancelled".to_string());
            }
            if let Some(reason) = &stop {
                self.finish_entity(
                    &mut outcome,
                    EntityReport::new(entity_type, EntityStatus::Skipped(reason.clone())),
                );
                continue;
            }

            self.enter(&mut outcome, SyncState::Running(entity_type));
            self.progress.report(SyncProgressEvent::Started { entity: entity_type });

            let Some(extractor) = self.registry.get(entity_type) else {
                self.finish_entity(
                    &mut outcome,
                    EntityReport::new(
                        entity_type,
                        EntityStatus::Failed("no extractor registered".to_string()),
                    ),
                );
                continue;
            };

            let ctx = ExtractContext {
                client: &client,
                settings: &settings,
                mode,
                since: outcome.cursors.get(entity_type),
                until,
                cancel,
            };
            let mut emitter = Emitter {
                entity_type,
                mode,
                builder: &builder,
                sink: &mut *sink,
                buffer: Vec::new(),
                batch_size: self.batch_size,
                emitted: 0,
                progress: self.progress.as_ref(),
            };

            debug!(entity = %entity_type, since = ?ctx.since, "extracting");
            let result = extractor.extract(&ctx, &mut emitter).await;
            let result = match result {
                Ok(summary) => emitter.flush().await.map(|_| summary),
                Err(ConnectorError::Cancelled) => match emitter.flush().await {
                    Ok(()) => Err(ConnectorError::Cancelled),
                    Err(e) => Err(e),
                },
                Err(e) => {
                    emitter.discard();
                    Err(e)
                }
            };
            let emitted = emitter.emitted;

            let report = match result {
                Ok(summary) => {
                    outcome.cursors.advance(entity_type, until);
                    info!(
                        entity = %entity_type,
                        records = summary.records,
                        documents = emitted,
                        warnings = summary.warnings.len(),
                        "entity sync succeeded"
                    );
                    with_summary(entity_type, EntityStatus::Succeeded, summary, emitted)
                }
                Err(ConnectorError::Cancelled) => {
                    info!(entity = %entity_type, documents = emitted, "sync cancelled");
                    stop = Some("cancelled".to_string());
                    let mut report =
                        EntityReport::new(entity_type, EntityStatus::Skipped("cancelled".to_string()));
                    report.documents = emitted;
                    report
                }
                Err(e) if aborts_run(&e) => {
                    warn!(entity = %entity_type, error = %e, "sync aborted");
                    outcome.error = Some(e.to_string());
                    stop = Some("run aborted".to_string());
                    aborted = true;
                    let mut report = EntityReport::new(entity_type, EntityStatus::Failed(e.to_string()));
                    report.documents = emitted;
                    report
                }
                Err(e) => {
                    warn!(entity = %entity_type, error = %e, "entity sync failed");
                    let mut report = EntityReport::new(entity_type, EntityStatus::Failed(e.to_string()));
                    report.documents = emitted;
                    report
                }
            };
            self.finish_entity(&mut outcome, report);
        }

        if let Err(e) = sink.finish().await {
            warn!(error = %e, "sink finish failed");
            if !aborted {
                outcome.error = Some(e.to_string());
                aborted = true;
            }
        }

        let snapshot = client.budget().snapshot();
        outcome.requests = snapshot.total_requests;
        outcome.throttled_responses = snapshot.throttled_responses;
        outcome.finished_at = Utc::now();
        self.enter(
            &mut outcome,
            if aborted { SyncState::Failed } else { SyncState::Completed },
        );
        info!(
            run_id = %outcome.run_id,
            state = %outcome.state,
            documents = outcome.documents(),
            requests = outcome.requests,
            "sync finished"
        );
        outcome
    }

    /// The `Validating` state: settings, credential, then the client.
    async fn prepare(&self) -> Result<(ConnectorSettings, DevOpsClient)> {
        let settings = ConnectorSettings::validate(&self.connector, &self.http)?;
        let token = self.credentials.get_token(&settings.credential).await?;
        let transport: Arc<dyn HttpTransport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(
                ReqwestTransport::with_timeout(settings.http.timeout()).map_err(|e| {
                    ConnectorError::configuration(format!("cannot build HTTP client: {}", e))
                })?,
            ),
        };
        let client = DevOpsClient::new(
            transport,
            token,
            settings.client_options(),
            settings.http.retry_policy(),
            Arc::new(RequestBudget::new(settings.http.max_in_flight)),
        );
        Ok((settings, client))
    }

    fn enter(&mut self, outcome: &mut SyncOutcome, state: SyncState) {
        debug!(from = %self.state, to = %state, "sync state");
        self.state = state;
        outcome.state = state;
        outcome.transitions.push(state);
    }

    fn finish_entity(&self, outcome: &mut SyncOutcome, report: EntityReport) {
        self.progress.report(SyncProgressEvent::Finished {
            entity: report.entity_type,
            status: report.status.label().to_string(),
        });
        outcome.reports.push(report);
    }
}

fn aborts_run(error: &ConnectorError) -> bool {
    error.is_fatal() || matches!(error, ConnectorError::Sink(_))
}

fn with_summary(
    entity_type: EntityType,
    status: EntityStatus,
    summary: ExtractSummary,
    documents: u64,
) -> EntityReport {
    EntityReport {
        entity_type,
        status,
        records: summary.records,
        documents,
        pages: summary.pages,
        warnings: summary.warnings,
    }
}

/// Turns record pages into document batches of `batch_size`.
struct Emitter<'a> {
    entity_type: EntityType,
    mode: DocumentMode,
    builder: &'a DocumentBuilder,
    sink: &'a mut dyn DocumentSink,
    buffer: Vec<BuiltDocument>,
    batch_size: usize,
    emitted: u64,
    progress: &'a dyn SyncProgressReporter,
}

impl Emitter<'_> {
    async fn emit_batch(&mut self, batch: Vec<BuiltDocument>) -> Result<()> {
        let count = batch.len() as u64;
        self.sink.emit(self.entity_type, batch).await?;
        self.emitted += count;
        self.progress.report(SyncProgressEvent::Emitted {
            entity: self.entity_type,
            documents: self.emitted,
        });
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        self.emit_batch(batch).await
    }

    fn discard(&mut self) {
        if !self.buffer.is_empty() {
            debug!(entity = %self.entity_type, dropped = self.buffer.len(), "discarding buffered documents");
            self.buffer.clear();
        }
    }
}

#[async_trait]
impl RecordSink for Emitter<'_> {
    async fn accept(&mut self, records: Vec<NormalizedRecord>) -> Result<()> {
        for record in &records {
            self.buffer.push(self.builder.build(record, self.mode));
            if self.buffer.len() >= self.batch_size {
                let batch: Vec<BuiltDocument> = self.buffer.drain(..self.batch_size).collect();
                self.emit_batch(batch).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::extractors::Extractor;
    use crate::http::MockTransport;
    use crate::sink::CollectingSink;
    use std::sync::Mutex;

    fn until() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn earlier() -> DateTime<Utc> {
        until() - chrono::Duration::days(1)
    }

    #[derive(Clone)]
    enum Script {
        Records(Vec<&'static str>),
        Fail(fn() -> ConnectorError),
        CancelAfterFirstPage(CancellationToken),
    }

    struct Scripted {
        entity_type: EntityType,
        script: Script,
        seen_since: Arc<Mutex<Vec<Option<DateTime<Utc>>>>>,
    }

    #[async_trait]
    impl Extractor for Scripted {
        fn entity_type(&self) -> EntityType {
            self.entity_type
        }

        async fn extract(
            &self,
            ctx: &ExtractContext<'_>,
            sink: &mut dyn RecordSink,
        ) -> Result<ExtractSummary> {
            self.seen_since.lock().unwrap().push(ctx.since);
            let mut summary = ExtractSummary::default();
            match &self.script {
                Script::Records(ids) => {
                    ctx.checkpoint()?;
                    let records: Vec<NormalizedRecord> = ids
                        .iter()
                        .map(|id| {
                            NormalizedRecord::new(self.entity_type, *id).with_meta("type", "Bug")
                        })
                        .collect();
                    summary.records = records.len();
                    summary.pages = 1;
                    sink.accept(records).await?;
                    Ok(summary)
                }
                Script::Fail(make) => Err(make()),
                Script::CancelAfterFirstPage(token) => {
                    ctx.checkpoint()?;
                    sink.accept(vec![NormalizedRecord::new(self.entity_type, "p1")]).await?;
                    token.cancel();
                    ctx.checkpoint()?;
                    unreachable!("cancellation is checked before the next page")
                }
            }
        }
    }

    struct Harness {
        registry: ExtractorRegistry,
        seen_since: Arc<Mutex<Vec<Option<DateTime<Utc>>>>>,
    }

    impl Harness {
        fn new() -> Self {
            let seen_since = Arc::new(Mutex::new(Vec::new()));
            let mut registry = ExtractorRegistry::empty();
            for et in EntityType::ALL {
                registry.register(Box::new(Scripted {
                    entity_type: et,
                    script: Script::Records(vec!["1", "2"]),
                    seen_since: seen_since.clone(),
                }));
            }
            Self { registry, seen_since }
        }

        fn script(mut self, entity_type: EntityType, script: Script) -> Self {
            self.registry.register(Box::new(Scripted {
                entity_type,
                script,
                seen_since: self.seen_since.clone(),
            }));
            self
        }
    }

    fn orchestrator(scope: &str, harness: Harness) -> SyncOrchestrator {
        let mut connector = ConnectorConfig::new("org", "proj");
        connector.content_scope = scope.to_string();
        let http = HttpConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..HttpConfig::default()
        };
        SyncOrchestrator::new(connector, http, Arc::new(StaticCredentialProvider::new("pat")))
            .with_transport(Arc::new(MockTransport::new()))
            .with_registry(harness.registry)
            .with_window_end(until())
    }

    fn statuses(outcome: &SyncOutcome) -> Vec<(EntityType, &'static str)> {
        outcome
            .reports
            .iter()
            .map(|r| (r.entity_type, r.status.label()))
            .collect()
    }

    #[tokio::test]
    async fn everything_scope_visits_all_types_in_order() {
        let mut sync = orchestrator("Everything", Harness::new());
        let mut sink = CollectingSink::new();
        let outcome = sync.full_sync(CursorSet::new(), &mut sink, &CancellationToken::new()).await;

        assert_eq!(outcome.state, SyncState::Completed);
        assert_eq!(sync.state(), SyncState::Completed);
        assert_eq!(
            outcome.transitions,
            vec![
                SyncState::Idle,
                SyncState::Validating,
                SyncState::Running(EntityType::WorkItem),
                SyncState::Running(EntityType::Commit),
                SyncState::Running(EntityType::TestResult),
                SyncState::Running(EntityType::Release),
                SyncState::Running(EntityType::WikiPage),
                SyncState::Completed,
            ]
        );
        for et in EntityType::ALL {
            assert_eq!(outcome.cursors.get(et), Some(until()));
        }
        assert_eq!(outcome.documents(), 10);
        assert_eq!(sink.ids()[0], "work_item:org:proj:1");
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn work_items_only_skips_other_types() {
        let mut sync = orchestrator("WORK_ITEMS_ONLY", Harness::new());
        let mut sink = CollectingSink::new();
        let outcome = sync.slim_sync(CursorSet::new(), &mut sink, &CancellationToken::new()).await;

        assert_eq!(outcome.state, SyncState::Completed);
        assert_eq!(outcome.report(EntityType::WorkItem).unwrap().status, EntityStatus::Succeeded);
        assert_eq!(
            outcome.report(EntityType::Commit).unwrap().status,
            EntityStatus::Skipped("not in content scope".to_string())
        );
        assert_eq!(outcome.cursors.get(EntityType::Commit), None);
        assert!(sink.documents().all(|d| matches!(d, BuiltDocument::Slim(_))));
    }

    #[tokio::test]
    async fn stored_cursor_is_the_lower_bound() {
        let harness = Harness::new();
        let seen = harness.seen_since.clone();
        let mut sync = orchestrator("work_items_only", harness);
        let mut cursors = CursorSet::new();
        cursors.advance(EntityType::WorkItem, earlier());

        let outcome = sync
            .full_sync(cursors, &mut CollectingSink::new(), &CancellationToken::new())
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(earlier())]);
        assert_eq!(outcome.cursors.get(EntityType::WorkItem), Some(until()));
    }

    #[tokio::test]
    async fn recoverable_failure_is_scoped_to_one_entity_type() {
        let harness = Harness::new().script(
            EntityType::Commit,
            Script::Fail(|| ConnectorError::RetriesExhausted {
                operation: "GET git/repositories".to_string(),
                attempts: 4,
                last_error: "HTTP 503".to_string(),
            }),
        );
        let mut sync = orchestrator("everything", harness);
        let mut cursors = CursorSet::new();
        cursors.advance(EntityType::Commit, earlier());

        let outcome = sync
            .full_sync(cursors, &mut CollectingSink::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.state, SyncState::Completed);
        assert_eq!(
            statuses(&outcome),
            vec![
                (EntityType::WorkItem, "succeeded"),
                (EntityType::Commit, "failed"),
                (EntityType::TestResult, "succeeded"),
                (EntityType::Release, "succeeded"),
                (EntityType::WikiPage, "succeeded"),
            ]
        );
        assert_eq!(outcome.cursors.get(EntityType::Commit), Some(earlier()));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn credential_failure_aborts_the_run() {
        let harness = Harness::new().script(
            EntityType::TestResult,
            Script::Fail(|| ConnectorError::credential("HTTP 401")),
        );
        let mut sync = orchestrator("everything", harness);
        let mut sink = CollectingSink::new();
        let outcome = sync.full_sync(CursorSet::new(), &mut sink, &CancellationToken::new()).await;

        assert_eq!(outcome.state, SyncState::Failed);
        assert_eq!(
            statuses(&outcome),
            vec![
                (EntityType::WorkItem, "succeeded"),
                (EntityType::Commit, "succeeded"),
                (EntityType::TestResult, "failed"),
                (EntityType::Release, "skipped"),
                (EntityType::WikiPage, "skipped"),
            ]
        );
        assert_eq!(outcome.cursors.get(EntityType::Commit), Some(until()));
        assert_eq!(outcome.cursors.get(EntityType::TestResult), None);
        assert_eq!(sink.documents().count(), 4);
        assert!(outcome.error.unwrap().contains("credential"));
    }

    #[tokio::test]
    async fn cancellation_completes_without_advancing_interrupted_cursor() {
        let cancel = CancellationToken::new();
        let harness = Harness::new().script(EntityType::Commit, Script::CancelAfterFirstPage(cancel.clone()));
        let mut sync = orchestrator("everything", harness);
        let mut sink = CollectingSink::new();
        let outcome = sync.full_sync(CursorSet::new(), &mut sink, &cancel).await;

        assert_eq!(outcome.state, SyncState::Completed);
        assert_eq!(outcome.cursors.get(EntityType::WorkItem), Some(until()));
        assert_eq!(outcome.cursors.get(EntityType::Commit), None);
        for et in [EntityType::Commit, EntityType::TestResult, EntityType::WikiPage] {
            assert_eq!(
                outcome.report(et).unwrap().status,
                EntityStatus::Skipped("cancelled".to_string())
            );
        }
        // The page accepted before cancellation is still emitted.
        assert_eq!(outcome.report(EntityType::Commit).unwrap().documents, 1);
        assert_eq!(sink.documents().count(), 3);
    }

    #[tokio::test]
    async fn invalid_configuration_fails_before_any_request() {
        let transport = MockTransport::new();
        let mut sync = orchestrator("some_things", Harness::new())
            .with_transport(Arc::new(transport.clone()));
        let outcome = sync
            .full_sync(CursorSet::new(), &mut CollectingSink::new(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.state, SyncState::Failed);
        assert_eq!(
            outcome.transitions,
            vec![SyncState::Idle, SyncState::Validating, SyncState::Failed]
        );
        assert!(outcome.reports.is_empty());
        assert!(outcome.error.unwrap().contains("content scope"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_credential_fails_validation() {
        let mut connector = ConnectorConfig::new("org", "proj");
        connector.content_scope = "everything".to_string();
        let mut sync = SyncOrchestrator::new(
            connector,
            HttpConfig::default(),
            Arc::new(StaticCredentialProvider::missing()),
        )
        .with_transport(Arc::new(MockTransport::new()))
        .with_registry(Harness::new().registry);

        let outcome = sync
            .full_sync(CursorSet::new(), &mut CollectingSink::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.state, SyncState::Failed);
        assert!(outcome.error.unwrap().starts_with("credential error"));
    }

    #[tokio::test]
    async fn full_and_slim_share_document_ids() {
        let mut full_sink = CollectingSink::new();
        let mut slim_sink = CollectingSink::new();
        orchestrator("everything", Harness::new())
            .full_sync(CursorSet::new(), &mut full_sink, &CancellationToken::new())
            .await;
        orchestrator("everything", Harness::new())
            .slim_sync(CursorSet::new(), &mut slim_sink, &CancellationToken::new())
            .await;
        assert_eq!(full_sink.ids(), slim_sink.ids());
    }

    #[tokio::test]
    async fn documents_are_emitted_in_configured_batches() {
        let harness = Harness::new().script(
            EntityType::WorkItem,
            Script::Records(vec!["1", "2", "3", "4", "5"]),
        );
        let mut sync = orchestrator("work_items_only", harness).with_batch_size(2);
        let mut sink = CollectingSink::new();
        sync.full_sync(CursorSet::new(), &mut sink, &CancellationToken::new()).await;

        let sizes: Vec<usize> = sink.batches.iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
