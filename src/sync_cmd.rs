//! Command handlers behind `azdo sync`, `azdo check` and `azdo checkpoint`.
//!
//! These sit between the CLI and the library: they load stored cursors,
//! pick the output sink, run the orchestrator and persist what came back.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::checkpoint::{cursor_source, CheckpointStore, CursorSet, RunRecord};
use crate::client::DevOpsClient;
use crate::config::{Config, ConnectorSettings};
use crate::credentials::{CredentialProvider, DefaultCredentialProvider};
use crate::db;
use crate::extractors::work_items;
use crate::http::ReqwestTransport;
use crate::migrate;
use crate::models::{DocumentMode, EntityType};
use crate::progress::ProgressMode;
use crate::rate_limit::RequestBudget;
use crate::sink::JsonlSink;
use crate::sync::{SyncOrchestrator, SyncOutcome, SyncState};

/// Flags of `azdo sync`.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: DocumentMode,
    /// Ignore stored cursors.
    pub full: bool,
    pub scope: Option<String>,
    pub output: Option<PathBuf>,
    pub progress: ProgressMode,
}

fn project_key(config: &Config) -> String {
    format!(
        "{}/{}",
        config.connector.organization.trim(),
        config.connector.project.trim()
    )
}

async fn open_store(config: &Config) -> Result<CheckpointStore> {
    migrate::run_migrations(config).await?;
    let pool = db::connect(config).await?;
    Ok(CheckpointStore::new(pool))
}

pub async fn run_sync(config: &Config, options: SyncOptions) -> Result<SyncOutcome> {
    let store = open_store(config).await?;
    let source = project_key(config);
    let cursor_key = cursor_source(&source, options.mode);

    let cursors = if options.full {
        CursorSet::new()
    } else {
        store.load(&cursor_key).await?
    };

    let mut connector = config.connector.clone();
    if let Some(scope) = &options.scope {
        connector.content_scope = scope.clone();
    }

    let output = options.output.clone().or_else(|| config.output.path.clone());
    let mut sink = match &output {
        Some(path) => JsonlSink::create(path)
            .await
            .with_context(|| format!("cannot open output {}", path.display()))?,
        None => JsonlSink::stdout(),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing the current page");
                cancel.cancel();
            }
        })
    };

    let mut orchestrator = SyncOrchestrator::new(
        connector,
        config.http.clone(),
        Arc::new(DefaultCredentialProvider),
    )
    .with_progress(options.progress.reporter())
    .with_batch_size(config.output.batch_size);

    let outcome = orchestrator
        .run(options.mode, cursors, &mut sink, &cancel)
        .await;
    ctrl_c.abort();

    store.save(&cursor_key, &outcome.cursors).await?;
    store
        .record_run(&RunRecord {
            id: outcome.run_id.clone(),
            source: source.clone(),
            mode: outcome.mode.as_str().to_string(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            state: outcome.state.to_string(),
            report_json: serde_json::to_string(&outcome.reports)?,
        })
        .await?;

    // Documents own stdout when no output file is set.
    if output.is_some() {
        print_report(&outcome, &mut std::io::stdout().lock())?;
    } else {
        print_report(&outcome, &mut std::io::stderr().lock())?;
    }

    if outcome.state == SyncState::Failed {
        bail!(
            "sync failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(outcome)
}

pub fn print_report(outcome: &SyncOutcome, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "sync {} ({})", outcome.mode.as_str(), outcome.run_id)?;
    for report in &outcome.reports {
        let mut line = format!(
            "  {:<12} {:<10} documents: {}",
            report.entity_type.as_str(),
            report.status.label(),
            report.documents
        );
        if let Some(reason) = report.status.reason() {
            line.push_str(&format!("  ({})", reason));
        }
        writeln!(out, "{}", line)?;
        for warning in &report.warnings {
            writeln!(out, "    warning: {}", warning)?;
        }
    }
    writeln!(out, "  requests: {}", outcome.requests)?;
    if outcome.throttled_responses > 0 {
        writeln!(out, "  throttled responses: {}", outcome.throttled_responses)?;
    }
    writeln!(out, "{}", outcome.state)?;
    Ok(())
}

/// Validate the configuration and, with `remote`, one authenticated query.
pub async fn run_check(config: &Config, remote: bool) -> Result<()> {
    let settings = ConnectorSettings::validate(&config.connector, &config.http)?;
    println!(
        "config ok: {}/{} (scope {})",
        settings.organization,
        settings.project,
        settings.scope.as_str()
    );
    if !remote {
        return Ok(());
    }

    let token = DefaultCredentialProvider
        .get_token(&settings.credential)
        .await?;
    let transport = ReqwestTransport::with_timeout(settings.http.timeout())
        .map_err(|e| anyhow::anyhow!("cannot build HTTP client: {}", e))?;
    let client = DevOpsClient::new(
        Arc::new(transport),
        token,
        settings.client_options(),
        settings.http.retry_policy(),
        Arc::new(RequestBudget::new(settings.http.max_in_flight)),
    );
    work_items::verify_access(&client)
        .await
        .with_context(|| format!("cannot query {}/{}", settings.organization, settings.project))?;
    println!("remote ok");
    Ok(())
}

pub async fn show_checkpoints(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let source = project_key(config);
    let full = store.load(&cursor_source(&source, DocumentMode::Full)).await?;
    let slim = store.load(&cursor_source(&source, DocumentMode::Slim)).await?;

    let show = |cursors: &CursorSet, entity: EntityType| {
        cursors
            .get(entity)
            .map(|c| c.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };
    println!("{}", source);
    println!("{:<14} {:<36} SLIM", "ENTITY", "FULL");
    for entity in EntityType::ALL {
        println!(
            "{:<14} {:<36} {}",
            entity.as_str(),
            show(&full, entity),
            show(&slim, entity)
        );
    }

    let runs = store.recent_runs(&source, 5).await?;
    if !runs.is_empty() {
        println!();
        println!("recent runs:");
        for run in runs {
            println!(
                "  {}  {:<5} {:<10} {}",
                run.started_at.to_rfc3339(),
                run.mode,
                run.state,
                run.id
            );
        }
    }
    Ok(())
}

pub async fn reset_checkpoints(config: &Config, entity: Option<&str>) -> Result<()> {
    let entity_type = entity.map(str::parse::<EntityType>).transpose()?;
    let store = open_store(config).await?;
    let source = project_key(config);
    let mut removed = 0;
    for mode in [DocumentMode::Full, DocumentMode::Slim] {
        removed += store.reset(&cursor_source(&source, mode), entity_type).await?;
    }
    match entity_type {
        Some(et) => println!("reset {} checkpoint ({} removed)", et, removed),
        None => println!("reset all checkpoints ({} removed)", removed),
    }
    Ok(())
}
