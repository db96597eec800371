//! Incremental cursors.
//!
//! A [`CursorSet`] maps each entity type to the end of the last query window
//! that completed for it. The library only threads it through
//! [`SyncOrchestrator::run`](crate::sync::SyncOrchestrator::run); persisting it
//! between runs is the caller's job. The CLI keeps it in SQLite through
//! [`CheckpointStore`].

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::models::{DocumentMode, EntityType};

/// Per-entity-type watermarks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorSet {
    cursors: BTreeMap<EntityType, DateTime<Utc>>,
}

impl CursorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_type: EntityType) -> Option<DateTime<Utc>> {
        self.cursors.get(&entity_type).copied()
    }

    /// Move the cursor forward. An older watermark never replaces a newer one.
    pub fn advance(&mut self, entity_type: EntityType, to: DateTime<Utc>) {
        let slot = self.cursors.entry(entity_type).or_insert(to);
        if to > *slot {
            *slot = to;
        }
    }

    pub fn clear(&mut self, entity_type: EntityType) {
        self.cursors.remove(&entity_type);
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityType, DateTime<Utc>)> + '_ {
        self.cursors.iter().map(|(k, v)| (*k, *v))
    }
}

/// Storage key for the cursors of one project and document mode.
///
/// Full and slim syncs keep separate watermarks: a slim pass never delivers
/// content, so it must not move the window a later full pass starts from.
/// Full cursors use the bare `{organization}/{project}` key.
pub fn cursor_source(project_key: &str, mode: DocumentMode) -> String {
    match mode {
        DocumentMode::Full => project_key.to_string(),
        DocumentMode::Slim => format!("{}#slim", project_key),
    }
}

/// SQLite-backed cursor storage keyed by [`cursor_source`].
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, source: &str) -> Result<CursorSet> {
        let rows = sqlx::query("SELECT entity_type, cursor FROM checkpoints WHERE source = ?")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;

        let mut set = CursorSet::new();
        for row in rows {
            let entity: String = row.get("entity_type");
            let cursor: String = row.get("cursor");
            let Ok(entity_type) = entity.parse::<EntityType>() else {
                tracing::warn!(source, entity = %entity, "ignoring checkpoint for unknown entity type");
                continue;
            };
            let at = DateTime::parse_from_rfc3339(&cursor)
                .with_context(|| format!("corrupt checkpoint for {} {}", source, entity))?;
            set.advance(entity_type, at.with_timezone(&Utc));
        }
        Ok(set)
    }

    /// Upsert every cursor in `cursors`. Entity types absent from the set are left alone.
    pub async fn save(&self, source: &str, cursors: &CursorSet) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (entity_type, at) in cursors.iter() {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (source, entity_type, cursor, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT(source, entity_type) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
                "#,
            )
            .bind(source)
            .bind(entity_type.as_str())
            .bind(at.to_rfc3339())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete stored cursors; `None` clears every entity type. Returns rows removed.
    pub async fn reset(&self, source: &str, entity_type: Option<EntityType>) -> Result<u64> {
        let result = match entity_type {
            Some(et) => {
                sqlx::query("DELETE FROM checkpoints WHERE source = ? AND entity_type = ?")
                    .bind(source)
                    .bind(et.as_str())
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM checkpoints WHERE source = ?")
                    .bind(source)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, source, mode, started_at, finished_at, state, report_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.source)
        .bind(&run.mode)
        .bind(run.started_at.timestamp())
        .bind(run.finished_at.timestamp())
        .bind(&run.state)
        .bind(&run.report_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs for `source`, newest first.
    pub async fn recent_runs(&self, source: &str, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT id, source, mode, started_at, finished_at, state, report_json \
             FROM sync_runs WHERE source = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RunRecord {
                id: row.get("id"),
                source: row.get("source"),
                mode: row.get("mode"),
                started_at: DateTime::from_timestamp(row.get("started_at"), 0).unwrap_or_default(),
                finished_at: DateTime::from_timestamp(row.get("finished_at"), 0).unwrap_or_default(),
                state: row.get("state"),
                report_json: row.get("report_json"),
            })
            .collect())
    }
}

/// One row of run history.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub source: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: String,
    pub report_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    async fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        let path = dir.path().join("state.sqlite");
        migrate::run_migrations_at(&path).await.unwrap();
        CheckpointStore::new(db::connect_path(&path).await.unwrap())
    }

    #[test]
    fn advance_never_moves_backwards() {
        let mut set = CursorSet::new();
        set.advance(EntityType::Commit, ts("2024-05-02T00:00:00Z"));
        set.advance(EntityType::Commit, ts("2024-05-01T00:00:00Z"));
        assert_eq!(set.get(EntityType::Commit), Some(ts("2024-05-02T00:00:00Z")));
        assert_eq!(set.get(EntityType::WorkItem), None);
    }

    #[test]
    fn serializes_as_entity_keyed_object() {
        let mut set = CursorSet::new();
        set.advance(EntityType::WikiPage, ts("2024-05-02T00:00:00Z"));
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!({"wiki_page": "2024-05-02T00:00:00Z"}));
        let back: CursorSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[tokio::test]
    async fn store_saves_loads_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        let mut set = CursorSet::new();
        set.advance(EntityType::WorkItem, ts("2024-05-01T00:00:00Z"));
        set.advance(EntityType::Release, ts("2024-05-03T00:00:00Z"));
        store.save("org/proj", &set).await.unwrap();
        store.save("org/other", &set).await.unwrap();

        assert_eq!(store.load("org/proj").await.unwrap(), set);

        let removed = store.reset("org/proj", Some(EntityType::Release)).await.unwrap();
        assert_eq!(removed, 1);
        let loaded = store.load("org/proj").await.unwrap();
        assert_eq!(loaded.get(EntityType::Release), None);
        assert!(loaded.get(EntityType::WorkItem).is_some());

        store.reset("org/proj", None).await.unwrap();
        assert!(store.load("org/proj").await.unwrap().is_empty());
        assert!(!store.load("org/other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slim_cursors_do_not_touch_full_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let full = cursor_source("org/proj", DocumentMode::Full);
        let slim = cursor_source("org/proj", DocumentMode::Slim);
        assert_eq!(full, "org/proj");
        assert_ne!(full, slim);

        let mut set = CursorSet::new();
        set.advance(EntityType::WorkItem, ts("2024-05-01T00:00:00Z"));
        store.save(&slim, &set).await.unwrap();

        assert!(store.load(&full).await.unwrap().is_empty());
        assert_eq!(store.load(&slim).await.unwrap(), set);
    }

    #[tokio::test]
    async fn run_history_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        for (id, started) in [("a", "2024-05-01T00:00:00Z"), ("b", "2024-05-02T00:00:00Z")] {
            store
                .record_run(&RunRecord {
                    id: id.to_string(),
                    source: "org/proj".to_string(),
                    mode: "full".to_string(),
                    started_at: ts(started),
                    finished_at: ts(started),
                    state: "completed".to_string(),
                    report_json: "[]".to_string(),
                })
                .await
                .unwrap();
        }
        let runs = store.recent_runs("org/proj", 10).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
