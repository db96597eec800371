//! Outbound document batches.
//!
//! The orchestrator hands each batch of built documents to a
//! [`DocumentSink`]. The CLI writes them as JSON lines ([`JsonlSink`]);
//! embedding callers and tests can use [`CollectingSink`].

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::error::{ConnectorError, Result};
use crate::models::{BuiltDocument, EntityType};

/// Receiver for ordered document batches.
#[async_trait]
pub trait DocumentSink: Send {
    async fn emit(&mut self, entity_type: EntityType, batch: Vec<BuiltDocument>) -> Result<()>;

    /// Called once after the last batch of a run.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One JSON document per line, to a file or stdout.
pub struct JsonlSink {
    writer: BufWriter<Box<dyn AsyncWrite + Unpin + Send>>,
    written: u64,
}

impl JsonlSink {
    pub fn stdout() -> Self {
        Self::from_writer(Box::new(tokio::io::stdout()))
    }

    /// Create (truncating) `path`, including missing parent directories.
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConnectorError::Sink(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| ConnectorError::Sink(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn from_writer(writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            writer: BufWriter::new(writer),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl DocumentSink for JsonlSink {
    async fn emit(&mut self, _entity_type: EntityType, batch: Vec<BuiltDocument>) -> Result<()> {
        for doc in &batch {
            let mut line =
                serde_json::to_vec(doc).map_err(|e| ConnectorError::Sink(e.to_string()))?;
            line.push(b'\n');
            self.writer
                .write_all(&line)
                .await
                .map_err(|e| ConnectorError::Sink(e.to_string()))?;
            self.written += 1;
        }
        self.writer
            .flush()
            .await
            .map_err(|e| ConnectorError::Sink(e.to_string()))
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| ConnectorError::Sink(e.to_string()))
    }
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub batches: Vec<(EntityType, Vec<BuiltDocument>)>,
    pub finished: bool,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> impl Iterator<Item = &BuiltDocument> {
        self.batches.iter().flat_map(|(_, docs)| docs.iter())
    }

    pub fn ids(&self) -> Vec<String> {
        self.documents().map(|d| d.id().to_string()).collect()
    }
}

#[async_trait]
impl DocumentSink for CollectingSink {
    async fn emit(&mut self, entity_type: EntityType, batch: Vec<BuiltDocument>) -> Result<()> {
        self.batches.push((entity_type, batch));
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
