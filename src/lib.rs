//! # Azure DevOps harness
//!
//! Pulls work items, commits, test runs, releases and wiki pages from an
//! Azure DevOps project and turns them into uniform documents for an
//! indexing pipeline. Two sync flavours share one pipeline: *full* sync
//! produces indexable content, *slim* sync produces only ids and the metadata
//! needed to detect deletions and permission drift.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Orchestrator │──▶│  Extractors  │──▶│   Document   │──▶│   Sink   │
//! │ (sync)       │   │ WI/Git/Test/ │   │   builder    │   │  JSONL   │
//! └──────┬───────┘   │ Release/Wiki │   └──────────────┘   └──────────┘
//!        │           └──────┬───────┘
//!        │                  ▼
//!        │           ┌──────────────┐   ┌──────────────┐
//!        │           │  Paginator   │──▶│ DevOpsClient │── retry, budget
//!        │           └──────────────┘   └──────┬───────┘
//!        ▼                                     ▼
//!   CursorSet in / out                   HttpTransport
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export AZURE_DEVOPS_PAT=...
//! azdo init
//! azdo check --remote
//! azdo sync --output ./data/documents.jsonl
//! azdo sync --slim --output ./data/slim.jsonl
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and run settings |
//! | [`credentials`] | Access-token providers |
//! | [`error`] | Error taxonomy |
//! | [`http`] | Transport seam |
//! | [`retry`] | Backoff policy |
//! | [`rate_limit`] | Shared request budget |
//! | [`client`] | Azure DevOps REST client |
//! | [`paginate`] | Continuation-token paging |
//! | [`branch`] | Default-branch resolution |
//! | [`extractors`] | One extractor per entity type |
//! | [`models`] | Records and documents |
//! | [`document`] | Document builder |
//! | [`checkpoint`] | Cursors and their SQLite store |
//! | [`sink`] | Outbound document batches |
//! | [`sync`] | Sync orchestrator |
//! | [`progress`] | Progress reporting |
//! | [`db`], [`migrate`] | State database |
//! | [`logging`] | Subscriber setup for the CLI |
//! | [`sources`], [`sync_cmd`] | CLI command handlers |

pub mod branch;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod credentials;
pub mod db;
pub mod document;
pub mod error;
pub mod extractors;
pub mod http;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod paginate;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod sources;
pub mod sync;
pub mod sync_cmd;
