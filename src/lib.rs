//! # Memory Index
//!
//! Local hybrid search over an agent's memory: markdown notes in a workspace
//! and JSONL session transcripts, chunked, embedded, and stored in SQLite
//! with FTS5 keyword search and vector similarity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Memory files │──▶│  Sync engine │──▶│    SQLite    │
//! │ Transcripts  │   │ Chunk+Embed  │   │  FTS5 + Vec  │
//! └──────┬───────┘   └──────────────┘   └──────┬───────┘
//!        │ watcher / bus                        │
//!        ▼                                      ▼
//!  ┌────────────┐                        ┌────────────┐
//!  │ background │                        │   search   │
//!  └────────────┘                        └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memx --config ./memx.toml sync
//! memx --config ./memx.toml search "deployment checklist"
//! memx --config ./memx.toml watch
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`manager`] | Per-agent index handle |
//! | [`registry`] | Host-owned manager registry |
//! | [`sync`] | Incremental sync and safe reindex |
//! | [`search`] | Hybrid keyword + vector search |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`batch`] | Batch failure budget and fallback |
//! | [`store`] | SQLite statements |
//! | [`watcher`] | Background change detection |
//! | [`sessions`] | Transcript discovery and delta tracking |
//! | [`graph`] | Entity/relation knowledge graph |

pub mod batch;
pub mod config;
pub mod db;
pub mod embed;
pub mod embedding;
pub mod error;
pub mod files;
pub mod graph;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod schema;
pub mod search;
pub mod sessions;
pub mod status;
pub mod store;
pub mod sync;
pub mod watcher;

pub use manager::MemoryIndexManager;
pub use registry::ManagerRegistry;
pub use search::SearchOptions;
pub use sync::{SyncOptions, SyncReason};
