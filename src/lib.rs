//! # docsync
//!
//! Keeps a search index in line with a remote document source. Each run
//! lists the source, applies per-extension transform chains to new and
//! changed documents, upserts their text into the index, and purges index
//! entries whose document has disappeared from the source.
//!
//! ## Architecture
//!
//! ```text
//!  SourceLister ──▶ TransformExecutor ──▶ IndexWriter ──▶ SearchIndex
//!  (fs/s3/sp)       (rule engine)                         (sqlite/azure)
//!      │                  │                                    ▲
//!      │ id set           └──▶ SecondaryStorage                │
//!      └──────────────────────▶ IndexReconciler ─── purge ─────┘
//! ```
//!
//! [`orchestrator::SyncOrchestrator`] sequences one run; the pure pieces
//! (document model, rule resolution, reconciliation, the index trait)
//! live in the `docsync-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! docsync init                  # create the index schema
//! docsync sources               # check the configured source
//! docsync rules pdf             # show the chain applied to PDFs
//! docsync sync                  # run one synchronization pass
//! docsync stats                 # indexed documents per scope
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, environment overrides, validation |
//! | [`error`] | Fatal and per-document error kinds |
//! | [`lister`] | `SourceLister` trait, allow-list filter |
//! | [`connector_fs`], [`connector_s3`], [`connector_sharepoint`] | Source listers |
//! | [`transform`] | Operation registry and `TransformExecutor` |
//! | [`paginate`] | Page counting and truncation |
//! | [`extract`] | Text extraction by format |
//! | [`relocation`] | Destinations of the `move` operation |
//! | [`writer`] | `IndexWriter` |
//! | [`index_sqlite`], [`index_azure`] | `SearchIndex` backends |
//! | [`orchestrator`] | `SyncOrchestrator` run state machine |
//! | [`progress`] | Progress reporting on stderr |

pub mod backend;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod connector_s3;
pub mod connector_sharepoint;
pub mod db;
pub mod error;
pub mod extract;
pub mod index_azure;
pub mod index_sqlite;
pub mod lister;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod paginate;
pub mod progress;
pub mod relocation;
pub mod s3;
pub mod secrets;
pub mod sources;
pub mod stats;
pub mod transform;
pub mod writer;
