//! # Repo Indexer
//!
//! Mirrors source repositories from a remote host into SQLite, splits file
//! contents into overlapping segments and embeds them, all driven by a
//! durable, crash-recoverable job queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │ RemoteHost │──▶│ TreeResolver │──▶│ Materializer│──▶│  SQLite  │
//! │  (GitHub)  │   │ full / diff  │   │ fetch/skip  │   │  files   │
//! └─────┬──────┘   └──────────────┘   └─────────────┘   └────┬─────┘
//!       │ quota                                              │
//!  ┌────▼──────┐                      ┌───────────┐   ┌──────▼─────┐
//!  │RateTracker│                      │ Batcher   │◀──│ Segmenter  │
//!  └───────────┘                      │ embeddings│   │  segments  │
//!                                     └───────────┘   └────────────┘
//! ```
//!
//! The [`worker::Worker`] claims one job at a time from the queue in
//! [`jobs`]: sync jobs run the resolver and materializer, embed jobs run the
//! segmenter and the batcher.
//!
//! ## Quick Start
//!
//! ```bash
//! rix init
//! rix repo add acme/widgets --branch main
//! rix sync acme/widgets
//! rix worker --once
//! rix status acme/widgets
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Jobs, repositories, files, segments |
//! | [`error`] | Remote host errors |
//! | [`rate`] | Per-credential rate tracking |
//! | [`remote`] | Remote host trait, GitHub host, in-memory host (`test-util`) |
//! | [`policy`] | Tracked / ignored / metadata-only paths |
//! | [`tree`] | Full listing and incremental diff |
//! | [`materialize`] | Per-file fetch-or-skip and deletion |
//! | [`segment`] | Sliding-window segmentation |
//! | [`embedding`] | Embedding providers |
//! | [`embed`] | Batched embedding of pending segments |
//! | [`repos`] | Tracked repositories |
//! | [`jobs`] | Durable job queue |
//! | [`progress`] | Job event observers |
//! | [`worker`] | Polling job scheduler |

pub mod config;
pub mod db;
pub mod embed;
pub mod embedding;
pub mod error;
pub mod jobs;
pub mod materialize;
pub mod migrate;
pub mod models;
pub mod policy;
pub mod progress;
pub mod rate;
pub mod remote;
pub mod repos;
pub mod segment;
pub mod tree;
pub mod worker;
