//! # Vault Sync
//!
//! Incremental, resumable synchronization of a local document vault into a
//! Chroma collection.
//!
//! Vault Sync fingerprints every document under a vault root, diffs the
//! result against the state recorded by the previous run, and pushes only
//! the changes. Large documents are split into structure-aware chunks;
//! long runs are checkpointed so they can be paused and resumed; a
//! verification pass reconciles the recorded state with the remote.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │   Source    │──▶│    Delta    │──▶│   Session   │──▶│ Executor │
//! │ FS + globs  │   │ hash + diff │   │ FIFO batches│   │  Chroma  │
//! └─────────────┘   └─────────────┘   └──────┬──────┘   └────┬─────┘
//!                                            │               │
//!                                            ▼               ▼
//!                                     ┌─────────────┐   ┌──────────┐
//!                                     │ State dir   │◀──│  Verify  │
//!                                     │ (JSON)      │   │          │
//!                                     └─────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vsync check                   # test the Chroma connection
//! vsync sync --dry-run          # show the planned delta
//! vsync sync                    # push changes (Ctrl-C pauses)
//! vsync status                  # recorded state and session progress
//! vsync verify                  # reconcile with the remote collection
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy and transient/fatal classification |
//! | [`source`] | Document sources and glob filtering |
//! | [`extract`] | Content processors (Markdown, text, PDF, images) |
//! | [`delta`] | Fingerprinting, diffing and retry bookkeeping |
//! | [`chunk`] | Structure-aware document chunking |
//! | [`session`] | Resumable sync session state machine |
//! | [`store`] | Atomic JSON persistence of the state directory |
//! | [`index`] | Remote collection backends (Chroma, in-memory) |
//! | [`embedding`] | Optional client-side embeddings |
//! | [`executor`] | Applies delta batches to an index backend |
//! | [`ingest`] | Sync orchestration |
//! | [`verify`] | Remote membership verification |
//! | [`status`] | Local status overview |
//! | [`progress`] | Progress reporting |

pub mod chunk;
pub mod config;
pub mod delta;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod session;
pub mod source;
pub mod status;
pub mod store;
pub mod verify;
