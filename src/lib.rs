//! # Folio
//!
//! Client-side content pipeline for a social publishing platform: drafting
//! posts with attached images, publishing them to an external document
//! service, reconstructing past versions from stored undo patches, and
//! rendering bodies into a tree for display.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌──────────────────┐
//! │ DraftSession │──▶│ PublishCoordinator │──▶│ DocumentService  │
//! │ text + blobs │   │ single / staged    │   │ (external)       │
//! └──────┬───────┘   └────────────────────┘   └────────┬─────────┘
//!        │ autosave                                    │ documents
//!        ▼                                             ▼
//! ┌──────────────┐                        ┌────────────────────────┐
//! │ DraftStore   │                        │ VersionReconstructor   │
//! │ SQLite       │                        │ RenderEngine           │
//! └──────────────┘                        └────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! folio init                              # create the draft store
//! folio fit photo.jpg --max-bytes 460800 --out small.jpg
//! folio diff old.md new.md > undo.json
//! folio history post.json --version 0
//! folio render post.json --summary
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`patch`] | Character diff and fuzzy patch application |
//! | [`content_id`] | Content addressing of blobs |
//! | [`image_fit`] | Re-encoding images under a byte budget |
//! | [`tokens`] | Hashtag, cashtag, mention and blob reference rules |
//! | [`draft`] | In-progress authoring state |
//! | [`recovery`] | Draft persistence and the autosave session |
//! | [`publish`] | Publish state machine |
//! | [`history`] | Undo log and version reconstruction |
//! | [`render`] | Markdown to render tree |
//! | [`service`] | External document service interfaces |
//! | [`memory_service`] | In-memory document service |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error types |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod content_id;
pub mod db;
pub mod draft;
pub mod error;
pub mod history;
pub mod image_fit;
pub mod memory_service;
pub mod migrate;
pub mod models;
pub mod patch;
pub mod publish;
pub mod recovery;
pub mod render;
pub mod service;
pub mod tokens;
