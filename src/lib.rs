//! # OAI Harvest
//!
//! Harvests metadata from remote OAI-PMH 2.0 repositories into a local
//! item store, and decides which local items are exposed again, using
//! composable metadata filters.
//!
//! ## Architecture
//!
//! ```text
//!                ┌───────────┐   claim    ┌──────────────┐
//!  collections ─▶│ Scheduler │──────────▶│ harvest cycle │──▶ OaiClient (HTTP)
//!   (SQLite)     │ + workers │            └──────┬───────┘
//!                └───────────┘                   │ crosswalk
//!                                                ▼
//!                                   ┌────────────────────────┐
//!                                   │ items (SQLite)  index  │
//!                                   └───────────┬────────────┘
//!                                               │
//!                        filters ──▶ SQL predicate / Solr query / evaluate
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! oaih init
//! oaih collection add physics http://example.org/oai --set journal:physics
//! oaih harvest physics
//! oaih schedule                 # run the scheduler until Ctrl-C
//! oaih filter show
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`status`] | Harvest status state machine |
//! | [`filter`] | Filter composition, registry and query translation |
//! | [`index`] | Search index abstraction (memory, Solr) |
//! | [`oai`] | OAI-PMH client and response parsing |
//! | [`crosswalk`] | Harvested XML to item metadata |
//! | [`store`] | SQLite persistence |
//! | [`harvest`] | One harvest cycle |
//! | [`scheduler`] | Pass loop and worker pool |
//! | [`collections`] | Collection administration commands |
//! | [`exposure`] | Filter-based exposure and filter commands |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod collections;
pub mod config;
pub mod crosswalk;
pub mod db;
pub mod error;
pub mod exposure;
pub mod filter;
pub mod harvest;
pub mod index;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod oai;
pub mod scheduler;
pub mod status;
pub mod store;
