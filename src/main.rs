//! # OAI Harvest CLI (`oaih`)
//!
//! The `oaih` binary administers harvested collections, runs harvest
//! cycles (once or on a schedule), and inspects the configured item
//! filters.
//!
//! ## Usage
//!
//! ```bash
//! oaih --config ./config/oaih.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `oaih init` | Create the SQLite database and run schema migrations |
//! | `oaih collection add <id> <source>` | Bind a local collection to an OAI-PMH source |
//! | `oaih collection list` | Show every harvested collection and its status |
//! | `oaih collection show <id>` | Show one collection in detail |
//! | `oaih collection disable\|enable\|reset <id>` | Administrative status changes |
//! | `oaih harvest <id>` | Run one harvest cycle now |
//! | `oaih schedule` | Run the scheduler until Ctrl-C |
//! | `oaih index` | Rebuild the search index from stored items |
//! | `oaih sets <base-url>` | List the sets a remote repository offers |
//! | `oaih filter show` | Print every filter with its SQL and Solr forms |
//! | `oaih filter items <name>` | Stored items a filter matches |
//! | `oaih filter search <name>` | Indexed items a filter matches |
//! | `oaih filter check <name> <item>` | Evaluate one item against a filter |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! oaih init --config ./config/oaih.toml
//!
//! # Harvest a set, verifying the remote endpoint first
//! oaih collection add physics http://example.org/oai \
//!     --set journal:physics --format oai_dc --verify
//!
//! # One cycle in the foreground
//! oaih harvest physics
//!
//! # Single scheduling pass, then exit when the workers are done
//! oaih schedule --once
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use oai_harvest::collections::{self, NewCollection};
use oai_harvest::harvest::HarvestContext;
use oai_harvest::models::HarvestType;
use oai_harvest::oai::{HttpOaiClient, OaiClient};
use oai_harvest::scheduler::{self, Scheduler};
use oai_harvest::{config, db, exposure, index, logging, migrate, store};

/// OAI Harvest CLI: scheduled OAI-PMH harvesting with composable item
/// filters.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/oaih.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "oaih",
    about = "OAI-PMH harvester with composable item filters",
    version,
    long_about = "Harvests remote OAI-PMH repositories into local collections on a schedule, \
    tracks each collection through READY / QUEUED / BUSY / OAI_ERROR / DISABLED, and translates \
    metadata filters into SQL predicates and Solr queries."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/oaih.toml`.
    #[arg(long, global = true, default_value = "./config/oaih.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it against an existing database is safe.
    Init,

    /// Manage harvested collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Harvest one collection immediately.
    ///
    /// The collection must be schedulable (READY, or OAI_ERROR below the
    /// failure threshold). Its status is updated exactly as a scheduled
    /// cycle would update it.
    Harvest {
        /// Local collection id.
        collection: String,
    },

    /// Run the harvest scheduler.
    ///
    /// Runs scheduling passes every `harvester.interval_secs` until Ctrl-C.
    /// Running cycles are interrupted and their collections released.
    Schedule {
        /// Run a single pass, wait for its cycles, and exit.
        #[arg(long)]
        once: bool,
    },

    /// Rebuild the search index from the stored items.
    ///
    /// Only items passing `oai.exposure_filter` are indexed. Run it after
    /// changing the exposure filter when using the Solr backend.
    Index,

    /// List the sets offered by a remote OAI-PMH endpoint.
    Sets {
        /// Base URL of the remote endpoint.
        base_url: String,
    },

    /// Inspect configured item filters.
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Bind a local collection to a remote OAI-PMH source.
    Add {
        /// Local collection id.
        id: String,

        /// Base URL of the remote endpoint.
        source: String,

        /// Remote set spec, or `all` for the whole repository.
        #[arg(long, default_value = "all")]
        set: String,

        /// Configured metadata format name.
        #[arg(long, default_value = "oai_dc")]
        format: String,

        /// What to harvest: `metadata`, `metadata-ref`, or `full`.
        #[arg(long = "type", default_value = "metadata")]
        harvest_type: HarvestType,

        /// Check the remote endpoint before saving.
        #[arg(long)]
        verify: bool,
    },

    /// List every harvested collection.
    List,

    /// Show one collection in detail.
    Show { id: String },

    /// Take a collection out of scheduling.
    Disable { id: String },

    /// Put a DISABLED collection back into scheduling.
    Enable { id: String },

    /// Clear the failure count of a collection in OAI_ERROR.
    Reset { id: String },
}

#[derive(Subcommand)]
enum FilterAction {
    /// Print every filter with its SQL predicate and Solr query.
    Show,

    /// List stored items a filter matches.
    Items { name: String },

    /// List indexed items a filter matches.
    Search {
        name: String,

        /// Maximum number of results.
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Evaluate one stored item against a filter.
    Check { name: String, item_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let cli = Cli::parse();
    let cfg = Arc::new(config::load_config(&cli.config)?);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Collection { action } => {
            let pool = db::connect(&cfg).await?;
            match action {
                CollectionAction::Add {
                    id,
                    source,
                    set,
                    format,
                    harvest_type,
                    verify,
                } => {
                    if verify {
                        let client = http_client(&cfg)?;
                        let problems =
                            collections::verify_source(&cfg, &client, &source, &set, &format).await;
                        if !problems.is_empty() {
                            for p in &problems {
                                eprintln!("  - {}", p);
                            }
                            anyhow::bail!("{} verification problem(s) with {}", problems.len(), source);
                        }
                        println!("Verified {}", source);
                    }
                    collections::add_collection(
                        &cfg,
                        &pool,
                        NewCollection {
                            collection_id: id,
                            oai_source: source,
                            oai_set_id: set,
                            metadata_format: format,
                            harvest_type,
                        },
                    )
                    .await?;
                }
                CollectionAction::List => collections::list_collections(&pool).await?,
                CollectionAction::Show { id } => collections::show_collection(&pool, &id).await?,
                CollectionAction::Disable { id } => {
                    collections::disable_collection(&pool, &id).await?
                }
                CollectionAction::Enable { id } => collections::enable_collection(&pool, &id).await?,
                CollectionAction::Reset { id } => collections::reset_collection(&pool, &id).await?,
            }
            pool.close().await;
        }
        Commands::Harvest { collection } => {
            let ctx = harvest_context(cfg.clone()).await?;
            let summary = scheduler::harvest_now(&ctx, &collection).await?;
            println!("{}", summary.message);
            println!(
                "  imported: {}  deleted: {}  skipped: {}",
                summary.imported, summary.deleted, summary.skipped
            );
            ctx.pool.close().await;
        }
        Commands::Schedule { once } => {
            let ctx = Arc::new(harvest_context(cfg.clone()).await?);
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping scheduler");
                    let _ = tx.send(true);
                }
            });

            if once {
                let recovered = store::recover_stale_claims(&ctx.pool).await?;
                if recovered > 0 {
                    warn!(recovered, "Released collections left QUEUED or BUSY");
                }
                let mut scheduler = Scheduler::new(ctx.clone(), rx);
                let dispatched = scheduler.run_pass().await?;
                println!("Dispatched {} harvest(s)", dispatched.len());
                scheduler.drain().await;
            } else {
                Scheduler::new(ctx.clone(), rx).run().await?;
            }
            ctx.pool.close().await;
        }
        Commands::Index => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let filters = exposure::load_filters(&cfg)?;
            let gate = exposure::exposure_filter(&cfg, &filters);
            let index = index::create_index(&cfg)?;
            let summary = exposure::rebuild_index(&pool, index.as_ref(), gate.as_deref()).await?;
            println!(
                "Indexed {} item(s), {} hidden by the exposure filter",
                summary.indexed, summary.hidden
            );
            pool.close().await;
        }
        Commands::Sets { base_url } => {
            let client = http_client(&cfg)?;
            collections::list_remote_sets(&client, &base_url).await?;
        }
        Commands::Filter { action } => match action {
            FilterAction::Show => exposure::show_filters(&cfg)?,
            FilterAction::Items { name } => {
                let pool = db::connect(&cfg).await?;
                exposure::list_filter_items(&cfg, &pool, &name).await?;
                pool.close().await;
            }
            FilterAction::Search { name, limit } => {
                let pool = db::connect(&cfg).await?;
                let index = exposure::open_index(&cfg, &pool).await?;
                exposure::search_filter_items(&cfg, index.as_ref(), &name, limit).await?;
                pool.close().await;
            }
            FilterAction::Check { name, item_id } => {
                let pool = db::connect(&cfg).await?;
                exposure::check_item(&cfg, &pool, &name, &item_id).await?;
                pool.close().await;
            }
        },
    }

    Ok(())
}

fn http_client(cfg: &config::Config) -> anyhow::Result<HttpOaiClient> {
    HttpOaiClient::new(cfg.harvester.request_timeout()).context("Failed to build HTTP client")
}

async fn harvest_context(cfg: Arc<config::Config>) -> anyhow::Result<HarvestContext> {
    let pool = db::connect(&cfg).await?;
    migrate::apply(&pool).await?;
    let client: Arc<dyn OaiClient> = Arc::new(http_client(&cfg)?);
    let index = exposure::open_index(&cfg, &pool).await?;
    HarvestContext::new(cfg, pool, client, index).context("Invalid filter configuration")
}
