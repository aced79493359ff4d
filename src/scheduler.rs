//! Harvest scheduler and worker pool.
//!
//! Each pass selects schedulable collections (oldest `last_harvested`
//! first), queues them, and hands each to a worker once its claim
//! succeeds. The pool is a fixed-size [`Semaphore`]; a pass never selects
//! more collections than there are free permits.
//!
//! ```text
//!  pass ──select──▶ queue (CAS) ──permit──▶ claim (CAS) ──spawn──▶ run_cycle
//!                       │                       │                     │
//!                   lost race: skip        conflict: skip      record_outcome
//!                                          error: release
//! ```
//!
//! Shutdown is a `watch` channel. Running cycles observe it, stop, and
//! release their collection back to READY; the scheduler then waits for
//! every worker before returning.
//!
//! A worker that panics never records its own outcome. The scheduler
//! keeps a task id → collection map and fails the collection itself when
//! it reaps the panicked task.

use anyhow::{bail, Result};
use chrono::{SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::HarvestError;
use crate::harvest::{self, HarvestContext, HarvestSummary};
use crate::status::HarvestStatus;
use crate::store::{self, ClaimOutcome};

pub struct Scheduler {
    ctx: Arc<HarvestContext>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    /// Collection held by each running task.
    workers: HashMap<task::Id, String>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(ctx: Arc<HarvestContext>, shutdown: watch::Receiver<bool>) -> Self {
        let workers = ctx.config.harvester.workers.max(1);
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(workers)),
            tasks: JoinSet::new(),
            workers: HashMap::new(),
            shutdown,
        }
    }

    /// Number of cycles currently running.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Queue and dispatch as many collections as there are idle workers.
    /// Returns the ids that were handed to a worker.
    pub async fn run_pass(&mut self) -> Result<Vec<String>, sqlx::Error> {
        self.reap().await;
        let free = self.permits.available_permits();
        if free == 0 || *self.shutdown.borrow() {
            return Ok(Vec::new());
        }

        let pool = &self.ctx.pool;
        let threshold = self.ctx.config.harvester.failure_threshold;
        let candidates = store::select_schedulable(pool, threshold, free).await?;
        let mut dispatched = Vec::new();

        for mut hc in candidates {
            let id = hc.collection_id.clone();
            if !store::queue(pool, &id, threshold).await? {
                debug!(collection = %id, "Status changed before it could be queued");
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                store::release_claim(pool, &id).await?;
                break;
            };

            let started = Utc::now().trunc_subsecs(0);
            match store::claim(pool, &id, &started).await {
                Ok(ClaimOutcome::Claimed) => {}
                Ok(ClaimOutcome::Conflict) => {
                    debug!(collection = %id, "Claim lost to another worker");
                    continue;
                }
                Err(e) => {
                    warn!(collection = %id, error = %e, "Claim failed, releasing");
                    store::release_claim(pool, &id).await?;
                    continue;
                }
            }
            hc.status = HarvestStatus::Busy;
            hc.harvest_start_time = Some(started);

            let ctx = self.ctx.clone();
            let mut shutdown = self.shutdown.clone();
            let span = info_span!("worker", collection = %id);
            let handle = self.tasks.spawn(
                async move {
                    let _permit = permit;
                    let result = tokio::select! {
                        result = harvest::run_cycle(&ctx, &hc, started) => result,
                        _ = wait_for_shutdown(&mut shutdown) => Err(HarvestError::Interrupted(
                            "Harvest interrupted by shutdown".to_string(),
                        )),
                    };
                    if let Err(e) =
                        harvest::record_outcome(&ctx.pool, &hc.collection_id, &started, &result).await
                    {
                        error!(error = %e, "Failed to record harvest outcome");
                    }
                }
                .instrument(span),
            );
            self.workers.insert(handle.id(), id.clone());
            info!(collection = %id, "Dispatched harvest");
            dispatched.push(id);
        }
        Ok(dispatched)
    }

    async fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.finished(joined).await;
        }
    }

    /// Wait for every running cycle to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.finished(joined).await;
        }
    }

    async fn finished(&mut self, joined: Result<(task::Id, ()), JoinError>) {
        let err = match joined {
            Ok((task_id, ())) => {
                self.workers.remove(&task_id);
                return;
            }
            Err(err) => err,
        };
        let Some(collection) = self.workers.remove(&err.id()) else {
            error!(error = %err, "Unknown harvest worker failed");
            return;
        };

        error!(collection = %collection, error = %err, "Harvest worker panicked");
        // Counts toward the failure threshold.
        let message = format!("Harvest worker failed: {}", err);
        match store::fail(&self.ctx.pool, &collection, &message, true).await {
            Ok(true) => {}
            Ok(false) => warn!(collection = %collection, "Collection was no longer BUSY"),
            Err(e) => error!(
                collection = %collection,
                error = %e,
                "Failed to release collection after worker panic"
            ),
        }
    }

    /// Pass loop until shutdown. Stale claims from a previous process are
    /// released first.
    pub async fn run(mut self) -> Result<(), sqlx::Error> {
        let recovered = store::recover_stale_claims(&self.ctx.pool).await?;
        if recovered > 0 {
            warn!(recovered, "Released collections left QUEUED or BUSY");
        }

        let interval = self.ctx.config.harvester.interval();
        let mut shutdown = self.shutdown.clone();
        info!(
            workers = self.ctx.config.harvester.workers,
            interval_secs = interval.as_secs(),
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_pass().await {
                error!(error = %e, "Scheduling pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!(running = self.running(), "Shutting down, waiting for running harvests");
        self.drain().await;
        Ok(())
    }
}

/// Resolves once shutdown has been requested. Never resolves if the
/// sender is gone without having signalled.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Harvest one collection immediately, outside the pass loop.
pub async fn harvest_now(ctx: &HarvestContext, collection_id: &str) -> Result<HarvestSummary> {
    let pool = &ctx.pool;
    let threshold = ctx.config.harvester.failure_threshold;
    let Some(hc) = store::get_collection(pool, collection_id).await? else {
        bail!("collection '{}' is not configured for harvesting", collection_id);
    };
    if !store::queue(pool, collection_id, threshold).await? {
        bail!(
            "collection '{}' cannot be harvested now (status {}, {} consecutive failures)",
            collection_id,
            hc.status,
            hc.consecutive_failures
        );
    }

    let started = Utc::now().trunc_subsecs(0);
    match store::claim(pool, collection_id, &started).await {
        Ok(ClaimOutcome::Claimed) => {}
        Ok(ClaimOutcome::Conflict) => bail!("collection '{}' was claimed elsewhere", collection_id),
        Err(e) => {
            store::release_claim(pool, collection_id).await?;
            return Err(e.into());
        }
    }

    let result = harvest::run_cycle(ctx, &hc, started).await;
    harvest::record_outcome(pool, collection_id, &started, &result).await?;
    Ok(result?)
}
