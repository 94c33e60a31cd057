//! Sync job execution
//!
//! One pass per job type. Entities fail independently: a provider error on
//! one rider never aborts the batch, it only increments the run's error
//! count. Listing calls fail fast on an exhausted budget so a pass reports
//! promptly instead of stalling toward its lease deadline; per-entity
//! fetches block for the window reset.

use crate::cache::CacheLayer;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncResult;
use crate::gateway::{CallMode, RateLimitedApiGateway};
use crate::history::RunHistory;
use crate::merger::SourceMerger;
use crate::scheduler::{classify, Urgency};
use crate::sink::PersistenceSink;
use crate::sources::{EventHead, SourceClient};
use crate::types::{EntityRef, EntitySnapshot, SyncJobType, SyncRun, SyncRunStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use velo_common::config::RosterConfig;
use velo_common::events::{EventBus, SyncEvent};

/// Events that started within this window still get a results pass
const RESULTS_LOOKBACK_HOURS: i64 = 24;
/// Cleanup prunes persisted runs older than this
const RUN_RETENTION_DAYS: i64 = 30;

pub struct SyncRunner {
    gateway: Arc<RateLimitedApiGateway>,
    merger: SourceMerger,
    cache: Arc<CacheLayer>,
    sources: Vec<Arc<dyn SourceClient>>,
    sink: Arc<dyn PersistenceSink>,
    history: Arc<RunHistory>,
    events: EventBus,
    roster: RosterConfig,
    near_horizon: chrono::Duration,
}

impl SyncRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<RateLimitedApiGateway>,
        merger: SourceMerger,
        cache: Arc<CacheLayer>,
        sources: Vec<Arc<dyn SourceClient>>,
        sink: Arc<dyn PersistenceSink>,
        history: Arc<RunHistory>,
        events: EventBus,
        roster: RosterConfig,
        near_horizon: std::time::Duration,
    ) -> Self {
        Self {
            gateway,
            merger,
            cache,
            sources,
            sink,
            history,
            events,
            roster,
            near_horizon: chrono::Duration::from_std(near_horizon)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    /// Execute one run of the given job and record its outcome
    ///
    /// Returns `Ok` with the finished run even when the run's own status is
    /// `error`; the `Err` path is reserved for coordination failures.
    pub async fn execute(&self, job: SyncJobType) -> SyncResult<SyncRun> {
        let mut run = SyncRun::begin(job);
        info!(job = %job, run_id = %run.id, "sync run started");
        self.events.emit_lossy(SyncEvent::SyncRunStarted {
            run_id: run.id,
            job_type: job.to_string(),
            timestamp: run.started_at,
        });

        let outcome = match job {
            SyncJobType::Riders => self.sync_riders(&mut run).await,
            SyncJobType::NearEvents => self.sync_events(&mut run, Urgency::Near).await,
            SyncJobType::FarEvents => self.sync_events(&mut run, Urgency::Far).await,
            SyncJobType::Results => self.sync_results(&mut run).await,
            SyncJobType::Cleanup => self.cleanup(&mut run).await,
        };

        match outcome {
            Ok(()) => run.finalize(),
            Err(err) => {
                warn!(job = %job, run_id = %run.id, error = %err, "sync run failed");
                run.fail(err.to_string());
            }
        }

        self.history.record(run.clone());
        if let Err(err) = self.sink.record_run(&run).await {
            // The sink is best-effort bookkeeping; the run result stands.
            warn!(run_id = %run.id, error = %err, "failed to persist sync run");
        }

        match (&run.status, &run.error_message) {
            (SyncRunStatus::Error, Some(message)) => {
                self.events.emit_lossy(SyncEvent::SyncRunFailed {
                    run_id: run.id,
                    job_type: job.to_string(),
                    message: message.clone(),
                    timestamp: Utc::now(),
                });
            }
            _ => {
                self.events.emit_lossy(SyncEvent::SyncRunCompleted {
                    run_id: run.id,
                    job_type: job.to_string(),
                    status: run.status.as_str().to_string(),
                    items_processed: run.items_processed,
                    items_new: run.items_new,
                    items_updated: run.items_updated,
                    error_count: run.error_count,
                    timestamp: Utc::now(),
                });
            }
        }

        info!(job = %job, run_id = %run.id, status = run.status.as_str(),
            processed = run.items_processed, new = run.items_new,
            updated = run.items_updated, errors = run.error_count,
            "sync run finished");
        Ok(run)
    }

    /// Execute through the coordinator's single-flight lease
    pub async fn execute_coordinated(
        self: &Arc<Self>,
        coordinator: &SyncCoordinator,
        job: SyncJobType,
    ) -> SyncResult<SyncRun> {
        let runner = Arc::clone(self);
        coordinator
            .run_exclusive(job, async move { runner.execute(job).await })
            .await
    }

    fn primary_client(&self) -> Option<&Arc<dyn SourceClient>> {
        self.sources
            .iter()
            .find(|c| c.source() == self.merger.policy().primary)
    }

    async fn sync_riders(&self, run: &mut SyncRun) -> SyncResult<()> {
        let mut rider_ids: BTreeSet<u64> = self.roster.rider_ids.iter().copied().collect();

        if let Some(club_id) = self.roster.club_id {
            if let Some(primary) = self.primary_client() {
                match self
                    .gateway
                    .list_club_riders(primary.as_ref(), club_id, CallMode::FailFast)
                    .await
                {
                    Ok(members) => rider_ids.extend(members),
                    Err(err) => {
                        warn!(club_id, error = %err,
                            "club roster listing failed, using explicit roster only");
                        run.error_count += 1;
                    }
                }
            }
        }

        debug!(count = rider_ids.len(), "syncing rider roster");
        for id in rider_ids {
            self.sync_entity(EntityRef::rider(id), run).await;
        }
        Ok(())
    }

    async fn sync_events(&self, run: &mut SyncRun, urgency: Urgency) -> SyncResult<()> {
        let primary = match self.primary_client() {
            Some(client) => client,
            None => {
                warn!("no primary source configured, skipping event sync");
                return Ok(());
            }
        };

        let heads = self
            .gateway
            .list_events(primary.as_ref(), CallMode::FailFast)
            .await?;

        let now = Utc::now();
        let selected: Vec<&EventHead> = heads
            .iter()
            .filter(|e| e.starts_at >= now)
            .filter(|e| classify(e.starts_at, now, self.near_horizon) == urgency)
            .collect();

        debug!(total = heads.len(), selected = selected.len(), urgency = ?urgency,
            "syncing upcoming events");
        for head in selected {
            self.sync_entity(EntityRef::event(head.id), run).await;
        }
        Ok(())
    }

    async fn sync_results(&self, run: &mut SyncRun) -> SyncResult<()> {
        let now = Utc::now();
        let lookback = chrono::Duration::hours(RESULTS_LOOKBACK_HOURS);

        let mut recently_started = Vec::new();
        for event_ref in self.cache.entity_refs(crate::types::EntityKind::Event) {
            let Some(entity) = self.cache.get_allow_stale(&event_ref) else {
                continue;
            };
            let Some(starts_at) = entity
                .fields
                .get("starts_at")
                .and_then(|f| f.value.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
            else {
                continue;
            };
            if starts_at <= now && now - starts_at <= lookback {
                recently_started.push(event_ref.id);
            }
        }

        debug!(count = recently_started.len(), "collecting results for recently started events");
        for event_id in recently_started {
            self.sync_entity(EntityRef::race_results(event_id), run).await;
        }
        Ok(())
    }

    async fn cleanup(&self, run: &mut SyncRun) -> SyncResult<()> {
        let purged = self.cache.purge_expired();
        let cutoff = Utc::now() - chrono::Duration::days(RUN_RETENTION_DAYS);
        let pruned = match self.sink.prune_runs_before(cutoff).await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "run pruning failed");
                run.error_count += 1;
                0
            }
        };
        run.items_processed = purged as u64 + pruned;
        info!(purged, pruned, "cleanup pass finished");
        Ok(())
    }

    /// Fetch one entity from every supporting source, merge, and cache
    async fn sync_entity(&self, entity: EntityRef, run: &mut SyncRun) {
        run.items_processed += 1;

        let mut snapshots = Vec::new();
        for client in self.sources.iter().filter(|c| c.supports(entity.kind)) {
            match self
                .gateway
                .fetch(client.as_ref(), &entity, CallMode::Blocking)
                .await
            {
                Ok(response) => {
                    snapshots.push(EntitySnapshot::ok(entity, client.source(), response.payload));
                }
                Err(err) => {
                    debug!(entity = %entity, source = %client.source(), error = %err,
                        "source fetch failed");
                    snapshots.push(EntitySnapshot::failed(entity, client.source(), err.to_string()));
                }
            }
        }

        match self.merger.merge(entity, &snapshots) {
            Ok(unified) => {
                if self.cache.contains(&entity) {
                    run.items_updated += 1;
                } else {
                    run.items_new += 1;
                }
                self.cache.put(unified);
            }
            Err(err) => {
                warn!(entity = %entity, error = %err, "entity sync failed on every source");
                run.error_count += 1;
            }
        }
    }
}
