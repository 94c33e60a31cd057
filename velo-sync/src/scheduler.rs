//! Periodic job scheduling
//!
//! One timer loop per job type, all sharing the coordinator, so a timer
//! firing while a manual trigger is in flight attaches to it instead of
//! starting a second run. Stopping the scheduler cancels the timers only;
//! an execution already holding its lease runs to completion. A scheduled
//! firing is skipped when the primary source has no budget headroom, since
//! the run would only park on the rate limiter.

use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::gateway::RateLimitedApiGateway;
use crate::history::RunHistory;
use crate::runner::SyncRunner;
use crate::types::{SourceId, SyncJobType, SyncRun};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use velo_common::config::JobsConfig;
use velo_common::events::{EventBus, SyncEvent};

/// How soon an event starts, relative to the near horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Near,
    Far,
}

/// Classify an event's start time against the near horizon
///
/// An event starting exactly at the horizon is still far; only events
/// strictly inside it are near.
pub fn classify(starts_at: DateTime<Utc>, now: DateTime<Utc>, horizon: chrono::Duration) -> Urgency {
    if starts_at - now < horizon {
        Urgency::Near
    } else {
        Urgency::Far
    }
}

/// Status of one scheduled job, for the status API
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: SyncJobType,
    pub running: bool,
    pub cadence_secs: u64,
    pub next_run_in_secs: Option<u64>,
    pub last_run: Option<SyncRun>,
}

type NextFireMap = Arc<StdMutex<HashMap<SyncJobType, Instant>>>;

struct State {
    cadences: HashMap<SyncJobType, Duration>,
    sync_on_startup: bool,
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
struct JobContext {
    runner: Arc<SyncRunner>,
    coordinator: SyncCoordinator,
    gateway: Arc<RateLimitedApiGateway>,
    primary: SourceId,
    next_fire: NextFireMap,
}

pub struct Scheduler {
    runner: Arc<SyncRunner>,
    coordinator: SyncCoordinator,
    gateway: Arc<RateLimitedApiGateway>,
    history: Arc<RunHistory>,
    events: EventBus,
    primary: SourceId,
    state: Mutex<State>,
    next_fire: NextFireMap,
}

fn cadences_from(jobs: &JobsConfig) -> HashMap<SyncJobType, Duration> {
    HashMap::from([
        (
            SyncJobType::Riders,
            Duration::from_secs(jobs.riders_cadence_secs),
        ),
        (
            SyncJobType::NearEvents,
            Duration::from_secs(jobs.near_events_cadence_secs),
        ),
        (
            SyncJobType::FarEvents,
            Duration::from_secs(jobs.far_events_cadence_secs),
        ),
        (
            SyncJobType::Results,
            Duration::from_secs(jobs.results_cadence_secs),
        ),
        (
            SyncJobType::Cleanup,
            Duration::from_secs(jobs.cleanup_cadence_secs),
        ),
    ])
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<SyncRunner>,
        coordinator: SyncCoordinator,
        gateway: Arc<RateLimitedApiGateway>,
        history: Arc<RunHistory>,
        events: EventBus,
        primary: SourceId,
        jobs: &JobsConfig,
    ) -> Self {
        Self {
            runner,
            coordinator,
            gateway,
            history,
            events,
            primary,
            state: Mutex::new(State {
                cadences: cadences_from(jobs),
                sync_on_startup: jobs.sync_on_startup,
                cancel: None,
                handles: Vec::new(),
            }),
            next_fire: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Install one timer loop per job
    pub async fn start(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if state.cancel.is_some() {
            return Err(SyncError::Internal("scheduler already running".to_string()));
        }
        self.spawn_loops(&mut state);
        let jobs: Vec<String> = state.cadences.keys().map(|j| j.to_string()).collect();
        info!(?jobs, "scheduler started");
        self.events.emit_lossy(SyncEvent::SchedulerStarted {
            jobs,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Cancel every timer loop
    ///
    /// Executions already holding a lease run to completion; only the
    /// periodic triggers stop.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.halt_locked(&mut state);
        info!("scheduler stopped");
        self.events.emit_lossy(SyncEvent::SchedulerStopped {
            timestamp: Utc::now(),
        });
    }

    /// Swap in new cadences atomically: the old timers are fully cancelled
    /// before the new ones are installed, under one lock, so no job ever
    /// has two live timers.
    pub async fn restart(&self, jobs: &JobsConfig) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        self.halt_locked(&mut state);
        state.cadences = cadences_from(jobs);
        // A restart only changes cadences; it never replays startup syncs.
        state.sync_on_startup = false;
        self.spawn_loops(&mut state);
        info!("scheduler restarted with new cadences");
        Ok(())
    }

    /// Run a job now through the coordinator
    ///
    /// Attaches to the in-flight execution when one already holds the lease.
    pub async fn trigger_now(&self, job: SyncJobType) -> SyncResult<SyncRun> {
        self.runner
            .execute_coordinated(&self.coordinator, job)
            .await
    }

    pub async fn job_status(&self, job: SyncJobType) -> JobStatus {
        let cadence_secs = {
            let state = self.state.lock().await;
            state.cadences.get(&job).map(|d| d.as_secs()).unwrap_or(0)
        };
        let next_run_in_secs = self
            .next_fire
            .lock()
            .expect("next-fire lock poisoned")
            .get(&job)
            .map(|fire| fire.saturating_duration_since(Instant::now()).as_secs());
        JobStatus {
            job,
            running: self.coordinator.is_running(job),
            cadence_secs,
            next_run_in_secs,
            last_run: self.history.last(job),
        }
    }

    pub async fn status(&self) -> Vec<JobStatus> {
        let mut statuses = Vec::with_capacity(SyncJobType::ALL.len());
        for job in SyncJobType::ALL {
            statuses.push(self.job_status(job).await);
        }
        statuses
    }

    fn halt_locked(&self, state: &mut State) {
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        for handle in state.handles.drain(..) {
            handle.abort();
        }
        self.next_fire
            .lock()
            .expect("next-fire lock poisoned")
            .clear();
    }

    fn spawn_loops(&self, state: &mut State) {
        let cancel = CancellationToken::new();
        for (&job, &cadence) in &state.cadences {
            let ctx = JobContext {
                runner: Arc::clone(&self.runner),
                coordinator: self.coordinator.clone(),
                gateway: Arc::clone(&self.gateway),
                primary: self.primary,
                next_fire: Arc::clone(&self.next_fire),
            };
            let token = cancel.child_token();
            let startup = state.sync_on_startup;
            state
                .handles
                .push(tokio::spawn(job_loop(ctx, job, cadence, startup, token)));
        }
        state.cancel = Some(cancel);
    }
}

async fn job_loop(
    ctx: JobContext,
    job: SyncJobType,
    cadence: Duration,
    sync_on_startup: bool,
    cancel: CancellationToken,
) {
    let mut next = if sync_on_startup {
        Instant::now()
    } else {
        Instant::now() + cadence
    };

    loop {
        ctx.next_fire
            .lock()
            .expect("next-fire lock poisoned")
            .insert(job, next);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(next) => {}
        }

        if should_skip_for_headroom(&ctx, job).await {
            warn!(job = %job, "skipping scheduled run, primary source budget exhausted");
        } else if let Err(err) = ctx.runner.execute_coordinated(&ctx.coordinator, job).await {
            warn!(job = %job, error = %err, "scheduled run failed");
        }

        next = Instant::now() + cadence;
    }
}

/// A firing with zero remaining primary budget would only park on the rate
/// limiter until the window resets; skip it and let the next firing catch up.
/// Cleanup makes no upstream calls and always runs.
async fn should_skip_for_headroom(ctx: &JobContext, job: SyncJobType) -> bool {
    if job == SyncJobType::Cleanup {
        return false;
    }
    match ctx.gateway.headroom(ctx.primary).await {
        Some(snapshot) => snapshot.remaining == 0 && snapshot.resets_in_secs > 0,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_within_horizon_is_near() {
        let now = Utc::now();
        let horizon = chrono::Duration::hours(24);
        assert_eq!(
            classify(now + chrono::Duration::minutes(55), now, horizon),
            Urgency::Near
        );
        assert_eq!(
            classify(now + chrono::Duration::hours(23), now, horizon),
            Urgency::Near
        );
    }

    #[test]
    fn event_beyond_horizon_is_far() {
        let now = Utc::now();
        let horizon = chrono::Duration::hours(24);
        assert_eq!(
            classify(now + chrono::Duration::hours(25), now, horizon),
            Urgency::Far
        );
    }

    #[test]
    fn event_crosses_into_near_as_its_start_approaches() {
        let horizon = chrono::Duration::minutes(60);
        let now = Utc::now();
        let starts_at = now + chrono::Duration::minutes(90);

        assert_eq!(classify(starts_at, now, horizon), Urgency::Far);
        // 35 minutes later the event is 55 minutes out
        let later = now + chrono::Duration::minutes(35);
        assert_eq!(classify(starts_at, later, horizon), Urgency::Near);
    }

    #[test]
    fn horizon_boundary_counts_as_far() {
        let now = Utc::now();
        let horizon = chrono::Duration::hours(24);
        assert_eq!(
            classify(now + chrono::Duration::hours(24), now, horizon),
            Urgency::Far
        );
        // One second inside the horizon flips it
        assert_eq!(
            classify(
                now + chrono::Duration::hours(24) - chrono::Duration::seconds(1),
                now,
                horizon
            ),
            Urgency::Near
        );
    }
}
