//! Scheduler cadence, restart, manual trigger, and headroom behavior

mod helpers;

use helpers::{fields, MockSource};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use velo_common::config::{JobsConfig, MergeConfig, RosterConfig};
use velo_common::events::EventBus;
use velo_sync::cache::CacheLayer;
use velo_sync::coordinator::SyncCoordinator;
use velo_sync::gateway::{CallMode, RateLimitedApiGateway};
use velo_sync::history::RunHistory;
use velo_sync::merger::{MergePolicy, SourceMerger};
use velo_sync::runner::SyncRunner;
use velo_sync::scheduler::Scheduler;
use velo_sync::sink::NullSink;
use velo_sync::sources::SourceClient;
use velo_sync::types::{EntityRef, SourceId, SyncJobType};

struct Fixture {
    scheduler: Arc<Scheduler>,
    gateway: Arc<RateLimitedApiGateway>,
    history: Arc<RunHistory>,
    source: Arc<MockSource>,
}

fn quiet_jobs() -> JobsConfig {
    JobsConfig {
        riders_cadence_secs: 36_000,
        near_events_cadence_secs: 36_000,
        far_events_cadence_secs: 36_000,
        results_cadence_secs: 36_000,
        cleanup_cadence_secs: 36_000,
        sync_on_startup: false,
    }
}

fn fixture(source: MockSource, jobs: &JobsConfig) -> Fixture {
    let source = Arc::new(source);
    let client: Arc<dyn SourceClient> = Arc::clone(&source) as Arc<dyn SourceClient>;
    let gateway = Arc::new(RateLimitedApiGateway::for_clients([client.as_ref()]));
    let merger = SourceMerger::new(MergePolicy::from_config(&MergeConfig::default()).unwrap());
    let cache = Arc::new(CacheLayer::new(&Default::default()));
    let history = Arc::new(RunHistory::new());
    let events = EventBus::new(64);
    let runner = Arc::new(SyncRunner::new(
        Arc::clone(&gateway),
        merger,
        cache,
        vec![client],
        Arc::new(NullSink),
        Arc::clone(&history),
        events.clone(),
        RosterConfig {
            club_id: None,
            rider_ids: vec![1],
        },
        Duration::from_secs(24 * 3600),
    ));
    let coordinator = SyncCoordinator::new(Duration::from_secs(1800));
    let scheduler = Arc::new(Scheduler::new(
        runner,
        coordinator,
        Arc::clone(&gateway),
        Arc::clone(&history),
        events,
        SourceId::Racing,
        jobs,
    ));
    Fixture {
        scheduler,
        gateway,
        history,
        source,
    }
}

fn rider_source() -> MockSource {
    MockSource::new(SourceId::Racing).with_payload(fields(&[("name", json!("Alex"))]))
}

#[tokio::test(start_paused = true)]
async fn startup_sync_fires_immediately() {
    let mut jobs = quiet_jobs();
    jobs.sync_on_startup = true;
    let fx = fixture(rider_source(), &jobs);

    fx.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(fx.history.last(SyncJobType::Riders).is_some());
    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_firing_waits_for_the_cadence() {
    let mut jobs = quiet_jobs();
    jobs.riders_cadence_secs = 60;
    let fx = fixture(rider_source(), &jobs);

    fx.scheduler.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(fx.history.last(SyncJobType::Riders).is_none());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(fx.history.last(SyncJobType::Riders).is_some());
    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_rejected() {
    let fx = fixture(rider_source(), &quiet_jobs());
    fx.scheduler.start().await.unwrap();
    assert!(fx.scheduler.start().await.is_err());
    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_manual_triggers_share_one_run() {
    let fx = fixture(rider_source(), &quiet_jobs());

    let (first, second) = tokio::join!(
        fx.scheduler.trigger_now(SyncJobType::Riders),
        fx.scheduler.trigger_now(SyncJobType::Riders),
    );

    assert_eq!(first.unwrap().id, second.unwrap().id);
    // One execution, one rider fetched
    assert_eq!(fx.source.calls_for(&EntityRef::rider(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_swaps_cadences_without_duplicate_timers() {
    let fx = fixture(rider_source(), &quiet_jobs());
    fx.scheduler.start().await.unwrap();

    let mut faster = quiet_jobs();
    faster.riders_cadence_secs = 120;
    fx.scheduler.restart(&faster).await.unwrap();

    let status = fx.scheduler.job_status(SyncJobType::Riders).await;
    assert_eq!(status.cadence_secs, 120);

    // The old ten-hour timer is gone; nothing fires before the new cadence
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(fx.history.last(SyncJobType::Riders).is_none());

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(fx.history.last(SyncJobType::Riders).is_some());
    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scheduled_firing_skips_when_primary_budget_is_exhausted() {
    let mut jobs = quiet_jobs();
    jobs.riders_cadence_secs = 60;
    let source = rider_source().with_spec(1, Duration::from_secs(100));
    let fx = fixture(source, &jobs);

    // Use up the only slot in the window
    fx.gateway
        .fetch(fx.source.as_ref(), &EntityRef::rider(99), CallMode::FailFast)
        .await
        .unwrap();

    fx.scheduler.start().await.unwrap();

    // First firing at t=60 lands inside the drained window and is skipped
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert!(fx.history.last(SyncJobType::Riders).is_none());

    // Second firing at t=120 is past the window reset and runs
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(fx.history.last(SyncJobType::Riders).is_some());
    fx.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn status_reports_cadence_and_next_fire() {
    let mut jobs = quiet_jobs();
    jobs.riders_cadence_secs = 600;
    let fx = fixture(rider_source(), &jobs);
    fx.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = fx.scheduler.job_status(SyncJobType::Riders).await;
    assert_eq!(status.job, SyncJobType::Riders);
    assert_eq!(status.cadence_secs, 600);
    assert!(!status.running);
    assert!(status.last_run.is_none());
    let next = status.next_run_in_secs.unwrap();
    assert!(next > 0 && next <= 600);

    let all = fx.scheduler.status().await;
    assert_eq!(all.len(), 5);
    fx.scheduler.stop().await;
}
