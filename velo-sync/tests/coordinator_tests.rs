//! Single-flight coordination behavior

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use velo_sync::coordinator::SyncCoordinator;
use velo_sync::types::{SyncJobType, SyncRun};
use velo_sync::SyncError;

fn finished_run(job: SyncJobType) -> SyncRun {
    let mut run = SyncRun::begin(job);
    run.items_processed = 1;
    run.finalize();
    run
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_share_one_execution() {
    let coordinator = SyncCoordinator::new(Duration::from_secs(60));
    let executions = Arc::new(AtomicUsize::new(0));

    let work = |counter: Arc<AtomicUsize>| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(finished_run(SyncJobType::Riders))
    };

    let (first, second) = tokio::join!(
        coordinator.run_exclusive(SyncJobType::Riders, work(Arc::clone(&executions))),
        coordinator.run_exclusive(SyncJobType::Riders, work(Arc::clone(&executions))),
    );

    let first = first.unwrap();
    let second = second.unwrap();
    // Both callers observed the same run, and the work ran once
    assert_eq!(first.id, second.id);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn different_job_tags_never_block_each_other() {
    let coordinator = SyncCoordinator::new(Duration::from_secs(60));
    let executions = Arc::new(AtomicUsize::new(0));

    let work = |counter: Arc<AtomicUsize>, job: SyncJobType| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(finished_run(job))
    };

    let (riders, results) = tokio::join!(
        coordinator.run_exclusive(
            SyncJobType::Riders,
            work(Arc::clone(&executions), SyncJobType::Riders)
        ),
        coordinator.run_exclusive(
            SyncJobType::Results,
            work(Arc::clone(&executions), SyncJobType::Results)
        ),
    );

    assert_ne!(riders.unwrap().id, results.unwrap().id);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn attached_waiter_receives_the_failure() {
    let coordinator = SyncCoordinator::new(Duration::from_secs(60));

    let work = || async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(SyncError::NoSourceAvailable {
            entity: "rider:7".to_string(),
        })
    };

    let (first, second) = tokio::join!(
        coordinator.run_exclusive(SyncJobType::Riders, work()),
        coordinator.run_exclusive(SyncJobType::Riders, work()),
    );

    let expected = SyncError::NoSourceAvailable {
        entity: "rider:7".to_string(),
    };
    assert_eq!(first.unwrap_err(), expected);
    assert_eq!(second.unwrap_err(), expected);
}

#[tokio::test(start_paused = true)]
async fn overlong_run_is_cancelled_as_stale_lease() {
    let coordinator = SyncCoordinator::new(Duration::from_secs(10));

    let err = coordinator
        .run_exclusive(SyncJobType::Riders, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(finished_run(SyncJobType::Riders))
        })
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SyncError::StaleLease {
            job: SyncJobType::Riders,
            max_secs: 10,
        }
    );

    // The lease was force-released; the next trigger starts fresh
    assert!(!coordinator.is_running(SyncJobType::Riders));
    let run = coordinator
        .run_exclusive(SyncJobType::Riders, async {
            Ok(finished_run(SyncJobType::Riders))
        })
        .await
        .unwrap();
    assert_eq!(run.job_type, SyncJobType::Riders);
}

#[tokio::test]
async fn attaching_from_a_spawned_task_shares_the_execution() {
    let coordinator = SyncCoordinator::new(Duration::from_secs(60));
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let holder = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .run_exclusive(SyncJobType::Riders, async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(finished_run(SyncJobType::Riders))
                })
                .await
        })
    };
    started_rx.await.unwrap();

    // Attach while the lease is held, from a worker task of its own
    let attacher = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .run_exclusive(SyncJobType::Riders, async {
                    Ok(finished_run(SyncJobType::Riders))
                })
                .await
        })
    };

    // Let the attacher reach the lease before releasing the holder
    tokio::task::yield_now().await;
    release_tx.send(()).unwrap();
    let held = holder.await.unwrap().unwrap();
    let attached = attacher.await.unwrap().unwrap();
    assert_eq!(held.id, attached.id);
}

#[tokio::test]
async fn is_running_tracks_the_lease() {
    let coordinator = SyncCoordinator::new(Duration::from_secs(60));
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .run_exclusive(SyncJobType::Cleanup, async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(finished_run(SyncJobType::Cleanup))
                })
                .await
        })
    };

    started_rx.await.unwrap();
    assert!(coordinator.is_running(SyncJobType::Cleanup));
    release_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert!(!coordinator.is_running(SyncJobType::Cleanup));
}
