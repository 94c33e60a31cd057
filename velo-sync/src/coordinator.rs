//! Single-flight sync coordination
//!
//! At most one execution per job tag runs at a time. Triggers that arrive
//! while a tag is held attach to the in-flight execution and receive its
//! exact result. A run that exceeds the maximum duration is cancelled and
//! its lease force-released so the next trigger starts fresh.

use crate::error::{SyncError, SyncResult};
use crate::types::{SyncJobType, SyncRun};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type RunOutcome = SyncResult<SyncRun>;

struct Lease {
    started_at: Instant,
    rx: watch::Receiver<Option<RunOutcome>>,
}

struct Inner {
    leases: Mutex<HashMap<SyncJobType, Lease>>,
    max_run_duration: Duration,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(max_run_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                leases: Mutex::new(HashMap::new()),
                max_run_duration,
            }),
        }
    }

    /// Run `work` under the job's lease, or attach to an execution already
    /// holding it
    ///
    /// Every caller for the same in-flight execution receives the same
    /// outcome. Leases are tag-scoped: different job types never block each
    /// other.
    pub async fn run_exclusive<F>(&self, job: SyncJobType, work: F) -> RunOutcome
    where
        F: Future<Output = RunOutcome> + Send + 'static,
    {
        // The guard must close before the first await so this future stays
        // Send; both paths hand the receiver out of the block.
        let rx = {
            let mut leases = self.inner.leases.lock().expect("lease lock poisoned");

            let attached = match leases.get(&job) {
                Some(lease) if lease.started_at.elapsed() > self.inner.max_run_duration => {
                    // The holder never released within its budget; evict it
                    // so this trigger starts a fresh run.
                    warn!(job = %job, "force-releasing stale lease");
                    leases.remove(&job);
                    None
                }
                Some(lease) => {
                    debug!(job = %job, "attaching to in-flight execution");
                    Some(lease.rx.clone())
                }
                None => None,
            };

            match attached {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    leases.insert(
                        job,
                        Lease {
                            started_at: Instant::now(),
                            rx: rx.clone(),
                        },
                    );

                    let inner = Arc::clone(&self.inner);
                    let max = self.inner.max_run_duration;
                    tokio::spawn(async move {
                        let outcome = match tokio::time::timeout(max, work).await {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(job = %job, max_secs = max.as_secs(),
                                    "run exceeded max duration, cancelled");
                                Err(SyncError::StaleLease {
                                    job,
                                    max_secs: max.as_secs(),
                                })
                            }
                        };
                        // Release the lease before publishing so a new
                        // trigger can start while waiters consume this
                        // outcome.
                        inner
                            .leases
                            .lock()
                            .expect("lease lock poisoned")
                            .remove(&job);
                        let _ = tx.send(Some(outcome));
                    });

                    info!(job = %job, "lease acquired, execution started");
                    rx
                }
            }
        };

        Self::wait(rx).await
    }

    /// Whether an execution currently holds the job's lease
    pub fn is_running(&self, job: SyncJobType) -> bool {
        let leases = self.inner.leases.lock().expect("lease lock poisoned");
        leases
            .get(&job)
            .map(|l| l.started_at.elapsed() <= self.inner.max_run_duration)
            .unwrap_or(false)
    }

    async fn wait(mut rx: watch::Receiver<Option<RunOutcome>>) -> RunOutcome {
        let result = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| SyncError::Internal("sync task dropped without a result".to_string()))?;
        result
            .clone()
            .expect("wait_for guarantees a published outcome")
    }
}
