//! Rate-limited API gateway
//!
//! Every upstream call flows through here. Each source owns a windowed
//! budget: up to `max_per_window` calls, refilled when the window resets.
//! When a provider reports its own remaining budget in response headers,
//! that metadata overwrites the local count. A 429 from the provider drains
//! the budget immediately for the rest of the window.
//!
//! Timing uses `tokio::time::Instant` so paused-clock tests are
//! deterministic.

use crate::error::{SyncError, SyncResult};
use crate::sources::{BudgetHint, EventHead, FetchError, FetchResponse, SourceClient};
use crate::types::{BudgetSnapshot, EntityRef, RateLimitSpec, SourceId};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// What to do when a source's budget is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Wait for the window to reset, then proceed
    Blocking,
    /// Return `RateLimitExceeded` immediately
    FailFast,
}

struct SourceBudget {
    remaining: u32,
    reset_at: Instant,
    spec: RateLimitSpec,
}

impl SourceBudget {
    fn new(spec: RateLimitSpec) -> Self {
        Self {
            remaining: spec.max_per_window,
            reset_at: Instant::now() + spec.window,
            spec,
        }
    }

    fn refill_if_expired(&mut self, now: Instant) {
        if now >= self.reset_at {
            self.remaining = self.spec.max_per_window;
            self.reset_at = now + self.spec.window;
        }
    }

    fn drain_until(&mut self, reset_at: Instant) {
        self.remaining = 0;
        self.reset_at = reset_at;
    }

    fn apply_hint(&mut self, hint: BudgetHint, now: Instant) {
        self.remaining = hint.remaining;
        if let Some(secs) = hint.reset_secs {
            self.reset_at = now + Duration::from_secs(secs);
        }
    }

    fn snapshot(&self, now: Instant) -> BudgetSnapshot {
        if now >= self.reset_at {
            return BudgetSnapshot {
                remaining: self.spec.max_per_window,
                resets_in_secs: 0,
            };
        }
        BudgetSnapshot {
            remaining: self.remaining,
            resets_in_secs: self.reset_at.duration_since(now).as_secs(),
        }
    }
}

/// Gateway enforcing each source's rate budget and retry policy
pub struct RateLimitedApiGateway {
    budgets: HashMap<SourceId, Mutex<SourceBudget>>,
}

impl RateLimitedApiGateway {
    /// Build a gateway seeded with each source's declared budget
    pub fn new(specs: impl IntoIterator<Item = (SourceId, RateLimitSpec)>) -> Self {
        let budgets = specs
            .into_iter()
            .map(|(source, spec)| (source, Mutex::new(SourceBudget::new(spec))))
            .collect();
        Self { budgets }
    }

    /// Seed a gateway directly from a set of clients
    pub fn for_clients<'a>(clients: impl IntoIterator<Item = &'a dyn SourceClient>) -> Self {
        Self::new(clients.into_iter().map(|c| (c.source(), c.rate_limit())))
    }

    /// Fetch one entity through a source's budget
    pub async fn fetch(
        &self,
        client: &dyn SourceClient,
        entity: &EntityRef,
        mode: CallMode,
    ) -> SyncResult<FetchResponse> {
        let entity = *entity;
        self.call(client.source(), mode, || async move {
            let response = client.fetch_entity(&entity).await?;
            let budget = response.budget;
            Ok((response, budget))
        })
        .await
    }

    /// List upcoming events through a source's budget
    pub async fn list_events(
        &self,
        client: &dyn SourceClient,
        mode: CallMode,
    ) -> SyncResult<Vec<EventHead>> {
        self.call(client.source(), mode, || client.list_upcoming_events())
            .await
    }

    /// List a club's rider ids through a source's budget
    pub async fn list_club_riders(
        &self,
        client: &dyn SourceClient,
        club_id: u64,
        mode: CallMode,
    ) -> SyncResult<Vec<u64>> {
        self.call(client.source(), mode, || client.list_club_riders(club_id))
            .await
    }

    /// Remaining budget headroom for a source
    pub async fn headroom(&self, source: SourceId) -> Option<BudgetSnapshot> {
        let budget = self.budgets.get(&source)?;
        let guard = budget.lock().await;
        Some(guard.snapshot(Instant::now()))
    }

    /// Acquire a budget slot, run the operation, and retry transient failures
    async fn call<T, F, Fut>(&self, source: SourceId, mode: CallMode, op: F) -> SyncResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(T, Option<BudgetHint>), FetchError>>,
    {
        let mut attempt = 0;
        loop {
            self.acquire(source, mode).await?;

            match op().await {
                Ok((value, hint)) => {
                    if let Some(hint) = hint {
                        self.apply_hint(source, hint).await;
                    }
                    return Ok(value);
                }
                Err(FetchError::RateLimited { retry_after }) => {
                    // Trust the provider over the local count: drain the
                    // budget for the rest of the window and surface it.
                    let reset_at = Instant::now()
                        + retry_after.unwrap_or_else(|| self.window_remaining(source));
                    self.drain(source, reset_at).await;
                    warn!(source = %source, "provider returned 429; budget drained");
                    return Err(SyncError::RateLimitExceeded { source_id: source });
                }
                Err(err) => {
                    let sync_err = classify(err, source);
                    let retryable = matches!(sync_err, SyncError::Transient(_));
                    attempt += 1;
                    if !retryable || attempt >= MAX_ATTEMPTS {
                        return Err(sync_err);
                    }
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    debug!(source = %source, attempt, delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn acquire(&self, source: SourceId, mode: CallMode) -> SyncResult<()> {
        let budget = self
            .budgets
            .get(&source)
            .ok_or_else(|| SyncError::Internal(format!("no budget registered for {source}")))?;

        loop {
            let reset_at = {
                let mut guard = budget.lock().await;
                let now = Instant::now();
                guard.refill_if_expired(now);
                if guard.remaining > 0 {
                    guard.remaining -= 1;
                    return Ok(());
                }
                guard.reset_at
            };

            match mode {
                CallMode::FailFast => {
                    return Err(SyncError::RateLimitExceeded { source_id: source })
                }
                CallMode::Blocking => {
                    debug!(source = %source, "budget exhausted, waiting for window reset");
                    tokio::time::sleep_until(reset_at).await;
                }
            }
        }
    }

    async fn apply_hint(&self, source: SourceId, hint: BudgetHint) {
        if let Some(budget) = self.budgets.get(&source) {
            budget.lock().await.apply_hint(hint, Instant::now());
        }
    }

    async fn drain(&self, source: SourceId, reset_at: Instant) {
        if let Some(budget) = self.budgets.get(&source) {
            budget.lock().await.drain_until(reset_at);
        }
    }

    fn window_remaining(&self, source: SourceId) -> Duration {
        self.budgets
            .get(&source)
            .map(|b| {
                // Only called right after a failed acquire; blocking on the
                // lock here is fine.
                match b.try_lock() {
                    Ok(guard) => guard.reset_at.saturating_duration_since(Instant::now()),
                    Err(_) => Duration::from_secs(60),
                }
            })
            .unwrap_or(Duration::from_secs(60))
    }
}

fn classify(err: FetchError, source: SourceId) -> SyncError {
    match err {
        FetchError::Timeout => SyncError::Transient(format!("{source}: request timed out")),
        FetchError::Http { status, message } if status == 0 || status >= 500 => {
            SyncError::Transient(format!("{source}: HTTP {status}: {message}"))
        }
        FetchError::Http { status, message } => SyncError::Permanent { status, message },
        FetchError::Malformed(msg) => SyncError::Permanent {
            status: 200,
            message: format!("{source}: malformed response: {msg}"),
        },
        FetchError::Unsupported(what) => SyncError::Permanent {
            status: 0,
            message: format!("{source}: unsupported operation: {what}"),
        },
        FetchError::RateLimited { .. } => SyncError::RateLimitExceeded { source_id: source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max: u32, window_secs: u64) -> RateLimitSpec {
        RateLimitSpec {
            max_per_window: max,
            window: Duration::from_secs(window_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn budget_refills_after_window() {
        let mut budget = SourceBudget::new(spec(2, 60));
        let start = Instant::now();
        budget.remaining = 0;

        budget.refill_if_expired(start);
        assert_eq!(budget.remaining, 0);

        budget.refill_if_expired(start + Duration::from_secs(61));
        assert_eq!(budget.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_hint_overwrites_local_count() {
        let mut budget = SourceBudget::new(spec(10, 60));
        budget.remaining = 9;
        budget.apply_hint(
            BudgetHint {
                remaining: 3,
                reset_secs: Some(30),
            },
            Instant::now(),
        );
        assert_eq!(budget.remaining, 3);
        let snap = budget.snapshot(Instant::now());
        assert_eq!(snap.resets_in_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_full_budget_after_expiry() {
        let budget = SourceBudget::new(spec(5, 60));
        tokio::time::advance(Duration::from_secs(120)).await;
        let snap = budget.snapshot(Instant::now());
        assert_eq!(snap.remaining, 5);
        assert_eq!(snap.resets_in_secs, 0);
    }
}
