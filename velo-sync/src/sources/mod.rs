//! Upstream provider clients
//!
//! Each provider implements [`SourceClient`]: fetch one entity, normalized
//! into the canonical field map, with an optional budget hint parsed from the
//! provider's rate-limit headers. Only the primary source can list upcoming
//! events; the others report `Unsupported` and the caller skips them.

pub mod official;
pub mod power;
pub mod racing;

use crate::types::{EntityKind, EntityRef, RateLimitSpec, SourceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use official::OfficialClient;
pub use power::PowerClient;
pub use racing::RacingClient;

/// A single-fetch failure, classified for the gateway's retry policy
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Request timed out; retryable
    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status other than 429
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Provider returned 429; the gateway drains the budget instead of retrying
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Response body did not match the provider's schema
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Operation not offered by this provider
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Remaining-budget metadata a provider reports alongside a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetHint {
    pub remaining: u32,
    /// Seconds until the provider's window resets
    pub reset_secs: Option<u64>,
}

/// One successful provider response, normalized
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Canonical field map for the entity
    pub payload: BTreeMap<String, Value>,
    /// Budget metadata from the response headers, when the provider sends it
    pub budget: Option<BudgetHint>,
}

/// Minimal event listing used for urgency classification
#[derive(Debug, Clone, PartialEq)]
pub struct EventHead {
    pub id: u64,
    pub name: String,
    pub starts_at: DateTime<Utc>,
}

/// A rate-limited upstream provider
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> SourceId;

    /// The provider's declared budget, used to seed the gateway
    fn rate_limit(&self) -> RateLimitSpec;

    /// Whether this provider carries the given entity category at all;
    /// callers skip unsupported kinds without spending budget
    fn supports(&self, kind: EntityKind) -> bool {
        let _ = kind;
        true
    }

    /// Fetch one entity, normalized into the canonical field map
    async fn fetch_entity(&self, entity: &EntityRef) -> Result<FetchResponse, FetchError>;

    /// List upcoming events; only the primary source supports this
    async fn list_upcoming_events(&self) -> Result<(Vec<EventHead>, Option<BudgetHint>), FetchError> {
        Err(FetchError::Unsupported("event listing"))
    }

    /// List a club's rider ids; only the primary source supports this
    async fn list_club_riders(
        &self,
        club_id: u64,
    ) -> Result<(Vec<u64>, Option<BudgetHint>), FetchError> {
        let _ = club_id;
        Err(FetchError::Unsupported("club roster listing"))
    }
}

/// Parse `X-RateLimit-Remaining` / `X-RateLimit-Reset` headers into a hint
pub(crate) fn budget_hint_from_headers(headers: &reqwest::header::HeaderMap) -> Option<BudgetHint> {
    let remaining = headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .parse::<u32>()
        .ok()?;
    let reset_secs = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    Some(BudgetHint {
        remaining,
        reset_secs,
    })
}

/// Map a reqwest failure into the fetch taxonomy
pub(crate) fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        FetchError::Http {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Map a non-success status response into the fetch taxonomy
pub(crate) async fn classify_status(response: reqwest::Response) -> FetchError {
    let status = response.status();
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return FetchError::RateLimited { retry_after };
    }
    let message = response.text().await.unwrap_or_default();
    FetchError::Http {
        status: status.as_u16(),
        message,
    }
}
