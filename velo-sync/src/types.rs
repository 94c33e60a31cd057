//! Core data model for the sync engine
//!
//! Job tags, run bookkeeping, per-provider snapshots, and the merged
//! canonical record with field-level provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Upstream provider identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Primary source: most complete rider profiles, event lists, results
    Racing,
    /// Secondary source: may carry fresher ftp/category
    Power,
    /// Secondary source: profile basics
    Official,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Racing, SourceId::Power, SourceId::Official];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Racing => "racing",
            SourceId::Power => "power",
            SourceId::Official => "official",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "racing" => Ok(SourceId::Racing),
            "power" => Ok(SourceId::Power),
            "official" => Ok(SourceId::Official),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Recurring job class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobType {
    Riders,
    NearEvents,
    FarEvents,
    Results,
    Cleanup,
}

impl SyncJobType {
    pub const ALL: [SyncJobType; 5] = [
        SyncJobType::Riders,
        SyncJobType::NearEvents,
        SyncJobType::FarEvents,
        SyncJobType::Results,
        SyncJobType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobType::Riders => "riders",
            SyncJobType::NearEvents => "near_events",
            SyncJobType::FarEvents => "far_events",
            SyncJobType::Results => "results",
            SyncJobType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for SyncJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncJobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "riders" => Ok(SyncJobType::Riders),
            "near_events" => Ok(SyncJobType::NearEvents),
            "far_events" => Ok(SyncJobType::FarEvents),
            "results" => Ok(SyncJobType::Results),
            "cleanup" => Ok(SyncJobType::Cleanup),
            other => Err(format!("unknown job type '{other}'")),
        }
    }
}

/// Outcome classification of one sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Success,
    Partial,
    Error,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Partial => "partial",
            SyncRunStatus::Error => "error",
        }
    }
}

impl FromStr for SyncRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncRunStatus::Running),
            "success" => Ok(SyncRunStatus::Success),
            "partial" => Ok(SyncRunStatus::Partial),
            "error" => Ok(SyncRunStatus::Error),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// One execution of a sync job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub job_type: SyncJobType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncRunStatus,
    pub items_processed: u64,
    pub items_new: u64,
    pub items_updated: u64,
    pub error_count: u64,
    pub error_message: Option<String>,
}

impl SyncRun {
    /// Create a run in the `running` state at trigger time
    pub fn begin(job_type: SyncJobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            started_at: Utc::now(),
            completed_at: None,
            status: SyncRunStatus::Running,
            items_processed: 0,
            items_new: 0,
            items_updated: 0,
            error_count: 0,
            error_message: None,
        }
    }

    /// Finalize the run, deriving status from the error/item counts:
    /// success with zero errors, partial when some items still succeeded,
    /// error when nothing did.
    pub fn finalize(&mut self) {
        self.completed_at = Some(Utc::now());
        self.status = if self.error_count == 0 {
            SyncRunStatus::Success
        } else if self.error_count < self.items_processed {
            SyncRunStatus::Partial
        } else {
            SyncRunStatus::Error
        };
    }

    /// Finalize the run as a fatal failure with a message
    pub fn fail(&mut self, message: impl Into<String>) {
        self.completed_at = Some(Utc::now());
        self.status = SyncRunStatus::Error;
        self.error_message = Some(message.into());
    }
}

/// Entity category; also the cache TTL key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Rider,
    Event,
    RaceResults,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Rider => "rider",
            EntityKind::Event => "event",
            EntityKind::RaceResults => "race_results",
        }
    }
}

/// A logical entity synced across providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityRef {
    pub fn rider(id: u64) -> Self {
        Self {
            kind: EntityKind::Rider,
            id,
        }
    }

    pub fn event(id: u64) -> Self {
        Self {
            kind: EntityKind::Event,
            id,
        }
    }

    pub fn race_results(id: u64) -> Self {
        Self {
            kind: EntityKind::RaceResults,
            id,
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// One provider's raw response for one entity at one point in time
///
/// Fetch failures are captured as a failed snapshot rather than aborting the
/// batch; the merger proceeds with whatever succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: EntityRef,
    pub source: SourceId,
    pub fetched_at: DateTime<Utc>,
    /// Canonical field map normalized from the provider's schema
    pub payload: BTreeMap<String, Value>,
    pub success: bool,
    pub error: Option<String>,
}

impl EntitySnapshot {
    pub fn ok(entity: EntityRef, source: SourceId, payload: BTreeMap<String, Value>) -> Self {
        Self {
            entity,
            source,
            fetched_at: Utc::now(),
            payload,
            success: true,
            error: None,
        }
    }

    pub fn failed(entity: EntityRef, source: SourceId, error: impl Into<String>) -> Self {
        Self {
            entity,
            source,
            fetched_at: Utc::now(),
            payload: BTreeMap::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Confidence in a merged record, from the number of agreeing sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Three or more successful snapshots yield high confidence, two medium,
    /// one low; a value served from stale cache is always low.
    pub fn from_source_count(count: usize, stale: bool) -> Self {
        if stale {
            return Confidence::Low;
        }
        match count {
            0 | 1 => Confidence::Low,
            2 => Confidence::Medium,
            _ => Confidence::High,
        }
    }
}

/// A merged field value with its winning source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
    pub source: SourceId,
}

/// Record of a disagreement observed during merging; never silently dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub field: String,
    pub source1: SourceId,
    pub value1: Value,
    pub source2: SourceId,
    pub value2: Value,
    /// Relative difference in percent, when both values are numeric
    pub delta_pct: Option<f64>,
}

/// The merged canonical view of one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedEntity {
    pub entity: EntityRef,
    pub fields: BTreeMap<String, FieldValue>,
    pub conflicts: Vec<ConflictReport>,
    /// Sources that contributed a successful snapshot
    pub sources: Vec<SourceId>,
    pub confidence: Confidence,
    /// Set when the record was served from an expired cache entry
    pub stale: bool,
    pub merged_at: DateTime<Utc>,
}

impl UnifiedEntity {
    /// Numeric view of a field, if present and numeric
    pub fn number(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(|f| f.value.as_f64())
    }

    /// Winning source for a field
    pub fn provenance(&self, field: &str) -> Option<SourceId> {
        self.fields.get(field).map(|f| f.source)
    }
}

/// A provider's declared rate budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub max_per_window: u32,
    pub window: Duration,
}

/// Read-only view of a source's remaining budget headroom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub remaining: u32,
    /// Time until the window resets; zero when the budget is already fresh
    pub resets_in_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_derives_success_from_zero_errors() {
        let mut run = SyncRun::begin(SyncJobType::Riders);
        run.items_processed = 10;
        run.finalize();
        assert_eq!(run.status, SyncRunStatus::Success);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn finalize_derives_partial_from_mixed_outcome() {
        let mut run = SyncRun::begin(SyncJobType::Riders);
        run.items_processed = 10;
        run.error_count = 3;
        run.finalize();
        assert_eq!(run.status, SyncRunStatus::Partial);
    }

    #[test]
    fn finalize_derives_error_when_nothing_succeeded() {
        let mut run = SyncRun::begin(SyncJobType::Results);
        run.items_processed = 4;
        run.error_count = 4;
        run.finalize();
        assert_eq!(run.status, SyncRunStatus::Error);
    }

    #[test]
    fn confidence_follows_source_count() {
        assert_eq!(Confidence::from_source_count(1, false), Confidence::Low);
        assert_eq!(Confidence::from_source_count(2, false), Confidence::Medium);
        assert_eq!(Confidence::from_source_count(3, false), Confidence::High);
        assert_eq!(Confidence::from_source_count(4, false), Confidence::High);
    }

    #[test]
    fn stale_cache_forces_low_confidence() {
        assert_eq!(Confidence::from_source_count(3, true), Confidence::Low);
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for job in SyncJobType::ALL {
            assert_eq!(job.as_str().parse::<SyncJobType>().unwrap(), job);
        }
    }
}
