//! In-memory ring of recent sync runs, per job

use crate::types::{SyncJobType, SyncRun};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const DEFAULT_CAPACITY: usize = 50;

/// Recent run history kept in memory for the status API
///
/// The persistence sink is the durable record; this ring answers status
/// queries without touching the database.
pub struct RunHistory {
    runs: RwLock<HashMap<SyncJobType, VecDeque<SyncRun>>>,
    capacity: usize,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, run: SyncRun) {
        let mut runs = self.runs.write().expect("history lock poisoned");
        let ring = runs.entry(run.job_type).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(run);
    }

    /// Most recent runs for a job, newest first
    pub fn recent(&self, job: SyncJobType, limit: usize) -> Vec<SyncRun> {
        let runs = self.runs.read().expect("history lock poisoned");
        runs.get(&job)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn last(&self, job: SyncJobType) -> Option<SyncRun> {
        let runs = self.runs.read().expect("history lock poisoned");
        runs.get(&job).and_then(|ring| ring.back().cloned())
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new()
    }
}
