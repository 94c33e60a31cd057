//! Shared test fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use velo_sync::sources::{BudgetHint, EventHead, FetchError, FetchResponse, SourceClient};
use velo_sync::types::{EntityKind, EntityRef, RateLimitSpec, SourceId};

/// Programmable in-memory source
///
/// Responses are scripted front-to-back; once the script is exhausted the
/// source answers with its default payload, or 404 when none is set.
pub struct MockSource {
    source: SourceId,
    spec: RateLimitSpec,
    kinds: Vec<EntityKind>,
    default_payload: Option<BTreeMap<String, Value>>,
    script: Mutex<VecDeque<Result<FetchResponse, FetchError>>>,
    events: Vec<EventHead>,
    club_members: Vec<u64>,
    calls: AtomicUsize,
    call_log: Mutex<Vec<EntityRef>>,
}

impl MockSource {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            spec: RateLimitSpec {
                max_per_window: 1000,
                window: Duration::from_secs(60),
            },
            kinds: vec![
                EntityKind::Rider,
                EntityKind::Event,
                EntityKind::RaceResults,
            ],
            default_payload: None,
            script: Mutex::new(VecDeque::new()),
            events: Vec::new(),
            club_members: Vec::new(),
            calls: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_spec(mut self, max_per_window: u32, window: Duration) -> Self {
        self.spec = RateLimitSpec {
            max_per_window,
            window,
        };
        self
    }

    pub fn with_payload(mut self, payload: BTreeMap<String, Value>) -> Self {
        self.default_payload = Some(payload);
        self
    }

    pub fn riders_only(mut self) -> Self {
        self.kinds = vec![EntityKind::Rider];
        self
    }

    pub fn with_events(mut self, events: Vec<EventHead>) -> Self {
        self.events = events;
        self
    }

    pub fn with_club_members(mut self, members: Vec<u64>) -> Self {
        self.club_members = members;
        self
    }

    /// Queue the next response; scripted responses run before the default
    pub fn push(&self, response: Result<FetchResponse, FetchError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, entity: &EntityRef) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == entity)
            .count()
    }
}

pub fn ok_response(payload: BTreeMap<String, Value>) -> Result<FetchResponse, FetchError> {
    Ok(FetchResponse {
        payload,
        budget: None,
    })
}

pub fn ok_with_budget(
    payload: BTreeMap<String, Value>,
    hint: BudgetHint,
) -> Result<FetchResponse, FetchError> {
    Ok(FetchResponse {
        payload,
        budget: Some(hint),
    })
}

pub fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[async_trait]
impl SourceClient for MockSource {
    fn source(&self) -> SourceId {
        self.source
    }

    fn rate_limit(&self) -> RateLimitSpec {
        self.spec
    }

    fn supports(&self, kind: EntityKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn fetch_entity(&self, entity: &EntityRef) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_log.lock().unwrap().push(*entity);

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        match &self.default_payload {
            Some(payload) => Ok(FetchResponse {
                payload: payload.clone(),
                budget: None,
            }),
            None => Err(FetchError::Http {
                status: 404,
                message: format!("no fixture for {entity}"),
            }),
        }
    }

    async fn list_upcoming_events(
        &self,
    ) -> Result<(Vec<EventHead>, Option<BudgetHint>), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.events.clone(), None))
    }

    async fn list_club_riders(
        &self,
        _club_id: u64,
    ) -> Result<(Vec<u64>, Option<BudgetHint>), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.club_members.clone(), None))
    }
}
