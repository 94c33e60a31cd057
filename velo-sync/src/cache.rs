//! TTL cache for merged entities
//!
//! One TTL per entity category. Expired entries are kept until the cleanup
//! job purges them, so a read that explicitly allows staleness can still be
//! served when every upstream source is down; such reads come back marked
//! stale with confidence downgraded to low.

use crate::types::{Confidence, EntityKind, EntityRef, UnifiedEntity};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use velo_common::config::CacheConfig;

struct CacheEntry {
    entity: UnifiedEntity,
    expires_at: Instant,
}

pub struct CacheLayer {
    entries: RwLock<HashMap<String, CacheEntry>>,
    rider_ttl: Duration,
    event_ttl: Duration,
    results_ttl: Duration,
}

impl CacheLayer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            rider_ttl: Duration::from_secs(config.rider_ttl_secs),
            event_ttl: Duration::from_secs(config.event_ttl_secs),
            results_ttl: Duration::from_secs(config.results_ttl_secs),
        }
    }

    fn ttl(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Rider => self.rider_ttl,
            EntityKind::Event => self.event_ttl,
            EntityKind::RaceResults => self.results_ttl,
        }
    }

    /// Fresh read; expired entries are treated as absent
    pub fn get(&self, entity: &EntityRef) -> Option<UnifiedEntity> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(&entity.cache_key())?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.entity.clone())
    }

    /// Read that falls back to an expired entry, marked stale with
    /// confidence downgraded to low
    pub fn get_allow_stale(&self, entity: &EntityRef) -> Option<UnifiedEntity> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(&entity.cache_key())?;
        if Instant::now() < entry.expires_at {
            return Some(entry.entity.clone());
        }
        let mut stale = entry.entity.clone();
        stale.stale = true;
        stale.confidence = Confidence::Low;
        Some(stale)
    }

    /// Whether any entry exists for the entity, fresh or expired;
    /// distinguishes new items from updates during a sync pass
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .contains_key(&entity.cache_key())
    }

    pub fn put(&self, entity: UnifiedEntity) {
        let expires_at = Instant::now() + self.ttl(entity.entity.kind);
        let key = entity.entity.cache_key();
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, CacheEntry { entity, expires_at });
    }

    pub fn invalidate(&self, entity: &EntityRef) -> bool {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(&entity.cache_key())
            .is_some()
    }

    pub fn invalidate_all(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached event refs, used by the results job to find recently
    /// started events
    pub fn entity_refs(&self, kind: EntityKind) -> Vec<EntityRef> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .values()
            .filter(|e| e.entity.entity.kind == kind)
            .map(|e| e.entity.entity)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn config() -> CacheConfig {
        CacheConfig {
            rider_ttl_secs: 3600,
            event_ttl_secs: 900,
            results_ttl_secs: 21600,
        }
    }

    fn unified(entity: EntityRef) -> UnifiedEntity {
        UnifiedEntity {
            entity,
            fields: BTreeMap::new(),
            conflicts: Vec::new(),
            sources: vec![crate::types::SourceId::Racing],
            confidence: Confidence::Medium,
            stale: false,
            merged_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_round_trips() {
        let cache = CacheLayer::new(&config());
        let rider = EntityRef::rider(7);
        cache.put(unified(rider));

        let cached = cache.get(&rider).unwrap();
        assert_eq!(cached.entity, rider);
        assert!(!cached.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_absent_from_fresh_reads() {
        let cache = CacheLayer::new(&config());
        let event = EntityRef::event(42);
        cache.put(unified(event));

        tokio::time::advance(Duration::from_secs(901)).await;
        assert!(cache.get(&event).is_none());
        // but the entry still exists until purged
        assert!(cache.contains(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_read_downgrades_confidence() {
        let cache = CacheLayer::new(&config());
        let rider = EntityRef::rider(7);
        cache.put(unified(rider));

        tokio::time::advance(Duration::from_secs(3601)).await;
        let stale = cache.get_allow_stale(&rider).unwrap();
        assert!(stale.stale);
        assert_eq!(stale.confidence, Confidence::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_per_entity_category() {
        let cache = CacheLayer::new(&config());
        cache.put(unified(EntityRef::rider(1)));
        cache.put(unified(EntityRef::event(1)));

        // Past the event TTL but within the rider TTL
        tokio::time::advance(Duration::from_secs(1000)).await;
        assert!(cache.get(&EntityRef::rider(1)).is_some());
        assert!(cache.get(&EntityRef::event(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let cache = CacheLayer::new(&config());
        cache.put(unified(EntityRef::rider(1)));
        cache.put(unified(EntityRef::event(1)));

        tokio::time::advance(Duration::from_secs(1000)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&EntityRef::rider(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_removes_the_entry() {
        let cache = CacheLayer::new(&config());
        let rider = EntityRef::rider(1);
        cache.put(unified(rider));
        assert!(cache.invalidate(&rider));
        assert!(cache.get_allow_stale(&rider).is_none());
        assert!(!cache.invalidate(&rider));
    }
}
