//! Multi-source merge with field-level provenance
//!
//! The primary source supplies the baseline for every field. A secondary may
//! override a numeric policy field only when its value differs from the
//! baseline by more than the configured relative threshold; every override
//! and every unresolved disagreement is recorded as a conflict, never
//! silently dropped. Fields the primary lacks are enriched from secondaries
//! in priority order.

use crate::error::{SyncError, SyncResult};
use crate::types::{
    Confidence, ConflictReport, EntityRef, EntitySnapshot, FieldValue, SourceId, UnifiedEntity,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use velo_common::config::MergeConfig;

/// Resolved merge policy, parsed from configuration at startup
#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub primary: SourceId,
    /// Baseline fallback and tie-break order; the primary comes first
    pub priority: Vec<SourceId>,
    pub override_fields: HashSet<String>,
    pub override_threshold_pct: f64,
}

impl MergePolicy {
    pub fn from_config(config: &MergeConfig) -> SyncResult<Self> {
        let primary = config
            .primary
            .parse::<SourceId>()
            .map_err(SyncError::Config)?;
        let priority = config
            .priority
            .iter()
            .map(|s| s.parse::<SourceId>().map_err(SyncError::Config))
            .collect::<SyncResult<Vec<_>>>()?;
        if !priority.contains(&primary) {
            return Err(SyncError::Config(format!(
                "merge priority must include primary source {primary}"
            )));
        }
        Ok(Self {
            primary,
            priority,
            override_fields: config.override_fields.iter().cloned().collect(),
            override_threshold_pct: config.override_threshold_pct,
        })
    }

    fn rank(&self, source: SourceId) -> usize {
        self.priority
            .iter()
            .position(|s| *s == source)
            .unwrap_or(usize::MAX)
    }
}

pub struct SourceMerger {
    policy: MergePolicy,
}

impl SourceMerger {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Merge one entity's snapshots into a unified record
    ///
    /// Failed snapshots are ignored; if every snapshot failed the merge
    /// returns `NoSourceAvailable`.
    pub fn merge(
        &self,
        entity: EntityRef,
        snapshots: &[EntitySnapshot],
    ) -> SyncResult<UnifiedEntity> {
        let mut successful: Vec<&EntitySnapshot> =
            snapshots.iter().filter(|s| s.success).collect();
        if successful.is_empty() {
            return Err(SyncError::NoSourceAvailable {
                entity: entity.to_string(),
            });
        }
        successful.sort_by_key(|s| self.policy.rank(s.source));

        // Baseline: the primary when it succeeded, otherwise the
        // highest-priority successful source.
        let baseline = successful
            .iter()
            .find(|s| s.source == self.policy.primary)
            .copied()
            .unwrap_or(successful[0]);
        if baseline.source != self.policy.primary {
            debug!(entity = %entity, baseline = %baseline.source,
                "primary source unavailable, falling back for baseline");
        }

        let mut fields: BTreeMap<String, FieldValue> = baseline
            .payload
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    FieldValue {
                        value: v.clone(),
                        source: baseline.source,
                    },
                )
            })
            .collect();
        let mut conflicts = Vec::new();

        let secondaries: Vec<&EntitySnapshot> = successful
            .iter()
            .filter(|s| s.source != baseline.source)
            .copied()
            .collect();

        // Enrichment: fill fields the baseline lacks, highest priority first
        for snapshot in &secondaries {
            for (field, value) in &snapshot.payload {
                fields.entry(field.clone()).or_insert_with(|| FieldValue {
                    value: value.clone(),
                    source: snapshot.source,
                });
            }
        }

        // Numeric overrides on policy fields
        for field in &self.policy.override_fields {
            let base = match baseline.payload.get(field).and_then(Value::as_f64) {
                Some(v) => v,
                None => continue,
            };

            let candidates: Vec<(SourceId, f64)> = secondaries
                .iter()
                .filter_map(|s| {
                    let value = s.payload.get(field).and_then(Value::as_f64)?;
                    (relative_delta_pct(base, value) > self.policy.override_threshold_pct)
                        .then_some((s.source, value))
                })
                .collect();

            match candidates.as_slice() {
                [] => {}
                [(source, value)] => {
                    conflicts.push(conflict(field, baseline.source, base, *source, *value));
                    fields.insert(
                        field.clone(),
                        FieldValue {
                            value: number(*value),
                            source: *source,
                        },
                    );
                }
                [(first_src, first), (second_src, second), ..] => {
                    if relative_delta_pct(*first, *second) <= self.policy.override_threshold_pct {
                        // Agreeing secondaries: the higher-priority one wins
                        conflicts.push(conflict(
                            field,
                            baseline.source,
                            base,
                            *first_src,
                            *first,
                        ));
                        fields.insert(
                            field.clone(),
                            FieldValue {
                                value: number(*first),
                                source: *first_src,
                            },
                        );
                    } else {
                        // Secondaries disagree with each other: keep the
                        // baseline and record the disagreement
                        conflicts.push(conflict(field, *first_src, *first, *second_src, *second));
                    }
                }
            }
        }

        // Any other disagreement keeps the baseline value but still lands
        // in the conflict report. Numeric policy fields are excluded here;
        // the threshold rule above owns those.
        for snapshot in &secondaries {
            for (field, value) in &snapshot.payload {
                let base = match baseline.payload.get(field) {
                    Some(v) => v,
                    None => continue,
                };
                if base == value {
                    continue;
                }
                if self.policy.override_fields.contains(field)
                    && base.as_f64().is_some()
                    && value.as_f64().is_some()
                {
                    continue;
                }
                conflicts.push(ConflictReport {
                    field: field.clone(),
                    source1: baseline.source,
                    value1: base.clone(),
                    source2: snapshot.source,
                    value2: value.clone(),
                    delta_pct: base
                        .as_f64()
                        .zip(value.as_f64())
                        .map(|(b, v)| relative_delta_pct(b, v)),
                });
            }
        }

        conflicts.sort_by(|a, b| a.field.cmp(&b.field));

        let sources: Vec<SourceId> = successful.iter().map(|s| s.source).collect();
        let confidence = Confidence::from_source_count(sources.len(), false);

        Ok(UnifiedEntity {
            entity,
            fields,
            conflicts,
            sources,
            confidence,
            stale: false,
            merged_at: Utc::now(),
        })
    }
}

/// Relative difference in percent, anchored on the baseline value
fn relative_delta_pct(base: f64, other: f64) -> f64 {
    if base == 0.0 {
        if other == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((other - base).abs() / base.abs()) * 100.0
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn conflict(
    field: &str,
    source1: SourceId,
    value1: f64,
    source2: SourceId,
    value2: f64,
) -> ConflictReport {
    ConflictReport {
        field: field.to_string(),
        source1,
        value1: number(value1),
        source2,
        value2: number(value2),
        delta_pct: Some(relative_delta_pct(value1, value2)),
    }
}
