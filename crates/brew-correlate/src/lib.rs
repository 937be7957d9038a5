//! Correlation engine: resolves entity identity for weakly keyed trace
//! steps, folds trace, drain and match records into per-entity groups, and
//! normalizes forecast series.
//!
//! Every function here is pure over its inputs. Nothing survives from one
//! pass to the next.

use brew_core::{DrainEvent, EntityGroup, MatchRow, TraceStep};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub mod groups;
pub mod identity;
pub mod ordering;
pub mod series;

pub use groups::GroupAggregator;
pub use identity::{
    assign_entities, match_entity, resolve_entity_id, AssignedVia, Assignment, FallbackCursor,
    IdentityRule, PriorityPool,
};
pub use ordering::order_groups;
pub use series::normalize_series;

#[derive(Debug, Clone, Copy)]
pub struct CorrelationInput<'a> {
    pub trace: &'a [TraceStep],
    pub drains: &'a [DrainEvent],
    pub matches: &'a [MatchRow],
    /// Display names keyed by entity id.
    pub labels: &'a BTreeMap<String, String>,
    pub now: DateTime<Utc>,
}

pub fn correlate(input: &CorrelationInput<'_>) -> Vec<EntityGroup> {
    let pool = PriorityPool::from_records(input.drains, input.matches);
    let mut aggregator = GroupAggregator::new(input.labels, pool.focus_set(), input.now);

    for assignment in assign_entities(input.trace, &pool) {
        aggregator.fold_trace(&assignment.entity_id, &input.trace[assignment.index]);
    }
    for drain in input.drains {
        aggregator.fold_drain(drain);
    }
    for row in input.matches {
        if let Some(entity_id) = match_entity(row, input.drains) {
            aggregator.fold_match(&entity_id, row);
        }
    }

    aggregator.finish(&pool)
}

/// Stable theme slot for an entity key. Presentation only.
pub fn palette_index(key: &str, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let mut hash: i32 = 0;
    for unit in key.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    hash.unsigned_abs() as usize % len
}

#[cfg(test)]
mod tests {
    use super::*;
    use brew_core::Category;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, min, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn palette_index_is_stable_and_bounded() {
        assert_eq!(palette_index("", 5), 0);
        assert_eq!(palette_index("a", 5), 97 % 5);
        assert_eq!(palette_index("ab", 7), (97 * 31 + 98) % 7);
        assert_eq!(palette_index("cauldron-7", 6), palette_index("cauldron-7", 6));
        assert!(palette_index("a much longer cauldron identifier", 4) < 4);
        assert_eq!(palette_index("anything", 0), 0);
    }

    #[test]
    fn correlate_attributes_matches_without_entity_through_their_drain() {
        let drains = vec![DrainEvent {
            id: "D9".to_string(),
            cauldron_id: "north".to_string(),
            t_start: Some(ts(7, 0)),
            t_end: None,
            volume: 64.0,
            level_drop: None,
            flags: None,
        }];
        let matches = vec![MatchRow {
            id: "M9".to_string(),
            ticket_id: "T9".to_string(),
            drain_event_id: "D9".to_string(),
            diff_volume: 3.5,
            status: "matched".to_string(),
            cauldron_id: None,
            created_at: Some(ts(7, 30)),
        }];
        let mut forecast = TraceStep::new(1, "forecast");
        forecast.context = Some(json!({"cauldron_id": "north"}));
        forecast.created_at = Some(ts(8, 0));
        let trace = vec![forecast];
        let labels = BTreeMap::new();

        let groups = correlate(&CorrelationInput {
            trace: &trace,
            drains: &drains,
            matches: &matches,
            labels: &labels,
            now: ts(9, 0),
        });
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.entity_id, "north");
        assert_eq!(group.latest_ts, ts(8, 0));
        assert!(group.highlights.contains(&Category::Match));
        assert!(group.slot(Category::Forecast).is_some());
    }
}
