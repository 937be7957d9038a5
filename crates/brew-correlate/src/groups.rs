use crate::identity::PriorityPool;
use crate::ordering::order_groups;
use brew_core::{Category, DrainEvent, EntityGroup, MatchRow, TraceStep};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Folds trace, drain and match records into per-entity groups for one pass.
pub struct GroupAggregator<'a> {
    labels: &'a BTreeMap<String, String>,
    focus: BTreeSet<String>,
    now: DateTime<Utc>,
    groups: BTreeMap<String, EntityGroup>,
}

impl<'a> GroupAggregator<'a> {
    pub fn new(
        labels: &'a BTreeMap<String, String>,
        focus: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            labels,
            focus,
            now,
            groups: BTreeMap::new(),
        }
    }

    fn touch(&mut self, entity_id: &str, ts: DateTime<Utc>) -> &mut EntityGroup {
        let labels = self.labels;
        let group = self.groups.entry(entity_id.to_string()).or_insert_with(|| {
            let name = labels
                .get(entity_id)
                .filter(|label| !label.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| entity_id.to_string());
            EntityGroup::new(entity_id, name, ts)
        });
        if ts > group.latest_ts {
            group.latest_ts = ts;
        }
        group
    }

    pub fn fold_trace(&mut self, entity_id: &str, step: &TraceStep) {
        let now = self.now;
        let ts = step.created_at.unwrap_or(now);
        let group = self.touch(entity_id, ts);
        group.agents.insert(step.agent_label().to_string());

        let Some(category) = step.category() else {
            return;
        };
        group.highlights.insert(category);
        let newer = match group.slots.get(&category) {
            Some(existing) => ts > existing.created_at.unwrap_or(now),
            None => true,
        };
        if newer {
            group.slots.insert(category, step.clone());
        }
    }

    pub fn fold_drain(&mut self, drain: &DrainEvent) {
        let ts = drain.activity_ts().unwrap_or(self.now);
        self.touch(&drain.cauldron_id, ts)
            .highlights
            .insert(Category::Detect);
    }

    pub fn fold_match(&mut self, entity_id: &str, row: &MatchRow) {
        let ts = row.created_at.unwrap_or(self.now);
        self.touch(entity_id, ts).highlights.insert(Category::Match);
    }

    pub fn group(&self, entity_id: &str) -> Option<&EntityGroup> {
        self.groups.get(entity_id)
    }

    /// Drops groups with no categorized activity unless they are in focus,
    /// then applies the display ordering.
    pub fn finish(self, pool: &PriorityPool) -> Vec<EntityGroup> {
        let focus = self.focus;
        let survivors = self
            .groups
            .into_iter()
            .filter(|(entity_id, group)| group.has_activity() || focus.contains(entity_id))
            .collect();
        order_groups(survivors, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, min, 0)
            .single()
            .expect("valid timestamp")
    }

    fn audit(n: u64, created_at: Option<DateTime<Utc>>, summary: &str) -> TraceStep {
        let mut step = TraceStep::new(n, "audit");
        step.created_at = created_at;
        step.summary = summary.to_string();
        step
    }

    #[test]
    fn newer_step_replaces_slot_regardless_of_fold_order() {
        let labels = BTreeMap::new();
        let mut aggregator = GroupAggregator::new(&labels, BTreeSet::new(), ts(12, 0));
        aggregator.fold_trace("A", &audit(2, Some(ts(10, 30)), "newer"));
        aggregator.fold_trace("A", &audit(1, Some(ts(10, 0)), "older"));

        let group = aggregator.group("A").expect("group");
        assert_eq!(group.slot(Category::Audit).map(|s| s.summary.as_str()), Some("newer"));
        assert_eq!(group.latest_ts, ts(10, 30));
    }

    #[test]
    fn equal_timestamps_keep_the_occupant() {
        let labels = BTreeMap::new();
        let mut aggregator = GroupAggregator::new(&labels, BTreeSet::new(), ts(12, 0));
        aggregator.fold_trace("A", &audit(1, Some(ts(10, 0)), "first"));
        aggregator.fold_trace("A", &audit(2, Some(ts(10, 0)), "second"));
        let group = aggregator.group("A").expect("group");
        assert_eq!(group.slot(Category::Audit).map(|s| s.step), Some(1));
    }

    #[test]
    fn untimed_records_use_pass_time() {
        let labels = BTreeMap::from([("A".to_string(), "Amber Vat".to_string())]);
        let mut aggregator = GroupAggregator::new(&labels, BTreeSet::new(), ts(12, 0));
        aggregator.fold_trace("A", &audit(1, Some(ts(10, 0)), "timed"));
        aggregator.fold_trace("A", &audit(2, None, "untimed"));

        let group = aggregator.group("A").expect("group");
        assert_eq!(group.name, "Amber Vat");
        assert_eq!(group.latest_ts, ts(12, 0));
        assert_eq!(group.slot(Category::Audit).map(|s| s.step), Some(2));
    }

    #[test]
    fn drains_and_matches_mark_their_categories() {
        let labels = BTreeMap::new();
        let mut aggregator = GroupAggregator::new(&labels, BTreeSet::new(), ts(12, 0));
        aggregator.fold_drain(&DrainEvent {
            id: "D1".to_string(),
            cauldron_id: "A".to_string(),
            t_start: Some(ts(9, 0)),
            t_end: Some(ts(9, 20)),
            volume: 80.0,
            level_drop: None,
            flags: None,
        });
        aggregator.fold_match(
            "A",
            &MatchRow {
                id: "M1".to_string(),
                ticket_id: "T1".to_string(),
                drain_event_id: "D1".to_string(),
                diff_volume: 4.0,
                status: "ok".to_string(),
                cauldron_id: None,
                created_at: Some(ts(9, 45)),
            },
        );
        let group = aggregator.group("A").expect("group");
        assert_eq!(group.highlight_labels(), vec!["Detect", "Match"]);
        assert!(group.slots.is_empty());
        assert_eq!(group.latest_ts, ts(9, 45));
    }

    #[test]
    fn uncategorized_strays_are_dropped_but_focus_ids_survive() {
        let labels = BTreeMap::new();
        let focus = BTreeSet::from(["F".to_string()]);
        let mut aggregator = GroupAggregator::new(&labels, focus, ts(12, 0));
        aggregator.fold_trace("F", &TraceStep::new(1, "planner"));
        aggregator.fold_trace("S", &TraceStep::new(2, "planner"));

        let groups = aggregator.finish(&PriorityPool::default());
        let ids: Vec<&str> = groups.iter().map(|g| g.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["F"]);
        assert!(groups[0].agents.contains("planner"));
    }
}
