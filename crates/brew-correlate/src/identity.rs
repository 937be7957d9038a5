use brew_core::payload::{string_by_keys, value_at_path, value_field};
use brew_core::snapshot::ENTITY_ID_KEYS;
use brew_core::{DrainEvent, MatchRow, TraceStep};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;

/// Locations a trace step may name its entity in, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRule {
    Context,
    InputContext,
    InputDirect,
    OutputContext,
    PlanSteps,
}

pub const RESOLUTION_ORDER: [IdentityRule; 5] = [
    IdentityRule::Context,
    IdentityRule::InputContext,
    IdentityRule::InputDirect,
    IdentityRule::OutputContext,
    IdentityRule::PlanSteps,
];

impl IdentityRule {
    pub fn apply(self, step: &TraceStep) -> Option<String> {
        match self {
            IdentityRule::Context => step.context.as_ref().and_then(entity_id_in),
            IdentityRule::InputContext => step
                .input_payload
                .as_ref()
                .and_then(|payload| value_field(payload, "context"))
                .and_then(entity_id_in),
            IdentityRule::InputDirect => step.input_payload.as_ref().and_then(entity_id_in),
            IdentityRule::OutputContext => step
                .output_payload
                .as_ref()
                .and_then(|payload| value_field(payload, "context"))
                .and_then(entity_id_in),
            IdentityRule::PlanSteps => step.output_payload.as_ref().and_then(plan_step_entity),
        }
    }
}

fn entity_id_in(value: &Value) -> Option<String> {
    string_by_keys(value, ENTITY_ID_KEYS)
}

fn plan_step_entity(output: &Value) -> Option<String> {
    let steps = value_at_path(output, &["plan", "steps"])
        .or_else(|| value_field(output, "steps"))?
        .as_array()?;
    steps.iter().find_map(|step| {
        let payload = value_field(step, "payload")?;
        entity_id_in(payload).or_else(|| value_field(payload, "target").and_then(entity_id_in))
    })
}

pub fn resolve_with_rule(step: &TraceStep) -> Option<(IdentityRule, String)> {
    RESOLUTION_ORDER
        .iter()
        .find_map(|rule| rule.apply(step).map(|entity_id| (*rule, entity_id)))
}

pub fn resolve_entity_id(step: &TraceStep) -> Option<String> {
    resolve_with_rule(step).map(|(_, entity_id)| entity_id)
}

/// A match row's own entity id, else the entity of the drain it reconciles.
pub fn match_entity(row: &MatchRow, drains: &[DrainEvent]) -> Option<String> {
    row.cauldron_id.clone().or_else(|| {
        drains
            .iter()
            .find(|drain| !row.drain_event_id.is_empty() && drain.id == row.drain_event_id)
            .map(|drain| drain.cauldron_id.clone())
    })
}

/// Entity ids seen in drains (first) and match rows, deduplicated in
/// first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityPool {
    ids: Vec<String>,
    drain_len: usize,
}

impl PriorityPool {
    pub fn from_records(drains: &[DrainEvent], matches: &[MatchRow]) -> Self {
        let mut pool = Self::default();
        for drain in drains {
            pool.push(&drain.cauldron_id);
        }
        pool.drain_len = pool.ids.len();
        for row in matches {
            if let Some(entity_id) = match_entity(row, drains) {
                pool.push(&entity_id);
            }
        }
        pool
    }

    fn push(&mut self, entity_id: &str) {
        let entity_id = entity_id.trim();
        if entity_id.is_empty() || self.contains(entity_id) {
            return;
        }
        self.ids.push(entity_id.to_string());
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn drain_ids(&self) -> &[String] {
        &self.ids[..self.drain_len]
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.ids.iter().any(|id| id == entity_id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn focus_set(&self) -> BTreeSet<String> {
        self.ids.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignedVia {
    Resolved,
    CarriedOver,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Position of the step in the caller's slice.
    pub index: usize,
    pub entity_id: String,
    pub via: AssignedVia,
}

/// Per-pass fallback state: the previous assignment and the rotation
/// position in the pool. Never outlives one walk.
#[derive(Debug, Default)]
pub struct FallbackCursor {
    last: Option<String>,
    next: usize,
}

impl FallbackCursor {
    pub fn assign(
        &mut self,
        resolved: Option<String>,
        pool: &PriorityPool,
    ) -> Option<(String, AssignedVia)> {
        let assigned = if let Some(entity_id) = resolved {
            (entity_id, AssignedVia::Resolved)
        } else if let Some(previous) = self.last.clone() {
            (previous, AssignedVia::CarriedOver)
        } else if !pool.is_empty() {
            let entity_id = pool.ids[self.next % pool.len()].clone();
            self.next += 1;
            (entity_id, AssignedVia::RoundRobin)
        } else {
            return None;
        };
        self.last = Some(assigned.0.clone());
        Some(assigned)
    }
}

/// Newest first; steps without a timestamp go last. Ties keep input order.
pub fn walk_order(steps: &[TraceStep]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..steps.len()).collect();
    order.sort_by(|left, right| {
        match (steps[*left].created_at, steps[*right].created_at) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
    order
}

pub fn assign_entities(steps: &[TraceStep], pool: &PriorityPool) -> Vec<Assignment> {
    let mut cursor = FallbackCursor::default();
    let mut assignments = Vec::with_capacity(steps.len());
    for index in walk_order(steps) {
        let step = &steps[index];
        match cursor.assign(resolve_entity_id(step), pool) {
            Some((entity_id, via)) => assignments.push(Assignment {
                index,
                entity_id,
                via,
            }),
            None => {
                debug!(
                    event = "trace_record_dropped",
                    step = step.step,
                    tool = %step.tool,
                    reason = "unresolved identity"
                );
            }
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn ts(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, min, 0)
            .single()
            .expect("valid timestamp")
    }

    fn step(n: u64, tool: &str, created_at: Option<DateTime<Utc>>) -> TraceStep {
        let mut step = TraceStep::new(n, tool);
        step.created_at = created_at;
        step
    }

    fn drain(id: &str, cauldron_id: &str) -> DrainEvent {
        DrainEvent {
            id: id.to_string(),
            cauldron_id: cauldron_id.to_string(),
            t_start: None,
            t_end: None,
            volume: 50.0,
            level_drop: None,
            flags: None,
        }
    }

    #[test]
    fn context_outranks_every_other_location() {
        let mut traced = step(1, "audit", None);
        traced.context = Some(json!({"cauldron_id": "A"}));
        traced.input_payload = Some(json!({"context": {"cauldron_id": "B"}, "cauldron_id": "C"}));
        traced.output_payload =
            Some(json!({"plan": {"steps": [{"payload": {"cauldron_id": "D"}}]}}));
        assert_eq!(
            resolve_with_rule(&traced),
            Some((IdentityRule::Context, "A".to_string()))
        );

        traced.context = None;
        assert_eq!(
            resolve_with_rule(&traced),
            Some((IdentityRule::InputContext, "B".to_string()))
        );

        traced.input_payload = Some(json!({"cauldron_id": "C"}));
        assert_eq!(resolve_entity_id(&traced).as_deref(), Some("C"));

        traced.input_payload = None;
        assert_eq!(
            resolve_with_rule(&traced),
            Some((IdentityRule::PlanSteps, "D".to_string()))
        );
    }

    #[test]
    fn plan_steps_fall_back_to_target_and_flat_lists() {
        let mut traced = step(1, "planner", None);
        traced.output_payload = Some(json!({
            "steps": [
                {"tool": "detect", "payload": {}},
                {"tool": "forecast", "payload": {"target": {"entity_id": 17}}},
                {"tool": "audit", "payload": {"cauldron_id": "late"}}
            ]
        }));
        assert_eq!(resolve_entity_id(&traced).as_deref(), Some("17"));
    }

    #[test]
    fn blank_ids_do_not_resolve() {
        let mut traced = step(1, "audit", None);
        traced.context = Some(json!({"cauldron_id": "  "}));
        traced.output_payload = Some(json!({"context": {"cauldron_id": "X"}}));
        assert_eq!(
            resolve_with_rule(&traced),
            Some((IdentityRule::OutputContext, "X".to_string()))
        );
    }

    #[test]
    fn pool_lists_drains_before_matches_without_duplicates() {
        let drains = vec![drain("D1", "B"), drain("D2", "A"), drain("D3", "B")];
        let matches = vec![
            MatchRow {
                id: "M1".to_string(),
                ticket_id: "T1".to_string(),
                drain_event_id: "D1".to_string(),
                diff_volume: 0.0,
                status: "ok".to_string(),
                cauldron_id: Some("C".to_string()),
                created_at: None,
            },
            MatchRow {
                id: "M2".to_string(),
                ticket_id: "T2".to_string(),
                drain_event_id: "D2".to_string(),
                diff_volume: 0.0,
                status: "ok".to_string(),
                cauldron_id: None,
                created_at: None,
            },
        ];
        let pool = PriorityPool::from_records(&drains, &matches);
        assert_eq!(pool.ids(), ["B", "A", "C"]);
        assert_eq!(pool.drain_ids(), ["B", "A"]);
        assert!(pool.contains("C"));
    }

    #[test]
    fn unresolved_steps_carry_over_then_rotate() {
        let drains = vec![drain("D1", "A"), drain("D2", "B")];
        let pool = PriorityPool::from_records(&drains, &[]);

        let mut resolved = step(1, "detect", Some(ts(10, 5)));
        resolved.context = Some(json!({"cauldron_id": "Z"}));
        let steps = vec![step(2, "audit", Some(ts(10, 4))), resolved];

        let assignments = assign_entities(&steps, &pool);
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].index, 1);
        assert_eq!(assignments[0].via, AssignedVia::Resolved);
        assert_eq!(assignments[1].entity_id, "Z");
        assert_eq!(assignments[1].via, AssignedVia::CarriedOver);

        let orphans = vec![step(1, "audit", None)];
        let assignments = assign_entities(&orphans, &pool);
        assert_eq!(assignments[0].entity_id, "A");
        assert_eq!(assignments[0].via, AssignedVia::RoundRobin);
    }

    #[test]
    fn cursor_cycles_through_pool_when_nothing_to_carry() {
        let pool = PriorityPool::from_records(&[drain("D1", "A"), drain("D2", "B")], &[]);
        let mut cursor = FallbackCursor::default();
        assert_eq!(
            cursor.assign(None, &pool),
            Some(("A".to_string(), AssignedVia::RoundRobin))
        );
        cursor.last = None;
        assert_eq!(
            cursor.assign(None, &pool),
            Some(("B".to_string(), AssignedVia::RoundRobin))
        );
        cursor.last = None;
        assert_eq!(
            cursor.assign(None, &pool),
            Some(("A".to_string(), AssignedVia::RoundRobin))
        );
    }

    #[test]
    fn walk_order_is_newest_first_with_untimed_last() {
        let steps = vec![
            step(1, "a", None),
            step(2, "b", Some(ts(9, 0))),
            step(3, "c", Some(ts(11, 0))),
            step(4, "d", None),
            step(5, "e", Some(ts(9, 0))),
        ];
        assert_eq!(walk_order(&steps), vec![2, 1, 4, 0, 3]);
    }

    #[test]
    fn empty_pool_drops_unresolved_steps() {
        let pool = PriorityPool::default();
        let steps = vec![step(1, "audit", Some(ts(10, 0)))];
        assert!(assign_entities(&steps, &pool).is_empty());
    }
}
