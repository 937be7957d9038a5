use crate::identity::PriorityPool;
use brew_core::EntityGroup;
use std::collections::BTreeMap;

/// Drain-backed entities first in pool order, then everything else by most
/// recent activity. With a non-empty pool, ids outside it are removed.
pub fn order_groups(
    mut groups: BTreeMap<String, EntityGroup>,
    pool: &PriorityPool,
) -> Vec<EntityGroup> {
    let mut ordered = Vec::with_capacity(groups.len());
    for entity_id in pool.drain_ids() {
        if let Some(group) = groups.remove(entity_id) {
            ordered.push(group);
        }
    }

    let mut rest: Vec<EntityGroup> = groups.into_values().collect();
    rest.sort_by(|left, right| {
        right
            .latest_ts
            .cmp(&left.latest_ts)
            .then_with(|| left.entity_id.cmp(&right.entity_id))
    });
    ordered.extend(rest);

    if !pool.is_empty() {
        ordered.retain(|group| pool.contains(&group.entity_id));
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use brew_core::DrainEvent;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn groups(entries: &[(&str, u32)]) -> BTreeMap<String, EntityGroup> {
        entries
            .iter()
            .map(|(id, hour)| (id.to_string(), EntityGroup::new(*id, *id, ts(*hour))))
            .collect()
    }

    fn drain(cauldron_id: &str) -> DrainEvent {
        DrainEvent {
            id: format!("drain-{cauldron_id}"),
            cauldron_id: cauldron_id.to_string(),
            t_start: None,
            t_end: None,
            volume: 10.0,
            level_drop: None,
            flags: None,
        }
    }

    #[test]
    fn empty_pool_orders_by_recency_only() {
        let ordered = order_groups(
            groups(&[("A", 8), ("B", 11), ("C", 9)]),
            &PriorityPool::default(),
        );
        let ids: Vec<&str> = ordered.iter().map(|g| g.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C", "A"]);
    }

    #[test]
    fn drain_ids_lead_and_outsiders_are_filtered() {
        let pool = PriorityPool::from_records(&[drain("A"), drain("C")], &[]);
        let ordered = order_groups(groups(&[("A", 8), ("B", 11), ("C", 9)]), &pool);
        let ids: Vec<&str> = ordered.iter().map(|g| g.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }
}
