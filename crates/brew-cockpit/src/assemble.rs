use brew_core::payload::{string_by_keys, value_field};
use brew_core::snapshot::{
    PlannerStep, RawForecast, RawForecasts, SnapshotRecords, ENTITY_ID_KEYS,
};
use brew_core::{
    Cauldron, DrainEvent, LogRow, MatchRow, NetworkGraph, NetworkLink, NetworkNode, Overview,
    OverviewSummary, SnapshotOrigin, Ticket, TraceStep,
};
use brew_correlate::{correlate, normalize_series, CorrelationInput};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

const SYNTHETIC_BASE_PERCENT: f64 = 72.0;
const SYNTHETIC_MAX_DROP: f64 = 60.0;
const SYNTHETIC_MIN_PERCENT: f64 = 12.0;
const SYNTHETIC_VMAX: f64 = 500.0;
const PLANNER_AGENT: &str = "planner";

pub struct AssembleInput<'a> {
    pub records: SnapshotRecords,
    /// Forecasts fetched this cycle; they override snapshot-embedded ones.
    pub fetched_forecasts: BTreeMap<String, RawForecast>,
    pub seeded_trace: &'a [TraceStep],
    pub origin: SnapshotOrigin,
    pub now: DateTime<Utc>,
}

pub fn assemble_overview(input: AssembleInput<'_>) -> Overview {
    let AssembleInput {
        records,
        fetched_forecasts,
        seeded_trace,
        origin,
        now,
    } = input;

    let mut cauldrons = records.cauldrons;
    cauldrons.extend(synthesize_cauldrons(&cauldrons, &records.drains));
    adopt_node_positions(&mut cauldrons, &records.network);
    apply_polar_layout(&mut cauldrons);
    let network = merge_network(records.network, &cauldrons);

    let mut trace = records.trace;
    trace.extend(seeded_trace.iter().cloned());

    let focus_entity = focus_entity(&trace, &cauldrons);
    let labels: BTreeMap<String, String> = cauldrons
        .iter()
        .map(|cauldron| (cauldron.id.clone(), cauldron.display_name().to_string()))
        .collect();

    let groups = correlate(&CorrelationInput {
        trace: &trace,
        drains: &records.drains,
        matches: &records.matches,
        labels: &labels,
        now,
    });

    let forecasts = merge_forecasts(records.forecasts, fetched_forecasts, focus_entity.as_deref())
        .into_iter()
        .map(|(entity_id, raw)| {
            let view = normalize_series(&raw.series, raw.overflow_eta, now);
            (entity_id, view)
        })
        .collect();

    let logs = build_logs(&records.matches, &records.drains);
    let summary = summarize(&cauldrons, &records.tickets, &records.drains);

    Overview {
        generated_at: now,
        origin,
        date: records.date,
        cauldrons,
        network,
        drains: records.drains,
        matches: records.matches,
        findings: records.findings,
        logs,
        forecasts,
        focus_entity,
        groups,
        summary,
    }
}

/// Placeholder cauldrons for drain entities the snapshot does not list.
pub fn synthesize_cauldrons(known: &[Cauldron], drains: &[DrainEvent]) -> Vec<Cauldron> {
    let known_ids: BTreeSet<&str> = known.iter().map(|cauldron| cauldron.id.as_str()).collect();
    let mut order: Vec<&str> = Vec::new();
    let mut drop_totals: BTreeMap<&str, f64> = BTreeMap::new();
    for drain in drains {
        let id = drain.cauldron_id.as_str();
        if known_ids.contains(id) {
            continue;
        }
        if !drop_totals.contains_key(id) {
            order.push(id);
        }
        *drop_totals.entry(id).or_insert(0.0) += drain.drop_volume().max(0.0);
    }

    order
        .into_iter()
        .map(|id| {
            let drop = (drop_totals.get(id).copied().unwrap_or(0.0) / 10.0).min(SYNTHETIC_MAX_DROP);
            let fill_percent = (SYNTHETIC_BASE_PERCENT - drop)
                .round()
                .max(SYNTHETIC_MIN_PERCENT);
            Cauldron {
                id: id.to_string(),
                name: Some(id.to_string()),
                vmax: Some(SYNTHETIC_VMAX),
                fill_rate: None,
                last_volume: Some((fill_percent / 100.0 * SYNTHETIC_VMAX).round()),
                fill_percent: Some(fill_percent),
                x: None,
                y: None,
                synthetic: true,
            }
        })
        .collect()
}

fn adopt_node_positions(cauldrons: &mut [Cauldron], network: &NetworkGraph) {
    for cauldron in cauldrons.iter_mut().filter(|cauldron| !cauldron.has_position()) {
        if let Some(node) = network
            .nodes
            .iter()
            .find(|node| node.id == cauldron.id && node.x.is_some() && node.y.is_some())
        {
            cauldron.x = node.x;
            cauldron.y = node.y;
        }
    }
}

pub fn polar_position(idx: usize, count: usize) -> (f64, f64) {
    let count = count.max(1);
    let angle = idx as f64 / count as f64 * PI * 1.6 + 0.5;
    let ring = idx / (count / 3).max(1);
    let radius = 18.0 + ring as f64 * 10.0;
    let x = (50.0 + angle.cos() * radius).round().clamp(8.0, 92.0);
    let y = (55.0 + angle.sin() * radius).round().clamp(10.0, 90.0);
    (x, y)
}

/// Spreads coordinate-less cauldrons around the map centre.
pub fn apply_polar_layout(cauldrons: &mut [Cauldron]) {
    let count = cauldrons.iter().filter(|cauldron| !cauldron.has_position()).count();
    for (idx, cauldron) in cauldrons
        .iter_mut()
        .filter(|cauldron| !cauldron.has_position())
        .enumerate()
    {
        let (x, y) = polar_position(idx, count);
        cauldron.x = Some(x);
        cauldron.y = Some(y);
    }
}

pub fn merge_network(network: NetworkGraph, cauldrons: &[Cauldron]) -> NetworkGraph {
    let mut nodes: Vec<NetworkNode> = Vec::with_capacity(network.nodes.len() + cauldrons.len());
    let mut seen = BTreeSet::new();
    for mut node in network.nodes {
        if !seen.insert(node.id.clone()) {
            continue;
        }
        if let Some(cauldron) = cauldrons.iter().find(|cauldron| cauldron.id == node.id) {
            node.x = node.x.or(cauldron.x);
            node.y = node.y.or(cauldron.y);
        }
        nodes.push(node);
    }
    for cauldron in cauldrons {
        if seen.insert(cauldron.id.clone()) {
            nodes.push(NetworkNode {
                id: cauldron.id.clone(),
                x: cauldron.x,
                y: cauldron.y,
            });
        }
    }

    // A repeated source->target pair keeps its first slot but takes the later style.
    let mut link_slots: BTreeMap<String, usize> = BTreeMap::new();
    let mut links: Vec<NetworkLink> = Vec::with_capacity(network.links.len());
    for link in network.links {
        let key = link.key();
        if let Some(&slot) = link_slots.get(&key) {
            links[slot] = link;
        } else {
            link_slots.insert(key, links.len());
            links.push(link);
        }
    }

    NetworkGraph { nodes, links }
}

/// First entity named by any step's context, then input payload, then
/// output payload; else the first cauldron.
pub fn focus_entity(trace: &[TraceStep], cauldrons: &[Cauldron]) -> Option<String> {
    let named = |value: Option<&serde_json::Value>| {
        value.and_then(|value| string_by_keys(value, ENTITY_ID_KEYS))
    };
    trace
        .iter()
        .find_map(|step| named(step.context.as_ref()))
        .or_else(|| trace.iter().find_map(|step| named(step.input_payload.as_ref())))
        .or_else(|| trace.iter().find_map(|step| named(step.output_payload.as_ref())))
        .or_else(|| cauldrons.first().map(|cauldron| cauldron.id.clone()))
}

pub fn merge_forecasts(
    embedded: RawForecasts,
    fetched: BTreeMap<String, RawForecast>,
    focus_entity: Option<&str>,
) -> BTreeMap<String, RawForecast> {
    let mut merged = match embedded {
        RawForecasts::Absent => BTreeMap::new(),
        RawForecasts::Keyed(map) => map,
        RawForecasts::Single(raw) => match focus_entity {
            Some(entity_id) => BTreeMap::from([(entity_id.to_string(), raw)]),
            None => BTreeMap::new(),
        },
    };
    merged.extend(fetched);
    merged
}

pub fn build_logs(matches: &[MatchRow], drains: &[DrainEvent]) -> Vec<LogRow> {
    matches
        .iter()
        .map(|row| {
            let drain = drains.iter().find(|drain| drain.id == row.drain_event_id);
            LogRow {
                match_id: row.id.clone(),
                time: drain.and_then(DrainEvent::activity_ts),
                cauldron_id: drain.map(|drain| drain.cauldron_id.clone()),
                volume: drain.map(|drain| drain.volume).unwrap_or(0.0),
                ticket_id: row.ticket_id.clone(),
                diff_volume: row.diff_volume,
            }
        })
        .collect()
}

pub fn summarize(
    cauldrons: &[Cauldron],
    tickets: &[Ticket],
    drains: &[DrainEvent],
) -> OverviewSummary {
    let fills: Vec<f64> = cauldrons
        .iter()
        .filter_map(Cauldron::fill_ratio_percent)
        .collect();
    let avg_fill_percent =
        (!fills.is_empty()).then(|| fills.iter().sum::<f64>() / fills.len() as f64);
    OverviewSummary {
        active_cauldrons: cauldrons.len(),
        open_tickets: tickets.iter().filter(|ticket| ticket.is_open()).count(),
        avg_fill_percent,
        recent_anomalies: drains.len(),
    }
}

/// Turns planner steps into trace records stamped with the run time.
pub fn seed_planner_trace(steps: &[PlannerStep], run_at: DateTime<Utc>) -> Vec<TraceStep> {
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let mut seeded = TraceStep::new(idx as u64 + 1, step.tool.clone());
            seeded.agent = Some(PLANNER_AGENT.to_string());
            seeded.tags = vec![step.tool.clone(), step.status.clone()];
            seeded.summary = step.summary.clone().unwrap_or_default();
            seeded.created_at = Some(run_at);
            seeded.context = step
                .payload
                .as_ref()
                .and_then(|payload| value_field(payload, "context"))
                .cloned();
            seeded.input_payload = step.payload.clone();
            seeded.output_payload = Some(step.raw.clone());
            seeded
        })
        .collect()
}
