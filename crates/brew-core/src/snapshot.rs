//! Adapters from backend snapshot JSON into typed records.
//!
//! Every record kind accepts the field-name variants the backend has used
//! over time. Records missing a mandatory id are dropped with a debug event.

use crate::payload::{
    f64_by_keys, string_by_keys, string_from_value, string_list, timestamp_by_keys, value_at_path,
    value_by_keys, value_field, PayloadError,
};
use crate::{
    Cauldron, DrainEvent, Finding, LinkStyle, MatchRow, NetworkGraph, NetworkLink, NetworkNode,
    Ticket, TraceStep,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

pub const ENTITY_ID_KEYS: &[&str] = &["cauldron_id", "entity_id"];

const CAULDRON_ID_KEYS: &[&str] = &["cauldron_id", "entity_id", "id"];
const CAULDRON_VOLUME_KEYS: &[&str] = &["last_volume", "volume", "current_volume"];
const CAULDRON_VMAX_KEYS: &[&str] = &["vmax", "max_volume", "maxVolume"];
const CAULDRON_FILL_RATE_KEYS: &[&str] = &["fill_rate", "fillRate"];
const CAULDRON_FILL_PERCENT_KEYS: &[&str] = &["fill_percent", "fillPercent"];
const DRAIN_ID_KEYS: &[&str] = &["id", "event_id"];
const DRAIN_VOLUME_KEYS: &[&str] = &["true_volume", "estimated_loss", "volume", "level_drop"];
const MATCH_ID_KEYS: &[&str] = &["id", "match_id"];
const MATCH_TICKET_KEYS: &[&str] = &["ticket_id", "ticket", "ticket_code"];
const MATCH_DIFF_KEYS: &[&str] = &["diff_volume", "discrepancy"];
const TICKET_ID_KEYS: &[&str] = &["ticket_id", "ticket_code", "id"];
const TRACE_TS_KEYS: &[&str] = &["created_at", "timestamp", "ts"];

/// Unnormalized forecast payload; points are parsed by the series normalizer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawForecast {
    pub series: Vec<Value>,
    pub overflow_eta: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RawForecasts {
    #[default]
    Absent,
    Keyed(BTreeMap<String, RawForecast>),
    /// A bare forecast object with no entity key of its own.
    Single(RawForecast),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotRecords {
    pub date: Option<String>,
    pub cauldrons: Vec<Cauldron>,
    pub network: NetworkGraph,
    pub drains: Vec<DrainEvent>,
    pub matches: Vec<MatchRow>,
    pub tickets: Vec<Ticket>,
    pub findings: Vec<Finding>,
    pub trace: Vec<TraceStep>,
    pub forecasts: RawForecasts,
}

pub fn parse_snapshot(root: &Value) -> Result<SnapshotRecords, PayloadError> {
    if !root.is_object() {
        return Err(PayloadError::Shape(format!(
            "snapshot root must be an object, got {}",
            json_kind(root)
        )));
    }

    Ok(SnapshotRecords {
        date: string_by_keys(root, &["date", "generated_at"]),
        cauldrons: collection(root, &["cauldrons"])
            .iter()
            .filter_map(parse_cauldron)
            .collect(),
        network: value_field(root, "network")
            .map(parse_network)
            .unwrap_or_default(),
        drains: collection(root, &["drain_events", "drains"])
            .iter()
            .filter_map(parse_drain)
            .collect(),
        matches: collection(root, &["matches"])
            .iter()
            .filter_map(parse_match)
            .collect(),
        tickets: parse_tickets(root),
        findings: parse_findings(root),
        trace: parse_trace(root),
        forecasts: value_by_keys(root, &["forecast", "forecasts"])
            .map(parse_forecasts)
            .unwrap_or_default(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn collection<'a>(root: &'a Value, keys: &[&str]) -> &'a [Value] {
    value_by_keys(root, keys)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn coordinate(value: &Value, key: &str) -> Option<f64> {
    f64_by_keys(value, &[key]).or_else(|| {
        value_field(value, "metadata").and_then(|metadata| f64_by_keys(metadata, &[key]))
    })
}

pub fn parse_cauldron(value: &Value) -> Option<Cauldron> {
    let Some(id) = string_by_keys(value, CAULDRON_ID_KEYS) else {
        debug!(event = "cauldron_record_dropped", reason = "missing id");
        return None;
    };
    Some(Cauldron {
        id,
        name: string_by_keys(value, &["name"]),
        vmax: f64_by_keys(value, CAULDRON_VMAX_KEYS),
        fill_rate: f64_by_keys(value, CAULDRON_FILL_RATE_KEYS),
        last_volume: f64_by_keys(value, CAULDRON_VOLUME_KEYS),
        fill_percent: f64_by_keys(value, CAULDRON_FILL_PERCENT_KEYS),
        x: coordinate(value, "x"),
        y: coordinate(value, "y"),
        synthetic: false,
    })
}

pub fn parse_network(value: &Value) -> NetworkGraph {
    let nodes = collection(value, &["nodes"])
        .iter()
        .filter_map(|node| {
            Some(NetworkNode {
                id: string_by_keys(node, &["id", "cauldron_id", "entity_id"])?,
                x: coordinate(node, "x"),
                y: coordinate(node, "y"),
            })
        })
        .collect();
    let links = collection(value, &["links", "edges"])
        .iter()
        .filter_map(|link| {
            let style = match string_by_keys(link, &["style"]) {
                Some(style) if style.eq_ignore_ascii_case("dashed") => LinkStyle::Dashed,
                _ => LinkStyle::Solid,
            };
            Some(NetworkLink {
                source: string_by_keys(link, &["source", "from"])?,
                target: string_by_keys(link, &["target", "to"])?,
                style,
            })
        })
        .collect();
    NetworkGraph { nodes, links }
}

fn flags_text(value: &Value) -> Option<String> {
    let raw = value_by_keys(value, &["flags", "reason"])?;
    let parts = string_list(Some(raw));
    (!parts.is_empty()).then(|| parts.join(", "))
}

pub fn parse_drain(value: &Value) -> Option<DrainEvent> {
    let id = string_by_keys(value, DRAIN_ID_KEYS);
    let cauldron_id = string_by_keys(value, ENTITY_ID_KEYS);
    let (Some(id), Some(cauldron_id)) = (id, cauldron_id) else {
        debug!(event = "drain_record_dropped", reason = "missing id");
        return None;
    };
    let detected_at = timestamp_by_keys(value, &["detected_at"]);
    Some(DrainEvent {
        id,
        cauldron_id,
        t_start: timestamp_by_keys(value, &["t_start", "start"]).or(detected_at),
        t_end: timestamp_by_keys(value, &["t_end", "end"]).or(detected_at),
        volume: f64_by_keys(value, DRAIN_VOLUME_KEYS).unwrap_or(0.0),
        level_drop: f64_by_keys(value, &["level_drop"]),
        flags: flags_text(value),
    })
}

pub fn parse_match(value: &Value) -> Option<MatchRow> {
    let Some(id) = string_by_keys(value, MATCH_ID_KEYS) else {
        debug!(event = "match_record_dropped", reason = "missing id");
        return None;
    };
    Some(MatchRow {
        id,
        ticket_id: string_by_keys(value, MATCH_TICKET_KEYS).unwrap_or_default(),
        drain_event_id: string_by_keys(value, &["drain_event_id", "drain_id"]).unwrap_or_default(),
        diff_volume: f64_by_keys(value, MATCH_DIFF_KEYS).unwrap_or(0.0),
        status: string_by_keys(value, &["status"]).unwrap_or_else(|| "unknown".to_string()),
        cauldron_id: string_by_keys(value, ENTITY_ID_KEYS),
        created_at: timestamp_by_keys(value, &["created_at", "matched_at"]),
    })
}

pub fn parse_tickets(root: &Value) -> Vec<Ticket> {
    collection(root, &["tickets"])
        .iter()
        .filter_map(|value| {
            Some(Ticket {
                id: string_by_keys(value, TICKET_ID_KEYS)?,
                status: string_by_keys(value, &["status"]).unwrap_or_else(|| "open".to_string()),
            })
        })
        .collect()
}

/// Accepts either a bare list or an object carrying `findings`.
pub fn parse_findings(value: &Value) -> Vec<Finding> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        _ => collection(value, &["findings"]),
    };
    items
        .iter()
        .filter(|item| item.is_object())
        .map(|item| Finding {
            kind: string_by_keys(item, &["type", "kind"]).unwrap_or_else(|| "finding".to_string()),
            cauldron_id: string_by_keys(item, ENTITY_ID_KEYS),
            ticket_id: string_by_keys(item, MATCH_TICKET_KEYS),
            drain_event_id: string_by_keys(item, &["drain_event_id", "drain_id"]),
            diff_volume: f64_by_keys(item, MATCH_DIFF_KEYS),
            reason: string_by_keys(item, &["reason", "detail", "message"]),
        })
        .collect()
}

fn owned_field(value: &Value, key: &str) -> Option<Value> {
    value_field(value, key).cloned()
}

pub fn parse_trace_step(index: usize, value: &Value) -> Option<TraceStep> {
    if !value.is_object() {
        debug!(event = "trace_record_dropped", index, reason = "not an object");
        return None;
    }
    let action = string_by_keys(value, &["action"]);
    let tool = string_by_keys(value, &["tool"])
        .or_else(|| action.clone())
        .unwrap_or_default();
    let summary = string_by_keys(value, &["summary"])
        .or_else(|| {
            value_at_path(value, &["output_payload", "summary"]).and_then(string_from_value)
        })
        .unwrap_or_default();
    let step = value_field(value, "step")
        .and_then(Value::as_u64)
        .unwrap_or(index as u64 + 1);

    Some(TraceStep {
        step,
        tool,
        action,
        summary,
        agent: string_by_keys(value, &["agent"]),
        tags: string_list(value_field(value, "tags")),
        created_at: timestamp_by_keys(value, TRACE_TS_KEYS),
        context: owned_field(value, "context"),
        input_payload: owned_field(value, "input_payload"),
        output_payload: owned_field(value, "output_payload"),
    })
}

pub fn parse_trace(root: &Value) -> Vec<TraceStep> {
    collection(root, &["agent_trace", "trace"])
        .iter()
        .enumerate()
        .filter_map(|(index, value)| parse_trace_step(index, value))
        .collect()
}

/// Reads `{series|points, overflow_eta}`; `None` when no series is present.
pub fn parse_forecast_response(value: &Value) -> Option<RawForecast> {
    let series = value_by_keys(value, &["series", "points"])?.as_array()?.clone();
    Some(RawForecast {
        series,
        overflow_eta: timestamp_by_keys(value, &["overflow_eta", "overflowEta"]),
    })
}

pub fn parse_forecasts(value: &Value) -> RawForecasts {
    match value {
        Value::Array(items) => RawForecasts::Keyed(
            items
                .iter()
                .filter_map(|item| {
                    Some((
                        string_by_keys(item, ENTITY_ID_KEYS)?,
                        parse_forecast_response(item)?,
                    ))
                })
                .collect(),
        ),
        Value::Object(map) => {
            if let Some(single) = parse_forecast_response(value) {
                return match string_by_keys(value, ENTITY_ID_KEYS) {
                    Some(entity_id) => RawForecasts::Keyed(BTreeMap::from([(entity_id, single)])),
                    None => RawForecasts::Single(single),
                };
            }
            RawForecasts::Keyed(
                map.iter()
                    .filter_map(|(entity_id, item)| {
                        Some((entity_id.clone(), parse_forecast_response(item)?))
                    })
                    .collect(),
            )
        }
        _ => RawForecasts::Absent,
    }
}

/// One executed (or dry-run) step from a planner response.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerStep {
    pub tool: String,
    pub status: String,
    pub summary: Option<String>,
    pub payload: Option<Value>,
    pub raw: Value,
}

pub fn parse_planner_steps(response: &Value) -> Vec<PlannerStep> {
    let steps = value_field(response, "steps")
        .or_else(|| value_at_path(response, &["plan", "steps"]))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    steps
        .iter()
        .filter_map(|step| {
            let tool = string_by_keys(step, &["tool", "action"])?;
            let summary = value_at_path(step, &["response", "summary"])
                .and_then(string_from_value)
                .or_else(|| string_by_keys(step, &["summary", "error", "reason"]));
            Some(PlannerStep {
                tool,
                status: string_by_keys(step, &["status"]).unwrap_or_else(|| "planned".to_string()),
                summary,
                payload: owned_field(step, "payload"),
                raw: step.clone(),
            })
        })
        .collect()
}
