use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub mod payload;
pub mod snapshot;

pub use payload::PayloadError;

/// Activity kinds tracked per entity group, in column order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Detect,
    Match,
    Audit,
    Forecast,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Detect,
        Category::Match,
        Category::Audit,
        Category::Forecast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Detect => "detect",
            Category::Match => "match",
            Category::Audit => "audit",
            Category::Forecast => "forecast",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Detect => "Detect",
            Category::Match => "Match",
            Category::Audit => "Audit",
            Category::Forecast => "Forecast",
        }
    }

    pub fn from_key(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "detect" => Some(Category::Detect),
            "match" => Some(Category::Match),
            "audit" => Some(Category::Audit),
            "forecast" => Some(Category::Forecast),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Category::from_key(input).ok_or_else(|| format!("Unknown category: {}", input.trim()))
    }
}

/// One recorded planning-agent action. Identity hints stay as raw JSON so
/// they can be probed in several nested locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceStep {
    pub step: u64,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_payload: Option<Value>,
}

impl TraceStep {
    pub fn new(step: u64, tool: impl Into<String>) -> Self {
        Self {
            step,
            tool: tool.into(),
            action: None,
            summary: String::new(),
            agent: None,
            tags: Vec::new(),
            created_at: None,
            context: None,
            input_payload: None,
            output_payload: None,
        }
    }

    pub fn agent_label(&self) -> &str {
        if let Some(agent) = self.agent.as_deref().filter(|value| !value.trim().is_empty()) {
            return agent;
        }
        if !self.tool.trim().is_empty() {
            return &self.tool;
        }
        "Agent"
    }

    /// Tool name first, then action, then the first tag naming a category.
    pub fn category(&self) -> Option<Category> {
        Category::from_key(&self.tool)
            .or_else(|| self.action.as_deref().and_then(Category::from_key))
            .or_else(|| self.tags.iter().find_map(|tag| Category::from_key(tag)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrainEvent {
    pub id: String,
    pub cauldron_id: String,
    pub t_start: Option<DateTime<Utc>>,
    pub t_end: Option<DateTime<Utc>>,
    pub volume: f64,
    #[serde(default)]
    pub level_drop: Option<f64>,
    #[serde(default)]
    pub flags: Option<String>,
}

impl DrainEvent {
    pub fn activity_ts(&self) -> Option<DateTime<Utc>> {
        self.t_end.or(self.t_start)
    }

    pub fn drop_volume(&self) -> f64 {
        self.level_drop.unwrap_or(self.volume)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRow {
    pub id: String,
    pub ticket_id: String,
    pub drain_event_id: String,
    pub diff_volume: f64,
    pub status: String,
    #[serde(default)]
    pub cauldron_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub id: String,
    pub status: String,
}

impl Ticket {
    pub fn is_open(&self) -> bool {
        !matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "closed" | "delivered"
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Suspicious,
    Verified,
}

impl FindingSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingSeverity::Suspicious => "suspicious",
            FindingSeverity::Verified => "verified",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub kind: String,
    #[serde(default)]
    pub cauldron_id: Option<String>,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub drain_event_id: Option<String>,
    #[serde(default)]
    pub diff_volume: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Finding {
    pub fn severity(&self) -> FindingSeverity {
        static SUSPICIOUS: OnceLock<Regex> = OnceLock::new();
        let pattern =
            SUSPICIOUS.get_or_init(|| Regex::new(r"(?i)over|under|unlogged").expect("valid regex"));
        if pattern.is_match(&self.kind) {
            FindingSeverity::Suspicious
        } else {
            FindingSeverity::Verified
        }
    }

    pub fn title(&self) -> String {
        self.kind.replace('_', " ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Cauldron {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vmax: Option<f64>,
    #[serde(default)]
    pub fill_rate: Option<f64>,
    #[serde(default)]
    pub last_volume: Option<f64>,
    #[serde(default)]
    pub fill_percent: Option<f64>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub synthetic: bool,
}

impl Cauldron {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.id)
    }

    pub fn has_position(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }

    /// Explicit fill percent, else derived from volume over capacity.
    pub fn fill_ratio_percent(&self) -> Option<f64> {
        if let Some(percent) = self.fill_percent {
            return Some(percent);
        }
        match (self.last_volume, self.vmax) {
            (Some(volume), Some(vmax)) if vmax > 0.0 => Some(volume / vmax * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkNode {
    pub id: String,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkStyle {
    #[default]
    Solid,
    Dashed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkLink {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub style: LinkStyle,
}

impl NetworkLink {
    pub fn key(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkGraph {
    #[serde(default)]
    pub nodes: Vec<NetworkNode>,
    #[serde(default)]
    pub links: Vec<NetworkLink>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ForecastSeries {
    pub points: Vec<ForecastPoint>,
    #[serde(default)]
    pub overflow_eta: Option<DateTime<Utc>>,
}

/// A forecast split at "now" into observed and projected paths. The two
/// paths share their boundary point whenever both are non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ForecastView {
    pub series: ForecastSeries,
    pub split_index: usize,
    pub observed: Vec<ForecastPoint>,
    pub projected: Vec<ForecastPoint>,
    pub table: Vec<ForecastPoint>,
}

impl ForecastView {
    pub fn is_empty(&self) -> bool {
        self.series.points.is_empty()
    }

    pub fn min_max(&self) -> Option<(f64, f64)> {
        let mut values = self.series.points.iter().map(|point| point.value);
        let first = values.next()?;
        Some(values.fold((first, first), |(min, max), value| {
            (min.min(value), max.max(value))
        }))
    }
}

/// Per-entity aggregation unit rebuilt from scratch every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityGroup {
    pub entity_id: String,
    pub name: String,
    pub latest_ts: DateTime<Utc>,
    pub slots: BTreeMap<Category, TraceStep>,
    pub highlights: BTreeSet<Category>,
    pub agents: BTreeSet<String>,
}

impl EntityGroup {
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            latest_ts: ts,
            slots: BTreeMap::new(),
            highlights: BTreeSet::new(),
            agents: BTreeSet::new(),
        }
    }

    pub fn has_activity(&self) -> bool {
        !self.slots.is_empty() || !self.highlights.is_empty()
    }

    pub fn highlight_labels(&self) -> Vec<&'static str> {
        self.highlights.iter().map(|category| category.label()).collect()
    }

    pub fn slot(&self, category: Category) -> Option<&TraceStep> {
        self.slots.get(&category)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRow {
    pub match_id: String,
    pub time: Option<DateTime<Utc>>,
    pub cauldron_id: Option<String>,
    pub volume: f64,
    pub ticket_id: String,
    pub diff_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OverviewSummary {
    pub active_cauldrons: usize,
    pub open_tickets: usize,
    pub avg_fill_percent: Option<f64>,
    pub recent_anomalies: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    Live,
    Fixture,
}

impl SnapshotOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotOrigin::Live => "live",
            SnapshotOrigin::Fixture => "fixture",
        }
    }
}

/// The read-only view handed to the presentation layer once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Overview {
    pub generated_at: DateTime<Utc>,
    pub origin: SnapshotOrigin,
    #[serde(default)]
    pub date: Option<String>,
    pub cauldrons: Vec<Cauldron>,
    pub network: NetworkGraph,
    pub drains: Vec<DrainEvent>,
    pub matches: Vec<MatchRow>,
    pub findings: Vec<Finding>,
    pub logs: Vec<LogRow>,
    pub forecasts: BTreeMap<String, ForecastView>,
    #[serde(default)]
    pub focus_entity: Option<String>,
    pub groups: Vec<EntityGroup>,
    pub summary: OverviewSummary,
}

impl Overview {
    pub fn empty(generated_at: DateTime<Utc>, origin: SnapshotOrigin) -> Self {
        Self {
            generated_at,
            origin,
            date: None,
            cauldrons: Vec::new(),
            network: NetworkGraph::default(),
            drains: Vec::new(),
            matches: Vec::new(),
            findings: Vec::new(),
            logs: Vec::new(),
            forecasts: BTreeMap::new(),
            focus_entity: None,
            groups: Vec::new(),
            summary: OverviewSummary::default(),
        }
    }

    /// Forecast for the focus entity, else the first one available.
    pub fn primary_forecast(&self) -> Option<(&str, &ForecastView)> {
        if let Some(focus) = self.focus_entity.as_deref() {
            if let Some((id, view)) = self.forecasts.get_key_value(focus) {
                return Some((id.as_str(), view));
            }
        }
        self.forecasts
            .iter()
            .next()
            .map(|(id, view)| (id.as_str(), view))
    }
}
