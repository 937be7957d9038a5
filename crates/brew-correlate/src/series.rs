use brew_core::payload::{f64_by_keys, f64_from_value, parse_timestamp, timestamp_by_keys};
use brew_core::{ForecastPoint, ForecastSeries, ForecastView};
use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

const POINT_TS_KEYS: &[&str] = &["ts", "time", "timestamp", "t"];
const POINT_VALUE_KEYS: &[&str] = &["v", "value", "volume", "level"];
const TABLE_HOURS: usize = 6;

/// `[ts, value]` pairs or objects with timestamp and value fields.
pub fn parse_point(raw: &Value) -> Option<ForecastPoint> {
    let (ts, value) = match raw {
        Value::Array(pair) if pair.len() >= 2 => {
            (parse_timestamp(&pair[0])?, f64_from_value(&pair[1])?)
        }
        Value::Object(_) => (
            timestamp_by_keys(raw, POINT_TS_KEYS)?,
            f64_by_keys(raw, POINT_VALUE_KEYS)?,
        ),
        _ => return None,
    };
    Some(ForecastPoint { ts, value })
}

pub fn normalize_series(
    raw: &[Value],
    overflow_eta: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ForecastView {
    let mut points = Vec::with_capacity(raw.len());
    for (index, item) in raw.iter().enumerate() {
        match parse_point(item) {
            Some(point) => points.push(point),
            None => debug!(event = "forecast_point_dropped", index),
        }
    }

    let split_index = points
        .iter()
        .position(|point| point.ts > now)
        .unwrap_or(points.len());
    let observed = points[..split_index].to_vec();
    let projected = if split_index < points.len() {
        points[split_index.saturating_sub(1)..].to_vec()
    } else {
        Vec::new()
    };
    let table = hourly_table(&points);

    ForecastView {
        series: ForecastSeries {
            points,
            overflow_eta,
        },
        split_index,
        observed,
        projected,
        table,
    }
}

fn hour_key(ts: DateTime<Utc>) -> (chrono::NaiveDate, u32) {
    (ts.date_naive(), ts.hour())
}

/// First point per clock hour, capped, plus the final point when its hour
/// is not already present.
pub fn hourly_table(points: &[ForecastPoint]) -> Vec<ForecastPoint> {
    let mut seen = BTreeSet::new();
    let mut table = Vec::new();
    for point in points {
        if table.len() == TABLE_HOURS {
            break;
        }
        if seen.insert(hour_key(point.ts)) {
            table.push(*point);
        }
    }
    if let Some(last) = points.last() {
        if !seen.contains(&hour_key(last.ts)) {
            table.push(*last);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, min, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn mixed_encodings_parse_and_bad_points_drop() {
        let raw = vec![
            json!(["2026-03-01T09:00:00Z", 410]),
            json!({"time": "2026-03-01T09:30:00Z", "value": "422.5"}),
            json!({"ts": "2026-03-01T10:00:00Z"}),
            json!(["not a time", 5]),
            json!([at(10, 30).timestamp_millis(), 440.0]),
            json!(7),
        ];
        let view = normalize_series(&raw, None, at(9, 45));
        let values: Vec<f64> = view.series.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![410.0, 422.5, 440.0]);
        assert_eq!(view.split_index, 2);
        assert_eq!(view.observed.len(), 2);
        assert_eq!(view.projected.len(), 2);
        assert_eq!(view.observed.last(), view.projected.first());
    }

    #[test]
    fn points_keep_input_order() {
        let raw = vec![
            json!(["2026-03-01T11:00:00Z", 1]),
            json!(["2026-03-01T09:00:00Z", 2]),
        ];
        let view = normalize_series(&raw, None, at(8, 0));
        assert_eq!(view.series.points[0].ts, at(11, 0));
        assert_eq!(view.split_index, 0);
        assert!(view.observed.is_empty());
        assert_eq!(view.projected.len(), 2);
    }

    #[test]
    fn fully_observed_series_has_no_projection() {
        let raw = vec![json!(["2026-03-01T09:00:00Z", 1]), json!(["2026-03-01T09:10:00Z", 2])];
        let eta = Some(at(14, 0));
        let view = normalize_series(&raw, eta, at(12, 0));
        assert_eq!(view.split_index, 2);
        assert!(view.projected.is_empty());
        assert_eq!(view.series.overflow_eta, eta);
    }

    #[test]
    fn table_takes_first_point_per_hour_and_the_final_point() {
        let start = at(8, 0);
        let points: Vec<ForecastPoint> = (0..40)
            .map(|i| ForecastPoint {
                ts: start + Duration::minutes(15 * i),
                value: i as f64,
            })
            .collect();
        let table = hourly_table(&points);
        assert_eq!(table.len(), TABLE_HOURS + 1);
        let hours: Vec<u32> = table.iter().map(|p| p.ts.hour()).collect();
        assert_eq!(hours, vec![8, 9, 10, 11, 12, 13, 17]);
        assert_eq!(table.last().map(|p| p.value), Some(39.0));
    }

    #[test]
    fn table_does_not_repeat_a_captured_final_hour() {
        let points = vec![
            ForecastPoint { ts: at(9, 0), value: 1.0 },
            ForecastPoint { ts: at(9, 30), value: 2.0 },
        ];
        assert_eq!(hourly_table(&points).len(), 1);
    }
}
