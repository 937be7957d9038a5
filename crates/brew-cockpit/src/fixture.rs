use brew_core::payload::{parse_json, PayloadError};
use serde_json::Value;

const FIXTURE_OVERVIEW: &str = include_str!("../fixtures/overview.json");

/// Static snapshot substituted wholesale when the backend is unreachable.
pub fn fixture_snapshot() -> Result<Value, PayloadError> {
    parse_json(FIXTURE_OVERVIEW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brew_core::snapshot::{parse_snapshot, RawForecasts};

    #[test]
    fn fixture_parses_into_every_collection() {
        let root = fixture_snapshot().expect("fixture json");
        let records = parse_snapshot(&root).expect("fixture records");
        assert_eq!(records.cauldrons.len(), 4);
        assert_eq!(records.drains.len(), 3);
        assert_eq!(records.matches.len(), 2);
        assert_eq!(records.tickets.len(), 3);
        assert_eq!(records.findings.len(), 2);
        assert_eq!(records.trace.len(), 4);
        assert!(matches!(
            records.forecasts,
            RawForecasts::Keyed(ref map) if map.contains_key("cauldron_003")
        ));
    }
}
