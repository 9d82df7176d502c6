use serde::{Deserialize, Serialize};

use crate::error::SerialResult;

// -----------------------------------------------------------------------------
// KnownTypeEntry

/// One row of the known-type table: a stable type key and the
/// fully-qualified name the host's type loader understands.
///
/// The table lets the resolver name types the registry has not seen yet;
/// hosts populate it from discovered metadata at startup, either
/// directly or from a JSON manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownTypeEntry {
    pub key: String,
    pub qualified_name: String,
}

impl KnownTypeEntry {
    pub fn new(key: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            qualified_name: qualified_name.into(),
        }
    }
}

/// Parses a JSON known-type manifest: an array of
/// `{"key": ..., "qualified_name": ...}` rows.
pub fn parse_manifest(json: &str) -> SerialResult<Vec<KnownTypeEntry>> {
    Ok(serde_json::from_str(json)?)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::{KnownTypeEntry, parse_manifest};

    #[test]
    fn manifest_round_trip() {
        let json = r#"[
            {"key": "sensor.reading", "qualified_name": "telemetry::SensorReading"},
            {"key": "sensor.batch", "qualified_name": "telemetry::SensorBatch"}
        ]"#;
        let entries = parse_manifest(json).unwrap();
        assert_eq!(
            entries[0],
            KnownTypeEntry::new("sensor.reading", "telemetry::SensorReading")
        );
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        assert!(parse_manifest("{\"key\": 1}").is_err());
    }
}
