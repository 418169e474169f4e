//! The Results Record: final metrics of a completed run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Field injected into every Results Record.
pub const PROCESSING_TIME_FIELD: &str = "processingTime";

/// Keys copied into the system of record's `statistics` column.
const STATISTICS_KEYS: &[&str] = &[
    "treeCount",
    "speciesCount",
    "averageHeight",
    "maxHeight",
    "averageDbh",
    "totalVolume",
    "totalCarbon",
    "totalBiomass",
    "stemsPerHectare",
    "basalArea",
    "canopyCover",
    "areaHectares",
];

/// Final metrics of a run as returned by the processing service, plus the
/// total processing time in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultsRecord(Map<String, JsonValue>);

impl ResultsRecord {
    /// Build the record from raw results. Non-object payloads are kept under `results`.
    pub fn new(results: JsonValue, processing_time_secs: f64) -> Self {
        let mut map = match results {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("results".to_string(), other);
                map
            }
        };
        map.insert(
            PROCESSING_TIME_FIELD.to_string(),
            serde_json::json!(processing_time_secs),
        );
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn processing_time_secs(&self) -> Option<f64> {
        self.0.get(PROCESSING_TIME_FIELD).and_then(JsonValue::as_f64)
    }

    /// The results as the processing service reported them.
    pub fn without_processing_time(&self) -> JsonValue {
        let mut map = self.0.clone();
        map.remove(PROCESSING_TIME_FIELD);
        JsonValue::Object(map)
    }

    pub fn statistics(&self) -> JsonValue {
        summary_statistics(&JsonValue::Object(self.0.clone()))
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

/// Extract the summary statistics subset of a results payload.
pub fn summary_statistics(results: &JsonValue) -> JsonValue {
    let mut stats = Map::new();
    if let Some(obj) = results.as_object() {
        for key in STATISTICS_KEYS {
            if let Some(value) = obj.get(*key) {
                stats.insert((*key).to_string(), value.clone());
            }
        }
    }
    JsonValue::Object(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_processing_time_without_touching_metrics() {
        let raw = json!({"treeCount": 120, "totalCarbon": 41.5, "species": ["pine"]});
        let rec = ResultsRecord::new(raw.clone(), 93.0);

        assert_eq!(rec.processing_time_secs(), Some(93.0));
        assert_eq!(rec.without_processing_time(), raw);
        assert_eq!(rec.get("treeCount"), Some(&json!(120)));
    }

    #[test]
    fn scalar_results_are_wrapped() {
        let rec = ResultsRecord::new(json!(7), 1.0);
        assert_eq!(rec.get("results"), Some(&json!(7)));
    }

    #[test]
    fn statistics_keep_only_known_keys() {
        let raw = json!({"treeCount": 120, "rawTrees": [1, 2, 3], "averageHeight": 18.2});
        let stats = summary_statistics(&raw);
        assert_eq!(stats, json!({"treeCount": 120, "averageHeight": 18.2}));
    }

    #[test]
    fn serializes_as_plain_object() {
        let rec = ResultsRecord::new(json!({"treeCount": 3}), 2.5);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json, json!({"treeCount": 3, "processingTime": 2.5}));
    }
}
