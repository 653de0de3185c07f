use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Persisted label for one image, written next to it as `<stem>.json`.
///
/// Only labels that passed schema validation are ever turned into a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelRecord {
    /// File name of the source image (e.g., "promo1.jpg").
    pub image: String,
    /// Engine that produced the label.
    pub engine: String,
    pub extracted_at: DateTime<Utc>,
    /// Validated label fields, as returned by the engine.
    pub label: Map<String, Value>,
}

impl LabelRecord {
    pub fn new(image: impl Into<String>, engine: impl Into<String>, label: Map<String, Value>) -> Self {
        Self {
            image: image.into(),
            engine: engine.into(),
            extracted_at: Utc::now(),
            label,
        }
    }

    /// Label fields serialized as a compact JSON string (the JSONL `label` value).
    pub fn label_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> LabelRecord {
        let label = json!({
            "name": "Piwo Tyskie Gronie 0,5 l",
            "price": 3.49,
            "promo": "BXYG",
            "promo_args": "2:1"
        });
        LabelRecord::new("promo1.jpg", "openai", label.as_object().unwrap().clone())
    }

    #[test]
    fn test_persisted_record_reads_back_equal() {
        let record = sample_record();
        let text = serde_json::to_string_pretty(&record).unwrap();
        let reread: LabelRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(reread, record);
    }

    #[test]
    fn test_label_json_is_compact_label_only() {
        let record = sample_record();
        let text = record.label_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["promo_args"], "2:1");
        assert!(value.get("engine").is_none());
        assert!(!text.contains('\n'));
    }
}
