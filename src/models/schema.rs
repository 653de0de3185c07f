use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Promotion codes understood by the default schema.
pub const PROMO_CODES: &[&str] = &["NONE", "SUP", "DISC", "DEALPCT", "DEALFIX", "BXYG", "PACK"];

const PACK_TOKEN: &str = r"(?:[1-9]\d*(?::(?:100|\d{1,2}))?|[1-9]\d*x[1-9]\d*(?::(?:100|\d{1,2}))?)";

/// Declarative description of a label: which fields exist and what they may hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSchema {
    pub fields: Vec<FieldSpec>,

    /// Enum field whose value may be implied by an image's parent directory name.
    #[serde(default)]
    pub hint_field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(default = "default_required")]
    pub required: bool,

    /// Accept JSON `null` as a value.
    #[serde(default)]
    pub nullable: bool,

    #[serde(flatten)]
    pub kind: FieldKind,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text {
        #[serde(default)]
        min_len: Option<usize>,
        #[serde(default)]
        max_len: Option<usize>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        patterns_by: Option<PatternsBy>,
        #[serde(default)]
        forbid_whitespace: bool,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        integer: bool,
    },
    Enum {
        values: Vec<String>,
    },
}

/// Pattern chosen by the value of another (enum) field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsBy {
    pub field: String,
    pub patterns: BTreeMap<String, String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            required: true,
            nullable: false,
            kind,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

impl FieldKind {
    pub fn text() -> Self {
        FieldKind::Text {
            min_len: None,
            max_len: None,
            pattern: None,
            patterns_by: None,
            forbid_whitespace: false,
        }
    }

    pub fn number() -> Self {
        FieldKind::Number {
            min: None,
            max: None,
            integer: false,
        }
    }

    pub fn one_of<S: AsRef<str>>(values: &[S]) -> Self {
        FieldKind::Enum {
            values: values.iter().map(|v| v.as_ref().to_string()).collect(),
        }
    }
}

impl LabelSchema {
    /// Retail promotion taxonomy: product name, price and a promo code with its arguments.
    pub fn promotions() -> Self {
        let patterns = [
            ("NONE", "^$".to_string()),
            ("SUP", r"^$|^[1-9]\d*$".to_string()),
            ("DISC", r"^(100|\d{1,2})$".to_string()),
            ("DEALPCT", r"^[1-9]\d*:(100|\d{1,2})$".to_string()),
            ("DEALFIX", r"^[1-9]\d*=\d+(\.\d{1,2})?$".to_string()),
            ("BXYG", r"^[1-9]\d*:[1-9]\d*$".to_string()),
            ("PACK", format!(r"^{PACK_TOKEN}(?:\|{PACK_TOKEN})*$")),
        ]
        .into_iter()
        .map(|(code, pattern)| (code.to_string(), pattern))
        .collect();

        Self {
            fields: vec![
                FieldSpec::new(
                    "name",
                    FieldKind::Text {
                        min_len: Some(1),
                        max_len: Some(300),
                        pattern: None,
                        patterns_by: None,
                        forbid_whitespace: false,
                    },
                ),
                FieldSpec::new(
                    "price",
                    FieldKind::Number {
                        min: Some(0.0),
                        max: None,
                        integer: false,
                    },
                )
                .nullable(),
                FieldSpec::new("promo", FieldKind::one_of(PROMO_CODES)),
                FieldSpec::new(
                    "promo_args",
                    FieldKind::Text {
                        min_len: None,
                        max_len: Some(64),
                        pattern: None,
                        patterns_by: Some(PatternsBy {
                            field: "promo".to_string(),
                            patterns,
                        }),
                        forbid_whitespace: true,
                    },
                ),
            ],
            hint_field: Some("promo".to_string()),
        }
    }
}

impl Default for LabelSchema {
    fn default() -> Self {
        Self::promotions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_json_shape() {
        let json = r#"{
            "fields": [
                {"name": "title", "type": "text", "min_len": 1},
                {"name": "discount", "type": "number", "min": 0, "max": 100, "nullable": true},
                {"name": "kind", "type": "enum", "values": ["A", "B"], "required": false}
            ],
            "hint_field": "kind"
        }"#;
        let schema: LabelSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.fields.len(), 3);
        assert!(schema.fields[0].required);
        assert!(schema.fields[1].nullable);
        assert!(!schema.fields[2].required);
        assert!(matches!(schema.fields[2].kind, FieldKind::Enum { ref values } if values.len() == 2));
    }

    #[test]
    fn test_promotions_covers_every_code() {
        let schema = LabelSchema::promotions();
        let promo_args = schema.fields.iter().find(|f| f.name == "promo_args").unwrap();
        match &promo_args.kind {
            FieldKind::Text { patterns_by: Some(by), .. } => {
                for code in PROMO_CODES {
                    assert!(by.patterns.contains_key(*code), "no pattern for {code}");
                }
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
