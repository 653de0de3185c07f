use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::schema::{FieldKind, LabelSchema};

/// A single field-level schema violation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub field: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    NullNotAllowed,
    WrongType { expected: String, found: String },
    NotInEnum { value: String, allowed: Vec<String> },
    TooShort { min: usize, actual: usize },
    TooLong { max: usize, actual: usize },
    BelowMinimum { min: f64, actual: f64 },
    AboveMaximum { max: f64, actual: f64 },
    NotInteger { actual: f64 },
    PatternMismatch { value: String, pattern: String },
    ContainsWhitespace { value: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.field)?;
        match &self.kind {
            ViolationKind::Missing => write!(f, "required field is missing"),
            ViolationKind::NullNotAllowed => write!(f, "null is not allowed"),
            ViolationKind::WrongType { expected, found } => {
                write!(f, "expected {}, found {}", expected, found)
            }
            ViolationKind::NotInEnum { value, allowed } => {
                write!(f, "'{}' not in [{}]", value, allowed.join(", "))
            }
            ViolationKind::TooShort { min, actual } => {
                write!(f, "length {} is below minimum {}", actual, min)
            }
            ViolationKind::TooLong { max, actual } => {
                write!(f, "length {} exceeds maximum {}", actual, max)
            }
            ViolationKind::BelowMinimum { min, actual } => {
                write!(f, "{} is below minimum {}", actual, min)
            }
            ViolationKind::AboveMaximum { max, actual } => {
                write!(f, "{} exceeds maximum {}", actual, max)
            }
            ViolationKind::NotInteger { actual } => write!(f, "{} is not an integer", actual),
            ViolationKind::PatternMismatch { value, pattern } => {
                write!(f, "'{}' does not match {}", value, pattern)
            }
            ViolationKind::ContainsWhitespace { value } => {
                write!(f, "'{}' must not contain whitespace", value)
            }
        }
    }
}

/// Outcome of validating one candidate label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Violations for a given field.
    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Violation> + 'a {
        self.violations.iter().filter(move |v| v.field == field)
    }

    /// All violations joined into one line, for logs and failure reasons.
    pub fn describe(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// The candidate could not be validated at all.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Label candidate must be a JSON object, found {0}")]
    NotAMapping(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse schema file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Schema declares no fields")]
    Empty,

    #[error("Field '{0}' is declared more than once")]
    DuplicateField(String),

    #[error("Invalid pattern for field '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("Field '{field}' selects patterns by '{referenced}', which is not an enum field")]
    BadPatternSelector { field: String, referenced: String },

    #[error("Hint field '{0}' must be a declared enum field")]
    BadHintField(String),
}

enum Rule {
    Text {
        min_len: Option<usize>,
        max_len: Option<usize>,
        pattern: Option<Regex>,
        patterns_by: Option<(String, BTreeMap<String, Regex>)>,
        forbid_whitespace: bool,
    },
    Number {
        min: Option<f64>,
        max: Option<f64>,
        integer: bool,
    },
    Enum {
        values: Vec<String>,
    },
}

struct CompiledField {
    name: String,
    required: bool,
    nullable: bool,
    rule: Rule,
}

/// A [`LabelSchema`] with its regexes compiled, ready to validate candidates.
pub struct CompiledSchema {
    fields: Vec<CompiledField>,
    hint_field: Option<String>,
}

impl CompiledSchema {
    pub fn compile(schema: &LabelSchema) -> Result<Self, SchemaError> {
        if schema.fields.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        for spec in &schema.fields {
            if !seen.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateField(spec.name.clone()));
            }
        }

        let is_enum = |name: &str| {
            schema
                .fields
                .iter()
                .any(|f| f.name == name && matches!(f.kind, FieldKind::Enum { .. }))
        };

        let compile = |field: &str, pattern: &str| {
            Regex::new(pattern).map_err(|source| SchemaError::InvalidPattern {
                field: field.to_string(),
                source,
            })
        };

        let mut fields = Vec::with_capacity(schema.fields.len());
        for spec in &schema.fields {
            let rule = match &spec.kind {
                FieldKind::Text {
                    min_len,
                    max_len,
                    pattern,
                    patterns_by,
                    forbid_whitespace,
                } => {
                    let pattern = pattern.as_deref().map(|p| compile(&spec.name, p)).transpose()?;
                    let patterns_by = match patterns_by {
                        Some(by) => {
                            if !is_enum(&by.field) {
                                return Err(SchemaError::BadPatternSelector {
                                    field: spec.name.clone(),
                                    referenced: by.field.clone(),
                                });
                            }
                            let mut compiled = BTreeMap::new();
                            for (value, p) in &by.patterns {
                                compiled.insert(value.clone(), compile(&spec.name, p)?);
                            }
                            Some((by.field.clone(), compiled))
                        }
                        None => None,
                    };
                    Rule::Text {
                        min_len: *min_len,
                        max_len: *max_len,
                        pattern,
                        patterns_by,
                        forbid_whitespace: *forbid_whitespace,
                    }
                }
                FieldKind::Number { min, max, integer } => Rule::Number {
                    min: *min,
                    max: *max,
                    integer: *integer,
                },
                FieldKind::Enum { values } => Rule::Enum {
                    values: values.clone(),
                },
            };
            fields.push(CompiledField {
                name: spec.name.clone(),
                required: spec.required,
                nullable: spec.nullable,
                rule,
            });
        }

        if let Some(hint) = &schema.hint_field {
            if !is_enum(hint) {
                return Err(SchemaError::BadHintField(hint.clone()));
            }
        }

        Ok(Self {
            fields,
            hint_field: schema.hint_field.clone(),
        })
    }

    /// Load a schema from a JSON file and compile it.
    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        let schema: LabelSchema = serde_json::from_str(&text)?;
        Self::compile(&schema)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Resolve a directory name to a `(field, value)` hint when it names a
    /// value of the hint field (case-insensitive).
    pub fn hint_for(&self, dir_name: &str) -> Option<(String, String)> {
        let field = self.hint_field.as_ref()?;
        let candidate = dir_name.trim();
        if candidate.is_empty() {
            return None;
        }
        self.fields.iter().find(|f| &f.name == field).and_then(|f| match &f.rule {
            Rule::Enum { values } => values
                .iter()
                .find(|v| v.eq_ignore_ascii_case(candidate))
                .map(|v| (field.clone(), v.clone())),
            _ => None,
        })
    }

    /// Validate a candidate label.
    ///
    /// Checks, per declared field:
    /// - presence of required keys
    /// - null handling
    /// - type, enum membership, length and numeric range
    /// - regex patterns, including patterns selected by another field's value
    ///
    /// Keys not declared in the schema are ignored.
    pub fn validate(&self, candidate: &Value) -> Result<ValidationResult, ValidationError> {
        let object = candidate
            .as_object()
            .ok_or_else(|| ValidationError::NotAMapping(json_type(candidate)))?;
        Ok(self.validate_object(object))
    }

    /// [`validate`](Self::validate) for a candidate already known to be a mapping.
    pub fn validate_object(&self, object: &Map<String, Value>) -> ValidationResult {
        let mut violations = Vec::new();
        for field in &self.fields {
            let mut fail = |kind| {
                violations.push(Violation {
                    field: field.name.clone(),
                    kind,
                })
            };

            let value = match object.get(&field.name) {
                Some(value) => value,
                None => {
                    if field.required {
                        fail(ViolationKind::Missing);
                    }
                    continue;
                }
            };

            if value.is_null() {
                if !field.nullable {
                    fail(ViolationKind::NullNotAllowed);
                }
                continue;
            }

            check_value(&field.rule, value, object, &mut fail);
        }

        ValidationResult { violations }
    }
}

fn check_value(rule: &Rule, value: &Value, object: &Map<String, Value>, fail: &mut impl FnMut(ViolationKind)) {
    match rule {
        // ── Free text ────────────────────────────────────────────────────
        Rule::Text {
            min_len,
            max_len,
            pattern,
            patterns_by,
            forbid_whitespace,
        } => {
            let Some(text) = value.as_str() else {
                fail(wrong_type("string", value));
                return;
            };

            let length = text.trim().chars().count();
            if let Some(min) = *min_len {
                if length < min {
                    fail(ViolationKind::TooShort { min, actual: length });
                }
            }
            if let Some(max) = *max_len {
                if length > max {
                    fail(ViolationKind::TooLong { max, actual: length });
                }
            }

            if *forbid_whitespace && text.chars().any(char::is_whitespace) {
                fail(ViolationKind::ContainsWhitespace {
                    value: text.to_string(),
                });
            }

            if let Some(re) = pattern {
                if !re.is_match(text) {
                    fail(ViolationKind::PatternMismatch {
                        value: text.to_string(),
                        pattern: re.as_str().to_string(),
                    });
                }
            }

            // The selector field reports its own violation when it is absent or unknown.
            if let Some((selector, patterns)) = patterns_by {
                let selected = object
                    .get(selector)
                    .and_then(Value::as_str)
                    .and_then(|key| patterns.get(key));
                if let Some(re) = selected {
                    if !re.is_match(text) {
                        fail(ViolationKind::PatternMismatch {
                            value: text.to_string(),
                            pattern: re.as_str().to_string(),
                        });
                    }
                }
            }
        }

        // ── Numbers ──────────────────────────────────────────────────────
        Rule::Number { min, max, integer } => {
            let Some(number) = value.as_f64() else {
                fail(wrong_type("number", value));
                return;
            };

            if *integer && number.fract() != 0.0 {
                fail(ViolationKind::NotInteger { actual: number });
            }
            if let Some(min) = *min {
                if number < min {
                    fail(ViolationKind::BelowMinimum { min, actual: number });
                }
            }
            if let Some(max) = *max {
                if number > max {
                    fail(ViolationKind::AboveMaximum { max, actual: number });
                }
            }
        }

        // ── Enumerations ─────────────────────────────────────────────────
        Rule::Enum { values } => {
            let Some(text) = value.as_str() else {
                fail(wrong_type("string", value));
                return;
            };
            if !values.iter().any(|v| v == text) {
                fail(ViolationKind::NotInEnum {
                    value: text.to_string(),
                    allowed: values.clone(),
                });
            }
        }
    }
}

fn wrong_type(expected: &str, found: &Value) -> ViolationKind {
    ViolationKind::WrongType {
        expected: expected.to_string(),
        found: json_type(found).to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
