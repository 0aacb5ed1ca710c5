// 🏛️ Attribute Set - which business fields a dimension tracks
// A new version is only cut when a TRACKED attribute changes.
// Required/positive rules are enforced on every version at insert time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// ATTRIBUTE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Text,
    Number,
    Boolean,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Text => "text",
            AttributeType::Number => "number",
            AttributeType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    /// Value must be present (not missing, not null)
    Required,
    /// Text value must not be empty
    NonEmpty,
    /// Numeric value must be > 0
    Positive,
}

// ============================================================================
// ATTRIBUTE VALUE
// ============================================================================

/// A single business attribute value.
///
/// Numbers are always finite once they pass [`AttributeSet::validate`], so plain
/// equality is a sound change-detection test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Bool(_) => "boolean",
            AttributeValue::Number(_) => "number",
            AttributeValue::Text(_) => "text",
        }
    }

    fn matches_type(&self, type_: AttributeType) -> bool {
        matches!(
            (self, type_),
            (AttributeValue::Null, _)
                | (AttributeValue::Text(_), AttributeType::Text)
                | (AttributeValue::Number(_), AttributeType::Number)
                | (AttributeValue::Bool(_), AttributeType::Boolean)
        )
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => write!(f, "null"),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value as f64)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

/// Ordered mapping of attribute name → value carried by every row.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Missing keys and explicit nulls are the same thing.
fn lookup<'a>(attributes: &'a Attributes, name: &str) -> Option<&'a AttributeValue> {
    attributes.get(name).filter(|v| !v.is_null())
}

// ============================================================================
// ATTRIBUTE DEFINITION
// ============================================================================

fn default_tracked() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Column / field name (e.g., "price")
    pub name: String,

    #[serde(rename = "type")]
    pub type_: AttributeType,

    /// Tracked attributes participate in change detection
    #[serde(default = "default_tracked")]
    pub tracked: bool,

    #[serde(default)]
    pub rules: Vec<ValidationRule>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, type_: AttributeType) -> Self {
        AttributeDefinition {
            name: name.into(),
            type_,
            tracked: true,
            rules: Vec::new(),
            description: String::new(),
        }
    }

    /// Builder: add validation rule
    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    /// Builder: add description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: carried on the record but ignored for change detection
    pub fn untracked(mut self) -> Self {
        self.tracked = false;
        self
    }

    pub fn is_required(&self) -> bool {
        self.rules.contains(&ValidationRule::Required)
    }

    pub fn is_positive(&self) -> bool {
        self.rules.contains(&ValidationRule::Positive)
    }

    pub fn is_non_empty(&self) -> bool {
        self.rules.contains(&ValidationRule::NonEmpty)
    }
}

// ============================================================================
// VIOLATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    Missing,
    Empty,
    NotPositive(f64),
    NotFinite,
    WrongType {
        expected: AttributeType,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeViolation {
    pub attribute: String,
    pub kind: ViolationKind,
}

impl fmt::Display for AttributeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => {
                write!(f, "required attribute '{}' is missing", self.attribute)
            }
            ViolationKind::Empty => write!(f, "attribute '{}' is empty", self.attribute),
            ViolationKind::NotPositive(v) => {
                write!(f, "attribute '{}' must be > 0, got {}", self.attribute, v)
            }
            ViolationKind::NotFinite => {
                write!(f, "attribute '{}' is not a finite number", self.attribute)
            }
            ViolationKind::WrongType { expected, found } => write!(
                f,
                "attribute '{}' expected {}, got {}",
                self.attribute,
                expected.as_str(),
                found
            ),
        }
    }
}

// ============================================================================
// ATTRIBUTE SET
// ============================================================================

/// The declared attributes of one dimension, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet {
    definitions: Vec<AttributeDefinition>,
}

impl AttributeSet {
    pub fn new(definitions: Vec<AttributeDefinition>) -> Self {
        AttributeSet { definitions }
    }

    /// Product catalog attributes (the default dimension)
    pub fn product_catalog() -> Self {
        use AttributeType::{Number, Text};

        AttributeSet::new(vec![
            AttributeDefinition::new("title", Text)
                .with_validation(ValidationRule::Required)
                .with_validation(ValidationRule::NonEmpty)
                .with_description("Product title as listed"),
            AttributeDefinition::new("price", Number)
                .with_validation(ValidationRule::Required)
                .with_validation(ValidationRule::Positive)
                .with_description("List price in `currency`"),
            AttributeDefinition::new("availability", Text),
            AttributeDefinition::new("brand", Text),
            AttributeDefinition::new("currency", Text),
            AttributeDefinition::new("description", Text),
            AttributeDefinition::new("url", Text),
            AttributeDefinition::new("images", Text),
            AttributeDefinition::new("sku", Number),
            AttributeDefinition::new("gtin13", Number),
            // Extract bookkeeping, changes on every scrape
            AttributeDefinition::new("index", Number).untracked(),
            AttributeDefinition::new("uniq_id", Text).untracked(),
            AttributeDefinition::new("scraped_at", Text).untracked(),
            AttributeDefinition::new("created_at", Text).untracked(),
            AttributeDefinition::new("updated_at", Text).untracked(),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&AttributeDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn definitions(&self) -> &[AttributeDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn tracked(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.definitions.iter().filter(|d| d.tracked)
    }

    pub fn required(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.definitions.iter().filter(|d| d.is_required())
    }

    pub fn positive(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.definitions.iter().filter(|d| d.is_positive())
    }

    /// Names declared more than once (config sanity check)
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut dupes = BTreeSet::new();
        for def in &self.definitions {
            if !seen.insert(def.name.as_str()) {
                dupes.insert(def.name.clone());
            }
        }
        dupes.into_iter().collect()
    }

    /// Field-set comparison over tracked attributes only.
    pub fn tracked_equal(&self, a: &Attributes, b: &Attributes) -> bool {
        self.tracked()
            .all(|def| lookup(a, &def.name) == lookup(b, &def.name))
    }

    /// Tracked attributes whose value differs between `a` and `b`
    pub fn changed_fields(&self, a: &Attributes, b: &Attributes) -> Vec<String> {
        self.tracked()
            .filter(|def| lookup(a, &def.name) != lookup(b, &def.name))
            .map(|def| def.name.clone())
            .collect()
    }

    /// Check a row's attributes against every declared rule.
    ///
    /// Undeclared attributes are only checked for finiteness.
    pub fn validate(&self, attributes: &Attributes) -> Vec<AttributeViolation> {
        let mut violations = Vec::new();

        for def in &self.definitions {
            let value = match lookup(attributes, &def.name) {
                Some(v) => v,
                None => {
                    if def.is_required() {
                        violations.push(AttributeViolation {
                            attribute: def.name.clone(),
                            kind: ViolationKind::Missing,
                        });
                    }
                    continue;
                }
            };

            if !value.matches_type(def.type_) {
                violations.push(AttributeViolation {
                    attribute: def.name.clone(),
                    kind: ViolationKind::WrongType {
                        expected: def.type_,
                        found: value.type_name(),
                    },
                });
                continue;
            }

            if let AttributeValue::Number(n) = value {
                if !n.is_finite() {
                    violations.push(AttributeViolation {
                        attribute: def.name.clone(),
                        kind: ViolationKind::NotFinite,
                    });
                    continue;
                }
                if def.is_positive() && *n <= 0.0 {
                    violations.push(AttributeViolation {
                        attribute: def.name.clone(),
                        kind: ViolationKind::NotPositive(*n),
                    });
                }
            }

            if let AttributeValue::Text(s) = value {
                if def.is_non_empty() && s.trim().is_empty() {
                    violations.push(AttributeViolation {
                        attribute: def.name.clone(),
                        kind: ViolationKind::Empty,
                    });
                }
            }
        }

        for (name, value) in attributes {
            if self.get(name).is_some() {
                continue;
            }
            if let AttributeValue::Number(n) = value {
                if !n.is_finite() {
                    violations.push(AttributeViolation {
                        attribute: name.clone(),
                        kind: ViolationKind::NotFinite,
                    });
                }
            }
        }

        violations
    }

    /// True when the required attribute is missing or null
    pub fn is_missing(&self, attributes: &Attributes, name: &str) -> bool {
        lookup(attributes, name).is_none()
    }

    /// Value of a positive-rule attribute if it is a number > 0
    pub fn positive_value(&self, attributes: &Attributes, name: &str) -> Option<f64> {
        lookup(attributes, name)
            .and_then(AttributeValue::as_f64)
            .filter(|n| n.is_finite() && *n > 0.0)
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        Self::product_catalog()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, AttributeValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_product_catalog_definitions() {
        let set = AttributeSet::product_catalog();

        assert!(set.get("price").unwrap().is_positive());
        assert!(set.get("title").unwrap().is_required());
        assert!(!set.get("scraped_at").unwrap().tracked);
        assert_eq!(set.required().count(), 2);
        assert!(set.duplicate_names().is_empty());
    }

    #[test]
    fn test_tracked_equal_ignores_untracked_fields() {
        let set = AttributeSet::product_catalog();
        let a = attrs(&[
            ("title", "Mug".into()),
            ("price", 10.0.into()),
            ("scraped_at", "2025-01-01".into()),
        ]);
        let b = attrs(&[
            ("title", "Mug".into()),
            ("price", 10.0.into()),
            ("scraped_at", "2025-01-02".into()),
        ]);

        assert!(set.tracked_equal(&a, &b));
        assert!(set.changed_fields(&a, &b).is_empty());
    }

    #[test]
    fn test_missing_and_null_compare_equal() {
        let set = AttributeSet::product_catalog();
        let a = attrs(&[("title", "Mug".into()), ("brand", AttributeValue::Null)]);
        let b = attrs(&[("title", "Mug".into())]);

        assert!(set.tracked_equal(&a, &b));
    }

    #[test]
    fn test_changed_fields_lists_tracked_differences() {
        let set = AttributeSet::product_catalog();
        let a = attrs(&[("title", "Mug".into()), ("price", 10.0.into())]);
        let b = attrs(&[("title", "Updated - Mug".into()), ("price", 13.0.into())]);

        assert_eq!(set.changed_fields(&a, &b), vec!["title", "price"]);
    }

    #[test]
    fn test_validate_reports_each_rule() {
        let set = AttributeSet::product_catalog();

        let missing = set.validate(&attrs(&[("price", 5.0.into())]));
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].kind, ViolationKind::Missing);
        assert_eq!(missing[0].attribute, "title");

        let zero = set.validate(&attrs(&[("title", "Mug".into()), ("price", 0.0.into())]));
        assert_eq!(zero[0].kind, ViolationKind::NotPositive(0.0));

        let empty = set.validate(&attrs(&[("title", "  ".into()), ("price", 1.0.into())]));
        assert_eq!(empty[0].kind, ViolationKind::Empty);

        let wrong = set.validate(&attrs(&[("title", "Mug".into()), ("price", "cheap".into())]));
        assert!(matches!(wrong[0].kind, ViolationKind::WrongType { .. }));
    }

    #[test]
    fn test_validate_rejects_non_finite_numbers() {
        let set = AttributeSet::product_catalog();
        let row = attrs(&[
            ("title", "Mug".into()),
            ("price", f64::NAN.into()),
            ("weight", f64::INFINITY.into()),
        ]);

        let violations = set.validate(&row);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.kind == ViolationKind::NotFinite));
    }

    #[test]
    fn test_attribute_value_json_roundtrip_shapes() {
        let value: AttributeValue = serde_json::from_str("12").unwrap();
        assert_eq!(value, AttributeValue::Number(12.0));

        let value: AttributeValue = serde_json::from_str("null").unwrap();
        assert!(value.is_null());

        let raw = r#"[{"name": "price", "type": "number", "rules": ["required", "positive"]}]"#;
        let set: AttributeSet = serde_json::from_str(raw).unwrap();
        assert!(set.get("price").unwrap().tracked);
        assert!(set.get("price").unwrap().is_positive());
    }
}
