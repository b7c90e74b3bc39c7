//! Stream attribute descriptors and the declarative rules used to check and
//! derive them while a stream graph is being composed.
//!
//! Validation runs once per composition call, never per event. An operator
//! describes what it accepts with a [`Specification`] and receives a freshly
//! derived [`Attributes`] value for its output; the upstream descriptor is
//! never modified.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{KineticError, Result, ValidationError};

pub const FORMAT: &str = "format";
pub const SIZE: &str = "size";
pub const SAMPLERATE: &str = "samplerate";
pub const TYPE: &str = "type";

/// Shape of the values carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Scalar,
    Vector,
    String,
    Object,
    Any,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Scalar => "scalar",
            Format::Vector => "vector",
            Format::String => "string",
            Format::Object => "object",
            Format::Any => "any",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scalar" => Some(Format::Scalar),
            "vector" => Some(Format::Vector),
            "string" => Some(Format::String),
            "object" => Some(Format::Object),
            "any" => Some(Format::Any),
            _ => None,
        }
    }
}

impl From<Format> for Value {
    fn from(value: Format) -> Self {
        Value::String(value.as_str().to_string())
    }
}

/// Number of components per event, or `Variable` when it is only known at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Fixed(u64),
    Variable,
}

impl Size {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) if text == "variable" => Some(Size::Variable),
            other => other.as_u64().filter(|n| *n > 0).map(Size::Fixed),
        }
    }
}

impl From<Size> for Value {
    fn from(value: Size) -> Self {
        match value {
            Size::Fixed(n) => Value::from(n),
            Size::Variable => Value::String("variable".to_string()),
        }
    }
}

/// Immutable metadata attached to a stream.
///
/// Properties keep their insertion order. Construction goes through the
/// consuming [`Attributes::with`] builder; once a descriptor is shared by a
/// stream there is no way to change it in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes {
    properties: Map<String, Value>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar() -> Self {
        Self::new().with(FORMAT, Format::Scalar).with(SIZE, Size::Fixed(1))
    }

    pub fn vector(size: Size) -> Self {
        Self::new().with(FORMAT, Format::Vector).with(SIZE, size)
    }

    pub fn any() -> Self {
        Self::new().with(FORMAT, Format::Any)
    }

    /// Builds a descriptor from a JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(properties) => Ok(Self { properties }),
            other => Err(KineticError::msg(format!(
                "attribute descriptor must be an object, found `{other}`"
            ))),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn format(&self) -> Option<Format> {
        self.get(FORMAT).and_then(Value::as_str).and_then(Format::parse)
    }

    pub fn size(&self) -> Option<Size> {
        self.get(SIZE).and_then(Size::from_value)
    }

    pub fn samplerate(&self) -> Option<f64> {
        self.get(SAMPLERATE)
            .and_then(Value::as_f64)
            .filter(|rate| *rate > 0.0)
    }

    pub fn type_tag(&self) -> Option<&str> {
        self.get(TYPE).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Acceptance test applied to a single property.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// The value must be one of the listed values.
    OneOf(Vec<Value>),
    /// The value must be a number no smaller than the bound. A `variable`
    /// size passes since it is only known at runtime.
    Min(f64),
}

impl Check {
    fn reject_reason(&self, value: &Value) -> Option<String> {
        match self {
            Check::OneOf(allowed) => {
                if allowed.contains(value) {
                    None
                } else {
                    let listed: Vec<String> = allowed.iter().map(Value::to_string).collect();
                    Some(format!("is {value}, expected one of [{}]", listed.join(", ")))
                }
            }
            Check::Min(min) => match value {
                Value::String(text) if text == "variable" => None,
                other => match other.as_f64() {
                    Some(number) if number >= *min => None,
                    Some(number) => Some(format!("is {number}, expected at least {min}")),
                    None => Some(format!("is {other}, expected a number >= {min}")),
                },
            },
        }
    }
}

/// Derives an output property from the whole input descriptor.
pub type Transform = Arc<dyn Fn(&Attributes) -> Value + Send + Sync>;

/// Rule set for one property of a [`Specification`].
#[derive(Clone, Default)]
pub struct Rule {
    required: bool,
    check: Option<Check>,
    transform: Option<Transform>,
}

impl Rule {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn optional() -> Self {
        Self::default()
    }

    pub fn one_of<I, V>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.check = Some(Check::OneOf(allowed.into_iter().map(Into::into).collect()));
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.check = Some(Check::Min(min));
        self
    }

    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Attributes) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Shorthand for a transform that always yields `value`.
    pub fn derive(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.transform(move |_| value.clone())
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn check(&self) -> Option<&Check> {
        self.check.as_ref()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("required", &self.required)
            .field("check", &self.check)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Ordered, declarative description of what an operator accepts and how it
/// derives its output descriptor.
#[derive(Debug, Clone, Default)]
pub struct Specification {
    rules: Vec<(String, Rule)>,
}

impl Specification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, property: impl Into<String>, rule: Rule) -> Self {
        let property = property.into();
        match self.rules.iter_mut().find(|(name, _)| *name == property) {
            Some((_, existing)) => *existing = rule,
            None => self.rules.push((property, rule)),
        }
        self
    }

    /// Parses the JSON form `{ "format": { "required": true, "check": [..] },
    /// "size": { "check": { "min": 1 } } }`. Transforms cannot be expressed in
    /// JSON and have to be attached with [`Specification::rule`].
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(entries) = value else {
            return Err(KineticError::msg("specification must be a JSON object"));
        };

        let mut spec = Self::new();
        for (property, body) in entries {
            let Value::Object(body) = body else {
                return Err(KineticError::msg(format!(
                    "rule for `{property}` must be an object"
                )));
            };

            let mut rule = if body.get("required").and_then(Value::as_bool).unwrap_or(false) {
                Rule::required()
            } else {
                Rule::optional()
            };

            match body.get("check") {
                None | Some(Value::Null) => {}
                Some(Value::Array(allowed)) => rule = rule.one_of(allowed.iter().cloned()),
                Some(Value::Object(bounds)) => {
                    let min = bounds.get("min").and_then(Value::as_f64).ok_or_else(|| {
                        KineticError::msg(format!("check for `{property}` needs a numeric `min`"))
                    })?;
                    rule = rule.min(min);
                }
                Some(other) => {
                    return Err(KineticError::msg(format!(
                        "unsupported check `{other}` for `{property}`"
                    )))
                }
            }

            spec = spec.rule(property.clone(), rule);
        }

        Ok(spec)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Checks `input` against `spec` and derives the output descriptor.
///
/// Rules are visited in declaration order and the first failure is reported.
/// Transforms only run once every rule has passed, and each sees the full
/// input descriptor. Properties `spec` does not mention are
/// carried over unchanged.
pub fn validate(
    label: &str,
    spec: &Specification,
    input: &Attributes,
) -> std::result::Result<Attributes, ValidationError> {
    for (property, rule) in spec.iter() {
        match input.get(property) {
            None if rule.required => {
                return Err(ValidationError::new(label, property, "is required"));
            }
            None => {}
            Some(value) => {
                if let Some(reason) = rule.check.as_ref().and_then(|c| c.reject_reason(value)) {
                    return Err(ValidationError::new(label, property, reason));
                }
            }
        }
    }

    let mut output = input.clone();
    for (property, rule) in spec.iter() {
        if let Some(transform) = &rule.transform {
            output.properties.insert(property.to_string(), transform(input));
        }
    }

    Ok(output)
}
