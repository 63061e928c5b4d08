use serde::{Deserialize, Serialize};

/// Type tag carried by every parameter on the host bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    Float,
    Int,
    Bool,
}

/// Typed value of a parameter update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Float(f32),
    Int(i32),
    Bool(bool),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterType {
        match self {
            Self::Float(_) => ParameterType::Float,
            Self::Int(_) => ParameterType::Int,
            Self::Bool(_) => ParameterType::Bool,
        }
    }

    /// Numeric view used as an intensity signal. Non-finite floats read as 0.
    pub fn as_f32(&self) -> f32 {
        match *self {
            Self::Float(value) if value.is_finite() => value,
            Self::Float(_) => 0.0,
            Self::Int(value) => value as f32,
            Self::Bool(value) => {
                if value {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Inbound event delivered by the host parameter bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    pub name: String,
    pub value: ParameterValue,
}

impl ParameterUpdate {
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self::new(name, ParameterValue::Float(value))
    }

    pub fn int(name: impl Into<String>, value: i32) -> Self {
        Self::new(name, ParameterValue::Int(value))
    }

    pub fn bool(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, ParameterValue::Bool(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    GreaterThan,
    LessThan,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
    EqualTo,
    NotEqualTo,
}

/// Outcome of querying a watch against an update, in the shape the host
/// query abstraction reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub is_valid: bool,
    pub just_became_valid: bool,
    pub just_became_invalid: bool,
}

/// One `(parameter name, comparison, threshold)` condition of a trigger.
///
/// The threshold's variant fixes the parameter type the watch accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterWatch {
    pub name: String,
    pub comparison: Comparison,
    pub threshold: ParameterValue,
}

impl ParameterWatch {
    pub fn new(name: impl Into<String>, comparison: Comparison, threshold: ParameterValue) -> Self {
        Self {
            name: name.into(),
            comparison,
            threshold,
        }
    }

    pub fn matches(&self, update: &ParameterUpdate) -> bool {
        self.name == update.name
    }

    /// Compares `value` against the stored threshold directly.
    ///
    /// A value whose type differs from the threshold type never satisfies the
    /// watch. Bools only support equality comparisons.
    pub fn is_satisfied_by(&self, value: &ParameterValue) -> bool {
        match (*value, self.threshold) {
            (ParameterValue::Float(value), ParameterValue::Float(threshold)) => {
                compare_float(value, threshold, self.comparison)
            }
            (ParameterValue::Int(value), ParameterValue::Int(threshold)) => {
                compare_ord(value, threshold, self.comparison)
            }
            (ParameterValue::Bool(value), ParameterValue::Bool(threshold)) => {
                match self.comparison {
                    Comparison::EqualTo => value == threshold,
                    Comparison::NotEqualTo => value != threshold,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Evaluates the watch the way the host query abstraction does, reporting
    /// edge flags relative to `previous` (the last result for this key).
    pub fn query(&self, update: &ParameterUpdate, previous: Option<bool>) -> QueryResult {
        let is_valid = self.is_satisfied_by(&update.value);
        let was_valid = previous.unwrap_or(false);
        QueryResult {
            is_valid,
            just_became_valid: is_valid && !was_valid,
            just_became_invalid: !is_valid && was_valid,
        }
    }
}

fn compare_float(value: f32, threshold: f32, comparison: Comparison) -> bool {
    match comparison {
        Comparison::GreaterThan => value > threshold,
        Comparison::LessThan => value < threshold,
        Comparison::GreaterThanOrEqualTo => value >= threshold,
        Comparison::LessThanOrEqualTo => value <= threshold,
        Comparison::EqualTo => (value - threshold).abs() < f32::EPSILON,
        Comparison::NotEqualTo => (value - threshold).abs() >= f32::EPSILON,
    }
}

fn compare_ord<T: PartialOrd>(value: T, threshold: T, comparison: Comparison) -> bool {
    match comparison {
        Comparison::GreaterThan => value > threshold,
        Comparison::LessThan => value < threshold,
        Comparison::GreaterThanOrEqualTo => value >= threshold,
        Comparison::LessThanOrEqualTo => value <= threshold,
        Comparison::EqualTo => value == threshold,
        Comparison::NotEqualTo => value != threshold,
    }
}
