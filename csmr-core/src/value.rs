//! Typed values, the variable schema and the per-instance context.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a context variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
    Any,
}

impl ValueType {
    /// Returns the type of a concrete value. `null` has no type of its own.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Any,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(n) if n.is_i64() => ValueType::Int,
            Value::Number(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::List,
            Value::Object(_) => ValueType::Map,
        }
    }

    /// Returns true if a variable of this type may hold the value.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Bool => value.is_boolean(),
            ValueType::Int => value.is_i64(),
            ValueType::Float => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::List => value.is_array(),
            ValueType::Map => value.is_object(),
        }
    }

    /// Returns true if an expression statically typed `other` may be stored in
    /// a variable of this type.
    pub fn is_assignable_from(&self, other: ValueType) -> bool {
        *self == ValueType::Any
            || other == ValueType::Any
            || *self == other
            || (*self == ValueType::Float && other == ValueType::Int)
    }

    /// Value a variable of this type starts with when no initial value is given.
    pub fn default_value(&self) -> Value {
        match self {
            ValueType::Bool => Value::Bool(false),
            ValueType::Int => Value::from(0i64),
            ValueType::Float => Value::from(0.0f64),
            ValueType::String => Value::String(String::new()),
            ValueType::List => Value::Array(Vec::new()),
            ValueType::Map => Value::Object(Default::default()),
            ValueType::Any => Value::Null,
        }
    }

    /// Converts a value into the canonical representation for this type.
    ///
    /// Integers stored into float variables become floats so that checkpoints
    /// round-trip with the same representation.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, &value) {
            (ValueType::Float, Value::Number(n)) if n.is_i64() => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(value),
            _ => value,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Map => "map",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

/// Declared variables and their types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSchema {
    types: BTreeMap<String, ValueType>,
    initial: BTreeMap<String, Value>,
}

impl VariableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a variable. The initial value must already be accepted by the type.
    pub fn declare(&mut self, name: impl Into<String>, ty: ValueType, initial: Value) {
        let name = name.into();
        self.initial.insert(name.clone(), ty.coerce(initial));
        self.types.insert(name, ty);
    }

    pub fn type_of(&self, name: &str) -> Option<ValueType> {
        self.types.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Builds a fresh context holding every variable's initial value.
    pub fn initial_context(&self) -> Context {
        Context {
            values: self.initial.clone(),
        }
    }
}

/// Variable values of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Stores a value without type checks. Used when restoring checkpoints.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the context as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Numeric view of a JSON number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Num::Int(i)),
                None => n.as_f64().map(Num::Float),
            },
            _ => None,
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub(crate) fn compare(self, other: Num) -> Option<Ordering> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

/// Structural equality where `1` and `1.0` are equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => Num::from_value(a)
            .zip(Num::from_value(b))
            .map(|(x, y)| x.compare(y) == Some(Ordering::Equal))
            .unwrap_or(false),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| values_equal(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_accepts() {
        assert!(ValueType::Int.accepts(&json!(3)));
        assert!(!ValueType::Int.accepts(&json!(3.5)));
        assert!(ValueType::Float.accepts(&json!(3)));
        assert!(ValueType::Float.accepts(&json!(3.5)));
        assert!(!ValueType::String.accepts(&json!(null)));
        assert!(ValueType::Any.accepts(&json!(null)));
        assert!(ValueType::Map.accepts(&json!({"a": 1})));
    }

    #[test]
    fn test_float_coercion() {
        let v = ValueType::Float.coerce(json!(2));
        assert!(v.is_f64());
        assert_eq!(v.as_f64(), Some(2.0));

        let v = ValueType::Int.coerce(json!(2));
        assert!(v.is_i64());
    }

    #[test]
    fn test_assignable() {
        assert!(ValueType::Float.is_assignable_from(ValueType::Int));
        assert!(!ValueType::Int.is_assignable_from(ValueType::Float));
        assert!(ValueType::Int.is_assignable_from(ValueType::Any));
        assert!(!ValueType::Bool.is_assignable_from(ValueType::String));
    }

    #[test]
    fn test_values_equal_numeric() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!(2)));
        assert!(values_equal(&json!([1, {"a": 2}]), &json!([1.0, {"a": 2}])));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn test_initial_context() {
        let mut schema = VariableSchema::new();
        schema.declare("count", ValueType::Int, json!(0));
        schema.declare("ratio", ValueType::Float, json!(1));
        let ctx = schema.initial_context();
        assert_eq!(ctx.get("count"), Some(&json!(0)));
        assert_eq!(ctx.get("ratio").and_then(Value::as_f64), Some(1.0));
        assert_eq!(ctx.to_value(), json!({"count": 0, "ratio": 1.0}));
    }
}
