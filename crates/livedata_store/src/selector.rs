//! Document selectors.
//!
//! A selector is a JSON object mapping field names to either a literal
//! (equality) or an operator object such as `{"$gt": 10}`. This is the
//! minimal vocabulary the in-memory store understands; richer query
//! languages belong to the store implementation.

use crate::document::{Document, ID_FIELD};
use crate::error::{StoreError, StoreResult};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A field-by-field document selector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector(Map<String, Value>);

impl Selector {
    /// A selector matching every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A selector matching a single primary key.
    pub fn by_id(id: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Self(map)
    }

    /// Builds a selector from a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Returns the condition for a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns the underlying condition map.
    pub fn conditions(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns true if the selector has no conditions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tests a document against every condition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidSelector`] for unknown operators.
    pub fn matches(&self, doc: &Document) -> StoreResult<bool> {
        for (field, condition) in &self.0 {
            let value = doc.get(field).unwrap_or(&Value::Null);
            if !condition_matches(value, condition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns the literal equality conditions, used to seed upserts.
    pub fn equality_fields(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(_, condition)| !is_operator_object(condition))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }
}

impl TryFrom<Value> for Selector {
    type Error = StoreError;

    fn try_from(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::invalid_selector(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn condition_matches(value: &Value, condition: &Value) -> StoreResult<bool> {
    let Value::Object(ops) = condition else {
        return Ok(values_equal(value, condition));
    };
    if !is_operator_object(condition) {
        return Ok(values_equal(value, condition));
    }

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => values_equal(value, operand),
            "$ne" => !values_equal(value, operand),
            "$gt" => comparable(value, operand) && compare_values(value, operand).is_gt(),
            "$gte" => comparable(value, operand) && compare_values(value, operand).is_ge(),
            "$lt" => comparable(value, operand) && compare_values(value, operand).is_lt(),
            "$lte" => comparable(value, operand) && compare_values(value, operand).is_le(),
            "$in" => match operand {
                Value::Array(items) => items.iter().any(|item| values_equal(value, item)),
                _ => return Err(StoreError::invalid_selector("$in requires an array")),
            },
            other => {
                return Err(StoreError::invalid_selector(format!(
                    "unsupported operator {other}"
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Range operators only compare values of the same kind.
fn comparable(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
///
/// null < bool < number < string < array < object. Numbers compare by
/// numeric value regardless of integer/float representation.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// JavaScript-style truthiness, used for the `fail` marker and `_id` guards.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
