//! Update modifiers.

use crate::document::{Document, ID_FIELD};
use crate::error::{StoreError, StoreResult};
use serde_json::{Map, Number, Value};

/// How an update rewrites matching documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Modifier {
    /// Operator form: `{"$set": {...}, "$inc": {...}, "$unset": {...}}`.
    Operators(Map<String, Value>),
    /// Replace the whole document, keeping its `_id`.
    Replace(Document),
}

impl Modifier {
    /// `{"$set": {field: value}}`.
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        Self::single("$set", field.into(), value)
    }

    /// `{"$inc": {field: amount}}`.
    pub fn inc(field: impl Into<String>, amount: impl Into<Number>) -> Self {
        Self::single("$inc", field.into(), Value::Number(amount.into()))
    }

    fn single(op: &str, field: String, value: Value) -> Self {
        let mut fields = Map::new();
        fields.insert(field, value);
        let mut ops = Map::new();
        ops.insert(op.to_string(), Value::Object(fields));
        Self::Operators(ops)
    }

    /// Applies the modifier to a document in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidModifier`] for unknown operators,
    /// non-numeric `$inc` targets, or attempts to change `_id`.
    pub fn apply(&self, doc: &mut Document) -> StoreResult<()> {
        match self {
            Modifier::Replace(replacement) => {
                let id = doc.get(ID_FIELD).cloned();
                if let (Some(old), Some(new)) = (&id, replacement.get(ID_FIELD)) {
                    if old != new {
                        return Err(StoreError::invalid_modifier("cannot change _id"));
                    }
                }
                let mut next = replacement.clone();
                if let Some(id) = id {
                    next.insert(ID_FIELD, id);
                }
                *doc = next;
                Ok(())
            }
            Modifier::Operators(ops) => {
                for (op, fields) in ops {
                    let Value::Object(fields) = fields else {
                        return Err(StoreError::invalid_modifier(format!(
                            "{op} requires an object"
                        )));
                    };
                    for (field, operand) in fields {
                        if field == ID_FIELD {
                            return Err(StoreError::invalid_modifier("cannot modify _id"));
                        }
                        apply_operator(doc, op, field, operand)?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn apply_operator(doc: &mut Document, op: &str, field: &str, operand: &Value) -> StoreResult<()> {
    match op {
        "$set" => {
            doc.insert(field, operand.clone());
        }
        "$unset" => {
            doc.remove(field);
        }
        "$inc" => {
            let Value::Number(amount) = operand else {
                return Err(StoreError::invalid_modifier("$inc requires a number"));
            };
            let next = match doc.get(field) {
                None | Some(Value::Null) => amount.clone(),
                Some(Value::Number(current)) => add_numbers(current, amount)?,
                Some(_) => {
                    return Err(StoreError::invalid_modifier(format!(
                        "cannot $inc non-numeric field {field}"
                    )))
                }
            };
            doc.insert(field, Value::Number(next));
        }
        other => {
            return Err(StoreError::invalid_modifier(format!(
                "unsupported operator {other}"
            )))
        }
    }
    Ok(())
}

fn add_numbers(a: &Number, b: &Number) -> StoreResult<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(sum.into());
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).ok_or_else(|| StoreError::invalid_modifier("$inc overflowed"))
}

impl TryFrom<serde_json::Value> for Modifier {
    type Error = StoreError;

    /// An object whose keys all start with `$` is an operator modifier;
    /// any other object is a replacement document.
    fn try_from(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
                Ok(Self::Operators(map))
            }
            Value::Object(map) => {
                if map.keys().any(|k| k.starts_with('$')) {
                    return Err(StoreError::invalid_modifier(
                        "cannot mix operators and fields",
                    ));
                }
                Ok(Self::Replace(Document::from(map)))
            }
            other => Err(StoreError::invalid_modifier(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}
