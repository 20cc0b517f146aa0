//! Find and update options.

use crate::document::Document;
use crate::selector::compare_values;
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One component of a sort order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field to sort on.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

/// Options for `find` and `count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort keys, most significant first. Empty means store order.
    pub sort: Vec<SortKey>,
    /// Number of leading results to skip.
    pub skip: usize,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Fields to return (plus `_id`). `None` returns whole documents.
    pub fields: Option<Vec<String>>,
}

impl FindOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    /// Sets the number of results to skip.
    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Sets the maximum number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts the returned fields.
    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Compares two documents under the sort keys.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for key in &self.sort {
            let left = a.get(&key.field).unwrap_or(&Value::Null);
            let right = b.get(&key.field).unwrap_or(&Value::Null);
            let ord = match key.order {
                SortOrder::Ascending => compare_values(left, right),
                SortOrder::Descending => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Applies skip, limit and projection to already-sorted documents.
    pub fn window(&self, docs: Vec<Document>) -> Vec<Document> {
        let limit = self.limit.unwrap_or(usize::MAX);
        docs.into_iter()
            .skip(self.skip)
            .take(limit)
            .map(|doc| match &self.fields {
                Some(fields) => doc.project(fields),
                None => doc,
            })
            .collect()
    }
}

/// Options for `update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a document when nothing matches.
    pub upsert: bool,
    /// Update every matching document instead of the first.
    pub multi: bool,
}

impl UpdateOptions {
    /// Creates default options (single document, no upsert).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to upsert.
    #[must_use]
    pub const fn upsert(mut self, value: bool) -> Self {
        self.upsert = value;
        self
    }

    /// Sets whether to update every match.
    #[must_use]
    pub const fn multi(mut self, value: bool) -> Self {
        self.multi = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[test]
    fn compare_multi_key() {
        let opts = FindOptions::new()
            .sort_by("a", SortOrder::Ascending)
            .sort_by("b", SortOrder::Descending);
        let x = doc(json!({"a": 1, "b": 1}));
        let y = doc(json!({"a": 1, "b": 2}));
        let z = doc(json!({"a": 2, "b": 0}));
        assert_eq!(opts.compare(&x, &y), Ordering::Greater);
        assert_eq!(opts.compare(&y, &z), Ordering::Less);
        assert_eq!(opts.compare(&x, &x), Ordering::Equal);
    }

    #[test]
    fn window_skips_limits_and_projects() {
        let docs: Vec<_> = (0..5)
            .map(|i| doc(json!({"_id": format!("d{i}"), "x": i, "y": i * 2})))
            .collect();
        let opts = FindOptions::new().skip(1).limit(2).fields(["x"]);
        let out = opts.window(docs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].clone().into_value(), json!({"_id": "d1", "x": 1}));
        assert_eq!(out[1].clone().into_value(), json!({"_id": "d2", "x": 2}));
    }

    #[test]
    fn update_options_builder() {
        let opts = UpdateOptions::new().upsert(true).multi(true);
        assert!(opts.upsert);
        assert!(opts.multi);
        assert_eq!(UpdateOptions::default(), UpdateOptions::new());
    }
}
