//! Queries, update specs, and the matcher seam.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{deep_get, deep_set, Document, JsonMap, ID_FIELD};

/// A conjunctive filter over document fields.
///
/// Deliberately small: equality and set membership on dotted paths, which
/// is what the store itself needs. Richer engines plug in through
/// [`QueryMatcher`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq { path: String, value: Value },
    In { path: String, values: Vec<Value> },
}

impl Query {
    /// Matches every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches the document whose `_id` equals `id`.
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::field(ID_FIELD, Value::String(id.into()))
    }

    /// Equality on a dotted path.
    #[must_use]
    pub fn field(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and_field(path, value)
    }

    /// Set membership on a dotted path.
    #[must_use]
    pub fn field_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::all().and_field_in(path, values)
    }

    /// Adds another equality condition.
    #[must_use]
    pub fn and_field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    /// Adds another membership condition.
    #[must_use]
    pub fn and_field_in(mut self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In {
            path: path.into(),
            values,
        });
        self
    }

    /// True when no conditions are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Fields to assign during an update. Unnamed paths are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    assignments: Vec<(String, Value)>,
}

impl UpdateSpec {
    /// Starts a spec assigning `value` at a dotted path.
    #[must_use]
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and_set(path, value)
    }

    /// Adds another assignment.
    #[must_use]
    pub fn and_set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((path.into(), value.into()));
        self
    }

    /// True when nothing would be assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Applies the assignments to a body.
    pub(crate) fn apply(&self, body: &mut JsonMap) {
        for (path, value) in &self.assignments {
            deep_set(body, path, value.clone());
        }
    }

    /// Body built from the assignments alone; what an upsert inserts.
    pub(crate) fn to_body(&self) -> JsonMap {
        let mut body = JsonMap::new();
        self.apply(&mut body);
        body
    }
}

/// Sort direction over one dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub(crate) path: String,
    pub(crate) descending: bool,
}

impl SortOrder {
    /// Ascending by a dotted path.
    #[must_use]
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            descending: false,
        }
    }

    /// Descending by a dotted path.
    #[must_use]
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            descending: true,
        }
    }
}

/// The query-evaluation seam.
///
/// The store hands a matcher one cached document and a [`Query`]; skip,
/// limit, sort, and projection are applied by the store on top of the
/// matcher's verdicts.
pub trait QueryMatcher: Send + Sync + std::fmt::Debug {
    /// True when `doc` satisfies `query`.
    fn matches(&self, doc: &Document, query: &Query) -> bool;
}

/// Built-in matcher: conjunctive equality and membership on dotted paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMatcher;

impl QueryMatcher for DefaultMatcher {
    fn matches(&self, doc: &Document, query: &Query) -> bool {
        query.conditions.iter().all(|condition| match condition {
            Condition::Eq { path, value } => doc.field(path) == Some(value),
            Condition::In { path, values } => doc
                .field(path)
                .map(|found| values.contains(found))
                .unwrap_or(false),
        })
    }
}

/// Total order over JSON values for sorting: nulls, then booleans,
/// numbers, strings, and finally composites by kind.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Compares two bodies along a sort path; missing fields sort first.
pub(crate) fn compare_bodies(a: &JsonMap, b: &JsonMap, order: &SortOrder) -> Ordering {
    let left = deep_get(a, &order.path).unwrap_or(&Value::Null);
    let right = deep_get(b, &order.path).unwrap_or(&Value::Null);
    let ordering = compare_values(left, right);
    if order.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => Document::new("templates", map),
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn equality_and_membership() {
        let matcher = DefaultMatcher;
        let d = doc(json!({"name": "a", "engine": {"kind": "fast"}}));

        assert!(matcher.matches(&d, &Query::all()));
        assert!(matcher.matches(&d, &Query::field("name", "a")));
        assert!(!matcher.matches(&d, &Query::field("name", "b")));
        assert!(matcher.matches(&d, &Query::field("engine.kind", "fast")));
        assert!(matcher.matches(
            &d,
            &Query::field_in("name", vec![json!("x"), json!("a")])
        ));
        assert!(!matcher.matches(&d, &Query::field_in("missing", vec![json!("a")])));
        assert!(!matcher.matches(
            &d,
            &Query::field("name", "a").and_field("engine.kind", "slow")
        ));
    }

    #[test]
    fn by_id_matches_the_id_field() {
        let matcher = DefaultMatcher;
        let d = doc(json!({"_id": "abc", "name": "a"}));
        assert!(matcher.matches(&d, &Query::by_id("abc")));
        assert!(!matcher.matches(&d, &Query::by_id("def")));
    }

    #[test]
    fn update_spec_applies_dotted_paths() {
        let spec = UpdateSpec::set("name", "b").and_set("engine.kind", "slow");
        let mut body = match json!({"name": "a", "keep": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        spec.apply(&mut body);
        assert_eq!(body["name"], json!("b"));
        assert_eq!(body["keep"], json!(1));
        assert_eq!(body["engine"], json!({"kind": "slow"}));

        let fresh = spec.to_body();
        assert_eq!(fresh["name"], json!("b"));
    }

    #[test]
    fn value_ordering() {
        assert_eq!(compare_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare_values(&json!("a"), &json!("b")), Ordering::Less);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(true), &json!("x")), Ordering::Less);
    }
}
