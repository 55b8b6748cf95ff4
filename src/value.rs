//! Completion arguments and the resumption values they flatten into.
//!
//! Any asynchronous operation reports its result by calling a completion with
//! some positional arguments, some named arguments, both, or neither. The
//! suspended computation receives exactly one [`ResumeValue`], computed by a
//! fixed policy:
//!
//! | positional    | named       | value                         |
//! |---------------|-------------|-------------------------------|
//! | one or more   | one or more | `Pair(positional, named)`     |
//! | none          | one or more | `Mapping(named)`              |
//! | exactly one   | none        | `Single(v)`                   |
//! | more than one | none        | `Sequence(positional)`        |
//! | none          | none        | `Empty`                       |
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use yieldpoint::{CompletionArgs, ResumeValue};
//!
//! let value = ResumeValue::from(CompletionArgs::single(json!("xyzzy")));
//! assert_eq!(value, ResumeValue::Single(json!("xyzzy")));
//!
//! let value = ResumeValue::from(CompletionArgs::positional([json!(1), json!(2)]));
//! assert_eq!(value.into_value(), json!([1, 2]));
//! ```

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::Result;

/// Arguments a completion callback was invoked with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionArgs {
    positional: Vec<Value>,
    named: Map<String, Value>,
}

impl CompletionArgs {
    /// No arguments at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exactly one positional argument.
    pub fn single(value: impl Into<Value>) -> Self {
        Self::new().arg(value)
    }

    /// Positional arguments only, in order.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            named: Map::new(),
        }
    }

    /// Named arguments only.
    pub fn named(named: Map<String, Value>) -> Self {
        Self {
            positional: Vec::new(),
            named,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add (or replace) a named argument.
    pub fn named_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    pub fn positional_args(&self) -> &[Value] {
        &self.positional
    }

    pub fn named_args(&self) -> &Map<String, Value> {
        &self.named
    }

    /// Split into `(positional, named)`.
    pub fn into_parts(self) -> (Vec<Value>, Map<String, Value>) {
        (self.positional, self.named)
    }
}

/// The single value delivered back into a suspended computation.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeValue {
    /// The completion was invoked without arguments.
    Empty,
    /// Exactly one positional argument, unwrapped.
    Single(Value),
    /// Two or more positional arguments, in order.
    Sequence(Vec<Value>),
    /// Named arguments only.
    Mapping(Map<String, Value>),
    /// Both positional and named arguments.
    Pair(Vec<Value>, Map<String, Value>),
}

impl From<CompletionArgs> for ResumeValue {
    fn from(args: CompletionArgs) -> Self {
        let (mut positional, named) = args.into_parts();
        match (positional.len(), named.is_empty()) {
            (0, true) => ResumeValue::Empty,
            (0, false) => ResumeValue::Mapping(named),
            (1, true) => ResumeValue::Single(positional.remove(0)),
            (_, true) => ResumeValue::Sequence(positional),
            (_, false) => ResumeValue::Pair(positional, named),
        }
    }
}

impl ResumeValue {
    /// Whether this is the "no value" marker.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, ResumeValue::Empty)
    }

    /// The unwrapped value of a single-argument completion.
    pub fn into_single(self) -> Option<Value> {
        match self {
            ResumeValue::Single(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse into one JSON value.
    ///
    /// `Empty` becomes `null`, a pair becomes `[positional, named]`.
    pub fn into_value(self) -> Value {
        match self {
            ResumeValue::Empty => Value::Null,
            ResumeValue::Single(v) => v,
            ResumeValue::Sequence(vs) => Value::Array(vs),
            ResumeValue::Mapping(kv) => Value::Object(kv),
            ResumeValue::Pair(vs, kv) => Value::Array(vec![Value::Array(vs), Value::Object(kv)]),
        }
    }

    /// Deserialize the collapsed value into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.into_value())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_flatten_single_is_unwrapped() {
        let value = ResumeValue::from(CompletionArgs::single(json!({"k": [1, 2]})));
        assert_eq!(value, ResumeValue::Single(json!({"k": [1, 2]})));
    }

    #[test]
    fn test_flatten_single_array_stays_single() {
        // One positional argument that happens to be a list is still one value.
        let value = ResumeValue::from(CompletionArgs::single(json!([1, 2, 3])));
        assert_eq!(value, ResumeValue::Single(json!([1, 2, 3])));
    }

    #[test]
    fn test_flatten_many_positional() {
        let value = ResumeValue::from(CompletionArgs::positional([1, 2, 3]));
        assert_eq!(
            value,
            ResumeValue::Sequence(vec![json!(1), json!(2), json!(3)])
        );
    }

    #[test]
    fn test_flatten_named_only() {
        let value = ResumeValue::from(CompletionArgs::new().named_arg("a", 1));
        assert_eq!(value, ResumeValue::Mapping(map(json!({"a": 1}))));
    }

    #[test]
    fn test_flatten_both() {
        let value = ResumeValue::from(CompletionArgs::single(1).named_arg("a", 1));
        assert_eq!(
            value,
            ResumeValue::Pair(vec![json!(1)], map(json!({"a": 1})))
        );
    }

    #[test]
    fn test_flatten_none() {
        let value = ResumeValue::from(CompletionArgs::new());
        assert!(value.is_empty());
        assert_eq!(value.into_value(), Value::Null);
    }

    #[test]
    fn test_into_value_pair() {
        let value = ResumeValue::from(CompletionArgs::positional(["x", "y"]).named_arg("z", true));
        assert_eq!(value.into_value(), json!([["x", "y"], {"z": true}]));
    }

    #[test]
    fn test_decode_typed() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Point {
            x: i32,
            y: i32,
        }

        let value = ResumeValue::from(CompletionArgs::new().named_arg("x", 3).named_arg("y", 4));
        let point: Point = value.decode().unwrap();
        assert_eq!(point, Point { x: 3, y: 4 });
    }

    #[test]
    fn test_decode_mismatch_is_error() {
        let value = ResumeValue::from(CompletionArgs::single("nope"));
        let result: Result<u32> = value.decode();
        assert!(result.is_err());
    }

    #[test]
    fn test_into_single() {
        assert_eq!(
            ResumeValue::from(CompletionArgs::single(5)).into_single(),
            Some(json!(5))
        );
        assert_eq!(ResumeValue::Empty.into_single(), None);
    }
}
