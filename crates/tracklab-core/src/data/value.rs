//! Loggable values.
//!
//! `LogData` is an insertion-ordered mapping from keys to `Value`s. Nested
//! mappings are flattened with `.` when logged, so `{"c": {"d": 2}}` becomes
//! the key `c.d`.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::media::{Audio, Image, Text};

pub const NAN_SENTINEL: &str = "NaN";
pub const INF_SENTINEL: &str = "INF";
pub const NEG_INF_SENTINEL: &str = "-INF";

/// A scalar line-chart value. Non-finite floats become sentinels so they
/// survive any numeric encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineValue {
    Number(f64),
    NaN,
    Inf,
    NegInf,
}

impl LineValue {
    pub fn from_f64(v: f64) -> Self {
        if v.is_nan() {
            LineValue::NaN
        } else if v == f64::INFINITY {
            LineValue::Inf
        } else if v == f64::NEG_INFINITY {
            LineValue::NegInf
        } else {
            LineValue::Number(v)
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            LineValue::Number(v) => *v,
            LineValue::NaN => f64::NAN,
            LineValue::Inf => f64::INFINITY,
            LineValue::NegInf => f64::NEG_INFINITY,
        }
    }

    /// Finite value, or `None` for sentinels.
    pub fn finite(&self) -> Option<f64> {
        match self {
            LineValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn sentinel(&self) -> Option<&'static str> {
        match self {
            LineValue::Number(_) => None,
            LineValue::NaN => Some(NAN_SENTINEL),
            LineValue::Inf => Some(INF_SENTINEL),
            LineValue::NegInf => Some(NEG_INF_SENTINEL),
        }
    }

    pub fn from_sentinel(s: &str) -> Option<Self> {
        match s {
            NAN_SENTINEL => Some(LineValue::NaN),
            INF_SENTINEL => Some(LineValue::Inf),
            NEG_INF_SENTINEL => Some(LineValue::NegInf),
            _ => None,
        }
    }
}

impl Serialize for LineValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.sentinel() {
            Some(s) => serializer.serialize_str(s),
            None => serializer.serialize_f64(self.as_f64()),
        }
    }
}

impl<'de> Deserialize<'de> for LineValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Sentinel(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(LineValue::from_f64(v)),
            Raw::Sentinel(s) => LineValue::from_sentinel(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown line sentinel `{s}`"))),
        }
    }
}

/// Explicit scalar wrapper. A bare number logs exactly like `Line::new(n)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line(f64);

impl Line {
    pub fn new(value: impl Into<f64>) -> Self {
        Line(value.into())
    }

    pub fn value(&self) -> LineValue {
        LineValue::from_f64(self.0)
    }
}

/// Anything a caller can hand to `Run::log`.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
    Line(Line),
    Text(Text),
    Audio(Audio),
    Image(Image),
    List(Vec<Value>),
    Map(LogData),
}

impl Value {
    /// Short type descriptor used as `got` in metric errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) | Value::Line(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Null => "null",
            Value::Text(_) => "Text",
            Value::Audio(_) => "Audio",
            Value::Image(_) => "Image",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map(Value::Int).unwrap_or(Value::Float(v as f64))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::from(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Line> for Value {
    fn from(v: Line) -> Self {
        Value::Line(v)
    }
}

impl From<Text> for Value {
    fn from(v: Text) -> Self {
        Value::Text(v)
    }
}

impl From<Audio> for Value {
    fn from(v: Audio) -> Self {
        Value::Audio(v)
    }
}

impl From<Image> for Value {
    fn from(v: Image) -> Self {
        Value::Image(v)
    }
}

impl From<LogData> for Value {
    fn from(v: LogData) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Map(map.into_iter().collect()),
        }
    }
}

/// Insertion-ordered mapping of keys to values, the argument of `Run::log`.
#[derive(Debug, Clone, Default)]
pub struct LogData(IndexMap<String, Value>);

impl LogData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for LogData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        LogData(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for LogData {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<Value>> From<Vec<(K, V)>> for LogData {
    fn from(pairs: Vec<(K, V)>) -> Self {
        pairs.into_iter().collect()
    }
}
