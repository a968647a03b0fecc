//! Value parser: flattens a `LogData` and classifies each leaf into a typed
//! payload, or explains why it cannot be logged.

use crate::models::ChartType;

use super::media::{Audio, Image, Text};
use super::value::{LineValue, LogData, Value};

/// Longest media list kept per metric; extra elements are dropped.
pub const MAX_LIST_LEN: usize = 108;

pub(crate) const MAX_KEY_LEN: usize = 255;

/// A leaf value that passed parsing.
#[derive(Debug, Clone)]
pub(crate) enum Parsed {
    Line(LineValue),
    Text(Vec<Text>),
    Audio(Vec<Audio>),
    Image(Vec<Image>),
}

impl Parsed {
    pub(crate) fn chart_type(&self) -> ChartType {
        match self {
            Parsed::Line(_) => ChartType::Line,
            Parsed::Text(_) => ChartType::Text,
            Parsed::Audio(_) => ChartType::Audio,
            Parsed::Image(_) => ChartType::Image,
        }
    }
}

/// Why a leaf could not be parsed. `expected` is `None` when the value gives
/// no hint, in which case the caller falls back to the column's type.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParseFailure {
    pub expected: Option<ChartType>,
    pub got: String,
}

impl ParseFailure {
    fn new(expected: Option<ChartType>, got: impl Into<String>) -> Self {
        Self {
            expected,
            got: got.into(),
        }
    }
}

/// Flatten nested maps into `.`-joined keys, preserving insertion order.
pub(crate) fn flatten(data: &LogData) -> Vec<(String, &Value)> {
    let mut out = Vec::with_capacity(data.len());
    flatten_into(None, data, &mut out);
    out
}

fn flatten_into<'a>(prefix: Option<&str>, data: &'a LogData, out: &mut Vec<(String, &'a Value)>) {
    for (key, value) in data.iter() {
        let full = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Map(nested) => flatten_into(Some(full.as_str()), nested, out),
            leaf => out.push((full, leaf)),
        }
    }
}

/// Normalize a flattened key. `None` means the key is unusable.
pub(crate) fn normalize_key(key: &str) -> Option<String> {
    let key = key.trim();
    if key.is_empty() || key.chars().count() > MAX_KEY_LEN {
        return None;
    }
    Some(key.to_string())
}

pub(crate) fn parse_value(value: &Value) -> Result<Parsed, ParseFailure> {
    match value {
        Value::Int(v) => Ok(Parsed::Line(LineValue::from_f64(*v as f64))),
        Value::Float(v) => Ok(Parsed::Line(LineValue::from_f64(*v))),
        Value::Bool(v) => Ok(Parsed::Line(LineValue::Number(if *v { 1.0 } else { 0.0 }))),
        Value::Line(line) => Ok(Parsed::Line(line.value())),
        Value::Text(t) => Ok(Parsed::Text(vec![t.clone()])),
        Value::Audio(a) => Ok(Parsed::Audio(vec![a.clone()])),
        Value::Image(i) => Ok(Parsed::Image(vec![i.clone()])),
        Value::List(items) => parse_list(items),
        other => Err(ParseFailure::new(None, other.type_name())),
    }
}

fn parse_list(items: &[Value]) -> Result<Parsed, ParseFailure> {
    let Some(first) = items.first() else {
        return Err(ParseFailure::new(None, "list"));
    };
    match first {
        // A single wrapped line is sugar for the line itself; longer lists are not.
        Value::Line(line) if items.len() == 1 => Ok(Parsed::Line(line.value())),
        Value::Line(_) => Err(ParseFailure::new(Some(ChartType::Line), "list")),
        Value::Text(_) => collect_uniform(items, ChartType::Text, |v| match v {
            Value::Text(t) => Some(t.clone()),
            _ => None,
        })
        .map(Parsed::Text),
        Value::Audio(_) => collect_uniform(items, ChartType::Audio, |v| match v {
            Value::Audio(a) => Some(a.clone()),
            _ => None,
        })
        .map(Parsed::Audio),
        Value::Image(_) => collect_uniform(items, ChartType::Image, |v| match v {
            Value::Image(i) => Some(i.clone()),
            _ => None,
        })
        .map(Parsed::Image),
        _ => Err(ParseFailure::new(None, "list")),
    }
}

fn collect_uniform<T>(
    items: &[Value],
    kind: ChartType,
    pick: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<T>, ParseFailure> {
    if let Some(odd) = items.iter().find(|v| pick(*v).is_none()) {
        return Err(ParseFailure::new(Some(kind), odd.type_name()));
    }
    Ok(items.iter().take(MAX_LIST_LEN).filter_map(pick).collect())
}
