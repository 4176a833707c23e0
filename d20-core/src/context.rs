//! The variable environment formulas are evaluated against.
//!
//! A [`RollContext`] is a JSON object addressed by dotted paths
//! (`abilities.str.mod`, `item.enh`). It is rebuilt for every invocation
//! from the actor's roll data, the entity's own data and the transient
//! choices made for that invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Nesting depth allowed when a variable holds formula text.
pub const DEFAULT_MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollContext {
    data: Map<String, Value>,
    #[serde(skip, default = "default_depth")]
    max_depth: usize,
}

fn default_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl Default for RollContext {
    fn default() -> Self {
        Self {
            data: Map::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl From<Value> for RollContext {
    fn from(value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            data,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl RollContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }

    /// Look up a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.data.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Numeric view of a path. Missing, null and non-numeric values read as 0.
    pub fn number(&self, path: &str) -> f64 {
        match self.get(path) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::Bool(b)) => f64::from(u8::from(*b)),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn int(&self, path: &str) -> i64 {
        self.number(path).floor() as i64
    }

    /// Truthiness of a path: nonzero numbers, `true` and non-empty strings.
    pub fn flag(&self, path: &str) -> bool {
        match self.get(path) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn text(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Set a path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(last) = segments.pop() else {
            return;
        };
        let mut current = &mut self.data;
        for segment in segments {
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    pub fn set_number(&mut self, path: &str, value: f64) {
        self.set(path, number_value(value));
    }

    /// Accumulate a numeric value at `path`. A path holding formula text
    /// becomes `(<text>) + value`.
    pub fn add(&mut self, path: &str, value: f64) {
        match self.get(path) {
            Some(Value::String(text)) if text.trim().parse::<f64>().is_err() && !text.is_empty() => {
                let combined = format!("({text}) + {}", format_number(value));
                self.set(path, combined);
            }
            _ => {
                let current = self.number(path);
                self.set_number(path, current + value);
            }
        }
    }

    /// Append formula text at `path` as a sum term.
    pub fn append(&mut self, path: &str, formula: &str) {
        let combined = match self.get(path) {
            None | Some(Value::Null) => formula.to_string(),
            Some(Value::Number(n)) if n.as_f64() == Some(0.0) => formula.to_string(),
            Some(Value::String(s)) if s.is_empty() => formula.to_string(),
            Some(existing) => format!("{} + ({formula})", value_text(existing)),
        };
        self.set(path, combined);
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('.') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, path),
        };
        match parent {
            None => self.data.remove(last),
            Some(parent) => {
                let mut current = &mut self.data;
                for segment in parent.split('.') {
                    current = match current.get_mut(segment) {
                        Some(Value::Object(map)) => map,
                        _ => return None,
                    };
                }
                current.remove(last)
            }
        }
    }

    /// Deep-merge an object into `path` (or the root when `path` is empty).
    pub fn merge(&mut self, path: &str, value: Value) {
        if path.is_empty() {
            if let Value::Object(map) = value {
                merge_maps(&mut self.data, map);
            }
            return;
        }
        match (self.get(path).cloned(), value) {
            (Some(Value::Object(mut existing)), Value::Object(incoming)) => {
                merge_maps(&mut existing, incoming);
                self.set(path, Value::Object(existing));
            }
            (_, value) => self.set(path, value),
        }
    }

    /// Substitute `${path}` and `${this.path}` placeholders with context values.
    pub fn fill_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = after[..end].trim();
                    let key = key.strip_prefix("this.").unwrap_or(key);
                    match self.get(key) {
                        Some(value) => out.push_str(&value_text(value)),
                        None => out.push('0'),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn merge_maps(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(map)) => merge_maps(existing, map),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// JSON number for `value`, integral when possible.
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.as_f64().map_or_else(|| n.to_string(), format_number),
        Value::Bool(b) => b.to_string(),
        Value::Null => "0".to_string(),
        other => other.to_string(),
    }
}
