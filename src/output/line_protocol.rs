//! InfluxDB line protocol rendering, as consumed by telegraf.
//!
//! See <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

/// A line protocol field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Float(v) => v,
            FieldValue::Integer(v) => v as f64,
            FieldValue::Bool(v) => f64::from(u8::from(v)),
        }
    }

    /// Booleans are written as integers so they can be summed.
    fn render(&self) -> String {
        match *self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::Bool(v) => format!("{}i", u8::from(v)),
        }
    }

    fn group(&self) -> u8 {
        match self {
            FieldValue::Float(_) => 0,
            FieldValue::Integer(_) => 1,
            FieldValue::Bool(_) => 2,
        }
    }
}

/// Escape the characters which are special in tag keys and values.
pub fn escape_tag_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Reduce an arbitrary name to letters, digits and single underscores.
pub fn transform_identifier(id: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());
    re.replace_all(id, "_").trim_matches('_').to_string()
}

/// A single line protocol point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Add a tag. Empty values are dropped since line protocol can't express them.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.tags.insert(transform_identifier(key), value.to_string());
        }
        self
    }

    pub fn field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.insert(transform_identifier(key), value);
        self
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Render as `measurement,tags fields timestamp`.
    ///
    /// Tags are sorted by key. Fields are sorted by key within each type:
    /// floats, then integers, then booleans.
    pub fn render(&self) -> String {
        let mut line = self.measurement.clone();
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_tag_value(key));
            line.push('=');
            line.push_str(&escape_tag_value(value));
        }

        let mut fields: Vec<(&String, &FieldValue)> = self.fields.iter().collect();
        // stable, so keys stay sorted within each group
        fields.sort_by_key(|(_, value)| value.group());
        let fields: Vec<String> = fields
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value.render()))
            .collect();

        format!(
            "{} {} {}{:09}",
            line,
            fields.join(","),
            self.timestamp.timestamp(),
            self.timestamp.timestamp_subsec_nanos()
        )
    }
}
