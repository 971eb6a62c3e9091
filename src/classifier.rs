//! Classify metrics into OK, WARNING or CRITICAL ranges.
//!
//! A [`MetricClassifier`] is built from a table of [`MetricDefinition`]s,
//! validated up front. It classifies batches of metrics, picks the worst
//! of a subset for a Nagios return code, and renders a human readable
//! message for any classified metric:
//!
//! ```text
//! CRITICAL: reachability is too low (48.46%) - must be greater than 50.00%
//! ```

use crate::metrics::MetricSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("boundaries must be numbers")]
    NotANumber,
    #[error("boundaries must be in strictly {0} order")]
    Order(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("invalid metric definition for {metric}: {source}")]
    InvalidDefinition {
        metric: String,
        #[source]
        source: DefinitionError,
    },
}

/// Classification result, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Severity {
    /// Nagios exit code for this severity.
    pub fn rank(self) -> i32 {
        match self {
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
            Severity::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert boundaries for a single metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricDefinition {
    /// Low values are good.
    Low { warning: f64, critical: f64 },
    /// High values are good.
    High { warning: f64, critical: f64 },
    /// Values near the middle are good.
    Mid {
        critical_low: f64,
        warning_low: f64,
        warning_high: f64,
        critical_high: f64,
    },
}

fn strictly_ascending(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

impl MetricDefinition {
    pub fn low(warning: f64, critical: f64) -> Result<Self, DefinitionError> {
        let def = MetricDefinition::Low { warning, critical };
        def.validate()?;
        Ok(def)
    }

    pub fn high(warning: f64, critical: f64) -> Result<Self, DefinitionError> {
        let def = MetricDefinition::High { warning, critical };
        def.validate()?;
        Ok(def)
    }

    pub fn mid(
        critical_low: f64,
        warning_low: f64,
        warning_high: f64,
        critical_high: f64,
    ) -> Result<Self, DefinitionError> {
        let def = MetricDefinition::Mid {
            critical_low,
            warning_low,
            warning_high,
            critical_high,
        };
        def.validate()?;
        Ok(def)
    }

    fn boundaries(&self) -> Vec<f64> {
        match *self {
            MetricDefinition::Low { warning, critical }
            | MetricDefinition::High { warning, critical } => vec![warning, critical],
            MetricDefinition::Mid {
                critical_low,
                warning_low,
                warning_high,
                critical_high,
            } => vec![critical_low, warning_low, warning_high, critical_high],
        }
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut bounds = self.boundaries();
        if bounds.iter().any(|b| b.is_nan()) {
            return Err(DefinitionError::NotANumber);
        }
        match self {
            MetricDefinition::High { .. } => {
                bounds.reverse();
                if !strictly_ascending(&bounds) {
                    return Err(DefinitionError::Order("descending"));
                }
            }
            _ => {
                if !strictly_ascending(&bounds) {
                    return Err(DefinitionError::Order("ascending"));
                }
            }
        }
        Ok(())
    }

    pub fn classify(&self, value: f64) -> Severity {
        if value.is_nan() {
            return Severity::Unknown;
        }
        match *self {
            MetricDefinition::Low { warning, critical } => {
                if value >= critical {
                    Severity::Critical
                } else if value >= warning {
                    Severity::Warning
                } else {
                    Severity::Ok
                }
            }
            MetricDefinition::High { warning, critical } => {
                if value <= critical {
                    Severity::Critical
                } else if value <= warning {
                    Severity::Warning
                } else {
                    Severity::Ok
                }
            }
            MetricDefinition::Mid {
                critical_low,
                warning_low,
                warning_high,
                critical_high,
            } => {
                if value > warning_low && value < warning_high {
                    Severity::Ok
                } else if value > critical_low && value < critical_high {
                    Severity::Warning
                } else {
                    Severity::Critical
                }
            }
        }
    }

    /// The boundary text shown when `severity` fired.
    fn limits(&self, severity: Severity, format: NumberFormat) -> String {
        let critical = severity == Severity::Critical;
        match *self {
            MetricDefinition::Low { warning, critical: crit }
            | MetricDefinition::High { warning, critical: crit } => {
                format.render(Some(if critical { crit } else { warning }))
            }
            MetricDefinition::Mid {
                critical_low,
                warning_low,
                warning_high,
                critical_high,
            } => {
                let (low, high) = if critical {
                    (critical_low, critical_high)
                } else {
                    (warning_low, warning_high)
                };
                format!("{} and {}", format.render(Some(low)), format.render(Some(high)))
            }
        }
    }

    fn sentence(&self) -> (&'static str, &'static str) {
        match self {
            MetricDefinition::Low { .. } => ("too high", "less than"),
            MetricDefinition::High { .. } => ("too low", "greater than"),
            MetricDefinition::Mid { .. } => ("out of range", "between"),
        }
    }
}

/// How a metric value is displayed in messages and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NumberFormat {
    /// Two decimals followed by `%`. The value is already a percentage.
    Percent,
    /// Truncated to an integer.
    Integer,
    /// Fixed point with the given number of decimals.
    Fixed(usize),
    /// Shortest of fixed or exponent notation with the given significant digits.
    General(usize),
    /// Exponent notation with the given number of decimals.
    Exponent(usize),
    /// The value's own display form.
    Plain,
}

impl Default for NumberFormat {
    fn default() -> Self {
        NumberFormat::General(6)
    }
}

impl From<&str> for NumberFormat {
    /// Accepts printf-style conversion characters, optionally with a
    /// precision (`.9f`). Anything unrecognized displays as plain text.
    fn from(fmt: &str) -> Self {
        match fmt {
            "%" => return NumberFormat::Percent,
            "d" | "i" | "n" => return NumberFormat::Integer,
            "f" | "F" => return NumberFormat::Fixed(6),
            "e" | "E" => return NumberFormat::Exponent(6),
            "g" | "G" => return NumberFormat::General(6),
            _ => {}
        }
        let Some(spec) = fmt.strip_prefix('.') else {
            return NumberFormat::Plain;
        };
        if spec.len() < 2 {
            return NumberFormat::Plain;
        }
        let (digits, conversion) = spec.split_at(spec.len() - 1);
        let Ok(precision) = digits.parse::<usize>() else {
            return NumberFormat::Plain;
        };
        match conversion {
            "f" | "F" => NumberFormat::Fixed(precision),
            "e" | "E" => NumberFormat::Exponent(precision),
            "g" | "G" => NumberFormat::General(precision),
            _ => NumberFormat::Plain,
        }
    }
}

/// Rust renders exponents as `e5`; C renders them as `e+05`.
fn c_exponent(mantissa: &str, exponent: i32) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exponent.abs())
}

fn split_exponent(formatted: &str) -> (&str, i32) {
    match formatted.split_once('e') {
        Some((mantissa, exp)) => (mantissa, exp.parse().unwrap_or(0)),
        None => (formatted, 0),
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn format_general(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = split_exponent(&scientific);
    if exponent < -4 || exponent >= precision as i32 {
        c_exponent(trim_fraction(mantissa), exponent)
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

impl NumberFormat {
    /// Render a value. Values with no data render as `unknown`.
    pub fn render(&self, value: Option<f64>) -> String {
        let Some(value) = value.filter(|v| !v.is_nan()) else {
            return "unknown".to_string();
        };
        match *self {
            NumberFormat::Percent => format!("{:.2}%", value),
            NumberFormat::Integer => format!("{}", value.trunc() as i64),
            NumberFormat::Fixed(p) => format!("{:.*}", p, value),
            NumberFormat::General(p) => format_general(value, p),
            NumberFormat::Exponent(p) => {
                let formatted = format!("{:.*e}", p, value);
                let (mantissa, exponent) = split_exponent(&formatted);
                c_exponent(mantissa, exponent)
            }
            NumberFormat::Plain => format!("{}", value),
        }
    }
}

/// Classifies metrics against a fixed set of definitions and caches the
/// most recent batch for worst-of selection and message rendering.
#[derive(Debug, Clone, Default)]
pub struct MetricClassifier {
    definitions: BTreeMap<String, MetricDefinition>,
    values: MetricSet,
    results: BTreeMap<String, Severity>,
}

impl MetricClassifier {
    pub fn new<I, S>(definitions: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = (S, MetricDefinition)>,
        S: Into<String>,
    {
        let mut checked = BTreeMap::new();
        for (name, definition) in definitions {
            let name = name.into();
            if let Err(source) = definition.validate() {
                return Err(ClassifierError::InvalidDefinition { metric: name, source });
            }
            checked.insert(name, definition);
        }
        Ok(Self {
            definitions: checked,
            ..Default::default()
        })
    }

    pub fn definition(&self, metric: &str) -> Option<&MetricDefinition> {
        self.definitions.get(metric)
    }

    /// Classify a single value. Metrics without a definition are `Unknown`.
    pub fn classify(&self, metric: &str, value: f64) -> Severity {
        self.definitions
            .get(metric)
            .map(|d| d.classify(value))
            .unwrap_or(Severity::Unknown)
    }

    /// Classify every metric in the set, replacing the previous batch.
    pub fn classify_metrics(&mut self, metrics: &MetricSet) -> &BTreeMap<String, Severity> {
        self.values = metrics.clone();
        self.results = metrics
            .iter()
            .map(|(name, value)| {
                let severity = match value {
                    Some(v) => self.classify(name, *v),
                    None => Severity::Unknown,
                };
                (name.clone(), severity)
            })
            .collect();
        &self.results
    }

    pub fn results(&self) -> &BTreeMap<String, Severity> {
        &self.results
    }

    pub fn result(&self, metric: &str) -> Option<Severity> {
        self.results.get(metric).copied()
    }

    /// The most severe of `metrics`, first occurrence winning ties.
    /// Names without a result are skipped.
    pub fn worst_metric<S: AsRef<str>>(&self, metrics: &[S]) -> (Option<String>, Severity) {
        let mut worst: Option<(&str, Severity)> = None;
        for name in metrics {
            let name = name.as_ref();
            let Some(severity) = self.result(name) else {
                continue;
            };
            if worst.map_or(true, |(_, w)| severity > w) {
                worst = Some((name, severity));
            }
        }
        match worst {
            Some((name, severity)) => (Some(name.to_string()), severity),
            None => (None, Severity::Unknown),
        }
    }

    pub fn return_code<S: AsRef<str>>(&self, metrics: &[S], unknown_as_critical: bool) -> i32 {
        match self.worst_metric(metrics).1 {
            Severity::Unknown if unknown_as_critical => Severity::Critical.rank(),
            severity => severity.rank(),
        }
    }

    /// Describe the last classification of `metric`.
    pub fn message(&self, metric: &str, description: Option<&str>, format: NumberFormat) -> String {
        let description = description.unwrap_or(metric);
        let severity = self.result(metric).unwrap_or(Severity::Unknown);
        let value = format.render(self.values.get(metric).copied().flatten());

        let must = match severity {
            Severity::Critical => "must",
            Severity::Warning => "should",
            _ => return format!("{}: {} is {}", severity, description, value),
        };
        let Some(definition) = self.definition(metric) else {
            return format!("{}: {} is {}", severity, description, value);
        };
        let (problem, comparison) = definition.sentence();
        format!(
            "{}: {} is {} ({}) - {} be {} {}",
            severity,
            description,
            problem,
            value,
            must,
            comparison,
            definition.limits(severity, format)
        )
    }
}
