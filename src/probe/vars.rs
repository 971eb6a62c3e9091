//! System variables from `chronyc -c tracking` or `ntpq -nc readvar`.

use std::time::Duration;

use crate::metrics::MetricSet;

/// Fields of `chronyc -c tracking`, by position.
const CHRONY_TRACKING_FIELDS: [(usize, &str); 10] = [
    (2, "stratum"),
    (3, "systime"),
    (4, "sysoffset"),
    (5, "lastoffset"),
    (6, "rmsoffset"),
    (7, "frequency"),
    (8, "residualfreq"),
    (9, "skew"),
    (10, "rootdelay"),
    (11, "rootdisp"),
];

fn round9(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}

fn parse_chrony_tracking(fields: &[&str]) -> MetricSet {
    let mut metrics = MetricSet::new();
    for (index, name) in CHRONY_TRACKING_FIELDS {
        match fields.get(index).map(|f| f.parse::<f64>()) {
            Some(Ok(value)) => {
                metrics.insert(name.to_string(), Some(value));
            }
            _ => tracing::warn!("invalid {} in chronyc tracking output", name),
        }
    }
    metrics
}

/// `name=value` pairs. Delays and offsets are reported in milliseconds.
fn parse_readvar(fields: &[&str]) -> MetricSet {
    let mut metrics = MetricSet::new();
    for field in fields {
        let mut parts = field.split('=');
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        let (name, value) = match name {
            "rootdelay" | "rootdisp" => (name, round9(value / 1000.0)),
            "offset" => ("sysoffset", round9(value / 1000.0)),
            "sys_jitter" => ("sysjitter", round9(value / 1000.0)),
            _ => (name, value),
        };
        metrics.insert(name.to_string(), Some(value));
    }
    metrics
}

/// Daemon-wide variables.
#[derive(Debug, Clone, Default)]
pub struct NtpVars {
    metrics: MetricSet,
}

impl NtpVars {
    pub fn new<I, S>(lines: I, elapsed: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = lines
            .into_iter()
            .map(|l| l.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let fields: Vec<&str> = joined.split(',').map(str::trim).collect();

        // chronyc reports at least 12 bare values; readvar is name=value pairs
        let mut metrics = if joined.matches('=').count() < 5 && fields.len() >= 12 {
            parse_chrony_tracking(&fields)
        } else {
            parse_readvar(&fields)
        };
        metrics.insert("varstime".to_string(), Some(elapsed.as_secs_f64()));
        Self { metrics }
    }

    pub fn metrics(&self) -> MetricSet {
        self.metrics.clone()
    }
}
