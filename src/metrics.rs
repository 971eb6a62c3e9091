//! Flat metric sets shared by every collector.
//!
//! A metric with value `None` is known but has no data (e.g. the mean offset
//! of a peer role with no peers).

use std::collections::BTreeMap;

/// Metric name to value. `None` means "no data available".
pub type MetricSet = BTreeMap<String, Option<f64>>;

/// Copy the value of `source` to `alias` if it has data.
fn add_alias(metrics: &mut MetricSet, source: &str, alias: &str) -> bool {
    match metrics.get(source).copied().flatten() {
        Some(value) if !value.is_nan() => {
            metrics.insert(alias.to_string(), Some(value));
            true
        }
        _ => false,
    }
}

/// Resolve `alias` from the first source in `sources` which has data.
///
/// An empty source list means the metric is its own source, so nothing is
/// copied.
pub fn resolve_alias(metrics: &mut MetricSet, alias: &str, sources: &[&str]) {
    for source in sources {
        if add_alias(metrics, source, alias) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricSet {
        let mut m = MetricSet::new();
        m.insert("survivor-offset-mean".into(), None);
        m.insert("outlier-offset-mean".into(), Some(0.002));
        m.insert("all-offset-mean".into(), Some(0.001));
        m.insert("all".into(), Some(4.0));
        m
    }

    #[test]
    fn test_alias_skips_missing_data() {
        let mut m = sample();
        resolve_alias(
            &mut m,
            "offset",
            &["survivor-offset-mean", "outlier-offset-mean", "all-offset-mean"],
        );
        assert_eq!(m["offset"], Some(0.002));
    }

    #[test]
    fn test_alias_single_source() {
        let mut m = sample();
        resolve_alias(&mut m, "peers", &["all"]);
        assert_eq!(m["peers"], Some(4.0));
    }

    #[test]
    fn test_alias_nothing_available() {
        let mut m = sample();
        resolve_alias(&mut m, "offset", &["survivor-offset-mean", "backup-offset-mean"]);
        assert!(!m.contains_key("offset"));
    }
}
