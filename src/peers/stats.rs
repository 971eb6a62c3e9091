//! Summary statistics over peer groups.

use super::{NtpPeers, PeerGroups, PeerRole};
use crate::metrics::MetricSet;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation about `mean`.
pub fn pstdev(values: &[f64], mean: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Root mean square.
pub fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some((values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt())
}

fn insert_summary(metrics: &mut MetricSet, prefix: &str, values: &[f64]) {
    let avg = mean(values);
    metrics.insert(format!("{}-mean", prefix), avg);
    metrics.insert(
        format!("{}-stdev", prefix),
        avg.and_then(|m| pstdev(values, m)),
    );
    metrics.insert(format!("{}-rms", prefix), rms(values));
}

impl PeerGroups {
    /// Count, offset and reachability statistics for every role.
    pub fn metrics(&self) -> MetricSet {
        let mut metrics = MetricSet::new();
        for role in PeerRole::ALL {
            let name = role.as_str();
            metrics.insert(name.to_string(), Some(self.count(role) as f64));
            insert_summary(&mut metrics, &format!("{}-offset", name), &self.offsets(role));
            insert_summary(&mut metrics, &format!("{}-reach", name), &self.reachability(role));
        }
        metrics
    }
}

impl NtpPeers {
    /// Group statistics, plus `peerstime` when the query was timed.
    pub fn metrics(&self) -> MetricSet {
        let mut metrics = self.groups().metrics();
        if let Some(elapsed) = self.elapsed {
            metrics.insert("peerstime".to_string(), Some(elapsed.as_secs_f64()));
        }
        metrics
    }
}
