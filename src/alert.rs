//! Decides which metrics are reported and alerted on, and renders them.
//!
//! The [`MetricTable`] names every reported metric along with the metrics
//! it may be aliased from, its display format and its alert boundaries.
//! [`NtpAlerter`] feeds collected data through the table and a
//! [`MetricClassifier`], and produces Nagios output.

use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::Serialize;

use crate::classifier::{
    ClassifierError, DefinitionError, MetricClassifier, MetricDefinition, NumberFormat, Severity,
};
use crate::metrics::{resolve_alias, MetricSet};
use crate::probe::Collected;

/// Default number of seconds after daemon startup during which checks return OK.
pub const DEFAULT_RUN_TIME: u64 = 512;

/// Checks selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Check {
    Proc,
    Offset,
    Peers,
    #[value(alias = "reachability")]
    Reach,
    Sync,
    Vars,
}

impl Check {
    pub const DEFAULT: [Check; 6] = [
        Check::Proc,
        Check::Offset,
        Check::Peers,
        Check::Reach,
        Check::Sync,
        Check::Vars,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Check::Proc => "proc",
            Check::Offset => "offset",
            Check::Peers => "peers",
            Check::Reach => "reach",
            Check::Sync => "sync",
            Check::Vars => "vars",
        }
    }

    /// Whether this check needs the peer list.
    pub fn needs_peers(&self) -> bool {
        matches!(self, Check::Offset | Check::Peers | Check::Reach | Check::Sync)
    }
}

/// How one reported metric is derived, displayed and alerted.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    /// Metrics to copy the value from, first available wins. Empty if the
    /// metric is collected under its own name.
    pub sources: Vec<String>,
    pub description: Option<String>,
    pub format: NumberFormat,
    pub definition: Option<MetricDefinition>,
}

impl MetricSpec {
    fn reported(format: NumberFormat) -> Self {
        Self {
            sources: Vec::new(),
            description: None,
            format,
            definition: None,
        }
    }

    fn aliased(mut self, sources: &[&str]) -> Self {
        self.sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    fn described(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn alerted(mut self, definition: MetricDefinition) -> Self {
        self.definition = Some(definition);
        self
    }
}

fn invalid(metric: &'static str) -> impl Fn(DefinitionError) -> ClassifierError {
    move |source| ClassifierError::InvalidDefinition {
        metric: metric.to_string(),
        source,
    }
}

/// Every reported metric, by name.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    specs: BTreeMap<String, MetricSpec>,
}

impl MetricTable {
    /// The standard table. `run_time` is the startup grace period in seconds.
    pub fn standard(run_time: u64) -> Result<Self, ClassifierError> {
        let offset_limits =
            MetricDefinition::mid(-0.05, -0.01, 0.01, 0.05).map_err(invalid("offset"))?;

        let specs = [
            (
                "offset",
                MetricSpec::reported(NumberFormat::Fixed(6))
                    .aliased(&[
                        "survivor-offset-mean",
                        "outlier-offset-mean",
                        "backup-offset-mean",
                        "all-offset-mean",
                    ])
                    .alerted(offset_limits),
            ),
            (
                "peers",
                MetricSpec::reported(NumberFormat::Integer)
                    .aliased(&["all"])
                    .described("Number of peers")
                    .alerted(MetricDefinition::high(3.0, 1.0).map_err(invalid("peers"))?),
            ),
            (
                "reach",
                MetricSpec::reported(NumberFormat::Percent)
                    .aliased(&["all-reach-mean"])
                    .described("reachability")
                    .alerted(MetricDefinition::high(75.0, 50.0).map_err(invalid("reach"))?),
            ),
            (
                "sync",
                MetricSpec::reported(NumberFormat::Fixed(6))
                    .alerted(MetricDefinition::high(0.9, 0.5).map_err(invalid("sync"))?),
            ),
            (
                "runtime",
                MetricSpec::reported(NumberFormat::Integer).alerted(
                    MetricDefinition::high(run_time as f64, 0.0).map_err(invalid("runtime"))?,
                ),
            ),
            (
                "sysoffset",
                MetricSpec::reported(NumberFormat::Fixed(9)).alerted(offset_limits),
            ),
            ("frequency", MetricSpec::reported(NumberFormat::Fixed(6))),
            ("rootdelay", MetricSpec::reported(NumberFormat::Fixed(6))),
            ("rootdisp", MetricSpec::reported(NumberFormat::Fixed(6))),
            ("stratum", MetricSpec::reported(NumberFormat::Integer)),
            (
                "sysjitter",
                MetricSpec::reported(NumberFormat::Fixed(9))
                    .alerted(MetricDefinition::low(0.01, 0.1).map_err(invalid("sysjitter"))?),
            ),
            ("result", MetricSpec::reported(NumberFormat::Integer)),
        ];
        Ok(Self {
            specs: specs
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
        })
    }

    pub fn get(&self, metric: &str) -> Option<&MetricSpec> {
        self.specs.get(metric)
    }

    /// Metric names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = (&str, MetricDefinition)> {
        self.specs
            .iter()
            .filter_map(|(name, spec)| spec.definition.map(|d| (name.as_str(), d)))
    }

    /// Add every aliased metric to `metrics`.
    pub fn resolve_aliases(&self, metrics: &mut MetricSet) {
        for (name, spec) in &self.specs {
            if !spec.sources.is_empty() {
                let sources: Vec<&str> = spec.sources.iter().map(String::as_str).collect();
                resolve_alias(metrics, name, &sources);
            }
        }
    }
}

/// Classifies collected metrics for a fixed list of checks.
#[derive(Debug, Clone)]
pub struct NtpAlerter {
    checks: Vec<String>,
    table: MetricTable,
    classifier: MetricClassifier,
    metrics: MetricSet,
    process_name: Option<String>,
    sync_peer: Option<String>,
}

impl NtpAlerter {
    pub fn new(checks: &[Check], table: MetricTable) -> Result<Self, ClassifierError> {
        let classifier = MetricClassifier::new(table.definitions())?;

        let mut names: Vec<String> = checks.iter().map(|c| c.as_str().to_string()).collect();
        if checks.contains(&Check::Proc) {
            names.push("runtime".to_string());
        }
        if checks.contains(&Check::Vars) && !checks.contains(&Check::Offset) {
            names.push("sysoffset".to_string());
        }

        Ok(Self {
            checks: names,
            table,
            classifier,
            metrics: MetricSet::new(),
            process_name: None,
            sync_peer: None,
        })
    }

    /// Metric names considered when picking the worst result.
    pub fn checked_metrics(&self) -> &[String] {
        &self.checks
    }

    /// Replace the current metrics with those from `collected` and classify them.
    pub fn collect(&mut self, collected: &Collected) {
        self.metrics = collected.metrics();
        self.table.resolve_aliases(&mut self.metrics);
        self.process_name = collected.process.as_ref().and_then(|p| p.name.clone());
        self.sync_peer = collected
            .peers
            .as_ref()
            .and_then(|p| p.sync_peer())
            .map(str::to_string);
        self.classifier.classify_metrics(&self.metrics);
        let result = self.return_code();
        self.metrics.insert("result".to_string(), Some(result as f64));
    }

    pub fn metrics(&self) -> &MetricSet {
        &self.metrics
    }

    pub fn severity(&self, metric: &str) -> Option<Severity> {
        self.classifier.result(metric)
    }

    /// Severity of every metric in the last batch, checked or not.
    pub fn results(&self) -> &BTreeMap<String, Severity> {
        self.classifier.results()
    }

    fn runtime(&self) -> i64 {
        self.metrics
            .get("runtime")
            .copied()
            .flatten()
            .map(|r| r as i64)
            .unwrap_or(-1)
    }

    fn custom_message(&self, metric: &str, severity: Severity) -> Option<String> {
        match (metric, severity) {
            ("runtime", Severity::Critical) => Some(
                "CRITICAL: No NTP process could be found.  Please check that an NTP server is installed and running."
                    .to_string(),
            ),
            ("runtime", Severity::Warning) => Some(format!(
                "OK: {} has only been running {} seconds",
                self.process_name.as_deref().unwrap_or("NTP daemon"),
                self.runtime()
            )),
            ("runtime", Severity::Ok) => Some(format!(
                "OK: {} has been running {} seconds",
                self.process_name.as_deref().unwrap_or("NTP daemon"),
                self.runtime()
            )),
            ("sync", Severity::Critical) => Some("CRITICAL: No sync peer selected".to_string()),
            ("sync", Severity::Ok) => Some(format!(
                "OK: Time is in sync with {}",
                self.sync_peer.as_deref().unwrap_or("unknown")
            )),
            _ => None,
        }
    }

    /// The message for a classified metric.
    pub fn message(&self, metric: &str) -> String {
        let severity = self.severity(metric).unwrap_or(Severity::Unknown);
        if let Some(message) = self.custom_message(metric, severity) {
            return message;
        }
        let (description, format) = match self.table.get(metric) {
            Some(spec) => (spec.description.as_deref(), spec.format),
            None => (None, NumberFormat::default()),
        };
        self.classifier.message(metric, description, format)
    }

    /// Messages for every checked metric which was classified.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.checks
            .iter()
            .filter(|m| self.severity(m).is_some())
            .map(|m| (m.clone(), self.message(m)))
            .collect()
    }

    /// OK while the daemon is still starting up, otherwise the worst checked result.
    pub fn return_code(&self) -> i32 {
        if self.severity("runtime") == Some(Severity::Warning) {
            return Severity::Ok.rank();
        }
        self.classifier.return_code(&self.checks, false)
    }

    /// Every table metric as `name=value`, sorted by name.
    pub fn report(&self) -> String {
        self.table
            .names()
            .map(|name| {
                let format = match self.table.get(name).map(|s| s.format) {
                    Some(NumberFormat::Percent) | None => NumberFormat::Fixed(6),
                    Some(format) => format,
                };
                match self.metrics.get(name).copied().flatten() {
                    Some(value) => format!("{}={}", name, format.render(Some(value))),
                    None => format!("{}=", name),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// One line of Nagios plugin output.
    pub fn nagios(&self) -> String {
        let message = match self.classifier.worst_metric(&self.checks) {
            (Some(metric), _) => self.message(&metric),
            (None, _) => "UNKNOWN: no metrics collected".to_string(),
        };
        format!("{} | {}", message, self.report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::NtpPeers;
    use crate::probe::{NtpProcess, NtpVars};
    use std::time::Duration;

    const PEERS: [&str; 4] = [
        "*91.189.89.199   131.188.3.220    2 u 1019 1024  377  346.845   -0.598   1.105",
        "+91.189.94.4     193.79.237.14    2 u    5  128  377  340.782    3.735  59.463",
        "+223.252.23.219  202.127.210.36   3 u    8  128  377   31.430  -16.143  74.185",
        "-150.101.233.118 192.189.54.17    3 u    3  128  377   70.775    7.865  57.820",
    ];

    fn collected(runtime: i64, peers: &[&str]) -> Collected {
        Collected {
            process: Some(NtpProcess {
                name: if runtime >= 0 { Some("ntpd".into()) } else { None },
                runtime,
            }),
            peers: Some(NtpPeers::new(peers, None)),
            vars: None,
        }
    }

    fn alerter(checks: &[Check]) -> NtpAlerter {
        NtpAlerter::new(checks, MetricTable::standard(DEFAULT_RUN_TIME).unwrap()).unwrap()
    }

    #[test]
    fn test_checked_metrics() {
        let a = alerter(&Check::DEFAULT);
        assert_eq!(
            a.checked_metrics(),
            &["proc", "offset", "peers", "reach", "sync", "vars", "runtime"]
        );
        let a = alerter(&[Check::Vars]);
        assert_eq!(a.checked_metrics(), &["vars", "sysoffset"]);
    }

    #[test]
    fn test_aliases_and_classification() {
        let mut a = alerter(&Check::DEFAULT);
        a.collect(&collected(86400, &PEERS));
        let m = a.metrics();
        assert_eq!(m["peers"], Some(4.0));
        assert_eq!(m["reach"], Some(100.0));
        assert_eq!(m["sync"], Some(1.0));
        // survivors: sync peer plus two '+' peers
        assert!((m["offset"].unwrap() - (-0.000598 + 0.003735 - 0.016143) / 3.0).abs() < 1e-12);
        assert_eq!(a.severity("peers"), Some(Severity::Ok));
        assert_eq!(a.severity("reach"), Some(Severity::Ok));
        assert_eq!(a.severity("sync"), Some(Severity::Ok));
        assert_eq!(a.severity("runtime"), Some(Severity::Ok));
        assert_eq!(a.return_code(), 0);
        assert_eq!(m["result"], Some(0.0));
    }

    #[test]
    fn test_nagios_output() {
        let mut a = alerter(&[Check::Proc, Check::Sync]);
        a.collect(&collected(86400, &PEERS));
        assert_eq!(
            a.nagios(),
            "OK: Time is in sync with 91.189.89.199 | frequency= offset=-0.004335 peers=4 \
             reach=100.000000 result=0 rootdelay= rootdisp= runtime=86400 stratum= sync=1.000000 \
             sysjitter= sysoffset="
        );
    }

    #[test]
    fn test_no_sync_peer() {
        let mut a = alerter(&[Check::Sync, Check::Peers]);
        a.collect(&collected(86400, &PEERS[1..]));
        assert_eq!(a.message("sync"), "CRITICAL: No sync peer selected");
        assert_eq!(a.return_code(), 2);
        assert!(a.nagios().starts_with("CRITICAL: No sync peer selected | "));
    }

    #[test]
    fn test_startup_grace_period() {
        let mut a = alerter(&Check::DEFAULT);
        a.collect(&collected(100, &PEERS[1..]));
        assert_eq!(a.severity("runtime"), Some(Severity::Warning));
        assert_eq!(a.severity("sync"), Some(Severity::Critical));
        assert_eq!(a.return_code(), 0);
        assert_eq!(a.message("runtime"), "OK: ntpd has only been running 100 seconds");
    }

    #[test]
    fn test_no_process() {
        let mut a = alerter(&[Check::Proc]);
        a.collect(&collected(-1, &[]));
        assert_eq!(a.severity("runtime"), Some(Severity::Critical));
        assert_eq!(
            a.message("runtime"),
            "CRITICAL: No NTP process could be found.  Please check that an NTP server is installed and running."
        );
        assert_eq!(a.return_code(), 2);
    }

    #[test]
    fn test_low_reachability_message() {
        let mut a = alerter(&[Check::Reach]);
        let peers = [
            "*10.0.0.1        10.1.1.1         2 u   10   64    7    1.000    2.000   0.100",
            "+10.0.0.2        10.1.1.1         2 u   10   64    3    1.000    2.000   0.100",
        ];
        a.collect(&collected(86400, &peers));
        assert_eq!(
            a.message("reach"),
            "CRITICAL: reachability is too low (31.25%) - must be greater than 50.00%"
        );
        assert_eq!(a.return_code(), 2);
    }

    #[test]
    fn test_vars_only() {
        let mut a = alerter(&[Check::Vars]);
        let vars = NtpVars::new(
            ["stratum=2, offset=25.0, rootdelay=1.0, rootdisp=2.0, sys_jitter=0.5, frequency=1.5"],
            Duration::ZERO,
        );
        a.collect(&Collected {
            vars: Some(vars),
            ..Default::default()
        });
        assert_eq!(a.severity("sysoffset"), Some(Severity::Warning));
        assert_eq!(a.severity("sysjitter"), Some(Severity::Ok));
        assert_eq!(
            a.message("sysoffset"),
            "WARNING: sysoffset is out of range (0.025000000) - should be between -0.010000000 and 0.010000000"
        );
        assert_eq!(a.return_code(), 1);
    }

    #[test]
    fn test_nothing_collected() {
        let mut a = alerter(&[Check::Offset]);
        a.collect(&Collected::default());
        assert_eq!(a.return_code(), 3);
        assert!(a.nagios().starts_with("UNKNOWN: no metrics collected | "));
        assert!(a.messages().is_empty());
    }

    #[test]
    fn test_invalid_run_time() {
        let err = MetricTable::standard(0).unwrap_err();
        assert!(err.to_string().contains("runtime"));
    }

    #[test]
    fn test_reachability_alias() {
        assert_eq!(Check::from_str("reachability", false), Ok(Check::Reach));
        assert_eq!(Check::from_str("reach", false), Ok(Check::Reach));
    }
}
