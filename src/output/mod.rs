//! Metric outputs for monitor mode.
//!
//! Supports collectd (exec plugin `PUTVAL` lines), telegraf (line protocol
//! over TCP) and prometheus (gauges served over HTTP).

mod collectd;
pub mod line_protocol;
mod prometheus;
mod telegraf;

pub use collectd::*;
pub use prometheus::*;
pub use telegraf::*;

use clap::ValueEnum;
use serde::Serialize;
use thiserror::Error;

use crate::measurements::Measurement;
use crate::metrics::MetricSet;
use crate::peers::PeerRole;

/// Output error types.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("cannot connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("metric encoding failed: {0}")]
    Encode(#[from] std::fmt::Error),
}

/// Monitor output modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Collectd,
    Prometheus,
    Telegraf,
}

/// Roles reported as peer counts, sorted by name.
pub const PEER_COUNT_ROLES: [PeerRole; 8] = [
    PeerRole::Backup,
    PeerRole::Excess,
    PeerRole::False,
    PeerRole::Invalid,
    PeerRole::Outlier,
    PeerRole::Pps,
    PeerRole::Survivor,
    PeerRole::Sync,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Float,
    Integer,
    /// Reported as a percentage, exported to prometheus as a ratio.
    Percent,
}

/// A daemon-wide summary metric.
#[derive(Debug, Clone, Copy)]
pub struct SummaryStat {
    pub name: &'static str,
    /// collectd `plugin-instance/type` pair.
    pub collectd: &'static str,
    /// Prometheus unit suffix.
    pub suffix: &'static str,
    pub kind: StatKind,
    pub help: &'static str,
}

pub const SUMMARY_STATS: [SummaryStat; 9] = [
    SummaryStat {
        name: "frequency",
        collectd: "frequency/frequency_offset",
        suffix: "_hertz",
        kind: StatKind::Float,
        help: "Frequency error of the local clock",
    },
    SummaryStat {
        name: "offset",
        collectd: "offset/time_offset",
        suffix: "_seconds",
        kind: StatKind::Float,
        help: "Mean clock offset of peers",
    },
    SummaryStat {
        name: "reach",
        collectd: "reachability/percent",
        suffix: "_ratio",
        kind: StatKind::Percent,
        help: "Peer reachability over the last 8 polls",
    },
    SummaryStat {
        name: "rootdelay",
        collectd: "rootdelay/root_delay",
        suffix: "_seconds",
        kind: StatKind::Float,
        help: "Network delay to stratum 0 sources",
    },
    SummaryStat {
        name: "rootdisp",
        collectd: "rootdisp/root_dispersion",
        suffix: "_seconds",
        kind: StatKind::Float,
        help: "Maximum calculated uncertainty from stratum 0 sources",
    },
    SummaryStat {
        name: "runtime",
        collectd: "runtime/duration",
        suffix: "_duration_seconds",
        kind: StatKind::Float,
        help: "Duration NTP service has been running",
    },
    SummaryStat {
        name: "stratum",
        collectd: "stratum/clock_stratum",
        suffix: "",
        kind: StatKind::Integer,
        help: "NTP stratum of this server",
    },
    SummaryStat {
        name: "sysjitter",
        collectd: "sysjitter/time_offset",
        suffix: "_seconds",
        kind: StatKind::Float,
        help: "RMS average of most recent system peer offset differences",
    },
    SummaryStat {
        name: "sysoffset",
        collectd: "sysoffset/time_offset",
        suffix: "_seconds",
        kind: StatKind::Float,
        help: "Current clock offset of selected system peer",
    },
];

/// A per-peer measurement field.
#[derive(Debug, Clone, Copy)]
pub struct PeerStat {
    pub name: &'static str,
    pub collectd: &'static str,
    pub suffix: &'static str,
    pub help: &'static str,
}

const fn peer_stat(
    name: &'static str,
    collectd: &'static str,
    suffix: &'static str,
    help: &'static str,
) -> PeerStat {
    PeerStat {
        name,
        collectd,
        suffix,
        help,
    }
}

pub const PEER_STATS: [PeerStat; 27] = [
    peer_stat("authenticated", "authenticated/bool", "", "Whether the peer is authenticated"),
    peer_stat(
        "authentication_enabled",
        "authentication-enabled/bool",
        "",
        "Whether the peer has authentication enabled",
    ),
    peer_stat(
        "authentication_fail",
        "authentication-fail/bool",
        "",
        "Whether the peer has failed authentication",
    ),
    peer_stat("bad_header", "bad-header/bool", "", "Whether the peer has sent bad header data"),
    peer_stat("bogus", "bogus/bool", "", "Whether the peer has been marked as bogus"),
    peer_stat("broadcast", "broadcast/bool", "", "Whether the peer is a broadcast association"),
    peer_stat("delay", "delay/time_offset", "_seconds", "Network round trip delay to this peer"),
    peer_stat(
        "dispersion",
        "dispersion/time_dispersion",
        "_seconds",
        "Calculated uncertainty for this peer",
    ),
    peer_stat("duplicate", "duplicate/bool", "", "Whether the peer's last response is a duplicate"),
    peer_stat(
        "exceeded_max_delay",
        "exceeded-max-delay/bool",
        "",
        "Whether the peer has exceeded the chrony maximum delay",
    ),
    peer_stat(
        "exceeded_max_delay_dev_ratio",
        "exceeded-max-delay-dev-ratio/bool",
        "",
        "Whether the peer has exceeded the chrony maximum delay dev ratio",
    ),
    peer_stat(
        "exceeded_max_delay_ratio",
        "exceeded-max-delay-ratio/bool",
        "",
        "Whether the peer has exceeded the chrony maximum delay ratio",
    ),
    peer_stat("interleaved", "interleaved/bool", "", "Whether the peer has interleaving enabled"),
    peer_stat("invalid", "invalid/bool", "", "Whether the peer has failed validity checks"),
    peer_stat("jitter", "jitter/time_offset", "_seconds", "RMS average of peer offset differences"),
    peer_stat("leap", "leap/bool", "", "Whether the peer has asserted its leap indicator"),
    peer_stat("local_poll", "local-poll/gauge", "", "Rate at which local host polls this peer"),
    peer_stat("offset", "offset/time_offset", "_seconds", "Current clock offset of this peer"),
    peer_stat(
        "persistent",
        "persistent/bool",
        "",
        "Whether the peer is configured as a persistent association",
    ),
    peer_stat("reachable", "reachable/bool", "", "Whether the peer is reachable"),
    peer_stat("remote_poll", "remote-poll/gauge", "", "The poll rate reported by this peer"),
    peer_stat(
        "root_delay",
        "rootdelay/root_delay",
        "_seconds",
        "The root delay reported by this peer",
    ),
    peer_stat(
        "root_dispersion",
        "rootdisp/root_dispersion",
        "_seconds",
        "The root dispersion reported by this peer",
    ),
    peer_stat("score", "score/gauge", "", "The chrony score calculated for this peer"),
    peer_stat("stratum", "stratum/clock_stratum", "", "The stratum reported by this peer"),
    peer_stat(
        "sync_loop",
        "sync-loop/bool",
        "",
        "Whether a synchronization loop has been detected for this peer",
    ),
    peer_stat(
        "synchronized",
        "synchronized/bool",
        "",
        "Whether the peer reports as synchronized",
    ),
];

pub fn peer_stat_for(name: &str) -> Option<&'static PeerStat> {
    PEER_STATS.iter().find(|s| s.name == name)
}

/// Summary metrics which have data, in name order.
pub fn summary_values(metrics: &MetricSet) -> Vec<(&'static SummaryStat, f64)> {
    SUMMARY_STATS
        .iter()
        .filter_map(|stat| {
            let value = metrics.get(stat.name).copied().flatten()?;
            Some((stat, value))
        })
        .collect()
}

/// Peer counts which are present, in name order.
pub fn peer_counts(metrics: &MetricSet) -> Vec<(PeerRole, f64)> {
    PEER_COUNT_ROLES
        .iter()
        .filter_map(|role| {
            let count = metrics.get(role.as_str()).copied().flatten()?;
            Some((*role, count))
        })
        .collect()
}

/// The configured metric sink.
pub enum Output {
    Collectd(CollectdOutput),
    Prometheus(PrometheusOutput),
    Telegraf(TelegrafOutput),
}

impl Output {
    pub fn mode(&self) -> Mode {
        match self {
            Output::Collectd(_) => Mode::Collectd,
            Output::Prometheus(_) => Mode::Prometheus,
            Output::Telegraf(_) => Mode::Telegraf,
        }
    }

    pub async fn send_summary_stats(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        match self {
            Output::Collectd(o) => o.send_summary_stats(metrics).await,
            Output::Prometheus(o) => o.send_summary_stats(metrics).await,
            Output::Telegraf(o) => o.send_summary_stats(metrics).await,
        }
    }

    pub async fn send_peer_counts(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        match self {
            Output::Collectd(o) => o.send_peer_counts(metrics).await,
            Output::Prometheus(o) => o.send_peer_counts(metrics).await,
            Output::Telegraf(o) => o.send_peer_counts(metrics).await,
        }
    }

    pub async fn send_measurement(&mut self, measurement: &Measurement) -> Result<(), OutputError> {
        match self {
            Output::Collectd(o) => o.send_measurement(measurement).await,
            Output::Prometheus(o) => o.send_measurement(measurement).await,
            Output::Telegraf(o) => o.send_measurement(measurement).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_sorted() {
        assert!(SUMMARY_STATS.windows(2).all(|w| w[0].name < w[1].name));
        assert!(PEER_STATS.windows(2).all(|w| w[0].name < w[1].name));
        assert!(PEER_COUNT_ROLES
            .windows(2)
            .all(|w| w[0].as_str() < w[1].as_str()));
    }

    #[test]
    fn test_summary_values_skip_missing() {
        let metrics = MetricSet::from([
            ("offset".to_string(), Some(0.001)),
            ("reach".to_string(), None),
            ("all-offset-mean".to_string(), Some(0.001)),
        ]);
        let values = summary_values(&metrics);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0.name, "offset");
    }

    #[test]
    fn test_peer_counts() {
        let metrics = MetricSet::from([
            ("sync".to_string(), Some(1.0)),
            ("survivor".to_string(), Some(3.0)),
            ("all".to_string(), Some(4.0)),
        ]);
        assert_eq!(
            peer_counts(&metrics),
            vec![(PeerRole::Survivor, 3.0), (PeerRole::Sync, 1.0)]
        );
    }

    #[test]
    fn test_measurement_fields_have_stats() {
        for name in ["offset", "root_dispersion", "exceeded_max_delay_dev_ratio", "reachable"] {
            assert!(peer_stat_for(name).is_some(), "{}", name);
        }
        assert!(peer_stat_for("nonexistent").is_none());
    }
}
