//! The Nagios check command.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::alert::{MetricTable, NtpAlerter};
use crate::classifier::Severity;
use crate::config::CheckConfig;
use crate::metrics::MetricSet;
use crate::peers::NtpPeers;
use crate::probe::{run_checks, Collected};

/// Peer data supplied as `ntpq -pn` or `chronyc -c sources` output.
pub fn collected_from_input(input: &str) -> Collected {
    Collected {
        peers: Some(NtpPeers::new(input.lines(), None)),
        ..Default::default()
    }
}

/// Internal state shown with `--debug`.
#[derive(Serialize)]
struct DebugDump<'a> {
    checks: &'a [String],
    metrics: &'a MetricSet,
    results: &'a BTreeMap<String, Severity>,
}

/// The Nagios status line, or every message plus a state dump when debugging.
pub fn render(alerter: &NtpAlerter, debug: bool) -> Result<String, serde_json::Error> {
    if !debug {
        return Ok(format!("{}\n", alerter.nagios()));
    }
    let mut out = String::new();
    for (_, message) in alerter.messages() {
        out.push_str(&message);
        out.push('\n');
    }
    let dump = DebugDump {
        checks: alerter.checked_metrics(),
        metrics: alerter.metrics(),
        results: alerter.results(),
    };
    out.push_str(&serde_json::to_string_pretty(&dump)?);
    out.push('\n');
    Ok(out)
}

/// Run the check, print the result and return the Nagios exit code.
pub async fn run(config: &CheckConfig) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
    let table = MetricTable::standard(config.run_time)?;
    let mut alerter = NtpAlerter::new(&config.checks, table)?;

    let collected = if config.test {
        let input = tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin())).await??;
        collected_from_input(&input)
    } else {
        run_checks(&config.checks, None, config.timeout).await?
    };

    alerter.collect(&collected);
    print!("{}", render(&alerter, config.debug)?);
    Ok(alerter.return_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Check, DEFAULT_RUN_TIME};

    const INPUT: &str = "\
     remote           refid      st t when poll reach   delay   offset  jitter
==============================================================================
*91.189.89.199   131.188.3.220    2 u 1019 1024  377  346.845   -0.598   1.105
+91.189.94.4     193.79.237.14    2 u    5  128  377  340.782    3.735  59.463
 127.127.1.0     .LOCL.          10 l   4h   64    0    0.000    0.000   0.000
";

    fn alerter(checks: &[Check]) -> NtpAlerter {
        NtpAlerter::new(checks, MetricTable::standard(DEFAULT_RUN_TIME).unwrap()).unwrap()
    }

    #[test]
    fn test_collected_from_input() {
        let collected = collected_from_input(INPUT);
        assert!(collected.process.is_none());
        assert!(collected.vars.is_none());
        let peers = collected.peers.unwrap();
        assert_eq!(peers.sync_peer(), Some("91.189.89.199"));
        assert_eq!(peers.groups().count(crate::peers::PeerRole::All), 2);
    }

    #[test]
    fn test_render_nagios() {
        let mut a = alerter(&[Check::Sync, Check::Peers]);
        a.collect(&collected_from_input(INPUT));
        let out = render(&a, false).unwrap();
        assert!(
            out.starts_with("WARNING: Number of peers is too low (2) - should be greater than "),
            "{}",
            out
        );
        assert!(out.contains(" | frequency= offset="));
        assert!(out.ends_with('\n'));
        assert_eq!(out.lines().count(), 1);
        assert_eq!(a.return_code(), 1);
    }

    #[test]
    fn test_render_debug() {
        let mut a = alerter(&[Check::Sync, Check::Peers]);
        a.collect(&collected_from_input(INPUT));
        let out = render(&a, true).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("OK: Time is in sync with 91.189.89.199"));
        assert!(lines.next().unwrap().starts_with("WARNING: Number of peers is too low"));
        assert!(out.contains("\"sync\": 1.0"));
        assert!(out.contains("\"sync\": \"OK\""));
        assert!(out.contains("\"peers\": \"WARNING\""));
        assert!(out.contains("\"checks\": [\n    \"sync\",\n    \"peers\"\n  ]"));
    }
}
