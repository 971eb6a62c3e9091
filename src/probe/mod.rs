//! Probes for the local NTP daemon.
//!
//! Runs the daemon's query tools and reads the process table.

mod process;
mod vars;

pub use process::*;
pub use vars::*;

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::alert::Check;
use crate::metrics::MetricSet;
use crate::peers::NtpPeers;

/// Default time allowed for a query command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("failed to execute {0}: {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("{command} returned {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Supported NTP daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    Chronyd,
    Ntpd,
}

/// Things we can ask the daemon about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    Peers,
    Vars,
}

impl Implementation {
    pub fn from_process_name(name: &str) -> Option<Self> {
        match name {
            "chronyd" => Some(Implementation::Chronyd),
            "ntpd" => Some(Implementation::Ntpd),
            _ => None,
        }
    }

    /// Default log of per-peer measurements.
    pub fn logfile(&self) -> &'static str {
        match self {
            Implementation::Chronyd => "/var/log/chrony/measurements.log",
            Implementation::Ntpd => "/var/log/ntpstats/peerstats",
        }
    }

    /// Command line for a query, program first.
    pub fn command(&self, query: Query) -> &'static [&'static str] {
        match (self, query) {
            (Implementation::Chronyd, Query::Peers) => &["chronyc", "-c", "sources"],
            (Implementation::Chronyd, Query::Vars) => &["chronyc", "-c", "tracking"],
            (Implementation::Ntpd, Query::Peers) => &["ntpq", "-pn"],
            (Implementation::Ntpd, Query::Vars) => &["ntpq", "-nc", "readvar"],
        }
    }
}

/// Output of a query command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub lines: Vec<String>,
    pub elapsed: Duration,
}

/// Run a query command for the given implementation.
pub async fn execute(
    query: Query,
    implementation: Implementation,
    timeout: Duration,
) -> Result<CommandOutput, ProbeError> {
    let argv = implementation.command(query);
    let command_line = argv.join(" ");

    let start = Instant::now();
    let child = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ProbeError::Timeout(command_line.clone(), timeout))?
        .map_err(|e| ProbeError::Spawn(command_line.clone(), e))?;
    let elapsed = start.elapsed();

    if !output.status.success() {
        return Err(ProbeError::Command {
            command: command_line,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        tracing::warn!(
            "{} produced no output. Please check that an NTP server is installed and running.",
            command_line
        );
    }
    tracing::debug!("{} completed in {:.3} seconds", command_line, elapsed.as_secs_f64());

    Ok(CommandOutput {
        lines: stdout.lines().map(str::to_string).collect(),
        elapsed,
    })
}

/// Run a query, logging failures and returning empty output instead.
async fn execute_or_empty(
    query: Query,
    implementation: Implementation,
    timeout: Duration,
) -> CommandOutput {
    match execute(query, implementation, timeout).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("{}", e);
            CommandOutput::default()
        }
    }
}

/// Everything collected for one check run.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub process: Option<NtpProcess>,
    pub peers: Option<NtpPeers>,
    pub vars: Option<NtpVars>,
}

impl Collected {
    pub fn metrics(&self) -> MetricSet {
        let mut metrics = MetricSet::new();
        if let Some(process) = &self.process {
            metrics.extend(process.metrics());
        }
        if let Some(peers) = &self.peers {
            metrics.extend(peers.metrics());
        }
        if let Some(vars) = &self.vars {
            metrics.extend(vars.metrics());
        }
        metrics
    }
}

/// Look up the running daemon without blocking the runtime.
pub async fn find_process() -> Result<NtpProcess, ProbeError> {
    Ok(tokio::task::spawn_blocking(NtpProcess::find).await?)
}

/// Gather the data needed by `checks`.
///
/// If `implementation` is not given it is detected from the process table.
/// Nothing but the process is collected when no daemon can be found.
pub async fn run_checks(
    checks: &[Check],
    implementation: Option<Implementation>,
    timeout: Duration,
) -> Result<Collected, ProbeError> {
    let mut collected = Collected::default();

    let process = if checks.contains(&Check::Proc) || implementation.is_none() {
        Some(find_process().await?)
    } else {
        None
    };
    let implementation = implementation.or_else(|| process.as_ref()?.implementation());
    if checks.contains(&Check::Proc) {
        collected.process = process;
    }

    let Some(implementation) = implementation else {
        tracing::warn!("no NTP daemon found");
        return Ok(collected);
    };

    if checks.iter().any(|c| c.needs_peers()) {
        let output = execute_or_empty(Query::Peers, implementation, timeout).await;
        collected.peers = Some(NtpPeers::new(&output.lines, Some(output.elapsed)));
    }

    if checks.contains(&Check::Vars) {
        let output = execute_or_empty(Query::Vars, implementation, timeout).await;
        collected.vars = Some(NtpVars::new(&output.lines, output.elapsed));
    }

    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands() {
        assert_eq!(
            Implementation::Chronyd.command(Query::Peers),
            &["chronyc", "-c", "sources"]
        );
        assert_eq!(
            Implementation::Chronyd.command(Query::Vars),
            &["chronyc", "-c", "tracking"]
        );
        assert_eq!(Implementation::Ntpd.command(Query::Peers), &["ntpq", "-pn"]);
        assert_eq!(
            Implementation::Ntpd.command(Query::Vars),
            &["ntpq", "-nc", "readvar"]
        );
    }

    #[test]
    fn test_implementation_from_process_name() {
        assert_eq!(
            Implementation::from_process_name("chronyd"),
            Some(Implementation::Chronyd)
        );
        assert_eq!(Implementation::from_process_name("ntpd"), Some(Implementation::Ntpd));
        assert_eq!(Implementation::from_process_name("openntpd"), None);
        assert!(Implementation::Chronyd.logfile().ends_with("measurements.log"));
    }

    #[test]
    fn test_collected_metrics_merge() {
        let collected = Collected {
            process: Some(NtpProcess {
                name: Some("ntpd".into()),
                runtime: 600,
            }),
            peers: Some(NtpPeers::new(
                ["*10.0.0.1        10.1.1.1         2 u   10   64  377    1.000    2.000   0.100"],
                None,
            )),
            vars: None,
        };
        let m = collected.metrics();
        assert_eq!(m["runtime"], Some(600.0));
        assert_eq!(m["sync"], Some(1.0));
        assert_eq!(m["all-offset-mean"], Some(0.002));
        assert!(!m.contains_key("varstime"));
    }
}
