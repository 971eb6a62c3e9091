//! Configuration for ntpmon.
//!
//! Command line arguments are parsed with clap, then resolved against the
//! environment into [`CheckConfig`] or [`MonitorConfig`].

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::alert::{Check, DEFAULT_RUN_TIME};
use crate::output::Mode;
use crate::probe::DEFAULT_TIMEOUT;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no output mode given; use --mode or set COLLECTD_HOSTNAME/COLLECTD_INTERVAL")]
    MissingMode,
    #[error("invalid interval {0:?}: must be a positive number of seconds")]
    Interval(String),
    #[error("invalid listen address {0:?}")]
    ListenAddress(String),
    #[error("cannot determine hostname: {0}")]
    Hostname(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "ntpmon", version, about = "NTP daemon monitor and Nagios check")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check NTP health and print a Nagios status line
    Check(CheckArgs),
    /// Report NTP metrics to collectd, prometheus or telegraf
    Monitor(MonitorArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Checks to run; all of them if omitted
    #[arg(long = "check", value_enum, num_args = 0..)]
    pub checks: Vec<Check>,

    /// Include internal state along with check results
    #[arg(long)]
    pub debug: bool,

    /// Seconds after daemon startup during which failures are not critical
    #[arg(long, default_value_t = DEFAULT_RUN_TIME)]
    pub run_time: u64,

    /// Read peer lines on standard input instead of querying the daemon
    #[arg(long)]
    pub test: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    /// Output mode; collectd is the default when collectd environment variables are set
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// host:port of the telegraf socket listener
    #[arg(long, default_value = "127.0.0.1:8094")]
    pub connect: String,

    /// Seconds between reports (default: $COLLECTD_INTERVAL, or 60)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Address for the prometheus exporter
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_address: String,

    /// Port for the prometheus exporter
    #[arg(long, default_value_t = 9648)]
    pub port: u16,

    /// Log file to follow for peer measurements
    #[arg(long)]
    pub logfile: Option<PathBuf>,
}

/// Settings for a single check run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConfig {
    pub checks: Vec<Check>,
    pub debug: bool,
    pub run_time: u64,
    pub test: bool,
    pub timeout: Duration,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            checks: Check::DEFAULT.to_vec(),
            debug: false,
            run_time: DEFAULT_RUN_TIME,
            test: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl From<CheckArgs> for CheckConfig {
    fn from(args: CheckArgs) -> Self {
        let mut checks: Vec<Check> = Vec::new();
        for check in args.checks {
            if !checks.contains(&check) {
                checks.push(check);
            }
        }
        if checks.is_empty() {
            checks = Check::DEFAULT.to_vec();
        }
        Self {
            checks,
            debug: args.debug,
            run_time: args.run_time,
            test: args.test,
            ..Self::default()
        }
    }
}

/// Settings for monitor mode.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub mode: Mode,
    pub connect: String,
    pub hostname: String,
    /// Reporting interval in seconds.
    pub interval: u64,
    pub listen: SocketAddr,
    pub logfile: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Prometheus,
            connect: "127.0.0.1:8094".to_string(),
            hostname: "localhost".to_string(),
            interval: 60,
            listen: SocketAddr::from(([127, 0, 0, 1], 9648)),
            logfile: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl MonitorConfig {
    /// Resolve arguments against the process environment.
    ///
    /// Environment variables:
    /// - `COLLECTD_HOSTNAME`: hostname for collectd values; forces collectd mode
    /// - `COLLECTD_INTERVAL`: default reporting interval; forces collectd mode
    pub fn load(args: MonitorArgs) -> Result<Self, ConfigError> {
        Self::resolve(args, |name| std::env::var(name).ok())
    }

    pub fn resolve(
        args: MonitorArgs,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let mut mode = args.mode;

        cfg.hostname = match env("COLLECTD_HOSTNAME") {
            Some(name) => {
                mode = Some(Mode::Collectd);
                name
            }
            None => hostname::get()?.to_string_lossy().into_owned(),
        };

        let env_interval = env("COLLECTD_INTERVAL");
        if env_interval.is_some() {
            mode = Some(Mode::Collectd);
        }
        cfg.interval = match (args.interval, env_interval) {
            (Some(interval), _) => interval,
            (None, Some(value)) => parse_interval(&value)?,
            (None, None) => cfg.interval,
        };
        if cfg.interval == 0 {
            return Err(ConfigError::Interval("0".to_string()));
        }

        cfg.mode = mode.ok_or(ConfigError::MissingMode)?;

        let ip: IpAddr = args
            .listen_address
            .parse()
            .map_err(|_| ConfigError::ListenAddress(args.listen_address.clone()))?;
        cfg.listen = SocketAddr::new(ip, args.port);
        cfg.connect = args.connect;
        cfg.logfile = args.logfile;

        Ok(cfg)
    }
}

/// collectd passes its interval as a float.
fn parse_interval(value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 1.0 => Ok(secs.round() as u64),
        _ => Err(ConfigError::Interval(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_args(extra: &[&str]) -> MonitorArgs {
        let mut argv = vec!["ntpmon", "monitor"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Monitor(args) => args,
            other => panic!("expected monitor, got {:?}", other),
        }
    }

    fn check_args(extra: &[&str]) -> CheckArgs {
        let mut argv = vec!["ntpmon", "check"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Check(args) => args,
            other => panic!("expected check, got {:?}", other),
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_config() {
        let cfg = CheckConfig::default();
        assert_eq!(cfg.checks, Check::DEFAULT.to_vec());
        assert_eq!(cfg.run_time, 512);
        assert!(!cfg.test);

        let cfg = MonitorConfig::default();
        assert_eq!(cfg.interval, 60);
        assert_eq!(cfg.listen.port(), 9648);
        assert_eq!(cfg.connect, "127.0.0.1:8094");
    }

    #[test]
    fn test_check_args() {
        let cfg = CheckConfig::from(check_args(&[]));
        assert_eq!(cfg.checks, Check::DEFAULT.to_vec());
        let cfg = CheckConfig::from(check_args(&["--check", "--debug"]));
        assert_eq!(cfg.checks, Check::DEFAULT.to_vec());
        assert!(cfg.debug);

        let cfg = CheckConfig::from(check_args(&[
            "--check",
            "offset",
            "reachability",
            "--check",
            "offset",
            "--run-time",
            "60",
            "--test",
        ]));
        assert_eq!(cfg.checks, vec![Check::Offset, Check::Reach]);
        assert_eq!(cfg.run_time, 60);
        assert!(cfg.test);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_monitor_requires_mode() {
        let err = MonitorConfig::resolve(monitor_args(&[]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMode));
    }

    #[test]
    fn test_monitor_args() {
        let cfg = MonitorConfig::resolve(
            monitor_args(&[
                "--mode",
                "prometheus",
                "--listen-address",
                "::1",
                "--port",
                "9100",
                "--interval",
                "30",
                "--logfile",
                "/tmp/peerstats",
            ]),
            no_env,
        )
        .unwrap();
        assert_eq!(cfg.mode, Mode::Prometheus);
        assert_eq!(cfg.listen.to_string(), "[::1]:9100");
        assert_eq!(cfg.interval, 30);
        assert_eq!(cfg.logfile, Some(PathBuf::from("/tmp/peerstats")));
    }

    #[test]
    fn test_collectd_environment() {
        let env = |name: &str| match name {
            "COLLECTD_HOSTNAME" => Some("ntp1.example.com".to_string()),
            "COLLECTD_INTERVAL" => Some("10.000".to_string()),
            _ => None,
        };
        let cfg = MonitorConfig::resolve(monitor_args(&["--mode", "telegraf"]), env).unwrap();
        assert_eq!(cfg.mode, Mode::Collectd);
        assert_eq!(cfg.hostname, "ntp1.example.com");
        assert_eq!(cfg.interval, 10);

        // an explicit interval wins over the environment
        let cfg = MonitorConfig::resolve(monitor_args(&["--interval", "5"]), env).unwrap();
        assert_eq!(cfg.interval, 5);
    }

    #[test]
    fn test_invalid_values() {
        let env = |name: &str| (name == "COLLECTD_INTERVAL").then(|| "soon".to_string());
        assert!(matches!(
            MonitorConfig::resolve(monitor_args(&[]), env),
            Err(ConfigError::Interval(_))
        ));
        assert!(matches!(
            MonitorConfig::resolve(
                monitor_args(&["--mode", "prometheus", "--listen-address", "localhost"]),
                no_env
            ),
            Err(ConfigError::ListenAddress(_))
        ));
        assert!(matches!(
            MonitorConfig::resolve(monitor_args(&["--mode", "collectd", "--interval", "0"]), no_env),
            Err(ConfigError::Interval(_))
        ));
    }
}
