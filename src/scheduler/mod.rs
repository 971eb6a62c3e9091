//! Scheduler for monitor mode.
//!
//! Runs two loops: one collects and reports summary metrics on each
//! interval boundary, the other follows the daemon's measurement log and
//! reports each peer measurement as it arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::alert::{Check, MetricTable, NtpAlerter, DEFAULT_RUN_TIME};
use crate::classifier::ClassifierError;
use crate::config::MonitorConfig;
use crate::measurements::{parse_measurement, Measurement};
use crate::output::Output;
use crate::peers::NtpPeers;
use crate::probe::{run_checks, Collected, Implementation};
use crate::tailer::Tailer;

const TAIL_INTERVAL: Duration = Duration::from_millis(500);

/// Results of the most recent poll, shared between the loops.
#[derive(Debug, Clone, Default)]
pub struct LatestPoll {
    pub implementation: Option<Implementation>,
    pub peers: Option<NtpPeers>,
}

impl LatestPoll {
    fn update(&mut self, collected: &Collected) {
        self.implementation = collected.process.as_ref().and_then(|p| p.implementation());
        self.peers = collected.peers.clone();
    }

    /// Set the measurement's role from the latest peer list.
    pub fn tag(&self, measurement: &mut Measurement) {
        if measurement.role.is_none() {
            measurement.role = self
                .peers
                .as_ref()
                .and_then(|p| p.groups().role_of(&measurement.source));
        }
    }
}

/// Time until the next multiple of `interval` seconds since the epoch.
pub fn time_until(interval: u64, now_millis: i64) -> Duration {
    let interval_millis = interval.max(1) * 1000;
    let elapsed = now_millis.rem_euclid(interval_millis as i64) as u64;
    Duration::from_millis(interval_millis - elapsed)
}

/// Drives the monitor loops.
pub struct Scheduler {
    config: MonitorConfig,
    alerter: NtpAlerter,
    output: Arc<Mutex<Output>>,
    latest: Arc<RwLock<LatestPoll>>,
}

impl Scheduler {
    pub fn new(config: MonitorConfig, output: Output) -> Result<Self, ClassifierError> {
        let alerter = NtpAlerter::new(&Check::DEFAULT, MetricTable::standard(DEFAULT_RUN_TIME)?)?;
        Ok(Self {
            config,
            alerter,
            output: Arc::new(Mutex::new(output)),
            latest: Arc::new(RwLock::new(LatestPoll::default())),
        })
    }

    /// Run both loops until one of them fails.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            "reporting to {:?} every {} seconds",
            self.output.lock().await.mode(),
            self.config.interval
        );

        let alert = tokio::spawn(run_alert_loop(
            self.alerter,
            self.config.interval,
            self.config.timeout,
            self.output.clone(),
            self.latest.clone(),
        ));
        let stats = tokio::spawn(run_measurement_loop(
            self.config.logfile.clone(),
            self.output.clone(),
            self.latest.clone(),
        ));

        tokio::try_join!(alert, stats)?;
        Ok(())
    }
}

/// Collect and report summary metrics, aligned to the interval.
async fn run_alert_loop(
    mut alerter: NtpAlerter,
    interval: u64,
    timeout: Duration,
    output: Arc<Mutex<Output>>,
    latest: Arc<RwLock<LatestPoll>>,
) {
    loop {
        match run_checks(&Check::DEFAULT, None, timeout).await {
            Ok(collected) => {
                latest.write().await.update(&collected);
                if collected.process.as_ref().is_some_and(|p| p.is_running()) {
                    alerter.collect(&collected);
                    report(&output, &alerter).await;
                } else {
                    tracing::warn!("no NTP daemon running; skipping report");
                }
            }
            Err(e) => tracing::error!("collecting metrics failed: {}", e),
        }

        tokio::time::sleep(time_until(interval, Utc::now().timestamp_millis())).await;
    }
}

async fn report(output: &Mutex<Output>, alerter: &NtpAlerter) {
    let metrics = alerter.metrics();
    let mut output = output.lock().await;
    if let Err(e) = output.send_summary_stats(metrics).await {
        tracing::error!("sending summary metrics failed: {}", e);
    }
    if let Err(e) = output.send_peer_counts(metrics).await {
        tracing::error!("sending peer counts failed: {}", e);
    }
}

/// Follow the measurement log and report each new measurement.
async fn run_measurement_loop(
    logfile: Option<PathBuf>,
    output: Arc<Mutex<Output>>,
    latest: Arc<RwLock<LatestPoll>>,
) {
    let mut tailer: Option<Tailer> = None;
    let mut interval = tokio::time::interval(TAIL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if tailer.is_none() {
            let path = match &logfile {
                Some(path) => path.clone(),
                None => match latest.read().await.implementation {
                    Some(implementation) => PathBuf::from(implementation.logfile()),
                    None => continue,
                },
            };
            tracing::info!("following measurements in {}", path.display());
            tailer = Some(Tailer::new(path));
        }
        let Some(t) = tailer.as_mut() else {
            continue;
        };

        let lines = match t.tail() {
            Ok(Some(lines)) => lines,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("reading {} failed: {}", t.path().display(), e);
                continue;
            }
        };
        send_measurements(&lines, &output, &latest).await;
    }
}

/// Parse, tag and send measurement lines. Returns the number sent.
pub async fn send_measurements(
    lines: &[String],
    output: &Mutex<Output>,
    latest: &RwLock<LatestPoll>,
) -> usize {
    let mut sent = 0;
    for line in lines {
        let mut measurement = match parse_measurement(line) {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("skipping measurement {:?}: {}", line, e);
                continue;
            }
        };
        latest.read().await.tag(&mut measurement);

        match output.lock().await.send_measurement(&measurement).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::error!("sending measurement failed: {}", e),
        }
    }
    sent
}
