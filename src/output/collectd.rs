use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{peer_counts, peer_stat_for, summary_values, OutputError};
use crate::measurements::Measurement;
use crate::metrics::MetricSet;

/// Writes collectd exec plugin commands to stdout.
pub struct CollectdOutput {
    hostname: String,
    interval: u64,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

fn putval(hostname: &str, kind: &str, interval: u64, value: f64) -> String {
    format!(
        "PUTVAL \"{}/ntpmon-{}\" interval={} N:{:.9}\n",
        hostname, kind, interval, value
    )
}

impl CollectdOutput {
    pub fn new(hostname: &str, interval: u64) -> Self {
        Self::with_writer(hostname, interval, Box::new(tokio::io::stdout()))
    }

    pub fn with_writer(
        hostname: &str,
        interval: u64,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            interval,
            writer,
        }
    }

    pub fn summary_lines(&self, metrics: &MetricSet) -> String {
        summary_values(metrics)
            .into_iter()
            .map(|(stat, value)| putval(&self.hostname, stat.collectd, self.interval, value))
            .collect()
    }

    pub fn peer_count_lines(&self, metrics: &MetricSet) -> String {
        peer_counts(metrics)
            .into_iter()
            .map(|(role, count)| {
                putval(
                    &self.hostname,
                    &format!("peers/count-{}", role),
                    self.interval,
                    count,
                )
            })
            .collect()
    }

    /// Measurements are filed under the peer's address rather than our hostname.
    pub fn measurement_lines(&self, measurement: &Measurement) -> String {
        let mut fields = measurement.fields();
        fields.sort_by_key(|(name, _)| *name);
        fields
            .into_iter()
            .filter_map(|(name, value)| {
                let stat = peer_stat_for(name)?;
                Some(putval(
                    &measurement.source,
                    stat.collectd,
                    self.interval,
                    value.as_f64(),
                ))
            })
            .collect()
    }

    async fn write(&mut self, lines: String) -> Result<(), OutputError> {
        if lines.is_empty() {
            return Ok(());
        }
        self.writer.write_all(lines.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_summary_stats(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        let lines = self.summary_lines(metrics);
        self.write(lines).await
    }

    pub async fn send_peer_counts(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        let lines = self.peer_count_lines(metrics);
        self.write(lines).await
    }

    pub async fn send_measurement(&mut self, measurement: &Measurement) -> Result<(), OutputError> {
        let lines = self.measurement_lines(measurement);
        self.write(lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::parse_measurement;

    fn output() -> CollectdOutput {
        CollectdOutput::with_writer("ntp1", 60, Box::new(tokio::io::sink()))
    }

    #[test]
    fn test_summary_lines() {
        let metrics = MetricSet::from([
            ("offset".to_string(), Some(0.000123)),
            ("reach".to_string(), Some(100.0)),
            ("stratum".to_string(), Some(2.0)),
            ("rootdisp".to_string(), None),
            ("sync".to_string(), Some(1.0)),
        ]);
        assert_eq!(
            output().summary_lines(&metrics),
            "PUTVAL \"ntp1/ntpmon-offset/time_offset\" interval=60 N:0.000123000\n\
             PUTVAL \"ntp1/ntpmon-reachability/percent\" interval=60 N:100.000000000\n\
             PUTVAL \"ntp1/ntpmon-stratum/clock_stratum\" interval=60 N:2.000000000\n"
        );
    }

    #[test]
    fn test_peer_count_lines() {
        let metrics = MetricSet::from([
            ("sync".to_string(), Some(1.0)),
            ("survivor".to_string(), Some(2.0)),
        ]);
        assert_eq!(
            output().peer_count_lines(&metrics),
            "PUTVAL \"ntp1/ntpmon-peers/count-survivor\" interval=60 N:2.000000000\n\
             PUTVAL \"ntp1/ntpmon-peers/count-sync\" interval=60 N:1.000000000\n"
        );
    }

    #[test]
    fn test_measurement_lines() {
        let m = parse_measurement(
            "60303 31306.514 192.168.1.1 946a -0.000014930 0.001063986 0.002622315 0.000432565",
        )
        .unwrap()
        .unwrap();
        let lines = output().measurement_lines(&m);
        assert!(lines.starts_with("PUTVAL \"192.168.1.1/ntpmon-authenticated/bool\" interval=60 N:"));
        assert!(lines.contains("PUTVAL \"192.168.1.1/ntpmon-offset/time_offset\" interval=60 N:-0.000014930\n"));
        assert_eq!(lines.lines().count(), m.fields().len());
    }

    #[tokio::test]
    async fn test_send_writes_lines() {
        let mock = tokio_test::io::Builder::new()
            .write(b"PUTVAL \"ntp1/ntpmon-peers/count-sync\" interval=60 N:1.000000000\n")
            .build();
        let mut output = CollectdOutput::with_writer("ntp1", 60, Box::new(mock));
        let metrics = MetricSet::from([("sync".to_string(), Some(1.0))]);
        output.send_peer_counts(&metrics).await.unwrap();
        // nothing to write, so the mock sees no further calls
        output.send_summary_stats(&MetricSet::new()).await.unwrap();
    }
}
