use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use super::line_protocol::{FieldValue, Point};
use super::{peer_counts, summary_values, OutputError, StatKind};
use crate::measurements::Measurement;
use crate::metrics::MetricSet;

/// Sends line protocol to a telegraf `socket_listener` input.
pub struct TelegrafOutput {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl TelegrafOutput {
    pub async fn connect(address: &str) -> Result<Self, OutputError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| OutputError::Connect(address.to_string(), e))?;
        tracing::info!("sending telegraf metrics to {}", address);
        Ok(Self::with_writer(Box::new(BufWriter::new(stream))))
    }

    /// Write to stdout, for running interactively.
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(tokio::io::stdout()))
    }

    pub fn with_writer(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { writer }
    }

    async fn send(&mut self, points: &[Point]) -> Result<(), OutputError> {
        let mut text = String::new();
        for point in points.iter().filter(|p| p.has_fields()) {
            text.push_str(&point.render());
            text.push('\n');
        }
        if text.is_empty() {
            return Ok(());
        }
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_summary_stats(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        let point = summary_point(metrics);
        self.send(&[point]).await
    }

    pub async fn send_peer_counts(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        let points = peer_count_points(metrics);
        self.send(&points).await
    }

    pub async fn send_measurement(&mut self, measurement: &Measurement) -> Result<(), OutputError> {
        let point = measurement.to_point("ntpmon_peer");
        self.send(&[point]).await
    }
}

pub fn summary_point(metrics: &MetricSet) -> Point {
    summary_values(metrics)
        .into_iter()
        .fold(Point::new("ntpmon", Utc::now()), |point, (stat, value)| {
            let value = match stat.kind {
                StatKind::Integer => FieldValue::Integer(value as i64),
                StatKind::Float | StatKind::Percent => FieldValue::Float(value),
            };
            point.field(stat.name, value)
        })
}

pub fn peer_count_points(metrics: &MetricSet) -> Vec<Point> {
    let now = Utc::now();
    peer_counts(metrics)
        .into_iter()
        .map(|(role, count)| {
            Point::new("ntpmon_peers", now)
                .tag("peertype", role.as_str())
                .field("count", FieldValue::Integer(count as i64))
        })
        .collect()
}
