use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;

use super::{peer_counts, peer_stat_for, summary_values, OutputError, StatKind};
use crate::measurements::Measurement;
use crate::metrics::MetricSet;

type FloatGauge = Gauge<f64, AtomicU64>;
type Labels = Vec<(String, String)>;

/// Measurement tags exported as per-peer labels.
pub const PEER_LABELS: [&str; 6] = ["mode", "refid", "rx_timestamp", "source", "tx_timestamp", "type"];

/// Gauges created on first use and kept for the life of the process.
#[derive(Debug, Default)]
pub struct GaugeRegistry {
    registry: Registry,
    gauges: HashMap<String, FloatGauge>,
    families: HashMap<String, Family<Labels, FloatGauge>>,
}

impl GaugeRegistry {
    pub fn set(&mut self, name: &str, help: &str, value: f64) {
        let gauge = match self.gauges.get(name) {
            Some(gauge) => gauge.clone(),
            None => {
                let gauge = FloatGauge::default();
                self.registry.register(name, help, gauge.clone());
                self.gauges.insert(name.to_string(), gauge.clone());
                gauge
            }
        };
        gauge.set(value);
    }

    pub fn set_labelled(&mut self, name: &str, help: &str, labels: &Labels, value: f64) {
        let family = match self.families.get(name) {
            Some(family) => family.clone(),
            None => {
                let family = Family::<Labels, FloatGauge>::default();
                self.registry.register(name, help, family.clone());
                self.families.insert(name.to_string(), family.clone());
                family
            }
        };
        family.get_or_create(labels).set(value);
    }

    /// Render in the prometheus text exposition format.
    pub fn encode(&self) -> Result<String, OutputError> {
        let mut text = String::new();
        encode(&mut text, &self.registry)?;
        Ok(text)
    }
}

pub type SharedRegistry = Arc<RwLock<GaugeRegistry>>;

/// Updates gauges which are scraped from the HTTP exporter.
pub struct PrometheusOutput {
    registry: SharedRegistry,
}

impl PrometheusOutput {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub async fn send_summary_stats(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        let mut registry = self.registry.write().await;
        for (stat, value) in summary_values(metrics) {
            let value = match stat.kind {
                StatKind::Percent => value / 100.0,
                StatKind::Float | StatKind::Integer => value,
            };
            let name = format!("ntpmon_{}{}", stat.name, stat.suffix);
            registry.set(&name, stat.help, value);
        }
        Ok(())
    }

    pub async fn send_peer_counts(&mut self, metrics: &MetricSet) -> Result<(), OutputError> {
        let mut registry = self.registry.write().await;
        for (role, count) in peer_counts(metrics) {
            let labels = vec![("peertype".to_string(), role.to_string())];
            registry.set_labelled("ntpmon_peers", "Count of peers of this type", &labels, count);
        }
        Ok(())
    }

    pub async fn send_measurement(&mut self, measurement: &Measurement) -> Result<(), OutputError> {
        let mut labels: Labels = measurement
            .tags()
            .into_iter()
            .filter(|(key, value)| PEER_LABELS.contains(key) && !value.is_empty())
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        labels.sort();

        let mut registry = self.registry.write().await;
        for (field, value) in measurement.fields() {
            let Some(stat) = peer_stat_for(field) else {
                tracing::debug!("no gauge for measurement field {}", field);
                continue;
            };
            let name = format!("ntpmon_peer_{}{}", stat.name, stat.suffix);
            registry.set_labelled(&name, stat.help, &labels, value.as_f64());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::parse_measurement;
    use crate::peers::PeerRole;

    fn output() -> (PrometheusOutput, SharedRegistry) {
        let registry = SharedRegistry::default();
        (PrometheusOutput::new(registry.clone()), registry)
    }

    async fn exported(registry: &SharedRegistry) -> String {
        registry.read().await.encode().unwrap()
    }

    fn sample<'a>(text: &'a str, name: &str) -> Option<&'a str> {
        text.lines()
            .find(|l| l.starts_with(name) && !l.starts_with('#'))
            .and_then(|l| l.rsplit_once(' '))
            .map(|(_, value)| value)
    }

    #[tokio::test]
    async fn test_summary_gauges() {
        let (mut output, registry) = output();
        let metrics = MetricSet::from([
            ("reach".to_string(), Some(75.0)),
            ("offset".to_string(), Some(-0.25)),
            ("runtime".to_string(), Some(600.0)),
            ("stratum".to_string(), Some(2.0)),
            ("frequency".to_string(), None),
        ]);
        output.send_summary_stats(&metrics).await.unwrap();

        let text = exported(&registry).await;
        assert_eq!(sample(&text, "ntpmon_reach_ratio").map(str::parse::<f64>), Some(Ok(0.75)));
        assert_eq!(
            sample(&text, "ntpmon_offset_seconds").map(str::parse::<f64>),
            Some(Ok(-0.25))
        );
        assert_eq!(
            sample(&text, "ntpmon_runtime_duration_seconds").map(str::parse::<f64>),
            Some(Ok(600.0))
        );
        assert_eq!(sample(&text, "ntpmon_stratum").map(str::parse::<f64>), Some(Ok(2.0)));
        assert!(!text.contains("ntpmon_frequency"));
        assert_eq!(text.matches("# TYPE ").count(), 4);
    }

    #[tokio::test]
    async fn test_gauges_are_reused() {
        let (mut output, registry) = output();
        for offset in [0.1, 0.2] {
            let metrics = MetricSet::from([("offset".to_string(), Some(offset))]);
            output.send_summary_stats(&metrics).await.unwrap();
        }
        let text = exported(&registry).await;
        assert_eq!(text.matches("# TYPE ntpmon_offset_seconds gauge").count(), 1);
        assert_eq!(
            sample(&text, "ntpmon_offset_seconds").map(str::parse::<f64>),
            Some(Ok(0.2))
        );
    }

    #[tokio::test]
    async fn test_peer_count_gauges() {
        let (mut output, registry) = output();
        let metrics = MetricSet::from([
            ("sync".to_string(), Some(1.0)),
            ("survivor".to_string(), Some(2.0)),
        ]);
        output.send_peer_counts(&metrics).await.unwrap();
        let text = exported(&registry).await;
        assert!(text.contains("ntpmon_peers{peertype=\"sync\"} 1"));
        assert!(text.contains("ntpmon_peers{peertype=\"survivor\"} 2"));
    }

    #[tokio::test]
    async fn test_measurement_gauges() {
        let mut m = parse_measurement(
            "2021-12-30 11:28:49 17.253.66.253   N  1 111 111 1111   6  6 0.00 -3.420e-04  1.302e-03  4.121e-06  0.000e+00  1.984e-04 47505373 4B K K",
        )
        .unwrap()
        .unwrap();
        m.role = Some(PeerRole::Sync);

        let (mut output, registry) = output();
        output.send_measurement(&m).await.unwrap();
        let text = exported(&registry).await;
        assert!(text.contains(
            "ntpmon_peer_offset_seconds{mode=\"server\",refid=\"GPSs\",rx_timestamp=\"kernel\",\
             source=\"17.253.66.253\",tx_timestamp=\"kernel\",type=\"sync\"} "
        ));
        assert!(text.contains("# TYPE ntpmon_peer_score gauge"));
        assert!(text.contains("# TYPE ntpmon_peer_root_dispersion_seconds gauge"));
    }
}
