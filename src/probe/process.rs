//! NTP daemon discovery through the OS process table.

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use super::Implementation;
use crate::metrics::MetricSet;

/// Process names searched for, in order of preference.
pub const PROCESS_NAMES: [&str; 2] = ["chronyd", "ntpd"];

/// The running NTP daemon, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NtpProcess {
    pub name: Option<String>,
    /// Seconds since the process started, or -1 if it isn't running.
    pub runtime: i64,
}

impl NtpProcess {
    /// Search the process table for a known NTP daemon.
    ///
    /// This blocks while the process table is read.
    pub fn find() -> Self {
        Self::find_named(&PROCESS_NAMES)
    }

    pub fn find_named(names: &[&str]) -> Self {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        let candidates = system
            .processes()
            .values()
            .map(|p| (p.name().to_string_lossy().into_owned(), p.run_time()));
        Self::select(candidates, names)
    }

    /// Pick the first candidate whose name matches, preferring earlier names.
    fn select<I>(candidates: I, names: &[&str]) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let found: Vec<(String, u64)> = candidates
            .into_iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .collect();
        for wanted in names {
            if let Some((name, runtime)) = found.iter().find(|(name, _)| name == wanted) {
                tracing::debug!("found {} running for {} seconds", name, runtime);
                return Self {
                    name: Some(name.clone()),
                    runtime: i64::try_from(*runtime).unwrap_or(i64::MAX),
                };
            }
        }
        Self::not_running()
    }

    pub fn not_running() -> Self {
        Self {
            name: None,
            runtime: -1,
        }
    }

    pub fn is_running(&self) -> bool {
        self.name.is_some()
    }

    pub fn implementation(&self) -> Option<Implementation> {
        self.name.as_deref().and_then(Implementation::from_process_name)
    }

    pub fn metrics(&self) -> MetricSet {
        MetricSet::from([("runtime".to_string(), Some(self.runtime as f64))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(list: &[(&str, u64)]) -> Vec<(String, u64)> {
        list.iter().map(|(n, t)| (n.to_string(), *t)).collect()
    }

    #[test]
    fn test_select_matching_process() {
        let p = NtpProcess::select(
            candidates(&[("systemd", 9000), ("ntpd", 1234), ("bash", 5)]),
            &PROCESS_NAMES,
        );
        assert_eq!(p.name.as_deref(), Some("ntpd"));
        assert_eq!(p.runtime, 1234);
        assert_eq!(p.implementation(), Some(Implementation::Ntpd));
        assert_eq!(p.metrics()["runtime"], Some(1234.0));
    }

    #[test]
    fn test_select_prefers_chronyd() {
        let p = NtpProcess::select(
            candidates(&[("ntpd", 10), ("chronyd", 20)]),
            &PROCESS_NAMES,
        );
        assert_eq!(p.implementation(), Some(Implementation::Chronyd));
    }

    #[test]
    fn test_no_process() {
        let p = NtpProcess::select(candidates(&[("sshd", 100)]), &PROCESS_NAMES);
        assert!(!p.is_running());
        assert_eq!(p.runtime, -1);
        assert_eq!(p.implementation(), None);
        assert_eq!(p.metrics()["runtime"], Some(-1.0));
    }
}
