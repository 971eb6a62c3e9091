//! Per-peer measurements from chronyd `measurements.log` and ntpd `peerstats`.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::output::line_protocol::{FieldValue, Point};
use crate::peers::PeerRole;

/// Days between the MJD epoch and the unix epoch.
const MJD_UNIX_EPOCH: i64 = 40587;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("invalid {field}: {value:?}")]
    Field { field: &'static str, value: String },
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

fn invalid(field: &'static str, value: &str) -> MeasurementError {
    MeasurementError::Field {
        field,
        value: value.to_string(),
    }
}

fn parse<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, MeasurementError> {
    value.parse().map_err(|_| invalid(field, value))
}

/// A measurement of a single peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// The peer's role in the most recent peer list, if known.
    pub role: Option<PeerRole>,
    pub detail: MeasurementDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MeasurementDetail {
    Chrony(ChronyMeasurement),
    Ntpd(NtpdPeerStats),
}

/// One line of chronyd's `measurements.log`.
///
/// chrony logs test results with 1 meaning "passed"; the flags here are
/// inverted so that `true` asserts the failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChronyMeasurement {
    pub leap: u8,
    pub stratum: u8,
    pub duplicate: bool,
    pub bogus: bool,
    pub invalid: bool,
    pub authentication_fail: bool,
    pub synchronized: bool,
    pub bad_header: bool,
    pub exceeded_max_delay: bool,
    pub exceeded_max_delay_ratio: bool,
    pub exceeded_max_delay_dev_ratio: bool,
    pub sync_loop: bool,
    pub local_poll: i64,
    pub remote_poll: i64,
    pub score: f64,
    pub offset: f64,
    pub delay: f64,
    pub dispersion: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub refid: String,
    pub mode: String,
    pub interleaved: bool,
    pub tx_timestamp: String,
    pub rx_timestamp: String,
}

/// One line of ntpd's `peerstats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NtpdPeerStats {
    pub persistent: bool,
    pub authentication_enabled: bool,
    pub authenticated: bool,
    pub reachable: bool,
    pub broadcast: bool,
    pub peertype: PeerRole,
    pub offset: f64,
    pub delay: f64,
    pub dispersion: f64,
    pub jitter: f64,
}

fn skip_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^===|^ *Date").unwrap())
}

fn leap_code(code: &str) -> Result<u8, MeasurementError> {
    match code {
        "N" => Ok(0),
        "+" => Ok(1),
        "-" => Ok(2),
        "?" => Ok(3),
        _ => Err(invalid("leap", code)),
    }
}

fn association_mode(code: char) -> &'static str {
    match code {
        '1' => "active peer",
        '2' => "passive peer",
        '4' => "server",
        _ => "UNKNOWN",
    }
}

fn timestamp_source(code: &str) -> &'static str {
    match code {
        "D" => "daemon",
        "H" => "hardware",
        "K" => "kernel",
        _ => "UNKNOWN",
    }
}

/// Test result flags, one character per test.
fn test_flags<const N: usize>(field: &'static str, value: &str) -> Result<[char; N], MeasurementError> {
    let chars: Vec<char> = value.chars().collect();
    chars.try_into().map_err(|_| invalid(field, value))
}

fn failed(flag: char) -> bool {
    flag == '0'
}

fn parse_chrony_measurement(f: &[&str]) -> Result<Measurement, MeasurementError> {
    let stamp = format!("{} {}", f[0], f[1]);
    let timestamp = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| MeasurementError::Timestamp(stamp.clone()))?
        .and_utc();

    let [duplicate, bogus, invalid_test] = test_flags::<3>("packet tests", f[5])?;
    let [auth_fail, synchronized, bad_header] = test_flags::<3>("header tests", f[6])?;
    let [max_delay, max_delay_ratio, max_delay_dev_ratio, sync_loop] =
        test_flags::<4>("delay tests", f[7])?;
    let mut mode = f[17].chars();
    let (Some(mode_code), Some(interleaved)) = (mode.next(), mode.next()) else {
        return Err(invalid("mode", f[17]));
    };

    Ok(Measurement {
        timestamp,
        source: f[2].to_string(),
        role: None,
        detail: MeasurementDetail::Chrony(ChronyMeasurement {
            leap: leap_code(f[3])?,
            stratum: parse("stratum", f[4])?,
            duplicate: failed(duplicate),
            bogus: failed(bogus),
            invalid: failed(invalid_test),
            authentication_fail: failed(auth_fail),
            synchronized: synchronized == '1',
            bad_header: failed(bad_header),
            exceeded_max_delay: failed(max_delay),
            exceeded_max_delay_ratio: failed(max_delay_ratio),
            exceeded_max_delay_dev_ratio: failed(max_delay_dev_ratio),
            sync_loop: failed(sync_loop),
            local_poll: parse("local poll", f[8])?,
            remote_poll: parse("remote poll", f[9])?,
            score: parse("score", f[10])?,
            offset: parse("offset", f[11])?,
            delay: parse("delay", f[12])?,
            dispersion: parse("dispersion", f[13])?,
            root_delay: parse("root delay", f[14])?,
            root_dispersion: parse("root dispersion", f[15])?,
            refid: refid_name(f[16]),
            mode: association_mode(mode_code).to_string(),
            interleaved: interleaved == 'I',
            tx_timestamp: timestamp_source(f[18]).to_string(),
            rx_timestamp: timestamp_source(f[19]).to_string(),
        }),
    })
}

/// chronyd logs reference ids as hex. Show them as text when every byte
/// is printable ASCII, otherwise as an IPv4 address.
fn refid_name(hex: &str) -> String {
    let Ok(id) = u32::from_str_radix(hex, 16) else {
        return hex.to_string();
    };
    if hex.len() != 8 {
        return hex.to_string();
    }
    let bytes = id.to_be_bytes();
    if bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        bytes.iter().map(|b| *b as char).collect()
    } else {
        Ipv4Addr::from(bytes).to_string()
    }
}

/// Convert a modified julian day and seconds past midnight to UTC.
pub fn mjd_to_datetime(day: i64, seconds: f64) -> Option<DateTime<Utc>> {
    if !(0.0..86_401.0).contains(&seconds) {
        return None;
    }
    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * 1e9).round() as u32;
    let secs = (day - MJD_UNIX_EPOCH) * 86_400 + whole as i64;
    Utc.timestamp_opt(secs, nanos.min(999_999_999)).single()
}

/// Peer selection status, from bits 8-10 of the peer status word.
fn selection_role(code: u16) -> PeerRole {
    match code & 0x07 {
        0 => PeerRole::Invalid,
        1 => PeerRole::False,
        2 => PeerRole::Excess,
        3 => PeerRole::Outlier,
        4 => PeerRole::Survivor,
        5 => PeerRole::Backup,
        6 => PeerRole::Sync,
        _ => PeerRole::Pps,
    }
}

fn parse_ntpd_peerstats(f: &[&str]) -> Result<Measurement, MeasurementError> {
    let day: f64 = parse("day", f[0])?;
    let seconds: f64 = parse("seconds", f[1])?;
    let timestamp = mjd_to_datetime(day as i64, seconds)
        .ok_or_else(|| MeasurementError::Timestamp(format!("{} {}", f[0], f[1])))?;

    let status = u16::from_str_radix(f[3], 16).map_err(|_| invalid("status", f[3]))? >> 8;

    Ok(Measurement {
        timestamp,
        source: f[2].to_string(),
        role: None,
        detail: MeasurementDetail::Ntpd(NtpdPeerStats {
            persistent: status & 0x80 != 0,
            authentication_enabled: status & 0x40 != 0,
            authenticated: status & 0x20 != 0,
            reachable: status & 0x10 != 0,
            broadcast: status & 0x08 != 0,
            peertype: selection_role(status),
            offset: parse("offset", f[4])?,
            delay: parse("delay", f[5])?,
            dispersion: parse("dispersion", f[6])?,
            jitter: parse("jitter", f[7])?,
        }),
    })
}

/// Parse one log line.
///
/// Headers, separators and lines of any other shape return `Ok(None)`.
pub fn parse_measurement(line: &str) -> Result<Option<Measurement>, MeasurementError> {
    if skip_pattern().is_match(line) {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.len() {
        20 => parse_chrony_measurement(&fields).map(Some),
        8 => parse_ntpd_peerstats(&fields).map(Some),
        _ => Ok(None),
    }
}

impl Measurement {
    /// Label values identifying the peer.
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![("source", self.source.clone())];
        match &self.detail {
            MeasurementDetail::Chrony(m) => {
                tags.push(("mode", m.mode.clone()));
                tags.push(("refid", m.refid.clone()));
                tags.push(("rx_timestamp", m.rx_timestamp.clone()));
                tags.push(("tx_timestamp", m.tx_timestamp.clone()));
            }
            MeasurementDetail::Ntpd(m) => {
                tags.push(("peertype", m.peertype.to_string()));
            }
        }
        let role = self.role.unwrap_or(PeerRole::Unknown);
        tags.push(("type", role.to_string()));
        tags
    }

    /// Measured values, by name.
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        use FieldValue::{Bool, Float, Integer};
        match &self.detail {
            MeasurementDetail::Chrony(m) => vec![
                ("authentication_fail", Bool(m.authentication_fail)),
                ("bad_header", Bool(m.bad_header)),
                ("bogus", Bool(m.bogus)),
                ("delay", Float(m.delay)),
                ("dispersion", Float(m.dispersion)),
                ("duplicate", Bool(m.duplicate)),
                ("exceeded_max_delay", Bool(m.exceeded_max_delay)),
                ("exceeded_max_delay_dev_ratio", Bool(m.exceeded_max_delay_dev_ratio)),
                ("exceeded_max_delay_ratio", Bool(m.exceeded_max_delay_ratio)),
                ("interleaved", Bool(m.interleaved)),
                ("invalid", Bool(m.invalid)),
                ("leap", Integer(m.leap as i64)),
                ("local_poll", Integer(m.local_poll)),
                ("offset", Float(m.offset)),
                ("remote_poll", Integer(m.remote_poll)),
                ("root_delay", Float(m.root_delay)),
                ("root_dispersion", Float(m.root_dispersion)),
                ("score", Float(m.score)),
                ("stratum", Integer(m.stratum as i64)),
                ("sync_loop", Bool(m.sync_loop)),
                ("synchronized", Bool(m.synchronized)),
            ],
            MeasurementDetail::Ntpd(m) => vec![
                ("authenticated", Bool(m.authenticated)),
                ("authentication_enabled", Bool(m.authentication_enabled)),
                ("broadcast", Bool(m.broadcast)),
                ("delay", Float(m.delay)),
                ("dispersion", Float(m.dispersion)),
                ("jitter", Float(m.jitter)),
                ("offset", Float(m.offset)),
                ("persistent", Bool(m.persistent)),
                ("reachable", Bool(m.reachable)),
            ],
        }
    }

    pub fn to_point(&self, measurement: &str) -> Point {
        let mut point = Point::new(measurement, self.timestamp);
        for (key, value) in self.tags() {
            point = point.tag(key, &value);
        }
        for (key, value) in self.fields() {
            point = point.field(key, value);
        }
        point
    }
}
