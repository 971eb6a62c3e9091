//! Peer parsing for `ntpq -pn` and `chronyc -c sources` output.
//!
//! Each line is classified by its one-character tally code into a
//! [`PeerRole`], validated, normalized to seconds and grouped by role into
//! [`PeerGroups`].

mod stats;

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Peer roles, assigned from the tally code of a peer line.
///
/// Roles overlap: a `pps` peer is also a `sync` peer, `sync` and `pps` peers
/// are also survivors, and every accepted peer is counted under `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Invalid,
    False,
    Excess,
    Backup,
    Outlier,
    Survivor,
    Sync,
    Pps,
    Unknown,
    All,
}

/// Tally codes for each role.
///
/// See <http://www.eecis.udel.edu/~mills/ntp/html/decode.html#peer> and
/// <http://www.eecis.udel.edu/~mills/ntp/html/ntpq.html#pe>. The `invalid`
/// set includes chrony's two extra classifications.
const TALLY_CODES: [(PeerRole, &str); 8] = [
    (PeerRole::Invalid, " ~?"),
    (PeerRole::False, "x"),
    (PeerRole::Excess, "."),
    (PeerRole::Backup, "#"),
    (PeerRole::Outlier, "-"),
    (PeerRole::Survivor, "+"),
    (PeerRole::Sync, "*"),
    (PeerRole::Pps, "o"),
];

impl PeerRole {
    /// Every role, in reporting order.
    pub const ALL: [PeerRole; 10] = [
        PeerRole::Invalid,
        PeerRole::False,
        PeerRole::Excess,
        PeerRole::Backup,
        PeerRole::Outlier,
        PeerRole::Survivor,
        PeerRole::Sync,
        PeerRole::Pps,
        PeerRole::Unknown,
        PeerRole::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Invalid => "invalid",
            PeerRole::False => "false",
            PeerRole::Excess => "excess",
            PeerRole::Backup => "backup",
            PeerRole::Outlier => "outlier",
            PeerRole::Survivor => "survivor",
            PeerRole::Sync => "sync",
            PeerRole::Pps => "pps",
            PeerRole::Unknown => "unknown",
            PeerRole::All => "all",
        }
    }

    /// Convert a tally code to a role, or `Unknown` if it isn't recognized.
    pub fn from_tally(tally: char) -> PeerRole {
        TALLY_CODES
            .iter()
            .find(|(_, codes)| codes.contains(tally))
            .map(|(role, _)| *role)
            .unwrap_or(PeerRole::Unknown)
    }

    /// All roles a peer with this primary role is counted under.
    pub fn fan_out(self) -> Vec<PeerRole> {
        let mut roles = vec![self];
        if self == PeerRole::Pps {
            roles.push(PeerRole::Sync);
        }
        if matches!(self, PeerRole::Sync | PeerRole::Pps) {
            roles.push(PeerRole::Survivor);
        }
        if self != PeerRole::All {
            roles.push(PeerRole::All);
        }
        roles
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time since the peer was last polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LastPoll {
    Never,
    SecondsAgo(u64),
}

/// A single validated peer. All times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRecord {
    /// Primary role from the tally code.
    pub role: PeerRole,
    pub address: String,
    pub refid: Option<String>,
    pub stratum: u8,
    pub mode: Option<String>,
    pub when: LastPoll,
    /// Poll interval in seconds.
    pub poll: u64,
    /// Percentage of the last 8 polls which were answered.
    pub reach: f64,
    pub offset: f64,
    /// Measured (unadjusted) offset, chrony only.
    pub moffset: Option<f64>,
    /// Round trip delay, ntpd only.
    pub delay: Option<f64>,
    /// ntpd only.
    pub jitter: Option<f64>,
    /// Estimated error, chrony only.
    pub error: Option<f64>,
}

/// Reasons a peer line is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerLineError {
    #[error("unable to parse peer line: {0}")]
    Unparseable(String),
    #[error("unknown peer tally code: {0:?}")]
    UnknownTally(String),
    #[error("peer {address} has placeholder refid {refid}")]
    IgnoredRefid { address: String, refid: String },
    #[error("stratum is not an integer: {0}")]
    StratumNotInteger(String),
    #[error("stratum out of bounds: {0}")]
    StratumOutOfBounds(i64),
    #[error("last poll time is not an integer: {0}")]
    LastPoll(String),
    #[error("poll interval is not an integer: {0}")]
    Poll(String),
    #[error("reachability is not an 8-bit octal value: {0}")]
    Reach(String),
    #[error("field {field} is not numeric: {value}")]
    NotNumeric { field: &'static str, value: String },
}

/// Reference ids ntpd reports for peers which aren't usable yet.
const IGNORED_REFIDS: [&str; 5] = [".INIT.", ".LOCL.", ".POOL.", ".STEP.", ".XFAC."];

fn noise_patterns() -> &'static [Regex] {
    static NOISE: OnceLock<Vec<Regex>> = OnceLock::new();
    NOISE.get_or_init(|| {
        [
            r"remote\s+refid\s+st\s+t\s+when\s+poll\s+reach\s+",
            r"^=*$",
            r"No association ID.s returned",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Return true if the line is a header, separator or other known noise.
pub fn is_noise_line(line: &str) -> bool {
    noise_patterns().iter().any(|re| re.is_match(line))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Units {
    Seconds,
    Milliseconds,
}

#[derive(Debug)]
enum PollField<'a> {
    Seconds(&'a str),
    PowerOfTwo(&'a str),
}

/// Peer fields as they appear in the source text.
#[derive(Debug)]
struct RawPeer<'a> {
    tally: &'a str,
    address: &'a str,
    refid: Option<&'a str>,
    mode: &'a str,
    stratum: &'a str,
    when: &'a str,
    poll: PollField<'a>,
    reach: &'a str,
    offset: &'a str,
    moffset: Option<&'a str>,
    delay: Option<&'a str>,
    jitter: Option<&'a str>,
    error: Option<&'a str>,
    units: Units,
}

/// `chronyc -c sources`: mode,tally,address,stratum,poll,reach,when,moffset,offset,error
fn chrony_fields<'a>(fields: &[&'a str]) -> Option<RawPeer<'a>> {
    let [mode, tally, address, stratum, poll, reach, when, moffset, offset, error] = fields else {
        return None;
    };
    Some(RawPeer {
        tally,
        address,
        refid: None,
        mode,
        stratum,
        when,
        poll: PollField::PowerOfTwo(poll),
        reach,
        offset,
        moffset: Some(moffset),
        delay: None,
        jitter: None,
        error: Some(error),
        units: Units::Seconds,
    })
}

/// `ntpq -pn`: tally, then address refid st t when poll reach delay offset jitter
fn ntpq_fields<'a>(tally: &'a str, fields: &[&'a str]) -> Option<RawPeer<'a>> {
    let [address, refid, stratum, mode, when, poll, reach, delay, offset, jitter] = fields else {
        return None;
    };
    Some(RawPeer {
        tally,
        address,
        refid: Some(refid),
        mode,
        stratum,
        when,
        poll: PollField::Seconds(poll),
        reach,
        offset,
        moffset: None,
        delay: Some(delay),
        jitter: Some(jitter),
        error: None,
        units: Units::Milliseconds,
    })
}

fn split_peer_line(line: &str) -> Option<RawPeer<'_>> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() == 10 {
        return chrony_fields(&fields);
    }

    let first = line.chars().next()?;
    let (tally, rest) = line.split_at(first.len_utf8());
    let fields: Vec<&str> = rest.split_whitespace().collect();
    ntpq_fields(tally, &fields)
}

/// Convert a time string with an optional m/h/d/y suffix to seconds.
pub fn time_to_seconds(t: &str) -> Option<u64> {
    let (digits, multiplier) = match t.chars().last()? {
        'y' => (&t[..t.len() - 1], 31_557_600),
        'd' => (&t[..t.len() - 1], 86_400),
        'h' => (&t[..t.len() - 1], 3_600),
        'm' => (&t[..t.len() - 1], 60),
        _ => (t, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Convert an octal reachability register to the percentage of bits set.
pub fn reach_to_percent(reach: &str) -> Option<f64> {
    let register = u16::from_str_radix(reach, 8).ok()?;
    if register > 0o377 {
        return None;
    }
    Some(register.count_ones() as f64 * 100.0 / 8.0)
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn parse_seconds(field: &'static str, value: &str, units: Units) -> Result<f64, PeerLineError> {
    let parsed: f64 = value.parse().map_err(|_| PeerLineError::NotNumeric {
        field,
        value: value.to_string(),
    })?;
    let seconds = match units {
        Units::Seconds => parsed,
        Units::Milliseconds => parsed / 1000.0,
    };
    Ok(round6(seconds))
}

fn parse_optional_seconds(
    field: &'static str,
    value: Option<&str>,
    units: Units,
) -> Result<Option<f64>, PeerLineError> {
    value.map(|v| parse_seconds(field, v, units)).transpose()
}

fn validate(raw: RawPeer<'_>) -> Result<PeerRecord, PeerLineError> {
    let mut tally = raw.tally.chars();
    let role = match (tally.next(), tally.next()) {
        (Some(c), None) => PeerRole::from_tally(c),
        _ => PeerRole::Unknown,
    };
    if role == PeerRole::Unknown {
        return Err(PeerLineError::UnknownTally(raw.tally.to_string()));
    }

    if let Some(refid) = raw.refid {
        if IGNORED_REFIDS.contains(&refid) {
            return Err(PeerLineError::IgnoredRefid {
                address: raw.address.to_string(),
                refid: refid.to_string(),
            });
        }
    }

    let stratum: i64 = raw
        .stratum
        .parse()
        .map_err(|_| PeerLineError::StratumNotInteger(raw.stratum.to_string()))?;
    if !(0..=15).contains(&stratum) {
        return Err(PeerLineError::StratumOutOfBounds(stratum));
    }

    let when = if raw.when == "-" {
        LastPoll::Never
    } else {
        time_to_seconds(raw.when)
            .map(LastPoll::SecondsAgo)
            .ok_or_else(|| PeerLineError::LastPoll(raw.when.to_string()))?
    };

    let poll = match raw.poll {
        PollField::Seconds(p) => p.parse::<u64>().ok(),
        PollField::PowerOfTwo(p) => p.parse::<i32>().ok().and_then(|exp| match exp {
            // sub-second polling intervals truncate to zero
            e if e < 0 => Some(0),
            e => 1u64.checked_shl(e as u32),
        }),
    }
    .ok_or_else(|| {
        let (PollField::Seconds(p) | PollField::PowerOfTwo(p)) = raw.poll;
        PeerLineError::Poll(p.to_string())
    })?;

    let reach =
        reach_to_percent(raw.reach).ok_or_else(|| PeerLineError::Reach(raw.reach.to_string()))?;

    Ok(PeerRecord {
        role,
        address: raw.address.to_string(),
        refid: raw.refid.map(str::to_string),
        stratum: stratum as u8,
        mode: Some(raw.mode.to_string()).filter(|m| !m.is_empty()),
        when,
        poll,
        reach,
        offset: parse_seconds("offset", raw.offset, raw.units)?,
        moffset: parse_optional_seconds("moffset", raw.moffset, raw.units)?,
        delay: parse_optional_seconds("delay", raw.delay, raw.units)?,
        jitter: parse_optional_seconds("jitter", raw.jitter, raw.units)?,
        error: parse_optional_seconds("error", raw.error, raw.units)?,
    })
}

/// Parse a single line of peer output.
///
/// Returns `Ok(None)` for noise lines, which are never reported.
pub fn parse_peer_line(line: &str) -> Result<Option<PeerRecord>, PeerLineError> {
    let line = line.trim_end();
    if is_noise_line(line) {
        return Ok(None);
    }
    let raw = split_peer_line(line).ok_or_else(|| PeerLineError::Unparseable(line.to_string()))?;
    validate(raw).map(Some)
}

/// Peers grouped by role. Every role is present, even when empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerGroups {
    roles: BTreeMap<PeerRole, Vec<Arc<PeerRecord>>>,
}

impl Default for PeerGroups {
    fn default() -> Self {
        Self {
            roles: PeerRole::ALL.iter().map(|r| (*r, Vec::new())).collect(),
        }
    }
}

impl PeerGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer under its primary role and every role that includes it.
    pub fn push(&mut self, peer: PeerRecord) {
        let peer = Arc::new(peer);
        for role in peer.role.fan_out() {
            self.roles.entry(role).or_default().push(Arc::clone(&peer));
        }
    }

    pub fn peers(&self, role: PeerRole) -> &[Arc<PeerRecord>] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, role: PeerRole) -> usize {
        self.peers(role).len()
    }

    pub fn addresses(&self, role: PeerRole) -> Vec<&str> {
        self.peers(role).iter().map(|p| p.address.as_str()).collect()
    }

    pub fn offsets(&self, role: PeerRole) -> Vec<f64> {
        self.peers(role).iter().map(|p| p.offset).collect()
    }

    pub fn reachability(&self, role: PeerRole) -> Vec<f64> {
        self.peers(role).iter().map(|p| p.reach).collect()
    }

    /// The most specific role under which `address` appears.
    pub fn role_of(&self, address: &str) -> Option<PeerRole> {
        // pps is included in sync, which is included in survivor
        const LOOKUP_ORDER: [PeerRole; 9] = [
            PeerRole::Pps,
            PeerRole::Sync,
            PeerRole::Invalid,
            PeerRole::False,
            PeerRole::Excess,
            PeerRole::Backup,
            PeerRole::Outlier,
            PeerRole::Survivor,
            PeerRole::Unknown,
        ];
        LOOKUP_ORDER
            .into_iter()
            .find(|role| self.addresses(*role).contains(&address))
    }
}

/// Parse a batch of peer lines. Rejected lines are logged and skipped.
pub fn parse_peers<I, S>(lines: I) -> PeerGroups
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut groups = PeerGroups::new();
    for line in lines {
        match parse_peer_line(line.as_ref()) {
            Ok(Some(peer)) => groups.push(peer),
            Ok(None) => {}
            Err(e) => tracing::warn!("{}", e),
        }
    }
    groups
}

/// The peers reported by one daemon query.
#[derive(Debug, Clone, Default)]
pub struct NtpPeers {
    groups: PeerGroups,
    elapsed: Option<Duration>,
}

impl NtpPeers {
    pub fn new<I, S>(lines: I, elapsed: Option<Duration>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            groups: parse_peers(lines),
            elapsed,
        }
    }

    pub fn groups(&self) -> &PeerGroups {
        &self.groups
    }

    /// Address of the selected sync peer, if any.
    pub fn sync_peer(&self) -> Option<&str> {
        self.groups.peers(PeerRole::Sync).first().map(|p| p.address.as_str())
    }
}
