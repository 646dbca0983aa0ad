use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record};
use rustc_hash::FxHashMap;
use tracing::{debug, error};

const HOSTS_TTL: u32 = 3600;

/// One parsed hosts source: `(name, v6?) → address` lookups.
#[derive(Debug, Default)]
pub struct HostsReader {
    v4: FxHashMap<String, IpAddr>,
    v6: FxHashMap<String, IpAddr>,
}

impl HostsReader {
    /// Parse hosts-file text: `ip hostname [aliases...]`, `#` comments.
    /// Malformed lines are logged and skipped.
    pub fn from_text(text: &str) -> Self {
        let mut reader = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(idx) => &line[..idx],
                None => line,
            };
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else {
                continue;
            };
            let ip = match addr.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(err) => {
                    debug!(line = line_no + 1, entry = %addr, error = %err, "bad hosts entry");
                    continue;
                }
            };
            for hostname in fields {
                reader.insert(hostname, ip);
            }
        }
        reader
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read hosts file: {}", path.display()))?;
        Ok(Self::from_text(&raw))
    }

    /// Build from explicit `hostname → ip` pairs (inline config entries).
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut reader = Self::default();
        for (hostname, addr) in entries {
            match addr.parse::<IpAddr>() {
                Ok(ip) => reader.insert(hostname, ip),
                Err(err) => error!(host = %hostname, entry = %addr, error = %err, "bad hosts entry"),
            }
        }
        reader
    }

    fn insert(&mut self, hostname: &str, ip: IpAddr) {
        let key = hostname.trim_end_matches('.').to_ascii_lowercase();
        if key.is_empty() {
            return;
        }
        match ip {
            IpAddr::V4(_) => self.v4.insert(key, ip),
            IpAddr::V6(_) => self.v6.insert(key, ip),
        };
    }

    /// Lookup by the name exactly as given (lowercased). Names are
    /// stored without a trailing dot; the dispatcher retries with the
    /// dot trimmed.
    pub fn ip(&self, name: &str, v6: bool) -> Option<IpAddr> {
        let key = name.to_ascii_lowercase();
        let map = if v6 { &self.v6 } else { &self.v4 };
        map.get(&key).copied()
    }

    /// Synthesize the answer record for a hosts hit.
    pub fn record(&self, name: &str, v6: bool) -> Option<Record> {
        let ip = self.ip(name, v6)?;
        let owner = match Name::from_str(name) {
            Ok(owner) => owner,
            Err(err) => {
                error!(name = %name, error = %err, "make hosts record failed");
                return None;
            }
        };
        let rdata = match ip {
            IpAddr::V4(v4) => RData::A(A(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
        };
        Some(Record::from_rdata(owner, HOSTS_TTL, rdata))
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}
