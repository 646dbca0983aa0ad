use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use rustc_hash::FxHashSet;

/// Preloaded set of exact IPs and CIDR blocks, used to classify answers
/// as in-range ("domestic") or not.
#[derive(Debug, Default)]
pub struct IpRangeSet {
    exact: FxHashSet<IpAddr>,
    subnets: Vec<IpNet>,
}

impl IpRangeSet {
    /// Build from text, one IP or CIDR per line. Blank and malformed
    /// lines are skipped.
    pub fn from_text(text: &str) -> Self {
        let mut exact = FxHashSet::default();
        let mut subnets = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(ip) = line.parse::<IpAddr>() {
                exact.insert(ip);
            } else if let Ok(net) = line.parse::<IpNet>() {
                subnets.push(net);
            }
        }
        Self { exact, subnets }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read ip range file: {}", path.display()))?;
        Ok(Self::from_text(&raw))
    }

    /// Exact-IP index first, then a linear scan over the CIDR blocks.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.exact.contains(&ip) {
            return true;
        }
        self.subnets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.subnets.is_empty()
    }
}
