use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_proto::rr::rdata::opt::ClientSubnet;
use hickory_proto::rr::RecordType;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::info;

use crate::cache::DnsCache;
use crate::group::{Group, IpsetHandle};
use crate::handler::Snapshot;
use crate::hosts::HostsReader;
use crate::matcher::DomainMatcher;
use crate::outbound::{Caller, Socks5Proxy};
use crate::ranges::IpRangeSet;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub main: MainSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub hosts: HostsSection,
    /// Per-group upstreams and rules. `clean` and `dirty` are required,
    /// `drop` and any custom group are optional.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainSection {
    /// Listen address, default 0.0.0.0:5335.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// udp, tcp or all.
    #[serde(default = "default_network")]
    pub network: Network,
    /// Drop every AAAA question outright.
    #[serde(default)]
    pub disable_ipv6: bool,
    /// Query types answered with an empty reply (e.g. "ANY").
    #[serde(default)]
    pub disable_qtypes: Vec<String>,
    /// gfwlist-format rule file routing matches to the dirty group.
    #[serde(default)]
    pub gfwlist: Option<PathBuf>,
    /// Reference IPv4 ranges, one IP/CIDR per line.
    #[serde(default)]
    pub cnip4: Option<PathBuf>,
    /// Reference IPv6 ranges.
    #[serde(default)]
    pub cnip6: Option<PathBuf>,
}

impl Default for MainSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            network: default_network(),
            disable_ipv6: false,
            disable_qtypes: Vec::new(),
            gfwlist: None,
            cnip4: None,
            cnip6: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Udp,
    Tcp,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_size")]
    pub size: u64,
    /// TTL floor in seconds; answers below it still live this long.
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostsSection {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Inline hostname → address entries.
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GroupSection {
    /// Caller specs: `udp://ip:port`, `tcp://ip:port`,
    /// `tls://name@ip:port`, `https://host/dns-query`.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Inline gfwlist-style rules routing names to this group.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default)]
    pub fastest_v4: bool,
    /// Probe port for fastest_v4; 0 falls back to ICMP.
    #[serde(default)]
    pub tcp_ping_port: u16,
    /// Default ECS subnet, e.g. "203.0.113.0/24".
    #[serde(default)]
    pub ecs: Option<String>,
    #[serde(default)]
    pub no_cookie: bool,
    /// SOCKS5 proxy (`host:port` or `user:pass@host:port`) for
    /// TCP-family callers.
    #[serde(default)]
    pub socks5: Option<String>,
    /// Hostnames probed for IPv6 reachability.
    #[serde(default)]
    pub test_ipv6: Vec<String>,
    #[serde(default)]
    pub ipset: Option<String>,
    #[serde(default = "default_ipset_timeout")]
    pub ipset_timeout: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(target: "config", path = %path.display(), groups = cfg.groups.len(), "config loaded");
    Ok(cfg)
}

/// Assemble the handler snapshot: read rule/range/hosts files, parse the
/// caller specs, compile the matchers. Fails on any malformed section so
/// a bad config never becomes the active snapshot.
pub fn build_snapshot(cfg: &Config) -> Result<Snapshot> {
    let cache = Arc::new(DnsCache::new(
        cfg.cache.size,
        Duration::from_secs(cfg.cache.min_ttl),
        Duration::from_secs(cfg.cache.max_ttl),
    ));

    let gfw_matcher = match &cfg.main.gfwlist {
        Some(path) => Arc::new(DomainMatcher::from_file(path)?),
        None => Arc::new(DomainMatcher::default()),
    };
    let cn_ip4 = match &cfg.main.cnip4 {
        Some(path) => Arc::new(IpRangeSet::from_file(path)?),
        None => Arc::new(IpRangeSet::default()),
    };
    let cn_ip6 = match &cfg.main.cnip6 {
        Some(path) => Arc::new(IpRangeSet::from_file(path)?),
        None => Arc::new(IpRangeSet::default()),
    };

    let mut hosts = Vec::new();
    for path in &cfg.hosts.files {
        hosts.push(Arc::new(HostsReader::from_file(path)?));
    }
    if !cfg.hosts.entries.is_empty() {
        hosts.push(Arc::new(HostsReader::from_entries(
            cfg.hosts
                .entries
                .iter()
                .map(|(name, addr)| (name.as_str(), addr.as_str())),
        )));
    }

    let mut disable_qtypes = FxHashSet::default();
    for qtype in &cfg.main.disable_qtypes {
        let parsed = RecordType::from_str(&qtype.to_ascii_uppercase())
            .with_context(|| format!("unknown query type: {qtype}"))?;
        disable_qtypes.insert(parsed);
    }

    let mut groups = BTreeMap::new();
    for (name, section) in &cfg.groups {
        groups.insert(
            name.clone(),
            Arc::new(build_group(name, section).with_context(|| format!("group {name}"))?),
        );
    }

    Ok(Snapshot {
        disable_ipv6: cfg.main.disable_ipv6,
        cache,
        gfw_matcher,
        cn_ip4,
        cn_ip6,
        hosts,
        groups,
        disable_qtypes,
    })
}

fn build_group(name: &str, section: &GroupSection) -> Result<Group> {
    let proxy = section.socks5.as_deref().map(parse_socks5);
    let timeout = Duration::from_millis(section.timeout_ms);
    let mut callers = Vec::with_capacity(section.servers.len());
    for spec in &section.servers {
        callers.push(Arc::new(Caller::parse(spec, timeout, proxy.clone())?));
    }

    let mut matcher = DomainMatcher::from_text(&section.rules.join("\n"));
    for path in &section.rule_files {
        matcher.extend(DomainMatcher::from_file(path)?);
    }

    let mut group = Group::new(name, callers);
    group.matcher = Arc::new(matcher);
    group.concurrent = section.concurrent;
    group.fastest_v4 = section.fastest_v4;
    group.tcp_ping_port = section.tcp_ping_port;
    group.no_cookie = section.no_cookie;
    group.test_ipv6 = section.test_ipv6.clone();
    if let Some(spec) = &section.ecs {
        group.ecs = Some(parse_ecs(spec)?);
    }
    if let Some(set) = &section.ipset {
        group.ipset = Some(IpsetHandle {
            name: set.clone(),
            timeout: section.ipset_timeout,
        });
    }
    Ok(group)
}

fn parse_ecs(spec: &str) -> Result<ClientSubnet> {
    // a bare address means the full host prefix
    let normalized = if spec.contains('/') {
        spec.to_string()
    } else {
        let addr = spec
            .parse::<IpAddr>()
            .with_context(|| format!("bad ecs address: {spec}"))?;
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        format!("{addr}/{prefix}")
    };
    ClientSubnet::from_str(&normalized)
        .map_err(|err| anyhow::anyhow!("bad ecs subnet {spec}: {err}"))
}

fn parse_socks5(spec: &str) -> Socks5Proxy {
    match spec.rsplit_once('@') {
        Some((creds, server)) => {
            let (user, pass) = creds.split_once(':').unwrap_or((creds, ""));
            Socks5Proxy {
                server: server.to_string(),
                username: Some(user.to_string()),
                password: (!pass.is_empty()).then(|| pass.to_string()),
            }
        }
        None => Socks5Proxy {
            server: spec.to_string(),
            username: None,
            password: None,
        },
    }
}

fn default_listen() -> String {
    "0.0.0.0:5335".to_string()
}

fn default_network() -> Network {
    Network::All
}

fn default_cache_size() -> u64 {
    4096
}

fn default_min_ttl() -> u64 {
    60
}

fn default_max_ttl() -> u64 {
    86_400
}

fn default_ipset_timeout() -> u32 {
    0
}

fn default_timeout_ms() -> u64 {
    2_000
}
