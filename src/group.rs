use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::rdata::opt::ClientSubnet;
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::matcher::DomainMatcher;
use crate::outbound::Caller;
use crate::probe;
use crate::proto;

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_SLEEP_STEP: Duration = Duration::from_secs(5);
const POLL_SLEEP_CEILING: Duration = Duration::from_secs(30);

/// A named set of upstream callers with its routing policy.
pub struct Group {
    pub name: String,
    pub callers: Vec<Arc<Caller>>,
    pub matcher: Arc<DomainMatcher>,
    /// Fan out to all callers in parallel, first non-empty answer wins.
    pub concurrent: bool,
    /// Fan out, then keep only the lowest-RTT A record.
    pub fastest_v4: bool,
    pub tcp_ping_port: u16,
    pub ecs: Option<ClientSubnet>,
    pub no_cookie: bool,
    pub test_ipv6: Vec<String>,
    pub disable_ipv6: AtomicBool,
    pub ipset: Option<IpsetHandle>,
}

impl Group {
    pub fn new(name: &str, callers: Vec<Arc<Caller>>) -> Self {
        Self {
            name: name.to_string(),
            callers,
            matcher: Arc::new(DomainMatcher::default()),
            concurrent: false,
            fastest_v4: false,
            tcp_ping_port: 0,
            ecs: None,
            no_cookie: false,
            test_ipv6: Vec::new(),
            disable_ipv6: AtomicBool::new(false),
            ipset: None,
        }
    }

    pub fn rule_match(&self, name: &str) -> bool {
        self.matcher.matches(name) == Some(true)
    }

    /// Forward `request` to the group's upstreams per its fan-out policy.
    /// Callers report failure as an error; here that becomes `None`.
    async fn call_dns(&self, request: &Message) -> Option<Message> {
        if self.callers.is_empty() {
            return None;
        }
        let mut request = request.clone();
        if let Some(ecs) = &self.ecs {
            proto::set_default_ecs(&mut request, ecs.clone());
        }
        if self.no_cookie {
            proto::remove_edns_cookie(&mut request);
        }

        if !(self.concurrent || self.fastest_v4) {
            for caller in &self.callers {
                debug!(group = %self.name, caller = %caller, question = ?request.queries(), "forward question");
                match caller.call(&request).await {
                    Ok(response) => return Some(response),
                    Err(err) => {
                        debug!(group = %self.name, caller = %caller, error = %err, "query dns error")
                    }
                }
            }
            warn!(group = %self.name, "no result found");
            return None;
        }

        let (tx, mut rx) = mpsc::channel(self.callers.len());
        for caller in &self.callers {
            let tx = tx.clone();
            let caller = Arc::clone(caller);
            let request = request.clone();
            let group = self.name.clone();
            tokio::spawn(async move {
                let result = match caller.call(&request).await {
                    Ok(response) => Some(response),
                    Err(err) => {
                        debug!(group = %group, caller = %caller, error = %err, "query dns error");
                        None
                    }
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        if self.fastest_v4 {
            return probe::fastest_a(&mut rx, self.callers.len(), self.tcp_ping_port).await;
        }
        for _ in 0..self.callers.len() {
            match rx.recv().await {
                Some(Some(response)) => return Some(response),
                Some(None) => continue,
                None => break,
            }
        }
        warn!(group = %self.name, "no result found");
        None
    }

    /// `call_dns` plus the group's IPv6 policy: when disabled, every AAAA
    /// answer comes back as `::`.
    pub async fn query(&self, request: &Message) -> Option<Message> {
        let mut records = self.call_dns(request).await?;
        if self.disable_ipv6.load(Ordering::Relaxed) {
            proto::blank_aaaa(&mut records);
        }
        Some(records)
    }

    /// Push every IPv4 answer into the group's kernel set. Best effort:
    /// failures are logged and the reply is unaffected.
    pub async fn add_ipset(&self, response: &Message) {
        let Some(ipset) = &self.ipset else {
            return;
        };
        for (ip, _) in proto::extract_a(response) {
            if let Err(err) = ipset.add(ip).await {
                error!(group = %self.name, ipset = %ipset.name, ip = %ip, error = %err, "add ipset error");
            }
        }
    }

    /// Long-running IPv6 reachability poll. Resolves the probe hostnames
    /// for AAAA (answers memoized, re-resolved every 10th cycle) and
    /// attempts a plain HTTP request to each address; any HTTP response,
    /// whatever the status, means IPv6 works.
    pub async fn poll_ipv6(self: Arc<Self>) {
        if self.test_ipv6.is_empty() {
            return;
        }
        let client = match reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                error!(group = %self.name, error = %err, "ipv6 probe client build failed");
                return;
            }
        };
        let mut count = 0u32;
        let mut memo: HashMap<String, Message> = HashMap::new();
        let mut sleep_time = Duration::ZERO;
        loop {
            let mut disable = true;
            let old = self.disable_ipv6.load(Ordering::Relaxed);
            'domains: for domain in &self.test_ipv6 {
                let records = if count != 0 && memo.contains_key(domain) {
                    memo.get(domain).cloned()
                } else {
                    match aaaa_query(domain) {
                        Some(msg) => self.call_dns(&msg).await,
                        None => continue,
                    }
                };
                let Some(records) = records else {
                    continue;
                };
                for record in records.answers() {
                    if let Some(RData::AAAA(aaaa)) = record.data() {
                        memo.insert(domain.clone(), records.clone());
                        if test_http_conn(&client, aaaa.0, domain).await {
                            disable = false;
                            break 'domains;
                        }
                    }
                }
            }
            if disable != old {
                self.disable_ipv6.store(disable, Ordering::Relaxed);
                info!(group = %self.name, enabled = !disable, "ipv6 policy changed");
            }
            count = (count + 1) % 10;
            if sleep_time <= POLL_SLEEP_CEILING {
                sleep_time += POLL_SLEEP_STEP;
            }
            tokio::time::sleep(sleep_time).await;
        }
    }
}

fn aaaa_query(domain: &str) -> Option<Message> {
    let name = Name::from_str(&format!("{domain}.")).ok()?;
    let mut msg = Message::new();
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::AAAA);
    msg.add_query(query);
    Some(msg)
}

async fn test_http_conn(client: &reqwest::Client, addr: Ipv6Addr, host: &str) -> bool {
    let url = format!("http://[{addr}]/");
    match client.get(&url).send().await {
        Ok(resp) => {
            debug!(addr = %addr, host = %host, status = %resp.status(), "ipv6 http probe");
            true
        }
        Err(err) => {
            debug!(addr = %addr, host = %host, error = %err, "ipv6 http probe failed");
            false
        }
    }
}

/// Thin wrapper over the system `ipset` binary.
pub struct IpsetHandle {
    pub name: String,
    pub timeout: u32,
}

impl IpsetHandle {
    pub async fn add(&self, ip: Ipv4Addr) -> Result<()> {
        let output = Command::new("ipset")
            .args(["add", "-exist", &self.name, &ip.to_string()])
            .args(["timeout", &self.timeout.to_string()])
            .output()
            .await
            .context("run ipset")?;
        if !output.status.success() {
            bail!(
                "ipset add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
