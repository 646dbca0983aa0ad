use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::BinDecodable;
use rustc_hash::{FxBuildHasher, FxHashSet};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::cache::{fingerprint, DnsCache};
use crate::group::Group;
use crate::hosts::HostsReader;
use crate::matcher::DomainMatcher;
use crate::proto;
use crate::ranges::IpRangeSet;

/// Everything a dispatch reads, swapped as a unit by `refresh`.
pub struct Snapshot {
    pub disable_ipv6: bool,
    pub cache: Arc<DnsCache>,
    pub gfw_matcher: Arc<DomainMatcher>,
    pub cn_ip4: Arc<IpRangeSet>,
    pub cn_ip6: Arc<IpRangeSet>,
    pub hosts: Vec<Arc<HostsReader>>,
    pub groups: BTreeMap<String, Arc<Group>>,
    pub disable_qtypes: FxHashSet<RecordType>,
}

impl Snapshot {
    pub fn validate(&self) -> Result<()> {
        for name in ["clean", "dirty"] {
            match self.groups.get(name) {
                Some(group) if !group.callers.is_empty() => {}
                _ => bail!("dns of clean/dirty group cannot be empty"),
            }
        }
        Ok(())
    }
}

/// The query dispatcher. Requests hold the snapshot read lock end to end;
/// identical in-flight queries are collapsed through per-fingerprint
/// locks whose release wakes one waiter at a time.
pub struct Handler {
    state: RwLock<Snapshot>,
    // entries are created lazily and never removed; the active
    // fingerprint space bounds this map
    inflight: DashMap<String, Arc<Mutex<()>>, FxBuildHasher>,
}

impl Handler {
    pub fn new(snapshot: Snapshot) -> Result<Self> {
        snapshot.validate()?;
        Ok(Self {
            state: RwLock::new(snapshot),
            inflight: DashMap::with_hasher(FxBuildHasher::default()),
        })
    }

    /// Decode, dispatch, encode. The reply is always a well-formed DNS
    /// message even when resolution produced nothing.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<Bytes> {
        let request = Message::from_bytes(packet).context("parse request")?;
        let reply = self.serve(&request, peer).await;
        proto::encode(&reply)
    }

    pub async fn serve(&self, request: &Message, peer: SocketAddr) -> Message {
        let state = self.state.read().await;
        let (response, group) = self.resolve(&state, request, peer).await;
        let reply = proto::make_reply(request, response);
        debug!(client = %peer, answers = ?reply.answers(), "response");
        if let Some(group) = group {
            group.add_ipset(&reply).await;
        }
        reply
    }

    async fn resolve(
        &self,
        state: &Snapshot,
        request: &Message,
        peer: SocketAddr,
    ) -> (Option<Message>, Option<Arc<Group>>) {
        let Some(question) = request.queries().first() else {
            return (None, None);
        };
        let qname = question.name().to_string();
        let qtype = question.query_type();
        debug!(client = %peer, question = ?request.queries(), "question");

        if state.disable_ipv6 && qtype == RecordType::AAAA {
            return (None, None);
        }
        if state.disable_qtypes.contains(&qtype) {
            return (None, None);
        }

        if let Some(hit) = self.hit_hosts(state, request) {
            self.log_query(peer, request, "hit hosts", "");
            return (Some(hit), None);
        }

        let flight = self.flight_lock(&fingerprint(request));
        // wait out any in-flight twin, then look at what it cached
        drop(flight.lock().await);
        if let Some(hit) = state.cache.get(request) {
            self.log_query(peer, request, "hit cache", "");
            return (Some(hit), None);
        }

        // resolution slot, held through the cache write; releasing wakes
        // exactly one queued twin, which re-checks the cache in turn
        let _slot = flight.lock().await;
        if let Some(hit) = state.cache.get(request) {
            self.log_query(peer, request, "hit cache", "");
            return (Some(hit), None);
        }

        if let Some(drop_group) = state.groups.get("drop") {
            if drop_group.rule_match(&qname) {
                return (None, None);
            }
        }

        // rule pass, in group name order
        for (name, group) in &state.groups {
            let matched = group.rule_match(&qname)
                || (name == "dirty" && state.gfw_matcher.matches(&qname) == Some(true));
            if !matched {
                continue;
            }
            self.log_query(peer, request, "match by rules", name);
            let mut response = group.query(request).await;
            if name == "dirty" && response.is_none() {
                if let Some(clean) = state.groups.get("clean") {
                    response = clean.query(request).await;
                }
            } else {
                state.cache.set(request, response.as_ref());
            }
            return (response, Some(Arc::clone(group)));
        }

        // default path: ask clean, trust it while the answer stays in
        // the reference ranges, otherwise re-ask dirty
        let (Some(clean), Some(dirty)) = (
            state.groups.get("clean").cloned(),
            state.groups.get("dirty").cloned(),
        ) else {
            return (None, None);
        };

        let mut group = clean;
        let mut response = group.query(request).await;
        let mut cache_write = true;
        if all_in_range(response.as_ref(), &state.cn_ip4, &state.cn_ip6) {
            let no_ips = response
                .as_ref()
                .map_or(true, |r| proto::answer_ips(r).is_empty());
            if no_ips {
                self.log_query(peer, request, "no ip found", "none");
            } else {
                self.log_query(peer, request, "match cnip", "clean");
            }
        } else {
            group = dirty;
            match group.query(request).await {
                Some(better) => {
                    self.log_query(peer, request, "not match cnip", "dirty");
                    response = Some(better);
                }
                None => {
                    self.log_query(peer, request, "using clean", "dirty");
                    cache_write = false;
                }
            }
        }
        if cache_write {
            state.cache.set(request, response.as_ref());
        }
        (response, Some(group))
    }

    /// A/AAAA hosts lookup; tries the name as sent, then once more with a
    /// single trailing dot trimmed.
    fn hit_hosts(&self, state: &Snapshot, request: &Message) -> Option<Message> {
        let question = request.queries().first()?;
        let qtype = question.query_type();
        if qtype != RecordType::A && qtype != RecordType::AAAA {
            return None;
        }
        let v6 = qtype == RecordType::AAAA;
        let name = question.name().to_string();
        for reader in &state.hosts {
            let mut record = reader.record(&name, v6);
            if record.is_none() {
                if let Some(trimmed) = name.strip_suffix('.') {
                    if !trimmed.is_empty() {
                        record = reader.record(trimmed, v6);
                    }
                }
            }
            if let Some(record) = record {
                let mut msg = Message::new();
                msg.add_answer(record);
                return Some(msg);
            }
        }
        None
    }

    fn flight_lock(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.inflight.get(key) {
            return Arc::clone(&lock);
        }
        Arc::clone(&self.inflight.entry(key.to_string()).or_default())
    }

    fn log_query(&self, peer: SocketAddr, request: &Message, outcome: &str, group: &str) {
        if let Some(question) = request.queries().first() {
            info!(
                target: "query",
                client = %peer,
                question = %question.name(),
                qtype = %question.query_type(),
                group = %group,
                outcome = %outcome,
            );
        }
    }

    /// Replace every snapshot field `target` carries a non-empty value
    /// for. Blocks until all in-flight dispatches drain.
    pub async fn refresh(&self, target: Snapshot) -> Result<()> {
        if !target.groups.is_empty() {
            target.validate()?;
        }
        let mut state = self.state.write().await;
        if !target.groups.is_empty() {
            state.groups = target.groups;
        }
        if !target.gfw_matcher.is_empty() {
            state.gfw_matcher = target.gfw_matcher;
        }
        if !target.cn_ip4.is_empty() {
            state.cn_ip4 = target.cn_ip4;
        }
        if !target.cn_ip6.is_empty() {
            state.cn_ip6 = target.cn_ip6;
        }
        if !target.hosts.is_empty() {
            state.hosts = target.hosts;
        }
        state.cache = target.cache;
        state.disable_qtypes = target.disable_qtypes;
        state.disable_ipv6 = target.disable_ipv6;
        info!("handler snapshot refreshed");
        Ok(())
    }

    /// Pin each DoH caller's hostname once, before it can be asked to
    /// resolve itself: hosts entries first, then a one-shot system
    /// lookup. Call after the server starts to avoid bootstrap loops.
    pub async fn resolve_doh(&self) {
        let state = self.state.read().await;
        for group in state.groups.values() {
            for caller in &group.callers {
                let Some(doh) = caller.as_doh() else {
                    continue;
                };
                let mut ips: Vec<IpAddr> = state
                    .hosts
                    .iter()
                    .filter_map(|reader| reader.ip(doh.host(), false))
                    .collect();
                if ips.is_empty() {
                    match doh.bootstrap().await {
                        Ok(resolved) => ips = resolved,
                        Err(err) => {
                            error!(host = %doh.host(), error = %err, "resolve doh host error");
                            continue;
                        }
                    }
                }
                if ips.is_empty() {
                    error!(host = %doh.host(), "resolve doh host error: no address");
                    continue;
                }
                match doh.pin_servers(&ips) {
                    Ok(()) => info!(host = %doh.host(), servers = ?ips, "resolve doh"),
                    Err(err) => error!(host = %doh.host(), error = %err, "pin doh servers failed"),
                }
            }
        }
    }

    /// Start the IPv6 reachability pollers for the current groups. They
    /// run for the life of the process.
    pub async fn spawn_pollers(&self) {
        let state = self.state.read().await;
        for group in state.groups.values() {
            if !group.test_ipv6.is_empty() {
                tokio::spawn(Arc::clone(group).poll_ipv6());
            }
        }
    }
}

fn all_in_range(response: Option<&Message>, v4: &IpRangeSet, v6: &IpRangeSet) -> bool {
    let Some(response) = response else {
        return true;
    };
    proto::answer_ips(response).into_iter().all(|ip| match ip {
        IpAddr::V4(_) => v4.contains(ip),
        IpAddr::V6(_) => v6.contains(ip),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Caller;
    use hickory_proto::op::{Edns, Query};
    use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
    use hickory_proto::rr::Name;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const PEER: &str = "127.0.0.1:40000";

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(31337);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(qtype);
        msg.add_query(q);
        msg
    }

    fn with_ecs(mut msg: Message, subnet: &str) -> Message {
        let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
        edns.options_mut()
            .insert(EdnsOption::Subnet(ClientSubnet::from_str(subnet).unwrap()));
        msg
    }

    struct Upstream {
        addr: SocketAddr,
        count: Arc<AtomicUsize>,
    }

    async fn spawn_upstream(ips: Vec<IpAddr>, delay: Duration) -> Upstream {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                count2.fetch_add(1, Ordering::SeqCst);
                let Ok(request) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let owner = request.queries()[0].name().clone();
                let mut answers = Message::new();
                for ip in &ips {
                    let rdata = match ip {
                        IpAddr::V4(v4) => {
                            hickory_proto::rr::RData::A(hickory_proto::rr::rdata::A(*v4))
                        }
                        IpAddr::V6(v6) => {
                            hickory_proto::rr::RData::AAAA(hickory_proto::rr::rdata::AAAA(*v6))
                        }
                    };
                    answers.add_answer(hickory_proto::rr::Record::from_rdata(
                        owner.clone(),
                        300,
                        rdata,
                    ));
                }
                let reply = proto::make_reply(&request, Some(answers));
                let _ = sock.send_to(&proto::encode(&reply).unwrap(), peer).await;
            }
        });
        Upstream { addr, count }
    }

    async fn spawn_silent() -> Upstream {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                if sock.recv_from(&mut buf).await.is_err() {
                    break;
                }
                count2.fetch_add(1, Ordering::SeqCst);
            }
        });
        Upstream { addr, count }
    }

    fn group_for(name: &str, upstream: &Upstream, timeout_ms: u64) -> Group {
        let caller = Caller::parse(
            &format!("udp://{}", upstream.addr),
            Duration::from_millis(timeout_ms),
            None,
        )
        .unwrap();
        Group::new(name, vec![Arc::new(caller)])
    }

    fn make_snapshot(groups: Vec<Group>) -> Snapshot {
        let mut map = BTreeMap::new();
        for group in groups {
            map.insert(group.name.clone(), Arc::new(group));
        }
        Snapshot {
            disable_ipv6: false,
            cache: Arc::new(DnsCache::new(
                1024,
                Duration::from_secs(60),
                Duration::from_secs(3600),
            )),
            gfw_matcher: Arc::new(DomainMatcher::default()),
            cn_ip4: Arc::new(IpRangeSet::default()),
            cn_ip6: Arc::new(IpRangeSet::default()),
            hosts: Vec::new(),
            groups: map,
            disable_qtypes: FxHashSet::default(),
        }
    }

    fn peer() -> SocketAddr {
        PEER.parse().unwrap()
    }

    #[tokio::test]
    async fn snapshot_without_dirty_group_is_rejected() {
        let clean = spawn_upstream(vec!["1.1.1.1".parse().unwrap()], Duration::ZERO).await;
        let snapshot = make_snapshot(vec![group_for("clean", &clean, 500)]);
        assert!(Handler::new(snapshot).is_err());
    }

    #[tokio::test]
    async fn snapshot_with_empty_clean_group_is_rejected() {
        let dirty = spawn_upstream(vec!["1.1.1.1".parse().unwrap()], Duration::ZERO).await;
        let snapshot = make_snapshot(vec![
            Group::new("clean", Vec::new()),
            group_for("dirty", &dirty, 500),
        ]);
        assert!(Handler::new(snapshot).is_err());
    }

    async fn basic_handler() -> (Handler, Upstream, Upstream) {
        let clean = spawn_upstream(vec!["101.32.1.1".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
        let mut snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 500),
        ]);
        snapshot.cn_ip4 = Arc::new(IpRangeSet::from_text("101.32.0.0/16\n"));
        let handler = Handler::new(snapshot).unwrap();
        (handler, clean, dirty)
    }

    #[tokio::test]
    async fn in_range_clean_answer_skips_dirty() {
        let (handler, clean, dirty) = basic_handler().await;
        let reply = handler.serve(&query("cn.bing.com.", RecordType::A), peer()).await;
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(101, 32, 1, 1));
        assert_eq!(clean.count.load(Ordering::SeqCst), 1);
        assert_eq!(dirty.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn out_of_range_answer_is_replaced_by_dirty() {
        let clean = spawn_upstream(vec!["93.184.216.34".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
        let mut snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 500),
        ]);
        snapshot.cn_ip4 = Arc::new(IpRangeSet::from_text("101.32.0.0/16\n"));
        let handler = Handler::new(snapshot).unwrap();

        let reply = handler
            .serve(&query("blocked.example.com.", RecordType::A), peer())
            .await;
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(104, 16, 0, 1));
        assert_eq!(dirty.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dirty_failure_keeps_clean_answer_and_skips_cache() {
        let clean = spawn_upstream(vec!["93.184.216.34".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_silent().await;
        let snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 100),
        ]);
        let handler = Handler::new(snapshot).unwrap();

        let request = query("flaky.example.com.", RecordType::A);
        let reply = handler.serve(&request, peer()).await;
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(93, 184, 216, 34));

        // nothing cached: a second serve resolves again
        handler.serve(&request, peer()).await;
        assert_eq!(clean.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_hit_serves_without_upstream_call() {
        let (handler, clean, _dirty) = basic_handler().await;
        let request = query("repeat.example.cn.", RecordType::A);
        let first = handler.serve(&request, peer()).await;
        let second = handler.serve(&request, peer()).await;
        assert_eq!(proto::extract_a(&first), proto::extract_a(&second));
        assert_eq!(clean.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_name_case_shares_cache_entry() {
        let (handler, clean, _dirty) = basic_handler().await;
        handler
            .serve(&query("case.example.cn.", RecordType::A), peer())
            .await;
        handler
            .serve(&query("CASE.Example.CN.", RecordType::A), peer())
            .await;
        assert_eq!(clean.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ecs_subnets_get_separate_cache_entries() {
        let (handler, clean, _dirty) = basic_handler().await;
        let plain = query("geo.example.cn.", RecordType::A);
        handler.serve(&plain, peer()).await;
        handler
            .serve(
                &with_ecs(query("geo.example.cn.", RecordType::A), "203.0.113.0/24"),
                peer(),
            )
            .await;
        assert_eq!(clean.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_queries_resolve_once() {
        let clean = spawn_upstream(
            vec!["101.32.9.9".parse().unwrap()],
            Duration::from_millis(50),
        )
        .await;
        let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
        let mut snapshot = make_snapshot(vec![
            group_for("clean", &clean, 1000),
            group_for("dirty", &dirty, 1000),
        ]);
        snapshot.cn_ip4 = Arc::new(IpRangeSet::from_text("101.32.0.0/16\n"));
        let handler = Arc::new(Handler::new(snapshot).unwrap());

        let tasks = (0..50)
            .map(|_| {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler
                        .serve(&query("twimg.com.", RecordType::A), peer())
                        .await
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            let reply = task.await.unwrap();
            assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(101, 32, 9, 9));
        }
        assert_eq!(clean.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rule_matched_group_is_used_and_cached() {
        let clean = spawn_upstream(vec!["101.32.1.1".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
        let work = spawn_upstream(vec!["93.184.216.34".parse().unwrap()], Duration::ZERO).await;
        let mut work_group = group_for("work", &work, 500);
        work_group.matcher = Arc::new(DomainMatcher::from_text("||example.com\n"));
        let snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 500),
            work_group,
        ]);
        let handler = Handler::new(snapshot).unwrap();

        let request = query("www.example.com.", RecordType::A);
        let reply = handler.serve(&request, peer()).await;
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(clean.count.load(Ordering::SeqCst), 0);
        assert_eq!(dirty.count.load(Ordering::SeqCst), 0);

        // cached under the rule group too
        handler.serve(&request, peer()).await;
        assert_eq!(work.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gfw_listed_name_routes_to_dirty_with_clean_fallback() {
        let clean = spawn_upstream(vec!["93.184.216.34".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_silent().await;
        let mut snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 100),
        ]);
        snapshot.gfw_matcher = Arc::new(DomainMatcher::from_text("||censored.example\n"));
        let handler = Handler::new(snapshot).unwrap();

        let request = query("www.censored.example.", RecordType::A);
        let reply = handler.serve(&request, peer()).await;
        assert_eq!(dirty.count.load(Ordering::SeqCst), 1);
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(93, 184, 216, 34));

        // the fallback answer must not be cached
        handler.serve(&request, peer()).await;
        assert_eq!(clean.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_rule_returns_empty_and_caches_nothing() {
        let clean = spawn_upstream(vec!["101.32.1.1".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
        let mut drop_group = Group::new("drop", Vec::new());
        drop_group.matcher = Arc::new(DomainMatcher::from_text("||drop.me\n"));
        let snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 500),
            drop_group,
        ]);
        let handler = Handler::new(snapshot).unwrap();

        let request = query("drop.me.", RecordType::A);
        let reply = handler.serve(&request, peer()).await;
        assert!(reply.answers().is_empty());
        handler.serve(&request, peer()).await;
        assert_eq!(clean.count.load(Ordering::SeqCst), 0);
        assert_eq!(dirty.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hosts_hit_shortcuts_resolution() {
        let (mut snapshot, clean) = {
            let clean = spawn_upstream(vec!["101.32.1.1".parse().unwrap()], Duration::ZERO).await;
            let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
            (
                make_snapshot(vec![
                    group_for("clean", &clean, 500),
                    group_for("dirty", &dirty, 500),
                ]),
                clean,
            )
        };
        snapshot.hosts = vec![Arc::new(HostsReader::from_entries([(
            "pinned.example",
            "10.11.12.13",
        )]))];
        let handler = Handler::new(snapshot).unwrap();

        let reply = handler
            .serve(&query("pinned.example.", RecordType::A), peer())
            .await;
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(10, 11, 12, 13));
        assert_eq!(clean.count.load(Ordering::SeqCst), 0);

        // AAAA for a v4-only entry falls through to the resolvers
        handler
            .serve(&query("pinned.example.", RecordType::AAAA), peer())
            .await;
        assert_eq!(clean.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_qtype_gets_empty_reply() {
        let (handler, clean, _dirty) = {
            let clean = spawn_upstream(vec!["101.32.1.1".parse().unwrap()], Duration::ZERO).await;
            let dirty = spawn_upstream(vec!["104.16.0.1".parse().unwrap()], Duration::ZERO).await;
            let mut snapshot = make_snapshot(vec![
                group_for("clean", &clean, 500),
                group_for("dirty", &dirty, 500),
            ]);
            snapshot.disable_qtypes = [RecordType::ANY].into_iter().collect();
            (Handler::new(snapshot).unwrap(), clean, dirty)
        };
        let reply = handler
            .serve(&query("anything.example.", RecordType::ANY), peer())
            .await;
        assert!(reply.answers().is_empty());
        assert_eq!(clean.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn global_ipv6_disable_blocks_aaaa() {
        let clean = spawn_upstream(vec!["2001:db8::1".parse().unwrap()], Duration::ZERO).await;
        let dirty = spawn_upstream(vec!["2001:db8::2".parse().unwrap()], Duration::ZERO).await;
        let mut snapshot = make_snapshot(vec![
            group_for("clean", &clean, 500),
            group_for("dirty", &dirty, 500),
        ]);
        snapshot.disable_ipv6 = true;
        let handler = Handler::new(snapshot).unwrap();

        let reply = handler
            .serve(&query("v6.example.", RecordType::AAAA), peer())
            .await;
        assert!(reply.answers().is_empty());
        assert_eq!(clean.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_swaps_groups_and_keeps_them_valid() {
        let (handler, _clean, _dirty) = basic_handler().await;

        let new_clean = spawn_upstream(vec!["101.32.7.7".parse().unwrap()], Duration::ZERO).await;
        let new_dirty = spawn_upstream(vec!["104.16.7.7".parse().unwrap()], Duration::ZERO).await;
        let mut target = make_snapshot(vec![
            group_for("clean", &new_clean, 500),
            group_for("dirty", &new_dirty, 500),
        ]);
        target.cn_ip4 = Arc::new(IpRangeSet::from_text("101.32.0.0/16\n"));
        handler.refresh(target).await.unwrap();

        let reply = handler
            .serve(&query("fresh.example.cn.", RecordType::A), peer())
            .await;
        assert_eq!(proto::extract_a(&reply)[0].0, Ipv4Addr::new(101, 32, 7, 7));
        assert_eq!(new_clean.count.load(Ordering::SeqCst), 1);

        // a refresh target missing clean/dirty is rejected outright
        let bad = make_snapshot(vec![Group::new("clean", Vec::new())]);
        assert!(handler.refresh(bad).await.is_err());
    }
}
