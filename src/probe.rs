use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use futures::future::join_all;
use hickory_proto::op::Message;
use hickory_proto::rr::Record;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proto;

/// Probe cap in milliseconds; `MAX_RTT + 1` is the unreachable sentinel.
pub const MAX_RTT: u64 = 500;

/// Round-trip latency to `ip` in milliseconds. `tcp_port > 0` measures a
/// TCP connect, otherwise a single ICMP echo (needs privilege). Failure
/// is never an error, just the sentinel.
pub async fn ping_rtt(ip: IpAddr, tcp_port: u16) -> u64 {
    let cap = Duration::from_millis(MAX_RTT);
    if tcp_port > 0 {
        let begin = Instant::now();
        return match timeout(cap, TcpStream::connect((ip, tcp_port))).await {
            Ok(Ok(conn)) => {
                drop(conn);
                begin.elapsed().as_millis() as u64
            }
            _ => MAX_RTT + 1,
        };
    }
    let payload = [0u8; 56];
    match timeout(cap, surge_ping::ping(ip, &payload)).await {
        Ok(Ok((_packet, rtt))) => rtt.as_millis() as u64,
        Ok(Err(err)) => {
            debug!(ip = %ip, error = %err, "icmp probe failed");
            MAX_RTT + 1
        }
        Err(_) => MAX_RTT + 1,
    }
}

/// Drain exactly `ch_len` candidate responses, probe every distinct
/// IPv4 answer concurrently, and rewrite the kept response down to the
/// single lowest-RTT A record. When nothing is reachable the response is
/// returned unchanged; `None` only when every candidate was nil.
pub async fn fastest_a(
    rx: &mut mpsc::Receiver<Option<Message>>,
    ch_len: usize,
    tcp_port: u16,
) -> Option<Message> {
    let mut res: Option<Message> = None;
    let mut candidates: FxHashMap<Ipv4Addr, Record> = FxHashMap::default();
    for _ in 0..ch_len {
        let Some(msg) = rx.recv().await else {
            break;
        };
        if let Some(msg) = msg {
            for (ip, record) in proto::extract_a(&msg) {
                candidates.entry(ip).or_insert(record);
            }
            // keep the latest non-nil so a trailing nil cannot clobber it
            res = Some(msg);
        }
    }
    let mut res = res?;

    let ips: Vec<Ipv4Addr> = candidates.keys().copied().collect();
    let probes = ips
        .into_iter()
        .map(|ip| async move { (ip, ping_rtt(IpAddr::V4(ip), tcp_port).await) });
    let mut fastest: Option<(Ipv4Addr, u64)> = None;
    for (ip, rtt) in join_all(probes).await {
        if rtt < MAX_RTT && fastest.map_or(true, |(_, best)| rtt < best) {
            fastest = Some((ip, rtt));
        }
    }

    if let Some((ip, rtt)) = fastest {
        if let Some(record) = candidates.remove(&ip) {
            debug!(ip = %ip, rtt_ms = rtt, "fastest ipv4 selected");
            proto::remove_a(&mut res);
            res.add_answer(record);
            return Some(res);
        }
    }
    warn!("find fastest ipv4 failed");
    Some(res)
}
