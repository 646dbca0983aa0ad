use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use hickory_proto::op::{Edns, Message, MessageType};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

/// Build the reply envelope for `request`, moving the answers (and rcode)
/// out of `response` when one exists. An empty envelope is still a
/// well-formed DNS message.
pub fn make_reply(request: &Message, response: Option<Message>) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_queries(request.queries().to_vec());
    if let Some(mut response) = response {
        reply.set_response_code(response.response_code());
        reply.insert_answers(response.take_answers());
    }
    reply
}

pub fn encode(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

/// IPv4 answer records with their addresses, in answer order.
pub fn extract_a(msg: &Message) -> Vec<(Ipv4Addr, Record)> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some((a.0, record.clone())),
            _ => None,
        })
        .collect()
}

/// Every A/AAAA address in the answer section.
pub fn answer_ips(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Drop every A record from the answer section.
pub fn remove_a(msg: &mut Message) {
    let answers = msg.take_answers();
    msg.insert_answers(
        answers
            .into_iter()
            .filter(|record| record.record_type() != RecordType::A)
            .collect(),
    );
}

/// Replace every AAAA answer with an unspecified (`::`) address,
/// preserving answer count and order.
pub fn blank_aaaa(msg: &mut Message) {
    let answers = msg.take_answers();
    msg.insert_answers(
        answers
            .into_iter()
            .map(|record| {
                if record.record_type() == RecordType::AAAA {
                    Record::from_rdata(
                        record.name().clone(),
                        record.ttl(),
                        RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED)),
                    )
                } else {
                    record
                }
            })
            .collect(),
    );
}

/// Decode a `ClientSubnet`'s address and source prefix from its wire form,
/// since the type exposes no accessors for them.
fn decode_ecs_subnet(subnet: &ClientSubnet) -> Option<(IpAddr, u8)> {
    let mut bytes = Vec::new();
    let mut encoder = BinEncoder::new(&mut bytes);
    subnet.emit(&mut encoder).ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let family = u16::from_be_bytes([bytes[0], bytes[1]]);
    let source_prefix = bytes[2];
    let addr_bytes = &bytes[4..];
    match family {
        1 => {
            let mut octets = [0u8; 4];
            let n = addr_bytes.len().min(4);
            octets[..n].copy_from_slice(&addr_bytes[..n]);
            Some((IpAddr::V4(Ipv4Addr::from(octets)), source_prefix))
        }
        2 => {
            let mut octets = [0u8; 16];
            let n = addr_bytes.len().min(16);
            octets[..n].copy_from_slice(&addr_bytes[..n]);
            Some((IpAddr::V6(Ipv6Addr::from(octets)), source_prefix))
        }
        _ => None,
    }
}

/// The request's ECS subnet as `addr/prefix`, if present.
pub fn format_ecs(msg: &Message) -> Option<String> {
    let edns = msg.extensions().as_ref()?;
    match edns.option(EdnsCode::Subnet) {
        Some(EdnsOption::Subnet(subnet)) => {
            let (addr, prefix) = decode_ecs_subnet(subnet)?;
            Some(format!("{}/{}", addr, prefix))
        }
        _ => None,
    }
}

/// Inject `subnet` as the ECS option unless the request already carries one.
pub fn set_default_ecs(msg: &mut Message, subnet: ClientSubnet) {
    if format_ecs(msg).is_some() {
        return;
    }
    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.options_mut().insert(EdnsOption::Subnet(subnet));
}

pub fn remove_edns_cookie(msg: &mut Message) {
    if let Some(edns) = msg.extensions_mut().as_mut() {
        edns.options_mut().remove(EdnsCode::Cookie);
    }
}

/// Minimum answer TTL, 0 when there are no answers.
pub fn min_ttl(msg: &Message) -> u64 {
    msg.answers()
        .iter()
        .map(|record| record.ttl() as u64)
        .min()
        .unwrap_or(0)
}
