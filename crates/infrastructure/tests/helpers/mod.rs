#![allow(dead_code)]
pub mod doq_server_mock;
pub mod fake_doq;

pub use doq_server_mock::MockDoqServer;
pub use fake_doq::{FakeDialer, ServerBehavior, StreamOpenBehavior};

use doqfwd_infrastructure::dns::forwarding::MessageBuilder;
use doqfwd_infrastructure::dns::set_message_id;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;

pub fn query_with_id(domain: &str, id: u16) -> Message {
    let mut query = MessageBuilder::build_query(domain, RecordType::A).unwrap();
    set_message_id(&mut query, id);
    query
}

/// Distinct non-zero query IDs.
pub fn distinct_ids(count: usize) -> Vec<u16> {
    let mut ids: Vec<u16> = (1..=u16::MAX).collect();
    fastrand::shuffle(&mut ids);
    ids.truncate(count);
    ids
}

/// Answer to a DNS query: the query's ID and question plus one A record.
pub fn build_mock_response(query: &[u8]) -> Vec<u8> {
    if query.len() < 12 {
        return vec![];
    }

    let mut response = Vec::with_capacity(512);
    response.extend_from_slice(&query[0..2]);
    response.push(0x81);
    response.push(0x80);
    response.extend_from_slice(&query[4..6]);
    response.extend_from_slice(&[0x00, 0x01]);
    response.extend_from_slice(&[0x00, 0x00]);
    response.extend_from_slice(&[0x00, 0x00]);
    response.extend_from_slice(&query[12..]);
    response.extend_from_slice(&[
        0xc0, 0x0c,
        0x00, 0x01,
        0x00, 0x01,
        0x00, 0x00, 0x00, 0x3c,
        0x00, 0x04,
        93, 184, 216, 34,
    ]);
    response
}
