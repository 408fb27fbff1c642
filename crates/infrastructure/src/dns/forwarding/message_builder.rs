//! DNS Message Builder
//!
//! Builds the queries `doqfwd query` sends and the synthetic answers the
//! UDP front end returns when the upstream fails.

use doqfwd_domain::DomainError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use std::str::FromStr;

pub struct MessageBuilder;

impl MessageBuilder {
    /// Build a recursive query with a random ID and a single question.
    pub fn build_query(domain: &str, record_type: RecordType) -> Result<Message, DomainError> {
        let mut name = Name::from_str(domain).map_err(|e| {
            DomainError::InvalidDomainName(format!("Invalid domain '{}': {}", domain, e))
        })?;
        name.set_fqdn(true);

        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(record_type);
        query.set_query_class(DNSClass::IN);

        let mut message = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(query);

        Ok(message)
    }

    /// Parse a record type as typed on the command line (`A`, `aaaa`, `MX`...).
    pub fn parse_record_type(record_type: &str) -> Result<RecordType, DomainError> {
        RecordType::from_str(&record_type.to_ascii_uppercase()).map_err(|e| {
            DomainError::InvalidDnsMessage(format!(
                "Unknown record type '{}': {}",
                record_type, e
            ))
        })
    }

    /// SERVFAIL answer echoing the question of `query`.
    pub fn servfail_for(query: &Message) -> Message {
        let mut response = Message::new(query.id(), MessageType::Response, query.op_code());
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(true);
        response.set_response_code(ResponseCode::ServFail);
        for q in query.queries() {
            response.add_query(q.clone());
        }
        response
    }
}
