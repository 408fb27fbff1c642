use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, Record};
use std::net::IpAddr;
use tracing::debug;

/// Flattened view of an upstream answer.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub addresses: Vec<IpAddr>,

    pub cname: Option<String>,

    pub rcode: ResponseCode,

    pub truncated: bool,

    pub min_ttl: Option<u32>,

    /// Answers that are neither A, AAAA nor the first CNAME.
    pub raw_answers: Vec<Record>,
}

impl DnsResponse {
    pub fn is_nodata(&self) -> bool {
        self.rcode == ResponseCode::NoError
            && self.addresses.is_empty()
            && self.cname.is_none()
            && self.raw_answers.is_empty()
    }
}

pub struct ResponseParser;

impl ResponseParser {
    pub fn parse(message: &Message) -> DnsResponse {
        let rcode = message.response_code();
        let truncated = message.truncated();

        let mut addresses = Vec::new();
        let mut cname: Option<String> = None;
        let mut min_ttl: Option<u32> = None;
        let mut raw_answers = Vec::new();

        for record in message.answers() {
            let record_ttl = record.ttl();
            min_ttl = Some(min_ttl.map_or(record_ttl, |current| current.min(record_ttl)));

            match record.data() {
                RData::A(a) => addresses.push(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => addresses.push(IpAddr::V6(aaaa.0)),
                RData::CNAME(canonical) if cname.is_none() => {
                    cname = Some(canonical.to_utf8());
                }
                _ => raw_answers.push(record.clone()),
            }
        }

        debug!(
            rcode = ?rcode,
            addresses = addresses.len(),
            cname = ?cname,
            truncated,
            "DNS response parsed"
        );

        DnsResponse {
            addresses,
            cname,
            rcode,
            truncated,
            min_ttl,
            raw_answers,
        }
    }

    pub fn rcode_to_status(rcode: ResponseCode) -> &'static str {
        match rcode {
            ResponseCode::NoError => "NOERROR",
            ResponseCode::NXDomain => "NXDOMAIN",
            ResponseCode::ServFail => "SERVFAIL",
            ResponseCode::Refused => "REFUSED",
            ResponseCode::NotImp => "NOTIMP",
            ResponseCode::FormErr => "FORMERR",
            _ => "UNKNOWN",
        }
    }
}
