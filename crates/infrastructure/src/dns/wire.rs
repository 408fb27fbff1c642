//! Length-prefixed DNS message framing (RFC 1035 §4.2.2, RFC 9250 §4.2)
//!
//! Every DoQ message on a stream is a 2-byte big-endian length followed by
//! the DNS message.

use super::buffer_pool::{BufferPool, PooledBuffer};
use bytes::BufMut;
use doqfwd_domain::DomainError;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_DNS_MESSAGE_SIZE: usize = 65535;

/// Serializes a message to unframed wire format.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, DomainError> {
    let mut wire = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut wire);
    message.emit(&mut encoder).map_err(|e| {
        DomainError::InvalidDnsMessage(format!("Failed to serialize DNS message: {}", e))
    })?;
    Ok(wire)
}

/// Serializes `message` into a pooled buffer as `length || message`.
pub fn pack_framed(message: &Message, pool: &Arc<BufferPool>) -> Result<PooledBuffer, DomainError> {
    let wire = encode_message(message)?;

    if wire.len() > MAX_DNS_MESSAGE_SIZE {
        return Err(DomainError::InvalidDnsMessage(format!(
            "Message too large: {} bytes (max {})",
            wire.len(),
            MAX_DNS_MESSAGE_SIZE
        )));
    }

    let mut buf = pool.acquire();
    buf.reserve(2 + wire.len());
    buf.put_u16(wire.len() as u16);
    buf.extend_from_slice(&wire);
    Ok(buf)
}

/// Forces the DNS ID of a framed message (octets 2 and 3) to zero.
///
/// DoQ correlates by stream, so queries carry ID 0 (RFC 9250 §4.2.1).
pub fn zero_framed_id(framed: &mut [u8]) {
    if framed.len() >= 4 {
        framed[2] = 0;
        framed[3] = 0;
    }
}

/// Sets the ID of a decoded message.
pub fn set_message_id(message: &mut Message, id: u16) {
    let mut header = *message.header();
    header.set_id(id);
    message.set_header(header);
}

/// Reads one framed message and decodes it.
///
/// Returns the message and the number of bytes consumed, prefix included.
pub async fn read_framed_message<R>(reader: &mut R) -> Result<(Message, usize), DomainError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DomainError::IoError(format!("Failed to read response length: {}", e)))?;

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len == 0 {
        return Err(DomainError::InvalidDnsResponse(
            "Zero-length message".to_string(),
        ));
    }

    let mut response = vec![0u8; response_len];
    reader
        .read_exact(&mut response)
        .await
        .map_err(|e| DomainError::IoError(format!("Failed to read response body: {}", e)))?;

    let message = Message::from_vec(&response)
        .map_err(|e| DomainError::InvalidDnsResponse(format!("Failed to parse DNS message: {}", e)))?;

    Ok((message, 2 + response_len))
}
