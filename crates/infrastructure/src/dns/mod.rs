pub mod buffer_pool;
pub mod forwarding;
pub mod transport;
pub mod wire;

pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use wire::{
    encode_message, pack_framed, read_framed_message, set_message_id, zero_framed_id,
    MAX_DNS_MESSAGE_SIZE,
};
