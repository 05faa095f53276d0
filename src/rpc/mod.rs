pub mod client;
pub mod server;

pub mod proto {
    tonic::include_proto!("sporkfs");
}

/// Payload bytes travel in stream frames of at most this size.
pub const CHUNK_SIZE: usize = 1 << 16;
