use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::select_ok;
use futures::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tonic::{Status, Streaming};
use tracing::debug;

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::FileId;
use crate::raft::peers::Peers;
use crate::rpc::client::PeerClient;
use crate::rpc::proto::ReadChunk;

/// Most home peers tried at once when fetching a payload.
const CONCURRENT_ATTEMPTS: usize = 3;

/// Streams payloads from remote peers. The "any" path races connection
/// attempts across the home set and the first peer to confirm possession
/// wins; the losers are dropped.
pub struct Fetcher {
    peers: Arc<Peers>,
    clients: HashMap<String, PeerClient>,
}

impl Fetcher {
    pub fn new(peers: Arc<Peers>) -> Result<Self> {
        let mut clients = HashMap::new();
        for addr in peers.addresses() {
            if addr == peers.this_addr() {
                continue;
            }
            clients.insert(addr.to_string(), PeerClient::connect_lazy(addr)?);
        }
        Ok(Fetcher { peers, clients })
    }

    /// Reads `(id, version)` from whichever home peer answers first.
    pub async fn reader(&self, id: FileId, version: u64) -> Result<RemoteReader> {
        let candidates = self.peers.peers_with_file(id);
        if candidates.is_empty() {
            return Err(SporkError::NoSuchFile);
        }

        let attempts: Vec<_> = candidates
            .iter()
            .take(CONCURRENT_ATTEMPTS)
            .filter_map(|peer| self.clients.get(peer))
            .map(|client| Box::pin(client.read(id, version)))
            .collect();
        if attempts.is_empty() {
            return Err(SporkError::NoSuchFile);
        }

        match select_ok(attempts).await {
            Ok((stream, _losers)) => Ok(RemoteReader::new(stream)),
            Err(e) => {
                debug!(id, version, "no home peer could serve the payload: {e}");
                Err(SporkError::NoSuchFile)
            }
        }
    }

    /// Reads `(id, version)` from one specific peer, typically the proposer
    /// hint carried by a change entry.
    pub async fn reader_from_peer(
        &self,
        id: FileId,
        version: u64,
        peer: &str,
    ) -> Result<RemoteReader> {
        let client = self
            .clients
            .get(peer)
            .ok_or_else(|| SporkError::Transport(format!("unknown peer {peer}")))?;
        Ok(RemoteReader::new(client.read(id, version).await?))
    }
}

fn chunk_to_bytes(result: std::result::Result<ReadChunk, Status>) -> io::Result<Bytes> {
    result
        .map(|chunk| Bytes::from(chunk.content))
        .map_err(io::Error::other)
}

type ChunkStream = futures::stream::Map<
    Streaming<ReadChunk>,
    fn(std::result::Result<ReadChunk, Status>) -> io::Result<Bytes>,
>;

/// Byte-oriented view over a remote payload stream.
pub struct RemoteReader {
    inner: StreamReader<ChunkStream, Bytes>,
}

impl RemoteReader {
    fn new(stream: Streaming<ReadChunk>) -> Self {
        RemoteReader {
            inner: StreamReader::new(stream.map(chunk_to_bytes as fn(_) -> _)),
        }
    }
}

impl AsyncRead for RemoteReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}
