use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Streaming};

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::FileId;
use crate::rpc::proto::peer_client::PeerClient as GrpcPeerClient;
use crate::rpc::proto::{RaftFrame, ReadChunk, ReadRequest};
use crate::raft::SEND_TIMEOUT;

/// A successful connect is only counted once the serving peer has sent its
/// empty confirmation frame.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Lazily connected client for one remote peer.
#[derive(Clone)]
pub struct PeerClient {
    addr: String,
    client: GrpcPeerClient<Channel>,
}

impl PeerClient {
    pub fn connect_lazy(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| SporkError::Transport(format!("bad peer address {addr}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true);
        Ok(PeerClient {
            addr: addr.to_string(),
            client: GrpcPeerClient::new(endpoint.connect_lazy()),
        })
    }

    /// Forwards one raw consensus message; bounded by the send deadline.
    pub async fn step(&self, message: Message) -> Result<()> {
        let payload = message
            .write_to_bytes()
            .map_err(|e| SporkError::Corruption(e.to_string()))?;
        let mut client = self.client.clone();
        tokio::time::timeout(SEND_TIMEOUT, client.step(RaftFrame { payload }))
            .await
            .map_err(|_| SporkError::Transport(format!("step to {} timed out", self.addr)))?
            .map_err(|status| {
                SporkError::Transport(format!("step to {}: {}", self.addr, status.message()))
            })?;
        Ok(())
    }

    /// Opens a payload stream for `(id, version)`. The confirmation frame
    /// is consumed here; the returned stream yields only payload chunks.
    pub async fn read(&self, id: FileId, version: u64) -> Result<Streaming<ReadChunk>> {
        let mut client = self.client.clone();
        let request = ReadRequest {
            id,
            version,
            offset: 0,
            size: 0,
        };

        let connect = async move {
            let mut stream = client.read(request).await?.into_inner();
            stream.message().await?;
            Ok::<_, tonic::Status>(stream)
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Err(_) => Err(SporkError::Transport(format!(
                "couldn't connect to peer {}",
                self.addr
            ))),
            Ok(Err(status)) if status.code() == Code::NotFound => Err(SporkError::NoSuchFile),
            Ok(Err(status)) => Err(SporkError::Transport(format!(
                "reading {id}-{version} from {}: {}",
                self.addr,
                status.message()
            ))),
            Ok(Ok(stream)) => Ok(stream),
        }
    }
}
