use std::net::SocketAddr;
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::rpc::proto::peer_server::{Peer, PeerServer};
use crate::rpc::proto::{Empty, RaftFrame, ReadChunk, ReadRequest};
use crate::rpc::CHUNK_SIZE;
use crate::store::cache::Cache;
use crate::store::data::{DataDriver, PayloadReader};
use crate::task::spawn_named;

/// The peer-facing service: raft transport ingress plus streamed payload
/// reads. Payloads are served from the cache when present there, from the
/// home store otherwise.
#[derive(Clone)]
pub struct PeerService {
    data: Arc<DataDriver>,
    cache: Arc<Cache>,
    raft_inbound: mpsc::Sender<Message>,
}

impl PeerService {
    pub fn new(
        data: Arc<DataDriver>,
        cache: Arc<Cache>,
        raft_inbound: mpsc::Sender<Message>,
    ) -> Self {
        PeerService {
            data,
            cache,
            raft_inbound,
        }
    }
}

#[tonic::async_trait]
impl Peer for PeerService {
    async fn step(&self, request: Request<RaftFrame>) -> Result<Response<Empty>, Status> {
        let message = Message::parse_from_bytes(&request.into_inner().payload)
            .map_err(|e| Status::invalid_argument(format!("undecodable raft message: {e}")))?;
        self.raft_inbound
            .send(message)
            .await
            .map_err(|_| Status::unavailable("raft is shut down"))?;
        Ok(Response::new(Empty {}))
    }

    type ReadStream = ReceiverStream<Result<ReadChunk, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let req = request.into_inner();
        debug!(id = req.id, version = req.version, "received payload read request");

        let reader = if self.cache.contains(req.id, req.version) {
            self.cache.reader(req.id, req.version).await
        } else if self.data.contains(req.id, req.version) {
            self.data.reader(req.id, req.version).await
        } else {
            debug!(id = req.id, version = req.version, "payload not known here");
            return Err(Status::not_found("no such file"));
        };
        let reader = reader.map_err(|e| Status::internal(e.to_string()))?;

        let (tx, rx) = mpsc::channel(8);
        spawn_named("payload-serve", stream_payload(reader, req, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

async fn stream_payload(
    mut reader: PayloadReader,
    req: ReadRequest,
    tx: mpsc::Sender<Result<ReadChunk, Status>>,
) {
    // empty frame first: confirms we hold the payload
    if tx.send(Ok(ReadChunk { content: vec![] })).await.is_err() {
        return;
    }

    let mut offset = req.offset;
    let mut remaining = if req.size == 0 { u64::MAX } else { req.size };
    while remaining > 0 {
        let want = CHUNK_SIZE.min(remaining.min(usize::MAX as u64) as usize);
        let chunk = match reader.read_at(offset, want).await {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(id = req.id, version = req.version, "reading payload: {e}");
                let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                return;
            }
        };
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        remaining -= chunk.len() as u64;
        if tx.send(Ok(ReadChunk { content: chunk })).await.is_err() {
            return;
        }
    }
}

/// Serves the peer endpoint until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    service: PeerService,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    info!(%addr, "peer endpoint listening");
    tonic::transport::Server::builder()
        .add_service(PeerServer::new(service))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await
}
