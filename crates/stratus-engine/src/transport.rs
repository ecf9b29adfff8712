//! Framed RPC transport over injected streams.
//!
//! The engine never opens sockets itself. Outbound, it asks a
//! [`Dialer`] for a raw duplex stream to a peer address; the daemon
//! injects a dialer that performs the HTTPS upgrade against the
//! peer's database endpoint. Inbound, the endpoint layer hands
//! upgraded streams to [`StreamServer::serve`].
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::command::{ApplyOutcome, Batch, StratusRaft, TypeConfig};

/// Upper bound on a single frame; a snapshot of a small cluster's
/// state fits far below this.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// A bidirectional byte stream the transport can run over.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Capability handle for opening replication streams to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<Box<dyn RawStream>>;
}

/// RPCs carried over a replication stream.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<u64>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// A write batch forwarded to the leader by a non-leader member.
    Propose(Batch),
}

/// Replies matching [`RpcRequest`] variants.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcReply {
    AppendEntries(AppendEntriesResponse<u64>),
    Vote(VoteResponse<u64>),
    InstallSnapshot(InstallSnapshotResponse<u64>),
    Propose(ProposeReply),
    Failed(String),
}

/// Outcome of a forwarded proposal.
#[derive(Debug, Serialize, Deserialize)]
pub enum ProposeReply {
    Applied(ApplyOutcome),
    /// The receiver is not the leader; the hint may name one.
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },
    Failed(String),
}

pub async fn write_frame<S, T>(stream: &mut S, message: &T) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).map_err(io::Error::other)?;
    let len = u32::try_from(payload.len()).map_err(|_| io::Error::other("frame too large"))?;
    if len > MAX_FRAME {
        return Err(io::Error::other("frame too large"));
    }

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await
}

pub async fn read_frame<S, T>(stream: &mut S) -> io::Result<T>
where
    S: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(io::Error::other("frame too large"));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(io::Error::other)
}

/// Creates one [`NetworkConnection`] per peer.
pub struct NetworkFactory {
    dialer: Arc<dyn Dialer>,
}

impl NetworkFactory {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

/// A connection to one peer, re-dialed on demand.
pub struct NetworkConnection {
    target: u64,
    addr: String,
    dialer: Arc<dyn Dialer>,
    stream: Mutex<Option<Box<dyn RawStream>>>,
}

impl NetworkConnection {
    async fn call(&mut self, request: &RpcRequest) -> io::Result<RpcReply> {
        if self.stream.get_mut().unwrap().is_none() {
            debug!(target = self.target, addr = %self.addr, "dialing replication stream");
            let dialed = self.dialer.dial(&self.addr).await?;
            *self.stream.get_mut().unwrap() = Some(dialed);
        }

        // A send or receive failure invalidates the cached stream.
        let stream = self.stream.get_mut().unwrap().as_mut().unwrap();
        let result: io::Result<RpcReply> = async {
            write_frame(stream, request).await?;
            read_frame(stream).await
        }
        .await;

        if result.is_err() {
            *self.stream.get_mut().unwrap() = None;
        }

        result
    }

    fn unreachable<E: std::error::Error>(&self, err: io::Error) -> RPCError<u64, BasicNode, E> {
        RPCError::Unreachable(Unreachable::new(&err))
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            dialer: Arc::clone(&self.dialer),
            stream: Mutex::new(None),
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(&RpcRequest::AppendEntries(rpc)).await {
            Ok(RpcReply::AppendEntries(resp)) => Ok(resp),
            Ok(other) => Err(self.unreachable(unexpected_reply(&other))),
            Err(e) => Err(self.unreachable(e)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(&RpcRequest::Vote(rpc)).await {
            Ok(RpcReply::Vote(resp)) => Ok(resp),
            Ok(other) => Err(self.unreachable(unexpected_reply(&other))),
            Err(e) => Err(self.unreachable(e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        match self.call(&RpcRequest::InstallSnapshot(rpc)).await {
            Ok(RpcReply::InstallSnapshot(resp)) => Ok(resp),
            Ok(other) => Err(self.unreachable(unexpected_reply(&other))),
            Err(e) => Err(self.unreachable(e)),
        }
    }
}

fn unexpected_reply(reply: &RpcReply) -> io::Error {
    match reply {
        RpcReply::Failed(message) => io::Error::other(message.clone()),
        other => io::Error::other(format!("unexpected reply variant: {other:?}")),
    }
}

/// Dial a peer and forward one proposal to it.
pub async fn forward_propose(
    dialer: &dyn Dialer,
    addr: &str,
    batch: Batch,
) -> io::Result<ProposeReply> {
    let mut stream = dialer.dial(addr).await?;
    write_frame(&mut stream, &RpcRequest::Propose(batch)).await?;
    match read_frame(&mut stream).await? {
        RpcReply::Propose(reply) => Ok(reply),
        other => Err(unexpected_reply(&other)),
    }
}

/// Server half: dispatches framed RPCs from one inbound stream to the
/// local raft instance.
#[derive(Clone)]
pub struct StreamServer {
    raft: StratusRaft,
}

impl StreamServer {
    pub fn new(raft: StratusRaft) -> Self {
        Self { raft }
    }

    /// Serve one stream until EOF or a transport error.
    pub async fn serve<S: RawStream>(&self, mut stream: S) {
        loop {
            let request: RpcRequest = match read_frame(&mut stream).await {
                Ok(request) => request,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    debug!(error = %e, "replication stream closed");
                    return;
                }
            };

            let reply = self.dispatch(request).await;
            if let Err(e) = write_frame(&mut stream, &reply).await {
                warn!(error = %e, "failed to write replication reply");
                return;
            }
        }
    }

    async fn dispatch(&self, request: RpcRequest) -> RpcReply {
        match request {
            RpcRequest::AppendEntries(rpc) => match self.raft.append_entries(rpc).await {
                Ok(resp) => RpcReply::AppendEntries(resp),
                Err(e) => RpcReply::Failed(e.to_string()),
            },
            RpcRequest::Vote(rpc) => match self.raft.vote(rpc).await {
                Ok(resp) => RpcReply::Vote(resp),
                Err(e) => RpcReply::Failed(e.to_string()),
            },
            RpcRequest::InstallSnapshot(rpc) => match self.raft.install_snapshot(rpc).await {
                Ok(resp) => RpcReply::InstallSnapshot(resp),
                Err(e) => RpcReply::Failed(e.to_string()),
            },
            RpcRequest::Propose(batch) => RpcReply::Propose(self.propose(batch).await),
        }
    }

    async fn propose(&self, batch: Batch) -> ProposeReply {
        use openraft::error::ClientWriteError;

        match self.raft.client_write(batch).await {
            Ok(ClientWriteResponse { data, .. }) => ProposeReply::Applied(data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                ProposeReply::NotLeader {
                    leader_id: forward.leader_id,
                    leader_addr: forward.leader_node.map(|n| n.addr),
                }
            }
            Err(e) => ProposeReply::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let batch = Batch::new().put("members", "c1", "{}".into());
        let request = RpcRequest::Propose(batch);
        write_frame(&mut a, &request).await.unwrap();

        let received: RpcRequest = read_frame(&mut b).await.unwrap();
        match received {
            RpcRequest::Propose(batch) => assert_eq!(batch.writes.len(), 1),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Hand-write a frame header claiming 1 GiB.
        a.write_all(&(1u32 << 30).to_be_bytes()).await.unwrap();
        let err = read_frame::<_, RpcRequest>(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_unexpected_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = read_frame::<_, RpcRequest>(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
