//! Typed RPC channel to one participant.
//!
//! Every call is bounded by the configured timeout. Transport failures,
//! timeouts, decode failures, and a `false` ABORT reply all surface as plain
//! errors; the engine treats them uniformly as "participant unreachable".

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;

use crate::rpc::{
    self, CommitOutcome, DelCommand, GetCommand, RpcConnection, RpcRequest, RpcResponse,
    SetCommand,
};

pub struct ParticipantClient {
    addr: SocketAddr,
    timeout: Duration,
    conn: Mutex<RpcConnection>,
}

impl ParticipantClient {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> anyhow::Result<Self> {
        let stream = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect timed out for {addr}"))?
            .map_err(|err| anyhow::anyhow!("connect failed for {addr}: {err}"))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            timeout,
            conn: Mutex::new(rpc::framed(stream)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn call(&self, req: RpcRequest) -> anyhow::Result<RpcResponse> {
        let mut conn = self.conn.lock().await;
        time::timeout(self.timeout, async {
            rpc::send_frame(&mut conn, &req).await?;
            match rpc::read_frame::<RpcResponse>(&mut conn).await? {
                Some(RpcResponse::Error(msg)) => {
                    anyhow::bail!("participant {} failed the call: {msg}", self.addr)
                }
                Some(resp) => Ok(resp),
                None => anyhow::bail!("participant {} closed the connection", self.addr),
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("rpc timed out for {}", self.addr))?
    }

    pub async fn heartbeat(&self) -> anyhow::Result<()> {
        match self.call(RpcRequest::Heartbeat).await? {
            RpcResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected HEARTBEAT reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn next_id(&self) -> anyhow::Result<u32> {
        match self.call(RpcRequest::NextId).await? {
            RpcResponse::NextId(id) => Ok(id),
            other => anyhow::bail!("unexpected NEXT_ID reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn set_next_id(&self, next_id: u32) -> anyhow::Result<()> {
        match self.call(RpcRequest::SetNextId { next_id }).await? {
            RpcResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected SET_NEXT_ID reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn prepare_set(&self, cmd: SetCommand) -> anyhow::Result<bool> {
        match self.call(RpcRequest::PrepareSet(cmd)).await? {
            RpcResponse::Vote(ok) => Ok(ok),
            other => anyhow::bail!("unexpected PREPARE_SET reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn prepare_del(&self, cmd: DelCommand) -> anyhow::Result<bool> {
        match self.call(RpcRequest::PrepareDel(cmd)).await? {
            RpcResponse::Vote(ok) => Ok(ok),
            other => anyhow::bail!("unexpected PREPARE_DEL reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn commit(&self, tid: u32) -> anyhow::Result<CommitOutcome> {
        match self.call(RpcRequest::Commit { tid }).await? {
            RpcResponse::Committed(outcome) => Ok(outcome),
            other => anyhow::bail!("unexpected COMMIT reply from {}: {other:?}", self.addr),
        }
    }

    /// A `false` reply means the participant is malfunctioning; callers treat
    /// it like any other failure and drop the participant.
    pub async fn abort(&self, tid: u32) -> anyhow::Result<()> {
        match self.call(RpcRequest::Abort { tid }).await? {
            RpcResponse::Aborted(true) => Ok(()),
            RpcResponse::Aborted(false) => {
                anyhow::bail!("participant {} rejected ABORT for tid {tid}", self.addr)
            }
            other => anyhow::bail!("unexpected ABORT reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let cmd = GetCommand { key: key.to_vec() };
        match self.call(RpcRequest::Get(cmd)).await? {
            RpcResponse::Value(value) => Ok(value),
            other => anyhow::bail!("unexpected GET reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn get_snapshot(&self) -> anyhow::Result<Vec<u8>> {
        match self.call(RpcRequest::GetSnapshot).await? {
            RpcResponse::Snapshot(bytes) => Ok(bytes),
            other => anyhow::bail!("unexpected GET_SNAPSHOT reply from {}: {other:?}", self.addr),
        }
    }

    pub async fn recover(
        &self,
        snapshot: Vec<u8>,
        del_keys: &BTreeSet<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let req = RpcRequest::Recover {
            snapshot,
            del_keys: del_keys.clone(),
        };
        match self.call(req).await? {
            RpcResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected RECOVER reply from {}: {other:?}", self.addr),
        }
    }
}

impl std::fmt::Debug for ParticipantClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantClient")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}
