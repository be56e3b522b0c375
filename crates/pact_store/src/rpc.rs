//! Coordinator/participant RPC surface.
//!
//! Calls are length-delimited JSON frames over TCP: one `RpcRequest` in, one
//! `RpcResponse` out. Snapshots ride inside `Recover` as opaque bytes.

use std::collections::BTreeSet;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Snapshots of a full store can be large; frames are capped well above the
/// client-side bulk limit.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A write staged by `PREPARE_SET`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCommand {
    pub tid: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A deletion staged by `PREPARE_DEL`; the keys form one atomic set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelCommand {
    pub tid: u32,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCommand {
    pub key: Vec<u8>,
}

/// What applying a committed transaction produced; the coordinator renders
/// the first outcome it collects as the client reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Ok,
    Deleted(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Heartbeat,
    NextId,
    SetNextId { next_id: u32 },
    PrepareSet(SetCommand),
    PrepareDel(DelCommand),
    Commit { tid: u32 },
    Abort { tid: u32 },
    Get(GetCommand),
    GetSnapshot,
    Recover {
        snapshot: Vec<u8>,
        del_keys: BTreeSet<Vec<u8>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Ack,
    NextId(u32),
    Vote(bool),
    Committed(CommitOutcome),
    Aborted(bool),
    Value(Option<Vec<u8>>),
    Snapshot(Vec<u8>),
    Error(String),
}

pub type RpcConnection = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> RpcConnection {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_LEN);
    Framed::new(stream, codec)
}

pub async fn send_frame<T: Serialize>(conn: &mut RpcConnection, msg: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(msg).context("encode rpc frame")?;
    conn.send(Bytes::from(body)).await.context("send rpc frame")?;
    Ok(())
}

/// Read one frame; `None` means the peer closed the connection cleanly.
pub async fn read_frame<T: DeserializeOwned>(conn: &mut RpcConnection) -> anyhow::Result<Option<T>> {
    match conn.next().await {
        Some(frame) => {
            let frame = frame.context("read rpc frame")?;
            let msg = serde_json::from_slice(&frame).context("decode rpc frame")?;
            Ok(Some(msg))
        }
        None => Ok(None),
    }
}
