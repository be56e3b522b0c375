//! In-memory participant node.
//!
//! Holds the replicated key/value state, stages transactions between
//! `PREPARE_*` and the coordinator's decision, and keeps the outcome of every
//! applied transaction so a redriven `COMMIT` is answered idempotently.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

use crate::rpc::{self, CommitOutcome, DelCommand, RpcRequest, RpcResponse, SetCommand};

enum StagedOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { keys: Vec<Vec<u8>> },
}

/// Snapshot wire form: full store plus applied-transaction outcomes, so a
/// restored participant answers repeated `COMMIT`s like the donor would.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    applied: Vec<(u32, CommitOutcome)>,
}

#[derive(Default)]
pub struct Store {
    data: HashMap<Vec<u8>, Vec<u8>>,
    staged: HashMap<u32, StagedOp>,
    applied: HashMap<u32, CommitOutcome>,
    next_id: u32,
}

impl Store {
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn set_next_id(&mut self, next_id: u32) {
        self.next_id = next_id;
    }

    /// Stage a write and advance the id counter. An already-applied tid is
    /// refused; everything else is accepted.
    pub fn prepare_set(&mut self, cmd: SetCommand) -> bool {
        if self.applied.contains_key(&cmd.tid) {
            return false;
        }
        self.next_id = self.next_id.max(cmd.tid.wrapping_add(1));
        self.staged.insert(
            cmd.tid,
            StagedOp::Set {
                key: cmd.key,
                value: cmd.value,
            },
        );
        true
    }

    pub fn prepare_del(&mut self, cmd: DelCommand) -> bool {
        if self.applied.contains_key(&cmd.tid) {
            return false;
        }
        self.next_id = self.next_id.max(cmd.tid.wrapping_add(1));
        self.staged.insert(cmd.tid, StagedOp::Del { keys: cmd.keys });
        true
    }

    /// Apply a decided transaction. Repeats of an applied tid return the
    /// recorded outcome; an unknown tid is a protocol violation.
    pub fn commit(&mut self, tid: u32) -> Option<CommitOutcome> {
        if let Some(outcome) = self.applied.get(&tid) {
            return Some(*outcome);
        }
        let outcome = match self.staged.remove(&tid)? {
            StagedOp::Set { key, value } => {
                self.data.insert(key, value);
                CommitOutcome::Ok
            }
            StagedOp::Del { keys } => {
                let mut removed = 0u64;
                for key in keys {
                    if self.data.remove(&key).is_some() {
                        removed += 1;
                    }
                }
                CommitOutcome::Deleted(removed)
            }
        };
        self.applied.insert(tid, outcome);
        Some(outcome)
    }

    /// Drop any staged state for `tid`. Aborting a tid this store never saw
    /// is a no-op; recovery redrives aborts broadly.
    pub fn abort(&mut self, tid: u32) -> bool {
        self.staged.remove(&tid);
        true
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    pub fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let payload = SnapshotPayload {
            entries: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            applied: self.applied.iter().map(|(t, o)| (*t, *o)).collect(),
        };
        serde_json::to_vec(&payload).context("encode snapshot")
    }

    /// Replace local state with `snapshot`, then replay the deletions the
    /// coordinator collected while this participant was absent.
    pub fn recover(&mut self, snapshot: &[u8], del_keys: &BTreeSet<Vec<u8>>) -> anyhow::Result<()> {
        let payload: SnapshotPayload =
            serde_json::from_slice(snapshot).context("decode snapshot")?;
        self.data = payload.entries.into_iter().collect();
        self.applied = payload.applied.into_iter().collect();
        self.staged.clear();
        for key in del_keys {
            self.data.remove(key);
        }
        Ok(())
    }
}

pub async fn run(listener: TcpListener) -> anyhow::Result<()> {
    let store = Arc::new(Mutex::new(Store::default()));
    run_with_store(listener, store).await
}

pub async fn run_with_store(
    listener: TcpListener,
    store: Arc<Mutex<Store>>,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_conn(socket, store).await {
                tracing::debug!(%peer, error = %err, "rpc connection closed");
            }
        });
    }
}

async fn serve_conn(socket: TcpStream, store: Arc<Mutex<Store>>) -> anyhow::Result<()> {
    let mut conn = rpc::framed(socket);
    while let Some(req) = rpc::read_frame::<RpcRequest>(&mut conn).await? {
        let resp = handle_request(&store, req);
        rpc::send_frame(&mut conn, &resp).await?;
    }
    Ok(())
}

fn handle_request(store: &Mutex<Store>, req: RpcRequest) -> RpcResponse {
    let mut store = match store.lock() {
        Ok(store) => store,
        Err(_) => return RpcResponse::Error("store lock poisoned".into()),
    };
    match req {
        RpcRequest::Heartbeat => RpcResponse::Ack,
        RpcRequest::NextId => RpcResponse::NextId(store.next_id()),
        RpcRequest::SetNextId { next_id } => {
            store.set_next_id(next_id);
            RpcResponse::Ack
        }
        RpcRequest::PrepareSet(cmd) => RpcResponse::Vote(store.prepare_set(cmd)),
        RpcRequest::PrepareDel(cmd) => RpcResponse::Vote(store.prepare_del(cmd)),
        RpcRequest::Commit { tid } => match store.commit(tid) {
            Some(outcome) => RpcResponse::Committed(outcome),
            None => RpcResponse::Error(format!("commit for unknown tid {tid}")),
        },
        RpcRequest::Abort { tid } => RpcResponse::Aborted(store.abort(tid)),
        RpcRequest::Get(cmd) => RpcResponse::Value(store.get(&cmd.key)),
        RpcRequest::GetSnapshot => match store.snapshot() {
            Ok(bytes) => RpcResponse::Snapshot(bytes),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::Recover { snapshot, del_keys } => {
            match store.recover(&snapshot, &del_keys) {
                Ok(()) => RpcResponse::Ack,
                Err(err) => RpcResponse::Error(err.to_string()),
            }
        }
    }
}
