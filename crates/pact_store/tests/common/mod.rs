//! Shared helpers for integration tests: in-process coordinators and
//! participants, plus a scriptable fake participant for fault scenarios.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;

use pact_store::rpc::{self, CommitOutcome, RpcRequest, RpcResponse};
use pact_store::{client_server, participant, Coordinator, CoordinatorConfig};

pub const RPC_TIMEOUT: Duration = Duration::from_millis(500);
pub const HEARTBEAT: Duration = Duration::from_millis(200);

/// Start a coordinator in the test runtime: runs recovery, then serves
/// clients and heartbeats in background tasks.
pub async fn start_coordinator(
    participants: Vec<SocketAddr>,
    log_path: PathBuf,
) -> (SocketAddr, Arc<Coordinator>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = CoordinatorConfig {
        listen: addr,
        participants,
        log_path,
        rpc_timeout: RPC_TIMEOUT,
        heartbeat_interval: HEARTBEAT,
    };
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.recovery().await;
    tokio::spawn(coordinator.clone().run_heartbeat());
    tokio::spawn(client_server::run(listener, coordinator.clone()));
    (addr, coordinator)
}

/// Start an honest participant in the test runtime.
pub async fn start_participant() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(participant::run(listener));
    addr
}

/// Pick a free local address by binding and immediately releasing it.
pub fn reserve_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// An honest participant running on its own runtime so a test can simulate
/// a crash: shutting the runtime down severs every open connection.
pub struct TestParticipant {
    pub addr: SocketAddr,
    runtime: Option<tokio::runtime::Runtime>,
}

impl TestParticipant {
    pub fn start(addr: Option<SocketAddr>) -> Self {
        let bind_addr = addr.unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        // SO_REUSEADDR so a restarted participant can reclaim its port while
        // old connections sit in TIME_WAIT.
        let (tx, rx) = std::sync::mpsc::channel();
        runtime.spawn(async move {
            let socket = tokio::net::TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(bind_addr)?;
            let listener = socket.listen(64)?;
            let _ = tx.send(listener.local_addr()?);
            participant::run(listener).await
        });
        let addr = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("participant failed to bind");
        Self {
            addr,
            runtime: Some(runtime),
        }
    }

    /// Abrupt termination: all connections drop, nothing is flushed.
    pub fn kill(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for TestParticipant {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Scripted behavior for the fake participant.
pub struct FakeState {
    pub next_id: AtomicU32,
    /// Vote returned from `PREPARE_*`.
    pub vote: AtomicBool,
    /// While set, `COMMIT` calls are held instead of answered.
    pub stall_commit: AtomicBool,
    /// While set, every call fails, heartbeats included.
    pub dead: AtomicBool,
    /// Every non-heartbeat call, in order.
    pub calls: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(0),
            vote: AtomicBool::new(true),
            stall_commit: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

/// A participant that speaks the RPC protocol but follows the script in
/// `FakeState` instead of holding real data.
pub async fn start_fake_participant(state: Arc<FakeState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let mut conn = rpc::framed(socket);
                while let Ok(Some(req)) = rpc::read_frame::<RpcRequest>(&mut conn).await {
                    let resp = fake_response(&state, req).await;
                    if rpc::send_frame(&mut conn, &resp).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn fake_response(state: &FakeState, req: RpcRequest) -> RpcResponse {
    if state.dead.load(Ordering::SeqCst) {
        return RpcResponse::Error("participant is offline".into());
    }
    match req {
        RpcRequest::Heartbeat => RpcResponse::Ack,
        RpcRequest::NextId => RpcResponse::NextId(state.next_id.load(Ordering::SeqCst)),
        RpcRequest::SetNextId { next_id } => {
            state.record(format!("SET_NEXT_ID {next_id}"));
            state.next_id.store(next_id, Ordering::SeqCst);
            RpcResponse::Ack
        }
        RpcRequest::PrepareSet(cmd) => {
            state.record(format!("PREPARE_SET {}", cmd.tid));
            RpcResponse::Vote(fake_vote(state, cmd.tid))
        }
        RpcRequest::PrepareDel(cmd) => {
            state.record(format!("PREPARE_DEL {}", cmd.tid));
            RpcResponse::Vote(fake_vote(state, cmd.tid))
        }
        RpcRequest::Commit { tid } => {
            state.record(format!("COMMIT {tid}"));
            while state.stall_commit.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            RpcResponse::Committed(CommitOutcome::Ok)
        }
        RpcRequest::Abort { tid } => {
            state.record(format!("ABORT {tid}"));
            RpcResponse::Aborted(true)
        }
        RpcRequest::Get(_) => RpcResponse::Value(None),
        RpcRequest::GetSnapshot => RpcResponse::Error("fake participant has no snapshot".into()),
        RpcRequest::Recover { .. } => RpcResponse::Ack,
    }
}

fn fake_vote(state: &FakeState, tid: u32) -> bool {
    let vote = state.vote.load(Ordering::SeqCst);
    if vote {
        let next = tid.wrapping_add(1);
        state.next_id.fetch_max(next, Ordering::SeqCst);
    }
    vote
}

/// Poll until `cond` holds or the deadline passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
