//! Transaction coordinator: membership, the 2PC engine, and recovery.
//!
//! The live participant map, the deletion shadow set, and the record log sit
//! behind one mutex. Every broadcast path takes `&mut Shared`, which can only
//! be obtained by locking, so a PREPARE/COMMIT/ABORT round can never observe
//! a half-updated membership and log appends stay in tid-assignment order.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::participant_client::ParticipantClient;
use crate::record_log::{Record, RecordLog, RecordStatus};
use crate::resp::Reply;
use crate::rpc::{CommitOutcome, DelCommand, SetCommand};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    /// The configured participant set; membership is static.
    pub participants: Vec<SocketAddr>,
    pub log_path: PathBuf,
    pub rpc_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(listen: SocketAddr, participants: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            participants,
            log_path: PathBuf::from("coordinator.log"),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// State guarded by the membership mutex.
struct Shared {
    live: BTreeMap<SocketAddr, ParticipantClient>,
    /// Keys deleted while membership was degraded; replayed on top of
    /// snapshots during participant recovery, cleared on full membership.
    del_keys: BTreeSet<Vec<u8>>,
    log: RecordLog,
    /// False until the coordinator has either replayed a log or pushed its
    /// freshly seeded counter to a participant.
    is_recovered: bool,
}

/// Outcome of the admission predicate for a participant reporting `p_next_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Admit,
    NeedsFullRecovery,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    next_id: AtomicU32,
    shared: tokio::sync::Mutex<Shared>,
    /// Signaled when transaction dispatch drops a dead participant, so the
    /// heartbeat loop converges without sleeping a full period.
    membership_changed: tokio::sync::Notify,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> anyhow::Result<Arc<Self>> {
        let log = RecordLog::open(&config.log_path)?;
        Ok(Arc::new(Self {
            config,
            next_id: AtomicU32::new(0),
            shared: tokio::sync::Mutex::new(Shared {
                live: BTreeMap::new(),
                del_keys: BTreeSet::new(),
                log,
                is_recovered: true,
            }),
            membership_changed: tokio::sync::Notify::new(),
        }))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub async fn live_participants(&self) -> Vec<SocketAddr> {
        let shared = self.shared.lock().await;
        shared.live.keys().copied().collect()
    }

    /// Keys currently tracked for replay into snapshot-restored participants.
    pub async fn pending_del_keys(&self) -> usize {
        let shared = self.shared.lock().await;
        shared.del_keys.len()
    }

    /// Startup recovery: resume the id counter, admit up-to-date
    /// participants, then resolve every open logged transaction.
    pub async fn recovery(&self) {
        let mut shared = self.shared.lock().await;

        let next_id = log_next_id(&shared);
        if next_id == 0 {
            self.next_id.store(rand::random::<u32>(), Ordering::SeqCst);
            shared.is_recovered = false;
            tracing::debug!(next_id = self.next_id(), "empty log, seeded random id counter");
        } else {
            self.next_id.store(next_id, Ordering::SeqCst);
            tracing::debug!(next_id, "resumed id counter from log");
        }

        for addr in self.config.participants.clone() {
            if let Err(err) = self.init_participant(&mut shared, addr).await {
                tracing::warn!(%addr, error = %err, "participant not admitted at startup");
            }
        }

        self.handle_unfinished_records(&mut shared).await;
    }

    /// Admission check at startup. Participants that need a snapshot are
    /// dropped here; the heartbeat loop recovers them.
    async fn init_participant(&self, shared: &mut Shared, addr: SocketAddr) -> anyhow::Result<()> {
        let client = ParticipantClient::connect(addr, self.config.rpc_timeout).await?;
        let p_next_id = client.next_id().await?;

        if !shared.is_recovered {
            client.set_next_id(self.next_id()).await?;
            shared.live.insert(addr, client);
            return Ok(());
        }

        match self.classify(shared, p_next_id, RecordStatus::Abort) {
            Admission::Admit => {
                shared.live.insert(addr, client);
                Ok(())
            }
            Admission::NeedsFullRecovery => anyhow::bail!(
                "participant reports next_id {p_next_id}, coordinator has {}",
                self.next_id()
            ),
        }
    }

    /// A participant is current when its counter matches ours, or lags by
    /// exactly one with the pending tid logged in `pending` state (the
    /// participant never applied that tid, so its store is intact).
    fn classify(&self, shared: &Shared, p_next_id: u32, pending: RecordStatus) -> Admission {
        let next_id = self.next_id();
        if p_next_id == next_id {
            return Admission::Admit;
        }
        if p_next_id.wrapping_add(1) == next_id {
            let latest = latest_records(shared);
            if latest.get(&p_next_id).is_some_and(|r| r.status == pending) {
                return Admission::Admit;
            }
        }
        Admission::NeedsFullRecovery
    }

    /// Redrive every logged transaction that has not reached a terminal
    /// state: `UNRESOLVED` and `ABORT` abort, `COMMIT` commits.
    async fn handle_unfinished_records(&self, shared: &mut Shared) {
        let latest = latest_records(shared);
        tracing::debug!(records = latest.len(), "handle unfinished records");

        let mut dead = false;
        for (tid, record) in latest {
            match record.status {
                RecordStatus::Unresolved | RecordStatus::Abort => {
                    self.abort_locked(shared, tid, &mut dead).await;
                }
                RecordStatus::Commit => {
                    self.commit_locked(shared, tid, &mut dead).await;
                }
                RecordStatus::CommitDone | RecordStatus::AbortDone => {}
            }
        }
    }

    /// Heartbeat worker: probe the configured set every period, drop
    /// participants that stop answering, readmit (and if needed recover)
    /// those that come back.
    pub async fn run_heartbeat(self: Arc<Self>) {
        loop {
            for addr in self.config.participants.clone() {
                self.probe_participant(addr).await;
            }

            tokio::select! {
                _ = self.membership_changed.notified() => {}
                _ = time::sleep(self.config.heartbeat_interval) => {}
            }
        }
    }

    async fn probe_participant(&self, addr: SocketAddr) {
        let probed = async {
            let client = ParticipantClient::connect(addr, self.config.rpc_timeout).await?;
            client.heartbeat().await?;
            Ok::<_, anyhow::Error>(client)
        }
        .await;

        match probed {
            Err(err) => {
                let mut shared = self.shared.lock().await;
                if shared.live.remove(&addr).is_some() {
                    tracing::warn!(%addr, error = %err, "heartbeat failed, participant removed");
                }
            }
            Ok(client) => {
                let mut shared = self.shared.lock().await;
                if !shared.live.contains_key(&addr) {
                    // Either the coordinator started before this participant
                    // or the participant failed and came back.
                    if self.recover_participant(&mut shared, &client).await {
                        shared.live.insert(addr, client);
                        if shared.live.len() == self.config.participants.len() {
                            shared.del_keys.clear();
                        }
                        self.handle_unfinished_records(&mut shared).await;
                    }
                }
                tracing::debug!(live = shared.live.len(), "heartbeat tick");
            }
        }
    }

    /// Bring one returning participant back in sync. Returns true when it
    /// can be admitted to the live set.
    async fn recover_participant(&self, shared: &mut Shared, client: &ParticipantClient) -> bool {
        tracing::debug!(addr = %client.addr(), "recover participant");

        if !shared.is_recovered {
            // Fresh coordinator with no logged history: the participant only
            // needs our seeded counter.
            match client.set_next_id(self.next_id()).await {
                Ok(()) => {
                    shared.is_recovered = true;
                    return true;
                }
                Err(err) => {
                    tracing::warn!(addr = %client.addr(), error = %err, "set_next_id failed");
                    return false;
                }
            }
        }

        let p_next_id = match client.next_id().await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(addr = %client.addr(), error = %err, "next_id query failed");
                return false;
            }
        };

        // A pending UNRESOLVED tid is fine here: handle_unfinished_records
        // aborts it right after readmission.
        if self.classify(shared, p_next_id, RecordStatus::Unresolved) == Admission::Admit {
            return true;
        }

        // Full recovery: copy a snapshot from any live participant and
        // replay the deletions that happened while membership was degraded.
        loop {
            let Some(donor_addr) = shared.live.keys().next().copied() else {
                tracing::warn!("snapshot recovery impossible, no live donor");
                return false;
            };
            let snapshot = match shared.live.get(&donor_addr) {
                Some(donor) => donor.get_snapshot().await,
                None => continue,
            };
            match snapshot {
                Err(err) => {
                    tracing::warn!(addr = %donor_addr, error = %err, "snapshot donor removed");
                    shared.live.remove(&donor_addr);
                }
                Ok(bytes) => {
                    tracing::info!(addr = %donor_addr, bytes = bytes.len(), "snapshot acquired");
                    let restored = async {
                        client.recover(bytes, &shared.del_keys).await?;
                        client.set_next_id(self.next_id()).await
                    }
                    .await;
                    return match restored {
                        Ok(()) => {
                            tracing::info!(addr = %client.addr(), "participant recovered");
                            true
                        }
                        Err(err) => {
                            tracing::warn!(addr = %client.addr(), error = %err, "recover failed");
                            false
                        }
                    };
                }
            }
        }
    }

    /// Serve a read from any live participant; reads are not transactions
    /// and are never logged.
    pub async fn handle_get(&self, key: &[u8]) -> Reply {
        let mut shared = self.shared.lock().await;
        let mut dead = false;
        let mut reply = Reply::Error;

        while let Some(addr) = shared.live.keys().next().copied() {
            let value = match shared.live.get(&addr) {
                Some(client) => client.get(key).await,
                None => continue,
            };
            match value {
                Ok(Some(value)) => {
                    reply = Reply::Bulk(value);
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "get failed, participant removed");
                    shared.live.remove(&addr);
                    dead = true;
                }
            }
        }

        drop(shared);
        if dead {
            self.membership_changed.notify_waiters();
        }
        reply
    }

    pub async fn handle_set(&self, key: Vec<u8>, value: Vec<u8>) -> Reply {
        let mut shared = self.shared.lock().await;
        if shared.live.is_empty() {
            tracing::warn!("rejecting SET, no live participants");
            return Reply::Error;
        }

        let tid = self.next_id.fetch_add(1, Ordering::SeqCst);
        append_record(&mut shared, Record {
            status: RecordStatus::Unresolved,
            tid,
            next_id: self.next_id(),
        });

        let cmd = WriteOp::Set(SetCommand { tid, key, value });
        let mut dead = false;
        let prepare_ok = self.prepare(&mut shared, &cmd, &mut dead).await;
        if shared.live.is_empty() {
            // No one left to tell; recovery resolves the logged state.
            drop(shared);
            self.membership_changed.notify_waiters();
            return Reply::Error;
        }

        let reply = self.decide(&mut shared, tid, prepare_ok, &mut dead).await;

        drop(shared);
        if dead {
            self.membership_changed.notify_waiters();
        }
        reply
    }

    pub async fn handle_del(&self, keys: Vec<Vec<u8>>) -> Reply {
        let mut shared = self.shared.lock().await;
        if shared.live.is_empty() {
            tracing::warn!("rejecting DEL, no live participants");
            return Reply::Error;
        }

        let tid = self.next_id.fetch_add(1, Ordering::SeqCst);
        append_record(&mut shared, Record {
            status: RecordStatus::Unresolved,
            tid,
            next_id: self.next_id(),
        });

        let cmd = WriteOp::Del(DelCommand {
            tid,
            keys: keys.clone(),
        });
        let mut dead = false;
        let prepare_ok = self.prepare(&mut shared, &cmd, &mut dead).await;
        if shared.live.is_empty() {
            drop(shared);
            self.membership_changed.notify_waiters();
            return Reply::Error;
        }

        let reply = self.decide(&mut shared, tid, prepare_ok, &mut dead).await;

        // Deletions committed while participants were missing must be
        // replayed into any snapshot-restored store later.
        if prepare_ok && shared.live.len() < self.config.participants.len() {
            shared.del_keys.extend(keys);
        }

        drop(shared);
        if dead {
            self.membership_changed.notify_waiters();
        }
        reply
    }

    /// PREPARE phase. A dissenting vote ends the poll immediately; an
    /// unreachable participant is dropped and polling continues.
    async fn prepare(&self, shared: &mut Shared, op: &WriteOp, dead: &mut bool) -> bool {
        for addr in shared.live.keys().copied().collect::<Vec<_>>() {
            let vote = match shared.live.get(&addr) {
                Some(client) => match op {
                    WriteOp::Set(cmd) => client.prepare_set(cmd.clone()).await,
                    WriteOp::Del(cmd) => client.prepare_del(cmd.clone()).await,
                },
                None => continue,
            };
            match vote {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "prepare failed, participant removed");
                    shared.live.remove(&addr);
                    *dead = true;
                }
            }
        }
        true
    }

    /// Decision and broadcast; callers have checked the live set is
    /// non-empty.
    async fn decide(
        &self,
        shared: &mut Shared,
        tid: u32,
        prepare_ok: bool,
        dead: &mut bool,
    ) -> Reply {
        if prepare_ok {
            match self.commit_locked(shared, tid, dead).await {
                Some(CommitOutcome::Ok) => Reply::Ok,
                Some(CommitOutcome::Deleted(n)) => Reply::Integer(n),
                None => Reply::Error,
            }
        } else {
            self.abort_locked(shared, tid, dead).await;
            Reply::Error
        }
    }

    /// COMMIT broadcast; the first successful reply becomes the client
    /// response (all replies are expected to agree).
    async fn commit_locked(
        &self,
        shared: &mut Shared,
        tid: u32,
        dead: &mut bool,
    ) -> Option<CommitOutcome> {
        append_record(shared, Record {
            status: RecordStatus::Commit,
            tid,
            next_id: self.next_id(),
        });

        let mut outcome = None;
        for addr in shared.live.keys().copied().collect::<Vec<_>>() {
            let result = match shared.live.get(&addr) {
                Some(client) => client.commit(tid).await,
                None => continue,
            };
            match result {
                Ok(res) => {
                    if outcome.is_none() {
                        outcome = Some(res);
                    }
                }
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "commit failed, participant removed");
                    shared.live.remove(&addr);
                    *dead = true;
                }
            }
        }

        if !shared.live.is_empty() {
            append_record(shared, Record {
                status: RecordStatus::CommitDone,
                tid,
                next_id: self.next_id(),
            });
        }
        outcome
    }

    /// ABORT broadcast. A `false` reply counts as a malfunction and drops
    /// the participant like a transport failure.
    async fn abort_locked(&self, shared: &mut Shared, tid: u32, dead: &mut bool) {
        append_record(shared, Record {
            status: RecordStatus::Abort,
            tid,
            next_id: self.next_id(),
        });

        for addr in shared.live.keys().copied().collect::<Vec<_>>() {
            let result = match shared.live.get(&addr) {
                Some(client) => client.abort(tid).await,
                None => continue,
            };
            if let Err(err) = result {
                tracing::warn!(%addr, error = %err, "abort failed, participant removed");
                shared.live.remove(&addr);
                *dead = true;
            }
        }

        if !shared.live.is_empty() {
            append_record(shared, Record {
                status: RecordStatus::AbortDone,
                tid,
                next_id: self.next_id(),
            });
        }
    }
}

enum WriteOp {
    Set(SetCommand),
    Del(DelCommand),
}

/// Journal writes are the durability contract; losing one invalidates every
/// guarantee recovery relies on, so failure here ends the process.
fn append_record(shared: &mut Shared, record: Record) {
    if let Err(err) = shared.log.append(record) {
        tracing::error!(error = %err, ?record, "record log append failed");
        std::process::exit(1);
    }
}

fn latest_records(shared: &Shared) -> BTreeMap<u32, Record> {
    match shared.log.latest_by_tid() {
        Ok(latest) => latest,
        Err(err) => {
            tracing::error!(error = %err, "record log scan failed");
            std::process::exit(1);
        }
    }
}

fn log_next_id(shared: &Shared) -> u32 {
    match shared.log.next_id() {
        Ok(next_id) => next_id,
        Err(err) => {
            tracing::error!(error = %err, "record log scan failed");
            std::process::exit(1);
        }
    }
}
