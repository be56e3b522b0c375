use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use crc32fast::Hasher;

/// Logged state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    Unresolved,
    Commit,
    CommitDone,
    Abort,
    AbortDone,
}

impl RecordStatus {
    fn to_u8(self) -> u8 {
        match self {
            RecordStatus::Unresolved => 0,
            RecordStatus::Commit => 1,
            RecordStatus::CommitDone => 2,
            RecordStatus::Abort => 3,
            RecordStatus::AbortDone => 4,
        }
    }

    fn from_u8(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(RecordStatus::Unresolved),
            1 => Ok(RecordStatus::Commit),
            2 => Ok(RecordStatus::CommitDone),
            3 => Ok(RecordStatus::Abort),
            4 => Ok(RecordStatus::AbortDone),
            other => anyhow::bail!("unknown record status {other}"),
        }
    }
}

/// One entry in the coordinator's transaction journal.
///
/// `next_id` is the value of the coordinator's id counter at the moment the
/// record was written; recovery derives the counter from the maximum across
/// all records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub status: RecordStatus,
    pub tid: u32,
    pub next_id: u32,
}

/// Append-only journal of transaction state transitions.
///
/// The log is a journal, not a state machine: a `Commit` may be present with
/// no `CommitDone`, and recovery redrives it. Each physical entry is framed
/// as `len | crc32 | payload` and synced before `append` returns, so a record
/// acknowledged here is observed by any later scan.
pub struct RecordLog {
    path: PathBuf,
    file: File,
}

impl RecordLog {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open record log {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record; visible to `scan` once this returns.
    pub fn append(&mut self, record: Record) -> anyhow::Result<()> {
        let payload = encode_record(&record);
        write_entry(&mut self.file, &payload).context("append record")?;
        self.file.flush().context("flush record log")?;
        self.file.sync_data().context("sync record log")?;
        Ok(())
    }

    /// All records in append order.
    pub fn scan(&self) -> anyhow::Result<Vec<Record>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut reader = std::io::BufReader::new(file);
        let mut records = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut crc_buf = [0u8; 4];
            reader.read_exact(&mut crc_buf)?;
            let expected_crc = u32::from_be_bytes(crc_buf);
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            anyhow::ensure!(hasher.finalize() == expected_crc, "record checksum mismatch");
            records.push(decode_record(&payload)?);
        }
        Ok(records)
    }

    /// Map of tid to its latest (live) record.
    ///
    /// Older entries for a tid are superseded but remain in the file.
    pub fn latest_by_tid(&self) -> anyhow::Result<BTreeMap<u32, Record>> {
        let mut latest = BTreeMap::new();
        for record in self.scan()? {
            latest.insert(record.tid, record);
        }
        Ok(latest)
    }

    /// The id counter to resume from: max `next_id` across records, 0 if empty.
    pub fn next_id(&self) -> anyhow::Result<u32> {
        Ok(self
            .scan()?
            .iter()
            .map(|r| r.next_id)
            .max()
            .unwrap_or(0))
    }
}

fn write_entry(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn encode_record(record: &Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 4);
    out.push(record.status.to_u8());
    out.extend_from_slice(&record.tid.to_be_bytes());
    out.extend_from_slice(&record.next_id.to_be_bytes());
    out
}

fn decode_record(buf: &[u8]) -> anyhow::Result<Record> {
    anyhow::ensure!(buf.len() == 9, "record entry has wrong length");
    let status = RecordStatus::from_u8(buf[0])?;
    let tid = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let next_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    Ok(Record {
        status,
        tid,
        next_id,
    })
}
