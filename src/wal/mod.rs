//! # Write-Ahead Log
//!
//! This module implements the durable-update transaction log consumed by the
//! persistence engine. The WAL stores *update sets*: named, opaque byte
//! blobs describing file mutations. It never interprets them; applying
//! updates is the caller's job.
//!
//! ## Transaction Protocol
//!
//! A transaction moves through three phases:
//!
//! 1. **register** — [`Wal::new_transaction`] captures the update set in
//!    memory. Nothing is durable yet; a crash forgets the transaction.
//! 2. **setup complete** — [`Transaction::signal_setup_complete`] appends
//!    one checksummed entry holding every update and fsyncs. From here on a
//!    crash hands the update set back on the next [`Wal::open`] for replay.
//! 3. **release** — [`Transaction::signal_updates_applied`] appends a
//!    release marker. Once no transaction remains pending the log file is
//!    truncated.
//!
//! Updates must therefore be idempotent: recovery may re-apply a set whose
//! effects already reached disk.
//!
//! ## Entry Format
//!
//! ```text
//! +------------------+------------------+
//! | Entry Header     | Payload          |
//! | (24 bytes)       | (payload_len)    |
//! +------------------+------------------+
//! ```
//!
//! The header carries the entry kind (update set or release marker), the
//! transaction id, the payload length and a CRC64 checksum over kind, id and
//! payload. An update-set payload is a count followed by length-prefixed
//! `(name, instructions)` pairs.
//!
//! ## Read Protocol
//!
//! [`Wal::open`] scans the log from the start and stops at the first entry
//! whose header is truncated or whose checksum fails — a torn tail from an
//! interrupted append, which is then cut off with `set_len`. Update-set
//! entries without a matching release marker are returned as recovered
//! [`Transaction`]s, oldest first.
//!
//! ## Concurrency
//!
//! `Wal` is a cheap-`Clone` shared handle; many files log into one WAL.
//! Appends are serialized by an internal `parking_lot::Mutex`; transaction
//! ids are allocated under the same lock.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::encoding::{write_bytes, write_str, write_u64, Decoder};

pub const WAL_ENTRY_HEADER_SIZE: usize = 24;

const ENTRY_UPDATE_SET: u8 = 1;
const ENTRY_RELEASE: u8 = 2;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// A single named, opaque mutation blob. The WAL persists updates verbatim;
/// the name tag tells the applier how to decode the instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub name: String,
    pub instructions: Vec<u8>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EntryHeader {
    kind: u8,
    _pad: [u8; 3],
    txn_id: U64,
    payload_len: U32,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == WAL_ENTRY_HEADER_SIZE);

fn compute_checksum(kind: u8, txn_id: u64, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&[kind]);
    digest.update(&txn_id.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

fn encode_update_set(updates: &[Update]) -> Vec<u8> {
    let mut payload = Vec::new();
    write_u64(&mut payload, updates.len() as u64);
    for u in updates {
        write_str(&mut payload, &u.name);
        write_bytes(&mut payload, &u.instructions);
    }
    payload
}

fn decode_update_set(payload: &[u8]) -> Result<Vec<Update>> {
    let mut dec = Decoder::new(payload);
    let count = dec.read_u64()?;
    let mut updates = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = dec.read_str()?;
        let instructions = dec.read_bytes()?;
        updates.push(Update { name, instructions });
    }
    Ok(updates)
}

#[derive(Debug)]
struct WalState {
    file: File,
    next_txn_id: u64,
    pending: HashSet<u64>,
}

#[derive(Debug)]
struct WalInner {
    path: PathBuf,
    state: Mutex<WalState>,
}

/// Shared handle to one write-ahead log file.
#[derive(Clone, Debug)]
pub struct Wal {
    inner: Arc<WalInner>,
}

impl Wal {
    /// Opens (or creates) the log at `path` and returns the handle together
    /// with every transaction that signalled setup-complete but was never
    /// released, oldest first. Callers must re-apply those update sets and
    /// release them before relying on the files they touch.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Wal, Vec<Transaction>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("wal: failed to open log at {}", path.display()))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .wrap_err("wal: failed to read log")?;

        let mut unreleased: HashMap<u64, Vec<Update>> = HashMap::new();
        let mut order: Vec<u64> = Vec::new();
        let mut max_txn_id = 0u64;
        let mut pos = 0usize;
        while raw.len() - pos >= WAL_ENTRY_HEADER_SIZE {
            let header = match EntryHeader::read_from_bytes(&raw[pos..pos + WAL_ENTRY_HEADER_SIZE])
            {
                Ok(h) => h,
                Err(_) => break,
            };
            let payload_len = header.payload_len.get() as usize;
            let payload_start = pos + WAL_ENTRY_HEADER_SIZE;
            if raw.len() - payload_start < payload_len {
                break;
            }
            let payload = &raw[payload_start..payload_start + payload_len];
            let txn_id = header.txn_id.get();
            if compute_checksum(header.kind, txn_id, payload) != header.checksum.get() {
                break;
            }
            match header.kind {
                ENTRY_UPDATE_SET => {
                    let updates = match decode_update_set(payload) {
                        Ok(u) => u,
                        Err(_) => break,
                    };
                    if unreleased.insert(txn_id, updates).is_none() {
                        order.push(txn_id);
                    }
                }
                ENTRY_RELEASE => {
                    unreleased.remove(&txn_id);
                }
                _ => break,
            }
            max_txn_id = max_txn_id.max(txn_id);
            pos = payload_start + payload_len;
        }

        // Cut off the torn tail, if any.
        if pos as u64 != file.metadata().wrap_err("wal: failed to stat log")?.len() {
            file.set_len(pos as u64)
                .wrap_err("wal: failed to truncate torn log tail")?;
        }
        if unreleased.is_empty() && pos > 0 {
            file.set_len(0).wrap_err("wal: failed to reset idle log")?;
        }

        let pending: HashSet<u64> = unreleased.keys().copied().collect();
        let wal = Wal {
            inner: Arc::new(WalInner {
                path,
                state: Mutex::new(WalState {
                    file,
                    next_txn_id: max_txn_id + 1,
                    pending,
                }),
            }),
        };

        let recovered = order
            .into_iter()
            .filter_map(|id| {
                unreleased.remove(&id).map(|updates| Transaction {
                    wal: wal.clone(),
                    txn_id: id,
                    updates,
                    setup_complete: true,
                    released: false,
                })
            })
            .collect();
        Ok((wal, recovered))
    }

    /// Registers a new transaction over `updates`. Nothing is written until
    /// the transaction signals setup-complete.
    pub fn new_transaction(&self, updates: Vec<Update>) -> Transaction {
        let mut state = self.inner.state.lock();
        let txn_id = state.next_txn_id;
        state.next_txn_id += 1;
        Transaction {
            wal: self.clone(),
            txn_id,
            updates,
            setup_complete: false,
            released: false,
        }
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn append_entry(&self, kind: u8, txn_id: u64, payload: &[u8]) -> Result<()> {
        let header = EntryHeader {
            kind,
            _pad: [0; 3],
            txn_id: U64::new(txn_id),
            payload_len: U32::new(payload.len() as u32),
            checksum: U64::new(compute_checksum(kind, txn_id, payload)),
        };
        let mut state = self.inner.state.lock();
        state
            .file
            .seek(SeekFrom::End(0))
            .wrap_err("wal: failed to seek to log end")?;
        state
            .file
            .write_all(header.as_bytes())
            .wrap_err("wal: failed to write entry header")?;
        state
            .file
            .write_all(payload)
            .wrap_err("wal: failed to write entry payload")?;
        state
            .file
            .sync_all()
            .wrap_err("wal: failed to sync log")?;
        match kind {
            ENTRY_UPDATE_SET => {
                state.pending.insert(txn_id);
            }
            ENTRY_RELEASE => {
                state.pending.remove(&txn_id);
                if state.pending.is_empty() {
                    state
                        .file
                        .set_len(0)
                        .wrap_err("wal: failed to truncate idle log")?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// One update-set transaction, fresh or recovered. Dropping a transaction
/// after setup-complete without releasing it is safe: the update set is
/// simply handed back on the next [`Wal::open`].
pub struct Transaction {
    wal: Wal,
    txn_id: u64,
    updates: Vec<Update>,
    setup_complete: bool,
    released: bool,
}

impl Transaction {
    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    /// Makes the update set durable. After this returns, a crash hands the
    /// set back on the next open for re-application.
    pub fn signal_setup_complete(&mut self) -> Result<()> {
        ensure!(!self.setup_complete, "wal: transaction setup already signalled");
        let payload = encode_update_set(&self.updates);
        self.wal
            .append_entry(ENTRY_UPDATE_SET, self.txn_id, &payload)?;
        self.setup_complete = true;
        Ok(())
    }

    /// Marks the update set as applied so the log may discard it.
    pub fn signal_updates_applied(mut self) -> Result<()> {
        ensure!(
            self.setup_complete,
            "wal: transaction released before setup was signalled"
        );
        if self.released {
            bail!("wal: transaction already released");
        }
        self.wal.append_entry(ENTRY_RELEASE, self.txn_id, &[])?;
        self.released = true;
        Ok(())
    }
}
