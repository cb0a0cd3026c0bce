//! # SiaFile
//!
//! The persistent index a renter keeps for one logical file: how the file
//! was split into erasure-coded chunks, which hosts hold which pieces, and
//! the merkle roots those pieces can be fetched by. The read and write
//! paths to remote hosts consume this index to plan uploads, downloads,
//! repairs and renewals; this module owns its durable representation.
//!
//! ## Container Layout
//!
//! A siafile is a page-addressed container with three self-describing
//! regions:
//!
//! ```text
//! offset 0                     ┌──────────────────────────────┐
//!                              │ metadata (length-prefixed)   │
//! offset pub_key_table_offset  ├──────────────────────────────┤
//!   (one page in)              │ host public key table        │
//! offset chunk_offset          ├──────────────────────────────┤
//!   (two pages in, grows)      │ chunk 0 (pages_per_chunk pg) │
//!                              │ chunk 1                      │
//!                              │ …                            │
//!                              │ chunk N-1 (unpadded at EOF)  │
//!                              └──────────────────────────────┘
//! ```
//!
//! The metadata records both region offsets, so the header can grow by
//! whole pages: when the key table outgrows its region, every chunk is
//! relocated verbatim and `chunk_offset` moves out — the chunk records
//! themselves are never re-marshaled. The final chunk is written without
//! its slot padding so the file ends exactly at its last meaningful byte.
//!
//! ## Durability
//!
//! Every mutation builds a set of WAL updates and commits them through the
//! shared write-ahead log's three-phase transaction. Updates are idempotent
//! inserts and deletes, so crash recovery replays them with identical
//! effect. In-memory state is mutated before the transaction commits; if a
//! commit fails, the handle must be discarded (the next load reflects the
//! last committed state).
//!
//! ## Locking
//!
//! [`SiaFile`] is the locked public facade over the unlocked `Inner`
//! object. Public accessors take the shared lock, public mutators the
//! exclusive lock; every raw helper takes `&Inner` or `&mut Inner`, so
//! holding the lock is enforced by the borrow checker rather than by
//! convention.
//!
//! ## Module Organization
//!
//! - `siafile`: data model, facade, high-level operations
//! - `encoding`: pure binary codec for all three regions
//! - `persist`: update blobs, header growth, transaction plumbing, load

mod encoding;
mod persist;

pub use persist::{
    apply_updates, read_delete_update, read_insert_update, UPDATE_NAME_DELETE, UPDATE_NAME_INSERT,
};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{
    num_chunk_pages_required, INITIAL_CHUNK_OFFSET, INITIAL_PUB_KEY_TABLE_OFFSET,
    METADATA_VERSION, PAGE_SIZE, SECTOR_SIZE,
};
use crate::erasure::ErasureCoder;
use crate::types::{CipherType, MasterKey, MerkleRoot, SiaPublicKey, Specifier};
use crate::wal::Wal;

/// Header record of a siafile, one per file. Offsets are absolute byte
/// positions inside the container and always multiples of the page size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub version: [u8; 16],
    pub file_size: u64,
    pub master_key: Vec<u8>,
    pub cipher_type: Specifier,
    pub file_mode: u32,
    pub pages_per_chunk: u8,
    pub erasure_code_type: Specifier,
    pub erasure_code_params: [u8; 4],
    pub piece_size: u64,
    pub sia_path: String,
    pub local_path: String,
    pub access_time: i64,
    pub change_time: i64,
    pub create_time: i64,
    pub mod_time: i64,
    pub chunk_offset: u64,
    pub pub_key_table_offset: u64,
    pub deleted: bool,
}

/// One entry of the host public key table. Entries are append-only and keep
/// their position forever; pieces reference them by index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPublicKey {
    pub public_key: SiaPublicKey,
    pub used: bool,
}

/// One erasure-coded fragment stored on a host, identified there by its
/// merkle root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Piece {
    pub host_table_index: u32,
    pub merkle_root: MerkleRoot,
}

/// One erasure-coded chunk: an ordered list of hosts per erasure piece
/// index. Several hosts may store the same piece index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub pieces: Vec<SmallVec<[Piece; 2]>>,
}

impl Chunk {
    /// A chunk with no uploaded pieces for an erasure code of the given
    /// width.
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            pieces: vec![SmallVec::new(); num_pieces],
        }
    }

    /// Total pieces across all piece indices; the count byte of the on-disk
    /// record.
    pub fn num_pieces(&self) -> u64 {
        self.pieces.iter().map(|l| l.len() as u64).sum()
    }
}

/// Unlocked state of a siafile. All raw persistence helpers live on this
/// type; reaching them requires the guard of the facade's lock.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) metadata: Metadata,
    pub(crate) pub_key_table: Vec<HostPublicKey>,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) erasure_code: Arc<dyn ErasureCoder>,
    pub(crate) siafile_path: PathBuf,
    pub(crate) wal: Wal,
}

/// The persistent file index. Cheap accessors take the shared lock,
/// mutating operations the exclusive lock; all mutations are committed
/// through the shared WAL before they are considered durable.
#[derive(Debug)]
pub struct SiaFile {
    inner: RwLock<Inner>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

impl SiaFile {
    /// Creates a new siafile at `siafile_path` tracking a user file of
    /// `file_size` bytes, and persists the initial header and empty chunk
    /// slots in a single transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        siafile_path: impl Into<PathBuf>,
        sia_path: &str,
        local_path: &str,
        wal: Wal,
        erasure_code: Arc<dyn ErasureCoder>,
        master_key: MasterKey,
        file_size: u64,
        file_mode: u32,
    ) -> Result<SiaFile> {
        let siafile_path = siafile_path.into();
        ensure!(
            siafile_path.to_str().is_some(),
            "siafile path is not valid utf-8"
        );
        let piece_size = SECTOR_SIZE - master_key.cipher_type().overhead();
        let chunk_size = piece_size * erasure_code.min_pieces() as u64;
        let num_chunks = file_size.div_ceil(chunk_size).max(1);
        let (ec_type, ec_params) = encoding::marshal_erasure_coder(erasure_code.as_ref());
        let now = unix_now();

        let metadata = Metadata {
            version: METADATA_VERSION,
            file_size,
            master_key: master_key.key().to_vec(),
            cipher_type: master_key.cipher_type().specifier(),
            file_mode,
            pages_per_chunk: num_chunk_pages_required(erasure_code.num_pieces() as u64),
            erasure_code_type: ec_type,
            erasure_code_params: ec_params,
            piece_size,
            sia_path: sia_path.to_string(),
            local_path: local_path.to_string(),
            access_time: now,
            change_time: now,
            create_time: now,
            mod_time: now,
            chunk_offset: INITIAL_CHUNK_OFFSET,
            pub_key_table_offset: INITIAL_PUB_KEY_TABLE_OFFSET,
            deleted: false,
        };
        let chunks = vec![Chunk::empty(erasure_code.num_pieces()); num_chunks as usize];
        let mut inner = Inner {
            metadata,
            pub_key_table: Vec::new(),
            chunks,
            erasure_code,
            siafile_path,
            wal,
        };

        let mut updates = inner.save_header()?;
        for i in 0..inner.chunks.len() {
            updates.push(inner.save_chunk(i)?);
        }
        inner.create_and_apply_transaction(updates)?;

        Ok(SiaFile {
            inner: RwLock::new(inner),
        })
    }

    /// Loads a siafile from disk and attaches it to `wal` for future
    /// mutations.
    pub fn load(path: impl AsRef<Path>, wal: Wal) -> Result<SiaFile> {
        let inner = Inner::load(path.as_ref(), wal)?;
        Ok(SiaFile {
            inner: RwLock::new(inner),
        })
    }

    /// Records that `host_key` stores the piece `piece_index` of chunk
    /// `chunk_index` under `merkle_root`. Unknown hosts are appended to the
    /// key table as used; the chunk (and the header, when the table grew)
    /// is persisted in one transaction.
    pub fn add_piece(
        &self,
        host_key: SiaPublicKey,
        chunk_index: u64,
        piece_index: u64,
        merkle_root: MerkleRoot,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(!inner.metadata.deleted, "siafile has been deleted");

        let existing = inner
            .pub_key_table
            .iter()
            .position(|e| e.public_key == host_key);
        let (host_table_index, table_changed) = match existing {
            Some(i) => (i, false),
            None => {
                inner.pub_key_table.push(HostPublicKey {
                    public_key: host_key,
                    used: true,
                });
                (inner.pub_key_table.len() - 1, true)
            }
        };

        ensure!(
            (chunk_index as usize) < inner.chunks.len(),
            "unknown chunk index {}",
            chunk_index
        );
        let chunk_index = chunk_index as usize;
        ensure!(
            (piece_index as usize) < inner.chunks[chunk_index].pieces.len(),
            "piece index {} out of range",
            piece_index
        );
        inner.chunks[chunk_index].pieces[piece_index as usize].push(Piece {
            host_table_index: host_table_index as u32,
            merkle_root,
        });

        let mut updates = if table_changed {
            inner.save_header()?
        } else {
            Vec::new()
        };
        updates.push(inner.save_chunk(chunk_index)?);
        inner.create_and_apply_transaction(updates)
    }

    /// Flags every table entry whose key appears in `used` and clears the
    /// flag on the rest, preserving entry order, then persists the header.
    pub fn update_used_hosts(&self, used: &[SiaPublicKey]) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(!inner.metadata.deleted, "siafile has been deleted");

        let used: HashSet<&SiaPublicKey> = used.iter().collect();
        for entry in inner.pub_key_table.iter_mut() {
            entry.used = used.contains(&entry.public_key);
        }

        let updates = inner.save_header()?;
        inner.create_and_apply_transaction(updates)
    }

    /// Moves the siafile to a new location on disk and renames it within
    /// the renter namespace. The move is one atomic transaction: delete at
    /// the old path, insert of the full current contents at the new path.
    pub fn rename(&self, new_sia_path: &str, new_siafile_path: impl Into<PathBuf>) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(!inner.metadata.deleted, "siafile has been deleted");
        let new_siafile_path = new_siafile_path.into();
        ensure!(
            new_siafile_path.to_str().is_some(),
            "siafile path is not valid utf-8"
        );

        let contents = fs::read(&inner.siafile_path).wrap_err_with(|| {
            format!(
                "failed to read siafile at {}",
                inner.siafile_path.display()
            )
        })?;
        let updates = vec![
            inner.create_delete_update(),
            persist::create_insert_update(&new_siafile_path, 0, contents),
        ];
        inner.create_and_apply_transaction(updates)?;

        inner.siafile_path = new_siafile_path;
        inner.metadata.sia_path = new_sia_path.to_string();
        Ok(())
    }

    /// Removes the siafile from disk through the WAL and marks the handle
    /// deleted. Later persistence operations fail; the in-memory object
    /// stays readable for callers still holding it.
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(!inner.metadata.deleted, "siafile has been deleted");

        let update = inner.create_delete_update();
        inner.create_and_apply_transaction(vec![update])?;
        inner.metadata.deleted = true;
        Ok(())
    }

    /// The erasure coder the file was created with.
    pub fn erasure_code(&self) -> Arc<dyn ErasureCoder> {
        self.inner.read().erasure_code.clone()
    }

    /// Bytes of user data per piece.
    pub fn piece_size(&self) -> u64 {
        self.inner.read().metadata.piece_size
    }

    /// Bytes of user data per chunk.
    pub fn chunk_size(&self) -> u64 {
        let inner = self.inner.read();
        inner.metadata.piece_size * inner.erasure_code.min_pieces() as u64
    }

    pub fn num_chunks(&self) -> u64 {
        self.inner.read().chunks.len() as u64
    }

    pub fn file_size(&self) -> u64 {
        self.inner.read().metadata.file_size
    }

    pub fn mode(&self) -> u32 {
        self.inner.read().metadata.file_mode
    }

    /// Logical path of the file within the renter namespace.
    pub fn sia_path(&self) -> String {
        self.inner.read().metadata.sia_path.clone()
    }

    /// Source path of the file on local disk, empty when unknown.
    pub fn local_path(&self) -> String {
        self.inner.read().metadata.local_path.clone()
    }

    /// Location of the siafile container itself.
    pub fn siafile_path(&self) -> PathBuf {
        self.inner.read().siafile_path.clone()
    }

    pub fn deleted(&self) -> bool {
        self.inner.read().metadata.deleted
    }

    pub fn master_key(&self) -> Result<MasterKey> {
        let inner = self.inner.read();
        let cipher = CipherType::from_specifier(inner.metadata.cipher_type)?;
        Ok(MasterKey::new(cipher, inner.metadata.master_key.clone()))
    }

    /// Snapshot of the host key table in insertion order.
    pub fn host_public_keys(&self) -> Vec<HostPublicKey> {
        self.inner.read().pub_key_table.clone()
    }

    /// Snapshot of the piece sets of one chunk, indexed by erasure piece
    /// index.
    pub fn pieces(&self, chunk_index: u64) -> Result<Vec<Vec<Piece>>> {
        let inner = self.inner.read();
        ensure!(
            (chunk_index as usize) < inner.chunks.len(),
            "unknown chunk index {}",
            chunk_index
        );
        Ok(inner.chunks[chunk_index as usize]
            .pieces
            .iter()
            .map(|l| l.to_vec())
            .collect())
    }
}

impl Inner {
    /// Byte offset of chunk `chunk_index` inside the container.
    pub(crate) fn chunk_offset(&self, chunk_index: usize) -> u64 {
        self.metadata.chunk_offset
            + chunk_index as u64 * self.metadata.pages_per_chunk as u64 * PAGE_SIZE
    }

    /// On-disk slot size of one chunk record.
    pub(crate) fn chunk_slot_size(&self) -> u64 {
        self.metadata.pages_per_chunk as u64 * PAGE_SIZE
    }
}
