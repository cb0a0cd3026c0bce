//! # Persistence Engine
//!
//! Everything that turns in-memory siafile state into durable bytes: the
//! WAL update blobs, the header writer with its page-growth protocol, the
//! chunk writer, the idempotent update applier and the loader.
//!
//! ## Update Blobs
//!
//! Two update kinds cross the WAL boundary, each self-describing:
//!
//! ```text
//! "siafile_insert": { path string | u64 offset | bytes data }
//! "siafile_delete": { path string }
//! ```
//!
//! Applying an insert writes `data` at `offset`, creating the file (mode
//! 0600) when absent and truncating nothing. Applying a delete removes the
//! file and treats "already gone" as success. Both are idempotent, which is
//! what lets WAL recovery re-apply a transaction whose effects partially
//! reached disk.
//!
//! ## Header Growth
//!
//! The host key table lives between the metadata page and `chunk_offset`.
//! When it outgrows that region, `save_header` moves the chunk region out
//! by whole pages: every chunk's current on-disk bytes are captured into
//! relocation inserts at their new offsets, then the refreshed metadata and
//! table are appended to the same update list. The whole list commits as
//! one WAL transaction, so a crash either leaves the old layout or installs
//! the new one — never a half-moved chunk region.
//!
//! Relocation snapshots the bytes at update-build time; a save_chunk update
//! for the same chunk later in the list simply overwrites the slot, so
//! in-list order stays correct.

use eyre::{bail, ensure, Result, WrapErr};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::{METADATA_VERSION, PAGE_SIZE};
use crate::encoding::{write_bytes, write_str, write_u64, Decoder};
use crate::types::CipherType;
use crate::wal::{Update, Wal};

use super::encoding::{
    marshal_chunk, marshal_metadata, marshal_pub_key_table, unmarshal_chunk,
    unmarshal_erasure_coder, unmarshal_metadata, unmarshal_pub_key_table,
};
use super::Inner;

/// Name tag of the insert update kind.
pub const UPDATE_NAME_INSERT: &str = "siafile_insert";

/// Name tag of the delete update kind.
pub const UPDATE_NAME_DELETE: &str = "siafile_delete";

pub(crate) fn create_insert_update(path: &Path, index: u64, data: Vec<u8>) -> Update {
    let mut instructions = Vec::with_capacity(24 + data.len());
    write_str(&mut instructions, &path.to_string_lossy());
    write_u64(&mut instructions, index);
    write_bytes(&mut instructions, &data);
    Update {
        name: UPDATE_NAME_INSERT.to_string(),
        instructions,
    }
}

pub(crate) fn create_delete_update(path: &Path) -> Update {
    let mut instructions = Vec::new();
    write_str(&mut instructions, &path.to_string_lossy());
    Update {
        name: UPDATE_NAME_DELETE.to_string(),
        instructions,
    }
}

/// Decodes an insert update into its `(path, offset, data)` triple.
pub fn read_insert_update(update: &Update) -> Result<(PathBuf, u64, Vec<u8>)> {
    ensure!(
        update.name == UPDATE_NAME_INSERT,
        "not an insert update: {}",
        update.name
    );
    let mut dec = Decoder::new(&update.instructions);
    let path = PathBuf::from(dec.read_str()?);
    let index = dec.read_u64()?;
    let data = dec.read_bytes()?;
    Ok((path, index, data))
}

/// Decodes a delete update into the path it removes.
pub fn read_delete_update(update: &Update) -> Result<PathBuf> {
    ensure!(
        update.name == UPDATE_NAME_DELETE,
        "not a delete update: {}",
        update.name
    );
    let mut dec = Decoder::new(&update.instructions);
    Ok(PathBuf::from(dec.read_str()?))
}

fn apply_insert(path: &Path, index: u64, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).wrap_err_with(|| {
                format!("failed to create directory {}", parent.display())
            })?;
        }
    }
    let mut options = OpenOptions::new();
    options.create(true).read(true).write(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(crate::config::SIAFILE_MODE);
    }
    let mut file = options
        .open(path)
        .wrap_err_with(|| format!("failed to open siafile at {}", path.display()))?;
    file.seek(SeekFrom::Start(index))
        .wrap_err("failed to seek to insert offset")?;
    file.write_all(data)
        .wrap_err_with(|| format!("failed to write {} bytes at {}", data.len(), index))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to sync siafile at {}", path.display()))?;
    Ok(())
}

fn apply_delete(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).wrap_err_with(|| format!("failed to delete siafile at {}", path.display()))
        }
    }
}

/// Applies a set of siafile updates to disk. This is the entry point used
/// during WAL recovery, where no [`super::SiaFile`] object exists yet;
/// applying the same set twice yields the same disk state.
pub fn apply_updates(updates: &[Update]) -> Result<()> {
    for update in updates {
        match update.name.as_str() {
            UPDATE_NAME_INSERT => {
                let (path, index, data) = read_insert_update(update)?;
                apply_insert(&path, index, &data)?;
            }
            UPDATE_NAME_DELETE => {
                let path = read_delete_update(update)?;
                apply_delete(&path)?;
            }
            other => bail!("unknown update kind: {}", other),
        }
    }
    Ok(())
}

impl Inner {
    pub(crate) fn create_insert_update(&self, index: u64, data: Vec<u8>) -> Update {
        create_insert_update(&self.siafile_path, index, data)
    }

    pub(crate) fn create_delete_update(&self) -> Update {
        create_delete_update(&self.siafile_path)
    }

    /// Same as the free [`apply_updates`], but refuses to touch disk once
    /// the file has been deleted.
    pub(crate) fn apply_updates(&self, updates: &[Update]) -> Result<()> {
        ensure!(
            !self.metadata.deleted,
            "cannot apply updates on deleted siafile"
        );
        apply_updates(updates)
    }

    /// Runs `updates` through the WAL's three-phase commit: register,
    /// signal setup-complete, apply, release. An empty set is a no-op.
    pub(crate) fn create_and_apply_transaction(&self, updates: Vec<Update>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        ensure!(
            !self.metadata.deleted,
            "cannot apply updates on deleted siafile"
        );
        let mut txn = self.wal.new_transaction(updates);
        txn.signal_setup_complete()
            .wrap_err("wal: failed to make transaction durable")?;
        apply_updates(txn.updates())?;
        txn.signal_updates_applied()
            .wrap_err("wal: failed to release transaction")?;
        Ok(())
    }

    /// Builds the updates that persist the current metadata and host key
    /// table, growing the header region first when the table no longer
    /// fits. Committing the returned list is the caller's job.
    pub(crate) fn save_header(&mut self) -> Result<Vec<Update>> {
        let table = marshal_pub_key_table(&self.pub_key_table);

        let mut updates = Vec::new();
        let table_end = self.metadata.pub_key_table_offset + table.len() as u64;
        if table_end > self.metadata.chunk_offset {
            updates = self.allocate_header_pages(table.len() as u64)?;
        }

        let metadata = marshal_metadata(&self.metadata);
        ensure!(
            metadata.len() as u64 <= self.metadata.pub_key_table_offset,
            "metadata record of {} bytes does not fit before the key table at {}",
            metadata.len(),
            self.metadata.pub_key_table_offset
        );

        updates.push(self.create_insert_update(0, metadata));
        updates.push(self.create_insert_update(self.metadata.pub_key_table_offset, table));
        Ok(updates)
    }

    /// Moves `chunk_offset` out by the smallest number of whole pages that
    /// fits a key table of `table_len` bytes and returns one relocation
    /// insert per chunk currently on disk, carrying its bytes verbatim.
    fn allocate_header_pages(&mut self, table_len: u64) -> Result<Vec<Update>> {
        let needed = self.metadata.pub_key_table_offset + table_len;
        let mut new_chunk_offset = self.metadata.chunk_offset;
        while new_chunk_offset < needed {
            new_chunk_offset += PAGE_SIZE;
        }

        let old_chunk_offset = self.metadata.chunk_offset;
        let slot = self.chunk_slot_size();
        let mut file = File::open(&self.siafile_path).wrap_err_with(|| {
            format!("failed to open siafile at {}", self.siafile_path.display())
        })?;
        let file_len = file
            .metadata()
            .wrap_err("failed to stat siafile")?
            .len();

        let mut updates = Vec::with_capacity(self.chunks.len());
        for i in 0..self.chunks.len() {
            let old = old_chunk_offset + i as u64 * slot;
            if old >= file_len {
                break;
            }
            let take = slot.min(file_len - old) as usize;
            let mut data = vec![0u8; take];
            file.seek(SeekFrom::Start(old))
                .wrap_err("failed to seek to chunk")?;
            file.read_exact(&mut data)
                .wrap_err_with(|| format!("failed to read chunk {} for relocation", i))?;
            updates.push(create_insert_update(
                &self.siafile_path,
                new_chunk_offset + i as u64 * slot,
                data,
            ));
        }

        self.metadata.chunk_offset = new_chunk_offset;
        Ok(updates)
    }

    /// Builds the insert that persists chunk `chunk_index` at its slot,
    /// padded to the slot size unless it is the final chunk of the file.
    pub(crate) fn save_chunk(&self, chunk_index: usize) -> Result<Update> {
        ensure!(
            chunk_index < self.chunks.len(),
            "unknown chunk index {}",
            chunk_index
        );
        let mut data = marshal_chunk(&self.chunks[chunk_index])?;
        let slot = self.chunk_slot_size();
        ensure!(
            data.len() as u64 <= slot,
            "chunk {} marshals to {} bytes, slot is {}",
            chunk_index,
            data.len(),
            slot
        );
        if chunk_index + 1 < self.chunks.len() {
            data.resize(slot as usize, 0);
        }
        Ok(self.create_insert_update(self.chunk_offset(chunk_index), data))
    }

    /// Reads and decodes a siafile container: metadata at offset 0, the key
    /// table one region up, then exactly the derived number of chunk slots,
    /// tolerating a short final chunk at EOF.
    pub(crate) fn load(path: &Path, wal: Wal) -> Result<Inner> {
        ensure!(path.to_str().is_some(), "siafile path is not valid utf-8");
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                bail!("siafile not found at {}", path.display())
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to read siafile at {}", path.display()))
            }
        };

        let metadata = unmarshal_metadata(&raw).wrap_err("corrupt siafile header")?;
        ensure!(
            metadata.version == METADATA_VERSION,
            "unsupported siafile format version"
        );
        ensure!(
            metadata.pub_key_table_offset % PAGE_SIZE == 0
                && metadata.chunk_offset % PAGE_SIZE == 0
                && metadata.pub_key_table_offset <= metadata.chunk_offset,
            "corrupt siafile header: bad region offsets"
        );
        ensure!(metadata.pages_per_chunk >= 1, "corrupt siafile header: zero pages per chunk");
        CipherType::from_specifier(metadata.cipher_type)?;

        ensure!(
            (metadata.pub_key_table_offset as usize) < raw.len(),
            "short read: missing host key table"
        );
        let pub_key_table =
            unmarshal_pub_key_table(&raw[metadata.pub_key_table_offset as usize..])
                .wrap_err("corrupt host key table")?;

        let erasure_code =
            unmarshal_erasure_coder(metadata.erasure_code_type, metadata.erasure_code_params)?;
        let chunk_size = metadata.piece_size * erasure_code.min_pieces() as u64;
        ensure!(chunk_size > 0, "corrupt siafile header: zero chunk size");
        let num_chunks = metadata.file_size.div_ceil(chunk_size).max(1);

        let slot = metadata.pages_per_chunk as u64 * PAGE_SIZE;
        let mut chunks = Vec::with_capacity(num_chunks as usize);
        for i in 0..num_chunks {
            let offset = metadata.chunk_offset + i * slot;
            ensure!(
                (offset as usize) < raw.len(),
                "short read: chunk {} missing at offset {}",
                i,
                offset
            );
            let end = raw.len().min((offset + slot) as usize);
            let chunk = unmarshal_chunk(erasure_code.num_pieces(), &raw[offset as usize..end])
                .wrap_err_with(|| format!("corrupt chunk {}", i))?;
            for piece in chunk.pieces.iter().flatten() {
                ensure!(
                    (piece.host_table_index as usize) < pub_key_table.len(),
                    "corrupt chunk {}: host index {} out of range",
                    i,
                    piece.host_table_index
                );
            }
            chunks.push(chunk);
        }

        Ok(Inner {
            metadata,
            pub_key_table,
            chunks,
            erasure_code,
            siafile_path: path.to_path_buf(),
            wal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{Chunk, Piece};
    use super::*;
    use crate::config::INITIAL_CHUNK_OFFSET;
    use rand::{Rng, RngCore};
    use tempfile::tempdir;

    fn random_bytes(n: usize) -> Vec<u8> {
        let mut data = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn random_chunk(num_pieces: usize) -> Chunk {
        let mut rng = rand::thread_rng();
        let mut chunk = Chunk::empty(num_pieces);
        for list in chunk.pieces.iter_mut() {
            for _ in 0..rng.gen_range(0..3) {
                list.push(Piece {
                    host_table_index: rng.gen_range(0..100),
                    merkle_root: random_merkle_root(),
                });
            }
        }
        chunk
    }

    #[test]
    fn insert_update_round_trip() {
        let dir = tempdir().unwrap();
        let sf = new_test_file(dir.path());
        let inner = sf.inner.read();

        let index = rand::thread_rng().gen_range(0..100u64);
        let data = random_bytes(10);
        let update = inner.create_insert_update(index, data.clone());

        let (read_path, read_index, read_data) = read_insert_update(&update).unwrap();
        assert_eq!(read_path, inner.siafile_path);
        assert_eq!(read_index, index);
        assert_eq!(read_data, data);
    }

    #[test]
    fn delete_update_round_trip() {
        let dir = tempdir().unwrap();
        let sf = new_test_file(dir.path());
        let inner = sf.inner.read();

        let update = inner.create_delete_update();
        let read_path = read_delete_update(&update).unwrap();
        assert_eq!(read_path, inner.siafile_path);
    }

    #[test]
    fn unknown_update_kind_is_an_error() {
        let update = Update {
            name: "siafile_truncate".to_string(),
            instructions: Vec::new(),
        };
        let err = apply_updates(&[update]).unwrap_err();
        assert!(err.to_string().contains("unknown update kind"));
    }

    // Every apply variant must write the same bytes to the same place.
    #[test]
    fn apply_variants_write_identical_data() {
        type Apply<'a> = Box<dyn Fn(Vec<Update>) -> Result<()> + 'a>;

        let dir = tempdir().unwrap();
        let sf = new_test_file(dir.path());
        let inner = sf.inner.read();

        let variants: Vec<(&str, Apply)> = vec![
            ("free function", Box::new(|u: Vec<Update>| apply_updates(&u))),
            ("method", Box::new(|u: Vec<Update>| inner.apply_updates(&u))),
            (
                "transaction",
                Box::new(|u: Vec<Update>| inner.create_and_apply_transaction(u)),
            ),
        ];
        for (name, apply) in variants {
            let index = rand::thread_rng().gen_range(1..100u64);
            let data = random_bytes(100);
            apply(vec![inner.create_insert_update(index, data.clone())]).unwrap();

            let mut file = File::open(&inner.siafile_path).unwrap();
            file.seek(SeekFrom::Start(index)).unwrap();
            let mut read_data = vec![0u8; data.len()];
            file.read_exact(&mut read_data).unwrap();
            assert_eq!(read_data, data, "apply variant {} mismatch", name);
        }
    }

    #[test]
    fn save_chunk_persists_marshaled_chunk() {
        let dir = tempdir().unwrap();
        let sf = new_test_file(dir.path());
        let mut inner = sf.inner.write();

        let chunk_index = rand::thread_rng().gen_range(0..inner.chunks.len());
        let chunk = random_chunk(inner.erasure_code.num_pieces());
        inner.chunks[chunk_index] = chunk.clone();

        let update = inner.save_chunk(chunk_index).unwrap();
        inner.create_and_apply_transaction(vec![update]).unwrap();

        let marshaled = marshal_chunk(&chunk).unwrap();
        let mut file = File::open(&inner.siafile_path).unwrap();
        file.seek(SeekFrom::Start(inner.chunk_offset(chunk_index)))
            .unwrap();
        let mut read_chunk = vec![0u8; marshaled.len()];
        file.read_exact(&mut read_chunk).unwrap();
        assert_eq!(read_chunk, marshaled);
    }

    #[test]
    fn save_header_in_place() {
        let dir = tempdir().unwrap();
        let sf = new_blank_test_file(dir.path());
        add_random_host_keys(&sf, 10);
        let mut inner = sf.inner.write();

        let updates = inner.save_header().unwrap();
        inner.create_and_apply_transaction(updates).unwrap();

        // Ten keys fit comfortably in the one-page table region.
        assert_eq!(inner.metadata.chunk_offset, INITIAL_CHUNK_OFFSET);

        let raw = fs::read(&inner.siafile_path).unwrap();
        let metadata = marshal_metadata(&inner.metadata);
        assert_eq!(&raw[..metadata.len()], metadata.as_slice());
        let table = marshal_pub_key_table(&inner.pub_key_table);
        let table_offset = inner.metadata.pub_key_table_offset as usize;
        assert_eq!(&raw[table_offset..table_offset + table.len()], table.as_slice());
    }

    #[test]
    fn save_header_grows_and_relocates_chunks() {
        let dir = tempdir().unwrap();
        let sf = new_blank_test_file(dir.path());
        add_random_host_keys(&sf, 100);
        let mut inner = sf.inner.write();

        // Plant a sentinel right at the old chunk region start.
        let sentinel = random_bytes(100);
        let old_chunk_offset = inner.metadata.chunk_offset;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&inner.siafile_path)
                .unwrap();
            file.seek(SeekFrom::Start(old_chunk_offset)).unwrap();
            file.write_all(&sentinel).unwrap();
        }

        let updates = inner.save_header().unwrap();
        inner.create_and_apply_transaction(updates).unwrap();

        // 100 keys overflow one table page by less than a page.
        assert_eq!(inner.metadata.chunk_offset, old_chunk_offset + PAGE_SIZE);

        let raw = fs::read(&inner.siafile_path).unwrap();
        let new_chunk_offset = inner.metadata.chunk_offset as usize;
        assert_eq!(&raw[new_chunk_offset..new_chunk_offset + sentinel.len()], sentinel.as_slice());

        let metadata = marshal_metadata(&inner.metadata);
        assert_eq!(&raw[..metadata.len()], metadata.as_slice());
        let table = marshal_pub_key_table(&inner.pub_key_table);
        let table_offset = inner.metadata.pub_key_table_offset as usize;
        assert_eq!(&raw[table_offset..table_offset + table.len()], table.as_slice());
    }

    #[test]
    fn chunk_offsets_are_linear() {
        let dir = tempdir().unwrap();
        let sf = new_test_file(dir.path());
        let mut inner = sf.inner.write();
        inner.metadata.pages_per_chunk = rand::thread_rng().gen_range(1..=5);

        let slot = inner.chunk_slot_size();
        assert_eq!(inner.chunk_offset(0), inner.metadata.chunk_offset);
        assert_eq!(inner.chunk_offset(1), inner.chunk_offset(0) + slot);
        assert_eq!(inner.chunk_offset(7) - inner.chunk_offset(6), slot);
    }

    #[test]
    fn new_file_ends_at_last_marshaled_byte() {
        let dir = tempdir().unwrap();
        let sf = new_blank_test_file(dir.path());
        let inner = sf.inner.read();

        let last = inner.chunks.len() - 1;
        let last_len = marshal_chunk(&inner.chunks[last]).unwrap().len() as u64;
        let disk_len = fs::metadata(&inner.siafile_path).unwrap().len();
        assert_eq!(disk_len, inner.chunk_offset(last) + last_len);
    }

    #[test]
    fn apply_on_deleted_file_is_rejected() {
        let dir = tempdir().unwrap();
        let sf = new_test_file(dir.path());
        let mut inner = sf.inner.write();
        inner.metadata.deleted = true;

        let update = inner.create_insert_update(0, vec![1, 2, 3]);
        let err = inner.apply_updates(std::slice::from_ref(&update)).unwrap_err();
        assert!(err.to_string().contains("deleted"));
        let err = inner.create_and_apply_transaction(vec![update]).unwrap_err();
        assert!(err.to_string().contains("deleted"));
    }

    #[test]
    fn load_missing_file_reports_not_found() {
        let dir = tempdir().unwrap();
        let wal = new_test_wal(dir.path());
        let err = Inner::load(&dir.path().join("absent.sia"), wal).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn load_rejects_corrupt_header() {
        let dir = tempdir().unwrap();
        let sf = new_blank_test_file(dir.path());
        let path = sf.siafile_path();
        let wal = sf.inner.read().wal.clone();

        let mut raw = fs::read(&path).unwrap();
        raw[..64].fill(0xff);
        fs::write(&path, &raw).unwrap();

        let err = Inner::load(&path, wal).unwrap_err();
        assert!(err.to_string().contains("corrupt siafile header"));
    }
}
