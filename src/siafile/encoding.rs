//! # SiaFile Binary Codec
//!
//! Pure (de)serializers for the three container regions: the metadata
//! record, the host public key table, and the chunk records with their
//! fixed-width pieces. No function here performs I/O.
//!
//! ## Record Formats
//!
//! ### Metadata (offset 0)
//!
//! One length-prefixed record; everything after the prefixed bytes is
//! padding and ignored by the decoder. Inside the record the fields follow
//! in fixed order using the primitive codec of [`crate::encoding`].
//!
//! ### Host public key table (offset `pub_key_table_offset`)
//!
//! ```text
//! u64 entry count
//!   entry 0: length-prefixed { specifier(16) | key bytes | used bool }
//!   entry 1: …
//! ```
//!
//! Entry order is insertion order and is preserved bytewise; the entry index
//! is the stable host identifier referenced by piece records.
//!
//! ### Chunk (offset `chunk_offset + i * pages_per_chunk * PAGE_SIZE`)
//!
//! ```text
//! u8 total piece count
//!   piece record 0 (40 bytes): u32 piece_index | u32 host_table_index | root(32)
//!   piece record 1: …
//! ```
//!
//! The record carries its piece index so the decoder can rebuild the
//! per-piece-index lists. Trailing slot padding is ignored.
//!
//! ### Erasure coder
//!
//! A 16-byte type specifier plus 4 parameter bytes. For Reed-Solomon the
//! parameters are a big-endian `{u16 data, u16 parity}` pair. An unknown
//! specifier is a decode error, never a fallback.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use std::sync::Arc;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MARSHALED_PIECE_SIZE, RS_CODE_SPECIFIER};
use crate::encoding::{
    write_array, write_bool, write_bytes, write_i64, write_str, write_u64, Decoder,
};
use crate::erasure::{ErasureCodeSpec, ErasureCoder};
use crate::types::Specifier;

use super::{Chunk, HostPublicKey, Metadata, Piece, SiaPublicKey};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PieceRecord {
    piece_index: U32,
    host_table_index: U32,
    merkle_root: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<PieceRecord>() == MARSHALED_PIECE_SIZE as usize);

pub fn marshal_metadata(md: &Metadata) -> Vec<u8> {
    let mut record = Vec::new();
    write_array(&mut record, &md.version);
    write_u64(&mut record, md.file_size);
    write_bytes(&mut record, &md.master_key);
    write_array(&mut record, md.cipher_type.as_bytes());
    write_u64(&mut record, md.file_mode as u64);
    record.push(md.pages_per_chunk);
    write_array(&mut record, md.erasure_code_type.as_bytes());
    write_array(&mut record, &md.erasure_code_params);
    write_u64(&mut record, md.piece_size);
    write_str(&mut record, &md.sia_path);
    write_str(&mut record, &md.local_path);
    write_i64(&mut record, md.access_time);
    write_i64(&mut record, md.change_time);
    write_i64(&mut record, md.create_time);
    write_i64(&mut record, md.mod_time);
    write_u64(&mut record, md.chunk_offset);
    write_u64(&mut record, md.pub_key_table_offset);
    write_bool(&mut record, md.deleted);

    let mut out = Vec::with_capacity(8 + record.len());
    write_bytes(&mut out, &record);
    out
}

pub fn unmarshal_metadata(raw: &[u8]) -> Result<Metadata> {
    let mut outer = Decoder::new(raw);
    let record = outer.read_bytes()?;
    let mut dec = Decoder::new(&record);

    let version = dec.read_array::<16>()?;
    let file_size = dec.read_u64()?;
    let master_key = dec.read_bytes()?;
    let cipher_type = Specifier(dec.read_array::<16>()?);
    let file_mode = dec.read_u64()? as u32;
    let pages_per_chunk = dec.read_array::<1>()?[0];
    ensure!(pages_per_chunk >= 1, "metadata has zero pages per chunk");
    let erasure_code_type = Specifier(dec.read_array::<16>()?);
    let erasure_code_params = dec.read_array::<4>()?;
    let piece_size = dec.read_u64()?;
    let sia_path = dec.read_str()?;
    let local_path = dec.read_str()?;
    let access_time = dec.read_i64()?;
    let change_time = dec.read_i64()?;
    let create_time = dec.read_i64()?;
    let mod_time = dec.read_i64()?;
    let chunk_offset = dec.read_u64()?;
    let pub_key_table_offset = dec.read_u64()?;
    let deleted = dec.read_bool()?;

    Ok(Metadata {
        version,
        file_size,
        master_key,
        cipher_type,
        file_mode,
        pages_per_chunk,
        erasure_code_type,
        erasure_code_params,
        piece_size,
        sia_path,
        local_path,
        access_time,
        change_time,
        create_time,
        mod_time,
        chunk_offset,
        pub_key_table_offset,
        deleted,
    })
}

pub fn marshal_pub_key_table(table: &[HostPublicKey]) -> Vec<u8> {
    let mut out = Vec::new();
    write_u64(&mut out, table.len() as u64);
    for entry in table {
        let mut record = Vec::new();
        write_array(&mut record, entry.public_key.algorithm.as_bytes());
        write_bytes(&mut record, &entry.public_key.key);
        write_bool(&mut record, entry.used);
        write_bytes(&mut out, &record);
    }
    out
}

pub fn unmarshal_pub_key_table(raw: &[u8]) -> Result<Vec<HostPublicKey>> {
    let mut dec = Decoder::new(raw);
    let count = dec.read_u64()?;
    let mut table = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let record = dec.read_bytes()?;
        let mut rec = Decoder::new(&record);
        let algorithm = Specifier(rec.read_array::<16>()?);
        let key = rec.read_bytes()?;
        let used = rec.read_bool()?;
        table.push(HostPublicKey {
            public_key: SiaPublicKey { algorithm, key },
            used,
        });
    }
    Ok(table)
}

/// Appends the 40-byte record of `piece` at `piece_index` to `buf`. When the
/// spare capacity of `buf` covers the record, the append is guaranteed not
/// to reallocate, so callers may size one buffer for a whole chunk and keep
/// its backing storage.
pub fn marshal_piece_into(buf: &mut Vec<u8>, piece_index: u32, piece: &Piece) {
    let record = PieceRecord {
        piece_index: U32::new(piece_index),
        host_table_index: U32::new(piece.host_table_index),
        merkle_root: piece.merkle_root,
    };
    buf.extend_from_slice(record.as_bytes());
}

/// Decodes one 40-byte piece record, returning the piece index it belongs to.
pub fn unmarshal_piece(raw: &[u8]) -> Result<(u32, Piece)> {
    ensure!(
        raw.len() >= MARSHALED_PIECE_SIZE as usize,
        "truncated piece record: {} bytes",
        raw.len()
    );
    let record = PieceRecord::read_from_bytes(&raw[..MARSHALED_PIECE_SIZE as usize])
        .map_err(|e| eyre::eyre!("failed to decode piece record: {:?}", e))?;
    Ok((
        record.piece_index.get(),
        Piece {
            host_table_index: record.host_table_index.get(),
            merkle_root: record.merkle_root,
        },
    ))
}

/// Serializes a chunk to exactly `1 + num_pieces * 40` bytes. Padding the
/// result to the chunk's page slot is the writer's job.
pub fn marshal_chunk(chunk: &Chunk) -> Result<Vec<u8>> {
    let num_pieces = chunk.num_pieces();
    ensure!(
        num_pieces <= u8::MAX as u64,
        "chunk holds {} pieces, format limit is {}",
        num_pieces,
        u8::MAX
    );
    let mut out = Vec::with_capacity(1 + (num_pieces * MARSHALED_PIECE_SIZE) as usize);
    out.push(num_pieces as u8);
    for (piece_index, pieces) in chunk.pieces.iter().enumerate() {
        for piece in pieces {
            marshal_piece_into(&mut out, piece_index as u32, piece);
        }
    }
    Ok(out)
}

/// Decodes a chunk with `num_pieces` erasure piece indices from `raw`,
/// ignoring any trailing slot padding.
pub fn unmarshal_chunk(num_pieces: usize, raw: &[u8]) -> Result<Chunk> {
    ensure!(!raw.is_empty(), "truncated chunk: missing piece count");
    let count = raw[0] as usize;
    let need = 1 + count * MARSHALED_PIECE_SIZE as usize;
    ensure!(
        raw.len() >= need,
        "truncated chunk: {} pieces need {} bytes, have {}",
        count,
        need,
        raw.len()
    );

    let mut pieces: Vec<SmallVec<[Piece; 2]>> = vec![SmallVec::new(); num_pieces];
    for i in 0..count {
        let off = 1 + i * MARSHALED_PIECE_SIZE as usize;
        let (piece_index, piece) = unmarshal_piece(&raw[off..])?;
        ensure!(
            (piece_index as usize) < num_pieces,
            "piece index {} out of range for erasure code width {}",
            piece_index,
            num_pieces
        );
        pieces[piece_index as usize].push(piece);
    }
    Ok(Chunk { pieces })
}

/// Splits an erasure coder into its on-disk `{type specifier, params}` pair.
pub fn marshal_erasure_coder(ec: &dyn ErasureCoder) -> (Specifier, [u8; 4]) {
    match ec.spec() {
        ErasureCodeSpec::ReedSolomon { data, parity } => {
            let mut params = [0u8; 4];
            params[..2].copy_from_slice(&data.to_be_bytes());
            params[2..].copy_from_slice(&parity.to_be_bytes());
            (Specifier(RS_CODE_SPECIFIER), params)
        }
    }
}

/// Rebuilds an erasure coder from its on-disk pair. Unknown specifiers are a
/// decode error.
pub fn unmarshal_erasure_coder(
    ec_type: Specifier,
    params: [u8; 4],
) -> Result<Arc<dyn ErasureCoder>> {
    if ec_type != Specifier(RS_CODE_SPECIFIER) {
        bail!("unknown erasure code type: {}", ec_type);
    }
    let data = u16::from_be_bytes([params[0], params[1]]);
    let parity = u16::from_be_bytes([params[2], params[3]]);
    ErasureCodeSpec::ReedSolomon { data, parity }.coder()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{marshaled_chunk_size, METADATA_VERSION};
    use crate::erasure::RsCode;
    use rand::{Rng, RngCore};

    fn random_root() -> [u8; 32] {
        let mut root = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut root);
        root
    }

    fn random_piece() -> Piece {
        Piece {
            host_table_index: rand::thread_rng().gen_range(0..100),
            merkle_root: random_root(),
        }
    }

    fn random_chunk() -> Chunk {
        let mut rng = rand::thread_rng();
        let mut chunk = Chunk::empty(30);
        for list in chunk.pieces.iter_mut() {
            for _ in 0..rng.gen_range(0..3) {
                list.push(random_piece());
            }
        }
        chunk
    }

    fn test_metadata() -> Metadata {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Metadata {
            version: METADATA_VERSION,
            file_size: 1 << 24,
            master_key: key,
            cipher_type: crate::types::CipherType::TwofishGcm.specifier(),
            file_mode: 0o777,
            pages_per_chunk: 1,
            erasure_code_type: Specifier(RS_CODE_SPECIFIER),
            erasure_code_params: [0, 10, 0, 20],
            piece_size: crate::config::SECTOR_SIZE - 28,
            sia_path: "backups/photos".to_string(),
            local_path: "/home/user/photos.tar".to_string(),
            access_time: 1_700_000_001,
            change_time: 1_700_000_002,
            create_time: 1_700_000_003,
            mod_time: 1_700_000_004,
            chunk_offset: 8192,
            pub_key_table_offset: 4096,
            deleted: false,
        }
    }

    #[test]
    fn metadata_round_trip() {
        let md = test_metadata();
        let raw = marshal_metadata(&md);
        let decoded = unmarshal_metadata(&raw).unwrap();
        assert_eq!(decoded, md);
    }

    #[test]
    fn metadata_decoder_tolerates_page_padding() {
        let md = test_metadata();
        let mut raw = marshal_metadata(&md);
        raw.resize(4096, 0);
        let decoded = unmarshal_metadata(&raw).unwrap();
        assert_eq!(decoded, md);
    }

    #[test]
    fn truncated_metadata_is_an_error() {
        let raw = marshal_metadata(&test_metadata());
        assert!(unmarshal_metadata(&raw[..raw.len() / 2]).is_err());
    }

    #[test]
    fn pub_key_table_round_trip_preserves_order_and_flags() {
        let mut rng = rand::thread_rng();
        let table: Vec<HostPublicKey> = (0..10)
            .map(|i| {
                let mut spec = [0u8; 16];
                rng.fill_bytes(&mut spec);
                let mut key = vec![0u8; 32];
                rng.fill_bytes(&mut key);
                HostPublicKey {
                    public_key: SiaPublicKey {
                        algorithm: Specifier(spec),
                        key,
                    },
                    used: i % 2 == 0,
                }
            })
            .collect();

        let raw = marshal_pub_key_table(&table);
        let decoded = unmarshal_pub_key_table(&raw).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn empty_pub_key_table_round_trip() {
        let raw = marshal_pub_key_table(&[]);
        assert!(unmarshal_pub_key_table(&raw).unwrap().is_empty());
    }

    #[test]
    fn chunk_round_trip_with_trailing_padding() {
        let chunk = random_chunk();
        let mut raw = marshal_chunk(&chunk).unwrap();
        assert_eq!(raw.len() as u64, marshaled_chunk_size(chunk.num_pieces()));

        // Decoding must survive slot padding after the records.
        let mut tail = vec![0u8; 100];
        rand::thread_rng().fill_bytes(&mut tail);
        raw.extend_from_slice(&tail);

        let decoded = unmarshal_chunk(30, &raw).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn empty_chunk_is_one_byte() {
        let chunk = Chunk::empty(30);
        let raw = marshal_chunk(&chunk).unwrap();
        assert_eq!(raw, vec![0u8]);
        assert_eq!(unmarshal_chunk(30, &raw).unwrap(), chunk);
    }

    #[test]
    fn chunk_with_out_of_range_piece_index_is_an_error() {
        let mut chunk = Chunk::empty(5);
        chunk.pieces[4].push(random_piece());
        let raw = marshal_chunk(&chunk).unwrap();
        // Same bytes decoded with a narrower erasure width must fail.
        assert!(unmarshal_chunk(3, &raw).is_err());
    }

    #[test]
    fn piece_round_trip() {
        let piece = random_piece();
        let piece_index = rand::thread_rng().gen_range(0..100u32);

        let mut raw = Vec::new();
        marshal_piece_into(&mut raw, piece_index, &piece);
        assert_eq!(raw.len() as u64, MARSHALED_PIECE_SIZE);

        let (decoded_index, decoded) = unmarshal_piece(&raw).unwrap();
        assert_eq!(decoded_index, piece_index);
        assert_eq!(decoded, piece);
    }

    #[test]
    fn marshal_piece_reuses_caller_buffer() {
        let piece = random_piece();
        let mut buf: Vec<u8> = Vec::with_capacity(2 * MARSHALED_PIECE_SIZE as usize);
        let before = buf.as_ptr();

        marshal_piece_into(&mut buf, 3, &piece);
        assert_eq!(buf.len() as u64, MARSHALED_PIECE_SIZE);
        assert_eq!(buf.as_ptr(), before);

        marshal_piece_into(&mut buf, 3, &piece);
        assert_eq!(buf.len() as u64, 2 * MARSHALED_PIECE_SIZE);
        assert_eq!(buf.as_ptr(), before);

        let (i1, p1) = unmarshal_piece(&buf).unwrap();
        let (i2, p2) = unmarshal_piece(&buf[MARSHALED_PIECE_SIZE as usize..]).unwrap();
        assert_eq!((i1, p1), (i2, p2));
        assert_eq!(p1, piece);
    }

    #[test]
    fn erasure_coder_round_trip() {
        let rs = RsCode::new(10, 20).unwrap();
        let (ec_type, params) = marshal_erasure_coder(&rs);
        let decoded = unmarshal_erasure_coder(ec_type, params).unwrap();
        assert_eq!(decoded.num_pieces(), 30);
        assert_eq!(decoded.min_pieces(), 10);
    }

    #[test]
    fn unknown_erasure_code_type_is_an_error() {
        let err = unmarshal_erasure_coder(Specifier::new("fountain"), [0; 4]).unwrap_err();
        assert!(err.to_string().contains("unknown erasure code type"));
    }
}
