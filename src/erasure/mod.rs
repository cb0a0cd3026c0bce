//! # Erasure Coding Seam
//!
//! The index is polymorphic over the erasure coder: it only needs the piece
//! counts to size chunk slots and the codec capability for callers planning
//! uploads and repairs. The concrete math is Reed-Solomon over GF(2^8) via
//! the `reed-solomon-erasure` crate.
//!
//! ## Extension Point
//!
//! [`ErasureCodeSpec`] is the tagged in-memory form of the on-disk
//! `{type specifier, params}` pair. New codecs add a variant plus a
//! specifier; files written with an unknown specifier fail to load with a
//! decode error rather than being misinterpreted.
//!
//! ## Shard Conventions
//!
//! `encode` splits the input into `min_pieces` equally sized data shards
//! (zero-padding the tail) and produces `num_pieces` shards in total.
//! `reconstruct` fills the `None` slots of a shard set in place; at least
//! `min_pieces` shards must be present.

use eyre::{ensure, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;

/// Tagged description of an erasure code, the unit that crosses the codec
/// boundary. One variant per supported codec family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErasureCodeSpec {
    ReedSolomon { data: u16, parity: u16 },
}

impl ErasureCodeSpec {
    /// Instantiates the coder this spec describes.
    pub fn coder(&self) -> Result<Arc<dyn ErasureCoder>> {
        match *self {
            ErasureCodeSpec::ReedSolomon { data, parity } => {
                Ok(Arc::new(RsCode::new(data as usize, parity as usize)?))
            }
        }
    }
}

/// Capability surface of an erasure coder as seen by the index and by the
/// read/write paths that consume it.
pub trait ErasureCoder: Send + Sync + std::fmt::Debug {
    /// Tagged form, used when persisting the coder's identity.
    fn spec(&self) -> ErasureCodeSpec;

    /// Total pieces per chunk (data + parity).
    fn num_pieces(&self) -> usize;

    /// Minimum pieces needed to reconstruct a chunk.
    fn min_pieces(&self) -> usize;

    /// Splits `data` into `num_pieces` shards, the first `min_pieces` of
    /// which carry the (zero-padded) input.
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Fills the missing (`None`) shards of a chunk in place.
    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()>;
}

/// Reed-Solomon coder over GF(2^8).
#[derive(Debug)]
pub struct RsCode {
    data_pieces: usize,
    parity_pieces: usize,
    inner: ReedSolomon,
}

impl RsCode {
    pub fn new(data_pieces: usize, parity_pieces: usize) -> Result<Self> {
        ensure!(data_pieces > 0, "erasure code needs at least one data piece");
        ensure!(
            data_pieces + parity_pieces <= u8::MAX as usize,
            "erasure code width {} exceeds the chunk format limit",
            data_pieces + parity_pieces
        );
        let inner = ReedSolomon::new(data_pieces, parity_pieces)?;
        Ok(Self {
            data_pieces,
            parity_pieces,
            inner,
        })
    }
}

impl ErasureCoder for RsCode {
    fn spec(&self) -> ErasureCodeSpec {
        ErasureCodeSpec::ReedSolomon {
            data: self.data_pieces as u16,
            parity: self.parity_pieces as u16,
        }
    }

    fn num_pieces(&self) -> usize {
        self.data_pieces + self.parity_pieces
    }

    fn min_pieces(&self) -> usize {
        self.data_pieces
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        ensure!(!data.is_empty(), "cannot encode an empty chunk");
        let shard_len = data.len().div_ceil(self.data_pieces);
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.num_pieces());
        for i in 0..self.data_pieces {
            let start = (i * shard_len).min(data.len());
            let end = ((i + 1) * shard_len).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(shard_len, 0);
            shards.push(shard);
        }
        shards.resize(self.num_pieces(), vec![0u8; shard_len]);
        self.inner.encode(&mut shards)?;
        Ok(shards)
    }

    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        ensure!(
            shards.len() == self.num_pieces(),
            "expected {} shards, got {}",
            self.num_pieces(),
            shards.len()
        );
        self.inner.reconstruct(shards)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_counts() {
        let rs = RsCode::new(10, 20).unwrap();
        assert_eq!(rs.num_pieces(), 30);
        assert_eq!(rs.min_pieces(), 10);
    }

    #[test]
    fn encode_then_reconstruct_with_missing_shards() {
        let rs = RsCode::new(4, 2).unwrap();
        let data: Vec<u8> = (0u8..100).collect();
        let shards = rs.encode(&data).unwrap();
        assert_eq!(shards.len(), 6);

        let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        partial[0] = None;
        partial[5] = None;
        rs.reconstruct(&mut partial).unwrap();

        for (got, want) in partial.iter().zip(shards.iter()) {
            assert_eq!(got.as_ref().unwrap(), want);
        }
    }

    #[test]
    fn width_above_format_limit_is_rejected() {
        assert!(RsCode::new(200, 100).is_err());
    }

    #[test]
    fn spec_round_trip() {
        let rs = RsCode::new(10, 20).unwrap();
        let spec = rs.spec();
        assert_eq!(spec, ErasureCodeSpec::ReedSolomon { data: 10, parity: 20 });
        let coder = spec.coder().unwrap();
        assert_eq!(coder.num_pieces(), 30);
        assert_eq!(coder.min_pieces(), 10);
    }
}
