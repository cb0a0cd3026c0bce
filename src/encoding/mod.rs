//! # Length-Prefixed Primitive Encoding
//!
//! This module provides the primitive wire codec used by the metadata and
//! host-key table records and by the WAL update payloads. It is NOT used for
//! the fixed-width piece records, which are zerocopy structs.
//!
//! ## Encoding Format
//!
//! | Type    | Bytes | Format                                  |
//! |---------|-------|-----------------------------------------|
//! | u64     | 8     | little-endian                           |
//! | i64     | 8     | little-endian two's complement          |
//! | bool    | 1     | 0 or 1                                  |
//! | bytes   | 8 + n | u64 length prefix, then the bytes       |
//! | string  | 8 + n | u64 length prefix, then UTF-8 bytes     |
//!
//! Every variable-length value carries its own length prefix, so any record
//! built from these primitives is self-describing and tolerates trailing
//! padding: a decoder reads exactly the bytes the prefixes account for and
//! ignores the rest.
//!
//! ## Zero-Copy Design
//!
//! Encoding appends to a caller-supplied `Vec<u8>`; decoding borrows from
//! the input slice and only allocates for owned `bytes`/`string` values.
//! [`Decoder`] tracks its own cursor, so sequential fields read naturally.
//!
//! ## Error Handling
//!
//! Decode functions return `eyre::Result` with descriptive messages:
//! - Truncated input: "truncated input: need N bytes, have M"
//! - Oversized length prefix: "length prefix N exceeds remaining input M"
//! - Invalid UTF-8: "invalid utf-8 in string"
//!
//! All functions are pure and stateless apart from the decoder cursor; they
//! can be called concurrently without synchronization.

use eyre::{bail, ensure, Result};

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

pub fn write_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    write_u64(buf, v.len() as u64);
    buf.extend_from_slice(v);
}

pub fn write_str(buf: &mut Vec<u8>, v: &str) {
    write_bytes(buf, v.as_bytes());
}

/// Sequential decoder over a byte slice. Reads advance an internal cursor;
/// trailing bytes beyond the fields actually read are ignored.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= n,
            "truncated input: need {} bytes, have {}",
            n,
            self.remaining()
        );
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        Ok(u64::from_le_bytes(le))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        Ok(i64::from_le_bytes(le))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let raw = self.take(1)?;
        match raw[0] {
            0 => Ok(false),
            1 => Ok(true),
            b => bail!("invalid bool byte: {}", b),
        }
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let raw = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()? as usize;
        ensure!(
            len <= self.remaining(),
            "length prefix {} exceeds remaining input {}",
            len,
            self.remaining()
        );
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw).map_err(|_| eyre::eyre!("invalid utf-8 in string"))
    }
}

pub fn write_array<const N: usize>(buf: &mut Vec<u8>, v: &[u8; N]) {
    buf.extend_from_slice(v);
}
