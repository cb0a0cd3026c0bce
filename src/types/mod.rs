//! # Core Wire Types
//!
//! Shared types that appear inside the siafile container: the 16-byte
//! specifier tag used to name algorithms and cipher suites, host public
//! keys, merkle roots, and the master key material of a file.
//!
//! The cipher and key types here are deliberately shallow: the actual
//! key-derivation and cipher implementations live outside this crate. The
//! index only needs to persist the type tag and the opaque key bytes, and to
//! know each cipher's sector overhead so it can derive the piece size.
//!
//! ## Specifier Format
//!
//! A specifier is 16 bytes of ASCII, NUL-padded on the right:
//!
//! ```text
//! b"ed25519\x00\x00\x00\x00\x00\x00\x00\x00\x00"
//! ```
//!
//! Specifiers are compared bytewise, so padding is significant and
//! constructors must pad consistently.

use eyre::{bail, Result};
use std::fmt;

/// Length of a [`Specifier`] in bytes.
pub const SPECIFIER_LEN: usize = 16;

/// 32-byte commitment to a sector's contents. Hosts prove possession of a
/// piece against this root.
pub type MerkleRoot = [u8; 32];

/// A 16-byte NUL-padded ASCII tag naming an algorithm or cipher suite.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Specifier(pub [u8; SPECIFIER_LEN]);

impl Specifier {
    /// Builds a specifier from an ASCII name of at most 16 bytes.
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= SPECIFIER_LEN);
        let mut out = [0u8; SPECIFIER_LEN];
        let mut i = 0;
        while i < bytes.len() {
            out[i] = bytes[i];
            i += 1;
        }
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; SPECIFIER_LEN] {
        &self.0
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SPECIFIER_LEN);
        f.write_str(&String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Specifier({})", self)
    }
}

/// Signature algorithm specifier of host keys on the canonical network.
pub const SIGNATURE_ED25519: Specifier = Specifier::new("ed25519");

/// A host's typed public key: algorithm specifier plus raw key bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SiaPublicKey {
    pub algorithm: Specifier,
    pub key: Vec<u8>,
}

impl SiaPublicKey {
    pub fn new(algorithm: Specifier, key: Vec<u8>) -> Self {
        Self { algorithm, key }
    }
}

/// Cipher suite used to encrypt the file's pieces. Only the tag and the
/// per-sector overhead matter to the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherType {
    /// No encryption; pieces are stored as raw sectors.
    Plaintext,
    /// Twofish in GCM mode; every sector carries a 12-byte nonce and a
    /// 16-byte authentication tag.
    TwofishGcm,
}

const CIPHER_PLAINTEXT: Specifier = Specifier::new("plaintext");
const CIPHER_TWOFISH_GCM: Specifier = Specifier::new("twofish-gcm");

impl CipherType {
    /// Bytes of each sector consumed by the cipher rather than piece data.
    pub fn overhead(&self) -> u64 {
        match self {
            CipherType::Plaintext => 0,
            CipherType::TwofishGcm => 28,
        }
    }

    pub fn specifier(&self) -> Specifier {
        match self {
            CipherType::Plaintext => CIPHER_PLAINTEXT,
            CipherType::TwofishGcm => CIPHER_TWOFISH_GCM,
        }
    }

    pub fn from_specifier(spec: Specifier) -> Result<Self> {
        if spec == CIPHER_PLAINTEXT {
            Ok(CipherType::Plaintext)
        } else if spec == CIPHER_TWOFISH_GCM {
            Ok(CipherType::TwofishGcm)
        } else {
            bail!("unknown cipher type specifier: {}", spec);
        }
    }
}

/// Opaque master key material of a file. Piece keys are derived from this
/// by the cipher library; the index only stores it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterKey {
    cipher: CipherType,
    key: Vec<u8>,
}

impl MasterKey {
    pub fn new(cipher: CipherType, key: Vec<u8>) -> Self {
        Self { cipher, key }
    }

    pub fn cipher_type(&self) -> CipherType {
        self.cipher
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}
