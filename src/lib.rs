//! # siafile - Persistent Renter File Index
//!
//! A renter on a decentralized storage network keeps one siafile per
//! logical user file: a durable index recording how the file was split
//! into erasure-coded chunks, which hosts store which pieces, and the
//! merkle roots those pieces are fetched and verified by. The upload,
//! download, repair and renewal paths all plan their work against this
//! index. This crate owns the on-disk container and its crash-safe
//! mutation protocol; it prioritizes:
//!
//! - **Crash safety**: every mutation commits through a write-ahead log
//!   with idempotent replay
//! - **Stable layout**: page-addressed regions whose offsets self-describe
//!   and grow without rewriting chunk records
//! - **Cheap records**: fixed-width zerocopy piece records, reusable
//!   marshaling buffers
//!
//! ## Quick Start
//!
//! ```ignore
//! use siafile::{CipherType, MasterKey, RsCode, SiaFile, Wal};
//! use std::sync::Arc;
//!
//! let (wal, recovered) = Wal::open("./renter/wal.log")?;
//! for txn in recovered {
//!     siafile::apply_updates(txn.updates())?;
//!     txn.signal_updates_applied()?;
//! }
//!
//! let sf = SiaFile::new(
//!     "./renter/backups/photos.sia",
//!     "backups/photos",
//!     "/home/user/photos.tar",
//!     wal,
//!     Arc::new(RsCode::new(10, 20)?),
//!     MasterKey::new(CipherType::TwofishGcm, key_bytes),
//!     file_size,
//!     0o644,
//! )?;
//! sf.add_piece(host_key, 0, 0, merkle_root)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Public API (SiaFile facade)      │
//! ├──────────────────────────────────────┤
//! │ High-level ops (new/load/add_piece/  │
//! │ update_used_hosts/rename/delete)     │
//! ├──────────────────────────────────────┤
//! │ Persistence engine (save_header with │
//! │ page growth, save_chunk, apply)      │
//! ├───────────────────┬──────────────────┤
//! │  Binary codec     │  Write-ahead log │
//! ├───────────────────┴──────────────────┤
//! │ Primitive encoding │ erasure │ types │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! photos.sia
//! ├── metadata          length-prefixed record, page 0
//! ├── host key table    one page in, grows the header when it overflows
//! └── chunk region      two pages in, one fixed-size slot per chunk,
//!                       final chunk unpadded at EOF
//! ```
//!
//! ## Module Overview
//!
//! - [`siafile`]: the index object, its codec and persistence engine
//! - [`wal`]: durable update-set transactions with idempotent replay
//! - [`erasure`]: erasure coder seam (Reed-Solomon over GF(2^8))
//! - [`encoding`]: length-prefixed primitive codec
//! - [`types`]: specifiers, host keys, cipher tags, master keys
//! - [`config`]: page geometry and format constants

pub mod config;
pub mod encoding;
pub mod erasure;
pub mod siafile;
pub mod types;
pub mod wal;

pub use erasure::{ErasureCodeSpec, ErasureCoder, RsCode};
pub use siafile::{apply_updates, Chunk, HostPublicKey, Metadata, Piece, SiaFile};
pub use types::{CipherType, MasterKey, MerkleRoot, SiaPublicKey, Specifier};
pub use wal::{Transaction, Update, Wal};
