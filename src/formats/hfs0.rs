//! The Nintendo Hashed filesystem (HFS0) is a filesystem used by the Nintendo Switch to store data in a hashed format.
//! This filesystem is used in the Nintendo Switch's game cards (the little bitter carts that you insert physically into the console).
//!
//! This module doesn't allow you to eat the game itself, but lets you dump data
//! from the game card.
//!
//! You still require the XCI module to read the game card image format, which in turn contains this filesystem.
//! For the game card image format, see [xci](crate::formats::xci).
//!
//! HFS0 shares its table layout with PFS0 (see [`PartitionFs`]); each record additionally
//! carries the SHA-256 of a prefix of the file. Checking it is up to the caller, through
//! [`HashVerify`].

use binrw::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::formats::pfs0::{PartitionEntry, PartitionFs, PartitionRecord};
use crate::io::ByteView;
use crate::util::FileEntryExt;

pub type Hfs0 = PartitionFs<Hfs0Record>;

/// Hashes are computed in chunks of this size.
const HASH_CHUNK_SIZE: u64 = 0x10000;

#[derive(BinRead, Debug)]
#[br(little)]
/// HFS0 file entry record
///
/// # Format Layout
/// - 0x00: Data offset (8 bytes)
/// - 0x08: Data size (8 bytes)
/// - 0x10: String table offset (4 bytes)
/// - 0x14: Hashed region size (4 bytes)
/// - 0x18: Reserved (8 bytes)
/// - 0x20: SHA-256 of the hashed region (0x20 bytes)
pub struct Hfs0Record {
    pub data_offset: u64,
    pub data_size: u64,
    pub string_table_offset: u32,
    pub hashed_region_size: u32,
    pub reserved: u64,
    pub hash: [u8; 0x20],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hfs0Entry {
    pub name: String,
    pub data_offset: u64,
    pub data_size: u64,
    /// Number of bytes, from the start of the file, covered by `hash`.
    pub hashed_region_size: u32,
    pub hash: [u8; 0x20],
}

impl FileEntryExt for Hfs0Entry {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        self.data_size
    }
}

impl PartitionEntry for Hfs0Entry {
    fn data_offset(&self) -> u64 {
        self.data_offset
    }
}

impl PartitionRecord for Hfs0Record {
    const FORMAT: &'static str = "HFS0";
    const MAGIC: [u8; 4] = *b"HFS0";
    const RECORD_SIZE: u64 = 0x40;
    type Entry = Hfs0Entry;

    fn string_table_offset(&self) -> u32 {
        self.string_table_offset
    }

    fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn data_size(&self) -> u64 {
        self.data_size
    }

    fn into_entry(self, name: String) -> Hfs0Entry {
        Hfs0Entry {
            name,
            data_offset: self.data_offset,
            data_size: self.data_size,
            hashed_region_size: self.hashed_region_size,
            hash: self.hash,
        }
    }
}

/// Outcome of checking an entry against its recorded hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Mismatch {
        expected: [u8; 0x20],
        actual: [u8; 0x20],
    },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// Optional integrity checking for containers whose entries carry hashes.
pub trait HashVerify {
    /// Hashes the entry's covered region and compares it with the recorded hash.
    fn check(&mut self, name: &str) -> Result<Verification>;

    /// Like [`check`](HashVerify::check), but a mismatch is an [`Error::HashMismatch`].
    fn verify(&mut self, name: &str) -> Result<()> {
        match self.check(name)? {
            Verification::Valid => Ok(()),
            Verification::Mismatch { .. } => Err(Error::HashMismatch {
                name: name.to_string(),
            }),
        }
    }

    /// Opens the entry and reports whether it matched its hash.
    fn open_verified(&mut self, name: &str) -> Result<(ByteView, Verification)>;
}

/// SHA-256 of the first `len` bytes of `view`.
pub(crate) fn sha256_prefix(view: &ByteView, len: u64) -> Result<[u8; 0x20]> {
    let mut hasher = Sha256::new();
    let mut offset = 0;
    while offset < len {
        let chunk = (len - offset).min(HASH_CHUNK_SIZE);
        hasher.update(view.read_vec_at(offset, chunk)?);
        offset += chunk;
    }
    Ok(hasher.finalize().into())
}

impl HashVerify for Hfs0 {
    #[tracing::instrument(skip(self), level = "trace")]
    fn check(&mut self, name: &str) -> Result<Verification> {
        let entry = self.entry(name)?.clone();
        let file = self.open_entry(&entry)?;
        let covered = (entry.hashed_region_size as u64).min(entry.data_size);

        let actual = sha256_prefix(&file, covered)?;
        if actual == entry.hash {
            Ok(Verification::Valid)
        } else {
            tracing::warn!(
                name,
                expected = %hex::encode(entry.hash),
                actual = %hex::encode(actual),
                "HFS0 entry hash mismatch"
            );
            Ok(Verification::Mismatch {
                expected: entry.hash,
                actual,
            })
        }
    }

    fn open_verified(&mut self, name: &str) -> Result<(ByteView, Verification)> {
        let verification = self.check(name)?;
        Ok((self.open(name)?, verification))
    }
}
