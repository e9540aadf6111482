//! # Nintendo PFS0 (PartitionFS0) format
//!
//! The Partition File System (PFS0) format is a simple archive format used by Nintendo Switch for packaging files.
//!
//! They are also known as NSP (Nintendo Submission Package) files, which are simply PFS0 images packed
//! for distribution. NCA ExeFS sections are PFS0 images as well.
//!
//! The same table layout, with larger records carrying a SHA-256 per file, is used by HFS0
//! (see [hfs0](crate::formats::hfs0)). Both are implemented here by [`PartitionFs`], generic
//! over the record type.

use std::collections::HashMap;
use std::io::{Read, SeekFrom};

use binrw::prelude::*;

use crate::error::{Error, Result};
use crate::io::ByteView;
use crate::util::{self, FileEntryExt, ParseState, VirtualFs};

// Type alias for NSP (Nintendo Submission Package), which are simply just
// PFS0 images
pub type Nsp = Pfs0;
pub type Pfs0 = PartitionFs<Pfs0Record>;

#[derive(BinRead, Debug, Clone)]
#[br(little)]
/// Partition filesystem header, shared by PFS0 and HFS0
///
/// # Format Layout
/// - 0x00: Magic "PFS0" or "HFS0" (4 bytes)
/// - 0x04: Number of files (4 bytes)
/// - 0x08: String table size (4 bytes)
/// - 0x0C: Reserved (4 bytes, usually zeros)
pub struct PartitionHeader {
    pub magic: [u8; 4],
    /// Number of files contained in this archive
    pub num_files: u32,
    /// Size of the string table in bytes
    pub str_table_size: u32,
    /// Reserved field, typically set to zeros
    pub reserved: [u8; 4],
}

impl PartitionHeader {
    pub const SIZE: u64 = 0x10;
}

/// A fixed-size file record in a partition filesystem's entry table.
pub trait PartitionRecord: for<'a> BinRead<Args<'a> = ()> + Sized {
    /// Format name used in errors and logs.
    const FORMAT: &'static str;
    const MAGIC: [u8; 4];
    const RECORD_SIZE: u64;
    /// The entry exposed to callers once the name is resolved.
    type Entry: PartitionEntry + Clone + std::fmt::Debug;

    fn string_table_offset(&self) -> u32;
    fn data_offset(&self) -> u64;
    fn data_size(&self) -> u64;
    fn into_entry(self, name: String) -> Self::Entry;
}

/// Location of an entry's data, shared by PFS0 and HFS0 entries.
pub trait PartitionEntry: FileEntryExt {
    /// Offset relative to the start of the data region.
    fn data_offset(&self) -> u64;
}

#[derive(BinRead, Debug)]
#[br(little)]
/// The PFS0 file entry structure describes a single file within the archive
///
/// # Format Layout
/// - 0x00: Data offset (8 bytes)
/// - 0x08: Data size (8 bytes)
/// - 0x10: String table offset (4 bytes)
/// - 0x14: Reserved (4 bytes)
///
/// # Notes
/// - `data_offset` is relative to the start of file data section, not the start of the PFS0 file
/// - The file data section begins after the header, all file entries, and the string table
/// - String table offset points to a null-terminated filename in the string table
pub struct Pfs0Record {
    /// Offset to file data, relative to the start of file data section
    pub data_offset: u64,
    /// Size of the file data in bytes
    pub data_size: u64,
    /// Offset into the string table for the null-terminated filename
    pub string_table_offset: u32,
    /// Reserved field, usually zeroes
    pub reserved: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Represents a file within the PFS0 archive with both metadata and name
pub struct Pfs0Entry {
    /// Filename extracted from the string table
    pub name: String,
    pub data_offset: u64,
    pub data_size: u64,
}

impl FileEntryExt for Pfs0Entry {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        self.data_size
    }
}

impl PartitionEntry for Pfs0Entry {
    fn data_offset(&self) -> u64 {
        self.data_offset
    }
}

impl PartitionRecord for Pfs0Record {
    const FORMAT: &'static str = "PFS0";
    const MAGIC: [u8; 4] = *b"PFS0";
    const RECORD_SIZE: u64 = 0x18;
    type Entry = Pfs0Entry;

    fn string_table_offset(&self) -> u32 {
        self.string_table_offset
    }

    fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn data_size(&self) -> u64 {
        self.data_size
    }

    fn into_entry(self, name: String) -> Pfs0Entry {
        Pfs0Entry {
            name,
            data_offset: self.data_offset,
            data_size: self.data_size,
        }
    }
}

/// Parsed tables of a partition filesystem.
#[derive(Debug)]
pub struct PartitionTable<E> {
    pub header: PartitionHeader,
    /// Offset of the data region from the start of the archive.
    pub data_offset: u64,
    pub entries: HashMap<String, E>,
}

/// A partition filesystem (PFS0 or HFS0)
///
/// The format consists of:
/// 1. Header (0x10 bytes)
/// 2. File entries (`R::RECORD_SIZE` bytes each)
/// 3. String table (variable size)
/// 4. File data
///
/// Tables are read on first use. Entries are keyed by name; if the table names a file
/// twice, the later record wins.
#[derive(Debug)]
pub struct PartitionFs<R: PartitionRecord> {
    view: ByteView,
    state: ParseState<PartitionTable<R::Entry>>,
}

impl<R: PartitionRecord> PartitionFs<R> {
    pub fn new(view: ByteView) -> Self {
        Self {
            view,
            state: ParseState::Unparsed,
        }
    }

    pub fn view(&self) -> &ByteView {
        &self.view
    }

    pub fn is_parsed(&self) -> bool {
        self.state.is_parsed()
    }

    /// Checks the magic without reading the tables.
    pub fn valid(&self) -> bool {
        let mut magic = [0u8; 4];
        self.view.read_at(0, &mut magic).is_ok() && magic == R::MAGIC
    }

    pub fn parse(&mut self) -> Result<()> {
        self.table().map(|_| ())
    }

    /// Parsed tables, reading them if needed.
    pub fn table(&mut self) -> Result<&PartitionTable<R::Entry>> {
        let table = self.state.get_or_try_init(|| Self::read_table(&self.view))?;
        Ok(table)
    }

    pub fn entries(&mut self) -> Result<&HashMap<String, R::Entry>> {
        Ok(&self.table()?.entries)
    }

    pub fn num_entries(&mut self) -> Result<usize> {
        Ok(self.table()?.entries.len())
    }

    pub fn entry(&mut self, name: &str) -> Result<&R::Entry> {
        self.table()?
            .entries
            .get(name)
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))
    }

    /// Opens the named file as a view into the archive.
    pub fn open(&mut self, name: &str) -> Result<ByteView> {
        let entry = self.entry(name)?.clone();
        self.open_entry(&entry)
    }

    /// Opens a file from an entry previously returned by this archive.
    pub fn open_entry(&mut self, entry: &R::Entry) -> Result<ByteView> {
        let data_offset = self.table()?.data_offset;
        let offset = data_offset + entry.data_offset();
        tracing::trace!(
            name = entry.file_name(),
            offset = format!("{:012X}", offset),
            actual_offset = format!("{:012X}", offset + entry.file_size()),
            "Opening included file"
        );
        self.view.sub_view(offset, entry.file_size())
    }

    #[tracing::instrument(skip(view), level = "trace")]
    fn read_table(view: &ByteView) -> Result<PartitionTable<R::Entry>> {
        let mut reader = view.clone();
        reader.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        if view.read_at(0, &mut magic).is_err() || magic != R::MAGIC {
            return Err(Error::InvalidMagic {
                format: R::FORMAT,
                found: magic.to_vec(),
            });
        }
        let header: PartitionHeader = reader.read_le()?;

        let data_offset = PartitionHeader::SIZE
            + header.num_files as u64 * R::RECORD_SIZE
            + header.str_table_size as u64;
        if data_offset > view.size() {
            return Err(Error::TruncatedData(format!(
                "{} tables of {} entries need {:#x} bytes, archive has {:#x}",
                R::FORMAT,
                header.num_files,
                data_offset,
                view.size()
            )));
        }

        // Read all file entries
        let records = (0..header.num_files)
            .map(|_| reader.read_le::<R>())
            .collect::<Result<Vec<_>, _>>()?;

        // Read the entire string table
        let mut string_table = vec![0u8; header.str_table_size as usize];
        Read::read_exact(&mut reader, &mut string_table)
            .map_err(|e| Error::from_table_read(e, "string table"))?;

        let data_size = view.size() - data_offset;
        let mut entries = HashMap::with_capacity(records.len());
        for record in records {
            let name = util::read_cstr(&string_table, record.string_table_offset() as usize)?;
            match record.data_offset().checked_add(record.data_size()) {
                Some(end) if end <= data_size => {}
                _ => {
                    return Err(Error::TruncatedData(format!(
                        "{} entry {name} ({:#x}+{:#x}) extends past the end of the archive",
                        R::FORMAT,
                        record.data_offset(),
                        record.data_size()
                    )));
                }
            }
            let entry = record.into_entry(name.clone());
            if entries.insert(name.clone(), entry).is_some() {
                tracing::warn!(format = R::FORMAT, name = %name, "Duplicate entry name, keeping the last one");
            }
        }

        tracing::trace!(format = R::FORMAT, files = entries.len(), "Parsed partition table");
        Ok(PartitionTable {
            header,
            data_offset,
            entries,
        })
    }
}

impl<R: PartitionRecord> VirtualFs for PartitionFs<R> {
    fn valid(&mut self) -> bool {
        PartitionFs::valid(self)
    }

    fn parse(&mut self) -> Result<()> {
        PartitionFs::parse(self)
    }

    fn list_files(&mut self) -> Result<Vec<String>> {
        Ok(self.entries()?.keys().cloned().collect())
    }

    fn open_file(&mut self, name: &str) -> Result<ByteView> {
        self.open(name)
    }
}
