//! # RomFS
//!
//! Read-only filesystem used for game assets, NCA data sections and control data.
//!
//! A RomFS image starts with a 0x50-byte header locating four tables: directory and file
//! hash buckets, and directory and file metadata. Metadata records link to each other by
//! byte offset within their table (parent, next sibling, first child, first file), with
//! `0xFFFFFFFF` meaning "none". The root directory is the record at offset 0.
//!
//! On first use the whole tree is walked once and copied into an arena ([`RomFsTree`]),
//! so later lookups never touch the image. Every record is visited at most once; a link
//! that loops back or points outside its table makes the image [`Error::MalformedTree`].

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;

use binrw::{BinRead, BinReaderExt};

use crate::error::{Error, Result};
use crate::io::ByteView;
use crate::util::{FileEntryExt, ParseState, VirtualFs};

/// RomFS header structure
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_table_offset: u64,
    pub dir_hash_table_size: u64,
    pub dir_table_offset: u64,
    pub dir_table_size: u64,
    pub file_hash_table_offset: u64,
    pub file_hash_table_size: u64,
    pub file_table_offset: u64,
    pub file_table_size: u64,
    pub file_data_offset: u64,
}

impl RomFsHeader {
    /// The header size field doubles as the format's magic.
    pub const SIZE: u64 = 0x50;
}

/// Link value meaning "no entry".
pub const INVALID_ENTRY: u32 = u32::MAX;
/// Offset of the root directory record in the directory table.
pub const ROOT_DIR_OFFSET: u32 = 0;

const DIR_RECORD_SIZE: usize = 0x18;
const FILE_RECORD_SIZE: usize = 0x20;
const MAX_REASONABLE_TABLE_SIZE: u64 = 0x10000000; // 256MB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub usize);

/// Directory entry structure
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    /// `None` only for the root.
    pub parent: Option<DirId>,
    pub children: Vec<DirId>,
    pub files: Vec<FileId>,
    /// Offset of this record in the directory table.
    pub table_offset: u32,
}

/// File entry structure
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub parent: DirId,
    /// Offset relative to the header's file data offset.
    pub data_offset: u64,
    pub data_size: u64,
    /// Offset of this record in the file table.
    pub table_offset: u32,
}

impl FileEntryExt for FileEntry {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        self.data_size
    }
}

struct DirRecord {
    sibling: u32,
    first_child: u32,
    first_file: u32,
    hash_sibling: u32,
    name: String,
}

struct FileRecord {
    parent: u32,
    sibling: u32,
    data_offset: u64,
    data_size: u64,
    hash_sibling: u32,
    name: String,
}

fn le_u32(table: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&table[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(table: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&table[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Reads a record of `fixed` bytes plus a trailing name whose length is the `u32` at
/// `fixed - 4`.
fn record_bytes<'a>(table: &'a [u8], offset: u32, fixed: usize, what: &str) -> Result<(&'a [u8], String)> {
    let start = offset as usize;
    let record = table
        .get(start..start + fixed)
        .ok_or_else(|| Error::MalformedTree(format!("{what} offset {offset:#x} is outside its table")))?;
    let name_len = le_u32(record, fixed - 4) as usize;
    let name = table
        .get(start + fixed..start + fixed + name_len)
        .ok_or_else(|| Error::MalformedTree(format!("{what} name at {offset:#x} runs past its table")))?;
    let name = String::from_utf8(name.to_vec())
        .map_err(|e| Error::MalformedTree(format!("{what} name at {offset:#x} is not UTF-8: {e}")))?;
    Ok((record, name))
}

fn read_dir_record(table: &[u8], offset: u32) -> Result<DirRecord> {
    let (rec, name) = record_bytes(table, offset, DIR_RECORD_SIZE, "directory")?;
    Ok(DirRecord {
        sibling: le_u32(rec, 0x4),
        first_child: le_u32(rec, 0x8),
        first_file: le_u32(rec, 0xC),
        hash_sibling: le_u32(rec, 0x10),
        name,
    })
}

fn read_file_record(table: &[u8], offset: u32) -> Result<FileRecord> {
    let (rec, name) = record_bytes(table, offset, FILE_RECORD_SIZE, "file")?;
    Ok(FileRecord {
        parent: le_u32(rec, 0x0),
        sibling: le_u32(rec, 0x4),
        data_offset: le_u64(rec, 0x8),
        data_size: le_u64(rec, 0x10),
        hash_sibling: le_u32(rec, 0x18),
        name,
    })
}

/// Bucket index for `name` under the directory record at `parent`.
pub fn compute_hash(parent: u32, name: &[u8], bucket_count: usize) -> usize {
    let mut hash = parent ^ 123456789;
    for &b in name {
        hash = hash.rotate_right(5);
        hash ^= b as u32;
    }
    hash as usize % bucket_count
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Normalizes a lookup path to the absolute form used by the tree ("/", "/a/b.txt").
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Fully materialized RomFS tree.
#[derive(Debug)]
pub struct RomFsTree {
    pub header: RomFsHeader,
    dirs: Vec<DirectoryEntry>,
    files: Vec<FileEntry>,
    dir_paths: HashMap<String, DirId>,
    file_paths: HashMap<String, FileId>,
    dir_hash_table: Vec<u32>,
    file_hash_table: Vec<u32>,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,
    dir_by_offset: HashMap<u32, DirId>,
    file_by_offset: HashMap<u32, FileId>,
}

impl RomFsTree {
    pub fn root(&self) -> DirId {
        DirId(0)
    }

    pub fn dir(&self, id: DirId) -> Option<&DirectoryEntry> {
        self.dirs.get(id.0)
    }

    pub fn file(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(id.0)
    }

    pub fn dirs(&self) -> &[DirectoryEntry] {
        &self.dirs
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Absolute path of every directory, keyed to its id.
    pub fn dir_entries(&self) -> &HashMap<String, DirId> {
        &self.dir_paths
    }

    /// Absolute path of every file, keyed to its id.
    pub fn file_entries(&self) -> &HashMap<String, FileId> {
        &self.file_paths
    }

    pub fn dir_path(&self, id: DirId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = self.dir(id)?;
        while let Some(parent) = current.parent {
            parts.push(current.name.as_str());
            current = self.dir(parent)?;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    /// Rebuilds a file's path by walking parent links.
    pub fn file_path(&self, id: FileId) -> Option<String> {
        let file = self.file(id)?;
        Some(join_path(&self.dir_path(file.parent)?, &file.name))
    }

    /// Looks up a directory through the on-disk hash buckets.
    pub fn find_dir(&self, path: &str) -> Option<DirId> {
        let path = normalize_path(path);
        let mut current = ROOT_DIR_OFFSET;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.hash_lookup_dir(current, component)?;
        }
        self.dir_by_offset.get(&current).copied()
    }

    /// Looks up a file through the on-disk hash buckets.
    pub fn find_file(&self, path: &str) -> Option<FileId> {
        let path = normalize_path(path);
        let (dir, name) = path.rsplit_once('/')?;
        let parent = self.find_dir(dir)?;
        let parent_offset = self.dir(parent)?.table_offset;

        if self.file_hash_table.is_empty() {
            return None;
        }
        let bucket = compute_hash(parent_offset, name.as_bytes(), self.file_hash_table.len());
        let mut offset = self.file_hash_table[bucket];
        for _ in 0..=self.files.len() {
            if offset == INVALID_ENTRY {
                return None;
            }
            let record = read_file_record(&self.file_table, offset).ok()?;
            if record.parent == parent_offset && record.name == name {
                return self.file_by_offset.get(&offset).copied();
            }
            offset = record.hash_sibling;
        }
        None
    }

    fn hash_lookup_dir(&self, parent_offset: u32, name: &str) -> Option<u32> {
        if self.dir_hash_table.is_empty() {
            return None;
        }
        let bucket = compute_hash(parent_offset, name.as_bytes(), self.dir_hash_table.len());
        let mut offset = self.dir_hash_table[bucket];
        for _ in 0..=self.dirs.len() {
            if offset == INVALID_ENTRY {
                return None;
            }
            let record = read_dir_record(&self.dir_table, offset).ok()?;
            let id = self.dir_by_offset.get(&offset)?;
            let parent = self.dirs[id.0].parent.map(|p| self.dirs[p.0].table_offset);
            if parent == Some(parent_offset) && record.name == name {
                return Some(offset);
            }
            offset = record.hash_sibling;
        }
        None
    }

    fn build(header: RomFsHeader, view: &ByteView) -> Result<Self> {
        let dir_hash_table = read_u32_table(view, header.dir_hash_table_offset, header.dir_hash_table_size)?;
        let file_hash_table = read_u32_table(view, header.file_hash_table_offset, header.file_hash_table_size)?;
        let dir_table = read_table(view, header.dir_table_offset, header.dir_table_size, "directory table")?;
        let file_table = read_table(view, header.file_table_offset, header.file_table_size, "file table")?;

        let mut tree = Self {
            header,
            dirs: Vec::new(),
            files: Vec::new(),
            dir_paths: HashMap::new(),
            file_paths: HashMap::new(),
            dir_hash_table,
            file_hash_table,
            dir_table,
            file_table,
            dir_by_offset: HashMap::new(),
            file_by_offset: HashMap::new(),
        };
        tree.walk()?;
        Ok(tree)
    }

    /// Depth-first walk from the root, parents before children.
    fn walk(&mut self) -> Result<()> {
        let mut visited_dirs = HashSet::new();
        let mut visited_files = HashSet::new();

        let root = read_dir_record(&self.dir_table, ROOT_DIR_OFFSET)?;
        visited_dirs.insert(ROOT_DIR_OFFSET);
        let root_id = self.push_dir(String::new(), None, ROOT_DIR_OFFSET, "/".to_string());
        let mut stack = vec![(root_id, "/".to_string(), root.first_child, root.first_file)];

        while let Some((dir_id, dir_path, first_child, first_file)) = stack.pop() {
            let mut offset = first_file;
            while offset != INVALID_ENTRY {
                if !visited_files.insert(offset) {
                    return Err(Error::MalformedTree(format!("file record {offset:#x} is linked twice")));
                }
                let record = read_file_record(&self.file_table, offset)?;
                let path = join_path(&dir_path, &record.name);
                let id = FileId(self.files.len());
                self.files.push(FileEntry {
                    name: record.name,
                    parent: dir_id,
                    data_offset: record.data_offset,
                    data_size: record.data_size,
                    table_offset: offset,
                });
                self.dirs[dir_id.0].files.push(id);
                self.file_by_offset.insert(offset, id);
                self.file_paths.insert(path, id);
                offset = record.sibling;
            }

            let mut children = Vec::new();
            let mut offset = first_child;
            while offset != INVALID_ENTRY {
                if !visited_dirs.insert(offset) {
                    return Err(Error::MalformedTree(format!("directory record {offset:#x} is linked twice")));
                }
                let record = read_dir_record(&self.dir_table, offset)?;
                let path = join_path(&dir_path, &record.name);
                let id = self.push_dir(record.name, Some(dir_id), offset, path.clone());
                self.dirs[dir_id.0].children.push(id);
                children.push((id, path, record.first_child, record.first_file));
                offset = record.sibling;
            }
            // Reversed so the first child is walked first.
            stack.extend(children.into_iter().rev());
        }

        tracing::trace!(dirs = self.dirs.len(), files = self.files.len(), "Walked RomFS tree");
        Ok(())
    }

    fn push_dir(&mut self, name: String, parent: Option<DirId>, offset: u32, path: String) -> DirId {
        let id = DirId(self.dirs.len());
        self.dirs.push(DirectoryEntry {
            name,
            parent,
            children: Vec::new(),
            files: Vec::new(),
            table_offset: offset,
        });
        self.dir_by_offset.insert(offset, id);
        self.dir_paths.insert(path, id);
        id
    }
}

fn read_table(view: &ByteView, offset: u64, size: u64, what: &str) -> Result<Vec<u8>> {
    if size > MAX_REASONABLE_TABLE_SIZE {
        return Err(Error::InvalidData(format!("RomFS {what} too large: {size:#x}")));
    }
    view.read_vec_at(offset, size).map_err(|e| match e {
        Error::OutOfBounds { .. } => Error::TruncatedData(format!(
            "RomFS {what} at {offset:#x}+{size:#x} extends past the image ({:#x})",
            view.size()
        )),
        other => other,
    })
}

fn read_u32_table(view: &ByteView, offset: u64, size: u64) -> Result<Vec<u32>> {
    let raw = read_table(view, offset, size, "hash table")?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// RomFS representation
#[derive(Debug)]
pub struct RomFs {
    view: ByteView,
    state: ParseState<RomFsTree>,
}

impl RomFs {
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

    /// Checks the header size field without reading the tables.
    pub fn valid(&self) -> bool {
        let mut raw = [0u8; 8];
        self.view.read_at(0, &mut raw).is_ok()
            && u64::from_le_bytes(raw) == RomFsHeader::SIZE
            && self.view.size() >= RomFsHeader::SIZE
    }

    pub fn parse(&mut self) -> Result<()> {
        self.tree().map(|_| ())
    }

    /// The materialized tree, walking the image if needed.
    pub fn tree(&mut self) -> Result<&RomFsTree> {
        let tree = self.state.get_or_try_init(|| Self::read_tree(&self.view))?;
        Ok(tree)
    }

    pub fn dir_entries(&mut self) -> Result<&HashMap<String, DirId>> {
        Ok(self.tree()?.dir_entries())
    }

    pub fn file_entries(&mut self) -> Result<&HashMap<String, FileId>> {
        Ok(self.tree()?.file_entries())
    }

    /// File entry at an absolute path such as `/icon/AmericanEnglish.dat`.
    pub fn file(&mut self, path: &str) -> Result<&FileEntry> {
        let tree = self.tree()?;
        tree.file_paths
            .get(&normalize_path(path))
            .and_then(|id| tree.file(*id))
            .ok_or_else(|| Error::EntryNotFound(path.to_string()))
    }

    pub fn open(&mut self, path: &str) -> Result<ByteView> {
        let entry = self.file(path)?.clone();
        self.open_entry(&entry)
    }

    pub fn open_entry(&mut self, entry: &FileEntry) -> Result<ByteView> {
        let offset = self
            .tree()?
            .header
            .file_data_offset
            .checked_add(entry.data_offset)
            .ok_or_else(|| {
                Error::InvalidData(format!("data offset of {} overflows", entry.name))
            })?;
        tracing::trace!(
            name = %entry.name,
            offset = format!("{:012X}", offset),
            size = entry.data_size,
            "Opening RomFS file"
        );
        self.view.sub_view(offset, entry.data_size)
    }

    #[tracing::instrument(skip(view), level = "trace")]
    fn read_tree(view: &ByteView) -> Result<RomFsTree> {
        let mut reader = view.clone();
        reader.seek(SeekFrom::Start(0))?;
        let header: RomFsHeader = reader.read_le()?;
        if header.header_size != RomFsHeader::SIZE {
            return Err(Error::InvalidMagic {
                format: "RomFS",
                found: header.header_size.to_le_bytes().to_vec(),
            });
        }
        tracing::trace!(
            dir_table_offset = header.dir_table_offset,
            file_table_offset = header.file_table_offset,
            file_data_offset = header.file_data_offset,
            "Read RomFS header"
        );
        RomFsTree::build(header, view)
    }
}

impl VirtualFs for RomFs {
    fn valid(&mut self) -> bool {
        RomFs::valid(self)
    }

    fn parse(&mut self) -> Result<()> {
        RomFs::parse(self)
    }

    fn list_files(&mut self) -> Result<Vec<String>> {
        Ok(self.file_entries()?.keys().cloned().collect())
    }

    fn open_file(&mut self, name: &str) -> Result<ByteView> {
        self.open(name)
    }
}
