//! Utility helpers and traits shared by every container type.

use crate::error::{Error, Result};
use crate::io::ByteView;

/// Lazy parse slot held by each container.
///
/// A container starts [`Unparsed`](ParseState::Unparsed) and moves to
/// [`Parsed`](ParseState::Parsed) the first time one of its accessors needs the
/// tables. A failed parse leaves it unparsed, so the next accessor re-attempts.
#[derive(Debug, Default)]
pub enum ParseState<T> {
    #[default]
    Unparsed,
    Parsed(T),
}

impl<T> ParseState<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseState::Parsed(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            ParseState::Parsed(value) => Some(value),
            ParseState::Unparsed => None,
        }
    }

    /// Runs `init` unless already parsed, then returns the parsed value.
    pub fn get_or_try_init(&mut self, init: impl FnOnce() -> Result<T>) -> Result<&mut T> {
        if !self.is_parsed() {
            *self = ParseState::Parsed(init()?);
        }
        match self {
            ParseState::Parsed(value) => Ok(value),
            ParseState::Unparsed => Err(Error::InvalidData("parse state lost its value".into())),
        }
    }
}

/// Common surface of every container: cheap validity check, explicit parse, and
/// name-based access to its entries.
pub trait VirtualFs {
    /// Checks the magic or header without parsing any tables.
    fn valid(&mut self) -> bool;

    /// Parses the container's tables. Calling it again after success is a no-op.
    fn parse(&mut self) -> Result<()>;

    /// Names of every entry, in no particular order.
    fn list_files(&mut self) -> Result<Vec<String>>;

    /// Opens the named entry as a view.
    fn open_file(&mut self, name: &str) -> Result<ByteView>;

    fn file_count(&mut self) -> Result<usize> {
        Ok(self.list_files()?.len())
    }
}

pub trait FileEntryExt {
    /// Get the file name of the entry.
    fn file_name(&self) -> &str;
    /// Returns the size of the file in bytes.
    fn file_size(&self) -> u64;
    /// Get the file extension, if any.
    fn file_extension(&self) -> Option<&str> {
        self.file_name()
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }
}

/// Reads a NUL-terminated name starting at `offset` in a string table.
pub(crate) fn read_cstr(table: &[u8], offset: usize) -> Result<String> {
    let tail = table.get(offset..).ok_or_else(|| {
        Error::InvalidData(format!(
            "name offset {offset:#x} outside string table of {:#x} bytes",
            table.len()
        ))
    })?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8(tail[..end].to_vec())
        .map_err(|e| Error::InvalidData(format!("name at {offset:#x} is not UTF-8: {e}")))
}
