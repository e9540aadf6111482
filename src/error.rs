use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// `found` holds the bytes that were read where the magic should be.
    #[error("Invalid magic for {format}: found {found:02X?}")]
    InvalidMagic { format: &'static str, found: Vec<u8> },
    #[error("Truncated data: {0}")]
    TruncatedData(String),
    #[error("Out of bounds access: {len:#x} bytes at {offset:#x} in a view of {size:#x} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("Malformed RomFS tree: {0}")]
    MalformedTree(String),
    #[error("Entry not found: {0}")]
    EntryNotFound(String),
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),
    #[error("Title key missing for rights ID {0}")]
    MissingTitleKey(String),
    #[error("Key area key missing: {0}")]
    MissingAreaKey(String),
    #[error("NCA header key is not registered")]
    MissingHeaderKey,
    #[error("NCA header decryption failed: found magic {0:02X?}")]
    HeaderDecryptFailed([u8; 4]),
    #[error("Section {section} decrypted to an unrecognized format")]
    UnrecognizedInnerFormat { section: usize },
    #[error("Unrecognized container format")]
    UnrecognizedFormat,
    #[error("Hash mismatch for {name}")]
    HashMismatch { name: String },
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl From<binrw::Error> for Error {
    fn from(err: binrw::Error) -> Self {
        if err.is_eof() {
            return Error::TruncatedData(err.to_string());
        }
        match err.root_cause() {
            binrw::Error::BadMagic { pos, found } => {
                Error::InvalidData(format!("bad magic {found:?} at {pos:#x}"))
            }
            cause => Error::InvalidData(cause.to_string()),
        }
    }
}

impl Error {
    /// Maps an unexpected EOF from a table read into [`Error::TruncatedData`].
    pub(crate) fn from_table_read(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedData(format!("{what} extends past the end of the view"))
        } else {
            Error::Io(err)
        }
    }
}
