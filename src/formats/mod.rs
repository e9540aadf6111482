//! Container formats and format detection.
//!
//! [`Format::detect`] looks at the first bytes of a view and names the container it holds;
//! [`open_match`] goes one step further and hands back the matching, still unparsed,
//! container.

use std::sync::Arc;

pub mod hfs0;
pub mod keyset;
pub mod nca;
pub mod pfs0;
pub mod romfs;
pub mod xci;

pub use hfs0::{Hfs0, HashVerify, Verification};
pub use keyset::KeyStore;
pub use nca::{Nca, NcaSection, NcaState, SectionFs};
pub use pfs0::{Nsp, Pfs0};
pub use romfs::RomFs;
pub use xci::{PartitionKind, Xci};

use crate::error::{Error, Result};
use crate::io::ByteView;
use crate::util::VirtualFs;

/// Bytes read from the start of a view for detection; enough for an NCA main header.
const SNIFF_SIZE: usize = nca::HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pfs0,
    Hfs0,
    RomFs,
    Nca,
    Xci,
    Unknown,
}

impl Format {
    /// Identifies the container at the start of `view`.
    ///
    /// Checks run in a fixed order: PFS0 and HFS0 magic, the RomFS header size, the XCI
    /// `HEAD` magic, then an NCA header decryption with the store's header key. Never
    /// fails; anything unreadable or unmatched is [`Format::Unknown`].
    pub fn detect(view: &ByteView, keys: &KeyStore) -> Format {
        let len = (view.size() as usize).min(SNIFF_SIZE);
        let mut head = vec![0u8; len];
        if view.read_at(0, &mut head).is_err() {
            return Format::Unknown;
        }
        let mut format = Self::detect_bytes(&head, keys);
        // Full card dumps push the header past the sniffed prefix.
        if format == Format::Unknown && xci::Xci::header_offset(view).is_some() {
            format = Format::Xci;
        }
        tracing::trace!(?format, size = view.size(), "Detected format");
        format
    }

    /// Same as [`detect`](Format::detect) over an in-memory prefix of a container.
    pub fn detect_bytes(head: &[u8], keys: &KeyStore) -> Format {
        let magic = head.get(..4);
        if magic == Some(b"PFS0".as_slice()) {
            return Format::Pfs0;
        }
        if magic == Some(b"HFS0".as_slice()) {
            return Format::Hfs0;
        }
        if let Some(size) = head.get(..8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(size);
            if u64::from_le_bytes(raw) == romfs::RomFsHeader::SIZE
                && head.len() as u64 >= romfs::RomFsHeader::SIZE
            {
                return Format::RomFs;
            }
        }
        let xci_magic = xci::MAGIC_OFFSET as usize;
        if head.get(xci_magic..xci_magic + 4) == Some(xci::MAGIC.as_slice()) {
            return Format::Xci;
        }
        if Self::is_nca(head, keys) {
            return Format::Nca;
        }
        Format::Unknown
    }

    fn is_nca(head: &[u8], keys: &KeyStore) -> bool {
        let Some(header) = head.get(..nca::HEADER_SIZE) else {
            return false;
        };
        let Some(header_key) = keys.header_key() else {
            return false;
        };
        let mut buf = header.to_vec();
        nca::decrypt_main_header(&mut buf, &header_key).is_ok()
    }
}

/// A detected, unparsed container.
#[derive(Debug)]
pub enum Container {
    Pfs0(Pfs0),
    Hfs0(Hfs0),
    RomFs(RomFs),
    Nca(Nca),
    Xci(Xci),
}

impl Container {
    pub fn format(&self) -> Format {
        match self {
            Container::Pfs0(_) => Format::Pfs0,
            Container::Hfs0(_) => Format::Hfs0,
            Container::RomFs(_) => Format::RomFs,
            Container::Nca(_) => Format::Nca,
            Container::Xci(_) => Format::Xci,
        }
    }

    fn as_vfs(&mut self) -> &mut dyn VirtualFs {
        match self {
            Container::Pfs0(fs) => fs,
            Container::Hfs0(fs) => fs,
            Container::RomFs(fs) => fs,
            Container::Nca(fs) => fs,
            Container::Xci(fs) => fs,
        }
    }
}

impl VirtualFs for Container {
    fn valid(&mut self) -> bool {
        self.as_vfs().valid()
    }

    fn parse(&mut self) -> Result<()> {
        self.as_vfs().parse()
    }

    fn list_files(&mut self) -> Result<Vec<String>> {
        self.as_vfs().list_files()
    }

    fn open_file(&mut self, name: &str) -> Result<ByteView> {
        self.as_vfs().open_file(name)
    }
}

/// Detects the container in `view` and wraps it, unparsed.
pub fn open_match(view: &ByteView, keys: &Arc<KeyStore>) -> Result<Container> {
    let view = view.clone();
    Ok(match Format::detect(&view, keys) {
        Format::Pfs0 => Container::Pfs0(Pfs0::new(view)),
        Format::Hfs0 => Container::Hfs0(Hfs0::new(view)),
        Format::RomFs => Container::RomFs(RomFs::new(view)),
        Format::Nca => Container::Nca(Nca::new(view, Arc::clone(keys))),
        Format::Xci => Container::Xci(Xci::new(view)),
        Format::Unknown => return Err(Error::UnrecognizedFormat),
    })
}
