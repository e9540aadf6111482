//! The XCI (eXtendable Card Image) format is a Nintendo Switch game card image format.
//!
//! This format is the raw data from a Nintendo Switch game card, those little bitter
//! SD card-like things that you insert physically on top of the console.
//!
//! The cards themselves physically have a similar footprint to an SD card, but are slightly thicker
//! and less wide. The data inside is stored in an eMMC chip, which is soldered onto the card.
//! They are also coated with Denatonium Benzoate, a bittering agent, to discourage consumption.
//! Just in case you (or your pet, or your little sibling) get any ideas. No, the game cards taste horrible.
//!
//! An XCI holds a root HFS0 whose entries are themselves HFS0 partitions (`update`,
//! `normal`, `secure`, and sometimes `logo`). Dumps either start directly with the card
//! header ("trimmed") or carry a 0x1000-byte key area in front of it ("full").

use std::collections::HashMap;
use std::io::SeekFrom;

use binrw::prelude::*;
use tracing::trace;

use super::hfs0::{Hfs0, sha256_prefix};
use crate::error::{Error, Result};
use crate::io::ByteView;
use crate::util::{ParseState, VirtualFs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Size of the eMMC chip on the game card.
pub enum RomSize {
    Size1Gb = 0xFA,
    Size2Gb = 0xF8,
    Size4Gb = 0xF0,
    Size8Gb = 0xE0,
    Size16Gb = 0xE1,
    Size32Gb = 0xE2,
}

impl RomSize {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0xFA => Self::Size1Gb,
            0xF8 => Self::Size2Gb,
            0xF0 => Self::Size4Gb,
            0xE0 => Self::Size8Gb,
            0xE1 => Self::Size16Gb,
            0xE2 => Self::Size32Gb,
            _ => return None,
        })
    }

    pub fn gigabytes(&self) -> u64 {
        match self {
            Self::Size1Gb => 1,
            Self::Size2Gb => 2,
            Self::Size4Gb => 4,
            Self::Size8Gb => 8,
            Self::Size16Gb => 16,
            Self::Size32Gb => 32,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.gigabytes() << 30
    }
}

/// Size of a media sector
pub const MEDIA_SIZE: u64 = 0x200;
/// Key area prepended to the header in full dumps.
pub const KEY_AREA_SIZE: u64 = 0x1000;
/// Offset of the `HEAD` magic within the card header.
pub const MAGIC_OFFSET: u64 = 0x100;
pub const MAGIC: [u8; 4] = *b"HEAD";

/// XCI Header structure
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct XciHeader {
    /// RSA-2048 signature over the header
    pub signature: [u8; 0x100],
    #[br(magic = b"HEAD")]
    /// `RomAreaStartPageAddress`
    /// (in Gamecard page units, which are 0x200 bytes)
    pub rom_area_offset: u32,
    /// Offset to backup partition
    /// (Should always be 0xFFFFFFFF)
    pub backup_area_offset: u32,
    /// Index for title key encryption key
    /// TitleKeyDecIndex (high nibble) and KekIndex (low nibble)
    pub title_kek_index: u8,
    /// Cartridge size code, see [`RomSize`]
    pub rom_size: u8,
    /// Version of the gamecard header
    pub gamecard_header_version: u8,
    /// Flags for the gamecard
    pub gamecard_flags: u8,
    /// Unique identifier for the game package
    pub package_id: u64,
    /// End offset of the valid data
    /// (in Gamecard page units, which are 0x200 bytes)
    pub valid_data_end_address: u64,
    /// Reversed IV
    pub reversed_iv: [u8; 0x10],
    /// Root HFS0 header address
    pub hfs0_offset: u64,
    /// Size of the root HFS0 header
    pub hfs0_header_size: u64,
    /// SHA-256 of the root HFS0 header
    pub hfs0_header_hash: [u8; 0x20],
    /// Hash of the InitialData
    pub initial_data_hash: [u8; 0x20],
    /// SelSec
    pub sel_sec: u32,
    /// SelT1Key
    pub sel_t1_key: u32,
    /// SelKey
    pub sel_key: u32,
    /// LimArea
    /// (in Gamecard page units, which are 0x200 bytes)
    pub lim_area: u32,
    /// CardHeaderEncrypted data,
    /// encrypted with AES-128-CBC
    ///
    /// We will not parse this field, as it is encrypted
    pub card_header_encrypted: [u8; 0x70],
}

impl XciHeader {
    pub fn rom_size(&self) -> Option<RomSize> {
        RomSize::from_code(self.rom_size)
    }
}

/// Well-known root partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    Update,
    Normal,
    Secure,
    Logo,
}

impl PartitionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "update" => Some(Self::Update),
            "normal" => Some(Self::Normal),
            "secure" => Some(Self::Secure),
            "logo" => Some(Self::Logo),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Normal => "normal",
            Self::Secure => "secure",
            Self::Logo => "logo",
        }
    }
}

/// One root partition of the card.
#[derive(Debug)]
pub struct XciPartition {
    /// `None` for names outside the well-known set.
    pub kind: Option<PartitionKind>,
    pub hfs0: Hfs0,
}

#[derive(Debug)]
pub struct XciContents {
    pub header: XciHeader,
    /// 0 for trimmed dumps, [`KEY_AREA_SIZE`] for full ones.
    pub header_offset: u64,
    /// Absolute offset of the root HFS0.
    pub root_offset: u64,
    pub partitions: HashMap<String, XciPartition>,
}

#[derive(Debug)]
pub struct Xci {
    view: ByteView,
    state: ParseState<XciContents>,
}

impl Xci {
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

    /// Locates the card header: at 0 for trimmed dumps, after the key area for full ones.
    pub fn header_offset(view: &ByteView) -> Option<u64> {
        let has_magic = |base: u64| {
            let mut magic = [0u8; 4];
            view.read_at(base + MAGIC_OFFSET, &mut magic).is_ok() && magic == MAGIC
        };
        if has_magic(0) {
            Some(0)
        } else if has_magic(KEY_AREA_SIZE) {
            Some(KEY_AREA_SIZE)
        } else {
            None
        }
    }

    pub fn valid(&self) -> bool {
        Self::header_offset(&self.view).is_some()
    }

    pub fn parse(&mut self) -> Result<()> {
        self.contents().map(|_| ())
    }

    pub fn contents(&mut self) -> Result<&mut XciContents> {
        self.state.get_or_try_init(|| Self::read_contents(&self.view))
    }

    pub fn header(&mut self) -> Result<&XciHeader> {
        Ok(&self.contents()?.header)
    }

    pub fn rom_size(&mut self) -> Result<Option<RomSize>> {
        Ok(self.header()?.rom_size())
    }

    pub fn partitions(&mut self) -> Result<&mut HashMap<String, XciPartition>> {
        Ok(&mut self.contents()?.partitions)
    }

    /// Root partition by name, e.g. `"secure"`.
    pub fn get_partition(&mut self, name: &str) -> Result<&mut Hfs0> {
        self.partitions()?
            .get_mut(name)
            .map(|partition| &mut partition.hfs0)
            .ok_or_else(|| Error::PartitionNotFound(name.to_string()))
    }

    pub fn partition(&mut self, kind: PartitionKind) -> Result<&mut Hfs0> {
        self.get_partition(kind.name())
    }

    /// Checks the root HFS0 header against the hash stored in the card header.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn verify_root_header(&mut self) -> Result<()> {
        let contents = self.contents()?;
        let (root_offset, size, expected) = (
            contents.root_offset,
            contents.header.hfs0_header_size,
            contents.header.hfs0_header_hash,
        );
        let root = self.view.sub_view(root_offset, size)?;
        let actual = sha256_prefix(&root, size)?;
        if actual != expected {
            tracing::warn!(
                expected = %hex::encode(expected),
                actual = %hex::encode(actual),
                "Root HFS0 header hash mismatch"
            );
            return Err(Error::HashMismatch {
                name: "root HFS0 header".to_string(),
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip(view), level = "trace")]
    fn read_contents(view: &ByteView) -> Result<XciContents> {
        let header_offset = Self::header_offset(view).ok_or_else(|| {
            let mut found = [0u8; 4];
            let _ = view.read_at(MAGIC_OFFSET, &mut found);
            Error::InvalidMagic {
                format: "XCI",
                found: found.to_vec(),
            }
        })?;
        trace!(header_offset, "Found XCI header");

        let mut reader = view.clone();
        reader.seek(SeekFrom::Start(header_offset))?;
        let header: XciHeader = reader.read_le()?;
        trace!(
            rom_size = ?header.rom_size(),
            package_id = format!("{:016X}", header.package_id),
            hfs0_offset = format!("{:012X}", header.hfs0_offset),
            "Read XCI header"
        );

        let root_offset = header_offset
            .checked_add(header.hfs0_offset)
            .filter(|offset| *offset < view.size())
            .ok_or_else(|| {
                Error::TruncatedData(format!(
                    "root HFS0 at {:#x}+{:#x} is past the end of the image ({:#x})",
                    header_offset,
                    header.hfs0_offset,
                    view.size()
                ))
            })?;
        let mut root = Hfs0::new(view.sub_view(root_offset, view.size() - root_offset)?);

        let names: Vec<String> = root.entries()?.keys().cloned().collect();
        let mut partitions = HashMap::with_capacity(names.len());
        for name in names {
            let kind = PartitionKind::from_name(&name);
            if kind.is_none() {
                tracing::debug!(name = %name, "Unknown XCI partition");
            }
            let hfs0 = Hfs0::new(root.open(&name)?);
            partitions.insert(name, XciPartition { kind, hfs0 });
        }

        Ok(XciContents {
            header,
            header_offset,
            root_offset,
            partitions,
        })
    }
}

impl VirtualFs for Xci {
    fn valid(&mut self) -> bool {
        Xci::valid(self)
    }

    fn parse(&mut self) -> Result<()> {
        Xci::parse(self)
    }

    /// Root partition names.
    fn list_files(&mut self) -> Result<Vec<String>> {
        Ok(self.partitions()?.keys().cloned().collect())
    }

    /// Raw view of a root partition.
    fn open_file(&mut self, name: &str) -> Result<ByteView> {
        Ok(self.get_partition(name)?.view().clone())
    }
}
