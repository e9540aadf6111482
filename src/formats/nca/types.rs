use std::io::Cursor;

use binrw::prelude::*;

use crate::error::Result;

/// NCA sections are addressed in 0x200-byte media blocks.
pub const MEDIA_BLOCK_SIZE: u64 = 0x200;

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little, repr = u8)]
/// The source of the content the NCA is for, either downloaded from
/// the CDN or from a game card (cartridge).
pub enum DistributionType {
    /// The content was downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// The content is from a game card (cartridge).
    GameCard = 0x01,
}

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little, repr = u8)]
/// The type of content stored in the NCA.
pub enum ContentType {
    /// Program content (executable code).
    Program = 0x00,
    /// Meta content (information about the title).
    Meta = 0x01,
    /// Control content (icon, screenshots, etc.).
    Control = 0x02,
    /// Manual content (digital manual/documentation).
    Manual = 0x03,
    /// Data content (general game data).
    Data = 0x04,
    /// Public data content.
    PublicData = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// The encryption key index used for the key area in the NCA header.
pub enum KeyAreaEncryptionKeyIndex {
    /// Application key area encryption key.
    #[default]
    Application = 0x00,
    /// Ocean key area encryption key.
    Ocean = 0x01,
    /// System key area encryption key.
    System = 0x02,
}

impl KeyAreaEncryptionKeyIndex {
    /// Unknown indices fall back to the application key.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => Self::Ocean,
            0x02 => Self::System,
            _ => Self::Application,
        }
    }

    /// Name fragment used in `key_area_key_<name>_XX`.
    pub fn key_name(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Ocean => "ocean",
            Self::System => "system",
        }
    }
}

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little, repr = u8)]
/// Filesystem type
pub enum FsType {
    /// RomFS filesystem
    RomFs = 0x00,
    /// Partition filesystem
    PartitionFs = 0x01,
}

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[br(little, repr = u8)]
/// Hash type used for filesystem verification
pub enum HashType {
    #[default]
    /// Automatically select hash type
    Auto = 0x00,
    /// No hash verification
    None = 0x01,
    /// Hierarchical SHA256 hash
    HierarchicalSha256Hash = 0x02,
    /// Hierarchical integrity hash
    HierarchicalIntegrityHash = 0x03,
    /// [14.0.0+] Automatically select SHA3 hash
    AutoSha3 = 0x04,
    /// [14.0.0+] Hierarchical SHA3-256 hash
    HierarchicalSha3256Hash = 0x05,
    /// [14.0.0+] Hierarchical integrity SHA3 hash
    HierarchicalIntegritySha3Hash = 0x06,
}

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little, repr = u8)]
/// Encryption type for NCA content
pub enum EncryptionType {
    /// Automatically select encryption type
    Auto = 0x00,
    /// No encryption
    None = 0x01,
    /// AES-XTS encryption
    AesXts = 0x02,
    /// AES-CTR encryption
    AesCtr = 0x03,
    /// AES-CTR extended encryption
    AesCtrEx = 0x04,
    /// [14.0.0+] AES-CTR encryption with skipped layer hash
    AesCtrSkipLayerHash = 0x05,
    /// [14.0.0+] AES-CTR extended encryption with skipped layer hash
    AesCtrExSkipLayerHash = 0x06,
}

/// Section table entry in the main header.
#[derive(BinRead, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[br(little)]
pub struct FsEntry {
    pub start_block: u32,
    pub end_block: u32,
    _reserved: u64,
}

impl FsEntry {
    pub fn start_offset(&self) -> u64 {
        self.start_block as u64 * MEDIA_BLOCK_SIZE
    }

    pub fn end_offset(&self) -> u64 {
        self.end_block as u64 * MEDIA_BLOCK_SIZE
    }

    pub fn is_populated(&self) -> bool {
        self.end_block > self.start_block
    }
}

/// The decrypted 0x400-byte NCA main header.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct NcaHeader {
    /// RSA-2048 signature over the header using a fixed key.
    pub header_sig: [u8; 0x100],
    /// RSA-2048 signature using a key from the NPDM.
    pub header_sig2: [u8; 0x100],
    /// `NCA3`, `NCA2` or `NCA0`.
    pub magic: [u8; 4],
    pub distribution: DistributionType,
    pub content_type: ContentType,
    /// Key generation byte from before 3.0.0.
    pub key_generation_old: u8,
    pub key_area_key_index: u8,
    pub content_size: u64,
    /// Title ID of the program this content belongs to.
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    pub signature_key_generation: u8,
    _reserved: [u8; 0xE],
    pub rights_id: [u8; 0x10],
    pub fs_entries: [FsEntry; 4],
    /// SHA-256 of each section's FsHeader.
    pub fs_header_hashes: [[u8; 0x20]; 4],
    /// Encrypted key area: two XTS halves, the CTR key, and an unused slot.
    pub key_area: [[u8; 0x10]; 4],
}

impl NcaHeader {
    /// The effective key generation: the larger of the two header bytes, minus one.
    pub fn get_key_generation(&self) -> u8 {
        self.key_generation_old
            .max(self.key_generation)
            .saturating_sub(1)
    }

    pub fn has_rights_id(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    pub fn key_area_key_index(&self) -> KeyAreaEncryptionKeyIndex {
        KeyAreaEncryptionKeyIndex::from_raw(self.key_area_key_index)
    }

    /// SDK version as (major, minor, micro, revision).
    pub fn sdk_version_parts(&self) -> [u8; 4] {
        self.sdk_version.to_be_bytes()
    }
}

/// Superblock of a partition filesystem section (hierarchical SHA-256).
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct PfsSuperblock {
    pub master_hash: [u8; 0x20],
    pub block_size: u32,
    pub layer_count: u32,
    pub hash_table_offset: u64,
    pub hash_table_size: u64,
    /// Offset of the PFS0 image relative to the section start.
    pub pfs0_offset: u64,
    pub pfs0_size: u64,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct IvfcLevel {
    pub offset: u64,
    pub size: u64,
    pub block_size_log2: u32,
    _reserved: u32,
}

/// Superblock of a RomFS section (hierarchical integrity).
#[derive(BinRead, Debug, Clone)]
#[br(little, magic = b"IVFC")]
pub struct IvfcSuperblock {
    pub id: u32,
    pub master_hash_size: u32,
    pub num_levels: u32,
    pub levels: [IvfcLevel; 6],
}

impl IvfcSuperblock {
    /// The last level holds the RomFS image itself.
    pub fn data_level(&self) -> IvfcLevel {
        self.levels[5]
    }
}

// The FsHeader for each section is at offset + 0x400 + (sectionid * 0x200),
// where sectionid corresponds to the index used with the entry/hash tables.
/// NCA filesystem header
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct FsHeader {
    /// The filesystem version for the NCA.
    ///
    /// In most cases, this should always be a 2.
    pub version: u16,
    /// The type of filesystem used in this section.
    pub fs_type: FsType,
    /// The hash type used for filesystem verification.
    pub hash_type: HashType,
    /// The encryption type used for the filesystem.
    pub encryption_type: EncryptionType,
    /// Metadata hash type, only used in 14.0.0+ NCAs.
    pub metadata_hash_type: u8,
    _reserved: [u8; 0x2],
    /// Superblock, interpreted according to `hash_type`.
    pub hash_data: [u8; 0xF8],
    pub patch_info: [u8; 0x40],
    /// Upper half of the AES-CTR counter.
    pub ctr: u64,
}

impl FsHeader {
    pub fn pfs_superblock(&self) -> Result<PfsSuperblock> {
        Ok(Cursor::new(&self.hash_data[..]).read_le()?)
    }

    pub fn ivfc_superblock(&self) -> Result<IvfcSuperblock> {
        Ok(Cursor::new(&self.hash_data[..]).read_le()?)
    }

    /// A section holds a PFS0 only when it's a partition filesystem hashed with
    /// hierarchical SHA-256; everything else is treated as RomFS.
    pub fn section_kind(&self) -> SectionKind {
        if self.fs_type == FsType::PartitionFs
            && self.hash_type == HashType::HierarchicalSha256Hash
        {
            SectionKind::Pfs0
        } else {
            SectionKind::RomFs
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Pfs0,
    RomFs,
}

/// How a section's bytes are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionCrypto {
    None,
    /// AES-XTS with the first two key-area keys.
    Xts,
    /// AES-CTR with the key-area CTR key.
    Ctr,
    /// AES-CTR with the decrypted title key.
    CtrWithRightsId,
    /// An encryption scheme this crate can't read; the section is skipped.
    Unsupported(EncryptionType),
}

impl SectionCrypto {
    pub fn resolve(encryption_type: EncryptionType, has_rights_id: bool) -> Self {
        match encryption_type {
            EncryptionType::None => Self::None,
            EncryptionType::AesXts => Self::Xts,
            EncryptionType::AesCtr if has_rights_id => Self::CtrWithRightsId,
            EncryptionType::AesCtr => Self::Ctr,
            other => Self::Unsupported(other),
        }
    }
}

/// Everything needed to open one NCA section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub index: usize,
    pub kind: SectionKind,
    pub crypto: SectionCrypto,
    pub key_generation: u8,
    /// Absolute section bounds within the NCA.
    pub start: u64,
    pub end: u64,
    /// Offset of the filesystem image relative to `start`.
    pub data_offset: u64,
    pub data_size: u64,
    pub upper_ctr: u64,
}

impl SectionDescriptor {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}
