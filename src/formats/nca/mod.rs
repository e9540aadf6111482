//! Nintendo Content Archive (NCA).
//!
//! The first 0xC00 bytes are encrypted with AES-XTS with sector size 0x200
//! with a non-standard "tweak" (endianness is reversed as big endian), this
//! encrypted data is an 0x400 NCA header + an 0x200 header for each section
//! in the section table.
//!
//! For pre-1.0.0 "NCA2" NCAs, the first 0x400 byte are encrypted the same way as in NCA3.
//! However, each section header is individually encrypted as though it were sector 0, instead
//! of the appropriate sector as in NCA3.
//!
//! An [`Nca`] moves through [`NcaState`] one step at a time: the header is decrypted the
//! first time any metadata is requested, section descriptors are derived from it on the
//! first section query, and sections are decrypted and sniffed only when their contents
//! are needed. A failed step leaves the archive at the last good state, so a caller can
//! register the missing key and try again.

use std::io::Cursor;
use std::sync::Arc;

use binrw::prelude::*;

mod keys;
pub mod types;

use keys::{NcaKeyManagement, SectionKey};
pub use types::*;

use crate::crypto;
use crate::error::{Error, Result};
use crate::formats::Format;
use crate::formats::keyset::{KeyStore, RightsId};
use crate::formats::pfs0::Pfs0;
use crate::formats::romfs::RomFs;
use crate::io::{ByteView, CtrStorage, XtsStorage};
use crate::util::VirtualFs;

/// Size of the main header.
pub const HEADER_SIZE: usize = 0x400;
/// Size of one section (FS) header.
pub const FS_HEADER_SIZE: usize = 0x200;
/// Main header plus the four section headers.
pub const FULL_HEADER_SIZE: usize = HEADER_SIZE + 4 * FS_HEADER_SIZE;
const HEADER_SECTOR_SIZE: usize = 0x200;

/// Represents the version of an NCA file, taken from the last byte of the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaVersion {
    Nca0,
    Nca2,
    Nca3,
}

impl NcaVersion {
    pub fn from_magic(magic: &[u8; 4]) -> Option<Self> {
        match magic {
            b"NCA0" => Some(Self::Nca0),
            b"NCA2" => Some(Self::Nca2),
            b"NCA3" => Some(Self::Nca3),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::Nca0 => '0',
            Self::Nca2 => '2',
            Self::Nca3 => '3',
        }
    }
}

/// Decrypts the first 0x400 bytes of an NCA in place and returns its version.
pub(crate) fn decrypt_main_header(buf: &mut [u8], header_key: &crypto::AesXtsKey) -> Result<NcaVersion> {
    let xts = crypto::xts_context(header_key);
    xts.decrypt_area(
        &mut buf[..HEADER_SIZE],
        HEADER_SECTOR_SIZE,
        0,
        crypto::get_nintendo_tweak,
    );

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0x200..0x204]);
    NcaVersion::from_magic(&magic).ok_or(Error::HeaderDecryptFailed(magic))
}

/// Header state shared by every stage after decryption.
#[derive(Debug)]
pub struct NcaInfo {
    pub header: NcaHeader,
    pub version: NcaVersion,
    pub fs_headers: [Option<FsHeader>; 4],
}

/// Observable progress of an [`Nca`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NcaState {
    Unparsed,
    HeaderDecrypted,
    SectionsResolved,
    Parsed,
}

enum Stage {
    Unparsed,
    HeaderDecrypted(Box<NcaInfo>),
    SectionsResolved(Box<NcaInfo>, Vec<SectionDescriptor>),
    Parsed(Box<NcaInfo>, Vec<NcaSection>),
}

/// Filesystem found inside a decrypted section.
#[derive(Debug)]
pub enum SectionFs {
    Pfs0(Pfs0),
    RomFs(RomFs),
}

impl SectionFs {
    pub fn kind(&self) -> SectionKind {
        match self {
            SectionFs::Pfs0(_) => SectionKind::Pfs0,
            SectionFs::RomFs(_) => SectionKind::RomFs,
        }
    }

    pub fn as_pfs0(&mut self) -> Option<&mut Pfs0> {
        match self {
            SectionFs::Pfs0(pfs0) => Some(pfs0),
            SectionFs::RomFs(_) => None,
        }
    }

    pub fn as_romfs(&mut self) -> Option<&mut RomFs> {
        match self {
            SectionFs::RomFs(romfs) => Some(romfs),
            SectionFs::Pfs0(_) => None,
        }
    }
}

impl VirtualFs for SectionFs {
    fn valid(&mut self) -> bool {
        match self {
            SectionFs::Pfs0(fs) => fs.valid(),
            SectionFs::RomFs(fs) => fs.valid(),
        }
    }

    fn parse(&mut self) -> Result<()> {
        match self {
            SectionFs::Pfs0(fs) => fs.parse(),
            SectionFs::RomFs(fs) => fs.parse(),
        }
    }

    fn list_files(&mut self) -> Result<Vec<String>> {
        match self {
            SectionFs::Pfs0(fs) => fs.list_files(),
            SectionFs::RomFs(fs) => fs.list_files(),
        }
    }

    fn open_file(&mut self, name: &str) -> Result<ByteView> {
        match self {
            SectionFs::Pfs0(fs) => fs.open_file(name),
            SectionFs::RomFs(fs) => fs.open_file(name),
        }
    }
}

/// A decrypted NCA section and the filesystem inside it.
#[derive(Debug)]
pub struct NcaSection {
    descriptor: SectionDescriptor,
    view: ByteView,
    fs: SectionFs,
}

impl NcaSection {
    pub fn descriptor(&self) -> &SectionDescriptor {
        &self.descriptor
    }

    /// Decrypted view of the section's filesystem image.
    pub fn view(&self) -> ByteView {
        self.view.clone()
    }

    pub fn fs(&mut self) -> &mut SectionFs {
        &mut self.fs
    }
}

pub struct Nca {
    view: ByteView,
    keys: Arc<KeyStore>,
    stage: Stage,
}

impl std::fmt::Debug for Nca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nca")
            .field("view", &self.view)
            .field("state", &self.state())
            .finish()
    }
}

impl Nca {
    pub fn new(view: ByteView, keys: Arc<KeyStore>) -> Self {
        Self {
            view,
            keys,
            stage: Stage::Unparsed,
        }
    }

    pub fn state(&self) -> NcaState {
        match self.stage {
            Stage::Unparsed => NcaState::Unparsed,
            Stage::HeaderDecrypted(_) => NcaState::HeaderDecrypted,
            Stage::SectionsResolved(..) => NcaState::SectionsResolved,
            Stage::Parsed(..) => NcaState::Parsed,
        }
    }

    pub fn view(&self) -> &ByteView {
        &self.view
    }

    /// True once the header has been (or can be) decrypted to a known magic.
    pub fn valid(&mut self) -> bool {
        self.ensure_header().is_ok()
    }

    /// Decrypts the header and section headers if that hasn't happened yet.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn ensure_header(&mut self) -> Result<&NcaInfo> {
        if let Stage::Unparsed = self.stage {
            let info = Self::read_headers(&self.view, &self.keys)?;
            tracing::debug!(
                version = %info.version.as_char(),
                content_type = ?info.header.content_type,
                key_generation = info.header.get_key_generation(),
                "NCA header decrypted"
            );
            self.stage = Stage::HeaderDecrypted(Box::new(info));
        }
        self.info()
    }

    /// Derives and validates section descriptors from the decrypted headers.
    pub fn ensure_sections_resolved(&mut self) -> Result<()> {
        self.ensure_header()?;
        let Stage::HeaderDecrypted(info) = &self.stage else {
            return Ok(());
        };
        let descriptors = Self::resolve_descriptors(info, self.view.size())?;

        self.stage = match std::mem::replace(&mut self.stage, Stage::Unparsed) {
            Stage::HeaderDecrypted(info) => Stage::SectionsResolved(info, descriptors),
            other => other,
        };
        Ok(())
    }

    /// Resolves keys, decrypts every supported section and sniffs its filesystem.
    pub fn parse(&mut self) -> Result<()> {
        self.ensure_sections_resolved()?;
        let Stage::SectionsResolved(info, descriptors) = &self.stage else {
            return Ok(());
        };
        let sections = Self::open_sections(&self.view, &self.keys, info, descriptors)?;

        self.stage = match std::mem::replace(&mut self.stage, Stage::Unparsed) {
            Stage::SectionsResolved(info, _) => Stage::Parsed(info, sections),
            other => other,
        };
        Ok(())
    }

    fn info(&self) -> Result<&NcaInfo> {
        match &self.stage {
            Stage::Unparsed => Err(Error::InvalidData("NCA header has not been decrypted".into())),
            Stage::HeaderDecrypted(info)
            | Stage::SectionsResolved(info, _)
            | Stage::Parsed(info, _) => Ok(info),
        }
    }

    pub fn header(&mut self) -> Result<&NcaHeader> {
        Ok(&self.ensure_header()?.header)
    }

    pub fn version(&mut self) -> Result<NcaVersion> {
        Ok(self.ensure_header()?.version)
    }

    pub fn distribution_type(&mut self) -> Result<DistributionType> {
        Ok(self.header()?.distribution)
    }

    pub fn content_type(&mut self) -> Result<ContentType> {
        Ok(self.header()?.content_type)
    }

    pub fn content_size(&mut self) -> Result<u64> {
        Ok(self.header()?.content_size)
    }

    pub fn title_id(&mut self) -> Result<u64> {
        Ok(self.header()?.program_id)
    }

    /// SDK version as (major, minor, micro, revision).
    pub fn sdk_version(&mut self) -> Result<[u8; 4]> {
        Ok(self.header()?.sdk_version_parts())
    }

    pub fn rights_id(&mut self) -> Result<RightsId> {
        Ok(self.header()?.rights_id)
    }

    pub fn has_rights_id(&mut self) -> Result<bool> {
        Ok(self.header()?.has_rights_id())
    }

    pub fn key_generation(&mut self) -> Result<u8> {
        Ok(self.header()?.get_key_generation())
    }

    /// Descriptors for every populated section, including ones that can't be decrypted.
    pub fn section_descriptors(&mut self) -> Result<Vec<SectionDescriptor>> {
        self.ensure_sections_resolved()?;
        Ok(match &self.stage {
            Stage::SectionsResolved(_, descriptors) => descriptors.clone(),
            Stage::Parsed(info, _) => Self::resolve_descriptors(info, self.view.size())?,
            Stage::Unparsed | Stage::HeaderDecrypted(_) => Vec::new(),
        })
    }

    pub fn section_kinds(&mut self) -> Result<Vec<SectionKind>> {
        Ok(self
            .section_descriptors()?
            .iter()
            .map(|desc| desc.kind)
            .collect())
    }

    /// Absolute `(start, end)` byte offsets of each populated section.
    pub fn section_bounds(&mut self) -> Result<Vec<(u64, u64)>> {
        Ok(self
            .section_descriptors()?
            .iter()
            .map(|desc| (desc.start, desc.end))
            .collect())
    }

    /// Decrypted sections, parsing the archive if needed. Sections with unsupported
    /// encryption are left out.
    pub fn sections(&mut self) -> Result<&mut [NcaSection]> {
        self.parse()?;
        match &mut self.stage {
            Stage::Parsed(_, sections) => Ok(sections.as_mut_slice()),
            _ => Err(Error::InvalidData("NCA sections were not parsed".into())),
        }
    }

    /// Section by its index in the section table.
    pub fn section(&mut self, index: usize) -> Result<&mut NcaSection> {
        self.sections()?
            .iter_mut()
            .find(|section| section.descriptor.index == index)
            .ok_or_else(|| Error::EntryNotFound(format!("NCA section {index}")))
    }

    fn read_headers(view: &ByteView, keys: &KeyStore) -> Result<NcaInfo> {
        if view.size() < FULL_HEADER_SIZE as u64 {
            return Err(Error::TruncatedData(format!(
                "NCA of {:#x} bytes is smaller than its header",
                view.size()
            )));
        }
        let header_key = keys.header_key().ok_or(Error::MissingHeaderKey)?;
        let mut buf = view.read_vec_at(0, FULL_HEADER_SIZE as u64)?;

        let version = decrypt_main_header(&mut buf, &header_key)?;
        let xts = crypto::xts_context(&header_key);
        match version {
            NcaVersion::Nca3 => xts.decrypt_area(
                &mut buf[HEADER_SIZE..],
                HEADER_SECTOR_SIZE,
                2,
                crypto::get_nintendo_tweak,
            ),
            NcaVersion::Nca2 => {
                for fs_header in buf[HEADER_SIZE..].chunks_exact_mut(FS_HEADER_SIZE) {
                    xts.decrypt_area(fs_header, HEADER_SECTOR_SIZE, 0, crypto::get_nintendo_tweak);
                }
            }
            // Section headers are encrypted with the key area, which isn't supported.
            NcaVersion::Nca0 => {}
        }

        let header: NcaHeader = Cursor::new(&buf[..HEADER_SIZE]).read_le()?;

        let mut fs_headers: [Option<FsHeader>; 4] = Default::default();
        if version != NcaVersion::Nca0 {
            for (i, entry) in header.fs_entries.iter().enumerate() {
                if !entry.is_populated() {
                    continue;
                }
                let start = HEADER_SIZE + i * FS_HEADER_SIZE;
                let fs_header: FsHeader =
                    Cursor::new(&buf[start..start + FS_HEADER_SIZE]).read_le()?;
                fs_headers[i] = Some(fs_header);
            }
        }

        Ok(NcaInfo {
            header,
            version,
            fs_headers,
        })
    }

    fn resolve_descriptors(info: &NcaInfo, nca_size: u64) -> Result<Vec<SectionDescriptor>> {
        if info.version == NcaVersion::Nca0 {
            return Err(Error::Unsupported("NCA0 section headers".into()));
        }

        let header = &info.header;
        let mut descriptors = Vec::new();
        let mut prev_end = FULL_HEADER_SIZE as u64;

        for (index, entry) in header.fs_entries.iter().enumerate() {
            if !entry.is_populated() {
                continue;
            }
            let Some(fs_header) = &info.fs_headers[index] else {
                continue;
            };

            let (start, end) = (entry.start_offset(), entry.end_offset());
            if start < prev_end {
                return Err(Error::InvalidData(format!(
                    "section {index} at {start:#x} overlaps the previous section or the header"
                )));
            }
            if end > nca_size {
                return Err(Error::TruncatedData(format!(
                    "section {index} ends at {end:#x}, past the end of the NCA ({nca_size:#x})"
                )));
            }
            prev_end = end;

            let kind = fs_header.section_kind();
            let (data_offset, data_size) = match kind {
                SectionKind::Pfs0 => {
                    let sb = fs_header.pfs_superblock()?;
                    (sb.pfs0_offset, sb.pfs0_size)
                }
                SectionKind::RomFs => {
                    let level = fs_header.ivfc_superblock()?.data_level();
                    (level.offset, level.size)
                }
            };
            match data_offset.checked_add(data_size) {
                Some(data_end) if data_end <= end - start => {}
                _ => {
                    return Err(Error::InvalidData(format!(
                        "section {index} data region {data_offset:#x}+{data_size:#x} exceeds the section"
                    )));
                }
            }

            descriptors.push(SectionDescriptor {
                index,
                kind,
                crypto: SectionCrypto::resolve(fs_header.encryption_type, header.has_rights_id()),
                key_generation: header.get_key_generation(),
                start,
                end,
                data_offset,
                data_size,
                upper_ctr: fs_header.ctr,
            });
        }

        Ok(descriptors)
    }

    fn open_sections(
        view: &ByteView,
        keys: &KeyStore,
        info: &NcaInfo,
        descriptors: &[SectionDescriptor],
    ) -> Result<Vec<NcaSection>> {
        let mut key_management = NcaKeyManagement::new(&info.header, keys);
        let mut sections = Vec::with_capacity(descriptors.len());

        for desc in descriptors {
            if let SectionCrypto::Unsupported(kind) = desc.crypto {
                tracing::warn!(section = desc.index, encryption = ?kind, "Skipping section with unsupported encryption");
                continue;
            }
            let key = key_management.section_key(desc.crypto)?;
            let section_view = Self::section_view(view, desc, key)?;

            let fs = match Format::detect(&section_view, keys) {
                Format::Pfs0 => SectionFs::Pfs0(Pfs0::new(section_view.clone())),
                Format::RomFs => SectionFs::RomFs(RomFs::new(section_view.clone())),
                other => {
                    tracing::debug!(section = desc.index, detected = ?other, "Section did not decrypt to a filesystem");
                    return Err(Error::UnrecognizedInnerFormat {
                        section: desc.index,
                    });
                }
            };
            if fs.kind() != desc.kind {
                tracing::debug!(section = desc.index, header = ?desc.kind, detected = ?fs.kind(), "Section header disagrees with contents");
                return Err(Error::UnrecognizedInnerFormat {
                    section: desc.index,
                });
            }
            tracing::trace!(
                section = desc.index,
                offset = format!("{:012X}", desc.start + desc.data_offset),
                size = desc.data_size,
                "Opened NCA section"
            );

            sections.push(NcaSection {
                descriptor: desc.clone(),
                view: section_view,
                fs,
            });
        }

        Ok(sections)
    }

    fn section_view(view: &ByteView, desc: &SectionDescriptor, key: SectionKey) -> Result<ByteView> {
        let data_start = desc.start + desc.data_offset;
        Ok(match key {
            SectionKey::None => view.sub_view(data_start, desc.data_size)?,
            SectionKey::Ctr(key) => ByteView::new(CtrStorage::new(
                view.clone(),
                data_start,
                desc.data_size,
                key,
                desc.upper_ctr,
            )?),
            SectionKey::Xts(key) => ByteView::new(XtsStorage::new(
                view.clone(),
                desc.start,
                desc.size(),
                desc.data_offset,
                desc.data_size,
                key,
            )?),
        })
    }
}

impl VirtualFs for Nca {
    fn valid(&mut self) -> bool {
        Nca::valid(self)
    }

    fn parse(&mut self) -> Result<()> {
        Nca::parse(self)
    }

    /// Section indices, as strings.
    fn list_files(&mut self) -> Result<Vec<String>> {
        Ok(self
            .sections()?
            .iter()
            .map(|section| section.descriptor.index.to_string())
            .collect())
    }

    fn open_file(&mut self, name: &str) -> Result<ByteView> {
        let index = name
            .parse::<usize>()
            .map_err(|_| Error::EntryNotFound(name.to_string()))?;
        Ok(self.section(index)?.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, NcaBuilder, SectionSpec, TEST_HEADER_KEY};
    use color_eyre::Result;
    use tracing_test::traced_test;

    fn pfs0_section() -> SectionSpec {
        SectionSpec::pfs0(fixtures::build_pfs0(&[
            ("main", b"code code code".as_slice()),
            ("main.npdm", b"npdm".as_slice()),
        ]))
    }

    fn romfs_section() -> SectionSpec {
        SectionSpec::romfs(fixtures::build_romfs(&[
            ("/control.nacp", b"nacp".as_slice()),
            ("/icon/AmericanEnglish.dat", b"jpeg".as_slice()),
        ]))
    }

    #[traced_test]
    #[test]
    fn test_metadata_after_header_decryption() -> Result<()> {
        let image = NcaBuilder::new()
            .content_type(ContentType::Control)
            .title_id(0x0100000000010000)
            .sdk_version(0x000B0000)
            .section(pfs0_section())
            .build();
        let keys = Arc::new(fixtures::test_keys());
        let mut nca = Nca::new(ByteView::from_bytes(image), keys);

        assert_eq!(nca.state(), NcaState::Unparsed);
        assert!(nca.valid());
        assert_eq!(nca.state(), NcaState::HeaderDecrypted);
        assert_eq!(nca.version()?, NcaVersion::Nca3);
        assert_eq!(nca.content_type()?, ContentType::Control);
        assert_eq!(nca.distribution_type()?, DistributionType::Download);
        assert_eq!(nca.title_id()?, 0x0100000000010000);
        assert_eq!(nca.sdk_version()?, [0, 0x0B, 0, 0]);
        assert!(!nca.has_rights_id()?);

        assert_eq!(nca.section_kinds()?, vec![SectionKind::Pfs0]);
        assert_eq!(nca.state(), NcaState::SectionsResolved);
        let (start, end) = nca.section_bounds()?[0];
        assert_eq!(start, 0xC00);
        assert!(end > start && end <= nca.view().size());
        Ok(())
    }

    #[test]
    fn test_missing_header_key() {
        let image = NcaBuilder::new().section(pfs0_section()).build();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(KeyStore::new()));
        assert!(matches!(nca.ensure_header(), Err(Error::MissingHeaderKey)));
        assert!(!nca.valid());
        assert_eq!(nca.state(), NcaState::Unparsed);
    }

    #[test]
    fn test_wrong_header_key() {
        let image = NcaBuilder::new().section(pfs0_section()).build();
        let keys = KeyStore::new();
        keys.set_key("header_key", &[0x55; 0x20]).unwrap();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(keys));
        assert!(matches!(nca.ensure_header(), Err(Error::HeaderDecryptFailed(_))));
    }

    #[test]
    fn test_truncated_nca() {
        let mut nca = Nca::new(ByteView::from_bytes(vec![0u8; 0x400]), Arc::new(fixtures::test_keys()));
        assert!(matches!(nca.ensure_header(), Err(Error::TruncatedData(_))));
    }

    #[traced_test]
    #[test]
    fn test_ctr_and_xts_sections() -> Result<()> {
        let image = NcaBuilder::new()
            .section(pfs0_section())
            .section(romfs_section().xts())
            .build();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(fixtures::test_keys()));

        nca.parse()?;
        assert_eq!(nca.state(), NcaState::Parsed);
        assert_eq!(nca.sections()?.len(), 2);

        let exefs = nca.section(0)?;
        assert_eq!(exefs.descriptor().crypto, SectionCrypto::Ctr);
        let pfs0 = exefs.fs().as_pfs0().expect("section 0 is a PFS0");
        assert_eq!(pfs0.open("main")?.read_to_vec()?, b"code code code");

        let romfs_section = nca.section(1)?;
        assert_eq!(romfs_section.descriptor().crypto, SectionCrypto::Xts);
        let romfs = romfs_section.fs().as_romfs().expect("section 1 is a RomFS");
        assert_eq!(romfs.open("/icon/AmericanEnglish.dat")?.read_to_vec()?, b"jpeg");
        Ok(())
    }

    #[test]
    fn test_parse_is_deterministic() -> Result<()> {
        let image = NcaBuilder::new().section(pfs0_section()).build();
        let keys = Arc::new(fixtures::test_keys());

        let mut first = Nca::new(ByteView::from_bytes(image.clone()), Arc::clone(&keys));
        let mut second = Nca::new(ByteView::from_bytes(image), keys);
        assert_eq!(first.section_descriptors()?, second.section_descriptors()?);
        assert_eq!(
            first.section(0)?.view().read_to_vec()?,
            second.section(0)?.view().read_to_vec()?
        );
        // A second parse is a no-op.
        first.parse()?;
        assert_eq!(first.sections()?.len(), 1);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn test_title_key_override_retry() -> Result<()> {
        let rights_id = [0x01, 0, 0, 0, 0, 0, 0, 0x10, 0, 0, 0, 0, 0, 0, 0, 0x02];
        let title_key = [0x5A; 0x10];
        let image = NcaBuilder::new()
            .rights_id(rights_id, title_key)
            .section(pfs0_section())
            .build();
        let keys = Arc::new(fixtures::test_keys());
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::clone(&keys));

        assert_eq!(nca.section_descriptors()?[0].crypto, SectionCrypto::CtrWithRightsId);
        match nca.parse() {
            Err(Error::MissingTitleKey(id)) => assert_eq!(id, hex::encode_upper(rights_id)),
            other => panic!("expected MissingTitleKey, got {other:?}"),
        }
        assert_eq!(nca.state(), NcaState::SectionsResolved);

        keys.set_user_titlekey(&fixtures::encrypt_key(&fixtures::TEST_TITLEKEK, &title_key))?;
        nca.parse()?;
        let pfs0 = nca.section(0)?.fs().as_pfs0().expect("PFS0 section");
        assert_eq!(pfs0.open("main.npdm")?.read_to_vec()?, b"npdm");
        Ok(())
    }

    #[test]
    fn test_zero_rights_id_ignores_title_keys() -> Result<()> {
        let image = NcaBuilder::new().section(pfs0_section()).build();
        let keys = fixtures::test_keys();
        // A bogus override would break decryption if it were consulted.
        keys.set_user_titlekey(&[0xFF; 0x10])?;
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(keys));

        let pfs0 = nca.section(0)?.fs().as_pfs0().expect("PFS0 section");
        assert_eq!(pfs0.open("main")?.read_to_vec()?, b"code code code");
        Ok(())
    }

    #[test]
    fn test_missing_key_area_key() {
        let image = NcaBuilder::new().section(pfs0_section()).build();
        let keys = KeyStore::new();
        keys.set_key("header_key", &TEST_HEADER_KEY).unwrap();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(keys));

        assert!(nca.valid());
        assert!(matches!(
            nca.parse(),
            Err(Error::MissingAreaKey(name)) if name == "key_area_key_application_00"
        ));
    }

    #[traced_test]
    #[test]
    fn test_unsupported_section_is_skipped() -> Result<()> {
        let image = NcaBuilder::new()
            .section(pfs0_section())
            .section(romfs_section().encryption(EncryptionType::AesCtrEx))
            .build();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(fixtures::test_keys()));

        assert_eq!(nca.section_descriptors()?.len(), 2);
        assert_eq!(nca.list_files()?, vec!["0".to_string()]);
        assert!(matches!(nca.section(1), Err(Error::EntryNotFound(_))));
        assert!(logs_contain("Skipping section with unsupported encryption"));
        Ok(())
    }

    #[test]
    fn test_garbage_section_is_unrecognized() {
        let image = NcaBuilder::new()
            .section(SectionSpec::pfs0(vec![0xEE; 0x300]))
            .build();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(fixtures::test_keys()));
        assert!(matches!(
            nca.parse(),
            Err(Error::UnrecognizedInnerFormat { section: 0 })
        ));
    }

    #[traced_test]
    #[test]
    fn test_declared_kind_must_match_contents() {
        let image = NcaBuilder::new()
            .section(SectionSpec::romfs(fixtures::build_pfs0(&[("x", b"x".as_slice())])))
            .build();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(fixtures::test_keys()));

        assert!(matches!(nca.section_kinds(), Ok(kinds) if kinds == vec![SectionKind::RomFs]));
        assert!(matches!(
            nca.parse(),
            Err(Error::UnrecognizedInnerFormat { section: 0 })
        ));
        assert_eq!(nca.state(), NcaState::SectionsResolved);
        assert!(logs_contain("Section header disagrees with contents"));
    }

    #[test]
    fn test_nca2_section_headers() -> Result<()> {
        let image = NcaBuilder::new()
            .version(NcaVersion::Nca2)
            .section(pfs0_section().plaintext())
            .build();
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(fixtures::test_keys()));

        assert_eq!(nca.version()?, NcaVersion::Nca2);
        assert_eq!(nca.section(0)?.descriptor().crypto, SectionCrypto::None);
        assert_eq!(nca.open_file("0")?.read_vec_at(0, 4)?, b"PFS0");
        Ok(())
    }

    #[test]
    fn test_overlapping_sections_rejected() {
        let mut image = NcaBuilder::new()
            .section(pfs0_section().plaintext())
            .section(pfs0_section().plaintext())
            .build();
        // Point section 1's start into section 0.
        fixtures::patch_nca_header(&mut image, |header| {
            header[0x250..0x254].copy_from_slice(&6u32.to_le_bytes());
        });
        let mut nca = Nca::new(ByteView::from_bytes(image), Arc::new(fixtures::test_keys()));
        assert!(nca.valid());
        assert!(matches!(nca.section_kinds(), Err(Error::InvalidData(_))));
    }
}
