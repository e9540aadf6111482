//! Builders for small synthetic images used across the test suites.

use aes::Aes128;
use cipher::{BlockEncryptMut, KeyIvInit, KeyInit, StreamCipher, generic_array::GenericArray};
use hex_literal::hex;
use sha2::{Digest, Sha256};

use crate::crypto::{self, AesKey, AesXtsKey};
use crate::formats::keyset::{KeyStore, RightsId};
use crate::formats::nca::{ContentType, EncryptionType, NcaVersion, SectionKind};
use crate::formats::romfs::{INVALID_ENTRY, compute_hash};

pub const TEST_HEADER_KEY: AesXtsKey =
    hex!("aeaab1ca08adf9bef12991f369e3c567d6881e4e4a6a47a51f6e4877062d542d");
pub const TEST_KAEK: AesKey = hex!("5f1d1f6b2a8e4c3d9b7a6c5e4d3c2b1a");
pub const TEST_TITLEKEK: AesKey = hex!("0123456789abcdeffedcba9876543210");
/// Plaintext key area: XTS data key, XTS tweak key, CTR key, unused.
pub const TEST_KEY_AREA: [AesKey; 4] = [
    hex!("11111111111111111111111111111111"),
    hex!("22222222222222222222222222222222"),
    hex!("33333333333333333333333333333333"),
    [0; 0x10],
];

/// Keys matching every builder in this module.
pub fn test_keys() -> KeyStore {
    let keys = KeyStore::new();
    keys.set_key("header_key", &TEST_HEADER_KEY).unwrap();
    keys.set_key("key_area_key_application_00", &TEST_KAEK).unwrap();
    keys.set_key("titlekek_00", &TEST_TITLEKEK).unwrap();
    keys
}

pub fn ecb_encrypt(key: &AesKey, data: &mut [u8]) {
    let mut encryptor = ecb::Encryptor::<Aes128>::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(0x10) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

pub fn encrypt_key(kek: &AesKey, key: &AesKey) -> AesKey {
    let mut out = *key;
    ecb_encrypt(kek, &mut out);
    out
}

pub fn xts_encrypt(key: &AesXtsKey, first_sector: u128, data: &mut [u8]) {
    crypto::xts_context(key).encrypt_area(data, 0x200, first_sector, crypto::get_nintendo_tweak);
}

/// CTR is symmetric; `offset` is the absolute offset of `data[0]` in the archive.
pub fn ctr_crypt(key: &AesKey, upper_ctr: u64, offset: u64, data: &mut [u8]) {
    let iv = crypto::ctr_iv(upper_ctr, offset);
    let mut cipher = ctr::Ctr128BE::<Aes128>::new(key.into(), &iv.into());
    cipher.apply_keystream(data);
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Builds a partition filesystem; returns the image and the length of its tables.
fn build_partition(magic: &[u8; 4], hashed: bool, entries: &[(&str, &[u8])]) -> (Vec<u8>, usize) {
    let mut string_table = Vec::new();
    let mut name_offsets = Vec::new();
    for (name, _) in entries {
        name_offsets.push(string_table.len() as u32);
        string_table.extend_from_slice(name.as_bytes());
        string_table.push(0);
    }
    string_table.resize(align(string_table.len(), 4), 0);

    let mut out = Vec::new();
    out.extend_from_slice(magic);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);

    let mut data_offset = 0u64;
    for ((_, data), name_offset) in entries.iter().zip(&name_offsets) {
        out.extend_from_slice(&data_offset.to_le_bytes());
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        out.extend_from_slice(&name_offset.to_le_bytes());
        if hashed {
            let hashed_size = data.len().min(0x200);
            out.extend_from_slice(&(hashed_size as u32).to_le_bytes());
            out.extend_from_slice(&[0; 8]);
            out.extend_from_slice(&Sha256::digest(&data[..hashed_size]));
        } else {
            out.extend_from_slice(&[0; 4]);
        }
        data_offset += data.len() as u64;
    }
    out.extend_from_slice(&string_table);

    let tables_len = out.len();
    for (_, data) in entries {
        out.extend_from_slice(data);
    }
    (out, tables_len)
}

pub fn build_pfs0(entries: &[(&str, &[u8])]) -> Vec<u8> {
    build_partition(b"PFS0", false, entries).0
}

pub fn build_hfs0(entries: &[(&str, &[u8])]) -> Vec<u8> {
    build_partition(b"HFS0", true, entries).0
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn dir_name(path: &str) -> &str {
    if path == "/" { "" } else { name_of(path) }
}

/// Builds a RomFS image from absolute file paths. Directories are laid out in sorted
/// path order, so the root is at offset 0 and its first child right after it. File data
/// is stored in input order with nothing after the last file.
pub fn build_romfs(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut dirs = vec!["/".to_string()];
    for (path, _) in files {
        let mut dir = parent_of(path);
        while dir != "/" {
            dirs.push(dir.to_string());
            dir = parent_of(dir);
        }
    }
    dirs.sort();
    dirs.dedup();

    let mut dir_offsets = Vec::new();
    let mut offset = 0u32;
    for dir in &dirs {
        dir_offsets.push(offset);
        offset += 0x18 + align(dir_name(dir).len(), 4) as u32;
    }
    let dir_offset_of = |path: &str| dir_offsets[dirs.iter().position(|d| d == path).unwrap()];

    let mut file_offsets = Vec::new();
    let mut offset = 0u32;
    for (path, _) in files {
        file_offsets.push(offset);
        offset += 0x20 + align(name_of(path).len(), 4) as u32;
    }

    // Directory table
    let mut dir_hash = vec![INVALID_ENTRY; dirs.len()];
    let mut dir_table = Vec::new();
    for (i, dir) in dirs.iter().enumerate() {
        let parent = if dir == "/" { 0 } else { dir_offset_of(parent_of(dir)) };
        let sibling = dirs[i + 1..]
            .iter()
            .position(|d| d != "/" && dir != "/" && parent_of(d) == parent_of(dir))
            .map_or(INVALID_ENTRY, |p| dir_offsets[i + 1 + p]);
        let child = dirs
            .iter()
            .position(|d| d != "/" && parent_of(d) == dir)
            .map_or(INVALID_ENTRY, |p| dir_offsets[p]);
        let file = files
            .iter()
            .position(|(f, _)| parent_of(f) == dir)
            .map_or(INVALID_ENTRY, |p| file_offsets[p]);
        let name = dir_name(dir);
        let bucket = compute_hash(parent, name.as_bytes(), dir_hash.len());

        for value in [parent, sibling, child, file, dir_hash[bucket], name.len() as u32] {
            dir_table.extend_from_slice(&value.to_le_bytes());
        }
        dir_table.extend_from_slice(name.as_bytes());
        dir_table.resize(align(dir_table.len(), 4), 0);
        dir_hash[bucket] = dir_offsets[i];
    }

    // File table and data
    let mut file_hash = vec![INVALID_ENTRY; files.len().max(1)];
    let mut file_table = Vec::new();
    let mut file_data: Vec<u8> = Vec::new();
    for (i, (path, data)) in files.iter().enumerate() {
        let parent = dir_offset_of(parent_of(path));
        let sibling = files[i + 1..]
            .iter()
            .position(|(f, _)| parent_of(f) == parent_of(path))
            .map_or(INVALID_ENTRY, |p| file_offsets[i + 1 + p]);
        let name = name_of(path);
        let bucket = compute_hash(parent, name.as_bytes(), file_hash.len());

        file_data.resize(align(file_data.len(), 0x10), 0);
        let data_offset = file_data.len() as u64;
        file_data.extend_from_slice(data);

        file_table.extend_from_slice(&parent.to_le_bytes());
        file_table.extend_from_slice(&sibling.to_le_bytes());
        file_table.extend_from_slice(&data_offset.to_le_bytes());
        file_table.extend_from_slice(&(data.len() as u64).to_le_bytes());
        file_table.extend_from_slice(&file_hash[bucket].to_le_bytes());
        file_table.extend_from_slice(&(name.len() as u32).to_le_bytes());
        file_table.extend_from_slice(name.as_bytes());
        file_table.resize(align(file_table.len(), 4), 0);
        file_hash[bucket] = file_offsets[i];
    }

    let to_bytes = |table: &[u32]| table.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
    let dir_hash = to_bytes(&dir_hash);
    let file_hash = to_bytes(&file_hash);

    let dir_hash_offset = 0x50usize;
    let dir_table_offset = dir_hash_offset + dir_hash.len();
    let file_hash_offset = dir_table_offset + dir_table.len();
    let file_table_offset = file_hash_offset + file_hash.len();
    let file_data_offset = align(file_table_offset + file_table.len(), 0x10);

    let mut out = Vec::new();
    for value in [
        0x50,
        dir_hash_offset,
        dir_hash.len(),
        dir_table_offset,
        dir_table.len(),
        file_hash_offset,
        file_hash.len(),
        file_table_offset,
        file_table.len(),
        file_data_offset,
    ] {
        out.extend_from_slice(&(value as u64).to_le_bytes());
    }
    out.extend_from_slice(&dir_hash);
    out.extend_from_slice(&dir_table);
    out.extend_from_slice(&file_hash);
    out.extend_from_slice(&file_table);
    out.resize(file_data_offset, 0);
    out.extend_from_slice(&file_data);
    out
}

/// One section of a synthetic NCA.
#[derive(Clone)]
pub struct SectionSpec {
    kind: SectionKind,
    data: Vec<u8>,
    encryption: EncryptionType,
}

impl SectionSpec {
    /// A CTR-encrypted PFS0 section.
    pub fn pfs0(data: Vec<u8>) -> Self {
        Self {
            kind: SectionKind::Pfs0,
            data,
            encryption: EncryptionType::AesCtr,
        }
    }

    /// A CTR-encrypted RomFS section.
    pub fn romfs(data: Vec<u8>) -> Self {
        Self {
            kind: SectionKind::RomFs,
            data,
            encryption: EncryptionType::AesCtr,
        }
    }

    pub fn xts(self) -> Self {
        self.encryption(EncryptionType::AesXts)
    }

    pub fn plaintext(self) -> Self {
        self.encryption(EncryptionType::None)
    }

    /// Sets the declared encryption. Types other than CTR and XTS are left unencrypted.
    pub fn encryption(mut self, encryption: EncryptionType) -> Self {
        self.encryption = encryption;
        self
    }
}

pub struct NcaBuilder {
    version: NcaVersion,
    content_type: ContentType,
    title_id: u64,
    sdk_version: u32,
    rights: Option<(RightsId, AesKey)>,
    sections: Vec<SectionSpec>,
}

impl NcaBuilder {
    pub fn new() -> Self {
        Self {
            version: NcaVersion::Nca3,
            content_type: ContentType::Program,
            title_id: 0x0100000000001000,
            sdk_version: 0x000C1100,
            rights: None,
            sections: Vec::new(),
        }
    }

    pub fn version(mut self, version: NcaVersion) -> Self {
        self.version = version;
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn title_id(mut self, title_id: u64) -> Self {
        self.title_id = title_id;
        self
    }

    pub fn sdk_version(mut self, sdk_version: u32) -> Self {
        self.sdk_version = sdk_version;
        self
    }

    /// Marks the NCA as title-key encrypted; CTR sections use `title_key` directly.
    pub fn rights_id(mut self, rights_id: RightsId, title_key: AesKey) -> Self {
        self.rights = Some((rights_id, title_key));
        self
    }

    pub fn section(mut self, section: SectionSpec) -> Self {
        self.sections.push(section);
        self
    }

    pub fn build(self) -> Vec<u8> {
        assert!(self.sections.len() <= 4);
        let mut header = vec![0u8; 0xC00];
        let mut body = Vec::new();

        for (i, spec) in self.sections.iter().enumerate() {
            let start = 0xC00 + body.len() as u64;
            let mut data = spec.data.clone();
            data.resize(align(data.len().max(1), 0x200), 0);
            let upper_ctr = 0x0000_0001_0000_0000 + i as u64;

            let fs = 0x400 + i * 0x200;
            header[fs..fs + 2].copy_from_slice(&2u16.to_le_bytes());
            let (fs_type, hash_type) = match spec.kind {
                SectionKind::Pfs0 => (1, 2),
                SectionKind::RomFs => (0, 3),
            };
            header[fs + 2] = fs_type;
            header[fs + 3] = hash_type;
            header[fs + 4] = spec.encryption as u8;
            match spec.kind {
                SectionKind::Pfs0 => {
                    header[fs + 0x48..fs + 0x50].copy_from_slice(&(spec.data.len() as u64).to_le_bytes());
                }
                SectionKind::RomFs => {
                    header[fs + 0x8..fs + 0xC].copy_from_slice(b"IVFC");
                    header[fs + 0x98..fs + 0xA0].copy_from_slice(&(spec.data.len() as u64).to_le_bytes());
                }
            }
            header[fs + 0x140..fs + 0x148].copy_from_slice(&upper_ctr.to_le_bytes());

            match spec.encryption {
                EncryptionType::AesCtr => {
                    let key = self.rights.map_or(TEST_KEY_AREA[2], |(_, title_key)| title_key);
                    ctr_crypt(&key, upper_ctr, start, &mut data);
                }
                EncryptionType::AesXts => {
                    let mut key = [0u8; 0x20];
                    key[..0x10].copy_from_slice(&TEST_KEY_AREA[0]);
                    key[0x10..].copy_from_slice(&TEST_KEY_AREA[1]);
                    xts_encrypt(&key, 0, &mut data);
                }
                _ => {}
            }

            let entry = 0x240 + i * 0x10;
            let end = start + data.len() as u64;
            header[entry..entry + 4].copy_from_slice(&((start / 0x200) as u32).to_le_bytes());
            header[entry + 4..entry + 8].copy_from_slice(&((end / 0x200) as u32).to_le_bytes());
            let fs_hash = Sha256::digest(&header[fs..fs + 0x200]);
            header[0x280 + i * 0x20..0x2A0 + i * 0x20].copy_from_slice(&fs_hash);
            body.extend_from_slice(&data);
        }

        let magic: &[u8; 4] = match self.version {
            NcaVersion::Nca0 => b"NCA0",
            NcaVersion::Nca2 => b"NCA2",
            NcaVersion::Nca3 => b"NCA3",
        };
        header[0x200..0x204].copy_from_slice(magic);
        header[0x205] = self.content_type as u8;
        header[0x208..0x210].copy_from_slice(&((0xC00 + body.len()) as u64).to_le_bytes());
        header[0x210..0x218].copy_from_slice(&self.title_id.to_le_bytes());
        header[0x21C..0x220].copy_from_slice(&self.sdk_version.to_le_bytes());
        if let Some((rights_id, _)) = self.rights {
            header[0x230..0x240].copy_from_slice(&rights_id);
        }
        for (i, key) in TEST_KEY_AREA.iter().enumerate() {
            header[0x300 + i * 0x10..0x310 + i * 0x10].copy_from_slice(&encrypt_key(&TEST_KAEK, key));
        }

        encrypt_nca_header(&mut header, self.version);
        [header, body].concat()
    }
}

fn encrypt_nca_header(header: &mut [u8], version: NcaVersion) {
    match version {
        NcaVersion::Nca2 => {
            xts_encrypt(&TEST_HEADER_KEY, 0, &mut header[..0x400]);
            for fs_header in header[0x400..0xC00].chunks_exact_mut(0x200) {
                xts_encrypt(&TEST_HEADER_KEY, 0, fs_header);
            }
        }
        _ => xts_encrypt(&TEST_HEADER_KEY, 0, &mut header[..0xC00]),
    }
}

/// Decrypts an NCA3 header built by [`NcaBuilder`], applies `patch`, and re-encrypts it.
pub fn patch_nca_header(image: &mut [u8], patch: impl FnOnce(&mut [u8])) {
    let header = &mut image[..0xC00];
    crypto::xts_context(&TEST_HEADER_KEY).decrypt_area(header, 0x200, 0, crypto::get_nintendo_tweak);
    patch(header);
    encrypt_nca_header(header, NcaVersion::Nca3);
}

pub struct XciBuilder {
    rom_size: u8,
    partitions: Vec<(String, Vec<u8>)>,
}

impl XciBuilder {
    pub fn new() -> Self {
        Self {
            rom_size: 0xFA,
            partitions: Vec::new(),
        }
    }

    pub fn rom_size(mut self, code: u8) -> Self {
        self.rom_size = code;
        self
    }

    pub fn partition(mut self, name: &str, hfs0: Vec<u8>) -> Self {
        self.partitions.push((name.to_string(), hfs0));
        self
    }

    /// Trimmed layout: card header at 0, root HFS0 right after it at 0x200.
    pub fn build(self) -> Vec<u8> {
        let entries: Vec<(&str, &[u8])> = self
            .partitions
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        let (root, root_header_len) = build_partition(b"HFS0", true, &entries);

        let mut header = vec![0u8; 0x200];
        header[0x100..0x104].copy_from_slice(b"HEAD");
        header[0x104..0x108].copy_from_slice(&1u32.to_le_bytes());
        header[0x108..0x10C].copy_from_slice(&u32::MAX.to_le_bytes());
        header[0x10D] = self.rom_size;
        header[0x110..0x118].copy_from_slice(&0x1122334455667788u64.to_le_bytes());
        header[0x130..0x138].copy_from_slice(&0x200u64.to_le_bytes());
        header[0x138..0x140].copy_from_slice(&(root_header_len as u64).to_le_bytes());
        header[0x140..0x160].copy_from_slice(&Sha256::digest(&root[..root_header_len]));
        [header, root].concat()
    }
}
