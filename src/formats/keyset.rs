//! Named key material and title keys.
//!
//! A [`KeyStore`] holds everything NCA decryption needs: named keys loaded from
//! `prod.keys`/`dev.keys` style text (`name = hexvalue` per line), encrypted title keys
//! indexed by rights ID (`title.keys`), and an optional user title-key override.
//! Production and development keys live in separate stores.
//!
//! Stores are shared as `Arc<KeyStore>`; every setter takes `&self`, so keys can be
//! registered while containers opened with the same store are in use.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::{LazyLock, PoisonError, RwLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::crypto::{self, AesKey, AesXtsKey};
use crate::error::{Error, Result};
use crate::formats::nca::types::KeyAreaEncryptionKeyIndex;

pub type RightsId = [u8; 0x10];

/// Key name used for the NCA header XTS key.
pub const HEADER_KEY: &str = "header_key";

static KEY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9_]+)\s*=\s*([0-9A-Fa-f]+)\s*$").expect("key line pattern is valid")
});

#[derive(Default)]
struct KeyTables {
    keys: HashMap<String, Vec<u8>>,
    title_keys: HashMap<RightsId, AesKey>,
    user_title_key: Option<AesKey>,
}

#[derive(Default)]
pub struct KeyStore {
    tables: RwLock<KeyTables>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KeyStore")
            .field("keys", &tables.keys.len())
            .field("title_keys", &tables.title_keys.len())
            .field("user_title_key", &tables.user_title_key.is_some())
            .finish()
    }
}

fn to_aes_key(key: &[u8], what: &str) -> Result<AesKey> {
    key.try_into().map_err(|_| {
        Error::InvalidKey(format!("{what}: expected 16 bytes, got {}", key.len()))
    })
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from `name = hexvalue` text.
    pub fn from_keys_str(text: &str) -> Self {
        let store = Self::new();
        store.load_keys_str(text);
        store
    }

    /// Registers a named key. Names are case-insensitive; values must be 16 or 32 bytes.
    pub fn set_key(&self, name: &str, key: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidKey("empty key name".into()));
        }
        if key.len() != 0x10 && key.len() != 0x20 {
            return Err(Error::InvalidKey(format!(
                "{name}: expected 16 or 32 bytes, got {}",
                key.len()
            )));
        }
        self.write()
            .keys
            .insert(name.to_ascii_lowercase(), key.to_vec());
        Ok(())
    }

    pub fn key(&self, name: &str) -> Option<Vec<u8>> {
        self.read().keys.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.read().keys.contains_key(&name.to_ascii_lowercase())
    }

    /// Looks up a named 16-byte key.
    pub fn aes_key(&self, name: &str) -> Option<AesKey> {
        self.key(name).and_then(|key| key.try_into().ok())
    }

    pub fn header_key(&self) -> Option<AesXtsKey> {
        self.key(HEADER_KEY).and_then(|key| key.try_into().ok())
    }

    /// Registers an encrypted title key for a rights ID.
    pub fn set_titlekey(&self, rights_id: RightsId, encrypted_key: &[u8]) -> Result<()> {
        let key = to_aes_key(encrypted_key, "title key")?;
        self.write().title_keys.insert(rights_id, key);
        Ok(())
    }

    /// Sets an encrypted title key that takes precedence over the per-rights-ID table.
    pub fn set_user_titlekey(&self, encrypted_key: &[u8]) -> Result<()> {
        let key = to_aes_key(encrypted_key, "user title key")?;
        self.write().user_title_key = Some(key);
        Ok(())
    }

    pub fn remove_user_titlekey(&self) {
        self.write().user_title_key = None;
    }

    /// Encrypted title key for `rights_id`, honouring the user override.
    pub fn title_key(&self, rights_id: &RightsId) -> Option<AesKey> {
        let tables = self.read();
        tables
            .user_title_key
            .or_else(|| tables.title_keys.get(rights_id).copied())
    }

    pub fn title_key_count(&self) -> usize {
        self.read().title_keys.len()
    }

    /// Key area encryption key for `index` at `generation`.
    ///
    /// Falls back to deriving it from `key_area_key_*_source` and `master_key_XX` when the
    /// key itself isn't registered.
    pub fn key_area_key(&self, index: KeyAreaEncryptionKeyIndex, generation: u8) -> Result<AesKey> {
        let name = format!("key_area_key_{}_{generation:02x}", index.key_name());
        if let Some(key) = self.aes_key(&name) {
            return Ok(key);
        }

        let source = format!("key_area_key_{}_source", index.key_name());
        match self.derive_kek(&source, generation) {
            Some(key) => {
                debug!(key = %name, "Derived key area key from master key");
                Ok(key)
            }
            None => Err(Error::MissingAreaKey(name)),
        }
    }

    /// Title key encryption key for `generation`, derived from `master_key_XX` when absent.
    pub fn title_kek(&self, generation: u8) -> Result<AesKey> {
        let name = format!("titlekek_{generation:02x}");
        if let Some(key) = self.aes_key(&name) {
            return Ok(key);
        }

        let master_key = self.aes_key(&format!("master_key_{generation:02x}"));
        let source = self.aes_key("titlekek_source");
        match (master_key, source) {
            (Some(master_key), Some(source)) => {
                debug!(key = %name, "Derived title KEK from master key");
                Ok(crypto::decrypt_key(&master_key, &source))
            }
            _ => Err(Error::MissingAreaKey(name)),
        }
    }

    fn derive_kek(&self, source_name: &str, generation: u8) -> Option<AesKey> {
        let source = self.aes_key(source_name)?;
        let master_key = self.aes_key(&format!("master_key_{generation:02x}"))?;
        let kek_seed = self.aes_key("aes_kek_generation_source")?;
        let key_seed = self.aes_key("aes_key_generation_source")?;
        Some(crypto::generate_kek(&source, &master_key, &kek_seed, &key_seed))
    }

    /// Loads `name = hexvalue` lines. Blank and non-matching lines are skipped; returns the
    /// number of keys registered.
    pub fn load_keys_str(&self, text: &str) -> usize {
        let mut loaded = 0;
        for (line_num, line) in text.lines().enumerate() {
            let Some((name, value)) = parse_key_line(line) else {
                continue;
            };
            match self.set_key(name, &value) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping key at line {}: {}", line_num + 1, e),
            }
        }
        debug!("Loaded {} keys", loaded);
        loaded
    }

    /// Loads `rights_id = encrypted_title_key` lines.
    pub fn load_title_keys_str(&self, text: &str) -> usize {
        let mut loaded = 0;
        for (line_num, line) in text.lines().enumerate() {
            let Some((name, value)) = parse_key_line(line) else {
                continue;
            };
            let rights_id = match hex::decode(name).ok().and_then(|id| RightsId::try_from(id).ok())
            {
                Some(id) => id,
                None => {
                    warn!("Invalid rights ID at line {}: {}", line_num + 1, name);
                    continue;
                }
            };
            match self.set_titlekey(rights_id, &value) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping title key at line {}: {}", line_num + 1, e),
            }
        }
        debug!("Loaded {} title keys", loaded);
        loaded
    }

    pub fn load_keys_reader(&self, reader: impl Read) -> Result<usize> {
        let text = read_all_lines(reader)?;
        Ok(self.load_keys_str(&text))
    }

    pub fn load_title_keys_reader(&self, reader: impl Read) -> Result<usize> {
        let text = read_all_lines(reader)?;
        Ok(self.load_title_keys_str(&text))
    }

    /// Loads a `prod.keys`/`dev.keys` file from `path`.
    ///
    /// Convenience wrapper over [`load_keys_reader`](Self::load_keys_reader). The caller
    /// chooses the path; no default locations are searched.
    pub fn load_keys_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let count = self.load_keys_reader(File::open(path)?)?;
        info!("Loaded {} keys from {}", count, path.display());
        Ok(count)
    }

    /// Loads a `title.keys` file from `path`. See [`load_keys_file`](Self::load_keys_file).
    pub fn load_title_keys_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let count = self.load_title_keys_reader(File::open(path)?)?;
        info!("Loaded {} title keys from {}", count, path.display());
        Ok(count)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KeyTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, KeyTables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_key_line(line: &str) -> Option<(&str, Vec<u8>)> {
    let caps = KEY_LINE.captures(line)?;
    let name = caps.get(1)?.as_str();
    let value = hex::decode(caps.get(2)?.as_str()).ok()?;
    Some((name, value))
}

fn read_all_lines(reader: impl Read) -> Result<String> {
    let mut text = String::new();
    for line in BufReader::new(reader).lines() {
        text.push_str(&line?);
        text.push('\n');
    }
    Ok(text)
}
