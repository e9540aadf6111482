use super::types::*;
use crate::crypto::{self, AesKey, AesXtsKey};
use crate::error::{Error, Result};
use crate::formats::keyset::KeyStore;

/// Resolves section keys for one NCA, decrypting the key area or title key at most once.
pub(crate) struct NcaKeyManagement<'a> {
    header: &'a NcaHeader,
    keys: &'a KeyStore,
    dec_key_area: Option<[AesKey; 4]>,
    dec_title_key: Option<AesKey>,
}

/// The key a section is opened with.
pub(crate) enum SectionKey {
    None,
    Xts(AesXtsKey),
    Ctr(AesKey),
}

impl<'a> NcaKeyManagement<'a> {
    pub fn new(header: &'a NcaHeader, keys: &'a KeyStore) -> Self {
        Self {
            header,
            keys,
            dec_key_area: None,
            dec_title_key: None,
        }
    }

    pub fn section_key(&mut self, crypto: SectionCrypto) -> Result<SectionKey> {
        Ok(match crypto {
            SectionCrypto::None => SectionKey::None,
            SectionCrypto::Xts => {
                let area = self.key_area()?;
                let mut key = [0u8; 0x20];
                key[..0x10].copy_from_slice(&area[0]);
                key[0x10..].copy_from_slice(&area[1]);
                SectionKey::Xts(key)
            }
            SectionCrypto::Ctr => SectionKey::Ctr(self.key_area()?[2]),
            SectionCrypto::CtrWithRightsId => SectionKey::Ctr(self.title_key()?),
            SectionCrypto::Unsupported(kind) => {
                return Err(Error::Unsupported(format!("section encryption {kind:?}")));
            }
        })
    }

    fn key_area(&mut self) -> Result<[AesKey; 4]> {
        if let Some(area) = self.dec_key_area {
            return Ok(area);
        }

        let key_gen = self.header.get_key_generation();
        let index = self.header.key_area_key_index();
        let kaek = self.keys.key_area_key(index, key_gen)?;
        tracing::trace!(key_gen = %key_gen, key_type = ?index, "Key area key obtained");

        let mut area = self.header.key_area;
        for key in area.iter_mut() {
            crypto::ecb_decrypt(&kaek, key);
        }
        tracing::trace!("Key area decrypted");

        self.dec_key_area = Some(area);
        Ok(area)
    }

    fn title_key(&mut self) -> Result<AesKey> {
        if let Some(key) = self.dec_title_key {
            return Ok(key);
        }

        let rights_id_hex = hex::encode_upper(self.header.rights_id);
        tracing::trace!(rights_id = %rights_id_hex, "NCA requires title key");

        let enc_key = self
            .keys
            .title_key(&self.header.rights_id)
            .ok_or_else(|| Error::MissingTitleKey(rights_id_hex))?;

        let key_gen = self.header.get_key_generation();
        let title_kek = self.keys.title_kek(key_gen)?;
        tracing::trace!(key_gen = %key_gen, "Title KEK obtained");

        let key = crypto::decrypt_key(&title_kek, &enc_key);
        self.dec_title_key = Some(key);
        Ok(key)
    }
}
