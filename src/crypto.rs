//! AES primitives shared by the NCA reader and the key store.

use aes::Aes128;
use cipher::{BlockDecryptMut, KeyInit, generic_array::GenericArray};
use xts_mode::Xts128;

pub const AES_BLOCK_SIZE: usize = 0x10;

pub type AesKey = [u8; 0x10];
pub type AesXtsKey = [u8; 0x20];

type Aes128EcbDec = ecb::Decryptor<Aes128>;

/// Nintendo's XTS tweak: the sector index as a big-endian 128-bit integer.
pub fn get_nintendo_tweak(sector_index: u128) -> [u8; 0x10] {
    sector_index.to_be_bytes()
}

/// Builds an XTS context from a 32-byte key (data key followed by tweak key).
pub fn xts_context(key: &AesXtsKey) -> Xts128<Aes128> {
    let cipher_1 = Aes128::new(GenericArray::from_slice(&key[..0x10]));
    let cipher_2 = Aes128::new(GenericArray::from_slice(&key[0x10..]));
    Xts128::new(cipher_1, cipher_2)
}

/// Decrypts `data` in place with AES-128-ECB. Trailing bytes that don't fill a block
/// are left untouched.
pub fn ecb_decrypt(key: &AesKey, data: &mut [u8]) {
    let mut decryptor = Aes128EcbDec::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// ECB-decrypts a single 16-byte key with another.
pub fn decrypt_key(kek: &AesKey, source: &AesKey) -> AesKey {
    let mut out = *source;
    ecb_decrypt(kek, &mut out);
    out
}

/// Derives an access key from a key source and a master key.
///
/// `master_key` unwraps `kek_seed`, the result unwraps `source`, and that unwraps
/// `key_seed`.
pub fn generate_kek(
    source: &AesKey,
    master_key: &AesKey,
    kek_seed: &AesKey,
    key_seed: &AesKey,
) -> AesKey {
    let kek = decrypt_key(master_key, kek_seed);
    let src_kek = decrypt_key(&kek, source);
    decrypt_key(&src_kek, key_seed)
}

/// Counter block for the CTR section cipher at `offset` bytes from the archive start.
pub fn ctr_iv(upper_ctr: u64, offset: u64) -> [u8; 0x10] {
    (((upper_ctr as u128) << 64) | (offset >> 4) as u128).to_be_bytes()
}
