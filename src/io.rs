//! Byte-range views over shared storage.
//!
//! Every container in this crate is parsed from a [`ByteView`]: a bounds-checked,
//! seekable window into some [`Storage`]. Views are cheap to clone (each clone gets
//! its own cursor) and sub-views address the root storage directly, so a file nested
//! several containers deep is never copied out of its parent.
//!
//! Decrypting storages ([`CtrStorage`], [`XtsStorage`]) wrap a parent view and apply
//! the cipher transform on every read, which lets NCA sections be handed out as
//! ordinary views.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cipher::{KeyIvInit, StreamCipher};

use crate::crypto::{self, AES_BLOCK_SIZE, AesKey, AesXtsKey};
use crate::error::{Error, Result};

/// Function to align down to a power-of-two boundary
pub const fn align_down(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    value & !inv_mask
}

/// Function to align up to a power-of-two boundary
pub const fn align_up(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    (value + inv_mask) & !inv_mask
}

/// Trait that combines Read and Seek
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Backing store for one or more [`ByteView`]s.
///
/// Implementations must support positioned access from several threads at once, either
/// natively or by serializing internally. Callers only ever request ranges inside
/// `[0, len())`; [`ByteView`] does the bounds checking.
pub trait Storage: Send + Sync {
    /// Total length of the storage in bytes.
    fn len(&self) -> u64;

    /// Fills `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let _ = (offset, buf);
        Err(Error::Unsupported("storage is read-only".into()))
    }

    /// Offset of this storage's byte 0 within the root storage.
    fn parent_offset(&self) -> u64 {
        0
    }
}

/// A shared reader that can be used by multiple consumers
///
/// Positioned reads lock the inner reader, seek, and read, so any `Read + Seek`
/// source (a `File`, a `Cursor`, ...) can back concurrently-used views.
pub struct SharedReader<R: ReadSeek + Send> {
    inner: Mutex<R>,
    len: u64,
}

impl<R: ReadSeek + Send> SharedReader<R> {
    /// Create a new SharedReader, measuring the reader's length once.
    pub fn new(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner: Mutex::new(reader),
            len,
        })
    }
}

impl<R: ReadSeek + Send> Storage for SharedReader<R> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reader.seek(SeekFrom::Start(offset))?;
        reader
            .read_exact(buf)
            .map_err(|e| Error::from_table_read(e, "read"))
    }
}

/// In-memory storage. The only backend that accepts writes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }
}

impl Storage for MemoryStorage {
    fn len(&self) -> u64 {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        let src = data
            .get(start..start + buf.len())
            .ok_or(Error::OutOfBounds {
                offset,
                len: buf.len() as u64,
                size: data.len() as u64,
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let size = data.len() as u64;
        let start = offset as usize;
        let dst = data
            .get_mut(start..start + buf.len())
            .ok_or(Error::OutOfBounds {
                offset,
                len: buf.len() as u64,
                size,
            })?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

/// A bounds-checked, seekable window over a [`Storage`].
///
/// Cloning produces a view with an independent cursor over the same storage and
/// origin. The inherent [`read`](ByteView::read)/[`write`](ByteView::write) methods
/// are strict: an access crossing the end of the view fails with
/// [`Error::OutOfBounds`]. The `std::io::Read` impl follows the usual short-read
/// contract instead, so the view can be handed to `binrw` and `read_to_end`.
#[derive(Clone)]
pub struct ByteView {
    storage: Arc<dyn Storage>,
    origin: u64,
    len: u64,
    pos: u64,
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteView")
            .field("origin", &self.origin)
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("parent_offset", &self.parent_offset())
            .finish()
    }
}

impl ByteView {
    /// Creates a view covering the whole of `storage`.
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self::from_shared(Arc::new(storage))
    }

    pub fn from_shared(storage: Arc<dyn Storage>) -> Self {
        let len = storage.len();
        Self {
            storage,
            origin: 0,
            len,
            pos: 0,
        }
    }

    /// Creates a view over an in-memory buffer.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(MemoryStorage::new(data.into()))
    }

    /// Creates a view over any `Read + Seek` source, e.g. a `std::fs::File`.
    pub fn from_reader<R: ReadSeek + Send + 'static>(reader: R) -> Result<Self> {
        Ok(Self::new(SharedReader::new(reader)?))
    }

    /// Returns a view of `len` bytes starting at `offset` within this view.
    pub fn sub_view(&self, offset: u64, len: u64) -> Result<ByteView> {
        self.check_bounds(offset, len)?;
        Ok(Self {
            storage: Arc::clone(&self.storage),
            origin: self.origin + offset,
            len,
            pos: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Offset of this view's byte 0 in the root storage, summed across every level of
    /// nesting (including views handed out by decrypting storages).
    pub fn parent_offset(&self) -> u64 {
        self.origin + self.storage.parent_offset()
    }

    /// Reads exactly `buf.len()` bytes at the cursor and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_at(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    /// Writes all of `buf` at the cursor and advances it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_bounds(self.pos, buf.len() as u64)?;
        self.storage.write_at(self.origin + self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    /// Moves the cursor. Positions past the end of the view are rejected.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(target) if target <= self.len => {
                self.pos = target;
                Ok(target)
            }
            _ => Err(Error::OutOfBounds {
                offset: target.unwrap_or(u64::MAX),
                len: 0,
                size: self.len,
            }),
        }
    }

    /// Positioned read that leaves the cursor untouched.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.storage.read_at(self.origin + offset, buf)
    }

    pub fn read_vec_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let mut buf = vec![0u8; len as usize];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads the whole view into memory.
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        self.read_vec_at(0, self.len)
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }
}

impl Read for ByteView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.read_at(self.pos, &mut buf[..n])
            .map_err(|e| match e {
                Error::Io(e) => e,
                other => io::Error::other(other),
            })?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ByteView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        ByteView::seek(self, pos).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot seek outside of the byte view",
            )
        })
    }
}

/// AES-128-CTR storage that decrypts data as it's read
///
/// The counter is the section's upper nonce followed by the absolute offset within the
/// archive divided by the AES block size, so `base` must be the whole archive view.
pub struct CtrStorage {
    base: ByteView,
    start: u64,
    len: u64,
    key: AesKey,
    upper_ctr: u64,
}

impl CtrStorage {
    pub fn new(base: ByteView, start: u64, len: u64, key: AesKey, upper_ctr: u64) -> Result<Self> {
        base.check_bounds(start, len)?;
        Ok(Self {
            base,
            start,
            len,
            key,
            upper_ctr,
        })
    }
}

impl Storage for CtrStorage {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let abs = self.start + offset;
        let aligned = align_down(abs, AES_BLOCK_SIZE as u64);
        let diff = (abs - aligned) as usize;

        let mut raw = self.base.read_vec_at(aligned, (diff + buf.len()) as u64)?;
        let iv = crypto::ctr_iv(self.upper_ctr, aligned);
        let mut ctr = ctr::Ctr128BE::<aes::Aes128>::new(&self.key.into(), &iv.into());
        ctr.apply_keystream(&mut raw);

        buf.copy_from_slice(&raw[diff..]);
        Ok(())
    }

    fn parent_offset(&self) -> u64 {
        self.base.parent_offset() + self.start
    }
}

/// AES-128-XTS storage with Nintendo's big-endian tweak.
///
/// Sector numbers count from `section_start`; `data_offset` locates the exposed region
/// inside the section.
pub struct XtsStorage {
    base: ByteView,
    section_start: u64,
    section_len: u64,
    data_offset: u64,
    len: u64,
    key: AesXtsKey,
}

impl XtsStorage {
    pub const SECTOR_SIZE: u64 = 0x200;

    pub fn new(
        base: ByteView,
        section_start: u64,
        section_len: u64,
        data_offset: u64,
        len: u64,
        key: AesXtsKey,
    ) -> Result<Self> {
        base.check_bounds(section_start, section_len)?;
        match data_offset.checked_add(len) {
            Some(end) if end <= section_len => {}
            _ => {
                return Err(Error::InvalidData(format!(
                    "XTS data region {data_offset:#x}+{len:#x} exceeds section of {section_len:#x} bytes"
                )));
            }
        }
        Ok(Self {
            base,
            section_start,
            section_len,
            data_offset,
            len,
            key,
        })
    }
}

impl Storage for XtsStorage {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let rel = self.data_offset + offset;
        let first_sector = rel / Self::SECTOR_SIZE;
        let aligned = first_sector * Self::SECTOR_SIZE;
        let end = align_up(rel + buf.len() as u64, Self::SECTOR_SIZE).min(self.section_len);

        let mut raw = self
            .base
            .read_vec_at(self.section_start + aligned, end - aligned)?;
        crypto::xts_context(&self.key).decrypt_area(
            &mut raw,
            Self::SECTOR_SIZE as usize,
            first_sector as u128,
            crypto::get_nintendo_tweak,
        );

        let skip = (rel - aligned) as usize;
        buf.copy_from_slice(&raw[skip..skip + buf.len()]);
        Ok(())
    }

    fn parent_offset(&self) -> u64 {
        self.base.parent_offset() + self.section_start + self.data_offset
    }
}
