//! Lazily-parsed, seekable views into Nintendo Switch containers.
//!
//! Everything starts from a [`ByteView`] over a file or buffer. Containers (PFS0/NSP,
//! HFS0, RomFS, NCA, XCI) wrap a view, parse their tables on first use, and hand out
//! further views for their entries, so a file several containers deep is read straight
//! from the original storage. NCA sections are decrypted on the fly with keys from a
//! shared [`KeyStore`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use nx_vfs::{ByteView, KeyStore, VirtualFs, formats::{Container, open_match}};
//!
//! # fn main() -> nx_vfs::Result<()> {
//! let keys = Arc::new(KeyStore::new());
//! keys.load_keys_file("prod.keys")?;
//!
//! let view = ByteView::from_reader(std::fs::File::open("game.xci")?)?;
//! if let Container::Xci(mut xci) = open_match(&view, &keys)? {
//!     for name in xci.get_partition("secure")?.list_files()? {
//!         println!("{name}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod formats;
pub mod io;
pub mod util;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{Error, Result};
pub use formats::{Container, Format, KeyStore, open_match};
pub use io::{ByteView, MemoryStorage, ReadSeek, SharedReader, Storage};
pub use util::{FileEntryExt, ParseState, VirtualFs};
