//! Archive plumbing for pkgfile.
//!
//! The upstream files databases are (usually gzipped) tar archives with one
//! `NAME-VERSION-REL/files` entry per package. The local cache is a cpio-newc
//! archive, optionally compressed, with one entry per package named
//! `NAME-VERSION-REL`. This crate owns both formats plus the streaming line
//! reader the scan paths share.

pub mod compress;
pub mod convert;
pub mod cpio;
pub mod entry;
pub mod line;

pub use compress::Compressor;
pub use convert::{RepackError, repack_file};
pub use cpio::{CpioReader, CpioWriter};
pub use entry::{BadEntryName, PackageRef, parse_pkgname};
pub use line::{LineError, LineReader, MAX_LINE_SIZE};
