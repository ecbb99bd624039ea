//! Repacking a downloaded files database into the cache format.
//!
//! Upstream databases are tars of `NAME-VERSION-REL/files` text blobs; the
//! cache wants one cpio entry per package with absolute paths and no
//! `%FILES%` header. The rewrite happens into a `~`-suffixed sibling of the
//! destination which is renamed over it only on success, so readers always
//! see either the old cache or the new one.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::compress::{self, Compressor};
use crate::cpio::{CpioWriter, EntryMeta};
use crate::line::{LineError, LineReader};

#[derive(Debug, thiserror::Error)]
pub enum RepackError {
    #[error("failed to read files database: {0}")]
    Read(#[source] io::Error),
    #[error("failed to create {}: {}", path.display(), source)]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to write entry {name}: {source}")]
    WriteEntry { name: String, source: io::Error },
    #[error("failed to finalize {}: {}", path.display(), source)]
    Finalize { path: PathBuf, source: io::Error },
}

/// Rewrites the files database in `source` into a cache archive at `dest`.
///
/// `source` is read from the beginning regardless of its current position.
/// On any failure the temporary output is unlinked and an existing `dest`
/// is left untouched.
pub fn repack_file(source: &File, dest: &Path, compressor: Compressor) -> Result<(), RepackError> {
    let tmp = tmp_path(dest);

    let outcome = rewrite(source, &tmp, compressor).and_then(|()| finalize(source, &tmp, dest));

    if outcome.is_err()
        && let Err(err) = fs::remove_file(&tmp)
        && err.kind() != io::ErrorKind::NotFound
    {
        log::warn!("failed to remove temporary file {}: {err}", tmp.display());
    }

    outcome
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut path = dest.as_os_str().to_os_string();
    path.push("~");
    PathBuf::from(path)
}

fn rewrite(source: &File, tmp: &Path, compressor: Compressor) -> Result<(), RepackError> {
    let mut src = source;
    src.seek(SeekFrom::Start(0)).map_err(RepackError::Read)?;
    let decoded = compress::decompress(BufReader::new(src)).map_err(RepackError::Read)?;
    let mut archive = tar::Archive::new(decoded);

    let create_err = |source| RepackError::Create {
        path: tmp.to_owned(),
        source,
    };
    let out = File::create(tmp).map_err(create_err)?;
    let encoder = compressor.encoder(BufWriter::new(out)).map_err(create_err)?;
    let mut writer = CpioWriter::new(encoder);

    for entry in archive.entries().map_err(RepackError::Read)? {
        let mut entry = entry.map_err(RepackError::Read)?;
        // Everything but the per-package files metadata is ignored.
        let Some(pkgdir) = files_entry_pkgdir(&entry) else {
            continue;
        };

        let header = entry.header();
        let meta = EntryMeta {
            mode: 0o100_000 | (header.mode().unwrap_or(0o644) & 0o7777),
            uid: u32::try_from(header.uid().unwrap_or(0)).unwrap_or(0),
            gid: u32::try_from(header.gid().unwrap_or(0)).unwrap_or(0),
            mtime: header.mtime().unwrap_or(0),
        };

        match rewrite_entry(&mut entry) {
            Ok(body) => writer
                .write_entry(&pkgdir, &meta, &body)
                .map_err(|source| RepackError::WriteEntry {
                    name: pkgdir,
                    source,
                })?,
            Err(LineError::TooLong { limit }) => {
                log::warn!("skipping {pkgdir}: file list line exceeds {limit} bytes");
            }
            Err(LineError::Io(err)) => return Err(RepackError::Read(err)),
        }
    }

    let finalize_err = |source| RepackError::Finalize {
        path: tmp.to_owned(),
        source,
    };
    writer
        .finish()
        .map_err(finalize_err)?
        .finish()
        .map_err(finalize_err)?
        .into_inner()
        .map_err(|e| finalize_err(e.into_error()))?;

    Ok(())
}

/// Returns the `NAME-VERSION-REL` directory for a `.../files` entry, or
/// `None` for anything else (`desc` entries, directories, oddities).
fn files_entry_pkgdir<R: Read>(entry: &tar::Entry<'_, R>) -> Option<String> {
    let path = entry.path().ok()?;
    if path.file_name() != Some(std::ffi::OsStr::new("files")) {
        return None;
    }
    let dir = path.parent()?;
    if dir.as_os_str().is_empty() {
        return None;
    }
    Some(dir.to_str()?.to_owned())
}

/// Rebuilds one entry body: the `%FILES%` header line is dropped and every
/// remaining non-empty line gains a leading slash.
fn rewrite_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Vec<u8>, LineError> {
    let mut lines = LineReader::new(BufReader::new(entry));
    let mut body = Vec::new();
    let mut first = true;

    while let Some(line) = lines.next_line()? {
        if first {
            first = false;
            continue;
        }
        if line.is_empty() {
            continue;
        }
        body.push(b'/');
        body.extend_from_slice(line);
        body.push(b'\n');
    }

    Ok(body)
}

fn finalize(source: &File, tmp: &Path, dest: &Path) -> Result<(), RepackError> {
    match source.metadata() {
        Ok(md) => {
            let atime = FileTime::from_last_access_time(&md);
            let mtime = FileTime::from_last_modification_time(&md);
            if let Err(err) = filetime::set_file_times(tmp, atime, mtime) {
                log::warn!("failed to set file times on {}: {err}", tmp.display());
            }
        }
        Err(err) => log::warn!("failed to stat files database: {err}"),
    }

    fs::rename(tmp, dest).map_err(|source| RepackError::Finalize {
        path: dest.to_owned(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::cpio::CpioReader;

    fn files_body(paths: &[&str]) -> Vec<u8> {
        let mut body = b"%FILES%\n".to_vec();
        for path in paths {
            body.extend_from_slice(path.as_bytes());
            body.push(b'\n');
        }
        body
    }

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzipped(data: &[u8]) -> Vec<u8> {
        let mut enc = Compressor::Gzip.encoder(Vec::new()).unwrap();
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn write_source(dir: &Path, bytes: &[u8]) -> File {
        let path = dir.join("core.files.raw");
        fs::write(&path, bytes).unwrap();
        File::open(path).unwrap()
    }

    fn read_cache(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let decoded = compress::decompress(BufReader::new(file)).unwrap();
        let mut reader = CpioReader::new(BufReader::new(decoded));
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            entries.push((entry.name, body));
        }
        entries
    }

    #[test]
    fn rewrites_files_entries_into_cpio() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_with(&[
            (
                "bash-5.2.037-1/files",
                &files_body(&["usr/", "usr/bin/", "usr/bin/bash"]),
            ),
            ("bash-5.2.037-1/desc", b"%NAME%\nbash\n"),
            (
                "tzdata-2024a-1/files",
                &files_body(&["usr/share/zoneinfo/UTC"]),
            ),
        ]);
        let source = write_source(dir.path(), &gzipped(&tar));
        let dest = dir.path().join("core.files");

        repack_file(&source, &dest, Compressor::None).unwrap();

        let entries = read_cache(&dest);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "bash-5.2.037-1");
        assert_eq!(
            entries[0].1,
            b"/usr/\n/usr/bin/\n/usr/bin/bash\n".to_vec()
        );
        assert_eq!(entries[1].0, "tzdata-2024a-1");
        assert_eq!(entries[1].1, b"/usr/share/zoneinfo/UTC\n".to_vec());
    }

    #[test]
    fn cache_entries_have_no_slash_and_no_files_header() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_with(&[(
            "gzip-1.13-3/files",
            &files_body(&["usr/bin/gzip", "usr/share/man/man1/gzip.1.gz"]),
        )]);
        let source = write_source(dir.path(), &gzipped(&tar));
        let dest = dir.path().join("core.files");

        repack_file(&source, &dest, Compressor::Gzip).unwrap();

        for (name, body) in read_cache(&dest) {
            assert!(!name.contains('/'), "entry name {name} contains a slash");
            for line in body.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
                assert_ne!(line, b"%FILES%");
                assert_eq!(line[0], b'/', "line must be absolute: {line:?}");
            }
        }
    }

    #[test]
    fn source_times_are_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_with(&[("pkg-1.0-1/files", &files_body(&["usr/bin/pkg"]))]);
        let source_path = dir.path().join("core.files.raw");
        fs::write(&source_path, gzipped(&tar)).unwrap();
        let stamp = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_times(&source_path, stamp, stamp).unwrap();
        let source = File::open(&source_path).unwrap();
        let dest = dir.path().join("core.files");

        repack_file(&source, &dest, Compressor::None).unwrap();

        let md = fs::metadata(&dest).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&md), stamp);
    }

    #[test]
    fn failed_repack_leaves_the_old_cache_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("core.files");
        fs::write(&dest, b"previous cache contents").unwrap();

        let source = write_source(dir.path(), b"this is not a tar archive, not even close");
        let err = repack_file(&source, &dest, Compressor::None);

        assert!(err.is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"previous cache contents");
        assert!(!dir.path().join("core.files~").exists());
    }
}
