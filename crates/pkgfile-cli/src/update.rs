//! Updating the cache: download every repo's files database and repack it.
//!
//! One worker per repo downloads with server failover and conditional GET;
//! the moment a transfer lands, the repack of that repo is handed to its
//! own thread so no other repo's download waits on it. Cache files are
//! only ever replaced by the repack's atomic rename, so a failure at any
//! point leaves the previous cache intact.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use filetime::FileTime;
use pkgfile_archive::repack_file;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED};

use crate::Config;
use crate::config::{PacmanConfig, Repo, prepare_url};
use crate::progress;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Fetch {
    Done { file: File, size: u64 },
    UpToDate,
    Failed,
}

enum Outcome {
    Downloaded(u64),
    UpToDate,
    Failed,
}

/// Runs the full update. Returns the process exit code.
pub fn run(config: &Config, pacman: &PacmanConfig) -> i32 {
    if let Err(err) = ensure_writable(&config.cachedir) {
        eprintln!(
            "error: unable to write to {}: {err}",
            config.cachedir.display()
        );
        return 1;
    }

    println!(":: Updating {} repos...", pacman.repos.len());

    let client = match Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("pkgfile/v", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: failed to initialize HTTP client: {err}");
            return 1;
        }
    };

    let arch = pacman
        .architecture
        .clone()
        .unwrap_or_else(|| std::env::consts::ARCH.to_owned());
    let force = config.doupdate > 1;
    let remaining = AtomicUsize::new(pacman.repos.len());
    let started = Instant::now();

    thread::scope(|scope| {
        let workers: Vec<_> = pacman
            .repos
            .iter()
            .map(|repo| {
                let (client, arch, remaining) = (&client, arch.as_str(), &remaining);
                scope.spawn(move || {
                    let dest = config.cachedir.join(format!("{}.files", repo.name));
                    match fetch_repo(client, repo, arch, &dest, force, remaining) {
                        Fetch::Done { file, size } => {
                            let name = repo.name.clone();
                            let compress = config.compress;
                            let repack = scope
                                .spawn(move || repack_worker(&name, &file, &dest, compress));
                            (Outcome::Downloaded(size), Some(repack))
                        }
                        Fetch::UpToDate => (Outcome::UpToDate, None),
                        Fetch::Failed => (Outcome::Failed, None),
                    }
                })
            })
            .collect();

        let mut ret = 0;
        let mut xfer_count = 0;
        let mut total_xfer = 0;
        let mut repacks = Vec::new();

        for worker in workers {
            match worker.join() {
                Ok((outcome, repack)) => {
                    match outcome {
                        Outcome::Downloaded(size) => {
                            xfer_count += 1;
                            total_xfer += size;
                        }
                        Outcome::UpToDate => {}
                        Outcome::Failed => ret = 1,
                    }
                    repacks.extend(repack);
                }
                Err(_) => {
                    eprintln!("error: download worker panicked");
                    ret = 1;
                }
            }
        }

        if xfer_count > 0 {
            progress::print_total_download_stats(xfer_count, started.elapsed(), total_xfer);
        }

        let pending = repacks.iter().filter(|r| !r.is_finished()).count();
        if pending > 0 {
            println!(
                ":: waiting for {pending} process{} to finish repacking repos...",
                if pending == 1 { "" } else { "es" }
            );
        }

        for repack in repacks {
            match repack.join() {
                Ok(true) => {}
                Ok(false) => ret = 1,
                Err(_) => {
                    eprintln!("error: repack worker panicked");
                    ret = 1;
                }
            }
        }

        ret
    })
}

fn ensure_writable(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    tempfile::tempfile_in(dir).map(|_| ())
}

/// Downloads one repo's files database, walking its server list in order.
/// On success the unlinked temp file holds the body, stamped with the
/// server's `Last-Modified` time so the repack can propagate it.
fn fetch_repo(
    client: &Client,
    repo: &Repo,
    arch: &str,
    dest: &Path,
    force: bool,
    remaining: &AtomicUsize,
) -> Fetch {
    let finish = || remaining.fetch_sub(1, Ordering::SeqCst);

    if repo.servers.is_empty() {
        eprintln!("error: no servers configured for repo {}", repo.name);
        finish();
        return Fetch::Failed;
    }

    let mut tmpfile = match tempfile::tempfile() {
        Ok(file) => file,
        Err(err) => {
            eprintln!("error: failed to create temporary file for download: {err}");
            finish();
            return Fetch::Failed;
        }
    };

    let if_modified_since = if force { None } else { cache_mtime_header(dest) };

    for server in &repo.servers {
        let url = prepare_url(server, &repo.name, arch);

        // A previous server may have left partial data behind.
        if let Err(err) = reset(&mut tmpfile) {
            eprintln!("error: failed to truncate download file: {err}");
            finish();
            return Fetch::Failed;
        }

        let mut request = client.get(&url);
        if let Some(date) = if_modified_since.clone() {
            request = request.header(IF_MODIFIED_SINCE, date);
        }

        let started = Instant::now();
        let mut response = match request.send() {
            Ok(response) => response,
            Err(err) => {
                eprintln!("warning: download failed: {url}: {err}");
                continue;
            }
        };

        if response.status() == StatusCode::NOT_MODIFIED {
            println!("  {} is up to date", repo.name);
            finish();
            return Fetch::UpToDate;
        }

        if !response.status().is_success() {
            eprintln!(
                "warning: download failed: {url} [error {}]",
                response.status().as_u16()
            );
            continue;
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);

        let size = match response.copy_to(&mut tmpfile) {
            Ok(size) => size,
            Err(err) => {
                eprintln!("warning: download failed: {url}: {err}");
                continue;
            }
        };

        if let Some(stamp) = last_modified {
            stamp_download_time(&tmpfile, &stamp);
        }

        let left = finish().saturating_sub(1);
        progress::print_download_success(&repo.name, size, started.elapsed(), left);
        return Fetch::Done {
            file: tmpfile,
            size,
        };
    }

    eprintln!("error: failed to update repo: {}", repo.name);
    finish();
    Fetch::Failed
}

fn repack_worker(name: &str, source: &File, dest: &Path, compress: pkgfile_archive::Compressor) -> bool {
    match repack_file(source, dest, compress) {
        Ok(()) => true,
        Err(err) => {
            eprintln!("error: failed to repack {name}: {err}");
            false
        }
    }
}

fn reset(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// `If-Modified-Since` value from the cache file's mtime, if it exists.
fn cache_mtime_header(dest: &Path) -> Option<HeaderValue> {
    let mtime = fs::metadata(dest).and_then(|md| md.modified()).ok()?;
    http_date(mtime)
}

fn http_date(time: SystemTime) -> Option<HeaderValue> {
    let formatted = chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    HeaderValue::from_str(&formatted).ok()
}

/// Sets the temp file's times to the server's `Last-Modified` so that the
/// finished cache carries the upstream mtime and the next run's
/// conditional GET compares against it.
fn stamp_download_time(file: &File, last_modified: &str) {
    let Ok(parsed) = chrono::DateTime::parse_from_rfc2822(last_modified) else {
        log::debug!("unparseable Last-Modified header: {last_modified}");
        return;
    };

    let stamp = FileTime::from_system_time(parsed.into());
    if let Err(err) = filetime::set_file_handle_times(file, Some(stamp), Some(stamp)) {
        log::warn!("failed to set download file times: {err}");
    }
}
