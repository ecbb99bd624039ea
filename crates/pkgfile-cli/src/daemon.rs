//! pkgfiled: keep the pkgfile cache in sync with pacman's own sync DBs.
//!
//! Watches a directory of raw `.files` databases (normally
//! `/var/lib/pacman/sync`) and repacks any that appear or change into the
//! pkgfile cache directory, using the same repack primitive as
//! `pkgfile --update`. An initial sweep brings the cache up to date; after
//! that the watcher reacts to files renamed or written into place.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc;
use std::thread;
use std::time::{Instant, SystemTime};

use clap::Parser;
use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher as _};
use pkgfile_archive::{Compressor, repack_file};

#[derive(Parser)]
#[command(
    name = "pkgfiled",
    version,
    about = "watch pacman sync databases and repack them for pkgfile"
)]
struct Cli {
    /// repack all repos on initial sync
    #[arg(short, long)]
    force: bool,

    /// exit after initial sync
    #[arg(short, long)]
    oneshot: bool,

    /// directory holding pacman's sync databases
    watch_path: PathBuf,

    /// pkgfile cache directory to repack into
    cache_path: PathBuf,
}

fn has_files_ext(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "files")
}

fn needs_update(cache_file: &Path, source_mtime: SystemTime) -> bool {
    match fs::metadata(cache_file).and_then(|md| md.modified()) {
        Ok(cache_mtime) => cache_mtime < source_mtime,
        Err(_) => true,
    }
}

fn repack_one(source_path: &Path, cache_path: &Path) -> bool {
    let Some(file_name) = source_path.file_name() else {
        return false;
    };

    eprintln!("processing new files DB: {}", source_path.display());
    let started = Instant::now();

    let source = match File::open(source_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!(
                "failed to open {} for reading: {err}",
                source_path.display()
            );
            return false;
        }
    };

    let dest = cache_path.join(file_name);
    match repack_file(&source, &dest, Compressor::None) {
        Ok(()) => {
            eprintln!(
                "finished repacking {} ({:.3}s)",
                Path::new(file_name).display(),
                started.elapsed().as_secs_f64()
            );
            true
        }
        Err(err) => {
            eprintln!("failed to repack {}: {err}", Path::new(file_name).display());
            false
        }
    }
}

/// One pass over the watch directory, repacking everything stale. Repos
/// repack in parallel, one worker each.
fn sync(cli: &Cli, force: bool) -> bool {
    let entries = match fs::read_dir(&cli.watch_path) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("failed to read {}: {err}", cli.watch_path.display());
            return false;
        }
    };

    let mut stale = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() || !has_files_ext(&path) {
            continue;
        }

        if !force {
            let Ok(mtime) = entry.metadata().and_then(|md| md.modified()) else {
                continue;
            };
            let Some(file_name) = path.file_name() else {
                continue;
            };
            if !needs_update(&cli.cache_path.join(file_name), mtime) {
                continue;
            }
        }

        stale.push(path);
    }

    thread::scope(|scope| {
        let workers: Vec<_> = stale
            .iter()
            .map(|path| scope.spawn(move || repack_one(path, &cli.cache_path)))
            .collect();
        workers
            .into_iter()
            .all(|worker| worker.join().unwrap_or(false))
    })
}

fn watch(cli: &Cli) -> notify::Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx)?;
    watcher.watch(&cli.watch_path, RecursiveMode::NonRecursive)?;

    for event in rx {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                eprintln!("watch error: {err}");
                continue;
            }
        };

        // pacman renames freshly synced DBs into place; some mirrors of the
        // workflow write in place instead, so handle both.
        let relevant = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_) | ModifyKind::Data(_))
        );
        if !relevant {
            continue;
        }

        for path in &event.paths {
            if has_files_ext(path) {
                repack_one(path, &cli.cache_path);
            }
        }
    }

    Ok(())
}

fn run(cli: &Cli) -> i32 {
    if !sync(cli, cli.force) {
        // A failed initial sync is fatal in oneshot mode only; the watcher
        // can still pick up future changes.
        if cli.oneshot {
            return 1;
        }
    }

    if cli.oneshot {
        return 0;
    }

    match watch(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("failed to watch {}: {err}", cli.watch_path.display());
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    process::exit(run(&cli));
}
