//! The query engine: scan cached archives with a compiled filter.
//!
//! Every repo gets its own worker. A worker memory-maps the repo's cache
//! file, walks the cpio entries and streams matching lines into a
//! [`ResultSet`]; results are only printed after all workers have joined,
//! in configured repo order.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::thread;

use memmap2::Mmap;
use pkgfile_archive::compress::decompress;
use pkgfile_archive::{CpioReader, LineError, LineReader, PackageRef, parse_pkgname};
use pkgfile_filter::Filter;

use crate::config::Repo;
use crate::result::ResultSet;
use crate::{Config, FilterStyle, Mode};

/// Scan output for one repo. `cache_found` distinguishes "no matches" from
/// "no cache file": a missing cache is skipped silently unless every repo
/// is missing one.
pub struct RepoScan {
    pub set: ResultSet,
    pub cache_found: bool,
}

/// Compiles the command-line target into the filter the scan workers share.
///
/// In search mode the pattern is wrapped with the directory policy (and the
/// binary policy when `-b` is given); in list mode the bare pattern matches
/// package names and any policy is applied per line instead.
pub fn build_filter(config: &Config, target: &str) -> anyhow::Result<Filter> {
    let case_sensitive = !config.icase;

    let mut filter = match config.filter_style {
        FilterStyle::Exact => match config.mode {
            Mode::Search => {
                if target.contains('/') {
                    Filter::exact(target, case_sensitive)
                } else {
                    Filter::basename(target, case_sensitive)
                }
            }
            Mode::List => {
                let pattern = target.split_once('/').map_or(target, |(_, rest)| rest);
                Filter::exact(pattern, case_sensitive)
            }
        },
        FilterStyle::Glob => Filter::glob(target, case_sensitive)?,
        FilterStyle::Regex => Filter::regex(target, case_sensitive)?,
    };

    if config.mode == Mode::Search {
        if config.binaries {
            filter = Filter::and(Filter::Bin, filter);
        }
        let dir_filter = if config.directories {
            Filter::Directory
        } else {
            Filter::not(Filter::Directory)
        };
        filter = Filter::and(dir_filter, filter);
    }

    Ok(filter)
}

/// Runs the query and prints results to `out`. Returns the process exit
/// code: 0 when at least one line was printed.
pub fn run(
    config: &Config,
    repos: &[Repo],
    filter: &Filter,
    target: &str,
    out: &mut impl Write,
) -> i32 {
    let single_repo =
        config.targetrepo.is_some() || (config.mode == Mode::List && target.contains('/'));

    if single_repo {
        search_single_repo(config, repos, filter, target, out)
    } else {
        search_all_and_print(config, repos, filter, out)
    }
}

fn search_single_repo(
    config: &Config,
    repos: &[Repo],
    filter: &Filter,
    target: &str,
    out: &mut impl Write,
) -> i32 {
    let wanted = config
        .targetrepo
        .as_deref()
        .unwrap_or_else(|| target.split('/').next().unwrap_or(target));

    let Some(repo) = repos.iter().find(|r| r.name == wanted) else {
        eprintln!("error: repo not available: {wanted}");
        return 1;
    };

    let mut scan = load_repo(config, filter, &repo.name);
    let prefix_len = if config.raw {
        0
    } else {
        scan.set.max_prefix_len()
    };

    match scan.set.print(out, prefix_len, config.eol) {
        Ok(printed) => i32::from(printed == 0),
        Err(err) => {
            eprintln!("error: failed to write results: {err}");
            1
        }
    }
}

fn search_all_and_print(
    config: &Config,
    repos: &[Repo],
    filter: &Filter,
    out: &mut impl Write,
) -> i32 {
    let mut scans = search_all_repos(config, repos, filter);

    let prefix_len = if config.raw {
        0
    } else {
        scans.iter().map(|s| s.set.max_prefix_len()).max().unwrap_or(0)
    };

    let mut printed = 0;
    let mut repos_found = false;
    for scan in &mut scans {
        repos_found |= scan.cache_found;
        match scan.set.print(out, prefix_len, config.eol) {
            Ok(count) => printed += count,
            Err(err) => eprintln!("error: failed to write results: {err}"),
        }
    }

    if !repos_found {
        eprintln!("error: No repo files found. Please run `pkgfile --update'.");
    }

    i32::from(printed == 0)
}

/// Scans every repo concurrently, one worker per repo, and joins.
pub fn search_all_repos(config: &Config, repos: &[Repo], filter: &Filter) -> Vec<RepoScan> {
    thread::scope(|scope| {
        let handles: Vec<_> = repos
            .iter()
            .map(|repo| {
                let name = repo.name.as_str();
                scope.spawn(move || load_repo(config, filter, name))
            })
            .collect();

        handles
            .into_iter()
            .zip(repos)
            .map(|(handle, repo)| {
                handle.join().unwrap_or_else(|_| {
                    eprintln!("error: scan worker for repo {} panicked", repo.name);
                    RepoScan {
                        set: ResultSet::new(repo.name.as_str()),
                        cache_found: false,
                    }
                })
            })
            .collect()
    })
}

/// Opens, maps and scans one repo's cache file.
pub fn load_repo(config: &Config, filter: &Filter, repo_name: &str) -> RepoScan {
    let mut set = ResultSet::new(repo_name);
    let path = config.cachedir.join(format!("{repo_name}.files"));

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            // A missing cache just means the repo is absent from results.
            if err.kind() != io::ErrorKind::NotFound {
                eprintln!("error: failed to open repo: {}: {err}", path.display());
            }
            return RepoScan {
                set,
                cache_found: false,
            };
        }
    };

    // SAFETY: cache files are only ever replaced by an atomic rename, never
    // truncated or rewritten in place, so the mapping stays valid for the
    // duration of the scan.
    let data = match unsafe { Mmap::map(&file) } {
        Ok(map) => map,
        Err(err) => {
            eprintln!("error: failed to map pages for {}: {err}", path.display());
            return RepoScan {
                set,
                cache_found: true,
            };
        }
    };

    if let Err(err) = scan_archive(config, filter, repo_name, &data, &mut set) {
        eprintln!("error: failed to load repo: {}: {err}", path.display());
    }

    RepoScan {
        set,
        cache_found: true,
    }
}

fn scan_archive(
    config: &Config,
    filter: &Filter,
    repo_name: &str,
    data: &[u8],
    set: &mut ResultSet,
) -> anyhow::Result<()> {
    let decoded = decompress(data)?;
    let mut reader = CpioReader::new(BufReader::new(decoded));

    while let Some(entry) = reader.next_entry()? {
        let pkg = match parse_pkgname(&entry.name) {
            Ok(pkg) => pkg,
            Err(err) => {
                log::warn!("{repo_name}: {err}");
                continue;
            }
        };

        let keep_walking = match config.mode {
            Mode::Search => scan_search(config, filter, repo_name, pkg, &mut reader, set)?,
            Mode::List => scan_list(config, filter, repo_name, pkg, &mut reader, set)?,
        };
        if !keep_walking {
            break;
        }
    }

    Ok(())
}

fn scan_search<R: BufRead>(
    config: &Config,
    filter: &Filter,
    repo_name: &str,
    pkg: PackageRef<'_>,
    body: R,
    set: &mut ResultSet,
) -> anyhow::Result<bool> {
    let mut lines = LineReader::new(body);

    loop {
        match lines.next_line() {
            Ok(Some(line)) => {
                if line.is_empty() || !filter.matches(line) {
                    continue;
                }

                let (prefix, prefix_len) = search_prefix(config, repo_name, pkg);
                let entry = if config.verbose {
                    line.to_vec()
                } else {
                    Vec::new()
                };
                set.add(prefix, entry, prefix_len);

                // One hit per package unless every match is wanted.
                if !config.verbose {
                    break;
                }
            }
            Ok(None) => break,
            Err(LineError::TooLong { limit }) => {
                log::warn!(
                    "{repo_name}/{}: skipping rest of entry: line exceeds {limit} bytes",
                    pkg.name
                );
                break;
            }
            Err(LineError::Io(err)) => return Err(err.into()),
        }
    }

    Ok(true)
}

fn scan_list<R: BufRead>(
    config: &Config,
    filter: &Filter,
    repo_name: &str,
    pkg: PackageRef<'_>,
    body: R,
    set: &mut ResultSet,
) -> anyhow::Result<bool> {
    if !filter.matches(pkg.name.as_bytes()) {
        // Skip without touching the body; the walk skips it for us.
        return Ok(true);
    }

    let bin = Filter::Bin;
    let mut lines = LineReader::new(body);

    loop {
        match lines.next_line() {
            Ok(Some(line)) => {
                if line.is_empty() || (config.binaries && !bin.matches(line)) {
                    continue;
                }

                if config.quiet {
                    set.add(String::from_utf8_lossy(line).into_owned(), Vec::new(), 0);
                } else {
                    let prefix = format!("{repo_name}/{}", pkg.name);
                    let prefix_len = prefix.len();
                    set.add(prefix, line.to_vec(), prefix_len);
                }
            }
            Ok(None) => break,
            Err(LineError::TooLong { limit }) => {
                log::warn!(
                    "{repo_name}/{}: skipping rest of entry: line exceeds {limit} bytes",
                    pkg.name
                );
                break;
            }
            Err(LineError::Io(err)) => return Err(err.into()),
        }
    }

    // An exact match names a single package; any other filter may produce
    // further matches, so the walk must continue.
    Ok(config.filter_style != FilterStyle::Exact)
}

fn search_prefix(config: &Config, repo_name: &str, pkg: PackageRef<'_>) -> (String, usize) {
    if config.verbose {
        let prefix = format!("{repo_name}/{} {}", pkg.name, pkg.version);
        let len = prefix.len();
        (prefix, len)
    } else if config.quiet {
        (pkg.name.to_owned(), 0)
    } else {
        let prefix = format!("{repo_name}/{}", pkg.name);
        let len = prefix.len();
        (prefix, len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(mode: Mode, style: FilterStyle) -> Config {
        Config {
            mode,
            filter_style: style,
            ..Config::default()
        }
    }

    #[test]
    fn search_without_slash_matches_basenames() {
        let cfg = config(Mode::Search, FilterStyle::Exact);
        let filter = build_filter(&cfg, "bash").unwrap();

        assert!(filter.matches(b"/usr/bin/bash"));
        assert!(!filter.matches(b"/usr/bin/bash-completion"));
    }

    #[test]
    fn search_with_slash_matches_whole_lines() {
        let cfg = config(Mode::Search, FilterStyle::Exact);
        let filter = build_filter(&cfg, "/usr/bin/bash").unwrap();

        assert!(filter.matches(b"/usr/bin/bash"));
        assert!(!filter.matches(b"/usr/local/usr/bin/bash"));
    }

    #[test]
    fn search_excludes_directories_by_default() {
        let cfg = config(Mode::Search, FilterStyle::Exact);
        let filter = build_filter(&cfg, "/usr/share/man/").unwrap();

        // The pattern itself matches, but the directory policy rejects it.
        assert!(!filter.matches(b"/usr/share/man/"));
    }

    #[test]
    fn directories_flag_inverts_the_policy() {
        let cfg = Config {
            directories: true,
            ..config(Mode::Search, FilterStyle::Exact)
        };
        let filter = build_filter(&cfg, "/usr/share/man/").unwrap();
        assert!(filter.matches(b"/usr/share/man/"));

        let files_only = build_filter(
            &Config {
                directories: true,
                ..config(Mode::Search, FilterStyle::Exact)
            },
            "/usr/bin/ls",
        )
        .unwrap();
        assert!(!files_only.matches(b"/usr/bin/ls"));
    }

    #[test]
    fn binaries_flag_requires_a_bin_path() {
        let cfg = Config {
            binaries: true,
            ..config(Mode::Search, FilterStyle::Exact)
        };
        let filter = build_filter(&cfg, "gzip").unwrap();

        assert!(filter.matches(b"/usr/bin/gzip"));
        assert!(!filter.matches(b"/usr/share/gzip"));
    }

    #[test]
    fn list_target_with_repo_prefix_matches_the_package_part() {
        let cfg = config(Mode::List, FilterStyle::Exact);
        let filter = build_filter(&cfg, "core/gzip").unwrap();

        assert!(filter.matches(b"gzip"));
        assert!(!filter.matches(b"core/gzip"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let cfg = config(Mode::Search, FilterStyle::Regex);
        assert!(build_filter(&cfg, "*bad").is_err());
    }
}
