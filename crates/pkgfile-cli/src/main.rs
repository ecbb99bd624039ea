use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};

use pkgfile::config::PacmanConfig;
use pkgfile::{Config, FilterStyle, Mode, query, update};
use pkgfile_archive::Compressor;

#[derive(Parser)]
#[command(name = "pkgfile", version, about = "a pacman .files metadata explorer")]
struct Cli {
    /// list contents of a package
    #[arg(short = 'l', long, conflicts_with = "search")]
    list: bool,

    /// search for packages containing the target (default)
    #[arg(short = 's', long)]
    search: bool,

    /// update repo files lists; pass twice to force
    #[arg(short = 'u', long, action = ArgAction::Count)]
    update: u8,

    /// return only files contained in a bin dir
    #[arg(short = 'b', long)]
    binaries: bool,

    /// match directories in searches
    #[arg(short = 'd', long)]
    directories: bool,

    /// enable matching with glob characters
    #[arg(short = 'g', long, conflicts_with = "regex")]
    glob: bool,

    /// use case insensitive matching
    #[arg(short = 'i', long)]
    ignorecase: bool,

    /// search a singular repo
    #[arg(short = 'R', long, value_name = "REPO")]
    repo: Option<String>,

    /// enable matching with regular expressions
    #[arg(short = 'r', long)]
    regex: bool,

    /// output less when listing
    #[arg(short = 'q', long)]
    quiet: bool,

    /// output more
    #[arg(short = 'v', long)]
    verbose: bool,

    /// disable output justification
    #[arg(short = 'w', long)]
    raw: bool,

    /// null terminate output
    #[arg(short = '0', long = "null")]
    null: bool,

    /// compress downloaded repos
    #[arg(
        short = 'z',
        long,
        value_name = "TYPE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "gzip"
    )]
    compress: Option<Compressor>,

    /// use an alternate config
    #[arg(
        short = 'C',
        long,
        value_name = "FILE",
        default_value = "/etc/pacman.conf"
    )]
    config: PathBuf,

    /// use an alternate cachedir
    #[arg(
        short = 'D',
        long,
        value_name = "DIR",
        default_value = "/var/cache/pkgfile"
    )]
    cachedir: PathBuf,

    /// the package or filename to search for
    target: Option<String>,
}

fn run(cli: Cli) -> i32 {
    if cli.list && (cli.glob || cli.regex) {
        let flag = if cli.glob { "--glob" } else { "--regex" };
        eprintln!("error: {flag} cannot be used with --list");
        return 2;
    }

    let config = Config {
        mode: if cli.list { Mode::List } else { Mode::Search },
        filter_style: if cli.glob {
            FilterStyle::Glob
        } else if cli.regex {
            FilterStyle::Regex
        } else {
            FilterStyle::Exact
        },
        binaries: cli.binaries,
        directories: cli.directories,
        icase: cli.ignorecase,
        quiet: cli.quiet,
        verbose: cli.verbose,
        raw: cli.raw,
        eol: if cli.null { b'\0' } else { b'\n' },
        doupdate: cli.update,
        compress: cli.compress.unwrap_or_default(),
        cachedir: cli.cachedir,
        cfgfile: cli.config,
        targetrepo: cli.repo,
    };

    let pacman = match PacmanConfig::load(&config.cfgfile) {
        Ok(pacman) => pacman,
        Err(err) => {
            eprintln!("error: {err:#}");
            return 1;
        }
    };

    if pacman.repos.is_empty() {
        eprintln!("error: no repos found in {}", config.cfgfile.display());
        return 1;
    }

    if config.doupdate > 0 {
        return update::run(&config, &pacman);
    }

    let Some(target) = cli.target else {
        eprintln!("error: no target specified (use -h for help)");
        return 1;
    };

    let filter = match query::build_filter(&config, &target) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("error: {err:#}");
            return 1;
        }
    };

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let code = query::run(&config, &pacman.repos, &filter, &target, &mut out);
    if let Err(err) = out.flush() {
        eprintln!("error: failed to write results: {err}");
        return 1;
    }
    code
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    process::exit(run(cli));
}
