//! pacman.conf parsing, reduced to what pkgfile needs.
//!
//! The format is an INI dialect with repeated keys (`Server` appears once
//! per mirror) and an `Include` directive whose value is a shell glob of
//! further config files, so this is a small hand-rolled line parser rather
//! than a generic INI crate. Only `Server`, `Include` and the `[options]`
//! `Architecture` are interpreted; everything else is ignored.

use std::fs;
use std::path::Path;

use anyhow::Context as _;

/// One `[repo]` section: its name and mirror URL templates in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub name: String,
    pub servers: Vec<String>,
}

impl Repo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
        }
    }
}

/// Repositories in configured order plus the optional global architecture.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PacmanConfig {
    pub repos: Vec<Repo>,
    pub architecture: Option<String>,
}

impl PacmanConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let mut section = Section::None;
        parse_one_file(path, &mut section, &mut config)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(config)
    }
}

/// Parser state: sections persist across `Include` boundaries, so an
/// included file inherits (and may change) the including file's section.
enum Section {
    None,
    Options,
    Repo,
}

fn parse_one_file(
    path: &Path,
    section: &mut Section,
    config: &mut PacmanConfig,
) -> anyhow::Result<()> {
    let content = fs::read_to_string(path)?;

    for (lineno, raw) in content.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if name == "options" {
                *section = Section::Options;
            } else {
                *section = Section::Repo;
                config.repos.push(Repo::new(name));
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "Server" => match section {
                Section::None => eprintln!(
                    "error: failed to parse {} on line {lineno}: found 'Server' directive outside of a section",
                    path.display()
                ),
                Section::Options => eprintln!(
                    "error: failed to parse {} on line {lineno}: found 'Server' directive in options section",
                    path.display()
                ),
                Section::Repo => {
                    if let Some(repo) = config.repos.last_mut() {
                        repo.servers.push(value.to_owned());
                    }
                }
            },
            "Include" => parse_include(value, section, config),
            "Architecture" if matches!(section, Section::Options) => {
                if value != "auto" {
                    config.architecture = Some(value.to_owned());
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_include(pattern: &str, section: &mut Section, config: &mut PacmanConfig) {
    let paths: Vec<_> = match glob::glob(pattern) {
        Ok(iter) => iter.filter_map(Result::ok).collect(),
        Err(err) => {
            eprintln!("warning: globbing failed on '{pattern}': {err}");
            return;
        }
    };

    // Like glob(3) with GLOB_NOCHECK: a pattern matching nothing is tried
    // verbatim, so a missing literal include surfaces as an open error.
    if paths.is_empty() {
        report_include_failure(Path::new(pattern), section, config);
        return;
    }

    for path in paths {
        report_include_failure(&path, section, config);
    }
}

fn report_include_failure(path: &Path, section: &mut Section, config: &mut PacmanConfig) {
    if let Err(err) = parse_one_file(path, section, config) {
        eprintln!("error: failed to open {}: {err}", path.display());
    }
}

/// Expands `$repo` and `$arch` in a server template and appends the
/// files-database name.
pub fn prepare_url(template: &str, repo: &str, arch: &str) -> String {
    let url = template.replace("$arch", arch).replace("$repo", repo);
    format!("{url}/{repo}.files")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn parse(content: &str) -> PacmanConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        PacmanConfig::load(file.path()).unwrap()
    }

    #[test]
    fn repos_keep_configured_order() {
        let config = parse(
            "[options]\n\
             Architecture = x86_64\n\
             [core]\n\
             Server = https://mirror.example.com/$repo/os/$arch\n\
             [extra]\n\
             Server = https://mirror.example.com/$repo/os/$arch\n",
        );

        let names: Vec<_> = config.repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["core", "extra"]);
        assert_eq!(config.architecture.as_deref(), Some("x86_64"));
    }

    #[test]
    fn repeated_server_lines_accumulate_in_order() {
        let config = parse(
            "[core]\n\
             Server = https://a.example.com/$repo\n\
             Server = https://b.example.com/$repo\n",
        );

        assert_eq!(
            config.repos[0].servers,
            ["https://a.example.com/$repo", "https://b.example.com/$repo"]
        );
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = parse(
            "# leading comment\n\
             \n\
             [core]   # trailing comment\n\
             Server = https://a.example.com # mirror A\n",
        );

        assert_eq!(config.repos[0].servers, ["https://a.example.com"]);
    }

    #[test]
    fn architecture_auto_is_ignored() {
        let config = parse("[options]\nArchitecture = auto\n[core]\n");
        assert_eq!(config.architecture, None);
    }

    #[test]
    fn architecture_outside_options_is_ignored() {
        let config = parse("[core]\nArchitecture = armv7h\n");
        assert_eq!(config.architecture, None);
    }

    #[test]
    fn server_outside_a_repo_section_is_dropped() {
        let config = parse(
            "Server = https://orphan.example.com\n\
             [options]\n\
             Server = https://options.example.com\n\
             [core]\n\
             Server = https://core.example.com\n",
        );

        assert_eq!(config.repos.len(), 1);
        assert_eq!(config.repos[0].servers, ["https://core.example.com"]);
    }

    #[test]
    fn include_pulls_servers_into_the_current_section() {
        let dir = tempfile::tempdir().unwrap();
        let mirrorlist = dir.path().join("mirrorlist");
        fs::write(&mirrorlist, "Server = https://included.example.com/$repo\n").unwrap();

        let main = dir.path().join("pacman.conf");
        fs::write(
            &main,
            format!(
                "[core]\nInclude = {}\n[extra]\nInclude = {}\n",
                mirrorlist.display(),
                mirrorlist.display()
            ),
        )
        .unwrap();

        let config = PacmanConfig::load(&main).unwrap();
        assert_eq!(config.repos[0].servers, ["https://included.example.com/$repo"]);
        assert_eq!(config.repos[1].servers, ["https://included.example.com/$repo"]);
    }

    #[test]
    fn missing_include_is_not_fatal() {
        let config = parse("[core]\nInclude = /nonexistent/mirrorlist\nServer = https://a.example.com\n");
        assert_eq!(config.repos[0].servers, ["https://a.example.com"]);
    }

    #[test]
    fn prepare_url_substitutes_and_appends() {
        assert_eq!(
            prepare_url("https://mirror.example.com/$repo/os/$arch", "core", "x86_64"),
            "https://mirror.example.com/core/os/x86_64/core.files"
        );
    }
}
