//! Compiled match predicates over file-list lines.
//!
//! A [`Filter`] is built once per invocation and then evaluated against every
//! candidate line, possibly from several scan threads at once, so evaluation
//! takes `&self` and compiled state is immutable. Lines are raw bytes as they
//! come out of the archive; no UTF-8 validity is assumed.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use regex::bytes::{Regex, RegexBuilder};

/// A pattern failed to compile. The underlying error message carries the
/// offending position and diagnostic from the pattern engine.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("failed to compile glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("failed to compile regex: {0}")]
    Regex(#[from] regex::Error),
}

/// A compiled line predicate.
///
/// Leaves match a single property of the line; `Not` and `And` compose them.
/// Case sensitivity is a per-leaf property fixed at compile time.
#[derive(Debug)]
pub enum Filter {
    /// Byte equality with the whole line.
    Exact { pattern: Vec<u8>, case_sensitive: bool },
    /// Equality with the portion after the last `/` (the whole line if none).
    Basename { pattern: Vec<u8>, case_sensitive: bool },
    /// Shell-style glob where wildcards never cross a `/`.
    Glob(GlobMatcher),
    /// Regular expression, anchored only if the pattern anchors itself.
    Regex(Regex),
    /// The line names a directory: its last byte is `/`.
    Directory,
    /// The line names a file directly inside a `bin/` or `sbin/` directory.
    Bin,
    Not(Box<Filter>),
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn exact(pattern: &str, case_sensitive: bool) -> Self {
        Self::Exact {
            pattern: pattern.as_bytes().to_vec(),
            case_sensitive,
        }
    }

    pub fn basename(pattern: &str, case_sensitive: bool) -> Self {
        Self::Basename {
            pattern: pattern.as_bytes().to_vec(),
            case_sensitive,
        }
    }

    pub fn glob(pattern: &str, case_sensitive: bool) -> Result<Self, CompileError> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .case_insensitive(!case_sensitive)
            .build()?
            .compile_matcher();
        Ok(Self::Glob(matcher))
    }

    pub fn regex(pattern: &str, case_sensitive: bool) -> Result<Self, CompileError> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(Self::Regex(re))
    }

    pub fn not(inner: Self) -> Self {
        Self::Not(Box::new(inner))
    }

    pub fn and(lhs: Self, rhs: Self) -> Self {
        Self::And(Box::new(lhs), Box::new(rhs))
    }

    /// Evaluate the predicate against one line.
    pub fn matches(&self, line: &[u8]) -> bool {
        match self {
            Self::Exact {
                pattern,
                case_sensitive,
            } => bytes_equal(line, pattern, *case_sensitive),
            Self::Basename {
                pattern,
                case_sensitive,
            } => bytes_equal(basename(line), pattern, *case_sensitive),
            Self::Glob(matcher) => matcher.is_match(Path::new(OsStr::from_bytes(line))),
            Self::Regex(re) => re.is_match(line),
            Self::Directory => line.last() == Some(&b'/'),
            Self::Bin => is_binary(line),
            Self::Not(inner) => !inner.matches(line),
            Self::And(lhs, rhs) => lhs.matches(line) && rhs.matches(line),
        }
    }
}

fn bytes_equal(line: &[u8], pattern: &[u8], case_sensitive: bool) -> bool {
    if case_sensitive {
        line == pattern
    } else {
        line.eq_ignore_ascii_case(pattern)
    }
}

fn basename(line: &[u8]) -> &[u8] {
    match memchr::memrchr(b'/', line) {
        Some(pos) => &line[pos + 1..],
        None => line,
    }
}

/// Strict binary classification: the line is a file (not a directory) living
/// directly inside a `bin/` or `sbin/` directory. `/bin/foo` and
/// `/usr/sbin/foo` qualify; `/bin/foo/bar` and `/abin/foo` do not.
fn is_binary(line: &[u8]) -> bool {
    if line.is_empty() || line[line.len() - 1] == b'/' {
        return false;
    }

    for pos in memchr::memmem::find_iter(line, b"bin/") {
        let anchored = pos == 0
            || line[pos - 1] == b'/'
            || (line[pos - 1] == b's' && (pos == 1 || line[pos - 2] == b'/'));
        if anchored && memchr::memchr(b'/', &line[pos + 4..]).is_none() {
            return true;
        }
    }

    false
}
