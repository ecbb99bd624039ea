//! Per-repo result accumulation and printing.

use std::io::{self, Write};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Line {
    prefix: String,
    entry: Vec<u8>,
}

/// An ordered set of `(prefix, entry)` result lines for one repository.
///
/// Results are homogeneous per invocation: either every line carries an
/// entry column (verbose search, list) or none does. The widest prefix is
/// tracked so multiple sets can be printed with one shared column width.
#[derive(Debug)]
pub struct ResultSet {
    pub repo: String,
    lines: Vec<Line>,
    max_prefix_len: usize,
}

impl ResultSet {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            lines: Vec::new(),
            max_prefix_len: 0,
        }
    }

    /// Appends a line. `prefix_len` is the width this line wants for column
    /// alignment; callers pass 0 when the line should never be padded
    /// (quiet output).
    pub fn add(&mut self, prefix: String, entry: Vec<u8>, prefix_len: usize) {
        self.max_prefix_len = self.max_prefix_len.max(prefix_len);
        self.lines.push(Line { prefix, entry });
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }

    /// Sorts the lines and writes them out. Returns the number of lines
    /// printed. A `prefix_len` of 0 selects unpadded output.
    pub fn print(&mut self, out: &mut impl Write, prefix_len: usize, eol: u8) -> io::Result<usize> {
        if self.lines.is_empty() {
            return Ok(0);
        }

        self.lines.sort();

        if self.lines[0].entry.is_empty() {
            for line in &self.lines {
                out.write_all(line.prefix.as_bytes())?;
                out.write_all(&[eol])?;
            }
        } else {
            for line in &self.lines {
                if prefix_len > 0 {
                    write!(out, "{:<prefix_len$}", line.prefix)?;
                } else {
                    out.write_all(line.prefix.as_bytes())?;
                }
                out.write_all(b"\t")?;
                out.write_all(&line.entry)?;
                out.write_all(&[eol])?;
            }
        }

        Ok(self.lines.len())
    }
}

/// The widest prefix across all sets, for unified column alignment.
pub fn max_prefix_len(results: &[ResultSet]) -> usize {
    results
        .iter()
        .map(ResultSet::max_prefix_len)
        .max()
        .unwrap_or(0)
}
