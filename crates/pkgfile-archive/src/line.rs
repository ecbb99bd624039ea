//! Bounded line scanning over an archive entry body.

use std::io::{self, BufRead};

/// Upper bound on a single file-list line, including nothing but the line
/// bytes themselves. Anything longer is treated as corrupt input.
pub const MAX_LINE_SIZE: usize = 10 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("line exceeds maximum length of {limit} bytes")]
    TooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Yields byte-exact lines from a streaming entry body.
///
/// Lines end at `\n` or `\0`; the terminator is stripped. Data is consumed
/// from the underlying reader's own blocks and only assembled into the
/// scratch buffer, so each yielded slice is valid until the next call.
/// Trailing unterminated bytes are yielded as a final line.
///
/// The reader is single-pass and forward-only.
pub struct LineReader<R> {
    inner: R,
    scratch: Vec<u8>,
    limit: usize,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_LINE_SIZE)
    }

    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
            limit,
        }
    }

    /// Returns the next line, or `None` at the end of the entry.
    pub fn next_line(&mut self) -> Result<Option<&[u8]>, LineError> {
        self.scratch.clear();

        loop {
            let block = self.inner.fill_buf()?;
            if block.is_empty() {
                if self.scratch.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(&self.scratch));
            }

            match memchr::memchr2(b'\n', b'\0', block) {
                Some(pos) => {
                    if self.scratch.len() + pos > self.limit {
                        return Err(LineError::TooLong { limit: self.limit });
                    }
                    self.scratch.extend_from_slice(&block[..pos]);
                    self.inner.consume(pos + 1);
                    return Ok(Some(&self.scratch));
                }
                None => {
                    let len = block.len();
                    if self.scratch.len() + len > self.limit {
                        return Err(LineError::TooLong { limit: self.limit });
                    }
                    self.scratch.extend_from_slice(block);
                    self.inner.consume(len);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::BufReader;

    use super::*;

    fn collect(data: &[u8]) -> Vec<Vec<u8>> {
        // A tiny buffer capacity forces lines to straddle block boundaries.
        let mut reader = LineReader::new(BufReader::with_capacity(4, data));
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().unwrap() {
            lines.push(line.to_vec());
        }
        lines
    }

    #[test]
    fn splits_on_newline() {
        assert_eq!(
            collect(b"%FILES%\nusr/\nusr/bin/ls\n"),
            vec![b"%FILES%".to_vec(), b"usr/".to_vec(), b"usr/bin/ls".to_vec()],
        );
    }

    #[test]
    fn splits_on_nul() {
        assert_eq!(
            collect(b"one\0two\0"),
            vec![b"one".to_vec(), b"two".to_vec()],
        );
    }

    #[test]
    fn yields_trailing_unterminated_data() {
        assert_eq!(
            collect(b"complete\npartial"),
            vec![b"complete".to_vec(), b"partial".to_vec()],
        );
    }

    #[test]
    fn yields_empty_lines() {
        assert_eq!(
            collect(b"a\n\nb\n"),
            vec![b"a".to_vec(), Vec::new(), b"b".to_vec()],
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(collect(b"").is_empty());
    }

    #[test]
    fn lines_longer_than_the_limit_fail() {
        let data = vec![b'x'; 32];
        let mut reader = LineReader::with_limit(BufReader::with_capacity(4, &data[..]), 16);
        assert!(matches!(
            reader.next_line(),
            Err(LineError::TooLong { limit: 16 })
        ));
    }

    #[test]
    fn line_at_exactly_the_limit_is_fine() {
        let mut data = vec![b'x'; 16];
        data.push(b'\n');
        let mut reader = LineReader::with_limit(BufReader::with_capacity(4, &data[..]), 16);
        assert_eq!(reader.next_line().unwrap().unwrap().len(), 16);
    }

    #[test]
    fn yielded_lines_never_contain_terminators() {
        for line in collect(b"a\nb\0c\n") {
            assert!(!line.contains(&b'\n'));
            assert!(!line.contains(&b'\0'));
        }
    }
}
