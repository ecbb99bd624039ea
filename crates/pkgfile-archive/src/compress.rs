//! Compression applied to cache archives.
//!
//! Writing is driven by an explicit [`Compressor`] tag from the command
//! line; reading never trusts a tag and sniffs magic bytes instead, since
//! the cache may have been written by an older run with different settings
//! and the upstream databases make no promises at all.

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::str::FromStr;

use flate2::write::GzEncoder;
use xz2::stream::{LzmaOptions, Stream};

const XZ_PRESET: u32 = 6;
const LZMA_PRESET: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compressor {
    #[default]
    None,
    Gzip,
    Bzip2,
    Lzma,
    Lz4,
    Xz,
    Zstd,
}

impl Compressor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
            Self::Lz4 => "lz4",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Wraps `sink` in the matching stream encoder.
    pub fn encoder<W: Write>(self, sink: W) -> io::Result<Encoder<W>> {
        Ok(match self {
            Self::None => Encoder::Plain(sink),
            Self::Gzip => Encoder::Gzip(GzEncoder::new(sink, flate2::Compression::default())),
            Self::Bzip2 => Encoder::Bzip2(bzip2::write::BzEncoder::new(
                sink,
                bzip2::Compression::default(),
            )),
            Self::Lzma => {
                let opts = LzmaOptions::new_preset(LZMA_PRESET).map_err(io::Error::other)?;
                let stream = Stream::new_lzma_encoder(&opts).map_err(io::Error::other)?;
                Encoder::Lzma(xz2::write::XzEncoder::new_stream(sink, stream))
            }
            Self::Lz4 => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
            Self::Xz => Encoder::Xz(xz2::write::XzEncoder::new(sink, XZ_PRESET)),
            Self::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(sink, 0)?),
        })
    }
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compressor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "bzip2" => Ok(Self::Bzip2),
            "lzma" => Ok(Self::Lzma),
            "lz4" => Ok(Self::Lz4),
            "xz" => Ok(Self::Xz),
            "zstd" => Ok(Self::Zstd),
            _ => Err(format!("invalid compression option {s}")),
        }
    }
}

/// A stream encoder for one of the supported compressors.
///
/// `finish` must be called to flush trailer bytes; dropping an encoder
/// mid-stream produces a truncated archive.
pub enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Lzma(xz2::write::XzEncoder<W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            Self::Bzip2(e) => e.finish(),
            Self::Lzma(e) | Self::Xz(e) => e.finish(),
            Self::Lz4(e) => e.finish().map_err(io::Error::other),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Bzip2(e) => e.write(buf),
            Self::Lzma(e) | Self::Xz(e) => e.write(buf),
            Self::Lz4(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Bzip2(e) => e.flush(),
            Self::Lzma(e) | Self::Xz(e) => e.flush(),
            Self::Lz4(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Identifies the compressor from the first bytes of a stream.
pub fn sniff(prefix: &[u8]) -> Compressor {
    match prefix {
        [0x1f, 0x8b, ..] => Compressor::Gzip,
        [b'B', b'Z', b'h', ..] => Compressor::Bzip2,
        [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => Compressor::Xz,
        [0x28, 0xb5, 0x2f, 0xfd, ..] => Compressor::Zstd,
        [0x04, 0x22, 0x4d, 0x18, ..] => Compressor::Lz4,
        [0x5d, 0x00, ..] => Compressor::Lzma,
        _ => Compressor::None,
    }
}

/// Wraps `src` in a decoder chosen by magic-byte detection. Unrecognised
/// data is passed through unmodified.
pub fn decompress<'a, R: BufRead + 'a>(mut src: R) -> io::Result<Box<dyn Read + 'a>> {
    let head = src.fill_buf()?;
    Ok(match sniff(head) {
        Compressor::None => Box::new(src),
        Compressor::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(src)),
        Compressor::Bzip2 => Box::new(bzip2::bufread::BzDecoder::new(src)),
        Compressor::Lzma => {
            let stream = Stream::new_lzma_decoder(u64::MAX).map_err(io::Error::other)?;
            Box::new(xz2::bufread::XzDecoder::new_stream(src, stream))
        }
        Compressor::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(src)),
        Compressor::Xz => Box::new(xz2::bufread::XzDecoder::new(src)),
        Compressor::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(src)?),
    })
}
