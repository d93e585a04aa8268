// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, BufReader, Cursor, Read, Write},
    str::FromStr,
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the scratch buffer used when decompressing chunk payloads.
const DECOMPRESS_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format: {0:?}")]
    UnknownFormat(String),
    #[error("Failed to initialize zstd decoder")]
    ZstdDecoderInit(#[source] io::Error),
    #[error("Failed to initialize zstd encoder")]
    ZstdEncoderInit(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressedFormat {
    Zlib,
    Zstd,
}

impl CompressedFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        }
    }

    /// Single-byte tag used by the archive header's compression field.
    pub fn tag(self) -> u8 {
        match self {
            Self::Zlib => 0x01,
            Self::Zstd => 0x04,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Zlib),
            0x04 => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl FromStr for CompressedFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zlib" => Ok(Self::Zlib),
            "zstd" => Ok(Self::Zstd),
            f => Err(Error::UnknownFormat(f.to_owned())),
        }
    }
}

impl fmt::Display for CompressedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub enum CompressedReader<R: Read> {
    Zlib(ZlibDecoder<R>),
    /// Boxed because the zstd decoder carries its own window buffers.
    Zstd(Box<zstd::stream::read::Decoder<'static, BufReader<R>>>),
}

impl<R: Read> CompressedReader<R> {
    pub fn new(reader: R, format: CompressedFormat) -> Result<Self> {
        match format {
            CompressedFormat::Zlib => Ok(Self::Zlib(ZlibDecoder::new(reader))),
            CompressedFormat::Zstd => {
                let decoder =
                    zstd::stream::read::Decoder::new(reader).map_err(Error::ZstdDecoderInit)?;
                Ok(Self::Zstd(Box::new(decoder)))
            }
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::Zlib(_) => CompressedFormat::Zlib,
            Self::Zstd(_) => CompressedFormat::Zstd,
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Zlib(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
        }
    }
}

pub enum CompressedWriter<W: Write> {
    Zlib(ZlibEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(writer: W, format: CompressedFormat) -> Result<Self> {
        match format {
            CompressedFormat::Zlib => {
                Ok(Self::Zlib(ZlibEncoder::new(writer, Compression::default())))
            }
            CompressedFormat::Zstd => {
                // Level 0 selects zstd's default compression level.
                let encoder = zstd::stream::write::Encoder::new(writer, 0)
                    .map_err(Error::ZstdEncoderInit)?;
                Ok(Self::Zstd(encoder))
            }
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::Zlib(_) => CompressedFormat::Zlib,
            Self::Zstd(_) => CompressedFormat::Zstd,
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Zlib(w) => w.finish(),
            Self::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Zlib(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Zlib(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

/// Compress an in-memory buffer in a single shot.
pub fn compress(format: CompressedFormat, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = CompressedWriter::new(Vec::new(), format).map_err(io::Error::other)?;
    writer.write_all(data)?;
    writer.finish()
}

/// Decompress an in-memory buffer. `size_hint` is the expected decompressed
/// size and is only used to seed the output capacity.
pub fn decompress(format: CompressedFormat, data: &[u8], size_hint: usize) -> io::Result<Vec<u8>> {
    let mut reader = CompressedReader::new(Cursor::new(data), format).map_err(io::Error::other)?;
    let mut result = Vec::with_capacity(size_hint);
    let mut buf = vec![0u8; DECOMPRESS_BUF_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        result.extend_from_slice(&buf[..n]);
    }

    Ok(result)
}
