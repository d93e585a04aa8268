// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    str::{self, Utf8Error},
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use md5::{Digest, Md5};
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{Immutable, KnownLayout, Unaligned};

use crate::{
    format::compression::{self, CompressedFormat},
    stream::{self, ReadSeek, ReadVecExt, WriteZerosExt},
    util::{self, NulPadding, OrderedGroups},
};

/// Magic value for [`RawHeader::magic`].
pub const DZ_MAGIC: u32 = 0x74189632;
/// Magic value for [`RawChunkV0::magic`] and [`RawChunkV1::magic`].
pub const CHUNK_MAGIC: u32 = 0x78951230;

/// Size of a sector. All sector fields count in these units.
pub const SECTOR_SIZE: u64 = 4096;

/// Maximum supported major version (inclusive).
const MAJOR_VERSION_MAX: u32 = 2;
/// Maximum supported minor version (inclusive).
const MINOR_VERSION_MAX: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid DZ header magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported DZ version: {0}.{1}")]
    UnsupportedVersion(u32, u32),
    #[error("Unexpected value for reserved field: {0}")]
    ReservedNotZero(u32),
    #[error("Expected positive part count")]
    NoChunks,
    #[error("{0:?} field: invalid value: {1:#010x}")]
    InvalidFieldValue(&'static str, u32),
    #[error("Non-zero bytes in header padding")]
    PaddingNotZero,
    #[error("Header CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderCrcMismatch { expected: u32, actual: u32 },
    #[error("Unknown compression type: {0}")]
    UnknownCompressionTag(u8),
    #[error("Non-zero bytes after compression type byte")]
    CompressionPaddingNotZero,
    #[error("Invalid build weekday: expected {expected}, got {actual}")]
    InvalidWeekday { expected: u16, actual: u16 },
    // Chunk errors.
    #[error("Chunk #{0}: Invalid magic: {1:#010x}")]
    InvalidChunkMagic(u32, u32),
    #[error("Chunk {name:?}: Hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("Mismatch in part start sector: recorded {recorded}, tracked {tracked}")]
    PartStartSectorMismatch { recorded: u32, tracked: u32 },
    // Archive integrity errors.
    #[error("Chunk headers hash mismatch: expected {expected}, got {actual}")]
    ChunkHeadersHashMismatch { expected: String, actual: String },
    #[error("Data hash mismatch: expected {expected}, got {actual}")]
    DataHashMismatch { expected: String, actual: String },
    // Field codec errors.
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("{0:?} field is too long: {1:?}")]
    StringTooLong(&'static str, String),
    // Wrapped errors.
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the 512-byte main header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`DZ_MAGIC`].
    magic: little_endian::U32,
    major: little_endian::U32,
    minor: little_endian::U32,
    reserved: little_endian::U32,
    model_name: [u8; 32],
    sw_version: [u8; 128],
    /// Year, month, weekday (0 = Monday), day, hour, minute, second,
    /// millisecond.
    build_date: [little_endian::U16; 8],
    part_count: little_endian::U32,
    /// MD5 of all chunk headers in file order.
    chunk_hdrs_hash: [u8; 16],
    secure_image_type: u8,
    /// Either an ASCIIZ name ("zlib"/"zstd") or a single tag byte.
    compression: [u8; 9],
    /// MD5 of the header (with this field set to 0xFF * 16) followed by every
    /// chunk header and compressed payload in file order.
    data_hash: [u8; 16],
    swfv: [u8; 50],
    build_type: [u8; 16],
    unknown_0: little_endian::U32,
    /// CRC32 of the header with this field and `data_hash` zeroed.
    header_crc: little_endian::U32,
    android_ver: [u8; 10],
    memory_size: [u8; 11],
    signed_security: [u8; 4],
    is_ufs: little_endian::U32,
    anti_rollback_ver: little_endian::U32,
    supported_mem: [u8; 64],
    target_product: [u8; 24],
    multi_panel_mask: u8,
    product_fuse_id: u8,
    unknown_1: little_endian::U32,
    /// `b'F'` for factory images, 0 otherwise.
    is_factory_image: u8,
    /// Dot-separated operator codes.
    operator_code: [u8; 24],
    unknown_2: little_endian::U32,
    padding: [u8; 44],
}

/// Raw on-disk layout for a chunk header in minor version 0 archives.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunkV0 {
    magic: little_endian::U32,
    part_name: [u8; 32],
    chunk_name: [u8; 64],
    decompressed_size: little_endian::U32,
    compressed_size: little_endian::U32,
    /// MD5 of the compressed payload.
    hash: [u8; 16],
}

/// Raw on-disk layout for a chunk header in minor version 1 archives.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunkV1 {
    magic: little_endian::U32,
    part_name: [u8; 32],
    chunk_name: [u8; 64],
    decompressed_size: little_endian::U32,
    compressed_size: little_endian::U32,
    /// MD5 of the compressed payload.
    hash: [u8; 16],
    start_sector: little_endian::U32,
    sector_count: little_endian::U32,
    hw_partition: little_endian::U32,
    /// CRC32 of the compressed payload.
    crc: little_endian::U32,
    unique_part_id: little_endian::U32,
    is_sparse: little_endian::U32,
    is_ubi_image: little_endian::U32,
    part_start_sector: little_endian::U32,
    padding: [u8; 356],
}

const _: () = assert!(mem::size_of::<RawHeader>() == 512);
const _: () = assert!(mem::size_of::<RawChunkV0>() == 124);
const _: () = assert!(mem::size_of::<RawChunkV1>() == 512);

impl RawHeader {
    /// Ensure that all invariant fields are semantically valid. The CRC is
    /// checked separately because it covers a modified copy of the header.
    fn validate(&self) -> Result<()> {
        if self.magic.get() != DZ_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        if self.major.get() > MAJOR_VERSION_MAX || self.minor.get() > MINOR_VERSION_MAX {
            return Err(Error::UnsupportedVersion(self.major.get(), self.minor.get()));
        }

        if self.reserved.get() != 0 {
            return Err(Error::ReservedNotZero(self.reserved.get()));
        }

        if self.part_count.get() == 0 {
            return Err(Error::NoChunks);
        }

        if self.unknown_0.get() != 0 {
            return Err(Error::InvalidFieldValue("unknown_0", self.unknown_0.get()));
        }

        if !matches!(self.unknown_1.get(), 0 | 0xffffffff) {
            return Err(Error::InvalidFieldValue("unknown_1", self.unknown_1.get()));
        }

        if self.unknown_2.get() > 1 {
            return Err(Error::InvalidFieldValue("unknown_2", self.unknown_2.get()));
        }

        if !util::is_zero(&self.padding) {
            return Err(Error::PaddingNotZero);
        }

        Ok(())
    }
}

/// Whether to verify the whole-archive data hash while parsing. The header
/// CRC and the chunk headers hash are always enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashMode {
    Verify,
    Ignore,
}

/// A compressed slice of one partition at a known starting sector.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Chunk {
    pub name: String,
    /// Decompressed size in bytes.
    pub data_size: u32,
    /// Absolute file offset of the compressed payload.
    pub file_offset: u64,
    /// Compressed size in bytes.
    pub file_size: u32,
    #[serde(with = "hex")]
    pub hash: [u8; 16],
    pub crc: u32,
    pub start_sector: u32,
    pub sector_count: u32,
    pub part_start_sector: u32,
    pub unique_part_id: u32,
    pub is_sparse: bool,
    pub is_ubi_image: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DzHeader {
    pub magic: u32,
    pub major: u32,
    pub minor: u32,
    pub model_name: String,
    pub sw_version: String,
    pub part_count: u32,
    #[serde(with = "hex")]
    pub chunk_hdrs_hash: [u8; 16],
    #[serde(with = "hex")]
    pub data_hash: [u8; 16],
    pub header_crc: u32,
    pub secure_image_type: u8,
    pub build_date: Option<NaiveDateTime>,
    pub compression: CompressedFormat,
    pub swfv: String,
    pub build_type: String,
    pub android_ver: String,
    pub memory_size: String,
    pub signed_security: String,
    pub is_ufs: bool,
    pub anti_rollback_ver: u32,
    pub supported_mem: String,
    pub target_product: String,
    pub multi_panel_mask: u8,
    pub product_fuse_id: u8,
    pub is_factory_image: bool,
    pub operator_code: Vec<String>,
    // Semantics unknown; preserved verbatim for round-tripping.
    #[serde(default)]
    pub unknown_0: u32,
    #[serde(default)]
    pub unknown_1: u32,
    #[serde(default)]
    pub unknown_2: u32,
    /// Chunks grouped by hardware partition and partition name in
    /// first-appearance order.
    pub parts: OrderedGroups<u32, Chunk>,
}

fn decode_string(field: &'static str, buf: &[u8]) -> Result<String> {
    let trimmed = buf.trim_to_nul();

    str::from_utf8(trimmed)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, trimmed.to_vec(), e))
}

fn encode_string<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N]> {
    s.as_bytes()
        .to_padded_array::<N>()
        .ok_or_else(|| Error::StringTooLong(field, s.to_owned()))
}

/// Sakamoto's day-of-week algorithm, remapped so that 0 = Monday as the build
/// date field stores it.
pub fn weekday_monday_zero(year: i32, month: u32, day: u32) -> u16 {
    static T: [i32; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];

    let y = if month < 3 { year - 1 } else { year };
    let w = (y + y / 4 - y / 100 + y / 400 + T[month as usize - 1] + day as i32) % 7;

    // Sakamoto yields 0 = Sunday.
    ((w + 6) % 7) as u16
}

fn decode_build_date(raw: &[little_endian::U16; 8]) -> Result<Option<NaiveDateTime>> {
    let fields = raw.map(|v| v.get());

    if fields.iter().all(|&v| v == 0) {
        return Ok(None);
    }

    // An unrepresentable date is treated as absent rather than an error.
    let Some(date) = NaiveDate::from_ymd_opt(
        i32::from(fields[0]),
        u32::from(fields[1]),
        u32::from(fields[3]),
    ) else {
        return Ok(None);
    };
    let Some(datetime) = date.and_hms_opt(
        u32::from(fields[4]),
        u32::from(fields[5]),
        u32::from(fields[6]),
    ) else {
        return Ok(None);
    };

    let expected = date.weekday().num_days_from_monday() as u16;
    if expected != fields[2] {
        return Err(Error::InvalidWeekday {
            expected,
            actual: fields[2],
        });
    }

    Ok(Some(datetime))
}

fn encode_build_date(date: Option<NaiveDateTime>) -> [little_endian::U16; 8] {
    let Some(date) = date else {
        return [0u16.into(); 8];
    };

    let weekday = weekday_monday_zero(date.year(), date.month(), date.day());

    [
        (date.year() as u16).into(),
        (date.month() as u16).into(),
        weekday.into(),
        (date.day() as u16).into(),
        (date.hour() as u16).into(),
        (date.minute() as u16).into(),
        (date.second() as u16).into(),
        // Milliseconds are not stored in the metadata document.
        0.into(),
    ]
}

fn decode_compression(raw: &[u8; 9]) -> Result<CompressedFormat> {
    if raw[0].is_ascii_alphabetic() {
        let name = decode_string("compression", raw)?.to_lowercase();
        Ok(name.parse::<CompressedFormat>()?)
    } else {
        if !util::is_zero(&raw[1..]) {
            return Err(Error::CompressionPaddingNotZero);
        }

        CompressedFormat::from_tag(raw[0]).ok_or(Error::UnknownCompressionTag(raw[0]))
    }
}

fn encode_compression(format: CompressedFormat) -> [u8; 9] {
    let mut buf = [0u8; 9];
    buf[0] = format.tag();
    buf
}

/// Stream a chunk payload through the hash contexts without retaining it.
fn hash_payload(
    mut reader: impl Read,
    mut size: u64,
    mut update: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 65536];

    while size > 0 {
        stream::check_cancel(cancel_signal)?;

        let n = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..n])?;
        update(&buf[..n]);

        size -= n as u64;
    }

    Ok(())
}

impl DzHeader {
    /// Parse a DZ archive. `reader` must be positioned at the start of the
    /// archive within the containing file; recorded chunk offsets are absolute
    /// stream positions so that payloads can be located again later.
    pub fn from_reader(
        mut reader: impl Read + Seek,
        mode: HashMode,
        cancel_signal: &AtomicBool,
    ) -> Result<Self> {
        let raw = RawHeader::read_from_io(&mut reader)?;

        // A zero CRC means the field was never filled in.
        if raw.header_crc.get() != 0 {
            let mut copy = raw;
            copy.header_crc = 0.into();
            copy.data_hash = [0u8; 16];

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(copy.as_bytes());
            let actual = hasher.finalize();

            if actual != raw.header_crc.get() {
                return Err(Error::HeaderCrcMismatch {
                    expected: raw.header_crc.get(),
                    actual,
                });
            }
        }

        raw.validate()?;

        let compression = decode_compression(&raw.compression)?;
        let build_date = decode_build_date(&raw.build_date)?;

        // An all-0xFF data hash means the field was never filled in.
        let verify_data = mode == HashMode::Verify && raw.data_hash != [0xffu8; 16];

        let parts = Self::parse_chunks(&mut reader, &raw, verify_data, cancel_signal)?;

        Ok(Self {
            magic: raw.magic.get(),
            major: raw.major.get(),
            minor: raw.minor.get(),
            model_name: decode_string("model_name", &raw.model_name)?,
            sw_version: decode_string("sw_version", &raw.sw_version)?,
            part_count: raw.part_count.get(),
            chunk_hdrs_hash: raw.chunk_hdrs_hash,
            data_hash: raw.data_hash,
            header_crc: raw.header_crc.get(),
            secure_image_type: raw.secure_image_type,
            build_date,
            compression,
            swfv: decode_string("swfv", &raw.swfv)?,
            build_type: decode_string("build_type", &raw.build_type)?,
            android_ver: decode_string("android_ver", &raw.android_ver)?,
            memory_size: decode_string("memory_size", &raw.memory_size)?,
            signed_security: decode_string("signed_security", &raw.signed_security)?,
            is_ufs: raw.is_ufs.get() != 0,
            anti_rollback_ver: raw.anti_rollback_ver.get(),
            supported_mem: decode_string("supported_mem", &raw.supported_mem)?,
            target_product: decode_string("target_product", &raw.target_product)?,
            multi_panel_mask: raw.multi_panel_mask,
            product_fuse_id: raw.product_fuse_id,
            is_factory_image: raw.is_factory_image == b'F',
            operator_code: decode_string("operator_code", &raw.operator_code)?
                .split('.')
                .map(|s| s.to_owned())
                .collect(),
            unknown_0: raw.unknown_0.get(),
            unknown_1: raw.unknown_1.get(),
            unknown_2: raw.unknown_2.get(),
            parts,
        })
    }

    fn parse_chunks(
        mut reader: impl Read + Seek,
        raw: &RawHeader,
        verify_data: bool,
        cancel_signal: &AtomicBool,
    ) -> Result<OrderedGroups<u32, Chunk>> {
        let mut chunk_hdrs_hasher = Md5::new();
        let mut data_hasher = verify_data.then(|| {
            let mut hasher = Md5::new();
            let mut copy = *raw;
            copy.data_hash = [0xffu8; 16];
            hasher.update(copy.as_bytes());
            hasher
        });

        let mut parts = OrderedGroups::<u32, Chunk>::new();
        let is_v0 = raw.minor.get() == 0;

        // Tracked per (hw partition, name) group while scanning V1 chunks.
        let mut part_start_sector = 0u32;
        let mut part_sector_count = 0u32;

        for index in 0..raw.part_count.get() {
            let hw_partition;
            let part_name;
            let mut chunk;
            let hdr_bytes;

            if is_v0 {
                let raw_chunk = RawChunkV0::read_from_io(&mut reader)?;

                if raw_chunk.magic.get() != CHUNK_MAGIC {
                    return Err(Error::InvalidChunkMagic(index, raw_chunk.magic.get()));
                }

                hw_partition = 0;
                part_name = decode_string("part_name", &raw_chunk.part_name)?;
                chunk = Chunk {
                    name: decode_string("chunk_name", &raw_chunk.chunk_name)?,
                    data_size: raw_chunk.decompressed_size.get(),
                    file_offset: 0,
                    file_size: raw_chunk.compressed_size.get(),
                    hash: raw_chunk.hash,
                    crc: 0,
                    start_sector: 0,
                    sector_count: 0,
                    part_start_sector: 0,
                    unique_part_id: 0,
                    is_sparse: false,
                    is_ubi_image: false,
                };
                hdr_bytes = raw_chunk.as_bytes().to_vec();
            } else {
                let raw_chunk = RawChunkV1::read_from_io(&mut reader)?;

                if raw_chunk.magic.get() != CHUNK_MAGIC {
                    return Err(Error::InvalidChunkMagic(index, raw_chunk.magic.get()));
                }

                hw_partition = raw_chunk.hw_partition.get();
                part_name = decode_string("part_name", &raw_chunk.part_name)?;
                chunk = Chunk {
                    name: decode_string("chunk_name", &raw_chunk.chunk_name)?,
                    data_size: raw_chunk.decompressed_size.get(),
                    file_offset: 0,
                    file_size: raw_chunk.compressed_size.get(),
                    hash: raw_chunk.hash,
                    crc: raw_chunk.crc.get(),
                    start_sector: raw_chunk.start_sector.get(),
                    sector_count: raw_chunk.sector_count.get(),
                    part_start_sector: 0,
                    unique_part_id: raw_chunk.unique_part_id.get(),
                    is_sparse: raw_chunk.is_sparse.get() != 0,
                    is_ubi_image: raw_chunk.is_ubi_image.get() != 0,
                };
                hdr_bytes = raw_chunk.as_bytes().to_vec();

                let recorded = raw_chunk.part_start_sector.get();

                if !parts.contains_key(hw_partition) {
                    part_start_sector = 0;
                    part_sector_count = 0;

                    if recorded > part_start_sector && recorded <= chunk.start_sector {
                        part_start_sector = recorded;
                    }
                } else if !parts.contains_entry(hw_partition, &part_name) {
                    if recorded == 0 {
                        part_start_sector = chunk.start_sector;
                    } else {
                        // The next partition starts where the previous one
                        // ended unless the header says otherwise.
                        part_start_sector += part_sector_count;

                        if recorded > part_start_sector && recorded <= chunk.start_sector {
                            part_start_sector = recorded;
                        }
                    }

                    part_sector_count = 0;
                }

                if recorded != 0 && recorded != part_start_sector {
                    return Err(Error::PartStartSectorMismatch {
                        recorded,
                        tracked: part_start_sector,
                    });
                }

                chunk.part_start_sector = part_start_sector;

                let span = chunk.start_sector.checked_sub(part_start_sector).ok_or(
                    Error::PartStartSectorMismatch {
                        recorded,
                        tracked: part_start_sector,
                    },
                )?;
                part_sector_count = span + chunk.sector_count;
            }

            chunk_hdrs_hasher.update(&hdr_bytes);

            chunk.file_offset = reader.stream_position()?;
            let file_size = chunk.file_size;
            let name = chunk.name.clone();
            let hash = chunk.hash;

            parts.push(hw_partition, &part_name, chunk);

            if let Some(data_hasher) = &mut data_hasher {
                data_hasher.update(&hdr_bytes);

                let mut chunk_hasher = Md5::new();

                hash_payload(
                    &mut reader,
                    file_size.into(),
                    |data| {
                        data_hasher.update(data);
                        chunk_hasher.update(data);
                    },
                    cancel_signal,
                )?;

                let digest: [u8; 16] = chunk_hasher.finalize().into();
                if digest != hash {
                    return Err(Error::ChunkHashMismatch {
                        name,
                        expected: hex::encode(hash),
                        actual: hex::encode(digest),
                    });
                }
            } else {
                reader.seek(SeekFrom::Current(i64::from(file_size)))?;
            }
        }

        let digest: [u8; 16] = chunk_hdrs_hasher.finalize().into();
        if digest != raw.chunk_hdrs_hash {
            return Err(Error::ChunkHeadersHashMismatch {
                expected: hex::encode(raw.chunk_hdrs_hash),
                actual: hex::encode(digest),
            });
        }

        if let Some(data_hasher) = data_hasher {
            let digest: [u8; 16] = data_hasher.finalize().into();
            if digest != raw.data_hash {
                return Err(Error::DataHashMismatch {
                    expected: hex::encode(raw.data_hash),
                    actual: hex::encode(digest),
                });
            }
        }

        Ok(parts)
    }
}

impl fmt::Display for DzHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DZ header v{}.{}:", self.major, self.minor)?;
        writeln!(f, "- Magic:                 {:#010x}", self.magic)?;
        writeln!(f, "- Model name:            {:?}", self.model_name)?;
        writeln!(f, "- SW version:            {:?}", self.sw_version)?;

        match self.build_date {
            Some(date) => writeln!(f, "- Build date:            {date}")?,
            None => writeln!(f, "- Build date:            N/A")?,
        }

        writeln!(f, "- Compression:           {}", self.compression)?;
        writeln!(f, "- Secure image type:     {}", self.secure_image_type)?;
        writeln!(f, "- SWFV:                  {:?}", self.swfv)?;
        writeln!(f, "- Build type:            {:?}", self.build_type)?;
        writeln!(f, "- Android version:       {:?}", self.android_ver)?;
        writeln!(f, "- Memory size:           {:?}", self.memory_size)?;
        writeln!(f, "- Signed security:       {:?}", self.signed_security)?;
        writeln!(f, "- Anti-rollback version: {:#x}", self.anti_rollback_ver)?;
        writeln!(f, "- Supported memory:      {:?}", self.supported_mem)?;
        writeln!(f, "- Target product:        {:?}", self.target_product)?;
        writeln!(f, "- Operator code:         {:?}", self.operator_code)?;
        writeln!(f, "- Multi panel mask:      {}", self.multi_panel_mask)?;
        writeln!(f, "- Product fuse ID:       {}", self.product_fuse_id)?;
        writeln!(f, "- Factory image:         {}", self.is_factory_image)?;
        writeln!(f, "- UFS:                   {}", self.is_ufs)?;
        writeln!(f, "- Chunk headers hash:    {}", hex::encode(self.chunk_hdrs_hash))?;
        writeln!(f, "- Data hash:             {}", hex::encode(self.data_hash))?;
        writeln!(f, "- Header CRC:            {:#010x}", self.header_crc)?;
        writeln!(f, "- Chunks:                {}", self.parts.len())?;

        Ok(())
    }
}

/// Result of one chunk compression task.
struct ChunkPayload {
    header: Vec<u8>,
    data: Vec<u8>,
}

fn compress_chunk(
    compression: CompressedFormat,
    is_v0: bool,
    hw_partition: u32,
    part_name: &str,
    chunk: &Chunk,
    mut image: Box<dyn ReadSeek>,
    cancel_signal: &AtomicBool,
) -> Result<ChunkPayload> {
    let span = chunk
        .start_sector
        .checked_sub(chunk.part_start_sector)
        .ok_or(Error::InvalidFieldValue("start_sector", chunk.start_sector))?;

    image.seek(SeekFrom::Start(u64::from(span) * SECTOR_SIZE))?;
    let data = image.read_exact_vec(chunk.data_size as usize)?;

    stream::check_cancel(cancel_signal)?;

    let compressed = compression::compress(compression, &data)?;
    let hash: [u8; 16] = Md5::digest(&compressed).into();

    let header = if is_v0 {
        let raw = RawChunkV0 {
            magic: CHUNK_MAGIC.into(),
            part_name: encode_string("part_name", part_name)?,
            chunk_name: encode_string("chunk_name", &chunk.name)?,
            decompressed_size: chunk.data_size.into(),
            compressed_size: (compressed.len() as u32).into(),
            hash,
        };
        raw.as_bytes().to_vec()
    } else {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&compressed);

        let raw = RawChunkV1 {
            magic: CHUNK_MAGIC.into(),
            part_name: encode_string("part_name", part_name)?,
            chunk_name: encode_string("chunk_name", &chunk.name)?,
            decompressed_size: chunk.data_size.into(),
            compressed_size: (compressed.len() as u32).into(),
            hash,
            start_sector: chunk.start_sector.into(),
            sector_count: chunk.sector_count.into(),
            hw_partition: hw_partition.into(),
            crc: hasher.finalize().into(),
            unique_part_id: chunk.unique_part_id.into(),
            is_sparse: u32::from(chunk.is_sparse).into(),
            is_ubi_image: u32::from(chunk.is_ubi_image).into(),
            part_start_sector: chunk.part_start_sector.into(),
            padding: [0u8; 356],
        };
        raw.as_bytes().to_vec()
    };

    Ok(ChunkPayload {
        header,
        data: compressed,
    })
}

/// Build a complete DZ archive from the metadata descriptor. Chunks are
/// compressed on the thread pool; `open_image` is called from multiple
/// threads and must hand out independent handles to the partition image.
/// Results are merged strictly in submission order because the hash chain
/// depends on the byte order.
pub fn build_archive(
    header: &DzHeader,
    open_image: impl Fn(u32, &str) -> io::Result<Box<dyn ReadSeek>> + Sync,
    pool: &rayon::ThreadPool,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    struct Task<'a> {
        hw_partition: u32,
        part_name: &'a str,
        chunk: &'a Chunk,
    }

    let tasks = header
        .parts
        .entries()
        .flat_map(|(hw_partition, part_name, chunks)| {
            chunks.iter().map(move |chunk| Task {
                hw_partition,
                part_name,
                chunk,
            })
        })
        .collect::<Vec<_>>();

    let is_v0 = header.minor == 0;
    let compression = header.compression;

    let payloads = pool.install(|| {
        tasks
            .par_iter()
            .map(|task| {
                debug!(
                    "Compressing hw partition {}, partition {:?}, chunk {:?}",
                    task.hw_partition, task.part_name, task.chunk.name,
                );

                let image = open_image(task.hw_partition, task.part_name)?;

                compress_chunk(
                    compression,
                    is_v0,
                    task.hw_partition,
                    task.part_name,
                    task.chunk,
                    image,
                    cancel_signal,
                )
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut chunk_hdrs_hasher = Md5::new();
    for payload in &payloads {
        chunk_hdrs_hasher.update(&payload.header);
    }

    let mut raw = RawHeader::new_zeroed();
    raw.magic = header.magic.into();
    raw.major = header.major.into();
    raw.minor = header.minor.into();
    raw.model_name = encode_string("model_name", &header.model_name)?;
    raw.sw_version = encode_string("sw_version", &header.sw_version)?;
    raw.build_date = encode_build_date(header.build_date);
    raw.part_count = (payloads.len() as u32).into();
    raw.chunk_hdrs_hash = chunk_hdrs_hasher.finalize().into();
    raw.secure_image_type = header.secure_image_type;
    raw.compression = encode_compression(header.compression);
    raw.swfv = encode_string("swfv", &header.swfv)?;
    raw.build_type = encode_string("build_type", &header.build_type)?;
    raw.unknown_0 = header.unknown_0.into();
    raw.android_ver = encode_string("android_ver", &header.android_ver)?;
    raw.memory_size = encode_string("memory_size", &header.memory_size)?;
    raw.signed_security = encode_string("signed_security", &header.signed_security)?;
    raw.is_ufs = u32::from(header.is_ufs).into();
    raw.anti_rollback_ver = header.anti_rollback_ver.into();
    raw.supported_mem = encode_string("supported_mem", &header.supported_mem)?;
    raw.target_product = encode_string("target_product", &header.target_product)?;
    raw.multi_panel_mask = header.multi_panel_mask;
    raw.product_fuse_id = header.product_fuse_id;
    raw.unknown_1 = header.unknown_1.into();
    raw.is_factory_image = if header.is_factory_image { b'F' } else { 0 };
    raw.operator_code = encode_string("operator_code", &header.operator_code.join("."))?;
    raw.unknown_2 = header.unknown_2.into();

    // The CRC covers the header with the CRC field and data hash zeroed,
    // which they still are at this point.
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(raw.as_bytes());
    raw.header_crc = hasher.finalize().into();

    // The data hash instead covers the final header with the data hash field
    // set to 0xFF * 16, followed by the chunk stream.
    let mut copy = raw;
    copy.data_hash = [0xffu8; 16];

    let mut data_hasher = Md5::new();
    data_hasher.update(copy.as_bytes());
    for payload in &payloads {
        data_hasher.update(&payload.header);
        data_hasher.update(&payload.data);
    }
    raw.data_hash = data_hasher.finalize().into();

    let total = mem::size_of::<RawHeader>()
        + payloads
            .iter()
            .map(|p| p.header.len() + p.data.len())
            .sum::<usize>();

    let mut buffer = Vec::with_capacity(total);
    buffer.extend_from_slice(raw.as_bytes());
    for payload in &payloads {
        buffer.extend_from_slice(&payload.header);
        buffer.extend_from_slice(&payload.data);
    }

    Ok(buffer)
}

/// Decompress one partition's chunks in parallel and reconstruct the sparse
/// image. `open_input` is called from multiple threads and must hand out
/// independent handles to the containing file. Returns the number of bytes
/// the chunks span relative to the partition's start sector.
pub fn extract_partition(
    compression: CompressedFormat,
    chunks: &[Chunk],
    open_input: impl Fn() -> io::Result<Box<dyn ReadSeek>> + Sync,
    mut writer: impl Write,
    pool: &rayon::ThreadPool,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    if chunks.is_empty() {
        return Ok(0);
    }

    let decompressed = pool.install(|| {
        chunks
            .par_iter()
            .map(|chunk| -> Result<Vec<u8>> {
                debug!("Decompressing chunk {:?}", chunk.name);

                let mut reader = open_input()?;
                reader.seek(SeekFrom::Start(chunk.file_offset))?;
                let data = reader.read_exact_vec(chunk.file_size as usize)?;

                stream::check_cancel(cancel_signal)?;

                Ok(compression::decompress(
                    compression,
                    &data,
                    chunk.data_size as usize,
                )?)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let start_offset = u64::from(chunks[0].part_start_sector) * SECTOR_SIZE;
    let mut current_offset = start_offset;

    for (chunk, data) in chunks.iter().zip(&decompressed) {
        // Sectors not covered by any chunk are zero-filled.
        let expected_offset = u64::from(chunk.start_sector) * SECTOR_SIZE;
        if current_offset < expected_offset {
            writer.write_zeros_exact(expected_offset - current_offset)?;
            current_offset = expected_offset;
        }

        writer.write_all(data)?;
        current_offset += data.len() as u64;
    }

    // Pad the image out to its full sparse length.
    let last = chunks.last().unwrap();
    let end_offset = (u64::from(last.start_sector) + u64::from(last.sector_count)) * SECTOR_SIZE;
    if current_offset < end_offset {
        writer.write_zeros_exact(end_offset - current_offset)?;
        current_offset = end_offset;
    }

    Ok(current_offset - start_offset)
}
