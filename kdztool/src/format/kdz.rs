// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    mem,
    str::{self, Utf8Error},
};

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{Immutable, KnownLayout, Unaligned};

use crate::{
    format::secure,
    stream::{FromReader, WriteZerosExt},
    util::NulPadding,
};

/// Header size for [`V1_MAGIC`].
pub const V1_HDR_SIZE: u32 = 1304;
/// Magic value for version 1 envelopes.
pub const V1_MAGIC: u32 = 0x50447932;
/// Header size for [`V2_MAGIC`].
pub const V2_HDR_SIZE: u32 = 1320;
/// Magic value for version 2 envelopes.
pub const V2_MAGIC: u32 = 0x80253134;
/// Header size for [`V3_MAGIC`].
pub const V3_HDR_SIZE: u32 = 1320;
/// Magic value for version 3 envelopes.
pub const V3_MAGIC: u32 = 0x25223824;

/// Fixed file offset of the extended memory ID blob in V3 envelopes.
pub const EXTENDED_MEM_ID_OFFSET: u64 = 0x14738;

/// Absolute header offset of the trailing record whose purpose is unknown.
/// V2 and V3 store it at the same position, immediately after the DYLIB
/// record.
const UNKNOWN_RECORD_OFFSET: u64 = 825;

/// Absolute header offset of the V3 auxiliary field block.
const V3_EXTRA_OFFSET: u64 = 1097;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown KDZ header (size={0}, magic={1:#010x})")]
    UnknownHeader(u32, u32),
    #[error("Unexpected byte after DLL record: {0:#04x}")]
    UnknownMarkerByte(u8),
    #[error("Unsupported KDZ version: {0}")]
    UnsupportedVersion(u32),
    #[error("Missing mandatory {0:?} record")]
    MissingRecord(&'static str),
    #[error("Component data not found for record: {0:?}")]
    MissingComponent(String),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("{0:?} field is too long: {1:?}")]
    StringTooLong(&'static str, String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the 8-byte header prefix.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPrefix {
    size: little_endian::U32,
    magic: little_endian::U32,
}

/// Raw on-disk layout for a V1 component record.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawV1Record {
    name: [u8; 256],
    size: little_endian::U32,
    offset: little_endian::U32,
}

/// Raw on-disk layout for a V2/V3 component record.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawV2Record {
    name: [u8; 256],
    size: little_endian::U64,
    offset: little_endian::U64,
}

/// Raw on-disk layout for the V3 auxiliary field block at
/// [`V3_EXTRA_OFFSET`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawV3Extra {
    ext_mem_id_size: little_endian::U32,
    tag: [u8; 5],
    additional_records_size: little_endian::U64,
    suffix_map_offset: little_endian::U64,
    suffix_map_size: little_endian::U32,
    sku_map_offset: little_endian::U64,
    sku_map_size: little_endian::U32,
    ftm_model_name: [u8; 32],
    extended_sku_map_offset: little_endian::U64,
    extended_sku_map_size: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawPrefix>() == 8);
const _: () = assert!(mem::size_of::<RawV1Record>() == 264);
const _: () = assert!(mem::size_of::<RawV2Record>() == 272);
const _: () = assert!(mem::size_of::<RawV3Extra>() == 85);

/// A named component inside the envelope (DZ archive, flashing DLL, ...).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Record {
    pub name: String,
    pub size: u64,
    pub offset: u64,
}

/// Placement of an unnamed auxiliary blob (V3 only).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdditionalRecord {
    pub offset: u64,
    pub size: u32,
}

/// Placements of all V3 auxiliary blobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdditionalRecords {
    pub suffix_map: AdditionalRecord,
    pub sku_map: AdditionalRecord,
    pub extended_sku_map: AdditionalRecord,
    pub extended_mem_id: AdditionalRecord,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct KdzHeader {
    pub version: u32,
    pub magic: u32,
    pub size: u32,
    pub tag: String,
    pub ftm_model_name: String,
    pub records: Vec<Record>,
    // Auxiliary placements are recomputed on build and thus not part of the
    // metadata document.
    #[serde(skip)]
    pub additional_records_size: u64,
    #[serde(skip)]
    pub extended_mem_id: AdditionalRecord,
    #[serde(skip)]
    pub suffix_map: AdditionalRecord,
    #[serde(skip)]
    pub sku_map: AdditionalRecord,
    #[serde(skip)]
    pub extended_sku_map: AdditionalRecord,
}

fn decode_name(field: &'static str, buf: &[u8]) -> Result<String> {
    let trimmed = buf.trim_to_nul();

    str::from_utf8(trimmed)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, trimmed.to_vec(), e))
}

fn encode_name<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N]> {
    s.as_bytes()
        .to_padded_array::<N>()
        .ok_or_else(|| Error::StringTooLong(field, s.to_owned()))
}

impl KdzHeader {
    fn parse_v1(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        cursor.seek(SeekFrom::Start(mem::size_of::<RawPrefix>() as u64))?;

        let mut records = vec![];

        for _ in 0..2 {
            let raw = RawV1Record::read_from_io(&mut cursor)?;
            let name = decode_name("name", &raw.name)?;

            if !name.is_empty() {
                records.push(Record {
                    name,
                    size: raw.size.get().into(),
                    offset: raw.offset.get().into(),
                });
            }
        }

        Ok(Self {
            version: 1,
            records,
            ..Default::default()
        })
    }

    fn parse_v2_records(data: &[u8]) -> Result<Vec<Record>> {
        let mut cursor = Cursor::new(data);
        cursor.seek(SeekFrom::Start(mem::size_of::<RawPrefix>() as u64))?;

        let dz = RawV2Record::read_from_io(&mut cursor)?;
        let dll = RawV2Record::read_from_io(&mut cursor)?;

        let mut marker = [0u8; 1];
        cursor.read_exact(&mut marker)?;
        if marker[0] != 0x00 && marker[0] != 0x03 {
            return Err(Error::UnknownMarkerByte(marker[0]));
        }

        let dylib = RawV2Record::read_from_io(&mut cursor)?;

        cursor.seek(SeekFrom::Start(UNKNOWN_RECORD_OFFSET))?;
        let unknown = RawV2Record::read_from_io(&mut cursor)?;

        let mut records = vec![];

        for raw in [dz, dll, dylib, unknown] {
            let name = decode_name("name", &raw.name)?;

            if !name.is_empty() {
                records.push(Record {
                    name,
                    size: raw.size.get(),
                    offset: raw.offset.get(),
                });
            }
        }

        Ok(records)
    }

    fn parse_v2(data: &[u8]) -> Result<Self> {
        Ok(Self {
            version: 2,
            records: Self::parse_v2_records(data)?,
            ..Default::default()
        })
    }

    fn parse_v3(data: &[u8]) -> Result<Self> {
        let records = Self::parse_v2_records(data)?;

        let mut cursor = Cursor::new(data);
        cursor.seek(SeekFrom::Start(V3_EXTRA_OFFSET))?;
        let raw = RawV3Extra::read_from_io(&mut cursor)?;

        Ok(Self {
            version: 3,
            records,
            tag: decode_name("tag", &raw.tag)?,
            ftm_model_name: decode_name("ftm_model_name", &raw.ftm_model_name)?,
            additional_records_size: raw.additional_records_size.get(),
            extended_mem_id: AdditionalRecord {
                offset: EXTENDED_MEM_ID_OFFSET,
                size: raw.ext_mem_id_size.get(),
            },
            suffix_map: AdditionalRecord {
                offset: raw.suffix_map_offset.get(),
                size: raw.suffix_map_size.get(),
            },
            sku_map: AdditionalRecord {
                offset: raw.sku_map_offset.get(),
                size: raw.sku_map_size.get(),
            },
            extended_sku_map: AdditionalRecord {
                offset: raw.extended_sku_map_offset.get(),
                size: raw.extended_sku_map_size.get(),
            },
            ..Default::default()
        })
    }

    /// Find the record whose name contains `pattern` (eg. `.dz`).
    pub fn find_record(&self, pattern: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.name.contains(pattern))
    }

    fn build_v1(&self, records: &[Record]) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(vec![0u8; V1_HDR_SIZE as usize]);

        let prefix = RawPrefix {
            size: V1_HDR_SIZE.into(),
            magic: V1_MAGIC.into(),
        };
        buffer.write_all(prefix.as_bytes())?;

        for pattern in [".dz", ".dll"] {
            let record = records
                .iter()
                .find(|r| r.name.contains(pattern))
                .ok_or(Error::MissingRecord(pattern))?;

            let raw = RawV1Record {
                name: encode_name("name", &record.name)?,
                size: (record.size as u32).into(),
                offset: (record.offset as u32).into(),
            };
            buffer.write_all(raw.as_bytes())?;
        }

        Ok(buffer.into_inner())
    }

    fn build_v2(&self, records: &[Record], size: u32, magic: u32) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(vec![0u8; size as usize]);

        let prefix = RawPrefix {
            size: size.into(),
            magic: magic.into(),
        };
        buffer.write_all(prefix.as_bytes())?;

        let pack_record = |pattern: &str| -> Result<RawV2Record> {
            let mut raw = RawV2Record {
                name: [0u8; 256],
                size: 0.into(),
                offset: 0.into(),
            };

            if let Some(record) = records.iter().find(|r| r.name.contains(pattern)) {
                raw.name = encode_name("name", &record.name)?;
                raw.size = record.size.into();
                raw.offset = record.offset.into();
            }

            Ok(raw)
        };

        buffer.write_all(pack_record(".dz")?.as_bytes())?;
        buffer.write_all(pack_record(".dll")?.as_bytes())?;
        buffer.write_all(&[0x03])?;
        buffer.write_all(pack_record(".dylib")?.as_bytes())?;

        // The unknown record is left zeroed.

        Ok(buffer.into_inner())
    }

    fn build_v3(&self, records: &[Record], additional: &AdditionalRecords) -> Result<Vec<u8>> {
        let data = self.build_v2(records, V3_HDR_SIZE, V3_MAGIC)?;
        let mut buffer = Cursor::new(data);

        let additional_records_size = u64::from(additional.suffix_map.size)
            + u64::from(additional.sku_map.size)
            + u64::from(additional.extended_sku_map.size);

        let raw = RawV3Extra {
            ext_mem_id_size: additional.extended_mem_id.size.into(),
            tag: encode_name("tag", &self.tag)?,
            additional_records_size: additional_records_size.into(),
            suffix_map_offset: additional.suffix_map.offset.into(),
            suffix_map_size: additional.suffix_map.size.into(),
            sku_map_offset: additional.sku_map.offset.into(),
            sku_map_size: additional.sku_map.size.into(),
            ftm_model_name: encode_name("ftm_model_name", &self.ftm_model_name)?,
            extended_sku_map_offset: additional.extended_sku_map.offset.into(),
            extended_sku_map_size: additional.extended_sku_map.size.into(),
        };

        buffer.seek(SeekFrom::Start(V3_EXTRA_OFFSET))?;
        buffer.write_all(raw.as_bytes())?;

        Ok(buffer.into_inner())
    }

    /// Build the header bytes for this envelope. `records` holds the measured
    /// placement of every component record and `additional` the measured
    /// placements of the V3 auxiliary blobs (ignored for V1/V2).
    pub fn build(&self, records: &[Record], additional: &AdditionalRecords) -> Result<Vec<u8>> {
        match self.version {
            1 => self.build_v1(records),
            2 => self.build_v2(records, V2_HDR_SIZE, V2_MAGIC),
            3 => self.build_v3(records, additional),
            v => Err(Error::UnsupportedVersion(v)),
        }
    }
}

impl<R: Read> FromReader<R> for KdzHeader {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let prefix = RawPrefix::read_from_io(&mut reader)?;
        let size = prefix.size.get();
        let magic = prefix.magic.get();

        let (version, hdr_size) = match (size, magic) {
            (V3_HDR_SIZE, V3_MAGIC) => (3, V3_HDR_SIZE),
            (V2_HDR_SIZE, V2_MAGIC) => (2, V2_HDR_SIZE),
            (V1_HDR_SIZE, V1_MAGIC) => (1, V1_HDR_SIZE),
            _ => return Err(Error::UnknownHeader(size, magic)),
        };

        let mut data = vec![0u8; hdr_size as usize];
        data[..mem::size_of::<RawPrefix>()].copy_from_slice(prefix.as_bytes());
        reader.read_exact(&mut data[mem::size_of::<RawPrefix>()..])?;

        let mut header = match version {
            1 => Self::parse_v1(&data)?,
            2 => Self::parse_v2(&data)?,
            _ => Self::parse_v3(&data)?,
        };

        header.magic = magic;
        header.size = size;

        Ok(header)
    }
}

impl fmt::Display for KdzHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "KDZ header v{}:", self.version)?;
        writeln!(f, "- Magic:            {:#010x}", self.magic)?;
        writeln!(f, "- Header size:      {}", self.size)?;
        writeln!(f, "- Records:")?;

        for record in &self.records {
            writeln!(
                f,
                "    - {} ({} bytes @ {})",
                record.name, record.size, record.offset,
            )?;
        }

        if self.version >= 3 {
            writeln!(f, "- Tag:              {:?}", self.tag)?;
            writeln!(f, "- FTM model name:   {:?}", self.ftm_model_name)?;
            writeln!(
                f,
                "- Extended mem ID:  {} bytes @ {}",
                self.extended_mem_id.size, self.extended_mem_id.offset,
            )?;
            writeln!(
                f,
                "- Suffix map:       {} bytes @ {}",
                self.suffix_map.size, self.suffix_map.offset,
            )?;
            writeln!(
                f,
                "- SKU map:          {} bytes @ {}",
                self.sku_map.size, self.sku_map.offset,
            )?;
            writeln!(
                f,
                "- Extended SKU map: {} bytes @ {}",
                self.extended_sku_map.size, self.extended_sku_map.offset,
            )?;
        }

        Ok(())
    }
}

/// Assemble a complete KDZ file: zeroed header placeholder, the Secure
/// Partition block (when non-empty), every component record in ascending
/// original-offset order, the V3 auxiliary blobs, and finally the header
/// rebuilt from the measured placements.
///
/// `read_component` supplies the contents of non-DZ records by name and
/// `read_additional` supplies the V3 auxiliary blobs by key (`suffix_map`,
/// `sku_map`, `extended_sku_map`, `extended_mem_id`). Returning `None` is
/// only valid for records whose recorded size is 0.
pub fn write_archive(
    mut writer: impl Write + Seek,
    header: &KdzHeader,
    dz_data: &[u8],
    secure_partition: &[u8],
    mut read_component: impl FnMut(&str) -> io::Result<Option<Vec<u8>>>,
    mut read_additional: impl FnMut(&str) -> io::Result<Option<Vec<u8>>>,
) -> Result<()> {
    writer.rewind()?;
    writer.write_zeros_exact(header.size.into())?;

    if !secure_partition.is_empty() {
        writer.seek(SeekFrom::Start(secure::SP_OFFSET))?;
        writer.write_all(secure_partition)?;
    }

    // Components keep their original relative order in the file.
    let mut sorted = header.records.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|r| r.offset);

    let mut placements = vec![];

    for record in sorted {
        let pos = writer.stream_position()?;
        if pos < record.offset {
            writer.seek(SeekFrom::Start(record.offset))?;
        }

        let offset = writer.stream_position()?;
        let size;

        if record.name.contains(".dz") {
            writer.write_all(dz_data)?;
            size = dz_data.len() as u64;
        } else {
            match read_component(&record.name)? {
                Some(data) => {
                    writer.write_all(&data)?;
                    size = data.len() as u64;
                }
                None => {
                    if record.size != 0 {
                        return Err(Error::MissingComponent(record.name.clone()));
                    }
                    size = 0;
                }
            }
        }

        placements.push(Record {
            name: record.name.clone(),
            size,
            offset,
        });
    }

    let mut additional = AdditionalRecords::default();

    if header.version >= 3 {
        let slots: [(&str, &mut AdditionalRecord); 4] = [
            ("suffix_map", &mut additional.suffix_map),
            ("sku_map", &mut additional.sku_map),
            ("extended_sku_map", &mut additional.extended_sku_map),
            ("extended_mem_id", &mut additional.extended_mem_id),
        ];

        for (key, slot) in slots {
            let Some(data) = read_additional(key)? else {
                continue;
            };

            // The extended memory ID blob lives at a fixed offset; the maps
            // are appended to the end of the file.
            let offset = if key == "extended_mem_id" {
                EXTENDED_MEM_ID_OFFSET
            } else {
                writer.seek(SeekFrom::End(0))?
            };

            writer.seek(SeekFrom::Start(offset))?;
            writer.write_all(&data)?;

            *slot = AdditionalRecord {
                offset,
                size: data.len() as u32,
            };
        }
    }

    let header_data = header.build(&placements, &additional)?;
    writer.rewind()?;
    writer.write_all(&header_data)?;

    Ok(())
}
