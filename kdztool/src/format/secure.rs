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
    stream::ReadVecExt,
    util::{NulPadding, OrderedGroups},
};

/// Fixed file offset of the Secure Partition block.
pub const SP_OFFSET: u64 = 1320;
/// Fixed size of the Secure Partition block.
pub const SP_SIZE: usize = 82_448;
/// Magic value for [`RawHeader::magic`].
pub const SP_MAGIC: u32 = 0x53430799;

/// Maximum number of partition records that fit in the block.
const MAX_RECORDS: u32 =
    ((SP_SIZE - mem::size_of::<RawHeader>()) / mem::size_of::<RawRecord>()) as u32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Record count exceeds block capacity: {0} > {MAX_RECORDS}")]
    TooManyRecords(u32),
    #[error("Signature size exceeds field size: {0} > 512")]
    SignatureTooLarge(usize),
    #[error("Record #{index} ({name:?}): Unexpected reserved field value: {value}")]
    ReservedNotZero {
        index: usize,
        name: String,
        value: u32,
    },
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("{0:?} field is too long: {1:?}")]
    StringTooLong(&'static str, String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the block header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    magic: little_endian::U32,
    flags: little_endian::U32,
    part_count: little_endian::U32,
    sig_size: little_endian::U32,
    signature: [u8; 512],
}

/// Raw on-disk layout for a partition record.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawRecord {
    name: [u8; 30],
    hw_part: u8,
    logical_part: u8,
    start_sect: little_endian::U32,
    end_sect: little_endian::U32,
    data_sect_cnt: little_endian::U32,
    reserved: little_endian::U32,
    hash: [u8; 32],
}

const _: () = assert!(mem::size_of::<RawHeader>() == 528);
const _: () = assert!(mem::size_of::<RawRecord>() == 80);

/// A logical partition listed in the signed table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Part {
    pub name: String,
    pub hw_part: u8,
    pub logical_part: u8,
    pub start_sect: u32,
    pub end_sect: u32,
    pub data_sect_cnt: u32,
    pub reserved: u32,
    #[serde(with = "hex")]
    pub hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "SecurePartitionRepr", into = "SecurePartitionRepr")]
pub struct SecurePartition {
    pub magic: u32,
    pub flags: u32,
    pub part_count: u32,
    pub signature: Vec<u8>,
    pub parts: OrderedGroups<u8, Part>,
}

/// Flat serialized form: the nested grouping is rebuilt from the record order
/// on deserialization.
#[derive(Deserialize, Serialize)]
struct SecurePartitionRepr {
    magic: u32,
    flags: u32,
    part_count: u32,
    #[serde(with = "hex")]
    signature: Vec<u8>,
    partitions: Vec<Part>,
}

impl From<SecurePartition> for SecurePartitionRepr {
    fn from(sp: SecurePartition) -> Self {
        let partitions = sp
            .parts
            .entries()
            .flat_map(|(_, _, parts)| parts.iter().cloned())
            .collect();

        Self {
            magic: sp.magic,
            flags: sp.flags,
            part_count: sp.part_count,
            signature: sp.signature,
            partitions,
        }
    }
}

impl From<SecurePartitionRepr> for SecurePartition {
    fn from(repr: SecurePartitionRepr) -> Self {
        let mut parts = OrderedGroups::new();

        for part in repr.partitions {
            let (hw_part, name) = (part.hw_part, part.name.clone());
            parts.push(hw_part, &name, part);
        }

        Self {
            magic: repr.magic,
            flags: repr.flags,
            part_count: repr.part_count,
            signature: repr.signature,
            parts,
        }
    }
}

impl SecurePartition {
    fn parse(mut reader: impl Read + Seek) -> Result<Self> {
        reader.seek(SeekFrom::Start(SP_OFFSET))?;
        let data = reader.read_exact_vec(SP_SIZE)?;

        let mut cursor = Cursor::new(data.as_slice());
        let header = RawHeader::read_from_io(&mut cursor)?;

        if header.magic.get() != SP_MAGIC {
            return Err(Error::InvalidMagic(header.magic.get()));
        }

        let part_count = header.part_count.get();
        if part_count > MAX_RECORDS {
            return Err(Error::TooManyRecords(part_count));
        }

        let sig_size = header.sig_size.get() as usize;
        if sig_size > header.signature.len() {
            return Err(Error::SignatureTooLarge(sig_size));
        }

        let mut parts = OrderedGroups::new();

        for index in 0..part_count as usize {
            let raw = RawRecord::read_from_io(&mut cursor)?;

            let name = raw.name.trim_to_nul();
            let name = str::from_utf8(name)
                .map_err(|e| Error::StringNotUtf8("name", name.to_vec(), e))?
                .to_owned();

            if raw.reserved.get() != 0 {
                return Err(Error::ReservedNotZero {
                    index,
                    name,
                    value: raw.reserved.get(),
                });
            }

            let part = Part {
                name: name.clone(),
                hw_part: raw.hw_part,
                logical_part: raw.logical_part,
                start_sect: raw.start_sect.get(),
                end_sect: raw.end_sect.get(),
                data_sect_cnt: raw.data_sect_cnt.get(),
                reserved: raw.reserved.get(),
                hash: raw.hash,
            };

            parts.push(part.hw_part, &name, part);
        }

        Ok(Self {
            magic: header.magic.get(),
            flags: header.flags.get(),
            part_count,
            signature: header.signature[..sig_size].to_vec(),
            parts,
        })
    }

    /// Parse the optional Secure Partition block. The block is absent when the
    /// magic does not match; structural and I/O failures are also treated as
    /// absent since the block is not mandatory.
    pub fn from_reader(reader: impl Read + Seek) -> Option<Self> {
        match Self::parse(reader) {
            Ok(sp) => Some(sp),
            Err(Error::InvalidMagic(_)) => None,
            Err(e) => {
                tracing::warn!("Ignoring unparsable secure partition: {e}");
                None
            }
        }
    }

    /// Build the fixed-size block, zero-padded at the tail.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.signature.len() > 512 {
            return Err(Error::SignatureTooLarge(self.signature.len()));
        }

        let record_count = self.parts.len() as u32;
        if record_count > MAX_RECORDS {
            return Err(Error::TooManyRecords(record_count));
        }

        let mut buffer = Cursor::new(vec![0u8; SP_SIZE]);

        let header = RawHeader {
            magic: self.magic.into(),
            flags: self.flags.into(),
            part_count: record_count.into(),
            sig_size: (self.signature.len() as u32).into(),
            signature: self
                .signature
                .to_padded_array::<512>()
                .expect("Signature length already checked"),
        };
        buffer.write_all(header.as_bytes())?;

        for (_, name, parts) in self.parts.entries() {
            for part in parts {
                let raw = RawRecord {
                    name: part
                        .name
                        .as_bytes()
                        .to_padded_array::<30>()
                        .ok_or_else(|| Error::StringTooLong("name", name.to_owned()))?,
                    hw_part: part.hw_part,
                    logical_part: part.logical_part,
                    start_sect: part.start_sect.into(),
                    end_sect: part.end_sect.into(),
                    data_sect_cnt: part.data_sect_cnt.into(),
                    reserved: part.reserved.into(),
                    hash: part.hash,
                };
                buffer.write_all(raw.as_bytes())?;
            }
        }

        Ok(buffer.into_inner())
    }
}

impl fmt::Display for SecurePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Secure partition:")?;
        writeln!(f, "- Magic:      {:#010x}", self.magic)?;
        writeln!(f, "- Flags:      {:#010x}", self.flags)?;
        writeln!(f, "- Signature:  {}", hex::encode(&self.signature))?;
        writeln!(f, "- Partitions: {}", self.parts.len())?;

        Ok(())
    }
}
