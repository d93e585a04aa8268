// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashMap, io, io::Cursor, sync::atomic::AtomicBool};

use chrono::NaiveDate;
use kdztool::{
    format::{
        compression::CompressedFormat,
        dz::{self, Chunk, DzHeader, HashMode},
    },
    stream::ReadSeek,
    util::OrderedGroups,
};

fn pool() -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .build()
        .unwrap()
}

fn chunk(
    name: &str,
    data_size: u32,
    start_sector: u32,
    sector_count: u32,
    part_start_sector: u32,
) -> Chunk {
    Chunk {
        name: name.to_owned(),
        data_size,
        file_offset: 0,
        file_size: 0,
        hash: [0; 16],
        crc: 0,
        start_sector,
        sector_count,
        part_start_sector,
        unique_part_id: 0,
        is_sparse: false,
        is_ubi_image: false,
    }
}

fn header(minor: u32, compression: CompressedFormat, parts: OrderedGroups<u32, Chunk>) -> DzHeader {
    DzHeader {
        magic: dz::DZ_MAGIC,
        major: 2,
        minor,
        model_name: "LMG850".into(),
        sw_version: "G850QM10e_00".into(),
        part_count: parts.len() as u32,
        chunk_hdrs_hash: [0; 16],
        data_hash: [0; 16],
        header_crc: 0,
        secure_image_type: 1,
        build_date: Some(
            NaiveDate::from_ymd_opt(2020, 6, 1)
                .unwrap()
                .and_hms_opt(12, 34, 56)
                .unwrap(),
        ),
        compression,
        swfv: "SWFV10e".into(),
        build_type: "user".into(),
        android_ver: "10".into(),
        memory_size: "128".into(),
        signed_security: "S".into(),
        is_ufs: true,
        anti_rollback_ver: 3,
        supported_mem: "SKhynix 128GB".into(),
        target_product: "G850".into(),
        multi_panel_mask: 0,
        product_fuse_id: 1,
        is_factory_image: false,
        operator_code: vec!["OPEN".into(), "CA".into()],
        unknown_0: 0,
        unknown_1: 0,
        unknown_2: 0,
        parts,
    }
}

fn image_opener(
    images: HashMap<(u32, String), Vec<u8>>,
) -> impl Fn(u32, &str) -> io::Result<Box<dyn ReadSeek>> + Sync {
    move |hw_partition, name| {
        let data = images[&(hw_partition, name.to_owned())].clone();
        Ok(Box::new(Cursor::new(data)))
    }
}

fn buffer_opener(data: Vec<u8>) -> impl Fn() -> io::Result<Box<dyn ReadSeek>> + Sync {
    move || Ok(Box::new(Cursor::new(data.clone())))
}

/// Header byte offsets used to corrupt specific fields. These match the
/// 512-byte main header layout.
const WEEKDAY_OFFSET: usize = 180;
const DATA_HASH_OFFSET: usize = 222;
const HEADER_CRC_OFFSET: usize = 308;

/// Recompute the stored header CRC after a test patches header bytes.
fn fix_header_crc(data: &mut [u8]) {
    let mut copy = data[..512].to_vec();
    copy[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].fill(0);
    copy[DATA_HASH_OFFSET..DATA_HASH_OFFSET + 16].fill(0);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&copy);

    data[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4]
        .copy_from_slice(&hasher.finalize().to_le_bytes());
}

fn sparse_boot_archive(compression: CompressedFormat) -> (DzHeader, Vec<u8>, Vec<u8>) {
    // Sectors 0-1 and 4 are covered by chunks; sectors 2-3 are a hole.
    let mut image = vec![0u8; 20480];
    for (i, b) in image[..8192].iter_mut().enumerate() {
        *b = i as u8;
    }
    image[16384..].fill(0xcd);

    let mut parts = OrderedGroups::new();
    parts.push(0, "boot", chunk("boot_0", 8192, 0, 2, 0));
    parts.push(0, "boot", chunk("boot_4", 4096, 4, 1, 0));

    let header = header(1, compression, parts);
    let images = HashMap::from([((0, "boot".to_owned()), image.clone())]);

    let cancel_signal = AtomicBool::new(false);
    let data = dz::build_archive(&header, image_opener(images), &pool(), &cancel_signal).unwrap();

    (header, image, data)
}

#[test]
fn round_trip_sparse_image() {
    let (header, image, data) = sparse_boot_archive(CompressedFormat::Zlib);
    let cancel_signal = AtomicBool::new(false);

    let parsed =
        DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal).unwrap();

    assert_eq!(parsed.model_name, header.model_name);
    assert_eq!(parsed.build_date, header.build_date);
    assert_eq!(parsed.compression, CompressedFormat::Zlib);
    assert_eq!(parsed.part_count, 2);
    assert_eq!(parsed.parts.len(), 2);
    assert_eq!(parsed.operator_code, header.operator_code);

    // Rebuilding from the parsed descriptor must be byte-identical, and
    // reparsing must yield a deep-equal descriptor.
    let images = HashMap::from([((0, "boot".to_owned()), image.clone())]);
    let rebuilt =
        dz::build_archive(&parsed, image_opener(images), &pool(), &cancel_signal).unwrap();
    assert_eq!(data, rebuilt);

    let reparsed =
        DzHeader::from_reader(Cursor::new(&rebuilt), HashMode::Verify, &cancel_signal).unwrap();
    assert_eq!(parsed, reparsed);

    // Sparse reconstruction: the hole reads back as zeros and the image is
    // padded to its full length.
    let (_, _, chunks) = parsed.parts.entries().next().unwrap();

    let mut writer = Cursor::new(Vec::new());
    let size = dz::extract_partition(
        parsed.compression,
        chunks,
        buffer_opener(data),
        &mut writer,
        &pool(),
        &cancel_signal,
    )
    .unwrap();

    let out = writer.into_inner();
    assert_eq!(size, 20480);
    assert_eq!(out.len(), 20480);
    assert!(out[8192..16384].iter().all(|b| *b == 0));
    assert_eq!(out, image);
}

#[test]
fn round_trip_zstd() {
    let (_, image, data) = sparse_boot_archive(CompressedFormat::Zstd);
    let cancel_signal = AtomicBool::new(false);

    let parsed =
        DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal).unwrap();
    assert_eq!(parsed.compression, CompressedFormat::Zstd);

    let (_, _, chunks) = parsed.parts.entries().next().unwrap();

    let mut writer = Cursor::new(Vec::new());
    dz::extract_partition(
        parsed.compression,
        chunks,
        buffer_opener(data),
        &mut writer,
        &pool(),
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(writer.into_inner(), image);
}

#[test]
fn header_crc_mismatch() {
    let (_, _, mut data) = sparse_boot_archive(CompressedFormat::Zlib);
    let cancel_signal = AtomicBool::new(false);

    // Corrupt the model name without refreshing the CRC.
    data[20] ^= 0xff;

    let err = DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal)
        .unwrap_err();
    assert!(err.to_string().starts_with("Header CRC mismatch"), "{err}");
}

#[test]
fn data_hash_mismatch_only_checked_when_verifying() {
    let (_, _, mut data) = sparse_boot_archive(CompressedFormat::Zlib);
    let cancel_signal = AtomicBool::new(false);

    // The stored data hash is not covered by the header CRC, so corrupting it
    // only trips the data hash check.
    data[DATA_HASH_OFFSET] ^= 0x01;

    let err = DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal)
        .unwrap_err();
    assert!(err.to_string().starts_with("Data hash mismatch"), "{err}");

    DzHeader::from_reader(Cursor::new(&data), HashMode::Ignore, &cancel_signal).unwrap();
}

#[test]
fn chunk_hash_mismatch() {
    let (_, _, mut data) = sparse_boot_archive(CompressedFormat::Zlib);
    let cancel_signal = AtomicBool::new(false);

    // First payload byte, after the main header and first chunk header.
    data[1024] ^= 0xff;

    let err = DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal)
        .unwrap_err();
    assert!(err.to_string().contains("Hash mismatch"), "{err}");

    // Payloads are not hashed when verification is disabled.
    DzHeader::from_reader(Cursor::new(&data), HashMode::Ignore, &cancel_signal).unwrap();
}

#[test]
fn invalid_weekday() {
    let (_, _, mut data) = sparse_boot_archive(CompressedFormat::Zlib);
    let cancel_signal = AtomicBool::new(false);

    let weekday = u16::from_le_bytes([data[WEEKDAY_OFFSET], data[WEEKDAY_OFFSET + 1]]);
    let wrong = (weekday + 1) % 7;
    data[WEEKDAY_OFFSET..WEEKDAY_OFFSET + 2].copy_from_slice(&wrong.to_le_bytes());
    fix_header_crc(&mut data);

    let err = DzHeader::from_reader(Cursor::new(&data), HashMode::Ignore, &cancel_signal)
        .unwrap_err();
    assert!(err.to_string().starts_with("Invalid build weekday"), "{err}");
}

#[test]
fn part_start_sector_mismatch() {
    // Partition "a" spans sectors 0-3, so "b" is tracked to start at sector
    // 4. Its header claims sector 2 instead.
    let mut parts = OrderedGroups::new();
    parts.push(0, "a", chunk("a_0", 16384, 0, 4, 0));
    parts.push(0, "b", chunk("b_0", 4096, 10, 1, 2));

    let header = header(1, CompressedFormat::Zlib, parts);
    let images = HashMap::from([
        ((0, "a".to_owned()), vec![0x11u8; 16384]),
        ((0, "b".to_owned()), vec![0x22u8; 36864]),
    ]);

    let cancel_signal = AtomicBool::new(false);
    let data = dz::build_archive(&header, image_opener(images), &pool(), &cancel_signal).unwrap();

    let err = DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal)
        .unwrap_err();
    assert!(
        err.to_string().starts_with("Mismatch in part start sector"),
        "{err}",
    );
}

#[test]
fn v0_archive() {
    let image = (0..4096u32).map(|i| i as u8).collect::<Vec<_>>();

    let mut parts = OrderedGroups::new();
    parts.push(0, "boot", chunk("boot.img_0", 4096, 0, 0, 0));

    let header = header(0, CompressedFormat::Zlib, parts);
    let images = HashMap::from([((0, "boot".to_owned()), image.clone())]);

    let cancel_signal = AtomicBool::new(false);
    let data = dz::build_archive(&header, image_opener(images), &pool(), &cancel_signal).unwrap();

    let parsed =
        DzHeader::from_reader(Cursor::new(&data), HashMode::Verify, &cancel_signal).unwrap();
    assert_eq!(parsed.minor, 0);

    let (hw_partition, name, chunks) = parsed.parts.entries().next().unwrap();
    assert_eq!(hw_partition, 0);
    assert_eq!(name, "boot");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].crc, 0);
    assert_eq!(chunks[0].sector_count, 0);

    let mut writer = Cursor::new(Vec::new());
    let size = dz::extract_partition(
        parsed.compression,
        chunks,
        buffer_opener(data),
        &mut writer,
        &pool(),
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(size, 4096);
    assert_eq!(writer.into_inner(), image);
}
