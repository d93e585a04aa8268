// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, Cursor, Seek, SeekFrom},
    sync::atomic::AtomicBool,
};

use chrono::NaiveDate;
use kdztool::{
    format::{
        compression::CompressedFormat,
        dz::{self, Chunk, DzHeader, HashMode},
        kdz::{self, KdzHeader, Record},
    },
    metadata::Metadata,
    stream::{FromReader, ReadSeek, ToWriter},
    util::OrderedGroups,
};

fn pool() -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .build()
        .unwrap()
}

/// Full extract/repack cycle over a synthetic V1 KDZ containing one DLL
/// component and a single-chunk zlib-compressed boot partition.
#[test]
fn extract_repack_cycle() {
    let cancel_signal = AtomicBool::new(false);

    let temp_dir = tempfile::tempdir().unwrap();
    let image = (0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    fs::write(temp_dir.path().join("0.boot.img"), &image).unwrap();
    fs::create_dir(temp_dir.path().join("components")).unwrap();
    fs::write(temp_dir.path().join("components/flash.dll"), b"hello").unwrap();

    let mut parts = OrderedGroups::new();
    parts.push(
        0,
        "boot",
        Chunk {
            name: "boot_0".into(),
            data_size: 4096,
            file_offset: 0,
            file_size: 0,
            hash: [0; 16],
            crc: 0,
            start_sector: 0,
            sector_count: 1,
            part_start_sector: 0,
            unique_part_id: 7,
            is_sparse: false,
            is_ubi_image: false,
        },
    );

    let metadata = Metadata {
        kdz: KdzHeader {
            version: 1,
            magic: kdz::V1_MAGIC,
            size: kdz::V1_HDR_SIZE,
            records: vec![
                Record {
                    name: "LMG850.dz".into(),
                    size: 0,
                    offset: 8192,
                },
                Record {
                    name: "flash.dll".into(),
                    size: 5,
                    offset: 4096,
                },
            ],
            ..Default::default()
        },
        secure_partition: None,
        dz: DzHeader {
            magic: dz::DZ_MAGIC,
            major: 0,
            minor: 1,
            model_name: "LMG850".into(),
            sw_version: "G850QM10e_00".into(),
            part_count: 1,
            chunk_hdrs_hash: [0; 16],
            data_hash: [0; 16],
            header_crc: 0,
            secure_image_type: 0,
            build_date: Some(
                NaiveDate::from_ymd_opt(2021, 3, 14)
                    .unwrap()
                    .and_hms_opt(1, 59, 26)
                    .unwrap(),
            ),
            compression: CompressedFormat::Zlib,
            swfv: "SWFV".into(),
            build_type: "user".into(),
            android_ver: "11".into(),
            memory_size: "128".into(),
            signed_security: "S".into(),
            is_ufs: true,
            anti_rollback_ver: 0,
            supported_mem: "SKhynix".into(),
            target_product: "G850".into(),
            multi_panel_mask: 0,
            product_fuse_id: 0,
            is_factory_image: true,
            operator_code: vec!["OPEN".into()],
            unknown_0: 0,
            unknown_1: 0,
            unknown_2: 0,
            parts,
        },
    };

    // Repack.
    let open_image = |hw_partition: u32, name: &str| -> io::Result<Box<dyn ReadSeek>> {
        let path = temp_dir.path().join(format!("{hw_partition}.{name}.img"));
        Ok(Box::new(File::open(path)?))
    };

    let dz_data = dz::build_archive(&metadata.dz, open_image, &pool(), &cancel_signal).unwrap();

    let components_dir = temp_dir.path().join("components");
    let mut kdz_file = Cursor::new(Vec::new());
    kdz::write_archive(
        &mut kdz_file,
        &metadata.kdz,
        &dz_data,
        &[],
        |name| match fs::read(components_dir.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        },
        |_| Ok(None),
    )
    .unwrap();

    // Extract.
    kdz_file.rewind().unwrap();
    let kdz_header = KdzHeader::from_reader(&mut kdz_file).unwrap();

    assert_eq!(kdz_header.version, 1);
    assert_eq!(kdz_header.records.len(), 2);

    let dll = kdz_header.find_record(".dll").unwrap();
    assert_eq!((dll.offset, dll.size), (4096, 5));
    assert_eq!(&kdz_file.get_ref()[4096..4101], b"hello");

    let dz_record = kdz_header.find_record(".dz").unwrap();
    assert_eq!(dz_record.offset, 8192);
    assert_eq!(dz_record.size, dz_data.len() as u64);

    kdz_file.seek(SeekFrom::Start(dz_record.offset)).unwrap();
    let dz_header =
        DzHeader::from_reader(&mut kdz_file, HashMode::Verify, &cancel_signal).unwrap();

    assert_eq!(dz_header.build_date, metadata.dz.build_date);
    assert_eq!(dz_header.is_factory_image, true);

    let (hw_partition, name, chunks) = dz_header.parts.entries().next().unwrap();
    assert_eq!((hw_partition, name), (0, "boot"));
    assert_eq!(chunks[0].unique_part_id, 7);
    assert_eq!(chunks[0].part_start_sector, 0);

    let file_data = kdz_file.get_ref().clone();
    let open_input = move || -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(Cursor::new(file_data.clone())))
    };

    let mut writer = Cursor::new(Vec::new());
    let size = dz::extract_partition(
        dz_header.compression,
        chunks,
        open_input,
        &mut writer,
        &pool(),
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(size, 4096);
    assert_eq!(writer.into_inner(), image);

    // The metadata document round-trips with order preserved.
    let extracted = Metadata {
        kdz: kdz_header,
        secure_partition: None,
        dz: dz_header,
    };

    let mut json = vec![];
    extracted.to_writer(&mut json).unwrap();
    let reloaded = Metadata::from_reader(json.as_slice()).unwrap();
    assert_eq!(reloaded, extracted);

    // Repacking from the extracted metadata reproduces the DZ archive
    // bit-for-bit.
    let rebuilt = dz::build_archive(&reloaded.dz, open_image, &pool(), &cancel_signal).unwrap();
    assert_eq!(rebuilt, dz_data);
}
