// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Cursor;

use kdztool::{
    format::secure::{self, Part, SecurePartition},
    util::OrderedGroups,
};

fn part(name: &str, hw_part: u8, start_sect: u32, end_sect: u32) -> Part {
    Part {
        name: name.to_owned(),
        hw_part,
        logical_part: 0,
        start_sect,
        end_sect,
        data_sect_cnt: end_sect - start_sect,
        reserved: 0,
        hash: [0x5a; 32],
    }
}

fn test_partition() -> SecurePartition {
    let mut parts = OrderedGroups::new();

    for p in [
        part("boot", 0, 0, 100),
        part("recovery", 0, 100, 200),
        part("misc", 1, 0, 50),
    ] {
        let (hw_part, name) = (p.hw_part, p.name.clone());
        parts.push(hw_part, &name, p);
    }

    SecurePartition {
        magic: secure::SP_MAGIC,
        flags: 0x11,
        part_count: 3,
        signature: vec![0xaa; 64],
        parts,
    }
}

/// Wrap a built block in a file-shaped buffer starting at [`secure::SP_OFFSET`].
fn to_file(block: &[u8]) -> Vec<u8> {
    let mut file = vec![0u8; secure::SP_OFFSET as usize];
    file.extend_from_slice(block);
    file
}

#[test]
fn round_trip() {
    let sp = test_partition();

    let block = sp.to_bytes().unwrap();
    assert_eq!(block.len(), secure::SP_SIZE);

    let parsed = SecurePartition::from_reader(Cursor::new(to_file(&block))).unwrap();
    assert_eq!(parsed, sp);
}

#[test]
fn absent_on_wrong_magic() {
    let sp = test_partition();

    let mut block = sp.to_bytes().unwrap();
    block[0] ^= 0xff;

    assert!(SecurePartition::from_reader(Cursor::new(to_file(&block))).is_none());
}

#[test]
fn absent_on_nonzero_reserved() {
    let sp = test_partition();

    let mut block = sp.to_bytes().unwrap();
    // Reserved field of record #0: 528-byte header, then 30 + 1 + 1 + 12
    // bytes into the record.
    block[528 + 44] = 1;

    assert!(SecurePartition::from_reader(Cursor::new(to_file(&block))).is_none());
}

#[test]
fn absent_on_short_read() {
    assert!(SecurePartition::from_reader(Cursor::new(vec![0u8; 2000])).is_none());
}

#[test]
fn serde_flattens_partitions() {
    let sp = test_partition();

    let json = serde_json::to_value(&sp).unwrap();
    let partitions = json["partitions"].as_array().unwrap();
    assert_eq!(partitions.len(), 3);
    assert_eq!(partitions[0]["name"], "boot");
    assert_eq!(partitions[2]["hw_part"], 1);
    assert_eq!(json["signature"], hex::encode(vec![0xaa; 64]));

    let parsed: SecurePartition = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, sp);
}
