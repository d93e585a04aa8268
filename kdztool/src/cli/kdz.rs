// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    thread,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use rayon::ThreadPoolBuilder;

use crate::{
    cli::{status, warning},
    format::{
        dz::{self, DzHeader, HashMode},
        kdz::{self, KdzHeader},
        secure::SecurePartition,
    },
    metadata::{self, Metadata},
    stream::{self, FromReader, ReadSeek, ToWriter},
};

/// Number of workers for the compress/decompress pool.
fn worker_count() -> usize {
    thread::available_parallelism().map_or(1, |n| (n.get() / 2).max(1))
}

fn build_thread_pool() -> Result<rayon::ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(worker_count())
        .build()
        .context("Failed to build worker thread pool")
}

fn open_reader(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))
}

fn open_writer(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to open for writing: {path:?}"))
}

fn read_optional_file(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Copy `size` bytes of a record out of the container file.
fn copy_record(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = vec![0u8; 65536];

    while size > 0 {
        stream::check_cancel(cancel_signal)?;

        let n = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..n])?;
        writer.write_all(&buf[..n])?;

        size -= n as u64;
    }

    Ok(())
}

fn extract_components(
    reader: &mut File,
    header: &KdzHeader,
    dest: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let components_dir = dest.join("components");
    fs::create_dir_all(&components_dir)
        .with_context(|| format!("Failed to create directory: {components_dir:?}"))?;

    status!("Extracting KDZ components...");

    let mut found = false;

    for record in &header.records {
        if record.name.contains(".dz") || record.size == 0 {
            continue;
        }

        found = true;

        let path = components_dir.join(&record.name);
        status!("  extracting {} ({} bytes)...", record.name, record.size);

        reader.seek(SeekFrom::Start(record.offset))?;
        let writer = open_writer(&path)?;

        copy_record(&mut *reader, writer, record.size, cancel_signal)
            .with_context(|| format!("Failed to extract component: {:?}", record.name))?;
    }

    if !found {
        status!("  no other components to extract");
    }

    Ok(())
}

fn extract_additional_data(
    reader: &mut File,
    header: &KdzHeader,
    dest: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    if header.version < 3 {
        return Ok(());
    }

    let components_dir = dest.join("components");
    fs::create_dir_all(&components_dir)
        .with_context(|| format!("Failed to create directory: {components_dir:?}"))?;

    let records = [
        ("suffix_map.dat", header.suffix_map),
        ("sku_map.dat", header.sku_map),
        ("extended_sku_map.dat", header.extended_sku_map),
        ("extended_mem_id.dat", header.extended_mem_id),
    ];

    for (file_name, record) in records {
        if record.size == 0 {
            continue;
        }

        status!(
            "Extracting additional data: {file_name} ({} bytes)",
            record.size,
        );

        reader.seek(SeekFrom::Start(record.offset))?;
        let writer = open_writer(&components_dir.join(file_name))?;

        copy_record(&mut *reader, writer, record.size.into(), cancel_signal)
            .with_context(|| format!("Failed to extract additional data: {file_name}"))?;
    }

    Ok(())
}

fn print_partition_listing(header: &DzHeader) {
    for (hw_partition, entries) in header.parts.groups() {
        println!("Partition {hw_partition}:");

        for (name, chunks) in entries {
            println!("  {name}");

            for (i, chunk) in chunks.iter().enumerate() {
                let size = u64::from(chunk.data_size)
                    .max(u64::from(chunk.sector_count) * dz::SECTOR_SIZE);

                println!(
                    "    {i}. {} ({size} bytes, sparse: {})",
                    chunk.name, chunk.is_sparse,
                );
            }

            println!();
        }
    }
}

pub fn extract_subcommand(cli: &ExtractCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut reader = open_reader(&cli.input)?;

    let kdz_header = KdzHeader::from_reader(&mut reader)
        .with_context(|| format!("Failed to parse KDZ header: {:?}", cli.input))?;
    println!("{kdz_header}");

    let secure_partition = SecurePartition::from_reader(&mut reader);
    match &secure_partition {
        Some(sp) => println!("{sp}"),
        None => println!("No secure partition found\n"),
    }

    let dz_record = kdz_header
        .records
        .iter()
        .find(|r| r.name.ends_with(".dz"))
        .ok_or_else(|| anyhow!("No DZ record in KDZ file"))?;

    if cli.no_verify {
        warning!("Skipping data hash verification");
    }

    let mode = if cli.no_verify {
        HashMode::Ignore
    } else {
        HashMode::Verify
    };

    reader.seek(SeekFrom::Start(dz_record.offset))?;
    let dz_header = DzHeader::from_reader(BufReader::new(&mut reader), mode, cancel_signal)
        .with_context(|| format!("Failed to parse DZ archive: {:?}", cli.input))?;
    println!("{dz_header}");

    let Some(dest) = &cli.dest else {
        print_partition_listing(&dz_header);
        return Ok(());
    };

    fs::create_dir_all(dest).with_context(|| format!("Failed to create directory: {dest:?}"))?;

    extract_components(&mut reader, &kdz_header, dest, cancel_signal)?;

    let pool = build_thread_pool()?;
    status!("Using {} workers for extraction", worker_count());

    let open_input = || -> io::Result<Box<dyn ReadSeek>> { Ok(Box::new(File::open(&cli.input)?)) };

    for (hw_partition, entries) in dz_header.parts.groups() {
        status!("Partition {hw_partition}:");

        for (name, chunks) in entries {
            status!("  extracting partition {name:?}...");

            let path = dest.join(format!("{hw_partition}.{name}.img"));
            let mut writer = BufWriter::new(open_writer(&path)?);

            let size = dz::extract_partition(
                dz_header.compression,
                chunks,
                open_input,
                &mut writer,
                &pool,
                cancel_signal,
            )
            .with_context(|| format!("Failed to extract partition: {name:?}"))?;

            writer
                .flush()
                .with_context(|| format!("Failed to flush image: {path:?}"))?;

            status!("  done. extracted size = {size} bytes");
        }
    }

    extract_additional_data(&mut reader, &kdz_header, dest, cancel_signal)?;

    status!("Generating {}...", metadata::METADATA_FILE_NAME);

    let metadata = Metadata {
        kdz: kdz_header,
        secure_partition,
        dz: dz_header,
    };

    let path = dest.join(metadata::METADATA_FILE_NAME);
    let mut writer = BufWriter::new(open_writer(&path)?);
    metadata
        .to_writer(&mut writer)
        .with_context(|| format!("Failed to write metadata: {path:?}"))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush metadata: {path:?}"))?;

    status!("Metadata saved to {path:?}");

    Ok(())
}

pub fn repack_subcommand(cli: &RepackCli, cancel_signal: &AtomicBool) -> Result<()> {
    let metadata_path = cli.input_dir.join(metadata::METADATA_FILE_NAME);
    let metadata_file = File::open(&metadata_path)
        .with_context(|| format!("Failed to open metadata: {metadata_path:?}"))?;
    let metadata = Metadata::from_reader(BufReader::new(metadata_file))
        .with_context(|| format!("Failed to parse metadata: {metadata_path:?}"))?;

    let secure_partition = match &metadata.secure_partition {
        Some(sp) => {
            status!("Building secure partition block...");
            sp.to_bytes()
                .context("Failed to build secure partition block")?
        }
        None => vec![],
    };

    // Fail on missing images before any compression work starts.
    for (hw_partition, name, _) in metadata.dz.parts.entries() {
        let path = cli.input_dir.join(format!("{hw_partition}.{name}.img"));
        if !path.exists() {
            bail!("Image file not found: {path:?}");
        }
    }

    let pool = build_thread_pool()?;
    status!("Using {} workers for compression", worker_count());

    status!("Building DZ archive...");

    let open_image = |hw_partition: u32, name: &str| -> io::Result<Box<dyn ReadSeek>> {
        let path = cli.input_dir.join(format!("{hw_partition}.{name}.img"));
        Ok(Box::new(File::open(path)?))
    };

    let dz_data = dz::build_archive(&metadata.dz, open_image, &pool, cancel_signal)
        .context("Failed to build DZ archive")?;
    status!("DZ archive built ({} bytes)", dz_data.len());

    status!("Assembling KDZ file...");

    let components_dir = cli.input_dir.join("components");
    let mut writer = BufWriter::new(open_writer(&cli.output)?);

    kdz::write_archive(
        &mut writer,
        &metadata.kdz,
        &dz_data,
        &secure_partition,
        |name| read_optional_file(&components_dir.join(name)),
        |key| read_optional_file(&components_dir.join(format!("{key}.dat"))),
    )
    .with_context(|| format!("Failed to write KDZ file: {:?}", cli.output))?;

    writer
        .flush()
        .with_context(|| format!("Failed to flush KDZ file: {:?}", cli.output))?;

    status!("KDZ file {:?} created successfully", cli.output);

    Ok(())
}

/// Extract a KDZ file.
#[derive(Debug, Parser)]
pub struct ExtractCli {
    /// Path to the input KDZ firmware file.
    #[arg(value_name = "KDZ_FILE", value_parser)]
    pub input: PathBuf,

    /// Directory to extract files to.
    ///
    /// Only header information is printed when this is not specified.
    #[arg(short = 'd', long, value_name = "PATH", value_parser)]
    pub dest: Option<PathBuf>,

    /// Skip DZ data hash verification.
    #[arg(long)]
    pub no_verify: bool,
}

/// Repack an extracted directory into a KDZ file.
#[derive(Debug, Parser)]
pub struct RepackCli {
    /// Path to the directory containing extracted files and metadata.json.
    #[arg(value_name = "INPUT_DIR", value_parser)]
    pub input_dir: PathBuf,

    /// Path for the new output KDZ file.
    #[arg(value_name = "OUTPUT_FILE", value_parser)]
    pub output: PathBuf,
}
