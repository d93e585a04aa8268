/*
 * SPDX-FileCopyrightText: 2024-2025 kdztool contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::cli::kdz;

#[derive(Debug, Subcommand)]
pub enum Command {
    Extract(kdz::ExtractCli),
    Repack(kdz::RepackCli),
}

/// Extract and repack LG KDZ firmware images.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

pub fn main(cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    match cli.command {
        Command::Extract(c) => kdz::extract_subcommand(&c, cancel_signal),
        Command::Repack(c) => kdz::repack_subcommand(&c, cancel_signal),
    }
}
