// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

fn main() -> ExitCode {
    let cancel_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = cancel_signal.clone();

    // The flag is polled by every per-chunk loop, so Ctrl-C aborts at the
    // next iteration instead of killing the process mid-write.
    if ctrlc::set_handler(move || handler_signal.store(true, Ordering::SeqCst)).is_err() {
        eprintln!("An error occurred: cannot install the interrupt handler");
        return ExitCode::FAILURE;
    }

    if let Err(e) = kdztool::cli::args::main(&cancel_signal) {
        eprintln!("An error occurred: {e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
