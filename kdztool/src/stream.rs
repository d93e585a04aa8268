// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Reader/writer building blocks shared by the format codecs. The worker
//! pools deal in boxed handles because every compression task opens its own
//! view of the underlying file.

use std::{
    io::{self, Read, Seek, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::util;

/// Readers that can also seek, as a single object-safe bound. `dyn Read +
/// Seek` itself is not expressible, so the pipelines hand out
/// `Box<dyn ReadSeek>` instead.
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// Writer counterpart of [`ReadSeek`].
pub trait WriteSeek: Write + Seek {}

impl<W: Write + Seek> WriteSeek for W {}

/// Parse a whole structure out of a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Serialize a whole structure into a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Read an exact number of bytes into a freshly allocated buffer.
pub trait ReadVecExt {
    fn read_exact_vec(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadVecExt for R {
    fn read_exact_vec(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Zero-fill writers. Sector gaps in sparse images and the fixed-size tails
/// of the container blocks are both written this way.
pub trait WriteZerosExt {
    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()>;
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros_exact(&mut self, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let n = size.min(util::ZEROS.len() as u64) as usize;
            self.write_all(&util::ZEROS[..n])?;
            size -= n as u64;
        }

        Ok(())
    }
}

/// Fail with [`io::ErrorKind::Interrupted`] once the Ctrl-C flag is set.
/// Per-chunk loops poll this so cancellation stays responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Operation cancelled",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Write},
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::{ReadVecExt, WriteZerosExt, check_cancel};

    #[test]
    fn read_exact_vec() {
        let mut reader = Cursor::new(b"foobar");

        assert_eq!(reader.read_exact_vec(4).unwrap(), b"foob");
        assert_eq!(reader.read_exact_vec(2).unwrap(), b"ar");

        let err = reader.read_exact_vec(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn write_zeros() {
        let mut writer = Cursor::new(Vec::new());
        writer.write_all(b"ab").unwrap();
        writer.write_zeros_exact(3).unwrap();
        writer.write_all(b"c").unwrap();
        assert_eq!(writer.into_inner(), b"ab\0\0\0c");

        // Larger than one scratch buffer.
        let mut writer = Cursor::new(Vec::new());
        writer.write_zeros_exact(40_000).unwrap();
        assert_eq!(writer.get_ref().len(), 40_000);
        assert!(writer.get_ref().iter().all(|b| *b == 0));

        // A writer with no room left reports the failure.
        let mut full = Cursor::new([0u8; 4]);
        full.write_all(b"abcd").unwrap();
        let err = full.write_zeros_exact(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn cancel_flag() {
        let cancel_signal = AtomicBool::new(false);
        check_cancel(&cancel_signal).unwrap();

        cancel_signal.store(true, Ordering::SeqCst);
        let err = check_cancel(&cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
