// SPDX-FileCopyrightText: 2024-2025 kdztool contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::{
    format::{dz::DzHeader, kdz::KdzHeader, secure::SecurePartition},
    stream::{FromReader, ToWriter},
};

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// The descriptor document written alongside extracted images. It carries
/// everything needed to rebuild the original file, with partition and chunk
/// insertion order preserved.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Metadata {
    pub kdz: KdzHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_partition: Option<SecurePartition>,
    pub dz: DzHeader,
}

impl<R: Read> FromReader<R> for Metadata {
    type Error = serde_json::Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error> {
        serde_json::from_reader(reader)
    }
}

impl<W: Write> ToWriter<W> for Metadata {
    type Error = serde_json::Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(writer, formatter);

        self.serialize(&mut serializer)
    }
}
