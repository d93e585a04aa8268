/*
 * SPDX-FileCopyrightText: 2024-2025 kdztool contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod compression;
pub mod dz;
pub mod kdz;
pub mod secure;
