/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::ops::RangeInclusive;

pub const PORT_RANGE: RangeInclusive<usize> = 1..=65535;

/// Platform name a client sends to build for every platform with a registered agent.
pub const AUTODETECT_PLATFORM: &str = "autodetect";

pub const INPUT_DIR: &str = "in";
pub const OUTPUT_DIR: &str = "out";
pub const MANIFEST_FILE: &str = "build.json";
