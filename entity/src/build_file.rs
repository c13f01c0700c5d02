/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A file stored below the builds root on behalf of a request.
///
/// `platform` is `None` for inputs that apply to every platform of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
    pub brid: String,
    pub platform: Option<String>,
    pub local_path: PathBuf,
}

impl BuildFile {
    pub fn new(brid: impl Into<String>, local_path: impl Into<PathBuf>, platform: Option<String>) -> Self {
        Self {
            brid: brid.into(),
            platform,
            local_path: local_path.into(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn basename(&self) -> Option<&str> {
        self.local_path.file_name().and_then(|name| name.to_str())
    }

    pub fn applies_to(&self, platform: &str) -> bool {
        match &self.platform {
            Some(p) => p == platform,
            None => true,
        }
    }
}
