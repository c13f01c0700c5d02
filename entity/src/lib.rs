/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod build;
pub mod build_file;
pub mod build_request;

pub use build::{Build, BuildEvent, BuildSnapshot, BuildStatus};
pub use build_file::BuildFile;
pub use build_request::{BuildRequest, BuildRequestSnapshot, BuildRequestStatus, RequestEvent};

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for '{id}': {event} from {from}")]
pub struct TransitionError {
    pub id: String,
    pub from: String,
    pub event: String,
}

// Guarded sections never panic, so a poisoned lock still holds consistent data.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
