/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Bulk file handoff shared by every file movement.
//!
//! The sender announces a count, the receiver answers with an accept for the
//! same id, then exactly that many items follow. The receiver counts items
//! down and treats zero as completion; there is no end-of-transfer message.

use super::channel::{ChannelClosed, PeerChannel};
use entity::BuildFile;
use kiln_core::messages::{FileMeta, Payload};
use kiln_core::storage::{self, StorageError};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("file {} has no usable name", .0.display())]
    Unnamed(PathBuf),
    #[error(transparent)]
    Channel(#[from] ChannelClosed),
}

/// Receiving side of a batch, created when the receiver sends its accept.
///
/// Holds only the counter; every item is persisted as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingBatch {
    id: String,
    expected: usize,
    remaining: usize,
}

impl IncomingBatch {
    pub fn accept(id: impl Into<String>, expected: usize) -> Self {
        Self {
            id: id.into(),
            expected,
            remaining: expected,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Whether an item tagged with `id` belongs to this batch.
    pub fn admits(&self, id: &str) -> bool {
        self.id == id && self.remaining > 0
    }

    /// Counts one persisted item. Returns `true` once the batch is complete.
    pub fn record(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.is_complete()
    }
}

pub async fn receive_item(path: &Path, data: &Payload) -> Result<(), TransferError> {
    storage::write_file(path, &data.0).await?;
    Ok(())
}

/// Sending side of a batch: announced, waiting for the peer's accept.
#[derive(Debug, Clone)]
pub struct OutgoingBatch {
    id: String,
    files: Vec<BuildFile>,
}

impl OutgoingBatch {
    pub fn announce(id: impl Into<String>, files: Vec<BuildFile>) -> Self {
        Self {
            id: id.into(),
            files,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    /// Streams every file as one message, in announcement order.
    ///
    /// Stops at the first failure; the caller abandons the whole batch.
    pub async fn stream<M, C, F>(&self, channel: &C, make: F) -> Result<usize, TransferError>
    where
        M: Send + 'static,
        C: PeerChannel<M> + ?Sized,
        F: Fn(FileMeta, Payload) -> M,
    {
        for file in &self.files {
            let basename = file
                .basename()
                .ok_or_else(|| TransferError::Unnamed(file.local_path().to_path_buf()))?
                .to_string();
            let data = storage::read_file(file.local_path()).await?;

            debug!(id = %self.id, basename = %basename, bytes = data.len(), "Streaming file");
            channel.send(make(FileMeta { basename }, Payload(data))).await?;
        }

        Ok(self.files.len())
    }
}
