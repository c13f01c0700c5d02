/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer channel closed")]
pub struct ChannelClosed;

/// Ordered outbound path to one peer.
///
/// Streamed items are ordinary messages that carry their bytes, so any
/// transport with ordered delivery can implement this.
#[async_trait]
pub trait PeerChannel<M: Send + 'static>: Send + Sync {
    async fn send(&self, message: M) -> Result<(), ChannelClosed>;
}

#[async_trait]
impl<M: Send + 'static> PeerChannel<M> for mpsc::Sender<M> {
    async fn send(&self, message: M) -> Result<(), ChannelClosed> {
        mpsc::Sender::send(self, message).await.map_err(|_| ChannelClosed)
    }
}

#[async_trait]
impl<M: Send + 'static> PeerChannel<M> for mpsc::UnboundedSender<M> {
    async fn send(&self, message: M) -> Result<(), ChannelClosed> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| ChannelClosed)
    }
}
