/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod agent;
pub mod broker;
pub mod channel;
pub mod client;
pub mod scheduler;
pub mod transfer;

#[cfg(test)]
mod tests;

use broker::Broker;
use kiln_core::types::ServerState;
use scheduler::QueueScheduler;
use std::sync::Arc;
use tracing::error;

pub async fn start_builder(state: Arc<ServerState>) -> std::io::Result<Arc<Broker>> {
    let broker = Arc::new(Broker::new(
        Arc::clone(&state),
        Arc::new(QueueScheduler::new()),
    ));

    if let Err(e) = broker.load_previous_builds().await {
        error!(error = %e, "Failed to load previous builds");
        return Err(std::io::Error::other(e.to_string()));
    }

    tokio::spawn(Arc::clone(&broker).schedule_build_loop());
    Ok(broker)
}
