/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use kiln_core::init_state;
use std::sync::Arc;

#[tokio::main]
pub async fn main() -> std::io::Result<()> {
    let state = init_state();

    let broker = builder::start_builder(Arc::clone(&state)).await?;
    tracing::info!(
        builds_dir = %state.cli.builds_dir.display(),
        "Broker ready"
    );
    web::serve_web(broker).await?;

    Ok(())
}
