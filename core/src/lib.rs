/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod consts;
pub mod input;
pub mod messages;
pub mod storage;
pub mod types;

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use types::*;

pub fn init_state() -> Arc<ServerState> {
    let cli = Cli::parse();

    init_logging(&cli);
    tracing::info!("Starting Kiln Server on {}:{}", cli.ip, cli.port);

    Arc::new(ServerState { cli })
}

pub fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match cli.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}
