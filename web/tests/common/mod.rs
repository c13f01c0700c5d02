/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use builder::broker::Broker;
use builder::scheduler::QueueScheduler;
use kiln_core::types::*;
use std::path::Path;
use std::sync::Arc;

pub fn create_mock_cli(root: &Path) -> Cli {
    Cli {
        log_level: "info".to_string(),
        log_format: LogFormat::Pretty,
        ip: "127.0.0.1".to_string(),
        port: 8000,
        builds_dir: root.to_path_buf(),
        keep: 0,
        dispatch_interval: 1,
        cancel_orphaned_requests: false,
        log_history: 500,
        key: None,
        cert: None,
    }
}

pub fn create_mock_state(root: &Path) -> Arc<ServerState> {
    Arc::new(ServerState {
        cli: create_mock_cli(root),
    })
}

pub fn create_broker(root: &Path) -> Arc<Broker> {
    Arc::new(Broker::new(
        create_mock_state(root),
        Arc::new(QueueScheduler::new()),
    ))
}
