/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::input::{greater_than_zero, port_in_range};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "Kiln", display_name = "Kiln", bin_name = "kiln-server", author = "Wavelens", version, about, long_about = None)]
pub struct Cli {
    #[arg(long, env = "KILN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "KILN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
    #[arg(long, env = "KILN_IP", default_value = "127.0.0.1")]
    pub ip: String,
    #[arg(long, env = "KILN_PORT", value_parser = port_in_range, default_value_t = 8000)]
    pub port: u16,
    #[arg(long, env = "KILN_BUILDS_DIR", default_value = "builds")]
    pub builds_dir: PathBuf,
    #[arg(long, env = "KILN_KEEP", default_value_t = 0)]
    pub keep: usize,
    #[arg(long, env = "KILN_DISPATCH_INTERVAL", value_parser = greater_than_zero::<u64>, default_value = "1")]
    pub dispatch_interval: u64,
    #[arg(long, env = "KILN_CANCEL_ORPHANED_REQUESTS", default_value = "false")]
    pub cancel_orphaned_requests: bool,
    #[arg(long, env = "KILN_LOG_HISTORY", value_parser = greater_than_zero::<usize>, default_value = "500")]
    pub log_history: usize,
    #[arg(long, env = "KILN_KEY", requires = "cert")]
    pub key: Option<PathBuf>,
    #[arg(long, visible_alias = "certificate", env = "KILN_CERT", requires = "key")]
    pub cert: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug)]
pub struct ServerState {
    pub cli: Cli,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BaseResponse<T> {
    pub error: bool,
    pub message: T,
}
