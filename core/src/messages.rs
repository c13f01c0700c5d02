/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Messages exchanged with agents, clients and monitors.
//!
//! Every message is a JSON object tagged by `event`. File contents travel as
//! base64 strings inside the message that carries them, so one message is
//! one streamed item.

use base64::{Engine, engine::general_purpose};
use chrono::{DateTime, Utc};
use entity::{BuildRequestSnapshot, BuildRequestStatus};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub basename: String,
}

/// Raw bytes of one streamed file.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(pub Vec<u8>);

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentInbound {
    Register {
        aid: String,
        platform: String,
        #[serde(default)]
        name: Option<String>,
    },
    Accept {
        #[serde(default)]
        bid: Option<String>,
    },
    Conclude {
        bid: String,
        count: usize,
    },
    Serve {
        bid: String,
        meta: FileMeta,
        data: Payload,
    },
    Fail {
        bid: String,
        #[serde(default)]
        error: Option<String>,
    },
    Log {
        #[serde(default)]
        bid: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentOutbound {
    Hire {
        bid: String,
        count: usize,
    },
    Transfer {
        bid: String,
        meta: FileMeta,
        data: Payload,
    },
    Accept {
        bid: String,
    },
    Confirm {
        bid: String,
    },
    Cancel {
        bid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientInbound {
    Register {
        cid: String,
    },
    Request {
        brid: String,
        #[serde(default)]
        save: bool,
        platforms: Vec<String>,
        #[serde(default)]
        count: usize,
    },
    Upload {
        brid: String,
        #[serde(default)]
        platform: Option<String>,
        meta: FileMeta,
        data: Payload,
    },
    Accept {
        brid: String,
    },
    Error {
        brid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientOutbound {
    Accept {
        brid: String,
    },
    Conclude {
        brid: String,
        count: usize,
    },
    Serve {
        brid: String,
        meta: FileMeta,
        data: Payload,
    },
    Failed {
        brid: String,
        status: BuildRequestStatus,
    },
    /// A log line an agent reported for one of the request's builds.
    Log {
        brid: String,
        bid: String,
        message: String,
    },
}

/// One status broadcast to monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct News {
    pub kind: String,
    pub what: String,
    pub obj: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub date: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub aid: String,
    pub platform: String,
    pub name: Option<String>,
    pub busy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub connection: String,
    pub cid: Option<String>,
    pub brid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub requests: Vec<BuildRequestSnapshot>,
    pub agents: Vec<AgentInfo>,
    pub clients: Vec<ClientInfo>,
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorInbound {
    Refresh,
    Rebuild { id: String },
    Cancel { id: String },
    Delete { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorOutbound {
    Status { snapshot: BrokerSnapshot },
    News(News),
}
