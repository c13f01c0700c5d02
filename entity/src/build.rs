/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::build_file::BuildFile;
use super::{TransitionError, read, write};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Created,
    Queued,
    Transferring,
    Building,
    Collecting,
    Success,
    Failed,
    Cancelled,
}

/// Everything that may happen to a build. Statuses only change through
/// [`BuildStatus::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Enqueue,
    Hire { agent: String },
    InputsDelivered,
    Conclude,
    Complete,
    Requeue,
    Fail,
    Cancel,
    Rebuild,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled)
    }

    /// Statuses in which an agent session holds the build.
    pub fn is_assigned(&self) -> bool {
        matches!(
            self,
            BuildStatus::Transferring | BuildStatus::Building | BuildStatus::Collecting
        )
    }

    pub fn transition(self, event: &BuildEvent) -> Option<BuildStatus> {
        use BuildEvent as E;
        use BuildStatus as S;

        match (self, event) {
            (S::Created | S::Queued, E::Enqueue) => Some(S::Queued),
            (S::Queued, E::Hire { .. }) => Some(S::Transferring),
            (S::Transferring, E::InputsDelivered) => Some(S::Building),
            (S::Building, E::Conclude) => Some(S::Collecting),
            (S::Collecting, E::Complete) => Some(S::Success),
            (S::Transferring | S::Building | S::Collecting, E::Requeue) => Some(S::Queued),
            (s, E::Fail) if !s.is_terminal() => Some(S::Failed),
            (s, E::Cancel) if !s.is_terminal() => Some(S::Cancelled),
            (s, E::Rebuild) if s.is_terminal() => Some(S::Queued),
            _ => None,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Created => "created",
            BuildStatus::Queued => "queued",
            BuildStatus::Transferring => "transferring",
            BuildStatus::Building => "building",
            BuildStatus::Collecting => "collecting",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BuildStatus::Created),
            "queued" => Ok(BuildStatus::Queued),
            "transferring" => Ok(BuildStatus::Transferring),
            "building" => Ok(BuildStatus::Building),
            "collecting" => Ok(BuildStatus::Collecting),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            "cancelled" => Ok(BuildStatus::Cancelled),
            _ => Err(format!("Unknown build status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BuildSnapshot {
    pub bid: String,
    pub brid: String,
    pub platform: String,
    pub status: BuildStatus,
    pub inputs: Vec<BuildFile>,
    pub artifacts: Vec<BuildFile>,
    pub agent: Option<String>,
    pub logs: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BuildState {
    status: BuildStatus,
    inputs: Vec<BuildFile>,
    artifacts: Vec<BuildFile>,
    agent: Option<String>,
    logs: Vec<String>,
    updated_at: DateTime<Utc>,
}

/// One platform-specific unit of work of a [`super::BuildRequest`].
#[derive(Debug)]
pub struct Build {
    bid: String,
    brid: String,
    platform: String,
    state: RwLock<BuildState>,
}

impl Build {
    pub fn new(brid: &str, platform: &str) -> Self {
        Self {
            bid: Self::make_bid(platform, brid),
            brid: brid.to_string(),
            platform: platform.to_string(),
            state: RwLock::new(BuildState {
                status: BuildStatus::Created,
                inputs: Vec::new(),
                artifacts: Vec::new(),
                agent: None,
                logs: Vec::new(),
                updated_at: Utc::now(),
            }),
        }
    }

    pub fn from_snapshot(snapshot: BuildSnapshot) -> Self {
        Self {
            bid: snapshot.bid,
            brid: snapshot.brid,
            platform: snapshot.platform,
            state: RwLock::new(BuildState {
                status: snapshot.status,
                inputs: snapshot.inputs,
                artifacts: snapshot.artifacts,
                agent: snapshot.agent,
                logs: snapshot.logs,
                updated_at: snapshot.updated_at,
            }),
        }
    }

    pub fn make_bid(platform: &str, brid: &str) -> String {
        format!("{}:{}", platform, brid)
    }

    pub fn bid(&self) -> &str {
        &self.bid
    }

    pub fn brid(&self) -> &str {
        &self.brid
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn status(&self) -> BuildStatus {
        read(&self.state).status
    }

    pub fn agent(&self) -> Option<String> {
        read(&self.state).agent.clone()
    }

    pub fn inputs(&self) -> Vec<BuildFile> {
        read(&self.state).inputs.clone()
    }

    pub fn artifacts(&self) -> Vec<BuildFile> {
        read(&self.state).artifacts.clone()
    }

    pub fn logs(&self) -> Vec<String> {
        read(&self.state).logs.clone()
    }

    /// Applies `event` if the transition table allows it.
    ///
    /// `Hire` records the agent, `Requeue` and `Rebuild` drop the agent and any
    /// partially collected artifacts. Inputs are never touched here.
    pub fn apply(&self, event: BuildEvent) -> Result<BuildStatus, TransitionError> {
        let mut state = write(&self.state);
        let next = state.status.transition(&event).ok_or_else(|| TransitionError {
            id: self.bid.clone(),
            from: state.status.to_string(),
            event: format!("{:?}", event),
        })?;

        match event {
            BuildEvent::Hire { agent } => state.agent = Some(agent),
            BuildEvent::Requeue | BuildEvent::Rebuild => {
                state.agent = None;
                state.artifacts.clear();
            }
            _ => {}
        }

        state.status = next;
        state.updated_at = Utc::now();
        Ok(next)
    }

    pub fn set_inputs(&self, inputs: Vec<BuildFile>) {
        write(&self.state).inputs = inputs;
    }

    pub fn add_artifact(&self, artifact: BuildFile) {
        write(&self.state).artifacts.push(artifact);
    }

    pub fn push_log(&self, line: impl Into<String>) {
        write(&self.state).logs.push(line.into());
    }

    pub fn snapshot(&self) -> BuildSnapshot {
        let state = read(&self.state);
        BuildSnapshot {
            bid: self.bid.clone(),
            brid: self.brid.clone(),
            platform: self.platform.clone(),
            status: state.status,
            inputs: state.inputs.clone(),
            artifacts: state.artifacts.clone(),
            agent: state.agent.clone(),
            logs: state.logs.clone(),
            updated_at: state.updated_at,
        }
    }
}
