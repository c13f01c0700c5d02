/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::build::{Build, BuildSnapshot, BuildStatus};
use super::build_file::BuildFile;
use super::{TransitionError, read, write};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildRequestStatus {
    Uploading,
    Processing,
    Finished,
    Delivered,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    InputsReceived,
    /// Every child build reached a terminal status.
    Settle { any_success: bool },
    Deliver,
    Fail,
    Cancel,
    Rebuild,
}

impl BuildRequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildRequestStatus::Delivered | BuildRequestStatus::Failed | BuildRequestStatus::Cancelled
        )
    }

    pub fn transition(self, event: RequestEvent) -> Option<BuildRequestStatus> {
        use BuildRequestStatus as S;
        use RequestEvent as E;

        match (self, event) {
            (S::Uploading, E::InputsReceived) => Some(S::Processing),
            (S::Processing, E::Settle { any_success: true }) => Some(S::Finished),
            (S::Processing, E::Settle { any_success: false }) => Some(S::Failed),
            (S::Finished, E::Deliver) => Some(S::Delivered),
            (S::Uploading | S::Processing | S::Finished, E::Fail) => Some(S::Failed),
            (S::Uploading | S::Processing, E::Cancel) => Some(S::Cancelled),
            (S::Finished | S::Delivered | S::Failed | S::Cancelled, E::Rebuild) => {
                Some(S::Processing)
            }
            _ => None,
        }
    }
}

impl fmt::Display for BuildRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildRequestStatus::Uploading => "uploading",
            BuildRequestStatus::Processing => "processing",
            BuildRequestStatus::Finished => "finished",
            BuildRequestStatus::Delivered => "delivered",
            BuildRequestStatus::Failed => "failed",
            BuildRequestStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BuildRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(BuildRequestStatus::Uploading),
            "processing" => Ok(BuildRequestStatus::Processing),
            "finished" => Ok(BuildRequestStatus::Finished),
            "delivered" => Ok(BuildRequestStatus::Delivered),
            "failed" => Ok(BuildRequestStatus::Failed),
            "cancelled" => Ok(BuildRequestStatus::Cancelled),
            _ => Err(format!("Unknown build request status: {}", s)),
        }
    }
}

/// Serialized form of a request, used for monitors and the on-disk manifest.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BuildRequestSnapshot {
    pub brid: String,
    pub platforms: Vec<String>,
    pub save: bool,
    pub client: Option<String>,
    pub status: BuildRequestStatus,
    pub inputs: Vec<BuildFile>,
    pub builds: Vec<BuildSnapshot>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RequestState {
    status: BuildRequestStatus,
    inputs: Vec<BuildFile>,
    builds: Vec<Arc<Build>>,
}

#[derive(Debug)]
pub struct BuildRequest {
    brid: String,
    platforms: Vec<String>,
    save: bool,
    client: Option<String>,
    created_at: DateTime<Utc>,
    state: RwLock<RequestState>,
    status_tx: watch::Sender<BuildRequestStatus>,
}

impl BuildRequest {
    /// Creates the request and one child build per distinct platform.
    pub fn new(brid: &str, platforms: &[String], save: bool, client: Option<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(platforms.len());
        for platform in platforms {
            if !unique.contains(platform) {
                unique.push(platform.clone());
            }
        }

        let builds = unique
            .iter()
            .map(|platform| Arc::new(Build::new(brid, platform)))
            .collect();

        let (status_tx, _) = watch::channel(BuildRequestStatus::Uploading);

        Self {
            brid: brid.to_string(),
            platforms: unique,
            save,
            client,
            created_at: Utc::now(),
            state: RwLock::new(RequestState {
                status: BuildRequestStatus::Uploading,
                inputs: Vec::new(),
                builds,
            }),
            status_tx,
        }
    }

    pub fn from_snapshot(snapshot: BuildRequestSnapshot) -> Self {
        let (status_tx, _) = watch::channel(snapshot.status);

        Self {
            brid: snapshot.brid,
            platforms: snapshot.platforms,
            save: snapshot.save,
            client: snapshot.client,
            created_at: snapshot.created_at,
            state: RwLock::new(RequestState {
                status: snapshot.status,
                inputs: snapshot.inputs,
                builds: snapshot
                    .builds
                    .into_iter()
                    .map(|build| Arc::new(Build::from_snapshot(build)))
                    .collect(),
            }),
            status_tx,
        }
    }

    pub fn brid(&self) -> &str {
        &self.brid
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    pub fn wants_save(&self) -> bool {
        self.save
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn builds(&self) -> Vec<Arc<Build>> {
        read(&self.state).builds.clone()
    }

    pub fn build(&self, platform: &str) -> Option<Arc<Build>> {
        read(&self.state)
            .builds
            .iter()
            .find(|build| build.platform() == platform)
            .cloned()
    }

    /// Removes a child build from the request.
    pub fn detach(&self, bid: &str) -> Option<Arc<Build>> {
        let mut state = write(&self.state);
        let position = state.builds.iter().position(|build| build.bid() == bid)?;
        Some(state.builds.remove(position))
    }

    pub fn status(&self) -> BuildRequestStatus {
        read(&self.state).status
    }

    /// Receiver that observes every status change of this request.
    pub fn subscribe(&self) -> watch::Receiver<BuildRequestStatus> {
        self.status_tx.subscribe()
    }

    pub fn apply(&self, event: RequestEvent) -> Result<BuildRequestStatus, TransitionError> {
        let mut state = write(&self.state);
        let next = state.status.transition(event).ok_or_else(|| TransitionError {
            id: self.brid.clone(),
            from: state.status.to_string(),
            event: format!("{:?}", event),
        })?;

        state.status = next;
        self.status_tx.send_replace(next);
        Ok(next)
    }

    /// Settles a processing request once every child is terminal. A request
    /// whose children were all cancelled is cancelled itself.
    ///
    /// Returns the new status if the request changed.
    pub fn refresh(&self) -> Option<BuildRequestStatus> {
        if self.status() != BuildRequestStatus::Processing {
            return None;
        }

        let statuses: Vec<BuildStatus> = self.builds().iter().map(|build| build.status()).collect();
        if !statuses.iter().all(|status| status.is_terminal()) {
            return None;
        }

        if !statuses.is_empty() && statuses.iter().all(|status| *status == BuildStatus::Cancelled) {
            return self.apply(RequestEvent::Cancel).ok();
        }

        let any_success = statuses.contains(&BuildStatus::Success);
        self.apply(RequestEvent::Settle { any_success }).ok()
    }

    pub fn add_input(&self, file: BuildFile) {
        write(&self.state).inputs.push(file);
    }

    pub fn inputs(&self) -> Vec<BuildFile> {
        read(&self.state).inputs.clone()
    }

    /// Hands every child build the inputs tagged for its platform.
    pub fn distribute_inputs(&self) {
        let inputs = self.inputs();
        for build in self.builds() {
            let files = inputs
                .iter()
                .filter(|file| file.applies_to(build.platform()))
                .cloned()
                .collect();
            build.set_inputs(files);
        }
    }

    pub fn artifacts(&self) -> Vec<BuildFile> {
        self.builds()
            .iter()
            .flat_map(|build| build.artifacts())
            .collect()
    }

    pub fn snapshot(&self) -> BuildRequestSnapshot {
        let state = read(&self.state);
        BuildRequestSnapshot {
            brid: self.brid.clone(),
            platforms: self.platforms.clone(),
            save: self.save,
            client: self.client.clone(),
            status: state.status,
            inputs: state.inputs.clone(),
            builds: state.builds.iter().map(|build| build.snapshot()).collect(),
            created_at: self.created_at,
        }
    }
}
