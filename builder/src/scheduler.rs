/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::agent::AgentHandle;
use entity::{Build, BuildStatus};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, instrument};

/// A queued build matched to an agent whose assignment flag is already claimed.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub agent: AgentHandle,
    pub build: Arc<Build>,
}

/// Matches queued builds to idle agents.
///
/// `add` must tolerate the same build being submitted again after a requeue.
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler: Send + Sync {
    fn add_target(&self, agent: AgentHandle);
    /// Removes `agent`'s own registration. A newer session that registered
    /// the same agent id stays.
    fn remove_target(&self, agent: &AgentHandle);
    fn supported_platforms(&self) -> BTreeSet<String>;
    fn add(&self, build: Arc<Build>);
    fn remove(&self, bid: &str) -> Option<Arc<Build>>;
    fn get_build(&self, bid: &str) -> Option<Arc<Build>>;
    fn assign(&self) -> Vec<Assignment>;
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Arc<Build>>,
    targets: Vec<AgentHandle>,
}

/// FIFO scheduler. A build without a free agent keeps its place in the queue
/// but does not hold back the builds behind it.
#[derive(Debug, Default)]
pub struct QueueScheduler {
    state: Mutex<QueueState>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn queued(&self) -> Vec<String> {
        self.state()
            .queue
            .iter()
            .map(|build| build.bid().to_string())
            .collect()
    }
}

impl Scheduler for QueueScheduler {
    fn add_target(&self, agent: AgentHandle) {
        let mut state = self.state();
        state.targets.retain(|target| target.aid() != agent.aid());
        state.targets.push(agent);
    }

    fn remove_target(&self, agent: &AgentHandle) {
        self.state()
            .targets
            .retain(|target| !target.same_session(agent));
    }

    fn supported_platforms(&self) -> BTreeSet<String> {
        self.state()
            .targets
            .iter()
            .map(|target| target.platform().to_string())
            .collect()
    }

    fn add(&self, build: Arc<Build>) {
        let mut state = self.state();
        if state.queue.iter().any(|queued| queued.bid() == build.bid()) {
            debug!(bid = %build.bid(), "Build already queued");
            return;
        }

        state.queue.push_back(build);
    }

    fn remove(&self, bid: &str) -> Option<Arc<Build>> {
        let mut state = self.state();
        let position = state.queue.iter().position(|build| build.bid() == bid)?;
        state.queue.remove(position)
    }

    fn get_build(&self, bid: &str) -> Option<Arc<Build>> {
        self.state()
            .queue
            .iter()
            .find(|build| build.bid() == bid)
            .cloned()
    }

    #[instrument(skip(self))]
    fn assign(&self) -> Vec<Assignment> {
        let mut state = self.state();
        let mut assignments = Vec::new();
        let mut waiting = VecDeque::with_capacity(state.queue.len());

        while let Some(build) = state.queue.pop_front() {
            if build.status() != BuildStatus::Queued {
                debug!(bid = %build.bid(), status = %build.status(), "Dropping stale queue entry");
                continue;
            }

            let agent = state
                .targets
                .iter()
                .find(|agent| agent.platform() == build.platform() && agent.try_claim())
                .cloned();

            match agent {
                Some(agent) => {
                    debug!(bid = %build.bid(), aid = %agent.aid(), "Matched build to agent");
                    assignments.push(Assignment { agent, build });
                }
                None => waiting.push_back(build),
            }
        }

        state.queue = waiting;
        assignments
    }
}
