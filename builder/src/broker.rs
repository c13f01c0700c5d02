/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::agent::{AgentCommand, AgentHandle};
use super::client::{ClientCommand, ClientHandle};
use super::scheduler::{Assignment, Scheduler};
use anyhow::Result;
use chrono::Utc;
use kiln_core::messages::{AgentInfo, BrokerSnapshot, ClientInfo, LogLine, News};
use kiln_core::storage;
use kiln_core::types::ServerState;
use entity::{
    Build, BuildEvent, BuildFile, BuildRequest, BuildRequestStatus, BuildStatus, RequestEvent,
    TransitionError,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const NEWS_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("build request {0} already exists")]
    DuplicateRequest(String),
    #[error("could not find build or build request {0}")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Registries of agents, requests and builds, plus the dispatch trigger.
///
/// Every status change passes through [`Broker::update_build`] or
/// [`Broker::update_request`] so monitors see it and terminal requests are
/// written to disk.
pub struct Broker {
    state: Arc<ServerState>,
    scheduler: Arc<dyn Scheduler>,
    agents: RwLock<HashMap<String, AgentHandle>>,
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    requests: RwLock<HashMap<String, Arc<BuildRequest>>>,
    builds: RwLock<HashMap<String, Arc<Build>>>,
    logs: Mutex<VecDeque<LogLine>>,
    news: broadcast::Sender<News>,
    wake: Notify,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Broker {
    pub fn new(state: Arc<ServerState>, scheduler: Arc<dyn Scheduler>) -> Self {
        let (news, _) = broadcast::channel(NEWS_BUFFER);

        Self {
            state,
            scheduler,
            agents: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            requests: RwLock::new(HashMap::new()),
            builds: RwLock::new(HashMap::new()),
            logs: Mutex::new(VecDeque::new()),
            news,
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn builds_root(&self) -> PathBuf {
        self.state.cli.builds_dir.clone()
    }

    pub fn add_agent(&self, agent: AgentHandle) {
        self.log(format!(
            "Agent {} registered for platform {}",
            agent.aid(),
            agent.platform()
        ));
        self.notify("register", "agent", &agent_info(&agent));

        write(&self.agents).insert(agent.aid().to_string(), agent.clone());
        self.scheduler.add_target(agent);
        self.wake_dispatch();
    }

    /// Deregisters `agent`, unless its id was taken over by a newer session.
    pub fn remove_agent(&self, agent: &AgentHandle) {
        self.scheduler.remove_target(agent);

        let removed = {
            let mut agents = write(&self.agents);
            match agents.get(agent.aid()) {
                Some(current) if current.same_session(agent) => agents.remove(agent.aid()),
                Some(_) => {
                    debug!(aid = %agent.aid(), "Agent id belongs to a newer session");
                    None
                }
                None => None,
            }
        };

        if let Some(agent) = removed {
            self.log(format!("Agent {} disconnected", agent.aid()));
            self.notify("unregister", "agent", &agent_info(&agent));
        }
    }

    pub fn agent(&self, aid: &str) -> Option<AgentHandle> {
        read(&self.agents).get(aid).cloned()
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = read(&self.agents).values().map(agent_info).collect();
        agents.sort_by(|a, b| a.aid.cmp(&b.aid));
        agents
    }

    /// Registers a client session or refreshes its entry.
    pub fn add_client(&self, client: ClientHandle) {
        let info = client.info();
        let previous = write(&self.clients).insert(client.connection(), client);

        match previous {
            None => self.notify("register", "client", &info),
            Some(previous) if previous.info() != info => self.notify("update", "client", &info),
            Some(_) => {}
        }
    }

    pub fn remove_client(&self, connection: Uuid) {
        if let Some(client) = write(&self.clients).remove(&connection) {
            self.notify("unregister", "client", &client.info());
        }
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = read(&self.clients)
            .values()
            .map(ClientHandle::info)
            .collect();
        clients.sort_by(|a, b| a.connection.cmp(&b.connection));
        clients
    }

    /// Sends an agent's log line for `build` to the client that owns its
    /// request.
    pub fn forward_log(&self, build: &Build, message: &str) {
        let clients = read(&self.clients);
        let owners = clients
            .values()
            .filter(|client| client.brid() == Some(build.brid()));

        for client in owners {
            let command = ClientCommand::Log {
                bid: build.bid().to_string(),
                message: message.to_string(),
            };
            if !client.send(command) {
                debug!(bid = %build.bid(), connection = %client.connection(), "Client session is gone");
            }
        }
    }

    pub fn supported_platforms(&self) -> BTreeSet<String> {
        self.scheduler.supported_platforms()
    }

    /// Queues `build` for dispatch. Builds that cannot be queued any more
    /// (cancelled meanwhile, for example) are left alone.
    pub async fn add_build(&self, build: &Arc<Build>) {
        if self.update_build(build, BuildEvent::Enqueue).await.is_err() {
            return;
        }

        write(&self.builds).insert(build.bid().to_string(), Arc::clone(build));
        self.scheduler.add(Arc::clone(build));
        self.wake_dispatch();
    }

    /// Returns a build whose agent went away to the queue.
    pub async fn requeue_build(&self, build: &Arc<Build>) {
        if !build.status().is_assigned() {
            debug!(bid = %build.bid(), status = %build.status(), "Not requeueing unassigned build");
            return;
        }

        if self.update_build(build, BuildEvent::Requeue).await.is_ok() {
            self.add_build(build).await;
        }
    }

    pub fn get_build(&self, bid: &str) -> Option<Arc<Build>> {
        read(&self.builds)
            .get(bid)
            .cloned()
            .or_else(|| self.scheduler.get_build(bid))
    }

    pub fn get_build_request(&self, brid: &str) -> Option<Arc<BuildRequest>> {
        read(&self.requests).get(brid).cloned()
    }

    pub async fn add_build_request(&self, request: Arc<BuildRequest>) -> Result<(), BrokerError> {
        {
            let mut requests = write(&self.requests);
            if requests.contains_key(request.brid()) {
                return Err(BrokerError::DuplicateRequest(request.brid().to_string()));
            }

            requests.insert(request.brid().to_string(), Arc::clone(&request));
        }

        {
            let mut builds = write(&self.builds);
            for build in request.builds() {
                builds.insert(build.bid().to_string(), Arc::clone(&build));
            }
        }

        self.log(format!(
            "Build request {} created for platforms {}",
            request.brid(),
            request.platforms().join(", ")
        ));
        self.notify("created", "request", &request.snapshot());
        Ok(())
    }

    /// All known requests, oldest first.
    pub fn requests(&self) -> Vec<Arc<BuildRequest>> {
        let mut requests: Vec<Arc<BuildRequest>> = read(&self.requests).values().cloned().collect();
        requests.sort_by_key(|request| request.created_at());
        requests
    }

    /// Applies `event` to `build`, then lets the parent request settle.
    pub async fn update_build(
        &self,
        build: &Arc<Build>,
        event: BuildEvent,
    ) -> Result<BuildStatus, TransitionError> {
        let status = match build.apply(event) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Ignoring build transition");
                return Err(e);
            }
        };

        build.push_log(format!("Status changed to {}", status));
        self.log(format!("Platform {} update status: {}", build.platform(), status));
        self.notify(&status.to_string(), "build", &build.snapshot());

        if let Some(request) = self.get_build_request(build.brid()) {
            self.settle(&request).await;
        }

        Ok(status)
    }

    pub async fn update_request(
        &self,
        request: &Arc<BuildRequest>,
        event: RequestEvent,
    ) -> Result<BuildRequestStatus, TransitionError> {
        let status = match request.apply(event) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Ignoring build request transition");
                return Err(e);
            }
        };

        self.request_changed(request, status).await;
        self.settle(request).await;
        Ok(status)
    }

    async fn settle(&self, request: &Arc<BuildRequest>) {
        if let Some(status) = request.refresh() {
            self.request_changed(request, status).await;
        }
    }

    async fn request_changed(&self, request: &Arc<BuildRequest>, status: BuildRequestStatus) {
        self.log(format!("Build request {} update status: {}", request.brid(), status));
        self.notify(&status.to_string(), "request", &request.snapshot());

        if status.is_terminal() || status == BuildRequestStatus::Finished {
            self.persist(request).await;
        }

        if status.is_terminal() {
            self.prune().await;
        }
    }

    async fn persist(&self, request: &Arc<BuildRequest>) {
        match storage::write_manifest(&self.builds_root(), &request.snapshot()).await {
            Ok(path) => debug!(brid = %request.brid(), path = %path.display(), "Wrote manifest"),
            Err(e) => error!(brid = %request.brid(), error = %e, "Failed to write manifest"),
        }
    }

    /// Drops the oldest settled requests beyond `keep`, on disk as well.
    async fn prune(&self) {
        let keep = self.state.cli.keep;
        if keep == 0 {
            return;
        }

        let settled: Vec<Arc<BuildRequest>> = self
            .requests()
            .into_iter()
            .filter(|request| is_settled(request))
            .collect();

        let excess = settled.len().saturating_sub(keep);
        for request in settled.into_iter().take(excess) {
            self.forget(&request);

            match storage::remove_request_dir(&self.builds_root(), request.brid()).await {
                Ok(()) => info!(brid = %request.brid(), "Pruned old build request"),
                Err(e) => warn!(brid = %request.brid(), error = %e, "Failed to prune build request"),
            }
        }
    }

    /// Drops a request and its builds from the registries and the queue.
    fn forget(&self, request: &BuildRequest) {
        write(&self.requests).remove(request.brid());

        let mut builds = write(&self.builds);
        for build in request.builds() {
            self.scheduler.remove(build.bid());
            builds.remove(build.bid());
        }
    }

    pub fn add_artifact(&self, build: &Arc<Build>, artifact: BuildFile) {
        build.add_artifact(artifact);
    }

    pub fn add_input(&self, request: &Arc<BuildRequest>, input: BuildFile) {
        request.add_input(input);
    }

    /// Cancels a build, or a request together with all of its builds.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<(), BrokerError> {
        if let Some(build) = self.get_build(id) {
            self.cancel_build(&build).await;
            return Ok(());
        }

        let request = self
            .get_build_request(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

        if matches!(
            request.status(),
            BuildRequestStatus::Uploading | BuildRequestStatus::Processing
        ) {
            self.update_request(&request, RequestEvent::Cancel).await?;
        }

        for build in request.builds() {
            self.cancel_build(&build).await;
        }

        Ok(())
    }

    /// Removes a build, or a request together with all of its builds, from
    /// the broker and from disk. Unfinished work is cancelled first.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), BrokerError> {
        if let Some(build) = self.get_build(id) {
            self.delete_build(&build).await;
            return Ok(());
        }

        let request = self
            .get_build_request(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

        self.cancel(id).await?;
        self.forget(&request);

        if let Err(e) = storage::remove_request_dir(&self.builds_root(), request.brid()).await {
            warn!(brid = %request.brid(), error = %e, "Failed to remove build request directory");
        }

        self.log(format!("Build request {} deleted", request.brid()));
        self.notify("deleted", "request", &request.snapshot());
        Ok(())
    }

    async fn delete_build(&self, build: &Arc<Build>) {
        self.cancel_build(build).await;
        self.scheduler.remove(build.bid());
        write(&self.builds).remove(build.bid());

        if let Err(e) =
            storage::remove_output_dir(&self.builds_root(), build.brid(), build.platform()).await
        {
            warn!(bid = %build.bid(), error = %e, "Failed to remove build artifacts");
        }

        self.log(format!("Build {} deleted", build.bid()));
        self.notify("deleted", "build", &build.snapshot());

        let Some(request) = self.get_build_request(build.brid()) else {
            return;
        };

        request.detach(build.bid());
        self.settle(&request).await;

        let status = request.status();
        if status.is_terminal() || status == BuildRequestStatus::Finished {
            self.persist(&request).await;
        }
    }

    async fn cancel_build(&self, build: &Arc<Build>) {
        let status = build.status();
        if status.is_terminal() {
            debug!(bid = %build.bid(), status = %status, "Build already finished");
            return;
        }

        self.scheduler.remove(build.bid());
        if self.update_build(build, BuildEvent::Cancel).await.is_err() {
            return;
        }

        if status.is_assigned()
            && let Some(agent) = build.agent().and_then(|aid| self.agent(&aid))
            && !agent.send(AgentCommand::Cancel(build.bid().to_string()))
        {
            warn!(bid = %build.bid(), aid = %agent.aid(), "Agent session is gone");
        }
    }

    /// Runs a finished build, or every finished build of a request, again.
    ///
    /// Builds are queued before the request reopens, otherwise the request
    /// would settle right away on its old results.
    #[instrument(skip(self))]
    pub async fn rebuild(&self, id: &str) -> Result<(), BrokerError> {
        if let Some(build) = self.get_build(id) {
            let request = self
                .get_build_request(build.brid())
                .ok_or_else(|| BrokerError::NotFound(build.brid().to_string()))?;
            self.rebuild_build(&build).await?;
            self.reopen(&request).await?;
            return Ok(());
        }

        let request = self
            .get_build_request(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

        for build in request.builds() {
            if build.status().is_terminal() {
                self.rebuild_build(&build).await?;
            }
        }

        self.reopen(&request).await
    }

    async fn reopen(&self, request: &Arc<BuildRequest>) -> Result<(), BrokerError> {
        match request.status() {
            BuildRequestStatus::Uploading | BuildRequestStatus::Processing => Ok(()),
            _ => {
                self.update_request(request, RequestEvent::Rebuild).await?;
                Ok(())
            }
        }
    }

    async fn rebuild_build(&self, build: &Arc<Build>) -> Result<(), BrokerError> {
        self.update_build(build, BuildEvent::Rebuild).await?;
        self.add_build(build).await;
        Ok(())
    }

    pub fn wake_dispatch(&self) {
        self.wake.notify_one();
    }

    /// Hands every possible assignment to its agent session.
    pub async fn dispatch(&self) -> usize {
        let assignments = self.scheduler.assign();
        let mut dispatched = 0;

        for Assignment { agent, build } in assignments {
            info!(aid = %agent.aid(), bid = %build.bid(), "Reserving agent for build");
            if agent.send(AgentCommand::Hire(Arc::clone(&build))) {
                dispatched += 1;
            } else {
                warn!(aid = %agent.aid(), bid = %build.bid(), "Agent session is gone, returning build");
                agent.release();
                self.scheduler.remove_target(&agent);
                self.scheduler.add(build);
            }
        }

        dispatched
    }

    pub async fn schedule_build_loop(self: Arc<Self>) {
        let mut interval = time::interval(Duration::from_secs(self.state.cli.dispatch_interval));

        info!("Build scheduler loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            self.dispatch().await;
        }
    }

    /// Appends a line to the broker log and broadcasts it.
    pub fn log(&self, message: impl Into<String>) {
        let line = LogLine {
            date: Utc::now(),
            message: message.into(),
        };
        info!("{}", line.message);

        {
            let mut logs = lock(&self.logs);
            logs.push_back(line.clone());
            while logs.len() > self.state.cli.log_history {
                logs.pop_front();
            }
        }

        self.notify("log", "log", &line);
    }

    pub fn logs(&self) -> Vec<LogLine> {
        lock(&self.logs).iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<News> {
        self.news.subscribe()
    }

    fn notify<T: Serialize>(&self, kind: &str, what: &str, obj: &T) {
        let obj = match serde_json::to_value(obj) {
            Ok(obj) => obj,
            Err(e) => {
                error!(error = %e, what = %what, "Failed to encode news");
                return;
            }
        };

        // No monitors is not an error.
        let _ = self.news.send(News {
            kind: kind.to_string(),
            what: what.to_string(),
            obj,
        });
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            requests: self
                .requests()
                .iter()
                .map(|request| request.snapshot())
                .collect(),
            agents: self.agents(),
            clients: self.clients(),
            logs: self.logs(),
        }
    }

    /// Restores the registries from the manifests under the builds root.
    ///
    /// Work that was in flight when the broker stopped cannot resume, so it
    /// is marked failed.
    pub async fn load_previous_builds(&self) -> Result<usize> {
        let manifests = storage::load_manifests(&self.builds_root()).await?;
        let mut loaded = 0;

        for snapshot in manifests {
            let request = Arc::new(BuildRequest::from_snapshot(snapshot));
            let mut interrupted = false;

            for build in request.builds() {
                if !build.status().is_terminal() {
                    build.push_log("interrupted by broker restart");
                    if build.apply(BuildEvent::Fail).is_ok() {
                        interrupted = true;
                    }
                }
            }

            if matches!(
                request.status(),
                BuildRequestStatus::Uploading | BuildRequestStatus::Processing
            ) && request.apply(RequestEvent::Fail).is_ok()
            {
                interrupted = true;
            }

            if let Err(e) = self.add_build_request(Arc::clone(&request)).await {
                warn!(error = %e, "Skipping previous build request");
                continue;
            }

            if interrupted {
                self.persist(&request).await;
            }

            loaded += 1;
        }

        if loaded > 0 {
            self.log(format!("Loaded {} previous build requests", loaded));
        }

        Ok(loaded)
    }
}

fn agent_info(agent: &AgentHandle) -> AgentInfo {
    AgentInfo {
        aid: agent.aid().to_string(),
        platform: agent.platform().to_string(),
        name: agent.name().map(str::to_string),
        busy: agent.is_assigned(),
    }
}

/// A request whose artifacts nobody will pick up any more.
fn is_settled(request: &BuildRequest) -> bool {
    let status = request.status();
    status.is_terminal() || (status == BuildRequestStatus::Finished && !request.wants_save())
}
