/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::broker::Broker;
use super::channel::PeerChannel;
use super::transfer::{IncomingBatch, OutgoingBatch, receive_item};
use entity::{Build, BuildEvent, BuildFile};
use futures::{Stream, StreamExt};
use kiln_core::messages::{AgentInbound, AgentOutbound, FileMeta, Payload};
use kiln_core::storage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Instructions the broker sends to an agent session.
#[derive(Debug)]
pub enum AgentCommand {
    Hire(Arc<Build>),
    Cancel(String),
}

/// What the broker and scheduler know about a registered agent session.
///
/// `assigned` is shared with the session: the scheduler claims it before a
/// hire is sent, the session clears it when it is idle again.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    aid: String,
    platform: String,
    name: Option<String>,
    assigned: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    pub fn new(
        aid: impl Into<String>,
        platform: impl Into<String>,
        name: Option<String>,
        assigned: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<AgentCommand>,
    ) -> Self {
        Self {
            aid: aid.into(),
            platform: platform.into(),
            name,
            assigned,
            commands,
        }
    }

    pub fn aid(&self) -> &str {
        &self.aid
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned.load(Ordering::Acquire)
    }

    /// Marks the agent as assigned. Fails if it already is.
    pub fn try_claim(&self) -> bool {
        self.assigned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.assigned.store(false, Ordering::Release);
    }

    /// Whether both handles were registered by the same connection.
    pub fn same_session(&self, other: &AgentHandle) -> bool {
        Arc::ptr_eq(&self.assigned, &other.assigned)
    }

    /// Returns `false` if the session is gone.
    pub fn send(&self, command: AgentCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Unregistered,
    Idle,
    /// `hire` sent, waiting for the agent to accept the inputs.
    AwaitingAccept,
    /// Inputs delivered, the agent builds out of band.
    Building,
    /// `conclude` accepted, artifacts are streaming in.
    Collecting,
}

/// Broker side of one agent connection.
pub struct AgentSession<C> {
    broker: Arc<Broker>,
    channel: C,
    connection: Uuid,
    handle: Option<AgentHandle>,
    assigned: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<AgentCommand>,
    current: Option<Arc<Build>>,
    phase: AgentPhase,
    outgoing: Option<OutgoingBatch>,
    incoming: Option<IncomingBatch>,
}

impl<C: PeerChannel<AgentOutbound>> AgentSession<C> {
    pub fn new(broker: Arc<Broker>, channel: C) -> (Self, mpsc::UnboundedReceiver<AgentCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let session = Self {
            broker,
            channel,
            connection: Uuid::new_v4(),
            handle: None,
            assigned: Arc::new(AtomicBool::new(false)),
            commands,
            current: None,
            phase: AgentPhase::Unregistered,
            outgoing: None,
            incoming: None,
        };

        (session, rx)
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn current_build(&self) -> Option<&Arc<Build>> {
        self.current.as_ref()
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned.load(Ordering::Acquire)
    }

    pub fn aid(&self) -> Option<&str> {
        self.handle.as_ref().map(|handle| handle.aid())
    }

    #[instrument(skip_all, fields(connection = %self.connection))]
    pub async fn run<S>(mut self, mut inbound: S, mut commands: mpsc::UnboundedReceiver<AgentCommand>)
    where
        S: Stream<Item = AgentInbound> + Unpin,
    {
        debug!("Agent connected");

        loop {
            tokio::select! {
                message = inbound.next() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                Some(command) = commands.recv() => self.handle_command(command).await,
            }
        }

        self.return_hires(&mut commands).await;
        self.disconnect().await;
    }

    /// Hands hires that were dispatched but never read back to the queue.
    /// The assignment flag is still claimed, so nothing is dispatched to this
    /// session meanwhile.
    pub async fn return_hires(&mut self, commands: &mut mpsc::UnboundedReceiver<AgentCommand>) {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let AgentCommand::Hire(build) = command {
                info!(bid = %build.bid(), "Returning unread hire to the queue");
                self.broker.add_build(&build).await;
            }
        }
    }

    pub async fn handle_message(&mut self, message: AgentInbound) {
        match message {
            AgentInbound::Register {
                aid,
                platform,
                name,
            } => self.on_register(aid, platform, name).await,
            AgentInbound::Accept { bid } => self.on_accept(bid).await,
            AgentInbound::Conclude { bid, count } => self.on_conclude(bid, count).await,
            AgentInbound::Serve { bid, meta, data } => self.on_serve(bid, meta, data).await,
            AgentInbound::Fail { bid, error } => self.on_fail(bid, error).await,
            AgentInbound::Log { bid, message } => self.on_log(bid, message),
        }
    }

    pub async fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Hire(build) => self.hire(build).await,
            AgentCommand::Cancel(bid) => self.on_cancel(bid).await,
        }
    }

    /// Deregisters the agent and hands its current build back to the queue.
    pub async fn disconnect(&mut self) {
        let aid = self.aid().unwrap_or("unregistered").to_string();
        info!(aid = %aid, "Agent disconnected");

        if let Some(handle) = self.handle.take() {
            self.broker.remove_agent(&handle);
        }

        self.outgoing = None;
        self.incoming = None;
        self.phase = AgentPhase::Unregistered;

        if let Some(build) = self.current.take() {
            info!(bid = %build.bid(), "Build will be added back to the queue");
            self.broker.requeue_build(&build).await;
        }

        self.assigned.store(false, Ordering::Release);
    }

    async fn on_register(&mut self, aid: String, platform: String, name: Option<String>) {
        if aid.is_empty() || platform.is_empty() {
            warn!("register: agent id and platform are required");
            return;
        }

        if let Some(previous) = &self.handle
            && previous.aid() != aid
        {
            self.broker.remove_agent(previous);
        }

        let handle = AgentHandle::new(
            aid.clone(),
            platform.clone(),
            name,
            Arc::clone(&self.assigned),
            self.commands.clone(),
        );
        self.handle = Some(handle.clone());
        self.broker.add_agent(handle);

        if self.phase == AgentPhase::Unregistered {
            self.phase = AgentPhase::Idle;
        }

        info!(aid = %aid, platform = %platform, "Agent registered");
        self.broker.wake_dispatch();
    }

    async fn hire(&mut self, build: Arc<Build>) {
        let Some(aid) = self.aid().map(str::to_string) else {
            warn!(bid = %build.bid(), "hire: agent is not registered, returning build");
            self.broker.add_build(&build).await;
            return;
        };

        if let Some(current) = &self.current {
            warn!(bid = %build.bid(), current = %current.bid(), "hire: agent is already busy, returning build");
            self.broker.add_build(&build).await;
            return;
        }

        if let Err(e) = self
            .broker
            .update_build(&build, BuildEvent::Hire { agent: aid.clone() })
            .await
        {
            debug!(error = %e, "hire: build is no longer queued");
            self.assigned.store(false, Ordering::Release);
            self.broker.wake_dispatch();
            return;
        }

        let batch = OutgoingBatch::announce(build.bid(), build.inputs());
        let message = AgentOutbound::Hire {
            bid: build.bid().to_string(),
            count: batch.count(),
        };

        info!(bid = %build.bid(), aid = %aid, files = batch.count(), "Hiring agent");
        self.assigned.store(true, Ordering::Release);
        self.current = Some(build);
        self.outgoing = Some(batch);
        self.phase = AgentPhase::AwaitingAccept;

        if self.channel.send(message).await.is_err() {
            warn!(aid = %aid, "hire: agent channel closed");
        }
    }

    async fn on_accept(&mut self, bid: Option<String>) {
        if self.phase != AgentPhase::AwaitingAccept {
            warn!(bid = ?bid, phase = ?self.phase, "accept: nothing to transfer");
            return;
        }

        let Some(build) = self.current.clone() else {
            warn!("accept: no current build");
            return;
        };

        if let Some(bid) = &bid
            && bid != build.bid()
        {
            warn!(bid = %bid, current = %build.bid(), "accept: build id does not match current build");
            return;
        }

        let Some(batch) = self.outgoing.take() else {
            warn!(bid = %build.bid(), "accept: no announced transfer");
            return;
        };

        let bid = build.bid().to_string();
        let result = batch
            .stream(&self.channel, |meta, data| AgentOutbound::Transfer {
                bid: bid.clone(),
                meta,
                data,
            })
            .await;

        match result {
            Ok(count) => {
                info!(bid = %bid, files = count, "Transferred inputs to agent");
                if self
                    .broker
                    .update_build(&build, BuildEvent::InputsDelivered)
                    .await
                    .is_ok()
                {
                    self.phase = AgentPhase::Building;
                }
            }
            Err(e) => {
                warn!(bid = %bid, error = %e, "Transferring build to agent failed");
                build.push_log(format!("Transfer to agent failed: {}", e));
                let _ = self.broker.update_build(&build, BuildEvent::Fail).await;
                self.laze();
            }
        }
    }

    async fn on_conclude(&mut self, bid: String, count: usize) {
        let Some(build) = self.current_for(&bid, "conclude") else {
            return;
        };

        if self.phase != AgentPhase::Building {
            warn!(bid = %bid, phase = ?self.phase, "conclude: build is not running");
            return;
        }

        if self
            .broker
            .update_build(&build, BuildEvent::Conclude)
            .await
            .is_err()
        {
            return;
        }

        self.incoming = Some(IncomingBatch::accept(bid.clone(), count));
        self.phase = AgentPhase::Collecting;
        info!(bid = %bid, files = count, "Agent concluded build");

        if self
            .channel
            .send(AgentOutbound::Accept { bid: bid.clone() })
            .await
            .is_err()
        {
            warn!(bid = %bid, "conclude: agent channel closed");
        }

        if count == 0 {
            self.complete(&build).await;
        }
    }

    async fn on_serve(&mut self, bid: String, meta: FileMeta, data: Payload) {
        let admitted = self
            .incoming
            .as_ref()
            .is_some_and(|batch| batch.admits(&bid));
        if !admitted {
            warn!(bid = %bid, basename = %meta.basename, "serve: no accepted transfer for this build, dropping");
            return;
        }

        let Some(build) = self.current_for(&bid, "serve") else {
            return;
        };

        let path = match storage::output_path(
            &self.broker.builds_root(),
            build.brid(),
            build.platform(),
            &meta.basename,
        ) {
            Ok(path) => path,
            Err(e) => {
                warn!(bid = %bid, error = %e, "serve: rejecting artifact");
                self.abandon_collection(&build, e.to_string()).await;
                return;
            }
        };

        if let Err(e) = receive_item(&path, &data).await {
            warn!(bid = %bid, basename = %meta.basename, error = %e, "The file could not be saved on the server");
            self.abandon_collection(&build, e.to_string()).await;
            return;
        }

        info!(bid = %bid, basename = %meta.basename, "Received artifact");
        self.broker.add_artifact(
            &build,
            BuildFile::new(build.brid(), path, Some(build.platform().to_string())),
        );

        if self
            .channel
            .send(AgentOutbound::Confirm { bid: bid.clone() })
            .await
            .is_err()
        {
            warn!(bid = %bid, "serve: agent channel closed");
        }

        let complete = self.incoming.as_mut().is_some_and(|batch| batch.record());
        if complete {
            self.complete(&build).await;
        }
    }

    async fn on_fail(&mut self, bid: String, error: Option<String>) {
        let Some(build) = self.current_for(&bid, "fail") else {
            return;
        };

        info!(bid = %bid, error = ?error, "Build failed on agent");
        if let Some(error) = error {
            build.push_log(error);
        }

        let _ = self.broker.update_build(&build, BuildEvent::Fail).await;
        self.laze();
    }

    fn on_log(&mut self, bid: Option<String>, message: String) {
        let aid = self.aid().unwrap_or("unregistered").to_string();

        match (&self.current, bid) {
            (Some(build), Some(bid)) if build.bid() == bid => {
                build.push_log(message.clone());
                self.broker.forward_log(build, &message);
            }
            (_, Some(bid)) => {
                debug!(bid = %bid, "log: not the current build");
            }
            _ => {}
        }

        self.broker.log(format!("[agent {}] {}", aid, message));
    }

    async fn on_cancel(&mut self, bid: String) {
        match &self.current {
            Some(build) if build.bid() == bid => {}
            _ => {
                debug!(bid = %bid, "cancel: not the current build");
                return;
            }
        }

        info!(bid = %bid, "Cancelling build on agent");
        if self
            .channel
            .send(AgentOutbound::Cancel { bid: bid.clone() })
            .await
            .is_err()
        {
            warn!(bid = %bid, "cancel: agent channel closed");
        }

        self.laze();
    }

    async fn complete(&mut self, build: &Arc<Build>) {
        let _ = self.broker.update_build(build, BuildEvent::Complete).await;
        self.laze();
    }

    /// A failed item is terminal for the whole batch.
    async fn abandon_collection(&mut self, build: &Arc<Build>, reason: String) {
        build.push_log(format!("Collecting artifacts failed: {}", reason));
        let _ = self.broker.update_build(build, BuildEvent::Fail).await;
        self.laze();
    }

    /// The session's current build is the only build an incoming message may
    /// touch; the message's id merely has to agree with it.
    fn current_for(&self, bid: &str, event: &str) -> Option<Arc<Build>> {
        match &self.current {
            Some(build) if build.bid() == bid => Some(Arc::clone(build)),
            Some(build) => {
                warn!(bid = %bid, current = %build.bid(), "{}: build is not assigned to this agent", event);
                None
            }
            None => {
                if self.broker.get_build(bid).is_none() {
                    warn!(bid = %bid, "{}: could not find build", event);
                } else {
                    warn!(bid = %bid, "{}: agent has no current build", event);
                }
                None
            }
        }
    }

    fn laze(&mut self) {
        self.current = None;
        self.outgoing = None;
        self.incoming = None;
        if self.handle.is_some() {
            self.phase = AgentPhase::Idle;
        }

        self.assigned.store(false, Ordering::Release);
        self.broker.wake_dispatch();
    }
}
