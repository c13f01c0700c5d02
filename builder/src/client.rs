/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::broker::Broker;
use super::channel::PeerChannel;
use super::transfer::{IncomingBatch, OutgoingBatch, receive_item};
use entity::{BuildFile, BuildRequest, BuildRequestStatus, RequestEvent};
use futures::{Stream, StreamExt};
use kiln_core::input::{resolve_platforms, validate_segment};
use kiln_core::messages::{ClientInbound, ClientInfo, ClientOutbound, FileMeta, Payload};
use kiln_core::storage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Instructions the broker sends to a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Log { bid: String, message: String },
}

/// What the broker knows about a connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    connection: Uuid,
    cid: Option<String>,
    brid: Option<String>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub fn new(
        connection: Uuid,
        cid: Option<String>,
        brid: Option<String>,
        commands: mpsc::UnboundedSender<ClientCommand>,
    ) -> Self {
        Self {
            connection,
            cid,
            brid,
            commands,
        }
    }

    pub fn connection(&self) -> Uuid {
        self.connection
    }

    pub fn cid(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    /// The request this client submitted last.
    pub fn brid(&self) -> Option<&str> {
        self.brid.as_deref()
    }

    /// Returns `false` if the session is gone.
    pub fn send(&self, command: ClientCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            connection: self.connection.to_string(),
            cid: self.cid.clone(),
            brid: self.brid.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// No request outstanding.
    Connected,
    Uploading,
    /// Inputs received, builds are queued or running.
    Waiting,
    /// `conclude` sent, waiting for the client to accept the artifacts.
    AwaitingAccept,
    Delivering,
    Done,
}

enum Event {
    Message(Option<ClientInbound>),
    Status(Option<BuildRequestStatus>),
    Command(Option<ClientCommand>),
}

/// Broker side of one client connection. A client drives at most one
/// request at a time.
pub struct ClientSession<C> {
    broker: Arc<Broker>,
    channel: C,
    connection: Uuid,
    cid: Option<String>,
    request: Option<Arc<BuildRequest>>,
    status: Option<watch::Receiver<BuildRequestStatus>>,
    phase: ClientPhase,
    incoming: Option<IncomingBatch>,
    outgoing: Option<OutgoingBatch>,
    commands_tx: mpsc::UnboundedSender<ClientCommand>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
}

impl<C: PeerChannel<ClientOutbound>> ClientSession<C> {
    /// Creates the session and registers it with the broker.
    pub fn new(broker: Arc<Broker>, channel: C) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let session = Self {
            broker,
            channel,
            connection: Uuid::new_v4(),
            cid: None,
            request: None,
            status: None,
            phase: ClientPhase::Connected,
            incoming: None,
            outgoing: None,
            commands_tx,
            commands,
        };

        session.publish();
        session
    }

    pub fn connection(&self) -> Uuid {
        self.connection
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn cid(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    pub fn request(&self) -> Option<&Arc<BuildRequest>> {
        self.request.as_ref()
    }

    #[instrument(skip_all, fields(connection = %self.connection))]
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = ClientInbound> + Unpin,
    {
        debug!("Client connected");

        loop {
            let event = tokio::select! {
                message = inbound.next() => Event::Message(message),
                status = next_status(&mut self.status) => Event::Status(status),
                command = self.commands.recv() => Event::Command(command),
            };

            match event {
                Event::Message(Some(message)) => self.handle_message(message).await,
                Event::Message(None) => break,
                Event::Status(Some(status)) => self.handle_status(status).await,
                Event::Status(None) => self.status = None,
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Command(None) => break,
            }
        }

        self.disconnect().await;
    }

    pub async fn handle_message(&mut self, message: ClientInbound) {
        match message {
            ClientInbound::Register { cid } => {
                info!(cid = %cid, "Client registered");
                self.cid = Some(cid);
                self.publish();
            }
            ClientInbound::Request {
                brid,
                save,
                platforms,
                count,
            } => self.on_request(brid, save, platforms, count).await,
            ClientInbound::Upload {
                brid,
                platform,
                meta,
                data,
            } => self.on_upload(brid, platform, meta, data).await,
            ClientInbound::Accept { brid } => self.on_accept(brid).await,
            ClientInbound::Error { brid } => self.on_error(brid).await,
        }
    }

    pub async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Log { bid, message } => {
                let Some(request) = &self.request else {
                    debug!(bid = %bid, "log: no build request on this connection");
                    return;
                };

                let message = ClientOutbound::Log {
                    brid: request.brid().to_string(),
                    bid,
                    message,
                };
                self.send(message).await;
            }
        }
    }

    /// Reacts to a status change of the session's request.
    pub async fn handle_status(&mut self, status: BuildRequestStatus) {
        let Some(request) = self.request.clone() else {
            return;
        };

        debug!(brid = %request.brid(), status = %status, "Build request status changed");
        match status {
            BuildRequestStatus::Finished if request.wants_save() => {
                if matches!(
                    self.phase,
                    ClientPhase::AwaitingAccept | ClientPhase::Delivering
                ) {
                    return;
                }

                let batch = OutgoingBatch::announce(request.brid(), request.artifacts());
                let message = ClientOutbound::Conclude {
                    brid: request.brid().to_string(),
                    count: batch.count(),
                };

                info!(brid = %request.brid(), files = batch.count(), "Offering artifacts to client");
                self.outgoing = Some(batch);
                self.phase = ClientPhase::AwaitingAccept;
                self.send(message).await;
            }
            BuildRequestStatus::Finished | BuildRequestStatus::Delivered => {
                self.phase = ClientPhase::Done;
            }
            BuildRequestStatus::Failed | BuildRequestStatus::Cancelled => {
                self.incoming = None;
                self.outgoing = None;
                self.phase = ClientPhase::Done;
                self.send(ClientOutbound::Failed {
                    brid: request.brid().to_string(),
                    status,
                })
                .await;
            }
            BuildRequestStatus::Processing => {
                if self.phase == ClientPhase::Done {
                    self.phase = ClientPhase::Waiting;
                }
            }
            BuildRequestStatus::Uploading => {}
        }
    }

    /// Drops the session. The request itself keeps running unless orphaned
    /// requests are configured to be cancelled.
    pub async fn disconnect(&mut self) {
        info!(cid = ?self.cid, "Client disconnected");
        self.broker.remove_client(self.connection);
        self.incoming = None;
        self.outgoing = None;

        let Some(request) = self.request.take() else {
            return;
        };
        self.status = None;

        let status = request.status();
        if status.is_terminal() {
            return;
        }

        if self.broker.state().cli.cancel_orphaned_requests {
            info!(brid = %request.brid(), "Cancelling orphaned build request");
            if let Err(e) = self.broker.cancel(request.brid()).await {
                warn!(brid = %request.brid(), error = %e, "Failed to cancel orphaned build request");
            }
        } else {
            info!(brid = %request.brid(), status = %status, "Build request continues without its client");
        }
    }

    fn is_busy(&self) -> bool {
        !matches!(self.phase, ClientPhase::Connected | ClientPhase::Done)
    }

    async fn on_request(&mut self, brid: String, save: bool, platforms: Vec<String>, count: usize) {
        if self.is_busy() {
            warn!(brid = %brid, "request: a build request is already outstanding on this connection");
            self.reject(brid).await;
            return;
        }

        if let Err(e) = validate_segment("request id", &brid) {
            warn!(error = %e, "request: invalid request id");
            self.reject(brid).await;
            return;
        }

        let platforms = resolve_platforms(&platforms, self.broker.supported_platforms());
        if let Some(e) = platforms
            .iter()
            .find_map(|platform| validate_segment("platform", platform).err())
        {
            warn!(brid = %brid, error = %e, "request: invalid platform");
            self.reject(brid).await;
            return;
        }

        let request = Arc::new(BuildRequest::new(&brid, &platforms, save, self.cid.clone()));
        if let Err(e) = self.broker.add_build_request(Arc::clone(&request)).await {
            warn!(brid = %brid, error = %e, "request: rejected");
            self.reject(brid).await;
            return;
        }

        info!(brid = %brid, platforms = ?platforms, files = count, save, "Accepted build request");
        self.status = Some(request.subscribe());
        self.request = Some(request);
        self.incoming = Some(IncomingBatch::accept(brid.clone(), count));
        self.outgoing = None;
        self.phase = ClientPhase::Uploading;
        self.publish();

        self.send(ClientOutbound::Accept { brid }).await;

        if count == 0 {
            self.inputs_complete().await;
        }
    }

    async fn on_upload(&mut self, brid: String, platform: Option<String>, meta: FileMeta, data: Payload) {
        let admitted = self
            .incoming
            .as_ref()
            .is_some_and(|batch| batch.admits(&brid));
        if !admitted {
            warn!(brid = %brid, basename = %meta.basename, "upload: no accepted upload for this request, dropping");
            return;
        }

        let Some(request) = self.request.clone() else {
            return;
        };

        let path = match storage::input_path(&self.broker.builds_root(), &brid, &meta.basename) {
            Ok(path) => path,
            Err(e) => {
                warn!(brid = %brid, error = %e, "upload: rejecting input");
                self.abandon_upload(&request).await;
                return;
            }
        };

        if let Err(e) = receive_item(&path, &data).await {
            warn!(brid = %brid, basename = %meta.basename, error = %e, "The file could not be saved on the server");
            self.abandon_upload(&request).await;
            return;
        }

        debug!(brid = %brid, basename = %meta.basename, platform = ?platform, "Received input");
        self.broker
            .add_input(&request, BuildFile::new(brid, path, platform));

        let complete = self.incoming.as_mut().is_some_and(|batch| batch.record());
        if complete {
            self.inputs_complete().await;
        }
    }

    async fn inputs_complete(&mut self) {
        self.incoming = None;
        let Some(request) = self.request.clone() else {
            return;
        };

        request.distribute_inputs();
        if self
            .broker
            .update_request(&request, RequestEvent::InputsReceived)
            .await
            .is_err()
        {
            return;
        }

        self.phase = ClientPhase::Waiting;
        info!(brid = %request.brid(), files = request.inputs().len(), "All inputs received");

        for build in request.builds() {
            self.broker.add_build(&build).await;
        }
    }

    async fn abandon_upload(&mut self, request: &Arc<BuildRequest>) {
        self.incoming = None;
        let _ = self.broker.update_request(request, RequestEvent::Fail).await;
    }

    async fn on_accept(&mut self, brid: String) {
        if self.phase != ClientPhase::AwaitingAccept {
            warn!(brid = %brid, phase = ?self.phase, "accept: nothing to deliver");
            return;
        }

        let Some(batch) = self.outgoing.take_if(|batch| batch.id() == brid) else {
            warn!(brid = %brid, "accept: not the request being delivered");
            return;
        };

        let Some(request) = self.request.clone() else {
            return;
        };

        self.phase = ClientPhase::Delivering;
        let result = batch
            .stream(&self.channel, |meta, data| ClientOutbound::Serve {
                brid: brid.clone(),
                meta,
                data,
            })
            .await;

        match result {
            Ok(count) => {
                info!(brid = %brid, files = count, "Delivered artifacts to client");
                let _ = self
                    .broker
                    .update_request(&request, RequestEvent::Deliver)
                    .await;
            }
            Err(e) => {
                warn!(brid = %brid, error = %e, "Delivering artifacts failed");
                let _ = self.broker.update_request(&request, RequestEvent::Fail).await;
            }
        }
    }

    async fn on_error(&mut self, brid: String) {
        let Some(request) = self.broker.get_build_request(&brid) else {
            warn!(brid = %brid, "error: could not find build request");
            return;
        };

        info!(brid = %brid, "Client reported an error");
        if self
            .request
            .as_ref()
            .is_some_and(|own| own.brid() == brid)
        {
            self.incoming = None;
            self.outgoing = None;
        }

        let _ = self.broker.update_request(&request, RequestEvent::Fail).await;
    }

    /// Registers or refreshes this session's entry in the broker.
    fn publish(&self) {
        self.broker.add_client(ClientHandle::new(
            self.connection,
            self.cid.clone(),
            self.request.as_ref().map(|request| request.brid().to_string()),
            self.commands_tx.clone(),
        ));
    }

    async fn reject(&self, brid: String) {
        self.send(ClientOutbound::Failed {
            brid,
            status: BuildRequestStatus::Failed,
        })
        .await;
    }

    async fn send(&self, message: ClientOutbound) {
        if self.channel.send(message).await.is_err() {
            warn!(cid = ?self.cid, "Client channel closed");
        }
    }
}

async fn next_status(
    status: &mut Option<watch::Receiver<BuildRequestStatus>>,
) -> Option<BuildRequestStatus> {
    match status {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
