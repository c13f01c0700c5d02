/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Websocket transport for agent and client sessions.
//!
//! A writer task serialises outbound messages and sends pings; the session
//! reads typed inbound messages from the stream built by [`inbound`].

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use builder::agent::AgentSession;
use builder::broker::Broker;
use builder::client::ClientSession;
use futures::stream::{self, SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use kiln_core::messages::{AgentInbound, AgentOutbound, ClientInbound, ClientOutbound};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How often to send websocket pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a peer may stay silent, pongs included, before it is dropped.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound messages buffered per connection. Streaming waits once full.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, PartialEq)]
pub enum Frame<M> {
    Message(M),
    Pong,
    Skip,
    Close,
}

/// Interprets one websocket frame. Malformed text is skipped, not fatal.
pub fn decode_frame<M: DeserializeOwned>(message: Message) -> Frame<M> {
    match message {
        Message::Text(text) => match serde_json::from_str(text.as_str()) {
            Ok(message) => Frame::Message(message),
            Err(e) => {
                warn!(error = %e, "Skipping malformed message");
                Frame::Skip
            }
        },
        Message::Pong(_) => Frame::Pong,
        Message::Close(_) => Frame::Close,
        Message::Binary(_) => {
            warn!("Skipping binary frame");
            Frame::Skip
        }
        Message::Ping(_) => Frame::Skip,
    }
}

/// Typed inbound messages. Ends on close, error or [`PONG_TIMEOUT`] of silence.
pub fn inbound<M>(receiver: SplitStream<WebSocket>) -> impl Stream<Item = M> + Send + Unpin
where
    M: DeserializeOwned + Send + 'static,
{
    Box::pin(stream::unfold(receiver, |mut receiver| async move {
        loop {
            let message = match timeout(PONG_TIMEOUT, receiver.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Websocket error");
                    return None;
                }
                Ok(None) => return None,
                Err(_) => {
                    warn!("Peer did not answer pings, dropping connection");
                    return None;
                }
            };

            match decode_frame(message) {
                Frame::Message(message) => return Some((message, receiver)),
                Frame::Close => return None,
                Frame::Pong | Frame::Skip => continue,
            }
        }
    }))
}

/// Forwards outbound messages as text frames and pings the peer until the
/// session drops its sender or the socket fails.
pub async fn forward<M: Serialize>(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<M>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };

                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode message"),
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

pub async fn agent_socket(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<Broker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent(socket, broker))
}

async fn handle_agent(socket: WebSocket, broker: Arc<Broker>) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<AgentOutbound>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(forward(sender, rx));

    let (session, commands) = AgentSession::new(broker, tx);
    session
        .run(inbound::<AgentInbound>(receiver), commands)
        .await;

    let _ = writer.await;
}

pub async fn client_socket(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<Broker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, broker))
}

async fn handle_client(socket: WebSocket, broker: Arc<Broker>) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ClientOutbound>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(forward(sender, rx));

    ClientSession::new(broker, tx)
        .run(inbound::<ClientInbound>(receiver))
        .await;

    let _ = writer.await;
}
