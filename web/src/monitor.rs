/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::socket::{Frame, PING_INTERVAL, PONG_TIMEOUT, decode_frame};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use builder::broker::Broker;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use kiln_core::messages::{MonitorInbound, MonitorOutbound};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub async fn monitor_socket(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<Broker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_monitor(socket, broker))
}

/// Executes one monitor command. Returns the reply, if the command has one;
/// the effects of `rebuild`, `cancel` and `delete` arrive as news.
pub async fn handle_command(broker: &Broker, command: MonitorInbound) -> Option<MonitorOutbound> {
    match command {
        MonitorInbound::Refresh => Some(MonitorOutbound::Status {
            snapshot: broker.snapshot(),
        }),
        MonitorInbound::Rebuild { id } => {
            info!(id = %id, "Monitor requested rebuild");
            if let Err(e) = broker.rebuild(&id).await {
                warn!(id = %id, error = %e, "Rebuild failed");
            }
            None
        }
        MonitorInbound::Cancel { id } => {
            info!(id = %id, "Monitor requested cancel");
            if let Err(e) = broker.cancel(&id).await {
                warn!(id = %id, error = %e, "Cancel failed");
            }
            None
        }
        MonitorInbound::Delete { id } => {
            info!(id = %id, "Monitor requested delete");
            if let Err(e) = broker.delete(&id).await {
                warn!(id = %id, error = %e, "Delete failed");
            }
            None
        }
    }
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &MonitorOutbound,
) -> Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|e| {
        warn!(error = %e, "Failed to encode monitor message");
    })?;

    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

async fn handle_monitor(socket: WebSocket, broker: Arc<Broker>) {
    let (mut sender, mut receiver) = socket.split();
    let mut news = broker.subscribe();

    let status = MonitorOutbound::Status {
        snapshot: broker.snapshot(),
    };
    if send(&mut sender, &status).await.is_err() {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    warn!("Monitor did not answer pings, dropping connection");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = news.recv() => {
                let message = match result {
                    Ok(news) => MonitorOutbound::News(news),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Monitor lagged, sending full status");
                        MonitorOutbound::Status {
                            snapshot: broker.snapshot(),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if send(&mut sender, &message).await.is_err() {
                    break;
                }
            }

            message = receiver.next() => {
                let Some(Ok(message)) = message else {
                    break;
                };

                match decode_frame::<MonitorInbound>(message) {
                    Frame::Message(command) => {
                        if let Some(reply) = handle_command(&broker, command).await
                            && send(&mut sender, &reply).await.is_err()
                        {
                            break;
                        }
                    }
                    Frame::Pong => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Frame::Skip => {}
                    Frame::Close => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
