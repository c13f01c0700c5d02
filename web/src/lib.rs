/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod endpoints;
pub mod error;
pub mod monitor;
pub mod socket;
pub mod tls;


pub use endpoints::builds::BuildEntry;

use axum::Router;
use axum::routing::{get, post};
use builder::broker::Broker;
use http::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(broker: Arc<Broker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(vec![ACCEPT, CONTENT_TYPE]);

    Router::new()
        .route("/agent", get(socket::agent_socket))
        .route("/client", get(socket::client_socket))
        .route("/monitor", get(monitor::monitor_socket))
        .route("/api/health", get(endpoints::get_health))
        .route("/api/builds", get(endpoints::builds::get_builds))
        .route(
            "/api/build/{id}",
            get(endpoints::builds::get_build).delete(endpoints::builds::delete_build),
        )
        .route(
            "/api/build/{id}/cancel",
            post(endpoints::builds::post_build_cancel),
        )
        .route(
            "/api/build/{id}/rebuild",
            post(endpoints::builds::post_build_rebuild),
        )
        .route("/api/agents", get(endpoints::agents::get_agents))
        .fallback(endpoints::handle_404)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(broker)
}

pub async fn serve_web(broker: Arc<Broker>) -> std::io::Result<()> {
    let state = Arc::clone(broker.state());
    let server_url = format!("{}:{}", state.cli.ip, state.cli.port);
    let app = router(broker);

    let listener = tokio::net::TcpListener::bind(&server_url).await?;

    match (&state.cli.key, &state.cli.cert) {
        (Some(key), Some(cert)) => {
            let acceptor = tls::acceptor(key, cert)?;
            info!("Listening on https://{}", server_url);
            axum::serve(tls::TlsListener::new(listener, acceptor), app).await
        }
        _ => {
            info!("Listening on http://{}", server_url);
            axum::serve(listener, app).await
        }
    }
}
