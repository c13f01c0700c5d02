/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::serve::Listener;
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

/// How long a peer may take to complete the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the acceptor for the PEM encoded certificate chain and key.
pub fn acceptor(key: &Path, cert: &Path) -> io::Result<SslAcceptor> {
    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(io::Error::other)?;
    builder
        .set_certificate_chain_file(cert)
        .map_err(io::Error::other)?;
    builder
        .set_private_key_file(key, SslFiletype::PEM)
        .map_err(io::Error::other)?;
    builder.check_private_key().map_err(io::Error::other)?;
    Ok(builder.build())
}

/// TCP listener that hands out connections after a completed TLS handshake.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: SslAcceptor,
}

impl TlsListener {
    pub fn new(inner: TcpListener, acceptor: SslAcceptor) -> Self {
        Self { inner, acceptor }
    }

    async fn handshake(&self, stream: TcpStream) -> io::Result<SslStream<TcpStream>> {
        let ssl = Ssl::new(self.acceptor.context()).map_err(io::Error::other)?;
        let mut stream = SslStream::new(ssl, stream).map_err(io::Error::other)?;

        match timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).accept()).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            )),
        }
    }
}

impl Listener for TlsListener {
    type Io = SslStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match self.handshake(stream).await {
                Ok(stream) => return (stream, addr),
                Err(e) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
