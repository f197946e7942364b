//! TCP acceptor and per-session read loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use portway_proto::{encode_frame, read_frame_or_idle, FrameType};
use portway_store::JobRepository;

use crate::config::ServerConfig;
use crate::error::BridgeError;
use crate::registry::{ConnectionRegistry, TouchKind};

/// How often the staleness sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle ceiling before the sweeper evicts a session.
const MAX_IDLE: Duration = Duration::from_secs(300);

/// Ingestion seam: where inbound `request` frames are staged.
///
/// The repository is the production implementation; tests substitute a stub
/// so the acceptor runs without a database.
#[async_trait]
pub trait JobIntake: Send + Sync {
    /// Stages a payload as a new pending job for `client_port`. Returns the
    /// staged row id.
    async fn stage(&self, client_port: u16, payload: Vec<u8>) -> Result<i64, BridgeError>;
}

#[async_trait]
impl JobIntake for JobRepository {
    async fn stage(&self, client_port: u16, payload: Vec<u8>) -> Result<i64, BridgeError> {
        Ok(self.insert_job(client_port, &payload).await?)
    }
}

/// The TCP socket server.
pub struct TcpServer {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    intake: Arc<dyn JobIntake>,
}

impl TcpServer {
    /// Binds the listener.
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        intake: Arc<dyn JobIntake>,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        Ok(Self {
            listener,
            config,
            registry,
            intake,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until cancelled, then waits for the session tasks
    /// to wind down.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BridgeError> {
        info!(address = %self.local_addr()?, "TCP server listening");

        let sweeper = {
            let registry = Arc::clone(&self.registry);
            let cancel = cancel.clone();
            tokio::spawn(run_sweeper(registry, cancel))
        };

        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                // Reap finished sessions so the set does not grow unbounded.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if self.registry.count() >= self.config.max_connections {
                                warn!(
                                    remote_addr = %peer,
                                    max = self.config.max_connections,
                                    "max connections reached, rejecting connection"
                                );
                                drop(stream);
                                continue;
                            }

                            let session = Session {
                                config: self.config.clone(),
                                registry: Arc::clone(&self.registry),
                                intake: Arc::clone(&self.intake),
                                cancel: cancel.clone(),
                            };
                            sessions.spawn(session.run(stream, peer));
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }

        // Refuse new sockets, then let the read loops observe the
        // cancellation and unregister themselves.
        drop(self.listener);
        while sessions.join_next().await.is_some() {}
        let _ = sweeper.await;

        info!("TCP server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("config", &self.config)
            .field("connections", &self.registry.count())
            .finish_non_exhaustive()
    }
}

struct Session {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    intake: Arc<dyn JobIntake>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, stream: TcpStream, peer: SocketAddr) {
        info!(remote_addr = %peer, "new connection accepted");

        if self.config.keep_alive {
            configure_keep_alive(&stream, self.config.keep_alive_period);
        }

        // The client's ephemeral source port is the routing key: unique per
        // live session, reused only after this loop unregisters on exit.
        let port = peer.port();
        let (mut reader, writer) = stream.into_split();

        if let Err(e) = self
            .registry
            .register(port, Box::new(writer), peer.to_string())
        {
            warn!(port, error = %e, "failed to register connection");
            return;
        }

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                result = read_frame_or_idle(&mut reader, self.config.read_timeout) => {
                    match result {
                        // Quiet socket: probe liveness and keep reading. The
                        // sweeper owns idle eviction.
                        Ok(None) => {
                            let Ok(ping) = encode_frame(FrameType::Ping, &[]) else {
                                break;
                            };
                            if let Err(e) = self.registry.send(port, &ping).await {
                                warn!(port, error = %e, "failed to send ping");
                                break;
                            }
                        }

                        Ok(Some(frame)) => {
                            self.registry.touch(port, TouchKind::Received);
                            if !self.dispatch(port, frame).await {
                                break;
                            }
                        }

                        // Any decode error terminates this session only.
                        Err(e) => {
                            debug!(port, error = %e, "session read failed");
                            break;
                        }
                    }
                }
            }
        }

        self.registry.unregister(port);
    }

    /// Handles one inbound frame. Returns false when the session should end.
    async fn dispatch(&self, port: u16, frame: portway_proto::Frame) -> bool {
        match frame.frame_type {
            FrameType::Request => {
                match self.intake.stage(port, frame.payload).await {
                    Ok(id) => debug!(port, id, "staged inbound request"),
                    Err(e) => error!(port, error = %e, "failed to stage inbound request"),
                }
                true
            }
            FrameType::Ping => {
                let Ok(pong) = encode_frame(FrameType::Pong, &[]) else {
                    return false;
                };
                if let Err(e) = self.registry.send(port, &pong).await {
                    warn!(port, error = %e, "failed to send pong");
                    return false;
                }
                true
            }
            FrameType::Pong => true,
            other => {
                warn!(port, frame_type = other.as_u8(), "ignoring unknown frame type");
                true
            }
        }
    }
}

async fn run_sweeper(registry: Arc<ConnectionRegistry>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let evicted = registry.sweep(MAX_IDLE);
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "swept stale connections");
                }
            }
        }
    }
}

fn configure_keep_alive(stream: &TcpStream, period: Duration) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(period);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive");
    }
}
