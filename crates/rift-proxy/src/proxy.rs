//! Proxy server
//!
//! Accept loop, handshake, branch resolution, and dispatch: connections to
//! `main` (or an empty database) are spliced straight to the upstream;
//! connections to any other branch are handed to an in-process Session
//! backed by the shared connection pool.

use crate::pg_wire::connection::{AuthenticateFn, ClientConn};
use crate::session::Session;
use crate::splice::{self, SpliceConfig};
use rift_common::{Result, RiftError};
use rift_core::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    pub keepalive: KeepaliveConfig,
    pub splice: SpliceConfig,
}

/// TCP keepalive policy for client sockets. Idle branch sessions hold pool
/// capacity, so dead peers must be detected faster than the kernel default.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe, in seconds
    pub idle_secs: u64,
    /// Interval between probes, in seconds
    pub interval_secs: u64,
    /// Unanswered probes before the peer is declared dead.
    /// Applied on Linux; elsewhere the kernel default stands.
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            interval_secs: 15,
            retries: 5,
        }
    }
}

/// The rift proxy server.
pub struct Proxy {
    config: ProxyConfig,
    engine: Arc<Engine>,
    authenticate: Arc<AuthenticateFn>,
    conn_count: Arc<AtomicUsize>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, engine: Arc<Engine>, authenticate: Arc<AuthenticateFn>) -> Self {
        Self {
            config,
            engine,
            authenticate,
            conn_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run the accept loop until the shutdown signal fires, then close the
    /// listener and wait for all connection tasks to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                RiftError::Config(format!("listen {}: {}", self.config.listen_addr, e))
            })?;
        info!(addr = %self.config.listen_addr, "proxy listening");

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept error: {}", e);
                            continue;
                        }
                    };

                    // Over-quota connections are rejected with an immediate close
                    if self.config.max_connections > 0
                        && self.conn_count.load(Ordering::Relaxed) >= self.config.max_connections
                    {
                        warn!(%peer_addr, "connection limit reached, rejecting");
                        drop(socket);
                        continue;
                    }

                    configure_tcp_keepalive(&socket, &self.config.keepalive);
                    debug!(%peer_addr, "accepted connection");

                    let engine = self.engine.clone();
                    let authenticate = self.authenticate.clone();
                    let config = self.config.clone();
                    let conn_count = self.conn_count.clone();

                    conn_count.fetch_add(1, Ordering::Relaxed);
                    tasks.spawn(async move {
                        if let Err(e) =
                            handle_connection(socket, engine, authenticate, config).await
                        {
                            let msg = e.to_string();
                            if msg.contains("early eof") || msg.contains("connection reset") {
                                debug!("client disconnected: {}", msg);
                            } else {
                                error!("connection error: {}", msg);
                            }
                        }
                        conn_count.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing listener");
                    break;
                }
            }

            // Reap finished connection tasks without blocking the loop
            while tasks.try_join_next().is_some() {}
        }

        drop(listener);
        tasks.shutdown().await;
        info!("proxy stopped");
        Ok(())
    }
}

/// Handshake one connection, resolve its branch, and dispatch it.
async fn handle_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    authenticate: Arc<AuthenticateFn>,
    config: ProxyConfig,
) -> Result<()> {
    let mut client = ClientConn::new(socket);
    client.handshake(authenticate.as_ref()).await?;

    let branch = client.database().to_string();

    if is_passthrough_branch(&branch) {
        // Main branch: raw TCP splice to the upstream
        let database = resolve_database(&engine, &branch).await;
        let upstream = match splice::connect_upstream(&config.splice, &database).await {
            Ok(upstream) => upstream,
            Err(e) => {
                client
                    .send_error("FATAL", e.sqlstate(), &e.to_string())
                    .await?;
                return Err(e);
            }
        };
        return splice::splice(
            client.into_stream(),
            upstream,
            config.splice.idle_timeout,
        )
        .await;
    }

    // Branch connection: verify it exists and resolve its database
    let manager = engine.manager();
    if !manager.exists(&branch).await {
        let err = RiftError::BranchNotFound(branch.clone());
        client
            .send_error("FATAL", err.sqlstate(), &err.to_string())
            .await?;
        return Err(err);
    }

    info!(branch = %branch, user = %client.user(), "starting branch session");
    let pool = engine.store().pool().clone();
    Session::new(client, pool, engine, branch).run().await
}

/// The upstream database for a passthrough connection. `main` resolves via
/// metadata when available; an empty database falls back to the configured
/// upstream user conventions upstream-side.
async fn resolve_database(engine: &Engine, branch: &str) -> String {
    if branch.is_empty() {
        return String::new();
    }
    match engine.manager().resolve_database(branch).await {
        Ok(db) if !db.is_empty() => db,
        _ => branch.to_string(),
    }
}

/// True when the logical database bypasses the CoW engine entirely.
pub fn is_passthrough_branch(branch: &str) -> bool {
    branch == "main" || branch.is_empty()
}

/// Apply the configured keepalive policy (and TCP_NODELAY) to a client
/// socket.
fn configure_tcp_keepalive(stream: &TcpStream, config: &KeepaliveConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", e);
    }

    let socket = socket2::SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!("failed to enable TCP keepalive: {}", e);
        return;
    }

    if let Err(e) = socket.set_tcp_keepalive(&config.probe_policy()) {
        warn!("failed to configure TCP keepalive timing: {}", e);
    }
}

impl KeepaliveConfig {
    /// Probe timings as a socket2 policy. The retry count is a Linux knob;
    /// other platforms keep their kernel default.
    fn probe_policy(&self) -> socket2::TcpKeepalive {
        let policy = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(self.idle_secs))
            .with_interval(Duration::from_secs(self.interval_secs));

        #[cfg(target_os = "linux")]
        let policy = policy.with_retries(self.retries);

        policy
    }
}
