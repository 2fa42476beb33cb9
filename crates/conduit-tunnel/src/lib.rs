//! # conduit-tunnel
//!
//! SSH local port forwarding for connections that sit behind a gateway.
//!
//! [`TunnelManager`] keeps at most one tunnel per connection id. A tunnel owns
//! an authenticated SSH session and a listener on `127.0.0.1:<ephemeral>`;
//! every local socket accepted by the listener is forwarded to the remote
//! `host:port` over its own `direct-tcpip` channel, so adapters only ever dial
//! the loopback address.

mod config;
mod session;

pub use config::{SshAuth, TunnelConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SSH_PORT};

use conduit_query::{DataError, Result};
use session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Public view of an active tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub connection_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

struct Tunnel {
    info: TunnelInfo,
    session: Arc<Session>,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Stop accepting, wait for the listener to exit, then drop the session
    async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.listener.lock().await.take() {
            if let Err(e) = task.await {
                warn!(
                    "Listener task for connection {} ended abnormally: {}",
                    self.info.connection_id, e
                );
            }
        }
        session::close_session(&self.session, &self.info.connection_id).await;
    }
}

type Outcome = Option<std::result::Result<u16, String>>;

enum TunnelState {
    /// Waiters subscribe to the outcome of the in-flight attempt
    Establishing(watch::Receiver<Outcome>),
    Active(Arc<Tunnel>),
}

/// Registry of live SSH tunnels, one per connection id
#[derive(Clone, Default)]
pub struct TunnelManager {
    tunnels: Arc<Mutex<HashMap<String, TunnelState>>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the local port for `config.connection_id`, establishing the
    /// tunnel if needed.
    ///
    /// Concurrent callers for the same id share a single attempt. The attempt
    /// runs on its own task, so dropping a caller never leaves a half-built
    /// entry behind.
    pub async fn create_tunnel(&self, config: TunnelConfig) -> Result<u16> {
        let connection_id = config.connection_id.clone();
        let mut outcome = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels.get(&connection_id) {
                Some(TunnelState::Active(tunnel)) => {
                    debug!(
                        "Reusing tunnel for connection {} on port {}",
                        connection_id, tunnel.info.local_port
                    );
                    return Ok(tunnel.info.local_port);
                }
                Some(TunnelState::Establishing(outcome)) => outcome.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    tunnels.insert(
                        connection_id.clone(),
                        TunnelState::Establishing(rx.clone()),
                    );
                    tokio::spawn(self.clone().run_establish(config, tx));
                    rx
                }
            }
        };

        let waited = outcome
            .wait_for(|outcome| outcome.is_some())
            .await
            .map(|settled| settled.clone());
        let settled = match waited {
            Ok(settled) => settled,
            Err(_) => {
                self.forget_abandoned(&connection_id, &outcome).await;
                return Err(DataError::TunnelFailed(format!(
                    "connection {}: tunnel setup was aborted",
                    connection_id
                )));
            }
        };

        match settled {
            Some(Ok(port)) => Ok(port),
            Some(Err(message)) => Err(DataError::TunnelFailed(message)),
            None => Err(DataError::Internal(format!(
                "connection {}: tunnel outcome missing",
                connection_id
            ))),
        }
    }

    async fn run_establish(self, config: TunnelConfig, outcome: watch::Sender<Outcome>) {
        let connection_id = config.connection_id.clone();
        let result = establish(&config).await;

        let mut tunnels = self.tunnels.lock().await;
        let settled = match result {
            Ok(tunnel) => {
                let port = tunnel.info.local_port;
                info!(
                    "SSH tunnel for connection {} listening on 127.0.0.1:{} -> {}:{}",
                    connection_id, port, tunnel.info.remote_host, tunnel.info.remote_port
                );
                tunnels.insert(connection_id, TunnelState::Active(Arc::new(tunnel)));
                Ok(port)
            }
            Err(e) => {
                error!("Failed to establish SSH tunnel: {}", e);
                tunnels.remove(&connection_id);
                Err(match e {
                    DataError::TunnelFailed(message) => message,
                    other => other.to_string(),
                })
            }
        };
        drop(tunnels);

        // No receivers left is fine: the entry is already settled.
        let _ = outcome.send(Some(settled));
    }

    /// Drop an establishing entry whose attempt ended without reporting,
    /// so the next caller starts a fresh one
    async fn forget_abandoned(&self, connection_id: &str, outcome: &watch::Receiver<Outcome>) {
        let mut tunnels = self.tunnels.lock().await;
        let abandoned = matches!(
            tunnels.get(connection_id),
            Some(TunnelState::Establishing(current)) if current.same_channel(outcome)
        );
        if abandoned {
            tunnels.remove(connection_id);
            warn!(
                "Tunnel setup for connection {} ended without an outcome",
                connection_id
            );
        }
    }

    /// Local port of an active tunnel
    pub async fn local_port(&self, connection_id: &str) -> Option<u16> {
        self.get(connection_id).await.map(|info| info.local_port)
    }

    /// Snapshot of an active tunnel; establishing tunnels are not reported
    pub async fn get(&self, connection_id: &str) -> Option<TunnelInfo> {
        match self.tunnels.lock().await.get(connection_id) {
            Some(TunnelState::Active(tunnel)) => Some(tunnel.info.clone()),
            _ => None,
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.tunnels.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.lock().await.is_empty()
    }

    /// Tear down the tunnel for `connection_id`; a no-op when there is none.
    ///
    /// An attempt that is still establishing is awaited first and then closed.
    pub async fn close_tunnel(&self, connection_id: &str) {
        loop {
            let pending = {
                let mut tunnels = self.tunnels.lock().await;
                match tunnels.remove(connection_id) {
                    None => return,
                    Some(TunnelState::Active(tunnel)) => {
                        drop(tunnels);
                        tunnel.shutdown().await;
                        info!("Closed SSH tunnel for connection {}", connection_id);
                        return;
                    }
                    Some(TunnelState::Establishing(outcome)) => {
                        tunnels.insert(
                            connection_id.to_string(),
                            TunnelState::Establishing(outcome.clone()),
                        );
                        outcome
                    }
                }
            };

            let mut pending = pending;
            let settled = pending.wait_for(|outcome| outcome.is_some()).await.is_ok();
            if !settled {
                self.forget_abandoned(connection_id, &pending).await;
                return;
            }
        }
    }

    /// Tear down every tunnel concurrently
    pub async fn close_all(&self) {
        let ids = self.ids().await;
        if ids.is_empty() {
            return;
        }
        debug!("Closing {} SSH tunnel(s)", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.close_tunnel(id))).await;
    }
}

/// Session first, then the listener; the session is closed again if the
/// listener cannot be bound.
async fn establish(config: &TunnelConfig) -> Result<Tunnel> {
    debug!(
        "Opening SSH tunnel for connection {} via {}",
        config.connection_id,
        config.gateway()
    );
    let session = Arc::new(session::open_session(config).await?);

    let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            session::close_session(&session, &config.connection_id).await;
            return Err(DataError::TunnelFailed(format!(
                "connection {}: could not bind local listener: {}",
                config.connection_id, e
            )));
        }
    };
    let local_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            session::close_session(&session, &config.connection_id).await;
            return Err(DataError::TunnelFailed(format!(
                "connection {}: could not read local listener address: {}",
                config.connection_id, e
            )));
        }
    };

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(accept_loop(
        listener,
        session.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    Ok(Tunnel {
        info: TunnelInfo {
            connection_id: config.connection_id.clone(),
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            local_port,
        },
        session,
        shutdown,
        listener: Mutex::new(Some(task)),
    })
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    config: TunnelConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(
                        "Accepted {} on tunnel for connection {}",
                        peer, config.connection_id
                    );
                    tokio::spawn(session::forward(
                        session.clone(),
                        socket,
                        peer,
                        config.remote_host.clone(),
                        config.remote_port,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(
                    "Accept failed on tunnel for connection {}: {}",
                    config.connection_id, e
                ),
            }
        }
    }
    debug!("Listener for connection {} stopped", config.connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable(connection_id: &str) -> TunnelConfig {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        TunnelConfig {
            connection_id: connection_id.to_string(),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: port,
            ssh_username: "deploy".to_string(),
            auth: SshAuth::Password("secret".to_string()),
            remote_host: "db.internal".to_string(),
            remote_port: 5432,
            connect_timeout: Duration::from_millis(500),
        }
    }

    /// Leave an establishing entry whose attempt died before reporting
    async fn abandoned(manager: &TunnelManager, connection_id: &str) {
        let (tx, rx) = watch::channel(None);
        manager
            .tunnels
            .lock()
            .await
            .insert(connection_id.to_string(), TunnelState::Establishing(rx));
        drop(tx);
    }

    #[tokio::test]
    async fn test_abandoned_attempt_does_not_block_retries() {
        let manager = TunnelManager::new();
        abandoned(&manager, "c1").await;

        let err = manager.create_tunnel(unreachable("c1")).await.unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert!(manager.is_empty().await);

        // The retry makes a real attempt instead of hitting the dead entry
        let err = manager.create_tunnel(unreachable("c1")).await.unwrap_err();
        assert_eq!(err.code(), "TUNNEL_ERROR");
        assert!(!err.to_string().contains("aborted"));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_forgets_abandoned_attempt() {
        let manager = TunnelManager::new();
        abandoned(&manager, "c2").await;

        manager.close_tunnel("c2").await;
        assert!(manager.is_empty().await);
    }
}
