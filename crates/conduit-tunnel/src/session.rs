//! SSH session setup and per-socket forwarding.

use crate::config::{SshAuth, TunnelConfig};
use async_trait::async_trait;
use conduit_query::{DataError, Result};
use russh::client::{self, Handle};
use russh::Disconnect;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Client-side session callbacks
pub(crate) struct GatewayHandler {
    gateway: String,
}

#[async_trait]
impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    // Host keys are not pinned; only the fingerprint is logged.
    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            "SSH gateway {} presented host key {}",
            self.gateway,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

pub(crate) type Session = Handle<GatewayHandler>;

fn tunnel_error(config: &TunnelConfig, stage: &str, detail: impl std::fmt::Display) -> DataError {
    DataError::TunnelFailed(format!(
        "connection {}: {} via {}: {}",
        config.connection_id,
        stage,
        config.gateway(),
        detail
    ))
}

/// Open and authenticate an SSH session to the gateway
pub(crate) async fn open_session(config: &TunnelConfig) -> Result<Session> {
    let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let handler = GatewayHandler {
        gateway: config.gateway(),
    };

    let connecting = client::connect(
        ssh_config,
        (config.ssh_host.as_str(), config.ssh_port),
        handler,
    );
    let mut session = match tokio::time::timeout(config.connect_timeout, connecting).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return Err(tunnel_error(config, "SSH handshake failed", e)),
        Err(_) => {
            return Err(tunnel_error(
                config,
                "SSH handshake timed out",
                format!("no answer within {:?}", config.connect_timeout),
            ))
        }
    };

    let authenticated = match &config.auth {
        SshAuth::Password(password) => session
            .authenticate_password(config.ssh_username.as_str(), password.as_str())
            .await
            .map_err(|e| tunnel_error(config, "password authentication failed", e)),
        SshAuth::PrivateKey { key, passphrase } => {
            match russh_keys::decode_secret_key(key, passphrase.as_deref()) {
                Ok(key_pair) => session
                    .authenticate_publickey(config.ssh_username.as_str(), Arc::new(key_pair))
                    .await
                    .map_err(|e| tunnel_error(config, "key authentication failed", e)),
                Err(e) => Err(tunnel_error(config, "could not decode private key", e)),
            }
        }
    };

    match authenticated {
        Ok(true) => Ok(session),
        Ok(false) => {
            close_session(&session, &config.connection_id).await;
            Err(tunnel_error(
                config,
                "authentication rejected",
                format!("user '{}'", config.ssh_username),
            ))
        }
        Err(e) => {
            close_session(&session, &config.connection_id).await;
            Err(e)
        }
    }
}

pub(crate) async fn close_session(session: &Session, connection_id: &str) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
        .await
    {
        debug!(
            "SSH session for connection {} was already closed: {}",
            connection_id, e
        );
    }
}

/// Pipe one accepted local socket through a `direct-tcpip` channel until
/// either side closes or the tunnel shuts down
pub(crate) async fn forward(
    session: Arc<Session>,
    mut socket: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    let channel = match session
        .channel_open_direct_tcpip(
            remote_host.as_str(),
            u32::from(remote_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "Failed to open forwarding channel to {}:{}: {}",
                remote_host, remote_port, e
            );
            return;
        }
    };

    let mut stream = channel.into_stream();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut stream) => match copied {
            Ok((sent, received)) => debug!(
                "Forwarded {} -> {}:{} closed ({} bytes out, {} bytes in)",
                peer, remote_host, remote_port, sent, received
            ),
            Err(e) => debug!(
                "Forwarded {} -> {}:{} ended with error: {}",
                peer, remote_host, remote_port, e
            ),
        }
    }
}
