use conduit_query::{ConnectionConfig, DatabaseType};
use conduit_tunnel::{SshAuth, TunnelConfig, TunnelManager};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// A port on loopback with nothing listening behind it
async fn closed_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn tunnel_to(ssh_port: u16, connection_id: &str) -> TunnelConfig {
    TunnelConfig {
        connection_id: connection_id.to_string(),
        ssh_host: "127.0.0.1".to_string(),
        ssh_port,
        ssh_username: "deploy".to_string(),
        auth: SshAuth::Password("secret".to_string()),
        remote_host: "db.internal".to_string(),
        remote_port: 5432,
        connect_timeout: Duration::from_millis(500),
    }
}

#[tokio::test]
async fn test_unreachable_gateway_leaves_no_tunnel() {
    let manager = TunnelManager::new();
    let port = closed_port().await;

    let err = manager.create_tunnel(tunnel_to(port, "c1")).await.unwrap_err();
    assert_eq!(err.code(), "TUNNEL_ERROR");
    assert!(err.to_string().contains("c1"));
    assert!(manager.is_empty().await);
    assert!(manager.get("c1").await.is_none());
}

#[tokio::test]
async fn test_silent_gateway_times_out() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        // Accept and never speak SSH
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let manager = TunnelManager::new();
    let config = tunnel_to(port, "c2").with_connect_timeout(Duration::from_millis(200));
    let err = manager.create_tunnel(config).await.unwrap_err();

    assert_eq!(err.code(), "TUNNEL_ERROR");
    assert!(err.to_string().contains("timed out"));
    assert!(manager.is_empty().await);
    server.abort();
}

#[tokio::test]
async fn test_non_ssh_peer_is_rejected() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        let _ = socket.shutdown().await;
    });

    let manager = TunnelManager::new();
    let err = manager.create_tunnel(tunnel_to(port, "c3")).await.unwrap_err();
    assert_eq!(err.code(), "TUNNEL_ERROR");
    assert!(manager.is_empty().await);
    let _ = server.await;
}

#[tokio::test]
async fn test_concurrent_callers_share_the_failure() {
    let manager = TunnelManager::new();
    let port = closed_port().await;

    let (first, second) = tokio::join!(
        manager.create_tunnel(tunnel_to(port, "shared")),
        manager.create_tunnel(tunnel_to(port, "shared")),
    );

    assert_eq!(first.unwrap_err().code(), "TUNNEL_ERROR");
    assert_eq!(second.unwrap_err().code(), "TUNNEL_ERROR");
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_close_is_a_noop_when_absent() {
    let manager = TunnelManager::new();
    manager.close_tunnel("missing").await;
    manager.close_tunnel("missing").await;
    manager.close_all().await;
    assert!(manager.is_empty().await);
}

#[test]
fn test_config_from_connection_uses_default_ports() {
    let mut connection = ConnectionConfig::new("cache", DatabaseType::Redis)
        .with_id("r1")
        .with_host("10.0.0.5");
    connection.ssh_enabled = Some(true);
    connection.ssh_host = Some("bastion".to_string());
    connection.ssh_username = Some("ops".to_string());
    connection.ssh_password = Some("pw".to_string());

    let tunnel = TunnelConfig::from_connection(&connection).unwrap();
    assert_eq!(tunnel.ssh_port, 22);
    assert_eq!(tunnel.remote_port, 6379);
}
