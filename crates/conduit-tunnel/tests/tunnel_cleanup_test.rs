//! Socket accounting for failed tunnel attempts. Kept in its own test binary
//! so no other test opens sockets in this process meanwhile.
#![cfg(target_os = "linux")]

use conduit_tunnel::{SshAuth, TunnelConfig, TunnelManager};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Socket descriptors currently held by this process
fn open_sockets() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            std::fs::read_link(entry.path())
                .map(|target| target.to_string_lossy().starts_with("socket:"))
                .unwrap_or(false)
        })
        .count()
}

/// Socket count once background teardown has had a chance to finish
async fn settled_sockets(expected: usize) -> usize {
    for _ in 0..50 {
        if open_sockets() == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    open_sockets()
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
async fn test_failed_attempts_leave_no_listener_or_session_socket() {
    let refused_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let baseline = open_sockets();
    let manager = TunnelManager::new();

    let err = manager
        .create_tunnel(tunnel_to(refused_port, "refused"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TUNNEL_ERROR");
    assert!(manager.local_port("refused").await.is_none());
    assert_eq!(settled_sockets(baseline).await, baseline);

    // A peer that accepts but does not speak SSH
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        let _ = socket.shutdown().await;
    });

    let err = manager
        .create_tunnel(tunnel_to(port, "garbled"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TUNNEL_ERROR");
    server.await.unwrap();

    assert!(manager.is_empty().await);
    assert_eq!(settled_sockets(baseline).await, baseline);
}
