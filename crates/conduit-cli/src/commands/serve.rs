use crate::config::ConduitConfig;
use clap::Args;
use conduit_connections::{ConnectionService, EncryptedFileVault, EncryptionService, JsonFileStore};
use conduit_query::AdapterFactory;
use conduit_query_postgres::PostgresBuilder;
use conduit_query_redis::RedisBuilder;
use conduit_query_sqlite::SqliteBuilder;
use conduit_router::{MessageRouter, Response};
use conduit_tunnel::TunnelManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Args)]
pub struct ServeCommand {
    /// Data directory holding connections, secrets and the encryption key
    #[arg(long, env = "CONDUIT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Answer with a timeout error when a request takes longer than this
    #[arg(long, env = "CONDUIT_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Upper bound for closing connections and tunnels on exit
    #[arg(long, default_value_t = 10, env = "CONDUIT_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,
}

impl ServeCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = ConduitConfig::new(self.data_dir.clone())?;
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run(config))
    }

    async fn run(self, config: ConduitConfig) -> anyhow::Result<()> {
        let service = Arc::new(build_service(&config).await?);
        let loaded = service.load().await?;
        info!(
            "Serving on stdio with {} saved connection(s) from {}",
            loaded,
            config.data_dir.display()
        );

        let router = Arc::new(MessageRouter::new(service.clone()));
        let ceiling = self.request_timeout_ms.map(Duration::from_millis);

        // Single writer so concurrent responses never interleave on stdout
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(response) = rx.recv().await {
                let mut line = match serde_json::to_string(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to encode response {}: {}", response.id, e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = stdout.write_all(line.as_bytes()).await {
                    error!("Failed to write response: {}", e);
                    break;
                }
                if let Err(e) = stdout.flush().await {
                    error!("Failed to flush stdout: {}", e);
                    break;
                }
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut in_flight = JoinSet::new();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let router = router.clone();
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            let response = respond(router, line, ceiling).await;
                            if tx.send(response).is_err() {
                                warn!("Response dropped: writer has stopped");
                            }
                        });
                    }
                    Ok(None) => {
                        debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read request: {}", e);
                        break;
                    }
                },
                // Reap finished tasks so the set does not grow unbounded
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = &mut ctrl_c => {
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }

        let shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);
        drain_in_flight(&mut in_flight, shutdown_timeout).await;
        drop(tx);
        if let Err(e) = writer.await {
            warn!("Response writer ended abnormally: {}", e);
        }

        if tokio::time::timeout(shutdown_timeout, service.shutdown())
            .await
            .is_err()
        {
            warn!(
                "Shutdown exceeded {:?}; exiting with connections still open",
                shutdown_timeout
            );
        }
        Ok(())
    }
}

async fn build_service(config: &ConduitConfig) -> anyhow::Result<ConnectionService> {
    let encryption = EncryptionService::new(&config.encryption_key)?;
    let vault = EncryptedFileVault::open(config.secrets_path(), encryption).await?;
    let store = JsonFileStore::new(config.connections_path());

    let factory = Arc::new(AdapterFactory::new());
    factory.register_builder(Arc::new(SqliteBuilder)).await;
    factory.register_builder(Arc::new(PostgresBuilder::postgres())).await;
    factory.register_builder(Arc::new(PostgresBuilder::cockroachdb())).await;
    factory.register_builder(Arc::new(RedisBuilder)).await;

    Ok(ConnectionService::new(
        Arc::new(store),
        Arc::new(vault),
        factory,
        TunnelManager::new(),
    ))
}

/// Wait for in-flight requests, aborting whatever is still running once
/// `limit` passes. Returns true when every request finished on its own.
async fn drain_in_flight(in_flight: &mut JoinSet<()>, limit: Duration) -> bool {
    let drained = tokio::time::timeout(limit, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    if !drained {
        warn!(
            "{} request(s) still running after {:?}; abandoning them",
            in_flight.len(),
            limit
        );
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
    }
    drained
}

/// Best-effort id recovery for responses produced outside the router
fn request_id(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| match value.get("id") {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(serde_json::Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Run one request on its own task. A panic or an exceeded ceiling still
/// yields a response; timed-out work keeps running detached.
async fn respond(router: Arc<MessageRouter>, line: String, ceiling: Option<Duration>) -> Response {
    let id = request_id(&line);
    let mut task = tokio::spawn(async move { router.handle_raw(&line).await });

    let joined = match ceiling {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Request {} exceeded {:?}", id, limit);
                return Response::err(
                    id,
                    "TIMEOUT",
                    format!("request did not complete within {} ms", limit.as_millis()),
                );
            }
        },
        None => task.await,
    };

    joined.unwrap_or_else(|e| {
        error!("Request {} handler failed: {}", id, e);
        Response::err(id, "INTERNAL_ERROR", format!("request handler failed: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_connections::{MemoryStore, MemoryVault};

    fn router() -> Arc<MessageRouter> {
        let service = ConnectionService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryVault::new()),
            Arc::new(AdapterFactory::new()),
            TunnelManager::new(),
        );
        Arc::new(MessageRouter::new(Arc::new(service)))
    }

    #[test]
    fn test_request_id_recovery() {
        assert_eq!(request_id(r#"{"id":"abc","type":"X"}"#), "abc");
        assert_eq!(request_id(r#"{"id":42}"#), "42");
        assert_eq!(request_id("garbage"), "");
    }

    #[tokio::test]
    async fn test_respond_wraps_router_output() {
        let response = respond(
            router(),
            r#"{"id":"1","type":"LIST_CONNECTIONS"}"#.to_string(),
            Some(Duration::from_secs(5)),
        )
        .await;
        assert!(response.success);
        assert_eq!(response.id, "1");

        let response = respond(router(), r#"{"id":"2","type":"NOPE"}"#.to_string(), None).await;
        assert!(!response.success);
        assert_eq!(response.id, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_abandons_stuck_requests() {
        let mut in_flight = JoinSet::new();
        in_flight.spawn(async {});
        in_flight.spawn(std::future::pending::<()>());

        assert!(!drain_in_flight(&mut in_flight, Duration::from_secs(10)).await);
        assert!(in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_finishing_requests() {
        let mut in_flight = JoinSet::new();
        in_flight.spawn(tokio::time::sleep(Duration::from_secs(2)));

        assert!(drain_in_flight(&mut in_flight, Duration::from_secs(10)).await);
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_build_service_creates_vault_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConduitConfig::new(Some(dir.path().to_path_buf())).unwrap();

        let service = build_service(&config).await.unwrap();
        assert_eq!(service.load().await.unwrap(), 0);
        assert!(service.factory().supports(conduit_query::DatabaseType::Redis).await);
        assert!(service.factory().supports(conduit_query::DatabaseType::Cockroachdb).await);
    }
}
