use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Backend type identifier
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Postgres,
    Mysql,
    Mariadb,
    Mssql,
    Oracle,
    Cockroachdb,
    Mongodb,
    Redis,
    Neo4j,
    Cassandra,
    Elasticsearch,
    Dynamodb,
    Firestore,
}

/// Structural family of a backend, used for query language selection
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DatabaseFamily {
    Relational,
    Document,
    KeyValue,
    Graph,
    WideColumn,
    Search,
}

impl DatabaseType {
    pub fn family(&self) -> DatabaseFamily {
        match self {
            DatabaseType::Sqlite
            | DatabaseType::Postgres
            | DatabaseType::Mysql
            | DatabaseType::Mariadb
            | DatabaseType::Mssql
            | DatabaseType::Oracle
            | DatabaseType::Cockroachdb => DatabaseFamily::Relational,
            DatabaseType::Mongodb | DatabaseType::Dynamodb | DatabaseType::Firestore => {
                DatabaseFamily::Document
            }
            DatabaseType::Redis => DatabaseFamily::KeyValue,
            DatabaseType::Neo4j => DatabaseFamily::Graph,
            DatabaseType::Cassandra => DatabaseFamily::WideColumn,
            DatabaseType::Elasticsearch => DatabaseFamily::Search,
        }
    }

    /// Default TCP port, `None` for embedded or cloud-API backends
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DatabaseType::Postgres => Some(5432),
            DatabaseType::Mysql | DatabaseType::Mariadb => Some(3306),
            DatabaseType::Mssql => Some(1433),
            DatabaseType::Oracle => Some(1521),
            DatabaseType::Cockroachdb => Some(26257),
            DatabaseType::Mongodb => Some(27017),
            DatabaseType::Redis => Some(6379),
            DatabaseType::Neo4j => Some(7687),
            DatabaseType::Cassandra => Some(9042),
            DatabaseType::Elasticsearch => Some(9200),
            DatabaseType::Sqlite | DatabaseType::Dynamodb | DatabaseType::Firestore => None,
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "SQLite",
            DatabaseType::Postgres => "PostgreSQL",
            DatabaseType::Mysql => "MySQL",
            DatabaseType::Mariadb => "MariaDB",
            DatabaseType::Mssql => "SQL Server",
            DatabaseType::Oracle => "Oracle",
            DatabaseType::Cockroachdb => "CockroachDB",
            DatabaseType::Mongodb => "MongoDB",
            DatabaseType::Redis => "Redis",
            DatabaseType::Neo4j => "Neo4j",
            DatabaseType::Cassandra => "Cassandra",
            DatabaseType::Elasticsearch => "Elasticsearch",
            DatabaseType::Dynamodb => "DynamoDB",
            DatabaseType::Firestore => "Firestore",
        }
    }

    /// Whether this backend is reached over a network socket (and so can be tunneled)
    pub fn is_networked(&self) -> bool {
        self.default_port().is_some()
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{}", name)
    }
}

/// Secret material for a connection. Never persisted with the config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSecrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key: Option<String>,
}

impl ConnectionSecrets {
    pub fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.ssh_password.is_none()
            && self.ssh_private_key.is_none()
            && self.ssh_passphrase.is_none()
            && self.aws_secret_access_key.is_none()
            && self.service_account_key.is_none()
    }

    /// Overlay `newer` on top of `self`; fields absent in `newer` are kept
    pub fn merge(self, newer: ConnectionSecrets) -> ConnectionSecrets {
        ConnectionSecrets {
            password: newer.password.or(self.password),
            ssh_password: newer.ssh_password.or(self.ssh_password),
            ssh_private_key: newer.ssh_private_key.or(self.ssh_private_key),
            ssh_passphrase: newer.ssh_passphrase.or(self.ssh_passphrase),
            aws_secret_access_key: newer.aws_secret_access_key.or(self.aws_secret_access_key),
            service_account_key: newer.service_account_key.or(self.service_account_key),
        }
    }
}

/// Persistent identity of one backend endpoint plus its credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, db_type: DatabaseType) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            db_type,
            host: None,
            port: None,
            database: String::new(),
            username: None,
            password: None,
            filename: None,
            connection_string: None,
            ssl: None,
            ssh_enabled: None,
            ssh_host: None,
            ssh_port: None,
            ssh_username: None,
            ssh_password: None,
            ssh_private_key: None,
            ssh_passphrase: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            project_id: None,
            service_account_key: None,
            options: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_ssh(
        mut self,
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_username: impl Into<String>,
    ) -> Self {
        self.ssh_enabled = Some(true);
        self.ssh_host = Some(ssh_host.into());
        self.ssh_port = Some(ssh_port);
        self.ssh_username = Some(ssh_username.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn ssh_enabled(&self) -> bool {
        self.ssh_enabled.unwrap_or(false)
    }

    /// Port to dial, falling back to the backend default
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.db_type.default_port())
    }

    /// Check required fields for the configured backend type
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DataError::invalid_configuration(
                "connection name is required",
            ));
        }

        match self.db_type {
            DatabaseType::Sqlite => {
                if self.filename.as_deref().map_or(true, |f| f.trim().is_empty()) {
                    return Err(DataError::invalid_configuration(format!(
                        "connection '{}': filename is required for sqlite",
                        self.name
                    )));
                }
            }
            DatabaseType::Firestore => {
                if self.project_id.is_none() {
                    return Err(DataError::invalid_configuration(format!(
                        "connection '{}': projectId is required for firestore",
                        self.name
                    )));
                }
            }
            DatabaseType::Dynamodb => {
                if self.aws_region.is_none() {
                    return Err(DataError::invalid_configuration(format!(
                        "connection '{}': awsRegion is required for dynamodb",
                        self.name
                    )));
                }
            }
            _ => {
                if self.host.is_none() && self.connection_string.is_none() {
                    return Err(DataError::invalid_configuration(format!(
                        "connection '{}': host or connectionString is required",
                        self.name
                    )));
                }
            }
        }

        if self.ssh_enabled() {
            if !self.db_type.is_networked() {
                return Err(DataError::invalid_configuration(format!(
                    "connection '{}': SSH tunneling is not available for {}",
                    self.name,
                    self.db_type.label()
                )));
            }
            if self.ssh_host.is_none() || self.ssh_username.is_none() {
                return Err(DataError::invalid_configuration(format!(
                    "connection '{}': sshHost and sshUsername are required when SSH is enabled",
                    self.name
                )));
            }
            if self.host.is_none() {
                return Err(DataError::invalid_configuration(format!(
                    "connection '{}': host is required when SSH is enabled",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Extract the secret fields
    pub fn secrets(&self) -> ConnectionSecrets {
        ConnectionSecrets {
            password: self.password.clone().or_else(|| {
                self.connection_string
                    .as_deref()
                    .and_then(split_uri_password)
                    .map(|(_, password)| password)
            }),
            ssh_password: self.ssh_password.clone(),
            ssh_private_key: self.ssh_private_key.clone(),
            ssh_passphrase: self.ssh_passphrase.clone(),
            aws_secret_access_key: self.aws_secret_access_key.clone(),
            service_account_key: self.service_account_key.clone(),
        }
    }

    /// Copy of this config with every secret field cleared
    pub fn redacted(&self) -> ConnectionConfig {
        let mut config = self.clone();
        config.password = None;
        config.ssh_password = None;
        config.ssh_private_key = None;
        config.ssh_passphrase = None;
        config.aws_secret_access_key = None;
        config.service_account_key = None;
        if let Some((stripped, _)) = self.connection_string.as_deref().and_then(split_uri_password) {
            config.connection_string = Some(stripped);
        }
        config
    }

    /// Copy of this config with secrets filled back in
    pub fn with_secrets(&self, secrets: ConnectionSecrets) -> ConnectionConfig {
        let mut config = self.clone();
        config.password = secrets.password;
        config.ssh_password = secrets.ssh_password;
        config.ssh_private_key = secrets.ssh_private_key;
        config.ssh_passphrase = secrets.ssh_passphrase;
        config.aws_secret_access_key = secrets.aws_secret_access_key;
        config.service_account_key = secrets.service_account_key;
        config
    }

    /// Connection string for display purposes (without password)
    pub fn display_string(&self) -> String {
        if let Some(filename) = &self.filename {
            return format!("{}://{}", self.db_type, filename);
        }

        let mut parts = vec![format!("{}://", self.db_type)];

        if let Some(username) = &self.username {
            parts.push(format!("{}@", username));
        }

        if let Some(host) = &self.host {
            parts.push(host.clone());

            if let Some(port) = self.effective_port() {
                parts.push(format!(":{}", port));
            }
        }

        if !self.database.is_empty() {
            parts.push(format!("/{}", self.database));
        }

        parts.join("")
    }
}

/// Split the password out of a URI-style connection string
fn split_uri_password(uri: &str) -> Option<(String, String)> {
    let mut url = url::Url::parse(uri).ok()?;
    let raw = url.password()?.to_string();
    let password = urlencoding::decode(&raw)
        .map(|p| p.into_owned())
        .unwrap_or(raw);
    url.set_password(None).ok()?;
    Some((url.to_string(), password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_creation() {
        let config = ConnectionConfig::new("local pg", DatabaseType::Postgres)
            .with_host("localhost")
            .with_port(5432)
            .with_database("mydb");

        assert_eq!(config.db_type, DatabaseType::Postgres);
        assert_eq!(config.host, Some("localhost".to_string()));
        assert_eq!(config.port, Some(5432));
        assert_eq!(config.database, "mydb");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_display_string_hides_password() {
        let config = ConnectionConfig::new("pg", DatabaseType::Postgres)
            .with_host("localhost")
            .with_username("admin")
            .with_password("hunter2")
            .with_database("mydb");

        let display = config.display_string();
        assert_eq!(display, "postgres://admin@localhost:5432/mydb");
        assert!(!display.contains("hunter2"));
    }

    #[test]
    fn test_sqlite_requires_filename() {
        let config = ConnectionConfig::new("file", DatabaseType::Sqlite);
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let config = config.with_filename("/tmp/test.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ssh_requires_gateway_fields() {
        let mut config = ConnectionConfig::new("tunneled", DatabaseType::Postgres)
            .with_host("10.0.0.5");
        config.ssh_enabled = Some(true);
        assert!(config.validate().is_err());

        let config = config.with_ssh("bastion.example.com", 22, "deploy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redaction_and_rehydration() {
        let mut config = ConnectionConfig::new("pg", DatabaseType::Postgres)
            .with_host("localhost")
            .with_password("secret");
        config.ssh_private_key = Some("-----BEGIN KEY-----".to_string());

        let secrets = config.secrets();
        let redacted = config.redacted();
        assert!(redacted.password.is_none());
        assert!(redacted.ssh_private_key.is_none());
        assert!(redacted.secrets().is_empty());

        let restored = redacted.with_secrets(secrets);
        assert_eq!(restored, config);
    }

    #[test]
    fn test_connection_string_password_is_redacted() {
        let mut config = ConnectionConfig::new("pg", DatabaseType::Postgres);
        config.connection_string = Some("postgres://app:p%40ss@db:5432/shop".to_string());

        assert_eq!(config.secrets().password.as_deref(), Some("p@ss"));
        let redacted = config.redacted();
        assert_eq!(
            redacted.connection_string.as_deref(),
            Some("postgres://app@db:5432/shop")
        );
        assert!(redacted.secrets().is_empty());
    }

    #[test]
    fn test_secrets_merge_keeps_absent_fields() {
        let stored = ConnectionSecrets {
            password: Some("old".into()),
            ssh_password: Some("ssh".into()),
            ..Default::default()
        };
        let incoming = ConnectionSecrets {
            password: Some("new".into()),
            ..Default::default()
        };

        let merged = stored.merge(incoming);
        assert_eq!(merged.password.as_deref(), Some("new"));
        assert_eq!(merged.ssh_password.as_deref(), Some("ssh"));
    }

    #[test]
    fn test_config_serializes_camel_case_type() {
        let config = ConnectionConfig::new("r", DatabaseType::Redis).with_host("cache");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "redis");
        assert!(json.get("password").is_none());
        assert_eq!(DatabaseType::Redis.to_string(), "redis");
    }
}
