//! Parsing of `scheme://[user[:pass]@]host[:port]/database[?options]` connection URIs.

use crate::config::{ConnectionConfig, DatabaseType};
use crate::error::{DataError, Result};
use url::Url;

fn scheme_type(scheme: &str) -> Option<DatabaseType> {
    match scheme {
        "postgres" | "postgresql" => Some(DatabaseType::Postgres),
        "mysql" => Some(DatabaseType::Mysql),
        "mariadb" => Some(DatabaseType::Mariadb),
        "mssql" | "sqlserver" => Some(DatabaseType::Mssql),
        "oracle" => Some(DatabaseType::Oracle),
        "cockroachdb" | "cockroach" => Some(DatabaseType::Cockroachdb),
        "mongodb" | "mongodb+srv" => Some(DatabaseType::Mongodb),
        "redis" | "rediss" => Some(DatabaseType::Redis),
        "sqlite" | "sqlite3" => Some(DatabaseType::Sqlite),
        "neo4j" | "neo4j+s" | "bolt" | "bolt+s" => Some(DatabaseType::Neo4j),
        "cassandra" => Some(DatabaseType::Cassandra),
        "elasticsearch" | "es" => Some(DatabaseType::Elasticsearch),
        _ => None,
    }
}

fn decode(part: &str) -> String {
    urlencoding::decode(part)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| part.to_string())
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "false" | "0" | "disable" | "disabled" | "no" | "off"
    )
}

impl ConnectionConfig {
    /// Parse a connection URI into a partial config (no id, name derived from host/database)
    pub fn from_uri(uri: &str) -> Result<ConnectionConfig> {
        let trimmed = uri.trim();
        let (scheme, rest) = trimmed.split_once("://").ok_or_else(|| {
            DataError::invalid_configuration(format!("'{}' is not a connection URI", trimmed))
        })?;
        let scheme = scheme.to_ascii_lowercase();
        let db_type = scheme_type(&scheme).ok_or_else(|| {
            DataError::invalid_configuration(format!("unsupported URI scheme: {}", scheme))
        })?;

        if db_type == DatabaseType::Sqlite {
            let path = rest.split('?').next().unwrap_or_default();
            if path.is_empty() {
                return Err(DataError::invalid_configuration(
                    "sqlite URI requires a file path",
                ));
            }
            let filename = decode(path);
            let name = std::path::Path::new(&filename)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| filename.clone());
            let mut config = ConnectionConfig::new(name, db_type).with_filename(filename);
            config.connection_string = Some(trimmed.to_string());
            return Ok(config);
        }

        let url = Url::parse(trimmed)
            .map_err(|e| DataError::invalid_configuration(format!("invalid URI: {}", e)))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DataError::invalid_configuration("URI is missing a host"))?
            .to_string();

        let database = decode(url.path().trim_start_matches('/'));
        let name = if database.is_empty() {
            host.clone()
        } else {
            format!("{}/{}", host, database)
        };

        let mut config = ConnectionConfig::new(name, db_type)
            .with_host(host)
            .with_database(database);
        config.port = url.port().or_else(|| db_type.default_port());
        config.connection_string = Some(trimmed.to_string());

        if !url.username().is_empty() {
            config.username = Some(decode(url.username()));
        }
        if let Some(password) = url.password() {
            config.password = Some(decode(password));
        }
        if matches!(scheme.as_str(), "rediss" | "mongodb+srv" | "neo4j+s" | "bolt+s") {
            config.ssl = Some(true);
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "ssl" | "tls" => config.ssl = Some(is_truthy(&value)),
                "sslmode" => config.ssl = Some(is_truthy(&value)),
                _ => {
                    config.options.insert(key.into_owned(), value.into_owned());
                }
            }
        }

        Ok(config)
    }
}
