use conduit_query::{ConnectionConfig, DataError, Result};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How the tunnel authenticates against the SSH gateway
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(***)"),
            SshAuth::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"***")
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// Everything needed to forward one remote endpoint through an SSH gateway
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub connection_id: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub auth: SshAuth,
    pub remote_host: String,
    pub remote_port: u16,
    pub connect_timeout: Duration,
}

impl TunnelConfig {
    /// Derive the tunnel parameters from a connection with secrets filled in.
    ///
    /// A private key wins over a password when both are present.
    pub fn from_connection(config: &ConnectionConfig) -> Result<Self> {
        let missing = |field: &str| {
            DataError::invalid_configuration(format!(
                "connection '{}': {} is required for an SSH tunnel",
                config.name, field
            ))
        };

        let ssh_host = config.ssh_host.clone().ok_or_else(|| missing("sshHost"))?;
        let ssh_username = config
            .ssh_username
            .clone()
            .ok_or_else(|| missing("sshUsername"))?;
        let remote_host = config.host.clone().ok_or_else(|| missing("host"))?;
        let remote_port = config.effective_port().ok_or_else(|| missing("port"))?;

        let auth = match (&config.ssh_private_key, &config.ssh_password) {
            (Some(key), _) if !key.trim().is_empty() => SshAuth::PrivateKey {
                key: key.clone(),
                passphrase: config.ssh_passphrase.clone().filter(|p| !p.is_empty()),
            },
            (_, Some(password)) => SshAuth::Password(password.clone()),
            _ => return Err(missing("sshPassword or sshPrivateKey")),
        };

        Ok(Self {
            connection_id: config.id.clone(),
            ssh_host,
            ssh_port: config.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            ssh_username,
            auth,
            remote_host,
            remote_port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn gateway(&self) -> String {
        format!("{}@{}:{}", self.ssh_username, self.ssh_host, self.ssh_port)
    }
}
