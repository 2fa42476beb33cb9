use anyhow::{anyhow, Context};
use conduit_connections::EncryptionService;
use std::fs;
use std::path::{Path, PathBuf};

// Well-known paths relative to data_dir
pub const ENCRYPTION_KEY_FILE: &str = "encryption_key";
pub const CONNECTIONS_FILE: &str = "connections.json";
pub const SECRETS_FILE: &str = "secrets.json";

#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub data_dir: PathBuf,
    pub encryption_key: String,
}

impl ConduitConfig {
    /// Resolve the data directory and load (or generate) the vault key
    pub fn new(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("could not determine the home directory; pass --data-dir"))?
                .join(".conduit"),
        };

        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        // 32 random bytes, hex encoded
        let key_path = data_dir.join(ENCRYPTION_KEY_FILE);
        let encryption_key = if key_path.exists() {
            fs::read_to_string(&key_path)
                .with_context(|| format!("failed to read {}", key_path.display()))?
                .trim()
                .to_string()
        } else {
            let key = EncryptionService::generate_key();
            fs::write(&key_path, &key)
                .with_context(|| format!("failed to write {}", key_path.display()))?;
            restrict_permissions(&key_path)?;
            key
        };

        Ok(Self {
            data_dir,
            encryption_key,
        })
    }

    pub fn connections_path(&self) -> PathBuf {
        self.data_dir.join(CONNECTIONS_FILE)
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.data_dir.join(SECRETS_FILE)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
