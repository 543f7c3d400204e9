//! Files of a data directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_client::{Config, MockCloud, MockCloudSnapshot, PictorClient};

/// Configuration file name inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";
/// Mock cloud file name inside the data directory.
pub const CLOUD_FILE: &str = "cloud.json";
/// Database file name written by `init`.
pub const DATABASE_FILE: &str = "pictor.db";

/// Paths used by one CLI invocation.
#[derive(Debug, Clone)]
pub struct Workspace {
    data_dir: PathBuf,
    config_path: PathBuf,
    cloud_path: PathBuf,
}

impl Workspace {
    /// Resolve paths, defaulting to files inside `data_dir`.
    pub fn new(data_dir: PathBuf, config: Option<PathBuf>, cloud: Option<PathBuf>) -> Self {
        Self {
            config_path: config.unwrap_or_else(|| data_dir.join(CONFIG_FILE)),
            cloud_path: cloud.unwrap_or_else(|| data_dir.join(CLOUD_FILE)),
            data_dir,
        }
    }

    /// The data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Check if `init` ran.
    pub fn is_initialized(&self) -> bool {
        self.config_path.exists()
    }

    /// Load the configuration. A relative database path is taken
    /// relative to the data directory.
    pub fn load_config(&self) -> Result<Config> {
        if !self.is_initialized() {
            anyhow::bail!("Not initialized. Run 'pictor init' first.");
        }
        let mut config = Config::from_file(&self.config_path)?;
        if config.storage.database.is_relative() {
            config.storage.database = self.data_dir.join(&config.storage.database);
        }
        Ok(config)
    }

    /// Save the configuration, readable by the owner only.
    pub async fn save_config(&self, config: &Config) -> Result<()> {
        let contents = config.to_toml()?;
        tokio::fs::write(&self.config_path, contents)
            .await
            .context("Failed to save configuration")?;
        set_file_permissions_0600(&self.config_path).await?;
        Ok(())
    }

    /// Load the mock cloud, empty if never saved.
    pub async fn load_cloud(&self) -> Result<MockCloud> {
        if !self.cloud_path.exists() {
            return Ok(MockCloud::new());
        }
        let contents = tokio::fs::read_to_string(&self.cloud_path)
            .await
            .context("Failed to read mock cloud")?;
        let snapshot: MockCloudSnapshot =
            serde_json::from_str(&contents).context("Invalid mock cloud file")?;
        Ok(MockCloud::from_snapshot(snapshot))
    }

    /// Persist the mock cloud.
    pub async fn save_cloud(&self, cloud: &MockCloud) -> Result<()> {
        let contents = serde_json::to_string_pretty(&cloud.snapshot())?;
        tokio::fs::write(&self.cloud_path, contents)
            .await
            .context("Failed to save mock cloud")?;
        Ok(())
    }
}

/// An opened store with its cloud.
pub struct App {
    /// The data layer.
    pub client: PictorClient,
    /// The cloud the client talks to.
    pub cloud: MockCloud,
}

impl App {
    /// Open the store and the mock cloud of `workspace`.
    pub async fn open(workspace: &Workspace) -> Result<Self> {
        let config = workspace.load_config()?;
        tracing::debug!(
            database = %config.storage.database.display(),
            device_id = %config.sync.device_id,
            "opening store"
        );
        let cloud = workspace.load_cloud().await?;
        cloud.set_page_size(config.sync.page_size as usize);
        let client = PictorClient::open_sqlite(config, Arc::new(cloud.clone()))
            .await
            .context("Failed to open store")?;
        Ok(Self { client, cloud })
    }
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
