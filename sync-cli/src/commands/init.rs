//! Initialize a data directory.

use anyhow::Result;
use std::path::PathBuf;
use sync_client::Config;

use crate::config::{App, Workspace, DATABASE_FILE};

/// Run the init command.
pub async fn run(workspace: &Workspace, device_id: Option<String>) -> Result<()> {
    if workspace.is_initialized() {
        anyhow::bail!(
            "Already initialized. Delete {} to reinitialize.",
            workspace.config_path().display()
        );
    }

    let mut config = Config::default();
    config.storage.database = PathBuf::from(DATABASE_FILE);
    if let Some(device_id) = device_id {
        config.sync.device_id = device_id;
    }
    workspace.save_config(&config).await?;

    // Opening creates the store and the anonymous session
    let app = App::open(workspace).await?;
    let session = app.client.current_session().await?;

    println!("Data directory initialized!");
    println!();
    println!("  Device ID: {}", session.entity.device_id);
    println!("  Data dir:  {}", workspace.data_dir().display());
    println!();
    println!("Next steps:");
    println!("  1. Log in:        pictor login --name <name>");
    println!("  2. Add a project: pictor add-project <title>");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::RecordUuid;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_config_and_store() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf(), None, None);
        run(&workspace, Some("test-device".into())).await.unwrap();

        assert!(workspace.config_path().exists());
        assert!(dir.path().join(DATABASE_FILE).exists());

        let app = App::open(&workspace).await.unwrap();
        let session = app.client.current_session().await.unwrap();
        assert_eq!(session.entity.device_id, "test-device");
        assert_eq!(session.entity.user_uuid, RecordUuid::ANONYMOUS_USER);
    }

    #[tokio::test]
    async fn init_fails_if_already_initialized() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf(), None, None);

        run(&workspace, None).await.unwrap();
        let result = run(&workspace, None).await;
        assert!(result.is_err());
    }
}
