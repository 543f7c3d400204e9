//! Soft-delete a record.

use anyhow::{Context, Result};
use sync_types::RecordUuid;

use crate::config::{App, Workspace};

/// Run the delete command.
pub async fn run(workspace: &Workspace, uuid: &str) -> Result<()> {
    let uuid: RecordUuid = uuid.parse().context("Invalid uuid")?;
    let app = App::open(workspace).await?;
    let tombstoned = app.client.engine().records().soft_delete(uuid).await?;

    match tombstoned.len() {
        0 => println!("{} was already deleted", uuid),
        1 => println!("Deleted {}", uuid),
        n => println!("Deleted {} and {} owned record(s)", uuid, n - 1),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{add, init};
    use sync_types::{FlightPlan, Project};
    use tempfile::tempdir;

    #[tokio::test]
    async fn delete_cascades_to_owned_records() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf(), None, None);
        init::run(&workspace, None).await.unwrap();
        add::project(&workspace, "site").await.unwrap();

        let app = App::open(&workspace).await.unwrap();
        let project = app.client.repository::<Project>().all().await.unwrap().remove(0);
        drop(app);
        add::flight_plan(&workspace, &project.uuid.to_string(), "facade")
            .await
            .unwrap();

        run(&workspace, &project.uuid.to_string()).await.unwrap();
        let app = App::open(&workspace).await.unwrap();
        assert!(app.client.repository::<Project>().all().await.unwrap().is_empty());
        assert!(app.client.repository::<FlightPlan>().all().await.unwrap().is_empty());

        // Deleting twice is harmless
        drop(app);
        run(&workspace, &project.uuid.to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_record_fails() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf(), None, None);
        init::run(&workspace, None).await.unwrap();
        assert!(run(&workspace, &RecordUuid::new().to_string()).await.is_err());
    }
}
