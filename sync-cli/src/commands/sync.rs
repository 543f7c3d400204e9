//! Run sync cycles and purges.

use anyhow::Result;
use sync_client::{force_sanity, CycleOutcome, CycleReport};
use sync_types::Session;

use crate::config::{App, Workspace};

/// Run one sync cycle, persisting the mock cloud afterwards.
pub async fn run(workspace: &Workspace, full: bool, offline: bool) -> Result<()> {
    let app = App::open(workspace).await?;
    app.cloud.set_offline(offline);

    if full {
        let session = app.client.current_session().await?;
        app.client
            .repository::<Session>()
            .update(session.uuid, force_sanity)
            .await?;
    }

    let outcome = app.client.sync_now().await?;
    app.cloud.set_offline(false);
    workspace.save_cloud(&app.cloud).await?;

    match outcome {
        CycleOutcome::Completed(report) => print_report("Sync completed", &report),
        CycleOutcome::Cancelled(report) => print_report("Sync cancelled", &report),
        CycleOutcome::Skipped(reason) => println!("Sync skipped: {:?}", reason),
        CycleOutcome::Coalesced => println!("Sync already ran"),
    }

    if app.client.status().borrow().has_pending_errors {
        println!();
        println!("Some records failed to sync, run 'pictor list <kind>' for details.");
    }
    Ok(())
}

/// Remove synced tombstones past their grace period.
pub async fn purge(workspace: &Workspace) -> Result<()> {
    let app = App::open(workspace).await?;
    let purged = app.client.engine().purge_tombstones().await?;

    println!("Purged {} tombstone(s)", purged);
    Ok(())
}

fn print_report(title: &str, report: &CycleReport) {
    println!("{}", title);
    println!("  Pushed:    {}", report.pushed);
    println!("  Deleted:   {}", report.deleted);
    println!("  Deferred:  {}", report.deferred);
    println!("  Failed:    {}", report.failed);
    println!("  Conflicts: {}", report.conflicts);
    println!("  Pulled:    {}", report.pulled);
    println!("  Purged:    {}", report.purged);
    if report.sanity_ran {
        println!("  Repaired:  {} (full pass)", report.repaired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{account, add, init};
    use std::path::Path;
    use sync_types::{Project, RecordUuid, SynchroStatus};
    use tempfile::tempdir;

    async fn logged_in(dir: &Path, cloud: &Path, account: RecordUuid) -> Workspace {
        tokio::fs::create_dir_all(dir).await.unwrap();
        let workspace = Workspace::new(dir.to_path_buf(), None, Some(cloud.to_path_buf()));
        init::run(&workspace, None).await.unwrap();
        account::login(&workspace, "pilot", None, Some(&account.to_string()))
            .await
            .unwrap();
        workspace
    }

    #[tokio::test]
    async fn two_data_dirs_share_a_cloud_file() {
        let root = tempdir().unwrap();
        let cloud = root.path().join("cloud.json");
        let account = RecordUuid::new();
        let a = logged_in(&root.path().join("a"), &cloud, account).await;
        let b = logged_in(&root.path().join("b"), &cloud, account).await;

        add::project(&a, "shared").await.unwrap();
        run(&a, false, false).await.unwrap();
        run(&b, false, false).await.unwrap();

        let app = App::open(&b).await.unwrap();
        let projects = app.client.repository::<Project>().all().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].entity.title, "shared");
        assert_eq!(projects[0].meta.status, SynchroStatus::Synced);
    }

    #[tokio::test]
    async fn offline_sync_leaves_records_pending() {
        let root = tempdir().unwrap();
        let cloud = root.path().join("cloud.json");
        let a = logged_in(&root.path().join("a"), &cloud, RecordUuid::new()).await;
        add::project(&a, "later").await.unwrap();

        run(&a, false, true).await.unwrap();
        let app = App::open(&a).await.unwrap();
        let project = app.client.repository::<Project>().all().await.unwrap().remove(0);
        assert!(!project.meta.cloud_id.is_assigned());
        assert!(app.cloud.remote_get(project.uuid).is_none());
    }

    #[tokio::test]
    async fn full_sync_applies_missed_cloud_deletions() {
        let root = tempdir().unwrap();
        let cloud = root.path().join("cloud.json");
        let a = logged_in(&root.path().join("a"), &cloud, RecordUuid::new()).await;
        add::project(&a, "vanishing").await.unwrap();
        run(&a, false, false).await.unwrap();

        // The cloud loses the project without leaving a delete marker
        let app = App::open(&a).await.unwrap();
        let project = app.client.repository::<Project>().all().await.unwrap().remove(0);
        assert!(app.cloud.purge_remote(project.uuid));
        a.save_cloud(&app.cloud).await.unwrap();
        drop(app);

        run(&a, false, false).await.unwrap();
        let app = App::open(&a).await.unwrap();
        assert!(app.client.repository::<Project>().get(project.uuid).await.unwrap().is_some());
        drop(app);

        run(&a, true, false).await.unwrap();
        let app = App::open(&a).await.unwrap();
        assert!(app.client.repository::<Project>().get(project.uuid).await.unwrap().is_none());
    }
}
