//! Show account, sync markers and pending work.

use anyhow::Result;
use sync_core::{Clock, SystemClock};
use sync_store::RecordFilter;
use sync_types::{EntityKind, SynchroState, Timestamp};

use crate::config::{App, Workspace};

/// Run the status command.
pub async fn run(workspace: &Workspace) -> Result<()> {
    println!("=== pictor status ===");
    println!();

    if !workspace.is_initialized() {
        println!("Data directory: NOT INITIALIZED");
        println!();
        println!("Run 'pictor init' to initialize.");
        return Ok(());
    }

    let app = App::open(workspace).await?;
    let session = app.client.current_session().await?;
    let user = app.client.current_user().await?;
    let now = SystemClock.now();

    println!("Device:");
    println!("  ID:       {}", session.entity.device_id);
    println!("  Data dir: {}", workspace.data_dir().display());
    println!();

    println!("Account:");
    if user.uuid.is_anonymous() {
        println!("  Anonymous (not synchronized)");
    } else {
        println!("  Name:    {}", user.entity.name);
        println!("  UUID:    {}", user.uuid);
        println!(
            "  Private: {}",
            if user.entity.is_private_mode { "on" } else { "off" }
        );
    }
    println!();

    let marks = session.entity.multi_session;
    println!("Sync:");
    println!("  Last success: {}", format_age(marks.latest_successful_date, now));
    println!("  Last attempt: {}", format_age(marks.latest_tried_date, now));
    println!(
        "  Last full:    {}",
        format_age(session.entity.sanity.latest_successful_date, now)
    );
    println!();

    let store = app.client.engine().records().store();
    println!("Records:         live  pending  failed  deleted");
    for kind in EntityKind::ALL {
        let live = store.count(&RecordFilter::kind(kind)).await?;
        let pending = store
            .count(
                &RecordFilter::kind(kind)
                    .with_deleted()
                    .in_states([SynchroState::NotSynced]),
            )
            .await?;
        let failed = store
            .count(
                &RecordFilter::kind(kind)
                    .with_deleted()
                    .in_states([SynchroState::Failed]),
            )
            .await?;
        let deleted = store.count(&RecordFilter::kind(kind).only_deleted()).await?;
        println!(
            "  {:<16} {:>4} {:>8} {:>7} {:>8}",
            kind.as_str(),
            live,
            pending,
            failed,
            deleted
        );
    }

    Ok(())
}

/// Format a marker relative to `now`.
fn format_age(ts: Option<Timestamp>, now: Timestamp) -> String {
    let Some(ts) = ts else {
        return "never".to_string();
    };
    let diff = now.duration_since(ts).as_secs();

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}
