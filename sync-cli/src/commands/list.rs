//! List records of one kind.

use anyhow::Result;
use sync_store::RecordFilter;
use sync_types::{EntityBody, EntityKind, Record};

use crate::config::{App, Workspace};

/// Run the list command.
pub async fn run(workspace: &Workspace, kind: EntityKind, deleted: bool) -> Result<()> {
    let app = App::open(workspace).await?;
    let mut filter = RecordFilter::kind(kind);
    if deleted {
        filter = filter.with_deleted();
    }
    let records = app.client.engine().records().store().query(&filter).await?;

    if records.is_empty() {
        println!("No {} records", kind);
        return Ok(());
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    Ok(())
}

/// One line per record: uuid, state, cloud id, label.
fn format_record(record: &Record) -> String {
    let cloud_id = if record.meta.cloud_id.is_assigned() {
        record.meta.cloud_id.to_string()
    } else {
        "-".to_string()
    };
    let deleted = if record.is_deleted() { " [deleted]" } else { "" };
    format!(
        "{}  {:<10}  {:>6}  {}{}",
        record.uuid,
        record.meta.status.state().as_str(),
        cloud_id,
        label(&record.body),
        deleted
    )
}

fn label(body: &EntityBody) -> String {
    match body {
        EntityBody::User(user) => user.name.clone(),
        EntityBody::Session(session) => session.device_id.clone(),
        EntityBody::Drone(drone) => drone.name.clone(),
        EntityBody::Project(project) => project.title.clone(),
        EntityBody::ProjectExternal(project) => project.title.clone(),
        EntityBody::FlightPlan(plan) => format!("{} (project {})", plan.name, plan.project_uuid),
        EntityBody::Flight(flight) => flight.title.clone(),
        EntityBody::ExecutionLink(link) => {
            format!("{} -> {}", link.flight_plan_uuid, link.flight_uuid)
        }
        EntityBody::Thumbnail(thumbnail) => format!("{} bytes", thumbnail.data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{RecordUuid, SyncMeta, Timestamp, User};

    #[test]
    fn format_marks_tombstones_and_unassigned_ids() {
        let mut record = Record {
            uuid: RecordUuid::new(),
            revision: 0,
            meta: SyncMeta::new_local(Timestamp::from_millis(1)),
            body: EntityBody::User(User {
                name: "pilot".into(),
                email: None,
                is_private_mode: false,
                is_agreement_changed: false,
            }),
        };
        let line = format_record(&record);
        assert!(line.contains("not_synced"));
        assert!(line.contains("pilot"));
        assert!(!line.contains("[deleted]"));

        record.meta.is_deleted = true;
        assert!(format_record(&record).ends_with("[deleted]"));
    }
}
