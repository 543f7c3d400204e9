//! Local writes.

use anyhow::{Context, Result};
use sync_client::PictorClient;
use sync_core::{Clock, SystemClock};
use sync_types::{Flight, FlightPlan, FlightPlanState, Project, ProjectType, RecordUuid};

use crate::config::{App, Workspace};

async fn owner(client: &PictorClient) -> Result<RecordUuid> {
    Ok(client.current_user().await?.uuid)
}

/// Create a project owned by the current user.
pub async fn project(workspace: &Workspace, title: &str) -> Result<()> {
    let app = App::open(workspace).await?;
    let project = Project {
        user_uuid: owner(&app.client).await?,
        title: title.to_string(),
        project_type: ProjectType::Classic,
        last_opened: None,
        last_updated: SystemClock.now(),
        has_editable_flight_plan: false,
        latest_executed_flight_plan_date: None,
    };
    let stored = app.client.repository::<Project>().create(project).await?;

    println!("{}", stored.uuid);
    Ok(())
}

/// Create an editable flight plan in `project`.
pub async fn flight_plan(workspace: &Workspace, project: &str, name: &str) -> Result<()> {
    let project_uuid: RecordUuid = project.parse().context("Invalid project uuid")?;
    let app = App::open(workspace).await?;
    let plan = FlightPlan {
        user_uuid: owner(&app.client).await?,
        project_uuid,
        project_external_uuid: None,
        name: name.to_string(),
        state: FlightPlanState::Editable,
        flight_plan_type: "classic".into(),
        file_type: "mavlink".into(),
        format_version: "1".into(),
        media_count: 0,
        uploaded_media_count: 0,
        last_mission_item_executed: 0,
        data_setting: None,
        last_updated: SystemClock.now(),
        execution_rank: None,
        has_reached_first_waypoint: None,
        thumbnail_uuid: None,
    };
    let stored = app.client.repository::<FlightPlan>().create(plan).await?;

    println!("{}", stored.uuid);
    Ok(())
}

/// Record a flight.
pub async fn flight(workspace: &Workspace, title: &str, serial: &str) -> Result<()> {
    let app = App::open(workspace).await?;
    let flight = Flight {
        user_uuid: owner(&app.client).await?,
        title: title.to_string(),
        run_date: SystemClock.now(),
        serial: serial.to_string(),
        firmware: String::new(),
        model_id: String::new(),
        gutma_file: None,
        photo_count: 0,
        video_count: 0,
        duration_secs: 0.0,
        distance_m: 0.0,
        start_latitude: None,
        start_longitude: None,
        thumbnail_uuid: None,
    };
    let stored = app.client.repository::<Flight>().create(flight).await?;

    println!("{}", stored.uuid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use tempfile::tempdir;

    #[tokio::test]
    async fn flight_plan_needs_existing_project() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf(), None, None);
        init::run(&workspace, None).await.unwrap();

        let missing = RecordUuid::new().to_string();
        assert!(flight_plan(&workspace, &missing, "facade").await.is_err());

        project(&workspace, "site").await.unwrap();
        let app = App::open(&workspace).await.unwrap();
        let projects = app.client.repository::<Project>().all().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert!(projects[0].entity.user_uuid.is_anonymous());
        drop(app);

        flight_plan(&workspace, &projects[0].uuid.to_string(), "facade")
            .await
            .unwrap();
        let app = App::open(&workspace).await.unwrap();
        let plans = app
            .client
            .repository::<FlightPlan>()
            .in_project(projects[0].uuid)
            .await
            .unwrap();
        assert_eq!(plans.len(), 1);
    }
}
