//! Test fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use sync_store::{LocalStore, SqliteStore, WriteBatch};
use sync_types::{
    CloudId, Drone, Entity, ExecutionLink, Flight, FlightPlan, FlightPlanState, Project,
    ProjectType, Record, RecordUuid, SyncMeta, SynchroStatus, Thumbnail, Timestamp, User,
};

pub(crate) fn at(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

pub(crate) fn anonymous_user() -> Record {
    Record {
        uuid: RecordUuid::ANONYMOUS_USER,
        revision: 0,
        meta: SyncMeta::new_local(at(1)),
        body: User {
            name: "anonymous".into(),
            email: None,
            is_private_mode: false,
            is_agreement_changed: false,
        }
        .into_body(),
    }
}

pub(crate) fn drone(name: &str) -> Drone {
    Drone {
        user_uuid: RecordUuid::ANONYMOUS_USER,
        serial: "PI040416AA0000".into(),
        model_id: "anafi_ai".into(),
        name: name.into(),
        is_paired: true,
    }
}

pub(crate) fn project(title: &str) -> Project {
    Project {
        user_uuid: RecordUuid::ANONYMOUS_USER,
        title: title.into(),
        project_type: ProjectType::Classic,
        last_opened: None,
        last_updated: at(1),
        has_editable_flight_plan: false,
        latest_executed_flight_plan_date: None,
    }
}

pub(crate) fn plan(project_uuid: RecordUuid) -> FlightPlan {
    FlightPlan {
        user_uuid: RecordUuid::ANONYMOUS_USER,
        project_uuid,
        project_external_uuid: None,
        name: "survey".into(),
        state: FlightPlanState::Editable,
        flight_plan_type: "classic".into(),
        file_type: "mavlink".into(),
        format_version: "1".into(),
        media_count: 0,
        uploaded_media_count: 0,
        last_mission_item_executed: 0,
        data_setting: None,
        last_updated: at(1),
        execution_rank: None,
        has_reached_first_waypoint: None,
        thumbnail_uuid: None,
    }
}

pub(crate) fn flight(title: &str) -> Flight {
    Flight {
        user_uuid: RecordUuid::ANONYMOUS_USER,
        title: title.into(),
        run_date: at(1),
        serial: "PI040416AA0000".into(),
        firmware: "7.7.0".into(),
        model_id: "anafi_ai".into(),
        gutma_file: None,
        photo_count: 0,
        video_count: 0,
        duration_secs: 120.0,
        distance_m: 450.0,
        start_latitude: None,
        start_longitude: None,
        thumbnail_uuid: None,
    }
}

pub(crate) fn link(flight_plan_uuid: RecordUuid, flight_uuid: RecordUuid) -> ExecutionLink {
    ExecutionLink {
        user_uuid: RecordUuid::ANONYMOUS_USER,
        flight_plan_uuid,
        flight_uuid,
        execution_date: at(1),
    }
}

pub(crate) fn thumbnail() -> Thumbnail {
    Thumbnail {
        user_uuid: RecordUuid::ANONYMOUS_USER,
        data: vec![0x89, 0x50, 0x4e, 0x47],
    }
}

/// In-place change applied by [`Fixture::rewrite`].
pub(crate) type Rewrite = Box<dyn FnOnce(&mut Record) + Send>;

/// Direct store manipulation, bypassing repositories.
#[async_trait]
pub(crate) trait Fixture: Sync {
    async fn seed_record(&self, record: Record) -> Record;

    async fn seed<E: Entity>(&self, entity: E) -> Record {
        self.seed_record(Record {
            uuid: RecordUuid::new(),
            revision: 0,
            meta: SyncMeta::new_local(at(1)),
            body: entity.into_body(),
        })
        .await
    }

    async fn rewrite(&self, uuid: RecordUuid, f: Rewrite) -> Record;

    async fn tombstone(&self, uuid: RecordUuid) -> Record {
        self.rewrite(
            uuid,
            Box::new(|r| {
                r.meta.is_deleted = true;
                r.meta.deleted_date = Some(at(1));
                r.meta.status = SynchroStatus::NotSynced;
            }),
        )
        .await
    }

    async fn assign_cloud_id(&self, uuid: RecordUuid, cloud_id: CloudId) -> Record {
        self.rewrite(uuid, Box::new(move |r| r.meta.cloud_id = cloud_id))
            .await
    }

    async fn set_status(&self, uuid: RecordUuid, status: SynchroStatus) -> Record {
        self.rewrite(
            uuid,
            Box::new(move |r| {
                r.meta.status = status;
                if status == SynchroStatus::Synced {
                    r.meta.latest_updated_date = Some(r.meta.local_modification_date);
                }
            }),
        )
        .await
    }
}

#[async_trait]
impl Fixture for SqliteStore {
    async fn seed_record(&self, record: Record) -> Record {
        let uuid = record.uuid;
        let mut batch = WriteBatch::new();
        batch.create(record);
        let outcome = self.apply(batch).await.unwrap();
        outcome.written(uuid).cloned().unwrap()
    }

    async fn rewrite(&self, uuid: RecordUuid, f: Rewrite) -> Record {
        let mut record = self.get(uuid).await.unwrap().unwrap();
        f(&mut record);
        let mut batch = WriteBatch::new();
        batch.update(record);
        let outcome = self.apply(batch).await.unwrap();
        outcome.written(uuid).cloned().unwrap()
    }
}
