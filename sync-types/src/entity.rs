//! Entity bodies, their references, and stored records.

use crate::ids::{RecordUuid, Timestamp};
use crate::kind::EntityKind;
use crate::session::Session;
use crate::status::SyncMeta;
use serde::{Deserialize, Serialize};

/// How a record depends on the record it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefStrength {
    /// Structural ownership: a push dependency, and soft-deleting the
    /// target cascades to the referrer.
    Owned,
    /// A push dependency without cascade.
    Required,
    /// A shared resource, reference-counted, never a push dependency.
    Shared,
}

impl RefStrength {
    /// Whether the target must be known to the cloud before the referrer.
    pub fn is_dependency(&self) -> bool {
        matches!(self, RefStrength::Owned | RefStrength::Required)
    }

    /// Stable textual name, used as a storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefStrength::Owned => "owned",
            RefStrength::Required => "required",
            RefStrength::Shared => "shared",
        }
    }
}

/// A foreign key from one record to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Name of the field holding the key.
    pub role: &'static str,
    /// Kind of the referenced record.
    pub kind: EntityKind,
    /// Uuid of the referenced record.
    pub target: RecordUuid,
    /// Dependency semantics.
    pub strength: RefStrength,
}

impl Reference {
    fn owner(target: RecordUuid) -> Self {
        Self {
            role: "owner",
            kind: EntityKind::User,
            target,
            strength: RefStrength::Required,
        }
    }
}

/// An account. The anonymous user owns data created before login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Display name.
    pub name: String,
    /// Account email, absent for the anonymous user.
    #[serde(default)]
    pub email: Option<String>,
    /// Private mode disables synchronization entirely.
    #[serde(default)]
    pub is_private_mode: bool,
    /// Set when the terms of use changed and need acceptance.
    #[serde(default)]
    pub is_agreement_changed: bool,
}

/// A drone paired with the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drone {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Hardware serial number.
    pub serial: String,
    /// Model identifier.
    pub model_id: String,
    /// User-facing name.
    pub name: String,
    /// Whether the drone is paired with the account.
    #[serde(default)]
    pub is_paired: bool,
}

/// Kind of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    /// Classic waypoint missions.
    Classic,
    /// Photogrammetry survey.
    Photogrammetry,
    /// Unrecognized type coming from a newer app version.
    Unknown,
}

/// A container of flight plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Title shown in the project list.
    pub title: String,
    /// Project type.
    pub project_type: ProjectType,
    /// Last time the user opened the project.
    #[serde(default)]
    pub last_opened: Option<Timestamp>,
    /// Last content update.
    pub last_updated: Timestamp,
    /// Derived locally: the project has at least one editable flight plan.
    #[serde(default)]
    pub has_editable_flight_plan: bool,
    /// Derived locally: latest execution among the project's flight plans.
    #[serde(default)]
    pub latest_executed_flight_plan_date: Option<Timestamp>,
}

/// A project handled by an external processing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectExternal {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Title shown in the project list.
    pub title: String,
    /// Identifier on the external service.
    pub external_id: String,
    /// Free-form processing state reported by the service.
    pub processing_state: String,
}

/// Execution state of a flight plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightPlanState {
    /// Still being edited.
    Editable,
    /// Execution stopped before completion.
    Stopped,
    /// Currently flying.
    Flying,
    /// Execution completed.
    Completed,
    /// Media being uploaded.
    Uploading,
    /// Media being processed.
    Processing,
    /// Processing done.
    Processed,
    /// Unrecognized state coming from a newer app version.
    Unknown,
}

/// A mission belonging to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightPlan {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Owning project.
    pub project_uuid: RecordUuid,
    /// External project this plan was generated for, if any.
    #[serde(default)]
    pub project_external_uuid: Option<RecordUuid>,
    /// User-facing name.
    pub name: String,
    /// Execution state.
    pub state: FlightPlanState,
    /// Mission type identifier.
    pub flight_plan_type: String,
    /// Format of the mission file.
    pub file_type: String,
    /// Version of the mission data format.
    pub format_version: String,
    /// Media captured during execution.
    #[serde(default)]
    pub media_count: u32,
    /// Media already uploaded.
    #[serde(default)]
    pub uploaded_media_count: u32,
    /// Index of the last mission item executed.
    #[serde(default)]
    pub last_mission_item_executed: u32,
    /// Serialized mission settings.
    #[serde(default)]
    pub data_setting: Option<String>,
    /// Last content update.
    pub last_updated: Timestamp,
    /// Rank of this execution among executions of the same plan.
    #[serde(default)]
    pub execution_rank: Option<u32>,
    /// Whether the drone reached the first waypoint during execution.
    #[serde(default)]
    pub has_reached_first_waypoint: Option<bool>,
    /// Preview image.
    #[serde(default)]
    pub thumbnail_uuid: Option<RecordUuid>,
}

/// A recorded flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flight {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// User-facing title.
    pub title: String,
    /// Takeoff date.
    pub run_date: Timestamp,
    /// Serial of the drone that flew.
    pub serial: String,
    /// Firmware of the drone that flew.
    pub firmware: String,
    /// Model of the drone that flew.
    pub model_id: String,
    /// Flight log (GUTMA) file name.
    #[serde(default)]
    pub gutma_file: Option<String>,
    /// Photos taken.
    #[serde(default)]
    pub photo_count: u32,
    /// Videos taken.
    #[serde(default)]
    pub video_count: u32,
    /// Flight duration in seconds.
    pub duration_secs: f64,
    /// Flown distance in meters.
    pub distance_m: f64,
    /// Takeoff latitude.
    #[serde(default)]
    pub start_latitude: Option<f64>,
    /// Takeoff longitude.
    #[serde(default)]
    pub start_longitude: Option<f64>,
    /// Preview image.
    #[serde(default)]
    pub thumbnail_uuid: Option<RecordUuid>,
}

/// Links a flight plan to a flight that executed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLink {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Executed flight plan.
    pub flight_plan_uuid: RecordUuid,
    /// Flight that executed it.
    pub flight_uuid: RecordUuid,
    /// When the execution happened.
    pub execution_date: Timestamp,
}

/// Shared preview image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Encoded image bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The payload of a record, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityBody {
    /// See [`User`].
    User(User),
    /// See [`Session`].
    Session(Session),
    /// See [`Drone`].
    Drone(Drone),
    /// See [`Project`].
    Project(Project),
    /// See [`ProjectExternal`].
    ProjectExternal(ProjectExternal),
    /// See [`FlightPlan`].
    FlightPlan(FlightPlan),
    /// See [`Flight`].
    Flight(Flight),
    /// See [`ExecutionLink`].
    ExecutionLink(ExecutionLink),
    /// See [`Thumbnail`].
    Thumbnail(Thumbnail),
}

impl EntityBody {
    /// Kind of this body.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityBody::User(_) => EntityKind::User,
            EntityBody::Session(_) => EntityKind::Session,
            EntityBody::Drone(_) => EntityKind::Drone,
            EntityBody::Project(_) => EntityKind::Project,
            EntityBody::ProjectExternal(_) => EntityKind::ProjectExternal,
            EntityBody::FlightPlan(_) => EntityKind::FlightPlan,
            EntityBody::Flight(_) => EntityKind::Flight,
            EntityBody::ExecutionLink(_) => EntityKind::ExecutionLink,
            EntityBody::Thumbnail(_) => EntityKind::Thumbnail,
        }
    }

    /// Owning user, `None` for users themselves.
    pub fn owner(&self) -> Option<RecordUuid> {
        match self {
            EntityBody::User(_) => None,
            EntityBody::Session(b) => Some(b.user_uuid),
            EntityBody::Drone(b) => Some(b.user_uuid),
            EntityBody::Project(b) => Some(b.user_uuid),
            EntityBody::ProjectExternal(b) => Some(b.user_uuid),
            EntityBody::FlightPlan(b) => Some(b.user_uuid),
            EntityBody::Flight(b) => Some(b.user_uuid),
            EntityBody::ExecutionLink(b) => Some(b.user_uuid),
            EntityBody::Thumbnail(b) => Some(b.user_uuid),
        }
    }

    /// Move this body to another owner. No-op for users.
    pub fn set_owner(&mut self, user: RecordUuid) {
        match self {
            EntityBody::User(_) => {}
            EntityBody::Session(b) => b.user_uuid = user,
            EntityBody::Drone(b) => b.user_uuid = user,
            EntityBody::Project(b) => b.user_uuid = user,
            EntityBody::ProjectExternal(b) => b.user_uuid = user,
            EntityBody::FlightPlan(b) => b.user_uuid = user,
            EntityBody::Flight(b) => b.user_uuid = user,
            EntityBody::ExecutionLink(b) => b.user_uuid = user,
            EntityBody::Thumbnail(b) => b.user_uuid = user,
        }
    }

    /// Foreign keys held by this body.
    pub fn references(&self) -> Vec<Reference> {
        let mut refs = Vec::new();
        if let Some(owner) = self.owner() {
            refs.push(Reference::owner(owner));
        }
        match self {
            EntityBody::FlightPlan(plan) => {
                refs.push(Reference {
                    role: "project",
                    kind: EntityKind::Project,
                    target: plan.project_uuid,
                    strength: RefStrength::Owned,
                });
                if let Some(external) = plan.project_external_uuid {
                    refs.push(Reference {
                        role: "project_external",
                        kind: EntityKind::ProjectExternal,
                        target: external,
                        strength: RefStrength::Required,
                    });
                }
                if let Some(thumbnail) = plan.thumbnail_uuid {
                    refs.push(thumbnail_ref(thumbnail));
                }
            }
            EntityBody::Flight(flight) => {
                if let Some(thumbnail) = flight.thumbnail_uuid {
                    refs.push(thumbnail_ref(thumbnail));
                }
            }
            EntityBody::ExecutionLink(link) => {
                refs.push(Reference {
                    role: "flight_plan",
                    kind: EntityKind::FlightPlan,
                    target: link.flight_plan_uuid,
                    strength: RefStrength::Owned,
                });
                refs.push(Reference {
                    role: "flight",
                    kind: EntityKind::Flight,
                    target: link.flight_uuid,
                    strength: RefStrength::Owned,
                });
            }
            _ => {}
        }
        refs
    }
}

fn thumbnail_ref(target: RecordUuid) -> Reference {
    Reference {
        role: "thumbnail",
        kind: EntityKind::Thumbnail,
        target,
        strength: RefStrength::Shared,
    }
}

/// A typed entity that can be stored as an [`EntityBody`].
pub trait Entity: Clone + Send + Sync + 'static {
    /// Kind of this entity.
    const KIND: EntityKind;

    /// Wrap into the untyped body.
    fn into_body(self) -> EntityBody;

    /// Unwrap from the untyped body, `None` on kind mismatch.
    fn from_body(body: EntityBody) -> Option<Self>;
}

macro_rules! impl_entity {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Entity for $ty {
                const KIND: EntityKind = EntityKind::$ty;

                fn into_body(self) -> EntityBody {
                    EntityBody::$ty(self)
                }

                fn from_body(body: EntityBody) -> Option<Self> {
                    match body {
                        EntityBody::$ty(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_entity!(
    User,
    Session,
    Drone,
    Project,
    ProjectExternal,
    FlightPlan,
    Flight,
    ExecutionLink,
    Thumbnail,
);

/// A record as held by the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Local primary key.
    pub uuid: RecordUuid,
    /// Store-managed revision, bumped on every write.
    pub revision: u64,
    /// Synchronization fields.
    pub meta: SyncMeta,
    /// Entity payload.
    pub body: EntityBody,
}

impl Record {
    /// Kind of this record.
    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    /// Whether the record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.meta.is_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(project: RecordUuid) -> FlightPlan {
        FlightPlan {
            user_uuid: RecordUuid::new(),
            project_uuid: project,
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
            last_updated: Timestamp::from_millis(1),
            execution_rank: None,
            has_reached_first_waypoint: None,
            thumbnail_uuid: None,
        }
    }

    #[test]
    fn flight_plan_references_owner_and_project() {
        let project = RecordUuid::new();
        let body = plan(project).into_body();
        let refs = body.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].role, "owner");
        assert_eq!(refs[1].target, project);
        assert_eq!(refs[1].strength, RefStrength::Owned);
    }

    #[test]
    fn thumbnail_reference_is_shared() {
        let mut p = plan(RecordUuid::new());
        let thumb = RecordUuid::new();
        p.thumbnail_uuid = Some(thumb);
        let refs = p.into_body().references();
        let shared: Vec<_> = refs
            .iter()
            .filter(|r| r.strength == RefStrength::Shared)
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].target, thumb);
        assert!(!shared[0].strength.is_dependency());
    }

    #[test]
    fn users_have_no_references() {
        let user = User {
            name: "pilot".into(),
            email: None,
            is_private_mode: false,
            is_agreement_changed: false,
        };
        assert!(user.into_body().references().is_empty());
    }

    #[test]
    fn set_owner_moves_body() {
        let mut body = plan(RecordUuid::new()).into_body();
        let new_owner = RecordUuid::new();
        body.set_owner(new_owner);
        assert_eq!(body.owner(), Some(new_owner));
    }

    #[test]
    fn typed_entity_round_trips_through_body() {
        let p = plan(RecordUuid::new());
        let body = p.clone().into_body();
        assert_eq!(body.kind(), FlightPlan::KIND);
        assert_eq!(FlightPlan::from_body(body.clone()), Some(p));
        assert_eq!(Project::from_body(body), None);
    }

    #[test]
    fn thumbnail_data_is_base64_in_json() {
        let thumb = Thumbnail {
            user_uuid: RecordUuid::ANONYMOUS_USER,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_string(&thumb.into_body()).unwrap();
        assert!(json.contains("3q2+7w=="));
        assert!(json.contains("\"kind\":\"thumbnail\""));
    }
}
