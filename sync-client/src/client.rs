//! PictorClient - the main interface of the data layer.
//!
//! This module provides [`PictorClient`], which wires the local store, the
//! cloud client and the sync engine together and owns the account
//! lifecycle.
//!
//! # Architecture
//!
//! ```text
//! UI / ViewModels → Repository<E> → Records → LocalStore
//!                                      ↑
//!       Scheduler → SyncEngine ────────┴──→ CloudClient
//!                       ↓
//!              sync-core (pure decisions)
//! ```
//!
//! # Accounts
//!
//! Opening a store without a session creates the anonymous user and a
//! session for this device. Anonymous data is never pushed. Logging in
//! moves it into the account; logging out moves the account's data back
//! to the anonymous user, detached from the cloud.
//!
//! # Example
//!
//! ```ignore
//! use sync_client::{AccountProfile, Config, MockCloud, PictorClient};
//!
//! let client = PictorClient::open_sqlite(Config::default(), Arc::new(MockCloud::new())).await?;
//! client.login(AccountProfile::new(uuid, "pilot")).await?;
//!
//! let projects = client.repository::<Project>();
//! projects.create(project).await?;
//! client.sync_now().await?;
//! ```

use crate::cloud::CloudClient;
use crate::config::Config;
use crate::engine::{CycleOutcome, EngineSettings, SyncEngine, SyncStatus};
use crate::error::{ClientError, EngineError, RepositoryError};
use crate::records::{Records, MAX_WRITE_ATTEMPTS};
use crate::repository::{Repository, Stored};
use crate::scheduler::{spawn_scheduler, SchedulerHandle};
use std::sync::Arc;
use sync_core::{detach_from_account, Clock, SyncTrigger, SystemClock};
use sync_store::{LocalStore, RecordFilter, SqliteStore, WriteBatch};
use sync_types::{
    Entity, EntityBody, EntityKind, RecordUuid, SanityMarks, Session, User,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Account data received from the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountProfile {
    /// Account uuid, shared by every device of the account.
    pub uuid: RecordUuid,
    /// Display name.
    pub name: String,
    /// Contact email.
    pub email: Option<String>,
}

impl AccountProfile {
    /// Profile without an email.
    pub fn new(uuid: RecordUuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            email: None,
        }
    }
}

/// Entry point of the data layer.
#[derive(Debug)]
pub struct PictorClient {
    config: Config,
    records: Arc<Records>,
    engine: Arc<SyncEngine>,
}

impl PictorClient {
    /// Open a client over an existing store, bootstrapping the anonymous
    /// user and this device's session when missing.
    pub async fn open(
        config: Config,
        store: Arc<dyn LocalStore>,
        cloud: Arc<dyn CloudClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClientError> {
        let records = Arc::new(Records::new(store, clock, config.retry_policy()));
        let engine = SyncEngine::new(
            records.clone(),
            cloud,
            EngineSettings::from_config(&config),
        )?;
        let client = Self {
            config,
            records,
            engine: Arc::new(engine),
        };
        client.bootstrap().await?;
        Ok(client)
    }

    /// Open a client over the SQLite database named in `config`.
    pub async fn open_sqlite(
        config: Config,
        cloud: Arc<dyn CloudClient>,
    ) -> Result<Self, ClientError> {
        let store = SqliteStore::new(&config.storage.database).await?;
        Self::open(config, Arc::new(store), cloud, Arc::new(SystemClock)).await
    }

    async fn bootstrap(&self) -> Result<(), ClientError> {
        if self.records.store().get(RecordUuid::ANONYMOUS_USER).await?.is_none() {
            let anonymous = User {
                name: "anonymous".into(),
                email: None,
                is_private_mode: false,
                is_agreement_changed: false,
            };
            match self
                .records
                .create_with_uuid(RecordUuid::ANONYMOUS_USER, anonymous.into_body())
                .await
            {
                Ok(_) => tracing::info!("anonymous user created"),
                Err(RepositoryError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.own_session().await?.is_none() {
            let session = Session::new(RecordUuid::ANONYMOUS_USER, self.device_id());
            let created = self.records.create(session.into_body()).await?;
            tracing::info!(uuid = %created.uuid, device = %self.device_id(), "session created");
        }
        Ok(())
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Typed repository of `E`.
    pub fn repository<E: Entity>(&self) -> Repository<E> {
        Repository::new(self.records.clone())
    }

    /// Run a cycle now.
    pub async fn sync_now(&self) -> Result<CycleOutcome, ClientError> {
        Ok(self.engine.sync(SyncTrigger::Manual).await?)
    }

    /// Run a cycle because the app came to the foreground.
    pub async fn sync_on_foreground(&self) -> Result<CycleOutcome, ClientError> {
        Ok(self.engine.sync(SyncTrigger::Foreground).await?)
    }

    /// Watch the process-wide sync state.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.engine.status()
    }

    /// Start the background scheduler, unless disabled in the
    /// configuration.
    pub fn spawn_scheduler(&self) -> Option<(SchedulerHandle, JoinHandle<()>)> {
        if !self.config.scheduler.enabled {
            tracing::info!("sync scheduler disabled");
            return None;
        }
        Some(spawn_scheduler(
            self.engine.clone(),
            std::time::Duration::from_secs(self.config.scheduler.interval_secs),
        ))
    }

    /// This device's session.
    pub async fn current_session(&self) -> Result<Stored<Session>, ClientError> {
        self.own_session()
            .await?
            .ok_or_else(|| EngineError::NoSession(self.device_id().to_string()).into())
    }

    /// User of this device's session, anonymous when logged out.
    pub async fn current_user(&self) -> Result<Stored<User>, ClientError> {
        let session = self.current_session().await?;
        self.repository::<User>()
            .get(session.entity.user_uuid)
            .await?
            .ok_or(ClientError::Repository(RepositoryError::NotFound(
                session.entity.user_uuid,
            )))
    }

    /// Turn sync off or on for the logged-in user.
    pub async fn set_private_mode(&self, enabled: bool) -> Result<(), ClientError> {
        let user = self.current_user().await?;
        if user.uuid.is_anonymous() {
            return Err(ClientError::NotLoggedIn);
        }
        self.repository::<User>()
            .update(user.uuid, |u| u.is_private_mode = enabled)
            .await?;
        tracing::info!(user = %user.uuid, enabled, "private mode changed");
        Ok(())
    }

    /// Log an account in on this device.
    ///
    /// Data created while logged out moves into the account and will be
    /// pushed by the next cycle.
    pub async fn login(&self, profile: AccountProfile) -> Result<(), ClientError> {
        let _pause = self.engine.pause().await;
        let session = self.current_session().await?;
        let current = session.entity.user_uuid;
        if current == profile.uuid {
            return Ok(());
        }
        if !current.is_anonymous() {
            return Err(ClientError::AlreadyLoggedIn(current));
        }

        self.upsert_user(&profile).await?;
        let moved = self
            .reassign(RecordUuid::ANONYMOUS_USER, profile.uuid, session.uuid)
            .await?;
        tracing::info!(user = %profile.uuid, moved, "logged in");
        Ok(())
    }

    /// Log the current account out of this device.
    ///
    /// Cancels the running cycle. The account's data stays on the device,
    /// owned by the anonymous user and detached from the cloud; tombstones
    /// and other devices' sessions are dropped.
    pub async fn logout(&self) -> Result<(), ClientError> {
        self.engine.cancel();
        let _pause = self.engine.pause().await;
        let session = self.current_session().await?;
        let user = session.entity.user_uuid;
        if user.is_anonymous() {
            return Err(ClientError::NotLoggedIn);
        }

        self.drop_account_leftovers(user, session.uuid).await?;
        let moved = self
            .reassign(user, RecordUuid::ANONYMOUS_USER, session.uuid)
            .await?;
        self.drop_account_users().await?;
        self.records.buffer().clear();
        tracing::info!(%user, moved, "logged out");
        Ok(())
    }

    fn device_id(&self) -> &str {
        &self.config.sync.device_id
    }

    async fn own_session(&self) -> Result<Option<Stored<Session>>, ClientError> {
        let sessions = self
            .repository::<Session>()
            .query(RecordFilter::kind(EntityKind::Session))
            .await?;
        Ok(sessions
            .into_iter()
            .find(|s| s.entity.device_id == self.device_id()))
    }

    async fn upsert_user(&self, profile: &AccountProfile) -> Result<(), ClientError> {
        let users = self.repository::<User>();
        let apply = |user: &mut User| {
            user.name = profile.name.clone();
            user.email = profile.email.clone();
        };
        match users.get_including_deleted(profile.uuid).await? {
            Some(existing) if existing.is_deleted() => {
                users.restore(profile.uuid, apply).await?;
            }
            Some(_) => {
                users.update(profile.uuid, apply).await?;
            }
            None => {
                let user = User {
                    name: profile.name.clone(),
                    email: profile.email.clone(),
                    is_private_mode: false,
                    is_agreement_changed: false,
                };
                self.records
                    .create_with_uuid(profile.uuid, user.into_body())
                    .await?;
            }
        }
        Ok(())
    }

    /// Move every record owned by `from` to `to`, detached from the cloud.
    /// Other devices' sessions are left alone.
    async fn reassign(
        &self,
        from: RecordUuid,
        to: RecordUuid,
        own_session: RecordUuid,
    ) -> Result<usize, ClientError> {
        let store = self.records.store();
        let mut moved = 0;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let owned = store
                .query(&RecordFilter::all().owned_by(from).with_deleted())
                .await?;
            let now = self.records.now();
            let mut batch = WriteBatch::new();
            for mut record in owned {
                if record.kind() == EntityKind::Session && record.uuid != own_session {
                    continue;
                }
                record.body.set_owner(to);
                if let EntityBody::Session(session) = &mut record.body {
                    *session = Session {
                        inc_should_launch: session.inc_should_launch,
                        ..Session::new(to, session.device_id.clone())
                    };
                }
                record.meta = detach_from_account(record.meta, now);
                batch.update(record);
            }

            let outcome = store.apply(batch).await?;
            moved += outcome.written.len();
            if outcome.is_clean() {
                return Ok(moved);
            }
        }
        Err(RepositoryError::Contended(from).into())
    }

    /// Tombstones and other devices' sessions belong to the account and
    /// are not kept after logout.
    async fn drop_account_leftovers(
        &self,
        user: RecordUuid,
        own_session: RecordUuid,
    ) -> Result<(), ClientError> {
        let store = self.records.store();
        let tombstones = store
            .query(&RecordFilter::all().owned_by(user).only_deleted())
            .await?;
        let peers = store
            .query(&RecordFilter::kind(EntityKind::Session).owned_by(user).with_deleted())
            .await?;

        let mut batch = WriteBatch::new();
        for record in tombstones.iter().chain(peers.iter()) {
            if record.uuid != own_session {
                batch.remove(record);
            }
        }
        if !batch.is_empty() {
            let outcome = store.apply(batch).await?;
            tracing::debug!(removed = outcome.removed.len(), "account leftovers dropped");
        }
        Ok(())
    }

    /// Every user record except the anonymous one.
    async fn drop_account_users(&self) -> Result<(), ClientError> {
        let store = self.records.store();
        let users = store
            .query(&RecordFilter::kind(EntityKind::User).with_deleted())
            .await?;
        let mut batch = WriteBatch::new();
        for user in users.iter().filter(|u| !u.uuid.is_anonymous()) {
            batch.remove(user);
        }
        if !batch.is_empty() {
            store.apply(batch).await?;
        }
        Ok(())
    }
}

/// Reset the sanity gate so the next cycle runs a full reconciliation.
pub fn force_sanity(session: &mut Session) {
    session.sanity = SanityMarks {
        skip: session.sanity.skip,
        ..SanityMarks::default()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloud;
    use crate::testing::{at, flight, project};
    use sync_core::ManualClock;
    use sync_types::{Flight, Project, SynchroStatus};

    async fn client_with(cloud: MockCloud, device: &str) -> PictorClient {
        let mut config = Config::default();
        config.sync.device_id = device.into();
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        PictorClient::open(
            config,
            store,
            Arc::new(cloud),
            Arc::new(ManualClock::new(at(1_000_000))),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn open_bootstraps_anonymous_session() {
        let client = client_with(MockCloud::new(), "device-a").await;

        let session = client.current_session().await.unwrap();
        assert_eq!(session.entity.device_id, "device-a");
        assert!(session.entity.user_uuid.is_anonymous());
        assert!(client.current_user().await.unwrap().uuid.is_anonymous());
    }

    #[tokio::test]
    async fn anonymous_data_is_not_pushed() {
        let cloud = MockCloud::new();
        let client = client_with(cloud.clone(), "device-a").await;
        client.repository::<Project>().create(project("local")).await.unwrap();

        let outcome = client.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped(crate::engine::SkipReason::Anonymous)));
        assert!(cloud.push_log().is_empty());
    }

    #[tokio::test]
    async fn login_moves_anonymous_data() {
        let cloud = MockCloud::new();
        let client = client_with(cloud.clone(), "device-a").await;
        let p = client
            .repository::<Project>()
            .create(project("offline"))
            .await
            .unwrap();

        let account = RecordUuid::new();
        client
            .login(AccountProfile::new(account, "pilot"))
            .await
            .unwrap();

        let stored = client.repository::<Project>().get(p.uuid).await.unwrap().unwrap();
        assert_eq!(stored.entity.user_uuid, account);
        assert_eq!(stored.meta.status, SynchroStatus::NotSynced);
        assert_eq!(client.current_session().await.unwrap().entity.user_uuid, account);
        assert_eq!(client.current_user().await.unwrap().entity.name, "pilot");

        client.sync_now().await.unwrap();
        assert!(cloud.remote_get(p.uuid).is_some());
    }

    #[tokio::test]
    async fn login_twice_is_rejected_for_another_account() {
        let client = client_with(MockCloud::new(), "device-a").await;
        let first = RecordUuid::new();
        client.login(AccountProfile::new(first, "one")).await.unwrap();
        client.login(AccountProfile::new(first, "one")).await.unwrap();

        let err = client
            .login(AccountProfile::new(RecordUuid::new(), "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AlreadyLoggedIn(uuid) if uuid == first));
    }

    #[tokio::test]
    async fn logout_detaches_account_data() {
        let cloud = MockCloud::new();
        let client = client_with(cloud.clone(), "device-a").await;
        let account = RecordUuid::new();
        client.login(AccountProfile::new(account, "pilot")).await.unwrap();

        let mut f = flight("kept");
        f.user_uuid = account;
        let kept = client.repository::<Flight>().create(f).await.unwrap();
        let mut f = flight("gone");
        f.user_uuid = account;
        let gone = client.repository::<Flight>().create(f).await.unwrap();
        client.sync_now().await.unwrap();
        client.repository::<Flight>().soft_delete(gone.uuid).await.unwrap();

        client.logout().await.unwrap();

        let stored = client.repository::<Flight>().get(kept.uuid).await.unwrap().unwrap();
        assert!(stored.entity.user_uuid.is_anonymous());
        assert!(!stored.meta.cloud_id.is_assigned());
        assert_eq!(stored.meta.status, SynchroStatus::NotSynced);
        assert!(client
            .repository::<Flight>()
            .get_including_deleted(gone.uuid)
            .await
            .unwrap()
            .is_none());
        assert!(client.repository::<User>().get(account).await.unwrap().is_none());
        assert!(client.current_session().await.unwrap().entity.user_uuid.is_anonymous());

        let err = client.logout().await.unwrap_err();
        assert!(matches!(err, ClientError::NotLoggedIn));
    }

    #[tokio::test]
    async fn private_mode_needs_account() {
        let client = client_with(MockCloud::new(), "device-a").await;
        assert!(matches!(
            client.set_private_mode(true).await.unwrap_err(),
            ClientError::NotLoggedIn
        ));

        client
            .login(AccountProfile::new(RecordUuid::new(), "pilot"))
            .await
            .unwrap();
        client.set_private_mode(true).await.unwrap();
        assert!(matches!(
            client.sync_now().await.unwrap(),
            CycleOutcome::Skipped(crate::engine::SkipReason::PrivateMode)
        ));
    }

    #[test]
    fn force_sanity_keeps_skip_flag() {
        let mut session = Session::new(RecordUuid::new(), "d");
        session.sanity.latest_successful_date = Some(at(5));
        session.sanity.skip = true;
        force_sanity(&mut session);
        assert_eq!(session.sanity.latest_successful_date, None);
        assert!(session.sanity.skip);
    }
}
