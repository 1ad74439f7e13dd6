use std::sync::Arc;

use chrono::Utc;
use reqwest_retry::policies::ExponentialBackoff;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Sqlite};

use crate::{
    config::SnapshotConfig,
    db,
    fleet::{DesiredState, FleetManager, PushTarget, RegistryAuth},
    models::{DockerRegistry, Resources, Snapshot, SnapshotRegion, SnapshotState},
    region::RegionRegistry,
    utils::{self, retry_transient, EntityLocks},
    MonoplaneError, MonoplaneResult,
};

use super::{
    ArtifactRef, NewSnapshot, RegionImage, RegistryAction, RegistryProvider, RegistryResolver,
    RobotAccount, RobotAccountRequest, RobotPermission,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Registers, builds, replicates and deletes snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotPipeline {
    pool: Pool<Sqlite>,
    config: SnapshotConfig,
    regions: RegionRegistry,
    fleet: FleetManager,
    resolver: RegistryResolver,
    provider: Arc<dyn RegistryProvider>,
    retry: ExponentialBackoff,
    locks: EntityLocks,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotPipeline {
    /// Creates a pipeline. `retry` bounds the retries of transient runner and registry failures.
    pub fn new(
        pool: Pool<Sqlite>,
        config: SnapshotConfig,
        regions: RegionRegistry,
        fleet: FleetManager,
        provider: Arc<dyn RegistryProvider>,
        retry: ExponentialBackoff,
    ) -> Self {
        Self {
            resolver: RegistryResolver::new(pool.clone()),
            pool,
            config,
            regions,
            fleet,
            provider,
            retry,
            locks: EntityLocks::new(),
        }
    }

    /// Registers a snapshot in `pending`.
    pub async fn create(&self, new: NewSnapshot) -> MonoplaneResult<Snapshot> {
        utils::validate_snapshot_name(&new.name)?;
        if new.image_name.trim().is_empty() {
            return Err(MonoplaneError::Validation(format!(
                "snapshot {} has no image",
                new.name
            )));
        }

        let footprint = new
            .footprint
            .unwrap_or(*self.config.get_default_footprint());
        if !footprint.is_positive() {
            return Err(MonoplaneError::Validation(format!(
                "snapshot footprint must be positive: {footprint:?}"
            )));
        }

        let tenant_id = new.tenant_id.as_deref();
        if db::find_snapshot_by_name(&self.pool, tenant_id, &new.name)
            .await?
            .is_some()
        {
            return Err(MonoplaneError::Conflict(format!(
                "snapshot {} already exists",
                new.name
            )));
        }

        let now = Utc::now();
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: new.tenant_id,
            name: new.name,
            image_name: new.image_name,
            build_context: new.build_context,
            internal_name: None,
            state: SnapshotState::Pending,
            error_reason: None,
            footprint,
            hidden: new.hidden,
            build_region_id: None,
            registry_id: None,
            created_at: now,
            modified_at: now,
        };

        match db::insert_snapshot(&self.pool, &snapshot).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                return Err(MonoplaneError::Conflict(format!(
                    "snapshot {} already exists",
                    snapshot.name
                )))
            }
            Err(e) => return Err(e),
        }

        tracing::info!(snapshot_id = %snapshot.id, "registered snapshot {}", snapshot.name);
        Ok(snapshot)
    }

    /// Builds or pulls the snapshot on a runner in `build_region`, pushes it to the build
    /// registry and marks it `active` there.
    ///
    /// Only `pending` and `error` snapshots can be built. A failed build leaves the snapshot in
    /// `error` with the reason.
    pub async fn build(&self, snapshot_id: &str, build_region: &str) -> MonoplaneResult<Snapshot> {
        let _guard = self.locks.lock(format!("snapshot:{snapshot_id}")).await;
        let snapshot = self.get(snapshot_id).await?;
        if !matches!(snapshot.state, SnapshotState::Pending | SnapshotState::Error) {
            return Err(MonoplaneError::Precondition(format!(
                "snapshot {snapshot_id} is {}",
                snapshot.state
            )));
        }

        self.regions.get(build_region).await?;
        let registry = self
            .resolver
            .build_target(snapshot.tenant_id.as_deref())
            .await?;
        let artifact = artifact_for(&registry, &snapshot);
        let robot = self.robot_account(&registry, &snapshot).await?;

        if !db::begin_snapshot_build(&self.pool, snapshot_id, build_region, &registry.id).await? {
            return Err(MonoplaneError::Conflict(format!(
                "snapshot {snapshot_id} left pending/error concurrently"
            )));
        }

        tracing::info!(
            snapshot_id = %snapshot_id,
            region_id = %build_region,
            "building snapshot {} into {}",
            snapshot.name,
            registry.name
        );

        let destination = PushTarget {
            image: artifact.image(registry.host()),
            registry: robot.auth(&registry.url),
        };
        let desired = match &snapshot.build_context {
            Some(dockerfile) => DesiredState::SnapshotBuilt {
                snapshot_id: snapshot.id.clone(),
                dockerfile: dockerfile.clone(),
                destination: destination.clone(),
            },
            None => DesiredState::SnapshotPulled {
                image: snapshot.image_name.clone(),
                source: None,
                destination: Some(destination.clone()),
            },
        };

        if let Err(e) = self.realize_in_region(build_region, &desired).await {
            let reason = e.to_string();
            tracing::error!(snapshot_id = %snapshot_id, "snapshot build failed: {reason}");
            db::finish_snapshot_build(
                &self.pool,
                snapshot_id,
                SnapshotState::Error,
                None,
                Some(&reason),
            )
            .await?;
            return Err(e);
        }

        db::finish_snapshot_build(
            &self.pool,
            snapshot_id,
            SnapshotState::Active,
            Some(&destination.image),
            None,
        )
        .await?;
        db::insert_snapshot_region(&self.pool, snapshot_id, build_region, Utc::now()).await?;

        tracing::info!(snapshot_id = %snapshot_id, "snapshot active as {}", destination.image);
        self.get(snapshot_id).await
    }

    /// Makes an `active` snapshot available in `region_id`.
    ///
    /// Idempotent. When the region pulls from the registry the snapshot was pushed to, only the
    /// availability row is written.
    pub async fn replicate(
        &self,
        snapshot_id: &str,
        region_id: &str,
    ) -> MonoplaneResult<SnapshotRegion> {
        let _guard = self.locks.lock(format!("snapshot:{snapshot_id}")).await;
        let snapshot = self.get(snapshot_id).await?;
        if snapshot.state != SnapshotState::Active {
            return Err(MonoplaneError::Precondition(format!(
                "snapshot {snapshot_id} is {}, not active",
                snapshot.state
            )));
        }

        self.regions.get(region_id).await?;
        if let Some(row) = db::get_snapshot_region(&self.pool, snapshot_id, region_id).await? {
            return Ok(row);
        }

        let (source, source_image) = self.source_of(&snapshot).await?;
        let target = self.resolver.region_target(region_id).await?;

        if source.same_storage_as(&target) {
            tracing::debug!(snapshot_id = %snapshot_id, "region {region_id} shares the source registry");
        } else {
            let robot = self.robot_account(&target, &snapshot).await?;
            let destination = PushTarget {
                image: artifact_for(&target, &snapshot).image(target.host()),
                registry: robot.auth(&target.url),
            };

            tracing::info!(
                snapshot_id = %snapshot_id,
                region_id = %region_id,
                "replicating {} to {}",
                source_image,
                destination.image
            );

            self.realize_in_region(
                region_id,
                &DesiredState::SnapshotPulled {
                    image: source_image,
                    source: Some(RegistryAuth::from(&source)),
                    destination: Some(destination),
                },
            )
            .await?;
        }

        db::insert_snapshot_region(&self.pool, snapshot_id, region_id, Utc::now()).await?;
        db::get_snapshot_region(&self.pool, snapshot_id, region_id)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("snapshot region", region_id))
    }

    /// Deletes an artifact from a registry. An artifact that is already gone counts as deleted.
    pub async fn delete_artifact(
        &self,
        registry: &DockerRegistry,
        artifact: &ArtifactRef,
    ) -> MonoplaneResult<()> {
        let auth = RegistryAuth::from(registry);
        let label = format!(
            "delete {}/{}:{} on {}",
            artifact.project, artifact.repository, artifact.tag, registry.name
        );

        retry_transient(&self.retry, &label, || {
            self.provider.delete_artifact(&auth, artifact)
        })
        .await
    }

    /// Deletes a snapshot with its pushed artifacts and availability rows.
    ///
    /// Fails while any placed sandbox still uses the snapshot.
    pub async fn delete(&self, snapshot_id: &str) -> MonoplaneResult<()> {
        let _guard = self.locks.lock(format!("snapshot:{snapshot_id}")).await;
        let snapshot = self.get(snapshot_id).await?;

        let placed = db::count_placed_sandboxes_for_snapshot(&self.pool, snapshot_id).await?;
        if placed > 0 {
            return Err(MonoplaneError::Precondition(format!(
                "snapshot {snapshot_id} is used by {placed} sandbox(es)"
            )));
        }

        for registry in self.registries_holding(&snapshot).await? {
            self.delete_artifact(&registry, &artifact_for(&registry, &snapshot))
                .await?;
        }

        db::delete_snapshot(&self.pool, snapshot_id).await?;
        tracing::info!(snapshot_id = %snapshot_id, "deleted snapshot {}", snapshot.name);
        Ok(())
    }

    /// Shows or hides a snapshot.
    pub async fn set_hidden(&self, snapshot_id: &str, hidden: bool) -> MonoplaneResult<Snapshot> {
        if !db::set_snapshot_hidden(&self.pool, snapshot_id, hidden).await? {
            return Err(MonoplaneError::not_found("snapshot", snapshot_id));
        }

        self.get(snapshot_id).await
    }

    /// Gets a snapshot by id.
    pub async fn get(&self, snapshot_id: &str) -> MonoplaneResult<Snapshot> {
        db::get_snapshot(&self.pool, snapshot_id)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("snapshot", snapshot_id))
    }

    /// Gets a snapshot by name within a tenant. `None` looks among platform-wide snapshots.
    pub async fn find_by_name(
        &self,
        tenant_id: Option<&str>,
        name: &str,
    ) -> MonoplaneResult<Option<Snapshot>> {
        db::find_snapshot_by_name(&self.pool, tenant_id, name).await
    }

    /// The regions a snapshot is available in.
    pub async fn regions(&self, snapshot_id: &str) -> MonoplaneResult<Vec<SnapshotRegion>> {
        self.get(snapshot_id).await?;
        db::list_snapshot_regions(&self.pool, snapshot_id).await
    }

    /// Lists the snapshots a tenant can see.
    pub async fn list(
        &self,
        tenant_id: Option<&str>,
        include_hidden: bool,
    ) -> MonoplaneResult<Vec<Snapshot>> {
        db::list_snapshots(&self.pool, tenant_id, include_hidden).await
    }

    /// Whether the snapshot is available in `region_id`.
    pub async fn is_available_in(&self, snapshot_id: &str, region_id: &str) -> MonoplaneResult<bool> {
        Ok(db::get_snapshot_region(&self.pool, snapshot_id, region_id)
            .await?
            .is_some())
    }

    /// Where runners in `region_id` pull the snapshot from.
    pub async fn image_in_region(
        &self,
        snapshot: &Snapshot,
        region_id: &str,
    ) -> MonoplaneResult<RegionImage> {
        let (source, source_image) = self.source_of(snapshot).await?;
        if snapshot.build_region_id.as_deref() == Some(region_id) {
            return Ok(RegionImage {
                image: source_image,
                registry: RegistryAuth::from(&source),
            });
        }

        let target = self.resolver.region_target(region_id).await?;
        Ok(RegionImage {
            image: artifact_for(&target, snapshot).image(target.host()),
            registry: RegistryAuth::from(&target),
        })
    }

    /// The registry resolver the pipeline uses.
    pub fn resolver(&self) -> &RegistryResolver {
        &self.resolver
    }

    async fn source_of(&self, snapshot: &Snapshot) -> MonoplaneResult<(DockerRegistry, String)> {
        match (&snapshot.registry_id, &snapshot.internal_name) {
            (Some(registry_id), Some(internal_name)) => {
                Ok((self.resolver.get(registry_id).await?, internal_name.clone()))
            }
            _ => Err(MonoplaneError::Precondition(format!(
                "snapshot {} was never pushed",
                snapshot.id
            ))),
        }
    }

    async fn registries_holding(&self, snapshot: &Snapshot) -> MonoplaneResult<Vec<DockerRegistry>> {
        let Some(registry_id) = &snapshot.registry_id else {
            return Ok(Vec::new());
        };
        if snapshot.internal_name.is_none() {
            return Ok(Vec::new());
        }

        let mut registries = Vec::new();
        match self.resolver.get(registry_id).await {
            Ok(registry) => registries.push(registry),
            Err(MonoplaneError::NotFound { .. }) => {
                tracing::warn!(snapshot_id = %snapshot.id, "build registry {registry_id} no longer exists");
            }
            Err(e) => return Err(e),
        }

        for row in db::list_snapshot_regions(&self.pool, &snapshot.id).await? {
            if snapshot.build_region_id.as_deref() == Some(row.region_id.as_str()) {
                continue;
            }

            let target = match self.resolver.region_target(&row.region_id).await {
                Ok(target) => target,
                Err(MonoplaneError::Unavailable(_)) => continue,
                Err(e) => return Err(e),
            };
            if !registries.iter().any(|known| known.same_storage_as(&target)) {
                registries.push(target);
            }
        }

        Ok(registries)
    }

    async fn robot_account(
        &self,
        registry: &DockerRegistry,
        snapshot: &Snapshot,
    ) -> MonoplaneResult<RobotAccount> {
        let auth = RegistryAuth::from(registry);
        let request = RobotAccountRequest {
            name: format!("monoplane-{}-{}", snapshot.id, Utc::now().timestamp_millis()),
            description: format!("push snapshot {}", snapshot.name),
            duration: *self.config.get_robot_account_duration_secs(),
            permissions: vec![RobotPermission {
                project: registry.project.clone(),
                actions: vec![RegistryAction::Push, RegistryAction::Pull],
            }],
        };

        let label = format!("robot account on {}", registry.name);
        retry_transient(&self.retry, &label, || {
            self.provider.create_robot_account(&auth, &request)
        })
        .await
    }

    async fn realize_in_region(&self, region_id: &str, desired: &DesiredState) -> MonoplaneResult<()> {
        let runner = self
            .fleet
            .select_runner_for(region_id, &Resources::default(), &[])
            .await?;
        let adapter = self.fleet.adapter_for(&runner)?;

        let label = format!("{} on runner {}", desired.kind(), runner.id);
        retry_transient(&self.retry, &label, || adapter.realize(desired)).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The artifact a snapshot is stored as on `registry`.
///
/// The tag is derived from the snapshot's source so rebuilding changed content never reuses a
/// tag.
pub fn artifact_for(registry: &DockerRegistry, snapshot: &Snapshot) -> ArtifactRef {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.image_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(snapshot.build_context.as_deref().unwrap_or_default().as_bytes());
    let digest = hex::encode(hasher.finalize());

    ArtifactRef {
        project: registry.project.clone(),
        repository: format!("snapshot-{}", snapshot.id),
        tag: digest[..12].to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::{
        config::FleetConfig,
        db::{init_db, CONTROL_DB_MIGRATOR},
        fleet::{DesiredStateKind, InMemoryRunnerAdapter, NewRunner, StaticAdapterFactory},
        models::RegistryType,
        region::NewRegion,
        snapshot::NoopRegistryProvider,
        utils::backoff_policy,
    };

    struct Fixture {
        _dir: TempDir,
        pool: Pool<Sqlite>,
        fleet: FleetManager,
        pipeline: SnapshotPipeline,
        adapters: Arc<StaticAdapterFactory>,
    }

    impl Fixture {
        async fn new() -> anyhow::Result<Self> {
            let dir = tempdir()?;
            let pool = init_db(dir.path().join("control.db"), &CONTROL_DB_MIGRATOR).await?;
            let regions = RegionRegistry::new(pool.clone());
            for id in ["eu", "us"] {
                regions
                    .create(NewRegion::builder().id(id).name(id).build(), None)
                    .await?;
            }

            let adapters = Arc::new(StaticAdapterFactory::new());
            let fleet = FleetManager::new(
                pool.clone(),
                FleetConfig::builder().health_check_interval_secs(3600).build(),
                regions.clone(),
                adapters.clone(),
            );
            let pipeline = SnapshotPipeline::new(
                pool.clone(),
                SnapshotConfig::default(),
                regions,
                fleet.clone(),
                Arc::new(NoopRegistryProvider),
                backoff_policy(2, Duration::from_millis(1), Duration::from_millis(5)),
            );

            Ok(Self {
                _dir: dir,
                pool,
                fleet,
                pipeline,
                adapters,
            })
        }

        async fn registry(
            &self,
            id: &str,
            region_id: Option<&str>,
            is_fallback: bool,
        ) -> anyhow::Result<()> {
            let now = Utc::now();
            db::insert_registry(
                &self.pool,
                &DockerRegistry {
                    id: id.to_string(),
                    name: id.to_string(),
                    url: format!("https://{id}.registry.test"),
                    project: "monoplane".to_string(),
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                    registry_type: RegistryType::Internal,
                    tenant_id: None,
                    region_id: region_id.map(str::to_string),
                    is_fallback,
                    created_at: now,
                    modified_at: now,
                },
            )
            .await?;
            Ok(())
        }

        async fn runner(&self, id: &str, region_id: &str) -> anyhow::Result<InMemoryRunnerAdapter> {
            let adapter = InMemoryRunnerAdapter::new(id);
            self.adapters.insert(id, Arc::new(adapter.clone()));
            self.fleet
                .register(
                    NewRunner::builder()
                        .id(id)
                        .region_id(region_id)
                        .api_url(format!("http://{id}.runners.test"))
                        .api_key("key")
                        .capacity(Resources::new(8, 16, 100))
                        .build(),
                )
                .await?;
            self.fleet.health_check(id).await?;
            Ok(adapter)
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_create_validates_and_defaults() -> anyhow::Result<()> {
        let fixture = Fixture::new().await?;
        let pipeline = &fixture.pipeline;

        let err = pipeline
            .create(NewSnapshot::builder().name("x").image_name("ubuntu").build())
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Validation(_)));

        let snapshot = pipeline
            .create(
                NewSnapshot::builder()
                    .name("ubuntu:22.04")
                    .image_name("docker.io/library/ubuntu:22.04")
                    .build(),
            )
            .await?;
        assert_eq!(snapshot.state, SnapshotState::Pending);
        assert_eq!(snapshot.footprint, *SnapshotConfig::default().get_default_footprint());

        let err = pipeline
            .create(
                NewSnapshot::builder()
                    .name("ubuntu:22.04")
                    .image_name("docker.io/library/ubuntu:24.04")
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Conflict(_)));

        // Names are unique per tenant only.
        pipeline
            .create(
                NewSnapshot::builder()
                    .tenant_id("acme")
                    .name("ubuntu:22.04")
                    .image_name("docker.io/library/ubuntu:22.04")
                    .hidden(true)
                    .build(),
            )
            .await?;

        assert_eq!(pipeline.list(Some("acme"), false).await?.len(), 1);
        assert_eq!(pipeline.list(Some("acme"), true).await?.len(), 2);

        let shown = pipeline.set_hidden(&snapshot.id, true).await?;
        assert!(shown.hidden);
        assert!(pipeline.list(None, false).await?.is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_build_pushes_and_marks_region() -> anyhow::Result<()> {
        let fixture = Fixture::new().await?;
        fixture.registry("internal", None, true).await?;
        let runner = fixture.runner("r1", "eu").await?;

        let snapshot = fixture
            .pipeline
            .create(
                NewSnapshot::builder()
                    .name("ubuntu")
                    .image_name("docker.io/library/ubuntu:22.04")
                    .build(),
            )
            .await?;

        let built = fixture.pipeline.build(&snapshot.id, "eu").await?;
        assert_eq!(built.state, SnapshotState::Active);
        assert_eq!(built.build_region_id.as_deref(), Some("eu"));

        let internal_name = built.internal_name.clone().unwrap();
        assert!(internal_name.starts_with("internal.registry.test/monoplane/snapshot-"));
        assert!(runner.has_image(&internal_name));

        assert!(fixture.pipeline.is_available_in(&snapshot.id, "eu").await?);
        assert!(!fixture.pipeline.is_available_in(&snapshot.id, "us").await?);

        let err = fixture.pipeline.build(&snapshot.id, "eu").await.unwrap_err();
        assert!(matches!(err, MonoplaneError::Precondition(_)));

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_build_failure_records_reason() -> anyhow::Result<()> {
        let fixture = Fixture::new().await?;
        fixture.registry("internal", None, true).await?;
        let runner = fixture.runner("r1", "eu").await?;
        runner.reject(DesiredStateKind::SnapshotBuilt, "dockerfile syntax error");

        let snapshot = fixture
            .pipeline
            .create(
                NewSnapshot::builder()
                    .name("custom")
                    .image_name("custom")
                    .build_context("FROM ubuntu:22.04\nRUN exit 1")
                    .build(),
            )
            .await?;

        let err = fixture.pipeline.build(&snapshot.id, "eu").await.unwrap_err();
        assert!(matches!(err, MonoplaneError::RunnerRejected { .. }));

        let failed = fixture.pipeline.get(&snapshot.id).await?;
        assert_eq!(failed.state, SnapshotState::Error);
        assert!(failed
            .error_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("dockerfile syntax error")));
        assert!(fixture.pipeline.regions(&snapshot.id).await?.is_empty());

        runner.accept(DesiredStateKind::SnapshotBuilt);
        let built = fixture.pipeline.build(&snapshot.id, "eu").await?;
        assert_eq!(built.state, SnapshotState::Active);
        assert!(built.error_reason.is_none());

        fixture.fleet.shutdown().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_build_without_registry_is_unavailable() -> anyhow::Result<()> {
        let fixture = Fixture::new().await?;
        let snapshot = fixture
            .pipeline
            .create(NewSnapshot::builder().name("ubuntu").image_name("ubuntu").build())
            .await?;

        let err = fixture.pipeline.build(&snapshot.id, "eu").await.unwrap_err();
        assert!(matches!(err, MonoplaneError::Unavailable(_)));
        assert_eq!(
            fixture.pipeline.get(&snapshot.id).await?.state,
            SnapshotState::Pending
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_replicate_copies_only_across_registries() -> anyhow::Result<()> {
        let fixture = Fixture::new().await?;
        fixture.registry("internal", None, true).await?;
        fixture.runner("r1", "eu").await?;

        let snapshot = fixture
            .pipeline
            .create(NewSnapshot::builder().name("ubuntu").image_name("ubuntu").build())
            .await?;
        let err = fixture
            .pipeline
            .replicate(&snapshot.id, "us")
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Precondition(_)));

        fixture.pipeline.build(&snapshot.id, "eu").await?;

        // "us" falls back to the build registry: no copy needed, and no runner either.
        fixture.pipeline.replicate(&snapshot.id, "us").await?;
        assert!(fixture.pipeline.is_available_in(&snapshot.id, "us").await?);

        fixture.registry("us-internal", Some("us"), false).await?;
        let us_runner = fixture.runner("r2", "us").await?;
        let other = fixture
            .pipeline
            .create(NewSnapshot::builder().name("debian").image_name("debian").build())
            .await?;
        fixture.pipeline.build(&other.id, "eu").await?;
        fixture.pipeline.replicate(&other.id, "us").await?;
        fixture.pipeline.replicate(&other.id, "us").await?;

        assert_eq!(us_runner.realized_kinds(), vec![DesiredStateKind::SnapshotPulled]);
        let image = fixture
            .pipeline
            .image_in_region(&fixture.pipeline.get(&other.id).await?, "us")
            .await?;
        assert!(image.image.starts_with("us-internal.registry.test/monoplane/"));
        assert!(us_runner.has_image(&image.image));

        fixture.fleet.shutdown().await;
        Ok(())
    }
}
