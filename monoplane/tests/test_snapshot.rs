mod common;

use std::{sync::Arc, time::Duration};

use common::{credentials, Platform, REGION, TENANT};
use monoplane::{
    config::{FleetConfig, MonoplaneConfig, RegionConfig, RegistryConfig},
    models::{Resources, SandboxState, SnapshotState},
    orchestration::CreateSandbox,
    region::NewRegion,
    snapshot::{HarborRegistryProvider, NewSnapshot},
    MonoplaneError,
};
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const RUNNER_CAPACITY: Resources = Resources::new(8, 16, 100);

const FOOTPRINT: Resources = Resources::new(1, 2, 5);

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_snapshot_is_only_usable_where_available() -> anyhow::Result<()> {
    let platform = Platform::new().await?;
    platform.runner("r1", RUNNER_CAPACITY).await?;
    platform
        .services
        .get_regions()
        .create(NewRegion::builder().id("us").name("us").build(), None)
        .await?;
    platform.runner_in("r-us", "us", RUNNER_CAPACITY).await?;
    let snapshot = platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator();

    let request = CreateSandbox::builder()
        .id("sbx-us")
        .tenant_id(TENANT)
        .region_id("us")
        .snapshot("python")
        .build();

    // Capacity in the region is not enough on its own.
    let err = orchestrator.create(request.clone()).await.unwrap_err();
    assert!(matches!(err, MonoplaneError::SnapshotUnavailable { .. }));
    assert!(platform.sandboxes().await?.is_empty());

    let snapshots = platform.services.get_snapshots();
    snapshots.replicate(&snapshot.id, "us").await?;
    snapshots.replicate(&snapshot.id, "us").await?;
    let regions: Vec<String> = snapshots
        .regions(&snapshot.id)
        .await?
        .into_iter()
        .map(|row| row.region_id)
        .collect();
    assert_eq!(regions.len(), 2);
    assert!(regions.contains(&"us".to_string()));

    let sandbox = orchestrator.create(request).await?;
    assert_eq!(sandbox.state, SandboxState::Started);
    assert_eq!(sandbox.runner_id.as_deref(), Some("r-us"));

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_delete_waits_for_sandboxes() -> anyhow::Result<()> {
    let platform = Platform::new().await?;
    platform.runner("r1", RUNNER_CAPACITY).await?;
    let snapshot = platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator();
    let snapshots = platform.services.get_snapshots();

    orchestrator
        .create(
            CreateSandbox::builder()
                .id("sbx-1")
                .tenant_id(TENANT)
                .region_id(REGION)
                .snapshot(snapshot.id.clone())
                .build(),
        )
        .await?;

    let err = snapshots.delete(&snapshot.id).await.unwrap_err();
    assert!(matches!(err, MonoplaneError::Precondition(_)));

    orchestrator.destroy("sbx-1").await?;
    snapshots.delete(&snapshot.id).await?;

    let err = snapshots.get(&snapshot.id).await.unwrap_err();
    assert!(matches!(err, MonoplaneError::NotFound { .. }));

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_delete_tolerates_missing_artifact() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2.0/robots"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "name": "robot$monoplane-push",
            "secret": "robot-secret"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(
            r"^/api/v2\.0/projects/monoplane/repositories/snapshot-[^/]+/artifacts/[0-9a-f]{12}$",
        ))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let config = MonoplaneConfig::builder()
        .region(RegionConfig::builder().id(REGION).name(REGION).build())
        .registry(
            RegistryConfig::builder()
                .internal(credentials(&server.uri()))
                .backup(credentials("https://backup.registry.test"))
                .build(),
        )
        .fleet(FleetConfig::builder().health_check_interval_secs(3600).build())
        .orchestrator(common::config(false).get_orchestrator().clone())
        .build();
    let provider = HarborRegistryProvider::new(
        Duration::from_secs(5),
        0,
        Duration::from_millis(1),
        Duration::from_millis(5),
    )?;
    let platform = Platform::with_provider(config, Arc::new(provider)).await?;
    platform.runner("r1", RUNNER_CAPACITY).await?;

    let snapshot = platform.active_snapshot("python", FOOTPRINT).await?;
    assert_eq!(snapshot.state, SnapshotState::Active);

    platform.services.get_snapshots().delete(&snapshot.id).await?;

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_names_resolve_per_tenant() -> anyhow::Result<()> {
    let platform = Platform::new().await?;
    platform.runner("r1", RUNNER_CAPACITY).await?;
    let snapshots = platform.services.get_snapshots();

    let platform_wide = snapshots
        .create(
            NewSnapshot::builder()
                .name("python")
                .image_name("docker.io/library/python:3.12")
                .build(),
        )
        .await?;
    snapshots.build(&platform_wide.id, REGION).await?;
    let own = platform.active_snapshot("python", FOOTPRINT).await?;

    let orchestrator = platform.services.get_orchestrator();
    let mine = orchestrator
        .create(
            CreateSandbox::builder()
                .id("sbx-acme")
                .tenant_id(TENANT)
                .region_id(REGION)
                .snapshot("python")
                .build(),
        )
        .await?;
    let theirs = orchestrator
        .create(
            CreateSandbox::builder()
                .id("sbx-globex")
                .tenant_id("globex")
                .region_id(REGION)
                .snapshot("python")
                .build(),
        )
        .await?;

    assert_eq!(mine.snapshot_id, own.id);
    assert_eq!(theirs.snapshot_id, platform_wide.id);

    // A tenant snapshot id is not usable by another tenant.
    let err = orchestrator
        .create(
            CreateSandbox::builder()
                .id("sbx-stolen")
                .tenant_id("globex")
                .region_id(REGION)
                .snapshot(own.id.clone())
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MonoplaneError::NotFound { .. }));

    platform.services.shutdown().await;
    Ok(())
}
