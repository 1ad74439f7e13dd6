mod common;

use common::{eventually, Platform, REGION, TENANT};
use monoplane::{
    fleet::{DesiredState, DesiredStateKind, FleetEvent, SandboxSource},
    models::{Resources, RunnerState, SandboxState},
    orchestration::CreateSandbox,
    MonoplaneError,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const RUNNER_CAPACITY: Resources = Resources::new(8, 16, 100);

const FOOTPRINT: Resources = Resources::new(2, 4, 10);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn request(id: &str) -> CreateSandbox {
    CreateSandbox::builder()
        .id(id)
        .tenant_id(TENANT)
        .region_id(REGION)
        .snapshot("python")
        .build()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_migration_moves_sandboxes_off_unresponsive_runner() -> anyhow::Result<()> {
    let platform = Platform::migrating().await?;
    let r1 = platform.runner("r1", RUNNER_CAPACITY).await?;
    let r2 = platform.runner("r2", RUNNER_CAPACITY).await?;
    platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator();
    let fleet = platform.services.get_fleet();

    assert_eq!(orchestrator.create(request("sbx-1")).await?.runner_id.as_deref(), Some("r1"));
    let mut events = fleet.subscribe();

    r1.set_healthy(false);
    assert_eq!(fleet.health_check("r1").await?, RunnerState::Unresponsive);
    let event = events.recv().await?;
    assert!(matches!(event, FleetEvent::RunnerUnresponsive { .. }));

    let migrated = orchestrator.handle_fleet_event(&event).await?;
    assert_eq!(migrated, vec!["sbx-1".to_string()]);

    let sandbox = orchestrator.get("sbx-1").await?;
    assert_eq!(sandbox.state, SandboxState::Started);
    assert_eq!(sandbox.runner_id.as_deref(), Some("r2"));
    assert_eq!(sandbox.prev_runner_id.as_deref(), Some("r1"));
    assert_eq!(platform.runner_row("r1").await?.allocated, Resources::default());
    assert_eq!(platform.runner_row("r2").await?.allocated, FOOTPRINT);
    assert!(r2.hosts("sbx-1"));
    assert_eq!(
        r2.realized_kinds(),
        vec![DesiredStateKind::SnapshotPulled, DesiredStateKind::SandboxStarted]
    );

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_migration_replays_backup_and_keeps_sandbox_stopped() -> anyhow::Result<()> {
    let platform = Platform::new().await?;
    let r1 = platform.runner("r1", RUNNER_CAPACITY).await?;
    let r2 = platform.runner("r2", RUNNER_CAPACITY).await?;
    platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator();

    orchestrator.create(request("sbx-1")).await?;
    orchestrator.stop("sbx-1").await?;
    let backup_image = orchestrator.backup("sbx-1").await?.backup_image;

    r1.set_healthy(false);
    let sandbox = orchestrator.migrate("sbx-1").await?;

    assert_eq!(sandbox.state, SandboxState::Stopped);
    assert_eq!(sandbox.runner_id.as_deref(), Some("r2"));
    assert_eq!(
        r2.realized_kinds(),
        vec![DesiredStateKind::SandboxStarted, DesiredStateKind::SandboxStopped]
    );

    let Some(DesiredState::SandboxStarted { source, .. }) = r2.realized().first().cloned() else {
        anyhow::bail!("migration did not start the sandbox");
    };
    assert!(matches!(source, SandboxSource::Backup { .. }));
    assert_eq!(Some(source.image().to_string()), backup_image);

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_migration_without_target_leaves_sandbox_in_place() -> anyhow::Result<()> {
    let platform = Platform::new().await?;
    platform.runner("r1", RUNNER_CAPACITY).await?;
    platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator();
    orchestrator.create(request("sbx-1")).await?;

    let err = orchestrator.migrate("sbx-1").await.unwrap_err();
    assert!(matches!(err, MonoplaneError::Precondition(_)));

    let sandbox = orchestrator.get("sbx-1").await?;
    assert_eq!(sandbox.state, SandboxState::Started);
    assert_eq!(sandbox.runner_id.as_deref(), Some("r1"));
    assert_eq!(platform.runner_row("r1").await?.allocated, FOOTPRINT);

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_migration_failure_never_reverts_to_old_runner() -> anyhow::Result<()> {
    let platform = Platform::new().await?;
    let r1 = platform.runner("r1", RUNNER_CAPACITY).await?;
    let r2 = platform.runner("r2", RUNNER_CAPACITY).await?;
    platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator();
    orchestrator.create(request("sbx-1")).await?;

    r1.set_healthy(false);
    r2.reject(DesiredStateKind::SandboxStarted, "image corrupted");
    let err = orchestrator.migrate("sbx-1").await.unwrap_err();
    assert!(matches!(err, MonoplaneError::RunnerRejected { .. }));

    let sandbox = orchestrator.get("sbx-1").await?;
    assert_eq!(sandbox.state, SandboxState::Error);
    assert_eq!(sandbox.prev_runner_id.as_deref(), Some("r1"));
    assert_ne!(sandbox.runner_id.as_deref(), Some("r1"));
    assert_eq!(platform.runner_row("r1").await?.allocated, Resources::default());
    assert_eq!(platform.runner_row("r2").await?.allocated, Resources::default());

    platform.services.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_migration_runs_in_background() -> anyhow::Result<()> {
    let platform = Platform::migrating().await?;
    let r1 = platform.runner("r1", RUNNER_CAPACITY).await?;
    platform.runner("r2", RUNNER_CAPACITY).await?;
    platform.active_snapshot("python", FOOTPRINT).await?;
    let orchestrator = platform.services.get_orchestrator().clone();
    orchestrator.create(request("sbx-1")).await?;

    let handle = platform.services.start().await?;

    r1.set_healthy(false);
    platform.services.get_fleet().health_check("r1").await?;

    eventually(|| {
        let orchestrator = orchestrator.clone();
        async move {
            let sandbox = orchestrator.get("sbx-1").await?;
            Ok(sandbox.state == SandboxState::Started && sandbox.runner_id.as_deref() == Some("r2"))
        }
    })
    .await?;

    platform.services.shutdown().await;
    handle.await?;
    Ok(())
}
