use chrono::{DateTime, Utc};

use crate::{
    fleet::ObservedSandboxState,
    models::{DockerRegistry, Sandbox, SandboxState},
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The image a backup of `sandbox_id` taken at `at` is pushed as.
///
/// The millisecond timestamp keeps successive backups of the same sandbox distinct.
pub(super) fn backup_image(registry: &DockerRegistry, sandbox_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}/backup-{}:{}",
        registry.host(),
        registry.project,
        sandbox_id,
        at.format("%Y%m%d%H%M%S%3f")
    )
}

/// The state a migrated sandbox settles in once replayed on its new runner.
pub(super) fn resume_state(sandbox: &Sandbox) -> SandboxState {
    match sandbox.state {
        SandboxState::Started => SandboxState::Started,
        SandboxState::Stopped | SandboxState::BackedUp | SandboxState::BackingUp => {
            SandboxState::Stopped
        }
        _ if sandbox.desired_state == SandboxState::Started => SandboxState::Started,
        _ => SandboxState::Stopped,
    }
}

/// The lifecycle state a runner report moves the sandbox to.
///
/// `None` when the report carries no new information for a sandbox in `current`.
pub(super) fn observed_target(
    current: SandboxState,
    observed: ObservedSandboxState,
) -> Option<SandboxState> {
    let target = match observed {
        ObservedSandboxState::Creating | ObservedSandboxState::Unknown => return None,
        ObservedSandboxState::Started => SandboxState::Started,
        ObservedSandboxState::Stopped if current == SandboxState::BackedUp => return None,
        ObservedSandboxState::Stopped => SandboxState::Stopped,
        ObservedSandboxState::BackingUp => SandboxState::BackingUp,
        ObservedSandboxState::BackedUp => SandboxState::BackedUp,
        ObservedSandboxState::Destroyed => SandboxState::Destroyed,
        ObservedSandboxState::Error => SandboxState::Error,
    };

    (target != current).then_some(target)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::models::{RegistryType, Resources};

    fn sandbox(state: SandboxState, desired_state: SandboxState) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: "sbx-1".to_string(),
            tenant_id: "acme".to_string(),
            region_id: "eu".to_string(),
            runner_id: Some("r1".to_string()),
            prev_runner_id: None,
            snapshot_id: "snap".to_string(),
            resources: Resources::new(1, 1, 1),
            state,
            desired_state,
            capacity_reserved: true,
            backup_image: None,
            backup_registry_id: None,
            last_backup_at: None,
            error_reason: None,
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn test_backup_image_is_timestamped() {
        let now = Utc::now();
        let registry = DockerRegistry {
            id: "backup".to_string(),
            name: "backup".to_string(),
            url: "https://backup.registry.test".to_string(),
            project: "monoplane".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            registry_type: RegistryType::Backup,
            tenant_id: None,
            region_id: None,
            is_fallback: true,
            created_at: now,
            modified_at: now,
        };
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        assert_eq!(
            backup_image(&registry, "sbx-1", at),
            "backup.registry.test/monoplane/backup-sbx-1:20240309140507000"
        );
    }

    #[test]
    fn test_resume_state_follows_last_known_state() {
        use SandboxState::*;

        assert_eq!(resume_state(&sandbox(Started, Started)), Started);
        assert_eq!(resume_state(&sandbox(BackedUp, BackedUp)), Stopped);
        assert_eq!(resume_state(&sandbox(Error, Started)), Started);
        assert_eq!(resume_state(&sandbox(Error, Stopped)), Stopped);
        assert_eq!(resume_state(&sandbox(Restoring, Started)), Started);
    }

    #[test]
    fn test_observed_target_skips_redundant_reports() {
        use SandboxState::*;

        assert_eq!(observed_target(Started, ObservedSandboxState::Started), None);
        assert_eq!(observed_target(BackedUp, ObservedSandboxState::Stopped), None);
        assert_eq!(observed_target(Started, ObservedSandboxState::Unknown), None);
        assert_eq!(
            observed_target(Started, ObservedSandboxState::Stopped),
            Some(Stopped)
        );
        assert_eq!(
            observed_target(Restoring, ObservedSandboxState::Started),
            Some(Started)
        );
        assert_eq!(
            observed_target(Stopped, ObservedSandboxState::Error),
            Some(Error)
        );
    }
}
