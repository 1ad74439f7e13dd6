use sqlx::{Pool, Sqlite};

use crate::{
    db,
    fleet::RegistryAuth,
    models::{DockerRegistry, RegistryType},
    MonoplaneError, MonoplaneResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Decides which registry an image is pushed to or pulled from.
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryResolver {
    /// Creates a resolver over the given store.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// The registry a tenant's snapshot builds are pushed to.
    ///
    /// The tenant's own `organization` registry wins, then the `internal` fallback.
    pub async fn build_target(&self, tenant_id: Option<&str>) -> MonoplaneResult<DockerRegistry> {
        if let Some(tenant_id) = tenant_id {
            if let Some(registry) =
                db::find_tenant_registry(&self.pool, RegistryType::Organization, tenant_id).await?
            {
                return Ok(registry);
            }
        }

        self.fallback(RegistryType::Internal).await
    }

    /// The registry sandbox backups in `region_id` are pushed to.
    pub async fn backup_target(&self, region_id: &str) -> MonoplaneResult<DockerRegistry> {
        if let Some(registry) =
            db::find_region_registry(&self.pool, RegistryType::Backup, region_id).await?
        {
            return Ok(registry);
        }

        self.fallback(RegistryType::Backup).await
    }

    /// The internal registry runners in `region_id` pull snapshots from.
    pub async fn region_target(&self, region_id: &str) -> MonoplaneResult<DockerRegistry> {
        if let Some(registry) =
            db::find_region_registry(&self.pool, RegistryType::Internal, region_id).await?
        {
            return Ok(registry);
        }

        self.fallback(RegistryType::Internal).await
    }

    /// Gets a registry by id.
    pub async fn get(&self, id: &str) -> MonoplaneResult<DockerRegistry> {
        db::get_registry(&self.pool, id)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("registry", id))
    }

    async fn fallback(&self, registry_type: RegistryType) -> MonoplaneResult<DockerRegistry> {
        db::find_fallback_registry(&self.pool, registry_type)
            .await?
            .ok_or_else(|| {
                MonoplaneError::Unavailable(format!("no {registry_type} registry is configured"))
            })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<&DockerRegistry> for RegistryAuth {
    fn from(registry: &DockerRegistry) -> Self {
        RegistryAuth {
            url: registry.url.clone(),
            username: registry.username.clone(),
            password: registry.password.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        db::{init_db, CONTROL_DB_MIGRATOR},
        region::{NewRegion, RegionRegistry},
    };

    fn registry(
        id: &str,
        registry_type: RegistryType,
        tenant_id: Option<&str>,
        region_id: Option<&str>,
        is_fallback: bool,
    ) -> DockerRegistry {
        let now = Utc::now();
        DockerRegistry {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("https://{id}.registry.test"),
            project: "monoplane".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            registry_type,
            tenant_id: tenant_id.map(str::to_string),
            region_id: region_id.map(str::to_string),
            is_fallback,
            created_at: now,
            modified_at: now,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_resolver_prefers_specific_registries() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let pool = init_db(dir.path().join("control.db"), &CONTROL_DB_MIGRATOR).await?;
        RegionRegistry::new(pool.clone())
            .create(NewRegion::builder().id("eu").name("eu").build(), None)
            .await?;
        let resolver = RegistryResolver::new(pool.clone());

        let err = resolver.build_target(Some("acme")).await.unwrap_err();
        assert!(matches!(err, MonoplaneError::Unavailable(_)));

        for registry in [
            registry("internal", RegistryType::Internal, None, None, true),
            registry("acme", RegistryType::Organization, Some("acme"), None, false),
            registry("backup", RegistryType::Backup, None, None, true),
            registry("eu-internal", RegistryType::Internal, None, Some("eu"), false),
        ] {
            db::insert_registry(&pool, &registry).await?;
        }

        assert_eq!(resolver.build_target(Some("acme")).await?.id, "acme");
        assert_eq!(resolver.build_target(Some("globex")).await?.id, "internal");
        assert_eq!(resolver.build_target(None).await?.id, "internal");
        assert_eq!(resolver.region_target("eu").await?.id, "eu-internal");
        assert_eq!(resolver.region_target("us").await?.id, "internal");
        assert_eq!(resolver.backup_target("eu").await?.id, "backup");

        Ok(())
    }
}
