use chrono::Utc;
use reqwest::Url;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tokio::sync::broadcast;

use crate::{
    db,
    models::{EndpointKind, Region, RegionEndpoint, RegionScope},
    utils::{self, hash_secret, Secret},
    MonoplaneError, MonoplaneResult,
};

use super::{EndpointCredential, EndpointUpdate, NewRegion, RegionEvent, RotatedCredential};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Buffered region events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Holds region definitions and rotates their endpoint credentials.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    pool: Pool<Sqlite>,
    events: broadcast::Sender<RegionEvent>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegionRegistry {
    /// Creates a registry over the given store.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { pool, events }
    }

    /// Creates a region.
    ///
    /// Shared regions take no owner and custom regions require one. The name must be unique
    /// within the owner's scope.
    pub async fn create(&self, new: NewRegion, owner: Option<&str>) -> MonoplaneResult<Region> {
        utils::validate_name(&new.name)?;
        if let Some(id) = &new.id {
            utils::validate_name(id)?;
        }

        match (new.scope, owner) {
            (RegionScope::Shared, Some(_)) => {
                return Err(MonoplaneError::Validation(
                    "shared regions cannot have an owner".to_string(),
                ))
            }
            (RegionScope::Custom, None) => {
                return Err(MonoplaneError::Validation(
                    "custom regions require an owner".to_string(),
                ))
            }
            _ => {}
        }

        if db::find_region_by_name(&self.pool, &new.name, owner)
            .await?
            .is_some()
        {
            return Err(MonoplaneError::Conflict(format!(
                "region {} already exists",
                new.name
            )));
        }

        let now = Utc::now();
        let region = Region {
            id: new.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: new.name,
            scope: new.scope,
            owner: owner.map(str::to_string),
            enforce_quotas: new.enforce_quotas,
            created_at: now,
            modified_at: now,
        };

        match db::insert_region(&self.pool, &region).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                return Err(MonoplaneError::Conflict(format!(
                    "region {} already exists",
                    region.name
                )))
            }
            Err(e) => return Err(e),
        }

        tracing::info!(region_id = %region.id, "created {} region {}", region.scope, region.name);
        Ok(region)
    }

    /// Gets a region by id.
    pub async fn get(&self, id: &str) -> MonoplaneResult<Region> {
        db::get_region(&self.pool, id)
            .await?
            .ok_or_else(|| MonoplaneError::not_found("region", id))
    }

    /// Gets a region by name within the owner's scope.
    pub async fn find_by_name(
        &self,
        name: &str,
        owner: Option<&str>,
    ) -> MonoplaneResult<Option<Region>> {
        db::find_region_by_name(&self.pool, name, owner).await
    }

    /// Lists every region.
    pub async fn list(&self) -> MonoplaneResult<Vec<Region>> {
        db::list_regions(&self.pool).await
    }

    /// Lists the persisted endpoints of a region.
    pub async fn endpoints(&self, region_id: &str) -> MonoplaneResult<Vec<RegionEndpoint>> {
        db::list_region_endpoints(&self.pool, region_id).await
    }

    /// Updates endpoint URLs, rotating the credential of every endpoint whose URL changes.
    ///
    /// Changed endpoints rotate in one transaction, so either all of them rotate or none do.
    /// Returns the fresh plaintext credentials. Each rotation is broadcast as
    /// [`RegionEvent::CredentialsRotated`] once committed.
    pub async fn set_endpoints(
        &self,
        region_id: &str,
        update: EndpointUpdate,
    ) -> MonoplaneResult<Vec<RotatedCredential>> {
        self.get(region_id).await?;

        for (kind, url) in update.entries() {
            Url::parse(url).map_err(|e| {
                MonoplaneError::Validation(format!("invalid {kind} url {url:?}: {e}"))
            })?;
        }

        let mut tx = self.pool.begin().await?;
        let mut rotated = Vec::new();
        for (kind, url) in update.entries() {
            if let Some(credential) = Self::rotate(&mut tx, region_id, kind, url).await? {
                rotated.push(credential);
            }
        }
        tx.commit().await?;

        for credential in &rotated {
            tracing::info!(
                region_id = %region_id,
                "rotated {} credential to version {}",
                credential.endpoint,
                credential.version
            );
            let _ = self.events.send(RegionEvent::CredentialsRotated {
                region_id: region_id.to_string(),
                endpoint: credential.endpoint,
                version: credential.version,
                url: credential.url.clone(),
                secret: credential.secret.clone(),
            });
        }

        Ok(rotated)
    }

    /// Reads the current URL and credential version of an endpoint.
    pub async fn endpoint(
        &self,
        region_id: &str,
        kind: EndpointKind,
    ) -> MonoplaneResult<Option<EndpointCredential>> {
        Ok(db::get_region_endpoint(&self.pool, region_id, kind)
            .await?
            .map(|endpoint| EndpointCredential {
                url: endpoint.url,
                version: endpoint.credential_version,
            }))
    }

    /// Whether `secret` is the current credential of the endpoint at `url`.
    pub async fn verify_credential(
        &self,
        region_id: &str,
        kind: EndpointKind,
        url: &str,
        secret: &str,
    ) -> MonoplaneResult<bool> {
        let Some(endpoint) = db::get_region_endpoint(&self.pool, region_id, kind).await? else {
            return Ok(false);
        };

        Ok(endpoint.url == url && endpoint.credential_hash == hash_secret(secret))
    }

    /// Subscribes to region events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegionEvent> {
        self.events.subscribe()
    }

    /// Deletes a region. Fails while any runner still belongs to it.
    pub async fn delete(&self, id: &str) -> MonoplaneResult<()> {
        self.get(id).await?;

        let runners = db::count_runners_in_region(&self.pool, id).await?;
        if runners > 0 {
            return Err(MonoplaneError::Precondition(format!(
                "region {id} still has {runners} runner(s)"
            )));
        }

        db::delete_region(&self.pool, id).await?;
        let _ = self.events.send(RegionEvent::Deleted {
            region_id: id.to_string(),
        });

        tracing::info!(region_id = %id, "deleted region");
        Ok(())
    }

    async fn rotate(
        conn: &mut SqliteConnection,
        region_id: &str,
        kind: EndpointKind,
        url: &str,
    ) -> MonoplaneResult<Option<RotatedCredential>> {
        let current = db::get_region_endpoint(&mut *conn, region_id, kind).await?;
        if current.as_ref().is_some_and(|endpoint| endpoint.url == url) {
            return Ok(None);
        }

        let secret = Secret::generate();
        let now = Utc::now();
        let version = match current {
            None => {
                let endpoint = RegionEndpoint {
                    region_id: region_id.to_string(),
                    kind,
                    url: url.to_string(),
                    credential_version: 1,
                    credential_hash: secret.hash(),
                    rotated_at: now,
                };

                match db::insert_region_endpoint(&mut *conn, &endpoint).await {
                    Ok(()) => 1,
                    Err(e) if e.is_unique_violation() => {
                        return Err(MonoplaneError::Conflict(format!(
                            "{kind} endpoint of region {region_id} was set concurrently"
                        )))
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(endpoint) => {
                let swapped = db::rotate_region_endpoint(
                    &mut *conn,
                    region_id,
                    kind,
                    endpoint.credential_version,
                    url,
                    &secret.hash(),
                    now,
                )
                .await?;

                if !swapped {
                    return Err(MonoplaneError::Conflict(format!(
                        "{kind} credential of region {region_id} was rotated concurrently"
                    )));
                }

                endpoint.credential_version + 1
            }
        };

        Ok(Some(RotatedCredential {
            endpoint: kind,
            url: url.to_string(),
            version,
            secret,
        }))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::{init_db, CONTROL_DB_MIGRATOR};

    async fn registry(dir: &tempfile::TempDir) -> anyhow::Result<RegionRegistry> {
        let pool = init_db(dir.path().join("control.db"), &CONTROL_DB_MIGRATOR).await?;
        Ok(RegionRegistry::new(pool))
    }

    #[test_log::test(tokio::test)]
    async fn test_region_create_validates_input() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let regions = registry(&dir).await?;

        let err = regions
            .create(NewRegion::builder().name("x").build(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Validation(_)));

        let err = regions
            .create(NewRegion::builder().name("eu").build(), Some("acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Validation(_)));

        let err = regions
            .create(
                NewRegion::builder()
                    .name("eu")
                    .scope(RegionScope::Custom)
                    .build(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Validation(_)));

        assert!(regions.list().await?.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_region_name_conflicts_within_owner_scope() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let regions = registry(&dir).await?;

        regions
            .create(NewRegion::builder().id("eu").name("eu").build(), None)
            .await?;
        let err = regions
            .create(NewRegion::builder().name("eu").build(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Conflict(_)));

        let custom = regions
            .create(
                NewRegion::builder()
                    .name("eu")
                    .scope(RegionScope::Custom)
                    .build(),
                Some("acme"),
            )
            .await?;
        assert_eq!(custom.owner.as_deref(), Some("acme"));
        assert_eq!(
            regions.find_by_name("eu", Some("acme")).await?.map(|r| r.id),
            Some(custom.id)
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_region_unchanged_endpoint_does_not_rotate() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let regions = registry(&dir).await?;
        regions
            .create(NewRegion::builder().id("eu").name("eu").build(), None)
            .await?;

        let update = EndpointUpdate::builder()
            .proxy_url("https://proxy.eu.example.com")
            .build();
        assert_eq!(regions.set_endpoints("eu", update.clone()).await?.len(), 1);
        assert!(regions.set_endpoints("eu", update).await?.is_empty());

        let credential = regions.endpoint("eu", EndpointKind::Proxy).await?.unwrap();
        assert_eq!(credential.version, 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_region_failed_endpoint_update_rotates_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let regions = registry(&dir).await?;
        regions
            .create(NewRegion::builder().id("eu").name("eu").build(), None)
            .await?;

        sqlx::query(
            "CREATE TRIGGER block_ssh_gateway BEFORE INSERT ON region_endpoints \
             WHEN NEW.kind = 'ssh_gateway' BEGIN SELECT RAISE(ABORT, 'blocked'); END",
        )
        .execute(&regions.pool)
        .await?;

        let mut events = regions.subscribe();
        let update = EndpointUpdate::builder()
            .proxy_url("https://proxy.eu.example.com")
            .ssh_gateway_url("ssh://gateway.eu.example.com:2222")
            .build();
        assert!(regions.set_endpoints("eu", update.clone()).await.is_err());

        assert!(regions.endpoint("eu", EndpointKind::Proxy).await?.is_none());
        assert!(events.try_recv().is_err());

        sqlx::query("DROP TRIGGER block_ssh_gateway")
            .execute(&regions.pool)
            .await?;

        let rotated = regions.set_endpoints("eu", update).await?;
        assert_eq!(rotated.len(), 2);
        for credential in &rotated {
            match events.try_recv()? {
                RegionEvent::CredentialsRotated {
                    endpoint, version, ..
                } => {
                    assert_eq!(endpoint, credential.endpoint);
                    assert_eq!(version, 1);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_region_rejects_bad_endpoint_url() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let regions = registry(&dir).await?;
        regions
            .create(NewRegion::builder().id("eu").name("eu").build(), None)
            .await?;

        let err = regions
            .set_endpoints(
                "eu",
                EndpointUpdate::builder().ssh_gateway_url("not a url").build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonoplaneError::Validation(_)));
        assert!(regions.endpoints("eu").await?.is_empty());

        Ok(())
    }
}
