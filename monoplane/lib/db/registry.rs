use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};

use crate::{
    models::{DockerRegistry, RegistryType},
    MonoplaneResult,
};

use super::parse_column;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Inserts a registry.
pub async fn insert_registry(pool: &Pool<Sqlite>, registry: &DockerRegistry) -> MonoplaneResult<()> {
    sqlx::query(
        r#"
        INSERT INTO docker_registries (
            id, name, url, project, username, password, registry_type,
            tenant_id, region_id, is_fallback, created_at, modified_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&registry.id)
    .bind(&registry.name)
    .bind(&registry.url)
    .bind(&registry.project)
    .bind(&registry.username)
    .bind(&registry.password)
    .bind(registry.registry_type.as_str())
    .bind(&registry.tenant_id)
    .bind(&registry.region_id)
    .bind(registry.is_fallback)
    .bind(registry.created_at)
    .bind(registry.modified_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Gets a registry by id.
pub async fn get_registry(
    pool: &Pool<Sqlite>,
    id: &str,
) -> MonoplaneResult<Option<DockerRegistry>> {
    let row = sqlx::query("SELECT * FROM docker_registries WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(registry_from_row).transpose()
}

/// Lists registries, optionally restricted to one role.
pub async fn list_registries(
    pool: &Pool<Sqlite>,
    registry_type: Option<RegistryType>,
) -> MonoplaneResult<Vec<DockerRegistry>> {
    let rows = match registry_type {
        Some(registry_type) => {
            sqlx::query("SELECT * FROM docker_registries WHERE registry_type = ? ORDER BY id")
                .bind(registry_type.as_str())
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM docker_registries ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter().map(registry_from_row).collect()
}

/// Finds the registry of a role owned by a tenant.
pub async fn find_tenant_registry(
    pool: &Pool<Sqlite>,
    registry_type: RegistryType,
    tenant_id: &str,
) -> MonoplaneResult<Option<DockerRegistry>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM docker_registries
        WHERE registry_type = ? AND tenant_id = ?
        ORDER BY created_at, id
        LIMIT 1
        "#,
    )
    .bind(registry_type.as_str())
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(registry_from_row).transpose()
}

/// Finds the platform registry of a role that serves a region.
pub async fn find_region_registry(
    pool: &Pool<Sqlite>,
    registry_type: RegistryType,
    region_id: &str,
) -> MonoplaneResult<Option<DockerRegistry>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM docker_registries
        WHERE registry_type = ? AND region_id = ? AND tenant_id IS NULL
        ORDER BY created_at, id
        LIMIT 1
        "#,
    )
    .bind(registry_type.as_str())
    .bind(region_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(registry_from_row).transpose()
}

/// Finds the fallback registry of a role.
pub async fn find_fallback_registry(
    pool: &Pool<Sqlite>,
    registry_type: RegistryType,
) -> MonoplaneResult<Option<DockerRegistry>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM docker_registries
        WHERE registry_type = ? AND is_fallback = 1
        ORDER BY created_at, id
        LIMIT 1
        "#,
    )
    .bind(registry_type.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(registry_from_row).transpose()
}

/// Deletes a registry. Returns whether a row was removed.
pub async fn delete_registry(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<bool> {
    let result = sqlx::query("DELETE FROM docker_registries WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

fn registry_from_row(row: &SqliteRow) -> MonoplaneResult<DockerRegistry> {
    Ok(DockerRegistry {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        project: row.try_get("project")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        registry_type: parse_column(row, "registry_type")?,
        tenant_id: row.try_get("tenant_id")?,
        region_id: row.try_get("region_id")?,
        is_fallback: row.try_get("is_fallback")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}
