use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Executor, Pool, Row, Sqlite};

use crate::{
    models::{EndpointKind, Region, RegionEndpoint},
    MonoplaneResult,
};

use super::parse_column;

//--------------------------------------------------------------------------------------------------
// Functions: Regions
//--------------------------------------------------------------------------------------------------

/// Inserts a region.
pub async fn insert_region(pool: &Pool<Sqlite>, region: &Region) -> MonoplaneResult<()> {
    sqlx::query(
        r#"
        INSERT INTO regions (id, name, scope, owner, enforce_quotas, created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&region.id)
    .bind(&region.name)
    .bind(region.scope.as_str())
    .bind(&region.owner)
    .bind(region.enforce_quotas)
    .bind(region.created_at)
    .bind(region.modified_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Gets a region by id.
pub async fn get_region(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<Option<Region>> {
    let row = sqlx::query("SELECT * FROM regions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(region_from_row).transpose()
}

/// Gets a region by name within the owner's scope. `None` looks among ownerless regions.
pub async fn find_region_by_name(
    pool: &Pool<Sqlite>,
    name: &str,
    owner: Option<&str>,
) -> MonoplaneResult<Option<Region>> {
    let row = sqlx::query("SELECT * FROM regions WHERE COALESCE(owner, '') = ? AND name = ?")
        .bind(owner.unwrap_or(""))
        .bind(name)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(region_from_row).transpose()
}

/// Lists every region ordered by id.
pub async fn list_regions(pool: &Pool<Sqlite>) -> MonoplaneResult<Vec<Region>> {
    let rows = sqlx::query("SELECT * FROM regions ORDER BY id")
        .fetch_all(pool)
        .await?;

    rows.iter().map(region_from_row).collect()
}

/// Deletes a region and its endpoints. Returns whether a row was removed.
pub async fn delete_region(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<bool> {
    let result = sqlx::query("DELETE FROM regions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

fn region_from_row(row: &SqliteRow) -> MonoplaneResult<Region> {
    Ok(Region {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        scope: parse_column(row, "scope")?,
        owner: row.try_get("owner")?,
        enforce_quotas: row.try_get("enforce_quotas")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: Endpoints
//--------------------------------------------------------------------------------------------------

/// Gets one endpoint of a region.
pub async fn get_region_endpoint<'c, E>(
    executor: E,
    region_id: &str,
    kind: EndpointKind,
) -> MonoplaneResult<Option<RegionEndpoint>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM region_endpoints WHERE region_id = ? AND kind = ?")
        .bind(region_id)
        .bind(kind.as_str())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(endpoint_from_row).transpose()
}

/// Lists the endpoints of a region.
pub async fn list_region_endpoints(
    pool: &Pool<Sqlite>,
    region_id: &str,
) -> MonoplaneResult<Vec<RegionEndpoint>> {
    let rows = sqlx::query("SELECT * FROM region_endpoints WHERE region_id = ? ORDER BY kind")
        .bind(region_id)
        .fetch_all(pool)
        .await?;

    rows.iter().map(endpoint_from_row).collect()
}

/// Inserts the first credential of an endpoint.
///
/// Fails with a unique violation when a concurrent writer created it first.
pub async fn insert_region_endpoint<'c, E>(
    executor: E,
    endpoint: &RegionEndpoint,
) -> MonoplaneResult<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO region_endpoints (region_id, kind, url, credential_version, credential_hash, rotated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&endpoint.region_id)
    .bind(endpoint.kind.as_str())
    .bind(&endpoint.url)
    .bind(endpoint.credential_version)
    .bind(&endpoint.credential_hash)
    .bind(endpoint.rotated_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Replaces the URL and credential of an endpoint if its version is still `expected_version`.
///
/// Returns whether the swap happened. The new version is `expected_version + 1`.
pub async fn rotate_region_endpoint<'c, E>(
    executor: E,
    region_id: &str,
    kind: EndpointKind,
    expected_version: i64,
    url: &str,
    credential_hash: &str,
    rotated_at: DateTime<Utc>,
) -> MonoplaneResult<bool>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE region_endpoints
        SET url = ?, credential_hash = ?, credential_version = credential_version + 1, rotated_at = ?
        WHERE region_id = ? AND kind = ? AND credential_version = ?
        "#,
    )
    .bind(url)
    .bind(credential_hash)
    .bind(rotated_at)
    .bind(region_id)
    .bind(kind.as_str())
    .bind(expected_version)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

fn endpoint_from_row(row: &SqliteRow) -> MonoplaneResult<RegionEndpoint> {
    Ok(RegionEndpoint {
        region_id: row.try_get("region_id")?,
        kind: parse_column(row, "kind")?,
        url: row.try_get("url")?,
        credential_version: row.try_get("credential_version")?,
        credential_hash: row.try_get("credential_hash")?,
        rotated_at: row.try_get("rotated_at")?,
    })
}
