use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};

use crate::{
    models::{Resources, Snapshot, SnapshotRegion, SnapshotState},
    MonoplaneResult,
};

use super::parse_column;

//--------------------------------------------------------------------------------------------------
// Functions: Snapshots
//--------------------------------------------------------------------------------------------------

/// Inserts a snapshot.
pub async fn insert_snapshot(pool: &Pool<Sqlite>, snapshot: &Snapshot) -> MonoplaneResult<()> {
    sqlx::query(
        r#"
        INSERT INTO snapshots (
            id, tenant_id, name, image_name, build_context, internal_name,
            state, error_reason, cpu, memory, disk, hidden,
            build_region_id, registry_id, created_at, modified_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.tenant_id)
    .bind(&snapshot.name)
    .bind(&snapshot.image_name)
    .bind(&snapshot.build_context)
    .bind(&snapshot.internal_name)
    .bind(snapshot.state.as_str())
    .bind(&snapshot.error_reason)
    .bind(snapshot.footprint.cpu)
    .bind(snapshot.footprint.memory)
    .bind(snapshot.footprint.disk)
    .bind(snapshot.hidden)
    .bind(&snapshot.build_region_id)
    .bind(&snapshot.registry_id)
    .bind(snapshot.created_at)
    .bind(snapshot.modified_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Gets a snapshot by id.
pub async fn get_snapshot(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<Option<Snapshot>> {
    let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(snapshot_from_row).transpose()
}

/// Gets a snapshot by name within a tenant. `None` looks among platform-wide snapshots.
pub async fn find_snapshot_by_name(
    pool: &Pool<Sqlite>,
    tenant_id: Option<&str>,
    name: &str,
) -> MonoplaneResult<Option<Snapshot>> {
    let row = sqlx::query("SELECT * FROM snapshots WHERE COALESCE(tenant_id, '') = ? AND name = ?")
        .bind(tenant_id.unwrap_or(""))
        .bind(name)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(snapshot_from_row).transpose()
}

/// Lists the snapshots visible to a tenant: its own plus the platform-wide ones.
///
/// Hidden snapshots are only included when `include_hidden` is set.
pub async fn list_snapshots(
    pool: &Pool<Sqlite>,
    tenant_id: Option<&str>,
    include_hidden: bool,
) -> MonoplaneResult<Vec<Snapshot>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM snapshots
        WHERE (tenant_id IS NULL OR tenant_id = ?)
          AND (? OR hidden = 0)
        ORDER BY name, id
        "#,
    )
    .bind(tenant_id)
    .bind(include_hidden)
    .fetch_all(pool)
    .await?;

    rows.iter().map(snapshot_from_row).collect()
}

/// Moves a snapshot to `building` if it is `pending` or `error`. Returns whether it moved.
pub async fn begin_snapshot_build(
    pool: &Pool<Sqlite>,
    id: &str,
    build_region_id: &str,
    registry_id: &str,
) -> MonoplaneResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE snapshots
        SET state = 'building', error_reason = NULL, build_region_id = ?, registry_id = ?, modified_at = ?
        WHERE id = ? AND state IN ('pending', 'error')
        "#,
    )
    .bind(build_region_id)
    .bind(registry_id)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Records the outcome of a snapshot build.
pub async fn finish_snapshot_build(
    pool: &Pool<Sqlite>,
    id: &str,
    state: SnapshotState,
    internal_name: Option<&str>,
    error_reason: Option<&str>,
) -> MonoplaneResult<()> {
    sqlx::query(
        r#"
        UPDATE snapshots
        SET state = ?, internal_name = COALESCE(?, internal_name), error_reason = ?, modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(state.as_str())
    .bind(internal_name)
    .bind(error_reason)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Sets the visibility flag of a snapshot. Returns whether a row changed.
pub async fn set_snapshot_hidden(
    pool: &Pool<Sqlite>,
    id: &str,
    hidden: bool,
) -> MonoplaneResult<bool> {
    let result = sqlx::query("UPDATE snapshots SET hidden = ?, modified_at = ? WHERE id = ?")
        .bind(hidden)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Deletes a snapshot and its region rows.
pub async fn delete_snapshot(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM snapshot_regions WHERE snapshot_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(result.rows_affected() == 1)
}

fn snapshot_from_row(row: &SqliteRow) -> MonoplaneResult<Snapshot> {
    Ok(Snapshot {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        image_name: row.try_get("image_name")?,
        build_context: row.try_get("build_context")?,
        internal_name: row.try_get("internal_name")?,
        state: parse_column(row, "state")?,
        error_reason: row.try_get("error_reason")?,
        footprint: Resources::new(
            row.try_get("cpu")?,
            row.try_get("memory")?,
            row.try_get("disk")?,
        ),
        hidden: row.try_get("hidden")?,
        build_region_id: row.try_get("build_region_id")?,
        registry_id: row.try_get("registry_id")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: Snapshot regions
//--------------------------------------------------------------------------------------------------

/// Records that a snapshot is available in a region. Returns `false` if it already was.
pub async fn insert_snapshot_region(
    pool: &Pool<Sqlite>,
    snapshot_id: &str,
    region_id: &str,
    available_at: DateTime<Utc>,
) -> MonoplaneResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO snapshot_regions (snapshot_id, region_id, available_at)
        VALUES (?, ?, ?)
        ON CONFLICT (snapshot_id, region_id) DO NOTHING
        "#,
    )
    .bind(snapshot_id)
    .bind(region_id)
    .bind(available_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Gets the availability row of a snapshot in a region.
pub async fn get_snapshot_region(
    pool: &Pool<Sqlite>,
    snapshot_id: &str,
    region_id: &str,
) -> MonoplaneResult<Option<SnapshotRegion>> {
    let row = sqlx::query("SELECT * FROM snapshot_regions WHERE snapshot_id = ? AND region_id = ?")
        .bind(snapshot_id)
        .bind(region_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(snapshot_region_from_row).transpose()
}

/// Lists the regions a snapshot is available in.
pub async fn list_snapshot_regions(
    pool: &Pool<Sqlite>,
    snapshot_id: &str,
) -> MonoplaneResult<Vec<SnapshotRegion>> {
    let rows =
        sqlx::query("SELECT * FROM snapshot_regions WHERE snapshot_id = ? ORDER BY region_id")
            .bind(snapshot_id)
            .fetch_all(pool)
            .await?;

    rows.iter().map(snapshot_region_from_row).collect()
}

fn snapshot_region_from_row(row: &SqliteRow) -> MonoplaneResult<SnapshotRegion> {
    Ok(SnapshotRegion {
        snapshot_id: row.try_get("snapshot_id")?,
        region_id: row.try_get("region_id")?,
        available_at: row.try_get("available_at")?,
    })
}
