use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Executor, Pool, Row, Sqlite};

use crate::{
    models::{Resources, Sandbox, SandboxState},
    MonoplaneResult,
};

use super::{parse_column, release_runner_capacity, reserve_runner_capacity};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// SQL predicate matching sandboxes that hold a current runner.
const PLACED_PREDICATE: &str = "state NOT IN ('destroyed', 'archived')";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Filters for [`list_sandboxes`]. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct SandboxFilter {
    /// Only sandboxes of this tenant.
    pub tenant_id: Option<String>,

    /// Only sandboxes in this region.
    pub region_id: Option<String>,

    /// Only sandboxes currently on this runner.
    pub runner_id: Option<String>,

    /// Only sandboxes in this state.
    pub state: Option<SandboxState>,

    /// Include destroyed sandboxes.
    pub include_destroyed: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Inserts a sandbox row.
pub async fn insert_sandbox<'c, E>(executor: E, sandbox: &Sandbox) -> MonoplaneResult<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO sandboxes (
            id, tenant_id, region_id, runner_id, prev_runner_id, snapshot_id,
            cpu, memory, disk, state, desired_state, capacity_reserved,
            backup_image, backup_registry_id, last_backup_at, error_reason,
            created_at, modified_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&sandbox.id)
    .bind(&sandbox.tenant_id)
    .bind(&sandbox.region_id)
    .bind(&sandbox.runner_id)
    .bind(&sandbox.prev_runner_id)
    .bind(&sandbox.snapshot_id)
    .bind(sandbox.resources.cpu)
    .bind(sandbox.resources.memory)
    .bind(sandbox.resources.disk)
    .bind(sandbox.state.as_str())
    .bind(sandbox.desired_state.as_str())
    .bind(sandbox.capacity_reserved)
    .bind(&sandbox.backup_image)
    .bind(&sandbox.backup_registry_id)
    .bind(sandbox.last_backup_at)
    .bind(&sandbox.error_reason)
    .bind(sandbox.created_at)
    .bind(sandbox.modified_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Reserves capacity on the sandbox's runner and inserts the sandbox in one transaction.
///
/// Returns `false` without writing anything when the reservation loses its compare-and-swap.
pub async fn insert_sandbox_with_reservation(
    pool: &Pool<Sqlite>,
    sandbox: &Sandbox,
    expected_capacity_version: i64,
) -> MonoplaneResult<bool> {
    let Some(runner_id) = sandbox.runner_id.as_deref() else {
        insert_sandbox(pool, sandbox).await?;
        return Ok(true);
    };

    let mut tx = pool.begin().await?;
    if !reserve_runner_capacity(
        &mut *tx,
        runner_id,
        expected_capacity_version,
        &sandbox.resources,
    )
    .await?
    {
        tx.rollback().await?;
        return Ok(false);
    }

    insert_sandbox(&mut *tx, sandbox).await?;
    tx.commit().await?;

    Ok(true)
}

/// Reserves capacity on `runner_id` and makes it the sandbox's current runner, in one
/// transaction.
///
/// Returns `false` without writing anything when the reservation loses its compare-and-swap.
pub async fn assign_sandbox_runner(
    pool: &Pool<Sqlite>,
    sandbox: &Sandbox,
    runner_id: &str,
    expected_capacity_version: i64,
) -> MonoplaneResult<bool> {
    let mut tx = pool.begin().await?;
    if !reserve_runner_capacity(
        &mut *tx,
        runner_id,
        expected_capacity_version,
        &sandbox.resources,
    )
    .await?
    {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE sandboxes
        SET runner_id = ?, prev_runner_id = ?, state = ?, desired_state = ?,
            capacity_reserved = 1, error_reason = NULL, modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(runner_id)
    .bind(&sandbox.prev_runner_id)
    .bind(sandbox.state.as_str())
    .bind(sandbox.desired_state.as_str())
    .bind(Utc::now())
    .bind(&sandbox.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Releases the reservation a sandbox holds on `runner_id`, at most once.
///
/// Returns whether capacity was actually returned to the runner.
pub async fn release_sandbox_reservation(
    pool: &Pool<Sqlite>,
    sandbox_id: &str,
    runner_id: &str,
    resources: &Resources,
) -> MonoplaneResult<bool> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        r#"
        UPDATE sandboxes
        SET capacity_reserved = 0, modified_at = ?
        WHERE id = ? AND runner_id = ? AND capacity_reserved = 1
        "#,
    )
    .bind(Utc::now())
    .bind(sandbox_id)
    .bind(runner_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    release_runner_capacity(&mut *tx, runner_id, resources).await?;
    tx.commit().await?;

    Ok(true)
}

/// Writes every mutable column of a sandbox except the reservation flag.
pub async fn update_sandbox(pool: &Pool<Sqlite>, sandbox: &Sandbox) -> MonoplaneResult<()> {
    sqlx::query(
        r#"
        UPDATE sandboxes
        SET runner_id = ?, prev_runner_id = ?, state = ?, desired_state = ?,
            backup_image = ?, backup_registry_id = ?, last_backup_at = ?, error_reason = ?,
            modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&sandbox.runner_id)
    .bind(&sandbox.prev_runner_id)
    .bind(sandbox.state.as_str())
    .bind(sandbox.desired_state.as_str())
    .bind(&sandbox.backup_image)
    .bind(&sandbox.backup_registry_id)
    .bind(sandbox.last_backup_at)
    .bind(&sandbox.error_reason)
    .bind(sandbox.modified_at)
    .bind(&sandbox.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Gets a sandbox by id.
pub async fn get_sandbox(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<Option<Sandbox>> {
    let row = sqlx::query("SELECT * FROM sandboxes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(sandbox_from_row).transpose()
}

/// Lists sandboxes matching `filter`, oldest first.
pub async fn list_sandboxes(
    pool: &Pool<Sqlite>,
    filter: &SandboxFilter,
) -> MonoplaneResult<Vec<Sandbox>> {
    let mut sql = String::from("SELECT * FROM sandboxes WHERE 1 = 1");
    let mut binds: Vec<&str> = Vec::new();

    if let Some(tenant_id) = &filter.tenant_id {
        sql.push_str(" AND tenant_id = ?");
        binds.push(tenant_id);
    }
    if let Some(region_id) = &filter.region_id {
        sql.push_str(" AND region_id = ?");
        binds.push(region_id);
    }
    if let Some(runner_id) = &filter.runner_id {
        sql.push_str(" AND runner_id = ?");
        binds.push(runner_id);
    }
    if let Some(state) = &filter.state {
        sql.push_str(" AND state = ?");
        binds.push(state.as_str());
    } else if !filter.include_destroyed {
        sql.push_str(" AND state != 'destroyed'");
    }
    sql.push_str(" ORDER BY created_at, id");

    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = query.bind(bind);
    }

    let rows = query.fetch_all(pool).await?;
    rows.iter().map(sandbox_from_row).collect()
}

/// Lists the placed sandboxes whose current runner is `runner_id`.
pub async fn list_placed_sandboxes_on_runner(
    pool: &Pool<Sqlite>,
    runner_id: &str,
) -> MonoplaneResult<Vec<Sandbox>> {
    let sql = format!(
        "SELECT * FROM sandboxes WHERE runner_id = ? AND {PLACED_PREDICATE} ORDER BY created_at, id"
    );
    let rows = sqlx::query(&sql).bind(runner_id).fetch_all(pool).await?;

    rows.iter().map(sandbox_from_row).collect()
}

/// Counts non-destroyed sandboxes that still reference `runner_id` as current runner.
pub async fn count_live_sandboxes_on_runner(
    pool: &Pool<Sqlite>,
    runner_id: &str,
) -> MonoplaneResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS count FROM sandboxes WHERE runner_id = ? AND state != 'destroyed'",
    )
    .bind(runner_id)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get("count")?)
}

/// Counts placed sandboxes created from `snapshot_id`.
pub async fn count_placed_sandboxes_for_snapshot(
    pool: &Pool<Sqlite>,
    snapshot_id: &str,
) -> MonoplaneResult<i64> {
    let sql =
        format!("SELECT COUNT(*) AS count FROM sandboxes WHERE snapshot_id = ? AND {PLACED_PREDICATE}");
    let row = sqlx::query(&sql).bind(snapshot_id).fetch_one(pool).await?;

    Ok(row.try_get("count")?)
}

fn sandbox_from_row(row: &SqliteRow) -> MonoplaneResult<Sandbox> {
    Ok(Sandbox {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        region_id: row.try_get("region_id")?,
        runner_id: row.try_get("runner_id")?,
        prev_runner_id: row.try_get("prev_runner_id")?,
        snapshot_id: row.try_get("snapshot_id")?,
        resources: Resources::new(
            row.try_get("cpu")?,
            row.try_get("memory")?,
            row.try_get("disk")?,
        ),
        state: parse_column(row, "state")?,
        desired_state: parse_column(row, "desired_state")?,
        capacity_reserved: row.try_get("capacity_reserved")?,
        backup_image: row.try_get("backup_image")?,
        backup_registry_id: row.try_get("backup_registry_id")?,
        last_backup_at: row.try_get("last_backup_at")?,
        error_reason: row.try_get("error_reason")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}
