use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Executor, Pool, Row, Sqlite};

use crate::{
    models::{Resources, Runner, RunnerState},
    MonoplaneResult,
};

use super::parse_column;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Inserts a runner.
pub async fn insert_runner(pool: &Pool<Sqlite>, runner: &Runner) -> MonoplaneResult<()> {
    sqlx::query(
        r#"
        INSERT INTO runners (
            id, region_id, api_url, api_key, api_version,
            cpu, memory, disk,
            allocated_cpu, allocated_memory, allocated_disk, capacity_version,
            state, consecutive_failures, last_checked_at, unresponsive_since,
            region_credential_version, created_at, modified_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&runner.id)
    .bind(&runner.region_id)
    .bind(&runner.api_url)
    .bind(&runner.api_key)
    .bind(runner.api_version.as_str())
    .bind(runner.capacity.cpu)
    .bind(runner.capacity.memory)
    .bind(runner.capacity.disk)
    .bind(runner.allocated.cpu)
    .bind(runner.allocated.memory)
    .bind(runner.allocated.disk)
    .bind(runner.capacity_version)
    .bind(runner.state.as_str())
    .bind(runner.consecutive_failures)
    .bind(runner.last_checked_at)
    .bind(runner.unresponsive_since)
    .bind(runner.region_credential_version)
    .bind(runner.created_at)
    .bind(runner.modified_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Gets a runner by id.
pub async fn get_runner(pool: &Pool<Sqlite>, id: &str) -> MonoplaneResult<Option<Runner>> {
    let row = sqlx::query("SELECT * FROM runners WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(runner_from_row).transpose()
}

/// Lists runners ordered by id, optionally restricted to one region.
pub async fn list_runners(
    pool: &Pool<Sqlite>,
    region_id: Option<&str>,
) -> MonoplaneResult<Vec<Runner>> {
    let rows = match region_id {
        Some(region_id) => {
            sqlx::query("SELECT * FROM runners WHERE region_id = ? ORDER BY id")
                .bind(region_id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM runners ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter().map(runner_from_row).collect()
}

/// Lists the runners of a region that are in `state`, ordered by id.
pub async fn list_runners_in_state(
    pool: &Pool<Sqlite>,
    region_id: &str,
    state: RunnerState,
) -> MonoplaneResult<Vec<Runner>> {
    let rows = sqlx::query("SELECT * FROM runners WHERE region_id = ? AND state = ? ORDER BY id")
        .bind(region_id)
        .bind(state.as_str())
        .fetch_all(pool)
        .await?;

    rows.iter().map(runner_from_row).collect()
}

/// Counts the runners that belong to a region.
pub async fn count_runners_in_region(pool: &Pool<Sqlite>, region_id: &str) -> MonoplaneResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS count FROM runners WHERE region_id = ?")
        .bind(region_id)
        .fetch_one(pool)
        .await?;

    Ok(row.try_get("count")?)
}

/// Records the outcome of a health check.
pub async fn update_runner_health(
    pool: &Pool<Sqlite>,
    id: &str,
    state: RunnerState,
    consecutive_failures: i64,
    last_checked_at: DateTime<Utc>,
    unresponsive_since: Option<DateTime<Utc>>,
) -> MonoplaneResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runners
        SET state = ?, consecutive_failures = ?, last_checked_at = ?, unresponsive_since = ?, modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(state.as_str())
    .bind(consecutive_failures)
    .bind(last_checked_at)
    .bind(unresponsive_since)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Moves a runner to `state` if it is currently in one of `from`.
///
/// Resets the failure counter and the unresponsive timestamp. Returns whether a row changed.
pub async fn transition_runner_state(
    pool: &Pool<Sqlite>,
    id: &str,
    from: &[RunnerState],
    state: RunnerState,
) -> MonoplaneResult<bool> {
    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        r#"
        UPDATE runners
        SET state = ?, consecutive_failures = 0, unresponsive_since = NULL, modified_at = ?
        WHERE id = ? AND state IN ({placeholders})
        "#
    );

    let mut query = sqlx::query(&sql)
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(id);
    for from in from {
        query = query.bind(from.as_str());
    }

    Ok(query.execute(pool).await?.rows_affected() == 1)
}

/// Reserves `resources` on a ready runner if its capacity version is still `expected_version`
/// and the reservation still fits.
///
/// Returns whether the reservation was taken. Bumps the capacity version on success.
pub async fn reserve_runner_capacity<'c, E>(
    executor: E,
    runner_id: &str,
    expected_version: i64,
    resources: &Resources,
) -> MonoplaneResult<bool>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE runners
        SET allocated_cpu = allocated_cpu + ?1,
            allocated_memory = allocated_memory + ?2,
            allocated_disk = allocated_disk + ?3,
            capacity_version = capacity_version + 1,
            modified_at = ?4
        WHERE id = ?5
          AND capacity_version = ?6
          AND state = 'ready'
          AND allocated_cpu + ?1 <= cpu
          AND allocated_memory + ?2 <= memory
          AND allocated_disk + ?3 <= disk
        "#,
    )
    .bind(resources.cpu)
    .bind(resources.memory)
    .bind(resources.disk)
    .bind(Utc::now())
    .bind(runner_id)
    .bind(expected_version)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Returns `resources` to a runner. Allocation never drops below zero.
pub async fn release_runner_capacity<'c, E>(
    executor: E,
    runner_id: &str,
    resources: &Resources,
) -> MonoplaneResult<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE runners
        SET allocated_cpu = MAX(allocated_cpu - ?, 0),
            allocated_memory = MAX(allocated_memory - ?, 0),
            allocated_disk = MAX(allocated_disk - ?, 0),
            capacity_version = capacity_version + 1,
            modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(resources.cpu)
    .bind(resources.memory)
    .bind(resources.disk)
    .bind(Utc::now())
    .bind(runner_id)
    .execute(executor)
    .await?;

    Ok(())
}

fn runner_from_row(row: &SqliteRow) -> MonoplaneResult<Runner> {
    Ok(Runner {
        id: row.try_get("id")?,
        region_id: row.try_get("region_id")?,
        api_url: row.try_get("api_url")?,
        api_key: row.try_get("api_key")?,
        api_version: parse_column(row, "api_version")?,
        capacity: Resources::new(
            row.try_get("cpu")?,
            row.try_get("memory")?,
            row.try_get("disk")?,
        ),
        allocated: Resources::new(
            row.try_get("allocated_cpu")?,
            row.try_get("allocated_memory")?,
            row.try_get("allocated_disk")?,
        ),
        capacity_version: row.try_get("capacity_version")?,
        state: parse_column(row, "state")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        last_checked_at: row.try_get("last_checked_at")?,
        unresponsive_since: row.try_get("unresponsive_since")?,
        region_credential_version: row.try_get("region_credential_version")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}
