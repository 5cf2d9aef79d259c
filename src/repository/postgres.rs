//! PostgreSQL repository.
//!
//! Counter reservations are single conditional upserts. A claim locks the
//! queued row, takes the slot and flips the status in one transaction; complete,
//! fail and cancel return the slot in the same transaction as the status
//! change. A dropped call rolls back, so any number of controllers and workers
//! can share one database without leaking slots. Workflow runs are stored as
//! JSONB documents and updated under `SELECT ... FOR UPDATE`.

use super::{
    CancelledQueueItem, ConcurrencyRepository, PartitionRepository, QueueRepository,
    WorkflowRunRepository,
};
use crate::error::{TaskerError, TaskerResult};
use crate::models::{
    ClaimOutcome, ComputeClass, ControllerPartition, EnqueueOutcome, NewQueueItem, QueueItem, TenantPartition,
    WorkerCapabilities, WorkflowRun, WorkflowRunUpdate,
};
use crate::state_machine::{determine_target_state, required_states, QueueItemEvent, QueueItemStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

const QUEUE_ITEM_COLUMNS: &str = "step_run_uuid, workflow_run_uuid, tenant_id, step_id, status, \
     concurrency_key, concurrency_limit, compute, execution_timeout_secs, claimed_by, output, \
     error, queued_at, started_at, finished_at";

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Complete or fail a running item and return its slot. When the update
    /// matches nothing the current status decides the error.
    async fn finish(
        &self,
        step_run_uuid: Uuid,
        event: QueueItemEvent,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem> {
        let expected = required_states(&event);
        let target = determine_target_state(step_run_uuid, expected[0], &event)?;
        let expected: Vec<&str> = expected.iter().map(QueueItemStatus::as_str).collect();

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE queue_items \
             SET status = $2, output = COALESCE($3, output), error = COALESCE($4, error), \
                 finished_at = $5 \
             WHERE step_run_uuid = $1 AND status = ANY($6) \
             RETURNING {QUEUE_ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(step_run_uuid)
            .bind(target.as_str())
            .bind(event.output().cloned())
            .bind(event.error_message())
            .bind(now)
            .bind(&expected)
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) => {
                let item = queue_item_from_row(&row)?;
                if let Some((key, _)) = item.concurrency() {
                    release_slot(&mut tx, item.tenant_id, key).await?;
                }
                tx.commit().await?;
                Ok(item)
            }
            None => {
                tx.rollback().await?;
                let current = self
                    .get_queue_item(step_run_uuid)
                    .await?
                    .ok_or_else(|| TaskerError::NotFound(format!("queue item {step_run_uuid}")))?;
                determine_target_state(step_run_uuid, current.status, &event)?;
                Err(TaskerError::Conflict(format!(
                    "queue item {step_run_uuid} changed during '{}'",
                    event.event_type()
                )))
            }
        }
    }
}

async fn reserve_slot(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    key: &str,
    limit: u32,
) -> TaskerResult<bool> {
    if limit == 0 {
        return Ok(false);
    }
    let reserved: Option<i32> = sqlx::query_scalar(
        r#"
        INSERT INTO concurrency_slots (tenant_id, concurrency_key, in_flight)
        VALUES ($1, $2, 1)
        ON CONFLICT (tenant_id, concurrency_key) DO UPDATE
            SET in_flight = concurrency_slots.in_flight + 1
            WHERE concurrency_slots.in_flight < $3
        RETURNING in_flight
        "#,
    )
    .bind(tenant_id)
    .bind(key)
    .bind(limit as i32)
    .fetch_optional(conn)
    .await?;
    Ok(reserved.is_some())
}

async fn release_slot(conn: &mut PgConnection, tenant_id: Uuid, key: &str) -> TaskerResult<()> {
    sqlx::query(
        r#"
        UPDATE concurrency_slots
        SET in_flight = GREATEST(in_flight - 1, 0)
        WHERE tenant_id = $1 AND concurrency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(key)
    .execute(conn)
    .await?;
    Ok(())
}

fn queue_item_from_row(row: &PgRow) -> TaskerResult<QueueItem> {
    let status: String = row.try_get("status")?;
    let concurrency_limit: Option<i32> = row.try_get("concurrency_limit")?;
    let execution_timeout_secs: i64 = row.try_get("execution_timeout_secs")?;
    let compute: Json<ComputeClass> = row.try_get("compute")?;

    Ok(QueueItem {
        step_run_uuid: row.try_get("step_run_uuid")?,
        workflow_run_uuid: row.try_get("workflow_run_uuid")?,
        tenant_id: row.try_get("tenant_id")?,
        step_id: row.try_get("step_id")?,
        status: status.parse().map_err(TaskerError::DatabaseError)?,
        concurrency_key: row.try_get("concurrency_key")?,
        concurrency_limit: concurrency_limit.map(|l| l.max(0) as u32),
        compute: compute.0,
        execution_timeout_secs: execution_timeout_secs.max(0) as u64,
        claimed_by: row.try_get("claimed_by")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn queue_items_from_rows(rows: &[PgRow]) -> TaskerResult<Vec<QueueItem>> {
    rows.iter().map(queue_item_from_row).collect()
}

#[async_trait]
impl QueueRepository for PgRepository {
    async fn enqueue_step_run(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> TaskerResult<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(item.tenant_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_items
                (step_run_uuid, workflow_run_uuid, tenant_id, step_id, status,
                 concurrency_key, concurrency_limit, compute, pool, cpu_kind, regions,
                 execution_timeout_secs, queued_at)
            VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (step_run_uuid) DO NOTHING
            "#,
        )
        .bind(item.step_run_uuid)
        .bind(item.workflow_run_uuid)
        .bind(item.tenant_id)
        .bind(&item.step_id)
        .bind(&item.concurrency_key)
        .bind(item.concurrency_limit.map(|l| l as i32))
        .bind(Json(&item.compute))
        .bind(&item.compute.pool)
        .bind(item.compute.cpu_kind.as_str())
        .bind(item.compute.regions.as_list())
        .bind(item.execution_timeout_secs as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            Ok(EnqueueOutcome::AlreadyEnqueued)
        } else {
            Ok(EnqueueOutcome::Enqueued)
        }
    }

    async fn list_claim_candidates(
        &self,
        capabilities: &WorkerCapabilities,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_ITEM_COLUMNS} FROM queue_items \
             WHERE tenant_id = $1 AND status = 'queued' \
               AND pool IS NOT DISTINCT FROM $2 \
               AND cpu_kind = $3 \
               AND (regions IS NULL OR ($4::text IS NOT NULL AND $4 = ANY(regions))) \
             ORDER BY queued_at, step_run_uuid \
             LIMIT $5"
        );
        let rows = sqlx::query(&sql)
            .bind(capabilities.tenant_id)
            .bind(&capabilities.pool)
            .bind(capabilities.cpu_kind.as_str())
            .bind(&capabilities.region)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        queue_items_from_rows(&rows)
    }

    async fn claim_step_run(
        &self,
        step_run_uuid: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> TaskerResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // a row locked by another claimer is treated as lost
        let row = sqlx::query(
            r#"
            SELECT tenant_id, concurrency_key, concurrency_limit
            FROM queue_items
            WHERE step_run_uuid = $1 AND status = 'queued'
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(step_run_uuid)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Lost);
        };

        let tenant_id: Uuid = row.try_get("tenant_id")?;
        let key: Option<String> = row.try_get("concurrency_key")?;
        let limit: Option<i32> = row.try_get("concurrency_limit")?;
        if let (Some(key), Some(limit)) = (key, limit) {
            if !reserve_slot(&mut tx, tenant_id, &key, limit.max(0) as u32).await? {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Saturated);
            }
        }

        let sql = format!(
            "UPDATE queue_items SET status = 'running', started_at = $2, claimed_by = $3 \
             WHERE step_run_uuid = $1 \
             RETURNING {QUEUE_ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(step_run_uuid)
            .bind(now)
            .bind(worker_id)
            .fetch_one(&mut *tx)
            .await?;
        let item = queue_item_from_row(&row)?;
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(item))
    }

    async fn complete_step_run(
        &self,
        step_run_uuid: Uuid,
        output: Value,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem> {
        self.finish(step_run_uuid, QueueItemEvent::Complete(output), now)
            .await
    }

    async fn fail_step_run(
        &self,
        step_run_uuid: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem> {
        self.finish(step_run_uuid, QueueItemEvent::Fail(error), now)
            .await
    }

    async fn cancel_step_run(
        &self,
        step_run_uuid: Uuid,
        now: DateTime<Utc>,
    ) -> TaskerResult<Option<CancelledQueueItem>> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM queue_items WHERE step_run_uuid = $1 FOR UPDATE")
                .bind(step_run_uuid)
                .fetch_optional(&mut *tx)
                .await?;
        let previous_status: QueueItemStatus = status
            .ok_or_else(|| TaskerError::NotFound(format!("queue item {step_run_uuid}")))?
            .parse()
            .map_err(TaskerError::DatabaseError)?;
        if previous_status.is_terminal() {
            return Ok(None);
        }

        let sql = format!(
            "UPDATE queue_items SET status = 'cancelled', finished_at = $2 \
             WHERE step_run_uuid = $1 \
             RETURNING {QUEUE_ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(step_run_uuid)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let item = queue_item_from_row(&row)?;
        if previous_status == QueueItemStatus::Running {
            if let Some((key, _)) = item.concurrency() {
                release_slot(&mut tx, item.tenant_id, key).await?;
            }
        }
        tx.commit().await?;

        Ok(Some(CancelledQueueItem {
            item,
            previous_status,
        }))
    }

    async fn get_queue_item(&self, step_run_uuid: Uuid) -> TaskerResult<Option<QueueItem>> {
        let sql = format!("SELECT {QUEUE_ITEM_COLUMNS} FROM queue_items WHERE step_run_uuid = $1");
        let row = sqlx::query(&sql)
            .bind(step_run_uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn list_expired_queue_items(
        &self,
        tenant_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_ITEM_COLUMNS} FROM queue_items \
             WHERE tenant_id = $1 \
               AND status IN ('succeeded', 'failed', 'cancelled') \
               AND finished_at < $2 \
             ORDER BY finished_at, step_run_uuid \
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        queue_items_from_rows(&rows)
    }

    async fn list_timed_out_queue_items(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_ITEM_COLUMNS} FROM queue_items \
             WHERE tenant_id = $1 AND status = 'running' \
               AND started_at + execution_timeout_secs * INTERVAL '1 second' < $2 \
             ORDER BY started_at, step_run_uuid \
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        queue_items_from_rows(&rows)
    }

    async fn delete_queue_items(&self, tenant_id: Uuid, ids: &[Uuid]) -> TaskerResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE tenant_id = $1
              AND step_run_uuid = ANY($2)
              AND status IN ('succeeded', 'failed', 'cancelled')
            "#,
        )
        .bind(tenant_id)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ConcurrencyRepository for PgRepository {
    async fn try_reserve(&self, tenant_id: Uuid, key: &str, limit: u32) -> TaskerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        reserve_slot(&mut conn, tenant_id, key, limit).await
    }

    async fn release(&self, tenant_id: Uuid, key: &str) -> TaskerResult<()> {
        let mut conn = self.pool.acquire().await?;
        release_slot(&mut conn, tenant_id, key).await
    }

    async fn in_flight(&self, tenant_id: Uuid, key: &str) -> TaskerResult<u32> {
        let in_flight: Option<i32> = sqlx::query_scalar(
            "SELECT in_flight FROM concurrency_slots WHERE tenant_id = $1 AND concurrency_key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(in_flight.unwrap_or(0).max(0) as u32)
    }
}

#[async_trait]
impl PartitionRepository for PgRepository {
    async fn list_tenants_by_partition(
        &self,
        partition_id: &str,
    ) -> TaskerResult<Vec<TenantPartition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, controller_partition_id
            FROM tenants
            WHERE controller_partition_id = $1 OR controller_partition_id IS NULL
            ORDER BY id
            "#,
        )
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TenantPartition {
                    tenant_id: row.try_get("id")?,
                    partition_id: row.try_get("controller_partition_id")?,
                })
            })
            .collect()
    }

    async fn upsert_partition_heartbeat(
        &self,
        partition_id: &str,
        now: DateTime<Utc>,
    ) -> TaskerResult<ControllerPartition> {
        let row = sqlx::query(
            r#"
            INSERT INTO controller_partitions (id, last_heartbeat)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET last_heartbeat = EXCLUDED.last_heartbeat
            RETURNING id, last_heartbeat
            "#,
        )
        .bind(partition_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(ControllerPartition {
            id: row.try_get("id")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    async fn list_partitions(&self) -> TaskerResult<Vec<ControllerPartition>> {
        let rows = sqlx::query("SELECT id, last_heartbeat FROM controller_partitions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ControllerPartition {
                    id: row.try_get("id")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                })
            })
            .collect()
    }

    async fn assign_tenant(
        &self,
        tenant_id: Uuid,
        partition_id: Option<&str>,
    ) -> TaskerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, controller_partition_id)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
                SET controller_partition_id = EXCLUDED.controller_partition_id
            "#,
        )
        .bind(tenant_id)
        .bind(partition_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowRunRepository for PgRepository {
    async fn create_workflow_run(&self, run: &WorkflowRun) -> TaskerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(run.tenant_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (workflow_run_uuid, tenant_id, status, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (workflow_run_uuid) DO NOTHING
            "#,
        )
        .bind(run.workflow_run_uuid)
        .bind(run.tenant_id)
        .bind(run.status.to_string())
        .bind(Json(run))
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskerError::Conflict(format!(
                "workflow run {} already exists",
                run.workflow_run_uuid
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_run(&self, workflow_run_uuid: Uuid) -> TaskerResult<Option<WorkflowRun>> {
        let document: Option<Json<WorkflowRun>> = sqlx::query_scalar(
            "SELECT document FROM workflow_runs WHERE workflow_run_uuid = $1",
        )
        .bind(workflow_run_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(document.map(|d| d.0))
    }

    async fn apply_update(
        &self,
        workflow_run_uuid: Uuid,
        update: WorkflowRunUpdate,
        now: DateTime<Utc>,
    ) -> TaskerResult<WorkflowRun> {
        let mut tx = self.pool.begin().await?;

        let document: Option<Json<WorkflowRun>> = sqlx::query_scalar(
            "SELECT document FROM workflow_runs WHERE workflow_run_uuid = $1 FOR UPDATE",
        )
        .bind(workflow_run_uuid)
        .fetch_optional(&mut *tx)
        .await?;
        let mut run = document
            .map(|d| d.0)
            .ok_or_else(|| TaskerError::NotFound(format!("workflow run {workflow_run_uuid}")))?;

        run.apply(update, now)?;

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, document = $3, updated_at = $4
            WHERE workflow_run_uuid = $1
            "#,
        )
        .bind(workflow_run_uuid)
        .bind(run.status.to_string())
        .bind(Json(&run))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run)
    }
}
