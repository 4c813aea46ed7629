use crate::db::items::{conversion_error, parse_optional_timestamp, parse_timestamp};
use crate::db::{
    Checkpoint, MigrationMetrics, MigrationPlan, MigrationState, Operation, OperationStatus,
    OperationType,
};
use crate::error::{Result, StowageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub id: String,
    pub scan_id: String,
    pub is_what_if: bool,
    pub state: MigrationState,
    pub created_at: DateTime<Utc>,
    pub total_operations: usize,
    pub completed_operations: usize,
    pub metrics: MigrationMetrics,
}

pub trait PlanStore {
    fn save_plan(&mut self, plan: &MigrationPlan) -> Result<()>;
    fn get_plan(&self, plan_id: &str) -> Result<Option<MigrationPlan>>;
    fn list_plans(&self) -> Result<Vec<PlanSummary>>;
    /// Persist operation statuses and, when `batch_index` is given, record a
    /// checkpoint for it. Both happen in one transaction.
    fn checkpoint_batch(
        &mut self,
        plan_id: &str,
        operations: &[Operation],
        batch_index: Option<usize>,
    ) -> Result<()>;
    fn last_checkpoint(&self, plan_id: &str) -> Result<Option<Checkpoint>>;
    fn checkpoint_count(&self, plan_id: &str) -> Result<usize>;
    fn update_plan_state(&mut self, plan_id: &str, state: MigrationState) -> Result<()>;
    fn get_plan_state(&self, plan_id: &str) -> Result<MigrationState>;
}

const OPERATION_COLUMNS: &str = "id, operation_type, source_path, source_provider, target_path,
     target_provider, item_path, rule_name, status, executed_at, error, correlation_id,
     retry_count, hash_verified, size_bytes, is_file";

fn operation_from_row(row: &Row) -> rusqlite::Result<Operation> {
    let type_raw: String = row.get(1)?;
    let status_raw: String = row.get(8)?;

    Ok(Operation {
        id: row.get(0)?,
        operation_type: OperationType::from_str(&type_raw).map_err(|e| conversion_error(1, e))?,
        source_path: row.get(2)?,
        source_provider: row.get(3)?,
        target_path: row.get(4)?,
        target_provider: row.get(5)?,
        item_path: row.get(6)?,
        rule_name: row.get(7)?,
        status: OperationStatus::from_str(&status_raw).map_err(|e| conversion_error(8, e))?,
        executed_at: parse_optional_timestamp(9, row.get(9)?)?,
        error: row.get(10)?,
        correlation_id: row.get(11)?,
        retry_count: row.get(12)?,
        hash_verified: row.get(13)?,
        size_bytes: row.get(14)?,
        is_file: row.get(15)?,
    })
}

fn metrics_from_row(row: &Row, offset: usize) -> rusqlite::Result<MigrationMetrics> {
    Ok(MigrationMetrics {
        total_files: row.get::<_, i64>(offset)? as usize,
        total_size_bytes: row.get(offset + 1)?,
        duplicates_eliminated: row.get::<_, i64>(offset + 2)? as usize,
        depth_reduction: row.get(offset + 3)?,
        compliance_uplift: row.get(offset + 4)?,
    })
}

fn state_from_column(idx: usize, raw: String) -> rusqlite::Result<MigrationState> {
    MigrationState::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

impl PlanStore for crate::db::SqliteDatabase {
    fn save_plan(&mut self, plan: &MigrationPlan) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO plans (id, scan_id, is_what_if, state, created_at, total_files,
                                total_size_bytes, duplicates_eliminated, depth_reduction,
                                compliance_uplift)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                plan.id,
                plan.scan_id,
                plan.is_what_if,
                MigrationState::Draft.as_str(),
                plan.created_at.to_rfc3339(),
                plan.metrics.total_files as i64,
                plan.metrics.total_size_bytes,
                plan.metrics.duplicates_eliminated as i64,
                plan.metrics.depth_reduction,
                plan.metrics.compliance_uplift,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO operations (id, plan_id, op_order, operation_type, source_path,
                    source_provider, target_path, target_provider, item_path, rule_name, status,
                    executed_at, error, correlation_id, retry_count, hash_verified, size_bytes,
                    is_file)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18)",
            )?;
            for (order, op) in plan.operations.iter().enumerate() {
                stmt.execute(params![
                    op.id,
                    plan.id,
                    order as i64,
                    op.operation_type.as_str(),
                    op.source_path,
                    op.source_provider,
                    op.target_path,
                    op.target_provider,
                    op.item_path,
                    op.rule_name,
                    op.status.as_str(),
                    op.executed_at.map(|dt| dt.to_rfc3339()),
                    op.error,
                    op.correlation_id,
                    op.retry_count,
                    op.hash_verified,
                    op.size_bytes,
                    op.is_file,
                ])?;
            }
        }

        tx.commit()?;
        log::debug!(
            "Saved plan {} with {} operations",
            plan.id,
            plan.operations.len()
        );
        Ok(())
    }

    fn get_plan(&self, plan_id: &str) -> Result<Option<MigrationPlan>> {
        let conn = self.conn();
        let header = conn
            .query_row(
                "SELECT id, scan_id, is_what_if, created_at, total_files, total_size_bytes,
                        duplicates_eliminated, depth_reduction, compliance_uplift
                 FROM plans WHERE id = ?1",
                [plan_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        parse_timestamp(3, row.get(3)?)?,
                        metrics_from_row(row, 4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, scan_id, is_what_if, created_at, metrics)) = header else {
            return Ok(None);
        };

        let query = format!(
            "SELECT {} FROM operations WHERE plan_id = ?1 ORDER BY op_order",
            OPERATION_COLUMNS
        );
        let mut stmt = conn.prepare(&query)?;
        let operations = stmt
            .query_map([plan_id], operation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(MigrationPlan {
            id,
            scan_id,
            operations,
            metrics,
            is_what_if,
            created_at,
        }))
    }

    fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT p.id, p.scan_id, p.is_what_if, p.state, p.created_at,
                    p.total_files, p.total_size_bytes, p.duplicates_eliminated,
                    p.depth_reduction, p.compliance_uplift,
                    (SELECT COUNT(*) FROM operations o WHERE o.plan_id = p.id),
                    (SELECT COUNT(*) FROM operations o
                     WHERE o.plan_id = p.id AND o.status = 'completed')
             FROM plans p ORDER BY p.created_at DESC",
        )?;

        let plans = stmt
            .query_map([], |row| {
                Ok(PlanSummary {
                    id: row.get(0)?,
                    scan_id: row.get(1)?,
                    is_what_if: row.get(2)?,
                    state: state_from_column(3, row.get(3)?)?,
                    created_at: parse_timestamp(4, row.get(4)?)?,
                    metrics: metrics_from_row(row, 5)?,
                    total_operations: row.get::<_, i64>(10)? as usize,
                    completed_operations: row.get::<_, i64>(11)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(plans)
    }

    fn checkpoint_batch(
        &mut self,
        plan_id: &str,
        operations: &[Operation],
        batch_index: Option<usize>,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE operations
                 SET status = ?1, executed_at = ?2, error = ?3, retry_count = ?4, hash_verified = ?5
                 WHERE id = ?6 AND plan_id = ?7",
            )?;
            for op in operations {
                let updated = stmt.execute(params![
                    op.status.as_str(),
                    op.executed_at.map(|dt| dt.to_rfc3339()),
                    op.error,
                    op.retry_count,
                    op.hash_verified,
                    op.id,
                    plan_id,
                ])?;
                if updated == 0 {
                    return Err(StowageError::Migration(format!(
                        "Operation {} does not belong to plan {}",
                        op.id, plan_id
                    )));
                }
            }
        }

        if let Some(index) = batch_index {
            let done: i64 = tx.query_row(
                "SELECT COUNT(*) FROM operations WHERE plan_id = ?1 AND status != 'pending'",
                [plan_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO checkpoints (plan_id, batch_index, operations_done, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![plan_id, index as i64, done, Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn last_checkpoint(&self, plan_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = self
            .conn()
            .query_row(
                "SELECT plan_id, batch_index, operations_done, recorded_at FROM checkpoints
                 WHERE plan_id = ?1 ORDER BY batch_index DESC, id DESC LIMIT 1",
                [plan_id],
                |row| {
                    Ok(Checkpoint {
                        plan_id: row.get(0)?,
                        batch_index: row.get::<_, i64>(1)? as usize,
                        operations_done: row.get::<_, i64>(2)? as usize,
                        recorded_at: parse_timestamp(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn checkpoint_count(&self, plan_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE plan_id = ?1",
            [plan_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn update_plan_state(&mut self, plan_id: &str, state: MigrationState) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE plans SET state = ?1 WHERE id = ?2",
            params![state.as_str(), plan_id],
        )?;
        if updated == 0 {
            return Err(StowageError::PlanNotFound(plan_id.to_string()));
        }
        Ok(())
    }

    fn get_plan_state(&self, plan_id: &str) -> Result<MigrationState> {
        self.conn()
            .query_row("SELECT state FROM plans WHERE id = ?1", [plan_id], |row| {
                state_from_column(0, row.get(0)?)
            })
            .optional()?
            .ok_or_else(|| StowageError::PlanNotFound(plan_id.to_string()))
    }
}
