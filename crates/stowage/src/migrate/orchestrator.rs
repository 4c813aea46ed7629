//! Plan creation and batched, checkpointed execution.
//!
//! The store is shared behind a mutex that is only held for synchronous
//! store calls, never across an `.await`. Each finished batch persists its
//! operation statuses and a checkpoint row in one transaction, so a restart
//! resumes after the last durable batch.
//!
//! A resumed run starts at the first pending operation and cuts its batches
//! from there, so changing the batch size between runs never skips work. A
//! plan found in `Running` at startup was left behind by an interrupted
//! process; it is recovered through `Paused` and resumed like any other.

use crate::connector::{Connector, OperateContext, OperationErrorKind, LOCAL_PROVIDER_ID};
use crate::db::{
    AuditDatabase, AuditLogEntry, InventoryStore, Item, ItemType, MigrationPlan, MigrationState,
    Operation, OperationStatus, PlanStore,
};
use crate::error::{Result, StowageError};
use crate::migrate::planner::{compute_metrics, Planner};
use crate::migrate::schedule::{AlwaysAllowed, Clock, ExecutionPolicy, SystemClock};
use crate::migrate::MigrationOptions;
use crate::progress::ProgressReporter;
use crate::rules::RulesEngine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const CANCELLED_REASON: &str = "cancelled";
pub const WHAT_IF_REASON: &str = "what-if";

#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub migration_id: String,
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub skipped_operations: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_items: Vec<Operation>,
    pub checkpoints_written: usize,
    pub final_state: MigrationState,
}

impl MigrationResult {
    fn tally(
        plan_id: &str,
        operations: &[Operation],
        started_at: DateTime<Utc>,
        checkpoints_written: usize,
        final_state: MigrationState,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let count = |status: OperationStatus| operations.iter().filter(|op| op.status == status).count();

        Self {
            migration_id: plan_id.to_string(),
            total_operations: operations.len(),
            completed_operations: count(OperationStatus::Completed),
            failed_operations: count(OperationStatus::Failed),
            skipped_operations: count(OperationStatus::Skipped),
            started_at,
            completed_at: (final_state == MigrationState::Completed).then_some(finished_at),
            failed_items: operations
                .iter()
                .filter(|op| op.status == OperationStatus::Failed)
                .cloned()
                .collect(),
            checkpoints_written,
            final_state,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.final_state == MigrationState::Completed
    }
}

enum BatchOutcome {
    Finished,
    Cancelled,
}

fn batch_ranges(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Batches covering `offset..len`.
fn resume_ranges(len: usize, offset: usize, batch_size: usize) -> Vec<Range<usize>> {
    batch_ranges(len.saturating_sub(offset), batch_size)
        .into_iter()
        .map(|range| range.start + offset..range.end + offset)
        .collect()
}

/// Move a plan left in `Running` by a dead process back to `Paused`.
fn recover_interrupted<D: PlanStore + AuditDatabase>(store: &mut D, plan_id: &str) -> Result<()> {
    log::warn!(
        "Plan {} is marked running but no execution owns it; recovering from its last checkpoint",
        plan_id
    );
    transition(store, plan_id, MigrationState::Paused)?;
    store.log_audit(&AuditLogEntry::new(
        "plan_recovered",
        Some(plan_id),
        Some("Interrupted run recovered".to_string()),
    ))?;
    Ok(())
}

fn transition<D: PlanStore>(store: &mut D, plan_id: &str, to: MigrationState) -> Result<MigrationState> {
    let from = store.get_plan_state(plan_id)?;
    if !from.can_transition_to(to) {
        return Err(StowageError::InvalidStatusTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    store.update_plan_state(plan_id, to)?;
    Ok(from)
}

pub struct MigrationOrchestrator<D>
where
    D: InventoryStore + PlanStore + AuditDatabase + Send,
{
    store: Arc<Mutex<D>>,
    rules: RulesEngine,
    connectors: HashMap<String, Arc<dyn Connector>>,
    options: MigrationOptions,
    policy: Arc<dyn ExecutionPolicy>,
    clock: Arc<dyn Clock>,
    progress: Option<ProgressReporter>,
}

impl<D> MigrationOrchestrator<D>
where
    D: InventoryStore + PlanStore + AuditDatabase + Send,
{
    pub fn new(store: Arc<Mutex<D>>, rules: RulesEngine, options: MigrationOptions) -> Self {
        let policy: Arc<dyn ExecutionPolicy> = match options.off_hours_window() {
            Some(window) => Arc::new(window),
            None => Arc::new(AlwaysAllowed),
        };

        Self {
            store,
            rules,
            connectors: HashMap::new(),
            options,
            policy,
            clock: Arc::new(SystemClock),
            progress: None,
        }
    }

    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.provider_id().to_string(), connector);
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register_connector(connector);
        self
    }

    pub fn with_execution_policy(mut self, policy: Arc<dyn ExecutionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }

    pub fn store(&self) -> &Arc<Mutex<D>> {
        &self.store
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut D) -> Result<T>) -> Result<T> {
        let mut guard = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn audit(&self, action: &str, plan_id: &str, details: String) -> Result<()> {
        self.with_store(|store| {
            store.log_audit(&AuditLogEntry::new(action, Some(plan_id), Some(details)))?;
            Ok(())
        })
    }

    pub fn plan_state(&self, plan_id: &str) -> Result<MigrationState> {
        self.with_store(|store| store.get_plan_state(plan_id))
    }

    /// Connector that carries out `op`. Downloads run on the source
    /// provider's connector since the local side has no remote client.
    fn connector_for(&self, op: &Operation) -> Option<&Arc<dyn Connector>> {
        if op.target_provider == LOCAL_PROVIDER_ID && op.source_provider != LOCAL_PROVIDER_ID {
            if let Some(connector) = self.connectors.get(&op.source_provider) {
                return Some(connector);
            }
        }
        self.connectors.get(&op.target_provider)
    }

    fn target_is_valid(&self, provider: &str, path: &str) -> bool {
        self.connectors
            .get(provider)
            .is_some_and(|connector| connector.validate_path(path))
    }

    /// Plan the migration of every file in `scan_id`. `options` governs
    /// planning (what-if, non-destructive); execution uses the options the
    /// orchestrator was built with.
    pub async fn create_plan(
        &self,
        scan_id: &str,
        options: &MigrationOptions,
        cancel: &CancellationToken,
    ) -> Result<MigrationPlan> {
        self.build_plan(scan_id, options, options.what_if, cancel).await
    }

    /// Same as [`create_plan`](Self::create_plan) but the plan is marked
    /// what-if; executing it never touches storage.
    pub async fn simulate_plan(
        &self,
        scan_id: &str,
        options: &MigrationOptions,
        cancel: &CancellationToken,
    ) -> Result<MigrationPlan> {
        self.build_plan(scan_id, options, true, cancel).await
    }

    async fn build_plan(
        &self,
        scan_id: &str,
        options: &MigrationOptions,
        is_what_if: bool,
        cancel: &CancellationToken,
    ) -> Result<MigrationPlan> {
        let (items, duplicates, issues) = self.with_store(|store| {
            let items = store.query_items(scan_id, &|item: &Item| item.item_type != ItemType::Folder)?;
            let duplicates = store.find_duplicates(scan_id)?;
            let issues = store.validate(scan_id)?;
            Ok((items, duplicates, issues))
        })?;

        let plan_id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let mut planner = Planner::new(&plan_id, &items, options.non_destructive, now);

        for (index, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                log::warn!("Planning of scan {} cancelled after {} items", scan_id, index);
                return Err(StowageError::Cancelled);
            }
            if let Some(suggestion) = self.rules.evaluate_at(item, now) {
                planner.add(item, &suggestion);
            }
            if index % 1000 == 999 {
                tokio::task::yield_now().await;
            }
        }

        let operations = planner.into_operations();
        let metrics = compute_metrics(
            &operations,
            &items,
            &duplicates,
            &issues,
            &|provider: &str, path: &str| self.target_is_valid(provider, path),
        );

        let plan = MigrationPlan {
            id: plan_id,
            scan_id: scan_id.to_string(),
            operations,
            metrics,
            is_what_if,
            created_at: now,
        };

        self.with_store(|store| {
            store.save_plan(&plan)?;
            transition(store, &plan.id, MigrationState::Planning)?;
            transition(store, &plan.id, MigrationState::Ready)?;
            store.log_audit(&AuditLogEntry::new(
                "plan_created",
                Some(&plan.id),
                Some(format!(
                    "{} operations from scan {}{}",
                    plan.total_operations(),
                    scan_id,
                    if is_what_if { " (what-if)" } else { "" }
                )),
            ))?;
            Ok(())
        })?;

        log::info!(
            "Created plan {} with {} operations ({} files)",
            plan.id,
            plan.total_operations(),
            plan.metrics.total_files
        );
        Ok(plan)
    }

    /// Execute or resume `plan`.
    ///
    /// Operation statuses are reloaded from the store, so a plan that was
    /// paused or interrupted continues after its last checkpoint and never
    /// re-runs completed operations. A plan still marked `Running` is taken
    /// over as an interrupted run.
    pub async fn execute_plan(
        &self,
        plan: &MigrationPlan,
        cancel: &CancellationToken,
    ) -> Result<MigrationResult> {
        let started_at = self.clock.now();

        if plan.is_what_if {
            return self.execute_what_if(plan, started_at);
        }

        let mut operations = self.with_store(|store| {
            let stored = store
                .get_plan(&plan.id)?
                .ok_or_else(|| StowageError::PlanNotFound(plan.id.clone()))?;
            if store.get_plan_state(&plan.id)? == MigrationState::Running {
                recover_interrupted(store, &plan.id)?;
            }
            transition(store, &plan.id, MigrationState::Running)?;
            Ok(stored.operations)
        })?;

        match self.run_batches(&plan.id, &mut operations, cancel).await {
            Ok((final_state, checkpoints)) => Ok(MigrationResult::tally(
                &plan.id,
                &operations,
                started_at,
                checkpoints,
                final_state,
                self.clock.now(),
            )),
            Err(e) => {
                log::error!("Plan {} failed: {}", plan.id, e);
                let marked = self.with_store(|store| {
                    let state = store.get_plan_state(&plan.id)?;
                    if state.can_transition_to(MigrationState::Failed) {
                        store.update_plan_state(&plan.id, MigrationState::Failed)?;
                    }
                    Ok(())
                });
                if let Err(mark_err) = marked {
                    log::error!("Could not mark plan {} as failed: {}", plan.id, mark_err);
                }
                Err(e)
            }
        }
    }

    fn execute_what_if(&self, plan: &MigrationPlan, started_at: DateTime<Utc>) -> Result<MigrationResult> {
        self.with_store(|store| {
            transition(store, &plan.id, MigrationState::Running)?;
            transition(store, &plan.id, MigrationState::Completed)?;
            Ok(())
        })?;

        let operations: Vec<Operation> = plan
            .operations
            .iter()
            .cloned()
            .map(|mut op| {
                if op.status == OperationStatus::Pending {
                    op.status = OperationStatus::Skipped;
                    op.error = Some(WHAT_IF_REASON.to_string());
                }
                op
            })
            .collect();

        for op in &operations {
            log::info!(
                "WHAT-IF: would {} {} -> {}",
                op.operation_type.as_str(),
                op.source_path,
                op.target_path
            );
        }

        self.audit(
            "plan_execution_completed",
            &plan.id,
            format!("What-if run of {} operations", operations.len()),
        )?;

        Ok(MigrationResult::tally(
            &plan.id,
            &operations,
            started_at,
            0,
            MigrationState::Completed,
            self.clock.now(),
        ))
    }

    /// Run every pending operation in batches. Returns the state the run
    /// ended in and the number of checkpoints it wrote.
    async fn run_batches(
        &self,
        plan_id: &str,
        operations: &mut [Operation],
        cancel: &CancellationToken,
    ) -> Result<(MigrationState, usize)> {
        for op in operations.iter_mut() {
            let interrupted = op.status == OperationStatus::Skipped
                && op.error.as_deref() == Some(CANCELLED_REASON);
            if interrupted || op.status == OperationStatus::InProgress {
                op.status = OperationStatus::Pending;
                op.error = None;
            }
        }

        let offset = operations
            .iter()
            .position(|op| op.status == OperationStatus::Pending)
            .unwrap_or(operations.len());
        let ranges = resume_ranges(operations.len(), offset, self.options.batch_size);
        let first_batch = self
            .with_store(|store| store.last_checkpoint(plan_id))?
            .map_or(0, |checkpoint| checkpoint.batch_index + 1);

        let pending = operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count();
        self.audit(
            "plan_execution_started",
            plan_id,
            format!(
                "{} pending of {} operations, starting at operation {} as batch {}",
                pending,
                operations.len(),
                offset,
                first_batch
            ),
        )?;
        log::info!(
            "Executing plan {}: {} pending operations in {} batches",
            plan_id,
            pending,
            ranges.len()
        );

        let mut written = 0;
        for (batch_index, range) in (first_batch..).zip(ranges.iter()) {
            if self.plan_state(plan_id)? == MigrationState::Paused {
                log::info!("Plan {} paused before batch {}", plan_id, batch_index);
                self.audit("plan_paused", plan_id, format!("Paused before batch {}", batch_index))?;
                return Ok((MigrationState::Paused, written));
            }

            let batch = &mut operations[range.clone()];
            let outcome = match self.wait_for_window(cancel).await {
                Ok(()) => self.run_batch(plan_id, batch, cancel).await?,
                Err(StowageError::Cancelled) => BatchOutcome::Cancelled,
                Err(e) => return Err(e),
            };

            match outcome {
                BatchOutcome::Finished => {
                    self.with_store(|store| store.checkpoint_batch(plan_id, batch, Some(batch_index)))?;
                    written += 1;
                    let failed = batch
                        .iter()
                        .filter(|op| op.status == OperationStatus::Failed)
                        .count();
                    self.audit(
                        "batch_checkpointed",
                        plan_id,
                        format!("Batch {} ({} operations, {} failed)", batch_index, batch.len(), failed),
                    )?;
                    log::debug!("Checkpointed batch {} of plan {}", batch_index, plan_id);
                }
                BatchOutcome::Cancelled => {
                    for op in batch.iter_mut() {
                        if op.status == OperationStatus::Pending {
                            op.status = OperationStatus::Skipped;
                            op.error = Some(CANCELLED_REASON.to_string());
                        }
                    }
                    self.with_store(|store| {
                        store.checkpoint_batch(plan_id, batch, None)?;
                        let state = store.get_plan_state(plan_id)?;
                        if state != MigrationState::Paused {
                            transition(store, plan_id, MigrationState::Paused)?;
                        }
                        Ok(())
                    })?;
                    self.audit(
                        "plan_paused",
                        plan_id,
                        format!("Cancelled during batch {}", batch_index),
                    )?;
                    log::warn!("Plan {} cancelled during batch {}", plan_id, batch_index);
                    return Ok((MigrationState::Paused, written));
                }
            }
        }

        let left = operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count();
        if left > 0 {
            return Err(StowageError::InvalidState(format!(
                "Plan {} ran out of batches with {} operations still pending",
                plan_id, left
            )));
        }

        let final_state = self.with_store(|store| {
            if store.get_plan_state(plan_id)? == MigrationState::Paused {
                return Ok(MigrationState::Paused);
            }
            transition(store, plan_id, MigrationState::Completed)?;
            Ok(MigrationState::Completed)
        })?;

        let completed = operations
            .iter()
            .filter(|op| op.status == OperationStatus::Completed)
            .count();
        let failed = operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .count();
        if final_state == MigrationState::Completed {
            self.audit(
                "plan_execution_completed",
                plan_id,
                format!("{} completed, {} failed", completed, failed),
            )?;
            log::info!("Plan {} completed: {} completed, {} failed", plan_id, completed, failed);
        } else {
            self.audit("plan_paused", plan_id, "Paused after final batch".to_string())?;
        }

        Ok((final_state, written))
    }

    async fn wait_for_window(&self, cancel: &CancellationToken) -> Result<()> {
        let mut logged = false;
        while !self.policy.is_execution_allowed(self.clock.now()) {
            if !logged {
                log::info!("Outside execution window, waiting");
                logged = true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StowageError::Cancelled),
                _ = tokio::time::sleep(self.options.window_poll_interval) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(StowageError::Cancelled);
        }
        Ok(())
    }

    async fn run_batch(
        &self,
        plan_id: &str,
        batch: &mut [Operation],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        for op in batch.iter_mut() {
            if op.status != OperationStatus::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(BatchOutcome::Cancelled);
            }

            self.run_operation(op, cancel).await;

            match op.status {
                OperationStatus::Skipped if op.error.as_deref() == Some(CANCELLED_REASON) => {
                    return Ok(BatchOutcome::Cancelled);
                }
                OperationStatus::Failed => {
                    let mut entry = AuditLogEntry::new(
                        "operation_failed",
                        Some(plan_id),
                        op.error.clone(),
                    );
                    entry.operation_id = Some(op.id.clone());
                    self.with_store(|store| store.log_audit(&entry))?;
                }
                _ => {}
            }
        }
        Ok(BatchOutcome::Finished)
    }

    /// Apply one operation, re-attempting retryable failures.
    async fn run_operation(&self, op: &mut Operation, cancel: &CancellationToken) {
        let Some(connector) = self.connector_for(op).cloned() else {
            op.status = OperationStatus::Failed;
            op.error = Some(format!(
                "No connector registered for provider '{}'",
                op.target_provider
            ));
            op.executed_at = Some(self.clock.now());
            return;
        };

        let ctx = OperateContext {
            cancel: cancel.clone(),
            verify_hashes: self.options.verify_hashes,
            progress: self.progress.clone(),
        };

        op.status = OperationStatus::InProgress;
        loop {
            let result = connector.operate(op, &ctx).await;

            if result.success {
                op.status = OperationStatus::Completed;
                op.hash_verified = result.hash_verified;
                op.error = None;
                break;
            }

            if result.error_kind == Some(OperationErrorKind::Cancelled) {
                op.status = OperationStatus::Skipped;
                op.error = Some(CANCELLED_REASON.to_string());
                break;
            }

            if !result.is_retryable() || op.retry_count >= self.options.max_retries {
                log::error!(
                    "{} {} -> {} failed: {}",
                    op.operation_type.as_str(),
                    op.source_path,
                    op.target_path,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                op.status = OperationStatus::Failed;
                op.hash_verified = false;
                op.error = result.error;
                break;
            }

            op.retry_count += 1;
            log::warn!(
                "Retrying {} ({}/{}): {}",
                op.source_path,
                op.retry_count,
                self.options.max_retries,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        op.executed_at = Some(self.clock.now());
    }

    /// Request a pause; the running execution stops at its next batch
    /// boundary.
    pub fn pause_migration(&self, plan_id: &str) -> Result<()> {
        self.with_store(|store| transition(store, plan_id, MigrationState::Paused))?;
        log::info!("Pause requested for plan {}", plan_id);
        Ok(())
    }

    /// Continue a paused or interrupted plan from its last checkpoint.
    pub async fn resume_migration(
        &self,
        plan_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MigrationResult> {
        let plan = self.with_store(|store| {
            let state = store.get_plan_state(plan_id)?;
            if !matches!(state, MigrationState::Paused | MigrationState::Running) {
                return Err(StowageError::InvalidStatusTransition {
                    from: state.as_str().to_string(),
                    to: MigrationState::Running.as_str().to_string(),
                });
            }
            store
                .get_plan(plan_id)?
                .ok_or_else(|| StowageError::PlanNotFound(plan_id.to_string()))
        })?;

        log::info!("Resuming plan {}", plan_id);
        self.execute_plan(&plan, cancel).await
    }
}
