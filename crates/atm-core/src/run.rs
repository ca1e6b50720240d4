//! The step loop for one run
//!
//! A step snapshots nothing up front: the head snapshot already holds the
//! state the step starts from. The planner proposes, the executor calls tools
//! through a [`ToolGateway`], the result is checked by the verifier and the
//! loop detectors, and the [`RecoveryController`] decides whether to
//! integrate, roll back and branch, or suspend for a clarification.

use crate::context::AtmContext;
use crate::error::{AtmError, AtmResult};
use crate::external::{CallTrace, Executor, Planner, ToolGateway, ToolRunner};
use crate::recovery::{
    ClarificationRequest, Directive, Perturbation, RecoveryCause, RecoveryController, RecoveryState,
};
use atm_guard::{Observation, RunHistory, Verdict};
use atm_state::{
    AgentState, Constraint, ContentHash, Fact, Integration, RunId, SnapshotId, StateError,
    ToolCallId, ToolCallRecord, ToolStatus,
};
use atm_store::StoreError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Ledger name of a recorded user answer
pub const USER_CLARIFICATION: &str = "user_clarification";

/// Which budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    /// `max_tool_calls`
    ToolCalls,
    /// `max_wall_time`
    WallTime,
    /// `max_rollbacks`
    Rollbacks,
}

/// Result of one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Verified and snapshotted as the new head
    Integrated { snapshot: SnapshotId, milestone: bool },
    /// Rejected; head moved to a perturbed branch of `target`
    RolledBack {
        target: SnapshotId,
        branch: SnapshotId,
        perturbations: Vec<Perturbation>,
        cause: RecoveryCause,
    },
    /// Rejected again; head moved to `target` and the run is suspended
    ClarificationNeeded {
        target: SnapshotId,
        request: ClarificationRequest,
    },
    /// Still waiting for an answer; nothing ran
    Suspended(ClarificationRequest),
    /// The executor reported a failure and no detector fired
    ToolFailed { class: String },
    /// A budget is spent; nothing ran
    BudgetExhausted(BudgetKind),
}

impl StepOutcome {
    /// Recovered anomalies as error values, for callers that want `?`.
    ///
    /// # Errors
    /// [`AtmError::ConstraintViolation`] or [`AtmError::LoopTrigger`] for a
    /// rollback, [`AtmError::ClarificationRequired`] while suspended
    pub fn into_result(self) -> AtmResult<Option<SnapshotId>> {
        match self {
            Self::Integrated { snapshot, .. } => Ok(Some(snapshot)),
            Self::ToolFailed { .. } | Self::BudgetExhausted(_) => Ok(None),
            Self::RolledBack { cause, .. } => Err(cause.to_error()),
            Self::ClarificationNeeded { request, .. } | Self::Suspended(request) => {
                Err(AtmError::ClarificationRequired {
                    question: request.question,
                })
            }
        }
    }
}

/// A user's answer to a [`ClarificationRequest`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClarificationAnswer {
    /// Answer text, stored as the source blob of any facts
    pub text: String,
    /// `(subject, predicate, object)` facts taken from the answer
    pub facts: Vec<(String, String, Value)>,
    /// Constraint replacement, applied as a tracked update
    pub constraint: Option<Constraint>,
}

impl ClarificationAnswer {
    /// Answer with text only
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// With a fact sourced from this answer
    #[must_use]
    pub fn with_fact(
        mut self,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<Value>,
    ) -> Self {
        self.facts
            .push((subject.into(), predicate.into(), object.into()));
        self
    }

    /// With a constraint update
    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }
}

/// One agent run
pub struct Run {
    id: RunId,
    ctx: AtmContext,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn Executor>,
    tools: Arc<dyn ToolRunner>,
    head: SnapshotId,
    state: AgentState,
    controller: RecoveryController,
    history: RunHistory,
    started_at: DateTime<Utc>,
    last_snapshot_at: DateTime<Utc>,
    tool_calls_made: u32,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("head", &self.head)
            .field("recovery", &self.controller.state())
            .field("tool_calls_made", &self.tool_calls_made)
            .finish_non_exhaustive()
    }
}

impl Run {
    pub(crate) fn start(
        ctx: AtmContext,
        initial: AgentState,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        tools: Arc<dyn ToolRunner>,
    ) -> AtmResult<Self> {
        initial.validate()?;
        let id = RunId::new();
        let root = ctx.store().snapshot(id, &initial, None)?;
        tracing::info!(run_id = %id, snapshot_id = %root, "run started");
        Ok(Self::assemble(ctx, id, root, initial, planner, executor, tools))
    }

    /// Continue a run from its stored head, e.g. after a restart.
    ///
    /// Detector history and the rollback counter start fresh.
    ///
    /// # Errors
    /// Returns [`AtmError::NotFound`] for an unknown run, or a
    /// reconstruction error
    pub fn resume(
        ctx: AtmContext,
        id: RunId,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        tools: Arc<dyn ToolRunner>,
    ) -> AtmResult<Self> {
        let head = ctx
            .store()
            .head(id)
            .ok_or(StoreError::RunNotFound(id))?;
        let state = ctx.store().reconstruct(head)?;
        tracing::info!(run_id = %id, snapshot_id = %head, "run resumed");
        Ok(Self::assemble(ctx, id, head, state, planner, executor, tools))
    }

    fn assemble(
        ctx: AtmContext,
        id: RunId,
        head: SnapshotId,
        state: AgentState,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        tools: Arc<dyn ToolRunner>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            controller: RecoveryController::new(ctx.config().recovery.clone()),
            history: ctx.detector().history(),
            ctx,
            planner,
            executor,
            tools,
            head,
            state,
            started_at: now,
            last_snapshot_at: now,
            tool_calls_made: 0,
        }
    }

    /// Run id
    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Current head snapshot
    #[must_use]
    pub fn head(&self) -> SnapshotId {
        self.head
    }

    /// State at the head
    #[must_use]
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Controller state
    #[must_use]
    pub fn recovery_state(&self) -> RecoveryState {
        self.controller.state()
    }

    /// Rollbacks since the last successful integration or answer
    #[must_use]
    pub fn consecutive_rollbacks(&self) -> u32 {
        self.controller.consecutive_rollbacks()
    }

    /// Rollbacks over the whole run
    #[must_use]
    pub fn total_rollbacks(&self) -> u32 {
        self.controller.total_rollbacks()
    }

    /// Outstanding question, if suspended
    #[must_use]
    pub fn pending_question(&self) -> Option<&ClarificationRequest> {
        self.controller.pending()
    }

    /// Tool calls made by this run
    #[must_use]
    pub fn tool_calls_made(&self) -> u32 {
        self.tool_calls_made
    }

    /// Observations the detectors currently see
    #[must_use]
    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Shared services
    #[must_use]
    pub fn context(&self) -> &AtmContext {
        &self.ctx
    }

    fn exhausted_budget(&self, now: DateTime<Utc>) -> Option<BudgetKind> {
        let budgets = self.state.planner_cfg.budgets;
        let elapsed = now
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default();
        if self.tool_calls_made >= budgets.max_tool_calls {
            Some(BudgetKind::ToolCalls)
        } else if elapsed >= budgets.max_wall_time {
            Some(BudgetKind::WallTime)
        } else if self.controller.total_rollbacks() >= budgets.max_rollbacks {
            Some(BudgetKind::Rollbacks)
        } else {
            None
        }
    }

    /// Take one plan → execute → verify → integrate-or-recover step.
    ///
    /// # Errors
    /// Only fatal failures: storage I/O or integrity errors, planner or
    /// executor errors, and state invariant breaches. Constraint violations,
    /// loop triggers and clarifications are outcomes, not errors.
    pub async fn step(&mut self) -> AtmResult<StepOutcome> {
        if let Some(request) = self.controller.pending() {
            return Ok(StepOutcome::Suspended(request.clone()));
        }
        if let Some(kind) = self.exhausted_budget(Utc::now()) {
            tracing::info!(run_id = %self.id, budget = ?kind, "budget exhausted");
            return Ok(StepOutcome::BudgetExhausted(kind));
        }

        let plan = self
            .planner
            .propose(&self.state)
            .await
            .map_err(AtmError::Collaborator)?;
        let plan_digest = ContentHash::compute_canonical(&plan).map_err(StateError::from)?;
        tracing::debug!(
            run_id = %self.id,
            snapshot_id = %self.head,
            plan = %plan_digest.short(),
            summary = %plan.summary,
            "plan proposed"
        );

        let remaining = self
            .state
            .planner_cfg
            .budgets
            .max_tool_calls
            .saturating_sub(self.tool_calls_made);
        let gateway = ToolGateway::new(
            self.head,
            &self.state.planner_cfg.tool_allowlist,
            self.ctx.memo(),
            self.tools.as_ref(),
        )
        .with_ttl(self.ctx.config().run.tool_ttl())
        .with_call_budget(remaining as usize);
        let executed = self.executor.run(&plan, &self.state, &gateway).await;
        let (calls, fatal) = gateway.finish();

        self.tool_calls_made = self
            .tool_calls_made
            .saturating_add(u32::try_from(calls.len()).unwrap_or(u32::MAX));
        let records: Vec<ToolCallRecord> = calls.iter().map(|c| c.record.clone()).collect();
        self.ctx.store().record_tool_calls(self.id, records.clone())?;
        if let Some(e) = fatal {
            return Err(e.into());
        }
        let result = executed.map_err(AtmError::Collaborator)?;

        let mut rejected = None;
        let next = if result.status.is_ok() {
            let integration = Integration {
                tool_calls: records,
                facts: result.facts.clone(),
                complete_active_leaf: result.complete_leaf,
                scratch_summary: result.scratch_summary.clone(),
            };
            match self.state.integrate(integration) {
                Ok(next) => Some(next),
                Err(e @ StateError::SourcelessFact { .. }) => {
                    tracing::warn!(run_id = %self.id, error = %e, "integration rejected");
                    rejected = Some(e.to_string());
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let new_facts: Vec<&Fact> = next
            .as_ref()
            .map(|n| n.new_facts_since(&self.state))
            .unwrap_or_default();
        observe(&mut self.history, &calls, &new_facts, &self.state);
        let report = self.ctx.detector().evaluate(&self.history, Utc::now());

        let verdict = if let Some(reason) = rejected {
            Verdict {
                ok: false,
                reasons: vec![reason],
                violations: Vec::new(),
            }
        } else if let Some(next) = &next {
            let evidence = evidence(&result.output, &new_facts);
            self.ctx
                .verifier()
                .check_applicable(&evidence, next.locked_constraints())
        } else if report.is_clear() {
            let class = failure_class(&result.status);
            tracing::info!(run_id = %self.id, class = %class, "step failed");
            return Ok(StepOutcome::ToolFailed { class });
        } else {
            Verdict::pass()
        };

        let directive = self.controller.assess(&verdict, &report, &self.state)?;
        self.apply(directive, next, &result.status)
    }

    fn apply(
        &mut self,
        directive: Directive,
        next: Option<AgentState>,
        status: &ToolStatus,
    ) -> AtmResult<StepOutcome> {
        let store = Arc::clone(self.ctx.store());
        match (directive, next) {
            (Directive::Integrate, Some(next)) => {
                let snapshot = store.snapshot(self.id, &next, Some(self.head))?;
                let milestone = store.get_snapshot(snapshot)?.is_milestone;
                tracing::info!(run_id = %self.id, snapshot_id = %snapshot, milestone, "step integrated");
                self.move_head(snapshot, next);
                Ok(StepOutcome::Integrated {
                    snapshot,
                    milestone,
                })
            }
            (Directive::Integrate, None) => Ok(StepOutcome::ToolFailed {
                class: failure_class(status),
            }),
            (Directive::Rollback { cause }, _) => {
                let target =
                    self.controller
                        .rollback_target(&store, self.ctx.verifier(), self.head)?;
                let target_state = store.reconstruct(target)?;
                store.rollback(self.id, target)?;

                let (cfg, perturbations) =
                    self.controller.branch(&target_state.planner_cfg, &cause)?;
                let branched = target_state.with_planner_cfg(cfg);
                let branch = store.snapshot(self.id, &branched, Some(target))?;
                tracing::info!(
                    run_id = %self.id,
                    target = %target,
                    branch = %branch,
                    perturbations = ?perturbations.iter().map(Perturbation::code).collect::<Vec<_>>(),
                    "rolled back and branched"
                );
                self.move_head(branch, branched);
                self.history.clear();
                Ok(StepOutcome::RolledBack {
                    target,
                    branch,
                    perturbations,
                    cause,
                })
            }
            (Directive::Clarify { cause, request }, _) => {
                let target =
                    self.controller
                        .rollback_target(&store, self.ctx.verifier(), self.head)?;
                let target_state = store.reconstruct(target)?;
                store.rollback(self.id, target)?;
                tracing::warn!(
                    run_id = %self.id,
                    target = %target,
                    reasons = ?cause.reasons,
                    "run suspended for clarification"
                );
                self.head = target;
                self.state = target_state;
                self.history.clear();
                Ok(StepOutcome::ClarificationNeeded { target, request })
            }
        }
    }

    fn move_head(&mut self, snapshot: SnapshotId, state: AgentState) {
        self.head = snapshot;
        self.state = state;
        self.last_snapshot_at = Utc::now();
    }

    /// Record the user's answer, apply it and resume the run.
    ///
    /// The answer is ledgered as a `user_clarification` call so facts taken
    /// from it stay sourced.
    ///
    /// # Errors
    /// Returns [`AtmError::InvalidTransition`] if no question is pending, or
    /// a storage error
    pub fn resolve_clarification(&mut self, answer: ClarificationAnswer) -> AtmResult<SnapshotId> {
        let Some(request) = self.controller.pending().cloned() else {
            return Err(AtmError::InvalidTransition {
                from: self.controller.state(),
                to: RecoveryState::Active,
            });
        };

        let store = Arc::clone(self.ctx.store());
        let input_digest = store.content().put(request.question.as_bytes())?;
        let output_digest = ContentHash::compute(answer.text.as_bytes());
        let record = ToolCallRecord {
            id: ToolCallId::new(),
            snapshot_id: self.head,
            name: USER_CLARIFICATION.to_string(),
            input_digest,
            output_digest,
            status: ToolStatus::Ok,
            latency: Duration::ZERO,
            url: None,
            created_at: Utc::now(),
        };
        let facts = answer
            .facts
            .into_iter()
            .map(|(subject, predicate, object)| Fact::new(subject, predicate, object, output_digest))
            .collect();

        let mut next = self.state.integrate(Integration {
            tool_calls: vec![record.clone()],
            facts,
            ..Integration::default()
        })?;
        if let Some(constraint) = answer.constraint {
            next = next.update_constraint(constraint);
        }

        store.content().put_retained(answer.text.as_bytes())?;
        store.record_tool_calls(self.id, vec![record])?;
        let snapshot = store.snapshot(self.id, &next, Some(self.head))?;
        self.controller.resolve()?;
        tracing::info!(
            run_id = %self.id,
            snapshot_id = %snapshot,
            constraint = ?request.constraint,
            "clarification applied, run resumed"
        );
        self.move_head(snapshot, next);
        self.history.clear();
        Ok(snapshot)
    }

    /// Tracked constraint change, snapshotted as a child of the head
    ///
    /// # Errors
    /// Returns a storage error
    pub fn update_constraint(&mut self, constraint: Constraint) -> AtmResult<SnapshotId> {
        let name = constraint.name.clone();
        let next = self.state.update_constraint(constraint);
        let snapshot = self.ctx.store().snapshot(self.id, &next, Some(self.head))?;
        tracing::info!(run_id = %self.id, snapshot_id = %snapshot, constraint = %name, "constraint updated");
        self.move_head(snapshot, next);
        Ok(snapshot)
    }

    /// Move the head to an earlier snapshot of this run
    ///
    /// # Errors
    /// Returns [`AtmError::NotFound`] for a snapshot of another run or an
    /// unknown one, or a reconstruction error
    pub fn rollback_to(&mut self, snapshot: SnapshotId) -> AtmResult<()> {
        let store = self.ctx.store();
        let state = store.reconstruct(snapshot)?;
        store.rollback(self.id, snapshot)?;
        self.head = snapshot;
        self.state = state;
        self.history.clear();
        Ok(())
    }

    /// Re-snapshot the head if the auto-checkpoint interval has passed
    ///
    /// # Errors
    /// Returns a storage error
    pub fn checkpoint_if_due(&mut self, now: DateTime<Utc>) -> AtmResult<Option<SnapshotId>> {
        let since = now
            .signed_duration_since(self.last_snapshot_at)
            .to_std()
            .unwrap_or_default();
        if since < self.ctx.config().run.auto_checkpoint() {
            return Ok(None);
        }
        let snapshot = self
            .ctx
            .store()
            .snapshot(self.id, &self.state, Some(self.head))?;
        tracing::debug!(run_id = %self.id, snapshot_id = %snapshot, "auto checkpoint");
        self.head = snapshot;
        self.last_snapshot_at = now;
        Ok(Some(snapshot))
    }
}

/// Push one observation per call, crediting each call with the new facts
/// that cite its output
fn observe(history: &mut RunHistory, calls: &[CallTrace], new_facts: &[&Fact], head: &AgentState) {
    let active_leaf = head.goal_tree.active_leaf.clone();
    for call in calls {
        let contributed = new_facts
            .iter()
            .filter(|f| f.source_digest == call.record.output_digest)
            .count();
        history.push(
            Observation::new(
                &call.record.name,
                &call.input_text,
                &call.output_text,
                call.record.status.clone(),
                active_leaf.clone(),
                call.record.created_at,
            )
            .with_progress(contributed, 0),
        );
    }
}

/// Result fields overlaid with the predicates of the step's new facts
fn evidence(output: &Value, new_facts: &[&Fact]) -> Value {
    let mut fields = match output {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for fact in new_facts {
        fields.insert(fact.predicate.clone(), fact.object.clone());
    }
    Value::Object(fields)
}

fn failure_class(status: &ToolStatus) -> String {
    match status {
        ToolStatus::Error { class } => class.clone(),
        ToolStatus::Ok => "error".to_string(),
    }
}
