//! Recovery state machine
//!
//! [`RecoveryController`] turns a step's [`Verdict`] and [`LoopReport`] into a
//! [`Directive`]. Transitions return values; nothing here throws a domain
//! anomaly as an error.
//!
//! ```text
//! Active ──violation/trigger──▶ RolledBack ──perturb──▶ Branched ──▶ Active
//!                                   │
//!                                   └──counter reached──▶ ClarificationNeeded ──answer──▶ Active
//! ```

use crate::config::RecoveryConfig;
use crate::error::{AtmError, AtmResult};
use atm_guard::{ConstraintVerifier, DetectorTrigger, LoopReport, Verdict, Violation};
use atm_state::{AgentState, ContentHash, PlannerConfig, SnapshotId};
use atm_store::SnapshotStore;
use serde::{Deserialize, Serialize};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    /// Steps are integrated normally
    Active,
    /// Head moved back to a known-good snapshot
    RolledBack,
    /// Perturbed branch created from the rollback target
    Branched,
    /// Suspended until the user answers a question
    ClarificationNeeded,
}

/// Validates a controller transition.
///
/// # Errors
/// Returns [`AtmError::InvalidTransition`] if `to` is not reachable from `from`
pub fn validate_transition(from: RecoveryState, to: RecoveryState) -> AtmResult<()> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(AtmError::InvalidTransition { from, to })
    }
}

/// States reachable from `from` in one transition
#[must_use]
pub fn allowed_transitions(from: RecoveryState) -> Vec<RecoveryState> {
    use RecoveryState::*;
    match from {
        Active => vec![RolledBack],
        RolledBack => vec![Branched, ClarificationNeeded],
        Branched => vec![Active],
        ClarificationNeeded => vec![Active],
    }
}

fn allowed(from: RecoveryState, to: RecoveryState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// One planner degree of freedom changed on a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perturbation {
    /// Rotate the preferred tool order
    AlternateToolOrder,
    /// Make the next query template active
    AlternateQueryTemplate,
    /// Halve the sampling temperature
    LowerTemperature,
    /// Raise the result filter level
    TightenFilter,
}

impl Perturbation {
    /// Order in which the primary perturbation rotates across rollbacks
    pub const ROTATION: [Self; 4] = [
        Self::AlternateToolOrder,
        Self::AlternateQueryTemplate,
        Self::TightenFilter,
        Self::LowerTemperature,
    ];

    /// Short name for logs
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlternateToolOrder => "tool_order",
            Self::AlternateQueryTemplate => "query_template",
            Self::LowerTemperature => "temperature",
            Self::TightenFilter => "filter",
        }
    }

    /// Whether applying this would change `cfg`
    #[must_use]
    pub fn applies_to(&self, cfg: &PlannerConfig) -> bool {
        match self {
            Self::AlternateToolOrder => cfg.tool_order.len() > 1,
            Self::AlternateQueryTemplate => cfg.query_templates.len() > 1,
            Self::LowerTemperature => cfg.temperature > 0.0,
            Self::TightenFilter => cfg.filter_level < u8::MAX,
        }
    }

    /// Perturbed copy of `cfg`
    #[must_use]
    pub fn apply(&self, cfg: &PlannerConfig) -> PlannerConfig {
        let mut next = cfg.clone();
        match self {
            Self::AlternateToolOrder => {
                if !next.tool_order.is_empty() {
                    next.tool_order.rotate_left(1);
                }
            }
            Self::AlternateQueryTemplate => {
                if !next.query_templates.is_empty() {
                    next.query_templates.rotate_left(1);
                    next.template_hashes.retain(|k, _| !k.starts_with("template:"));
                    for (i, template) in next.query_templates.iter().enumerate() {
                        next.template_hashes.insert(
                            format!("template:{i}"),
                            ContentHash::compute(template.as_bytes()),
                        );
                    }
                }
            }
            Self::LowerTemperature => next.temperature = (next.temperature / 2.0).max(0.0),
            Self::TightenFilter => next.filter_level = next.filter_level.saturating_add(1),
        }
        next
    }
}

/// Why a step was not integrated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCause {
    /// Constraint failures
    pub violations: Vec<Violation>,
    /// Detector triggers
    pub triggers: Vec<DetectorTrigger>,
    /// Reason lines from both
    pub reasons: Vec<String>,
}

impl RecoveryCause {
    fn new(verdict: &Verdict, report: &LoopReport) -> Self {
        let mut reasons = if verdict.ok {
            Vec::new()
        } else {
            verdict.reasons.clone()
        };
        reasons.extend(report.reasons());
        Self {
            violations: verdict.violations.clone(),
            triggers: report.triggers.clone(),
            reasons,
        }
    }

    /// A loop detector fired
    #[inline]
    #[must_use]
    pub fn is_loop(&self) -> bool {
        !self.triggers.is_empty()
    }

    /// As a recoverable error value
    #[must_use]
    pub fn to_error(&self) -> AtmError {
        if self.violations.is_empty() && self.is_loop() {
            AtmError::LoopTrigger {
                reasons: self.reasons.clone(),
            }
        } else {
            AtmError::ConstraintViolation {
                reasons: self.reasons.clone(),
            }
        }
    }
}

/// A single targeted question for the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    /// The question
    pub question: String,
    /// Constraint the question is about
    pub constraint: Option<String>,
    /// Goal leaf whose fact is missing
    pub goal_leaf: Option<String>,
}

impl ClarificationRequest {
    /// Question about the most recent violation, or else the active goal leaf
    #[must_use]
    pub fn for_cause(cause: &RecoveryCause, state: &AgentState) -> Self {
        if let Some(v) = cause.violations.last() {
            let observed = v
                .observed
                .as_ref()
                .map_or_else(|| "nothing".to_string(), ToString::to_string);
            return Self {
                question: format!(
                    "Constraint '{}' requires {} = {} but the results keep reporting {}. \
                     Which value should be used for {}?",
                    v.constraint, v.field, v.expected, observed, v.field
                ),
                constraint: Some(v.constraint.clone()),
                goal_leaf: None,
            };
        }

        match state.goal_tree.active() {
            Some(leaf) => {
                let detail = cause
                    .reasons
                    .last()
                    .map_or_else(String::new, |r| format!(" ({r})"));
                Self {
                    question: format!(
                        "No new facts were found for '{}'{detail}. \
                         Can you provide it or point to a source?",
                        leaf.description
                    ),
                    constraint: None,
                    goal_leaf: Some(leaf.id.clone()),
                }
            }
            None => Self {
                question: format!(
                    "The run cannot make progress: {}. How should it continue?",
                    cause.reasons.join("; ")
                ),
                constraint: None,
                goal_leaf: None,
            },
        }
    }
}

/// What the step loop should do with a result
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Integrate and snapshot
    Integrate,
    /// Roll back, then branch with perturbations
    Rollback { cause: RecoveryCause },
    /// Roll back and suspend until answered
    Clarify {
        cause: RecoveryCause,
        request: ClarificationRequest,
    },
}

/// Per-run recovery state machine
#[derive(Debug, Clone)]
pub struct RecoveryController {
    config: RecoveryConfig,
    state: RecoveryState,
    consecutive_rollbacks: u32,
    total_rollbacks: u32,
    pending: Option<ClarificationRequest>,
}

impl RecoveryController {
    /// Controller in `Active`
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: RecoveryState::Active,
            consecutive_rollbacks: 0,
            total_rollbacks: 0,
            pending: None,
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Rollbacks since the last successful integration or answer
    #[inline]
    #[must_use]
    pub fn consecutive_rollbacks(&self) -> u32 {
        self.consecutive_rollbacks
    }

    /// Rollbacks over the whole run
    #[inline]
    #[must_use]
    pub fn total_rollbacks(&self) -> u32 {
        self.total_rollbacks
    }

    /// Outstanding question while suspended
    #[must_use]
    pub fn pending(&self) -> Option<&ClarificationRequest> {
        self.pending.as_ref()
    }

    fn transition(&mut self, to: RecoveryState) -> AtmResult<()> {
        validate_transition(self.state, to)?;
        tracing::trace!(from = ?self.state, to = ?to, "recovery transition");
        self.state = to;
        Ok(())
    }

    /// Decide what to do with a step.
    ///
    /// `head` is the state the step started from; it names the goal leaf in
    /// a clarification question.
    ///
    /// # Errors
    /// Returns [`AtmError::InvalidTransition`] unless the controller is
    /// `Active`
    pub fn assess(
        &mut self,
        verdict: &Verdict,
        report: &LoopReport,
        head: &AgentState,
    ) -> AtmResult<Directive> {
        if verdict.ok && report.is_clear() {
            if self.state != RecoveryState::Active {
                return Err(AtmError::InvalidTransition {
                    from: self.state,
                    to: RecoveryState::Active,
                });
            }
            self.consecutive_rollbacks = 0;
            return Ok(Directive::Integrate);
        }

        self.transition(RecoveryState::RolledBack)?;
        self.consecutive_rollbacks += 1;
        self.total_rollbacks += 1;
        let cause = RecoveryCause::new(verdict, report);
        tracing::info!(
            consecutive = self.consecutive_rollbacks,
            reasons = ?cause.reasons,
            "step rejected, rolling back"
        );

        if self.consecutive_rollbacks >= self.config.clarification_after_rollbacks {
            self.transition(RecoveryState::ClarificationNeeded)?;
            let request = ClarificationRequest::for_cause(&cause, head);
            tracing::warn!(question = %request.question, "clarification needed");
            self.pending = Some(request.clone());
            return Ok(Directive::Clarify { cause, request });
        }
        Ok(Directive::Rollback { cause })
    }

    /// Most recent snapshot in `head`'s ancestry that added knowledge over
    /// its parent and whose facts satisfy its locked constraints; the run
    /// root if none qualifies.
    ///
    /// # Errors
    /// Returns a storage error if an ancestor cannot be read or rebuilt
    pub fn rollback_target(
        &self,
        store: &SnapshotStore,
        verifier: &ConstraintVerifier,
        head: SnapshotId,
    ) -> AtmResult<SnapshotId> {
        let chain = store.ancestors(head)?;
        for id in &chain {
            let record = store.get_snapshot(*id)?;
            if !record.is_milestone {
                continue;
            }
            let state = store.reconstruct(*id)?;
            let verdict = verifier.check_facts(&state);
            if verdict.ok {
                return Ok(*id);
            }
            tracing::debug!(snapshot_id = %id, reasons = ?verdict.reasons, "milestone rejected as rollback target");
        }
        chain
            .last()
            .copied()
            .ok_or(AtmError::NotFound(atm_store::StoreError::SnapshotNotFound(head)))
    }

    /// Perturbations for the next branch
    #[must_use]
    pub fn perturbations_for(&self, cfg: &PlannerConfig, cause: &RecoveryCause) -> Vec<Perturbation> {
        let rotation = Perturbation::ROTATION;
        let start = self.total_rollbacks.saturating_sub(1) as usize % rotation.len();
        let mut chosen: Vec<Perturbation> = (0..rotation.len())
            .map(|i| rotation[(start + i) % rotation.len()])
            .filter(|p| p.applies_to(cfg))
            .take(1)
            .collect();

        let extra = Perturbation::LowerTemperature;
        if cause.is_loop()
            && chosen.len() < self.config.max_perturbations
            && !chosen.contains(&extra)
            && extra.applies_to(cfg)
        {
            chosen.push(extra);
        }
        chosen.truncate(self.config.max_perturbations.max(1));
        chosen
    }

    /// Move `RolledBack → Branched → Active`, returning the perturbed
    /// planner configuration for the branch
    ///
    /// # Errors
    /// Returns [`AtmError::InvalidTransition`] unless the controller is
    /// `RolledBack`
    pub fn branch(
        &mut self,
        cfg: &PlannerConfig,
        cause: &RecoveryCause,
    ) -> AtmResult<(PlannerConfig, Vec<Perturbation>)> {
        self.transition(RecoveryState::Branched)?;
        let perturbations = self.perturbations_for(cfg, cause);
        if perturbations.is_empty() {
            tracing::warn!("no perturbation applies, branching with the same planner settings");
        }
        let perturbed = perturbations.iter().fold(cfg.clone(), |c, p| p.apply(&c));
        self.transition(RecoveryState::Active)?;
        Ok((perturbed, perturbations))
    }

    /// Clear a clarification and return to `Active`
    ///
    /// # Errors
    /// Returns [`AtmError::InvalidTransition`] unless the controller is
    /// `ClarificationNeeded`
    pub fn resolve(&mut self) -> AtmResult<ClarificationRequest> {
        self.transition(RecoveryState::Active)?;
        self.consecutive_rollbacks = 0;
        self.pending.take().ok_or(AtmError::InvalidTransition {
            from: RecoveryState::ClarificationNeeded,
            to: RecoveryState::Active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atm_guard::{DetectorKind, FieldEqualsCheck};
    use atm_state::{Constraint, GoalTree};

    fn violation(field: &str, expected: &str, observed: &str) -> Verdict {
        Verdict {
            ok: false,
            reasons: vec![format!("{field}: expected {expected}")],
            violations: vec![Violation {
                constraint: field.into(),
                kind: "geo_membership".into(),
                field: field.into(),
                expected: expected.into(),
                observed: Some(observed.into()),
                reason: "not allowed".into(),
            }],
        }
    }

    fn stalled() -> LoopReport {
        LoopReport {
            triggers: vec![DetectorTrigger {
                kind: DetectorKind::NoProgress,
                reason: "10 calls without new facts".into(),
            }],
        }
    }

    fn head() -> AgentState {
        AgentState::new(
            GoalTree::new("root", "Find parcels").with_task("fips", "Resolve the county FIPS code", "root"),
            PlannerConfig::default().with_tool("geocode").with_tool("parcel_search"),
        )
    }

    #[test]
    fn pass_keeps_active_and_resets_counter() {
        let mut c = RecoveryController::new(RecoveryConfig::default());
        let d = c.assess(&violation("county_fips", "53033", "53057"), &LoopReport::default(), &head()).unwrap();
        assert!(matches!(d, Directive::Rollback { .. }));
        c.branch(&head().planner_cfg, &RecoveryCause::default()).unwrap();
        assert_eq!(c.consecutive_rollbacks(), 1);

        let d = c.assess(&Verdict::pass(), &LoopReport::default(), &head()).unwrap();
        assert_eq!(d, Directive::Integrate);
        assert_eq!(c.consecutive_rollbacks(), 0);
        assert_eq!(c.total_rollbacks(), 1);
        assert_eq!(c.state(), RecoveryState::Active);
    }

    #[test]
    fn second_consecutive_rollback_asks_once() {
        let mut c = RecoveryController::new(RecoveryConfig::default());
        let bad = violation("county_fips", "53033", "53057");
        c.assess(&bad, &LoopReport::default(), &head()).unwrap();
        c.branch(&head().planner_cfg, &RecoveryCause::default()).unwrap();

        let Directive::Clarify { request, .. } = c.assess(&bad, &LoopReport::default(), &head()).unwrap() else {
            panic!("expected clarification");
        };
        assert_eq!(c.state(), RecoveryState::ClarificationNeeded);
        assert_eq!(request.constraint.as_deref(), Some("county_fips"));
        assert!(request.question.contains("53057"));

        // Suspended: no further assessment until resolved
        assert!(c.assess(&Verdict::pass(), &LoopReport::default(), &head()).is_err());
        assert!(c.assess(&bad, &LoopReport::default(), &head()).is_err());

        let resolved = c.resolve().unwrap();
        assert_eq!(resolved, request);
        assert_eq!(c.state(), RecoveryState::Active);
        assert_eq!(c.consecutive_rollbacks(), 0);
    }

    #[test]
    fn loop_question_names_the_goal_leaf() {
        let mut c = RecoveryController::new(RecoveryConfig {
            clarification_after_rollbacks: 1,
            ..RecoveryConfig::default()
        });
        let Directive::Clarify { request, .. } = c.assess(&Verdict::pass(), &stalled(), &head()).unwrap() else {
            panic!("expected clarification");
        };
        assert_eq!(request.goal_leaf.as_deref(), Some("fips"));
        assert!(request.question.contains("Resolve the county FIPS code"));
    }

    #[test]
    fn first_perturbation_rotates_tool_order() {
        let mut c = RecoveryController::new(RecoveryConfig::default());
        c.assess(&violation("county_fips", "53033", "53057"), &LoopReport::default(), &head()).unwrap();
        let cfg = head().planner_cfg;
        let (perturbed, applied) = c.branch(&cfg, &RecoveryCause::default()).unwrap();
        assert_eq!(applied, vec![Perturbation::AlternateToolOrder]);
        assert_eq!(perturbed.tool_order, vec!["parcel_search", "geocode"]);
        assert_eq!(perturbed.temperature, cfg.temperature);
    }

    #[test]
    fn loop_trigger_adds_lower_temperature() {
        let mut c = RecoveryController::new(RecoveryConfig::default());
        let Directive::Rollback { cause } = c.assess(&Verdict::pass(), &stalled(), &head()).unwrap() else {
            panic!("expected rollback");
        };
        let cfg = head().planner_cfg;
        let (perturbed, applied) = c.branch(&cfg, &cause).unwrap();
        assert_eq!(
            applied,
            vec![Perturbation::AlternateToolOrder, Perturbation::LowerTemperature]
        );
        assert!(perturbed.temperature < cfg.temperature);
    }

    #[test]
    fn perturbations_respect_the_cap() {
        let c = RecoveryController::new(RecoveryConfig {
            max_perturbations: 1,
            ..RecoveryConfig::default()
        });
        let cause = RecoveryCause::new(&Verdict::pass(), &stalled());
        assert_eq!(c.perturbations_for(&head().planner_cfg, &cause).len(), 1);
    }

    #[test]
    fn inapplicable_dimensions_are_skipped() {
        let c = RecoveryController::new(RecoveryConfig::default());
        let cfg = PlannerConfig::default().with_tool("only_tool");
        let applied = c.perturbations_for(&cfg, &RecoveryCause::default());
        assert_eq!(applied, vec![Perturbation::TightenFilter]);
    }

    #[test]
    fn template_rotation_rekeys_hashes() {
        let cfg = PlannerConfig::default()
            .with_template("parcels in {city}")
            .with_template("{city} county parcels");
        let next = Perturbation::AlternateQueryTemplate.apply(&cfg);
        assert_eq!(next.query_templates[0], "{city} county parcels");
        assert_eq!(
            next.template_hashes["template:0"],
            ContentHash::compute(b"{city} county parcels")
        );
    }

    #[test]
    fn rollback_target_skips_violating_milestones() {
        let store = SnapshotStore::in_memory(atm_store::StoreConfig::default());
        let run = atm_state::RunId::new();
        let mut verifier = ConstraintVerifier::new();
        verifier.register(FieldEqualsCheck);

        let root_state = head().with_constraint(Constraint::field_equals("city", "Seattle"));
        let root = store.snapshot(run, &root_state, None).unwrap();

        let out = ContentHash::compute(b"city=Tacoma");
        let record = atm_state::ToolCallRecord {
            id: atm_state::ToolCallId::new(),
            snapshot_id: root,
            name: "geocode".into(),
            input_digest: ContentHash::compute(b"q"),
            output_digest: out,
            status: atm_state::ToolStatus::Ok,
            latency: std::time::Duration::ZERO,
            url: None,
            created_at: chrono::Utc::now(),
        };
        let bad_state = root_state
            .integrate(atm_state::Integration {
                tool_calls: vec![record],
                facts: vec![atm_state::Fact::new("parcel", "city", "Tacoma", out)],
                ..Default::default()
            })
            .unwrap();
        let bad = store.snapshot(run, &bad_state, Some(root)).unwrap();
        assert!(store.get_snapshot(bad).unwrap().is_milestone);

        let c = RecoveryController::new(RecoveryConfig::default());
        assert_eq!(c.rollback_target(&store, &verifier, bad).unwrap(), root);
    }
}
