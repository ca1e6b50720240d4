//! Testing utilities for ATM workspace
//!
//! Shared fixtures and scripted collaborators for driving runs end to end.

#![allow(missing_docs)]

use async_trait::async_trait;
use atm_core::{
    AtmConfig, AtmContext, ExecutionResult, Executor, Plan, Planner, ToolFailure, ToolGateway,
    ToolOutput, ToolRunner,
};
use atm_state::{
    AgentState, Budgets, Constraint, ContentHash, Fact, GoalTree, PlannerConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const GEOCODE: &str = "geocode";
pub const PARCEL_SEARCH: &str = "parcel_search";

/// Goal tree for the parcel lookup used across tests
pub fn seattle_goals() -> GoalTree {
    GoalTree::new("root", "Find vacant parcels in Seattle")
        .with_task("county", "Resolve the county FIPS code for Seattle", "root")
        .with_task("parcels", "List vacant parcels in the county", "root")
}

/// Planner settings with two tools and two query templates
pub fn seattle_planner() -> PlannerConfig {
    PlannerConfig::default()
        .with_seed(7)
        .with_tool(GEOCODE)
        .with_tool(PARCEL_SEARCH)
        .with_template("parcels in {city}")
        .with_template("{county} county vacant land")
}

/// Initial state: `city == "Seattle"`, `county_fips in ["53033"]`
pub fn seattle_state() -> AgentState {
    AgentState::new(seattle_goals(), seattle_planner())
        .with_constraint(Constraint::field_equals("city", "Seattle"))
        .with_constraint(Constraint::geo_membership("county_fips", ["53033"]))
}

/// Same as [`seattle_state`] with custom budgets
pub fn seattle_state_with_budgets(budgets: Budgets) -> AgentState {
    let state = seattle_state();
    let cfg = state.planner_cfg.clone().with_budgets(budgets);
    state.with_planner_cfg(cfg)
}

pub fn test_context() -> AtmContext {
    AtmContext::in_memory(AtmConfig::default()).unwrap()
}

pub fn test_context_with(config: AtmConfig) -> AtmContext {
    AtmContext::in_memory(config).unwrap()
}

/// Planner that counts proposals and names each plan after its number
#[derive(Debug, Default)]
pub struct CountingPlanner {
    proposals: AtomicUsize,
}

impl CountingPlanner {
    pub fn proposals(&self) -> usize {
        self.proposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for CountingPlanner {
    async fn propose(&self, state: &AgentState) -> anyhow::Result<Plan> {
        let n = self.proposals.fetch_add(1, Ordering::SeqCst);
        Ok(Plan::new(format!("plan {n}")).with_body(json!({
            "tools": state.planner_cfg.tool_order,
            "temperature": state.planner_cfg.temperature,
        })))
    }
}

/// One scripted executor step
#[derive(Debug, Clone, Default)]
pub struct ScriptStep {
    calls: Vec<(String, Value)>,
    output: Value,
    facts: Vec<(String, String, Value)>,
    unsourced: Vec<(String, String, Value)>,
    confidence: Option<f64>,
    complete_leaf: bool,
}

impl ScriptStep {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn call(mut self, tool: &str, input: Value) -> Self {
        self.calls.push((tool.to_string(), input));
        self
    }

    /// Fact sourced from the last successful call's output
    pub fn fact(mut self, subject: &str, predicate: &str, object: impl Into<Value>) -> Self {
        self.facts
            .push((subject.to_string(), predicate.to_string(), object.into()));
        self
    }

    /// Fact citing an output no call produced
    pub fn unsourced_fact(mut self, subject: &str, predicate: &str, object: impl Into<Value>) -> Self {
        self.unsourced
            .push((subject.to_string(), predicate.to_string(), object.into()));
        self
    }

    /// Confidence given to this step's facts
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn completing_leaf(mut self) -> Self {
        self.complete_leaf = true;
        self
    }
}

/// Executor that plays back steps in order and repeats the last one
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<ScriptStep>>,
}

impl ScriptedExecutor {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
        }
    }

    fn next_step(&self) -> ScriptStep {
        let next = self.steps.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(
        &self,
        _plan: &Plan,
        _state: &AgentState,
        tools: &ToolGateway<'_>,
    ) -> anyhow::Result<ExecutionResult> {
        let step = self.next_step();
        let mut source = None;
        for (tool, input) in &step.calls {
            match tools.call(tool, input).await {
                Ok(response) => source = Some(response.output_digest),
                Err(failure) => return Ok(ExecutionResult::failed(failure.class)),
            }
        }

        let mut facts: Vec<Fact> = match source {
            Some(digest) => step
                .facts
                .iter()
                .map(|(s, p, o)| Fact::new(s.clone(), p.clone(), o.clone(), digest))
                .collect(),
            None => Vec::new(),
        };
        if let Some(confidence) = step.confidence {
            facts = facts
                .into_iter()
                .map(|f| f.with_confidence(confidence))
                .collect();
        }
        let bogus = ContentHash::compute(b"no tool produced this");
        facts.extend(
            step.unsourced
                .iter()
                .map(|(s, p, o)| Fact::new(s.clone(), p.clone(), o.clone(), bogus)),
        );

        let mut result = ExecutionResult::ok(step.output.clone()).with_facts(facts);
        if step.complete_leaf {
            result = result.completing_leaf();
        }
        Ok(result)
    }
}

type Responder = Box<dyn Fn(&Value) -> Result<ToolOutput, ToolFailure> + Send + Sync>;

/// Tool runner backed by per-tool closures
#[derive(Default)]
pub struct ScriptedTools {
    responders: HashMap<String, Responder>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl std::fmt::Debug for ScriptedTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTools")
            .field("tools", &self.responders.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(mut self, tool: &str, responder: F) -> Self
    where
        F: Fn(&Value) -> Result<ToolOutput, ToolFailure> + Send + Sync + 'static,
    {
        self.responders.insert(tool.to_string(), Box::new(responder));
        self
    }

    /// Tool that returns its input as JSON
    pub fn echo(self, tool: &str) -> Self {
        self.respond(tool, |input| Ok(ToolOutput::new(input.to_string())))
    }

    /// Tool that always fails with `class`
    pub fn failing(self, tool: &str, class: &'static str) -> Self {
        self.respond(tool, move |_| Err(ToolFailure::new(class, "scripted failure")))
    }

    /// Invocations that reached a responder
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ToolRunner for ScriptedTools {
    async fn call(&self, tool: &str, input: &Value) -> Result<ToolOutput, ToolFailure> {
        self.calls.lock().push((tool.to_string(), input.clone()));
        match self.responders.get(tool) {
            Some(respond) => respond(input),
            None => Err(ToolFailure::new("unknown_tool", tool.to_string())),
        }
    }
}

/// Standard collaborators for a Seattle run
pub fn collaborators(
    steps: impl IntoIterator<Item = ScriptStep>,
) -> (Arc<CountingPlanner>, Arc<ScriptedExecutor>, Arc<ScriptedTools>) {
    (
        Arc::new(CountingPlanner::default()),
        Arc::new(ScriptedExecutor::new(steps)),
        Arc::new(ScriptedTools::new().echo(GEOCODE).echo(PARCEL_SEARCH)),
    )
}
