//! Seams to the planner, executor and tools
//!
//! The core never looks inside a [`Plan`]. Executors reach tools only through
//! the [`ToolGateway`] they are handed, which enforces the allowlist and the
//! call budget, memoizes outputs and writes the ledger records.

use atm_memo::{CacheError, MemoizationCache};
use atm_state::{AgentState, ContentHash, Fact, SnapshotId, ToolCallId, ToolCallRecord, ToolStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Opaque plan, recorded for audit only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// One-line description
    pub summary: String,
    /// Planner-specific content
    pub body: Value,
}

impl Plan {
    /// Plan with a summary and no body
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            body: Value::Null,
        }
    }

    /// With body
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// What an executor reports for one step
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Structured result checked against locked constraints
    pub output: Value,
    /// Overall outcome
    pub status: ToolStatus,
    /// Facts extracted from tool outputs
    pub facts: Vec<Fact>,
    /// Whether the active goal leaf is done
    pub complete_leaf: bool,
    /// Replacement scratch summary
    pub scratch_summary: Option<String>,
}

impl ExecutionResult {
    /// Successful result
    #[must_use]
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            status: ToolStatus::Ok,
            facts: Vec::new(),
            complete_leaf: false,
            scratch_summary: None,
        }
    }

    /// Failed result
    #[must_use]
    pub fn failed(class: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error {
                class: class.into(),
            },
            ..Self::ok(Value::Null)
        }
    }

    /// With facts
    #[must_use]
    pub fn with_facts(mut self, facts: Vec<Fact>) -> Self {
        self.facts = facts;
        self
    }

    /// Mark the active leaf complete
    #[must_use]
    pub fn completing_leaf(mut self) -> Self {
        self.complete_leaf = true;
        self
    }
}

/// Proposes the next plan
#[async_trait]
pub trait Planner: Send + Sync {
    /// Plan the next step from `state`
    async fn propose(&self, state: &AgentState) -> anyhow::Result<Plan>;
}

/// Carries out a plan using the gateway's tools
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `plan`
    async fn run(
        &self,
        plan: &Plan,
        state: &AgentState,
        tools: &ToolGateway<'_>,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Output of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Raw output bytes
    pub bytes: Vec<u8>,
    /// Source locator
    pub url: Option<String>,
}

impl ToolOutput {
    /// Output without a locator
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            url: None,
        }
    }

    /// With source locator
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Classified tool failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ToolFailure {
    /// Error class (timeout, http_5xx, not_allowed, ...)
    pub class: String,
    /// Detail
    pub message: String,
}

impl ToolFailure {
    /// Create failure
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

/// Invokes external tools
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `tool` on a canonical input
    async fn call(&self, tool: &str, input: &Value) -> Result<ToolOutput, ToolFailure>;
}

/// Successful gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResponse {
    /// Output bytes
    pub output: Vec<u8>,
    /// Digest to cite as a fact's source
    pub output_digest: ContentHash,
    /// Served from the memoization cache
    pub cached: bool,
}

impl ToolResponse {
    /// Output parsed as JSON
    ///
    /// # Errors
    /// Returns error if the output is not JSON
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.output)
    }
}

/// A recorded call plus the text the loop detectors compare.
///
/// Carries one reference on `record.output_digest`, handed over to the
/// ledger by `SnapshotStore::record_tool_calls`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallTrace {
    /// Ledger record
    pub record: ToolCallRecord,
    /// Canonical input text
    pub input_text: String,
    /// Output or error text
    pub output_text: String,
}

/// Tool access for one step
pub struct ToolGateway<'a> {
    snapshot_id: SnapshotId,
    allowlist: &'a BTreeSet<String>,
    memo: &'a MemoizationCache,
    runner: &'a dyn ToolRunner,
    ttl: Option<Duration>,
    call_budget: usize,
    calls: Mutex<Vec<CallTrace>>,
    fatal: Mutex<Option<CacheError>>,
}

impl std::fmt::Debug for ToolGateway<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGateway")
            .field("snapshot_id", &self.snapshot_id)
            .field("allowlist", &self.allowlist)
            .field("call_budget", &self.call_budget)
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl<'a> ToolGateway<'a> {
    /// Gateway for a step taken from `snapshot_id`
    #[must_use]
    pub fn new(
        snapshot_id: SnapshotId,
        allowlist: &'a BTreeSet<String>,
        memo: &'a MemoizationCache,
        runner: &'a dyn ToolRunner,
    ) -> Self {
        Self {
            snapshot_id,
            allowlist,
            memo,
            runner,
            ttl: None,
            call_budget: usize::MAX,
            calls: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
        }
    }

    /// With a per-call memo lifetime
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// With a cap on calls made through this gateway
    #[must_use]
    pub fn with_call_budget(mut self, budget: usize) -> Self {
        self.call_budget = budget;
        self
    }

    /// Calls made so far
    #[must_use]
    pub fn calls_made(&self) -> usize {
        self.calls.lock().len()
    }

    /// Invoke `tool`, serving from the memoization cache when possible.
    ///
    /// Every attempt that reaches the allowlist check is recorded, failures
    /// included; the error text is stored as the record's output blob. Each
    /// record holds one reference on its output blob for the run's ledger.
    ///
    /// # Errors
    /// Returns the tool's [`ToolFailure`]. Storage failures are returned as
    /// class `storage` and also kept for the step loop to escalate.
    pub async fn call(&self, tool: &str, input: &Value) -> Result<ToolResponse, ToolFailure> {
        let input_bytes = ContentHash::canonical_bytes(input)
            .map_err(|e| ToolFailure::new("invalid_input", e.to_string()))?;
        let input_digest = ContentHash::compute(&input_bytes);
        let input_text = String::from_utf8_lossy(&input_bytes).into_owned();

        if self.calls_made() >= self.call_budget {
            return Err(ToolFailure::new(
                "budget_exhausted",
                format!("tool call budget of {} reached", self.call_budget),
            ));
        }
        if !self.allowlist.contains(tool) {
            let failure = ToolFailure::new("not_allowed", format!("tool '{tool}' is not allowed"));
            self.record_failure(tool, input_digest, input_text, &failure, Duration::ZERO)?;
            return Err(failure);
        }

        let started = Instant::now();
        let url = Mutex::new(None);
        let result = self
            .memo
            .get_or_compute(tool, &input_bytes, self.ttl, || async {
                let output = self.runner.call(tool, input).await?;
                *url.lock() = output.url;
                Ok(output.bytes)
            })
            .await;

        match result {
            Ok(memoized) => {
                let output = self
                    .memo
                    .fetch(&memoized.output_digest)
                    .map_err(|e| self.escalate(e))?;
                // The ledger's own reference; the memo entry may expire first.
                self.memo
                    .content()
                    .put_retained(&output)
                    .map_err(|e| self.escalate(e))?;
                let latency = if memoized.cached {
                    Duration::ZERO
                } else {
                    started.elapsed()
                };
                let record = ToolCallRecord {
                    id: ToolCallId::new(),
                    snapshot_id: self.snapshot_id,
                    name: tool.to_string(),
                    input_digest,
                    output_digest: memoized.output_digest,
                    status: ToolStatus::Ok,
                    latency,
                    url: url.into_inner(),
                    created_at: Utc::now(),
                };
                tracing::debug!(
                    tool,
                    output = %memoized.output_digest.short(),
                    cached = memoized.cached,
                    "tool call"
                );
                self.calls.lock().push(CallTrace {
                    record,
                    input_text,
                    output_text: String::from_utf8_lossy(&output).into_owned(),
                });
                Ok(ToolResponse {
                    output,
                    output_digest: memoized.output_digest,
                    cached: memoized.cached,
                })
            }
            Err(e) => match e.compute_error() {
                Some(source) => {
                    let failure = source
                        .downcast_ref::<ToolFailure>()
                        .cloned()
                        .unwrap_or_else(|| ToolFailure::new("error", format!("{source:#}")));
                    self.record_failure(tool, input_digest, input_text, &failure, started.elapsed())?;
                    Err(failure)
                }
                None => Err(self.escalate(e)),
            },
        }
    }

    fn record_failure(
        &self,
        tool: &str,
        input_digest: ContentHash,
        input_text: String,
        failure: &ToolFailure,
        latency: Duration,
    ) -> Result<(), ToolFailure> {
        let text = failure.to_string();
        let output_digest = self
            .memo
            .content()
            .put_retained(text.as_bytes())
            .map_err(|e| self.escalate(e))?;
        tracing::debug!(tool, class = %failure.class, "tool call failed");
        self.calls.lock().push(CallTrace {
            record: ToolCallRecord {
                id: ToolCallId::new(),
                snapshot_id: self.snapshot_id,
                name: tool.to_string(),
                input_digest,
                output_digest,
                status: ToolStatus::Error {
                    class: failure.class.clone(),
                },
                latency,
                url: None,
                created_at: Utc::now(),
            },
            input_text,
            output_text: text,
        });
        Ok(())
    }

    fn escalate(&self, e: impl Into<CacheError>) -> ToolFailure {
        let e = e.into();
        tracing::error!(error = %e, "tool output storage failed");
        let failure = ToolFailure::new("storage", e.to_string());
        *self.fatal.lock() = Some(e);
        failure
    }

    /// Recorded calls and the first storage failure, if any
    #[must_use]
    pub fn finish(self) -> (Vec<CallTrace>, Option<CacheError>) {
        (self.calls.into_inner(), self.fatal.into_inner())
    }
}
