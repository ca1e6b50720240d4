//! Pluggable constraint verification
//!
//! Each constraint kind is a [`ConstraintCheck`]: a pure function of the
//! observed field value and the constraint's literal parameters. The
//! [`ConstraintVerifier`] looks the check up by kind name, evaluates every
//! constraint and reports every failure. A kind with no registered check
//! fails closed.

use atm_state::{AgentState, Constraint, ConstraintKind};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Why a value failed a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// What the constraint requires, rendered for humans
    pub expected: String,
    /// Why the observed value does not satisfy it
    pub reason: String,
}

impl Mismatch {
    /// New mismatch
    #[must_use]
    pub fn new(expected: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
            reason: reason.into(),
        }
    }
}

/// Evaluation of one constraint kind.
///
/// Implementations must be deterministic and side-effect free: verdicts are
/// replayed during audits.
pub trait ConstraintCheck: Send + Sync + Debug {
    /// Kind name this check handles (see [`ConstraintKind::name`])
    fn kind(&self) -> &'static str;

    /// Check one observed value against the constraint's parameters
    ///
    /// # Errors
    /// Returns a [`Mismatch`] if the value violates the constraint or the
    /// parameters are unusable
    fn check(&self, observed: &Value, constraint: &Constraint) -> Result<(), Mismatch>;
}

/// One failed constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Constraint name
    pub constraint: String,
    /// Kind name
    pub kind: String,
    /// Result field inspected
    pub field: String,
    /// Required value, rendered
    pub expected: String,
    /// Observed value, `None` if the field was missing
    pub observed: Option<Value>,
    /// Human-readable reason
    pub reason: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.observed {
            Some(observed) => write!(
                f,
                "{}: {} expected {}, observed {} ({})",
                self.constraint, self.field, self.expected, observed, self.reason
            ),
            None => write!(
                f,
                "{}: {} expected {}, field missing ({})",
                self.constraint, self.field, self.expected, self.reason
            ),
        }
    }
}

/// Composite verdict: logical AND of every evaluated constraint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// All checks passed
    pub ok: bool,
    /// One line per failing check
    pub reasons: Vec<String>,
    /// Structured failures, same order as `reasons`
    pub violations: Vec<Violation>,
}

impl Verdict {
    /// Passing verdict
    #[must_use]
    pub fn pass() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    fn push(&mut self, violation: Violation) {
        self.ok = false;
        self.reasons.push(violation.to_string());
        self.violations.push(violation);
    }

    /// Most recent (last evaluated) violation
    #[must_use]
    pub fn primary(&self) -> Option<&Violation> {
        self.violations.last()
    }
}

/// Which constraints a verification considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Missing fields are violations
    Strict,
    /// Constraints on fields the result does not carry are skipped
    Applicable,
}

/// Registry of constraint checks
#[derive(Debug, Clone, Default)]
pub struct ConstraintVerifier {
    checks: HashMap<&'static str, Arc<dyn ConstraintCheck>>,
}

impl ConstraintVerifier {
    /// Create empty verifier (every constraint fails closed)
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier with the built-in checks
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut verifier = Self::new();
        verifier.register(FieldEqualsCheck);
        verifier.register(GeoMembershipCheck);
        verifier.register(DateRangeCheck);
        verifier.register(EntityTypeCheck);
        verifier
    }

    /// Register (or replace) the check for a kind
    pub fn register(&mut self, check: impl ConstraintCheck + 'static) {
        self.checks.insert(check.kind(), Arc::new(check));
    }

    /// Whether a kind has a check
    #[must_use]
    pub fn supports(&self, kind: &ConstraintKind) -> bool {
        self.checks.contains_key(kind.name())
    }

    /// Registered kind names
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.checks.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Check `result` against every constraint; a missing field is a
    /// violation
    pub fn check<'a, I>(&self, result: &Value, constraints: I) -> Verdict
    where
        I: IntoIterator<Item = &'a Constraint>,
    {
        self.evaluate(result, constraints, Scope::Strict)
    }

    /// Check `result` against the constraints whose field it carries
    pub fn check_applicable<'a, I>(&self, result: &Value, constraints: I) -> Verdict
    where
        I: IntoIterator<Item = &'a Constraint>,
    {
        self.evaluate(result, constraints, Scope::Applicable)
    }

    /// Re-verify a state's own evidence (its latest fact per predicate)
    /// against its locked constraints
    #[must_use]
    pub fn check_facts(&self, state: &AgentState) -> Verdict {
        self.check_applicable(&state.fact_view(), state.locked_constraints())
    }

    fn evaluate<'a, I>(&self, result: &Value, constraints: I, scope: Scope) -> Verdict
    where
        I: IntoIterator<Item = &'a Constraint>,
    {
        let mut verdict = Verdict::pass();
        for constraint in constraints {
            let field = constraint.field();
            let observed = lookup(result, field);
            if observed.is_none() && scope == Scope::Applicable {
                continue;
            }

            let Some(check) = self.checks.get(constraint.kind.name()) else {
                verdict.push(Violation {
                    constraint: constraint.name.clone(),
                    kind: constraint.kind.name().to_string(),
                    field: field.to_string(),
                    expected: "a registered constraint kind".to_string(),
                    observed: observed.cloned(),
                    reason: format!("no check registered for kind `{}`", constraint.kind.name()),
                });
                continue;
            };

            let outcome = match observed {
                Some(value) => check.check(value, constraint),
                None => Err(Mismatch::new(
                    describe_params(constraint),
                    "field missing from result",
                )),
            };
            if let Err(mismatch) = outcome {
                verdict.push(Violation {
                    constraint: constraint.name.clone(),
                    kind: check.kind().to_string(),
                    field: field.to_string(),
                    expected: mismatch.expected,
                    observed: observed.cloned(),
                    reason: mismatch.reason,
                });
            }
        }
        if !verdict.ok {
            tracing::debug!(failures = verdict.violations.len(), "constraint verification failed");
        }
        verdict
    }
}

/// Resolve a dotted field path in a JSON object
fn lookup<'v>(result: &'v Value, field: &str) -> Option<&'v Value> {
    if let Some(direct) = result.get(field) {
        return Some(direct).filter(|v| !v.is_null());
    }
    field
        .split('.')
        .try_fold(result, |value, part| value.get(part))
        .filter(|v| !v.is_null())
}

fn describe_params(constraint: &Constraint) -> String {
    serde_json::to_string(&constraint.params).unwrap_or_else(|_| "parameters".to_string())
}

/// Observed value as a plain string (strings unquoted, numbers rendered)
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `allowed` array, or a single `value`, as strings
fn allowed_set(constraint: &Constraint) -> Result<Vec<String>, Mismatch> {
    let raw = constraint
        .params
        .get("allowed")
        .or_else(|| constraint.params.get("value"))
        .ok_or_else(|| Mismatch::new("`allowed` parameter", "constraint has no allowed values"))?;
    let values: Vec<String> = match raw {
        Value::Array(items) => items.iter().filter_map(as_text).collect(),
        other => as_text(other).into_iter().collect(),
    };
    if values.is_empty() {
        return Err(Mismatch::new("`allowed` parameter", "allowed set is empty"));
    }
    Ok(values)
}

/// Result field equals a literal `value`
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldEqualsCheck;

impl ConstraintCheck for FieldEqualsCheck {
    fn kind(&self) -> &'static str {
        "field_equals"
    }

    fn check(&self, observed: &Value, constraint: &Constraint) -> Result<(), Mismatch> {
        let expected = constraint
            .params
            .get("value")
            .ok_or_else(|| Mismatch::new("`value` parameter", "constraint has no value"))?;
        let matches = match (as_text(observed), as_text(expected)) {
            (Some(o), Some(e)) => o == e,
            _ => observed == expected,
        };
        if matches {
            Ok(())
        } else {
            Err(Mismatch::new(expected.to_string(), "value differs"))
        }
    }
}

/// Result field is one of a set of administrative codes
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoMembershipCheck;

impl ConstraintCheck for GeoMembershipCheck {
    fn kind(&self) -> &'static str {
        "geo_membership"
    }

    fn check(&self, observed: &Value, constraint: &Constraint) -> Result<(), Mismatch> {
        let allowed = allowed_set(constraint)?;
        let expected = format!("one of [{}]", allowed.join(", "));
        let Some(code) = as_text(observed) else {
            return Err(Mismatch::new(expected, "not an administrative code"));
        };
        if allowed.iter().any(|a| *a == code) {
            Ok(())
        } else {
            Err(Mismatch::new(expected, format!("{code} is outside the allowed area")))
        }
    }
}

/// Result field is a date within `[from, to]` (either bound optional)
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRangeCheck;

impl DateRangeCheck {
    fn parse(value: &Value) -> Option<NaiveDate> {
        let text = value.as_str()?.trim();
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
    }

    fn bound(constraint: &Constraint, key: &str) -> Result<Option<NaiveDate>, Mismatch> {
        match constraint.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Self::parse(v)
                .map(Some)
                .ok_or_else(|| Mismatch::new(format!("`{key}` as YYYY-MM-DD"), format!("bad `{key}` parameter {v}"))),
        }
    }
}

impl ConstraintCheck for DateRangeCheck {
    fn kind(&self) -> &'static str {
        "date_range"
    }

    fn check(&self, observed: &Value, constraint: &Constraint) -> Result<(), Mismatch> {
        let from = Self::bound(constraint, "from")?;
        let to = Self::bound(constraint, "to")?;
        if from.is_none() && to.is_none() {
            return Err(Mismatch::new("`from` or `to` parameter", "date range has no bounds"));
        }
        let expected = format!(
            "date in [{}, {}]",
            from.map_or_else(|| "..".to_string(), |d| d.to_string()),
            to.map_or_else(|| "..".to_string(), |d| d.to_string())
        );
        let Some(date) = Self::parse(observed) else {
            return Err(Mismatch::new(expected, "not a date"));
        };
        if from.is_some_and(|f| date < f) {
            return Err(Mismatch::new(expected, format!("{date} is before the range")));
        }
        if to.is_some_and(|t| date > t) {
            return Err(Mismatch::new(expected, format!("{date} is after the range")));
        }
        Ok(())
    }
}

/// Result entity type is one of a set of types (case-insensitive)
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityTypeCheck;

impl ConstraintCheck for EntityTypeCheck {
    fn kind(&self) -> &'static str {
        "entity_type"
    }

    fn check(&self, observed: &Value, constraint: &Constraint) -> Result<(), Mismatch> {
        let allowed = allowed_set(constraint)?;
        let expected = format!("type in [{}]", allowed.join(", "));
        let Some(kind) = as_text(observed) else {
            return Err(Mismatch::new(expected, "not an entity type"));
        };
        if allowed.iter().any(|a| a.eq_ignore_ascii_case(&kind)) {
            Ok(())
        } else {
            Err(Mismatch::new(expected, format!("{kind} is not an accepted type")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seattle() -> Vec<Constraint> {
        vec![
            Constraint::field_equals("city", "Seattle"),
            Constraint::geo_membership("county_fips", ["53033"]),
        ]
    }

    #[test]
    fn passing_result() {
        let verdict = ConstraintVerifier::with_defaults()
            .check(&json!({"city": "Seattle", "county_fips": "53033"}), &seattle());
        assert!(verdict.ok);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn every_failure_is_reported() {
        let verdict = ConstraintVerifier::with_defaults()
            .check(&json!({"city": "Renton", "county_fips": "53057"}), &seattle());
        assert!(!verdict.ok);
        assert_eq!(verdict.reasons.len(), 2);
        assert_eq!(verdict.violations[1].field, "county_fips");
        assert_eq!(verdict.violations[1].observed, Some(json!("53057")));
    }

    #[test]
    fn missing_field_fails_closed_in_strict_mode_only() {
        let verifier = ConstraintVerifier::with_defaults();
        let result = json!({"county_fips": "53057"});

        let strict = verifier.check(&result, &seattle());
        assert_eq!(strict.violations.len(), 2);
        assert_eq!(strict.violations[0].observed, None);

        let applicable = verifier.check_applicable(&result, &seattle());
        assert_eq!(applicable.violations.len(), 1);
        assert_eq!(applicable.violations[0].constraint, "county_fips");
    }

    #[test]
    fn unknown_kind_fails_closed() {
        let constraint = Constraint::new("zoning", ConstraintKind::Other("zoning_code".into()))
            .with_param("value", "R1");
        let verdict = ConstraintVerifier::with_defaults().check(&json!({"zoning": "R1"}), [&constraint]);
        assert!(!verdict.ok);
        assert!(verdict.reasons[0].contains("zoning_code"));
    }

    #[test]
    fn empty_registry_fails_everything() {
        let verdict = ConstraintVerifier::new().check(&json!({"city": "Seattle"}), &seattle()[..1]);
        assert!(!verdict.ok);
    }

    #[test]
    fn date_range_bounds_are_inclusive() {
        let c = Constraint::new("permit_date", ConstraintKind::DateRange)
            .with_param("from", "2024-01-01")
            .with_param("to", "2024-12-31");
        let verifier = ConstraintVerifier::with_defaults();
        assert!(verifier.check(&json!({"permit_date": "2024-01-01"}), [&c]).ok);
        assert!(verifier.check(&json!({"permit_date": "2024-12-31T23:00:00Z"}), [&c]).ok);
        assert!(!verifier.check(&json!({"permit_date": "2025-01-01"}), [&c]).ok);
        assert!(!verifier.check(&json!({"permit_date": "soon"}), [&c]).ok);
    }

    #[test]
    fn entity_type_is_case_insensitive() {
        let c = Constraint::new("kind", ConstraintKind::EntityType)
            .with_param("allowed", json!(["Parcel", "Building"]));
        let verifier = ConstraintVerifier::with_defaults();
        assert!(verifier.check(&json!({"kind": "parcel"}), [&c]).ok);
        assert!(!verifier.check(&json!({"kind": "person"}), [&c]).ok);
    }

    #[test]
    fn nested_field_paths() {
        let c = Constraint::field_equals("city", "Seattle").with_param("field", "address.city");
        let verdict = ConstraintVerifier::with_defaults()
            .check(&json!({"address": {"city": "Seattle"}}), [&c]);
        assert!(verdict.ok);
    }

    #[test]
    fn numeric_codes_compare_as_text() {
        let verdict = ConstraintVerifier::with_defaults()
            .check(&json!({"county_fips": 53033}), &seattle()[1..]);
        assert!(verdict.ok);
    }
}
