//! ATM Guards
//!
//! The two analyzers whose outcomes drive recovery:
//!
//! - [`ConstraintVerifier`]: registry of pure [`ConstraintCheck`]s; reports
//!   every failing constraint, and fails closed on unknown kinds
//! - [`LoopDetector`]: cycle, no-progress and error-motif detection over a
//!   run's [`RunHistory`]

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod detector;
mod verifier;

pub use detector::{
    similarity, DetectorKind, DetectorTrigger, LoopDetector, LoopDetectorConfig, LoopReport,
    Observation, RunHistory,
};
pub use verifier::{
    ConstraintCheck, ConstraintVerifier, DateRangeCheck, EntityTypeCheck, FieldEqualsCheck,
    GeoMembershipCheck, Mismatch, Verdict, Violation,
};
