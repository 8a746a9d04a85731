//! Transformation rules: reusable schedule mutations driven by a search.
//!
//! A rule is consulted in two phases. `init` scans a schedule and collects
//! applicable targets; `apply` mutates the schedule through the public
//! primitives, so everything a rule does lands in the schedule's trace and
//! replays without the rule.

pub mod auto_unroll;

pub use auto_unroll::AutoUnroll;

use crate::ir::schedule::IrSchedule;
use crate::utils::errors::RuleError;

/// What a rule's `init` decided for the current schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleApplyType {
    /// No applicable target; skip this rule
    CannotApply,
    /// Applicable; once applied, the rule need not be reconsidered this step
    ApplyAndSkipThisRule,
    /// Applicable; the rule stays in consideration after applying
    ApplyAndKeepThisRule,
}

/// A schedule transformation rule.
pub trait ScheduleRule {
    /// Rule name for logs and search bookkeeping.
    fn name(&self) -> &'static str;

    /// Scan the schedule and collect applicable targets. Must be called
    /// before `apply`; calling it again rescans from scratch.
    fn init(&mut self, sched: &IrSchedule) -> RuleApplyType;

    /// Number of targets the last `init` found.
    fn num_applicable(&self) -> usize;

    /// Apply the rule to the `index`-th target found by `init`.
    fn apply(&mut self, sched: &mut IrSchedule, index: usize) -> Result<(), RuleError>;
}
