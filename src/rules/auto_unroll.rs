//! Automatic unrolling rule.
//!
//! Marks eligible function bodies with a maximum unroll step annotation that
//! code generation turns into unroll pragmas. A body is eligible when it
//! reduces or already carries a non-serial loop; plain serial pointwise nests
//! gain nothing from unrolling and are skipped.

use crate::ir::module::{NodeId, NodeKind};
use crate::ir::schedule::IrSchedule;
use crate::rules::{RuleApplyType, ScheduleRule};
use crate::trace::AttrValue;
use crate::utils::errors::{RuleError, ScheduleError};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Annotation key consumed by code generation.
pub const AUTO_UNROLL_KEY: &str = "auto_unroll_max_step";

/// Candidate maximum unroll steps; 0 disables unrolling for the body.
pub const AUTO_UNROLL_OPTIONS: [i64; 4] = [0, 8, 32, 128];

/// Annotates eligible function-body roots with a sampled maximum unroll step.
pub struct AutoUnroll {
    applicable_roots: Vec<NodeId>,
    rng: StdRng,
}

impl AutoUnroll {
    /// A rule with entropy-seeded sampling.
    pub fn new() -> Self {
        Self {
            applicable_roots: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// A rule with deterministic sampling, for reproducible searches.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            applicable_roots: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Whether a function body warrants unrolling: some block in it reduces,
    /// or some loop in it already runs non-serially.
    fn root_eligible(sched: &IrSchedule, root: NodeId) -> bool {
        let module = sched.module();
        module.preorder(root).into_iter().any(|id| match module.kind(id) {
            NodeKind::Block { iter_vars, .. } => iter_vars.iter().any(|v| v.is_reduce),
            NodeKind::For { kind, .. } => kind.is_non_serial(),
            _ => false,
        })
    }
}

impl Default for AutoUnroll {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleRule for AutoUnroll {
    fn name(&self) -> &'static str {
        "AutoUnroll"
    }

    fn init(&mut self, sched: &IrSchedule) -> RuleApplyType {
        self.applicable_roots.clear();
        for &root in sched.module().roots() {
            if Self::root_eligible(sched, root) {
                self.applicable_roots.push(root);
            }
        }
        debug!(
            "AutoUnroll: {} applicable function bodies",
            self.applicable_roots.len()
        );
        if self.applicable_roots.is_empty() {
            RuleApplyType::CannotApply
        } else {
            RuleApplyType::ApplyAndSkipThisRule
        }
    }

    fn num_applicable(&self) -> usize {
        self.applicable_roots.len()
    }

    fn apply(&mut self, sched: &mut IrSchedule, index: usize) -> Result<(), RuleError> {
        let target = self.applicable_roots.get(index).copied().ok_or(
            RuleError::IndexOutOfRange {
                index,
                num_applicable: self.applicable_roots.len(),
            },
        )?;
        // Re-derive the target through traced query primitives; the annotate
        // input must be an earlier step's output for the trace to replay.
        let inner = sched
            .get_all_blocks()
            .into_iter()
            .find(|&b| sched.module().tree_root_of(b) == target)
            .ok_or_else(|| {
                ScheduleError::NotApplicable(
                    "function body contains no scheduling block".to_string(),
                )
            })?;
        let root = sched.get_root_block(inner)?;
        // The sampled value is recorded in the annotation step, so a replay
        // reproduces this decision without re-sampling.
        let max_step = AUTO_UNROLL_OPTIONS
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(0);
        debug!("AutoUnroll: annotating {} with max_step {}", root, max_step);
        sched.annotate(root, AUTO_UNROLL_KEY, AttrValue::Int(max_step))?;
        Ok(())
    }
}
