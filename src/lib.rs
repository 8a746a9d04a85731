//! # TensorTune - Schedule Tracing and Auto-Tuning Core
//!
//! The core machinery of a tensor-program auto-tuner:
//! - A lowered loop-nest IR with schedule blocks and handle-based access
//! - Schedule primitives (split, fuse, reorder, cache staging, compute
//!   placement, rfactor, ...) that record themselves into a replayable trace
//! - A step-kind registry that validates and replays persisted traces
//! - Transformation rules that drive primitives during search
//! - A measurement pipeline compiling and timing generated C candidates
//!
//! ## Architecture
//!
//! ```text
//! Workload → Lower → IrModule → IrSchedule (+ trace) → CodeGen → Measure
//!                                   ↑
//!                            Rules / Replay
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tensortune::prelude::*;
//!
//! let lowered = lower_workloads(&[Workload::elementwise_copy(vec![32, 32])])?;
//! let mut sched = IrSchedule::new(lowered.module.clone());
//! let loops = sched.get_loops_by_name("B")?;
//! let fused = sched.fuse(&loops)?;
//! sched.split(fused, &[256, -1])?;
//!
//! // The same transformations replay against a fresh copy.
//! let bytes = sched.trace().to_bytes()?;
//! let mut replayed = IrSchedule::new(lowered.module.clone());
//! ScheduleDesc::from_bytes(&bytes)?.replay(&mut replayed)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codegen;
pub mod ir;
pub mod lower;
pub mod measure;
pub mod rules;
pub mod task;
pub mod trace;
pub mod utils;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::codegen::{emit_benchmark_main, emit_module, Target};
    pub use crate::ir::printer::print_module;
    pub use crate::ir::{IrModule, IrSchedule, NodeId, NodeKind};
    pub use crate::lower::{lower_workloads, LoweredModule, Workload};
    pub use crate::measure::{
        LocalBuilder, LocalRunner, MeasureInput, MeasureResult, ScheduleBuilder, ScheduleMeasurer,
        ScheduleRunner,
    };
    pub use crate::rules::{AutoUnroll, RuleApplyType, ScheduleRule};
    pub use crate::task::{TaskCreator, TuneTask};
    pub use crate::trace::{AttrValue, ScheduleDesc, Step};
    pub use crate::utils::errors::{TensorTuneError, TuneResult};
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
