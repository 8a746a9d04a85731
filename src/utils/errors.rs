//! Error types for the auto-tuning core.
//!
//! Each layer owns its error enum; `TensorTuneError` aggregates them at the
//! crate boundary.

use thiserror::Error;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum TensorTuneError {
    /// Error in the trace/replay engine
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    /// Error from a schedule primitive
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Error from a transformation rule
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Error in the measurement pipeline
    #[error("Measure error: {0}")]
    Measure(#[from] MeasureError),

    /// Error during op lowering
    #[error("Lower error: {0}")]
    Lower(#[from] LowerError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the trace engine and the step-kind registry.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The step kind is not present in the registry
    #[error("unknown step kind `{0}`")]
    UnknownKind(String),

    /// A step kind was registered twice
    #[error("step kind `{0}` is already registered")]
    DuplicateKind(String),

    /// A supplied parameter name is not declared by the step kind
    #[error("unknown parameter `{param}` for step kind `{kind}`")]
    UnknownParameter {
        /// The step kind being invoked
        kind: String,
        /// The undeclared parameter name
        param: String,
    },

    /// Serialized trace bytes could not be decoded or are inconsistent
    #[error("corrupt trace: {0}")]
    CorruptTrace(String),

    /// A step references a handle that no earlier step produced
    #[error("step {step} input `{param}` references a handle not produced by an earlier step")]
    UnresolvedHandle {
        /// Index of the offending step
        step: usize,
        /// Name of the offending input parameter
        param: String,
    },

    /// An individual operation's apply function failed
    #[error("operation failed: {0}")]
    Operation(#[from] ScheduleError),
}

/// Errors raised by individual schedule primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// No block with the given name exists in the module
    #[error("no block named `{0}`")]
    BlockNotFound(String),

    /// A loop index was outside the loop nest of the target block
    #[error("loop index {index} out of range, block has {len} loops")]
    LoopIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of loops available
        len: usize,
    },

    /// A buffer index was outside the block's accessed buffers
    #[error("buffer index {index} out of range, block accesses {len} buffers")]
    BufferIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of buffers accessed
        len: usize,
    },

    /// Split factors do not evenly cover the loop extent
    #[error("invalid split factors {factors:?} for loop extent {extent}")]
    InvalidSplitFactors {
        /// Requested factors (-1 means inferred)
        factors: Vec<i64>,
        /// Extent of the loop being split
        extent: i64,
    },

    /// Fuse requires a consecutive only-child loop chain
    #[error("loops are not a consecutive nest")]
    NonConsecutiveLoops,

    /// The referenced handle does not name the expected node kind
    #[error("handle does not reference a {expected}")]
    WrongNodeKind {
        /// Node kind the primitive expected
        expected: &'static str,
    },

    /// A required step parameter is absent
    #[error("missing required parameter `{0}`")]
    MissingParameter(String),

    /// A step parameter had an unexpected shape or attribute type
    #[error("parameter `{0}` has an unexpected type")]
    ParameterType(String),

    /// The primitive is not applicable to the given target
    #[error("{0}")]
    NotApplicable(String),
}

/// Errors raised by transformation rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Apply was called with an index past the applicable-target list
    #[error("apply index {index} out of range, {num_applicable} targets applicable")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of applicable targets found by init
        num_applicable: usize,
    },

    /// The underlying schedule primitive failed
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Faults raised by builders and runners; contained per candidate by the
/// measurer.
#[derive(Error, Debug, Clone)]
pub enum MeasureError {
    /// Compilation of a candidate failed
    #[error("{0}")]
    BuildFault(String),

    /// Execution of a compiled candidate failed
    #[error("{0}")]
    RunFault(String),
}

impl MeasureError {
    /// The fault detail without the build/run classification.
    pub fn detail(&self) -> &str {
        match self {
            MeasureError::BuildFault(msg) | MeasureError::RunFault(msg) => msg,
        }
    }
}

/// Errors raised while lowering a workload to an unscheduled module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    /// The workload shape is not supported by the reference lowering
    #[error("unsupported workload shape: {0}")]
    UnsupportedShape(String),

    /// A task was lowered before an op lowerer was attached
    #[error("task `{0}` has no op lowerer attached")]
    NoOpLowerer(String),
}

/// Result type using TensorTuneError.
pub type TuneResult<T> = Result<T, TensorTuneError>;
