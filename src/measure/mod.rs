//! Measurement pipeline: compile schedule candidates and time them.
//!
//! Builders and runners are trait seams so searches can run against fakes;
//! the measurer contains their faults per candidate instead of aborting a
//! batch.

pub mod builder;
pub mod measurer;
pub mod runner;

pub use builder::LocalBuilder;
pub use measurer::ScheduleMeasurer;
pub use runner::LocalRunner;

use crate::utils::errors::MeasureError;
use std::path::PathBuf;

/// One candidate to measure: a task label and the complete benchmark source.
#[derive(Debug, Clone)]
pub struct MeasureInput {
    /// Task label, also used for artifact file names
    pub task_name: String,
    /// Self-contained benchmark program source
    pub source: String,
}

impl MeasureInput {
    /// A candidate for `task_name` with the given benchmark source.
    pub fn new(task_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            source: source.into(),
        }
    }
}

/// What a build produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Artifact {
    /// A compiled executable on disk
    Executable(PathBuf),
    /// Source carried through unbuilt (used by in-memory runners)
    Source(String),
    /// Nothing to run
    #[default]
    Empty,
}

/// Successful output of a builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResult {
    /// The artifact to hand to the runner
    pub artifact: Artifact,
}

/// Successful output of a runner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    /// Average execution cost of one invocation, in microseconds
    pub execution_cost_us: f64,
    /// Raw output captured from the execution, opaque to the pipeline
    pub output: String,
}

/// Outcome of measuring one candidate. `error_msg` is empty on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasureResult {
    /// Non-empty when the candidate failed to build or run
    pub error_msg: String,
    /// Average execution cost of one invocation, in microseconds
    pub execution_cost_us: f64,
    /// Wall time spent measuring this candidate, in microseconds
    pub elapsed_time_us: f64,
    /// Raw output captured from the execution, opaque to the pipeline
    pub output: String,
}

/// Compiles one candidate into a runnable artifact.
pub trait ScheduleBuilder: Send + Sync {
    /// Build the candidate or report a build fault.
    fn build(&self, input: &MeasureInput) -> Result<BuildResult, MeasureError>;
}

/// Executes a built candidate and times it.
pub trait ScheduleRunner: Send + Sync {
    /// Run the artifact or report a run fault.
    fn run(&self, input: &MeasureInput, build: &BuildResult) -> Result<RunResult, MeasureError>;
}
