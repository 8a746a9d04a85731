//! The measurer: batch driver over a builder and a runner.

use crate::measure::{BuildResult, MeasureInput, MeasureResult, ScheduleBuilder, ScheduleRunner};
use crate::utils::errors::MeasureError;
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::time::Instant;

/// Measures batches of candidates: builds concurrently on a bounded pool,
/// runs strictly serially so timings do not contend, and contains per-
/// candidate faults in the result slots.
pub struct ScheduleMeasurer<'a> {
    builder: &'a dyn ScheduleBuilder,
    runner: &'a dyn ScheduleRunner,
    num_build_threads: usize,
}

impl<'a> ScheduleMeasurer<'a> {
    /// A measurer building on at most `num_build_threads` threads.
    pub fn new(
        builder: &'a dyn ScheduleBuilder,
        runner: &'a dyn ScheduleRunner,
        num_build_threads: usize,
    ) -> Self {
        Self {
            builder,
            runner,
            num_build_threads: num_build_threads.max(1),
        }
    }

    /// Measure every candidate. The result vector is index-aligned with
    /// `inputs`; a failed candidate occupies its slot with an error message
    /// instead of failing the batch.
    pub fn measure(&self, inputs: &[MeasureInput]) -> Vec<MeasureResult> {
        let total = Instant::now();
        let builds = self.build_stage(inputs);

        let mut results = Vec::with_capacity(inputs.len());
        for (input, (build, build_us)) in inputs.iter().zip(builds) {
            let run_start = Instant::now();
            let mut result = MeasureResult::default();
            match build {
                Err(e) => {
                    warn!("build of `{}` failed: {}", input.task_name, e.detail());
                    result.error_msg = format!("Build failed, error: {}\n", e.detail());
                }
                Ok(build) => match self.runner.run(input, &build) {
                    Err(e) => {
                        warn!("run of `{}` failed: {}", input.task_name, e.detail());
                        result.error_msg = format!("Run failed, error: {}\n", e.detail());
                    }
                    Ok(run) => {
                        result.execution_cost_us = run.execution_cost_us;
                        result.output = run.output;
                    }
                },
            }
            result.elapsed_time_us = build_us + run_start.elapsed().as_secs_f64() * 1e6;
            results.push(result);
        }

        let failed = results.iter().filter(|r| !r.error_msg.is_empty()).count();
        info!(
            "measured {} candidates ({} failed) in {:.1} ms",
            inputs.len(),
            failed,
            total.elapsed().as_secs_f64() * 1e3
        );
        results
    }

    /// Build every input, preserving order. Returns each build outcome with
    /// the wall time it took, in microseconds.
    fn build_stage(
        &self,
        inputs: &[MeasureInput],
    ) -> Vec<(Result<BuildResult, MeasureError>, f64)> {
        let build_one = |input: &MeasureInput| {
            let start = Instant::now();
            let build = self.builder.build(input);
            (build, start.elapsed().as_secs_f64() * 1e6)
        };
        match ThreadPoolBuilder::new()
            .num_threads(self.num_build_threads)
            .build()
        {
            Ok(pool) => pool.install(|| inputs.par_iter().map(build_one).collect()),
            Err(e) => {
                warn!("build pool unavailable ({}), building serially", e);
                inputs.iter().map(build_one).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{Artifact, RunResult};

    struct OkBuilder;
    impl ScheduleBuilder for OkBuilder {
        fn build(&self, input: &MeasureInput) -> Result<BuildResult, MeasureError> {
            Ok(BuildResult {
                artifact: Artifact::Source(input.source.clone()),
            })
        }
    }

    struct CostByLengthRunner;
    impl ScheduleRunner for CostByLengthRunner {
        fn run(
            &self,
            input: &MeasureInput,
            _build: &BuildResult,
        ) -> Result<RunResult, MeasureError> {
            Ok(RunResult {
                execution_cost_us: input.source.len() as f64,
                ..Default::default()
            })
        }
    }

    struct FailingBuilder;
    impl ScheduleBuilder for FailingBuilder {
        fn build(&self, _input: &MeasureInput) -> Result<BuildResult, MeasureError> {
            Err(MeasureError::BuildFault("uninitialized compiler".to_string()))
        }
    }

    #[test]
    fn test_results_align_with_inputs() {
        let inputs = vec![
            MeasureInput::new("t0", "aa"),
            MeasureInput::new("t1", "aaaa"),
            MeasureInput::new("t2", "a"),
        ];
        let builder = OkBuilder;
        let runner = CostByLengthRunner;
        let measurer = ScheduleMeasurer::new(&builder, &runner, 2);
        let results = measurer.measure(&inputs);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].execution_cost_us, 2.0);
        assert_eq!(results[1].execution_cost_us, 4.0);
        assert_eq!(results[2].execution_cost_us, 1.0);
        assert!(results.iter().all(|r| r.error_msg.is_empty()));
    }

    #[test]
    fn test_build_fault_is_contained() {
        let inputs = vec![MeasureInput::new("t0", "x")];
        let builder = FailingBuilder;
        let runner = CostByLengthRunner;
        let measurer = ScheduleMeasurer::new(&builder, &runner, 2);
        let results = measurer.measure(&inputs);
        assert_eq!(
            results[0].error_msg,
            "Build failed, error: uninitialized compiler\n"
        );
        assert_eq!(results[0].execution_cost_us, 0.0);
    }
}
