//! Local runner: executes built candidates and parses their timing output.

use crate::measure::{Artifact, BuildResult, MeasureInput, RunResult, ScheduleRunner};
use crate::utils::errors::MeasureError;
use log::debug;
use std::process::Command;

/// Runs an executable artifact and reads `Time: <seconds>` lines from its
/// stdout, one per benchmark repeat.
#[derive(Debug, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// A runner with default settings.
    pub fn new() -> Self {
        Self
    }

    fn parse_times(stdout: &str) -> Vec<f64> {
        stdout
            .lines()
            .filter_map(|line| line.strip_prefix("Time:"))
            .filter_map(|rest| rest.trim().parse::<f64>().ok())
            .collect()
    }

    fn median(mut times: Vec<f64>) -> f64 {
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = times.len() / 2;
        if times.len() % 2 == 0 {
            (times[mid - 1] + times[mid]) / 2.0
        } else {
            times[mid]
        }
    }
}

impl ScheduleRunner for LocalRunner {
    fn run(&self, input: &MeasureInput, build: &BuildResult) -> Result<RunResult, MeasureError> {
        let path = match &build.artifact {
            Artifact::Executable(path) => path,
            Artifact::Source(_) | Artifact::Empty => {
                return Err(MeasureError::RunFault(
                    "artifact is not an executable".to_string(),
                ))
            }
        };
        debug!("running `{}` from {}", input.task_name, path.display());
        let output = Command::new(path)
            .output()
            .map_err(|e| MeasureError::RunFault(format!("spawn {}: {}", path.display(), e)))?;
        if !output.status.success() {
            return Err(MeasureError::RunFault(format!(
                "exit status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let times = Self::parse_times(&stdout);
        if times.is_empty() {
            return Err(MeasureError::RunFault(
                "benchmark produced no timing output".to_string(),
            ));
        }
        Ok(RunResult {
            execution_cost_us: Self::median(times) * 1e6,
            output: stdout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_times_ignores_other_lines() {
        let out = "warmup\nTime: 0.001\nnoise\nTime: 0.003\nTime: 0.002\n";
        assert_eq!(LocalRunner::parse_times(out), vec![0.001, 0.003, 0.002]);
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(LocalRunner::median(vec![0.003, 0.001, 0.002]), 0.002);
        assert_eq!(LocalRunner::median(vec![0.004, 0.001, 0.002, 0.003]), 0.0025);
    }

    #[test]
    fn test_non_executable_artifact_is_a_run_fault() {
        let runner = LocalRunner::new();
        let input = MeasureInput::new("t", "src");
        let build = BuildResult {
            artifact: Artifact::Empty,
        };
        let err = runner.run(&input, &build).unwrap_err();
        assert!(matches!(err, MeasureError::RunFault(_)));
    }
}
