//! Local builder: compiles candidate sources with the system C compiler.

use crate::measure::{Artifact, BuildResult, MeasureInput, ScheduleBuilder};
use crate::utils::errors::MeasureError;
use log::debug;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

/// Compiles each candidate into an executable under a work directory.
pub struct LocalBuilder {
    work_dir: PathBuf,
    compiler: String,
    opt_level: String,
    openmp: bool,
}

impl LocalBuilder {
    /// A builder writing artifacts under `work_dir`, compiling with `cc -O2`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            compiler: "cc".to_string(),
            opt_level: "-O2".to_string(),
            openmp: false,
        }
    }

    /// Use a specific compiler binary.
    pub fn compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    /// Use a specific optimization flag.
    pub fn opt_level(mut self, flag: impl Into<String>) -> Self {
        self.opt_level = flag.into();
        self
    }

    /// Link and compile with OpenMP support.
    pub fn with_openmp(mut self, enabled: bool) -> Self {
        self.openmp = enabled;
        self
    }
}

impl ScheduleBuilder for LocalBuilder {
    fn build(&self, input: &MeasureInput) -> Result<BuildResult, MeasureError> {
        fs::create_dir_all(&self.work_dir)
            .map_err(|e| MeasureError::BuildFault(format!("work dir: {}", e)))?;
        let src_path = self.work_dir.join(format!("{}.c", input.task_name));
        let exe_path = self.work_dir.join(&input.task_name);
        fs::write(&src_path, &input.source)
            .map_err(|e| MeasureError::BuildFault(format!("write source: {}", e)))?;

        let mut cmd = Command::new(&self.compiler);
        cmd.arg(&self.opt_level)
            .arg(&src_path)
            .arg("-o")
            .arg(&exe_path)
            .arg("-lm");
        if self.openmp {
            cmd.arg("-fopenmp");
        }
        debug!("compiling `{}` with {:?}", input.task_name, cmd);
        let output = cmd
            .output()
            .map_err(|e| MeasureError::BuildFault(format!("spawn {}: {}", self.compiler, e)))?;
        if !output.status.success() {
            return Err(MeasureError::BuildFault(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(BuildResult {
            artifact: Artifact::Executable(exe_path),
        })
    }
}
