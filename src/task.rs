//! Tuning tasks: one workload plus the machinery to lower and benchmark it.

use crate::codegen::{emit_benchmark_main, emit_module, Target};
use crate::ir::module::IrModule;
use crate::lower::{lower_workloads, FuncMeta, LoweredModule, Workload};
use crate::utils::errors::LowerError;
use log::info;

/// Lowers a workload into an unscheduled module. A seam so tests and
/// alternative frontends can substitute their own lowering.
pub trait OpLowerer {
    /// Lower one workload.
    fn lower(&self, workload: &Workload) -> Result<LoweredModule, LowerError>;
}

/// The reference lowering.
#[derive(Debug, Default)]
pub struct ComputeLowerer;

impl OpLowerer for ComputeLowerer {
    fn lower(&self, workload: &Workload) -> Result<LoweredModule, LowerError> {
        lower_workloads(std::slice::from_ref(workload))
    }
}

/// One tunable unit: a workload, a target, and an attached lowerer.
pub struct TuneTask {
    /// Task name, derived from the workload
    pub name: String,
    /// The workload to tune
    pub workload: Workload,
    /// Code generation target
    pub target: Target,
    lowerer: Option<Box<dyn OpLowerer>>,
}

impl TuneTask {
    /// A task without a lowerer attached; `lower_unscheduled` fails until
    /// one is set.
    pub fn new(workload: Workload, target: Target) -> Self {
        Self {
            name: workload.name(),
            workload,
            target,
            lowerer: None,
        }
    }

    /// Attach the lowering to use.
    pub fn set_op_lowerer(&mut self, lowerer: Box<dyn OpLowerer>) {
        self.lowerer = Some(lowerer);
    }

    /// Lower the workload into a fresh unscheduled module. Clone the result
    /// to obtain independent schedules.
    pub fn lower_unscheduled(&self) -> Result<LoweredModule, LowerError> {
        let lowerer = self
            .lowerer
            .as_ref()
            .ok_or_else(|| LowerError::NoOpLowerer(self.name.clone()))?;
        lowerer.lower(&self.workload)
    }

    /// Emit a complete benchmark program for a (possibly scheduled) module.
    pub fn benchmark_source(
        &self,
        module: &IrModule,
        funcs: &[FuncMeta],
        func: &FuncMeta,
        repeats: usize,
    ) -> String {
        let mut src = emit_module(module, funcs, self.target);
        src.push_str(&emit_benchmark_main(module, func, repeats));
        src
    }
}

/// Builds ready-to-lower tasks from workload descriptions.
#[derive(Debug, Default)]
pub struct TaskCreator;

impl TaskCreator {
    /// One task per workload, each with the reference lowering attached.
    pub fn create_tasks(workloads: &[Workload], target: Target) -> Vec<TuneTask> {
        info!("creating {} tuning tasks", workloads.len());
        workloads
            .iter()
            .map(|w| {
                let mut task = TuneTask::new(w.clone(), target);
                task.set_op_lowerer(Box::new(ComputeLowerer));
                task
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_without_lowerer_fails() {
        let task = TuneTask::new(Workload::elementwise_copy(vec![8]), Target::C);
        let err = task.lower_unscheduled().unwrap_err();
        assert_eq!(err, LowerError::NoOpLowerer("copy_8".to_string()));
    }

    #[test]
    fn test_create_tasks_attaches_lowerer() {
        let tasks = TaskCreator::create_tasks(
            &[
                Workload::elementwise_copy(vec![8]),
                Workload::reduce_sum(4, 4),
            ],
            Target::C,
        );
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "copy_8");
        assert_eq!(tasks[1].name, "reduce_sum_4x4");
        for task in &tasks {
            assert!(task.lower_unscheduled().is_ok());
        }
    }

    #[test]
    fn test_benchmark_source_is_self_contained() {
        let tasks = TaskCreator::create_tasks(&[Workload::elementwise_copy(vec![8])], Target::C);
        let lowered = tasks[0].lower_unscheduled().unwrap();
        let src = tasks[0].benchmark_source(
            &lowered.module,
            &lowered.funcs,
            &lowered.funcs[0],
            2,
        );
        assert!(src.contains("void fn_0("));
        assert!(src.contains("int main(void) {"));
    }
}
