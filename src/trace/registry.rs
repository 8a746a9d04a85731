//! The step-kind registry.
//!
//! Every schedule primitive is registered here under its step kind name,
//! together with the parameter names it accepts and an apply function. Replay
//! resolves each recorded step against this table; the apply functions call
//! the public schedule primitives, so a replayed schedule re-records its own
//! trace as it goes.

use crate::ir::module::NodeId;
use crate::ir::schedule::IrSchedule;
use crate::trace::{StepAttrs, StepInputs};
use crate::utils::errors::{ScheduleError, TraceError};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// Apply signature shared by every step kind.
pub type ApplyFn = fn(&StepInputs, &StepAttrs, &mut IrSchedule) -> Result<Vec<NodeId>, ScheduleError>;

/// One registered step kind: its name, the parameter names it accepts, and
/// its apply function.
#[derive(Clone)]
pub struct StepKindInfo {
    /// Step kind name, unique across the registry
    pub kind: &'static str,
    /// Accepted handle-input parameter names
    pub inputs: &'static [&'static str],
    /// Accepted attribute parameter names
    pub attrs: &'static [&'static str],
    /// The primitive to invoke
    pub apply: ApplyFn,
}

/// Maps step kind names to their registered info.
#[derive(Default)]
pub struct Registry {
    kinds: BTreeMap<String, StepKindInfo>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step kind. Fails if the name is already taken.
    pub fn register(&mut self, info: StepKindInfo) -> Result<(), TraceError> {
        if self.kinds.contains_key(info.kind) {
            return Err(TraceError::DuplicateKind(info.kind.to_string()));
        }
        self.kinds.insert(info.kind.to_string(), info);
        Ok(())
    }

    /// Look up a step kind by name.
    pub fn lookup(&self, kind: &str) -> Result<&StepKindInfo, TraceError> {
        self.kinds
            .get(kind)
            .ok_or_else(|| TraceError::UnknownKind(kind.to_string()))
    }

    /// Validate parameter names against the declaration and invoke the
    /// primitive.
    pub fn invoke(
        &self,
        kind: &str,
        inputs: &StepInputs,
        attrs: &StepAttrs,
        sched: &mut IrSchedule,
    ) -> Result<Vec<NodeId>, TraceError> {
        let info = self.lookup(kind)?;
        for name in inputs.0.keys() {
            if !info.inputs.contains(&name.as_str()) {
                return Err(TraceError::UnknownParameter {
                    kind: kind.to_string(),
                    param: name.clone(),
                });
            }
        }
        for name in attrs.0.keys() {
            if !info.attrs.contains(&name.as_str()) {
                return Err(TraceError::UnknownParameter {
                    kind: kind.to_string(),
                    param: name.clone(),
                });
            }
        }
        Ok((info.apply)(inputs, attrs, sched)?)
    }

    /// Registered kind names in sorted order.
    pub fn kind_names(&self) -> Vec<&str> {
        self.kinds.keys().map(|k| k.as_str()).collect()
    }
}

macro_rules! step_kind {
    ($reg:expr, $kind:literal, inputs: [$($in:literal),*], attrs: [$($at:literal),*], $apply:expr) => {
        $reg.register(StepKindInfo {
            kind: $kind,
            inputs: &[$($in),*],
            attrs: &[$($at),*],
            apply: $apply,
        })
        .expect("builtin step kinds are registered once");
    };
}

fn builtins() -> Registry {
    let mut reg = Registry::new();

    step_kind!(reg, "GetAllBlocks", inputs: [], attrs: [], |_i, _a, s| {
        Ok(s.get_all_blocks())
    });
    step_kind!(reg, "GetBlock", inputs: [], attrs: ["block_name"], |_i, a, s| {
        Ok(vec![s.get_block(&a.string("block_name")?)?])
    });
    step_kind!(reg, "GetLoops", inputs: ["block"], attrs: [], |i, _a, s| {
        s.get_loops(i.single("block")?)
    });
    step_kind!(reg, "GetLoopsWithName", inputs: [], attrs: ["block_name"], |_i, a, s| {
        s.get_loops_by_name(&a.string("block_name")?)
    });
    step_kind!(reg, "GetRootBlock", inputs: ["expr"], attrs: [], |i, _a, s| {
        Ok(vec![s.get_root_block(i.single("expr")?)?])
    });
    step_kind!(reg, "Split", inputs: ["loop"], attrs: ["factors"], |i, a, s| {
        s.split(i.single("loop")?, &a.ints("factors")?)
    });
    step_kind!(
        reg,
        "SplitWithName",
        inputs: [],
        attrs: ["block_name", "loop_index", "factors"],
        |_i, a, s| {
            s.split_by_name(
                &a.string("block_name")?,
                a.int("loop_index")? as usize,
                &a.ints("factors")?,
            )
        }
    );
    step_kind!(reg, "Fuse", inputs: ["loops"], attrs: [], |i, _a, s| {
        Ok(vec![s.fuse(&i.list("loops")?)?])
    });
    step_kind!(
        reg,
        "FuseWithName",
        inputs: [],
        attrs: ["block_name", "loops_index"],
        |_i, a, s| {
            Ok(vec![s.fuse_by_name(
                &a.string("block_name")?,
                &a.ints("loops_index")?,
            )?])
        }
    );
    step_kind!(
        reg,
        "FuseWithBlock",
        inputs: ["block"],
        attrs: ["loops_index"],
        |i, a, s| {
            Ok(vec![s.fuse_with_block(
                i.single("block")?,
                &a.ints("loops_index")?,
            )?])
        }
    );
    step_kind!(reg, "Reorder", inputs: ["loops"], attrs: [], |i, _a, s| {
        s.reorder(&i.list("loops")?)?;
        Ok(vec![])
    });
    step_kind!(
        reg,
        "ReorderWithName",
        inputs: [],
        attrs: ["block_name", "loops_index"],
        |_i, a, s| {
            s.reorder_by_name(&a.string("block_name")?, &a.ints("loops_index")?)?;
            Ok(vec![])
        }
    );
    step_kind!(reg, "Parallel", inputs: ["loop"], attrs: [], |i, _a, s| {
        s.parallel(i.single("loop")?)?;
        Ok(vec![])
    });
    step_kind!(reg, "Vectorize", inputs: ["loop"], attrs: ["factor"], |i, a, s| {
        s.vectorize(i.single("loop")?, a.int("factor")?)?;
        Ok(vec![])
    });
    step_kind!(reg, "Unroll", inputs: ["loop"], attrs: [], |i, _a, s| {
        s.unroll(i.single("loop")?)?;
        Ok(vec![])
    });
    step_kind!(reg, "Bind", inputs: ["loop"], attrs: ["thread_axis"], |i, a, s| {
        s.bind(i.single("loop")?, &a.string("thread_axis")?)?;
        Ok(vec![])
    });
    step_kind!(reg, "Annotate", inputs: ["block"], attrs: ["key", "value"], |i, a, s| {
        s.annotate(i.single("block")?, &a.string("key")?, a.value("value")?)?;
        Ok(vec![])
    });
    step_kind!(
        reg,
        "CacheRead",
        inputs: ["block"],
        attrs: ["read_buffer_index", "memory_type"],
        |i, a, s| {
            Ok(vec![s.cache_read(
                i.single("block")?,
                a.int("read_buffer_index")? as usize,
                &a.string("memory_type")?,
            )?])
        }
    );
    step_kind!(
        reg,
        "CacheWrite",
        inputs: ["block"],
        attrs: ["write_buffer_index", "memory_type"],
        |i, a, s| {
            Ok(vec![s.cache_write(
                i.single("block")?,
                a.int("write_buffer_index")? as usize,
                &a.string("memory_type")?,
            )?])
        }
    );
    step_kind!(
        reg,
        "SetBuffer",
        inputs: ["block"],
        attrs: ["memory_type", "fixed"],
        |i, a, s| {
            s.set_buffer(
                i.single("block")?,
                &a.string("memory_type")?,
                a.boolean("fixed")?,
            )?;
            Ok(vec![])
        }
    );
    step_kind!(
        reg,
        "SyncThreads",
        inputs: ["ir_node"],
        attrs: ["after_node"],
        |i, a, s| {
            s.sync_threads(i.single("ir_node")?, a.boolean("after_node")?)?;
            Ok(vec![])
        }
    );
    step_kind!(reg, "ComputeAt", inputs: ["block", "loop"], attrs: [], |i, _a, s| {
        s.compute_at(i.single("block")?, i.single("loop")?)?;
        Ok(vec![])
    });
    step_kind!(reg, "ComputeInline", inputs: ["schedule_block"], attrs: [], |i, _a, s| {
        s.compute_inline(i.single("schedule_block")?)?;
        Ok(vec![])
    });
    step_kind!(reg, "MergeExprs", inputs: [], attrs: [], |_i, _a, s| {
        s.merge_exprs()?;
        Ok(vec![])
    });
    step_kind!(reg, "Rfactor", inputs: ["rf_loop"], attrs: ["rf_axis"], |i, a, s| {
        Ok(vec![s.rfactor(i.single("rf_loop")?, a.int("rf_axis")? as usize)?])
    });

    reg
}

static GLOBAL: Lazy<Registry> = Lazy::new(builtins);

/// The process-wide registry holding every builtin step kind.
pub fn global() -> &'static Registry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{lower_workloads, Workload};
    use crate::trace::AttrValue;

    fn schedule() -> IrSchedule {
        let lowered =
            lower_workloads(&[Workload::elementwise_copy(vec![32, 32])]).expect("lowering");
        IrSchedule::new(lowered.module.clone())
    }

    #[test]
    fn test_unknown_kind() {
        let mut sch = schedule();
        let err = global()
            .invoke(
                "Tile",
                &StepInputs::default(),
                &StepAttrs::default(),
                &mut sch,
            )
            .unwrap_err();
        assert!(matches!(err, TraceError::UnknownKind(k) if k == "Tile"));
    }

    #[test]
    fn test_unknown_parameter_rejected_before_apply() {
        let mut sch = schedule();
        let mut attrs = StepAttrs::default();
        attrs
            .0
            .insert("block_name".to_string(), AttrValue::Str("B".to_string()));
        attrs.0.insert("nonsense".to_string(), AttrValue::Int(1));
        let err = global()
            .invoke("GetBlock", &StepInputs::default(), &attrs, &mut sch)
            .unwrap_err();
        assert!(
            matches!(err, TraceError::UnknownParameter { kind, param }
                if kind == "GetBlock" && param == "nonsense")
        );
        // Nothing was recorded.
        assert!(sch.trace().is_empty());
    }

    #[test]
    fn test_invoke_records_on_the_schedule() {
        let mut sch = schedule();
        let mut attrs = StepAttrs::default();
        attrs
            .0
            .insert("block_name".to_string(), AttrValue::Str("B".to_string()));
        let out = global()
            .invoke("GetBlock", &StepInputs::default(), &attrs, &mut sch)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(sch.trace().len(), 1);
        assert_eq!(sch.trace().steps()[0].kind, "GetBlock");
    }

    #[test]
    fn test_duplicate_registration() {
        let mut reg = Registry::new();
        let info = StepKindInfo {
            kind: "Noop",
            inputs: &[],
            attrs: &[],
            apply: |_i, _a, _s| Ok(vec![]),
        };
        reg.register(info.clone()).unwrap();
        let err = reg.register(info).unwrap_err();
        assert!(matches!(err, TraceError::DuplicateKind(k) if k == "Noop"));
    }

    #[test]
    fn test_every_builtin_is_present() {
        let names = global().kind_names();
        for kind in [
            "GetAllBlocks",
            "Split",
            "Fuse",
            "Reorder",
            "CacheRead",
            "CacheWrite",
            "ComputeAt",
            "ComputeInline",
            "MergeExprs",
            "Rfactor",
            "SyncThreads",
        ] {
            assert!(names.contains(&kind), "missing builtin `{}`", kind);
        }
        assert_eq!(names.len(), 25);
    }
}
