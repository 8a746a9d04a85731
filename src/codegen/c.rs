//! C emitter.
//!
//! Tensors are emitted as flat arrays with row-major indexing; multi-
//! dimensional accesses are flattened against the tensor's registered shape.
//! Block iteration variables become `const int` bindings at the top of the
//! block body, so the emitted statement is a direct transliteration of the
//! stored expression.

use crate::codegen::Target;
use crate::ir::expr::{ForKind, ScalarExpr};
use crate::ir::module::{IrModule, NodeId, NodeKind};
use crate::lower::FuncMeta;
use crate::rules::auto_unroll::AUTO_UNROLL_KEY;
use crate::trace::AttrValue;
use crate::utils::CodeFormatter;

struct Emitter<'a> {
    module: &'a IrModule,
    target: Target,
    /// Max unroll step of the enclosing root block annotation, 0 when absent.
    unroll_max_step: i64,
}

impl<'a> Emitter<'a> {
    fn expr(&self, e: &ScalarExpr) -> String {
        match e {
            ScalarExpr::IntImm(v) => format!("{}", v),
            ScalarExpr::FloatImm(v) => format!("{:?}f", v),
            ScalarExpr::Var(name) => name.clone(),
            ScalarExpr::Add(a, b) => format!("({} + {})", self.expr(a), self.expr(b)),
            ScalarExpr::Mul(a, b) => format!("({} * {})", self.expr(a), self.expr(b)),
            ScalarExpr::Div(a, b) => format!("({} / {})", self.expr(a), self.expr(b)),
            ScalarExpr::Mod(a, b) => format!("({} % {})", self.expr(a), self.expr(b)),
            ScalarExpr::Load { tensor, indices } => {
                format!("{}[{}]", tensor, self.flat_index(tensor, indices))
            }
        }
    }

    /// Row-major flattened index against the tensor's registered shape.
    fn flat_index(&self, tensor: &str, indices: &[ScalarExpr]) -> String {
        let strides: Vec<i64> = match self.module.tensors.get(tensor) {
            Some(meta) => {
                let mut strides = vec![1i64; meta.shape.len()];
                for d in (0..meta.shape.len().saturating_sub(1)).rev() {
                    strides[d] = strides[d + 1] * meta.shape[d + 1];
                }
                strides
            }
            None => vec![1; indices.len()],
        };
        let terms: Vec<String> = indices
            .iter()
            .zip(strides.iter())
            .map(|(idx, &s)| {
                if s == 1 {
                    self.expr(idx)
                } else {
                    format!("{} * {}", self.expr(idx), s)
                }
            })
            .collect();
        if terms.is_empty() {
            "0".to_string()
        } else {
            terms.join(" + ")
        }
    }

    fn loop_pragma(&self, kind: &ForKind, extent: i64, innermost: bool) -> Option<String> {
        match kind {
            ForKind::Serial => {
                if innermost && self.unroll_max_step > 0 && extent <= self.unroll_max_step {
                    Some(format!("#pragma GCC unroll {}", extent))
                } else {
                    None
                }
            }
            ForKind::Parallel => match self.target {
                Target::OpenMp => Some("#pragma omp parallel for".to_string()),
                Target::C => None,
            },
            ForKind::Vectorized { factor } => match self.target {
                Target::OpenMp => Some(format!("#pragma omp simd simdlen({})", factor)),
                Target::C => None,
            },
            ForKind::Unrolled => Some(format!("#pragma GCC unroll {}", extent)),
            // C targets have no thread axes; the loop runs serially.
            ForKind::Bound { .. } => None,
        }
    }

    fn node(&mut self, id: NodeId, fmt: &mut CodeFormatter) {
        match self.module.kind(id) {
            NodeKind::For {
                var,
                extent,
                kind,
                body,
            } => {
                let innermost = !self
                    .module
                    .preorder(*body)
                    .into_iter()
                    .any(|n| matches!(self.module.kind(n), NodeKind::For { .. }));
                if let Some(pragma) = self.loop_pragma(kind, *extent, innermost) {
                    fmt.writeln(&pragma);
                }
                fmt.writeln(&format!(
                    "for (int {var} = 0; {var} < {extent}; {var}++) {{",
                    var = var,
                    extent = extent
                ));
                fmt.indent();
                self.node(*body, fmt);
                fmt.dedent();
                fmt.writeln("}");
            }
            NodeKind::Block {
                iter_vars,
                bindings,
                annotations,
                body,
                ..
            } => {
                let saved = self.unroll_max_step;
                if let Some(AttrValue::Int(step)) = annotations.get(AUTO_UNROLL_KEY) {
                    self.unroll_max_step = *step;
                }
                fmt.writeln("{");
                fmt.indent();
                for (v, b) in iter_vars.iter().zip(bindings.iter()) {
                    fmt.writeln(&format!("const int {} = {};", v.name, self.expr(b)));
                }
                self.node(*body, fmt);
                fmt.dedent();
                fmt.writeln("}");
                self.unroll_max_step = saved;
            }
            NodeKind::Seq { children } => {
                for &child in children {
                    self.node(child, fmt);
                }
            }
            NodeKind::Store {
                tensor,
                indices,
                value,
            } => {
                fmt.writeln(&format!(
                    "{}[{}] = {};",
                    tensor,
                    self.flat_index(tensor, indices),
                    self.expr(value)
                ));
            }
            NodeKind::SyncThreads => match self.target {
                Target::OpenMp => fmt.writeln("#pragma omp barrier"),
                Target::C => fmt.writeln("/* sync point */"),
            },
        }
    }
}

/// Emit one C function per lowered function body. Tensors not in a function's
/// argument list are declared as local arrays.
pub fn emit_module(module: &IrModule, funcs: &[FuncMeta], target: Target) -> String {
    let mut fmt = CodeFormatter::default_indent();
    fmt.writeln("#include <stdio.h>");
    fmt.writeln("#include <stdlib.h>");
    if target == Target::OpenMp {
        fmt.writeln("#include <omp.h>");
    }
    fmt.writeln("");

    for (func, &root) in funcs.iter().zip(module.roots().iter()) {
        let params: Vec<String> = func
            .args
            .iter()
            .map(|arg| {
                let dtype = module
                    .tensors
                    .get(arg)
                    .map(|m| m.dtype.c_name())
                    .unwrap_or("float");
                format!("{}* {}", dtype, arg)
            })
            .collect();
        fmt.writeln(&format!("void {}({}) {{", func.name, params.join(", ")));
        fmt.indent();

        // Intermediate and cache buffers referenced by this body.
        let mut locals: Vec<&str> = Vec::new();
        for id in module.preorder(root) {
            if let NodeKind::Store {
                tensor,
                indices,
                value,
            } = module.kind(id)
            {
                let mut reads = vec![tensor.clone()];
                for idx in indices {
                    idx.collect_read_tensors(&mut reads);
                }
                value.collect_read_tensors(&mut reads);
                for t in reads {
                    if !func.args.iter().any(|a| *a == t)
                        && !locals.contains(&t.as_str())
                        && module.tensors.contains_key(&t)
                    {
                        if let Some((name, _)) = module.tensors.get_key_value(&t) {
                            locals.push(name.as_str());
                        }
                    }
                }
            }
        }
        for local in locals {
            let meta = &module.tensors[local];
            fmt.writeln(&format!(
                "{} {}[{}];",
                meta.dtype.c_name(),
                local,
                meta.numel()
            ));
        }

        let mut emitter = Emitter {
            module,
            target,
            unroll_max_step: 0,
        };
        emitter.node(root, &mut fmt);
        fmt.dedent();
        fmt.writeln("}");
        fmt.writeln("");
    }
    fmt.finish()
}

/// Emit a benchmark `main` for one function: allocate arguments, run
/// `repeats` timed invocations, and print one `Time: <seconds>` line each.
pub fn emit_benchmark_main(module: &IrModule, func: &FuncMeta, repeats: usize) -> String {
    let mut fmt = CodeFormatter::default_indent();
    fmt.writeln("#include <time.h>");
    fmt.writeln("");
    fmt.writeln("int main(void) {");
    fmt.indent();
    for arg in &func.args {
        let meta = &module.tensors[arg];
        let cty = meta.dtype.c_name();
        fmt.writeln(&format!(
            "{}* {} = ({}*)calloc({}, sizeof({}));",
            cty,
            arg,
            cty,
            meta.numel(),
            cty
        ));
    }
    // First argument is the input; give it non-trivial contents.
    if let Some(input) = func.args.first() {
        let meta = &module.tensors[input];
        fmt.writeln(&format!(
            "for (long n = 0; n < {}; n++) {}[n] = ({})(n % 16) * 0.25f;",
            meta.numel(),
            input,
            meta.dtype.c_name()
        ));
    }
    fmt.writeln(&format!("for (int rep = 0; rep < {}; rep++) {{", repeats));
    fmt.indent();
    fmt.writeln("struct timespec t0, t1;");
    fmt.writeln("clock_gettime(CLOCK_MONOTONIC, &t0);");
    fmt.writeln(&format!("{}({});", func.name, func.args.join(", ")));
    fmt.writeln("clock_gettime(CLOCK_MONOTONIC, &t1);");
    fmt.writeln(
        "double secs = (double)(t1.tv_sec - t0.tv_sec) + (double)(t1.tv_nsec - t0.tv_nsec) * 1e-9;",
    );
    fmt.writeln("printf(\"Time: %.9f\\n\", secs);");
    fmt.dedent();
    fmt.writeln("}");
    for arg in &func.args {
        fmt.writeln(&format!("free({});", arg));
    }
    fmt.writeln("return 0;");
    fmt.dedent();
    fmt.writeln("}");
    fmt.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::schedule::IrSchedule;
    use crate::lower::{lower_workloads, Workload};

    #[test]
    fn test_emit_copy_function() {
        let lowered = lower_workloads(&[Workload::elementwise_copy(vec![4, 8])]).unwrap();
        let src = emit_module(&lowered.module, &lowered.funcs, Target::C);
        assert!(src.contains("void fn_0(float* A, float* B)"));
        assert!(src.contains("for (int i = 0; i < 4; i++) {"));
        assert!(src.contains("const int i0 = i;"));
        // Row-major flattening against the registered shape.
        assert!(src.contains("B[i0 * 8 + i1] = A[i0 * 8 + i1];"));
    }

    #[test]
    fn test_parallel_pragma_only_under_openmp() {
        let lowered = lower_workloads(&[Workload::elementwise_copy(vec![16])]).unwrap();
        let mut sched = IrSchedule::new(lowered.module.clone());
        let loops = sched.get_loops_by_name("B").unwrap();
        sched.parallel(loops[0]).unwrap();

        let omp = emit_module(sched.module(), &lowered.funcs, Target::OpenMp);
        assert!(omp.contains("#pragma omp parallel for"));
        let plain = emit_module(sched.module(), &lowered.funcs, Target::C);
        assert!(!plain.contains("#pragma omp"));
    }

    #[test]
    fn test_intermediate_declared_as_local() {
        let lowered = lower_workloads(&[Workload::staged_copy(vec![8], 2)]).unwrap();
        let src = emit_module(&lowered.module, &lowered.funcs, Target::C);
        // B is the intermediate between the two stages; C is the output arg.
        assert!(src.contains("void fn_0(float* A, float* C)"));
        assert!(src.contains("float B[8];"));
    }

    #[test]
    fn test_benchmark_main_prints_time_lines() {
        let lowered = lower_workloads(&[Workload::elementwise_copy(vec![8])]).unwrap();
        let src = emit_benchmark_main(&lowered.module, &lowered.funcs[0], 3);
        assert!(src.contains("for (int rep = 0; rep < 3; rep++) {"));
        assert!(src.contains("printf(\"Time: %.9f\\n\", secs);"));
        assert!(src.contains("fn_0(A, B);"));
    }
}
