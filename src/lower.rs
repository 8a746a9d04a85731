//! Reference lowering from workload descriptions to unscheduled modules.
//!
//! Each workload lowers to one function-body root block holding a perfect
//! loop nest per stage. Statement bodies are written over block-local
//! iteration variables (`i0`, `i1`, ...); the loop variables (`i`, `j`, `k`)
//! appear only in block bindings.

use crate::ir::expr::{ForKind, IterVar, ScalarExpr, TensorMeta};
use crate::ir::module::{IrModule, NodeId, NodeKind};
use crate::utils::errors::LowerError;
use log::debug;
use serde::{Deserialize, Serialize};

/// Pointwise operation applied per stage of an elementwise workload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ElementwiseOp {
    /// `out[i] = in[i]`
    Copy,
    /// `out[i] = in[i] + c`
    AddConst(f64),
}

/// A tensor program to lower and tune.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Workload {
    /// A chain of pointwise stages over one shape
    Elementwise {
        /// Per-stage operation
        op: ElementwiseOp,
        /// Tensor shape
        shape: Vec<i64>,
        /// Number of chained stages (each stage reads the previous)
        stages: usize,
    },
    /// Row-wise sum of a matrix: `C[i] = sum_k A[i, k]`
    ReduceSum {
        /// Number of rows
        rows: i64,
        /// Number of columns (the reduced axis)
        cols: i64,
    },
}

impl Workload {
    /// A single-stage identity copy.
    pub fn elementwise_copy(shape: Vec<i64>) -> Self {
        Workload::Elementwise {
            op: ElementwiseOp::Copy,
            shape,
            stages: 1,
        }
    }

    /// A single-stage add-constant.
    pub fn elementwise_add_const(shape: Vec<i64>, c: f64) -> Self {
        Workload::Elementwise {
            op: ElementwiseOp::AddConst(c),
            shape,
            stages: 1,
        }
    }

    /// A chain of `stages` copy stages.
    pub fn staged_copy(shape: Vec<i64>, stages: usize) -> Self {
        Workload::Elementwise {
            op: ElementwiseOp::Copy,
            shape,
            stages,
        }
    }

    /// A row-wise matrix reduction.
    pub fn reduce_sum(rows: i64, cols: i64) -> Self {
        Workload::ReduceSum { rows, cols }
    }

    /// A stable human-readable name.
    pub fn name(&self) -> String {
        match self {
            Workload::Elementwise { op, shape, stages } => {
                let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
                let op = match op {
                    ElementwiseOp::Copy => "copy",
                    ElementwiseOp::AddConst(_) => "add_const",
                };
                if *stages > 1 {
                    format!("{}_{}_x{}", op, dims.join("x"), stages)
                } else {
                    format!("{}_{}", op, dims.join("x"))
                }
            }
            Workload::ReduceSum { rows, cols } => format!("reduce_sum_{}x{}", rows, cols),
        }
    }
}

/// ABI of one lowered function: input and output tensor names in call order.
/// Tensors of the module not listed here are intermediates.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncMeta {
    /// Function name
    pub name: String,
    /// Argument tensor names, inputs first
    pub args: Vec<String>,
}

/// An unscheduled module plus per-function ABI metadata. Clone it to obtain
/// independent schedules over the same program.
#[derive(Debug, Clone)]
pub struct LoweredModule {
    /// The lowered IR
    pub module: IrModule,
    /// One entry per workload, in input order
    pub funcs: Vec<FuncMeta>,
}

/// Loop variable name for dimension `d`.
fn loop_var(d: usize) -> String {
    match d {
        0 => "i".to_string(),
        1 => "j".to_string(),
        2 => "k".to_string(),
        d => format!("i{}", d),
    }
}

/// Tensor name with a per-workload suffix to keep the module-wide namespace
/// unique.
fn tensor_name(base: &str, workload_idx: usize) -> String {
    if workload_idx == 0 {
        base.to_string()
    } else {
        format!("{}_{}", base, workload_idx)
    }
}

/// Lower each workload into one function body of a shared module.
pub fn lower_workloads(workloads: &[Workload]) -> Result<LoweredModule, LowerError> {
    let mut module = IrModule::new();
    let mut funcs = Vec::with_capacity(workloads.len());
    for (idx, w) in workloads.iter().enumerate() {
        debug!("lowering workload {} ({})", idx, w.name());
        let func = match w {
            Workload::Elementwise { op, shape, stages } => {
                lower_elementwise(&mut module, idx, *op, shape, *stages)?
            }
            Workload::ReduceSum { rows, cols } => lower_reduce_sum(&mut module, idx, *rows, *cols)?,
        };
        funcs.push(func);
    }
    Ok(LoweredModule { module, funcs })
}

fn check_shape(shape: &[i64]) -> Result<(), LowerError> {
    if shape.is_empty() || shape.iter().any(|&d| d <= 0) {
        return Err(LowerError::UnsupportedShape(format!("{:?}", shape)));
    }
    Ok(())
}

/// Build `for .. { block name(iters) { store } }` over `shape` and return the
/// nest root.
fn stage_nest(
    module: &mut IrModule,
    shape: &[i64],
    block_name: &str,
    reduce_dims: &[bool],
    store: NodeId,
) -> NodeId {
    let iter_vars: Vec<IterVar> = (0..shape.len())
        .map(|d| {
            let name = format!("i{}", d);
            if reduce_dims.get(d).copied().unwrap_or(false) {
                IterVar::reduce(name)
            } else {
                IterVar::spatial(name)
            }
        })
        .collect();
    let bindings: Vec<ScalarExpr> = (0..shape.len())
        .map(|d| ScalarExpr::var(loop_var(d)))
        .collect();
    let block = module.mk_block(block_name.to_string(), iter_vars, bindings, store);
    let mut cur = block;
    for (d, &extent) in shape.iter().enumerate().rev() {
        cur = module.mk_for(loop_var(d), extent, ForKind::Serial, cur);
    }
    cur
}

fn iter_indices(rank: usize) -> Vec<ScalarExpr> {
    (0..rank).map(|d| ScalarExpr::var(format!("i{}", d))).collect()
}

fn lower_elementwise(
    module: &mut IrModule,
    idx: usize,
    op: ElementwiseOp,
    shape: &[i64],
    stages: usize,
) -> Result<FuncMeta, LowerError> {
    check_shape(shape)?;
    if stages == 0 || stages > 24 {
        return Err(LowerError::UnsupportedShape(format!(
            "{} elementwise stages",
            stages
        )));
    }

    let input = tensor_name("A", idx);
    module
        .tensors
        .insert(input.clone(), TensorMeta::global(shape.to_vec()));

    let mut nests = Vec::with_capacity(stages);
    let mut prev = input.clone();
    let mut out = prev.clone();
    for stage in 0..stages {
        // Stage tensors are B, C, D, ... in chain order.
        let base = char::from(b'B' + stage as u8).to_string();
        out = tensor_name(&base, idx);
        module
            .tensors
            .insert(out.clone(), TensorMeta::global(shape.to_vec()));
        let loaded = ScalarExpr::load(&prev, iter_indices(shape.len()));
        let value = match op {
            ElementwiseOp::Copy => loaded,
            ElementwiseOp::AddConst(c) => loaded.add(ScalarExpr::FloatImm(c)),
        };
        let store = module.alloc(NodeKind::Store {
            tensor: out.clone(),
            indices: iter_indices(shape.len()),
            value,
        });
        let reduce_dims = vec![false; shape.len()];
        nests.push(stage_nest(module, shape, &out, &reduce_dims, store));
        prev = out.clone();
    }

    let body = if nests.len() == 1 {
        nests[0]
    } else {
        module.mk_seq(nests)
    };
    let root = module.mk_block(format!("root_{}", idx), vec![], vec![], body);
    module.add_root(root);
    Ok(FuncMeta {
        name: format!("fn_{}", idx),
        args: vec![input, out],
    })
}

fn lower_reduce_sum(
    module: &mut IrModule,
    idx: usize,
    rows: i64,
    cols: i64,
) -> Result<FuncMeta, LowerError> {
    if rows <= 0 || cols <= 0 {
        return Err(LowerError::UnsupportedShape(format!(
            "reduce_sum {}x{}",
            rows, cols
        )));
    }
    let input = tensor_name("A", idx);
    let out = tensor_name("C", idx);
    module
        .tensors
        .insert(input.clone(), TensorMeta::global(vec![rows, cols]));
    module
        .tensors
        .insert(out.clone(), TensorMeta::global(vec![rows]));

    // Init stage: C[i0] = 0.
    let init_name = format!("{}_init", out);
    let init_store = module.alloc(NodeKind::Store {
        tensor: out.clone(),
        indices: vec![ScalarExpr::var("i0")],
        value: ScalarExpr::FloatImm(0.0),
    });
    let init_nest = stage_nest(module, &[rows], &init_name, &[false], init_store);

    // Reduce stage: C[i0] = C[i0] + A[i0, i1] with i1 the reduction axis.
    let reduce_store = module.alloc(NodeKind::Store {
        tensor: out.clone(),
        indices: vec![ScalarExpr::var("i0")],
        value: ScalarExpr::load(&out, vec![ScalarExpr::var("i0")]).add(ScalarExpr::load(
            &input,
            vec![ScalarExpr::var("i0"), ScalarExpr::var("i1")],
        )),
    });
    let reduce_block = module.mk_block(
        out.clone(),
        vec![IterVar::spatial("i0"), IterVar::reduce("i1")],
        vec![ScalarExpr::var("i"), ScalarExpr::var("k")],
        reduce_store,
    );
    let inner = module.mk_for("k".to_string(), cols, ForKind::Serial, reduce_block);
    let reduce_nest = module.mk_for("i".to_string(), rows, ForKind::Serial, inner);

    let body = module.mk_seq(vec![init_nest, reduce_nest]);
    let root = module.mk_block(format!("root_{}", idx), vec![], vec![], body);
    module.add_root(root);
    Ok(FuncMeta {
        name: format!("fn_{}", idx),
        args: vec![input, out],
    })
}
