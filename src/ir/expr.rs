//! Scalar expressions and supporting value types for the reference IR.
//!
//! Statement bodies (stores and their value expressions) are written in terms
//! of block-local iteration variables, never loop variables directly; the
//! block's binding list is the only place loop variables appear. Loop
//! transformations therefore rewrite bindings and leave statement bodies
//! untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar expression: loop/iter variables, integer index arithmetic,
/// float immediates, and tensor loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    /// Integer immediate
    IntImm(i64),
    /// Float immediate
    FloatImm(f64),
    /// Named variable (a loop var or a block iter var)
    Var(String),
    /// Addition
    Add(Box<ScalarExpr>, Box<ScalarExpr>),
    /// Multiplication
    Mul(Box<ScalarExpr>, Box<ScalarExpr>),
    /// Floor division
    Div(Box<ScalarExpr>, Box<ScalarExpr>),
    /// Modulo
    Mod(Box<ScalarExpr>, Box<ScalarExpr>),
    /// Tensor element read
    Load {
        /// Tensor name
        tensor: String,
        /// Index expression per dimension
        indices: Vec<ScalarExpr>,
    },
}

impl ScalarExpr {
    /// A variable reference.
    pub fn var(name: impl Into<String>) -> Self {
        ScalarExpr::Var(name.into())
    }

    /// An integer immediate.
    pub fn int(v: i64) -> Self {
        ScalarExpr::IntImm(v)
    }

    /// `self + rhs`
    pub fn add(self, rhs: ScalarExpr) -> Self {
        ScalarExpr::Add(Box::new(self), Box::new(rhs))
    }

    /// `self * rhs`
    pub fn mul(self, rhs: ScalarExpr) -> Self {
        ScalarExpr::Mul(Box::new(self), Box::new(rhs))
    }

    /// `self / rhs` (floor division)
    pub fn div(self, rhs: ScalarExpr) -> Self {
        ScalarExpr::Div(Box::new(self), Box::new(rhs))
    }

    /// `self % rhs`
    pub fn modulo(self, rhs: ScalarExpr) -> Self {
        ScalarExpr::Mod(Box::new(self), Box::new(rhs))
    }

    /// A tensor load.
    pub fn load(tensor: impl Into<String>, indices: Vec<ScalarExpr>) -> Self {
        ScalarExpr::Load {
            tensor: tensor.into(),
            indices,
        }
    }

    /// Replace every `Var(name)` present in `map` by its mapped expression.
    pub fn substitute(&self, map: &BTreeMap<String, ScalarExpr>) -> ScalarExpr {
        match self {
            ScalarExpr::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            ScalarExpr::IntImm(_) | ScalarExpr::FloatImm(_) => self.clone(),
            ScalarExpr::Add(a, b) => ScalarExpr::Add(
                Box::new(a.substitute(map)),
                Box::new(b.substitute(map)),
            ),
            ScalarExpr::Mul(a, b) => ScalarExpr::Mul(
                Box::new(a.substitute(map)),
                Box::new(b.substitute(map)),
            ),
            ScalarExpr::Div(a, b) => ScalarExpr::Div(
                Box::new(a.substitute(map)),
                Box::new(b.substitute(map)),
            ),
            ScalarExpr::Mod(a, b) => ScalarExpr::Mod(
                Box::new(a.substitute(map)),
                Box::new(b.substitute(map)),
            ),
            ScalarExpr::Load { tensor, indices } => ScalarExpr::Load {
                tensor: tensor.clone(),
                indices: indices.iter().map(|e| e.substitute(map)).collect(),
            },
        }
    }

    /// Rename every load of `from` into a load of `to`, keeping indices.
    pub fn rename_tensor(&self, from: &str, to: &str) -> ScalarExpr {
        match self {
            ScalarExpr::Load { tensor, indices } => ScalarExpr::Load {
                tensor: if tensor == from {
                    to.to_string()
                } else {
                    tensor.clone()
                },
                indices: indices.iter().map(|e| e.rename_tensor(from, to)).collect(),
            },
            ScalarExpr::Add(a, b) => ScalarExpr::Add(
                Box::new(a.rename_tensor(from, to)),
                Box::new(b.rename_tensor(from, to)),
            ),
            ScalarExpr::Mul(a, b) => ScalarExpr::Mul(
                Box::new(a.rename_tensor(from, to)),
                Box::new(b.rename_tensor(from, to)),
            ),
            ScalarExpr::Div(a, b) => ScalarExpr::Div(
                Box::new(a.rename_tensor(from, to)),
                Box::new(b.rename_tensor(from, to)),
            ),
            ScalarExpr::Mod(a, b) => ScalarExpr::Mod(
                Box::new(a.rename_tensor(from, to)),
                Box::new(b.rename_tensor(from, to)),
            ),
            _ => self.clone(),
        }
    }

    /// Append the names of tensors this expression loads, in first-occurrence
    /// order, skipping duplicates already in `out`.
    pub fn collect_read_tensors(&self, out: &mut Vec<String>) {
        match self {
            ScalarExpr::Load { tensor, indices } => {
                if !out.iter().any(|t| t == tensor) {
                    out.push(tensor.clone());
                }
                for idx in indices {
                    idx.collect_read_tensors(out);
                }
            }
            ScalarExpr::Add(a, b)
            | ScalarExpr::Mul(a, b)
            | ScalarExpr::Div(a, b)
            | ScalarExpr::Mod(a, b) => {
                a.collect_read_tensors(out);
                b.collect_read_tensors(out);
            }
            _ => {}
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::IntImm(v) => write!(f, "{}", v),
            ScalarExpr::FloatImm(v) => write!(f, "{:?}", v),
            ScalarExpr::Var(name) => write!(f, "{}", name),
            ScalarExpr::Add(a, b) => write!(f, "({} + {})", a, b),
            ScalarExpr::Mul(a, b) => write!(f, "({} * {})", a, b),
            ScalarExpr::Div(a, b) => write!(f, "({} / {})", a, b),
            ScalarExpr::Mod(a, b) => write!(f, "({} % {})", a, b),
            ScalarExpr::Load { tensor, indices } => {
                write!(f, "{}[", tensor)?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", idx)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A block-local iteration variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterVar {
    /// Variable name, referenced by the block's statement bodies
    pub name: String,
    /// Whether this axis reduces (accumulates) rather than parallel-iterates
    pub is_reduce: bool,
}

impl IterVar {
    /// A data-parallel iteration variable.
    pub fn spatial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_reduce: false,
        }
    }

    /// A reduction iteration variable.
    pub fn reduce(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_reduce: true,
        }
    }
}

/// Execution discipline of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum ForKind {
    /// Ordinary sequential loop
    #[default]
    Serial,
    /// Parallel across CPU threads
    Parallel,
    /// Vectorized with the given lane count
    Vectorized {
        /// SIMD lane count
        factor: i64,
    },
    /// Fully unrolled
    Unrolled,
    /// Bound to a GPU thread/block axis
    Bound {
        /// Axis name, e.g. `blockIdx.x`
        axis: String,
    },
}

impl ForKind {
    /// Whether the loop runs other than plain sequentially.
    pub fn is_non_serial(&self) -> bool {
        !matches!(self, ForKind::Serial)
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DType {
    /// 32-bit float
    #[default]
    F32,
    /// 32-bit int
    I32,
}

impl DType {
    /// C type name for code generation.
    pub fn c_name(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::I32 => "int",
        }
    }
}

/// Shape, dtype and placement metadata for one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Extent per dimension
    pub shape: Vec<i64>,
    /// Element type
    pub dtype: DType,
    /// Memory class (`global`, `local`, `shared`); schedule primitives may
    /// retarget it
    pub memory: String,
    /// Whether the memory class is pinned against later changes
    pub fixed: bool,
}

impl TensorMeta {
    /// A tensor in the default global memory class.
    pub fn global(shape: Vec<i64>) -> Self {
        Self {
            shape,
            dtype: DType::F32,
            memory: "global".to_string(),
            fixed: false,
        }
    }

    /// Total element count.
    pub fn numel(&self) -> i64 {
        self.shape.iter().product()
    }
}
