//! Code generation from scheduled modules to compilable C source.

pub mod c;

pub use c::{emit_benchmark_main, emit_module};

use serde::{Deserialize, Serialize};

/// Code generation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Target {
    /// Plain C, loop kinds lowered to comments where C has no equivalent
    #[default]
    C,
    /// C with OpenMP pragmas for parallel and vectorized loops
    OpenMp,
}
