//! Intermediate representation for lowered tensor programs and the schedule
//! object that transforms them.

pub mod expr;
pub mod module;
pub mod printer;
pub mod schedule;

pub use expr::{DType, ForKind, IterVar, ScalarExpr, TensorMeta};
pub use module::{IrModule, Node, NodeId, NodeKind};
pub use schedule::IrSchedule;
