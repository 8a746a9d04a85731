//! Utility modules shared across the crate:
//! - Error types
//! - Fresh-name generation
//! - Code formatting helpers

pub mod context;
pub mod errors;
pub mod pretty;

// Re-exports
pub use context::NameContext;
pub use errors::*;
pub use pretty::CodeFormatter;
