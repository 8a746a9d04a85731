//! Fresh-name generation for schedule transformations.
//!
//! Loop transformations mint new variable and tensor names (fused loop vars,
//! split sub-loops, cache buffers). Name generation is ordinary per-module
//! state rather than a process-wide singleton: a `NameContext` travels with the
//! module it names, and cloning a module snapshots the counter, so a replay
//! against a fresh clone sees exactly the counter state the recording run saw.
//! Callers comparing output across independently constructed modules must
//! `reset()` both sides first, or textual comparisons become flaky.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-prefix counters for deterministic fresh names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameContext {
    counters: BTreeMap<String, u64>,
}

impl NameContext {
    /// Create a context with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `"{prefix}_{n}"` where n counts prior calls with this prefix.
    pub fn fresh(&mut self, prefix: &str) -> String {
        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        let name = format!("{}_{}", prefix, counter);
        *counter += 1;
        name
    }

    /// Reset every counter to zero.
    ///
    /// Must be called on both sides before any comparison between modules that
    /// were not cloned from a common ancestor.
    pub fn reset(&mut self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_names_are_sequential_per_prefix() {
        let mut ctx = NameContext::new();
        assert_eq!(ctx.fresh("i"), "i_0");
        assert_eq!(ctx.fresh("i"), "i_1");
        assert_eq!(ctx.fresh("fused"), "fused_0");
        assert_eq!(ctx.fresh("i"), "i_2");
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut ctx = NameContext::new();
        ctx.fresh("i");
        ctx.fresh("i");
        ctx.reset();
        assert_eq!(ctx.fresh("i"), "i_0");
    }

    #[test]
    fn test_clone_snapshots_counters() {
        let mut ctx = NameContext::new();
        ctx.fresh("i");
        let mut snap = ctx.clone();
        assert_eq!(ctx.fresh("i"), snap.fresh("i"));
    }
}
