//! Arena-backed IR tree for lowered function bodies.
//!
//! Nodes live in a flat arena and reference each other by `NodeId`. A `NodeId`
//! is the handle currency of the whole crate: schedule primitives take and
//! return them, traces record them, and rules hold them. Handles are plain
//! indices, so cloning a module yields a structurally identical tree in which
//! every handle keeps its meaning — replaying a trace against a clone needs no
//! translation beyond the step-output threading the trace itself provides.
//!
//! Replaced nodes are detached (parent cleared) but never deallocated; a stale
//! handle keeps indexing its old node, which is dead weight in the arena but
//! never dangles.

use crate::ir::expr::{ForKind, IterVar, ScalarExpr, TensorMeta};
use crate::trace::AttrValue;
use crate::utils::NameContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An opaque, copyable reference to one node of an IR tree.
///
/// Valid only for the module (or clones of the module) that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One IR tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Parent node, `None` for roots and detached nodes
    pub parent: Option<NodeId>,
    /// Payload
    pub kind: NodeKind,
}

/// Node payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A loop from 0 to `extent`
    For {
        /// Loop variable name
        var: String,
        /// Constant trip count
        extent: i64,
        /// Execution discipline
        kind: ForKind,
        /// Loop body
        body: NodeId,
    },
    /// A scheduling block: iteration variables bound to outer-loop expressions
    Block {
        /// Block name (matches the tensor it computes for lowered blocks)
        name: String,
        /// Block-local iteration variables
        iter_vars: Vec<IterVar>,
        /// One binding expression per iter var, written over loop variables
        bindings: Vec<ScalarExpr>,
        /// Schedule annotations attached to this block
        annotations: BTreeMap<String, AttrValue>,
        /// Block body
        body: NodeId,
    },
    /// Ordered statement sequence
    Seq {
        /// Child statements in execution order
        children: Vec<NodeId>,
    },
    /// A tensor element write
    Store {
        /// Target tensor
        tensor: String,
        /// Index expression per dimension (over block iter vars)
        indices: Vec<ScalarExpr>,
        /// Stored value (over block iter vars)
        value: ScalarExpr,
    },
    /// A device-wide synchronization point
    SyncThreads,
}

/// A module of IR trees: one root per lowered function body, shared tensor
/// metadata, and the name counter the trees were built with.
#[derive(Debug, Clone, Default)]
pub struct IrModule {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    /// Tensor metadata, keyed by tensor name
    pub tensors: BTreeMap<String, TensorMeta>,
    /// Fresh-name state; snapshotted by clones
    pub name_ctx: NameContext,
}

impl IrModule {
    /// An empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a detached node.
    pub fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { parent: None, kind });
        id
    }

    /// Register a node as a function-body root.
    pub fn add_root(&mut self, id: NodeId) {
        self.roots.push(id);
    }

    /// The function-body roots in order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Drop all roots except the first `n`.
    pub(crate) fn truncate_roots(&mut self, n: usize) {
        self.roots.truncate(n);
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Borrow a node's payload.
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0 as usize].kind
    }

    /// Mutably borrow a node's payload.
    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.nodes[id.0 as usize].kind
    }

    /// Parent of a node, if attached.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].parent
    }

    /// Set (or clear) a node's parent link.
    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.nodes[id.0 as usize].parent = parent;
    }

    /// Direct children of a node, in order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.kind(id) {
            NodeKind::For { body, .. } | NodeKind::Block { body, .. } => vec![*body],
            NodeKind::Seq { children } => children.clone(),
            NodeKind::Store { .. } | NodeKind::SyncThreads => Vec::new(),
        }
    }

    /// Preorder traversal of the subtree rooted at `root`.
    pub fn preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let mut kids = self.children(id);
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// All blocks in the module in preorder, excluding function-body roots.
    pub fn collect_blocks(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for &root in &self.roots {
            for id in self.preorder(root) {
                if id != root && matches!(self.kind(id), NodeKind::Block { .. }) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Find a block by name anywhere in the module.
    pub fn find_block(&self, name: &str) -> Option<NodeId> {
        self.collect_blocks().into_iter().find(|&id| {
            matches!(self.kind(id), NodeKind::Block { name: n, .. } if n == name)
        })
    }

    /// Loops enclosing `id`, outermost first, stopping at the enclosing
    /// function-body root.
    pub fn loops_enclosing(&self, id: NodeId) -> Vec<NodeId> {
        let mut loops = Vec::new();
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            if matches!(self.kind(p), NodeKind::For { .. }) {
                loops.push(p);
            }
            cur = self.parent(p);
        }
        loops.reverse();
        loops
    }

    /// The top of the tree containing `id` (a function-body root for attached
    /// nodes).
    pub fn tree_root_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            cur = p;
        }
        cur
    }

    /// Replace `old` by `new` in `old`'s parent (or in the root list).
    /// `old` is detached; `new` adopts `old`'s parent.
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        let parent = self.parent(old);
        match parent {
            None => {
                for slot in self.roots.iter_mut() {
                    if *slot == old {
                        *slot = new;
                    }
                }
            }
            Some(p) => match self.kind_mut(p) {
                NodeKind::For { body, .. } | NodeKind::Block { body, .. } => {
                    if *body == old {
                        *body = new;
                    }
                }
                NodeKind::Seq { children } => {
                    for slot in children.iter_mut() {
                        if *slot == old {
                            *slot = new;
                        }
                    }
                }
                NodeKind::Store { .. } | NodeKind::SyncThreads => {}
            },
        }
        self.set_parent(new, parent);
        self.set_parent(old, None);
    }

    /// Insert `new` as a sibling of `anchor`, before it (`after == false`) or
    /// after it. Wraps the anchor in a fresh `Seq` when its parent is not one.
    pub fn insert_beside(&mut self, anchor: NodeId, new: NodeId, after: bool) {
        let parent = self.parent(anchor);
        if let Some(p) = parent {
            if let NodeKind::Seq { .. } = self.kind(p) {
                let pos = {
                    let NodeKind::Seq { children } = self.kind(p) else {
                        unreachable!()
                    };
                    children.iter().position(|&c| c == anchor)
                };
                if let Some(pos) = pos {
                    let at = if after { pos + 1 } else { pos };
                    if let NodeKind::Seq { children } = self.kind_mut(p) {
                        children.insert(at, new);
                    }
                    self.set_parent(new, Some(p));
                    return;
                }
            }
        }
        // Wrap: anchor's slot becomes a two-element sequence.
        let seq = self.alloc(NodeKind::Seq {
            children: Vec::new(),
        });
        self.replace(anchor, seq);
        let children = if after {
            vec![anchor, new]
        } else {
            vec![new, anchor]
        };
        if let NodeKind::Seq { children: c } = self.kind_mut(seq) {
            *c = children;
        }
        self.set_parent(anchor, Some(seq));
        self.set_parent(new, Some(seq));
    }

    /// Remove `id` from its parent's child list (the node is detached, not
    /// deallocated).
    pub fn detach(&mut self, id: NodeId) {
        if let Some(p) = self.parent(id) {
            if let NodeKind::Seq { children } = self.kind_mut(p) {
                children.retain(|&c| c != id);
            }
        } else {
            self.roots.retain(|&r| r != id);
        }
        self.set_parent(id, None);
    }

    /// Rewrite block bindings throughout the subtree at `root` with `map`.
    /// Statement bodies are untouched; only bindings mention loop variables.
    pub fn substitute_bindings(&mut self, root: NodeId, map: &BTreeMap<String, ScalarExpr>) {
        for id in self.preorder(root) {
            if let NodeKind::Block { bindings, .. } = self.kind_mut(id) {
                for b in bindings.iter_mut() {
                    *b = b.substitute(map);
                }
            }
        }
    }

    /// Rewrite loads (and optionally store targets) of tensor `from` into
    /// `to` throughout the subtree at `root`.
    pub fn rename_tensor(&mut self, root: NodeId, from: &str, to: &str, stores_too: bool) {
        for id in self.preorder(root) {
            if let NodeKind::Store {
                tensor,
                indices,
                value,
            } = self.kind_mut(id)
            {
                if stores_too && tensor == from {
                    *tensor = to.to_string();
                }
                for idx in indices.iter_mut() {
                    *idx = idx.rename_tensor(from, to);
                }
                *value = value.rename_tensor(from, to);
            }
        }
    }

    /// The stores inside the subtree at `root`, in preorder.
    pub fn stores_in(&self, root: NodeId) -> Vec<NodeId> {
        self.preorder(root)
            .into_iter()
            .filter(|&id| matches!(self.kind(id), NodeKind::Store { .. }))
            .collect()
    }

    /// Convenience: attach `child` under a fresh `For` node.
    pub fn mk_for(&mut self, var: String, extent: i64, kind: ForKind, body: NodeId) -> NodeId {
        let id = self.alloc(NodeKind::For {
            var,
            extent,
            kind,
            body,
        });
        self.set_parent(body, Some(id));
        id
    }

    /// Convenience: attach `body` under a fresh `Block` node.
    pub fn mk_block(
        &mut self,
        name: String,
        iter_vars: Vec<IterVar>,
        bindings: Vec<ScalarExpr>,
        body: NodeId,
    ) -> NodeId {
        let id = self.alloc(NodeKind::Block {
            name,
            iter_vars,
            bindings,
            annotations: BTreeMap::new(),
            body,
        });
        self.set_parent(body, Some(id));
        id
    }

    /// Convenience: a fresh `Seq` node adopting `children`.
    pub fn mk_seq(&mut self, children: Vec<NodeId>) -> NodeId {
        let id = self.alloc(NodeKind::Seq {
            children: children.clone(),
        });
        for c in children {
            self.set_parent(c, Some(id));
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_module() -> (IrModule, NodeId, NodeId, NodeId) {
        let mut m = IrModule::new();
        let store = m.alloc(NodeKind::Store {
            tensor: "B".to_string(),
            indices: vec![ScalarExpr::var("i0")],
            value: ScalarExpr::load("A", vec![ScalarExpr::var("i0")]),
        });
        let block = m.mk_block(
            "B".to_string(),
            vec![IterVar::spatial("i0")],
            vec![ScalarExpr::var("i")],
            store,
        );
        let l = m.mk_for("i".to_string(), 16, ForKind::Serial, block);
        let root = m.mk_block("root_0".to_string(), vec![], vec![], l);
        m.add_root(root);
        (m, root, l, block)
    }

    #[test]
    fn test_loops_enclosing_and_root() {
        let (m, root, l, block) = tiny_module();
        assert_eq!(m.loops_enclosing(block), vec![l]);
        assert_eq!(m.tree_root_of(block), root);
        assert_eq!(m.collect_blocks(), vec![block]);
    }

    #[test]
    fn test_replace_detaches_old() {
        let (mut m, _root, l, block) = tiny_module();
        let store2 = m.alloc(NodeKind::SyncThreads);
        let l2 = m.mk_for("k".to_string(), 4, ForKind::Serial, store2);
        m.replace(l, l2);
        assert_eq!(m.parent(l), None);
        assert!(m.parent(l2).is_some());
        // The block is now only reachable through the detached loop.
        assert!(m.collect_blocks().is_empty());
        let _ = block;
    }

    #[test]
    fn test_insert_beside_wraps_non_seq_parent() {
        let (mut m, root, l, _block) = tiny_module();
        let sync = m.alloc(NodeKind::SyncThreads);
        m.insert_beside(l, sync, false);
        let NodeKind::Block { body, .. } = m.kind(root) else {
            panic!("root is a block")
        };
        let NodeKind::Seq { children } = m.kind(*body) else {
            panic!("expected wrap into Seq")
        };
        assert_eq!(children, &vec![sync, l]);
    }

    #[test]
    fn test_clone_preserves_handles() {
        let (m, _root, _l, block) = tiny_module();
        let clone = m.clone();
        assert_eq!(clone.collect_blocks(), vec![block]);
        assert_eq!(m.kind(block), clone.kind(block));
    }
}
