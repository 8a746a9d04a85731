//! The mutable schedule object.
//!
//! `IrSchedule` owns one [`IrModule`] and a trace of every primitive applied
//! to it. Each public primitive first performs the mutation and, only on
//! success, appends the corresponding [`Step`] — callers never observe a
//! mutation without its record or a record without its mutation.
//!
//! Loop transformations rewrite block bindings only; statement bodies are
//! written over block-local iteration variables and survive any loop
//! restructuring unchanged.

use crate::ir::expr::{ForKind, IterVar, ScalarExpr, TensorMeta};
use crate::ir::module::{IrModule, NodeId, NodeKind};
use crate::trace::{AttrValue, ScheduleDesc, Step};
use crate::utils::errors::ScheduleError;
use log::debug;
use std::collections::BTreeMap;

/// A schedule bound to one IR module, recording every primitive it applies.
#[derive(Debug, Clone, Default)]
pub struct IrSchedule {
    module: IrModule,
    trace: ScheduleDesc,
}

impl IrSchedule {
    /// Wrap a module. The trace starts empty; the module keeps whatever
    /// fresh-name state it was lowered (or cloned) with.
    pub fn new(module: IrModule) -> Self {
        Self {
            module,
            trace: ScheduleDesc::new(),
        }
    }

    /// The scheduled module.
    pub fn module(&self) -> &IrModule {
        &self.module
    }

    /// The trace of every primitive applied so far.
    pub fn trace(&self) -> &ScheduleDesc {
        &self.trace
    }

    fn record(&mut self, step: Step) {
        debug!("record step {}", step.kind);
        self.trace.append(step);
    }

    fn expect_for(&self, id: NodeId) -> Result<(String, i64, ForKind, NodeId), ScheduleError> {
        match self.module.kind(id) {
            NodeKind::For {
                var,
                extent,
                kind,
                body,
            } => Ok((var.clone(), *extent, kind.clone(), *body)),
            _ => Err(ScheduleError::WrongNodeKind { expected: "loop" }),
        }
    }

    fn expect_block(&self, id: NodeId) -> Result<(), ScheduleError> {
        match self.module.kind(id) {
            NodeKind::Block { .. } => Ok(()),
            _ => Err(ScheduleError::WrongNodeKind { expected: "block" }),
        }
    }

    // ---- query primitives -------------------------------------------------

    /// All non-root blocks of the module, in program order.
    pub fn get_all_blocks(&mut self) -> Vec<NodeId> {
        let blocks = self.module.collect_blocks();
        self.record(Step::new("GetAllBlocks").outputs(blocks.clone()));
        blocks
    }

    /// The block with the given name.
    pub fn get_block(&mut self, name: &str) -> Result<NodeId, ScheduleError> {
        let block = self
            .module
            .find_block(name)
            .ok_or_else(|| ScheduleError::BlockNotFound(name.to_string()))?;
        self.record(
            Step::new("GetBlock")
                .attr("block_name", name)
                .outputs(vec![block]),
        );
        Ok(block)
    }

    /// Loops enclosing the given block, outermost first.
    pub fn get_loops(&mut self, block: NodeId) -> Result<Vec<NodeId>, ScheduleError> {
        self.expect_block(block)?;
        let loops = self.module.loops_enclosing(block);
        self.record(
            Step::new("GetLoops")
                .input("block", block)
                .outputs(loops.clone()),
        );
        Ok(loops)
    }

    /// Loops enclosing the named block, outermost first.
    pub fn get_loops_by_name(&mut self, name: &str) -> Result<Vec<NodeId>, ScheduleError> {
        let block = self
            .module
            .find_block(name)
            .ok_or_else(|| ScheduleError::BlockNotFound(name.to_string()))?;
        let loops = self.module.loops_enclosing(block);
        self.record(
            Step::new("GetLoopsWithName")
                .attr("block_name", name)
                .outputs(loops.clone()),
        );
        Ok(loops)
    }

    /// The function-body root block containing the given node.
    pub fn get_root_block(&mut self, node: NodeId) -> Result<NodeId, ScheduleError> {
        let root = self.module.tree_root_of(node);
        self.expect_block(root)?;
        self.record(
            Step::new("GetRootBlock")
                .input("expr", node)
                .outputs(vec![root]),
        );
        Ok(root)
    }

    // ---- loop restructuring ----------------------------------------------

    /// Split a loop by the given factors. Exactly one factor may be `-1`,
    /// meaning "inferred from the extent". Returns the new loops, outermost
    /// first.
    pub fn split(&mut self, loop_id: NodeId, factors: &[i64]) -> Result<Vec<NodeId>, ScheduleError> {
        let new_loops = self.split_impl(loop_id, factors)?;
        self.record(
            Step::new("Split")
                .input("loop", loop_id)
                .attr("factors", factors.to_vec())
                .outputs(new_loops.clone()),
        );
        Ok(new_loops)
    }

    /// Split the `loop_index`-th loop of the named block.
    pub fn split_by_name(
        &mut self,
        block_name: &str,
        loop_index: usize,
        factors: &[i64],
    ) -> Result<Vec<NodeId>, ScheduleError> {
        let loop_id = self.loop_of_block(block_name, loop_index)?;
        let new_loops = self.split_impl(loop_id, factors)?;
        self.record(
            Step::new("SplitWithName")
                .attr("block_name", block_name)
                .attr("loop_index", loop_index as i64)
                .attr("factors", factors.to_vec())
                .outputs(new_loops.clone()),
        );
        Ok(new_loops)
    }

    /// Fuse a consecutive loop nest into one loop. Returns the fused loop.
    pub fn fuse(&mut self, loops: &[NodeId]) -> Result<NodeId, ScheduleError> {
        let fused = self.fuse_impl(loops)?;
        self.record(
            Step::new("Fuse")
                .input_list("loops", loops)
                .outputs(vec![fused]),
        );
        Ok(fused)
    }

    /// Fuse the loops at `loops_index` of the named block.
    pub fn fuse_by_name(
        &mut self,
        block_name: &str,
        loops_index: &[i64],
    ) -> Result<NodeId, ScheduleError> {
        let loops = self.loops_by_indices(block_name, loops_index)?;
        let fused = self.fuse_impl(&loops)?;
        self.record(
            Step::new("FuseWithName")
                .attr("block_name", block_name)
                .attr("loops_index", loops_index.to_vec())
                .outputs(vec![fused]),
        );
        Ok(fused)
    }

    /// Fuse the loops at `loops_index` of the given block.
    pub fn fuse_with_block(
        &mut self,
        block: NodeId,
        loops_index: &[i64],
    ) -> Result<NodeId, ScheduleError> {
        self.expect_block(block)?;
        let all = self.module.loops_enclosing(block);
        let loops = Self::select_loops(&all, loops_index)?;
        let fused = self.fuse_impl(&loops)?;
        self.record(
            Step::new("FuseWithBlock")
                .input("block", block)
                .attr("loops_index", loops_index.to_vec())
                .outputs(vec![fused]),
        );
        Ok(fused)
    }

    /// Reorder loops of one nest into the given order. The given loops keep
    /// their nest positions sorted by depth; headers move.
    pub fn reorder(&mut self, loops: &[NodeId]) -> Result<(), ScheduleError> {
        self.reorder_impl(loops)?;
        self.record(Step::new("Reorder").input_list("loops", loops));
        Ok(())
    }

    /// Reorder the loops of the named block into the order given by
    /// `loops_index`.
    pub fn reorder_by_name(
        &mut self,
        block_name: &str,
        loops_index: &[i64],
    ) -> Result<(), ScheduleError> {
        let all = self.enclosing_loops_of(block_name)?;
        let loops = Self::select_loops(&all, loops_index)?;
        self.reorder_impl(&loops)?;
        self.record(
            Step::new("ReorderWithName")
                .attr("block_name", block_name)
                .attr("loops_index", loops_index.to_vec()),
        );
        Ok(())
    }

    // ---- loop kind changes -------------------------------------------------

    /// Mark a loop parallel.
    pub fn parallel(&mut self, loop_id: NodeId) -> Result<(), ScheduleError> {
        self.set_loop_kind(loop_id, ForKind::Parallel)?;
        self.record(Step::new("Parallel").input("loop", loop_id));
        Ok(())
    }

    /// Vectorize a loop with the given lane count.
    pub fn vectorize(&mut self, loop_id: NodeId, factor: i64) -> Result<(), ScheduleError> {
        self.set_loop_kind(loop_id, ForKind::Vectorized { factor })?;
        self.record(
            Step::new("Vectorize")
                .input("loop", loop_id)
                .attr("factor", factor),
        );
        Ok(())
    }

    /// Mark a loop fully unrolled.
    pub fn unroll(&mut self, loop_id: NodeId) -> Result<(), ScheduleError> {
        self.set_loop_kind(loop_id, ForKind::Unrolled)?;
        self.record(Step::new("Unroll").input("loop", loop_id));
        Ok(())
    }

    /// Bind a loop to a GPU thread/block axis.
    pub fn bind(&mut self, loop_id: NodeId, thread_axis: &str) -> Result<(), ScheduleError> {
        self.set_loop_kind(
            loop_id,
            ForKind::Bound {
                axis: thread_axis.to_string(),
            },
        )?;
        self.record(
            Step::new("Bind")
                .input("loop", loop_id)
                .attr("thread_axis", thread_axis),
        );
        Ok(())
    }

    // ---- block-level primitives --------------------------------------------

    /// Attach an annotation to a block.
    pub fn annotate(
        &mut self,
        block: NodeId,
        key: &str,
        value: AttrValue,
    ) -> Result<(), ScheduleError> {
        match self.module.kind_mut(block) {
            NodeKind::Block { annotations, .. } => {
                annotations.insert(key.to_string(), value.clone());
            }
            _ => return Err(ScheduleError::WrongNodeKind { expected: "block" }),
        }
        self.record(
            Step::new("Annotate")
                .input("block", block)
                .attr("key", key)
                .attr("value", value),
        );
        Ok(())
    }

    /// Stage the `read_buffer_index`-th tensor read by a block through a new
    /// buffer in the given memory class. Returns the new cache block.
    pub fn cache_read(
        &mut self,
        block: NodeId,
        read_buffer_index: usize,
        memory_type: &str,
    ) -> Result<NodeId, ScheduleError> {
        let cache_block = self.cache_read_impl(block, read_buffer_index, memory_type)?;
        self.record(
            Step::new("CacheRead")
                .input("block", block)
                .attr("read_buffer_index", read_buffer_index as i64)
                .attr("memory_type", memory_type)
                .outputs(vec![cache_block]),
        );
        Ok(cache_block)
    }

    /// Stage the `write_buffer_index`-th tensor written by a block through a
    /// new buffer in the given memory class, with a copy-back stage. Returns
    /// the copy-back block.
    pub fn cache_write(
        &mut self,
        block: NodeId,
        write_buffer_index: usize,
        memory_type: &str,
    ) -> Result<NodeId, ScheduleError> {
        let cache_block = self.cache_write_impl(block, write_buffer_index, memory_type)?;
        self.record(
            Step::new("CacheWrite")
                .input("block", block)
                .attr("write_buffer_index", write_buffer_index as i64)
                .attr("memory_type", memory_type)
                .outputs(vec![cache_block]),
        );
        Ok(cache_block)
    }

    /// Retarget the memory class of the tensor a block writes.
    pub fn set_buffer(
        &mut self,
        block: NodeId,
        memory_type: &str,
        fixed: bool,
    ) -> Result<(), ScheduleError> {
        let tensor = self.written_tensors(block)?.first().cloned().ok_or(
            ScheduleError::BufferIndexOutOfRange { index: 0, len: 0 },
        )?;
        let meta = self
            .module
            .tensors
            .get_mut(&tensor)
            .ok_or_else(|| ScheduleError::NotApplicable(format!("unknown tensor `{}`", tensor)))?;
        if meta.fixed && meta.memory != memory_type {
            return Err(ScheduleError::NotApplicable(format!(
                "memory class of `{}` is fixed to `{}`",
                tensor, meta.memory
            )));
        }
        meta.memory = memory_type.to_string();
        meta.fixed = fixed;
        self.record(
            Step::new("SetBuffer")
                .input("block", block)
                .attr("memory_type", memory_type)
                .attr("fixed", fixed),
        );
        Ok(())
    }

    /// Insert a synchronization point before (`after == false`) or after the
    /// given node.
    pub fn sync_threads(&mut self, node: NodeId, after: bool) -> Result<(), ScheduleError> {
        let sync = self.module.alloc(NodeKind::SyncThreads);
        self.module.insert_beside(node, sync, after);
        self.record(
            Step::new("SyncThreads")
                .input("ir_node", node)
                .attr("after_node", after),
        );
        Ok(())
    }

    /// Move a producer block to compute under the given consumer loop. The
    /// producer's loops above that level must match the consumer's extents.
    pub fn compute_at(&mut self, block: NodeId, loop_id: NodeId) -> Result<(), ScheduleError> {
        self.compute_at_impl(block, loop_id)?;
        self.record(
            Step::new("ComputeAt")
                .input("block", block)
                .input("loop", loop_id),
        );
        Ok(())
    }

    /// Inline a producer block into its consumers and remove it.
    pub fn compute_inline(&mut self, block: NodeId) -> Result<(), ScheduleError> {
        self.compute_inline_impl(block)?;
        self.record(Step::new("ComputeInline").input("schedule_block", block));
        Ok(())
    }

    /// Merge all function bodies into the first root.
    pub fn merge_exprs(&mut self) -> Result<(), ScheduleError> {
        self.merge_exprs_impl()?;
        self.record(Step::new("MergeExprs"));
        Ok(())
    }

    /// Factor the reduction under `rf_loop` through an intermediate tensor
    /// whose new dimension sits at `rf_axis`. Returns the new rf block.
    pub fn rfactor(&mut self, rf_loop: NodeId, rf_axis: usize) -> Result<NodeId, ScheduleError> {
        let rf_block = self.rfactor_impl(rf_loop, rf_axis)?;
        self.record(
            Step::new("Rfactor")
                .input("rf_loop", rf_loop)
                .attr("rf_axis", rf_axis as i64)
                .outputs(vec![rf_block]),
        );
        Ok(rf_block)
    }

    // ---- untraced helpers ----------------------------------------------------

    fn enclosing_loops_of(&self, block_name: &str) -> Result<Vec<NodeId>, ScheduleError> {
        let block = self
            .module
            .find_block(block_name)
            .ok_or_else(|| ScheduleError::BlockNotFound(block_name.to_string()))?;
        Ok(self.module.loops_enclosing(block))
    }

    fn loop_of_block(&self, block_name: &str, index: usize) -> Result<NodeId, ScheduleError> {
        let loops = self.enclosing_loops_of(block_name)?;
        loops
            .get(index)
            .copied()
            .ok_or(ScheduleError::LoopIndexOutOfRange {
                index,
                len: loops.len(),
            })
    }

    fn loops_by_indices(
        &self,
        block_name: &str,
        indices: &[i64],
    ) -> Result<Vec<NodeId>, ScheduleError> {
        let all = self.enclosing_loops_of(block_name)?;
        Self::select_loops(&all, indices)
    }

    fn select_loops(all: &[NodeId], indices: &[i64]) -> Result<Vec<NodeId>, ScheduleError> {
        indices
            .iter()
            .map(|&i| {
                all.get(i as usize)
                    .copied()
                    .ok_or(ScheduleError::LoopIndexOutOfRange {
                        index: i as usize,
                        len: all.len(),
                    })
            })
            .collect()
    }

    fn set_loop_kind(&mut self, loop_id: NodeId, new_kind: ForKind) -> Result<(), ScheduleError> {
        match self.module.kind_mut(loop_id) {
            NodeKind::For { kind, .. } => {
                *kind = new_kind;
                Ok(())
            }
            _ => Err(ScheduleError::WrongNodeKind { expected: "loop" }),
        }
    }

    fn split_impl(&mut self, loop_id: NodeId, factors: &[i64]) -> Result<Vec<NodeId>, ScheduleError> {
        let (var, extent, _, body) = self.expect_for(loop_id)?;
        let extents = Self::resolve_factors(factors, extent)?;

        let names: Vec<String> = extents
            .iter()
            .map(|_| self.module.name_ctx.fresh(&var))
            .collect();

        // var = ((v0 * e1 + v1) * e2 + v2) ...
        let mut acc = ScalarExpr::var(&names[0]);
        for (name, ext) in names.iter().zip(extents.iter()).skip(1) {
            acc = acc.mul(ScalarExpr::int(*ext)).add(ScalarExpr::var(name));
        }
        let mut map = BTreeMap::new();
        map.insert(var, acc);
        self.module.substitute_bindings(body, &map);

        let mut cur = body;
        let mut new_loops = Vec::with_capacity(extents.len());
        for (name, ext) in names.iter().zip(extents.iter()).rev() {
            cur = self.module.mk_for(name.clone(), *ext, ForKind::Serial, cur);
            new_loops.push(cur);
        }
        new_loops.reverse();
        self.module.replace(loop_id, new_loops[0]);
        Ok(new_loops)
    }

    fn resolve_factors(factors: &[i64], extent: i64) -> Result<Vec<i64>, ScheduleError> {
        let invalid = || ScheduleError::InvalidSplitFactors {
            factors: factors.to_vec(),
            extent,
        };
        if factors.is_empty() || factors.iter().filter(|&&f| f == -1).count() > 1 {
            return Err(invalid());
        }
        if factors.iter().any(|&f| f == 0 || f < -1) {
            return Err(invalid());
        }
        let known: i64 = factors.iter().filter(|&&f| f != -1).product();
        if known <= 0 || extent % known != 0 {
            return Err(invalid());
        }
        let inferred = extent / known;
        let resolved: Vec<i64> = factors
            .iter()
            .map(|&f| if f == -1 { inferred } else { f })
            .collect();
        if resolved.iter().product::<i64>() != extent {
            return Err(invalid());
        }
        Ok(resolved)
    }

    fn fuse_impl(&mut self, loops: &[NodeId]) -> Result<NodeId, ScheduleError> {
        if loops.is_empty() {
            return Err(ScheduleError::NonConsecutiveLoops);
        }
        if loops.len() == 1 {
            self.expect_for(loops[0])?;
            return Ok(loops[0]);
        }
        let mut vars = Vec::with_capacity(loops.len());
        let mut extents = Vec::with_capacity(loops.len());
        let mut innermost_body = loops[0];
        for (i, &l) in loops.iter().enumerate() {
            let (var, extent, _, body) = self.expect_for(l)?;
            if let Some(&next) = loops.get(i + 1) {
                if body != next {
                    return Err(ScheduleError::NonConsecutiveLoops);
                }
            }
            vars.push(var);
            extents.push(extent);
            innermost_body = body;
        }
        let fused_extent: i64 = extents.iter().product();
        let fused_var = self
            .module
            .name_ctx
            .fresh(&format!("{}_fused", vars.join("_")));

        // v_k = (fused / prod(extents[k+1..])) % extents[k]; the outermost
        // needs no modulo.
        let mut map = BTreeMap::new();
        for (k, var) in vars.iter().enumerate() {
            let trailing: i64 = extents[k + 1..].iter().product();
            let mut e = ScalarExpr::var(&fused_var);
            if trailing > 1 {
                e = e.div(ScalarExpr::int(trailing));
            }
            if k > 0 {
                e = e.modulo(ScalarExpr::int(extents[k]));
            }
            map.insert(var.clone(), e);
        }

        self.module.substitute_bindings(innermost_body, &map);
        let fused = self
            .module
            .mk_for(fused_var, fused_extent, ForKind::Serial, innermost_body);
        self.module.replace(loops[0], fused);
        Ok(fused)
    }

    fn reorder_impl(&mut self, loops: &[NodeId]) -> Result<(), ScheduleError> {
        if loops.len() < 2 {
            return Ok(());
        }
        let headers: Vec<(String, i64, ForKind)> = loops
            .iter()
            .map(|&l| {
                let (var, extent, kind, _) = self.expect_for(l)?;
                Ok((var, extent, kind))
            })
            .collect::<Result<_, ScheduleError>>()?;
        // Find the chain containing all given loops: walk up from any loop to
        // the root and keep the loop chain.
        let mut chain = self.module.loops_enclosing(loops[0]);
        chain.push(loops[0]);
        // Extend downward through only-child loop bodies.
        let mut last = loops[0];
        loop {
            let (_, _, _, body) = self.expect_for(last)?;
            if matches!(self.module.kind(body), NodeKind::For { .. }) {
                chain.push(body);
                last = body;
            } else {
                break;
            }
        }
        let mut positions = Vec::with_capacity(loops.len());
        for &l in loops {
            let pos = chain
                .iter()
                .position(|&c| c == l)
                .ok_or(ScheduleError::NonConsecutiveLoops)?;
            positions.push(pos);
        }
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != loops.len() {
            return Err(ScheduleError::NonConsecutiveLoops);
        }

        // Move headers: the j-th selected position (by depth) receives the
        // header of the j-th requested loop.
        for (slot, header) in sorted.iter().zip(headers) {
            if let NodeKind::For {
                var, extent, kind, ..
            } = self.module.kind_mut(chain[*slot])
            {
                *var = header.0;
                *extent = header.1;
                *kind = header.2;
            }
        }
        Ok(())
    }

    fn read_tensors(&self, block: NodeId) -> Result<Vec<String>, ScheduleError> {
        self.expect_block(block)?;
        let mut reads = Vec::new();
        for store in self.module.stores_in(block) {
            if let NodeKind::Store { indices, value, .. } = self.module.kind(store) {
                for idx in indices {
                    idx.collect_read_tensors(&mut reads);
                }
                value.collect_read_tensors(&mut reads);
            }
        }
        Ok(reads)
    }

    fn written_tensors(&self, block: NodeId) -> Result<Vec<String>, ScheduleError> {
        self.expect_block(block)?;
        let mut writes: Vec<String> = Vec::new();
        for store in self.module.stores_in(block) {
            if let NodeKind::Store { tensor, .. } = self.module.kind(store) {
                if !writes.iter().any(|t| t == tensor) {
                    writes.push(tensor.clone());
                }
            }
        }
        Ok(writes)
    }

    /// Build `for v0 .. { for v1 .. { block name { dst[v...] = src[v...] } } }`
    /// and return (nest root, block id).
    fn build_copy_stage(
        &mut self,
        name: &str,
        shape: &[i64],
        dst: &str,
        src: &str,
    ) -> (NodeId, NodeId) {
        let loop_vars: Vec<String> = (0..shape.len())
            .map(|d| self.module.name_ctx.fresh(&format!("cache_ax{}", d)))
            .collect();
        let iter_vars: Vec<String> = (0..shape.len())
            .map(|_| self.module.name_ctx.fresh("v"))
            .collect();
        let indices: Vec<ScalarExpr> = iter_vars.iter().map(ScalarExpr::var).collect();
        let store = self.module.alloc(NodeKind::Store {
            tensor: dst.to_string(),
            indices: indices.clone(),
            value: ScalarExpr::load(src, indices),
        });
        let block = self.module.mk_block(
            name.to_string(),
            iter_vars.iter().map(IterVar::spatial).collect(),
            loop_vars.iter().map(ScalarExpr::var).collect(),
            store,
        );
        let mut cur = block;
        for (var, ext) in loop_vars.iter().zip(shape.iter()).rev() {
            cur = self.module.mk_for(var.clone(), *ext, ForKind::Serial, cur);
        }
        (cur, block)
    }

    fn cache_anchor(&self, block: NodeId) -> NodeId {
        // Insert cache stages beside the target block's outermost loop, or
        // beside the block itself when it has none.
        self.module
            .loops_enclosing(block)
            .first()
            .copied()
            .unwrap_or(block)
    }

    fn cache_read_impl(
        &mut self,
        block: NodeId,
        read_buffer_index: usize,
        memory_type: &str,
    ) -> Result<NodeId, ScheduleError> {
        let reads = self.read_tensors(block)?;
        let tensor = reads
            .get(read_buffer_index)
            .cloned()
            .ok_or(ScheduleError::BufferIndexOutOfRange {
                index: read_buffer_index,
                len: reads.len(),
            })?;
        let meta = self
            .module
            .tensors
            .get(&tensor)
            .cloned()
            .ok_or_else(|| ScheduleError::NotApplicable(format!("unknown tensor `{}`", tensor)))?;

        let cache_name = self
            .module
            .name_ctx
            .fresh(&format!("{}_{}_temp_buffer", tensor, memory_type));
        self.module.tensors.insert(
            cache_name.clone(),
            TensorMeta {
                shape: meta.shape.clone(),
                dtype: meta.dtype,
                memory: memory_type.to_string(),
                fixed: false,
            },
        );

        let (stage_root, cache_block) =
            self.build_copy_stage(&cache_name, &meta.shape, &cache_name, &tensor);
        let anchor = self.cache_anchor(block);
        self.module.insert_beside(anchor, stage_root, false);
        self.module.rename_tensor(block, &tensor, &cache_name, false);
        Ok(cache_block)
    }

    fn cache_write_impl(
        &mut self,
        block: NodeId,
        write_buffer_index: usize,
        memory_type: &str,
    ) -> Result<NodeId, ScheduleError> {
        let writes = self.written_tensors(block)?;
        let tensor = writes
            .get(write_buffer_index)
            .cloned()
            .ok_or(ScheduleError::BufferIndexOutOfRange {
                index: write_buffer_index,
                len: writes.len(),
            })?;
        let meta = self
            .module
            .tensors
            .get(&tensor)
            .cloned()
            .ok_or_else(|| ScheduleError::NotApplicable(format!("unknown tensor `{}`", tensor)))?;

        let cache_name = self
            .module
            .name_ctx
            .fresh(&format!("{}_{}_temp_buffer", tensor, memory_type));
        self.module.tensors.insert(
            cache_name.clone(),
            TensorMeta {
                shape: meta.shape.clone(),
                dtype: meta.dtype,
                memory: memory_type.to_string(),
                fixed: false,
            },
        );

        // The producer now writes (and re-reads, for accumulations) the cache.
        self.module.rename_tensor(block, &tensor, &cache_name, true);
        let (stage_root, cache_block) =
            self.build_copy_stage(&cache_name, &meta.shape, &tensor, &cache_name);
        let anchor = self.cache_anchor(block);
        self.module.insert_beside(anchor, stage_root, true);
        Ok(cache_block)
    }

    fn compute_at_impl(&mut self, block: NodeId, loop_id: NodeId) -> Result<(), ScheduleError> {
        self.expect_block(block)?;
        self.expect_for(loop_id)?;
        let mut consumer_chain = self.module.loops_enclosing(loop_id);
        consumer_chain.push(loop_id);
        let producer_chain = self.module.loops_enclosing(block);
        let depth = consumer_chain.len();
        if producer_chain.len() < depth {
            return Err(ScheduleError::NotApplicable(
                "producer has fewer loops than the target depth".to_string(),
            ));
        }
        let mut map = BTreeMap::new();
        for k in 0..depth {
            let (p_var, p_ext, _, _) = self.expect_for(producer_chain[k])?;
            let (c_var, c_ext, _, _) = self.expect_for(consumer_chain[k])?;
            if p_ext != c_ext {
                return Err(ScheduleError::NotApplicable(format!(
                    "loop extents differ at depth {} ({} vs {})",
                    k, p_ext, c_ext
                )));
            }
            map.insert(p_var, ScalarExpr::var(c_var));
        }

        let moved = producer_chain.get(depth).copied().unwrap_or(block);
        self.module.detach(producer_chain[0]);
        self.module.set_parent(moved, None);
        self.module.substitute_bindings(moved, &map);

        let (_, _, _, target_body) = self.expect_for(loop_id)?;
        if matches!(self.module.kind(target_body), NodeKind::Seq { .. }) {
            let pos_parent = target_body;
            if let NodeKind::Seq { children } = self.module.kind_mut(pos_parent) {
                children.insert(0, moved);
            }
            self.module.set_parent(moved, Some(pos_parent));
        } else {
            self.module.insert_beside(target_body, moved, false);
        }
        Ok(())
    }

    fn compute_inline_impl(&mut self, block: NodeId) -> Result<(), ScheduleError> {
        self.expect_block(block)?;
        let stores = self.module.stores_in(block);
        if stores.len() != 1 {
            return Err(ScheduleError::NotApplicable(
                "only single-store blocks can be inlined".to_string(),
            ));
        }
        let (tensor, indices, value) = match self.module.kind(stores[0]) {
            NodeKind::Store {
                tensor,
                indices,
                value,
            } => (tensor.clone(), indices.clone(), value.clone()),
            _ => unreachable!(),
        };
        let iter_names: Vec<String> = indices
            .iter()
            .map(|idx| match idx {
                ScalarExpr::Var(name) => Ok(name.clone()),
                _ => Err(ScheduleError::NotApplicable(
                    "producer store indices are not plain iteration variables".to_string(),
                )),
            })
            .collect::<Result<_, _>>()?;

        // Rewrite every consumer load of the inlined tensor.
        for consumer in self.module.collect_blocks() {
            if consumer == block {
                continue;
            }
            for store in self.module.stores_in(consumer) {
                if let NodeKind::Store {
                    indices: s_indices,
                    value: s_value,
                    ..
                } = self.module.kind_mut(store)
                {
                    for idx in s_indices.iter_mut() {
                        *idx = inline_loads(idx, &tensor, &iter_names, &value);
                    }
                    *s_value = inline_loads(s_value, &tensor, &iter_names, &value);
                }
            }
        }

        let nest_top = self
            .module
            .loops_enclosing(block)
            .first()
            .copied()
            .unwrap_or(block);
        self.module.detach(nest_top);
        self.module.tensors.remove(&tensor);
        Ok(())
    }

    fn merge_exprs_impl(&mut self) -> Result<(), ScheduleError> {
        let roots = self.module.roots().to_vec();
        if roots.len() <= 1 {
            return Ok(());
        }
        self.expect_block(roots[0])?;
        let first_body = match self.module.kind(roots[0]) {
            NodeKind::Block { body, .. } => *body,
            _ => unreachable!(),
        };
        // Ensure the first root body is a sequence we can extend.
        let seq = if matches!(self.module.kind(first_body), NodeKind::Seq { .. }) {
            first_body
        } else {
            let seq = self.module.mk_seq(vec![]);
            self.module.replace(first_body, seq);
            if let NodeKind::Seq { children } = self.module.kind_mut(seq) {
                children.push(first_body);
            }
            self.module.set_parent(first_body, Some(seq));
            seq
        };
        for &root in &roots[1..] {
            self.expect_block(root)?;
            let body = match self.module.kind(root) {
                NodeKind::Block { body, .. } => *body,
                _ => unreachable!(),
            };
            let to_move = match self.module.kind(body) {
                NodeKind::Seq { children } => children.clone(),
                _ => vec![body],
            };
            for child in to_move {
                if let NodeKind::Seq { children } = self.module.kind_mut(seq) {
                    children.push(child);
                }
                self.module.set_parent(child, Some(seq));
            }
        }
        self.module.truncate_roots(1);
        Ok(())
    }

    fn rfactor_impl(&mut self, rf_loop: NodeId, rf_axis: usize) -> Result<NodeId, ScheduleError> {
        let (rf_var, rf_extent, _, _) = self.expect_for(rf_loop)?;
        // Locate the reduction block under the rf loop.
        let block = self
            .module
            .preorder(rf_loop)
            .into_iter()
            .find(|&id| matches!(self.module.kind(id), NodeKind::Block { .. }))
            .ok_or_else(|| {
                ScheduleError::NotApplicable("rf loop encloses no block".to_string())
            })?;
        let (block_name, iter_vars, bindings) = match self.module.kind(block) {
            NodeKind::Block {
                name,
                iter_vars,
                bindings,
                ..
            } => (name.clone(), iter_vars.clone(), bindings.clone()),
            _ => unreachable!(),
        };
        let reduce_positions: Vec<usize> = iter_vars
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_reduce)
            .map(|(i, _)| i)
            .collect();
        let &[reduce_pos] = &reduce_positions[..] else {
            return Err(ScheduleError::NotApplicable(
                "rfactor requires exactly one reduction axis".to_string(),
            ));
        };
        if bindings.get(reduce_pos) != Some(&ScalarExpr::var(&rf_var)) {
            return Err(ScheduleError::NotApplicable(
                "rf loop does not bind the reduction axis".to_string(),
            ));
        }

        let stores = self.module.stores_in(block);
        if stores.len() != 1 {
            return Err(ScheduleError::NotApplicable(
                "rfactor requires a single-store reduction block".to_string(),
            ));
        }
        let (tensor, indices, value) = match self.module.kind(stores[0]) {
            NodeKind::Store {
                tensor,
                indices,
                value,
            } => (tensor.clone(), indices.clone(), value.clone()),
            _ => unreachable!(),
        };
        // value must be `tensor[indices] + contribution`.
        let contribution = match &value {
            ScalarExpr::Add(lhs, rhs) => match lhs.as_ref() {
                ScalarExpr::Load {
                    tensor: t,
                    indices: i,
                } if *t == tensor && *i == indices => rhs.as_ref().clone(),
                _ => {
                    return Err(ScheduleError::NotApplicable(
                        "store is not a recognized reduction update".to_string(),
                    ))
                }
            },
            _ => {
                return Err(ScheduleError::NotApplicable(
                    "store is not a recognized reduction update".to_string(),
                ))
            }
        };

        let meta = self
            .module
            .tensors
            .get(&tensor)
            .cloned()
            .ok_or_else(|| ScheduleError::NotApplicable(format!("unknown tensor `{}`", tensor)))?;
        if rf_axis > meta.shape.len() {
            return Err(ScheduleError::NotApplicable(format!(
                "rf axis {} out of range for rank {}",
                rf_axis,
                meta.shape.len()
            )));
        }
        let rf_name = self.module.name_ctx.fresh(&format!("{}_rf", tensor));
        let mut rf_shape = meta.shape.clone();
        rf_shape.insert(rf_axis, rf_extent);
        self.module
            .tensors
            .insert(rf_name.clone(), TensorMeta::global(rf_shape));

        let chain = self.module.loops_enclosing(block);
        if !chain.contains(&rf_loop) {
            return Err(ScheduleError::NotApplicable(
                "rf loop does not enclose the reduction block".to_string(),
            ));
        }
        let headers: Vec<(String, i64)> = chain
            .iter()
            .map(|&l| {
                let (v, e, _, _) = self.expect_for(l)?;
                Ok((v, e))
            })
            .collect::<Result<_, ScheduleError>>()?;

        // rf stage: every axis spatial, rf dimension inserted at rf_axis.
        let mut rf_indices = indices.clone();
        rf_indices.insert(rf_axis, ScalarExpr::var(&iter_vars[reduce_pos].name));
        let rf_store = self.module.alloc(NodeKind::Store {
            tensor: rf_name.clone(),
            indices: rf_indices.clone(),
            value: contribution,
        });
        let rf_block = self.module.mk_block(
            rf_name.clone(),
            iter_vars
                .iter()
                .map(|v| IterVar::spatial(v.name.clone()))
                .collect(),
            bindings.clone(),
            rf_store,
        );
        let mut rf_nest = rf_block;
        for (v, e) in headers.iter().rev() {
            rf_nest = self.module.mk_for(v.clone(), *e, ForKind::Serial, rf_nest);
        }

        // Final stage: accumulate rf partials into the original tensor.
        let final_store = self.module.alloc(NodeKind::Store {
            tensor: tensor.clone(),
            indices: indices.clone(),
            value: ScalarExpr::load(&tensor, indices.clone())
                .add(ScalarExpr::load(&rf_name, rf_indices)),
        });
        let final_block = self.module.mk_block(
            block_name,
            iter_vars.clone(),
            bindings,
            final_store,
        );
        let mut final_nest = final_block;
        for (v, e) in headers.iter().rev() {
            final_nest = self.module.mk_for(v.clone(), *e, ForKind::Serial, final_nest);
        }

        let old_top = chain[0];
        let seq = self.module.mk_seq(vec![]);
        self.module.replace(old_top, seq);
        if let NodeKind::Seq { children } = self.module.kind_mut(seq) {
            children.push(rf_nest);
            children.push(final_nest);
        }
        self.module.set_parent(rf_nest, Some(seq));
        self.module.set_parent(final_nest, Some(seq));
        Ok(rf_block)
    }
}

/// Replace loads of `tensor` by `repl` with the producer's iteration variables
/// substituted by the load's index expressions.
fn inline_loads(
    e: &ScalarExpr,
    tensor: &str,
    iter_names: &[String],
    repl: &ScalarExpr,
) -> ScalarExpr {
    match e {
        ScalarExpr::Load {
            tensor: t,
            indices,
        } => {
            let indices: Vec<ScalarExpr> = indices
                .iter()
                .map(|i| inline_loads(i, tensor, iter_names, repl))
                .collect();
            if t == tensor {
                let mut map = BTreeMap::new();
                for (name, idx) in iter_names.iter().zip(indices.iter()) {
                    map.insert(name.clone(), idx.clone());
                }
                repl.substitute(&map)
            } else {
                ScalarExpr::Load {
                    tensor: t.clone(),
                    indices,
                }
            }
        }
        ScalarExpr::Add(a, b) => ScalarExpr::Add(
            Box::new(inline_loads(a, tensor, iter_names, repl)),
            Box::new(inline_loads(b, tensor, iter_names, repl)),
        ),
        ScalarExpr::Mul(a, b) => ScalarExpr::Mul(
            Box::new(inline_loads(a, tensor, iter_names, repl)),
            Box::new(inline_loads(b, tensor, iter_names, repl)),
        ),
        ScalarExpr::Div(a, b) => ScalarExpr::Div(
            Box::new(inline_loads(a, tensor, iter_names, repl)),
            Box::new(inline_loads(b, tensor, iter_names, repl)),
        ),
        ScalarExpr::Mod(a, b) => ScalarExpr::Mod(
            Box::new(inline_loads(a, tensor, iter_names, repl)),
            Box::new(inline_loads(b, tensor, iter_names, repl)),
        ),
        _ => e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{lower_workloads, Workload};

    fn copy_schedule(shape: Vec<i64>) -> IrSchedule {
        let lowered = lower_workloads(&[Workload::elementwise_copy(shape)]).expect("lowering");
        IrSchedule::new(lowered.module.clone())
    }

    #[test]
    fn test_split_extents() {
        let mut sch = copy_schedule(vec![32, 32]);
        let loops = sch.get_loops_by_name("B").unwrap();
        let new_loops = sch.split(loops[0], &[4, -1]).unwrap();
        assert_eq!(new_loops.len(), 2);
        let NodeKind::For { extent, .. } = sch.module().kind(new_loops[0]) else {
            panic!("expected loop")
        };
        assert_eq!(*extent, 4);
        let NodeKind::For { extent, .. } = sch.module().kind(new_loops[1]) else {
            panic!("expected loop")
        };
        assert_eq!(*extent, 8);
    }

    #[test]
    fn test_split_rejects_uneven_factors() {
        let mut sch = copy_schedule(vec![32, 32]);
        let loops = sch.get_loops_by_name("B").unwrap();
        let err = sch.split(loops[0], &[5, -1]).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidSplitFactors { .. }));
        let err = sch.split(loops[0], &[-1, -1]).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidSplitFactors { .. }));
    }

    #[test]
    fn test_fuse_then_loops_collapse() {
        let mut sch = copy_schedule(vec![32, 32]);
        let loops = sch.get_loops_by_name("B").unwrap();
        assert_eq!(loops.len(), 2);
        let fused = sch.fuse(&loops).unwrap();
        let NodeKind::For { extent, .. } = sch.module().kind(fused) else {
            panic!("expected loop")
        };
        assert_eq!(*extent, 1024);
        let loops = sch.get_loops_by_name("B").unwrap();
        assert_eq!(loops.len(), 1);
    }

    #[test]
    fn test_fuse_rejects_non_consecutive() {
        let mut sch = copy_schedule(vec![8, 8, 8]);
        let loops = sch.get_loops_by_name("B").unwrap();
        let err = sch.fuse(&[loops[0], loops[2]]).unwrap_err();
        assert_eq!(err, ScheduleError::NonConsecutiveLoops);
    }

    #[test]
    fn test_every_primitive_appends_one_step() {
        let mut sch = copy_schedule(vec![32, 32]);
        let loops = sch.get_loops_by_name("B").unwrap();
        assert_eq!(sch.trace().len(), 1);
        sch.parallel(loops[0]).unwrap();
        assert_eq!(sch.trace().len(), 2);
        assert_eq!(sch.trace().steps()[1].kind, "Parallel");
    }

    #[test]
    fn test_failed_primitive_appends_nothing() {
        let mut sch = copy_schedule(vec![32, 32]);
        let loops = sch.get_loops_by_name("B").unwrap();
        let before = sch.trace().len();
        assert!(sch.split(loops[0], &[7, -1]).is_err());
        assert_eq!(sch.trace().len(), before);
    }

    #[test]
    fn test_cache_read_creates_stage() {
        let mut sch = copy_schedule(vec![32, 64]);
        let block = sch.get_block("B").unwrap();
        let cache = sch.cache_read(block, 0, "local").unwrap();
        let NodeKind::Block { name, .. } = sch.module().kind(cache) else {
            panic!("expected block")
        };
        assert_eq!(name, "A_local_temp_buffer_0");
        assert_eq!(
            sch.module().tensors[name].memory,
            "local".to_string()
        );
        // The consumer now reads the staged buffer.
        let reads = sch.read_tensors(block).unwrap();
        assert_eq!(reads, vec!["A_local_temp_buffer_0".to_string()]);
    }

    #[test]
    fn test_reorder_swaps_headers() {
        let mut sch = copy_schedule(vec![4, 8]);
        let loops = sch.get_loops_by_name("B").unwrap();
        sch.reorder(&[loops[1], loops[0]]).unwrap();
        let loops = sch.get_loops_by_name("B").unwrap();
        let NodeKind::For { extent, .. } = sch.module().kind(loops[0]) else {
            panic!("expected loop")
        };
        assert_eq!(*extent, 8);
    }
}
