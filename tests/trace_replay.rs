//! End-to-end trace and replay tests: apply primitives to one schedule,
//! serialize the trace, replay it against a fresh copy of the same lowered
//! module, and require the printed IR to match exactly.

use tensortune::ir::printer::print_module;
use tensortune::ir::{IrSchedule, NodeKind};
use tensortune::lower::{lower_workloads, LoweredModule, Workload};
use tensortune::trace::{AttrValue, ScheduleDesc};
use tensortune::utils::errors::TraceError;

fn lowered(workloads: &[Workload]) -> LoweredModule {
    lower_workloads(workloads).expect("lowering succeeds")
}

fn fresh_schedule(lowered: &LoweredModule) -> IrSchedule {
    IrSchedule::new(lowered.module.clone())
}

/// Replay `sched`'s trace in-memory and through bytes; both must reproduce
/// the same module text, and the replayed schedule must re-record a trace of
/// the same length.
fn check_replay(lowered: &LoweredModule, sched: &IrSchedule) {
    let expected = print_module(sched.module());

    let mut direct = fresh_schedule(lowered);
    sched.trace().replay(&mut direct).expect("in-memory replay");
    assert_eq!(print_module(direct.module()), expected);
    assert_eq!(direct.trace().len(), sched.trace().len());

    let bytes = sched.trace().to_bytes().expect("serialize");
    let decoded = ScheduleDesc::from_bytes(&bytes).expect("deserialize");
    let mut from_disk = fresh_schedule(lowered);
    decoded.replay(&mut from_disk).expect("replay from bytes");
    assert_eq!(print_module(from_disk.module()), expected);
}

#[test]
fn fuse_split_round() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![32, 32])]);
    let mut sched = fresh_schedule(&lowered);

    let loops = sched.get_loops_by_name("B").unwrap();
    assert_eq!(loops.len(), 2);
    let fused = sched.fuse(&loops).unwrap();
    let splited = sched.split(fused, &[4, -1]).unwrap();
    assert_eq!(splited.len(), 2);

    let fused = sched.fuse_by_name("B", &[0, 1]).unwrap();
    let splited = sched.split(fused, &[256, -1]).unwrap();

    let NodeKind::For { extent, .. } = sched.module().kind(splited[0]) else {
        panic!("expected loop")
    };
    assert_eq!(*extent, 256);
    let NodeKind::For { extent, .. } = sched.module().kind(splited[1]) else {
        panic!("expected loop")
    };
    assert_eq!(*extent, 4);

    check_replay(&lowered, &sched);
}

#[test]
fn replay_returns_last_step_outputs() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![32, 32])]);
    let mut sched = fresh_schedule(&lowered);
    let loops = sched.get_loops_by_name("B").unwrap();
    let fused = sched.fuse(&loops).unwrap();
    sched.split(fused, &[4, -1]).unwrap();

    let mut replayed = fresh_schedule(&lowered);
    let outputs = sched.trace().replay(&mut replayed).unwrap();
    assert_eq!(outputs.len(), 2);
    // The returned handles are valid in the replayed schedule, not the
    // original one.
    let NodeKind::For { extent, .. } = replayed.module().kind(outputs[0]) else {
        panic!("expected loop")
    };
    assert_eq!(*extent, 4);
}

#[test]
fn loop_kind_primitives() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![8, 8, 8])]);
    let mut sched = fresh_schedule(&lowered);
    let loops = sched.get_loops_by_name("B").unwrap();
    sched.parallel(loops[0]).unwrap();
    sched.vectorize(loops[2], 4).unwrap();
    sched.unroll(loops[1]).unwrap();
    check_replay(&lowered, &sched);
}

#[test]
fn bind_and_sync_threads() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![64, 32])]);
    let mut sched = fresh_schedule(&lowered);
    let loops = sched.get_loops_by_name("B").unwrap();
    sched.bind(loops[0], "blockIdx.x").unwrap();
    sched.bind(loops[1], "threadIdx.x").unwrap();
    let block = sched.get_block("B").unwrap();
    sched.sync_threads(block, false).unwrap();
    assert!(print_module(sched.module()).contains("sync_threads()"));
    check_replay(&lowered, &sched);
}

#[test]
fn reorder_variants() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![4, 8, 16])]);
    let mut sched = fresh_schedule(&lowered);
    let loops = sched.get_loops_by_name("B").unwrap();
    sched.reorder(&[loops[2], loops[0]]).unwrap();
    sched.reorder_by_name("B", &[1, 0]).unwrap();
    check_replay(&lowered, &sched);
}

#[test]
fn annotate_block() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![16])]);
    let mut sched = fresh_schedule(&lowered);
    let block = sched.get_block("B").unwrap();
    sched
        .annotate(block, "pipeline_stage", AttrValue::Int(2))
        .unwrap();
    sched
        .annotate(block, "strategy", AttrValue::Str("greedy".to_string()))
        .unwrap();
    check_replay(&lowered, &sched);
}

#[test]
fn cache_read_stages_the_input() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![32, 64])]);
    let mut sched = fresh_schedule(&lowered);
    let block = sched.get_block("B").unwrap();
    let cache = sched.cache_read(block, 0, "local").unwrap();

    let NodeKind::Block { name, .. } = sched.module().kind(cache) else {
        panic!("expected a block")
    };
    assert_eq!(name, "A_local_temp_buffer_0");
    let text = print_module(sched.module());
    // The staging copy runs before the consumer, which now reads the cache.
    assert!(text.contains("A_local_temp_buffer_0[v_0, v_1] = A[v_0, v_1]"));
    assert!(text.contains("B[i0, i1] = A_local_temp_buffer_0[i0, i1]"));

    check_replay(&lowered, &sched);
}

#[test]
fn cache_write_adds_copy_back() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![16, 16])]);
    let mut sched = fresh_schedule(&lowered);
    let block = sched.get_block("B").unwrap();
    sched.cache_write(block, 0, "shared").unwrap();

    let text = print_module(sched.module());
    assert!(text.contains("B_shared_temp_buffer_0[i0, i1] = A[i0, i1]"));
    assert!(text.contains("B[v_0, v_1] = B_shared_temp_buffer_0[v_0, v_1]"));
    assert_eq!(
        sched.module().tensors["B_shared_temp_buffer_0"].memory,
        "shared"
    );
    check_replay(&lowered, &sched);
}

#[test]
fn set_buffer_pins_memory_class() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![8])]);
    let mut sched = fresh_schedule(&lowered);
    let block = sched.get_block("B").unwrap();
    sched.set_buffer(block, "shared", true).unwrap();
    assert_eq!(sched.module().tensors["B"].memory, "shared");
    assert!(sched.module().tensors["B"].fixed);
    // Pinned buffers refuse retargeting.
    assert!(sched.set_buffer(block, "local", false).is_err());
    check_replay(&lowered, &sched);
}

#[test]
fn compute_at_nests_producer_under_consumer() {
    let lowered = lowered(&[Workload::staged_copy(vec![32, 32], 2)]);
    let mut sched = fresh_schedule(&lowered);
    let producer = sched.get_block("B").unwrap();
    let consumer_loops = sched.get_loops_by_name("C").unwrap();
    sched.compute_at(producer, consumer_loops[0]).unwrap();

    // B's inner nest now sits inside C's outer loop.
    let b_loops = sched.get_loops_by_name("B").unwrap();
    let c_loops = sched.get_loops_by_name("C").unwrap();
    assert_eq!(b_loops[0], c_loops[0]);
    check_replay(&lowered, &sched);
}

#[test]
fn compute_inline_removes_the_producer() {
    let lowered = lowered(&[Workload::staged_copy(vec![16, 16], 2)]);
    let mut sched = fresh_schedule(&lowered);
    let producer = sched.get_block("B").unwrap();
    sched.compute_inline(producer).unwrap();

    let text = print_module(sched.module());
    assert!(text.contains("C[i0, i1] = A[i0, i1]"));
    assert!(!text.contains("block B("));
    assert!(!sched.module().tensors.contains_key("B"));
    check_replay(&lowered, &sched);
}

#[test]
fn merge_exprs_collapses_roots() {
    let lowered = lowered(&[
        Workload::elementwise_copy(vec![8]),
        Workload::elementwise_copy(vec![4]),
    ]);
    let mut sched = fresh_schedule(&lowered);
    assert_eq!(sched.module().roots().len(), 2);
    sched.merge_exprs().unwrap();
    assert_eq!(sched.module().roots().len(), 1);
    // Both nests survive under the first root.
    assert!(sched.module().find_block("B").is_some());
    assert!(sched.module().find_block("B_1").is_some());
    check_replay(&lowered, &sched);
}

#[test]
fn rfactor_splits_the_reduction() {
    let lowered = lowered(&[Workload::reduce_sum(8, 4)]);
    let mut sched = fresh_schedule(&lowered);
    let loops = sched.get_loops_by_name("C").unwrap();
    let rf_block = sched.rfactor(loops[1], 0).unwrap();

    let NodeKind::Block { name, .. } = sched.module().kind(rf_block) else {
        panic!("expected a block")
    };
    assert_eq!(name, "C_rf_0");
    assert_eq!(sched.module().tensors["C_rf_0"].shape, vec![4, 8]);
    let text = print_module(sched.module());
    assert!(text.contains("C_rf_0[i1, i0] = A[i0, i1]"));
    assert!(text.contains("C[i0] = (C[i0] + C_rf_0[i1, i0])"));
    check_replay(&lowered, &sched);
}

#[test]
fn get_root_block_and_get_all_blocks() {
    let lowered = lowered(&[Workload::reduce_sum(8, 4)]);
    let mut sched = fresh_schedule(&lowered);
    let blocks = sched.get_all_blocks();
    assert_eq!(blocks.len(), 2);
    let root = sched.get_root_block(blocks[0]).unwrap();
    assert_eq!(root, sched.module().roots()[0]);
    check_replay(&lowered, &sched);
}

#[test]
fn fuse_with_block_handle() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![8, 4])]);
    let mut sched = fresh_schedule(&lowered);
    let block = sched.get_block("B").unwrap();
    let fused = sched.fuse_with_block(block, &[0, 1]).unwrap();
    let NodeKind::For { extent, .. } = sched.module().kind(fused) else {
        panic!("expected loop")
    };
    assert_eq!(*extent, 32);
    check_replay(&lowered, &sched);
}

#[test]
fn split_by_name_round_trips() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![32])]);
    let mut sched = fresh_schedule(&lowered);
    sched.split_by_name("B", 0, &[8, -1]).unwrap();
    check_replay(&lowered, &sched);
}

#[test]
fn replay_against_wrong_module_reports_operation_error() {
    let copy = lowered(&[Workload::elementwise_copy(vec![16])]);
    let mut sched = fresh_schedule(&copy);
    sched.get_block("B").unwrap();

    let reduce = lowered(&[Workload::reduce_sum(4, 4)]);
    let mut target = fresh_schedule(&reduce);
    let err = sched.trace().replay(&mut target).unwrap_err();
    assert!(matches!(err, TraceError::Operation(_)));
}

#[test]
fn failed_replay_leaves_schedule_partially_mutated() {
    let lowered = lowered(&[Workload::elementwise_copy(vec![32, 32])]);
    let mut sched = fresh_schedule(&lowered);
    let loops = sched.get_loops_by_name("B").unwrap();
    sched.fuse(&loops).unwrap();

    // Hand-build a trace whose second half cannot apply: fuse first, then
    // look up a block that does not exist.
    let mut trace = sched.trace().clone();
    let mut bad = fresh_schedule(&lowered);
    trace.replay(&mut bad).unwrap();
    let mut extended = trace.clone();
    extended.append(tensortune::trace::Step::new("GetBlock").attr("block_name", "Z"));
    let mut target = fresh_schedule(&lowered);
    let err = extended.replay(&mut target).unwrap_err();
    assert!(matches!(err, TraceError::Operation(_)));
    // The successful prefix was applied; the module is mid-transformation.
    assert_eq!(print_module(target.module()), print_module(bad.module()));
}
