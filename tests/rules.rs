//! Rule-level integration tests: rules mutate schedules only through traced
//! primitives, so everything a rule decides replays without the rule.

use tensortune::ir::printer::print_module;
use tensortune::ir::{IrSchedule, NodeKind};
use tensortune::lower::{lower_workloads, LoweredModule, Workload};
use tensortune::rules::auto_unroll::{AUTO_UNROLL_KEY, AUTO_UNROLL_OPTIONS};
use tensortune::rules::{AutoUnroll, RuleApplyType, ScheduleRule};
use tensortune::trace::{AttrValue, ScheduleDesc};

fn lowered(workloads: &[Workload]) -> LoweredModule {
    lower_workloads(workloads).expect("lowering succeeds")
}

fn fresh_schedule(lowered: &LoweredModule) -> IrSchedule {
    IrSchedule::new(lowered.module.clone())
}

fn root_annotation(sched: &IrSchedule, root_idx: usize) -> Option<AttrValue> {
    let root = sched.module().roots()[root_idx];
    let NodeKind::Block { annotations, .. } = sched.module().kind(root) else {
        panic!("root is a block")
    };
    annotations.get(AUTO_UNROLL_KEY).cloned()
}

#[test]
fn rule_decision_replays_without_the_rule() {
    let lowered = lowered(&[Workload::reduce_sum(32, 128)]);
    let mut sched = fresh_schedule(&lowered);

    let mut rule = AutoUnroll::with_seed(42);
    assert_eq!(rule.init(&sched), RuleApplyType::ApplyAndSkipThisRule);
    rule.apply(&mut sched, 0).unwrap();
    let annotated = root_annotation(&sched, 0).expect("annotation present");

    // Replay the trace on a fresh schedule with no rule in sight.
    let bytes = sched.trace().to_bytes().unwrap();
    let mut replayed = fresh_schedule(&lowered);
    ScheduleDesc::from_bytes(&bytes)
        .unwrap()
        .replay(&mut replayed)
        .unwrap();

    assert_eq!(root_annotation(&replayed, 0), Some(annotated));
    assert_eq!(print_module(replayed.module()), print_module(sched.module()));
}

#[test]
fn different_seeds_still_replay_faithfully() {
    let lowered = lowered(&[Workload::reduce_sum(8, 64)]);
    for seed in [0u64, 1, 2, 3, 99] {
        let mut sched = fresh_schedule(&lowered);
        let mut rule = AutoUnroll::with_seed(seed);
        rule.init(&sched);
        rule.apply(&mut sched, 0).unwrap();
        let Some(AttrValue::Int(step)) = root_annotation(&sched, 0) else {
            panic!("annotation missing")
        };
        assert!(AUTO_UNROLL_OPTIONS.contains(&step));

        let mut replayed = fresh_schedule(&lowered);
        sched.trace().replay(&mut replayed).unwrap();
        assert_eq!(root_annotation(&replayed, 0), Some(AttrValue::Int(step)));
    }
}

#[test]
fn rule_applies_per_function_body() {
    let lowered = lowered(&[
        Workload::reduce_sum(8, 16),
        Workload::elementwise_copy(vec![32]),
        Workload::reduce_sum(4, 4),
    ]);
    let mut sched = fresh_schedule(&lowered);
    let mut rule = AutoUnroll::with_seed(5);
    assert_eq!(rule.init(&sched), RuleApplyType::ApplyAndSkipThisRule);
    // Only the two reductions are eligible.
    assert_eq!(rule.num_applicable(), 2);
    for index in 0..rule.num_applicable() {
        rule.apply(&mut sched, index).unwrap();
    }
    assert!(root_annotation(&sched, 0).is_some());
    assert!(root_annotation(&sched, 1).is_none());
    assert!(root_annotation(&sched, 2).is_some());
}

#[test]
fn repeated_init_reports_the_same_targets() {
    let lowered = lowered(&[
        Workload::reduce_sum(8, 32),
        Workload::elementwise_copy(vec![16]),
    ]);
    let mut sched = fresh_schedule(&lowered);
    let mut rule = AutoUnroll::with_seed(0);
    assert_eq!(rule.init(&sched), RuleApplyType::ApplyAndSkipThisRule);
    assert_eq!(rule.num_applicable(), 1);
    // A rescan without intervening mutation finds the same single target.
    assert_eq!(rule.init(&sched), RuleApplyType::ApplyAndSkipThisRule);
    assert_eq!(rule.num_applicable(), 1);
}

#[test]
fn rules_compose_with_manual_primitives() {
    let lowered = lowered(&[Workload::reduce_sum(16, 64)]);
    let mut sched = fresh_schedule(&lowered);

    let loops = sched.get_loops_by_name("C").unwrap();
    sched.parallel(loops[0]).unwrap();

    let mut rule = AutoUnroll::with_seed(3);
    rule.init(&sched);
    rule.apply(&mut sched, 0).unwrap();

    let mut replayed = fresh_schedule(&lowered);
    sched.trace().replay(&mut replayed).unwrap();
    assert_eq!(print_module(replayed.module()), print_module(sched.module()));
}

#[test]
fn rules_work_through_the_trait_object() {
    let lowered = lowered(&[Workload::reduce_sum(8, 8)]);
    let mut sched = fresh_schedule(&lowered);
    let mut rules: Vec<Box<dyn ScheduleRule>> = vec![Box::new(AutoUnroll::with_seed(1))];
    for rule in rules.iter_mut() {
        if rule.init(&sched) == RuleApplyType::CannotApply {
            continue;
        }
        for index in 0..rule.num_applicable() {
            rule.apply(&mut sched, index).unwrap();
        }
    }
    assert!(root_annotation(&sched, 0).is_some());
}
