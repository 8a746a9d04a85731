//! TensorTune Command Line Interface
//!
//! Usage:
//!   tensortune [OPTIONS]
//!   tensortune --help
//!
//! Examples:
//!   tensortune --workload copy --shape 32,32            # Lower and emit C
//!   tensortune --workload reduce-sum --shape 128,256 --auto-unroll --emit ir
//!   tensortune --workload copy --shape 1024 --measure   # Compile and time

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, info};
use std::fs;
use std::path::PathBuf;
use tensortune::codegen::Target;
use tensortune::ir::printer::print_module;
use tensortune::ir::IrSchedule;
use tensortune::lower::Workload;
use tensortune::measure::{LocalBuilder, LocalRunner, MeasureInput, ScheduleMeasurer};
use tensortune::rules::{AutoUnroll, RuleApplyType, ScheduleRule};
use tensortune::task::TaskCreator;

/// TensorTune - schedule tracing and auto-tuning core
#[derive(Parser, Debug)]
#[command(name = "tensortune")]
#[command(version)]
#[command(about = "Trace-based schedule tuning for tensor programs", long_about = None)]
struct Cli {
    /// Workload to lower
    #[arg(long, default_value = "copy")]
    workload: WorkloadArg,

    /// Tensor shape (comma-separated extents)
    #[arg(long, value_delimiter = ',', num_args = 1.., default_value = "32,32")]
    shape: Vec<i64>,

    /// Number of chained elementwise stages
    #[arg(long, default_value = "1")]
    stages: usize,

    /// Constant for the add-const workload
    #[arg(long, default_value = "1.0")]
    add_const: f64,

    /// Code generation target
    #[arg(short, long, default_value = "c")]
    target: TargetArg,

    /// Apply the automatic unrolling rule before emitting
    #[arg(long)]
    auto_unroll: bool,

    /// Seed for rule sampling (entropy-seeded when absent)
    #[arg(long)]
    seed: Option<u64>,

    /// What to emit
    #[arg(long, default_value = "code")]
    emit: EmitKind,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Compile and time the generated program
    #[arg(long)]
    measure: bool,

    /// Timed repeats per measurement
    #[arg(long, default_value = "5")]
    repeats: usize,

    /// Work directory for build artifacts
    #[arg(long, default_value = "target/tensortune")]
    work_dir: PathBuf,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress warnings)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkloadArg {
    /// Elementwise copy chain
    Copy,
    /// Elementwise add-constant
    AddConst,
    /// Row-wise matrix reduction
    ReduceSum,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    /// Plain C code
    C,
    /// C with OpenMP pragmas
    Openmp,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::C => Target::C,
            TargetArg::Openmp => Target::OpenMp,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitKind {
    /// Generated source code
    Code,
    /// Textual IR after scheduling
    Ir,
    /// The serialized schedule trace
    Trace,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    info!("TensorTune v{}", tensortune::VERSION);

    let workload = build_workload(&cli)?;
    debug!("workload: {:?}", workload);
    let target: Target = cli.target.into();
    let tasks = TaskCreator::create_tasks(std::slice::from_ref(&workload), target);
    let task = &tasks[0];

    let lowered = task
        .lower_unscheduled()
        .with_context(|| format!("failed to lower `{}`", task.name))?;
    let mut sched = IrSchedule::new(lowered.module.clone());

    if cli.auto_unroll {
        let mut rule = match cli.seed {
            Some(seed) => AutoUnroll::with_seed(seed),
            None => AutoUnroll::new(),
        };
        if rule.init(&sched) != RuleApplyType::CannotApply {
            for index in 0..rule.num_applicable() {
                rule.apply(&mut sched, index)
                    .with_context(|| "auto-unroll failed")?;
            }
            info!("auto-unroll applied to {} bodies", rule.num_applicable());
        } else {
            info!("auto-unroll not applicable");
        }
    }

    let output = match cli.emit {
        EmitKind::Ir => print_module(sched.module()),
        EmitKind::Trace => {
            let bytes = sched.trace().to_bytes().context("trace serialization")?;
            String::from_utf8(bytes).context("trace is not UTF-8")?
        }
        EmitKind::Code => task.benchmark_source(
            sched.module(),
            &lowered.funcs,
            &lowered.funcs[0],
            cli.repeats,
        ),
    };

    if cli.measure {
        let source = task.benchmark_source(
            sched.module(),
            &lowered.funcs,
            &lowered.funcs[0],
            cli.repeats,
        );
        let builder = LocalBuilder::new(&cli.work_dir)
            .with_openmp(matches!(target, Target::OpenMp));
        let runner = LocalRunner::new();
        let measurer = ScheduleMeasurer::new(&builder, &runner, 1);
        let results = measurer.measure(&[MeasureInput::new(&task.name, source)]);
        let result = &results[0];
        if result.error_msg.is_empty() {
            println!(
                "{}: {:.3} us (measured in {:.1} ms)",
                task.name,
                result.execution_cost_us,
                result.elapsed_time_us / 1e3
            );
        } else {
            println!("{}: {}", task.name, result.error_msg.trim_end());
        }
        return Ok(());
    }

    write_output(&cli.output, &output)
}

fn build_workload(cli: &Cli) -> Result<Workload> {
    match cli.workload {
        WorkloadArg::Copy => Ok(Workload::staged_copy(cli.shape.clone(), cli.stages)),
        WorkloadArg::AddConst => Ok(Workload::elementwise_add_const(
            cli.shape.clone(),
            cli.add_const,
        )),
        WorkloadArg::ReduceSum => {
            let &[rows, cols] = &cli.shape[..] else {
                anyhow::bail!("reduce-sum expects --shape rows,cols");
            };
            Ok(Workload::reduce_sum(rows, cols))
        }
    }
}

fn write_output(path: &Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(path) => fs::write(path, content)
            .with_context(|| format!("failed to write output to {:?}", path)),
        None => {
            print!("{}", content);
            Ok(())
        }
    }
}
