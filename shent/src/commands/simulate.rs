//! Simulate command implementation.
//!
//! Emits a barrier, runs it on the simulated collector runtime and reports
//! what each run did. Every run is checked against the reference path
//! decision in `shen_barrier::policy`; a disagreement fails the command.

use serde::Serialize;
use shen_barrier::backend::ops_for;
use shen_barrier::policy::{load_barrier_path, pre_write_path, LoadPath, PreWritePath};
use shen_barrier::sim::{Scenario, SimWorld};
use shen_barrier::{ArrayRangeSite, BarrierSetAssembler, GcState, PreWriteSite, ReferenceStrength, StubKind};
use shen_lir::interp::ExecStats;
use shen_lir::{Address, CodeBuffer, Isa, Program};
use tracing::{debug, info};

use crate::commands::common::{operands, stubs, BarrierArg, IsaArg, OutputFormat, StrengthArg, FIELD_OFFSET};
use crate::commands::traits::{Command, CommandDescription};
use crate::config::Config;
use crate::error::{Result, ShentError};

/// Size of every simulated object
const OBJECT_SIZE: u64 = 16;

/// Arguments for the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateArgs {
    pub isa: IsaArg,
    pub barrier: BarrierArg,
    pub strength: StrengthArg,
    pub gc_state: GcState,
    /// Slot holds a compressed reference (loads only)
    pub narrow: bool,
    /// The slot holds null
    pub null: bool,
    /// Target region is in the collection set
    pub in_cset: bool,
    /// Target is unreachable for weak and phantom loads
    pub unreachable: bool,
    /// Number of runs, or array length for array-range
    pub count: usize,
    pub native_stubs: bool,
    pub format: OutputFormat,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            isa: IsaArg::Amd64,
            barrier: BarrierArg::Lrb,
            strength: StrengthArg::Strong,
            gc_state: GcState::IDLE,
            narrow: false,
            null: false,
            in_cset: false,
            unreachable: false,
            count: 1,
            native_stubs: false,
            format: OutputFormat::Text,
        }
    }
}

/// One execution of the emitted code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run: usize,
    /// Reference the barrier saw
    pub input: u64,
    /// Barrier result, or the value left in the slot for pre-writes
    pub output: u64,
    pub path: String,
    pub calls: Vec<&'static str>,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulateReport {
    pub isa: String,
    pub barrier: &'static str,
    pub gc_state: String,
    pub runs: Vec<RunRecord>,
    /// SATB entries recorded, oldest first
    pub logged: Vec<u64>,
    pub stub_calls: usize,
    pub evacuated: usize,
}

/// Simulate command handler.
pub struct SimulateCommand {
    args: SimulateArgs,
}

impl SimulateCommand {
    fn world(&self, config: &Config) -> Result<SimWorld> {
        let isa = Isa::from(self.args.isa);
        let world = Scenario::new(isa, config.barrier.clone())
            .stubs(stubs(isa, self.args.native_stubs))
            .regions(config.simulate.regions)
            .satb_entries(config.simulate.satb_entries)
            .step_limit(config.simulate.step_limit)
            .build()?;
        Ok(world)
    }

    fn barriers(&self, config: &Config) -> Result<BarrierSetAssembler> {
        let isa = Isa::from(self.args.isa);
        Ok(BarrierSetAssembler::new(config.barrier.clone(), stubs(isa, self.args.native_stubs))?)
    }

    /// Run the simulation and collect the report.
    pub fn simulate(&self, config: &Config) -> Result<SimulateReport> {
        if self.args.count == 0 {
            return Err(ShentError::Validation("--count must be at least 1".to_string()));
        }
        if !self.args.gc_state.is_consistent() {
            return Err(ShentError::Validation(format!(
                "gc-state {} sets EVACUATION without HAS_FORWARDED",
                self.args.gc_state
            )));
        }
        let mut world = self.world(config)?;
        let barriers = self.barriers(config)?;
        world.set_gc_state(self.args.gc_state)?;

        let runs = match self.args.barrier {
            BarrierArg::Lrb | BarrierArg::Load => self.simulate_load(&mut world, &barriers)?,
            BarrierArg::PreWrite => self.simulate_pre_write(&mut world, &barriers)?,
            BarrierArg::ArrayRange => self.simulate_array_range(&mut world, &barriers)?,
            other => {
                return Err(ShentError::Validation(format!(
                    "cannot simulate '{}': choose lrb, load, pre-write or array-range",
                    other.name()
                )));
            }
        };

        Ok(SimulateReport {
            isa: world.isa().to_string(),
            barrier: self.args.barrier.name(),
            gc_state: self.args.gc_state.to_string(),
            runs,
            logged: world.logged()?,
            stub_calls: world.runtime.total_calls(),
            evacuated: world.runtime.heap.evacuated(),
        })
    }

    fn program(
        &self,
        world: &SimWorld,
        emit: impl FnOnce(&mut dyn shen_barrier::BarrierTargetOps) -> shen_barrier::Result<()>,
    ) -> Result<Program> {
        let mut code = CodeBuffer::new(world.isa());
        emit(&mut *ops_for(&mut code))?;
        Ok(code.finish()?)
    }

    fn simulate_load(&self, world: &mut SimWorld, barriers: &BarrierSetAssembler) -> Result<Vec<RunRecord>> {
        let narrow = self.args.narrow;
        if narrow && world.config().compressed_oops.is_none() {
            return Err(ShentError::Validation(
                "--narrow loads need compressed references (set barrier.compressed_oops or SHEN_COMPRESSED_OOPS=1)"
                    .to_string(),
            ));
        }
        let r = operands(world.isa());
        let strength = ReferenceStrength::from(self.args.strength);
        let program = self.program(world, |ops| {
            barriers
                .emit_barriered_load(
                    ops,
                    self.args.strength.barrier_type(),
                    r.result,
                    Address::with_disp(r.base, FIELD_OFFSET),
                    narrow,
                    [r.object, r.tmp1, r.tmp2],
                )
                .map(|_| ())
        })?;

        let holder = world.allocate(0, OBJECT_SIZE)?;
        let slot = holder + FIELD_OFFSET as u64;
        let target = if self.args.null { 0 } else { world.allocate(1, OBJECT_SIZE)? };
        world.write_ref(slot, target, narrow)?;
        if self.args.in_cset {
            world.add_to_cset(1)?;
        }
        if self.args.unreachable && target != 0 {
            world.runtime.heap.mark_unreachable(target);
        }

        let mut runs = Vec::with_capacity(self.args.count);
        for run in 1..=self.args.count {
            let input = world.read_ref(slot, narrow)?;
            let expected = load_barrier_path(
                self.args.gc_state,
                strength,
                false,
                input == 0,
                world.runtime.heap.in_cset(input),
            );
            world.machine.set_reg(r.base, holder);
            let stats = world.run(&program)?;
            let observed = observed_load_path(&stats, input);
            check_path(run, observed, expected)?;
            runs.push(RunRecord {
                run,
                input,
                output: world.machine.reg(r.result),
                path: format!("{:?}", observed),
                calls: stats.calls.iter().map(|c| c.name).collect(),
            });
        }
        Ok(runs)
    }

    fn simulate_pre_write(&self, world: &mut SimWorld, barriers: &BarrierSetAssembler) -> Result<Vec<RunRecord>> {
        let narrow = world.config().compressed_oops.is_some();
        let r = operands(world.isa());
        let site = PreWriteSite::load(Address::with_disp(r.base, FIELD_OFFSET), r.tmp1, r.tmp2);
        let mut plan = None;
        let program = self.program(world, |ops| {
            plan = Some(barriers.emit_pre_write_barrier(ops, &site)?);
            Ok(())
        })?;
        let plan = plan.ok_or_else(|| ShentError::Validation("pre-write barrier was not emitted".to_string()))?;

        let mut runs = Vec::with_capacity(self.args.count);
        for run in 1..=self.args.count {
            let holder = world.allocate(0, OBJECT_SIZE)?;
            let previous = if self.args.null { 0 } else { world.allocate(1, OBJECT_SIZE)? };
            world.write_ref(holder + FIELD_OFFSET as u64, previous, narrow)?;

            let index = world.runtime.thread.satb_index(&world.machine.memory)?;
            let expected = pre_write_path(self.args.gc_state, &plan, previous == 0, index);
            let logged_before = world.logged()?.len();

            world.machine.set_reg(r.base, holder);
            let stats = world.run(&program)?;

            let logged = world.logged()?.len() > logged_before;
            let called = stats.called(StubKind::PreWrite.name()) > 0;
            let observed = match (called, logged) {
                (true, _) => PreWritePath::Runtime,
                (false, true) => PreWritePath::Enqueue,
                (false, false) if !expected.logs() => expected,
                (false, false) => PreWritePath::NotMarking,
            };
            check_path(run, observed, expected)?;
            runs.push(RunRecord {
                run,
                input: previous,
                output: world.read_ref(holder + FIELD_OFFSET as u64, narrow)?,
                path: format!("{:?}", observed),
                calls: stats.calls.iter().map(|c| c.name).collect(),
            });
        }
        Ok(runs)
    }

    fn simulate_array_range(
        &self,
        world: &mut SimWorld,
        barriers: &BarrierSetAssembler,
    ) -> Result<Vec<RunRecord>> {
        let narrow = world.config().compressed_oops.is_some();
        let stride = world.config().oop_size();
        let r = operands(world.isa());
        let site = ArrayRangeSite::new(r.base, r.extra, stride, [r.tmp1, r.tmp2, r.extra2]);
        let program = self.program(world, |ops| barriers.emit_array_range_pre_write_barrier(ops, &site))?;

        let length = self.args.count as u64;
        let array = world.allocate(0, (length * stride as u64).max(8))?;
        let mut live = 0;
        for i in 0..length {
            if !self.args.null {
                let element = world.allocate(1, OBJECT_SIZE)?;
                world.write_ref(array + i * stride as u64, element, narrow)?;
                live += 1;
            }
        }

        world.machine.set_reg(r.base, array);
        world.machine.set_reg(r.extra, length);
        let stats = world.run(&program)?;

        let logged = world.logged()?.len();
        let expected = if self.args.gc_state.contains(GcState::MARKING) { live } else { 0 };
        if logged != expected {
            return Err(ShentError::Validation(format!(
                "array range logged {} of {} elements, expected {}",
                logged, length, expected
            )));
        }
        Ok(vec![RunRecord {
            run: 1,
            input: array,
            output: length,
            path: format!("logged {} of {}", logged, length),
            calls: stats.calls.iter().map(|c| c.name).collect(),
        }])
    }

    /// Render the report in the requested format.
    pub fn render(&self, report: &SimulateReport) -> Result<String> {
        match self.args.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
            OutputFormat::Text => {
                let mut text = format!(
                    "Simulated {} on {} with gc-state {}\n",
                    report.barrier, report.isa, report.gc_state
                );
                for run in &report.runs {
                    let calls = if run.calls.is_empty() { "no calls".to_string() } else { run.calls.join(", ") };
                    text.push_str(&format!(
                        "  run {}: {:#x} -> {:#x} via {} ({})\n",
                        run.run, run.input, run.output, run.path, calls
                    ));
                }
                text.push_str(&format!(
                    "Stub calls: {}, evacuated: {}, SATB entries: {}\n",
                    report.stub_calls,
                    report.evacuated,
                    report.logged.len()
                ));
                Ok(text)
            }
        }
    }
}

/// Path the emitted load barrier actually took
fn observed_load_path(stats: &ExecStats, input: u64) -> LoadPath {
    if stats.slow_path_entries > 0 {
        LoadPath::Slow
    } else if stats.mid_path_entries > 0 {
        LoadPath::CsetFiltered
    } else if input == 0 {
        LoadPath::NullInput
    } else {
        LoadPath::Fast
    }
}

fn check_path<P: PartialEq + std::fmt::Debug>(run: usize, observed: P, expected: P) -> Result<()> {
    debug!("run {}: {:?}", run, observed);
    if observed != expected {
        return Err(ShentError::Validation(format!(
            "run {}: barrier took {:?} but the policy expects {:?}",
            run, observed, expected
        )));
    }
    Ok(())
}

impl Command for SimulateCommand {
    type Args = SimulateArgs;
    type Output = String;

    fn new(args: Self::Args) -> Self {
        Self { args }
    }

    fn execute(&self, config: &Config) -> Result<Self::Output> {
        let report = self.simulate(config)?;
        info!("{}: {} run(s)", Self::description(), report.runs.len());
        self.render(&report)
    }

    fn name() -> &'static str {
        "simulate"
    }
}

impl CommandDescription for SimulateCommand {
    fn description() -> &'static str {
        "Run one barrier on the simulated collector runtime"
    }
}

/// Run the simulate command and print its output.
pub fn run_simulate(args: SimulateArgs, config: &Config) -> Result<()> {
    let output = SimulateCommand::new(args).execute(config)?;
    print!("{}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulateConfig;
    use shen_barrier::{BarrierConfig, HeapLayout, OopEncoding};

    fn small_config() -> Config {
        Config {
            barrier: BarrierConfig {
                heap: HeapLayout { region_size_shift: 16, ..Default::default() },
                ..Default::default()
            },
            simulate: SimulateConfig::default(),
        }
    }

    fn simulate(args: SimulateArgs) -> Result<SimulateReport> {
        SimulateCommand::new(args).simulate(&small_config())
    }

    #[test]
    fn test_idle_strong_load_is_fast() {
        let report = simulate(SimulateArgs::default()).unwrap();
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].path, "Fast");
        assert_eq!(report.runs[0].input, report.runs[0].output);
        assert_eq!(report.stub_calls, 0);
    }

    #[test]
    fn test_in_cset_load_evacuates_once() {
        for isa in [IsaArg::Amd64, IsaArg::Aarch64] {
            let report = simulate(SimulateArgs {
                isa,
                gc_state: GcState::HAS_FORWARDED | GcState::EVACUATION,
                in_cset: true,
                count: 2,
                ..Default::default()
            })
            .unwrap();
            assert_eq!(report.runs[0].path, "Slow");
            assert_eq!(report.runs[0].calls, vec!["load_barrier_strong"]);
            assert_eq!(report.runs[1].path, "CsetFiltered");
            assert_eq!(report.runs[1].input, report.runs[0].output);
            assert_eq!(report.evacuated, 1);
        }
    }

    #[test]
    fn test_weak_null_load() {
        let report = simulate(SimulateArgs {
            strength: StrengthArg::Weak,
            gc_state: GcState::WEAK_ROOTS,
            null: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(report.runs[0].path, "NullInput");
        assert_eq!(report.runs[0].output, 0);
    }

    #[test]
    fn test_pre_write_overflows_into_stub() {
        let config = Config {
            simulate: SimulateConfig { satb_entries: 2, ..Default::default() },
            ..small_config()
        };
        let args = SimulateArgs {
            barrier: BarrierArg::PreWrite,
            gc_state: GcState::MARKING,
            count: 3,
            ..Default::default()
        };
        let report = SimulateCommand::new(args).simulate(&config).unwrap();
        let paths: Vec<_> = report.runs.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["Enqueue", "Enqueue", "Runtime"]);
        let inputs: Vec<_> = report.runs.iter().map(|r| r.input).collect();
        assert_eq!(report.logged, inputs);
    }

    #[test]
    fn test_pre_write_compressed_outside_marking() {
        let mut config = small_config();
        config.barrier.compressed_oops = Some(OopEncoding::DEFAULT);
        let args = SimulateArgs {
            barrier: BarrierArg::PreWrite,
            gc_state: GcState::HAS_FORWARDED,
            count: 2,
            ..Default::default()
        };
        let report = SimulateCommand::new(args).simulate(&config).unwrap();
        assert!(report.runs.iter().all(|r| r.path == "NotMarking"));
        assert!(report.logged.is_empty());
    }

    #[test]
    fn test_array_range_logs_every_element() {
        let report = simulate(SimulateArgs {
            barrier: BarrierArg::ArrayRange,
            gc_state: GcState::MARKING,
            count: 20,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(report.logged.len(), 20);
        assert_eq!(report.runs[0].path, "logged 20 of 20");
    }

    #[test]
    fn test_card_cannot_be_simulated() {
        let err = simulate(SimulateArgs { barrier: BarrierArg::Card, ..Default::default() }).unwrap_err();
        assert!(matches!(err, ShentError::Validation(_)));
    }

    #[test]
    fn test_evacuation_without_forwarding_rejected() {
        let err = simulate(SimulateArgs { gc_state: GcState::EVACUATION, ..Default::default() }).unwrap_err();
        assert!(matches!(err, ShentError::Validation(_)));
    }

    #[test]
    fn test_zero_count_rejected() {
        assert!(simulate(SimulateArgs { count: 0, ..Default::default() }).is_err());
    }

    #[test]
    fn test_text_report() {
        let command = SimulateCommand::new(SimulateArgs::default());
        let text = command.execute(&small_config()).unwrap();
        assert!(text.starts_with("Simulated lrb on amd64 with gc-state IDLE"), "{}", text);
        assert!(text.contains("via Fast (no calls)"));
    }
}
