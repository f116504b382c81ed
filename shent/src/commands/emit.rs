//! Emit command implementation.
//!
//! Emits one barrier for the chosen instruction set and prints the
//! resulting listing.

use serde_json::json;
use shen_barrier::backend::ops_for;
use shen_barrier::{
    ArrayRangeSite, BarrierConfig, BarrierSetAssembler, CardMarkSite, LoadBarrierSite, PreWriteSite,
};
use shen_lir::{Address, CodeBuffer, Isa, Program};
use tracing::{debug, info};

use crate::commands::common::{operands, stubs, BarrierArg, IsaArg, OutputFormat, StrengthArg, FIELD_OFFSET};
use crate::commands::traits::{Command, CommandDescription};
use crate::config::Config;
use crate::error::{Result, ShentError};

/// Arguments for the emit command.
#[derive(Debug, Clone)]
pub struct EmitArgs {
    pub isa: IsaArg,
    pub barrier: BarrierArg,
    pub strength: StrengthArg,
    /// Slot holds a compressed reference
    pub narrow: bool,
    /// Loaded reference proven non-null
    pub not_null: bool,
    /// Previous value proven non-null
    pub non_null: bool,
    /// Pass stub operands in native ABI registers
    pub native_stubs: bool,
    /// Print emission statistics after the listing
    pub stats: bool,
    pub format: OutputFormat,
}

impl Default for EmitArgs {
    fn default() -> Self {
        Self {
            isa: IsaArg::Amd64,
            barrier: BarrierArg::Lrb,
            strength: StrengthArg::Strong,
            narrow: false,
            not_null: false,
            non_null: false,
            native_stubs: false,
            stats: false,
            format: OutputFormat::Text,
        }
    }
}

/// What one emission produced.
#[derive(Debug)]
pub struct EmitOutput {
    pub program: Program,
    pub barriers: BarrierSetAssembler,
}

/// Emit command handler.
pub struct EmitCommand {
    args: EmitArgs,
}

impl EmitCommand {
    /// Check flag combinations the barrier set would reject with a less
    /// helpful message.
    fn validate(&self, config: &BarrierConfig) -> Result<()> {
        let needs_compressed = self.args.narrow && matches!(self.args.barrier, BarrierArg::Load);
        if needs_compressed && config.compressed_oops.is_none() {
            return Err(ShentError::Validation(
                "--narrow loads need compressed references (set barrier.compressed_oops or SHEN_COMPRESSED_OOPS=1)"
                    .to_string(),
            ));
        }
        if self.args.barrier == BarrierArg::Card && !config.generational {
            return Err(ShentError::Validation(
                "card marks need generational mode (set barrier.generational or SHEN_GENERATIONAL=1)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Emit the selected barrier into a fresh program.
    pub fn emit(&self, config: &Config) -> Result<EmitOutput> {
        self.validate(&config.barrier)?;
        let isa = Isa::from(self.args.isa);
        let barriers = BarrierSetAssembler::new(config.barrier.clone(), stubs(isa, self.args.native_stubs))?;
        let r = operands(isa);
        let field = Address::with_disp(r.base, FIELD_OFFSET);

        let mut code = CodeBuffer::new(isa);
        {
            let mut ops = ops_for(&mut code);
            let ops = &mut *ops;
            match self.args.barrier {
                BarrierArg::Lrb => {
                    let site = LoadBarrierSite::new(r.result, r.object, field, self.args.strength.into(), [r.tmp1, r.tmp2])
                        .narrow(self.args.narrow)
                        .not_null(self.args.not_null);
                    barriers.emit_load_reference_barrier(ops, &site)?;
                }
                BarrierArg::Load => {
                    barriers.emit_barriered_load(
                        ops,
                        self.args.strength.barrier_type(),
                        r.result,
                        field,
                        self.args.narrow,
                        [r.object, r.tmp1, r.tmp2],
                    )?;
                }
                BarrierArg::PreWrite => {
                    let site = PreWriteSite::load(field, r.tmp1, r.tmp2).non_null(self.args.non_null);
                    barriers.emit_pre_write_barrier(ops, &site)?;
                }
                BarrierArg::ArrayRange => {
                    let site = ArrayRangeSite::new(
                        r.base,
                        r.extra,
                        config.barrier.oop_size(),
                        [r.tmp1, r.tmp2, r.extra2],
                    );
                    barriers.emit_array_range_pre_write_barrier(ops, &site)?;
                }
                BarrierArg::Card => {
                    barriers.emit_card_barrier(ops, &CardMarkSite::new(field, r.tmp1))?;
                }
                BarrierArg::Store => {
                    barriers.emit_reference_store(ops, field, r.extra, [r.tmp1, r.tmp2])?;
                }
                BarrierArg::Referent => {
                    barriers.emit_referent_load(ops, r.result, field, [r.object, r.tmp1, r.tmp2])?;
                }
            }
        }
        let program = code.finish()?;
        debug!(
            "emitted {} for {}: {} instructions",
            self.args.barrier.name(),
            isa,
            program.len()
        );
        Ok(EmitOutput { program, barriers })
    }

    /// Render the emission in the requested format.
    pub fn render(&self, output: &EmitOutput) -> Result<String> {
        let stats = output.barriers.stats();
        match self.args.format {
            OutputFormat::Text => {
                let mut text = output.program.listing().to_string();
                if self.args.stats {
                    text.push('\n');
                    text.push_str(&stats.to_string());
                    text.push('\n');
                }
                Ok(text)
            }
            OutputFormat::Json => {
                let value = json!({
                    "isa": Isa::from(self.args.isa).to_string(),
                    "barrier": self.args.barrier.name(),
                    "instructions": output.program.len(),
                    "out_of_line_blocks": output.program.out_of_line_blocks().count(),
                    "listing": output.program.listing().to_string(),
                    "stats": stats,
                });
                Ok(serde_json::to_string_pretty(&value)?)
            }
        }
    }
}

impl Command for EmitCommand {
    type Args = EmitArgs;
    type Output = String;

    fn new(args: Self::Args) -> Self {
        Self { args }
    }

    fn execute(&self, config: &Config) -> Result<Self::Output> {
        let output = self.emit(config)?;
        info!("{}: {} instructions", Self::description(), output.program.len());
        self.render(&output)
    }

    fn name() -> &'static str {
        "emit"
    }
}

impl CommandDescription for EmitCommand {
    fn description() -> &'static str {
        "Emit one barrier and print its listing"
    }
}

/// Run the emit command and print its output.
pub fn run_emit(args: EmitArgs, config: &Config) -> Result<()> {
    let output = EmitCommand::new(args).execute(config)?;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
}
