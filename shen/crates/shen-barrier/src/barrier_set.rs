//! Barrier set - the lowering-facing entry point
//!
//! Owns the configuration, the runtime stub table and the session counters.
//! Every emission goes through [`BarrierSetAssembler::emit_with`], which
//! checks that the backend matches the stub table, that the emitter handed
//! back every scratch register, and records the outcome.

use shen_lir::{Address, Reg, Width};

use crate::array_range::emit_array_range_pre_write_barrier;
use crate::card::emit_card_barrier;
use crate::config::BarrierConfig;
use crate::ensure;
use crate::error::{BarrierError, Result};
use crate::logging::{BarrierEvent, BarrierLogger, BarrierLoggerConfig};
use crate::lrb::emit_load_reference_barrier;
use crate::ops::BarrierTargetOps;
use crate::policy::{LoadBarrierPlan, PreWritePlan};
use crate::satb::emit_pre_write_barrier;
use crate::site::{ArrayRangeSite, CardMarkSite, LoadBarrierSite, PreWriteSite, PreviousValue};
use crate::stats::{AtomicBarrierStats, BarrierKind, BarrierStats};
use crate::strength::{BarrierType, ReferenceStrength};
use crate::stubs::{RuntimeStubs, StubKind, StubReach};

/// Shenandoah barrier set for one compilation session
#[derive(Debug)]
pub struct BarrierSetAssembler {
    config: BarrierConfig,
    stubs: RuntimeStubs,
    stats: AtomicBarrierStats,
    logger: BarrierLogger,
}

/// What an emission produced, for statistics and logging
struct Emitted {
    detail: String,
    elided: bool,
    strength: Option<ReferenceStrength>,
}

impl Emitted {
    fn site(detail: impl Into<String>) -> Self {
        Self { detail: detail.into(), elided: false, strength: None }
    }
}

impl BarrierSetAssembler {
    /// Validate the configuration and the stub table
    pub fn new(config: BarrierConfig, stubs: RuntimeStubs) -> Result<Self> {
        Self::with_logger(config, stubs, BarrierLoggerConfig::default())
    }

    pub fn with_logger(
        config: BarrierConfig,
        stubs: RuntimeStubs,
        logger: BarrierLoggerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let stubs = if config.far_stub_calls { stubs.with_reach(StubReach::Far) } else { stubs };
        stubs.validate()?;

        let logger = BarrierLogger::new(logger);
        logger.log(BarrierEvent::Configured {
            verify_oops: config.verify_oops,
            slow_path_only: config.slow_path_only,
            compressed_oops: config.compressed_oops.is_some(),
            generational: config.generational,
        });
        Ok(Self { config, stubs, stats: AtomicBarrierStats::new(), logger })
    }

    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    pub fn stubs(&self) -> &RuntimeStubs {
        &self.stubs
    }

    pub fn logger(&self) -> &BarrierLogger {
        &self.logger
    }

    pub fn stats(&self) -> BarrierStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Load reference barrier on an already loaded reference
    pub fn emit_load_reference_barrier(
        &self,
        ops: &mut dyn BarrierTargetOps,
        site: &LoadBarrierSite,
    ) -> Result<LoadBarrierPlan> {
        self.emit_with(ops, BarrierKind::LoadReference, |ops| {
            let plan = emit_load_reference_barrier(ops, &self.config, &self.stubs, site)?;
            let detail = format!("{}{}", plan.strength, if site.narrow { ", narrow" } else { "" });
            Ok((plan, Emitted { strength: Some(plan.strength), ..Emitted::site(detail) }))
        })
    }

    /// SATB pre-write barrier before a reference store
    pub fn emit_pre_write_barrier(
        &self,
        ops: &mut dyn BarrierTargetOps,
        site: &PreWriteSite,
    ) -> Result<PreWritePlan> {
        self.emit_with(ops, BarrierKind::PreWrite, |ops| {
            let plan = emit_pre_write_barrier(ops, &self.config, &self.stubs, site)?;
            let detail = match site.previous {
                PreviousValue::Load => "previous loaded",
                PreviousValue::Known { .. } => "previous known",
                PreviousValue::ConstantNull => "previous null",
            };
            Ok((plan, Emitted { elided: plan.elided, ..Emitted::site(detail) }))
        })
    }

    /// Pre-write barrier over a whole range of reference slots
    pub fn emit_array_range_pre_write_barrier(
        &self,
        ops: &mut dyn BarrierTargetOps,
        site: &ArrayRangeSite,
    ) -> Result<()> {
        self.emit_with(ops, BarrierKind::ArrayRange, |ops| {
            emit_array_range_pre_write_barrier(ops, &self.config, &self.stubs, site)?;
            Ok(((), Emitted::site(format!("stride {}", site.element_stride))))
        })
    }

    /// Dirty the card of a stored-to slot
    pub fn emit_card_barrier(
        &self,
        ops: &mut dyn BarrierTargetOps,
        site: &CardMarkSite,
    ) -> Result<()> {
        self.emit_with(ops, BarrierKind::CardMark, |ops| {
            emit_card_barrier(ops, &self.config, site)?;
            let detail = if self.config.conditional_card_mark { "conditional" } else { "unconditional" };
            Ok(((), Emitted::site(detail)))
        })
    }

    /// Load a reference from `address` into `dst` followed by the load
    /// barrier for `barrier_type`
    ///
    /// `temps` are `[object, tmp1, tmp2]`; `object` receives the raw loaded
    /// value.
    pub fn emit_barriered_load(
        &self,
        ops: &mut dyn BarrierTargetOps,
        barrier_type: BarrierType,
        dst: Reg,
        address: Address,
        narrow: bool,
        [object, tmp1, tmp2]: [Reg; 3],
    ) -> Result<LoadBarrierPlan> {
        let strength = barrier_type.strength()?;
        let site = LoadBarrierSite::new(dst, object, address, strength, [tmp1, tmp2]).narrow(narrow);
        site.validate(ops.isa())?;
        self.emit_reference_load(ops, object, &address, narrow)?;
        self.emit_load_reference_barrier(ops, &site)
    }

    /// `Reference.get()`: weak load barrier on the referent, then keep the
    /// result alive for concurrent marking
    ///
    /// `temps` are `[object, tmp1, tmp2]`.
    pub fn emit_referent_load(
        &self,
        ops: &mut dyn BarrierTargetOps,
        dst: Reg,
        address: Address,
        [object, tmp1, tmp2]: [Reg; 3],
    ) -> Result<()> {
        self.require_preserving_pre_write("referent load", "the loaded referent")?;
        let narrow = self.config.compressed_oops.is_some();
        let site = LoadBarrierSite::new(dst, object, address, ReferenceStrength::Weak, [tmp1, tmp2])
            .narrow(narrow);
        site.validate(ops.isa())?;
        self.emit_reference_load(ops, object, &address, narrow)?;
        self.emit_load_reference_barrier(ops, &site)?;

        // the referent may be null after the barrier cleared it
        let keep_alive = PreWriteSite::known(address, dst, tmp1).non_null(false);
        self.emit_pre_write_barrier(ops, &keep_alive)?;
        Ok(())
    }

    /// Store `value` to `address` with the pre-write barrier before it and,
    /// in generational mode, the card mark after it
    ///
    /// `temps` are `[temp, temp2]`; `temp2` receives the previous value and
    /// the encoded value with compressed references.
    pub fn emit_reference_store(
        &self,
        ops: &mut dyn BarrierTargetOps,
        address: Address,
        value: Reg,
        [temp, temp2]: [Reg; 2],
    ) -> Result<()> {
        let isa = ops.isa();
        for (role, reg) in [("temp", temp), ("temp2", temp2)] {
            ensure!(
                reg != value,
                BarrierError::AliasedRegisters {
                    site: "reference store",
                    first: "value".to_string(),
                    second: role.to_string(),
                }
            );
        }
        ensure!(
            !address.uses(value),
            BarrierError::invalid_site(
                "reference store",
                format!("stored value {} is part of the address", isa.reg_name(value, Width::W64)),
            )
        );
        self.require_preserving_pre_write("reference store", "the address and the stored value")?;

        self.emit_pre_write_barrier(ops, &PreWriteSite::load(address, temp, temp2))?;

        match &self.config.compressed_oops {
            Some(encoding) => {
                ops.mov(temp2, value)?;
                ops.encode_narrow(temp2, encoding)?;
                ops.store(Width::W32, temp2, address)?;
            }
            None => ops.store(Width::W64, value, address)?,
        }

        if self.config.generational {
            self.emit_card_barrier(ops, &CardMarkSite::new(address, temp))?;
        }
        Ok(())
    }

    /// Composite sequences keep their own operands live across the
    /// pre-write call, which a native stub is free to clobber
    fn require_preserving_pre_write(&self, site: &'static str, live: &str) -> Result<()> {
        let stub = self.stubs.get(StubKind::PreWrite)?;
        ensure!(
            stub.preserves_registers,
            BarrierError::invalid_site(
                site,
                format!("pre-write stub must preserve registers, {} stay live across the call", live),
            )
        );
        Ok(())
    }

    fn emit_reference_load(
        &self,
        ops: &mut dyn BarrierTargetOps,
        dst: Reg,
        address: &Address,
        narrow: bool,
    ) -> Result<()> {
        match (narrow, &self.config.compressed_oops) {
            (true, Some(encoding)) => {
                ops.load(Width::W32, dst, *address)?;
                ops.decode_narrow(dst, encoding)
            }
            (true, None) => Err(BarrierError::invalid_site(
                "load reference",
                "narrow load without compressed references configured",
            )),
            (false, _) => ops.load(Width::W64, dst, *address),
        }
    }

    /// Run one emitter with the bookkeeping every barrier shares
    fn emit_with<T>(
        &self,
        ops: &mut dyn BarrierTargetOps,
        kind: BarrierKind,
        emit: impl FnOnce(&mut dyn BarrierTargetOps) -> Result<(T, Emitted)>,
    ) -> Result<T> {
        let isa = ops.isa();
        let before_instructions = ops.code().instruction_count();
        let before_blocks = ops.code().out_of_line_count();
        let before_scratch = ops.scratch_in_use();

        let result = if isa != self.stubs.isa() {
            Err(BarrierError::Internal(format!(
                "{} backend used with {} runtime stubs",
                isa,
                self.stubs.isa()
            )))
        } else {
            emit(&mut *ops).and_then(|out| {
                let leaked = ops.scratch_in_use().saturating_sub(before_scratch);
                if leaked > 0 {
                    return Err(BarrierError::ScratchLeak { site: kind.name(), count: leaked });
                }
                Ok(out)
            })
        };

        match result {
            Ok((value, emitted)) => {
                let instructions = ops.code().instruction_count() - before_instructions;
                let blocks = ops.code().out_of_line_count() - before_blocks;
                if emitted.elided {
                    self.stats.record_elided_pre_write();
                    self.logger.log(BarrierEvent::Elided { kind, isa: isa.name() });
                } else {
                    match emitted.strength {
                        Some(strength) => self.stats.record_load(strength),
                        None => self.stats.record_site(kind),
                    }
                    self.stats.record_code(instructions, blocks);
                    self.logger.log(BarrierEvent::Emitted {
                        kind,
                        isa: isa.name(),
                        detail: emitted.detail,
                        instructions,
                        out_of_line_blocks: blocks,
                    });
                }
                Ok(value)
            }
            Err(err) => {
                self.stats.record_aborted();
                self.logger.log(BarrierEvent::Aborted {
                    kind,
                    isa: isa.name(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
