//! Runtime stubs of the simulated collector

use rustc_hash::FxHashMap;
use shen_lir::interp::{self, ForeignCallHandler, InterpError, Machine};
use shen_lir::{CallTarget, ValueLocation, Width};

use super::heap::SimHeap;
use super::thread::SimThread;
use super::{SimError, SimResult};
use crate::config::OopEncoding;
use crate::gc_state::GcState;
use crate::strength::ReferenceStrength;
use crate::stubs::{RuntimeStubs, StubDescriptor, StubKind};

/// Value written to caller-saved registers by stubs that do not preserve them
pub const CLOBBER: u64 = 0xdead_dead_dead_dead;

/// Collector side of the barrier contract
///
/// Services the calls emitted barriers make: load barriers resolve and heal,
/// the pre-write stub logs into the thread's SATB buffer (retiring it first
/// when full), and `verify_oop` rejects values that are not heap references.
#[derive(Debug, Clone)]
pub struct SimRuntime {
    pub heap: SimHeap,
    pub thread: SimThread,
    stubs: RuntimeStubs,
    encoding: Option<OopEncoding>,
    clobber_caller_saved: bool,
    completed: Vec<Vec<u64>>,
    runtime_logged: Vec<u64>,
    calls: FxHashMap<StubKind, usize>,
}

impl SimRuntime {
    pub fn new(
        heap: SimHeap,
        thread: SimThread,
        stubs: RuntimeStubs,
        encoding: Option<OopEncoding>,
    ) -> Self {
        Self {
            heap,
            thread,
            stubs,
            encoding,
            clobber_caller_saved: true,
            completed: Vec::new(),
            runtime_logged: Vec::new(),
            calls: FxHashMap::default(),
        }
    }

    /// Poison caller-saved registers after calls to non-preserving stubs
    pub fn set_clobber_caller_saved(&mut self, clobber: bool) {
        self.clobber_caller_saved = clobber;
    }

    pub fn stubs(&self) -> &RuntimeStubs {
        &self.stubs
    }

    /// Retired SATB buffers, each oldest entry first
    pub fn completed_buffers(&self) -> &[Vec<u64>] {
        &self.completed
    }

    /// Values logged by the pre-write stub rather than inline
    pub fn runtime_logged(&self) -> &[u64] {
        &self.runtime_logged
    }

    pub fn calls(&self, kind: StubKind) -> usize {
        self.calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.values().sum()
    }

    /// Every SATB entry recorded so far, oldest first
    pub fn logged(&self, machine: &Machine) -> SimResult<Vec<u64>> {
        let mut all: Vec<u64> = self.completed.iter().flatten().copied().collect();
        let mut current = self.thread.satb_entries(&machine.memory)?;
        current.reverse();
        all.extend(current);
        Ok(all)
    }

    fn slot_address(&self, loc: ValueLocation, machine: &Machine) -> Option<u64> {
        loc.address(self.stubs.isa()).map(|addr| machine.effective_address(&addr))
    }

    fn read(&self, loc: ValueLocation, machine: &mut Machine) -> SimResult<u64> {
        match (loc, self.slot_address(loc, machine)) {
            (ValueLocation::Register(reg), _) => Ok(machine.reg(reg)),
            (ValueLocation::Stack(_), Some(addr)) => Ok(machine.memory.read(addr, Width::W64)?),
            (ValueLocation::Stack(_), None) => Err(SimError::Stub("unaddressable stack slot".to_string())),
        }
    }

    fn write(&self, loc: ValueLocation, value: u64, machine: &mut Machine) -> SimResult<()> {
        match (loc, self.slot_address(loc, machine)) {
            (ValueLocation::Register(reg), _) => machine.set_reg(reg, value),
            (ValueLocation::Stack(_), Some(addr)) => machine.memory.write(addr, Width::W64, value)?,
            (ValueLocation::Stack(_), None) => {
                return Err(SimError::Stub("unaddressable stack slot".to_string()));
            }
        }
        Ok(())
    }

    fn argument(&self, desc: &StubDescriptor, index: usize, machine: &mut Machine) -> SimResult<u64> {
        let loc = desc.argument(index).map_err(|e| SimError::Stub(e.to_string()))?;
        self.read(loc, machine)
    }

    fn dispatch(&mut self, kind: StubKind, machine: &mut Machine) -> SimResult<()> {
        let desc = self.stubs.get(kind).map_err(|e| SimError::Stub(e.to_string()))?.clone();
        *self.calls.entry(kind).or_insert(0) += 1;

        let result = match kind.strength() {
            Some(strength) => Some(self.load_barrier(&desc, strength, machine)?),
            None if kind == StubKind::PreWrite => {
                self.pre_write(&desc, machine)?;
                None
            }
            None => Some(self.verify_oop(&desc, machine)?),
        };

        if !desc.preserves_registers && self.clobber_caller_saved {
            let ret = match desc.convention.return_location() {
                Some(ValueLocation::Register(reg)) => Some(reg),
                _ => None,
            };
            for &reg in self.stubs.isa().caller_saved() {
                if Some(reg) != ret {
                    machine.set_reg(reg, CLOBBER);
                }
            }
        }

        if let Some(value) = result {
            let ret = desc.return_location().map_err(|e| SimError::Stub(e.to_string()))?;
            self.write(ret, value, machine)?;
        }
        Ok(())
    }

    /// Resolve `obj` to its current copy, evacuating it if it sits in the
    /// collection set, and heal the slot it was loaded from
    fn load_barrier(
        &mut self,
        desc: &StubDescriptor,
        strength: ReferenceStrength,
        machine: &mut Machine,
    ) -> SimResult<u64> {
        let obj = self.argument(desc, 0, machine)?;
        let slot = self.argument(desc, 1, machine)?;
        if obj == 0 {
            return Ok(0);
        }

        let state = self.thread.gc_state(&machine.memory)?;
        if strength != ReferenceStrength::Strong
            && state.contains(GcState::WEAK_ROOTS)
            && self.heap.is_unreachable(obj)
        {
            log::trace!("{} load of unreachable {:#x} returns null", strength, obj);
            return Ok(0);
        }

        let resolved = match self.heap.forwardee(obj) {
            Some(to) => to,
            None if state.contains(GcState::HAS_FORWARDED) && self.heap.in_cset(obj) => {
                self.heap.evacuate(obj, &mut machine.memory)?
            }
            None => obj,
        };
        if resolved != obj && slot != 0 {
            self.heal(desc.kind, slot, obj, resolved, machine)?;
        }
        Ok(resolved)
    }

    /// Replace `from` with `to` in `slot` unless another store got there first
    fn heal(&self, kind: StubKind, slot: u64, from: u64, to: u64, machine: &mut Machine) -> SimResult<()> {
        if kind.is_narrow() {
            let encoding = self
                .encoding
                .ok_or_else(|| SimError::Stub("narrow load barrier without compressed oops".to_string()))?;
            let current = machine.memory.read(slot, Width::W32)?;
            if current == encoding.encode(from) as u64 {
                machine.memory.write(slot, Width::W32, encoding.encode(to) as u64)?;
            }
        } else {
            let current = machine.memory.read(slot, Width::W64)?;
            if current == from {
                machine.memory.write(slot, Width::W64, to)?;
            }
        }
        Ok(())
    }

    fn pre_write(&mut self, desc: &StubDescriptor, machine: &mut Machine) -> SimResult<()> {
        let prev = self.argument(desc, 0, machine)?;
        if prev == 0 {
            return Err(SimError::Stub("null previous value".to_string()));
        }
        if self.thread.satb_index(&machine.memory)? == 0 {
            let mut retired = self.thread.satb_entries(&machine.memory)?;
            retired.reverse();
            log::trace!("retiring SATB buffer with {} entries", retired.len());
            self.completed.push(retired);
            self.thread.reset_satb(&mut machine.memory)?;
        }
        self.thread.push_satb(&mut machine.memory, prev)?;
        self.runtime_logged.push(prev);
        Ok(())
    }

    fn verify_oop(&mut self, desc: &StubDescriptor, machine: &mut Machine) -> SimResult<u64> {
        let value = self.argument(desc, 0, machine)?;
        if value != 0 && (!self.heap.contains(value) || value % 8 != 0) {
            return Err(SimError::BadOop(value));
        }
        Ok(value)
    }
}

impl ForeignCallHandler for SimRuntime {
    fn call(&mut self, target: &CallTarget, machine: &mut Machine) -> interp::Result<()> {
        let kind = StubKind::from_id(target.id).ok_or(InterpError::Stub {
            name: target.name,
            message: "unknown runtime stub".to_string(),
        })?;
        self.dispatch(kind, machine).map_err(|err| InterpError::Stub {
            name: target.name,
            message: err.to_string(),
        })
    }
}
