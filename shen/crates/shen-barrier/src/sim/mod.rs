//! Simulated collector runtime
//!
//! Lets emitted barrier code run end to end on the LIR interpreter: a
//! region heap with a collection set, a thread block with an SATB buffer and
//! a card table, and the runtime stubs. Used by the integration tests and by
//! `shent simulate`.
//!
//! # Memory map
//!
//! ```text
//!   0x1000_0000  thread block
//!   0x2000_0000  stack (outgoing stub arguments at sp)
//!   0x3000_0000  SATB buffer
//!   0x4000_0000  card table
//!   cset base + (heap start >> region shift)  collection-set table
//!   0x8_0000_0000  heap
//! ```

pub mod heap;
pub mod runtime;
pub mod thread;

pub use heap::SimHeap;
pub use runtime::{SimRuntime, CLOBBER};
pub use thread::SimThread;

use shen_lir::interp::{ExecStats, InterpError, Interpreter, Machine, Memory};
use shen_lir::{Isa, Program, Width};
use thiserror::Error;

use crate::config::{BarrierConfig, ConfigError};
use crate::gc_state::GcState;
use crate::stubs::RuntimeStubs;

pub const THREAD_BASE: u64 = 0x1000_0000;
pub const STACK_BASE: u64 = 0x2000_0000;
pub const STACK_SIZE: usize = 0x1000;
pub const SATB_BASE: u64 = 0x3000_0000;
pub const CARD_TABLE_BASE: u64 = 0x4000_0000;
pub const HEAP_START: u64 = 0x8_0000_0000;

const THREAD_BLOCK_SIZE: usize = 0x100;

/// Error raised by the simulated runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error(transparent)]
    Interp(#[from] InterpError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("region {0} does not exist")]
    NoSuchRegion(usize),

    #[error("region {region} cannot fit {size} bytes")]
    RegionFull { region: usize, size: u64 },

    #[error("{0:#x} is not an allocated object")]
    NotAnObject(u64),

    #[error("no free region to evacuate {0:#x}")]
    EvacuationFailed(u64),

    #[error("SATB buffer is full")]
    SatbFull,

    /// **When returned:** publishing `EVACUATION` without `HAS_FORWARDED`
    #[error("inconsistent GC state {0}: EVACUATION requires HAS_FORWARDED")]
    InconsistentGcState(GcState),

    /// **When returned:** `verify_oop` saw a value that is not a heap reference
    #[error("bad oop {0:#x}")]
    BadOop(u64),

    #[error("{0}")]
    Stub(String),
}

pub type SimResult<T> = std::result::Result<T, SimError>;

/// Builder for a machine and runtime with every region mapped
#[derive(Debug, Clone)]
pub struct Scenario {
    isa: Isa,
    config: BarrierConfig,
    stubs: RuntimeStubs,
    regions: usize,
    satb_entries: usize,
    step_limit: Option<usize>,
}

impl Scenario {
    pub fn new(isa: Isa, config: BarrierConfig) -> Self {
        Self {
            isa,
            config,
            stubs: RuntimeStubs::stack_slots(isa),
            regions: 4,
            satb_entries: 16,
            step_limit: None,
        }
    }

    pub fn stubs(mut self, stubs: RuntimeStubs) -> Self {
        self.stubs = stubs;
        self
    }

    pub fn regions(mut self, regions: usize) -> Self {
        self.regions = regions;
        self
    }

    /// SATB buffer capacity in entries
    pub fn satb_entries(mut self, entries: usize) -> Self {
        self.satb_entries = entries;
        self
    }

    /// Interpreter step limit per run
    pub fn step_limit(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit);
        self
    }

    pub fn build(self) -> SimResult<SimWorld> {
        self.config.validate()?;
        let heap_layout = &self.config.heap;
        let heap = SimHeap::new(
            HEAP_START,
            self.regions,
            heap_layout.region_size_shift,
            heap_layout.cset_table_base,
        );

        let cards_len = (heap.size() >> heap_layout.card_shift) as usize;
        let card_table = CARD_TABLE_BASE.wrapping_sub(HEAP_START >> heap_layout.card_shift);
        let thread = SimThread::new(
            THREAD_BASE,
            self.config.thread,
            SATB_BASE,
            self.satb_entries,
            card_table,
            (CARD_TABLE_BASE, cards_len),
        );

        let mut memory = Memory::new();
        memory.map("thread", THREAD_BASE, THREAD_BLOCK_SIZE.max(self.config.thread.extent() as usize))?;
        memory.map("stack", STACK_BASE, STACK_SIZE)?;
        memory.map("satb", SATB_BASE, (thread.satb_capacity() as usize).max(8))?;
        memory.map("cards", CARD_TABLE_BASE, cards_len.max(1))?;
        let (cset, cset_len) = heap.cset_table();
        memory.map("cset", cset, cset_len)?;
        memory.map("heap", HEAP_START, heap.size() as usize)?;
        thread.init(&mut memory)?;

        let mut machine = Machine::new(memory);
        machine.set_reg(self.isa.thread_register(), THREAD_BASE);
        machine.set_reg(self.isa.stack_pointer(), STACK_BASE + (STACK_SIZE / 2) as u64);
        if let Some(encoding) = &self.config.compressed_oops {
            machine.set_reg(self.isa.heap_base_register(), encoding.base);
        }

        let interpreter = match self.step_limit {
            Some(limit) => Interpreter::with_step_limit(limit),
            None => Interpreter::new(),
        };
        let runtime = SimRuntime::new(heap, thread, self.stubs, self.config.compressed_oops);
        Ok(SimWorld { isa: self.isa, config: self.config, interpreter, machine, runtime })
    }
}

/// A mutator thread, its heap and the collector runtime
#[derive(Debug, Clone)]
pub struct SimWorld {
    isa: Isa,
    config: BarrierConfig,
    interpreter: Interpreter,
    pub machine: Machine,
    pub runtime: SimRuntime,
}

impl SimWorld {
    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// Execute `program` with the runtime servicing its stub calls
    pub fn run(&mut self, program: &Program) -> SimResult<ExecStats> {
        Ok(self.interpreter.run(program, &mut self.machine, &mut self.runtime)?)
    }

    pub fn gc_state(&self) -> SimResult<GcState> {
        self.runtime.thread.gc_state(&self.machine.memory)
    }

    pub fn set_gc_state(&mut self, state: GcState) -> SimResult<()> {
        self.runtime.thread.set_gc_state(&mut self.machine.memory, state)
    }

    pub fn allocate(&mut self, region: usize, size: u64) -> SimResult<u64> {
        self.runtime.heap.allocate(region, size)
    }

    pub fn add_to_cset(&mut self, region: usize) -> SimResult<()> {
        self.runtime.heap.add_to_cset(region, &mut self.machine.memory)
    }

    /// Width of a reference slot
    pub fn slot_width(&self, narrow: bool) -> Width {
        if narrow {
            Width::W32
        } else {
            Width::W64
        }
    }

    /// Store a reference into a heap slot, encoding it for narrow slots
    pub fn write_ref(&mut self, slot: u64, value: u64, narrow: bool) -> SimResult<()> {
        let raw = match (&self.config.compressed_oops, narrow) {
            (Some(encoding), true) => encoding.encode(value) as u64,
            (None, true) => return Err(SimError::Stub("narrow slot without compressed oops".to_string())),
            (_, false) => value,
        };
        self.machine.memory.poke(slot, self.slot_width(narrow), raw)?;
        Ok(())
    }

    /// Read a reference from a heap slot, decoding narrow slots
    pub fn read_ref(&self, slot: u64, narrow: bool) -> SimResult<u64> {
        let raw = self.machine.memory.peek(slot, self.slot_width(narrow))?;
        match (&self.config.compressed_oops, narrow) {
            (Some(encoding), true) => Ok(encoding.decode(raw as u32)),
            (None, true) => Err(SimError::Stub("narrow slot without compressed oops".to_string())),
            (_, false) => Ok(raw),
        }
    }

    /// SATB buffer contents, newest first
    pub fn satb_entries(&self) -> SimResult<Vec<u64>> {
        self.runtime.thread.satb_entries(&self.machine.memory)
    }

    /// Everything logged so far including retired buffers, oldest first
    pub fn logged(&self) -> SimResult<Vec<u64>> {
        self.runtime.logged(&self.machine)
    }

    pub fn card(&self, addr: u64) -> SimResult<u8> {
        self.runtime.thread.card(&self.machine.memory, addr, self.config.heap.card_shift)
    }
}
