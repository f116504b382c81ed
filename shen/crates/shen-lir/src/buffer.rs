//! Code buffers, basic blocks and assembled programs
//!
//! A [`CodeBuffer`] holds the main instruction stream of a method plus any
//! number of out-of-line blocks. Out-of-line blocks are created eagerly,
//! start with their own entry label and are laid out after the main stream
//! when the buffer is finished:
//!
//! ```text
//!   main:      ... fast path ...  jcc L1 ... L0(done): ...
//!   L1 (mid):  ... jcc L2 ... jmp L0
//!   L2 (slow): ... call stub ... jmp L0
//! ```

use std::fmt;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;

use crate::error::{LirError, Result};
use crate::lir::{Instruction, Label};
use crate::reg::Isa;
use crate::{aarch64, amd64};

/// Index of a block inside a [`CodeBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub const MAIN: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Main,
    /// Out-of-line, call-free check between fast and slow path
    MidPath,
    /// Out-of-line runtime call
    SlowPath,
}

impl BlockKind {
    pub fn is_out_of_line(self) -> bool {
        self != BlockKind::Main
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockKind::Main => "main",
            BlockKind::MidPath => "mid path",
            BlockKind::SlowPath => "slow path",
        })
    }
}

/// Basic block under construction
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    pub label: Label,
    instructions: Vec<Instruction>,
}

impl Block {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

/// Instruction stream for one compilation unit
#[derive(Debug)]
pub struct CodeBuffer {
    isa: Isa,
    blocks: Vec<Block>,
    current: BlockId,
    next_label: u32,
    bound: FxHashSet<Label>,
}

impl CodeBuffer {
    pub fn new(isa: Isa) -> Self {
        let mut buf = Self {
            isa,
            blocks: Vec::new(),
            current: BlockId::MAIN,
            next_label: 0,
            bound: FxHashSet::default(),
        };
        let label = buf.new_label();
        buf.bound.insert(label);
        buf.blocks.push(Block {
            id: BlockId::MAIN,
            kind: BlockKind::Main,
            label,
            instructions: vec![Instruction::Label(label)],
        });
        buf
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind `label` at the current position of the current block
    pub fn bind(&mut self, label: Label) -> Result<()> {
        if !self.bound.insert(label) {
            return Err(LirError::LabelRebound(label));
        }
        self.current_mut().instructions.push(Instruction::Label(label));
        Ok(())
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.bound.contains(&label)
    }

    /// Append `inst` to the current block after checking it is encodable
    pub fn emit(&mut self, inst: Instruction) -> Result<()> {
        if let Instruction::Label(label) = inst {
            return self.bind(label);
        }
        match self.isa {
            Isa::Amd64 => amd64::check_encodable(&inst)?,
            Isa::AArch64 => aarch64::check_encodable(&inst)?,
        }
        log::trace!("{}: emit {:?}", self.isa, inst);
        self.current_mut().instructions.push(inst);
        Ok(())
    }

    /// Create an out-of-line block whose entry label is bound at its start
    pub fn new_block(&mut self, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let label = self.new_label();
        self.bound.insert(label);
        self.blocks.push(Block {
            id,
            kind,
            label,
            instructions: vec![Instruction::Label(label)],
        });
        id
    }

    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks.get(id.index()).ok_or(LirError::UnknownBlock(id.0))
    }

    pub fn block_label(&self, id: BlockId) -> Result<Label> {
        self.block(id).map(|b| b.label)
    }

    /// Make `id` the block that receives emitted instructions; returns the
    /// previously current block
    pub fn switch_to(&mut self, id: BlockId) -> Result<BlockId> {
        self.block(id)?;
        Ok(std::mem::replace(&mut self.current, id))
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn out_of_line_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.kind.is_out_of_line()).count()
    }

    /// Real instructions emitted so far, labels excluded
    pub fn instruction_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| !matches!(i, Instruction::Label(_)))
            .count()
    }

    fn current_mut(&mut self) -> &mut Block {
        let index = self.current.index();
        &mut self.blocks[index]
    }

    /// Lay out the main block followed by every out-of-line block and
    /// resolve labels
    pub fn finish(self) -> Result<Program> {
        let mut code = Vec::with_capacity(self.instruction_count() + self.blocks.len());
        let mut labels = IndexMap::new();
        let mut ranges = Vec::with_capacity(self.blocks.len());

        for block in self.blocks {
            if block.kind.is_out_of_line()
                && !block.instructions.last().is_some_and(Instruction::is_unconditional_transfer)
            {
                return Err(LirError::FallThrough(block.label));
            }
            let start = code.len();
            for inst in block.instructions {
                if let Instruction::Label(label) = inst {
                    labels.insert(label, code.len());
                }
                code.push(inst);
            }
            ranges.push(BlockRange { kind: block.kind, label: block.label, start, end: code.len() });
        }

        for inst in &code {
            if let Some(target) = inst.branch_target() {
                if !labels.contains_key(&target) {
                    return Err(LirError::UnboundLabel(target));
                }
            }
        }

        Ok(Program { isa: self.isa, code, labels, blocks: ranges })
    }
}

/// Position of a block inside an assembled [`Program`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub kind: BlockKind,
    pub label: Label,
    pub start: usize,
    pub end: usize,
}

impl BlockRange {
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.start && pc < self.end
    }
}

/// Laid-out code with resolved labels
#[derive(Debug, Clone)]
pub struct Program {
    isa: Isa,
    code: Vec<Instruction>,
    labels: IndexMap<Label, usize>,
    blocks: Vec<BlockRange>,
}

impl Program {
    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    pub fn blocks(&self) -> &[BlockRange] {
        &self.blocks
    }

    /// Block containing instruction `pc`
    pub fn block_at(&self, pc: usize) -> Option<&BlockRange> {
        self.blocks.iter().find(|b| b.contains(pc))
    }

    pub fn main_block(&self) -> &BlockRange {
        &self.blocks[0]
    }

    /// Instructions of the main block, labels excluded
    pub fn main_instructions(&self) -> impl Iterator<Item = &Instruction> {
        let main = self.main_block();
        self.code[main.start..main.end]
            .iter()
            .filter(|i| !matches!(i, Instruction::Label(_)))
    }

    pub fn out_of_line_blocks(&self) -> impl Iterator<Item = &BlockRange> {
        self.blocks.iter().filter(|b| b.kind.is_out_of_line())
    }

    pub fn count(&self, pred: impl Fn(&Instruction) -> bool) -> usize {
        self.code.iter().filter(|i| pred(i)).count()
    }

    pub fn listing(&self) -> Listing<'_> {
        Listing(self)
    }
}

/// Assembly listing of a [`Program`]
pub struct Listing<'a>(&'a Program);

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.0;
        for (pc, inst) in program.code.iter().enumerate() {
            if let Some(block) = program.blocks.iter().find(|b| b.start == pc) {
                if block.kind.is_out_of_line() {
                    writeln!(f, "    ; {}", block.kind)?;
                }
            }
            match program.isa {
                Isa::Amd64 => amd64::format_instruction(f, inst)?,
                Isa::AArch64 => aarch64::format_instruction(f, inst)?,
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
