//! Region-based heap with a collection set and forwarding table

use rustc_hash::{FxHashMap, FxHashSet};
use shen_lir::interp::Memory;
use shen_lir::Width;

use super::{SimError, SimResult};

/// Simulated heap
///
/// Regions are `1 << region_shift` bytes, laid out contiguously from
/// `start`. Objects are bump allocated per region. The collection-set table
/// lives in machine memory so emitted code can consult it; every other piece
/// of collector state is host-side.
#[derive(Debug, Clone)]
pub struct SimHeap {
    start: u64,
    region_shift: u8,
    tops: Vec<u64>,
    /// Physical address of the cset byte of region 0
    cset_table: u64,
    cset: FxHashSet<usize>,
    forwarding: FxHashMap<u64, u64>,
    unreachable: FxHashSet<u64>,
    objects: FxHashMap<u64, u64>,
    evacuated: usize,
}

impl SimHeap {
    pub fn new(start: u64, region_count: usize, region_shift: u8, cset_table_base: u64) -> Self {
        let region_size = 1u64 << region_shift;
        Self {
            start,
            region_shift,
            tops: (0..region_count as u64).map(|i| start + i * region_size).collect(),
            cset_table: cset_table_base + (start >> region_shift),
            cset: FxHashSet::default(),
            forwarding: FxHashMap::default(),
            unreachable: FxHashSet::default(),
            objects: FxHashMap::default(),
            evacuated: 0,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.size()
    }

    pub fn size(&self) -> u64 {
        (self.tops.len() as u64) << self.region_shift
    }

    pub fn region_count(&self) -> usize {
        self.tops.len()
    }

    pub fn region_size(&self) -> u64 {
        1 << self.region_shift
    }

    /// Physical address and length of the cset table slice covering the heap
    pub fn cset_table(&self) -> (u64, usize) {
        (self.cset_table, self.tops.len())
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn region_of(&self, addr: u64) -> Option<usize> {
        self.contains(addr).then(|| ((addr - self.start) >> self.region_shift) as usize)
    }

    fn region_end(&self, region: usize) -> u64 {
        self.start + ((region as u64 + 1) << self.region_shift)
    }

    /// Bump allocate `size` bytes in `region`
    pub fn allocate(&mut self, region: usize, size: u64) -> SimResult<u64> {
        let size = (size.max(8) + 7) & !7;
        let end = self.region_end(region);
        let top = self.tops.get_mut(region).ok_or(SimError::NoSuchRegion(region))?;
        if *top + size > end {
            return Err(SimError::RegionFull { region, size });
        }
        let obj = *top;
        *top += size;
        self.objects.insert(obj, size);
        Ok(obj)
    }

    pub fn object_size(&self, obj: u64) -> Option<u64> {
        self.objects.get(&obj).copied()
    }

    /// Add `region` to the collection set
    pub fn add_to_cset(&mut self, region: usize, memory: &mut Memory) -> SimResult<()> {
        if region >= self.tops.len() {
            return Err(SimError::NoSuchRegion(region));
        }
        self.cset.insert(region);
        memory.poke(self.cset_table + region as u64, Width::W8, 1)?;
        Ok(())
    }

    pub fn clear_cset(&mut self, memory: &mut Memory) -> SimResult<()> {
        for region in self.cset.drain() {
            memory.poke(self.cset_table + region as u64, Width::W8, 0)?;
        }
        Ok(())
    }

    pub fn in_cset(&self, addr: u64) -> bool {
        self.region_of(addr).is_some_and(|r| self.cset.contains(&r))
    }

    pub fn forwardee(&self, obj: u64) -> Option<u64> {
        self.forwarding.get(&obj).copied()
    }

    /// Install a forwarding entry from `from` to `to`
    pub fn forward(&mut self, from: u64, to: u64) {
        self.forwarding.insert(from, to);
    }

    /// Copy `obj` into the first region outside the collection set and
    /// forward it there
    pub fn evacuate(&mut self, obj: u64, memory: &mut Memory) -> SimResult<u64> {
        if let Some(to) = self.forwardee(obj) {
            return Ok(to);
        }
        let size = self.object_size(obj).ok_or(SimError::NotAnObject(obj))?;
        let target = (0..self.tops.len())
            .filter(|r| !self.cset.contains(r))
            .find(|&r| self.tops[r] + size <= self.region_end(r))
            .ok_or(SimError::EvacuationFailed(obj))?;
        let copy = self.allocate(target, size)?;
        for offset in (0..size).step_by(8) {
            let word = memory.peek(obj + offset, Width::W64)?;
            memory.poke(copy + offset, Width::W64, word)?;
        }
        if self.unreachable.contains(&obj) {
            self.unreachable.insert(copy);
        }
        self.forward(obj, copy);
        self.evacuated += 1;
        log::trace!("evacuated {:#x} -> {:#x} ({} bytes)", obj, copy, size);
        Ok(copy)
    }

    pub fn evacuated(&self) -> usize {
        self.evacuated
    }

    /// Mark `obj` as not strongly reachable
    pub fn mark_unreachable(&mut self, obj: u64) {
        self.unreachable.insert(obj);
    }

    pub fn is_unreachable(&self, obj: u64) -> bool {
        self.unreachable.contains(&obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = 0x8_0000_0000;

    fn heap_and_memory() -> (SimHeap, Memory) {
        let heap = SimHeap::new(START, 4, 16, 0x5fff_c000);
        let mut memory = Memory::new();
        memory.map("heap", START, heap.size() as usize).unwrap();
        let (table, len) = heap.cset_table();
        memory.map("cset", table, len).unwrap();
        (heap, memory)
    }

    #[test]
    fn test_allocate_and_regions() {
        let (mut heap, _) = heap_and_memory();
        let a = heap.allocate(1, 12).unwrap();
        let b = heap.allocate(1, 16).unwrap();
        assert_eq!(a, START + 0x1_0000);
        assert_eq!(b, a + 16);
        assert_eq!(heap.region_of(b), Some(1));
        assert_eq!(heap.region_of(heap.end()), None);
        assert!(matches!(heap.allocate(9, 8), Err(SimError::NoSuchRegion(9))));
        assert!(matches!(heap.allocate(0, 1 << 20), Err(SimError::RegionFull { .. })));
    }

    #[test]
    fn test_cset_table_in_memory() {
        let (mut heap, mut memory) = heap_and_memory();
        heap.add_to_cset(2, &mut memory).unwrap();
        let (table, _) = heap.cset_table();
        assert_eq!(table, 0x5fff_c000 + (START >> 16));
        assert_eq!(memory.peek(table + 2, Width::W8).unwrap(), 1);
        assert!(heap.in_cset(START + 2 * 0x1_0000 + 8));
        heap.clear_cset(&mut memory).unwrap();
        assert_eq!(memory.peek(table + 2, Width::W8).unwrap(), 0);
    }

    #[test]
    fn test_evacuate_copies_and_forwards_once() {
        let (mut heap, mut memory) = heap_and_memory();
        let obj = heap.allocate(0, 16).unwrap();
        memory.poke(obj + 8, Width::W64, 0x1234).unwrap();
        heap.add_to_cset(0, &mut memory).unwrap();

        let copy = heap.evacuate(obj, &mut memory).unwrap();
        assert_eq!(heap.region_of(copy), Some(1));
        assert_eq!(memory.peek(copy + 8, Width::W64).unwrap(), 0x1234);
        assert_eq!(heap.evacuate(obj, &mut memory).unwrap(), copy);
        assert_eq!(heap.evacuated(), 1);
    }
}
