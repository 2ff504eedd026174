//! Per-CPU execution state: the register file, the instruction counter and
//! budget, the fetch fast paths, the atomic reservation and breakpoints.
//!
//! The CPU itself holds no reference to memory; the machine's dispatch loop
//! borrows both sides and drives [`Cpu::fetch`].

use crate::address::Address;
use crate::error::{MachineError, MemoryError};
use crate::memory::Memory;
use crate::page::{Page, PAGE_SIZE};
use crate::registers::Registers;
use hashbrown::HashSet;
use std::ptr::NonNull;

/// Execution cache entry: the most recently fetched-from page, stamped with
/// the memory generation it was resolved under.
struct ExecCache<A> {
    pageno: A,
    page: NonNull<Page>,
    generation: u64,
}

/// A load-reserved reservation, cleared by context switches, exceptions and
/// intervening stores to the granule.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Reservation<A> {
    pub addr: A,
    pub size: u32,
}

pub struct Cpu<A: Address> {
    registers: Registers<A>,
    counter: u64,
    max_counter: u64,
    /// Bounds of the contiguous executable window (see
    /// [`crate::machine::Machine::init_execute_area`]). Empty by default.
    exec_begin: A,
    exec_end: A,
    exec_cache: Option<ExecCache<A>>,
    reservation: Option<Reservation<A>>,
    breakpoints: HashSet<A>,
}

// SAFETY: the execution cache points into the machine's memory and is only
// dereferenced after its generation stamp validates against that same
// memory; a machine moves between threads as a whole.
unsafe impl<A: Address> Send for Cpu<A> {}

impl<A: Address> std::fmt::Debug for Cpu<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("pc", &self.registers.pc())
            .field("counter", &self.counter)
            .field("max_counter", &self.max_counter)
            .finish_non_exhaustive()
    }
}

impl<A: Address> Default for Cpu<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Address> Cpu<A> {
    pub fn new() -> Self {
        Self {
            registers: Registers::default(),
            counter: 0,
            max_counter: 0,
            exec_begin: A::ZERO,
            exec_end: A::ZERO,
            exec_cache: None,
            reservation: None,
            breakpoints: HashSet::new(),
        }
    }

    pub fn registers(&self) -> &Registers<A> {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers<A> {
        &mut self.registers
    }

    pub fn pc(&self) -> A {
        self.registers.pc()
    }

    /// Retired-instruction counter.
    pub fn instruction_counter(&self) -> u64 {
        self.counter
    }

    pub fn set_instruction_counter(&mut self, value: u64) {
        self.counter = value;
    }

    pub fn increment_counter(&mut self, by: u64) {
        self.counter = self.counter.wrapping_add(by);
    }

    /// The instruction budget `simulate` runs against.
    pub fn max_instructions(&self) -> u64 {
        self.max_counter
    }

    pub fn set_max_instructions(&mut self, value: u64) {
        self.max_counter = value;
    }

    /// Sets the program counter. The low bit is cleared, as no instruction
    /// encoding can start on an odd address.
    pub fn jump(&mut self, address: A) {
        *self.registers.pc_mut() = address & !A::ONE;
    }

    /// Sets the program counter, faulting on a misaligned target. The
    /// required alignment is 2 bytes, since the compressed extension is
    /// always decoded.
    pub fn aligned_jump(&mut self, address: A) -> Result<(), MachineError> {
        if address & A::ONE != A::ZERO {
            return Err(MachineError::MisalignedInstruction {
                pc: self.pc().to_u64(),
                target: address.to_u64(),
            });
        }
        *self.registers.pc_mut() = address;
        Ok(())
    }

    /// Reinitializes registers and jumps to `entry`. The execution cache
    /// and reservation are dropped; the counter and budget are kept.
    pub fn reset(&mut self, entry: A, stack_pointer: A) {
        self.registers = Registers::new(entry);
        self.registers
            .set_x(crate::registers::Specifier::SP, stack_pointer);
        self.exec_cache = None;
        self.reservation = None;
    }

    /// A copy of this CPU for a forked machine: registers, counters and
    /// the executable window carry over; caches, the reservation and
    /// breakpoints start fresh.
    pub(crate) fn fork(&self) -> Self {
        Self {
            registers: self.registers.clone(),
            counter: self.counter,
            max_counter: self.max_counter,
            exec_begin: self.exec_begin,
            exec_end: self.exec_end,
            exec_cache: None,
            reservation: None,
            breakpoints: HashSet::new(),
        }
    }

    /// Configures the contiguous executable window for the fetch hot path.
    pub(crate) fn set_exec_window(&mut self, begin: A, end: A) {
        self.exec_begin = begin;
        self.exec_end = end;
        self.exec_cache = None;
    }

    /// Reads the instruction word at the current program counter.
    ///
    /// Returns a full 32-bit word; when the low two bits are not `11` only
    /// the low 16 bits are meaningful (a compressed instruction).
    pub(crate) fn fetch(&mut self, memory: &Memory<A>) -> Result<u32, MachineError> {
        let pc = self.registers.pc();
        if pc >= self.exec_begin && pc < self.exec_end {
            if let Some(segment) = memory.exec_segment() {
                let offset = pc.wrapping_sub(segment.base).to_usize();
                let data = &segment.data;
                if offset + 4 <= data.len() {
                    return Ok(u32::from_le_bytes(
                        data[offset..offset + 4].try_into().expect("4-byte slice"),
                    ));
                }
                if offset + 2 <= data.len() {
                    let low =
                        u16::from_le_bytes(data[offset..offset + 2].try_into().expect("2 bytes"));
                    if !is_long(low) {
                        return Ok(low as u32);
                    }
                    // A 32-bit instruction hanging over the end of the
                    // window: resolve through the paged path instead.
                }
            }
        }
        self.fetch_slowpath(memory, pc)
    }

    /// Paged fetch: resolve the executable page through the per-CPU
    /// execution cache, then read the (possibly page-straddling) word.
    fn fetch_slowpath(&mut self, memory: &Memory<A>, pc: A) -> Result<u32, MachineError> {
        let pageno = Memory::<A>::page_number(pc);
        let page = self.exec_page(memory, pageno, pc)?;
        let data = page.data().ok_or(MachineError::ProtectionFault {
            pc: pc.to_u64(),
            address: pc.to_u64(),
        })?;
        let offset = Memory::<A>::page_offset(pc);
        if offset + 4 <= PAGE_SIZE {
            return Ok(u32::from_le_bytes(
                data[offset..offset + 4].try_into().expect("4-byte slice"),
            ));
        }
        // A jump target is always 2-byte aligned, so exactly 16 bits remain
        // on this page.
        let low = u16::from_le_bytes(data[offset..offset + 2].try_into().expect("2 bytes"));
        if !is_long(low) {
            return Ok(low as u32);
        }
        // A 32-bit instruction straddling a page border: the upper parcel
        // is the first halfword of the next page.
        let next = self.exec_page(memory, pageno.wrapping_add(A::ONE), pc)?;
        let next_data = next.data().ok_or(MachineError::ProtectionFault {
            pc: pc.to_u64(),
            address: pc.to_u64(),
        })?;
        let high = u16::from_le_bytes(next_data[..2].try_into().expect("2 bytes"));
        Ok((low as u32) | (high as u32) << 16)
    }

    /// Resolves an executable page, preferring the execution cache. An
    /// entry is only trusted if its generation stamp matches the memory's,
    /// so structural page table changes invalidate it implicitly.
    fn exec_page<'a>(
        &mut self,
        memory: &'a Memory<A>,
        pageno: A,
        pc: A,
    ) -> Result<&'a Page, MachineError> {
        let generation = memory.generation();
        if let Some(entry) = &self.exec_cache {
            if entry.pageno == pageno && entry.generation == generation {
                // SAFETY: a matching generation stamp means no structural
                // change happened since this pointer was resolved.
                return Ok(unsafe { &*entry.page.as_ptr() });
            }
        }
        let page = memory.get_exec_pageno(pageno).map_err(|err| match err {
            MemoryError::ProtectionFault { address } => MachineError::ProtectionFault {
                pc: pc.to_u64(),
                address,
            },
            other => MachineError::from_memory(other, pc.to_u64()),
        })?;
        if !page.attr.exec {
            return Err(MachineError::ProtectionFault {
                pc: pc.to_u64(),
                address: pc.to_u64(),
            });
        }
        self.exec_cache = Some(ExecCache {
            pageno,
            page: NonNull::from(page),
            generation,
        });
        Ok(page)
    }

    /// Drops the execution cache entry (used on reset and context switch).
    pub(crate) fn invalidate_exec_cache(&mut self) {
        self.exec_cache = None;
    }

    //
    // Atomic reservations
    //

    pub(crate) fn load_reserve(&mut self, addr: A, size: u32) {
        self.reservation = Some(Reservation { addr, size });
    }

    /// `true` if a matching reservation was held; always clears it.
    pub(crate) fn store_conditional(&mut self, addr: A, size: u32) -> bool {
        let held = matches!(
            self.reservation,
            Some(Reservation { addr: a, size: s }) if a == addr && s == size
        );
        self.reservation = None;
        held
    }

    pub(crate) fn clear_reservation(&mut self) {
        self.reservation = None;
    }

    /// Called on every ordinary store: an intervening store to the reserved
    /// granule defeats a later store-conditional.
    pub(crate) fn store_touches_reservation(&mut self, addr: A, len: u32) {
        if let Some(res) = self.reservation {
            let res_end = res.addr.wrapping_add(A::from_u64(res.size as u64));
            let end = addr.wrapping_add(A::from_u64(len as u64));
            if addr < res_end && res.addr < end {
                self.reservation = None;
            }
        }
    }

    //
    // Breakpoints
    //

    pub fn set_breakpoint(&mut self, address: A) {
        self.breakpoints.insert(address);
    }

    pub fn clear_breakpoint(&mut self, address: A) {
        self.breakpoints.remove(&address);
    }

    pub fn has_breakpoints(&self) -> bool {
        !self.breakpoints.is_empty()
    }

    pub(crate) fn breakpoint_at(&self, address: A) -> bool {
        self.breakpoints.contains(&address)
    }
}

/// `true` if a 16-bit parcel starts a 32-bit instruction.
fn is_long(parcel: u16) -> bool {
    parcel & 0b11 == 0b11
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageAttributes;

    fn exec_attr() -> PageAttributes {
        PageAttributes {
            read: true,
            write: false,
            exec: true,
            ..PageAttributes::default()
        }
    }

    fn load_code(memory: &mut Memory<u64>, base: u64, code: &[u8]) {
        memory.write_bytes_unchecked(base, code).unwrap();
        memory
            .set_page_attr(base, code.len().max(1), exec_attr())
            .unwrap();
    }

    #[test]
    fn test_fetch_requires_exec_permission() {
        let mut memory: Memory<u64> = Memory::new(crate::memory::DEFAULT_MEMORY_MAX);
        let mut cpu = Cpu::new();
        memory.write_u32(0x1000, 0x0000_0013).unwrap(); // nop, but not executable
        cpu.jump(0x1000);
        assert!(matches!(
            cpu.fetch(&memory),
            Err(MachineError::ProtectionFault { .. })
        ));
    }

    #[test]
    fn test_fetch_from_paged_memory() {
        let mut memory = Memory::new(crate::memory::DEFAULT_MEMORY_MAX);
        let mut cpu = Cpu::new();
        load_code(&mut memory, 0x1000, &0x02A0_0513u32.to_le_bytes()); // li a0, 42
        cpu.jump(0x1000);
        assert_eq!(cpu.fetch(&memory).unwrap(), 0x02A0_0513);
        // Second fetch exercises the execution cache hit path.
        assert_eq!(cpu.fetch(&memory).unwrap(), 0x02A0_0513);
    }

    #[test]
    fn test_fetch_across_page_boundary() {
        let mut memory: Memory<u64> = Memory::new(crate::memory::DEFAULT_MEMORY_MAX);
        let mut cpu = Cpu::new();
        // A 32-bit instruction whose low parcel is the last halfword of
        // page 1 and whose high parcel starts page 2.
        let raw: u32 = 0x02A0_0513;
        memory
            .write_bytes_unchecked(0x1FFE, &raw.to_le_bytes())
            .unwrap();
        memory.set_page_attr(0x1000, 2 * PAGE_SIZE, exec_attr()).unwrap();
        cpu.jump(0x1FFE);
        assert_eq!(cpu.fetch(&memory).unwrap(), raw);
    }

    #[test]
    fn test_exec_cache_invalidated_by_structural_change() {
        let mut memory = Memory::new(crate::memory::DEFAULT_MEMORY_MAX);
        let mut cpu = Cpu::new();
        load_code(&mut memory, 0x1000, &0x0000_0013u32.to_le_bytes());
        cpu.jump(0x1000);
        cpu.fetch(&memory).unwrap();
        // Freeing the page bumps the generation; the stale cache entry must
        // not be trusted.
        memory.free_pages(0x1000, PAGE_SIZE);
        assert!(matches!(
            cpu.fetch(&memory),
            Err(MachineError::ProtectionFault { .. })
        ));
    }

    #[test]
    fn test_reservation_lifecycle() {
        let mut cpu: Cpu<u64> = Cpu::new();
        cpu.load_reserve(0x100, 4);
        assert!(cpu.store_conditional(0x100, 4));
        // The reservation is consumed.
        assert!(!cpu.store_conditional(0x100, 4));

        cpu.load_reserve(0x100, 4);
        cpu.store_touches_reservation(0x102, 1);
        assert!(!cpu.store_conditional(0x100, 4));

        cpu.load_reserve(0x100, 4);
        cpu.store_touches_reservation(0x104, 4);
        assert!(cpu.store_conditional(0x100, 4));
    }

    #[test]
    fn test_aligned_jump() {
        let mut cpu: Cpu<u32> = Cpu::new();
        assert!(cpu.aligned_jump(0x1002).is_ok());
        assert!(matches!(
            cpu.aligned_jump(0x1001),
            Err(MachineError::MisalignedInstruction { .. })
        ));
    }
}
