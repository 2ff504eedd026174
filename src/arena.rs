//! The guest heap arena.
//!
//! A first-fit allocator over a span of the guest address space, used to
//! back guest `malloc` and thread-call stacks. Chunk metadata lives on the
//! host side: the emulator can inspect, account and serialize the heap
//! without touching guest memory.
//!
//! Chunks form a doubly-linked list covering the arena contiguously, in
//! address order. Links are indices into a slot vector that only ever
//! grows, with freed slots recycled through a free-slot stack, so a chunk's
//! slot stays stable for the arena's lifetime.

use crate::address::Address;
use crate::error::MachineError;
use crate::machine::Machine;
use log::trace;
use thiserror::Error;

/// Allocations are aligned to this many bytes, and never smaller than it.
const MIN_ALLOC: u64 = 8;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ArenaError {
    /// `free` or `size` was called with a pointer that is not the start of
    /// a live allocation.
    #[error("no allocation at guest pointer {pointer:#x}")]
    UnknownPointer { pointer: u64 },
}

/// Slot index of a chunk. The base chunk always occupies slot 0.
type Slot = u32;

#[derive(Debug, Clone, Copy)]
struct Chunk<A> {
    next: Option<Slot>,
    prev: Option<Slot>,
    size: u64,
    free: bool,
    /// Guest address of the first byte of this chunk's span.
    data: A,
}

/// A separate-address-space heap allocator.
#[derive(Debug, Clone)]
pub struct Arena<A: Address> {
    chunks: Vec<Chunk<A>>,
    free_slots: Vec<Slot>,
    base: A,
    end: A,
}

impl<A: Address> Arena<A> {
    /// Creates an arena managing the guest range `[base, end)`.
    pub fn new(base: A, end: A) -> Self {
        let base_chunk = Chunk {
            next: None,
            prev: None,
            size: end.wrapping_sub(base).to_u64(),
            free: true,
            data: base,
        };
        Self {
            chunks: vec![base_chunk],
            free_slots: Vec::new(),
            base,
            end,
        }
    }

    pub fn base(&self) -> A {
        self.base
    }

    pub fn end(&self) -> A {
        self.end
    }

    /// Allocates `size` bytes, returning the guest address, or `None` when
    /// no free chunk is large enough. The returned address is aligned to 8
    /// bytes.
    pub fn malloc(&mut self, size: u64) -> Option<A> {
        let length = word_align(size).max(MIN_ALLOC);
        let slot = self.find_free(length)?;
        let remainder = self.chunks[slot as usize].size - length;
        if remainder > 0 {
            self.split_after(slot, length);
        }
        let chunk = &mut self.chunks[slot as usize];
        chunk.free = false;
        trace!("arena malloc({size}) = {:#x}", chunk.data);
        Some(chunk.data)
    }

    /// The allocation size of the live chunk starting at `pointer`, or 0
    /// for anything else.
    pub fn size(&self, pointer: A) -> u64 {
        match self.find_allocation(pointer) {
            Some(slot) => self.chunks[slot as usize].size,
            None => 0,
        }
    }

    /// Frees the allocation starting at `pointer`, coalescing with free
    /// neighbors in both directions.
    pub fn free(&mut self, pointer: A) -> Result<(), ArenaError> {
        let mut slot = self
            .find_allocation(pointer)
            .ok_or(ArenaError::UnknownPointer {
                pointer: pointer.to_u64(),
            })?;
        trace!("arena free({pointer:#x})");
        self.chunks[slot as usize].free = true;
        if let Some(next) = self.chunks[slot as usize].next {
            if self.chunks[next as usize].free {
                self.merge_next(slot);
            }
        }
        if let Some(prev) = self.chunks[slot as usize].prev {
            if self.chunks[prev as usize].free {
                slot = prev;
                self.merge_next(slot);
            }
        }
        Ok(())
    }

    /// Total bytes in free chunks.
    pub fn bytes_free(&self) -> u64 {
        self.walk().filter(|c| c.free).map(|c| c.size).sum()
    }

    /// Total bytes in live allocations.
    pub fn bytes_used(&self) -> u64 {
        self.walk().filter(|c| !c.free).map(|c| c.size).sum()
    }

    /// Number of chunks in the list (free and used).
    pub fn chunks_used(&self) -> usize {
        self.chunks.len() - self.free_slots.len()
    }

    /// Deep-copies the chunk topology into `dest`, replacing its state.
    /// Used when forking a machine to hand the child an identical heap.
    pub fn transfer_to(&self, dest: &mut Self) {
        dest.base = self.base;
        dest.end = self.end;
        dest.chunks.clear();
        dest.free_slots.clear();
        let mut src = Some(0 as Slot);
        let mut prev: Option<Slot> = None;
        while let Some(slot) = src {
            let chunk = &self.chunks[slot as usize];
            let new_slot = dest.chunks.len() as Slot;
            dest.chunks.push(Chunk {
                next: None,
                prev,
                size: chunk.size,
                free: chunk.free,
                data: chunk.data,
            });
            if let Some(prev) = prev {
                dest.chunks[prev as usize].next = Some(new_slot);
            }
            prev = Some(new_slot);
            src = chunk.next;
        }
    }

    /// First-fit scan from the base chunk.
    fn find_free(&self, size: u64) -> Option<Slot> {
        let mut cursor = Some(0 as Slot);
        while let Some(slot) = cursor {
            let chunk = &self.chunks[slot as usize];
            if chunk.free && chunk.size >= size {
                return Some(slot);
            }
            cursor = chunk.next;
        }
        None
    }

    /// Finds the live chunk whose span starts exactly at `pointer`.
    fn find_allocation(&self, pointer: A) -> Option<Slot> {
        let mut cursor = Some(0 as Slot);
        while let Some(slot) = cursor {
            let chunk = &self.chunks[slot as usize];
            if !chunk.free && chunk.data == pointer {
                return Some(slot);
            }
            cursor = chunk.next;
        }
        None
    }

    /// Shrinks `slot` to `size` and inserts the remainder after it as a
    /// free chunk.
    fn split_after(&mut self, slot: Slot, size: u64) {
        let (old_next, remainder, data) = {
            let chunk = &self.chunks[slot as usize];
            (chunk.next, chunk.size - size, chunk.data)
        };
        let new_slot = self.new_slot(Chunk {
            next: old_next,
            prev: Some(slot),
            size: remainder,
            free: true,
            data: data.wrapping_add(A::from_u64(size)),
        });
        if let Some(next) = old_next {
            self.chunks[next as usize].prev = Some(new_slot);
        }
        let chunk = &mut self.chunks[slot as usize];
        chunk.next = Some(new_slot);
        chunk.size = size;
    }

    /// Merges `slot`'s successor into `slot`, recycling the successor's
    /// slot.
    fn merge_next(&mut self, slot: Slot) {
        let next = self.chunks[slot as usize].next.expect("has a successor");
        let (next_next, next_size) = {
            let chunk = &self.chunks[next as usize];
            (chunk.next, chunk.size)
        };
        {
            let chunk = &mut self.chunks[slot as usize];
            chunk.size += next_size;
            chunk.next = next_next;
        }
        if let Some(nn) = next_next {
            self.chunks[nn as usize].prev = Some(slot);
        }
        self.free_slots.push(next);
    }

    fn new_slot(&mut self, chunk: Chunk<A>) -> Slot {
        match self.free_slots.pop() {
            Some(slot) => {
                self.chunks[slot as usize] = chunk;
                slot
            }
            None => {
                let slot = self.chunks.len() as Slot;
                self.chunks.push(chunk);
                slot
            }
        }
    }

    /// Iterates the chunk list in address order.
    fn walk(&self) -> impl Iterator<Item = &Chunk<A>> {
        ChunkWalk {
            arena: self,
            cursor: Some(0),
        }
    }
}

struct ChunkWalk<'a, A: Address> {
    arena: &'a Arena<A>,
    cursor: Option<Slot>,
}

impl<'a, A: Address> Iterator for ChunkWalk<'a, A> {
    type Item = &'a Chunk<A>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let chunk = &self.arena.chunks[slot as usize];
        self.cursor = chunk.next;
        Some(chunk)
    }
}

/// Rounds `size` up to the allocation alignment.
fn word_align(size: u64) -> u64 {
    (size + (MIN_ALLOC - 1)) & !(MIN_ALLOC - 1)
}

impl<A: Address> Machine<A> {
    /// Creates the arena over `[base, base + size)` and installs the
    /// accelerated heap system calls at `syscall_base`:
    ///
    /// | offset | call |
    /// |--------|------|
    /// | +0 | `malloc(size)` |
    /// | +1 | `calloc(count, size)` |
    /// | +2 | `realloc(ptr, size)` |
    /// | +3 | `free(ptr)` |
    /// | +4 | `meminfo(dst)` |
    pub fn setup_native_heap(&mut self, syscall_base: usize, base: A, size: u64) {
        self.arena = Some(Arena::new(base, base.wrapping_add(A::from_u64(size))));
        self.install_syscall_handler(syscall_base, Self::sys_malloc);
        self.install_syscall_handler(syscall_base + 1, Self::sys_calloc);
        self.install_syscall_handler(syscall_base + 2, Self::sys_realloc);
        self.install_syscall_handler(syscall_base + 3, Self::sys_free);
        self.install_syscall_handler(syscall_base + 4, Self::sys_meminfo);
    }

    /// Installs the accelerated guest memory system calls at
    /// `syscall_base`: `memcpy`, `memset`, `memmove`, `memcmp`, and
    /// `strlen`/`strncmp` at +5/+6. Each bills its byte count against the
    /// instruction budget.
    pub fn setup_native_memory(&mut self, syscall_base: usize) {
        self.install_syscall_handler(syscall_base, Self::sys_memcpy);
        self.install_syscall_handler(syscall_base + 1, Self::sys_memset);
        self.install_syscall_handler(syscall_base + 2, Self::sys_memmove);
        self.install_syscall_handler(syscall_base + 3, Self::sys_memcmp);
        self.install_syscall_handler(syscall_base + 5, Self::sys_strlen);
        self.install_syscall_handler(syscall_base + 6, Self::sys_strncmp);
    }

    fn sys_malloc(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let size = machine.sysarg(0).to_u64();
        let data = machine.require_arena()?.malloc(size).unwrap_or(A::ZERO);
        trace!("malloc({size}) = {:#x}", data.to_u64());
        machine.set_result(data);
        Ok(())
    }

    fn sys_calloc(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let count = machine.sysarg(0).to_u64();
        let size = machine.sysarg(1).to_u64();
        let total = count.saturating_mul(size);
        let data = machine.require_arena()?.malloc(total).unwrap_or(A::ZERO);
        if data != A::ZERO {
            let pc = machine.cpu.pc().to_u64();
            machine
                .memory
                .memset(data, 0, total as usize)
                .map_err(|err| MachineError::from_memory(err, pc))?;
        }
        trace!("calloc({count}, {size}) = {:#x}", data.to_u64());
        machine.set_result(data);
        Ok(())
    }

    /// Shrinking reallocations are served in place; growing ones free
    /// first in the hope of getting a coalesced chunk back, then copy.
    fn sys_realloc(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let src = machine.sysarg(0);
        let new_len = machine.sysarg(1).to_u64();
        if src == A::ZERO {
            let data = machine.require_arena()?.malloc(new_len).unwrap_or(A::ZERO);
            machine.set_result(data);
            return Ok(());
        }
        let src_len = machine.require_arena()?.size(src);
        if src_len == 0 {
            machine.set_result(A::ZERO);
            return Ok(());
        }
        if src_len >= new_len {
            machine.set_result(src);
            return Ok(());
        }
        let arena = machine.require_arena()?;
        let _ = arena.free(src);
        let data = arena.malloc(new_len);
        match data {
            None => {
                // Re-establish the old allocation and report failure.
                let _ = machine.require_arena()?.malloc(src_len);
                machine.set_result(A::ZERO);
            }
            Some(data) => {
                if data != src {
                    let pc = machine.cpu.pc().to_u64();
                    machine
                        .memory
                        .memcpy_within(data, src, src_len as usize)
                        .map_err(|err| MachineError::from_memory(err, pc))?;
                }
                machine.set_result(data);
            }
        }
        Ok(())
    }

    fn sys_free(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let ptr = machine.sysarg(0);
        if ptr == A::ZERO {
            machine.set_result(A::ZERO);
            return Ok(());
        }
        match machine.require_arena()?.free(ptr) {
            Ok(()) => machine.set_result(A::ZERO),
            Err(_) => machine.set_result_i64(-1),
        }
        Ok(())
    }

    /// Writes `{bytes_free, bytes_used, chunks_used}` as three 32-bit
    /// words to the destination pointer.
    fn sys_meminfo(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let dst = machine.sysarg(0);
        if dst == A::ZERO {
            machine.set_result_i64(-1);
            return Ok(());
        }
        let (bytes_free, bytes_used, chunks_used) = {
            let arena = machine.require_arena()?;
            (arena.bytes_free(), arena.bytes_used(), arena.chunks_used())
        };
        let mut info = Vec::with_capacity(12);
        info.extend_from_slice(&(bytes_free as u32).to_le_bytes());
        info.extend_from_slice(&(bytes_used as u32).to_le_bytes());
        info.extend_from_slice(&(chunks_used as u32).to_le_bytes());
        let pc = machine.cpu.pc().to_u64();
        machine
            .memory
            .write_bytes(dst, &info)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        machine.set_result(A::ZERO);
        Ok(())
    }

    fn sys_memcpy(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let dst = machine.sysarg(0);
        let src = machine.sysarg(1);
        let len = machine.sysarg(2).to_u64();
        let pc = machine.cpu.pc().to_u64();
        machine
            .memory
            .memcpy_within(dst, src, len as usize)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        machine.penalize(2 * len);
        machine.set_result(dst);
        Ok(())
    }

    fn sys_memset(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let dst = machine.sysarg(0);
        let value = machine.sysarg(1).to_u32() as u8;
        let len = machine.sysarg(2).to_u64();
        let pc = machine.cpu.pc().to_u64();
        machine
            .memory
            .memset(dst, value, len as usize)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        machine.penalize(len);
        machine.set_result(dst);
        Ok(())
    }

    /// Byte-by-byte move in the direction that tolerates overlap.
    fn sys_memmove(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let dst = machine.sysarg(0);
        let src = machine.sysarg(1);
        let len = machine.sysarg(2).to_u64();
        let pc = machine.cpu.pc().to_u64();
        let copy = |machine: &mut Machine<A>, i: u64| -> Result<(), MachineError> {
            let offset = A::from_u64(i);
            let byte = machine
                .memory
                .read_u8(src.wrapping_add(offset))
                .map_err(|err| MachineError::from_memory(err, pc))?;
            machine
                .memory
                .write_u8(dst.wrapping_add(offset), byte)
                .map_err(|err| MachineError::from_memory(err, pc))
        };
        if src < dst {
            for i in (0..len).rev() {
                copy(machine, i)?;
            }
        } else {
            for i in 0..len {
                copy(machine, i)?;
            }
        }
        machine.penalize(2 * len);
        machine.set_result(dst);
        Ok(())
    }

    fn sys_memcmp(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let p1 = machine.sysarg(0);
        let p2 = machine.sysarg(1);
        let len = machine.sysarg(2).to_u64();
        let pc = machine.cpu.pc().to_u64();
        let result = machine
            .memory
            .memcmp(p1, p2, len as usize)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        machine.penalize(2 * len);
        machine.set_result_i64(result as i64);
        Ok(())
    }

    fn sys_strlen(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let addr = machine.sysarg(0);
        let pc = machine.cpu.pc().to_u64();
        let len = machine
            .memory
            .strlen(addr, 4096)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        machine.penalize(2 * len as u64);
        machine.set_result(A::from_u64(len as u64));
        Ok(())
    }

    fn sys_strncmp(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let mut a1 = machine.sysarg(0);
        let mut a2 = machine.sysarg(1);
        let maxlen = machine.sysarg(2).to_u64();
        let pc = machine.cpu.pc().to_u64();
        let mut len = 0u64;
        while len < maxlen {
            let v1 = machine
                .memory
                .read_u8(a1)
                .map_err(|err| MachineError::from_memory(err, pc))?;
            let v2 = machine
                .memory
                .read_u8(a2)
                .map_err(|err| MachineError::from_memory(err, pc))?;
            if v1 != v2 || v1 == 0 {
                machine.penalize(2 + 2 * len);
                machine.set_result_i64(v1 as i64 - v2 as i64);
                return Ok(());
            }
            a1 = a1.wrapping_add(A::ONE);
            a2 = a2.wrapping_add(A::ONE);
            len += 1;
        }
        machine.penalize(2 + 2 * len);
        machine.set_result(A::ZERO);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000_0000;
    const END: u64 = 0x1010_0000;

    fn arena() -> Arena<u64> {
        Arena::new(BASE, END)
    }

    #[test]
    fn test_malloc_free_accounting() {
        let mut arena = arena();
        let p1 = arena.malloc(100).unwrap();
        assert_ne!(p1, 0);
        let p2 = arena.malloc(200).unwrap();
        assert!(p2 > p1);
        assert_eq!(arena.bytes_used(), 104 + 200);
        arena.free(p1).unwrap();
        arena.free(p2).unwrap();
        assert_eq!(arena.bytes_used(), 0);
        assert_eq!(arena.chunks_used(), 1);
        assert_eq!(arena.bytes_free(), END - BASE);
    }

    #[test]
    fn test_accounting_invariant_over_mixed_usage() {
        let mut arena = arena();
        let mut live = Vec::new();
        for i in 1..=32u64 {
            live.push(arena.malloc(i * 24).unwrap());
        }
        for p in live.iter().step_by(2) {
            arena.free(*p).unwrap();
        }
        // Used plus free always covers the whole span.
        assert_eq!(arena.bytes_used() + arena.bytes_free(), END - BASE);
    }

    #[test]
    fn test_alignment_and_minimum_size() {
        let mut arena = arena();
        let p1 = arena.malloc(1).unwrap();
        assert_eq!(arena.size(p1), 8);
        let p2 = arena.malloc(9).unwrap();
        assert_eq!(arena.size(p2), 16);
        assert_eq!(p1 % 8, 0);
        assert_eq!(p2 % 8, 0);
    }

    #[test]
    fn test_free_coalesces_both_neighbors() {
        let mut arena = arena();
        let p1 = arena.malloc(64).unwrap();
        let p2 = arena.malloc(64).unwrap();
        let p3 = arena.malloc(64).unwrap();
        arena.free(p1).unwrap();
        arena.free(p3).unwrap();
        // Freeing the middle chunk must merge forward and backward into a
        // single free chunk followed by the tail.
        arena.free(p2).unwrap();
        assert_eq!(arena.chunks_used(), 1);
        let mut frees = 0;
        let mut previous_free = false;
        for chunk in arena.walk() {
            if chunk.free {
                assert!(!previous_free, "adjacent free chunks must be coalesced");
                frees += 1;
            }
            previous_free = chunk.free;
        }
        assert_eq!(frees, 1);
    }

    #[test]
    fn test_freed_space_is_reused() {
        let mut arena = arena();
        let p1 = arena.malloc(128).unwrap();
        let _p2 = arena.malloc(128).unwrap();
        arena.free(p1).unwrap();
        let p3 = arena.malloc(64).unwrap();
        // First fit lands in the hole left by p1.
        assert_eq!(p3, p1);
    }

    #[test]
    fn test_double_free_is_reported() {
        let mut arena = arena();
        let p1 = arena.malloc(32).unwrap();
        arena.free(p1).unwrap();
        assert!(matches!(
            arena.free(p1),
            Err(ArenaError::UnknownPointer { .. })
        ));
        assert!(matches!(
            arena.free(0xDEAD),
            Err(ArenaError::UnknownPointer { .. })
        ));
    }

    #[test]
    fn test_size_of_freed_pointer_is_zero() {
        let mut arena = arena();
        let p1 = arena.malloc(32).unwrap();
        assert_eq!(arena.size(p1), 32);
        arena.free(p1).unwrap();
        assert_eq!(arena.size(p1), 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut arena: Arena<u64> = Arena::new(0x1000, 0x1100);
        assert!(arena.malloc(0x200).is_none());
        let p = arena.malloc(0x100).unwrap();
        assert!(arena.malloc(8).is_none());
        arena.free(p).unwrap();
        assert!(arena.malloc(0x100).is_some());
    }

    #[test]
    fn test_exact_fit_does_not_split() {
        let mut arena: Arena<u64> = Arena::new(0x1000, 0x1040);
        let p1 = arena.malloc(0x40).unwrap();
        assert_eq!(arena.chunks_used(), 1);
        assert_eq!(arena.bytes_free(), 0);
        arena.free(p1).unwrap();
        assert_eq!(arena.bytes_free(), 0x40);
    }

    #[test]
    fn test_heap_syscalls() {
        use crate::registers::Specifier;
        const HEAP_BASE: usize = 480;
        let mut machine: Machine<u64> = Machine::default();
        machine.setup_native_heap(HEAP_BASE, 0x1000_0000, 0x10_0000);

        // malloc(100)
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 100);
        machine.system_call(HEAP_BASE).unwrap();
        let p1 = machine.return_value();
        assert_ne!(p1, 0);

        // calloc(4, 16) returns zeroed memory even where the arena span
        // was dirtied before.
        machine.memory.write_u64(p1, u64::MAX).unwrap();
        machine.cpu.registers_mut().set_x(Specifier::arg(0), p1);
        machine.system_call(HEAP_BASE + 3).unwrap(); // free(p1)
        assert_eq!(machine.return_value(), 0);
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 4);
        machine.cpu.registers_mut().set_x(Specifier::arg(1), 16);
        machine.system_call(HEAP_BASE + 1).unwrap();
        let p2 = machine.return_value();
        assert_eq!(p2, p1); // first fit reuses the hole
        assert_eq!(machine.memory.read_u64(p2).unwrap(), 0);

        // meminfo
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 0x5000);
        machine.system_call(HEAP_BASE + 4).unwrap();
        assert_eq!(machine.return_value(), 0);
        let bytes_used = machine.memory.read_u32(0x5004).unwrap();
        assert_eq!(bytes_used, 64);

        // double free reports failure
        machine.cpu.registers_mut().set_x(Specifier::arg(0), p2);
        machine.system_call(HEAP_BASE + 3).unwrap();
        machine.cpu.registers_mut().set_x(Specifier::arg(0), p2);
        machine.system_call(HEAP_BASE + 3).unwrap();
        assert_eq!(machine.return_value(), u64::MAX); // -1
    }

    #[test]
    fn test_realloc_growth_copies_contents() {
        use crate::registers::Specifier;
        const HEAP_BASE: usize = 480;
        let mut machine: Machine<u64> = Machine::default();
        machine.setup_native_heap(HEAP_BASE, 0x1000_0000, 0x10_0000);

        machine.cpu.registers_mut().set_x(Specifier::arg(0), 16);
        machine.system_call(HEAP_BASE).unwrap();
        let p1 = machine.return_value();
        machine.memory.write_u64(p1, 0xABCD).unwrap();
        // Allocate a blocker so realloc cannot extend in place.
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 16);
        machine.system_call(HEAP_BASE).unwrap();

        machine.cpu.registers_mut().set_x(Specifier::arg(0), p1);
        machine.cpu.registers_mut().set_x(Specifier::arg(1), 4096);
        machine.system_call(HEAP_BASE + 2).unwrap();
        let p2 = machine.return_value();
        assert_ne!(p2, 0);
        assert_ne!(p2, p1);
        assert_eq!(machine.memory.read_u64(p2).unwrap(), 0xABCD);
    }

    #[test]
    fn test_native_memory_syscalls() {
        use crate::registers::Specifier;
        const MEM_BASE: usize = 490;
        let mut machine: Machine<u64> = Machine::default();
        machine.setup_native_memory(MEM_BASE);

        machine.memory.write_bytes(0x1000, b"hello\0").unwrap();
        // strlen(0x1000)
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 0x1000);
        machine.system_call(MEM_BASE + 5).unwrap();
        assert_eq!(machine.return_value(), 5);

        // memcpy(0x2000, 0x1000, 6)
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 0x2000);
        machine.cpu.registers_mut().set_x(Specifier::arg(1), 0x1000);
        machine.cpu.registers_mut().set_x(Specifier::arg(2), 6);
        machine.system_call(MEM_BASE).unwrap();
        assert_eq!(machine.memory.memstring(0x2000, 32).unwrap(), "hello");

        // strncmp(0x1000, 0x2000, 16) == 0
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 0x1000);
        machine.cpu.registers_mut().set_x(Specifier::arg(1), 0x2000);
        machine.cpu.registers_mut().set_x(Specifier::arg(2), 16);
        machine.system_call(MEM_BASE + 6).unwrap();
        assert_eq!(machine.return_value(), 0);

        // Overlapping memmove forward.
        machine.cpu.registers_mut().set_x(Specifier::arg(0), 0x1002);
        machine.cpu.registers_mut().set_x(Specifier::arg(1), 0x1000);
        machine.cpu.registers_mut().set_x(Specifier::arg(2), 4);
        machine.system_call(MEM_BASE + 2).unwrap();
        let mut buf = [0u8; 6];
        machine.memory.read_bytes(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hehell");

        // The accelerated calls bill against the instruction budget.
        assert!(machine.cpu.instruction_counter() > 0);
    }

    #[test]
    fn test_transfer_copies_topology() {
        let mut arena = arena();
        let p1 = arena.malloc(100).unwrap();
        let p2 = arena.malloc(200).unwrap();
        arena.free(p1).unwrap();
        let mut copy: Arena<u64> = Arena::new(0, 0);
        arena.transfer_to(&mut copy);
        assert_eq!(copy.bytes_used(), arena.bytes_used());
        assert_eq!(copy.bytes_free(), arena.bytes_free());
        assert_eq!(copy.chunks_used(), arena.chunks_used());
        assert_eq!(copy.size(p2), 200);
        // The copy is independent.
        copy.free(p2).unwrap();
        assert_eq!(arena.size(p2), 200);
    }
}
