//! The [`Machine`]: one guest, owning its CPU and address space.
//!
//! The machine drives the fetch–decode–dispatch loop, owns the system call
//! table, and carries the optional guest-heap arena and thread table that
//! the native syscall interfaces are built on.

use crate::address::Address;
use crate::arena::Arena;
use crate::compressed;
use crate::cpu::Cpu;
use crate::error::{MachineError, StopReason};
use crate::instruction::Instruction;
use crate::memory::{Memory, PageFaultHandler, DEFAULT_MEMORY_MAX};
use crate::page::PageAttributes;
use crate::registers::Specifier;
use crate::threads::Threads;
use log::{debug, trace};
use std::any::Any;

/// Size of the system call table. Numbers at and above this go to the
/// unhandled-syscall hook.
pub const SYSCALLS_MAX: usize = 384;

/// The system call number EBREAK traps to (the last table slot).
pub const SYSCALL_EBREAK: usize = SYSCALLS_MAX - 1;

/// A system call handler. Reads arguments from `a0..a7`, writes its result
/// with [`Machine::set_result`], and may drive guest memory, the thread
/// table or the arena.
pub type SyscallHandler<A> = fn(&mut Machine<A>) -> Result<(), MachineError>;

/// Hook invoked for system call numbers with no installed handler.
pub type UnhandledSyscallHook<A> = fn(&mut Machine<A>, usize);

/// Hook invoked for CSR numbers the machine does not implement. Receives
/// the CSR number and the raw rd/rs1 fields; the instruction still raises
/// an illegal-instruction fault afterwards.
pub type UnhandledCsrHook<A> = fn(&mut Machine<A>, u16, u8, u8);

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct MachineOptions<A: Address> {
    /// Upper bound on committed guest memory, in bytes.
    pub memory_max: u64,
    /// Whether the loader should parse and map the program image. The core
    /// itself never reads it; it is plumbed through for loader
    /// collaborators.
    pub load_program: bool,
    /// Apply segment permissions strictly (read/execute text, read-only
    /// rodata, read-write data).
    pub protect_segments: bool,
    /// Diagnostic output from the loader.
    pub verbose_loader: bool,
    /// Replaces the default page fault handler when set.
    pub page_fault_handler: Option<PageFaultHandler<A>>,
}

impl<A: Address> Default for MachineOptions<A> {
    fn default() -> Self {
        Self {
            memory_max: DEFAULT_MEMORY_MAX,
            load_program: true,
            protect_segments: true,
            verbose_loader: false,
            page_fault_handler: None,
        }
    }
}

/// A user-mode RISC-V machine. The address width parameter selects the
/// base ISA: `Machine<u32>` is RV32, `Machine<u64>` RV64, `Machine<u128>`
/// RV128.
pub struct Machine<A: Address> {
    pub cpu: Cpu<A>,
    pub memory: Memory<A>,
    syscall_handlers: Box<[SyscallHandler<A>]>,
    pub(crate) on_unhandled_syscall: UnhandledSyscallHook<A>,
    pub(crate) on_unhandled_csr: UnhandledCsrHook<A>,
    pub(crate) threads: Option<Threads<A>>,
    pub(crate) arena: Option<Arena<A>>,
    options: MachineOptions<A>,
    stopped: bool,
    userdata: Option<Box<dyn Any>>,
}

impl<A: Address> std::fmt::Debug for Machine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("cpu", &self.cpu)
            .field("memory", &self.memory)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl<A: Address> Default for Machine<A> {
    fn default() -> Self {
        Self::new(MachineOptions::default())
    }
}

impl<A: Address> Machine<A> {
    pub fn new(options: MachineOptions<A>) -> Self {
        let mut memory = Memory::new(options.memory_max);
        if let Some(handler) = options.page_fault_handler {
            memory.set_page_fault_handler(handler);
        }
        Self {
            cpu: Cpu::new(),
            memory,
            syscall_handlers: vec![Self::unknown_syscall as SyscallHandler<A>; SYSCALLS_MAX]
                .into_boxed_slice(),
            on_unhandled_syscall: |_, nr| {
                trace!("unhandled system call {nr}");
            },
            on_unhandled_csr: |_, csr, _, _| {
                trace!("unhandled csr {csr:#05x}");
            },
            threads: None,
            arena: None,
            options,
            stopped: false,
            userdata: None,
        }
    }

    pub fn options(&self) -> &MachineOptions<A> {
        &self.options
    }

    //
    // Simulation control
    //

    /// Runs the guest until `max_instructions` instructions have retired in
    /// total, the machine is stopped, a breakpoint hits, or a fault is
    /// raised.
    ///
    /// The budget is absolute: a machine that already retired `n`
    /// instructions runs `max_instructions - n` more. Running out of budget
    /// is a soft stop; raise the budget and call again to resume.
    pub fn simulate(&mut self, max_instructions: u64) -> Result<StopReason, MachineError> {
        self.cpu.set_max_instructions(max_instructions);
        self.stopped = false;
        while self.cpu.instruction_counter() < self.cpu.max_instructions() {
            if self.cpu.has_breakpoints() && self.cpu.breakpoint_at(self.cpu.pc()) {
                return Ok(StopReason::Breakpoint {
                    address: self.cpu.pc().to_u64(),
                });
            }
            self.step()?;
            if self.stopped {
                return Ok(StopReason::Stopped);
            }
        }
        Ok(StopReason::OutOfBudget)
    }

    /// Executes exactly one instruction, leaving the budget untouched.
    pub fn step_one(&mut self) -> Result<(), MachineError> {
        self.step()
    }

    /// Fetch, decode, dispatch, retire.
    fn step(&mut self) -> Result<(), MachineError> {
        let raw = {
            let Machine { cpu, memory, .. } = self;
            cpu.fetch(memory)
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                self.cpu.clear_reservation();
                return Err(err);
            }
        };
        let pc = self.cpu.pc();
        let decoded = if raw & 0b11 == 0b11 {
            Instruction::decode(raw, A::BITS).map(|instruction| (instruction, 4))
        } else {
            compressed::decode(raw as u16, A::BITS).map(|instruction| (instruction, 2))
        };
        let (instruction, len) = decoded.map_err(|_| MachineError::IllegalInstruction {
            pc: pc.to_u64(),
            instruction: raw,
        })?;
        match self.execute(instruction, raw, len) {
            Ok(()) => {
                self.cpu.increment_counter(1);
                Ok(())
            }
            Err(err) => {
                // Exceptions drop any atomic reservation.
                self.cpu.clear_reservation();
                Err(err)
            }
        }
    }

    /// Stops the machine; `simulate` returns [`StopReason::Stopped`] after
    /// the current instruction.
    pub fn stop(&mut self) {
        debug!("machine stopped at pc {:#x}", self.cpu.pc());
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Reinitializes registers and jumps back to the entry point seeded by
    /// the loader. Guest memory is left as-is.
    pub fn reset(&mut self) {
        self.cpu
            .reset(self.memory.start_address(), self.memory.stack_initial());
        self.stopped = false;
    }

    /// Adds `penalty` retired instructions to the counter; used by
    /// accelerated syscalls to bill their work against the budget.
    pub fn penalize(&mut self, penalty: u64) {
        self.cpu.increment_counter(penalty);
    }

    //
    // System calls
    //

    /// Registers a handler for system call number `nr`.
    ///
    /// Panics if `nr` is out of table range; the last slot is reserved for
    /// EBREAK ([`SYSCALL_EBREAK`]).
    pub fn install_syscall_handler(&mut self, nr: usize, handler: SyscallHandler<A>) {
        assert!(nr < SYSCALLS_MAX, "system call number out of range");
        self.syscall_handlers[nr] = handler;
    }

    pub fn install_syscall_handlers(
        &mut self,
        handlers: impl IntoIterator<Item = (usize, SyscallHandler<A>)>,
    ) {
        for (nr, handler) in handlers {
            self.install_syscall_handler(nr, handler);
        }
    }

    pub fn set_unhandled_syscall_hook(&mut self, hook: UnhandledSyscallHook<A>) {
        self.on_unhandled_syscall = hook;
    }

    pub fn set_unhandled_csr_hook(&mut self, hook: UnhandledCsrHook<A>) {
        self.on_unhandled_csr = hook;
    }

    /// Invokes the handler for system call `nr`.
    pub fn system_call(&mut self, nr: usize) -> Result<(), MachineError> {
        match self.syscall_handlers.get(nr) {
            Some(&handler) => {
                trace!("system call {nr}");
                handler(self)
            }
            None => {
                (self.on_unhandled_syscall)(self, nr);
                Ok(())
            }
        }
    }

    /// EBREAK traps into the reserved last system call slot.
    pub fn ebreak(&mut self) -> Result<(), MachineError> {
        self.system_call(SYSCALL_EBREAK)
    }

    fn unknown_syscall(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let nr = machine.sysarg(7).to_u64() as usize;
        (machine.on_unhandled_syscall)(machine, nr);
        Ok(())
    }

    /// The `n`-th system call argument (`a0` is argument 0).
    pub fn sysarg(&self, n: u8) -> A {
        self.cpu.registers().x(Specifier::arg(n))
    }

    /// Sets the system call result register (`a0`).
    pub fn set_result(&mut self, value: A) {
        self.cpu.registers_mut().set_x(Specifier::A0, value);
    }

    /// Sets `a0` from a signed host value (`-1` for errors).
    pub fn set_result_i64(&mut self, value: i64) {
        self.set_result(A::from_i64(value));
    }

    /// A shortcut to a return or exit value.
    pub fn return_value(&self) -> A {
        self.cpu.registers().x(Specifier::A0)
    }

    //
    // Embedder state
    //

    pub fn set_userdata<T: Any>(&mut self, data: T) {
        self.userdata = Some(Box::new(data));
    }

    pub fn userdata<T: Any>(&self) -> Option<&T> {
        self.userdata.as_ref()?.downcast_ref()
    }

    pub fn userdata_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.userdata.as_mut()?.downcast_mut()
    }

    //
    // Arena and threads
    //

    /// The guest-heap arena, when configured via
    /// [`setup_native_heap`](Self::setup_native_heap).
    pub fn arena(&self) -> Option<&Arena<A>> {
        self.arena.as_ref()
    }

    pub fn arena_mut(&mut self) -> Option<&mut Arena<A>> {
        self.arena.as_mut()
    }

    /// The guest thread table, when configured via
    /// [`setup_native_threads`](crate::threads).
    pub fn threads(&self) -> Option<&Threads<A>> {
        self.threads.as_ref()
    }

    pub fn threads_mut(&mut self) -> Option<&mut Threads<A>> {
        self.threads.as_mut()
    }

    pub(crate) fn require_arena(&mut self) -> Result<&mut Arena<A>, MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.arena.as_mut().ok_or(MachineError::InvalidOperation {
            pc,
            reason: "the native heap is not configured",
        })
    }

    pub(crate) fn require_threads(&mut self) -> Result<&mut Threads<A>, MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.threads.as_mut().ok_or(MachineError::InvalidOperation {
            pc,
            reason: "the thread table is not configured",
        })
    }

    //
    // Program setup
    //

    /// Copies a flat executable image into guest memory at `base`, marks it
    /// executable, and configures the linear fetch window over it.
    ///
    /// This is the loader-facing seam: an ELF loader maps each segment with
    /// this (or the non-owned mapping APIs) and then seeds the entry point
    /// and stack.
    pub fn init_execute_area(&mut self, image: &[u8], base: A) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .write_bytes_unchecked(base, image)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        let attr = PageAttributes {
            read: true,
            write: !self.options.protect_segments,
            exec: true,
            ..PageAttributes::default()
        };
        self.memory
            .set_page_attr(base, image.len(), attr)
            .map_err(|err| MachineError::from_memory(err, pc))?;
        self.memory.init_exec_segment(base, image);
        self.cpu
            .set_exec_window(base, base.wrapping_add(A::from_u64(image.len() as u64)));
        if self.memory.start_address() == A::ZERO {
            self.memory.set_start_address(base);
        }
        debug!(
            "executable area: {:#x}..{:#x} ({} bytes)",
            base.to_u64(),
            base.to_u64() + image.len() as u64,
            image.len()
        );
        Ok(())
    }

    /// Copy data into guest memory, ignoring page protections (the loader
    /// path).
    pub fn copy_to_guest(&mut self, dst: A, data: &[u8]) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .write_bytes_unchecked(dst, data)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    /// Copy data out of guest memory, honoring page protections.
    pub fn copy_from_guest(&mut self, buf: &mut [u8], src: A) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .read_bytes(src, buf)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    /// Pushes a blob onto the guest stack, moving the stack pointer down
    /// and keeping it word-aligned. Returns the guest address of the data.
    pub fn stack_push(&mut self, data: &[u8]) -> Result<A, MachineError> {
        let mut sp = self.cpu.registers().x(Specifier::SP);
        sp = sp.wrapping_sub(A::from_u64(data.len() as u64));
        sp = sp & !A::from_u64(A::SIZE as u64 - 1);
        self.copy_to_guest(sp, data)?;
        self.cpu.registers_mut().set_x(Specifier::SP, sp);
        Ok(sp)
    }

    /// Re-aligns the stack pointer to the mandated 16 bytes, so function
    /// calls into the guest succeed.
    pub fn realign_stack(&mut self) {
        let sp = self.cpu.registers().x(Specifier::SP) & !A::from_u64(0xF);
        self.cpu.registers_mut().set_x(Specifier::SP, sp);
    }

    /// Pushes program arguments and environment onto the guest stack and
    /// builds the `argc`/`argv`/`envp` block the C runtime expects, leaving
    /// the stack pointer at `argc`.
    pub fn setup_argv(&mut self, args: &[&str], env: &[&str]) -> Result<(), MachineError> {
        let mut vec: Vec<A> = Vec::with_capacity(args.len() + env.len() + 3);
        vec.push(A::from_u64(args.len() as u64));
        for arg in args {
            let mut bytes = arg.as_bytes().to_vec();
            bytes.push(0);
            vec.push(self.stack_push(&bytes)?);
        }
        vec.push(A::ZERO);
        for var in env {
            let mut bytes = var.as_bytes().to_vec();
            bytes.push(0);
            vec.push(self.stack_push(&bytes)?);
        }
        vec.push(A::ZERO);

        let block_len = vec.len() * A::SIZE;
        let mut sp = self.cpu.registers().x(Specifier::SP);
        sp = sp.wrapping_sub(A::from_u64(block_len as u64));
        sp = sp & !A::from_u64(0xF);
        let mut bytes = Vec::with_capacity(block_len);
        for value in &vec {
            bytes.extend_from_slice(&value.to_u128().to_le_bytes()[..A::SIZE]);
        }
        self.copy_to_guest(sp, &bytes)?;
        self.cpu.registers_mut().set_x(Specifier::SP, sp);
        Ok(())
    }

    /// Arranges a call into the guest: argument registers loaded, return
    /// address set to the configured exit address, stack realigned, program
    /// counter at `address`. Executes nothing by itself.
    pub fn setup_call(&mut self, address: A, args: &[A]) {
        assert!(args.len() <= 8, "at most 8 register arguments");
        let exit = self.memory.exit_address();
        let registers = self.cpu.registers_mut();
        for (i, &arg) in args.iter().enumerate() {
            registers.set_x(Specifier::arg(i as u8), arg);
        }
        registers.set_x(Specifier::RA, exit);
        self.realign_stack();
        self.cpu.jump(address);
    }

    /// Calls a guest function and runs it to completion (machine stop)
    /// within the instruction budget, returning the guest's `a0`.
    ///
    /// The function returns through the exit address, which must lead to a
    /// stopping instruction or system call.
    pub fn vmcall(
        &mut self,
        address: A,
        args: &[A],
        max_instructions: u64,
    ) -> Result<A, MachineError> {
        self.cpu.set_instruction_counter(0);
        self.setup_call(address, args);
        self.simulate(max_instructions)?;
        Ok(self.return_value())
    }

    //
    // Forking
    //

    /// Duplicates this machine with the page map shared by reference under
    /// copy-on-write. Thread table, arena and userdata are not carried
    /// over; the syscall table and hooks are.
    ///
    /// # Safety
    ///
    /// The parent must outlive the fork, and should be treated as
    /// read-mostly while forks exist: pages the parent frees or replaces
    /// pull the backing out from under children that still reference it.
    pub unsafe fn fork(&self) -> Machine<A> {
        Machine {
            cpu: self.cpu.fork(),
            memory: self.memory.fork(),
            syscall_handlers: self.syscall_handlers.clone(),
            on_unhandled_syscall: self.on_unhandled_syscall,
            on_unhandled_csr: self.on_unhandled_csr,
            threads: None,
            arena: None,
            options: self.options.clone(),
            stopped: false,
            userdata: None,
        }
    }
}
