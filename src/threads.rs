//! Cooperative guest threads.
//!
//! Guest threading is fully cooperative and single-host-threaded: context
//! switches happen only inside the thread-control system calls installed by
//! [`Machine::setup_native_threads`]. A thread's saved state is the full
//! register file including the program counter.
//!
//! The scheduler is a round-robin queue over suspended threads; blocked
//! threads wait on an integer reason tag until woken.

use crate::address::Address;
use crate::error::MachineError;
use crate::machine::Machine;
use crate::registers::{Registers, Specifier};
use log::trace;
use std::collections::{BTreeMap, VecDeque};

/// Stack size of threads spawned through the thread-call interface.
pub const THREAD_STACK_SIZE: u64 = 256 * 1024;

/// Write the child tid to the address given at clone time.
pub const CLONE_CHILD_SETTID: u32 = 0x0100_0000;
/// Zero the child tid address when the thread exits.
pub const CLONE_CHILD_CLEARTID: u32 = 0x0020_0000;

/// The tid of the initial thread. Reserved: never handed to children.
pub const MAIN_THREAD_TID: u32 = 0;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ThreadState {
    /// Currently executing on the CPU.
    Running,
    /// Runnable, waiting in the round-robin queue.
    Suspended,
    /// Waiting for a wakeup with this reason tag.
    Blocked(i32),
    /// Terminated; the thread is removed from the table in this state.
    Exited,
}

#[derive(Debug)]
pub struct Thread<A: Address> {
    pub tid: u32,
    pub tls: A,
    pub stack: A,
    pub parent_tid: u32,
    /// When nonzero, the address zeroed on thread exit
    /// (`CLONE_CHILD_CLEARTID`).
    pub clear_child_tid: A,
    state: ThreadState,
    saved: Registers<A>,
}

impl<A: Address> Thread<A> {
    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn saved_registers(&self) -> &Registers<A> {
        &self.saved
    }
}

/// The guest thread table.
#[derive(Debug)]
pub struct Threads<A: Address> {
    threads: BTreeMap<u32, Thread<A>>,
    running_tid: u32,
    next_tid: u32,
    /// Round-robin queue of suspended (runnable) tids.
    suspended: VecDeque<u32>,
    /// Tids currently blocked, in blocking order.
    blocked: Vec<u32>,
}

impl<A: Address> Threads<A> {
    fn new() -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(
            MAIN_THREAD_TID,
            Thread {
                tid: MAIN_THREAD_TID,
                tls: A::ZERO,
                stack: A::ZERO,
                parent_tid: MAIN_THREAD_TID,
                clear_child_tid: A::ZERO,
                state: ThreadState::Running,
                saved: Registers::default(),
            },
        );
        Self {
            threads,
            running_tid: MAIN_THREAD_TID,
            next_tid: 1,
            suspended: VecDeque::new(),
            blocked: Vec::new(),
        }
    }

    /// The tid of the currently running thread.
    pub fn running_tid(&self) -> u32 {
        self.running_tid
    }

    pub fn get(&self, tid: u32) -> Option<&Thread<A>> {
        self.threads.get(&tid)
    }

    pub fn count(&self) -> usize {
        self.threads.len()
    }

    /// Tids of all live threads, in tid order.
    pub fn tids(&self) -> impl Iterator<Item = u32> + '_ {
        self.threads.keys().copied()
    }
}

impl<A: Address> Machine<A> {
    /// Creates the thread table and installs the thread-control system
    /// calls at `syscall_base`:
    ///
    /// | offset | call |
    /// |--------|------|
    /// | +0 | `microclone(stack, func, tls, flags)` |
    /// | +1 | `exit(status)` |
    /// | +2 | `sched_yield()` |
    /// | +3 | `yield_to(tid)` |
    /// | +4 | `block(reason)` |
    /// | +5 | `wakeup_blocked(reason)` |
    /// | +6 | `unblock(tid)` |
    /// | +8 | `threadcall(func, fini, args...)` |
    /// | +9 | `threadcall_exit()` |
    ///
    /// The thread-call pair requires the native heap (thread stacks are
    /// carved from the arena).
    pub fn setup_native_threads(&mut self, syscall_base: usize) {
        self.threads = Some(Threads::new());
        self.install_syscall_handler(syscall_base, Self::sys_microclone);
        self.install_syscall_handler(syscall_base + 1, Self::sys_thread_exit);
        self.install_syscall_handler(syscall_base + 2, Self::sys_sched_yield);
        self.install_syscall_handler(syscall_base + 3, Self::sys_yield_to);
        self.install_syscall_handler(syscall_base + 4, Self::sys_block);
        self.install_syscall_handler(syscall_base + 5, Self::sys_wakeup_blocked);
        self.install_syscall_handler(syscall_base + 6, Self::sys_unblock);
        self.install_syscall_handler(syscall_base + 8, Self::sys_threadcall);
        self.install_syscall_handler(syscall_base + 9, Self::sys_threadcall_exit);
    }

    //
    // Thread table operations
    //

    /// Creates a new suspended thread inheriting the current register file,
    /// with its own stack and thread pointers.
    pub fn thread_create(
        &mut self,
        flags: u32,
        ctid: A,
        _ptid: A,
        stack: A,
        tls: A,
    ) -> Result<u32, MachineError> {
        let mut saved = self.cpu.registers().clone();
        saved.set_x(Specifier::SP, stack);
        saved.set_x(Specifier::TP, tls);
        let tid = {
            let threads = self.require_threads()?;
            let tid = threads.next_tid;
            threads.next_tid += 1;
            let parent = threads.running_tid;
            threads.threads.insert(
                tid,
                Thread {
                    tid,
                    tls,
                    stack,
                    parent_tid: parent,
                    clear_child_tid: if flags & CLONE_CHILD_CLEARTID != 0 {
                        ctid
                    } else {
                        A::ZERO
                    },
                    state: ThreadState::Suspended,
                    saved,
                },
            );
            threads.suspended.push_back(tid);
            trace!("thread {tid} created by {parent}");
            tid
        };
        if flags & CLONE_CHILD_SETTID != 0 && ctid != A::ZERO {
            let pc = self.cpu.pc().to_u64();
            self.memory
                .write_u32(ctid, tid)
                .map_err(|err| MachineError::from_memory(err, pc))?;
        }
        Ok(tid)
    }

    /// Suspends the running thread, saving the register file with `a0` set
    /// to `return_value` (what the thread observes when resumed), and
    /// queues it for round-robin scheduling.
    pub fn thread_suspend_current(&mut self, return_value: A) -> Result<(), MachineError> {
        let mut saved = self.cpu.registers().clone();
        saved.set_x(Specifier::A0, return_value);
        let threads = self.require_threads()?;
        let tid = threads.running_tid;
        let thread = threads.threads.get_mut(&tid).expect("running thread exists");
        thread.state = ThreadState::Suspended;
        thread.saved = saved;
        threads.suspended.push_back(tid);
        Ok(())
    }

    /// Makes `tid` the running thread and loads its saved register file.
    /// Clears the atomic reservation, as a context switch must.
    pub fn thread_activate(&mut self, tid: u32) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        let threads = self.require_threads()?;
        let thread = threads
            .threads
            .get_mut(&tid)
            .ok_or(MachineError::InvalidOperation {
                pc,
                reason: "activating a thread that does not exist",
            })?;
        thread.state = ThreadState::Running;
        let registers = thread.saved.clone();
        threads.running_tid = tid;
        threads.suspended.retain(|&t| t != tid);
        threads.blocked.retain(|&t| t != tid);
        *self.cpu.registers_mut() = registers;
        self.cpu.clear_reservation();
        trace!("thread {tid} activated");
        Ok(())
    }

    /// Suspends the running thread and activates the next runnable one.
    /// Returns `false` (without suspending) when no other thread is
    /// runnable.
    pub fn thread_suspend_and_yield(&mut self, return_value: A) -> Result<bool, MachineError> {
        let next = match self.require_threads()?.suspended.front() {
            Some(&tid) => tid,
            None => return Ok(false),
        };
        self.thread_suspend_current(return_value)?;
        self.thread_activate(next)?;
        Ok(true)
    }

    /// Blocks the running thread on `reason` and switches to the next
    /// runnable thread. Fails (returning `false`) when no other thread can
    /// run.
    pub fn thread_block(&mut self, reason: i32) -> Result<bool, MachineError> {
        let next = match self.require_threads()?.suspended.front() {
            Some(&tid) => tid,
            None => return Ok(false),
        };
        let saved = self.cpu.registers().clone();
        {
            let threads = self.require_threads()?;
            let tid = threads.running_tid;
            let thread = threads.threads.get_mut(&tid).expect("running thread exists");
            thread.state = ThreadState::Blocked(reason);
            thread.saved = saved;
            threads.blocked.push(tid);
            trace!("thread {tid} blocked on {reason}");
        }
        self.thread_activate(next)?;
        Ok(true)
    }

    /// Unblocks the first thread blocked on `reason`, making it runnable.
    /// Does not switch to it.
    pub fn thread_wakeup_blocked(&mut self, reason: i32) -> Result<bool, MachineError> {
        let threads = self.require_threads()?;
        let position = threads.blocked.iter().position(|tid| {
            matches!(
                threads.threads.get(tid).map(Thread::state),
                Some(ThreadState::Blocked(r)) if r == reason
            )
        });
        match position {
            Some(index) => {
                let tid = threads.blocked.remove(index);
                let thread = threads.threads.get_mut(&tid).expect("blocked thread exists");
                thread.state = ThreadState::Suspended;
                threads.suspended.push_back(tid);
                trace!("thread {tid} woken on {reason}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unblocks a specific tid, regardless of reason.
    pub fn thread_unblock(&mut self, tid: u32) -> Result<bool, MachineError> {
        let threads = self.require_threads()?;
        match threads.threads.get_mut(&tid) {
            Some(thread) if matches!(thread.state, ThreadState::Blocked(_)) => {
                thread.state = ThreadState::Suspended;
                threads.blocked.retain(|&t| t != tid);
                threads.suspended.push_back(tid);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Yields to a specific suspended tid. Fails when the target is not
    /// runnable.
    pub fn thread_yield_to(&mut self, tid: u32) -> Result<bool, MachineError> {
        let runnable = {
            let threads = self.require_threads()?;
            tid != threads.running_tid
                && matches!(
                    threads.threads.get(&tid).map(Thread::state),
                    Some(ThreadState::Suspended)
                )
        };
        if !runnable {
            return Ok(false);
        }
        self.thread_suspend_current(A::ZERO)?;
        self.thread_activate(tid)?;
        Ok(true)
    }

    /// Terminates the running thread. Returns `true` if it was the last
    /// thread (the machine should stop); otherwise another thread has been
    /// activated.
    pub fn thread_exit_current(&mut self) -> Result<bool, MachineError> {
        let (tid, clear_child_tid) = {
            let threads = self.require_threads()?;
            let tid = threads.running_tid;
            let thread = threads.threads.get_mut(&tid).expect("running thread exists");
            thread.state = ThreadState::Exited;
            (tid, thread.clear_child_tid)
        };
        if clear_child_tid != A::ZERO {
            let pc = self.cpu.pc().to_u64();
            self.memory
                .write_u32(clear_child_tid, 0)
                .map_err(|err| MachineError::from_memory(err, pc))?;
        }
        let next = {
            let threads = self.require_threads()?;
            threads.threads.remove(&tid);
            threads.suspended.retain(|&t| t != tid);
            threads.blocked.retain(|&t| t != tid);
            trace!("thread {tid} exited");
            if threads.threads.is_empty() {
                return Ok(true);
            }
            // Prefer the round-robin queue; with only blocked threads left,
            // wake the oldest blocker rather than deadlocking silently.
            threads
                .suspended
                .front()
                .copied()
                .or_else(|| threads.blocked.first().copied())
        };
        match next {
            Some(next) => {
                self.thread_activate(next)?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    //
    // System call handlers
    //

    /// `microclone(stack, func, tls, flags)`: spawn a thread at `func` with
    /// the given stack and TLS pointer. The parent suspends with the child
    /// tid as its return value; the child starts running immediately.
    fn sys_microclone(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let stack = machine.sysarg(0) & !A::from_u64(0xF);
        let func = machine.sysarg(1);
        let tls = machine.sysarg(2);
        let flags = machine.sysarg(3).to_u32();
        trace!(
            "microclone(stack={:#x}, func={:#x}, tls={:#x})",
            stack.to_u64(),
            func.to_u64(),
            tls.to_u64()
        );
        let tid = machine.thread_create(CLONE_CHILD_SETTID | flags, tls, A::ZERO, stack, tls)?;
        machine.thread_suspend_current(A::from_u32(tid))?;
        machine.thread_activate(tid)?;
        machine.setup_call(func, &[tls]);
        Ok(())
    }

    /// `exit(status)`: terminate the current thread; stopping the machine
    /// with `status` when it was the last one.
    fn sys_thread_exit(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let status = machine.sysarg(0);
        trace!(
            "thread exit on tid={}, status={}",
            machine.threads().map_or(0, |threads| threads.running_tid()),
            status.to_u64() as i64
        );
        if machine.thread_exit_current()? {
            machine.stop();
            machine.set_result(status);
        }
        Ok(())
    }

    /// `sched_yield()`: hand the CPU to the next runnable thread.
    fn sys_sched_yield(machine: &mut Machine<A>) -> Result<(), MachineError> {
        if !machine.thread_suspend_and_yield(A::ZERO)? {
            machine.set_result(A::ZERO);
        }
        Ok(())
    }

    /// `yield_to(tid)`: hand the CPU to a specific thread; `-1` if it is
    /// not runnable.
    fn sys_yield_to(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let tid = machine.sysarg(0).to_u32();
        if !machine.thread_yield_to(tid)? {
            machine.set_result_i64(-1);
        }
        Ok(())
    }

    /// `block(reason)`: block until woken; `-1` if no other thread exists
    /// to run.
    fn sys_block(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let reason = machine.sysarg(0).to_u32() as i32;
        if !machine.thread_block(reason)? {
            machine.set_result_i64(-1);
        }
        Ok(())
    }

    /// `wakeup_blocked(reason)`: make the first thread blocked on `reason`
    /// runnable; `-1` if there is none.
    fn sys_wakeup_blocked(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let reason = machine.sysarg(0).to_u32() as i32;
        if !machine.thread_wakeup_blocked(reason)? {
            machine.set_result_i64(-1);
        }
        Ok(())
    }

    /// `unblock(tid)`: make a specific blocked thread runnable.
    fn sys_unblock(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let tid = machine.sysarg(0).to_u32();
        machine.thread_unblock(tid)?;
        Ok(())
    }

    /// `threadcall(func, fini, args...)`: spawn a thread whose stack comes
    /// from the arena, arranged so that returning from `func` lands in
    /// `fini` (which performs `threadcall_exit`). Up to six call arguments
    /// are shifted down from `a2..a7` into `a0..a5`.
    fn sys_threadcall(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let tls = match machine.require_arena()?.malloc(THREAD_STACK_SIZE) {
            Some(tls) => tls,
            None => {
                log::warn!("thread stack allocation failed");
                machine.set_result_i64(-1);
                return Ok(());
            }
        };
        let stack = tls.wrapping_add(A::from_u64(THREAD_STACK_SIZE)) & !A::from_u64(0xF);
        let func = machine.sysarg(0);
        let fini = machine.sysarg(1);
        let tid = machine.thread_create(CLONE_CHILD_SETTID, tls, A::ZERO, stack, tls)?;
        // The parent resumes at its caller, as if the call returned the
        // child tid.
        let return_address = machine.cpu.registers().x(Specifier::RA);
        *machine.cpu.registers_mut().pc_mut() = return_address;
        machine.thread_suspend_current(A::from_u32(tid))?;
        machine.thread_activate(tid)?;
        // The child: exit through fini, with the six forwarded arguments
        // moved into place.
        let registers = machine.cpu.registers_mut();
        registers.set_x(Specifier::RA, fini);
        for i in 0..6 {
            let value = registers.x(Specifier::arg(i + 2));
            registers.set_x(Specifier::arg(i), value);
        }
        machine.cpu.jump(func);
        Ok(())
    }

    /// `threadcall_exit()`: free the arena stack and exit, handing `a0` to
    /// the resumed parent.
    fn sys_threadcall_exit(machine: &mut Machine<A>) -> Result<(), MachineError> {
        let retval = machine.cpu.registers().x(Specifier::A0);
        let tls = machine.cpu.registers().x(Specifier::TP);
        if machine.require_arena()?.free(tls).is_err() {
            log::warn!("thread stack {:#x} was not an allocation", tls.to_u64());
        }
        if machine.thread_exit_current()? {
            machine.stop();
        }
        machine.set_result(retval);
        Ok(())
    }
}
