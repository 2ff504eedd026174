//! duststorm is a user-mode RISC-V emulator library.
//!
//! A [`Machine`] loads a guest program image into a paged, copy-on-write
//! address space and executes it instruction by instruction, routing guest
//! system calls back to host-installed handlers. The address width is a
//! type parameter: `Machine<u32>` emulates RV32, `Machine<u64>` RV64 and
//! `Machine<u128>` RV128, with the IMAFDC extensions decoded on all of
//! them.
//!
//! The core deliberately has no opinion about binary formats: a loader
//! maps segments through [`Memory`]'s page APIs and seeds the entry point
//! and stack pointer. Execution is bounded by an instruction budget, and
//! running out of budget is a resumable soft stop rather than an error.
//!
//! ```
//! use duststorm::{Machine, MachineOptions, StopReason, SYSCALL_EBREAK};
//!
//! // li a0, 42; ebreak
//! let image: Vec<u8> = [0x02A0_0513u32, 0x0010_0073]
//!     .iter()
//!     .flat_map(|w| w.to_le_bytes())
//!     .collect();
//!
//! let mut machine: Machine<u64> = Machine::new(MachineOptions::default());
//! machine.init_execute_area(&image, 0x1000).unwrap();
//! machine.cpu.jump(0x1000);
//! machine.install_syscall_handler(SYSCALL_EBREAK, |machine| {
//!     machine.stop();
//!     Ok(())
//! });
//!
//! let reason = machine.simulate(1_000).unwrap();
//! assert_eq!(reason, StopReason::Stopped);
//! assert_eq!(machine.return_value(), 42);
//! ```

#[macro_use]
extern crate static_assertions;

pub mod address;
pub mod arena;
pub mod compressed;
pub mod cpu;
pub mod error;
mod execute;
mod fpu;
pub mod instruction;
pub mod machine;
pub mod memory;
pub mod page;
pub mod registers;
pub mod state;
pub mod threads;

pub use address::Address;
pub use arena::{Arena, ArenaError};
pub use cpu::Cpu;
pub use error::{MachineError, MemoryError, StopReason};
pub use instruction::{DecodeError, Instruction};
pub use machine::{
    Machine, MachineOptions, SyscallHandler, SYSCALLS_MAX, SYSCALL_EBREAK,
};
pub use memory::{Memory, PageFaultHandler, PageReadHandler, PageWriteHandler};
pub use page::{Page, PageAttributes, PAGE_SHIFT, PAGE_SIZE};
pub use registers::{Fcsr, Registers, Specifier};
pub use state::StateError;
pub use threads::{Thread, ThreadState, Threads, THREAD_STACK_SIZE};

/// An RV32 machine.
pub type Machine32 = Machine<u32>;
/// An RV64 machine.
pub type Machine64 = Machine<u64>;
/// An RV128 machine.
pub type Machine128 = Machine<u128>;
