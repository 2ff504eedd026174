//! Error types surfaced to the host.
//!
//! Guest memory operations report [`MemoryError`]s without execution context;
//! the dispatch loop wraps them into [`MachineError`]s carrying the faulting
//! program counter. Running out of instruction budget is not an error, it is
//! reported through [`StopReason`].

use thiserror::Error;

/// Errors raised by guest memory operations.
///
/// Addresses are reported as `u64`. On 128-bit machines the low 64 bits are
/// reported, matching the width used by the serialized state format.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    /// A guest access violated the page attributes of the page it touched
    /// (read of a non-readable page, write to a read-only or guard page,
    /// write-through to a copy-on-write page with no backing).
    #[error("protection fault at guest address {address:#x}")]
    ProtectionFault { address: u64 },
    /// A naturally-aligned access was required but the address was not
    /// aligned. Only raised by operations that demand alignment (atomics).
    #[error("misaligned {size}-byte access at guest address {address:#x}")]
    MisalignedAccess { address: u64, size: u32 },
    /// Committing another page would exceed the configured memory limit, or
    /// the host refused an allocation.
    #[error("out of guest memory at page {pageno:#x}")]
    OutOfMemory { pageno: u64 },
    /// A memory management operation violated its preconditions, e.g.
    /// installing a shared page over an already-mapped owned page.
    #[error("invalid operation: {reason} (page {pageno:#x})")]
    InvalidOperation {
        reason: &'static str,
        pageno: u64,
    },
}

impl MemoryError {
    /// The guest address associated with this error, if meaningful.
    pub fn address(&self) -> u64 {
        match *self {
            Self::ProtectionFault { address } => address,
            Self::MisalignedAccess { address, .. } => address,
            Self::OutOfMemory { pageno } => pageno << 12,
            Self::InvalidOperation { pageno, .. } => pageno << 12,
        }
    }
}

/// A structured execution failure, carrying the program counter at the time
/// of the fault.
///
/// After any of these, the machine state remains inspectable. Execution may
/// be resumed, except after [`MachineError::IllegalInstruction`] where
/// further execution is undefined until a `reset` or an explicit jump.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MachineError {
    /// The instruction word at `pc` does not decode to a supported
    /// instruction.
    #[error("illegal instruction {instruction:#010x} at pc {pc:#x}")]
    IllegalInstruction { pc: u64, instruction: u32 },
    /// A jump or branch targeted an address that is not aligned to the
    /// instruction-alignment boundary.
    #[error("misaligned jump target {target:#x} at pc {pc:#x}")]
    MisalignedInstruction { pc: u64, target: u64 },
    /// A guest load, store or instruction fetch violated page attributes.
    #[error("protection fault at guest address {address:#x}, pc {pc:#x}")]
    ProtectionFault { pc: u64, address: u64 },
    /// A guest access that demands natural alignment was misaligned.
    #[error("misaligned access at guest address {address:#x}, pc {pc:#x}")]
    MisalignedAccess { pc: u64, address: u64 },
    /// Page allocation was refused (memory limit or host failure).
    #[error("out of guest memory at pc {pc:#x}")]
    OutOfMemory { pc: u64 },
    /// A machine-level operation violated its preconditions.
    #[error("invalid operation at pc {pc:#x}: {reason}")]
    InvalidOperation { pc: u64, reason: &'static str },
    /// An error propagated out of a host hook (system call handler, page
    /// fault handler).
    #[error("system error at pc {pc:#x}: {message}")]
    SystemError { pc: u64, message: String },
}

impl MachineError {
    /// Wrap a [`MemoryError`] with the program counter it was raised at.
    pub fn from_memory(err: MemoryError, pc: u64) -> Self {
        match err {
            MemoryError::ProtectionFault { address } => Self::ProtectionFault { pc, address },
            MemoryError::MisalignedAccess { address, .. } => {
                Self::MisalignedAccess { pc, address }
            }
            MemoryError::OutOfMemory { .. } => Self::OutOfMemory { pc },
            MemoryError::InvalidOperation { reason, .. } => {
                Self::InvalidOperation { pc, reason }
            }
        }
    }

    /// The program counter at the time of the fault.
    pub fn pc(&self) -> u64 {
        match *self {
            Self::IllegalInstruction { pc, .. }
            | Self::MisalignedInstruction { pc, .. }
            | Self::ProtectionFault { pc, .. }
            | Self::MisalignedAccess { pc, .. }
            | Self::OutOfMemory { pc }
            | Self::InvalidOperation { pc, .. }
            | Self::SystemError { pc, .. } => pc,
        }
    }
}

/// Why [`simulate`](crate::machine::Machine::simulate) returned without an
/// error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopReason {
    /// The machine was stopped, either by a system call handler or by the
    /// guest executing the stop encoding.
    Stopped,
    /// The instruction budget was exhausted. No guest-visible state was
    /// altered; raising the budget and calling `simulate` again resumes
    /// where execution left off.
    OutOfBudget,
    /// Execution reached an address with a breakpoint set on it.
    Breakpoint { address: u64 },
}

impl StopReason {
    /// Convenience predicate for the soft budget stop.
    pub fn out_of_budget(self) -> bool {
        matches!(self, Self::OutOfBudget)
    }
}
