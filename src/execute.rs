//! Instruction semantics for the integer base ISA, the M and A extensions
//! and the supported CSR subset.
//!
//! Dispatch is a match over the decoded [`Instruction`]; each arm updates
//! registers and memory and advances the program counter itself, so jumps
//! and system calls control the next fetch address directly.

use crate::address::Address;
use crate::error::MachineError;
use crate::instruction::{
    AmoOp, AmoSize, BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegReg32Op,
    RegRegOp, RegShiftImmOp, StoreWidth,
};
use crate::machine::Machine;
use crate::registers::Specifier;

/// CSR numbers the core implements. Everything else notifies the
/// unhandled-CSR hook and raises an illegal instruction fault.
mod csr {
    pub const FFLAGS: u16 = 0x001;
    pub const FRM: u16 = 0x002;
    pub const FCSR: u16 = 0x003;
    pub const CYCLE: u16 = 0xC00;
    pub const TIME: u16 = 0xC01;
    pub const INSTRET: u16 = 0xC02;
    pub const CYCLEH: u16 = 0xC80;
    pub const TIMEH: u16 = 0xC81;
    pub const INSTRETH: u16 = 0xC82;
}

impl<A: Address> Machine<A> {
    pub(crate) fn execute(
        &mut self,
        instruction: Instruction,
        raw: u32,
        len: u32,
    ) -> Result<(), MachineError> {
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let s = self.reg(src);
                let imm = A::from_i32(immediate);
                let value = match op {
                    RegImmOp::Addi => s.wrapping_add(imm),
                    RegImmOp::Slti => bool_reg(s.signed_lt(imm)),
                    RegImmOp::Sltiu => bool_reg(s < imm),
                    RegImmOp::Xori => s ^ imm,
                    RegImmOp::Ori => s | imm,
                    RegImmOp::Andi => s & imm,
                };
                self.set_reg(dest, value);
                self.advance(len);
                Ok(())
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shamt,
            } => {
                let s = self.reg(src);
                let value = match op {
                    RegShiftImmOp::Slli => s.wrapping_shl(shamt),
                    RegShiftImmOp::Srli => s.wrapping_shr(shamt),
                    RegShiftImmOp::Srai => s.arithmetic_shr(shamt),
                };
                self.set_reg(dest, value);
                self.advance(len);
                Ok(())
            }
            Instruction::OpImm32 {
                dest,
                src,
                immediate,
            } => {
                let value = self.reg(src).to_u32().wrapping_add(immediate as u32);
                self.set_reg(dest, A::from_i32(value as i32));
                self.advance(len);
                Ok(())
            }
            Instruction::OpShiftImm32 {
                op,
                dest,
                src,
                shamt,
            } => {
                let s = self.reg(src).to_u32();
                let value = match op {
                    RegShiftImmOp::Slli => (s.wrapping_shl(shamt)) as i32,
                    RegShiftImmOp::Srli => (s.wrapping_shr(shamt)) as i32,
                    RegShiftImmOp::Srai => (s as i32).wrapping_shr(shamt),
                };
                self.set_reg(dest, A::from_i32(value));
                self.advance(len);
                Ok(())
            }
            // > LUI (load upper immediate) places the U-immediate value in
            // > the top 20 bits of the destination register rd, filling in
            // > the lowest 12 bits with zeros.
            Instruction::Lui { dest, immediate } => {
                self.set_reg(dest, A::from_i32(immediate & !0xFFF));
                self.advance(len);
                Ok(())
            }
            // > AUIPC forms a 32-bit offset from the 20-bit U-immediate,
            // > [...] adds this offset to the address of the AUIPC
            // > instruction, then places the result in register rd.
            Instruction::Auipc { dest, immediate } => {
                let value = self
                    .cpu
                    .pc()
                    .wrapping_add_signed((immediate & !0xFFF) as i64);
                self.set_reg(dest, value);
                self.advance(len);
                Ok(())
            }
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let (a, b) = (self.reg(src1), self.reg(src2));
                let value = match op {
                    RegRegOp::Add => a.wrapping_add(b),
                    RegRegOp::Sub => a.wrapping_sub(b),
                    RegRegOp::Slt => bool_reg(a.signed_lt(b)),
                    RegRegOp::Sltu => bool_reg(a < b),
                    RegRegOp::And => a & b,
                    RegRegOp::Or => a | b,
                    RegRegOp::Xor => a ^ b,
                    RegRegOp::Sll => a.wrapping_shl(b.to_u32()),
                    RegRegOp::Srl => a.wrapping_shr(b.to_u32()),
                    RegRegOp::Sra => a.arithmetic_shr(b.to_u32()),
                    RegRegOp::Mul => a.wrapping_mul(b),
                    RegRegOp::Mulh => a.mulh(b),
                    RegRegOp::Mulhsu => a.mulhsu(b),
                    RegRegOp::Mulhu => a.mulhu(b),
                    RegRegOp::Div => div_signed(a, b),
                    RegRegOp::Divu => div_unsigned(a, b),
                    RegRegOp::Rem => rem_signed(a, b),
                    RegRegOp::Remu => rem_unsigned(a, b),
                };
                self.set_reg(dest, value);
                self.advance(len);
                Ok(())
            }
            Instruction::Op32 {
                op,
                dest,
                src1,
                src2,
            } => {
                let (a, b) = (self.reg(src1).to_u32(), self.reg(src2).to_u32());
                let value: i32 = match op {
                    RegReg32Op::Addw => a.wrapping_add(b) as i32,
                    RegReg32Op::Subw => a.wrapping_sub(b) as i32,
                    RegReg32Op::Sllw => a.wrapping_shl(b & 0x1F) as i32,
                    RegReg32Op::Srlw => a.wrapping_shr(b & 0x1F) as i32,
                    RegReg32Op::Sraw => (a as i32).wrapping_shr(b & 0x1F),
                    RegReg32Op::Mulw => a.wrapping_mul(b) as i32,
                    RegReg32Op::Divw => {
                        if b == 0 {
                            -1
                        } else {
                            (a as i32).wrapping_div(b as i32)
                        }
                    }
                    RegReg32Op::Divuw => {
                        if b == 0 {
                            -1
                        } else {
                            (a / b) as i32
                        }
                    }
                    RegReg32Op::Remw => {
                        if b == 0 {
                            a as i32
                        } else {
                            (a as i32).wrapping_rem(b as i32)
                        }
                    }
                    RegReg32Op::Remuw => {
                        if b == 0 {
                            a as i32
                        } else {
                            (a % b) as i32
                        }
                    }
                };
                self.set_reg(dest, A::from_i32(value));
                self.advance(len);
                Ok(())
            }
            Instruction::Jal { dest, offset } => {
                let pc = self.cpu.pc();
                let target = pc.wrapping_add_signed(offset as i64);
                self.set_reg(dest, pc.wrapping_add(A::from_u64(len as u64)));
                self.cpu.jump(target);
                Ok(())
            }
            // > The target address is obtained by adding the sign-extended
            // > 12-bit I-immediate to the register rs1, then setting the
            // > least-significant bit of the result to zero.
            Instruction::Jalr { dest, base, offset } => {
                let pc = self.cpu.pc();
                let target = self.reg(base).wrapping_add_signed(offset as i64) & !A::ONE;
                self.set_reg(dest, pc.wrapping_add(A::from_u64(len as u64)));
                self.cpu.jump(target);
                Ok(())
            }
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let (a, b) = (self.reg(src1), self.reg(src2));
                let taken = match condition {
                    BranchCondition::Beq => a == b,
                    BranchCondition::Bne => a != b,
                    BranchCondition::Blt => a.signed_lt(b),
                    BranchCondition::Bge => !a.signed_lt(b),
                    BranchCondition::Bltu => a < b,
                    BranchCondition::Bgeu => a >= b,
                };
                if taken {
                    let target = self.cpu.pc().wrapping_add_signed(offset as i64);
                    self.cpu.jump(target);
                } else {
                    self.advance(len);
                }
                Ok(())
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let addr = self.reg(base).wrapping_add_signed(offset as i64);
                let value = match width {
                    LoadWidth::Lb => A::from_i32(self.mem_read_u8(addr)? as i8 as i32),
                    LoadWidth::Lbu => A::from_u32(self.mem_read_u8(addr)? as u32),
                    LoadWidth::Lh => A::from_i32(self.mem_read_u16(addr)? as i16 as i32),
                    LoadWidth::Lhu => A::from_u32(self.mem_read_u16(addr)? as u32),
                    LoadWidth::Lw => A::from_i32(self.mem_read_u32(addr)? as i32),
                    LoadWidth::Lwu => A::from_u32(self.mem_read_u32(addr)?),
                    LoadWidth::Ld => A::from_i64(self.mem_read_u64(addr)? as i64),
                };
                self.set_reg(dest, value);
                self.advance(len);
                Ok(())
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let addr = self.reg(base).wrapping_add_signed(offset as i64);
                let value = self.reg(src);
                let size = match width {
                    StoreWidth::Sb => 1,
                    StoreWidth::Sh => 2,
                    StoreWidth::Sw => 4,
                    StoreWidth::Sd => 8,
                };
                self.cpu.store_touches_reservation(addr, size);
                match width {
                    StoreWidth::Sb => self.mem_write_u8(addr, value.to_u32() as u8)?,
                    StoreWidth::Sh => self.mem_write_u16(addr, value.to_u32() as u16)?,
                    StoreWidth::Sw => self.mem_write_u32(addr, value.to_u32())?,
                    StoreWidth::Sd => self.mem_write_u64(addr, value.to_u64())?,
                }
                self.advance(len);
                Ok(())
            }
            // A single in-order hart gives every fence its required
            // ordering for free.
            Instruction::Fence => {
                self.advance(len);
                Ok(())
            }
            Instruction::Ecall => {
                self.advance(len);
                let nr = self.sysarg(7).to_u64() as usize;
                self.system_call(nr)
            }
            Instruction::Ebreak => {
                self.advance(len);
                self.ebreak()
            }
            Instruction::Stop => {
                self.advance(len);
                self.stop();
                Ok(())
            }
            Instruction::Csr {
                op,
                dest,
                csr,
                src,
            } => {
                let src_value = match op {
                    CsrOp::ReadWrite => Some(self.reg(src)),
                    _ => (src != Specifier::X0).then(|| self.reg(src)),
                };
                self.csr_instruction(op, dest, csr, src_value, raw, len, u8::from(src))
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let src_value = match op {
                    CsrOp::ReadWrite => Some(A::from_u32(immediate)),
                    _ => (immediate != 0).then_some(A::from_u32(immediate)),
                };
                self.csr_instruction(op, dest, csr, src_value, raw, len, immediate as u8)
            }
            Instruction::LoadReserved { size, dest, addr } => {
                let address = self.reg(addr);
                self.check_amo_alignment(address, size)?;
                let value = match size {
                    AmoSize::Word => A::from_i32(self.mem_read_u32(address)? as i32),
                    AmoSize::Double => A::from_i64(self.mem_read_u64(address)? as i64),
                };
                self.cpu.load_reserve(address, size.bytes());
                self.set_reg(dest, value);
                self.advance(len);
                Ok(())
            }
            Instruction::StoreConditional {
                size,
                dest,
                addr,
                src,
            } => {
                let address = self.reg(addr);
                self.check_amo_alignment(address, size)?;
                if self.cpu.store_conditional(address, size.bytes()) {
                    let value = self.reg(src);
                    match size {
                        AmoSize::Word => self.mem_write_u32(address, value.to_u32())?,
                        AmoSize::Double => self.mem_write_u64(address, value.to_u64())?,
                    }
                    self.set_reg(dest, A::ZERO);
                } else {
                    self.set_reg(dest, A::ONE);
                }
                self.advance(len);
                Ok(())
            }
            Instruction::Amo {
                op,
                size,
                dest,
                addr,
                src,
            } => self.amo(op, size, dest, addr, src, len),
            Instruction::FpLoad {
                width,
                dest,
                base,
                offset,
            } => self.fp_load(width, dest, base, offset, len),
            Instruction::FpStore {
                width,
                src,
                base,
                offset,
            } => self.fp_store(width, src, base, offset, len),
            Instruction::FpOp {
                op,
                width,
                dest,
                src1,
                src2,
            } => self.fp_op(op, width, dest, src1, src2, len),
            Instruction::FpSqrt { width, dest, src } => self.fp_sqrt(width, dest, src, len),
            Instruction::FpFma {
                op,
                width,
                dest,
                src1,
                src2,
                src3,
            } => self.fp_fma(op, width, dest, src1, src2, src3, len),
            Instruction::FpCmp {
                op,
                width,
                dest,
                src1,
                src2,
            } => self.fp_cmp(op, width, dest, src1, src2, len),
            Instruction::FpCvtToInt {
                width,
                target,
                dest,
                src,
            } => self.fp_cvt_to_int(width, target, dest, src, len),
            Instruction::FpCvtFromInt {
                width,
                source,
                dest,
                src,
            } => self.fp_cvt_from_int(width, source, dest, src, len),
            Instruction::FpCvtFloat { from, to, dest, src } => {
                self.fp_cvt_float(from, to, dest, src, len)
            }
            Instruction::FpMvToInt { width, dest, src } => self.fp_mv_to_int(width, dest, src, len),
            Instruction::FpMvFromInt { width, dest, src } => {
                self.fp_mv_from_int(width, dest, src, len)
            }
            Instruction::FpClass { width, dest, src } => self.fp_class(width, dest, src, len),
        }
    }

    /// Atomic read-modify-write: load the old value, apply the operation,
    /// store the result, and only then write the old value into rd (rd and
    /// rs2 may be the same register).
    fn amo(
        &mut self,
        op: AmoOp,
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let address = self.reg(addr);
        self.check_amo_alignment(address, size)?;
        self.cpu.store_touches_reservation(address, size.bytes());
        let old = match size {
            AmoSize::Word => {
                let old = self.mem_read_u32(address)?;
                let rs2 = self.reg(src).to_u32();
                let new = match op {
                    AmoOp::Swap => rs2,
                    AmoOp::Add => old.wrapping_add(rs2),
                    AmoOp::Xor => old ^ rs2,
                    AmoOp::And => old & rs2,
                    AmoOp::Or => old | rs2,
                    AmoOp::Min => (old as i32).min(rs2 as i32) as u32,
                    AmoOp::Max => (old as i32).max(rs2 as i32) as u32,
                    AmoOp::Minu => old.min(rs2),
                    AmoOp::Maxu => old.max(rs2),
                };
                self.mem_write_u32(address, new)?;
                A::from_i32(old as i32)
            }
            AmoSize::Double => {
                let old = self.mem_read_u64(address)?;
                let rs2 = self.reg(src).to_u64();
                let new = match op {
                    AmoOp::Swap => rs2,
                    AmoOp::Add => old.wrapping_add(rs2),
                    AmoOp::Xor => old ^ rs2,
                    AmoOp::And => old & rs2,
                    AmoOp::Or => old | rs2,
                    AmoOp::Min => (old as i64).min(rs2 as i64) as u64,
                    AmoOp::Max => (old as i64).max(rs2 as i64) as u64,
                    AmoOp::Minu => old.min(rs2),
                    AmoOp::Maxu => old.max(rs2),
                };
                self.mem_write_u64(address, new)?;
                A::from_i64(old as i64)
            }
        };
        self.set_reg(dest, old);
        self.advance(len);
        Ok(())
    }

    /// Atomics require natural alignment regardless of configuration.
    fn check_amo_alignment(&self, address: A, size: AmoSize) -> Result<(), MachineError> {
        let mask = A::from_u64(size.bytes() as u64 - 1);
        if address & mask != A::ZERO {
            return Err(MachineError::MisalignedAccess {
                pc: self.cpu.pc().to_u64(),
                address: address.to_u64(),
            });
        }
        Ok(())
    }

    fn csr_instruction(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: u16,
        src_value: Option<A>,
        raw: u32,
        len: u32,
        rs1_field: u8,
    ) -> Result<(), MachineError> {
        if !csr_supported::<A>(csr) {
            let hook = self.on_unhandled_csr;
            hook(self, csr, u8::from(dest), rs1_field);
            return Err(MachineError::IllegalInstruction {
                pc: self.cpu.pc().to_u64(),
                instruction: raw,
            });
        }
        // CSRRW with rd=x0 performs no read (and no read side effects);
        // CSRRS/CSRRC always read.
        let old = if op != CsrOp::ReadWrite || dest != Specifier::X0 {
            Some(self.read_csr(csr))
        } else {
            None
        };
        if let Some(src) = src_value {
            let value = match op {
                CsrOp::ReadWrite => src,
                CsrOp::ReadSet => old.unwrap_or(A::ZERO) | src,
                CsrOp::ReadClear => old.unwrap_or(A::ZERO) & !src,
            };
            self.write_csr(csr, value);
        }
        if let Some(old) = old {
            self.set_reg(dest, old);
        }
        self.advance(len);
        Ok(())
    }

    fn read_csr(&self, csr: u16) -> A {
        let fcsr = self.cpu.registers().fcsr();
        match csr {
            csr::FFLAGS => A::from_u32(fcsr.fflags as u32),
            csr::FRM => A::from_u32(fcsr.frm as u32),
            csr::FCSR => A::from_u32(fcsr.whole()),
            // One instruction per cycle: rdcycle and rdinstret agree.
            csr::CYCLE | csr::INSTRET => A::from_u64(self.cpu.instruction_counter()),
            csr::TIME => A::from_u64(monotonic_time_ns()),
            csr::CYCLEH | csr::INSTRETH => A::from_u64(self.cpu.instruction_counter() >> 32),
            csr::TIMEH => A::from_u64(monotonic_time_ns() >> 32),
            _ => unreachable!("checked by csr_supported"),
        }
    }

    fn write_csr(&mut self, csr: u16, value: A) {
        let fcsr = self.cpu.registers_mut().fcsr_mut();
        match csr {
            csr::FFLAGS => fcsr.fflags = (value.to_u32() & 0x1F) as u8,
            csr::FRM => fcsr.frm = (value.to_u32() & 0x7) as u8,
            csr::FCSR => fcsr.set_whole(value.to_u32()),
            // The counters are read-only shadows; writes are dropped.
            _ => {}
        }
    }

    //
    // Small shared helpers
    //

    fn reg(&self, specifier: Specifier) -> A {
        self.cpu.registers().x(specifier)
    }

    fn set_reg(&mut self, specifier: Specifier, value: A) {
        self.cpu.registers_mut().set_x(specifier, value);
    }

    fn advance(&mut self, len: u32) {
        let pc = self.cpu.registers_mut().pc_mut();
        *pc = pc.wrapping_add(A::from_u64(len as u64));
    }

    pub(crate) fn mem_read_u8(&mut self, addr: A) -> Result<u8, MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .read_u8(addr)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_read_u16(&mut self, addr: A) -> Result<u16, MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .read_u16(addr)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_read_u32(&mut self, addr: A) -> Result<u32, MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .read_u32(addr)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_read_u64(&mut self, addr: A) -> Result<u64, MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .read_u64(addr)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_write_u8(&mut self, addr: A, value: u8) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .write_u8(addr, value)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_write_u16(&mut self, addr: A, value: u16) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .write_u16(addr, value)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_write_u32(&mut self, addr: A, value: u32) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .write_u32(addr, value)
            .map_err(|err| MachineError::from_memory(err, pc))
    }

    pub(crate) fn mem_write_u64(&mut self, addr: A, value: u64) -> Result<(), MachineError> {
        let pc = self.cpu.pc().to_u64();
        self.memory
            .write_u64(addr, value)
            .map_err(|err| MachineError::from_memory(err, pc))
    }
}

fn bool_reg<A: Address>(value: bool) -> A {
    if value {
        A::ONE
    } else {
        A::ZERO
    }
}

/// > The quotient of division by zero has all bits set.
fn div_signed<A: Address>(a: A, b: A) -> A {
    if b == A::ZERO {
        A::MAX
    } else {
        a.wrapping_div_signed(b)
    }
}

fn div_unsigned<A: Address>(a: A, b: A) -> A {
    if b == A::ZERO {
        A::MAX
    } else {
        a.div_unsigned(b)
    }
}

/// > The remainder of division by zero equals the dividend.
fn rem_signed<A: Address>(a: A, b: A) -> A {
    if b == A::ZERO {
        a
    } else {
        a.wrapping_rem_signed(b)
    }
}

fn rem_unsigned<A: Address>(a: A, b: A) -> A {
    if b == A::ZERO {
        a
    } else {
        a.rem_unsigned(b)
    }
}

fn csr_supported<A: Address>(number: u16) -> bool {
    match number {
        csr::FFLAGS | csr::FRM | csr::FCSR | csr::CYCLE | csr::TIME | csr::INSTRET => true,
        csr::CYCLEH | csr::TIMEH | csr::INSTRETH => A::BITS == 32,
        _ => false,
    }
}

/// Monotonic nanoseconds since the first call, backing the time CSR.
fn monotonic_time_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    fn machine() -> Machine<u64> {
        Machine::default()
    }

    fn rv32() -> Machine<u32> {
        Machine::default()
    }

    fn x(n: u8) -> Specifier {
        Specifier::from_u5(n)
    }

    fn run<A: Address>(machine: &mut Machine<A>, instruction: Instruction) {
        machine.execute(instruction, 0, 4).unwrap();
    }

    fn op<A: Address>(machine: &mut Machine<A>, op: RegRegOp, a: A, b: A) -> A {
        machine.cpu.registers_mut().set_x(x(5), a);
        machine.cpu.registers_mut().set_x(x(6), b);
        run(
            machine,
            Instruction::Op {
                op,
                dest: x(7),
                src1: x(5),
                src2: x(6),
            },
        );
        machine.cpu.registers().x(x(7))
    }

    #[test]
    fn test_addi_and_x0() {
        let mut m = machine();
        run(
            &mut m,
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: x(5),
                src: Specifier::X0,
                immediate: -7,
            },
        );
        assert_eq!(m.cpu.registers().x(x(5)), (-7i64) as u64);
        // Writes to x0 are discarded.
        run(
            &mut m,
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::X0,
                src: x(5),
                immediate: 1,
            },
        );
        assert_eq!(m.cpu.registers().x(Specifier::X0), 0);
        // The program counter advanced by 4 per instruction.
        assert_eq!(m.cpu.pc(), 8);
    }

    #[test]
    fn test_slt_family() {
        let mut m = machine();
        assert_eq!(op(&mut m, RegRegOp::Slt, u64::MAX, 0), 1); // -1 < 0
        assert_eq!(op(&mut m, RegRegOp::Sltu, u64::MAX, 0), 0);
        assert_eq!(op(&mut m, RegRegOp::Sltu, 0, u64::MAX), 1);
    }

    #[test]
    fn test_shifts_mask_by_xlen() {
        let mut m = machine();
        assert_eq!(op(&mut m, RegRegOp::Sll, 1, 64), 1); // shamt 64 % 64 == 0
        assert_eq!(op(&mut m, RegRegOp::Sll, 1, 63), 1 << 63);
        assert_eq!(op(&mut m, RegRegOp::Sra, u64::MAX << 63, 63), u64::MAX);
    }

    #[test]
    fn test_mul_div_edge_cases() {
        let mut m = machine();
        assert_eq!(op(&mut m, RegRegOp::Mulhu, u64::MAX, u64::MAX), u64::MAX - 1);
        assert_eq!(op(&mut m, RegRegOp::Mulh, u64::MAX, u64::MAX), 0);
        // Division by zero: all bits set / dividend, no trap.
        assert_eq!(op(&mut m, RegRegOp::Div, 42, 0), u64::MAX);
        assert_eq!(op(&mut m, RegRegOp::Divu, 42, 0), u64::MAX);
        assert_eq!(op(&mut m, RegRegOp::Rem, 42, 0), 42);
        assert_eq!(op(&mut m, RegRegOp::Remu, 42, 0), 42);
        // Signed overflow wraps.
        let min = i64::MIN as u64;
        assert_eq!(op(&mut m, RegRegOp::Div, min, u64::MAX), min);
        assert_eq!(op(&mut m, RegRegOp::Rem, min, u64::MAX), 0);
    }

    #[test]
    fn test_word_ops_sign_extend() {
        let mut m = machine();
        m.cpu.registers_mut().set_x(x(5), 0x7FFF_FFFF);
        m.cpu.registers_mut().set_x(x(6), 1);
        run(
            &mut m,
            Instruction::Op32 {
                op: RegReg32Op::Addw,
                dest: x(7),
                src1: x(5),
                src2: x(6),
            },
        );
        // 0x7FFFFFFF + 1 wraps to -2^31, sign-extended to 64 bits.
        assert_eq!(m.cpu.registers().x(x(7)), 0xFFFF_FFFF_8000_0000);

        run(
            &mut m,
            Instruction::OpImm32 {
                dest: x(8),
                src: Specifier::X0,
                immediate: -1,
            },
        );
        assert_eq!(m.cpu.registers().x(x(8)), u64::MAX);
    }

    #[test]
    fn test_branches() {
        let mut m = machine();
        m.cpu.jump(0x1000);
        m.cpu.registers_mut().set_x(x(5), 5);
        m.cpu.registers_mut().set_x(x(6), 5);
        run(
            &mut m,
            Instruction::Branch {
                condition: BranchCondition::Beq,
                src1: x(5),
                src2: x(6),
                offset: 0x40,
            },
        );
        assert_eq!(m.cpu.pc(), 0x1040);
        run(
            &mut m,
            Instruction::Branch {
                condition: BranchCondition::Bne,
                src1: x(5),
                src2: x(6),
                offset: 0x40,
            },
        );
        // Not taken: falls through.
        assert_eq!(m.cpu.pc(), 0x1044);
    }

    #[test]
    fn test_jal_jalr_link() {
        let mut m = machine();
        m.cpu.jump(0x1000);
        run(
            &mut m,
            Instruction::Jal {
                dest: Specifier::RA,
                offset: 0x100,
            },
        );
        assert_eq!(m.cpu.pc(), 0x1100);
        assert_eq!(m.cpu.registers().x(Specifier::RA), 0x1004);
        // jalr clears the low target bit.
        m.cpu.registers_mut().set_x(x(5), 0x2001);
        run(
            &mut m,
            Instruction::Jalr {
                dest: Specifier::X0,
                base: x(5),
                offset: 0,
            },
        );
        assert_eq!(m.cpu.pc(), 0x2000);
    }

    #[test]
    fn test_loads_sign_extend() {
        let mut m = machine();
        m.memory.write_u32(0x5000, 0xFFFF_FF80).unwrap();
        m.cpu.registers_mut().set_x(x(5), 0x5000);
        run(
            &mut m,
            Instruction::Load {
                width: LoadWidth::Lb,
                dest: x(6),
                base: x(5),
                offset: 0,
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), (-128i64) as u64);
        run(
            &mut m,
            Instruction::Load {
                width: LoadWidth::Lbu,
                dest: x(6),
                base: x(5),
                offset: 0,
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), 0x80);
        run(
            &mut m,
            Instruction::Load {
                width: LoadWidth::Lw,
                dest: x(6),
                base: x(5),
                offset: 0,
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), 0xFFFF_FFFF_FFFF_FF80);
        run(
            &mut m,
            Instruction::Load {
                width: LoadWidth::Lwu,
                dest: x(6),
                base: x(5),
                offset: 0,
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), 0xFFFF_FF80);
    }

    #[test]
    fn test_amo_add_and_swap() {
        let mut m = machine();
        m.memory.write_u32(0x6000, 10).unwrap();
        m.cpu.registers_mut().set_x(x(5), 0x6000);
        m.cpu.registers_mut().set_x(x(6), 32);
        run(
            &mut m,
            Instruction::Amo {
                op: AmoOp::Add,
                size: AmoSize::Word,
                dest: x(7),
                addr: x(5),
                src: x(6),
            },
        );
        assert_eq!(m.cpu.registers().x(x(7)), 10);
        assert_eq!(m.memory.read_u32(0x6000).unwrap(), 42);
        // Same rd and rs2: the old value wins.
        m.cpu.registers_mut().set_x(x(6), 7);
        run(
            &mut m,
            Instruction::Amo {
                op: AmoOp::Swap,
                size: AmoSize::Word,
                dest: x(6),
                addr: x(5),
                src: x(6),
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), 42);
        assert_eq!(m.memory.read_u32(0x6000).unwrap(), 7);
    }

    #[test]
    fn test_amo_sign_extends_words() {
        let mut m = machine();
        m.memory.write_u32(0x6000, 0x8000_0000).unwrap();
        m.cpu.registers_mut().set_x(x(5), 0x6000);
        m.cpu.registers_mut().set_x(x(6), 0);
        run(
            &mut m,
            Instruction::Amo {
                op: AmoOp::Or,
                size: AmoSize::Word,
                dest: x(7),
                addr: x(5),
                src: x(6),
            },
        );
        assert_eq!(m.cpu.registers().x(x(7)), 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn test_amo_alignment() {
        let mut m = machine();
        m.cpu.registers_mut().set_x(x(5), 0x6001);
        let err = m
            .execute(
                Instruction::Amo {
                    op: AmoOp::Add,
                    size: AmoSize::Word,
                    dest: x(7),
                    addr: x(5),
                    src: x(6),
                },
                0,
                4,
            )
            .unwrap_err();
        assert!(matches!(err, MachineError::MisalignedAccess { .. }));
    }

    #[test]
    fn test_lr_sc_pairs() {
        let mut m = machine();
        m.memory.write_u32(0x6000, 5).unwrap();
        m.cpu.registers_mut().set_x(x(5), 0x6000);
        run(
            &mut m,
            Instruction::LoadReserved {
                size: AmoSize::Word,
                dest: x(6),
                addr: x(5),
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), 5);
        m.cpu.registers_mut().set_x(x(7), 6);
        run(
            &mut m,
            Instruction::StoreConditional {
                size: AmoSize::Word,
                dest: x(8),
                addr: x(5),
                src: x(7),
            },
        );
        assert_eq!(m.cpu.registers().x(x(8)), 0); // success
        assert_eq!(m.memory.read_u32(0x6000).unwrap(), 6);
        // Without a reservation the store-conditional fails.
        run(
            &mut m,
            Instruction::StoreConditional {
                size: AmoSize::Word,
                dest: x(8),
                addr: x(5),
                src: x(7),
            },
        );
        assert_eq!(m.cpu.registers().x(x(8)), 1);
        assert_eq!(m.memory.read_u32(0x6000).unwrap(), 6);
    }

    #[test]
    fn test_sc_defeated_by_intervening_store() {
        let mut m = machine();
        m.cpu.registers_mut().set_x(x(5), 0x6000);
        run(
            &mut m,
            Instruction::LoadReserved {
                size: AmoSize::Word,
                dest: x(6),
                addr: x(5),
            },
        );
        // An ordinary store into the reserved granule clears it.
        run(
            &mut m,
            Instruction::Store {
                width: StoreWidth::Sb,
                src: x(6),
                base: x(5),
                offset: 2,
            },
        );
        run(
            &mut m,
            Instruction::StoreConditional {
                size: AmoSize::Word,
                dest: x(8),
                addr: x(5),
                src: x(6),
            },
        );
        assert_eq!(m.cpu.registers().x(x(8)), 1);
    }

    #[test]
    fn test_csr_fcsr_roundtrip() {
        let mut m = machine();
        m.cpu.registers_mut().set_x(x(5), 0b101_00011);
        run(
            &mut m,
            Instruction::Csr {
                op: CsrOp::ReadWrite,
                dest: x(6),
                csr: 0x003,
                src: x(5),
            },
        );
        assert_eq!(m.cpu.registers().x(x(6)), 0);
        assert_eq!(m.cpu.registers().fcsr().fflags, 0b00011);
        assert_eq!(m.cpu.registers().fcsr().frm, 0b101);
        // csrrs with x0 reads without writing.
        run(
            &mut m,
            Instruction::Csr {
                op: CsrOp::ReadSet,
                dest: x(7),
                csr: 0x003,
                src: Specifier::X0,
            },
        );
        assert_eq!(m.cpu.registers().x(x(7)), 0b101_00011);
    }

    #[test]
    fn test_rdinstret_tracks_counter() {
        let mut m = machine();
        m.cpu.set_instruction_counter(123);
        run(
            &mut m,
            Instruction::Csr {
                op: CsrOp::ReadSet,
                dest: x(5),
                csr: 0xC02,
                src: Specifier::X0,
            },
        );
        assert_eq!(m.cpu.registers().x(x(5)), 123);
    }

    #[test]
    fn test_unknown_csr_is_illegal() {
        let mut m = machine();
        let err = m
            .execute(
                Instruction::Csr {
                    op: CsrOp::ReadSet,
                    dest: x(5),
                    csr: 0x301, // misa
                    src: Specifier::X0,
                },
                0xDEAD,
                4,
            )
            .unwrap_err();
        assert!(matches!(err, MachineError::IllegalInstruction { .. }));
    }

    #[test]
    fn test_upper_counter_halves_are_rv32_only() {
        let mut m32 = rv32();
        m32.cpu.set_instruction_counter(0x1_0000_0005);
        run(
            &mut m32,
            Instruction::Csr {
                op: CsrOp::ReadSet,
                dest: x(5),
                csr: 0xC82,
                src: Specifier::X0,
            },
        );
        assert_eq!(m32.cpu.registers().x(x(5)), 1);

        let mut m64 = machine();
        assert!(m64
            .execute(
                Instruction::Csr {
                    op: CsrOp::ReadSet,
                    dest: x(5),
                    csr: 0xC82,
                    src: Specifier::X0,
                },
                0,
                4,
            )
            .is_err());
    }

    #[test]
    fn test_rv32_wrapping() {
        let mut m = rv32();
        assert_eq!(op(&mut m, RegRegOp::Add, u32::MAX, 1), 0);
        assert_eq!(op(&mut m, RegRegOp::Sll, 1, 32), 1);
        assert_eq!(op(&mut m, RegRegOp::Mulh, u32::MAX, u32::MAX), 0);
    }
}
