//! Instruction decoding for the 32-bit encodings.
//!
//! [`Instruction`] holds any supported instruction in decoded form. The
//! compressed (16-bit) encodings expand into the same enum, see
//! [`crate::compressed`].
//!
//! Decoding is width-aware: encodings that only exist on wider base ISAs
//! (`ld`, `addiw`, 6-bit shift amounts, ...) are rejected when decoding for
//! a narrower machine.

use crate::registers::Specifier;
use thiserror::Error;

/// Data structure that can hold any supported instruction in its decoded
/// form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    OpImm {
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shamt: u32,
    },
    /// RV64 word-sized immediate ops (`addiw`).
    OpImm32 {
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    /// RV64 word-sized immediate shifts (`slliw`, `srliw`, `sraiw`).
    OpShiftImm32 {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shamt: u32,
    },
    Auipc {
        dest: Specifier,
        immediate: i32,
    },
    Lui {
        dest: Specifier,
        immediate: i32,
    },
    Op {
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    /// RV64 word-sized register-register ops (`addw`, ..., `remuw`).
    Op32 {
        op: RegReg32Op,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Jal {
        dest: Specifier,
        offset: i32,
    },
    Jalr {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Branch {
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    },
    Load {
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Store {
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    Fence,
    Ecall,
    Ebreak,
    /// The vendor encoding (`SYSTEM` with immediate `0x7FF`) that stops the
    /// machine from guest code.
    Stop,
    Csr {
        op: CsrOp,
        dest: Specifier,
        csr: u16,
        src: Specifier,
    },
    Csri {
        op: CsrOp,
        dest: Specifier,
        csr: u16,
        immediate: u32,
    },
    LoadReserved {
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
    },
    StoreConditional {
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    },
    Amo {
        op: AmoOp,
        size: AmoSize,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    },
    FpLoad {
        width: FpWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    FpStore {
        width: FpWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    FpOp {
        op: FpBinaryOp,
        width: FpWidth,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    FpSqrt {
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
    },
    FpFma {
        op: FmaOp,
        width: FpWidth,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        src3: Specifier,
    },
    FpCmp {
        op: FpCmpOp,
        width: FpWidth,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    /// `fcvt.{w,wu,l,lu}.{s,d}`: float to integer register.
    FpCvtToInt {
        width: FpWidth,
        target: IntWidth,
        dest: Specifier,
        src: Specifier,
    },
    /// `fcvt.{s,d}.{w,wu,l,lu}`: integer register to float.
    FpCvtFromInt {
        width: FpWidth,
        source: IntWidth,
        dest: Specifier,
        src: Specifier,
    },
    /// `fcvt.s.d` / `fcvt.d.s`.
    FpCvtFloat {
        from: FpWidth,
        to: FpWidth,
        dest: Specifier,
        src: Specifier,
    },
    /// `fmv.x.w` / `fmv.x.d`: raw bit move into the integer file.
    FpMvToInt {
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
    },
    /// `fmv.w.x` / `fmv.d.x`: raw bit move from the integer file.
    FpMvFromInt {
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
    },
    FpClass {
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegShiftImmOp {
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRegOp {
    Add,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sub,
    Sra,
    // M extension
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegReg32Op {
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    Mulw,
    Divw,
    Divuw,
    Remw,
    Remuw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
    Beq,
    Bne,
    Blt,
    Bltu,
    Bge,
    Bgeu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadWidth {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
    /// RV64 only.
    Lwu,
    /// RV64 only.
    Ld,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreWidth {
    Sb,
    Sh,
    Sw,
    /// RV64 only.
    Sd,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

/// Operand size of an A-extension access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoSize {
    Word,
    /// RV64 only.
    Double,
}

impl AmoSize {
    pub fn bytes(self) -> u32 {
        match self {
            Self::Word => 4,
            Self::Double => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpWidth {
    Single,
    Double,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    SgnJ,
    SgnJn,
    SgnJx,
    Min,
    Max,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FmaOp {
    Madd,
    Msub,
    Nmsub,
    Nmadd,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpCmpOp {
    Eq,
    Lt,
    Le,
}

/// Integer operand width of a float conversion.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IntWidth {
    Word,
    WordUnsigned,
    /// RV64 only.
    Long,
    /// RV64 only.
    LongUnsigned,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("instruction has unsupported opcode")]
    UnsupportedOpcode,
    #[error("illegal instruction")]
    IllegalInstruction,
}

impl Instruction {
    /// Decode a 32-bit instruction word for a machine with the given base
    /// ISA width (`xlen` is 32, 64 or 128).
    pub fn decode(raw: u32, xlen: u32) -> Result<Self, DecodeError> {
        match opcode(raw).ok_or(DecodeError::UnsupportedOpcode)? {
            Opcode::OpImm => decode_op_imm(raw, xlen),
            Opcode::OpImm32 => {
                if xlen < 64 {
                    return Err(DecodeError::IllegalInstruction);
                }
                decode_op_imm32(raw)
            }
            Opcode::Auipc => Ok(Self::Auipc {
                dest: rd(raw),
                immediate: u_imm(raw),
            }),
            Opcode::Lui => Ok(Self::Lui {
                dest: rd(raw),
                immediate: u_imm(raw),
            }),
            Opcode::Op => match r_funct(raw) {
                Some(op) => Ok(Self::Op {
                    op,
                    dest: rd(raw),
                    src1: rs1(raw),
                    src2: rs2(raw),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Op32 => {
                if xlen < 64 {
                    return Err(DecodeError::IllegalInstruction);
                }
                match r32_funct(raw) {
                    Some(op) => Ok(Self::Op32 {
                        op,
                        dest: rd(raw),
                        src1: rs1(raw),
                        src2: rs2(raw),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                }
            }
            Opcode::Jal => Ok(Self::Jal {
                dest: rd(raw),
                offset: j_imm(raw),
            }),
            Opcode::Jalr => Ok(Self::Jalr {
                dest: rd(raw),
                base: rs1(raw),
                offset: i_imm(raw),
            }),
            Opcode::Branch => match b_funct(raw) {
                Some(condition) => Ok(Self::Branch {
                    condition,
                    src1: rs1(raw),
                    src2: rs2(raw),
                    offset: b_imm(raw),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Load => match i_width(raw, xlen) {
                Some(width) => Ok(Self::Load {
                    width,
                    dest: rd(raw),
                    base: rs1(raw),
                    offset: i_imm(raw),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Store => match s_width(raw, xlen) {
                Some(width) => Ok(Self::Store {
                    width,
                    src: rs2(raw),
                    base: rs1(raw),
                    offset: s_imm(raw),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            // All FENCE variants (including unknown fm/rs1/rd fields, which
            // the spec says to treat as plain fences for forward
            // compatibility) order nothing on a single in-order hart.
            Opcode::MiscMem => match funct3(raw) {
                0b000 | 0b001 => Ok(Self::Fence),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::System => decode_system(raw),
            Opcode::Amo => decode_amo(raw, xlen),
            Opcode::LoadFp => match fp_mem_width(raw) {
                Some(width) => Ok(Self::FpLoad {
                    width,
                    dest: rd(raw),
                    base: rs1(raw),
                    offset: i_imm(raw),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::StoreFp => match fp_mem_width(raw) {
                Some(width) => Ok(Self::FpStore {
                    width,
                    src: rs2(raw),
                    base: rs1(raw),
                    offset: s_imm(raw),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::OpFp => decode_op_fp(raw, xlen),
            Opcode::Madd => decode_fma(raw, FmaOp::Madd),
            Opcode::Msub => decode_fma(raw, FmaOp::Msub),
            Opcode::Nmsub => decode_fma(raw, FmaOp::Nmsub),
            Opcode::Nmadd => decode_fma(raw, FmaOp::Nmadd),
        }
    }

    /// `true` for instructions that, once decoded, unconditionally transfer
    /// control (used by callers that care about fall-through).
    pub fn is_jump(&self) -> bool {
        matches!(self, Self::Jal { .. } | Self::Jalr { .. })
    }
}

fn decode_op_imm(raw: u32, xlen: u32) -> Result<Instruction, DecodeError> {
    if let Some(op) = i_funct(raw) {
        return Ok(Instruction::OpImm {
            op,
            dest: rd(raw),
            src: rs1(raw),
            immediate: i_imm(raw),
        });
    }
    match shift_funct(raw, xlen) {
        Some((op, shamt)) => Ok(Instruction::OpShiftImm {
            op,
            dest: rd(raw),
            src: rs1(raw),
            shamt,
        }),
        None => Err(DecodeError::IllegalInstruction),
    }
}

fn decode_op_imm32(raw: u32) -> Result<Instruction, DecodeError> {
    match funct3(raw) {
        0b000 => Ok(Instruction::OpImm32 {
            dest: rd(raw),
            src: rs1(raw),
            immediate: i_imm(raw),
        }),
        // Word-sized shifts always take a 5-bit shift amount.
        _ => match shift_funct(raw, 32) {
            Some((op, shamt)) => Ok(Instruction::OpShiftImm32 {
                op,
                dest: rd(raw),
                src: rs1(raw),
                shamt,
            }),
            None => Err(DecodeError::IllegalInstruction),
        },
    }
}

fn decode_system(raw: u32) -> Result<Instruction, DecodeError> {
    let csr = ((raw >> 20) & 0xFFF) as u16;
    match funct3(raw) {
        0b000 => {
            if u8::from(rd(raw)) != 0 || u8::from(rs1(raw)) != 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            match csr {
                0 => Ok(Instruction::Ecall),
                1 => Ok(Instruction::Ebreak),
                0x7FF => Ok(Instruction::Stop),
                _ => Err(DecodeError::IllegalInstruction),
            }
        }
        0b001 => Ok(csr_reg(raw, CsrOp::ReadWrite, csr)),
        0b010 => Ok(csr_reg(raw, CsrOp::ReadSet, csr)),
        0b011 => Ok(csr_reg(raw, CsrOp::ReadClear, csr)),
        0b101 => Ok(csr_imm(raw, CsrOp::ReadWrite, csr)),
        0b110 => Ok(csr_imm(raw, CsrOp::ReadSet, csr)),
        0b111 => Ok(csr_imm(raw, CsrOp::ReadClear, csr)),
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn csr_reg(raw: u32, op: CsrOp, csr: u16) -> Instruction {
    Instruction::Csr {
        op,
        dest: rd(raw),
        csr,
        src: rs1(raw),
    }
}

fn csr_imm(raw: u32, op: CsrOp, csr: u16) -> Instruction {
    Instruction::Csri {
        op,
        dest: rd(raw),
        csr,
        immediate: (raw >> 15) & 0x1F,
    }
}

fn decode_amo(raw: u32, xlen: u32) -> Result<Instruction, DecodeError> {
    let size = match funct3(raw) {
        0b010 => AmoSize::Word,
        0b011 if xlen >= 64 => AmoSize::Double,
        _ => return Err(DecodeError::IllegalInstruction),
    };
    let funct5 = raw >> 27;
    let (dest, addr, src) = (rd(raw), rs1(raw), rs2(raw));
    match funct5 {
        0b00010 => {
            if u8::from(src) != 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            Ok(Instruction::LoadReserved { size, dest, addr })
        }
        0b00011 => Ok(Instruction::StoreConditional {
            size,
            dest,
            addr,
            src,
        }),
        0b00001 => Ok(Instruction::Amo {
            op: AmoOp::Swap,
            size,
            dest,
            addr,
            src,
        }),
        0b00000 => Ok(Instruction::Amo {
            op: AmoOp::Add,
            size,
            dest,
            addr,
            src,
        }),
        0b00100 => Ok(Instruction::Amo {
            op: AmoOp::Xor,
            size,
            dest,
            addr,
            src,
        }),
        0b01100 => Ok(Instruction::Amo {
            op: AmoOp::And,
            size,
            dest,
            addr,
            src,
        }),
        0b01000 => Ok(Instruction::Amo {
            op: AmoOp::Or,
            size,
            dest,
            addr,
            src,
        }),
        0b10000 => Ok(Instruction::Amo {
            op: AmoOp::Min,
            size,
            dest,
            addr,
            src,
        }),
        0b10100 => Ok(Instruction::Amo {
            op: AmoOp::Max,
            size,
            dest,
            addr,
            src,
        }),
        0b11000 => Ok(Instruction::Amo {
            op: AmoOp::Minu,
            size,
            dest,
            addr,
            src,
        }),
        0b11100 => Ok(Instruction::Amo {
            op: AmoOp::Maxu,
            size,
            dest,
            addr,
            src,
        }),
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn decode_op_fp(raw: u32, xlen: u32) -> Result<Instruction, DecodeError> {
    let funct7 = raw >> 25;
    let width = match funct7 & 0b11 {
        0b00 => FpWidth::Single,
        0b01 => FpWidth::Double,
        _ => return Err(DecodeError::IllegalInstruction),
    };
    let (dest, src1, src2) = (rd(raw), rs1(raw), rs2(raw));
    let rs2_field = u8::from(src2);
    match funct7 >> 2 {
        0b00000 => Ok(Instruction::FpOp {
            op: FpBinaryOp::Add,
            width,
            dest,
            src1,
            src2,
        }),
        0b00001 => Ok(Instruction::FpOp {
            op: FpBinaryOp::Sub,
            width,
            dest,
            src1,
            src2,
        }),
        0b00010 => Ok(Instruction::FpOp {
            op: FpBinaryOp::Mul,
            width,
            dest,
            src1,
            src2,
        }),
        0b00011 => Ok(Instruction::FpOp {
            op: FpBinaryOp::Div,
            width,
            dest,
            src1,
            src2,
        }),
        0b01011 if rs2_field == 0 => Ok(Instruction::FpSqrt {
            width,
            dest,
            src: src1,
        }),
        0b00100 => {
            let op = match funct3(raw) {
                0b000 => FpBinaryOp::SgnJ,
                0b001 => FpBinaryOp::SgnJn,
                0b010 => FpBinaryOp::SgnJx,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::FpOp {
                op,
                width,
                dest,
                src1,
                src2,
            })
        }
        0b00101 => {
            let op = match funct3(raw) {
                0b000 => FpBinaryOp::Min,
                0b001 => FpBinaryOp::Max,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::FpOp {
                op,
                width,
                dest,
                src1,
                src2,
            })
        }
        0b10100 => {
            let op = match funct3(raw) {
                0b010 => FpCmpOp::Eq,
                0b001 => FpCmpOp::Lt,
                0b000 => FpCmpOp::Le,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::FpCmp {
                op,
                width,
                dest,
                src1,
                src2,
            })
        }
        0b11000 => Ok(Instruction::FpCvtToInt {
            width,
            target: int_width(rs2_field, xlen)?,
            dest,
            src: src1,
        }),
        0b11010 => Ok(Instruction::FpCvtFromInt {
            width,
            source: int_width(rs2_field, xlen)?,
            dest,
            src: src1,
        }),
        0b01000 => match (width, rs2_field) {
            (FpWidth::Single, 1) => Ok(Instruction::FpCvtFloat {
                from: FpWidth::Double,
                to: FpWidth::Single,
                dest,
                src: src1,
            }),
            (FpWidth::Double, 0) => Ok(Instruction::FpCvtFloat {
                from: FpWidth::Single,
                to: FpWidth::Double,
                dest,
                src: src1,
            }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b11100 if rs2_field == 0 => match funct3(raw) {
            0b000 => {
                if width == FpWidth::Double && xlen < 64 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::FpMvToInt {
                    width,
                    dest,
                    src: src1,
                })
            }
            0b001 => Ok(Instruction::FpClass {
                width,
                dest,
                src: src1,
            }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b11110 if rs2_field == 0 && funct3(raw) == 0 => {
            if width == FpWidth::Double && xlen < 64 {
                return Err(DecodeError::IllegalInstruction);
            }
            Ok(Instruction::FpMvFromInt {
                width,
                dest,
                src: src1,
            })
        }
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn decode_fma(raw: u32, op: FmaOp) -> Result<Instruction, DecodeError> {
    let width = match (raw >> 25) & 0b11 {
        0b00 => FpWidth::Single,
        0b01 => FpWidth::Double,
        _ => return Err(DecodeError::IllegalInstruction),
    };
    Ok(Instruction::FpFma {
        op,
        width,
        dest: rd(raw),
        src1: rs1(raw),
        src2: rs2(raw),
        src3: Specifier::from_u5((raw >> 27) as u8),
    })
}

fn int_width(rs2_field: u8, xlen: u32) -> Result<IntWidth, DecodeError> {
    match rs2_field {
        0 => Ok(IntWidth::Word),
        1 => Ok(IntWidth::WordUnsigned),
        2 if xlen >= 64 => Ok(IntWidth::Long),
        3 if xlen >= 64 => Ok(IntWidth::LongUnsigned),
        _ => Err(DecodeError::IllegalInstruction),
    }
}

/// Returns the 7-bit *opcode* value of the instruction, or `None` if it
/// isn't supported.
fn opcode(raw: u32) -> Option<Opcode> {
    #[allow(clippy::unusual_byte_groupings)]
    match raw & 0x7F {
        0b00_000_11 => Some(Opcode::Load),
        0b00_001_11 => Some(Opcode::LoadFp),
        0b00_011_11 => Some(Opcode::MiscMem),
        0b00_100_11 => Some(Opcode::OpImm),
        0b00_101_11 => Some(Opcode::Auipc),
        0b00_110_11 => Some(Opcode::OpImm32),
        0b01_000_11 => Some(Opcode::Store),
        0b01_001_11 => Some(Opcode::StoreFp),
        0b01_011_11 => Some(Opcode::Amo),
        0b01_100_11 => Some(Opcode::Op),
        0b01_101_11 => Some(Opcode::Lui),
        0b01_110_11 => Some(Opcode::Op32),
        0b10_000_11 => Some(Opcode::Madd),
        0b10_001_11 => Some(Opcode::Msub),
        0b10_010_11 => Some(Opcode::Nmsub),
        0b10_011_11 => Some(Opcode::Nmadd),
        0b10_100_11 => Some(Opcode::OpFp),
        0b11_000_11 => Some(Opcode::Branch),
        0b11_001_11 => Some(Opcode::Jalr),
        0b11_011_11 => Some(Opcode::Jal),
        0b11_100_11 => Some(Opcode::System),
        _ => None,
    }
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type
/// instructions.
fn rd(raw: u32) -> Specifier {
    Specifier::from_u5(((raw >> 7) & 0x1F) as u8)
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type
/// instructions.
fn rs1(raw: u32) -> Specifier {
    Specifier::from_u5(((raw >> 15) & 0x1F) as u8)
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(raw: u32) -> Specifier {
    Specifier::from_u5(((raw >> 20) & 0x1F) as u8)
}

fn i_funct(raw: u32) -> Option<RegImmOp> {
    match funct3(raw) {
        0b000 => Some(RegImmOp::Addi),
        0b010 => Some(RegImmOp::Slti),
        0b011 => Some(RegImmOp::Sltiu),
        0b100 => Some(RegImmOp::Xori),
        0b110 => Some(RegImmOp::Ori),
        0b111 => Some(RegImmOp::Andi),
        _ => None,
    }
}

/// Decodes immediate shifts. The shift amount field widens with the base
/// ISA: 5 bits on RV32, 6 on RV64, 7 on RV128.
fn shift_funct(raw: u32, xlen: u32) -> Option<(RegShiftImmOp, u32)> {
    let shamt_bits = match xlen {
        32 => 5,
        64 => 6,
        _ => 7,
    };
    let shamt = (raw >> 20) & ((1 << shamt_bits) - 1);
    // Everything above the shift amount except bit 30 must be zero.
    let high = (raw >> 20) >> shamt_bits;
    let arith = raw >> 30 & 1 == 1;
    if high & !(1 << (10 - shamt_bits)) != 0 {
        return None;
    }
    match (arith, funct3(raw)) {
        (false, 0b001) => Some((RegShiftImmOp::Slli, shamt)),
        (false, 0b101) => Some((RegShiftImmOp::Srli, shamt)),
        (true, 0b101) => Some((RegShiftImmOp::Srai, shamt)),
        (true, 0b001) => None,
        _ => None,
    }
}

fn i_width(raw: u32, xlen: u32) -> Option<LoadWidth> {
    match funct3(raw) {
        0b000 => Some(LoadWidth::Lb),
        0b001 => Some(LoadWidth::Lh),
        0b010 => Some(LoadWidth::Lw),
        0b100 => Some(LoadWidth::Lbu),
        0b101 => Some(LoadWidth::Lhu),
        0b110 if xlen >= 64 => Some(LoadWidth::Lwu),
        0b011 if xlen >= 64 => Some(LoadWidth::Ld),
        _ => None,
    }
}

fn s_width(raw: u32, xlen: u32) -> Option<StoreWidth> {
    match funct3(raw) {
        0b000 => Some(StoreWidth::Sb),
        0b001 => Some(StoreWidth::Sh),
        0b010 => Some(StoreWidth::Sw),
        0b011 if xlen >= 64 => Some(StoreWidth::Sd),
        _ => None,
    }
}

fn r_funct(raw: u32) -> Option<RegRegOp> {
    match (funct7(raw), funct3(raw)) {
        (0b0000000, 0b000) => Some(RegRegOp::Add),
        (0b0000000, 0b001) => Some(RegRegOp::Sll),
        (0b0000000, 0b010) => Some(RegRegOp::Slt),
        (0b0000000, 0b011) => Some(RegRegOp::Sltu),
        (0b0000000, 0b100) => Some(RegRegOp::Xor),
        (0b0000000, 0b101) => Some(RegRegOp::Srl),
        (0b0000000, 0b110) => Some(RegRegOp::Or),
        (0b0000000, 0b111) => Some(RegRegOp::And),
        (0b0100000, 0b000) => Some(RegRegOp::Sub),
        (0b0100000, 0b101) => Some(RegRegOp::Sra),
        (0b0000001, 0b000) => Some(RegRegOp::Mul),
        (0b0000001, 0b001) => Some(RegRegOp::Mulh),
        (0b0000001, 0b010) => Some(RegRegOp::Mulhsu),
        (0b0000001, 0b011) => Some(RegRegOp::Mulhu),
        (0b0000001, 0b100) => Some(RegRegOp::Div),
        (0b0000001, 0b101) => Some(RegRegOp::Divu),
        (0b0000001, 0b110) => Some(RegRegOp::Rem),
        (0b0000001, 0b111) => Some(RegRegOp::Remu),
        _ => None,
    }
}

fn r32_funct(raw: u32) -> Option<RegReg32Op> {
    match (funct7(raw), funct3(raw)) {
        (0b0000000, 0b000) => Some(RegReg32Op::Addw),
        (0b0100000, 0b000) => Some(RegReg32Op::Subw),
        (0b0000000, 0b001) => Some(RegReg32Op::Sllw),
        (0b0000000, 0b101) => Some(RegReg32Op::Srlw),
        (0b0100000, 0b101) => Some(RegReg32Op::Sraw),
        (0b0000001, 0b000) => Some(RegReg32Op::Mulw),
        (0b0000001, 0b100) => Some(RegReg32Op::Divw),
        (0b0000001, 0b101) => Some(RegReg32Op::Divuw),
        (0b0000001, 0b110) => Some(RegReg32Op::Remw),
        (0b0000001, 0b111) => Some(RegReg32Op::Remuw),
        _ => None,
    }
}

fn b_funct(raw: u32) -> Option<BranchCondition> {
    match funct3(raw) {
        0b000 => Some(BranchCondition::Beq),
        0b001 => Some(BranchCondition::Bne),
        0b100 => Some(BranchCondition::Blt),
        0b101 => Some(BranchCondition::Bge),
        0b110 => Some(BranchCondition::Bltu),
        0b111 => Some(BranchCondition::Bgeu),
        _ => None,
    }
}

fn fp_mem_width(raw: u32) -> Option<FpWidth> {
    match funct3(raw) {
        0b010 => Some(FpWidth::Single),
        0b011 => Some(FpWidth::Double),
        _ => None,
    }
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type
/// instructions.
fn funct3(raw: u32) -> u8 {
    ((raw >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(raw: u32) -> u8 {
    (raw >> 25) as u8
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(raw: u32) -> i32 {
    raw as i32 >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(raw: u32) -> i32 {
    let imm_11_5 = raw & 0x7F00_0000;
    let imm_4_0 = raw & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(raw: u32) -> i32 {
    let imm_12 = raw & 0x8000_0000;
    let imm_10_5 = raw & 0x7E00_0000;
    let imm_4_1 = raw & 0x0000_0F00;
    let imm_11 = raw & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(raw: u32) -> i32 {
    (raw & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(raw: u32) -> i32 {
    let imm_20 = raw & 0x8000_0000;
    let imm_10_1 = raw & 0x7FE0_0000;
    let imm_11 = raw & 0x0010_0000;
    let imm_19_12 = raw & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Opcode {
    OpImm,
    OpImm32,
    Auipc,
    Lui,
    Op,
    Op32,
    Jal,
    Jalr,
    Branch,
    Load,
    Store,
    MiscMem,
    System,
    Amo,
    LoadFp,
    StoreFp,
    OpFp,
    Madd,
    Msub,
    Nmsub,
    Nmadd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i_imm() {
        // Boundary values of the 12-bit signed field.
        assert_eq!(0, i_imm(0x0000_0000));
        assert_eq!(-1, i_imm(0xFFF0_0000));
        assert_eq!(2047, i_imm(2047 << 20));
        assert_eq!(-2048, i_imm(0x8000_0000));
        assert_eq!(-300, i_imm((-300_i32 << 20) as u32));
        // Bits below the immediate field must not leak into the result.
        assert_eq!(0, i_imm(0x000F_FFFF));
        assert_eq!(-1, i_imm(0xFFF7_65A1));
        assert_eq!(777, i_imm((777 << 20) | 0x0003_B86D));
    }

    #[test]
    fn test_decode_addi() {
        // addi a0, x0, 42
        let raw = (42 << 20) | (10 << 7) | 0b0010011;
        assert_eq!(
            Instruction::decode(raw, 64),
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(10),
                src: Specifier::X0,
                immediate: 42,
            })
        );
    }

    #[test]
    fn test_decode_shift_amount_widths() {
        // slli a0, a0, 42 only exists on RV64 and wider.
        let raw = (42 << 20) | (0b001 << 12) | (10 << 15) | (10 << 7) | 0b0010011;
        assert!(Instruction::decode(raw, 32).is_err());
        assert_eq!(
            Instruction::decode(raw, 64),
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest: Specifier::from_u5(10),
                src: Specifier::from_u5(10),
                shamt: 42,
            })
        );
    }

    #[test]
    fn test_decode_width_gated_loads() {
        // ld a1, 0(a0)
        let raw = (0b011 << 12) | (10 << 15) | (11 << 7) | 0b0000011;
        assert!(Instruction::decode(raw, 32).is_err());
        assert_eq!(
            Instruction::decode(raw, 64),
            Ok(Instruction::Load {
                width: LoadWidth::Ld,
                dest: Specifier::from_u5(11),
                base: Specifier::from_u5(10),
                offset: 0,
            })
        );
    }

    #[test]
    fn test_decode_system() {
        let ecall = 0b1110011;
        let ebreak = (1 << 20) | 0b1110011;
        let stop = (0x7FF << 20) | 0b1110011;
        assert_eq!(Instruction::decode(ecall, 32), Ok(Instruction::Ecall));
        assert_eq!(Instruction::decode(ebreak, 32), Ok(Instruction::Ebreak));
        assert_eq!(Instruction::decode(stop, 32), Ok(Instruction::Stop));
    }

    #[test]
    fn test_decode_mul() {
        // mul a0, a1, a2
        let raw = (1 << 25) | (12 << 20) | (11 << 15) | (10 << 7) | 0b0110011;
        assert_eq!(
            Instruction::decode(raw, 32),
            Ok(Instruction::Op {
                op: RegRegOp::Mul,
                dest: Specifier::from_u5(10),
                src1: Specifier::from_u5(11),
                src2: Specifier::from_u5(12),
            })
        );
    }

    #[test]
    fn test_decode_amo() {
        // amoadd.w a0, a1, (a2)
        let raw = (12 << 15) | (11 << 20) | (0b010 << 12) | (10 << 7) | 0b0101111;
        assert_eq!(
            Instruction::decode(raw, 32),
            Ok(Instruction::Amo {
                op: AmoOp::Add,
                size: AmoSize::Word,
                dest: Specifier::from_u5(10),
                addr: Specifier::from_u5(12),
                src: Specifier::from_u5(11),
            })
        );
        // lr.w with a nonzero rs2 field is reserved.
        let bad_lr = (0b00010 << 27) | (1 << 20) | (0b010 << 12) | 0b0101111;
        assert!(Instruction::decode(bad_lr, 32).is_err());
    }

    #[test]
    fn test_decode_fp() {
        // fadd.d f1, f2, f3
        let raw = (0b0000001 << 25) | (3 << 20) | (2 << 15) | (1 << 7) | 0b1010011;
        assert_eq!(
            Instruction::decode(raw, 64),
            Ok(Instruction::FpOp {
                op: FpBinaryOp::Add,
                width: FpWidth::Double,
                dest: Specifier::from_u5(1),
                src1: Specifier::from_u5(2),
                src2: Specifier::from_u5(3),
            })
        );
        // fmv.x.d requires RV64.
        let fmv_x_d = (0b1110001 << 25) | (2 << 15) | (1 << 7) | 0b1010011;
        assert!(Instruction::decode(fmv_x_d, 32).is_err());
        assert!(Instruction::decode(fmv_x_d, 64).is_ok());
    }
}
