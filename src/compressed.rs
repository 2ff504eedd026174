//! Compressed (16-bit) instruction decoding.
//!
//! Every compressed encoding expands to a regular [`Instruction`], so the
//! execution path is shared; only the program counter advance differs (2
//! instead of 4 bytes).

use crate::instruction::{
    BranchCondition, DecodeError, FpWidth, Instruction, LoadWidth, RegImmOp, RegRegOp,
    RegShiftImmOp, StoreWidth,
};
use crate::registers::Specifier;

/// Decode a 16-bit instruction parcel for a machine with the given base ISA
/// width.
pub fn decode(raw: u16, xlen: u32) -> Result<Instruction, DecodeError> {
    // The all-zeros parcel is defined illegal; it usually means execution
    // ran off into zeroed memory.
    if raw == 0 {
        return Err(DecodeError::IllegalInstruction);
    }
    match raw & 0b11 {
        0b00 => decode_q0(raw, xlen),
        0b01 => decode_q1(raw, xlen),
        0b10 => decode_q2(raw, xlen),
        _ => Err(DecodeError::UnsupportedOpcode),
    }
}

fn decode_q0(raw: u16, xlen: u32) -> Result<Instruction, DecodeError> {
    match funct3(raw) {
        0b000 => {
            // c.addi4spn rd', sp, nzuimm
            let imm = ((raw >> 7) & 0x30) // nzuimm[5:4]
                | ((raw >> 1) & 0x3C0) // nzuimm[9:6]
                | ((raw >> 4) & 0x4) // nzuimm[2]
                | ((raw >> 2) & 0x8); // nzuimm[3]
            if imm == 0 {
                return Err(DecodeError::IllegalInstruction);
            }
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: rd_c(raw),
                src: Specifier::SP,
                immediate: imm as i32,
            })
        }
        0b001 => Ok(Instruction::FpLoad {
            width: FpWidth::Double,
            dest: rd_c(raw),
            base: rs1_c(raw),
            offset: uimm_8(raw) as i32,
        }),
        0b010 => Ok(Instruction::Load {
            width: LoadWidth::Lw,
            dest: rd_c(raw),
            base: rs1_c(raw),
            offset: uimm_4(raw) as i32,
        }),
        0b011 => {
            if xlen >= 64 {
                Ok(Instruction::Load {
                    width: LoadWidth::Ld,
                    dest: rd_c(raw),
                    base: rs1_c(raw),
                    offset: uimm_8(raw) as i32,
                })
            } else {
                Ok(Instruction::FpLoad {
                    width: FpWidth::Single,
                    dest: rd_c(raw),
                    base: rs1_c(raw),
                    offset: uimm_4(raw) as i32,
                })
            }
        }
        0b101 => Ok(Instruction::FpStore {
            width: FpWidth::Double,
            src: rd_c(raw),
            base: rs1_c(raw),
            offset: uimm_8(raw) as i32,
        }),
        0b110 => Ok(Instruction::Store {
            width: StoreWidth::Sw,
            src: rd_c(raw),
            base: rs1_c(raw),
            offset: uimm_4(raw) as i32,
        }),
        0b111 => {
            if xlen >= 64 {
                Ok(Instruction::Store {
                    width: StoreWidth::Sd,
                    src: rd_c(raw),
                    base: rs1_c(raw),
                    offset: uimm_8(raw) as i32,
                })
            } else {
                Ok(Instruction::FpStore {
                    width: FpWidth::Single,
                    src: rd_c(raw),
                    base: rs1_c(raw),
                    offset: uimm_4(raw) as i32,
                })
            }
        }
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn decode_q1(raw: u16, xlen: u32) -> Result<Instruction, DecodeError> {
    match funct3(raw) {
        0b000 => {
            // c.nop / c.addi
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: rd_full(raw),
                src: rd_full(raw),
                immediate: imm_6(raw),
            })
        }
        0b001 => {
            if xlen >= 64 {
                // c.addiw
                if u8::from(rd_full(raw)) == 0 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::OpImm32 {
                    dest: rd_full(raw),
                    src: rd_full(raw),
                    immediate: imm_6(raw),
                })
            } else {
                // c.jal
                Ok(Instruction::Jal {
                    dest: Specifier::RA,
                    offset: j_target(raw),
                })
            }
        }
        0b010 => Ok(Instruction::OpImm {
            op: RegImmOp::Addi,
            dest: rd_full(raw),
            src: Specifier::X0,
            immediate: imm_6(raw),
        }),
        0b011 => {
            let dest = rd_full(raw);
            if u8::from(dest) == 2 {
                // c.addi16sp
                let imm = (((raw >> 12) & 1) as i32) << 9
                    | (((raw >> 3) & 0x3) as i32) << 7
                    | (((raw >> 5) & 1) as i32) << 6
                    | (((raw >> 2) & 1) as i32) << 5
                    | (((raw >> 6) & 1) as i32) << 4;
                let imm = (imm << 22) >> 22; // sign-extend from bit 9
                if imm == 0 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::OpImm {
                    op: RegImmOp::Addi,
                    dest: Specifier::SP,
                    src: Specifier::SP,
                    immediate: imm,
                })
            } else {
                // c.lui
                let imm = (((raw >> 12) & 1) as i32) << 17 | (((raw >> 2) & 0x1F) as i32) << 12;
                let imm = (imm << 14) >> 14; // sign-extend from bit 17
                if imm == 0 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::Lui {
                    dest,
                    immediate: imm,
                })
            }
        }
        0b100 => {
            let dest = rs1_c(raw);
            match (raw >> 10) & 0b11 {
                0b00 | 0b01 => {
                    let op = if (raw >> 10) & 1 == 0 {
                        RegShiftImmOp::Srli
                    } else {
                        RegShiftImmOp::Srai
                    };
                    let shamt = shamt_6(raw);
                    if xlen == 32 && shamt >= 32 {
                        return Err(DecodeError::IllegalInstruction);
                    }
                    Ok(Instruction::OpShiftImm {
                        op,
                        dest,
                        src: dest,
                        shamt,
                    })
                }
                0b10 => Ok(Instruction::OpImm {
                    op: RegImmOp::Andi,
                    dest,
                    src: dest,
                    immediate: imm_6(raw),
                }),
                _ => {
                    let src2 = rs2_c(raw);
                    match ((raw >> 12) & 1, (raw >> 5) & 0b11) {
                        (0, 0b00) => Ok(op_rr(RegRegOp::Sub, dest, src2)),
                        (0, 0b01) => Ok(op_rr(RegRegOp::Xor, dest, src2)),
                        (0, 0b10) => Ok(op_rr(RegRegOp::Or, dest, src2)),
                        (0, 0b11) => Ok(op_rr(RegRegOp::And, dest, src2)),
                        (1, 0b00) if xlen >= 64 => Ok(Instruction::Op32 {
                            op: crate::instruction::RegReg32Op::Subw,
                            dest,
                            src1: dest,
                            src2,
                        }),
                        (1, 0b01) if xlen >= 64 => Ok(Instruction::Op32 {
                            op: crate::instruction::RegReg32Op::Addw,
                            dest,
                            src1: dest,
                            src2,
                        }),
                        _ => Err(DecodeError::IllegalInstruction),
                    }
                }
            }
        }
        0b101 => Ok(Instruction::Jal {
            dest: Specifier::X0,
            offset: j_target(raw),
        }),
        0b110 => Ok(Instruction::Branch {
            condition: BranchCondition::Beq,
            src1: rs1_c(raw),
            src2: Specifier::X0,
            offset: b_target(raw),
        }),
        0b111 => Ok(Instruction::Branch {
            condition: BranchCondition::Bne,
            src1: rs1_c(raw),
            src2: Specifier::X0,
            offset: b_target(raw),
        }),
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn decode_q2(raw: u16, xlen: u32) -> Result<Instruction, DecodeError> {
    let dest = rd_full(raw);
    let src2 = Specifier::from_u5(((raw >> 2) & 0x1F) as u8);
    match funct3(raw) {
        0b000 => {
            let shamt = shamt_6(raw);
            if xlen == 32 && shamt >= 32 {
                return Err(DecodeError::IllegalInstruction);
            }
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest,
                src: dest,
                shamt,
            })
        }
        0b001 => Ok(Instruction::FpLoad {
            width: FpWidth::Double,
            dest,
            base: Specifier::SP,
            offset: uimm_sp_8(raw) as i32,
        }),
        0b010 => Ok(Instruction::Load {
            width: LoadWidth::Lw,
            dest,
            base: Specifier::SP,
            offset: uimm_sp_4(raw) as i32,
        }),
        0b011 => {
            if xlen >= 64 {
                Ok(Instruction::Load {
                    width: LoadWidth::Ld,
                    dest,
                    base: Specifier::SP,
                    offset: uimm_sp_8(raw) as i32,
                })
            } else {
                Ok(Instruction::FpLoad {
                    width: FpWidth::Single,
                    dest,
                    base: Specifier::SP,
                    offset: uimm_sp_4(raw) as i32,
                })
            }
        }
        0b100 => {
            let rs2_field = u8::from(src2);
            let rs1_field = u8::from(dest);
            if (raw >> 12) & 1 == 0 {
                if rs2_field != 0 {
                    // c.mv
                    Ok(Instruction::Op {
                        op: RegRegOp::Add,
                        dest,
                        src1: Specifier::X0,
                        src2,
                    })
                } else if rs1_field != 0 {
                    // c.jr
                    Ok(Instruction::Jalr {
                        dest: Specifier::X0,
                        base: dest,
                        offset: 0,
                    })
                } else {
                    Err(DecodeError::IllegalInstruction)
                }
            } else if rs2_field != 0 {
                // c.add
                Ok(Instruction::Op {
                    op: RegRegOp::Add,
                    dest,
                    src1: dest,
                    src2,
                })
            } else if rs1_field != 0 {
                // c.jalr
                Ok(Instruction::Jalr {
                    dest: Specifier::RA,
                    base: dest,
                    offset: 0,
                })
            } else {
                Ok(Instruction::Ebreak)
            }
        }
        0b101 => Ok(Instruction::FpStore {
            width: FpWidth::Double,
            src: src2,
            base: Specifier::SP,
            offset: uimm_sp_store_8(raw) as i32,
        }),
        0b110 => Ok(Instruction::Store {
            width: StoreWidth::Sw,
            src: src2,
            base: Specifier::SP,
            offset: uimm_sp_store_4(raw) as i32,
        }),
        0b111 => {
            if xlen >= 64 {
                Ok(Instruction::Store {
                    width: StoreWidth::Sd,
                    src: src2,
                    base: Specifier::SP,
                    offset: uimm_sp_store_8(raw) as i32,
                })
            } else {
                Ok(Instruction::FpStore {
                    width: FpWidth::Single,
                    src: src2,
                    base: Specifier::SP,
                    offset: uimm_sp_store_4(raw) as i32,
                })
            }
        }
        _ => Err(DecodeError::IllegalInstruction),
    }
}

fn op_rr(op: RegRegOp, dest: Specifier, src2: Specifier) -> Instruction {
    Instruction::Op {
        op,
        dest,
        src1: dest,
        src2,
    }
}

fn funct3(raw: u16) -> u8 {
    ((raw >> 13) & 0b111) as u8
}

/// The 3-bit rd'/rs2' field (bits 4:2), addressing `x8..=x15`.
fn rd_c(raw: u16) -> Specifier {
    Specifier::from_c3(((raw >> 2) & 0b111) as u8)
}

/// The 3-bit rs1'/rd' field (bits 9:7), addressing `x8..=x15`.
fn rs1_c(raw: u16) -> Specifier {
    Specifier::from_c3(((raw >> 7) & 0b111) as u8)
}

/// Alias of [`rd_c`] used where the field names a second source.
fn rs2_c(raw: u16) -> Specifier {
    rd_c(raw)
}

/// The full 5-bit rd/rs1 field (bits 11:7).
fn rd_full(raw: u16) -> Specifier {
    Specifier::from_u5(((raw >> 7) & 0x1F) as u8)
}

/// Scaled-by-4 offset of c.lw/c.sw (and RV32 c.flw/c.fsw).
fn uimm_4(raw: u16) -> u32 {
    (((raw >> 10) & 0b111) as u32) << 3 // uimm[5:3]
        | (((raw >> 6) & 1) as u32) << 2 // uimm[2]
        | (((raw >> 5) & 1) as u32) << 6 // uimm[6]
}

/// Scaled-by-8 offset of c.fld/c.fsd (and RV64 c.ld/c.sd).
fn uimm_8(raw: u16) -> u32 {
    (((raw >> 10) & 0b111) as u32) << 3 // uimm[5:3]
        | (((raw >> 5) & 0b11) as u32) << 6 // uimm[7:6]
}

/// Scaled-by-4 stack-pointer-relative load offset (c.lwsp).
fn uimm_sp_4(raw: u16) -> u32 {
    (((raw >> 12) & 1) as u32) << 5
        | (((raw >> 4) & 0b111) as u32) << 2
        | (((raw >> 2) & 0b11) as u32) << 6
}

/// Scaled-by-8 stack-pointer-relative load offset (c.ldsp/c.fldsp).
fn uimm_sp_8(raw: u16) -> u32 {
    (((raw >> 12) & 1) as u32) << 5
        | (((raw >> 5) & 0b11) as u32) << 3
        | (((raw >> 2) & 0b111) as u32) << 6
}

/// Scaled-by-4 stack-pointer-relative store offset (c.swsp).
fn uimm_sp_store_4(raw: u16) -> u32 {
    (((raw >> 9) & 0b1111) as u32) << 2 | (((raw >> 7) & 0b11) as u32) << 6
}

/// Scaled-by-8 stack-pointer-relative store offset (c.sdsp/c.fsdsp).
fn uimm_sp_store_8(raw: u16) -> u32 {
    (((raw >> 10) & 0b111) as u32) << 3 | (((raw >> 7) & 0b111) as u32) << 6
}

/// The 6-bit sign-extended immediate of c.addi/c.li/c.andi.
fn imm_6(raw: u16) -> i32 {
    let imm = (((raw >> 12) & 1) as i32) << 5 | (((raw >> 2) & 0x1F) as i32);
    (imm << 26) >> 26
}

/// The 6-bit shift amount of c.slli/c.srli/c.srai.
fn shamt_6(raw: u16) -> u32 {
    (((raw >> 12) & 1) as u32) << 5 | (((raw >> 2) & 0x1F) as u32)
}

/// The sign-extended c.j/c.jal target offset.
fn j_target(raw: u16) -> i32 {
    let imm = (((raw >> 12) & 1) as i32) << 11
        | (((raw >> 11) & 1) as i32) << 4
        | (((raw >> 9) & 0b11) as i32) << 8
        | (((raw >> 8) & 1) as i32) << 10
        | (((raw >> 7) & 1) as i32) << 6
        | (((raw >> 6) & 1) as i32) << 7
        | (((raw >> 3) & 0b111) as i32) << 1
        | (((raw >> 2) & 1) as i32) << 5;
    (imm << 20) >> 20
}

/// The sign-extended c.beqz/c.bnez target offset.
fn b_target(raw: u16) -> i32 {
    let imm = (((raw >> 12) & 1) as i32) << 8
        | (((raw >> 10) & 0b11) as i32) << 3
        | (((raw >> 5) & 0b11) as i32) << 6
        | (((raw >> 3) & 0b11) as i32) << 1
        | (((raw >> 2) & 1) as i32) << 5;
    (imm << 23) >> 23
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_zeros_is_illegal() {
        assert!(decode(0, 32).is_err());
        assert!(decode(0, 64).is_err());
    }

    #[test]
    fn test_c_li() {
        // c.li a0, 1 => 0x4505
        assert_eq!(
            decode(0x4505, 64),
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(10),
                src: Specifier::X0,
                immediate: 1,
            })
        );
        // c.li a0, -1 => 0x557d
        assert_eq!(
            decode(0x557D, 64),
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(10),
                src: Specifier::X0,
                immediate: -1,
            })
        );
    }

    #[test]
    fn test_c_mv_and_add() {
        // c.mv a0, a1 => 0x852e
        assert_eq!(
            decode(0x852E, 64),
            Ok(Instruction::Op {
                op: RegRegOp::Add,
                dest: Specifier::from_u5(10),
                src1: Specifier::X0,
                src2: Specifier::from_u5(11),
            })
        );
        // c.add a0, a1 => 0x952e
        assert_eq!(
            decode(0x952E, 64),
            Ok(Instruction::Op {
                op: RegRegOp::Add,
                dest: Specifier::from_u5(10),
                src1: Specifier::from_u5(10),
                src2: Specifier::from_u5(11),
            })
        );
    }

    #[test]
    fn test_c_lw() {
        // c.lw a0, 4(a1) => funct3=010, uimm[2]=1
        // bits: 010 | uimm[5:3]=000 | rs1'=011 | uimm[2]=1 | uimm[6]=0 | rd'=010 | 00
        let raw: u16 = 0b010_000_011_1_0_010_00;
        assert_eq!(
            decode(raw, 32),
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest: Specifier::from_u5(10),
                base: Specifier::from_u5(11),
                offset: 4,
            })
        );
    }

    #[test]
    fn test_c_jr_and_ebreak() {
        // c.jr ra => 0x8082
        assert_eq!(
            decode(0x8082, 64),
            Ok(Instruction::Jalr {
                dest: Specifier::X0,
                base: Specifier::RA,
                offset: 0,
            })
        );
        // c.ebreak => 0x9002
        assert_eq!(decode(0x9002, 64), Ok(Instruction::Ebreak));
    }

    #[test]
    fn test_c_addi16sp() {
        // c.addi16sp sp, -64 => 0x7139
        assert_eq!(
            decode(0x7139, 64),
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::SP,
                src: Specifier::SP,
                immediate: -64,
            })
        );
    }

    #[test]
    fn test_c_addiw_is_rv64_only() {
        // c.addiw a0, 1 => 0x2505
        assert_eq!(
            decode(0x2505, 64),
            Ok(Instruction::OpImm32 {
                dest: Specifier::from_u5(10),
                src: Specifier::from_u5(10),
                immediate: 1,
            })
        );
        // On RV32 the same encoding is c.jal.
        assert!(matches!(
            decode(0x2505, 32),
            Ok(Instruction::Jal { dest, .. }) if dest == Specifier::RA
        ));
    }

    #[test]
    fn test_c_j_offset() {
        // c.j . (infinite loop) => 0xa001, offset 0
        assert_eq!(
            decode(0xA001, 64),
            Ok(Instruction::Jal {
                dest: Specifier::X0,
                offset: 0,
            })
        );
    }
}
