//! Floating-point (F and D extension) semantics.
//!
//! The 32 floating-point registers are 64 bits wide; single-precision
//! values live in them NaN-boxed (upper 32 bits all ones). An improperly
//! boxed single reads as the canonical NaN.
//!
//! Arithmetic is performed with host floating point, which provides
//! round-to-nearest-even. The `frm` field is stored and readable but other
//! rounding modes are not emulated, and accrued exception flags are not
//! tracked.

use crate::address::Address;
use crate::error::MachineError;
use crate::instruction::{FmaOp, FpBinaryOp, FpCmpOp, FpWidth, IntWidth};
use crate::machine::Machine;
use crate::registers::Specifier;
use std::num::FpCategory;

const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

/// Unbox a single-precision value from a register.
fn unbox_f32(bits: u64) -> f32 {
    if bits & NAN_BOX == NAN_BOX {
        f32::from_bits(bits as u32)
    } else {
        f32::NAN
    }
}

/// NaN-box a single-precision value into a register.
fn box_f32(value: f32) -> u64 {
    NAN_BOX | value.to_bits() as u64
}

impl<A: Address> Machine<A> {
    fn freg(&self, specifier: Specifier) -> u64 {
        self.cpu.registers().f(specifier)
    }

    fn set_freg(&mut self, specifier: Specifier, bits: u64) {
        self.cpu.registers_mut().set_f(specifier, bits);
    }

    fn f32_reg(&self, specifier: Specifier) -> f32 {
        unbox_f32(self.freg(specifier))
    }

    fn f64_reg(&self, specifier: Specifier) -> f64 {
        f64::from_bits(self.freg(specifier))
    }

    fn advance_fp(&mut self, len: u32) {
        let pc = self.cpu.registers_mut().pc_mut();
        *pc = pc.wrapping_add(A::from_u64(len as u64));
    }

    pub(crate) fn fp_load(
        &mut self,
        width: FpWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
        len: u32,
    ) -> Result<(), MachineError> {
        let addr = self
            .cpu
            .registers()
            .x(base)
            .wrapping_add_signed(offset as i64);
        let bits = match width {
            FpWidth::Single => NAN_BOX | self.mem_read_u32(addr)? as u64,
            FpWidth::Double => self.mem_read_u64(addr)?,
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_store(
        &mut self,
        width: FpWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
        len: u32,
    ) -> Result<(), MachineError> {
        let addr = self
            .cpu
            .registers()
            .x(base)
            .wrapping_add_signed(offset as i64);
        let bits = self.freg(src);
        match width {
            FpWidth::Single => {
                self.cpu.store_touches_reservation(addr, 4);
                self.mem_write_u32(addr, bits as u32)?;
            }
            FpWidth::Double => {
                self.cpu.store_touches_reservation(addr, 8);
                self.mem_write_u64(addr, bits)?;
            }
        }
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_op(
        &mut self,
        op: FpBinaryOp,
        width: FpWidth,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let bits = match width {
            FpWidth::Single => {
                let (a, b) = (self.f32_reg(src1), self.f32_reg(src2));
                let value = match op {
                    FpBinaryOp::Add => a + b,
                    FpBinaryOp::Sub => a - b,
                    FpBinaryOp::Mul => a * b,
                    FpBinaryOp::Div => a / b,
                    FpBinaryOp::Min => min_f32(a, b),
                    FpBinaryOp::Max => max_f32(a, b),
                    FpBinaryOp::SgnJ | FpBinaryOp::SgnJn | FpBinaryOp::SgnJx => {
                        let sign = sign_inject(op, a.to_bits() as u64, b.to_bits() as u64, 31);
                        f32::from_bits(sign as u32)
                    }
                };
                box_f32(value)
            }
            FpWidth::Double => {
                let (a, b) = (self.f64_reg(src1), self.f64_reg(src2));
                let value = match op {
                    FpBinaryOp::Add => a + b,
                    FpBinaryOp::Sub => a - b,
                    FpBinaryOp::Mul => a * b,
                    FpBinaryOp::Div => a / b,
                    FpBinaryOp::Min => min_f64(a, b),
                    FpBinaryOp::Max => max_f64(a, b),
                    FpBinaryOp::SgnJ | FpBinaryOp::SgnJn | FpBinaryOp::SgnJx => {
                        f64::from_bits(sign_inject(op, a.to_bits(), b.to_bits(), 63))
                    }
                };
                value.to_bits()
            }
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_sqrt(
        &mut self,
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let bits = match width {
            FpWidth::Single => box_f32(self.f32_reg(src).sqrt()),
            FpWidth::Double => self.f64_reg(src).sqrt().to_bits(),
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_fma(
        &mut self,
        op: FmaOp,
        width: FpWidth,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        src3: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let bits = match width {
            FpWidth::Single => {
                let (a, b, c) = (self.f32_reg(src1), self.f32_reg(src2), self.f32_reg(src3));
                let value = match op {
                    FmaOp::Madd => a.mul_add(b, c),
                    FmaOp::Msub => a.mul_add(b, -c),
                    FmaOp::Nmsub => (-a).mul_add(b, c),
                    FmaOp::Nmadd => (-a).mul_add(b, -c),
                };
                box_f32(value)
            }
            FpWidth::Double => {
                let (a, b, c) = (self.f64_reg(src1), self.f64_reg(src2), self.f64_reg(src3));
                let value = match op {
                    FmaOp::Madd => a.mul_add(b, c),
                    FmaOp::Msub => a.mul_add(b, -c),
                    FmaOp::Nmsub => (-a).mul_add(b, c),
                    FmaOp::Nmadd => (-a).mul_add(b, -c),
                };
                value.to_bits()
            }
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    /// Comparisons write into the integer file; any NaN operand compares
    /// false.
    pub(crate) fn fp_cmp(
        &mut self,
        op: FpCmpOp,
        width: FpWidth,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let result = match width {
            FpWidth::Single => {
                let (a, b) = (self.f32_reg(src1), self.f32_reg(src2));
                match op {
                    FpCmpOp::Eq => a == b,
                    FpCmpOp::Lt => a < b,
                    FpCmpOp::Le => a <= b,
                }
            }
            FpWidth::Double => {
                let (a, b) = (self.f64_reg(src1), self.f64_reg(src2));
                match op {
                    FpCmpOp::Eq => a == b,
                    FpCmpOp::Lt => a < b,
                    FpCmpOp::Le => a <= b,
                }
            }
        };
        let value = if result { A::ONE } else { A::ZERO };
        self.cpu.registers_mut().set_x(dest, value);
        self.advance_fp(len);
        Ok(())
    }

    /// Float to integer register, saturating; NaN converts to the maximum
    /// of the target type.
    pub(crate) fn fp_cvt_to_int(
        &mut self,
        width: FpWidth,
        target: IntWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let value = match width {
            FpWidth::Single => {
                let v = self.f32_reg(src);
                match target {
                    IntWidth::Word => A::from_i32(if v.is_nan() { i32::MAX } else { v as i32 }),
                    IntWidth::WordUnsigned => {
                        A::from_i32((if v.is_nan() { u32::MAX } else { v as u32 }) as i32)
                    }
                    IntWidth::Long => A::from_i64(if v.is_nan() { i64::MAX } else { v as i64 }),
                    IntWidth::LongUnsigned => {
                        A::from_u64(if v.is_nan() { u64::MAX } else { v as u64 })
                    }
                }
            }
            FpWidth::Double => {
                let v = self.f64_reg(src);
                match target {
                    IntWidth::Word => A::from_i32(if v.is_nan() { i32::MAX } else { v as i32 }),
                    IntWidth::WordUnsigned => {
                        A::from_i32((if v.is_nan() { u32::MAX } else { v as u32 }) as i32)
                    }
                    IntWidth::Long => A::from_i64(if v.is_nan() { i64::MAX } else { v as i64 }),
                    IntWidth::LongUnsigned => {
                        A::from_u64(if v.is_nan() { u64::MAX } else { v as u64 })
                    }
                }
            }
        };
        self.cpu.registers_mut().set_x(dest, value);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_cvt_from_int(
        &mut self,
        width: FpWidth,
        source: IntWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let reg = self.cpu.registers().x(src);
        let bits = match width {
            FpWidth::Single => {
                let value = match source {
                    IntWidth::Word => reg.to_u32() as i32 as f32,
                    IntWidth::WordUnsigned => reg.to_u32() as f32,
                    IntWidth::Long => reg.to_u64() as i64 as f32,
                    IntWidth::LongUnsigned => reg.to_u64() as f32,
                };
                box_f32(value)
            }
            FpWidth::Double => {
                let value = match source {
                    IntWidth::Word => reg.to_u32() as i32 as f64,
                    IntWidth::WordUnsigned => reg.to_u32() as f64,
                    IntWidth::Long => reg.to_u64() as i64 as f64,
                    IntWidth::LongUnsigned => reg.to_u64() as f64,
                };
                value.to_bits()
            }
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_cvt_float(
        &mut self,
        from: FpWidth,
        _to: FpWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let bits = match from {
            // fcvt.d.s
            FpWidth::Single => (self.f32_reg(src) as f64).to_bits(),
            // fcvt.s.d
            FpWidth::Double => box_f32(self.f64_reg(src) as f32),
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    /// Raw bit move into the integer file; the single-precision form
    /// sign-extends bit 31.
    pub(crate) fn fp_mv_to_int(
        &mut self,
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let bits = self.freg(src);
        let value = match width {
            FpWidth::Single => A::from_i32(bits as u32 as i32),
            FpWidth::Double => A::from_i64(bits as i64),
        };
        self.cpu.registers_mut().set_x(dest, value);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_mv_from_int(
        &mut self,
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let reg = self.cpu.registers().x(src);
        let bits = match width {
            FpWidth::Single => NAN_BOX | reg.to_u32() as u64,
            FpWidth::Double => reg.to_u64(),
        };
        self.set_freg(dest, bits);
        self.advance_fp(len);
        Ok(())
    }

    pub(crate) fn fp_class(
        &mut self,
        width: FpWidth,
        dest: Specifier,
        src: Specifier,
        len: u32,
    ) -> Result<(), MachineError> {
        let class = match width {
            FpWidth::Single => {
                let v = self.f32_reg(src);
                classify(
                    v.classify(),
                    v.is_sign_negative(),
                    v.to_bits() as u64 & (1 << 22) != 0,
                )
            }
            FpWidth::Double => {
                let v = self.f64_reg(src);
                classify(
                    v.classify(),
                    v.is_sign_negative(),
                    v.to_bits() & (1 << 51) != 0,
                )
            }
        };
        self.cpu
            .registers_mut()
            .set_x(dest, A::from_u32(class));
        self.advance_fp(len);
        Ok(())
    }
}

/// Sign-injection on raw bits: the result takes everything but the sign
/// from rs1, and a sign derived from rs2.
fn sign_inject(op: FpBinaryOp, a: u64, b: u64, sign_bit: u32) -> u64 {
    let sign_mask = 1u64 << sign_bit;
    let sign = match op {
        FpBinaryOp::SgnJ => b & sign_mask,
        FpBinaryOp::SgnJn => !b & sign_mask,
        FpBinaryOp::SgnJx => (a ^ b) & sign_mask,
        _ => unreachable!("sign_inject only handles sign-injection ops"),
    };
    (a & !sign_mask) | sign
}

/// fmin: the non-NaN operand wins; both NaN gives the canonical NaN.
fn min_f32(a: f32, b: f32) -> f32 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f32::NAN,
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if a < b || (a == b && a.is_sign_negative()) {
                a
            } else {
                b
            }
        }
    }
}

fn max_f32(a: f32, b: f32) -> f32 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f32::NAN,
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if a > b || (a == b && b.is_sign_negative()) {
                a
            } else {
                b
            }
        }
    }
}

fn min_f64(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if a < b || (a == b && a.is_sign_negative()) {
                a
            } else {
                b
            }
        }
    }
}

fn max_f64(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if a > b || (a == b && b.is_sign_negative()) {
                a
            } else {
                b
            }
        }
    }
}

/// The ten-bit fclass result.
fn classify(category: FpCategory, negative: bool, quiet_bit: bool) -> u32 {
    match category {
        FpCategory::Infinite => {
            if negative {
                1 << 0
            } else {
                1 << 7
            }
        }
        FpCategory::Normal => {
            if negative {
                1 << 1
            } else {
                1 << 6
            }
        }
        FpCategory::Subnormal => {
            if negative {
                1 << 2
            } else {
                1 << 5
            }
        }
        FpCategory::Zero => {
            if negative {
                1 << 3
            } else {
                1 << 4
            }
        }
        FpCategory::Nan => {
            if quiet_bit {
                1 << 9
            } else {
                1 << 8
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    fn machine() -> Machine<u64> {
        Machine::default()
    }

    fn f(n: u8) -> Specifier {
        Specifier::from_u5(n)
    }

    fn set_f32(machine: &mut Machine<u64>, reg: Specifier, value: f32) {
        machine.cpu.registers_mut().set_f(reg, box_f32(value));
    }

    fn set_f64(machine: &mut Machine<u64>, reg: Specifier, value: f64) {
        machine.cpu.registers_mut().set_f(reg, value.to_bits());
    }

    #[test]
    fn test_nan_boxing() {
        assert_eq!(unbox_f32(box_f32(1.5)), 1.5);
        // A register holding a double does not read back as a single.
        assert!(unbox_f32(2.0f64.to_bits()).is_nan());
    }

    #[test]
    fn test_fadd_both_widths() {
        let mut m = machine();
        set_f32(&mut m, f(1), 1.25);
        set_f32(&mut m, f(2), 2.5);
        m.fp_op(FpBinaryOp::Add, FpWidth::Single, f(3), f(1), f(2), 4)
            .unwrap();
        assert_eq!(unbox_f32(m.cpu.registers().f(f(3))), 3.75);

        set_f64(&mut m, f(4), 1e100);
        set_f64(&mut m, f(5), 2e100);
        m.fp_op(FpBinaryOp::Add, FpWidth::Double, f(6), f(4), f(5), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(6))), 3e100);
    }

    #[test]
    fn test_sign_injection() {
        let mut m = machine();
        set_f64(&mut m, f(1), 1.5);
        set_f64(&mut m, f(2), -2.0);
        // fsgnj.d: magnitude of f1, sign of f2.
        m.fp_op(FpBinaryOp::SgnJ, FpWidth::Double, f(3), f(1), f(2), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(3))), -1.5);
        // fsgnjn.d: negated sign of f2 (fneg when rs1 == rs2).
        m.fp_op(FpBinaryOp::SgnJn, FpWidth::Double, f(3), f(1), f(1), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(3))), -1.5);
        // fsgnjx.d: xor of the signs (fabs when rs1 == rs2).
        m.fp_op(FpBinaryOp::SgnJx, FpWidth::Double, f(3), f(2), f(2), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(3))), 2.0);
    }

    #[test]
    fn test_min_max_nan_handling() {
        let mut m = machine();
        set_f32(&mut m, f(1), f32::NAN);
        set_f32(&mut m, f(2), 7.0);
        m.fp_op(FpBinaryOp::Min, FpWidth::Single, f(3), f(1), f(2), 4)
            .unwrap();
        assert_eq!(unbox_f32(m.cpu.registers().f(f(3))), 7.0);
        m.fp_op(FpBinaryOp::Max, FpWidth::Single, f(3), f(1), f(1), 4)
            .unwrap();
        assert!(unbox_f32(m.cpu.registers().f(f(3))).is_nan());
    }

    #[test]
    fn test_fma() {
        let mut m = machine();
        set_f64(&mut m, f(1), 2.0);
        set_f64(&mut m, f(2), 3.0);
        set_f64(&mut m, f(3), 1.0);
        m.fp_fma(FmaOp::Madd, FpWidth::Double, f(4), f(1), f(2), f(3), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(4))), 7.0);
        m.fp_fma(FmaOp::Nmadd, FpWidth::Double, f(4), f(1), f(2), f(3), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(4))), -7.0);
    }

    #[test]
    fn test_compare_nan_is_false() {
        let mut m = machine();
        set_f64(&mut m, f(1), f64::NAN);
        set_f64(&mut m, f(2), 1.0);
        m.fp_cmp(FpCmpOp::Le, FpWidth::Double, f(5), f(1), f(2), 4)
            .unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 0);
        m.fp_cmp(FpCmpOp::Eq, FpWidth::Double, f(5), f(2), f(2), 4)
            .unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 1);
    }

    #[test]
    fn test_conversions_saturate() {
        let mut m = machine();
        set_f64(&mut m, f(1), 1e300);
        m.fp_cvt_to_int(FpWidth::Double, IntWidth::Word, f(5), f(1), 4)
            .unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), i32::MAX as u64);
        set_f64(&mut m, f(1), -1.0);
        m.fp_cvt_to_int(FpWidth::Double, IntWidth::WordUnsigned, f(5), f(1), 4)
            .unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 0);
        set_f64(&mut m, f(1), f64::NAN);
        m.fp_cvt_to_int(FpWidth::Double, IntWidth::Word, f(5), f(1), 4)
            .unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), i32::MAX as u64);
        // fcvt.wu sign-extends its 32-bit result on RV64.
        set_f64(&mut m, f(1), 4294967295.0);
        m.fp_cvt_to_int(FpWidth::Double, IntWidth::WordUnsigned, f(5), f(1), 4)
            .unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), u64::MAX);
    }

    #[test]
    fn test_int_to_float() {
        let mut m = machine();
        m.cpu.registers_mut().set_x(f(5), (-3i64) as u64);
        m.fp_cvt_from_int(FpWidth::Double, IntWidth::Word, f(1), f(5), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(1))), -3.0);
        m.fp_cvt_from_int(FpWidth::Double, IntWidth::LongUnsigned, f(1), f(5), 4)
            .unwrap();
        assert_eq!(
            f64::from_bits(m.cpu.registers().f(f(1))),
            (u64::MAX - 2) as f64
        );
    }

    #[test]
    fn test_float_width_conversions() {
        let mut m = machine();
        set_f32(&mut m, f(1), 1.5);
        m.fp_cvt_float(FpWidth::Single, FpWidth::Double, f(2), f(1), 4)
            .unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(2))), 1.5);
        m.fp_cvt_float(FpWidth::Double, FpWidth::Single, f(3), f(2), 4)
            .unwrap();
        assert_eq!(unbox_f32(m.cpu.registers().f(f(3))), 1.5);
    }

    #[test]
    fn test_bit_moves() {
        let mut m = machine();
        m.cpu.registers_mut().set_x(f(5), 0xC070_0000); // -3.75f32 bits
        m.fp_mv_from_int(FpWidth::Single, f(1), f(5), 4).unwrap();
        assert_eq!(unbox_f32(m.cpu.registers().f(f(1))), -3.75);
        m.fp_mv_to_int(FpWidth::Single, f(6), f(1), 4).unwrap();
        // Sign-extended raw bits.
        assert_eq!(m.cpu.registers().x(f(6)), 0xFFFF_FFFF_C070_0000);
    }

    #[test]
    fn test_loads_and_stores() {
        let mut m = machine();
        m.memory.write_u32(0x1000, 3.5f32.to_bits()).unwrap();
        m.cpu.registers_mut().set_x(f(5), 0x1000);
        m.fp_load(FpWidth::Single, f(1), f(5), 0, 4).unwrap();
        assert_eq!(unbox_f32(m.cpu.registers().f(f(1))), 3.5);
        m.fp_store(FpWidth::Single, f(1), f(5), 8, 4).unwrap();
        assert_eq!(m.memory.read_u32(0x1008).unwrap(), 3.5f32.to_bits());

        set_f64(&mut m, f(2), -0.125);
        m.fp_store(FpWidth::Double, f(2), f(5), 16, 4).unwrap();
        m.fp_load(FpWidth::Double, f(3), f(5), 16, 4).unwrap();
        assert_eq!(f64::from_bits(m.cpu.registers().f(f(3))), -0.125);
    }

    #[test]
    fn test_fclass() {
        let mut m = machine();
        set_f64(&mut m, f(1), f64::NEG_INFINITY);
        m.fp_class(FpWidth::Double, f(5), f(1), 4).unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 1 << 0);
        set_f64(&mut m, f(1), -0.0);
        m.fp_class(FpWidth::Double, f(5), f(1), 4).unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 1 << 3);
        set_f64(&mut m, f(1), 1.0);
        m.fp_class(FpWidth::Double, f(5), f(1), 4).unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 1 << 6);
        set_f64(&mut m, f(1), f64::NAN);
        m.fp_class(FpWidth::Double, f(5), f(1), 4).unwrap();
        assert_eq!(m.cpu.registers().x(f(5)), 1 << 9);
    }
}
