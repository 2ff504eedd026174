//! Machine state serialization.
//!
//! The format is a compact little-endian blob: a 16-byte magic, a format
//! version, the architecture width, the register file, the instruction
//! counters, and the owned pages. Non-owning and sentinel pages are
//! referenced by identity, not content: they are expected to be
//! re-established by the same loader/embedder configuration before
//! restoring.
//!
//! Copy-on-write pages that carry no private data are stored as
//! attribute-only records and restore as zero-backed pages.

use crate::address::Address;
use crate::machine::Machine;
use crate::page::{Page, PageAttributes, PAGE_SIZE};
use crate::registers::{Fcsr, Specifier};
use thiserror::Error;

const MAGIC: &[u8; 16] = b"duststorm-state\0";
const VERSION: u32 = 1;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum StateError {
    #[error("not a serialized machine state (bad magic)")]
    BadMagic,
    #[error("unsupported state format version {found}")]
    BadVersion { found: u32 },
    #[error("state was serialized for a {found}-bit machine, this one is {expected}-bit")]
    WidthMismatch { found: u32, expected: u32 },
    #[error("serialized state is truncated")]
    Truncated,
}

/// Little-endian cursor over a serialized blob.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StateError> {
        if self.data.len() < n {
            return Err(StateError::Truncated);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, StateError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, StateError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, StateError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn address<A: Address>(&mut self) -> Result<A, StateError> {
        let bytes = self.take(A::SIZE)?;
        let mut wide = [0u8; 16];
        wide[..A::SIZE].copy_from_slice(bytes);
        Ok(A::from_u128(u128::from_le_bytes(wide)))
    }
}

fn push_address<A: Address>(out: &mut Vec<u8>, value: A) {
    out.extend_from_slice(&value.to_u128().to_le_bytes()[..A::SIZE]);
}

impl<A: Address> Machine<A> {
    /// Serializes registers, counters and all owned pages into `out`.
    pub fn serialize_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.push((A::BITS / 8) as u8);

        let registers = self.cpu.registers();
        for specifier in Specifier::all() {
            push_address(out, registers.x(specifier));
        }
        push_address(out, registers.pc());
        for specifier in Specifier::all() {
            out.extend_from_slice(&registers.f(specifier).to_le_bytes());
        }
        out.extend_from_slice(&registers.fcsr().whole().to_le_bytes());

        out.extend_from_slice(&self.cpu.instruction_counter().to_le_bytes());
        out.extend_from_slice(&self.cpu.max_instructions().to_le_bytes());

        let owned: Vec<(A, &Page)> = self
            .memory
            .mapped_pages()
            .filter(|(_, page)| !page.attr.non_owning)
            .collect();
        out.extend_from_slice(&(owned.len() as u32).to_le_bytes());
        for (pageno, page) in owned {
            out.extend_from_slice(&pageno.to_u64().to_le_bytes());
            out.push(page.attr.to_bits());
            if page.attr.is_cow {
                // Attribute-only record; contents come from the zero page.
                continue;
            }
            match page.data() {
                Some(data) => out.extend_from_slice(data),
                // An owned page without backing serializes as all zeros.
                None => out.extend_from_slice(&[0u8; PAGE_SIZE]),
            }
        }
    }

    /// Convenience wrapper returning a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_to(&mut out);
        out
    }

    /// Restores state serialized by a machine of compatible configuration.
    ///
    /// Owned pages are replaced wholesale; non-owning mappings, shared
    /// segments, handlers and the syscall table are kept as they are.
    pub fn deserialize_from(&mut self, data: &[u8]) -> Result<(), StateError> {
        let mut reader = Reader { data };
        if reader.take(16)? != MAGIC {
            return Err(StateError::BadMagic);
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(StateError::BadVersion { found: version });
        }
        let width_bits = reader.u8()? as u32 * 8;
        if width_bits != A::BITS {
            return Err(StateError::WidthMismatch {
                found: width_bits,
                expected: A::BITS,
            });
        }

        let mut x = [A::ZERO; 32];
        for slot in x.iter_mut() {
            *slot = reader.address::<A>()?;
        }
        let pc = reader.address::<A>()?;
        let mut f = [0u64; 32];
        for slot in f.iter_mut() {
            *slot = reader.u64()?;
        }
        let mut fcsr = Fcsr::default();
        fcsr.set_whole(reader.u32()?);
        let counter = reader.u64()?;
        let max_counter = reader.u64()?;

        let page_count = reader.u32()?;
        let mut pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            let pageno = A::from_u64(reader.u64()?);
            let attr = PageAttributes::from_bits(reader.u8()?);
            let page = if attr.is_cow {
                Page::new_zero(attr)
            } else {
                let mut page = Page::new_owned(attr);
                let data = page.data_mut().expect("owned pages have backing");
                data.copy_from_slice(reader.take(PAGE_SIZE)?);
                page
            };
            pages.push((pageno, page));
        }

        // Everything parsed; now it is safe to mutate the machine.
        let registers = self.cpu.registers_mut();
        for (specifier, value) in Specifier::all().zip(x) {
            registers.set_x(specifier, value);
        }
        *registers.pc_mut() = pc;
        for (specifier, bits) in Specifier::all().zip(f) {
            registers.set_f(specifier, bits);
        }
        *registers.fcsr_mut() = fcsr;
        self.cpu.set_instruction_counter(counter);
        self.cpu.set_max_instructions(max_counter);
        self.cpu.clear_reservation();
        self.cpu.invalidate_exec_cache();

        self.memory.clear_owned_pages();
        for (pageno, page) in pages {
            self.memory.allocate_page(pageno, page);
        }
        Ok(())
    }
}
