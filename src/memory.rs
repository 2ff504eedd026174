//! The guest virtual memory subsystem.
//!
//! [`Memory`] maps page numbers to [`Page`]s. Pages are created lazily: an
//! address that was never written resolves to the process-wide zero page,
//! and the first write materializes an owned page through the page fault
//! handler. Copy-on-write pages are promoted through the page write handler
//! before a write lands.
//!
//! Two single-slot lookaside caches short-circuit the page table walk for
//! the most recently read and written page. Any operation that inserts,
//! replaces or removes a page clears both slots and bumps a generation
//! counter that per-CPU execution caches validate against, so no stale
//! reference is ever dereferenced.

use crate::address::Address;
use crate::error::MemoryError;
use crate::page::{Page, PageAttributes, PAGE_SHIFT, PAGE_SIZE};
use hashbrown::HashMap;
use log::trace;
use std::ptr::NonNull;
use std::sync::Arc;

/// Invoked when a page is touched for writing but no page is mapped at that
/// page number. Must map a page at `pageno` (usually by calling
/// [`Memory::allocate_page`]) or fail.
pub type PageFaultHandler<A> = fn(&mut Memory<A>, A) -> Result<(), MemoryError>;

/// Invoked on the first write to a copy-on-write page. The default promotes
/// the page to owned, writable backing holding a copy of its current
/// contents.
pub type PageWriteHandler<A> = fn(A, &mut Page);

/// Consulted on reads of unmapped page numbers, before falling back to the
/// zero page. Used to serve pages that live in another machine's address
/// space; the returned page must outlive every machine that can observe it.
pub type PageReadHandler<A> = fn(&Memory<A>, A) -> Option<&'static Page>;

/// The default number of bytes of committed guest memory a machine may use.
pub const DEFAULT_MEMORY_MAX: u64 = 16 << 20;

/// Single-slot lookaside cache entry.
///
/// The pointer is only dereferenced while the slot is populated, and every
/// structural change to the page table clears the slot; that is the
/// invariant making the deref sound.
struct CachedPage<A> {
    pageno: A,
    page: NonNull<Page>,
}

/// A shared read-only segment: a contiguous run of pages backed by one
/// allocation, shared between machines by reference counting.
///
/// Pages inside an area are visible to reads like ordinary mapped pages,
/// but writes to their page numbers fault instead of promoting, because the
/// backing may be visible to other machines.
#[derive(Debug)]
pub struct RoArea<A> {
    /// First page number covered.
    begin: A,
    /// One past the last page number covered.
    end: A,
    pages: Vec<Page>,
    /// Keeps the page backing alive; `pages` point into this allocation.
    _data: Box<[u8]>,
}

impl<A: Address> RoArea<A> {
    fn contains(&self, pageno: A) -> bool {
        pageno >= self.begin && pageno < self.end
    }

    fn page(&self, pageno: A) -> &Page {
        &self.pages[pageno.wrapping_sub(self.begin).to_usize()]
    }
}

/// The linear copy of the executable segment used by the fetch hot path.
#[derive(Debug)]
pub(crate) struct ExecSegment<A> {
    pub base: A,
    pub data: Box<[u8]>,
}

/// One guest address space.
pub struct Memory<A: Address> {
    pages: HashMap<A, Page>,
    ropages: Option<Arc<RoArea<A>>>,
    rd_cache: Option<CachedPage<A>>,
    wr_cache: Option<CachedPage<A>>,
    /// Bumped on every structural page table change; execution caches
    /// validate against it.
    generation: u64,
    page_fault_handler: PageFaultHandler<A>,
    page_write_handler: PageWriteHandler<A>,
    page_read_handler: Option<PageReadHandler<A>>,
    memory_max: u64,
    start_address: A,
    stack_address: A,
    exit_address: A,
    exec: Option<ExecSegment<A>>,
}

// SAFETY: the lookaside slots point into this memory's own page table and
// are cleared on every structural change; moving the whole memory to
// another thread moves the pointed-to pages with it. Foreign page backing
// carries its own embedder synchronization contract (see `Page`).
unsafe impl<A: Address> Send for Memory<A> {}

impl<A: Address> std::fmt::Debug for Memory<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.pages.len())
            .field("memory_max", &self.memory_max)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<A: Address> Memory<A> {
    pub fn new(memory_max: u64) -> Self {
        Self {
            pages: HashMap::new(),
            ropages: None,
            rd_cache: None,
            wr_cache: None,
            generation: 0,
            page_fault_handler: default_page_fault,
            page_write_handler: default_page_write,
            page_read_handler: None,
            memory_max,
            start_address: A::ZERO,
            stack_address: A::ZERO,
            exit_address: A::ZERO,
            exec: None,
        }
    }

    /// The page number containing `address`.
    pub fn page_number(address: A) -> A {
        address.wrapping_shr(PAGE_SHIFT)
    }

    /// The offset of `address` within its page.
    pub fn page_offset(address: A) -> usize {
        (address.to_usize()) & (PAGE_SIZE - 1)
    }

    pub fn memory_max(&self) -> u64 {
        self.memory_max
    }

    /// Number of mapped pages, owned or not.
    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    /// Number of mapped pages whose backing this memory owns.
    pub fn owned_pages_active(&self) -> usize {
        self.pages
            .values()
            .filter(|page| !page.attr.non_owning)
            .count()
    }

    pub fn start_address(&self) -> A {
        self.start_address
    }

    pub fn set_start_address(&mut self, address: A) {
        self.start_address = address;
    }

    /// Initial stack pointer, as seeded by the loader.
    pub fn stack_initial(&self) -> A {
        self.stack_address
    }

    pub fn set_stack_initial(&mut self, address: A) {
        self.stack_address = address;
    }

    /// Address guest functions return to when called through the call-setup
    /// interface.
    pub fn exit_address(&self) -> A {
        self.exit_address
    }

    pub fn set_exit_address(&mut self, address: A) {
        self.exit_address = address;
    }

    pub fn set_page_fault_handler(&mut self, handler: PageFaultHandler<A>) {
        self.page_fault_handler = handler;
    }

    pub fn set_page_write_handler(&mut self, handler: PageWriteHandler<A>) {
        self.page_write_handler = handler;
    }

    pub fn set_page_read_handler(&mut self, handler: Option<PageReadHandler<A>>) {
        self.page_read_handler = handler;
    }

    /// The structural-change stamp validated by execution caches.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Clears both lookaside slots and invalidates every CPU execution
    /// cache (by bumping the generation they validate against).
    pub fn invalidate_cache(&mut self) {
        self.rd_cache = None;
        self.wr_cache = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Page lookup that never faults: shared read-only pages first, then
    /// the page map, then the foreign read hook, then the zero page.
    pub fn get_pageno(&self, pageno: A) -> &Page {
        if let Some(ro) = &self.ropages {
            if ro.contains(pageno) {
                return ro.page(pageno);
            }
        }
        if let Some(page) = self.pages.get(&pageno) {
            return page;
        }
        if let Some(handler) = self.page_read_handler {
            if let Some(page) = handler(self, pageno) {
                return page;
            }
        }
        Page::zero_page()
    }

    /// Page lookup for instruction fetch. Unlike data reads there is no
    /// zero-page fallback: executing unmapped memory is a protection fault.
    pub fn get_exec_pageno(&self, pageno: A) -> Result<&Page, MemoryError> {
        if let Some(ro) = &self.ropages {
            if ro.contains(pageno) {
                return Ok(ro.page(pageno));
            }
        }
        self.pages
            .get(&pageno)
            .ok_or(MemoryError::ProtectionFault {
                address: pageno.to_u64() << PAGE_SHIFT,
            })
    }

    /// The page containing `address`, with read permission checked.
    pub fn get_readable_page(&mut self, address: A) -> Result<&Page, MemoryError> {
        let pageno = Self::page_number(address);
        if let Some(entry) = &self.rd_cache {
            if entry.pageno == pageno {
                // SAFETY: the slot is cleared on every structural change,
                // so a populated slot always points at a live page.
                return Ok(unsafe { entry.page.as_ref() });
            }
        }
        let ptr = {
            let page = self.get_pageno(pageno);
            if !page.attr.read {
                return Err(MemoryError::ProtectionFault {
                    address: address.to_u64(),
                });
            }
            NonNull::from(page)
        };
        self.rd_cache = Some(CachedPage { pageno, page: ptr });
        // SAFETY: just derived from a live borrow of self.
        Ok(unsafe { &*ptr.as_ptr() })
    }

    /// The page containing `address` as an owned, writable page,
    /// materializing and promoting as needed.
    pub fn get_writable_page(&mut self, address: A) -> Result<&mut Page, MemoryError> {
        let pageno = Self::page_number(address);
        if let Some(entry) = &self.wr_cache {
            if entry.pageno == pageno {
                // SAFETY: see `get_readable_page`.
                return Ok(unsafe { &mut *entry.page.as_ptr() });
            }
        }
        {
            let page = self.create_page(pageno)?;
            if !page.attr.write {
                return Err(MemoryError::ProtectionFault {
                    address: address.to_u64(),
                });
            }
        }
        let ptr = NonNull::from(
            self.pages
                .get_mut(&pageno)
                .expect("create_page produced a mapped page"),
        );
        self.wr_cache = Some(CachedPage { pageno, page: ptr });
        // SAFETY: just derived from a live borrow of self.
        Ok(unsafe { &mut *ptr.as_ptr() })
    }

    /// Returns the mapped page at `pageno`, promoting copy-on-write backing
    /// and invoking the page fault handler for unmapped page numbers.
    ///
    /// An existing mapped page wins over the shared read-only area; a page
    /// number inside the area that is not shadowed by a mapped page faults
    /// rather than promoting, because the area's backing may be shared
    /// across machines.
    pub fn create_page(&mut self, pageno: A) -> Result<&mut Page, MemoryError> {
        if self.pages.contains_key(&pageno) {
            let handler = self.page_write_handler;
            let page = self.pages.get_mut(&pageno).expect("checked above");
            if page.attr.is_cow {
                if !page.has_data() || !page.attr.write {
                    return Err(MemoryError::ProtectionFault {
                        address: pageno.to_u64() << PAGE_SHIFT,
                    });
                }
                trace!("promoting copy-on-write page {pageno:#x}");
                handler(pageno, page);
            }
            return Ok(self.pages.get_mut(&pageno).expect("checked above"));
        }
        if let Some(ro) = &self.ropages {
            if ro.contains(pageno) {
                return Err(MemoryError::ProtectionFault {
                    address: pageno.to_u64() << PAGE_SHIFT,
                });
            }
        }
        (self.page_fault_handler)(self, pageno)?;
        self.pages
            .get_mut(&pageno)
            .ok_or(MemoryError::InvalidOperation {
                reason: "page fault handler did not map a page",
                pageno: pageno.to_u64(),
            })
    }

    /// Maps `page` at `pageno`, replacing any previous mapping.
    ///
    /// This is the only path that grows the page table; it clears the
    /// lookaside caches because the insert may rearrange storage.
    pub fn allocate_page(&mut self, pageno: A, page: Page) -> &mut Page {
        self.invalidate_cache();
        self.pages.insert(pageno, page);
        self.pages.get_mut(&pageno).expect("just inserted")
    }

    /// Releases the pages covering `[address, address + len)`. Sentinel
    /// fallbacks are untouched: freed page numbers simply resolve to the
    /// zero page again.
    pub fn free_pages(&mut self, address: A, len: usize) {
        let mut pageno = Self::page_number(address);
        let mut remaining = len / PAGE_SIZE;
        while remaining > 0 {
            self.pages.remove(&pageno);
            pageno = pageno.wrapping_add(A::ONE);
            remaining -= 1;
        }
        self.invalidate_cache();
    }

    /// Inserts `shared` at `pageno` as a non-owning mapping.
    ///
    /// The target page number must currently resolve to a sentinel or to a
    /// non-owning mapping; a real owned page there is an error, as is a
    /// shared page claiming access permissions without backing bytes.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `shared`'s backing bytes outlive this
    /// memory (they are referenced, not copied).
    pub unsafe fn install_shared_page(
        &mut self,
        pageno: A,
        shared: &Page,
    ) -> Result<(), MemoryError> {
        let existing = self.get_pageno(pageno);
        if !Page::is_sentinel(existing) && !existing.attr.non_owning {
            return Err(MemoryError::InvalidOperation {
                reason: "a page is already mapped at the shared page's location",
                pageno: pageno.to_u64(),
            });
        }
        let attr = shared.attr;
        let page = match shared.backing_ptr() {
            Some(ptr) => Page::new_foreign(attr, ptr),
            None if shared.is_zero_backed() => Page::new_zero(attr),
            None => {
                if attr.read || attr.write || attr.exec {
                    return Err(MemoryError::InvalidOperation {
                        reason: "shared page grants access but has no backing",
                        pageno: pageno.to_u64(),
                    });
                }
                Page::new_empty(attr)
            }
        };
        self.allocate_page(pageno, page);
        Ok(())
    }

    /// Maps `len` bytes of host memory starting at `src` into the guest at
    /// `dst`, page by page, as non-owning pages with the given attributes.
    ///
    /// `dst` and `len` must be page-aligned; violating that is a caller
    /// bug and panics.
    ///
    /// # Safety
    ///
    /// `src..src + len` must be valid for reads and writes for as long as
    /// the mapping exists, and the embedder must synchronize any concurrent
    /// host-side access.
    pub unsafe fn insert_non_owned_memory(
        &mut self,
        dst: A,
        src: *mut u8,
        len: usize,
        attr: PageAttributes,
    ) {
        assert!(
            Self::page_offset(dst) == 0 && len % PAGE_SIZE == 0,
            "non-owned mappings must be page-aligned"
        );
        let mut pageno = Self::page_number(dst);
        for offset in (0..len).step_by(PAGE_SIZE) {
            let ptr = NonNull::new(src.add(offset)).expect("non-null host mapping");
            self.pages.insert(pageno, Page::new_foreign(attr, ptr));
            pageno = pageno.wrapping_add(A::ONE);
        }
        self.invalidate_cache();
    }

    /// Installs a shared read-only segment covering `data`, starting at the
    /// page-aligned guest address `base`. The data is copied once into the
    /// area; other machines share it by cloning the returned handle.
    pub fn insert_ro_segment(&mut self, base: A, data: &[u8], attr: PageAttributes) -> Arc<RoArea<A>> {
        assert!(
            Self::page_offset(base) == 0,
            "read-only segments must be page-aligned"
        );
        let page_count = data.len().div_ceil(PAGE_SIZE);
        let mut backing = vec![0u8; page_count * PAGE_SIZE].into_boxed_slice();
        backing[..data.len()].copy_from_slice(data);
        let mut pages = Vec::with_capacity(page_count);
        for chunk in 0..page_count {
            let ptr = NonNull::new(backing[chunk * PAGE_SIZE..].as_ptr() as *mut u8)
                .expect("boxed backing is non-null");
            let mut page_attr = attr;
            page_attr.write = false;
            pages.push(Page::new_foreign(page_attr, ptr));
        }
        let begin = Self::page_number(base);
        let area = Arc::new(RoArea {
            begin,
            end: begin.wrapping_add(A::from_u64(page_count as u64)),
            pages,
            _data: backing,
        });
        self.install_ro_area(area.clone());
        area
    }

    /// Adopts a shared read-only area created by another memory.
    pub fn install_ro_area(&mut self, area: Arc<RoArea<A>>) {
        self.ropages = Some(area);
        self.invalidate_cache();
    }

    /// Sets page attributes over `[address, address + len)`.
    ///
    /// Non-default attributes materialize pages as needed. Default
    /// attributes are only applied to pages that already left the
    /// copy-on-write state, so untouched ranges stay lazily mapped.
    pub fn set_page_attr(
        &mut self,
        address: A,
        len: usize,
        attr: PageAttributes,
    ) -> Result<(), MemoryError> {
        let is_default = attr.is_default();
        let mut dst = address;
        let mut remaining = len;
        while remaining > 0 {
            let size = remaining.min(PAGE_SIZE);
            let pageno = Self::page_number(dst);
            if !is_default {
                self.create_page(pageno)?.attr = attr;
            } else {
                let page = self.get_pageno(pageno);
                if !page.attr.is_cow {
                    self.create_page(pageno)?.attr = attr;
                }
            }
            dst = dst.wrapping_add(A::from_u64(size as u64));
            remaining -= size;
        }
        self.invalidate_cache();
        Ok(())
    }

    //
    // Bulk and typed accessors
    //

    /// Reads `buf.len()` bytes starting at `address`, honoring page
    /// permissions.
    pub fn read_bytes(&mut self, address: A, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut addr = address;
        let mut done = 0;
        while done < buf.len() {
            let offset = Self::page_offset(addr);
            let size = (PAGE_SIZE - offset).min(buf.len() - done);
            let page = self.get_readable_page(addr)?;
            let data = page.data().ok_or(MemoryError::ProtectionFault {
                address: addr.to_u64(),
            })?;
            buf[done..done + size].copy_from_slice(&data[offset..offset + size]);
            addr = addr.wrapping_add(A::from_u64(size as u64));
            done += size;
        }
        Ok(())
    }

    /// Writes `buf` starting at `address`, honoring page permissions and
    /// copy-on-write promotion.
    pub fn write_bytes(&mut self, address: A, buf: &[u8]) -> Result<(), MemoryError> {
        let mut addr = address;
        let mut done = 0;
        while done < buf.len() {
            let offset = Self::page_offset(addr);
            let size = (PAGE_SIZE - offset).min(buf.len() - done);
            let page = self.get_writable_page(addr)?;
            let data = page.data_mut().ok_or(MemoryError::ProtectionFault {
                address: addr.to_u64(),
            })?;
            data[offset..offset + size].copy_from_slice(&buf[done..done + size]);
            addr = addr.wrapping_add(A::from_u64(size as u64));
            done += size;
        }
        Ok(())
    }

    /// Writes `buf` starting at `address` without honoring write
    /// permissions, materializing pages as needed. Used by loaders to seed
    /// segments that end up read-only or executable.
    ///
    /// A page that materializes without backing bytes is a protection
    /// fault.
    pub fn write_bytes_unchecked(&mut self, address: A, buf: &[u8]) -> Result<(), MemoryError> {
        let mut addr = address;
        let mut done = 0;
        while done < buf.len() {
            let offset = Self::page_offset(addr);
            let size = (PAGE_SIZE - offset).min(buf.len() - done);
            let pageno = Self::page_number(addr);
            let page = self.create_page(pageno)?;
            let data = page.data_mut().ok_or(MemoryError::ProtectionFault {
                address: addr.to_u64(),
            })?;
            data[offset..offset + size].copy_from_slice(&buf[done..done + size]);
            addr = addr.wrapping_add(A::from_u64(size as u64));
            done += size;
        }
        Ok(())
    }

    /// Fills `[address, address + len)` with `value`.
    pub fn memset(&mut self, address: A, value: u8, len: usize) -> Result<(), MemoryError> {
        let mut addr = address;
        let mut remaining = len;
        while remaining > 0 {
            let offset = Self::page_offset(addr);
            let size = (PAGE_SIZE - offset).min(remaining);
            let page = self.get_writable_page(addr)?;
            let data = page.data_mut().ok_or(MemoryError::ProtectionFault {
                address: addr.to_u64(),
            })?;
            data[offset..offset + size].fill(value);
            addr = addr.wrapping_add(A::from_u64(size as u64));
            remaining -= size;
        }
        Ok(())
    }

    /// Copies `len` bytes from guest address `src` to guest address `dst`.
    /// The ranges may not overlap in a way that matters: the copy goes
    /// through a bounce buffer one page at a time, front to back.
    pub fn memcpy_within(&mut self, dst: A, src: A, len: usize) -> Result<(), MemoryError> {
        let mut buf = [0u8; PAGE_SIZE];
        let mut done = 0;
        while done < len {
            let size = (len - done).min(PAGE_SIZE);
            let chunk = &mut buf[..size];
            self.read_bytes(src.wrapping_add(A::from_u64(done as u64)), chunk)?;
            self.write_bytes(dst.wrapping_add(A::from_u64(done as u64)), chunk)?;
            done += size;
        }
        Ok(())
    }

    /// Compares `len` bytes at two guest addresses, `memcmp`-style.
    pub fn memcmp(&mut self, p1: A, p2: A, len: usize) -> Result<i32, MemoryError> {
        for i in 0..len {
            let offset = A::from_u64(i as u64);
            let a = self.read_u8(p1.wrapping_add(offset))?;
            let b = self.read_u8(p2.wrapping_add(offset))?;
            if a != b {
                return Ok(a as i32 - b as i32);
            }
        }
        Ok(0)
    }

    /// Length of the zero-terminated string at `address`, up to `maxlen`.
    pub fn strlen(&mut self, address: A, maxlen: usize) -> Result<usize, MemoryError> {
        for i in 0..maxlen {
            if self.read_u8(address.wrapping_add(A::from_u64(i as u64)))? == 0 {
                return Ok(i);
            }
        }
        Ok(maxlen)
    }

    /// Reads the zero-terminated string at `address`, up to `maxlen` bytes.
    /// Invalid UTF-8 is replaced.
    pub fn memstring(&mut self, address: A, maxlen: usize) -> Result<String, MemoryError> {
        let len = self.strlen(address, maxlen)?;
        let mut buf = vec![0u8; len];
        self.read_bytes(address, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn read_small<const N: usize>(&mut self, address: A) -> Result<[u8; N], MemoryError> {
        let offset = Self::page_offset(address);
        if offset + N <= PAGE_SIZE {
            let page = self.get_readable_page(address)?;
            let data = page.data().ok_or(MemoryError::ProtectionFault {
                address: address.to_u64(),
            })?;
            let mut out = [0u8; N];
            out.copy_from_slice(&data[offset..offset + N]);
            Ok(out)
        } else {
            let mut out = [0u8; N];
            self.read_bytes(address, &mut out)?;
            Ok(out)
        }
    }

    fn write_small<const N: usize>(
        &mut self,
        address: A,
        bytes: [u8; N],
    ) -> Result<(), MemoryError> {
        let offset = Self::page_offset(address);
        if offset + N <= PAGE_SIZE {
            let page = self.get_writable_page(address)?;
            let data = page.data_mut().ok_or(MemoryError::ProtectionFault {
                address: address.to_u64(),
            })?;
            data[offset..offset + N].copy_from_slice(&bytes);
            Ok(())
        } else {
            self.write_bytes(address, &bytes)
        }
    }

    pub fn read_u8(&mut self, address: A) -> Result<u8, MemoryError> {
        Ok(self.read_small::<1>(address)?[0])
    }

    pub fn read_u16(&mut self, address: A) -> Result<u16, MemoryError> {
        Ok(u16::from_le_bytes(self.read_small(address)?))
    }

    pub fn read_u32(&mut self, address: A) -> Result<u32, MemoryError> {
        Ok(u32::from_le_bytes(self.read_small(address)?))
    }

    pub fn read_u64(&mut self, address: A) -> Result<u64, MemoryError> {
        Ok(u64::from_le_bytes(self.read_small(address)?))
    }

    pub fn read_u128(&mut self, address: A) -> Result<u128, MemoryError> {
        Ok(u128::from_le_bytes(self.read_small(address)?))
    }

    /// Reads one address-sized value.
    pub fn read_addr(&mut self, address: A) -> Result<A, MemoryError> {
        match A::BITS {
            32 => Ok(A::from_u32(self.read_u32(address)?)),
            64 => Ok(A::from_u64(self.read_u64(address)?)),
            _ => Ok(A::from_u128(self.read_u128(address)?)),
        }
    }

    pub fn write_u8(&mut self, address: A, value: u8) -> Result<(), MemoryError> {
        self.write_small(address, [value])
    }

    pub fn write_u16(&mut self, address: A, value: u16) -> Result<(), MemoryError> {
        self.write_small(address, value.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: A, value: u32) -> Result<(), MemoryError> {
        self.write_small(address, value.to_le_bytes())
    }

    pub fn write_u64(&mut self, address: A, value: u64) -> Result<(), MemoryError> {
        self.write_small(address, value.to_le_bytes())
    }

    pub fn write_u128(&mut self, address: A, value: u128) -> Result<(), MemoryError> {
        self.write_small(address, value.to_le_bytes())
    }

    /// Writes one address-sized value.
    pub fn write_addr(&mut self, address: A, value: A) -> Result<(), MemoryError> {
        match A::BITS {
            32 => self.write_u32(address, value.to_u32()),
            64 => self.write_u64(address, value.to_u64()),
            _ => self.write_u128(address, value.to_u128()),
        }
    }

    //
    // Executable segment
    //

    /// Stores the linear executable window used by the fetch hot path.
    pub(crate) fn init_exec_segment(&mut self, base: A, data: &[u8]) {
        self.exec = Some(ExecSegment {
            base,
            data: data.to_vec().into_boxed_slice(),
        });
    }

    pub(crate) fn exec_segment(&self) -> Option<&ExecSegment<A>> {
        self.exec.as_ref()
    }

    /// `true` if `address` lies inside the linear executable segment.
    pub fn is_executable(&self, address: A) -> bool {
        match &self.exec {
            Some(seg) => {
                address >= seg.base
                    && address < seg.base.wrapping_add(A::from_u64(seg.data.len() as u64))
            }
            None => false,
        }
    }

    //
    // Forking and serialization support
    //

    /// Duplicates the page map by reference: the child maps every page
    /// non-owning and copy-on-write, so its first write to a page promotes
    /// it to an owned copy. The shared read-only area is shared by
    /// reference count.
    ///
    /// # Safety
    ///
    /// The parent memory must outlive the child (the child references the
    /// parent's page backing until promotion).
    pub(crate) unsafe fn fork(&self) -> Self {
        let mut pages = HashMap::with_capacity(self.pages.len());
        for (&pageno, page) in &self.pages {
            let mut attr = page.attr;
            attr.is_cow = true;
            let child = if page.is_zero_backed() {
                Page::new_zero(attr)
            } else if let Some(ptr) = page.backing_ptr() {
                Page::new_foreign(attr, ptr)
            } else {
                Page::new_empty(attr)
            };
            pages.insert(pageno, child);
        }
        let exec = self.exec.as_ref().map(|seg| ExecSegment {
            base: seg.base,
            data: seg.data.clone(),
        });
        Self {
            pages,
            ropages: self.ropages.clone(),
            rd_cache: None,
            wr_cache: None,
            generation: 0,
            page_fault_handler: self.page_fault_handler,
            page_write_handler: self.page_write_handler,
            page_read_handler: self.page_read_handler,
            memory_max: self.memory_max,
            start_address: self.start_address,
            stack_address: self.stack_address,
            exit_address: self.exit_address,
            exec,
        }
    }

    /// All mapped pages, for state serialization.
    pub(crate) fn mapped_pages(&self) -> impl Iterator<Item = (A, &Page)> {
        self.pages.iter().map(|(&pageno, page)| (pageno, page))
    }

    /// Drops every owned page, keeping non-owning mappings (they are
    /// referenced by identity in serialized state).
    pub(crate) fn clear_owned_pages(&mut self) {
        self.pages.retain(|_, page| page.attr.non_owning);
        self.invalidate_cache();
    }
}

/// Default page fault handler: allocate an owned, zeroed, readable and
/// writable page, within the configured memory limit.
pub fn default_page_fault<A: Address>(
    memory: &mut Memory<A>,
    pageno: A,
) -> Result<(), MemoryError> {
    let committed = (memory.pages_active() as u64 + 1) * PAGE_SIZE as u64;
    if committed > memory.memory_max {
        return Err(MemoryError::OutOfMemory {
            pageno: pageno.to_u64(),
        });
    }
    trace!("materializing page {pageno:#x}");
    memory.allocate_page(pageno, Page::new_owned(PageAttributes::default()));
    Ok(())
}

/// Default copy-on-write promotion: owned backing with a copy of the
/// current contents.
pub fn default_page_write<A: Address>(_pageno: A, page: &mut Page) {
    page.make_writable();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory<u64> {
        Memory::new(DEFAULT_MEMORY_MAX)
    }

    #[test]
    fn test_unmapped_address_resolves_to_the_zero_page() {
        let mem = memory();
        let page = mem.get_pageno(8);
        assert!(std::ptr::eq(page, Page::zero_page()));
    }

    #[test]
    fn test_first_write_materializes_an_owned_page() {
        let mut mem = memory();
        assert!(std::ptr::eq(mem.get_pageno(8), Page::zero_page()));
        mem.write_u8(0x8000, 0x5A).unwrap();
        let page = mem.get_pageno(8);
        assert!(!std::ptr::eq(page, Page::zero_page()));
        assert!(!page.attr.is_cow);
        let data = page.data().unwrap();
        assert_eq!(data[0], 0x5A);
        assert!(data[1..].iter().all(|&b| b == 0));
        assert_eq!(mem.owned_pages_active(), 1);
    }

    #[test]
    fn test_reads_of_fresh_memory_are_zero() {
        let mut mem = memory();
        assert_eq!(mem.read_u64(0x1234).unwrap(), 0);
        assert_eq!(mem.read_u8(0).unwrap(), 0);
    }

    #[test]
    fn test_rw_roundtrip_across_page_boundary() {
        let mut mem = memory();
        let addr = 0x1FFE; // straddles pages 1 and 2
        mem.write_u32(addr, 0xAABBCCDD).unwrap();
        assert_eq!(mem.read_u32(addr).unwrap(), 0xAABBCCDD);
        assert_eq!(mem.read_u16(0x1FFE).unwrap(), 0xCCDD);
        assert_eq!(mem.read_u16(0x2000).unwrap(), 0xAABB);
    }

    #[test]
    fn test_free_pages_returns_range_to_zero_page() {
        let mut mem = memory();
        mem.write_u8(0x3000, 1).unwrap();
        mem.write_u8(0x4000, 2).unwrap();
        mem.free_pages(0x3000, PAGE_SIZE);
        assert!(std::ptr::eq(mem.get_pageno(3), Page::zero_page()));
        assert_eq!(mem.read_u8(0x3000).unwrap(), 0);
        assert_eq!(mem.read_u8(0x4000).unwrap(), 2);
    }

    #[test]
    fn test_lookaside_cache_survives_repeated_access() {
        let mut mem = memory();
        mem.write_u8(0x5000, 7).unwrap();
        // Same page twice: second access is the cache hit path.
        assert_eq!(mem.read_u8(0x5001).unwrap(), 0);
        assert_eq!(mem.read_u8(0x5000).unwrap(), 7);
        // A structural change must not leave the cache pointing anywhere
        // stale.
        mem.free_pages(0x5000, PAGE_SIZE);
        assert_eq!(mem.read_u8(0x5000).unwrap(), 0);
    }

    #[test]
    fn test_generation_bumps_on_structural_changes() {
        let mut mem = memory();
        let g0 = mem.generation();
        mem.write_u8(0x1000, 1).unwrap();
        let g1 = mem.generation();
        assert_ne!(g0, g1);
        mem.free_pages(0x1000, PAGE_SIZE);
        assert_ne!(g1, mem.generation());
    }

    #[test]
    fn test_write_to_read_only_page_faults() {
        let mut mem = memory();
        mem.write_u8(0x6000, 9).unwrap();
        let attr = PageAttributes {
            read: true,
            write: false,
            ..PageAttributes::default()
        };
        mem.set_page_attr(0x6000, PAGE_SIZE, attr).unwrap();
        assert_eq!(mem.read_u8(0x6000).unwrap(), 9);
        assert!(matches!(
            mem.write_u8(0x6000, 1),
            Err(MemoryError::ProtectionFault { address: 0x6000 })
        ));
    }

    #[test]
    fn test_non_owned_mapping_respects_attributes() {
        let mut mem = memory();
        let mut host = vec![0u8; PAGE_SIZE];
        host[0] = 0x11;
        let attr = PageAttributes {
            read: true,
            write: false,
            ..PageAttributes::default()
        };
        unsafe {
            mem.insert_non_owned_memory(0x4000, host.as_mut_ptr(), PAGE_SIZE, attr);
        }
        assert_eq!(mem.read_u8(0x4000).unwrap(), 0x11);
        assert!(matches!(
            mem.write_u8(0x4000, 0x22),
            Err(MemoryError::ProtectionFault { address: 0x4000 })
        ));
        // Host-side updates are visible through the mapping.
        host[1] = 0x33;
        assert_eq!(mem.read_u8(0x4001).unwrap(), 0x33);
    }

    #[test]
    fn test_writable_non_owned_mapping_writes_through() {
        let mut mem = memory();
        let mut host = vec![0u8; PAGE_SIZE];
        unsafe {
            mem.insert_non_owned_memory(
                0x4000,
                host.as_mut_ptr(),
                PAGE_SIZE,
                PageAttributes::default(),
            );
        }
        mem.write_u8(0x4002, 0x77).unwrap();
        assert_eq!(host[2], 0x77);
    }

    #[test]
    fn test_install_shared_page_preconditions() {
        let mut mem_a = memory();
        mem_a.write_u8(0x9000, 0x42).unwrap();
        let mut mem_b = memory();
        // Sharing over a sentinel slot works.
        let shared_ok = unsafe {
            let page = mem_a.get_pageno(9);
            mem_b.install_shared_page(9, page)
        };
        assert!(shared_ok.is_ok());
        assert_eq!(mem_b.read_u8(0x9000).unwrap(), 0x42);
        // Sharing over an owned page is rejected.
        let mut mem_c = memory();
        mem_c.write_u8(0x9000, 0x01).unwrap();
        let shared_conflict = unsafe {
            let page = mem_a.get_pageno(9);
            mem_c.install_shared_page(9, page)
        };
        assert!(matches!(
            shared_conflict,
            Err(MemoryError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_ro_segment_reads_but_never_promotes() {
        let mut mem = memory();
        let attr = PageAttributes {
            read: true,
            write: false,
            exec: true,
            ..PageAttributes::default()
        };
        mem.insert_ro_segment(0x10000, &[1, 2, 3, 4], attr);
        assert_eq!(mem.read_u8(0x10002).unwrap(), 3);
        assert!(matches!(
            mem.write_u8(0x10000, 0xFF),
            Err(MemoryError::ProtectionFault { .. })
        ));
    }

    #[test]
    fn test_memory_max_is_enforced() {
        let mut mem: Memory<u64> = Memory::new(2 * PAGE_SIZE as u64);
        mem.write_u8(0x1000, 1).unwrap();
        mem.write_u8(0x2000, 2).unwrap();
        assert!(matches!(
            mem.write_u8(0x3000, 3),
            Err(MemoryError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_memset_and_memcmp() {
        let mut mem = memory();
        mem.memset(0x7000, 0xAB, 8192).unwrap();
        assert_eq!(mem.read_u8(0x7000).unwrap(), 0xAB);
        assert_eq!(mem.read_u8(0x8FFF).unwrap(), 0xAB);
        mem.memset(0x20000, 0xAB, 8192).unwrap();
        assert_eq!(mem.memcmp(0x7000, 0x20000, 8192).unwrap(), 0);
        mem.write_u8(0x20004, 0xAC).unwrap();
        assert!(mem.memcmp(0x7000, 0x20000, 8192).unwrap() < 0);
    }

    #[test]
    fn test_strings() {
        let mut mem = memory();
        mem.write_bytes(0x1000, b"hello\0world").unwrap();
        assert_eq!(mem.strlen(0x1000, 64).unwrap(), 5);
        assert_eq!(mem.memstring(0x1000, 64).unwrap(), "hello");
    }

    #[test]
    fn test_memcpy_within() {
        let mut mem = memory();
        mem.write_bytes(0x1000, b"abcdef").unwrap();
        mem.memcpy_within(0x2FFE, 0x1000, 6).unwrap();
        let mut buf = [0u8; 6];
        mem.read_bytes(0x2FFE, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_write_unchecked_ignores_write_protection() {
        let mut mem = memory();
        let attr = PageAttributes {
            read: true,
            write: false,
            exec: true,
            ..PageAttributes::default()
        };
        mem.write_bytes_unchecked(0x1000, &[0x13, 0x00, 0x00, 0x00])
            .unwrap();
        mem.set_page_attr(0x1000, PAGE_SIZE, attr).unwrap();
        // A loader can keep seeding a read-only segment.
        mem.write_bytes_unchecked(0x1004, &[0x93, 0x00, 0x00, 0x00])
            .unwrap();
        assert_eq!(mem.read_u8(0x1004).unwrap(), 0x93);
        // The ordinary write path still faults.
        assert!(mem.write_u8(0x1004, 0).is_err());
    }

    #[test]
    fn test_fork_shares_pages_copy_on_write() {
        let mut parent = memory();
        parent.write_u8(0xA000, 0x01).unwrap();
        let mut child = unsafe { parent.fork() };
        assert_eq!(child.read_u8(0xA000).unwrap(), 0x01);
        // Child write promotes its own copy; parent unaffected.
        child.write_u8(0xA000, 0x02).unwrap();
        assert_eq!(child.read_u8(0xA000).unwrap(), 0x02);
        assert_eq!(parent.read_u8(0xA000).unwrap(), 0x01);
        let promoted = child.get_pageno(0xA);
        assert!(!promoted.attr.is_cow);
        assert!(!promoted.attr.non_owning);
    }

    #[test]
    fn test_foreign_read_hook_serves_unmapped_pages() {
        use std::sync::OnceLock;
        static SHARED: OnceLock<Page> = OnceLock::new();

        fn hook(_: &Memory<u64>, pageno: u64) -> Option<&'static Page> {
            if pageno != 0x42 {
                return None;
            }
            Some(SHARED.get_or_init(|| {
                let mut page = Page::new_owned(PageAttributes {
                    read: true,
                    write: false,
                    ..PageAttributes::default()
                });
                page.data_mut().unwrap()[0] = 0x99;
                page
            }))
        }

        let mut mem = memory();
        mem.set_page_read_handler(Some(hook));
        assert_eq!(mem.read_u8(0x42000).unwrap(), 0x99);
        // Pages the hook declines still fall back to the zero page.
        assert!(std::ptr::eq(mem.get_pageno(0x43), Page::zero_page()));
        // A mapped page shadows the hook.
        mem.write_u8(0x42000, 0x01).unwrap();
        assert_eq!(mem.read_u8(0x42000).unwrap(), 0x01);
    }

    #[test]
    fn test_set_page_attr_default_skips_untouched_pages() {
        let mut mem = memory();
        mem.set_page_attr(0xB000, PAGE_SIZE, PageAttributes::default())
            .unwrap();
        // Still lazily mapped: no page was created for the default attrs.
        assert!(std::ptr::eq(mem.get_pageno(0xB), Page::zero_page()));
    }
}
