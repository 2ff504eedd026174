//! Guest memory pages.
//!
//! A [`Page`] is the 4096-byte unit of the guest address space: a set of
//! [`PageAttributes`] plus optional backing bytes. Backing comes in three
//! real flavors (none, owned, foreign) plus the process-wide zero sentinel.
//!
//! Two sentinel pages exist once per process and are shared by every
//! machine: the immutable all-zeros page that untouched addresses resolve
//! to, and the inaccessible guard page. Sentinels are identified by address,
//! not by content.

use std::fmt;
use std::ptr::NonNull;

/// The size of one guest page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// `address >> PAGE_SHIFT` is the page number of an address.
pub const PAGE_SHIFT: u32 = 12;

const_assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);

/// One page worth of backing bytes, aligned so host pointers into foreign
/// buffers can be reinterpreted page-wise.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageData(pub [u8; PAGE_SIZE]);

impl PageData {
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}

impl fmt::Debug for PageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 4096 raw bytes are never useful in a debug dump.
        write!(f, "PageData({} bytes)", PAGE_SIZE)
    }
}

/// Access permissions and ownership flags of one page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageAttributes {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// The page's contents are shared or lazily materialized; it must be
    /// promoted to owned, writable backing before the first write lands.
    pub is_cow: bool,
    /// The backing bytes belong to someone else (the embedder, or another
    /// machine) and are not freed with this page.
    pub non_owning: bool,
}

impl Default for PageAttributes {
    /// Plain working memory: readable and writable, not executable.
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            exec: false,
            is_cow: false,
            non_owning: false,
        }
    }
}

impl PageAttributes {
    /// `true` if these are the attributes a freshly materialized page would
    /// get anyway, meaning a range update does not need to create pages.
    pub fn is_default(&self) -> bool {
        self.read && self.write && !self.exec && !self.is_cow
    }

    /// Pack into the serialized-state bit layout.
    pub(crate) fn to_bits(self) -> u8 {
        (self.read as u8)
            | (self.write as u8) << 1
            | (self.exec as u8) << 2
            | (self.is_cow as u8) << 3
            | (self.non_owning as u8) << 4
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & 1 != 0,
            write: bits & 2 != 0,
            exec: bits & 4 != 0,
            is_cow: bits & 8 != 0,
            non_owning: bits & 16 != 0,
        }
    }
}

/// Where a page's bytes live.
#[derive(Debug)]
enum Backing {
    /// No bytes at all (the guard page).
    None,
    /// The process-wide zero block. Reads see zeros; writes require
    /// promotion.
    Zero,
    /// Bytes owned by this page and freed with it.
    Owned(Box<PageData>),
    /// Bytes owned elsewhere; never freed by this page. The owner must
    /// outlive the mapping. Byte-aligned on purpose: embedder buffers are
    /// not required to be page-aligned.
    Foreign(NonNull<u8>),
}

/// One page of the guest address space.
#[derive(Debug)]
pub struct Page {
    pub attr: PageAttributes,
    backing: Backing,
}

// SAFETY: `Foreign` backing is a borrow of embedder-managed memory. The
// embedder hands it in through `unsafe` APIs whose contract includes keeping
// the memory valid and synchronizing any cross-thread access; everything
// else the page holds is owned.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

static ZERO_PAGE_DATA: PageData = PageData::zeroed();

static ZERO_PAGE: Page = Page {
    attr: PageAttributes {
        read: true,
        write: false,
        exec: false,
        is_cow: true,
        non_owning: false,
    },
    backing: Backing::Zero,
};

static GUARD_PAGE: Page = Page {
    attr: PageAttributes {
        read: false,
        write: false,
        exec: false,
        is_cow: false,
        non_owning: true,
    },
    backing: Backing::None,
};

impl Page {
    /// A fresh page with owned, zeroed backing.
    pub fn new_owned(attr: PageAttributes) -> Self {
        Self {
            attr,
            backing: Backing::Owned(Box::new(PageData::zeroed())),
        }
    }

    /// A page whose bytes are owned elsewhere. `attr.non_owning` is forced
    /// on.
    ///
    /// The caller guarantees `data` points to [`PAGE_SIZE`] valid bytes for
    /// the page's lifetime; this is enforced by the `unsafe` entry points
    /// that create these.
    pub(crate) fn new_foreign(mut attr: PageAttributes, data: NonNull<u8>) -> Self {
        attr.non_owning = true;
        Self {
            attr,
            backing: Backing::Foreign(data),
        }
    }

    /// A page with attributes but no backing bytes at all (a guard-style
    /// mapping).
    pub(crate) fn new_empty(attr: PageAttributes) -> Self {
        Self {
            attr,
            backing: Backing::None,
        }
    }

    /// A copy-on-write page reading from the process-wide zero block.
    pub(crate) fn new_zero(mut attr: PageAttributes) -> Self {
        attr.is_cow = true;
        Self {
            attr,
            backing: Backing::Zero,
        }
    }

    /// The process-wide all-zeros sentinel. Fresh, untouched addresses
    /// resolve to this exact page.
    pub fn zero_page() -> &'static Page {
        &ZERO_PAGE
    }

    /// The process-wide inaccessible sentinel.
    pub fn guard_page() -> &'static Page {
        &GUARD_PAGE
    }

    /// Sentinels are identified by address, never by content.
    pub fn is_sentinel(page: &Page) -> bool {
        std::ptr::eq(page, &ZERO_PAGE) || std::ptr::eq(page, &GUARD_PAGE)
    }

    /// `true` if reads from this page can produce bytes.
    pub fn has_data(&self) -> bool {
        !matches!(self.backing, Backing::None)
    }

    pub fn data(&self) -> Option<&[u8; PAGE_SIZE]> {
        match &self.backing {
            Backing::None => None,
            Backing::Zero => Some(&ZERO_PAGE_DATA.0),
            Backing::Owned(data) => Some(&data.0),
            // SAFETY: the embedder keeps foreign backing alive, see
            // `new_foreign`. `[u8; PAGE_SIZE]` has alignment 1.
            Backing::Foreign(ptr) => {
                Some(unsafe { &*(ptr.as_ptr() as *const [u8; PAGE_SIZE]) })
            }
        }
    }

    /// Mutable access to the backing bytes. `None` for the guard page and
    /// for zero backing, which must be promoted first.
    pub fn data_mut(&mut self) -> Option<&mut [u8; PAGE_SIZE]> {
        match &mut self.backing {
            Backing::None | Backing::Zero => None,
            Backing::Owned(data) => Some(&mut data.0),
            // SAFETY: see `new_foreign`; `&mut self` serializes access from
            // this machine's side.
            Backing::Foreign(ptr) => {
                Some(unsafe { &mut *(ptr.as_ptr() as *mut [u8; PAGE_SIZE]) })
            }
        }
    }

    /// Copy-on-write promotion: give this page owned backing holding a copy
    /// of its current contents, and clear the sharing flags.
    pub fn make_writable(&mut self) {
        let owned = match &self.backing {
            Backing::Owned(_) => None,
            Backing::None | Backing::Zero => Some(Box::new(PageData::zeroed())),
            // SAFETY: see `new_foreign`.
            Backing::Foreign(ptr) => {
                let mut copy = Box::new(PageData::zeroed());
                copy.0
                    .copy_from_slice(unsafe { &*(ptr.as_ptr() as *const [u8; PAGE_SIZE]) });
                Some(copy)
            }
        };
        if let Some(owned) = owned {
            self.backing = Backing::Owned(owned);
        }
        self.attr.is_cow = false;
        self.attr.non_owning = false;
    }

    /// A pointer to this page's backing bytes, for sharing them into
    /// another machine as a non-owning mapping. `None` when there are no
    /// backing bytes, and for zero backing (share [`Page::new_zero`]
    /// instead).
    pub(crate) fn backing_ptr(&self) -> Option<NonNull<u8>> {
        match &self.backing {
            Backing::None | Backing::Zero => None,
            Backing::Owned(data) => NonNull::new(data.0.as_ptr() as *mut u8),
            Backing::Foreign(ptr) => Some(*ptr),
        }
    }

    /// `true` if this page reads from the zero block (sentinel or a
    /// machine-owned zero-backed CoW page).
    pub(crate) fn is_zero_backed(&self) -> bool {
        matches!(self.backing, Backing::Zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_page_reads_zeros() {
        let zero = Page::zero_page();
        assert!(zero.attr.read);
        assert!(zero.attr.is_cow);
        assert!(!zero.attr.write);
        assert!(zero.data().unwrap().iter().all(|&b| b == 0));
        assert!(Page::is_sentinel(zero));
    }

    #[test]
    fn test_guard_page_has_no_backing() {
        let guard = Page::guard_page();
        assert!(!guard.attr.read && !guard.attr.write && !guard.attr.exec);
        assert!(guard.attr.non_owning);
        assert!(guard.data().is_none());
        assert!(Page::is_sentinel(guard));
    }

    #[test]
    fn test_sentinels_are_identified_by_address() {
        let lookalike = Page::new_zero(PageAttributes {
            read: true,
            write: false,
            exec: false,
            is_cow: true,
            non_owning: false,
        });
        assert!(!Page::is_sentinel(&lookalike));
    }

    #[test]
    fn test_make_writable_promotes_zero_backing() {
        let mut page = Page::new_zero(PageAttributes::default());
        assert!(page.data_mut().is_none());
        page.make_writable();
        assert!(!page.attr.is_cow);
        assert!(!page.attr.non_owning);
        let data = page.data_mut().unwrap();
        data[0] = 0xAA;
        assert_eq!(page.data().unwrap()[0], 0xAA);
        // The zero block itself must stay untouched.
        assert_eq!(Page::zero_page().data().unwrap()[0], 0);
    }

    #[test]
    fn test_make_writable_copies_foreign_backing() {
        let mut source = vec![0u8; PAGE_SIZE];
        source[7] = 0x42;
        let ptr = NonNull::new(source.as_mut_ptr()).unwrap();
        let mut page = Page::new_foreign(PageAttributes::default(), ptr);
        page.attr.is_cow = true;
        page.make_writable();
        assert_eq!(page.data().unwrap()[7], 0x42);
        page.data_mut().unwrap()[7] = 0x43;
        // Writes after promotion land in the owned copy.
        assert_eq!(source[7], 0x42);
    }

    #[test]
    fn test_attribute_bits_roundtrip() {
        let attr = PageAttributes {
            read: true,
            write: false,
            exec: true,
            is_cow: false,
            non_owning: true,
        };
        assert_eq!(PageAttributes::from_bits(attr.to_bits()), attr);
    }
}
