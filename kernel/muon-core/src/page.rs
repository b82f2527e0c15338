//! Page-table entry encoding and page-granularity address types.
//!
//! A [`Pte`] packs a frame number and a [`PteFlags`] set into one word.
//! The swap subsystem steals bit 7: a PTE with `PRESENT` clear and
//! `SWAPPED` set describes a page whose contents live in a swap file
//! identified by `(pid, vpn)` — the rest of the entry is unused in that
//! state, because the backing is named, not addressed.

use bitflags::bitflags;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

bitflags! {
    /// Flag bits of a page-table entry.
    ///
    /// `ACCESSED` and `DIRTY` sit at bits 5 and 6, where the hardware
    /// walker writes them; `SWAPPED` is the software-reserved bit 7.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// The mapping is present in memory.
        const PRESENT  = 1 << 0;
        /// The page is writable.
        const WRITABLE = 1 << 1;
        /// The page is reachable from user mode.
        const USER     = 1 << 2;
        /// Hardware-set: the page has been read or written.
        const ACCESSED = 1 << 5;
        /// Hardware-set: the page has been written.
        const DIRTY    = 1 << 6;
        /// Software-reserved: the page is in a swap file.
        const SWAPPED  = 1 << 7;
    }
}

/// Virtual page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Vpn(usize);

impl Vpn {
    /// Creates a `Vpn` from a raw page number.
    pub const fn new(val: usize) -> Self {
        Self(val)
    }

    /// Returns the page number containing virtual address `va`.
    pub const fn containing(va: usize) -> Self {
        Self(va >> PAGE_SHIFT)
    }

    /// Returns the raw page number.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the base virtual address of this page.
    pub const fn base(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

impl core::fmt::Display for Vpn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical frame number handed out by the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Frame(usize);

impl Frame {
    /// Creates a `Frame` from a raw frame number.
    pub const fn new(val: usize) -> Self {
        Self(val)
    }

    /// Returns the raw frame number.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// One page-table entry: frame number plus [`PteFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// An entry with no mapping and no flags.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry mapping `frame` with `flags`.
    pub const fn new(frame: Frame, flags: PteFlags) -> Self {
        Self(((frame.0 as u64) << PAGE_SHIFT) | flags.bits())
    }

    /// Returns the flag bits.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns the mapped frame. Meaningless while `SWAPPED` is set.
    pub const fn frame(self) -> Frame {
        Frame((self.0 >> PAGE_SHIFT) as usize)
    }

    /// Returns `true` if `PRESENT` is set.
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Returns `true` if `USER` is set.
    pub const fn is_user(self) -> bool {
        self.0 & PteFlags::USER.bits() != 0
    }

    /// Returns `true` if the entry describes a swapped-out page.
    pub const fn is_swapped(self) -> bool {
        !self.is_present() && self.0 & PteFlags::SWAPPED.bits() != 0
    }

    /// Returns a copy with `extra` flags set.
    pub fn with_flags(self, extra: PteFlags) -> Self {
        Self(self.0 | extra.bits())
    }

    /// Returns a copy with `removed` flags cleared.
    pub fn without_flags(self, removed: PteFlags) -> Self {
        Self(self.0 & !removed.bits())
    }

    /// Returns the on-disk form of this entry: `PRESENT` cleared and
    /// `SWAPPED` set. The frame bits are left behind but carry no meaning.
    pub fn mark_swapped(self) -> Self {
        self.without_flags(PteFlags::PRESENT)
            .with_flags(PteFlags::SWAPPED)
    }

    /// Maps the hardware accessed/dirty bits into the 4-way replacement
    /// class. Lower classes are better eviction victims:
    ///
    /// | A | D | class |
    /// |---|---|-------|
    /// | 0 | 0 | 0     |
    /// | 1 | 1 | 1     |
    /// | 1 | 0 | 2     |
    /// | 0 | 1 | 3     |
    ///
    /// Not-recently-used pages are preferred; among recently-used pages a
    /// dirty one outranks a clean one, because writing it out at least
    /// saves a future writeback.
    pub const fn replacement_class(self) -> usize {
        let accessed = self.0 & PteFlags::ACCESSED.bits() != 0;
        let dirty = self.0 & PteFlags::DIRTY.bits() != 0;
        match (accessed, dirty) {
            (false, false) => 0,
            (true, true) => 1,
            (true, false) => 2,
            (false, true) => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_addressing() {
        assert_eq!(Vpn::containing(0).as_usize(), 0);
        assert_eq!(Vpn::containing(4095).as_usize(), 0);
        assert_eq!(Vpn::containing(4096).as_usize(), 1);
        assert_eq!(Vpn::new(3).base(), 3 * PAGE_SIZE);
    }

    #[test]
    fn pte_packs_frame_and_flags() {
        let pte = Pte::new(Frame::new(7), PteFlags::PRESENT | PteFlags::USER);
        assert_eq!(pte.frame(), Frame::new(7));
        assert!(pte.is_present());
        assert!(pte.is_user());
        assert!(!pte.is_swapped());
    }

    #[test]
    fn mark_swapped_flips_present_for_swapped() {
        let pte = Pte::new(
            Frame::new(9),
            PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE,
        );
        let swapped = pte.mark_swapped();
        assert!(!swapped.is_present());
        assert!(swapped.is_swapped());
        // Other flags survive; they are simply unused while on disk.
        assert!(swapped.flags().contains(PteFlags::USER));
    }

    #[test]
    fn swapped_requires_present_clear() {
        // A present entry with the software bit set is not "swapped".
        let pte = Pte::new(Frame::new(1), PteFlags::PRESENT | PteFlags::SWAPPED);
        assert!(!pte.is_swapped());
    }

    #[test]
    fn replacement_classes() {
        let base = Pte::new(Frame::new(0), PteFlags::PRESENT | PteFlags::USER);
        assert_eq!(base.replacement_class(), 0);
        assert_eq!(
            base.with_flags(PteFlags::ACCESSED | PteFlags::DIRTY)
                .replacement_class(),
            1
        );
        assert_eq!(base.with_flags(PteFlags::ACCESSED).replacement_class(), 2);
        assert_eq!(base.with_flags(PteFlags::DIRTY).replacement_class(), 3);
    }

    #[test]
    fn empty_is_inert() {
        assert!(!Pte::EMPTY.is_present());
        assert!(!Pte::EMPTY.is_swapped());
        assert_eq!(Pte::EMPTY.flags(), PteFlags::empty());
    }
}
