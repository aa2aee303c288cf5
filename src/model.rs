//! Small value types shared by every component.

use std::fmt;

/// A guest process ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A guest-virtual page number (a virtual address with the page offset bits
/// shifted out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vpn(pub u64);

impl Vpn {
    /// Page shift used throughout this crate (4-level 64-bit paging only,
    /// per the Non-goals in SPEC_FULL.md).
    pub const PAGE_SHIFT: u32 = 12;

    /// Returns the page number containing `va`.
    pub fn containing(va: vmi_core::Va) -> Self {
        Self(va.0 >> Self::PAGE_SHIFT)
    }

    /// Returns the first virtual address of this page.
    pub fn base(self) -> vmi_core::Va {
        vmi_core::Va(self.0 << Self::PAGE_SHIFT)
    }
}

impl fmt::Display for Vpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0 << Self::PAGE_SHIFT)
    }
}
