//! The raw, uncached 4-level AMD64 page-table walk.
//!
//! Grounded on `vmi-utils`' own page-table-monitor implementation
//! (`ptm/arch/amd64.rs`: `is_leaf`/`leaf_pa`/`read_pte`) and on
//! `vmi-arch-amd64`'s `Architecture for Amd64::translate_address`
//! (`va_index_for`/`va_offset_for`, large-page short-circuiting). Unlike
//! both of those, this walk never consults or populates
//! `VmiCore`'s internal v2p cache: every call re-reads the guest's page
//! tables from scratch, because the W→X machine must see today's backing
//! frame even if the driver's cache still remembers yesterday's (SPEC_FULL.md
//! §4.1).

use vmi_arch_amd64::{Amd64, PageTableEntry, PageTableLevel};
use vmi_core::{Architecture as _, Gfn, MemoryAccess, Pa, Va, VmiCore, driver::VmiRead};

use crate::error::{Result, UnpackError};

/// The outcome of a successful leaf-level translation.
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    /// The guest-physical frame backing the page containing `va`.
    pub gfn: Gfn,
    /// The guest-physical address `va` itself translates to.
    pub pa: Pa,
    /// The size, in bytes, of the leaf mapping (4 KiB, 2 MiB, or 1 GiB).
    pub page_size: u64,
    /// Whether the leaf entry is writable.
    pub writable: bool,
    /// Whether the leaf entry is executable (not marked no-execute).
    pub executable: bool,
}

/// Reads a single page table entry at a guest-physical address.
fn read_pte<Driver>(vmi: &VmiCore<Driver>, pa: Pa) -> Result<PageTableEntry>
where
    Driver: VmiRead,
{
    Ok(vmi.read_struct(pa)?)
}

/// Walks the four-level AMD64 page table hierarchy rooted at `root`,
/// resolving `va`.
///
/// Fails with [`UnpackError::Vmi`] wrapping a [`vmi_core::VmiError::Translation`]
/// page fault when any level is not present, mirroring the "page-walk gap"
/// error kind in SPEC_FULL.md §7 (the caller treats this as "page skipped,
/// state unchanged", never as a hard failure of the run).
pub fn resolve<Driver>(vmi: &VmiCore<Driver>, va: Va, root: Pa) -> Result<Resolved>
where
    Driver: VmiRead,
{
    let pml4i = Amd64::va_index_for(va, PageTableLevel::Pml4);
    let pml4e = read_pte(vmi, root + pml4i * 8)?;
    if !pml4e.present() {
        return Err(page_fault(va, root));
    }

    let pdpt_root = Amd64::pa_from_gfn(pml4e.pfn());
    let pdpti = Amd64::va_index_for(va, PageTableLevel::Pdpt);
    let pdpte = read_pte(vmi, pdpt_root + pdpti * 8)?;
    if !pdpte.present() {
        return Err(page_fault(va, root));
    }

    if pdpte.large() {
        return Ok(leaf(va, PageTableLevel::Pdpt, pdpte));
    }

    let pd_root = Amd64::pa_from_gfn(pdpte.pfn());
    let pdi = Amd64::va_index_for(va, PageTableLevel::Pd);
    let pde = read_pte(vmi, pd_root + pdi * 8)?;
    if !pde.present() {
        return Err(page_fault(va, root));
    }

    if pde.large() {
        return Ok(leaf(va, PageTableLevel::Pd, pde));
    }

    let pt_root = Amd64::pa_from_gfn(pde.pfn());
    let pti = Amd64::va_index_for(va, PageTableLevel::Pt);
    let pte = read_pte(vmi, pt_root + pti * 8)?;
    if !pte.present() {
        return Err(page_fault(va, root));
    }

    Ok(leaf(va, PageTableLevel::Pt, pte))
}

fn leaf(va: Va, level: PageTableLevel, pte: PageTableEntry) -> Resolved {
    let page_size = match level {
        PageTableLevel::Pt => 0x1000,
        PageTableLevel::Pd => 0x20_0000,
        PageTableLevel::Pdpt => 0x4000_0000,
        PageTableLevel::Pml4 => unreachable!("PML4 entries are never leaves"),
    };

    Resolved {
        gfn: pte.pfn(),
        pa: Amd64::pa_from_gfn(pte.pfn()) + Amd64::va_offset_for(va, level),
        page_size,
        writable: pte.write(),
        executable: executable(pte),
    }
}

/// `PageTableEntry` exposes the raw bits but not a convenience accessor for
/// the NX bit (bit 63); access rights are expressed here as
/// [`MemoryAccess`] so callers compare against the same bitflags type the
/// Trap Controller arms.
fn executable(pte: PageTableEntry) -> bool {
    const NX_BIT: u64 = 1 << 63;
    pte.0 & NX_BIT == 0
}

fn page_fault(va: Va, root: Pa) -> UnpackError {
    UnpackError::Vmi(vmi_core::VmiError::page_fault((va, root)))
}

/// Converts a [`Resolved`] leaf's access bits to a [`MemoryAccess`] value.
pub fn access_of(resolved: &Resolved) -> MemoryAccess {
    let mut access = MemoryAccess::R;
    if resolved.writable {
        access |= MemoryAccess::W;
    }
    if resolved.executable {
        access |= MemoryAccess::X;
    }
    access
}
