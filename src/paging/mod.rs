//! Paging Mirror (C1): a shadow of the guest's page tables for the
//! monitored process, plus the per-page metadata every other component
//! reads and mutates through it.
//!
//! Grounded on `vmi-utils::ptm::PageTableMonitor`'s role as the single owner
//! of page-table-derived state (`ptm/mod.rs`), but deliberately simpler:
//! the monitor there tracks page-in/page-out events across arbitrary tagged
//! addresses; this one is queried on demand, on every trap dispatch, and
//! never caches a translation across calls (see `amd64::resolve`'s doc
//! comment).

pub mod amd64;

use std::collections::HashMap;

use vmi_core::{Gfn, Pa, Va, VmiCore, driver::VmiRead};

use crate::{
    classify::Category,
    error::Result,
    model::{Pid, Vpn},
    wx::WxState,
};

pub use amd64::Resolved;

/// The outcome of [`PagingMirror::resolve`].
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    /// Guest-physical frame backing `gva`.
    pub gfn: Gfn,
    /// Guest-physical address `gva` translates to.
    pub gpa: Pa,
    /// Size, in bytes, of the leaf mapping.
    pub page_size: u64,
    /// Always `true`: a [`UnpackError::NotMapped`](crate::error::UnpackError)
    /// is returned instead of a `Translation` when any level is absent.
    pub present: bool,
    /// Whether the leaf entry is writable.
    pub writable: bool,
    /// Whether the leaf entry is executable.
    pub executable: bool,
}

/// Per-page metadata keyed by (monitored process, guest-virtual page).
///
/// Aggregates state conceptually owned by other components — [`Category`]
/// by the Page Classifier (C3), `state`/`generation` by the W→X State
/// Machine (C4) — because both are addressed by the same key the mirror
/// already owns; see `DESIGN.md`.
#[derive(Debug, Clone, Copy)]
pub struct PageRecord {
    /// The guest-physical frame currently backing the page.
    pub gpa: Pa,
    /// This page's classification.
    pub category: Category,
    /// This page's W→X state.
    pub state: WxState,
    /// Bumped on every observed write.
    pub generation: u64,
}

impl PageRecord {
    fn new(gpa: Pa, category: Category) -> Self {
        Self {
            gpa,
            category,
            state: WxState::Clean,
            generation: 0,
        }
    }
}

/// Kinds of access a trap dispatch can report to [`PagingMirror::record_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// A read fault. Never changes W→X state.
    Read,
    /// A write fault.
    Write,
    /// An execute fault.
    Execute,
}

/// Owns the per-(process, page) record store and resolves translations by
/// walking the guest's page tables directly, uncached.
///
/// Holds a single `HashMap` with no internal locking: the dispatch loop that
/// owns a `PagingMirror` is single-threaded, so the "one mutex over the PR
/// map" requirement is satisfied by Rust's ownership rules rather than an
/// actual `Mutex` (see `DESIGN.md`).
#[derive(Debug, Default)]
pub struct PagingMirror {
    records: HashMap<(Pid, Vpn), PageRecord>,
}

impl PagingMirror {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Walks the four-level page tables rooted at `root`, resolving `gva`.
    ///
    /// Never consults or updates the record store; callers that need a
    /// [`PageRecord`] call [`Self::record_fault`] with the result.
    pub fn resolve<Driver>(
        &self,
        vmi: &VmiCore<Driver>,
        gva: Va,
        root: Pa,
    ) -> Result<Translation>
    where
        Driver: VmiRead,
    {
        let resolved = amd64::resolve(vmi, gva, root)?;
        Ok(Translation {
            gfn: resolved.gfn,
            gpa: resolved.pa,
            page_size: resolved.page_size,
            present: true,
            writable: resolved.writable,
            executable: resolved.executable,
        })
    }

    /// Looks up the record for (`pid`, the page containing `gva`), if any
    /// has been observed yet.
    pub fn record(&self, pid: Pid, gva: Va) -> Option<&PageRecord> {
        self.records.get(&(pid, Vpn::containing(gva)))
    }

    /// Returns a mutable reference to the record for (`pid`, the page
    /// containing `gva`), creating it (at `category`, state `CLEAN`) if this
    /// is the first time the page has been observed.
    ///
    /// This is `record_fault`'s storage half; state-machine transitions
    /// themselves live in [`crate::wx::observe`], which takes the
    /// `&mut PageRecord` this returns.
    pub fn record_fault_mut(
        &mut self,
        pid: Pid,
        gva: Va,
        gpa: Pa,
        category: Category,
    ) -> &mut PageRecord {
        self.records
            .entry((pid, Vpn::containing(gva)))
            .or_insert_with(|| PageRecord::new(gpa, category))
    }

    /// Drops every record for `pid`, e.g. when the Process Tracker (C7)
    /// observes its exit.
    pub fn forget_process(&mut self, pid: Pid) {
        self.records.retain(|(p, _), _| *p != pid);
    }

    /// Reads up to `len` bytes starting at `va`, one page at a time, for the
    /// address space rooted at `root`.
    ///
    /// Best-effort: per SPEC_FULL.md §4.5/Open Question 2-3, a read that
    /// fails partway through is not an error to the caller — the bytes
    /// captured so far are returned, shorter than `len`. Used by the VAD
    /// Walker's capture visitor to build a [`crate::dump::MemorySegment`]
    /// without letting one unmapped page blank out an entire VAD.
    pub fn read_bytes<Driver>(&self, vmi: &VmiCore<Driver>, root: Pa, va: Va, len: u64) -> Vec<u8>
    where
        Driver: VmiRead,
    {
        const CHUNK: u64 = 0x1000;

        let mut out = Vec::with_capacity(len as usize);
        let mut offset = 0u64;

        while offset < len {
            let chunk_va = Va(va.0 + offset);
            let chunk_len = std::cmp::min(CHUNK - (chunk_va.0 & (CHUNK - 1)), len - offset);
            let mut buf = vec![0u8; chunk_len as usize];

            match vmi.read(vmi_core::AddressContext::new(chunk_va, root), &mut buf) {
                Ok(()) => {
                    out.extend_from_slice(&buf);
                    offset += chunk_len;
                }
                Err(_) => break,
            }
        }

        out
    }

    /// Number of pages currently tracked, across all processes. Used by
    /// tests and logging only.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no pages are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Category;

    #[test]
    fn record_fault_mut_creates_clean_record() {
        let mut mirror = PagingMirror::new();
        let pid = Pid(4);
        let gva = Va(0x4141_2000);
        let gpa = Pa(0x1000);

        let record = mirror.record_fault_mut(pid, gva, gpa, Category::Code);
        assert_eq!(record.state, WxState::Clean);
        assert_eq!(record.generation, 0);
        assert_eq!(record.gpa, gpa);

        record.generation += 1;

        // second call for the same page returns the existing record, not a
        // fresh one
        let again = mirror.record_fault_mut(pid, gva, gpa, Category::Code);
        assert_eq!(again.generation, 1);
    }

    #[test]
    fn records_are_keyed_per_process() {
        let mut mirror = PagingMirror::new();
        let gva = Va(0x1000);

        mirror.record_fault_mut(Pid(1), gva, Pa(0x2000), Category::Data);
        mirror.record_fault_mut(Pid(2), gva, Pa(0x3000), Category::Data);
        assert_eq!(mirror.len(), 2);

        mirror.forget_process(Pid(1));
        assert_eq!(mirror.len(), 1);
        assert!(mirror.record(Pid(1), gva).is_none());
        assert!(mirror.record(Pid(2), gva).is_some());
    }
}
