//! Trap Controller (C2): installs, arms, disarms, and single-steps SLAT
//! memory traps on guest-physical frames.
//!
//! Grounded on `vmi-utils::bpm::controller::memory::MemoryController`
//! (`monitor`/`unmonitor` narrowing a frame's [`MemoryAccess`] to RW/RWX)
//! and on `examples/windows-breakpoint-manager.rs`'s `memory_access`/
//! `singlestep` pair (`VmiEventResponse::toggle_singlestep`, re-arming on
//! the following singlestep event). Unlike the teacher's
//! `BreakpointManager`, there is no separate "default view" to switch into
//! for the duration of the single-step: the offending right is granted
//! directly on the monitored view, since this crate only ever watches one
//! view per frame. The map of denied rights is kept as an
//! [`indexmap::IndexMap`], the same structure `vmi-core` itself uses for
//! its own event-context bookkeeping (`session.rs`, `context.rs`).

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::warn;
use vmi_core::{
    Gfn, MemoryAccess, VcpuId, View, VmiCore,
    driver::{VmiQueryProtection, VmiSetProtection},
};

use crate::model::Vpn;

/// The decoded outcome of a memory trap event, ready for classification
/// against a [`crate::wx`] state.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    /// The view the event occurred in.
    pub view: View,
    /// The guest-physical frame that faulted.
    pub gfn: Gfn,
    /// The access rights that were attempted.
    pub access: MemoryAccess,
}

/// Owns the set of currently-armed (frame, view) traps and the bookkeeping
/// needed to re-arm one after its single-step completes.
///
/// Holds no callback: the single dispatch point the contract calls for is
/// `engine`'s `VmiHandler` implementation, which calls [`Self::check_event`]
/// once per event — the same shape `MemoryController::check_event` takes in
/// the teacher.
#[derive(Debug, Default)]
pub struct TrapController {
    /// Rights currently denied (and thus trapped) per (view, gfn).
    denied: IndexMap<(View, Gfn), MemoryAccess>,
    /// (view, gfn) awaiting re-arm once the named vCPU's outstanding
    /// single-step completes.
    pending: HashMap<VcpuId, (View, Gfn)>,
}

impl TrapController {
    /// Creates a controller with nothing armed.
    pub fn new() -> Self {
        Self {
            denied: IndexMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Installs (or extends) a trap on `gfn`: the bits in `rights_mask`
    /// will fault from now on. Idempotent per (gfn, bit).
    ///
    /// Failure is logged, not propagated: per SPEC_FULL.md §4.2, the page
    /// is re-armed the next time it is observed.
    pub fn arm<Driver>(
        &mut self,
        vmi: &VmiCore<Driver>,
        view: View,
        gfn: Gfn,
        rights_mask: MemoryAccess,
    ) where
        Driver: VmiSetProtection,
    {
        let denied = self.denied.entry((view, gfn)).or_insert(MemoryAccess::empty());
        *denied |= rights_mask;
        self.apply(vmi, view, gfn, *denied);
    }

    /// Removes `rights_mask` from the bits denied on `gfn`. Once no bits
    /// remain denied, the frame is granted full access and forgotten.
    pub fn disarm<Driver>(
        &mut self,
        vmi: &VmiCore<Driver>,
        view: View,
        gfn: Gfn,
        rights_mask: MemoryAccess,
    ) where
        Driver: VmiSetProtection,
    {
        let Some(denied) = self.denied.get_mut(&(view, gfn)) else {
            return;
        };

        denied.remove(rights_mask);
        let remaining = *denied;

        if remaining.is_empty() {
            self.denied.shift_remove(&(view, gfn));
        }

        self.apply(vmi, view, gfn, remaining);
    }

    fn apply<Driver>(&self, vmi: &VmiCore<Driver>, view: View, gfn: Gfn, denied: MemoryAccess)
    where
        Driver: VmiSetProtection,
    {
        let grant = MemoryAccess::RWX.difference(denied);
        if let Err(err) = vmi.set_memory_access(gfn, view, grant) {
            warn!(%err, ?gfn, ?view, "failed to set memory access; will retry on next observation");
        }
    }

    /// Decodes a memory-access event into a [`TrapEvent`] if it names a
    /// frame this controller is watching.
    pub fn check_event(
        &self,
        event: &impl RawMemoryAccessEvent,
    ) -> Option<TrapEvent> {
        Some(TrapEvent {
            view: event.view()?,
            gfn: event.gfn(),
            access: event.access(),
        })
    }

    /// Temporarily grants full access to `gfn` so the faulting instruction
    /// can complete, and records that `vcpu`'s next single-step event
    /// should re-arm it.
    ///
    /// Returns `false` if another single-step is already outstanding on
    /// `vcpu` (should not happen given the ordering guarantee in
    /// SPEC_FULL.md §5; logged and ignored rather than panicking).
    pub fn begin_singlestep<Driver>(
        &mut self,
        vmi: &VmiCore<Driver>,
        vcpu: VcpuId,
        view: View,
        gfn: Gfn,
    ) -> bool
    where
        Driver: VmiSetProtection,
    {
        if self.pending.contains_key(&vcpu) {
            warn!(?vcpu, "single-step already outstanding on this vCPU");
            return false;
        }

        if let Err(err) = vmi.set_memory_access(gfn, view, MemoryAccess::RWX) {
            warn!(%err, ?gfn, ?view, "failed to grant temporary access for single-step");
        }

        self.pending.insert(vcpu, (view, gfn));
        true
    }

    /// Re-arms the frame whose single-step just completed on `vcpu`.
    pub fn complete_singlestep<Driver>(&mut self, vmi: &VmiCore<Driver>, vcpu: VcpuId)
    where
        Driver: VmiSetProtection,
    {
        let Some((view, gfn)) = self.pending.remove(&vcpu) else {
            return;
        };

        let denied = self.denied.get(&(view, gfn)).copied().unwrap_or_default();
        self.apply(vmi, view, gfn, denied);
    }

    /// Number of (view, gfn) pairs currently armed. Used by tests and
    /// logging only.
    pub fn len(&self) -> usize {
        self.denied.len()
    }
}

/// Converts a read/write/execute access kind into the [`crate::wx::AccessKind`]
/// it corresponds to, preferring write over execute over read when more
/// than one bit is set (a single instruction can fault more than one right
/// in rapid succession; SPEC_FULL.md §4.4 only drives the machine off W/X).
pub fn dominant_kind(access: MemoryAccess) -> crate::paging::AccessKind {
    use crate::paging::AccessKind;

    if access.contains(MemoryAccess::W) {
        AccessKind::Write
    }
    else if access.contains(MemoryAccess::X) {
        AccessKind::Execute
    }
    else {
        AccessKind::Read
    }
}

/// Minimal surface of a memory-access event this controller needs; lets
/// [`TrapController::check_event`] stay independent of the concrete
/// `vmi_core::VmiEvent`/`EventMemoryAccess` types so it can be unit tested
/// against a fake event.
pub trait RawMemoryAccessEvent {
    /// The view the event occurred in, if any.
    fn view(&self) -> Option<View>;
    /// The guest-physical frame that faulted.
    fn gfn(&self) -> Gfn;
    /// The access rights attempted.
    fn access(&self) -> MemoryAccess;
}

/// The guest-virtual page a [`TrapEvent`] occurred on, when known.
///
/// Convenience used by `engine.rs` to key the Page Record after a
/// translation succeeds.
pub fn vpn_of(va: vmi_core::Va) -> Vpn {
    Vpn::containing(va)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeDriver {
        access: RefCell<HashMap<(View, Gfn), MemoryAccess>>,
    }

    impl vmi_core::VmiDriver for FakeDriver {
        type Architecture = vmi_arch_amd64::Amd64;

        fn info(&self) -> Result<vmi_core::VmiInfo, vmi_core::VmiError> {
            Ok(vmi_core::VmiInfo {
                page_size: 4096,
                page_shift: 12,
                max_gfn: Gfn(0xFFFF),
                vcpus: 1,
            })
        }
    }

    impl VmiQueryProtection for FakeDriver {
        fn memory_access(&self, gfn: Gfn, view: View) -> Result<MemoryAccess, vmi_core::VmiError> {
            Ok(self
                .access
                .borrow()
                .get(&(view, gfn))
                .copied()
                .unwrap_or(MemoryAccess::RWX))
        }
    }

    impl VmiSetProtection for FakeDriver {
        fn set_memory_access(
            &self,
            gfn: Gfn,
            view: View,
            access: MemoryAccess,
        ) -> Result<(), vmi_core::VmiError> {
            self.access.borrow_mut().insert((view, gfn), access);
            Ok(())
        }

        fn set_memory_access_with_options(
            &self,
            gfn: Gfn,
            view: View,
            access: MemoryAccess,
            _options: vmi_core::MemoryAccessOptions,
        ) -> Result<(), vmi_core::VmiError> {
            self.set_memory_access(gfn, view, access)
        }
    }

    #[test]
    fn arm_denies_only_the_requested_bits() {
        let driver = FakeDriver::default();
        let vmi = VmiCore::new(driver).expect("vmi core");
        let mut trap = TrapController::new();
        let view = View(0);
        let gfn = Gfn(7);

        trap.arm(&vmi, view, gfn, MemoryAccess::X);
        assert_eq!(
            vmi.driver().memory_access(gfn, view).unwrap(),
            MemoryAccess::RW
        );

        trap.arm(&vmi, view, gfn, MemoryAccess::W);
        assert_eq!(
            vmi.driver().memory_access(gfn, view).unwrap(),
            MemoryAccess::R
        );
        assert_eq!(trap.len(), 1);
    }

    #[test]
    fn disarm_restores_full_access_once_empty() {
        let driver = FakeDriver::default();
        let vmi = VmiCore::new(driver).expect("vmi core");
        let mut trap = TrapController::new();
        let view = View(0);
        let gfn = Gfn(3);

        trap.arm(&vmi, view, gfn, MemoryAccess::W);
        trap.disarm(&vmi, view, gfn, MemoryAccess::W);

        assert_eq!(
            vmi.driver().memory_access(gfn, view).unwrap(),
            MemoryAccess::RWX
        );
        assert_eq!(trap.len(), 0);
    }

    #[test]
    fn singlestep_grants_then_rearms() {
        let driver = FakeDriver::default();
        let vmi = VmiCore::new(driver).expect("vmi core");
        let mut trap = TrapController::new();
        let view = View(0);
        let gfn = Gfn(9);
        let vcpu = VcpuId(0);

        trap.arm(&vmi, view, gfn, MemoryAccess::W);
        assert!(trap.begin_singlestep(&vmi, vcpu, view, gfn));
        assert_eq!(
            vmi.driver().memory_access(gfn, view).unwrap(),
            MemoryAccess::RWX
        );

        trap.complete_singlestep(&vmi, vcpu);
        assert_eq!(
            vmi.driver().memory_access(gfn, view).unwrap(),
            MemoryAccess::R
        );
    }

    #[test]
    fn dominant_kind_prefers_write_over_execute() {
        assert_eq!(
            dominant_kind(MemoryAccess::W | MemoryAccess::X),
            crate::paging::AccessKind::Write
        );
        assert_eq!(dominant_kind(MemoryAccess::X), crate::paging::AccessKind::Execute);
        assert_eq!(dominant_kind(MemoryAccess::R), crate::paging::AccessKind::Read);
    }
}
