//! Wiring and dispatch (`Engine`): ties the Paging Mirror, Trap Controller,
//! Page Classifier, W→X machine, VAD Walker, Dump Queue, and Process
//! Tracker together behind one [`vmi_core::VmiHandler`] implementation.
//!
//! Grounded on `examples/windows-breakpoint-manager.rs`'s `Monitor` struct:
//! one dedicated view created at startup (`create_view`/`switch_to_view`),
//! a `memory_access`/`singlestep` pair of per-reason handlers driven by a
//! `dispatch` match on `vmi.event().reason()`, `VmiEventResponse::toggle_*`
//! builders to re-arm/single-step, and `check_completion`/`Output` to let
//! the shutdown-signal flag end the session's `handle` loop. Unlike that
//! example there is no interrupt/breakpoint monitoring: this crate only
//! ever watches memory-access and singlestep events.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{info, warn};
use vmi_arch_amd64::{Amd64, EventReason};
use vmi_core::{
    Gfn, MemoryAccess, Pa, Va, VmiContext, VmiCore, VmiError, VmiEventResponse, VmiHandler,
    VmiSession, View,
    driver::VmiFullDriver,
};
use vmi_os_windows::WindowsOs;

use crate::{
    classify::{self, Category},
    config::Config,
    dump::{DumpJob, DumpQueue, MemorySegment},
    paging::{AccessKind, PagingMirror},
    profile::KernelProfile,
    trap::{RawMemoryAccessEvent, TrapController},
    tracker::{self, MonitoredProcess, ProcessTracker},
    vad::{self, VadNode, VadVisitor},
    wx::{self, Transition},
};

/// How many dispatched events elapse between active-process-list rescans
/// when `--follow-children` is set. A rescan walks the whole list, so this
/// trades lag in noticing a new child against not doing that walk on every
/// single trap.
const PROCESS_RESCAN_INTERVAL: u64 = 256;

/// Adapts a live [`vmi_core::VmiEvent`]/[`vmi_arch_amd64::EventMemoryAccess`]
/// pair to [`RawMemoryAccessEvent`].
///
/// The view comes from the outer event; the frame comes from the inner
/// reason. There is no `From<Pa> for Gfn` in this crate's page-table
/// primitives, so the frame number is derived directly from the fixed 4 KiB
/// page size used throughout (see [`crate::model::Vpn::PAGE_SHIFT`]).
struct LiveMemoryAccessEvent<'a> {
    view: Option<View>,
    access: &'a vmi_arch_amd64::EventMemoryAccess,
}

impl RawMemoryAccessEvent for LiveMemoryAccessEvent<'_> {
    fn view(&self) -> Option<View> {
        self.view
    }

    fn gfn(&self) -> Gfn {
        Gfn(self.access.pa.0 >> 12)
    }

    fn access(&self) -> MemoryAccess {
        self.access.access
    }
}

/// The handler installed into [`VmiSession::handle`] for one run of the
/// unpacker.
pub struct Engine<'a, Driver>
where
    Driver: VmiFullDriver<Architecture = Amd64>,
{
    config: &'a Config,
    profile: &'a KernelProfile,
    kernel_root: Pa,
    list_head: Va,
    view: View,
    terminate_flag: Arc<AtomicBool>,
    mirror: PagingMirror,
    trap: TrapController,
    tracker: ProcessTracker,
    queue: DumpQueue,
    sequence: u64,
    /// Frames armed per pid, so [`Self::retire_process`] can disarm them all
    /// on exit without scanning the whole Paging Mirror.
    armed: HashMap<crate::model::Pid, Vec<Gfn>>,
    /// Events seen since the last active-process-list rescan.
    rescan_counter: u64,
}

impl<'a, Driver> Engine<'a, Driver>
where
    Driver: VmiFullDriver<Architecture = Amd64>,
{
    /// Builds an `Engine` already monitoring `target`: creates the dedicated
    /// view and arms initial traps on every instrumented page found by a
    /// first VAD walk.
    ///
    /// Mirrors `Monitor::new`'s shape (pause guard around setup, one view
    /// created up front, singlestep monitoring enabled once) but arms page
    /// traps from VAD classification instead of fixed kernel-function
    /// breakpoints: memory-access monitoring itself is implicit in this
    /// library (always delivered), so there is no analog of the example's
    /// `monitor_enable(EventMonitor::Interrupt(..))` call.
    ///
    /// Takes `target` already resolved rather than a [`crate::config::ProcessSelector`]
    /// because resolution can fail with [`crate::error::UnpackError::ProcessNotFound`],
    /// which has no `VmiError` equivalent — [`VmiSession::handle`]'s factory
    /// closure must return `Result<_, VmiError>`, so the caller resolves the
    /// target first and only calls this once that has succeeded.
    pub fn new(
        session: &VmiSession<Driver, WindowsOs<Driver>>,
        config: &'a Config,
        profile: &'a KernelProfile,
        kernel_root: Pa,
        list_head: Va,
        target: MonitoredProcess,
        queue: DumpQueue,
        terminate_flag: Arc<AtomicBool>,
    ) -> Result<Self, VmiError> {
        let _pause_guard = session.pause_guard()?;

        session.monitor_enable(vmi_arch_amd64::EventMonitor::Singlestep)?;

        let view = session.create_view(MemoryAccess::RWX)?;
        session.switch_to_view(view)?;

        let mut engine = Self {
            config,
            profile,
            kernel_root,
            list_head,
            view,
            terminate_flag,
            mirror: PagingMirror::new(),
            trap: TrapController::new(),
            tracker: ProcessTracker::new(),
            queue,
            sequence: 0,
            armed: HashMap::new(),
            rescan_counter: 0,
        };

        info!(pid = %target.pid, name = %target.name, "monitoring process");
        engine.arm_process(session, &target);
        engine.tracker.enlist(target);

        Ok(engine)
    }

    /// Walks `process`'s VAD tree once, arming a write-trap on every page of
    /// every instrumented category.
    ///
    /// Pages are armed lazily per-VAD rather than per-page: only the first
    /// page of each VAD is resolved and armed here, since most of a VAD's
    /// pages are not yet backed by a frame at attach time. The remainder
    /// are picked up as they fault (first touch always raises *some* access,
    /// which `handle_memory_access` classifies and arms on demand).
    fn arm_process(&mut self, vmi: &VmiCore<Driver>, process: &MonitoredProcess) {
        struct InitialArm<'e, 'a, D: VmiFullDriver<Architecture = Amd64>> {
            engine: &'e mut Engine<'a, D>,
            vmi: &'e VmiCore<D>,
            pid: crate::model::Pid,
            root: Pa,
        }

        impl<D: VmiFullDriver<Architecture = Amd64>> VadVisitor for InitialArm<'_, '_, D> {
            fn visit(&mut self, node: VadNode) -> bool {
                let translation = self.engine.mirror.resolve(self.vmi, node.base, self.root);
                let page_executable = translation.as_ref().map(|t| t.executable).unwrap_or(false);
                let category = classify::classify(Some(&node), page_executable);
                if !classify::is_instrumented(
                    category,
                    self.engine.config.include_library,
                    self.engine.config.include_heap,
                    self.engine.config.include_stack,
                ) {
                    return true;
                }

                match translation {
                    Ok(translation) => {
                        self.engine
                            .mirror
                            .record_fault_mut(self.pid, node.base, translation.gpa, category);
                        self.engine.trap.arm(self.vmi, self.engine.view, translation.gfn, MemoryAccess::W);
                        self.engine.armed.entry(self.pid).or_default().push(translation.gfn);
                    }
                    Err(_) => {
                        // Not yet backed by a frame; picked up on first fault.
                    }
                }

                true
            }
        }

        let mut visitor = InitialArm {
            engine: self,
            vmi,
            pid: process.pid,
            root: process.root,
        };
        let (root, vad_root, cap) = (process.root, process.vad_root, visitor.engine.config.segment_cap);
        vad::walk(vmi, visitor.engine.profile, root, vad_root, cap, &mut visitor);
    }

    /// Re-walks the active-process list, enlisting unseen children of
    /// already-tracked processes and retiring any tracked pid that has
    /// disappeared from it.
    ///
    /// This crate's chosen introspection backend has no dedicated
    /// process-creation/exit event (see `EventReason`'s variants), and
    /// installing a kernel-function breakpoint to detect them the way the
    /// teacher's own examples do would mean patching guest code — writing
    /// guest memory, which this crate otherwise never does. Periodic
    /// re-enumeration reuses the already-read-only Process Tracker walk
    /// instead, at the cost of detecting a new child up to
    /// `PROCESS_RESCAN_INTERVAL` events late.
    fn rescan_processes(&mut self, vmi: &VmiCore<Driver>) {
        let kernel_root = self.kernel_root;
        let list_head = self.list_head;
        let profile = self.profile;

        let mut seen = std::collections::HashSet::new();
        let mut new_children = Vec::new();

        tracker::enumerate(vmi, profile, kernel_root, list_head, |mp| {
            seen.insert(mp.pid);
            if !self.tracker.is_tracked(mp.pid) && self.tracker.should_follow(mp.parent) {
                new_children.push(mp);
            }
        });

        for child in new_children {
            info!(pid = %child.pid, name = %child.name, parent = ?child.parent, "following child process");
            self.arm_process(vmi, &child);
            self.tracker.enlist(child);
        }

        let exited: Vec<_> = self
            .tracker
            .iter()
            .map(|p| p.pid)
            .filter(|pid| !seen.contains(pid))
            .collect();

        for pid in exited {
            self.retire_process(vmi, pid);
        }
    }

    /// Drops a process's tracker entry, Paging Mirror records, and any
    /// traps still armed on its pages.
    fn retire_process(&mut self, vmi: &VmiCore<Driver>, pid: crate::model::Pid) {
        let Some(process) = self.tracker.retire(pid) else {
            return;
        };
        info!(pid = %pid, name = %process.name, "process exited; releasing tracked state");

        self.mirror.forget_process(pid);
        if let Some(gfns) = self.armed.remove(&pid) {
            for gfn in gfns {
                self.trap.disarm(vmi, self.view, gfn, MemoryAccess::RWX);
            }
        }
    }

    fn handle_memory_access(
        &mut self,
        vmi: &VmiContext<'_, Driver, WindowsOs<Driver>>,
        access: &vmi_arch_amd64::EventMemoryAccess,
    ) -> VmiEventResponse<Amd64> {
        let event = LiveMemoryAccessEvent {
            view: vmi.event().view(),
            access,
        };

        let Some(trap_event) = self.trap.check_event(&event) else {
            // Not in a view we watch; let it run unimpeded.
            return VmiEventResponse::default();
        };

        let Some(process) = self.current_process(vmi) else {
            return VmiEventResponse::default();
        };
        let pid = process.pid;
        let root = process.root;

        let kind = crate::trap::dominant_kind(trap_event.access);

        let translation = match self.mirror.resolve(vmi, access.va, root) {
            Ok(t) => t,
            Err(_) => {
                // Demand-paging fault: let it through, don't count as a write.
                return VmiEventResponse::default();
            }
        };

        let category = self.mirror.record(pid, access.va).map(|r| r.category).unwrap_or_else(|| {
            self.classify_for_fault(vmi, root, access.va)
        });

        let record = self.mirror.record_fault_mut(pid, access.va, translation.gpa, category);
        let transition = wx::observe(record, kind, true);

        match transition {
            Transition::ArmExecute => {
                self.trap.arm(vmi, self.view, translation.gfn, MemoryAccess::X);
                self.armed.entry(pid).or_default().push(translation.gfn);
            }
            Transition::EmitDumpJob => {
                let rip = Va(vmi.registers().rip);
                self.emit_dump_job(vmi, &process, access.va, rip);
                // Handing the job to the queue is as far as this crate tracks
                // completion; nothing downstream distinguishes "enqueued" from
                // "written to disk", so mark the page dumped here rather than
                // wait on a signal the writer thread never sends back.
                let record = self.mirror.record_fault_mut(pid, access.va, translation.gpa, category);
                wx::mark_dumped(record);
            }
            Transition::None => {}
        }

        self.begin_singlestep(vmi, vmi.event().vcpu_id(), trap_event.view, translation.gfn)
    }

    /// Classifies the page at `va` by finding its containing VAD, for the
    /// case where this is the first fault ever observed on it (no
    /// [`crate::paging::PageRecord`] exists yet to read a cached category
    /// from).
    fn classify_for_fault(
        &self,
        vmi: &VmiCore<Driver>,
        root: Pa,
        va: Va,
    ) -> Category {
        struct FindContaining {
            target: Va,
            found: Option<VadNode>,
        }

        impl VadVisitor for FindContaining {
            fn visit(&mut self, node: VadNode) -> bool {
                if self.target.0 >= node.base.0 && self.target.0 < node.base.0 + node.size {
                    self.found = Some(node);
                    return false;
                }
                true
            }
        }

        let Some(process) = self.tracker.iter().find(|p| p.root == root) else {
            return Category::Unknown;
        };

        let mut visitor = FindContaining {
            target: va,
            found: None,
        };
        vad::walk(vmi, self.profile, root, process.vad_root, self.config.segment_cap, &mut visitor);

        let page_executable = self.mirror.resolve(vmi, va, root).map(|t| t.executable).unwrap_or(false);
        classify::classify(visitor.found.as_ref(), page_executable)
    }

    fn current_process<'e>(&'e self, vmi: &VmiContext<'_, Driver, WindowsOs<Driver>>) -> Option<MonitoredProcess> {
        let root = vmi.registers().cr3.into();
        self.tracker.iter().find(|p| p.root == root).cloned()
    }

    fn begin_singlestep(
        &mut self,
        vmi: &VmiCore<Driver>,
        vcpu: vmi_core::VcpuId,
        view: View,
        gfn: Gfn,
    ) -> VmiEventResponse<Amd64> {
        self.trap.begin_singlestep(vmi, vcpu, view, gfn);
        VmiEventResponse::toggle_singlestep().and_set_view(vmi.default_view())
    }

    fn handle_singlestep(&mut self, vmi: &VmiContext<'_, Driver, WindowsOs<Driver>>) -> VmiEventResponse<Amd64> {
        self.trap.complete_singlestep(vmi, vmi.event().vcpu_id());
        VmiEventResponse::toggle_singlestep().and_set_view(self.view)
    }

    /// Walks the triggering process's VAD tree, captures every instrumented
    /// segment, and enqueues a [`DumpJob`].
    fn emit_dump_job(&mut self, vmi: &VmiCore<Driver>, process: &MonitoredProcess, trigger_va: Va, rip: Va) {
        struct Capture<'e, D: VmiFullDriver<Architecture = Amd64>> {
            vmi: &'e VmiCore<D>,
            mirror: &'e PagingMirror,
            root: Pa,
            include_library: bool,
            include_heap: bool,
            include_stack: bool,
            segments: Vec<MemorySegment>,
        }

        impl<D: VmiFullDriver<Architecture = Amd64>> VadVisitor for Capture<'_, D> {
            fn visit(&mut self, node: VadNode) -> bool {
                let page_executable = self
                    .mirror
                    .resolve(self.vmi, node.base, self.root)
                    .map(|t| t.executable)
                    .unwrap_or(false);
                let category = classify::classify(Some(&node), page_executable);
                if !classify::is_instrumented(category, self.include_library, self.include_heap, self.include_stack) {
                    return true;
                }

                let data = self.mirror.read_bytes(self.vmi, self.root, node.base, node.size);
                self.segments.push(MemorySegment {
                    virtual_base: node.base,
                    size: node.size,
                    vad_type: node.vad_type,
                    protection: node.protection,
                    is_private: node.is_private,
                    filename: node.filename.clone(),
                    data,
                });

                true
            }
        }

        let mut capture = Capture {
            vmi,
            mirror: &self.mirror,
            root: process.root,
            include_library: self.config.include_library,
            include_heap: self.config.include_heap,
            include_stack: self.config.include_stack,
            segments: Vec::new(),
        };
        vad::walk(vmi, self.profile, process.root, process.vad_root, self.config.segment_cap, &mut capture);

        self.sequence += 1;
        let job = DumpJob {
            pid: process.pid,
            rip,
            trigger_va,
            sequence: self.sequence,
            segments: capture.segments,
        };

        if let Err(err) = self.queue.enqueue(job) {
            warn!(%err, pid = %process.pid, "failed to enqueue dump job");
        }
    }

    fn dispatch(&mut self, vmi: &VmiContext<'_, Driver, WindowsOs<Driver>>) -> VmiEventResponse<Amd64> {
        if self.config.follow_children {
            self.rescan_counter += 1;
            if self.rescan_counter >= PROCESS_RESCAN_INTERVAL {
                self.rescan_counter = 0;
                self.rescan_processes(vmi);
            }
        }

        match vmi.event().reason() {
            EventReason::MemoryAccess(access) => self.handle_memory_access(vmi, access),
            EventReason::Singlestep(_) => self.handle_singlestep(vmi),
            other => {
                warn!(?other, "unhandled event reason");
                VmiEventResponse::default()
            }
        }
    }
}

impl<Driver> VmiHandler<Driver, WindowsOs<Driver>> for Engine<'_, Driver>
where
    Driver: VmiFullDriver<Architecture = Amd64>,
{
    type Output = ();

    fn handle_event(&mut self, vmi: VmiContext<'_, Driver, WindowsOs<Driver>>) -> VmiEventResponse<Amd64> {
        vmi.flush_v2p_cache();
        self.dispatch(&vmi)
    }

    fn check_completion(&self) -> Option<Self::Output> {
        self.terminate_flag.load(Ordering::Relaxed).then_some(())
    }
}
