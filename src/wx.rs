//! W→X State Machine (C4): per-page transitions that decide when a Dump
//! Job is triggered.
//!
//! Grounded on the breakpoint/memory-controller state bookkeeping in
//! `bpm/controller/memory.rs` (a small per-key enum mutated by one
//! dispatch callback at a time) but with its own states, taken verbatim
//! from SPEC_FULL.md §4.4's transition table. Kept as a pure function over
//! `&mut PageRecord` rather than a struct owning its own map, so the
//! Paging Mirror (C1) remains the single owner of per-page storage.

use crate::paging::{AccessKind, PageRecord};

/// W→X state of a single [`PageRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WxState {
    /// No write observed since the last DUMPED state (or ever).
    Clean,
    /// A write was observed; waiting for an execute to decide whether this
    /// is an unpack event.
    Written,
    /// A write-then-execute was observed; a Dump Job has been emitted but
    /// not yet confirmed persisted.
    PendingExec,
    /// The triggering Dump Job was persisted; further execs of the same
    /// generation do not re-trigger.
    Dumped,
}

/// What [`observe`] decided should happen as a result of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No state change; nothing else to do.
    None,
    /// The page transitioned to WRITTEN; the caller should ensure the frame
    /// is armed for execute faults.
    ArmExecute,
    /// The page transitioned WRITTEN → PENDING_EXEC; the caller should
    /// build and enqueue a Dump Job for this (pid, gva).
    EmitDumpJob,
}

/// Applies one observed access to `record`, per the transition table in
/// SPEC_FULL.md §4.4, and reports what the caller should do.
///
/// `present` distinguishes a genuine access fault from a demand-paging
/// fault (page was not yet backed by a frame): the latter is serviced by
/// the caller but must never be counted as a write.
pub fn observe(record: &mut PageRecord, kind: AccessKind, present: bool) -> Transition {
    if !present {
        return Transition::None;
    }

    match kind {
        AccessKind::Read => Transition::None,

        AccessKind::Write => {
            record.generation += 1;
            record.state = WxState::Written;
            Transition::ArmExecute
        }

        AccessKind::Execute => match record.state {
            WxState::Written => {
                record.state = WxState::PendingExec;
                Transition::EmitDumpJob
            }
            WxState::Clean | WxState::PendingExec | WxState::Dumped => Transition::None,
        },
    }
}

/// Marks `record` DUMPED once its triggering Dump Job has been persisted.
///
/// Does nothing if the record has moved on (e.g. a new write already
/// restarted the cycle) since the job was enqueued.
pub fn mark_dumped(record: &mut PageRecord) {
    if record.state == WxState::PendingExec {
        record.state = WxState::Dumped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Category;
    use vmi_core::Pa;

    fn record() -> PageRecord {
        PageRecord {
            gpa: Pa(0x1000),
            category: Category::Code,
            state: WxState::Clean,
            generation: 0,
        }
    }

    #[test]
    fn clean_to_written_arms_execute() {
        let mut r = record();
        assert_eq!(observe(&mut r, AccessKind::Write, true), Transition::ArmExecute);
        assert_eq!(r.state, WxState::Written);
        assert_eq!(r.generation, 1);
    }

    #[test]
    fn written_to_pending_exec_emits_dump_job() {
        let mut r = record();
        observe(&mut r, AccessKind::Write, true);
        assert_eq!(observe(&mut r, AccessKind::Execute, true), Transition::EmitDumpJob);
        assert_eq!(r.state, WxState::PendingExec);
    }

    #[test]
    fn clean_execute_is_not_a_trigger() {
        let mut r = record();
        assert_eq!(observe(&mut r, AccessKind::Execute, true), Transition::None);
        assert_eq!(r.state, WxState::Clean);
    }

    #[test]
    fn read_never_changes_state() {
        let mut r = record();
        observe(&mut r, AccessKind::Write, true);
        let before = r.state;
        assert_eq!(observe(&mut r, AccessKind::Read, true), Transition::None);
        assert_eq!(r.state, before);
    }

    #[test]
    fn dumped_write_restarts_the_cycle() {
        let mut r = record();
        observe(&mut r, AccessKind::Write, true);
        observe(&mut r, AccessKind::Execute, true);
        mark_dumped(&mut r);
        assert_eq!(r.state, WxState::Dumped);

        assert_eq!(observe(&mut r, AccessKind::Write, true), Transition::ArmExecute);
        assert_eq!(r.state, WxState::Written);
        assert_eq!(r.generation, 2);
    }

    #[test]
    fn demand_paging_fault_is_not_a_write() {
        let mut r = record();
        assert_eq!(observe(&mut r, AccessKind::Write, false), Transition::None);
        assert_eq!(r.state, WxState::Clean);
        assert_eq!(r.generation, 0);
    }

    #[test]
    fn write_while_pending_exec_restarts_cycle_with_bumped_generation() {
        let mut r = record();
        observe(&mut r, AccessKind::Write, true);
        observe(&mut r, AccessKind::Execute, true);
        assert_eq!(r.state, WxState::PendingExec);

        assert_eq!(observe(&mut r, AccessKind::Write, true), Transition::ArmExecute);
        assert_eq!(r.state, WxState::Written);
        assert_eq!(r.generation, 2);
    }
}
