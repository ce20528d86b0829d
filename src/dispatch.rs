//! Event dispatcher: the hook entry points the kernel calls on every
//! file-system and process-lifecycle event.
//!
//! Every hook starts by resolving the calling PID to its pip; an
//! untracked PID is allowed through without reporting. Reportable events
//! are deduplicated through the pip's path cache before a report is
//! synthesized and enqueued. Hooks never unwind: internal failures allow
//! the access and emit a diagnostic report instead.
//!
//! For a single thread, reports for distinct hook events appear in the
//! client's queue in causal order; across threads only `enqueue_ns`
//! ordering is guaranteed.

use crate::observability::audit::{log_event, SandboxEvent, SandboxEventKind};
use crate::pip::SandboxedPip;
use crate::policy::{evaluate, PolicyResult};
use crate::queue::ReportMultiplexer;
use crate::tracker::ProcessTracker;
use crate::types::{AccessReport, AccessStatus, ControlStatus, Operation, ReasonCode};
use libc::pid_t;
use log::{debug, warn};
use std::sync::Arc;

/// Verdict returned to the kernel caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessVerdict {
    Allow,
    Deny,
}

impl AccessVerdict {
    pub fn is_allowed(self) -> bool {
        self == AccessVerdict::Allow
    }
}

pub struct EventDispatcher {
    tracker: Arc<ProcessTracker>,
    mux: Arc<ReportMultiplexer>,
}

impl EventDispatcher {
    pub fn new(tracker: Arc<ProcessTracker>, mux: Arc<ReportMultiplexer>) -> EventDispatcher {
        EventDispatcher { tracker, mux }
    }

    // ---- file-system hooks ---------------------------------------------

    /// Lookup-phase hook. Remembers the path in the calling thread's slot
    /// so follow-up hooks without a path can attribute their access, then
    /// checks probe policy.
    pub fn lookup(&self, pid: pid_t, path: &[u8]) -> AccessVerdict {
        let Some(pip) = self.tracker.find(pid) else {
            return AccessVerdict::Allow;
        };
        pip.set_last_lookup(path);
        self.check_and_report(&pip, pid, Operation::Probe, path)
    }

    /// General vnode-scope access check for probe/read/write/enumerate.
    pub fn vnode_check(&self, pid: pid_t, path: &[u8], op: Operation) -> AccessVerdict {
        let Some(pip) = self.tracker.find(pid) else {
            return AccessVerdict::Allow;
        };
        self.check_and_report(&pip, pid, op, path)
    }

    /// Exec check. The OS does not redeliver the path here; it falls back
    /// to the calling thread's last looked-up path.
    pub fn exec(&self, pid: pid_t, path: Option<&[u8]>) -> AccessVerdict {
        self.check_with_last_lookup(pid, Operation::Exec, path)
    }

    /// Create check, with the same last-lookup fallback as exec.
    pub fn create(&self, pid: pid_t, path: Option<&[u8]>) -> AccessVerdict {
        self.check_with_last_lookup(pid, Operation::Create, path)
    }

    pub fn readlink(&self, pid: pid_t, path: &[u8]) -> AccessVerdict {
        self.vnode_check(pid, path, Operation::Readlink)
    }

    fn check_with_last_lookup(
        &self,
        pid: pid_t,
        op: Operation,
        path: Option<&[u8]>,
    ) -> AccessVerdict {
        let Some(pip) = self.tracker.find(pid) else {
            return AccessVerdict::Allow;
        };
        match path {
            Some(path) => self.check_and_report(&pip, pid, op, path),
            None => match pip.last_lookup() {
                Some(path) => self.check_and_report(&pip, pid, op, &path),
                None => {
                    // No path to attribute; allow and note the gap.
                    debug!("{} hook for pid {} without a resolved path", op.name(), pid);
                    self.emit_diagnostic(&pip, pid, op);
                    AccessVerdict::Allow
                }
            },
        }
    }

    // ---- process-lifecycle hooks ---------------------------------------

    /// Fork hook: the child joins the parent's tree when monitored; the
    /// fork is reported when the manifest asks for full reporting.
    pub fn fork(&self, parent_pid: pid_t, child_pid: pid_t) {
        let tracked = self.tracker.fork_child(parent_pid, child_pid);
        if !tracked {
            return;
        }
        let Some(pip) = self.tracker.find(child_pid) else {
            return;
        };
        if pip.fam_flags().report_all() {
            self.emit_lifecycle(&pip, child_pid, Operation::Fork);
        }
    }

    /// Exec transition: membership is preserved, the label updated.
    pub fn exec_update(&self, pid: pid_t) {
        self.tracker.exec_update(pid);
    }

    /// Exit hook: untracks the PID; the tracker emits tree completion
    /// when the last descendant leaves.
    pub fn exit(&self, pid: pid_t) {
        if let Some(pip) = self.tracker.find(pid) {
            if pip.fam_flags().report_all() && !pip.is_terminated() {
                self.emit_lifecycle(&pip, pid, Operation::Exit);
            }
        }
        self.tracker.proc_exit(pid);
    }

    // ---- the common check path ------------------------------------------

    /// Policy evaluation, dedup, report synthesis, verdict.
    fn check_and_report(
        &self,
        pip: &Arc<SandboxedPip>,
        pid: pid_t,
        op: Operation,
        path: &[u8],
    ) -> AccessVerdict {
        // A terminated pip no longer reports; nothing may follow its
        // tree-completed record.
        if pip.is_terminated() {
            return AccessVerdict::Allow;
        }

        let policy = evaluate(pip.fam(), path, op);
        let denied = !policy.allowed;
        let should_report = policy.report || denied || pip.fam_flags().report_all();

        if should_report && !self.is_duplicate(pip, op, path) {
            self.emit_access(pip, pid, op, path, &policy);
        }

        // Denials are enforced only when the manifest says unexpected
        // accesses fail; otherwise they are observed and reported.
        if denied && pip.fam_flags().fail_unexpected() {
            AccessVerdict::Deny
        } else {
            AccessVerdict::Allow
        }
    }

    /// Consults the pip's path cache. Non-cacheable paths (non-ASCII)
    /// report every time.
    fn is_duplicate(&self, pip: &Arc<SandboxedPip>, op: Operation, path: &[u8]) -> bool {
        match pip.cache_lookup(path) {
            Some(record) => {
                let hit = record.check_and_update(op.requested_access());
                if hit {
                    pip.counters().cache_hits.inc();
                } else {
                    pip.counters().cache_misses.inc();
                }
                hit
            }
            None => {
                pip.counters().cache_misses.inc();
                false
            }
        }
    }

    fn emit_access(
        &self,
        pip: &Arc<SandboxedPip>,
        pid: pid_t,
        op: Operation,
        path: &[u8],
        policy: &PolicyResult,
    ) {
        let status = if policy.allowed {
            AccessStatus::Allowed
        } else {
            AccessStatus::Denied
        };
        let report = AccessReport::new(
            op,
            op.requested_access(),
            status,
            policy.reason,
            pip.pip_id(),
            pip.client_pid(),
            pip.root_pid(),
            pid,
            path,
        );
        self.send(pip, report);
    }

    fn emit_lifecycle(&self, pip: &Arc<SandboxedPip>, pid: pid_t, op: Operation) {
        let report = AccessReport::new(
            op,
            crate::types::RequestedAccess::NONE,
            AccessStatus::Allowed,
            ReasonCode::AllowedByScope,
            pip.pip_id(),
            pip.client_pid(),
            pip.root_pid(),
            pid,
            pip.root_path(),
        );
        self.send(pip, report);
    }

    /// Diagnostic report for an internal failure; the access itself was
    /// allowed.
    fn emit_diagnostic(&self, pip: &Arc<SandboxedPip>, pid: pid_t, op: Operation) {
        let report = AccessReport::new(
            Operation::Diagnostic,
            op.requested_access(),
            AccessStatus::Allowed,
            ReasonCode::InternalFailure,
            pip.pip_id(),
            pip.client_pid(),
            pip.root_pid(),
            pid,
            b"",
        );
        self.send(pip, report);
    }

    /// Enqueues one report, honoring the overflow policy: with
    /// `fail_on_queue_overflow` a lost reportable event is fatal for the
    /// pip; otherwise it is dropped and counted.
    fn send(&self, pip: &Arc<SandboxedPip>, report: AccessReport) {
        if self.mux.enqueue(pip.client_pid(), report, true) {
            pip.counters().reports_sent.inc();
            return;
        }
        pip.counters().reports_dropped.inc();
        if pip.fam_flags().fail_on_queue_overflow() {
            warn!(
                "report queue overflow is fatal for pip {}; marking tree for termination",
                pip.pip_id()
            );
            log_event(
                SandboxEvent::new(
                    SandboxEventKind::QueueOverflow,
                    "report lost with fail_on_queue_overflow set".to_string(),
                )
                .with_client_pid(pip.client_pid())
                .with_pip_id(pip.pip_id()),
            );
            self.mux
                .notify_failure(pip.client_pid(), ControlStatus::ResourceExhausted);
            self.tracker
                .terminate_client_pips(pip.client_pid(), ReasonCode::QueueOverflow);
        }
    }
}
