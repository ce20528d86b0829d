//! Process tracker: the PID -> SandboxedPip index.
//!
//! Every PID participating in a pip maps to that pip's descriptor. Reads
//! (`find`) are lock-free and cheap when the table is empty, since every
//! hook starts with one. Structural changes (track/untrack/sweep) run
//! under a single mutex; inconsistencies are logged, counted, and never
//! fatal.

use crate::observability::audit::{log_event, SandboxEvent, SandboxEventKind};
use crate::observability::counters::CoreCounters;
use crate::pip::{PipState, SandboxedPip};
use crate::queue::ReportMultiplexer;
use crate::trie::{Trie, TrieKey, TrieResult};
use crate::types::{
    monotonic_ns, AccessReport, AccessStatus, Operation, ReasonCode, RequestedAccess,
};
use libc::pid_t;
use log::{debug, warn};
use std::sync::{Arc, Mutex};

pub struct ProcessTracker {
    table: Trie<SandboxedPip>,
    mux: Arc<ReportMultiplexer>,
    counters: Arc<CoreCounters>,
    /// Serializes structural changes; `find` never takes it.
    structural: Mutex<()>,
}

impl ProcessTracker {
    pub fn new(mux: Arc<ReportMultiplexer>, counters: Arc<CoreCounters>) -> ProcessTracker {
        ProcessTracker {
            table: Trie::new_uint(),
            mux,
            counters,
            structural: Mutex::new(()),
        }
    }

    /// Number of currently tracked PIDs.
    pub fn tracked_count(&self) -> usize {
        self.table.count()
    }

    /// Resolves the pip governing `pid`. Lock-free; the hot path of every
    /// hook.
    pub fn find(&self, pid: pid_t) -> Option<Arc<SandboxedPip>> {
        self.table.get_uint(pid as u64)
    }

    /// Registers a pip's root process. An existing mapping for the root
    /// PID (nested builds) is untracked first.
    pub fn track_root(&self, pip: Arc<SandboxedPip>) -> bool {
        let _guard = self.structural.lock();
        let root_pid = pip.root_pid();
        if let Some(previous) = self.table.get_uint(root_pid as u64) {
            debug!(
                "pid {} already tracked by pip {}; untracking for nested build",
                root_pid,
                previous.pip_id()
            );
            self.untrack_locked(root_pid, None);
        }
        match self.table.insert_uint(root_pid as u64, Arc::clone(&pip)) {
            TrieResult::Inserted => {
                pip.mark_running();
                log_event(
                    SandboxEvent::new(
                        SandboxEventKind::PipRegistered,
                        format!("root pid {} registered", root_pid),
                    )
                    .with_client_pid(pip.client_pid())
                    .with_pip_id(pip.pip_id()),
                );
                true
            }
            other => {
                warn!("track_root({}) failed: {:?}", root_pid, other);
                self.counters.tracker_inconsistencies.inc();
                false
            }
        }
    }

    /// Starts tracking a child of an already tracked process. Fails (and
    /// is counted) if the PID is already present; no state changes then.
    pub fn track_child(&self, child_pid: pid_t, root_pip: &Arc<SandboxedPip>) -> bool {
        let _guard = self.structural.lock();
        if self.table.get_uint(child_pid as u64).is_some() {
            warn!("track_child({}) ignored: pid already tracked", child_pid);
            self.counters.tracker_inconsistencies.inc();
            return false;
        }
        match self
            .table
            .insert_uint(child_pid as u64, Arc::clone(root_pip))
        {
            TrieResult::Inserted => {
                root_pip.increment_tree_count();
                root_pip.mark_running();
                true
            }
            other => {
                warn!("track_child({}) failed: {:?}", child_pid, other);
                self.counters.tracker_inconsistencies.inc();
                false
            }
        }
    }

    /// Removes one table entry, retrying a lost CAS race once.
    fn remove_entry(&self, key: u64) -> bool {
        match self.table.remove_uint(key) {
            TrieResult::Removed => true,
            TrieResult::Race => self.table.remove_uint(key) == TrieResult::Removed,
            _ => false,
        }
    }

    /// Stops tracking `pid`. When `expected_pip_id` is given, a mapping
    /// to a different pip is left untouched. Returns whether a mapping
    /// was removed.
    pub fn untrack(&self, pid: pid_t, expected_pip_id: Option<u64>) -> bool {
        let _guard = self.structural.lock();
        self.untrack_locked(pid, expected_pip_id)
    }

    fn untrack_locked(&self, pid: pid_t, expected_pip_id: Option<u64>) -> bool {
        let Some(pip) = self.table.get_uint(pid as u64) else {
            warn!("untrack({}) ignored: pid not tracked", pid);
            self.counters.tracker_inconsistencies.inc();
            return false;
        };
        if let Some(expected) = expected_pip_id {
            if pip.pip_id() != expected {
                warn!(
                    "untrack({}) ignored: expected pip {} but found {}",
                    pid,
                    expected,
                    pip.pip_id()
                );
                self.counters.tracker_inconsistencies.inc();
                return false;
            }
        }
        if !self.remove_entry(pid as u64) {
            self.counters.tracker_inconsistencies.inc();
            return false;
        }
        let previous = pip.decrement_tree_count();
        if previous == 1 {
            self.complete_tree(&pip, ReasonCode::Completed, 0);
        }
        true
    }

    // ---- hook-driven transitions ---------------------------------------

    /// A tracked process forked. The child joins the tree when the pip
    /// monitors children.
    pub fn fork_child(&self, parent_pid: pid_t, child_pid: pid_t) -> bool {
        let Some(pip) = self.find(parent_pid) else {
            return false;
        };
        if !pip.fam_flags().monitor_children() {
            return false;
        }
        self.track_child(child_pid, &pip)
    }

    /// `execve`/`vfork` re-labels a process; pip membership is preserved.
    pub fn exec_update(&self, pid: pid_t) -> bool {
        let Some(pip) = self.find(pid) else {
            return false;
        };
        if pip.fam_flags().log_process_data() {
            debug!("pid {} exec within pip {}", pid, pip.pip_id());
        }
        true
    }

    /// A tracked process exited. The root's exit while descendants remain
    /// moves the pip into Draining with the termination deadline armed.
    pub fn proc_exit(&self, pid: pid_t) -> bool {
        if let Some(pip) = self.find(pid) {
            if pid == pip.root_pid() && pip.tree_size() > 1 {
                let deadline =
                    monotonic_ns() + pip.tunables().nested_termination_timeout().as_nanos() as u64;
                pip.begin_draining(deadline);
            }
        }
        self.untrack(pid, None)
    }

    // ---- sweeps ---------------------------------------------------------

    /// Evicts every pip belonging to `client_pid` (client teardown). Each
    /// affected pip gets a final tree-completed report with the
    /// disconnect reason while its queues still exist.
    pub fn sweep_client(&self, client_pid: pid_t) {
        let _guard = self.structural.lock();
        let mut entries: Vec<(u64, Arc<SandboxedPip>)> = Vec::new();
        self.table.for_each(|key, pip| {
            if let TrieKey::Uint(pid) = key {
                if pip.client_pid() == client_pid {
                    entries.push((pid, pip));
                }
            }
        });
        let mut pips: Vec<(Arc<SandboxedPip>, i32)> = Vec::new();
        for (pid, pip) in entries {
            if self.remove_entry(pid) {
                pip.decrement_tree_count();
                match pips.iter_mut().find(|(p, _)| Arc::ptr_eq(p, &pip)) {
                    Some((_, evicted)) => *evicted += 1,
                    None => pips.push((pip, 1)),
                }
            }
        }
        for (pip, evicted) in pips {
            self.complete_tree(&pip, ReasonCode::ClientDisconnect, evicted);
        }
    }

    /// Terminates every Draining pip whose deadline passed, recording the
    /// number of surviving children in the final report. Driven by the
    /// reaper.
    pub fn reap_expired(&self, now_ns: u64) -> usize {
        let mut expired: Vec<Arc<SandboxedPip>> = Vec::new();
        self.table.for_each(|_, pip| {
            if pip.state() == PipState::Draining
                && pip.draining_deadline_ns() != 0
                && pip.draining_deadline_ns() <= now_ns
                && !expired.iter().any(|p| Arc::ptr_eq(p, &pip))
            {
                expired.push(pip);
            }
        });
        let count = expired.len();
        for pip in expired {
            self.terminate_pip(&pip, ReasonCode::DrainingTimeout);
        }
        count
    }

    /// Force-terminates every pip of `client_pid` (queue starvation).
    pub fn terminate_client_pips(&self, client_pid: pid_t, reason: ReasonCode) -> usize {
        let mut affected: Vec<Arc<SandboxedPip>> = Vec::new();
        self.table.for_each(|_, pip| {
            if pip.client_pid() == client_pid && !affected.iter().any(|p| Arc::ptr_eq(p, &pip)) {
                affected.push(pip);
            }
        });
        let count = affected.len();
        for pip in affected {
            self.terminate_pip(&pip, reason);
        }
        count
    }

    /// Removes all of a pip's tracker entries and emits its completion.
    fn terminate_pip(&self, pip: &Arc<SandboxedPip>, reason: ReasonCode) {
        let _guard = self.structural.lock();
        let mut pids: Vec<u64> = Vec::new();
        self.table.for_each(|key, entry| {
            if let TrieKey::Uint(pid) = key {
                if Arc::ptr_eq(&entry, pip) {
                    pids.push(pid);
                }
            }
        });
        // Entries still present at termination are processes the core
        // leaves for the OS; record them in the final report.
        let surviving = pids.len() as i32;
        for pid in pids {
            if self.remove_entry(pid) {
                pip.decrement_tree_count();
            }
        }
        self.complete_tree(pip, reason, surviving);
    }

    /// Emits the process-tree-completed report exactly once per pip; it
    /// is the last report bearing this pip id.
    fn complete_tree(&self, pip: &Arc<SandboxedPip>, reason: ReasonCode, surviving: i32) {
        if !pip.terminate() {
            return;
        }
        let mut report = AccessReport::new(
            Operation::ProcessTreeCompleted,
            RequestedAccess::NONE,
            AccessStatus::Allowed,
            reason,
            pip.pip_id(),
            pip.client_pid(),
            pip.root_pid(),
            pip.root_pid(),
            pip.root_path(),
        );
        // Surviving-children count for timeout/teardown completions.
        report.reserved2 = surviving;
        if !self.mux.enqueue(pip.client_pid(), report, true) {
            pip.counters().reports_dropped.inc();
            warn!(
                "tree-completed report for pip {} dropped (queues full or gone)",
                pip.pip_id()
            );
        } else {
            pip.counters().reports_sent.inc();
        }
        self.counters.tree_completions.inc();
        log_event(
            SandboxEvent::new(
                SandboxEventKind::PipTreeCompleted,
                format!("tree completed, reason {:?}, surviving {}", reason, surviving),
            )
            .with_client_pid(pip.client_pid())
            .with_pip_id(pip.pip_id()),
        );
    }

    /// The tightest starvation window among a client's tracked pips.
    pub fn min_starvation_window(&self, client_pid: pid_t) -> Option<std::time::Duration> {
        let mut window: Option<std::time::Duration> = None;
        self.table.for_each(|_, pip| {
            if pip.client_pid() == client_pid {
                let timeout = pip.tunables().starvation_timeout();
                window = Some(match window {
                    Some(current) => current.min(timeout),
                    None => timeout,
                });
            }
        });
        window
    }

    /// Introspects every distinct tracked pip.
    pub fn introspect(&self) -> Vec<crate::pip::PipInfo> {
        let mut pips: Vec<Arc<SandboxedPip>> = Vec::new();
        self.table.for_each(|_, pip| {
            if !pips.iter().any(|p| Arc::ptr_eq(p, &pip)) {
                pips.push(pip);
            }
        });
        pips.iter().map(|pip| pip.introspect()).collect()
    }
}
