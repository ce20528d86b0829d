//! SandboxedPip: the root-process descriptor.
//!
//! A pip owns its File Access Manifest, a path-keyed dedup cache, the
//! atomic process-tree count, per-thread last-lookup slots, and the
//! lifecycle state machine
//! `Registered -> Running -> Draining -> Terminated`.

use crate::fam::{FamFlags, FileAccessManifest, ManifestTunables};
use crate::observability::counters::{PipCounters, PipCountersSnapshot};
use crate::trie::Trie;
use crate::types::{RequestedAccess, Result};
use libc::pid_t;
use log::debug;
use serde::{Deserialize, Serialize};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of per-thread last-lookup slots. Logical thread ids wrap at
/// this boundary; two live threads sharing a slot stay memory-safe and
/// may at worst mis-attribute a follow-up hook's path.
const LAST_LOOKUP_SLOTS: usize = 1024;

/// Lifecycle state of a pip's process tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PipState {
    Registered = 0,
    Running = 1,
    Draining = 2,
    Terminated = 3,
}

impl PipState {
    fn from_u8(raw: u8) -> PipState {
        match raw {
            0 => PipState::Registered,
            1 => PipState::Running,
            2 => PipState::Draining,
            _ => PipState::Terminated,
        }
    }
}

/// Per-path record of accesses already reported within one pip, so
/// repeated identical accesses on the hot path deduplicate.
#[derive(Debug, Default)]
pub struct CacheRecord {
    reported: AtomicU32,
}

impl CacheRecord {
    pub fn new() -> CacheRecord {
        CacheRecord::default()
    }

    /// Atomically determines whether `access` was already reported and
    /// marks it reported for subsequent calls. Returns true on a hit.
    pub fn check_and_update(&self, access: RequestedAccess) -> bool {
        let previous = self.reported.fetch_or(access.bits(), Ordering::AcqRel);
        previous & access.bits() == access.bits()
    }

    pub fn reported_access(&self) -> RequestedAccess {
        RequestedAccess(self.reported.load(Ordering::Acquire))
    }
}

/// Process-wide logical thread id, assigned on first use.
fn logical_thread_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// Per-thread storage for the most recent lookup-phase path. Each slot is
/// written and read only by its owning thread; the atomic pointer exists
/// so the array is shareable across threads.
struct LastLookup {
    slots: Box<[AtomicPtr<Vec<u8>>]>,
}

impl LastLookup {
    fn new() -> LastLookup {
        let mut slots = Vec::with_capacity(LAST_LOOKUP_SLOTS);
        slots.resize_with(LAST_LOOKUP_SLOTS, || AtomicPtr::new(ptr::null_mut()));
        LastLookup {
            slots: slots.into_boxed_slice(),
        }
    }

    fn set(&self, path: &[u8]) {
        let slot = &self.slots[logical_thread_id() % LAST_LOOKUP_SLOTS];
        let fresh = Box::into_raw(Box::new(path.to_vec()));
        let old = slot.swap(fresh, Ordering::AcqRel);
        if !old.is_null() {
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    fn get(&self) -> Option<Vec<u8>> {
        let slot = &self.slots[logical_thread_id() % LAST_LOOKUP_SLOTS];
        let raw = slot.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            Some(unsafe { (*raw).clone() })
        }
    }

    fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }
}

impl Drop for LastLookup {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                unsafe { drop(Box::from_raw(raw)) };
            }
        }
    }
}

/// Information about one pip, queryable from user space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipInfo {
    pub pip_id: u64,
    pub client_pid: pid_t,
    pub root_pid: pid_t,
    pub tree_size: u32,
    pub state: PipState,
    pub cache_size: usize,
    pub counters: PipCountersSnapshot,
}

/// The root of one tracked process tree.
///
/// Shared between the tracker (one strong reference per tracked PID plus
/// the table entries) and the dispatcher (borrowed for the duration of a
/// single hook call).
pub struct SandboxedPip {
    client_pid: pid_t,
    root_pid: pid_t,
    fam: FileAccessManifest,
    tree_count: AtomicU32,
    state: AtomicU8,
    /// Monotonic deadline armed when the root exits while descendants
    /// remain; zero while unarmed.
    draining_deadline_ns: AtomicU64,
    path_cache: Trie<CacheRecord>,
    last_lookup: LastLookup,
    counters: PipCounters,
}

impl SandboxedPip {
    /// Parses the manifest payload and builds the descriptor. The tree
    /// count starts at one, for the root process itself.
    pub fn new(client_pid: pid_t, root_pid: pid_t, fam_bytes: Vec<u8>) -> Result<SandboxedPip> {
        let fam = FileAccessManifest::parse(fam_bytes)?;
        Ok(SandboxedPip::from_manifest(client_pid, root_pid, fam))
    }

    /// Builds the descriptor around an already parsed manifest.
    pub fn from_manifest(
        client_pid: pid_t,
        root_pid: pid_t,
        fam: FileAccessManifest,
    ) -> SandboxedPip {
        SandboxedPip {
            client_pid,
            root_pid,
            fam,
            tree_count: AtomicU32::new(1),
            state: AtomicU8::new(PipState::Registered as u8),
            draining_deadline_ns: AtomicU64::new(0),
            path_cache: Trie::new_path(),
            last_lookup: LastLookup::new(),
            counters: PipCounters::default(),
        }
    }

    pub fn client_pid(&self) -> pid_t {
        self.client_pid
    }

    pub fn root_pid(&self) -> pid_t {
        self.root_pid
    }

    pub fn pip_id(&self) -> u64 {
        self.fam.pip_id()
    }

    pub fn fam(&self) -> &FileAccessManifest {
        &self.fam
    }

    pub fn fam_flags(&self) -> FamFlags {
        self.fam.flags()
    }

    pub fn tunables(&self) -> &ManifestTunables {
        self.fam.tunables()
    }

    pub fn root_path(&self) -> &[u8] {
        self.fam.root_process_path()
    }

    pub fn counters(&self) -> &PipCounters {
        &self.counters
    }

    // ---- process tree tracking ----------------------------------------

    pub fn tree_size(&self) -> u32 {
        self.tree_count.load(Ordering::Acquire)
    }

    /// Atomically increments the tree count, returning the prior value.
    pub fn increment_tree_count(&self) -> u32 {
        self.tree_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Atomically decrements the tree count, returning the prior value.
    pub fn decrement_tree_count(&self) -> u32 {
        self.tree_count.fetch_sub(1, Ordering::AcqRel)
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn state(&self) -> PipState {
        PipState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            PipState::Registered as u8,
            PipState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Running -> Draining, arming the termination deadline. No-op in any
    /// other state.
    pub fn begin_draining(&self, deadline_ns: u64) {
        if self
            .state
            .compare_exchange(
                PipState::Running as u8,
                PipState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.draining_deadline_ns.store(deadline_ns, Ordering::Release);
        }
    }

    pub fn draining_deadline_ns(&self) -> u64 {
        self.draining_deadline_ns.load(Ordering::Acquire)
    }

    /// Moves to Terminated from any state. Returns true for the caller
    /// that performed the transition, so completion is emitted once.
    pub fn terminate(&self) -> bool {
        self.state.swap(PipState::Terminated as u8, Ordering::AcqRel)
            != PipState::Terminated as u8
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == PipState::Terminated
    }

    // ---- report caching ------------------------------------------------

    /// Looks up the cache record for `path`, creating one if absent.
    /// `None` means the path inherently cannot be cached (non-ASCII);
    /// such accesses are reported every time.
    pub fn cache_lookup(&self, path: &[u8]) -> Option<Arc<CacheRecord>> {
        let (record, _) = self.path_cache.get_or_add_path(path, || Arc::new(CacheRecord::new()));
        record
    }

    pub fn cache_size(&self) -> usize {
        self.path_cache.count()
    }

    // ---- per-thread last lookup ----------------------------------------

    /// Remembers `path` as the last path resolved on the current thread,
    /// for follow-up hooks that do not redeliver it.
    pub fn set_last_lookup(&self, path: &[u8]) {
        self.last_lookup.set(path);
    }

    pub fn last_lookup(&self) -> Option<Vec<u8>> {
        self.last_lookup.get()
    }

    // ---- introspection -------------------------------------------------

    pub fn introspect(&self) -> PipInfo {
        PipInfo {
            pip_id: self.pip_id(),
            client_pid: self.client_pid,
            root_pid: self.root_pid,
            tree_size: self.tree_size(),
            state: self.state(),
            cache_size: self.cache_size(),
            counters: self.counters.snapshot(),
        }
    }
}

impl Drop for SandboxedPip {
    fn drop(&mut self) {
        debug!(
            "pip {} stats: cache hits={} misses={} cache size={} lookup slots={}",
            self.pip_id(),
            self.counters.cache_hits.get(),
            self.counters.cache_misses.get(),
            self.path_cache.count(),
            self.last_lookup.occupied(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fam::ManifestBuilder;
    use crate::policy::PolicyMask;
    use std::thread;

    fn pip() -> SandboxedPip {
        let bytes = ManifestBuilder::new(11)
            .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
            .root_process_path(b"/bin/build")
            .build()
            .unwrap();
        SandboxedPip::new(1000, 2000, bytes).unwrap()
    }

    #[test]
    fn test_new_pip_starts_registered_with_one_process() {
        let pip = pip();
        assert_eq!(pip.state(), PipState::Registered);
        assert_eq!(pip.tree_size(), 1);
        assert_eq!(pip.pip_id(), 11);
        assert_eq!(pip.root_path(), b"/bin/build");
    }

    #[test]
    fn test_cache_record_dedups_per_access_kind() {
        let record = CacheRecord::new();
        assert!(!record.check_and_update(RequestedAccess::READ));
        assert!(record.check_and_update(RequestedAccess::READ));
        // A different access kind on the same path is not a hit.
        assert!(!record.check_and_update(RequestedAccess::WRITE));
        assert!(record.check_and_update(RequestedAccess::WRITE));
    }

    #[test]
    fn test_cache_lookup_returns_same_record_for_folded_paths() {
        let pip = pip();
        let a = pip.cache_lookup(b"/tmp/A.txt").unwrap();
        let b = pip.cache_lookup(b"/TMP/a.TXT").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pip.cache_size(), 1);
    }

    #[test]
    fn test_non_ascii_paths_never_enter_the_cache() {
        let pip = pip();
        assert!(pip.cache_lookup("/tmp/繙.txt".as_bytes()).is_none());
        assert_eq!(pip.cache_size(), 0);
    }

    #[test]
    fn test_last_lookup_is_per_thread() {
        let pip = Arc::new(pip());
        pip.set_last_lookup(b"/main/path");

        let other = Arc::clone(&pip);
        let from_other_thread = thread::spawn(move || {
            // A thread that never stored a path sees nothing.
            let before = other.last_lookup();
            other.set_last_lookup(b"/other/path");
            (before, other.last_lookup())
        })
        .join()
        .unwrap();

        assert_eq!(from_other_thread.0, None);
        assert_eq!(from_other_thread.1, Some(b"/other/path".to_vec()));
        assert_eq!(pip.last_lookup(), Some(b"/main/path".to_vec()));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let pip = pip();
        pip.mark_running();
        assert_eq!(pip.state(), PipState::Running);
        pip.begin_draining(123);
        assert_eq!(pip.state(), PipState::Draining);
        assert_eq!(pip.draining_deadline_ns(), 123);
        assert!(pip.terminate());
        assert!(!pip.terminate());
        assert_eq!(pip.state(), PipState::Terminated);
    }

    #[test]
    fn test_draining_only_from_running() {
        let pip = pip();
        pip.begin_draining(55);
        assert_eq!(pip.state(), PipState::Registered);
        assert_eq!(pip.draining_deadline_ns(), 0);
    }

    #[test]
    fn test_tree_count_is_atomic_under_contention() {
        let pip = Arc::new(pip());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pip = Arc::clone(&pip);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    pip.increment_tree_count();
                    pip.decrement_tree_count();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pip.tree_size(), 1);
    }
}
