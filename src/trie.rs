//! Lock-free, fixed-fan-out trie keyed by unsigned integers or ASCII paths.
//!
//! Two key kinds are supported: unsigned integers (fan-out 10, one decimal
//! digit per level) and case-insensitive ASCII paths (fan-out 65, covering
//! bytes 32..=122 after uppercasing). Values are `Arc<T>`; once a value is
//! added the trie holds one strong reference, released again on removal.
//!
//! All operations are non-blocking. Child pointers are installed with
//! compare-and-swap and never replaced afterwards; the loser of an
//! installation race frees its candidate node. Value slots are swapped
//! with compare-and-swap; removed values are retired to a lock-free stack
//! and reclaimed once no reader is pinned (quiescent-state reclamation),
//! so readers never observe freed memory.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Fan-out of a path node: all ASCII bytes between 32 (' ') and 122 ('z')
/// get a unique child slot after uppercasing, via `toupper(c) - 32`.
const PATH_FANOUT: usize = 65;

/// Fan-out of a uint node: one decimal digit per level.
const UINT_FANOUT: usize = 10;

/// Outcome of a trie mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrieResult {
    Inserted,
    Replaced,
    Removed,
    AlreadyExists,
    AlreadyEmpty,
    /// A concurrent writer won; the caller decides whether to retry or
    /// accept the existing outcome.
    Race,
    /// The key is invalid for this trie (wrong kind, or a path byte
    /// outside the supported ASCII range). Nothing was mutated.
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrieKind {
    Uint,
    Path,
}

/// Key handed back by [`Trie::for_each`]: the uppercased path for path
/// tries, the numeric key for uint tries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrieKey {
    Uint(u64),
    Path(String),
}

struct Node<T> {
    /// Raw pointer obtained from `Arc::into_raw`, or null.
    value: AtomicPtr<T>,
    children: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> Node<T> {
    fn new(fanout: usize) -> Node<T> {
        let mut children = Vec::with_capacity(fanout);
        children.resize_with(fanout, || AtomicPtr::new(ptr::null_mut()));
        Node {
            value: AtomicPtr::new(ptr::null_mut()),
            children: children.into_boxed_slice(),
        }
    }
}

/// Retired value pointer awaiting reclamation.
struct Retired<T> {
    value: *const T,
    next: *mut Retired<T>,
}

pub struct Trie<T> {
    root: Box<Node<T>>,
    kind: TrieKind,
    count: AtomicUsize,
    /// Number of readers currently inside a value-slot read. Retired
    /// values are only reclaimed while this is zero.
    readers: AtomicUsize,
    retired: AtomicPtr<Retired<T>>,
    on_change: OnceLock<Box<dyn Fn(usize, usize) + Send + Sync>>,
}

unsafe impl<T: Send + Sync> Send for Trie<T> {}
unsafe impl<T: Send + Sync> Sync for Trie<T> {}

/// Maps a path byte to its child index, uppercasing letters first.
/// Returns `None` for bytes outside the supported range.
fn path_index(byte: u8) -> Option<usize> {
    if !(32..=122).contains(&byte) {
        return None;
    }
    Some((byte.to_ascii_uppercase() - 32) as usize)
}

struct ReadGuard<'a> {
    readers: &'a AtomicUsize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Trie<T> {
    pub fn new_uint() -> Trie<T> {
        Trie::new(TrieKind::Uint)
    }

    pub fn new_path() -> Trie<T> {
        Trie::new(TrieKind::Path)
    }

    fn new(kind: TrieKind) -> Trie<T> {
        let fanout = match kind {
            TrieKind::Uint => UINT_FANOUT,
            TrieKind::Path => PATH_FANOUT,
        };
        Trie {
            root: Box::new(Node::new(fanout)),
            kind,
            count: AtomicUsize::new(0),
            readers: AtomicUsize::new(0),
            retired: AtomicPtr::new(ptr::null_mut()),
            on_change: OnceLock::new(),
        }
    }

    fn fanout(&self) -> usize {
        match self.kind {
            TrieKind::Uint => UINT_FANOUT,
            TrieKind::Path => PATH_FANOUT,
        }
    }

    /// Number of values stored (not the number of nodes).
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Registers a callback invoked with (old, new) whenever the count
    /// changes. May only be set once; returns false if already set.
    pub fn on_change(&self, callback: Box<dyn Fn(usize, usize) + Send + Sync>) -> bool {
        self.on_change.set(callback).is_ok()
    }

    fn bump_count(&self, delta: isize) {
        let old = if delta > 0 {
            self.count.fetch_add(delta as usize, Ordering::AcqRel)
        } else {
            self.count.fetch_sub((-delta) as usize, Ordering::AcqRel)
        };
        let new = (old as isize + delta) as usize;
        if let Some(cb) = self.on_change.get() {
            cb(old, new);
        }
    }

    // ---- node location -------------------------------------------------

    /// Walks to the node for `key` without creating anything.
    fn lookup_uint_node(&self, mut key: u64) -> Option<&Node<T>> {
        let mut node: &Node<T> = &self.root;
        loop {
            let idx = (key % 10) as usize;
            let child = node.children[idx].load(Ordering::Acquire);
            if child.is_null() {
                return None;
            }
            node = unsafe { &*child };
            key /= 10;
            if key == 0 {
                return Some(node);
            }
        }
    }

    /// Walks to the node for `key`, creating intermediate nodes as needed.
    fn ensure_uint_node(&self, mut key: u64) -> &Node<T> {
        let mut node: &Node<T> = &self.root;
        loop {
            let idx = (key % 10) as usize;
            node = self.ensure_child(node, idx);
            key /= 10;
            if key == 0 {
                return node;
            }
        }
    }

    fn lookup_path_node(&self, path: &[u8]) -> Option<&Node<T>> {
        let mut node: &Node<T> = &self.root;
        for &byte in path {
            let idx = path_index(byte)?;
            let child = node.children[idx].load(Ordering::Acquire);
            if child.is_null() {
                return None;
            }
            node = unsafe { &*child };
        }
        if path.is_empty() {
            None
        } else {
            Some(node)
        }
    }

    /// Walks to the node for `path`, creating nodes as needed. The path is
    /// validated in full before the first node is created, so an invalid
    /// key never mutates the trie.
    fn ensure_path_node(&self, path: &[u8]) -> Option<&Node<T>> {
        if path.is_empty() || !path.iter().all(|&b| path_index(b).is_some()) {
            return None;
        }
        let mut node: &Node<T> = &self.root;
        for &byte in path {
            let idx = path_index(byte).unwrap_or(0);
            node = self.ensure_child(node, idx);
        }
        Some(node)
    }

    /// Returns the child of `node` at `idx`, installing a fresh node if
    /// none exists. The losing candidate of an installation race is freed
    /// by the loser; an installed child pointer is never replaced.
    fn ensure_child<'a>(&self, node: &'a Node<T>, idx: usize) -> &'a Node<T> {
        let slot = &node.children[idx];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let candidate = Box::into_raw(Box::new(Node::new(self.fanout())));
        match slot.compare_exchange(
            ptr::null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*candidate },
            Err(winner) => {
                unsafe { drop(Box::from_raw(candidate)) };
                unsafe { &*winner }
            }
        }
    }

    // ---- value-slot operations ----------------------------------------

    fn pin(&self) -> ReadGuard<'_> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        ReadGuard {
            readers: &self.readers,
        }
    }

    /// Pushes a no-longer-reachable value pointer onto the retired stack
    /// and attempts reclamation.
    fn retire(&self, value: *const T) {
        let node = Box::into_raw(Box::new(Retired {
            value,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.retired.load(Ordering::Acquire);
            unsafe { (*node).next = head };
            if self
                .retired
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.try_collect();
    }

    /// Frees the retired list if no reader is pinned. A reader that pins
    /// after this check cannot reach retired values (their slots were
    /// swapped out before retirement), so freeing is safe.
    fn try_collect(&self) {
        if self.readers.load(Ordering::SeqCst) != 0 {
            return;
        }
        let mut head = self.retired.swap(ptr::null_mut(), Ordering::AcqRel);
        while !head.is_null() {
            let retired = unsafe { Box::from_raw(head) };
            unsafe { drop(Arc::from_raw(retired.value)) };
            head = retired.next;
        }
    }

    fn node_get(&self, node: Option<&Node<T>>) -> Option<Arc<T>> {
        let node = node?;
        let _pin = self.pin();
        let raw = node.value.load(Ordering::SeqCst);
        if raw.is_null() {
            return None;
        }
        // The pin keeps a concurrently retired pointer alive until after
        // the refcount bump below.
        unsafe {
            Arc::increment_strong_count(raw);
            Some(Arc::from_raw(raw))
        }
    }

    fn node_get_or_add(
        &self,
        node: Option<&Node<T>>,
        factory: impl Fn() -> Arc<T>,
    ) -> (Option<Arc<T>>, TrieResult) {
        let Some(node) = node else {
            return (None, TrieResult::Failure);
        };
        let _pin = self.pin();
        loop {
            let raw = node.value.load(Ordering::SeqCst);
            if !raw.is_null() {
                let value = unsafe {
                    Arc::increment_strong_count(raw);
                    Arc::from_raw(raw)
                };
                return (Some(value), TrieResult::AlreadyExists);
            }
            // The factory may run and its product be discarded if another
            // writer installs a value first.
            let candidate = factory();
            let candidate_raw = Arc::into_raw(candidate.clone()) as *mut T;
            match node.value.compare_exchange(
                ptr::null_mut(),
                candidate_raw,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.bump_count(1);
                    return (Some(candidate), TrieResult::Inserted);
                }
                Err(_) => {
                    unsafe { drop(Arc::from_raw(candidate_raw)) };
                }
            }
        }
    }

    fn node_insert(&self, node: Option<&Node<T>>, value: Arc<T>) -> TrieResult {
        let Some(node) = node else {
            return TrieResult::Failure;
        };
        let raw = Arc::into_raw(value) as *mut T;
        match node.value.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.bump_count(1);
                TrieResult::Inserted
            }
            Err(_) => {
                unsafe { drop(Arc::from_raw(raw)) };
                TrieResult::AlreadyExists
            }
        }
    }

    fn node_replace(&self, node: Option<&Node<T>>, value: Arc<T>) -> TrieResult {
        let Some(node) = node else {
            return TrieResult::Failure;
        };
        let current = node.value.load(Ordering::SeqCst);
        let raw = Arc::into_raw(value) as *mut T;
        match node
            .value
            .compare_exchange(current, raw, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                if current.is_null() {
                    self.bump_count(1);
                    TrieResult::Inserted
                } else {
                    self.retire(current);
                    TrieResult::Replaced
                }
            }
            Err(_) => {
                unsafe { drop(Arc::from_raw(raw)) };
                TrieResult::Race
            }
        }
    }

    fn node_remove(&self, node: Option<&Node<T>>) -> TrieResult {
        let Some(node) = node else {
            return TrieResult::Failure;
        };
        let current = node.value.load(Ordering::SeqCst);
        if current.is_null() {
            return TrieResult::AlreadyEmpty;
        }
        match node.value.compare_exchange(
            current,
            ptr::null_mut(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.retire(current);
                self.bump_count(-1);
                TrieResult::Removed
            }
            Err(_) => TrieResult::Race,
        }
    }

    // ---- uint-keyed API ------------------------------------------------

    pub fn get_uint(&self, key: u64) -> Option<Arc<T>> {
        if self.kind != TrieKind::Uint {
            return None;
        }
        self.node_get(self.lookup_uint_node(key))
    }

    /// Returns the value for `key`, creating one with `factory` if absent.
    /// The factory may be invoked and its product discarded on a race.
    pub fn get_or_add_uint(
        &self,
        key: u64,
        factory: impl Fn() -> Arc<T>,
    ) -> (Option<Arc<T>>, TrieResult) {
        if self.kind != TrieKind::Uint {
            return (None, TrieResult::Failure);
        }
        self.node_get_or_add(Some(self.ensure_uint_node(key)), factory)
    }

    pub fn insert_uint(&self, key: u64, value: Arc<T>) -> TrieResult {
        if self.kind != TrieKind::Uint {
            return TrieResult::Failure;
        }
        self.node_insert(Some(self.ensure_uint_node(key)), value)
    }

    pub fn replace_uint(&self, key: u64, value: Arc<T>) -> TrieResult {
        if self.kind != TrieKind::Uint {
            return TrieResult::Failure;
        }
        self.node_replace(Some(self.ensure_uint_node(key)), value)
    }

    pub fn remove_uint(&self, key: u64) -> TrieResult {
        if self.kind != TrieKind::Uint {
            return TrieResult::Failure;
        }
        self.node_remove(self.lookup_uint_node(key))
    }

    // ---- path-keyed API ------------------------------------------------

    pub fn get_path(&self, path: &[u8]) -> Option<Arc<T>> {
        if self.kind != TrieKind::Path {
            return None;
        }
        self.node_get(self.lookup_path_node(path))
    }

    /// Returns the value for `path`, creating one with `factory` if
    /// absent. Paths are case-insensitive; paths containing bytes outside
    /// the supported ASCII range fail without mutating the trie.
    pub fn get_or_add_path(
        &self,
        path: &[u8],
        factory: impl Fn() -> Arc<T>,
    ) -> (Option<Arc<T>>, TrieResult) {
        if self.kind != TrieKind::Path {
            return (None, TrieResult::Failure);
        }
        self.node_get_or_add(self.ensure_path_node(path), factory)
    }

    pub fn insert_path(&self, path: &[u8], value: Arc<T>) -> TrieResult {
        if self.kind != TrieKind::Path {
            return TrieResult::Failure;
        }
        self.node_insert(self.ensure_path_node(path), value)
    }

    pub fn replace_path(&self, path: &[u8], value: Arc<T>) -> TrieResult {
        if self.kind != TrieKind::Path {
            return TrieResult::Failure;
        }
        self.node_replace(self.ensure_path_node(path), value)
    }

    pub fn remove_path(&self, path: &[u8]) -> TrieResult {
        if self.kind != TrieKind::Path {
            return TrieResult::Failure;
        }
        self.node_remove(self.lookup_path_node(path))
    }

    // ---- traversal -----------------------------------------------------

    /// Invokes `f` for every entry in a best-effort pre-order snapshot.
    /// Safe under concurrent mutation, but may miss concurrent inserts or
    /// observe concurrent removes.
    pub fn for_each(&self, mut f: impl FnMut(TrieKey, Arc<T>)) {
        match self.kind {
            TrieKind::Uint => self.walk_uint(&self.root, 0, 1, &mut f),
            TrieKind::Path => {
                let mut prefix = Vec::new();
                self.walk_path(&self.root, &mut prefix, &mut f);
            }
        }
    }

    fn walk_uint(
        &self,
        node: &Node<T>,
        key: u64,
        magnitude: u64,
        f: &mut impl FnMut(TrieKey, Arc<T>),
    ) {
        if let Some(value) = self.node_get(Some(node)) {
            f(TrieKey::Uint(key), value);
        }
        for (digit, slot) in node.children.iter().enumerate() {
            let child = slot.load(Ordering::Acquire);
            if child.is_null() {
                continue;
            }
            let child_key = key + digit as u64 * magnitude;
            self.walk_uint(
                unsafe { &*child },
                child_key,
                magnitude.saturating_mul(10),
                f,
            );
        }
    }

    fn walk_path(
        &self,
        node: &Node<T>,
        prefix: &mut Vec<u8>,
        f: &mut impl FnMut(TrieKey, Arc<T>),
    ) {
        if let Some(value) = self.node_get(Some(node)) {
            let key = String::from_utf8_lossy(prefix).into_owned();
            f(TrieKey::Path(key), value);
        }
        for (idx, slot) in node.children.iter().enumerate() {
            let child = slot.load(Ordering::Acquire);
            if child.is_null() {
                continue;
            }
            prefix.push(idx as u8 + 32);
            self.walk_path(unsafe { &*child }, prefix, f);
            prefix.pop();
        }
    }

    /// Removes every entry matching `filter`. Entries that lose a value
    /// race are left for the concurrent winner to settle.
    pub fn remove_matching(&self, filter: impl Fn(&T) -> bool) {
        self.walk_remove(&self.root, &filter);
    }

    fn walk_remove(&self, node: &Node<T>, filter: &impl Fn(&T) -> bool) {
        if let Some(value) = self.node_get(Some(node)) {
            if filter(&value) {
                let _ = self.node_remove(Some(node));
            }
        }
        for slot in node.children.iter() {
            let child = slot.load(Ordering::Acquire);
            if !child.is_null() {
                self.walk_remove(unsafe { &*child }, filter);
            }
        }
    }
}

impl<T> Drop for Trie<T> {
    fn drop(&mut self) {
        fn free_subtree<T>(node: &mut Node<T>) {
            let raw = node.value.swap(ptr::null_mut(), Ordering::Relaxed);
            if !raw.is_null() {
                unsafe { drop(Arc::from_raw(raw)) };
            }
            for slot in node.children.iter() {
                let child = slot.swap(ptr::null_mut(), Ordering::Relaxed);
                if !child.is_null() {
                    let mut child = unsafe { Box::from_raw(child) };
                    free_subtree(&mut child);
                }
            }
        }
        free_subtree(&mut self.root);

        let mut head = self.retired.swap(ptr::null_mut(), Ordering::Relaxed);
        while !head.is_null() {
            let retired = unsafe { Box::from_raw(head) };
            unsafe { drop(Arc::from_raw(retired.value)) };
            head = retired.next;
        }
    }
}
