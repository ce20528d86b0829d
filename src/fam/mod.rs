//! File Access Manifest (FAM): the binary policy blob a client hands to
//! the core when a pip starts.
//!
//! A manifest owns its payload bytes; the parsed form keeps scope names
//! as offsets into that payload (zero-copy) and the scope tree as a flat
//! arena with CSR child indexing. The layout is little-endian:
//!
//! ```text
//! u32  magic ("PAF1")
//! u16  version
//! u16  flags
//! u64  pip_id
//! u32  queue_size_mib
//! u32  nested_process_termination_timeout_ms
//! u32  report_queue_starvation_timeout_ms
//! u16  root_path_len, root_path bytes
//! scope nodes, pre-order, each:
//!   u16 name_len, name bytes, u16 policy_mask, u16 cone_policy, u16 child_count
//! ```

pub mod builder;
pub mod parser;

pub use builder::{ManifestBuilder, ScopeSpec};

use crate::policy::PolicyMask;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const MANIFEST_MAGIC: u32 = 0x3146_4150; // "PAF1"
pub const MANIFEST_VERSION: u16 = 1;

/// Hard limits enforced by the parser and the builder.
pub const MAX_NAME_LEN: usize = 1024;
pub const MAX_SCOPE_DEPTH: usize = 128;
pub const MAX_SCOPE_NODES: usize = 65_536;

pub const DEFAULT_QUEUE_SIZE_MIB: u32 = 16;
pub const MAX_QUEUE_SIZE_MIB: u32 = 1024;
pub const DEFAULT_NESTED_TERMINATION_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_STARVATION_TIMEOUT_MS: u32 = 30_000;

/// Typed manifest parse failures. No state is installed on failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest truncated while reading {0}")]
    Truncated(&'static str),

    #[error("bad manifest magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("manifest version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("oversize manifest record: {0}")]
    OversizeRecord(&'static str),
}

/// Pip-level behavior flags carried in the manifest header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamFlags(pub u16);

impl FamFlags {
    pub const FAIL_UNEXPECTED: FamFlags = FamFlags(1);
    pub const REPORT_ALL: FamFlags = FamFlags(2);
    pub const MONITOR_CHILDREN: FamFlags = FamFlags(4);
    pub const LOG_PROCESS_DATA: FamFlags = FamFlags(8);
    pub const FAIL_ON_QUEUE_OVERFLOW: FamFlags = FamFlags(16);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn union(self, other: FamFlags) -> FamFlags {
        FamFlags(self.0 | other.0)
    }

    fn has(self, other: FamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn fail_unexpected(self) -> bool {
        self.has(FamFlags::FAIL_UNEXPECTED)
    }

    pub fn report_all(self) -> bool {
        self.has(FamFlags::REPORT_ALL)
    }

    pub fn monitor_children(self) -> bool {
        self.has(FamFlags::MONITOR_CHILDREN)
    }

    pub fn log_process_data(self) -> bool {
        self.has(FamFlags::LOG_PROCESS_DATA)
    }

    pub fn fail_on_queue_overflow(self) -> bool {
        self.has(FamFlags::FAIL_ON_QUEUE_OVERFLOW)
    }
}

/// Per-pip tunables carried in the manifest header. A zero value selects
/// the compiled-in default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTunables {
    pub queue_size_mib: u32,
    pub nested_process_termination_timeout_ms: u32,
    pub report_queue_starvation_timeout_ms: u32,
}

impl ManifestTunables {
    pub fn effective_queue_size_mib(&self) -> u32 {
        let mib = if self.queue_size_mib == 0 {
            DEFAULT_QUEUE_SIZE_MIB
        } else {
            self.queue_size_mib
        };
        mib.clamp(1, MAX_QUEUE_SIZE_MIB)
    }

    pub fn nested_termination_timeout(&self) -> Duration {
        let ms = if self.nested_process_termination_timeout_ms == 0 {
            DEFAULT_NESTED_TERMINATION_TIMEOUT_MS
        } else {
            self.nested_process_termination_timeout_ms
        };
        Duration::from_millis(ms as u64)
    }

    pub fn starvation_timeout(&self) -> Duration {
        let ms = if self.report_queue_starvation_timeout_ms == 0 {
            DEFAULT_STARVATION_TIMEOUT_MS
        } else {
            self.report_queue_starvation_timeout_ms
        };
        Duration::from_millis(ms as u64)
    }
}

/// One scope node in the parsed arena. The name is an offset range into
/// the manifest payload; children live in the manifest's CSR child table.
#[derive(Clone, Copy, Debug)]
pub struct ScopeNode {
    pub(crate) name_off: u32,
    pub(crate) name_len: u16,
    pub(crate) policy: PolicyMask,
    pub(crate) cone: PolicyMask,
    pub(crate) child_start: u32,
    pub(crate) child_count: u16,
}

/// A parsed, immutable File Access Manifest owning its payload bytes.
pub struct FileAccessManifest {
    payload: Vec<u8>,
    pip_id: u64,
    flags: FamFlags,
    tunables: ManifestTunables,
    root_path_off: u32,
    root_path_len: u16,
    nodes: Vec<ScopeNode>,
    child_index: Vec<u32>,
}

impl FileAccessManifest {
    /// Parses `payload` and takes ownership of it. Scope names stay
    /// zero-copy references into the payload.
    pub fn parse(payload: Vec<u8>) -> Result<FileAccessManifest, ManifestError> {
        let parts = parser::parse(&payload)?;
        Ok(FileAccessManifest {
            payload,
            pip_id: parts.pip_id,
            flags: parts.flags,
            tunables: parts.tunables,
            root_path_off: parts.root_path_off,
            root_path_len: parts.root_path_len,
            nodes: parts.nodes,
            child_index: parts.child_index,
        })
    }

    pub fn pip_id(&self) -> u64 {
        self.pip_id
    }

    pub fn flags(&self) -> FamFlags {
        self.flags
    }

    pub fn tunables(&self) -> &ManifestTunables {
        &self.tunables
    }

    /// Full path of the pip's root process. Not necessarily UTF-8.
    pub fn root_process_path(&self) -> &[u8] {
        let start = self.root_path_off as usize;
        &self.payload[start..start + self.root_path_len as usize]
    }

    /// The root scope, which applies when no deeper scope matches.
    pub fn root_scope(&self) -> ScopeRef<'_> {
        ScopeRef { fam: self, idx: 0 }
    }

    pub fn scope_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node_name(&self, node: &ScopeNode) -> &[u8] {
        let start = node.name_off as usize;
        &self.payload[start..start + node.name_len as usize]
    }
}

impl PartialEq for FileAccessManifest {
    fn eq(&self, other: &FileAccessManifest) -> bool {
        self.pip_id == other.pip_id
            && self.flags == other.flags
            && self.tunables == other.tunables
            && self.root_process_path() == other.root_process_path()
            && scope_tree_eq(self.root_scope(), other.root_scope())
    }
}

impl Eq for FileAccessManifest {}

impl std::fmt::Debug for FileAccessManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccessManifest")
            .field("pip_id", &self.pip_id)
            .field("flags", &self.flags)
            .field("tunables", &self.tunables)
            .field(
                "root_process_path",
                &String::from_utf8_lossy(self.root_process_path()),
            )
            .field("scopes", &self.nodes.len())
            .finish()
    }
}

fn scope_tree_eq(a: ScopeRef<'_>, b: ScopeRef<'_>) -> bool {
    if a.name() != b.name()
        || a.policy() != b.policy()
        || a.cone() != b.cone()
        || a.child_count() != b.child_count()
    {
        return false;
    }
    a.children().zip(b.children()).all(|(x, y)| scope_tree_eq(x, y))
}

/// Borrowed view of one scope node.
#[derive(Clone, Copy)]
pub struct ScopeRef<'a> {
    fam: &'a FileAccessManifest,
    idx: usize,
}

impl<'a> ScopeRef<'a> {
    fn node(&self) -> &'a ScopeNode {
        &self.fam.nodes[self.idx]
    }

    /// Scope name (one path component). Empty for the root scope.
    pub fn name(&self) -> &'a [u8] {
        self.fam.node_name(self.node())
    }

    pub fn policy(&self) -> PolicyMask {
        self.node().policy
    }

    pub fn cone(&self) -> PolicyMask {
        self.node().cone
    }

    pub fn child_count(&self) -> usize {
        self.node().child_count as usize
    }

    pub fn children(&self) -> impl Iterator<Item = ScopeRef<'a>> + 'a {
        let node = self.node();
        let start = node.child_start as usize;
        let end = start + node.child_count as usize;
        let fam = self.fam;
        fam.child_index[start..end]
            .iter()
            .map(move |&idx| ScopeRef {
                fam,
                idx: idx as usize,
            })
    }

    /// Finds the child whose name equals `component` after case folding
    /// both sides. When several children fold to the same bytes the
    /// lexicographically smallest folded name wins, making the walk
    /// deterministic for hand-crafted payloads.
    pub fn find_child(&self, component: &[u8]) -> Option<ScopeRef<'a>> {
        let mut best: Option<ScopeRef<'a>> = None;
        for child in self.children() {
            let name = child.name();
            if name.len() != component.len() {
                continue;
            }
            if name
                .iter()
                .zip(component)
                .all(|(a, b)| a.to_ascii_uppercase() == b.to_ascii_uppercase())
            {
                best = match best {
                    None => Some(child),
                    Some(current) if folded_lt(name, current.name()) => Some(child),
                    Some(current) => Some(current),
                };
            }
        }
        best
    }
}

fn folded_lt(a: &[u8], b: &[u8]) -> bool {
    let fold = |bytes: &[u8]| bytes.iter().map(|b| b.to_ascii_uppercase()).collect::<Vec<_>>();
    fold(a) < fold(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Vec<u8> {
        ManifestBuilder::new(7)
            .flags(FamFlags::REPORT_ALL.union(FamFlags::MONITOR_CHILDREN))
            .tunables(ManifestTunables {
                queue_size_mib: 4,
                nested_process_termination_timeout_ms: 1000,
                report_queue_starvation_timeout_ms: 2000,
            })
            .root_process_path(b"/usr/bin/cc")
            .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
            .scope(
                "/tmp/obj",
                PolicyMask::DENY.union(PolicyMask::REPORT_ACCESS),
                PolicyMask::EMPTY,
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_round_trips_builder_output() {
        let bytes = sample_manifest();
        let fam = FileAccessManifest::parse(bytes.clone()).unwrap();
        assert_eq!(fam.pip_id(), 7);
        assert!(fam.flags().report_all());
        assert!(fam.flags().monitor_children());
        assert!(!fam.flags().fail_unexpected());
        assert_eq!(fam.root_process_path(), b"/usr/bin/cc");
        assert_eq!(fam.tunables().queue_size_mib, 4);

        // Same bytes parse to an equal manifest.
        let again = FileAccessManifest::parse(bytes).unwrap();
        assert_eq!(fam, again);
    }

    #[test]
    fn test_scope_lookup_is_case_insensitive() {
        let fam = FileAccessManifest::parse(sample_manifest()).unwrap();
        let root = fam.root_scope();
        let tmp = root.find_child(b"TMP").unwrap();
        let obj = tmp.find_child(b"obj").unwrap();
        assert!(obj.policy().contains(PolicyMask::DENY));
    }

    #[test]
    fn test_zero_tunables_select_defaults() {
        let tunables = ManifestTunables::default();
        assert_eq!(tunables.effective_queue_size_mib(), DEFAULT_QUEUE_SIZE_MIB);
        assert_eq!(
            tunables.nested_termination_timeout(),
            Duration::from_millis(DEFAULT_NESTED_TERMINATION_TIMEOUT_MS as u64)
        );
        assert_eq!(
            tunables.starvation_timeout(),
            Duration::from_millis(DEFAULT_STARVATION_TIMEOUT_MS as u64)
        );
    }

    #[test]
    fn test_queue_size_is_clamped() {
        let tunables = ManifestTunables {
            queue_size_mib: 4096,
            ..Default::default()
        };
        assert_eq!(tunables.effective_queue_size_mib(), MAX_QUEUE_SIZE_MIB);
    }
}
