//! Policy evaluation over a manifest's scope tree.
//!
//! Paths are normalized lexically only: duplicate separators collapse,
//! `.` disappears, `..` pops the previous component. The file system is
//! never consulted. Matching is case-insensitive; the walk carries the
//! innermost non-empty cone policy and lets the deepest matched scope's
//! explicit mask override it.

use super::{PolicyMask, PolicyResult};
use crate::fam::FileAccessManifest;
use crate::types::{Operation, ReasonCode};

/// Splits `path` into normalized components. `..` above the root is
/// dropped, matching how the kernel resolves an absolute path.
pub fn normalize_components(path: &[u8]) -> Vec<&[u8]> {
    let mut components: Vec<&[u8]> = Vec::new();
    for component in path.split(|&b| b == b'/') {
        match component {
            b"" | b"." => {}
            b".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    components
}

/// Computes the effective policy for one operation on one absolute path.
pub fn evaluate(fam: &FileAccessManifest, path: &[u8], op: Operation) -> PolicyResult {
    let components = normalize_components(path);

    let root = fam.root_scope();
    let mut cone = root.cone();
    let mut explicit = root.policy();
    let mut matched_depth = 0usize;

    let mut scope = root;
    for (depth, component) in components.iter().enumerate() {
        let Some(child) = scope.find_child(component) else {
            break;
        };
        if !child.cone().is_empty() {
            cone = child.cone();
        }
        explicit = child.policy();
        matched_depth = depth + 1;
        scope = child;
    }

    // The deepest matched scope's explicit mask overrides its cone; an
    // empty explicit mask falls back to the innermost cone.
    let effective = if explicit.is_empty() { cone } else { explicit };

    let required = PolicyMask::required_for(op);
    let denied = effective.contains(PolicyMask::DENY) || !effective.contains(required);
    let reason = if effective.contains(PolicyMask::DENY) {
        ReasonCode::ExplicitDeny
    } else if denied {
        ReasonCode::NotAllowed
    } else if matched_depth == 0 {
        ReasonCode::RootDefault
    } else {
        ReasonCode::AllowedByScope
    };

    PolicyResult {
        allowed: !denied,
        report: effective.contains(PolicyMask::REPORT_ACCESS),
        expected: effective.contains(PolicyMask::REPORT_EXPLICIT_EXPECTED),
        reason,
    }
}
