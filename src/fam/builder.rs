//! Manifest writer.
//!
//! Produces the exact byte layout the parser consumes. Clients compose a
//! scope tree with [`ManifestBuilder::scope`]; intermediate scopes are
//! created with empty masks so only the named directories carry policy.

use super::{
    FamFlags, ManifestError, ManifestTunables, MANIFEST_MAGIC, MANIFEST_VERSION, MAX_NAME_LEN,
    MAX_SCOPE_DEPTH, MAX_SCOPE_NODES,
};
use crate::policy::PolicyMask;
use crate::types::{Result, SandboxError};

/// One scope in a manifest under construction.
#[derive(Clone, Debug, Default)]
pub struct ScopeSpec {
    pub name: Vec<u8>,
    pub policy: PolicyMask,
    pub cone: PolicyMask,
    pub children: Vec<ScopeSpec>,
}

impl ScopeSpec {
    fn named(name: &[u8]) -> ScopeSpec {
        ScopeSpec {
            name: name.to_vec(),
            ..Default::default()
        }
    }
}

/// Composes a File Access Manifest payload.
pub struct ManifestBuilder {
    pip_id: u64,
    flags: FamFlags,
    tunables: ManifestTunables,
    root_process_path: Vec<u8>,
    root: ScopeSpec,
}

impl ManifestBuilder {
    pub fn new(pip_id: u64) -> ManifestBuilder {
        ManifestBuilder {
            pip_id,
            flags: FamFlags::default(),
            tunables: ManifestTunables::default(),
            root_process_path: Vec::new(),
            root: ScopeSpec::default(),
        }
    }

    pub fn flags(mut self, flags: FamFlags) -> ManifestBuilder {
        self.flags = flags;
        self
    }

    pub fn tunables(mut self, tunables: ManifestTunables) -> ManifestBuilder {
        self.tunables = tunables;
        self
    }

    pub fn root_process_path(mut self, path: &[u8]) -> ManifestBuilder {
        self.root_process_path = path.to_vec();
        self
    }

    /// Policy of the root scope, applied when no deeper scope matches.
    pub fn root_policy(mut self, policy: PolicyMask) -> ManifestBuilder {
        self.root.policy = policy;
        self
    }

    /// Cone policy of the root scope, inherited by everything.
    pub fn root_cone(mut self, cone: PolicyMask) -> ManifestBuilder {
        self.root.cone = cone;
        self
    }

    /// Adds (or updates) the scope at `path`, creating intermediate scopes
    /// with empty masks. Components are matched case-insensitively.
    pub fn scope(mut self, path: &str, policy: PolicyMask, cone: PolicyMask) -> ManifestBuilder {
        let components: Vec<&[u8]> = path
            .as_bytes()
            .split(|&b| b == b'/')
            .filter(|c| !c.is_empty())
            .collect();
        let mut node = &mut self.root;
        for component in components {
            let pos = node.children.iter().position(|child| {
                child.name.len() == component.len()
                    && child
                        .name
                        .iter()
                        .zip(component)
                        .all(|(a, b)| a.to_ascii_uppercase() == b.to_ascii_uppercase())
            });
            let idx = match pos {
                Some(idx) => idx,
                None => {
                    node.children.push(ScopeSpec::named(component));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
        }
        node.policy = policy;
        node.cone = cone;
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let mut count = 0usize;
        validate_scope(&self.root, 0, &mut count)?;
        if self.root_process_path.len() > MAX_NAME_LEN {
            return Err(SandboxError::Manifest(ManifestError::OversizeRecord(
                "root path",
            )));
        }

        let mut out = Vec::new();
        out.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
        out.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.pip_id.to_le_bytes());
        out.extend_from_slice(&self.tunables.queue_size_mib.to_le_bytes());
        out.extend_from_slice(
            &self
                .tunables
                .nested_process_termination_timeout_ms
                .to_le_bytes(),
        );
        out.extend_from_slice(
            &self
                .tunables
                .report_queue_starvation_timeout_ms
                .to_le_bytes(),
        );
        out.extend_from_slice(&(self.root_process_path.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.root_process_path);
        write_scope(&self.root, &mut out);
        Ok(out)
    }
}

fn validate_scope(scope: &ScopeSpec, depth: usize, count: &mut usize) -> Result<()> {
    if depth > MAX_SCOPE_DEPTH {
        return Err(SandboxError::Manifest(ManifestError::OversizeRecord(
            "scope depth",
        )));
    }
    if scope.name.len() > MAX_NAME_LEN {
        return Err(SandboxError::Manifest(ManifestError::OversizeRecord(
            "scope name",
        )));
    }
    *count += 1;
    if *count > MAX_SCOPE_NODES {
        return Err(SandboxError::Manifest(ManifestError::OversizeRecord(
            "scope count",
        )));
    }
    if scope.children.len() > u16::MAX as usize {
        return Err(SandboxError::Manifest(ManifestError::OversizeRecord(
            "child count",
        )));
    }

    // Sibling names must stay unique after case-folding so scope matching
    // has a single winner.
    let mut folded: Vec<Vec<u8>> = scope
        .children
        .iter()
        .map(|c| c.name.iter().map(|b| b.to_ascii_uppercase()).collect())
        .collect();
    folded.sort();
    if folded.windows(2).any(|pair| pair[0] == pair[1]) {
        return Err(SandboxError::InvalidArgument(
            "duplicate scope name after case folding".to_string(),
        ));
    }

    for child in &scope.children {
        validate_scope(child, depth + 1, count)?;
    }
    Ok(())
}

fn write_scope(scope: &ScopeSpec, out: &mut Vec<u8>) {
    out.extend_from_slice(&(scope.name.len() as u16).to_le_bytes());
    out.extend_from_slice(&scope.name);
    out.extend_from_slice(&scope.policy.bits().to_le_bytes());
    out.extend_from_slice(&scope.cone.bits().to_le_bytes());
    out.extend_from_slice(&(scope.children.len() as u16).to_le_bytes());
    for child in &scope.children {
        write_scope(child, out);
    }
}
