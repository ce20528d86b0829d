//! Binary manifest parser.
//!
//! Walks the caller-owned payload once, validating limits as it goes, and
//! produces the flat scope arena. Scope names are recorded as offsets into
//! the payload so nothing is copied.

use super::{
    FamFlags, ManifestError, ManifestTunables, ScopeNode, MANIFEST_MAGIC, MANIFEST_VERSION,
    MAX_NAME_LEN, MAX_SCOPE_DEPTH, MAX_SCOPE_NODES,
};
use crate::policy::PolicyMask;

pub(crate) struct ParsedParts {
    pub pip_id: u64,
    pub flags: FamFlags,
    pub tunables: ManifestTunables,
    pub root_path_off: u32,
    pub root_path_len: u16,
    pub nodes: Vec<ScopeNode>,
    pub child_index: Vec<u32>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ManifestError> {
        if self.buf.len() - self.pos < len {
            return Err(ManifestError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ManifestError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ManifestError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, ManifestError> {
        let bytes = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }
}

pub(crate) fn parse(payload: &[u8]) -> Result<ParsedParts, ManifestError> {
    let mut reader = Reader::new(payload);

    let magic = reader.u32("magic")?;
    if magic != MANIFEST_MAGIC {
        return Err(ManifestError::BadMagic(magic));
    }
    let version = reader.u16("version")?;
    if version != MANIFEST_VERSION {
        return Err(ManifestError::VersionMismatch {
            expected: MANIFEST_VERSION,
            found: version,
        });
    }
    let flags = FamFlags(reader.u16("flags")?);
    let pip_id = reader.u64("pip id")?;
    let tunables = ManifestTunables {
        queue_size_mib: reader.u32("queue size")?,
        nested_process_termination_timeout_ms: reader.u32("termination timeout")?,
        report_queue_starvation_timeout_ms: reader.u32("starvation timeout")?,
    };

    let root_path_len = reader.u16("root path length")?;
    if root_path_len as usize > MAX_NAME_LEN {
        return Err(ManifestError::OversizeRecord("root path"));
    }
    let root_path_off = reader.pos as u32;
    reader.take(root_path_len as usize, "root path")?;

    let mut nodes = Vec::new();
    let mut child_index = Vec::new();
    parse_scope(&mut reader, &mut nodes, &mut child_index, 0)?;

    if !reader.exhausted() {
        return Err(ManifestError::OversizeRecord("trailing bytes"));
    }

    Ok(ParsedParts {
        pip_id,
        flags,
        tunables,
        root_path_off,
        root_path_len,
        nodes,
        child_index,
    })
}

/// Parses one scope subtree in pre-order, returning its arena index.
fn parse_scope(
    reader: &mut Reader<'_>,
    nodes: &mut Vec<ScopeNode>,
    child_index: &mut Vec<u32>,
    depth: usize,
) -> Result<u32, ManifestError> {
    if depth > MAX_SCOPE_DEPTH {
        return Err(ManifestError::OversizeRecord("scope depth"));
    }
    if nodes.len() >= MAX_SCOPE_NODES {
        return Err(ManifestError::OversizeRecord("scope count"));
    }

    let name_len = reader.u16("scope name length")?;
    if name_len as usize > MAX_NAME_LEN {
        return Err(ManifestError::OversizeRecord("scope name"));
    }
    let name_off = reader.pos as u32;
    reader.take(name_len as usize, "scope name")?;
    let policy = PolicyMask::from_bits(reader.u16("policy mask")?);
    let cone = PolicyMask::from_bits(reader.u16("cone policy")?);
    let child_count = reader.u16("child count")?;

    let idx = nodes.len() as u32;
    nodes.push(ScopeNode {
        name_off,
        name_len,
        policy,
        cone,
        child_start: 0,
        child_count,
    });

    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(parse_scope(reader, nodes, child_index, depth + 1)?);
    }
    nodes[idx as usize].child_start = child_index.len() as u32;
    child_index.extend(children);

    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::super::{FileAccessManifest, ManifestBuilder};
    use super::*;

    fn valid_bytes() -> Vec<u8> {
        ManifestBuilder::new(1)
            .root_process_path(b"/bin/true")
            .root_cone(PolicyMask::ALLOW_ALL)
            .build()
            .unwrap()
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let bytes = valid_bytes();
        for cut in [0, 3, 5, 10, bytes.len() - 1] {
            let err = FileAccessManifest::parse(bytes[..cut].to_vec()).unwrap_err();
            assert!(
                matches!(err, ManifestError::Truncated(_)),
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = valid_bytes();
        bytes[0] ^= 0xff;
        assert!(matches!(
            FileAccessManifest::parse(bytes).unwrap_err(),
            ManifestError::BadMagic(_)
        ));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut bytes = valid_bytes();
        bytes[4] = 0xee;
        bytes[5] = 0xee;
        assert!(matches!(
            FileAccessManifest::parse(bytes).unwrap_err(),
            ManifestError::VersionMismatch { found: 0xeeee, .. }
        ));
    }

    #[test]
    fn test_oversize_name_is_rejected() {
        let mut bytes = valid_bytes();
        // Root path length field sits right after the 28-byte header.
        bytes[28] = 0xff;
        bytes[29] = 0xff;
        assert!(matches!(
            FileAccessManifest::parse(bytes).unwrap_err(),
            ManifestError::OversizeRecord("root path")
        ));
    }

    #[test]
    fn test_trailing_garbage_is_rejected() {
        let mut bytes = valid_bytes();
        bytes.push(0);
        assert!(matches!(
            FileAccessManifest::parse(bytes).unwrap_err(),
            ManifestError::OversizeRecord("trailing bytes")
        ));
    }
}
