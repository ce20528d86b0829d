/// Core types shared across the sandbox: operations, access reports,
/// control-plane status codes, and the crate-wide error type.
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;

use crate::fam::ManifestError;

/// Maximum path length carried inside an access report. Longer paths are
/// truncated before being put on the wire.
pub const REPORT_PATH_MAX: usize = 1024;

/// Wire size of a serialized [`AccessReport`].
pub const REPORT_WIRE_SIZE: usize = 56 + REPORT_PATH_MAX;

/// One observed file-system or process-lifecycle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Operation {
    Probe = 0,
    Read = 1,
    Write = 2,
    Enumerate = 3,
    Exec = 4,
    Readlink = 5,
    Create = 6,
    Fork = 7,
    Exit = 8,
    ProcessTreeCompleted = 9,
    /// Emitted when the core itself failed (allocation, cache) and the
    /// access was allowed without a policy verdict.
    Diagnostic = 10,
    /// Synthetic kill notice emitted when a client stops draining its
    /// report queues and the tree is marked for termination.
    ReportQueueClosed = 11,
}

impl Operation {
    pub fn from_u32(raw: u32) -> Option<Operation> {
        match raw {
            0 => Some(Operation::Probe),
            1 => Some(Operation::Read),
            2 => Some(Operation::Write),
            3 => Some(Operation::Enumerate),
            4 => Some(Operation::Exec),
            5 => Some(Operation::Readlink),
            6 => Some(Operation::Create),
            7 => Some(Operation::Fork),
            8 => Some(Operation::Exit),
            9 => Some(Operation::ProcessTreeCompleted),
            10 => Some(Operation::Diagnostic),
            11 => Some(Operation::ReportQueueClosed),
            _ => None,
        }
    }

    /// The access bit this operation contributes to a path's dedup record.
    pub fn requested_access(self) -> RequestedAccess {
        match self {
            Operation::Probe => RequestedAccess::PROBE,
            Operation::Read => RequestedAccess::READ,
            Operation::Write => RequestedAccess::WRITE,
            Operation::Enumerate => RequestedAccess::ENUMERATE,
            Operation::Exec => RequestedAccess::EXEC,
            Operation::Readlink => RequestedAccess::READLINK,
            Operation::Create => RequestedAccess::CREATE,
            _ => RequestedAccess::NONE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Probe => "probe",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Enumerate => "enumerate",
            Operation::Exec => "exec",
            Operation::Readlink => "readlink",
            Operation::Create => "create",
            Operation::Fork => "fork",
            Operation::Exit => "exit",
            Operation::ProcessTreeCompleted => "process-tree-completed",
            Operation::Diagnostic => "diagnostic",
            Operation::ReportQueueClosed => "report-queue-closed",
        }
    }
}

/// Bit set of accesses requested on a path. One bit per operation so the
/// per-path dedup cache suppresses repeats of the same (path, operation)
/// pair while still reporting a new kind of access to a known path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedAccess(pub u32);

impl RequestedAccess {
    pub const NONE: RequestedAccess = RequestedAccess(0);
    pub const READ: RequestedAccess = RequestedAccess(1);
    pub const WRITE: RequestedAccess = RequestedAccess(2);
    pub const PROBE: RequestedAccess = RequestedAccess(4);
    pub const ENUMERATE: RequestedAccess = RequestedAccess(8);
    pub const EXEC: RequestedAccess = RequestedAccess(16);
    pub const READLINK: RequestedAccess = RequestedAccess(32);
    pub const CREATE: RequestedAccess = RequestedAccess(64);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RequestedAccess) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Allow/deny disposition of a checked access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AccessStatus {
    Allowed = 0,
    Denied = 1,
}

/// Why an access got its disposition. Carried in the report's reserved
/// word as a diagnostic; user space may ignore it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ReasonCode {
    RootDefault = 0,
    AllowedByScope = 1,
    ExplicitDeny = 2,
    NotAllowed = 3,
    InternalFailure = 4,
    ClientDisconnect = 5,
    QueueStarvation = 6,
    DrainingTimeout = 7,
    QueueOverflow = 8,
    Completed = 9,
}

/// Fixed-size access report record. The field order mirrors the wire
/// layout exactly; `to_bytes`/`from_bytes` produce and consume the packed
/// little-endian form regardless of host endianness.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct AccessReport {
    pub operation: u32,
    pub requested_access: u32,
    pub status: u32,
    pub reason: u32,
    pub pip_id: u64,
    pub client_pid: pid_t,
    pub root_pid: pid_t,
    pub pid: pid_t,
    pub reserved2: i32,
    pub enqueue_ns: u64,
    pub dequeue_ns: u64,
    pub path: [u8; REPORT_PATH_MAX],
}

impl AccessReport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation: Operation,
        requested_access: RequestedAccess,
        status: AccessStatus,
        reason: ReasonCode,
        pip_id: u64,
        client_pid: pid_t,
        root_pid: pid_t,
        pid: pid_t,
        path: &[u8],
    ) -> AccessReport {
        let mut buf = [0u8; REPORT_PATH_MAX];
        let len = path.len().min(REPORT_PATH_MAX - 1);
        buf[..len].copy_from_slice(&path[..len]);
        AccessReport {
            operation: operation as u32,
            requested_access: requested_access.bits(),
            status: status as u32,
            reason: reason as u32,
            pip_id,
            client_pid,
            root_pid,
            pid,
            reserved2: 0,
            enqueue_ns: 0,
            dequeue_ns: 0,
            path: buf,
        }
    }

    /// The NUL-terminated path as a byte slice (without the terminator).
    pub fn path_bytes(&self) -> &[u8] {
        let end = self
            .path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(REPORT_PATH_MAX);
        &self.path[..end]
    }

    pub fn path_lossy(&self) -> String {
        String::from_utf8_lossy(self.path_bytes()).into_owned()
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_u32(self.operation)
    }

    pub fn is_denied(&self) -> bool {
        self.status == AccessStatus::Denied as u32
    }

    pub fn to_bytes(&self) -> [u8; REPORT_WIRE_SIZE] {
        let mut out = [0u8; REPORT_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.operation.to_le_bytes());
        out[4..8].copy_from_slice(&self.requested_access.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..16].copy_from_slice(&self.reason.to_le_bytes());
        out[16..24].copy_from_slice(&self.pip_id.to_le_bytes());
        out[24..28].copy_from_slice(&self.client_pid.to_le_bytes());
        out[28..32].copy_from_slice(&self.root_pid.to_le_bytes());
        out[32..36].copy_from_slice(&self.pid.to_le_bytes());
        out[36..40].copy_from_slice(&self.reserved2.to_le_bytes());
        out[40..48].copy_from_slice(&self.enqueue_ns.to_le_bytes());
        out[48..56].copy_from_slice(&self.dequeue_ns.to_le_bytes());
        out[56..].copy_from_slice(&self.path);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<AccessReport> {
        if buf.len() < REPORT_WIRE_SIZE {
            return None;
        }
        let mut path = [0u8; REPORT_PATH_MAX];
        path.copy_from_slice(&buf[56..REPORT_WIRE_SIZE]);
        Some(AccessReport {
            operation: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            requested_access: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            status: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            reason: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            pip_id: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            client_pid: i32::from_le_bytes(buf[24..28].try_into().ok()?),
            root_pid: i32::from_le_bytes(buf[28..32].try_into().ok()?),
            pid: i32::from_le_bytes(buf[32..36].try_into().ok()?),
            reserved2: i32::from_le_bytes(buf[36..40].try_into().ok()?),
            enqueue_ns: u64::from_le_bytes(buf[40..48].try_into().ok()?),
            dequeue_ns: u64::from_le_bytes(buf[48..56].try_into().ok()?),
            path,
        })
    }
}

impl std::fmt::Debug for AccessReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessReport")
            .field("operation", &self.operation())
            .field("requested_access", &self.requested_access)
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("pip_id", &self.pip_id)
            .field("client_pid", &self.client_pid)
            .field("root_pid", &self.root_pid)
            .field("pid", &self.pid)
            .field("enqueue_ns", &self.enqueue_ns)
            .field("dequeue_ns", &self.dequeue_ns)
            .field("path", &self.path_lossy())
            .finish()
    }
}

/// Control-plane result codes returned to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlStatus {
    Success,
    AlreadyRegistered,
    ParseError,
    ResourceExhausted,
    NotFound,
    InvalidArgument,
}

/// Convert control-plane statuses to RPC exit codes.
impl From<ControlStatus> for i32 {
    fn from(status: ControlStatus) -> i32 {
        match status {
            ControlStatus::Success => 0,
            ControlStatus::AlreadyRegistered => 1,
            ControlStatus::ParseError => 2,
            ControlStatus::ResourceExhausted => 3,
            ControlStatus::NotFound => 4,
            ControlStatus::InvalidArgument => 5,
        }
    }
}

impl ControlStatus {
    pub fn is_success(self) -> bool {
        self == ControlStatus::Success
    }
}

/// Custom error types for pipbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for pipbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Nanoseconds since the process epoch, from a shared monotonic clock.
/// Report timestamps (`enqueue_ns`, `dequeue_ns`) and all internal
/// deadlines use this clock so they are comparable across threads.
pub fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_wire_size_matches_struct() {
        assert_eq!(std::mem::size_of::<AccessReport>(), REPORT_WIRE_SIZE);
    }

    #[test]
    fn test_report_round_trips_through_wire_form() {
        let mut report = AccessReport::new(
            Operation::Read,
            RequestedAccess::READ,
            AccessStatus::Allowed,
            ReasonCode::AllowedByScope,
            42,
            100,
            200,
            201,
            b"/tmp/a.txt",
        );
        report.enqueue_ns = 123_456;
        report.dequeue_ns = 123_999;

        let bytes = report.to_bytes();
        let back = AccessReport::from_bytes(&bytes).unwrap();
        assert_eq!(back.operation(), Some(Operation::Read));
        assert_eq!(back.pip_id, 42);
        assert_eq!(back.client_pid, 100);
        assert_eq!(back.root_pid, 200);
        assert_eq!(back.pid, 201);
        assert_eq!(back.enqueue_ns, 123_456);
        assert_eq!(back.dequeue_ns, 123_999);
        assert_eq!(back.path_bytes(), b"/tmp/a.txt");
    }

    #[test]
    fn test_report_path_truncated_to_capacity() {
        let long = vec![b'x'; 4096];
        let report = AccessReport::new(
            Operation::Write,
            RequestedAccess::WRITE,
            AccessStatus::Denied,
            ReasonCode::ExplicitDeny,
            1,
            2,
            3,
            4,
            &long,
        );
        assert_eq!(report.path_bytes().len(), REPORT_PATH_MAX - 1);
    }

    #[test]
    fn test_status_codes_map_to_rpc_exit_codes() {
        assert_eq!(i32::from(ControlStatus::Success), 0);
        assert_eq!(i32::from(ControlStatus::AlreadyRegistered), 1);
        assert_eq!(i32::from(ControlStatus::ParseError), 2);
        assert_eq!(i32::from(ControlStatus::ResourceExhausted), 3);
        assert_eq!(i32::from(ControlStatus::NotFound), 4);
        assert_eq!(i32::from(ControlStatus::InvalidArgument), 5);
    }

    #[test]
    fn test_monotonic_ns_is_monotone() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
