/// Audit trail for control-plane events
/// Provides structured logging of sandbox lifecycle events for diagnosis
/// of client/tracker interactions after the fact.
use crate::types::Result;
use libc::pid_t;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Event severity levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// Control-plane events we track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SandboxEventKind {
    ClientAttached,
    ClientDetached,
    PipRegistered,
    PipTreeCompleted,
    ManifestRejected,
    QueueStarvation,
    QueueOverflow,
    TrackerInconsistency,
}

impl SandboxEventKind {
    /// Get the default severity for this event kind
    pub fn default_severity(&self) -> Severity {
        match self {
            SandboxEventKind::QueueStarvation => Severity::High,
            SandboxEventKind::QueueOverflow => Severity::High,
            SandboxEventKind::ManifestRejected => Severity::Medium,
            SandboxEventKind::TrackerInconsistency => Severity::Medium,
            SandboxEventKind::ClientAttached
            | SandboxEventKind::ClientDetached
            | SandboxEventKind::PipRegistered
            | SandboxEventKind::PipTreeCompleted => Severity::Low,
        }
    }
}

/// Individual audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub kind: SandboxEventKind,
    pub severity: Severity,
    pub client_pid: Option<pid_t>,
    pub pip_id: Option<u64>,
    pub session_id: Option<String>,
    pub details: String,
    pub timestamp: SystemTime,
}

impl SandboxEvent {
    pub fn new(kind: SandboxEventKind, details: String) -> Self {
        let severity = kind.default_severity();
        Self {
            kind,
            severity,
            client_pid: None,
            pip_id: None,
            session_id: None,
            details,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_client_pid(mut self, client_pid: pid_t) -> Self {
        self.client_pid = Some(client_pid);
        self
    }

    pub fn with_pip_id(mut self, pip_id: u64) -> Self {
        self.pip_id = Some(pip_id);
        self
    }

    pub fn with_session(mut self, session: Uuid) -> Self {
        self.session_id = Some(session.to_string());
        self
    }
}

/// Audit logger writing JSON lines alongside the standard logger
pub struct AuditLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(|| {
            std::env::temp_dir().join("pipbox").join("sandbox-audit.log")
        });

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn log(&self, event: &SandboxEvent) {
        let entry = serde_json::json!({
            "timestamp": event.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "kind": event.kind,
            "severity": event.severity,
            "client_pid": event.client_pid,
            "pip_id": event.pip_id,
            "session_id": event.session_id,
            "details": event.details,
            "process_id": std::process::id(),
        });

        match event.severity {
            Severity::High => error!("AUDIT: {:?} - {}", event.kind, event.details),
            Severity::Medium => warn!("AUDIT: {:?} - {}", event.kind, event.details),
            Severity::Low => info!("AUDIT: {:?} - {}", event.kind, event.details),
        }

        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{}", entry) {
                error!("Failed to write audit log: {}", e);
            }
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Global audit log instance
static AUDIT_LOG: OnceLock<AuditLog> = OnceLock::new();

/// Initialize the global audit log
pub fn init_audit_log(path: Option<PathBuf>) -> Result<()> {
    match AuditLog::new(path) {
        Ok(log) => {
            if AUDIT_LOG.set(log).is_err() {
                warn!("Audit log already initialized");
            }
            Ok(())
        }
        Err(e) => {
            error!("Failed to initialize audit log: {}", e);
            Err(e)
        }
    }
}

/// Log an event using the global audit log, falling back to the standard
/// logger when no audit log was initialized.
pub fn log_event(event: SandboxEvent) {
    if let Some(log) = AUDIT_LOG.get() {
        log.log(&event);
    } else {
        match event.severity {
            Severity::High => error!("AUDIT: {:?} - {}", event.kind, event.details),
            Severity::Medium => warn!("AUDIT: {:?} - {}", event.kind, event.details),
            Severity::Low => info!("AUDIT: {:?} - {}", event.kind, event.details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder_sets_fields() {
        let session = Uuid::new_v4();
        let event = SandboxEvent::new(
            SandboxEventKind::PipRegistered,
            "pip registered".to_string(),
        )
        .with_client_pid(42)
        .with_pip_id(7)
        .with_session(session);
        assert_eq!(event.client_pid, Some(42));
        assert_eq!(event.pip_id, Some(7));
        assert_eq!(event.session_id, Some(session.to_string()));
    }

    #[test]
    fn test_audit_log_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(Some(path.clone())).unwrap();
        log.log(&SandboxEvent::new(
            SandboxEventKind::ClientAttached,
            "client attached".to_string(),
        ));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("ClientAttached"));
        let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["details"], "client attached");
    }
}
