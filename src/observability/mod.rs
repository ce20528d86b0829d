//! Counters and audit trail
//!
//! Hot-path statistics and a structured control-plane event log.

pub mod audit;
pub mod counters;

pub use audit::{init_audit_log, log_event, SandboxEvent, SandboxEventKind, Severity};
pub use counters::{set_counters_enabled, CoreCounters, Counter, PipCounters};
