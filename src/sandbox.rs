//! The sandbox core: client lifecycle, control plane, and the reaper.
//!
//! One [`Sandbox`] instance owns the tracker, the report multiplexer,
//! and the dispatcher, and runs a background reaper thread that drives
//! the two timers the hot path cannot: nested-process termination during
//! Draining, and report-queue starvation detection.

use crate::dispatch::EventDispatcher;
use crate::fam::{FileAccessManifest, MAX_QUEUE_SIZE_MIB};
use crate::observability::audit::{log_event, SandboxEvent, SandboxEventKind};
use crate::observability::counters::{CoreCounters, CoreCountersSnapshot};
use crate::pip::{PipInfo, SandboxedPip};
use crate::queue::{queue_capacity_for_mib, QueueConsumer, ReportMultiplexer};
use crate::tracker::ProcessTracker;
use crate::types::{
    monotonic_ns, AccessReport, AccessStatus, ControlStatus, Operation, ReasonCode,
    RequestedAccess,
};
use crossbeam_channel::{bounded, Sender};
use libc::pid_t;
use log::{debug, info, warn};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Core-wide configuration. Per-pip tunables travel inside each FAM.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Default report queue size; `set_report_queue_size` overrides it.
    pub queue_size_mib: u32,
    /// Reaper tick interval.
    pub reaper_interval: Duration,
    /// Probe client liveness with signal 0 and sweep dead clients.
    pub detect_dead_clients: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            queue_size_mib: crate::fam::DEFAULT_QUEUE_SIZE_MIB,
            reaper_interval: Duration::from_millis(100),
            detect_dead_clients: false,
        }
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    queue_size_mib: AtomicU32,
    counters: Arc<CoreCounters>,
    mux: Arc<ReportMultiplexer>,
    tracker: Arc<ProcessTracker>,
    dispatcher: EventDispatcher,
    reaper: Mutex<Option<JoinHandle<()>>>,
    reaper_shutdown: Mutex<Option<Sender<()>>>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Sandbox {
        let counters = Arc::new(CoreCounters::default());
        let mux = Arc::new(ReportMultiplexer::new(Arc::clone(&counters)));
        let tracker = Arc::new(ProcessTracker::new(
            Arc::clone(&mux),
            Arc::clone(&counters),
        ));
        let dispatcher = EventDispatcher::new(Arc::clone(&tracker), Arc::clone(&mux));

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let reaper = {
            let mux = Arc::clone(&mux);
            let tracker = Arc::clone(&tracker);
            let config = config.clone();
            std::thread::Builder::new()
                .name("pipbox-reaper".to_string())
                .spawn(move || loop {
                    match shutdown_rx.recv_timeout(config.reaper_interval) {
                        Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    }
                    reaper_tick(&tracker, &mux, &config);
                })
                .ok()
        };

        Sandbox {
            queue_size_mib: AtomicU32::new(config.queue_size_mib),
            config,
            counters,
            mux,
            tracker,
            dispatcher,
            reaper: Mutex::new(reaper),
            reaper_shutdown: Mutex::new(Some(shutdown_tx)),
        }
    }

    /// Hook entry points for the kernel-facing side.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    pub fn counters(&self) -> CoreCountersSnapshot {
        self.counters.snapshot()
    }

    // ---- control plane (client -> core) --------------------------------

    /// Sets the size of subsequently allocated report queues, clamped to
    /// `[1, 1024]` MiB. Zero selects the default.
    pub fn set_report_queue_size(&self, mib: u32) -> ControlStatus {
        let effective = if mib == 0 {
            self.config.queue_size_mib
        } else {
            mib.clamp(1, MAX_QUEUE_SIZE_MIB)
        };
        self.queue_size_mib.store(effective, Ordering::Release);
        ControlStatus::Success
    }

    pub fn report_queue_size_mib(&self) -> u32 {
        self.queue_size_mib.load(Ordering::Acquire)
    }

    /// Allocates one report queue for the client, attaching the client on
    /// first call.
    pub fn allocate_report_queue(&self, client_pid: pid_t) -> ControlStatus {
        let attached = self.mux.has_client(client_pid);
        let capacity = queue_capacity_for_mib(self.report_queue_size_mib());
        let status = self.mux.allocate_queue(client_pid, capacity);
        if status.is_success() && !attached {
            self.counters.clients_attached.inc();
            if let Some(session) = self.mux.client_session(client_pid) {
                log_event(
                    SandboxEvent::new(
                        SandboxEventKind::ClientAttached,
                        format!("client {} attached", client_pid),
                    )
                    .with_client_pid(client_pid)
                    .with_session(session),
                );
            }
        }
        status
    }

    /// FIFO-paired with `get_report_queue_memory_descriptor`.
    pub fn set_report_queue_notification_port(
        &self,
        client_pid: pid_t,
        port: Sender<()>,
    ) -> ControlStatus {
        self.mux.set_notification_port(client_pid, port)
    }

    /// Hands out the consumer handle for the next allocated queue.
    pub fn get_report_queue_memory_descriptor(&self, client_pid: pid_t) -> Option<QueueConsumer> {
        self.mux.memory_descriptor_for_next(client_pid)
    }

    /// Registers a client callback invoked once if reports become
    /// undeliverable.
    pub fn set_failure_notification_handler(
        &self,
        client_pid: pid_t,
        handler: Sender<ControlStatus>,
    ) -> ControlStatus {
        self.mux.set_failure_handler(client_pid, handler)
    }

    /// Removes the client's queues and evicts its pips. Idempotent; the
    /// tracker sweep runs first so final reports can still be delivered.
    pub fn free_report_queues(&self, client_pid: pid_t) -> ControlStatus {
        self.tracker.sweep_client(client_pid);
        if self.mux.free_queues(client_pid) {
            self.counters.clients_detached.inc();
            log_event(
                SandboxEvent::new(
                    SandboxEventKind::ClientDetached,
                    format!("client {} detached", client_pid),
                )
                .with_client_pid(client_pid),
            );
        }
        ControlStatus::Success
    }

    /// Parses the manifest and registers the pip's root process.
    pub fn track_root(
        &self,
        client_pid: pid_t,
        root_pid: pid_t,
        fam_bytes: Vec<u8>,
    ) -> (ControlStatus, String) {
        let fam = match FileAccessManifest::parse(fam_bytes) {
            Ok(fam) => fam,
            Err(e) => {
                log_event(
                    SandboxEvent::new(SandboxEventKind::ManifestRejected, e.to_string())
                        .with_client_pid(client_pid),
                );
                return (ControlStatus::ParseError, e.to_string());
            }
        };
        let pip_id = fam.pip_id();

        if let Some(existing) = self.tracker.find(root_pid) {
            if existing.pip_id() == pip_id && existing.client_pid() == client_pid {
                return (
                    ControlStatus::AlreadyRegistered,
                    format!("pip {} already registered for pid {}", pip_id, root_pid),
                );
            }
        }

        let pip = Arc::new(SandboxedPip::from_manifest(client_pid, root_pid, fam));
        if self.tracker.track_root(pip) {
            info!(
                "tracking pip {} (root pid {}) for client {}",
                pip_id, root_pid, client_pid
            );
            (ControlStatus::Success, String::new())
        } else {
            (
                ControlStatus::ResourceExhausted,
                "tracker rejected root registration".to_string(),
            )
        }
    }

    /// Introspects every tracked pip.
    pub fn introspect(&self) -> Vec<PipInfo> {
        self.tracker.introspect()
    }
}

/// One reaper pass: draining deadlines, queue starvation, dead clients.
fn reaper_tick(tracker: &Arc<ProcessTracker>, mux: &Arc<ReportMultiplexer>, config: &SandboxConfig) {
    let now = monotonic_ns();

    let expired = tracker.reap_expired(now);
    if expired > 0 {
        debug!("reaper terminated {} pips past draining deadline", expired);
    }

    // Starvation: the window is a per-pip tunable; take the tightest
    // window among the client's pips.
    for client_pid in mux.client_pids() {
        let Some(window) = tracker.min_starvation_window(client_pid) else {
            continue;
        };
        if mux.starved_clients(window, now).contains(&client_pid) {
            starve_client(tracker, mux, client_pid);
        }
    }

    if config.detect_dead_clients {
        for client_pid in mux.client_pids() {
            if kill(Pid::from_raw(client_pid), None).is_err() {
                warn!("client {} is gone; sweeping", client_pid);
                tracker.sweep_client(client_pid);
                mux.free_queues(client_pid);
            }
        }
    }
}

/// Emits the synthetic kill notice, fails the client's queues, and
/// terminates its trees.
fn starve_client(tracker: &Arc<ProcessTracker>, mux: &Arc<ReportMultiplexer>, client_pid: pid_t) {
    warn!(
        "client {} stopped draining its report queues; terminating its trees",
        client_pid
    );
    log_event(
        SandboxEvent::new(
            SandboxEventKind::QueueStarvation,
            "report queue starvation window elapsed".to_string(),
        )
        .with_client_pid(client_pid),
    );
    let notice = AccessReport::new(
        Operation::ReportQueueClosed,
        RequestedAccess::NONE,
        AccessStatus::Allowed,
        ReasonCode::QueueStarvation,
        0,
        client_pid,
        0,
        0,
        b"",
    );
    let _ = mux.enqueue(client_pid, notice, true);
    mux.notify_failure(client_pid, ControlStatus::ResourceExhausted);
    tracker.terminate_client_pips(client_pid, ReasonCode::QueueStarvation);
    mux.fail_all_queues(client_pid);
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Ok(mut shutdown) = self.reaper_shutdown.lock() {
            if let Some(tx) = shutdown.take() {
                let _ = tx.try_send(());
            }
        }
        if let Ok(mut reaper) = self.reaper.lock() {
            if let Some(handle) = reaper.take() {
                let _ = handle.join();
            }
        }
    }
}
