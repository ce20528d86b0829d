//! Per-client report queue multiplexer.
//!
//! Each connected client owns an ordered list of shared report queues.
//! Enqueue walks the list from a per-client cursor and takes the first
//! queue with room; notification ports and consumer handles are paired
//! with queues strictly FIFO, in the order the queues were allocated.

use super::ring::SharedReportQueue;
use crate::observability::counters::CoreCounters;
use crate::types::{monotonic_ns, AccessReport, ControlStatus};
use crate::trie::Trie;
use crossbeam_channel::Sender;
use libc::pid_t;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

struct ClientState {
    queues: Vec<Arc<SharedReportQueue>>,
    /// Round-robin start position for the next enqueue.
    cursor: usize,
    /// Next queue awaiting a notification port (FIFO pairing).
    next_port: usize,
    /// Next queue awaiting a consumer handle (FIFO pairing).
    next_consumer: usize,
    /// Invoked once if the client's reports become undeliverable.
    failure_handler: Option<Sender<ControlStatus>>,
    failure_notified: bool,
}

/// One connected client.
struct ClientEntry {
    session_id: Uuid,
    state: Mutex<ClientState>,
}

impl ClientEntry {
    fn new() -> ClientEntry {
        ClientEntry {
            session_id: Uuid::new_v4(),
            state: Mutex::new(ClientState {
                queues: Vec::new(),
                cursor: 0,
                next_port: 0,
                next_consumer: 0,
                failure_handler: None,
                failure_notified: false,
            }),
        }
    }
}

/// Client-side drain handle for one shared queue. Stands in for the
/// mapped shared-memory region of the queue.
pub struct QueueConsumer {
    queue: Arc<SharedReportQueue>,
    counters: Arc<CoreCounters>,
}

impl QueueConsumer {
    pub fn dequeue(&self) -> Option<AccessReport> {
        let report = self.queue.dequeue()?;
        self.counters.reports_dequeued.inc();
        Some(report)
    }

    pub fn drain(&self) -> Vec<AccessReport> {
        let mut out = Vec::new();
        while let Some(report) = self.dequeue() {
            out.push(report);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// The PID-keyed set of report queues for all connected clients.
pub struct ReportMultiplexer {
    clients: Trie<ClientEntry>,
    counters: Arc<CoreCounters>,
}

impl ReportMultiplexer {
    pub fn new(counters: Arc<CoreCounters>) -> ReportMultiplexer {
        ReportMultiplexer {
            clients: Trie::new_uint(),
            counters,
        }
    }

    pub fn has_client(&self, client_pid: pid_t) -> bool {
        self.clients.get_uint(client_pid as u64).is_some()
    }

    pub fn client_session(&self, client_pid: pid_t) -> Option<Uuid> {
        self.clients
            .get_uint(client_pid as u64)
            .map(|entry| entry.session_id)
    }

    pub fn client_pids(&self) -> Vec<pid_t> {
        let mut pids = Vec::new();
        self.clients.for_each(|key, _| {
            if let crate::trie::TrieKey::Uint(pid) = key {
                pids.push(pid as pid_t);
            }
        });
        pids
    }

    /// Appends a new queue of `capacity` entries to the client's list,
    /// attaching the client on its first call.
    pub fn allocate_queue(&self, client_pid: pid_t, capacity: usize) -> ControlStatus {
        if capacity == 0 {
            return ControlStatus::InvalidArgument;
        }
        let (entry, _) = self
            .clients
            .get_or_add_uint(client_pid as u64, || Arc::new(ClientEntry::new()));
        let Some(entry) = entry else {
            return ControlStatus::ResourceExhausted;
        };
        let Ok(mut state) = entry.state.lock() else {
            return ControlStatus::ResourceExhausted;
        };
        state
            .queues
            .push(Arc::new(SharedReportQueue::with_capacity(capacity)));
        debug!(
            "client {} queue {} allocated ({} entries)",
            client_pid,
            state.queues.len() - 1,
            capacity
        );
        ControlStatus::Success
    }

    /// Attaches `port` to the next queue awaiting one, in allocation
    /// order.
    pub fn set_notification_port(&self, client_pid: pid_t, port: Sender<()>) -> ControlStatus {
        let Some(entry) = self.clients.get_uint(client_pid as u64) else {
            return ControlStatus::NotFound;
        };
        let Ok(mut state) = entry.state.lock() else {
            return ControlStatus::ResourceExhausted;
        };
        let idx = state.next_port;
        if idx >= state.queues.len() {
            return ControlStatus::InvalidArgument;
        }
        state.queues[idx].set_notification_port(port);
        state.next_port += 1;
        ControlStatus::Success
    }

    /// Hands out the consumer handle for the next queue awaiting one,
    /// strictly FIFO with `set_notification_port`.
    pub fn memory_descriptor_for_next(&self, client_pid: pid_t) -> Option<QueueConsumer> {
        let entry = self.clients.get_uint(client_pid as u64)?;
        let mut state = entry.state.lock().ok()?;
        let idx = state.next_consumer;
        if idx >= state.queues.len() {
            return None;
        }
        state.next_consumer += 1;
        Some(QueueConsumer {
            queue: Arc::clone(&state.queues[idx]),
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn set_failure_handler(
        &self,
        client_pid: pid_t,
        handler: Sender<ControlStatus>,
    ) -> ControlStatus {
        let Some(entry) = self.clients.get_uint(client_pid as u64) else {
            return ControlStatus::NotFound;
        };
        let Ok(mut state) = entry.state.lock() else {
            return ControlStatus::ResourceExhausted;
        };
        state.failure_handler = Some(handler);
        ControlStatus::Success
    }

    /// Invokes the client's failure handler once with `status`.
    pub fn notify_failure(&self, client_pid: pid_t, status: ControlStatus) {
        let Some(entry) = self.clients.get_uint(client_pid as u64) else {
            return;
        };
        let Ok(mut state) = entry.state.lock() else {
            return;
        };
        if state.failure_notified {
            return;
        }
        if let Some(handler) = state.failure_handler.as_ref() {
            let _ = handler.try_send(status);
            state.failure_notified = true;
        }
    }

    /// Stamps the report's enqueue time and pushes it into the first
    /// non-full queue, starting at the round-robin cursor when requested.
    /// Returns false when every queue is full or failed.
    pub fn enqueue(&self, client_pid: pid_t, mut report: AccessReport, round_robin: bool) -> bool {
        let Some(entry) = self.clients.get_uint(client_pid as u64) else {
            self.counters.enqueue_failures.inc();
            return false;
        };
        let Ok(mut state) = entry.state.lock() else {
            self.counters.enqueue_failures.inc();
            return false;
        };
        // Stamped under the client lock so times are monotone per queue,
        // not just per thread.
        report.enqueue_ns = monotonic_ns();
        let queue_count = state.queues.len();
        if queue_count == 0 {
            self.counters.enqueue_failures.inc();
            return false;
        }
        let start = if round_robin {
            state.cursor % queue_count
        } else {
            0
        };
        for offset in 0..queue_count {
            let idx = (start + offset) % queue_count;
            if state.queues[idx].enqueue(&report) {
                if round_robin {
                    state.cursor = (idx + 1) % queue_count;
                }
                self.counters.reports_enqueued.inc();
                return true;
            }
        }
        self.counters.enqueue_failures.inc();
        false
    }

    /// Marks every queue of the client failed; subsequent enqueues fail.
    pub fn fail_all_queues(&self, client_pid: pid_t) {
        let Some(entry) = self.clients.get_uint(client_pid as u64) else {
            return;
        };
        if let Ok(state) = entry.state.lock() {
            for queue in &state.queues {
                queue.mark_failed();
            }
        };
    }

    /// Clients with at least one non-empty queue whose last dequeue is
    /// older than `window`.
    pub fn starved_clients(&self, window: Duration, now_ns: u64) -> Vec<pid_t> {
        let window_ns = window.as_nanos() as u64;
        let mut starved = Vec::new();
        self.clients.for_each(|key, entry| {
            let crate::trie::TrieKey::Uint(pid) = key else {
                return;
            };
            let Ok(state) = entry.state.lock() else {
                return;
            };
            let is_starved = state.queues.iter().any(|queue| {
                !queue.has_failed()
                    && !queue.is_empty()
                    && now_ns.saturating_sub(queue.last_dequeue_ns()) > window_ns
            });
            if is_starved {
                starved.push(pid as pid_t);
            }
        });
        starved
    }

    /// Removes all of the client's queues. Idempotent: the second call
    /// finds nothing and is a no-op.
    pub fn free_queues(&self, client_pid: pid_t) -> bool {
        match self.clients.remove_uint(client_pid as u64) {
            crate::trie::TrieResult::Removed => {
                debug!("client {} queues freed", client_pid);
                true
            }
            crate::trie::TrieResult::Race => {
                warn!("client {} queue teardown raced; accepting winner", client_pid);
                false
            }
            _ => false,
        }
    }
}
