//! Integration tests for the sandbox core driven through the public API:
//! control plane in, hook events through the dispatcher, reports out of
//! the client queue.

use libc::pid_t;
use pipbox::fam::{FamFlags, FileAccessManifest, ManifestBuilder, ManifestTunables};
use pipbox::policy::PolicyMask;
use pipbox::queue::QueueConsumer;
use pipbox::sandbox::{Sandbox, SandboxConfig};
use pipbox::types::{ControlStatus, Operation, ReasonCode};
use std::time::Duration;

fn allow_all_report_manifest(pip_id: u64, flags: FamFlags) -> Vec<u8> {
    ManifestBuilder::new(pip_id)
        .flags(flags)
        .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
        .root_process_path(b"/bin/build")
        .build()
        .unwrap()
}

fn start_pip(sandbox: &Sandbox, client: pid_t, root: pid_t, fam: Vec<u8>) -> QueueConsumer {
    assert_eq!(sandbox.allocate_report_queue(client), ControlStatus::Success);
    let consumer = sandbox.get_report_queue_memory_descriptor(client).unwrap();
    let (status, detail) = sandbox.track_root(client, root, fam);
    assert_eq!(status, ControlStatus::Success, "{detail}");
    consumer
}

#[test]
fn test_allow_all_single_process_read() {
    // Allow-all manifest; a single process reads /tmp/a.txt.
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = allow_all_report_manifest(1, FamFlags::default());
    let consumer = start_pip(&sandbox, 10, 100, fam);

    sandbox
        .dispatcher()
        .vnode_check(100, b"/tmp/a.txt", Operation::Read);
    sandbox.dispatcher().exit(100);

    let reports = consumer.drain();
    let read = reports
        .iter()
        .find(|r| r.operation() == Some(Operation::Read))
        .expect("read report");
    assert_eq!(read.path_bytes(), b"/tmp/a.txt");
    assert!(!read.is_denied());
    // The final report is process-tree-completed.
    assert_eq!(
        reports.last().unwrap().operation(),
        Some(Operation::ProcessTreeCompleted)
    );
}

#[test]
fn test_nested_deny_scope() {
    // Root allows everything with reporting; /tmp/obj denies.
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = ManifestBuilder::new(2)
        .flags(FamFlags::FAIL_UNEXPECTED)
        .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
        .scope(
            "/tmp/obj",
            PolicyMask::DENY.union(PolicyMask::REPORT_ACCESS),
            PolicyMask::DENY.union(PolicyMask::REPORT_ACCESS),
        )
        .build()
        .unwrap();
    let consumer = start_pip(&sandbox, 10, 100, fam);

    let verdict = sandbox
        .dispatcher()
        .vnode_check(100, b"/tmp/obj/t1.obj", Operation::Probe);
    assert!(!verdict.is_allowed());

    let reports = consumer.drain();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation(), Some(Operation::Probe));
    assert!(reports[0].is_denied());
    assert_eq!(reports[0].reason, ReasonCode::ExplicitDeny as u32);
}

#[test]
fn test_duplicate_path_dedup() {
    // The same file opened 1000 times yields exactly one (path, read)
    // report.
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = allow_all_report_manifest(3, FamFlags::REPORT_ALL);
    let consumer = start_pip(&sandbox, 10, 100, fam);

    for _ in 0..1000 {
        sandbox
            .dispatcher()
            .vnode_check(100, b"/tmp/same.txt", Operation::Read);
    }
    let reads: Vec<_> = consumer
        .drain()
        .into_iter()
        .filter(|r| r.operation() == Some(Operation::Read))
        .collect();
    assert_eq!(reads.len(), 1);
}

#[test]
fn test_non_ascii_path_reported_verbatim_every_time() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = allow_all_report_manifest(4, FamFlags::REPORT_ALL);
    let consumer = start_pip(&sandbox, 10, 100, fam);

    let path = "/tmp/繙.txt".as_bytes();
    sandbox.dispatcher().vnode_check(100, path, Operation::Read);
    sandbox.dispatcher().vnode_check(100, path, Operation::Read);

    let reports = consumer.drain();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(report.path_bytes(), path);
    }
    // The dedup cache never holds the path.
    let info = sandbox.introspect();
    assert_eq!(info[0].cache_size, 0);
}

#[test]
fn test_queue_starvation_terminates_tree() {
    let sandbox = Sandbox::new(SandboxConfig {
        reaper_interval: Duration::from_millis(5),
        ..Default::default()
    });
    sandbox.set_report_queue_size(1);
    let fam = ManifestBuilder::new(5)
        .flags(FamFlags::REPORT_ALL)
        .tunables(ManifestTunables {
            report_queue_starvation_timeout_ms: 20,
            ..Default::default()
        })
        .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
        .build()
        .unwrap();
    let consumer = start_pip(&sandbox, 10, 100, fam);

    sandbox
        .dispatcher()
        .vnode_check(100, b"/tmp/slow.txt", Operation::Read);
    std::thread::sleep(Duration::from_millis(200));

    // The tree was marked terminated and evicted.
    assert!(sandbox.introspect().is_empty());
    let reports = consumer.drain();
    let ops: Vec<_> = reports.iter().filter_map(|r| r.operation()).collect();
    assert!(ops.contains(&Operation::ReportQueueClosed));
    assert!(ops.contains(&Operation::ProcessTreeCompleted));
}

#[test]
fn test_no_reports_after_tree_completed() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = allow_all_report_manifest(6, FamFlags::REPORT_ALL);
    let consumer = start_pip(&sandbox, 10, 100, fam);

    sandbox
        .dispatcher()
        .vnode_check(100, b"/tmp/a.txt", Operation::Read);
    sandbox.dispatcher().exit(100);
    // Late events from a stale pid produce nothing.
    sandbox
        .dispatcher()
        .vnode_check(100, b"/tmp/b.txt", Operation::Read);

    let reports = consumer.drain();
    let completed_at = reports
        .iter()
        .position(|r| r.operation() == Some(Operation::ProcessTreeCompleted))
        .expect("tree completed");
    assert!(reports[completed_at..]
        .iter()
        .skip(1)
        .all(|r| r.pip_id != 6));
}

#[test]
fn test_enqueue_times_are_monotone_per_queue() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = allow_all_report_manifest(7, FamFlags::REPORT_ALL);
    let consumer = start_pip(&sandbox, 10, 100, fam);

    for i in 0..20 {
        let path = format!("/tmp/file-{i}");
        sandbox
            .dispatcher()
            .vnode_check(100, path.as_bytes(), Operation::Read);
    }
    let reports = consumer.drain();
    assert!(reports.windows(2).all(|w| w[0].enqueue_ns <= w[1].enqueue_ns));
    assert!(reports.iter().all(|r| r.dequeue_ns >= r.enqueue_ns));
}

#[test]
fn test_manifest_round_trip_law() {
    // parse(serialize(m)) == m for a representative manifest.
    let bytes = ManifestBuilder::new(99)
        .flags(FamFlags::REPORT_ALL.union(FamFlags::MONITOR_CHILDREN))
        .tunables(ManifestTunables {
            queue_size_mib: 8,
            nested_process_termination_timeout_ms: 1234,
            report_queue_starvation_timeout_ms: 5678,
        })
        .root_process_path(b"/usr/bin/clang")
        .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
        .scope("/tmp/obj", PolicyMask::DENY, PolicyMask::DENY)
        .scope(
            "/tmp/out/logs",
            PolicyMask::ALLOW_WRITE.union(PolicyMask::REPORT_ACCESS),
            PolicyMask::EMPTY,
        )
        .build()
        .unwrap();
    let first = FileAccessManifest::parse(bytes.clone()).unwrap();
    let second = FileAccessManifest::parse(bytes).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_free_report_queues_is_idempotent() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    assert_eq!(sandbox.allocate_report_queue(10), ControlStatus::Success);
    assert_eq!(sandbox.free_report_queues(10), ControlStatus::Success);
    assert_eq!(sandbox.free_report_queues(10), ControlStatus::Success);
}

#[test]
fn test_notification_port_signals_on_report() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    let fam = allow_all_report_manifest(8, FamFlags::REPORT_ALL);

    assert_eq!(sandbox.allocate_report_queue(10), ControlStatus::Success);
    let (port, wakeup) = crossbeam_channel::bounded(1);
    assert_eq!(
        sandbox.set_report_queue_notification_port(10, port),
        ControlStatus::Success
    );
    let consumer = sandbox.get_report_queue_memory_descriptor(10).unwrap();
    let (status, _) = sandbox.track_root(10, 100, fam);
    assert_eq!(status, ControlStatus::Success);

    sandbox
        .dispatcher()
        .vnode_check(100, b"/tmp/a.txt", Operation::Read);
    assert!(wakeup.recv_timeout(Duration::from_secs(1)).is_ok());
    assert_eq!(consumer.drain().len(), 1);
}
