//! Process-tree tracking and lifecycle integration tests.

use pipbox::fam::{FamFlags, ManifestBuilder, ManifestTunables};
use pipbox::pip::PipState;
use pipbox::policy::PolicyMask;
use pipbox::sandbox::{Sandbox, SandboxConfig};
use pipbox::types::{ControlStatus, Operation, ReasonCode};
use std::time::Duration;

fn monitored_manifest(pip_id: u64, termination_ms: u32) -> Vec<u8> {
    ManifestBuilder::new(pip_id)
        .flags(FamFlags::MONITOR_CHILDREN.union(FamFlags::REPORT_ALL))
        .tunables(ManifestTunables {
            nested_process_termination_timeout_ms: termination_ms,
            ..Default::default()
        })
        .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
        .root_process_path(b"/bin/build")
        .build()
        .unwrap()
}

#[test]
fn test_forked_children_tracked_to_peak_then_completed() {
    // A root forks three children; four PIDs are tracked at peak, and
    // tree completion arrives after the last child exits.
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    sandbox.allocate_report_queue(10);
    let consumer = sandbox.get_report_queue_memory_descriptor(10).unwrap();
    let (status, _) = sandbox.track_root(10, 100, monitored_manifest(1, 0));
    assert_eq!(status, ControlStatus::Success);

    for child in [101, 102, 103] {
        sandbox.dispatcher().fork(100, child);
    }
    let info = sandbox.introspect();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].tree_size, 4);
    assert_eq!(sandbox.tracker().tracked_count(), 4);

    sandbox.dispatcher().exit(100);
    for child in [101, 102] {
        sandbox.dispatcher().exit(child);
    }
    // One child still alive: no completion yet.
    let reports = consumer.drain();
    assert!(reports
        .iter()
        .all(|r| r.operation() != Some(Operation::ProcessTreeCompleted)));

    sandbox.dispatcher().exit(103);
    let reports = consumer.drain();
    assert_eq!(
        reports.last().unwrap().operation(),
        Some(Operation::ProcessTreeCompleted)
    );
    assert_eq!(sandbox.tracker().tracked_count(), 0);
}

#[test]
fn test_grandchildren_follow_the_tree() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    sandbox.allocate_report_queue(10);
    let _consumer = sandbox.get_report_queue_memory_descriptor(10).unwrap();
    sandbox.track_root(10, 100, monitored_manifest(2, 0));

    sandbox.dispatcher().fork(100, 101);
    sandbox.dispatcher().fork(101, 102);
    assert_eq!(sandbox.introspect()[0].tree_size, 3);

    // Exec preserves membership.
    sandbox.dispatcher().exec_update(102);
    assert_eq!(sandbox.introspect()[0].tree_size, 3);
}

#[test]
fn test_root_exit_enters_draining_then_times_out() {
    let sandbox = Sandbox::new(SandboxConfig {
        reaper_interval: Duration::from_millis(5),
        ..Default::default()
    });
    sandbox.set_report_queue_size(1);
    sandbox.allocate_report_queue(10);
    let consumer = sandbox.get_report_queue_memory_descriptor(10).unwrap();
    sandbox.track_root(10, 100, monitored_manifest(3, 20));

    sandbox.dispatcher().fork(100, 101);
    sandbox.dispatcher().exit(100);
    assert_eq!(sandbox.introspect()[0].state, PipState::Draining);

    // The child never exits; the draining timeout fires.
    std::thread::sleep(Duration::from_millis(200));
    assert!(sandbox.introspect().is_empty());
    let reports = consumer.drain();
    let completion = reports
        .iter()
        .find(|r| r.operation() == Some(Operation::ProcessTreeCompleted))
        .expect("completion");
    assert_eq!(completion.reason, ReasonCode::DrainingTimeout as u32);
    assert_eq!(completion.reserved2, 1);
}

#[test]
fn test_client_disconnect_sweeps_and_reports() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    sandbox.allocate_report_queue(10);
    let consumer = sandbox.get_report_queue_memory_descriptor(10).unwrap();
    sandbox.track_root(10, 100, monitored_manifest(4, 0));
    sandbox.dispatcher().fork(100, 101);

    // Another client's pip is untouched by the sweep.
    sandbox.allocate_report_queue(20);
    sandbox.track_root(20, 200, monitored_manifest(5, 0));

    sandbox.free_report_queues(10);
    let reports = consumer.drain();
    let completion = reports
        .iter()
        .find(|r| r.operation() == Some(Operation::ProcessTreeCompleted))
        .expect("completion on forced teardown");
    assert_eq!(completion.reason, ReasonCode::ClientDisconnect as u32);

    let info = sandbox.introspect();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].pip_id, 5);
}

#[test]
fn test_nested_build_rebinds_root_pid() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    sandbox.allocate_report_queue(10);
    let _consumer = sandbox.get_report_queue_memory_descriptor(10).unwrap();

    sandbox.track_root(10, 100, monitored_manifest(6, 0));
    let (status, _) = sandbox.track_root(10, 100, monitored_manifest(7, 0));
    assert_eq!(status, ControlStatus::Success);

    let info = sandbox.introspect();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].pip_id, 7);
}

#[test]
fn test_unmonitored_children_are_not_tracked() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(1);
    sandbox.allocate_report_queue(10);
    let fam = ManifestBuilder::new(8)
        .root_cone(PolicyMask::ALLOW_ALL)
        .build()
        .unwrap();
    sandbox.track_root(10, 100, fam);

    sandbox.dispatcher().fork(100, 101);
    assert_eq!(sandbox.tracker().tracked_count(), 1);
    // The untracked child's accesses pass through silently.
    let verdict = sandbox
        .dispatcher()
        .vnode_check(101, b"/anything", Operation::Write);
    assert!(verdict.is_allowed());
}
