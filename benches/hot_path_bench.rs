// Hot-path latency benchmark for the dispatcher.
// Measures per-event latency of lookup + read checks against a tracked
// pip with a warm and a cold path cache.

use pipbox::fam::{FamFlags, ManifestBuilder};
use pipbox::policy::PolicyMask;
use pipbox::sandbox::{Sandbox, SandboxConfig};
use pipbox::types::Operation;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 100_000;
const WARMUP_ITERATIONS: usize = 1_000;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;
        LatencyStats {
            p50: samples[p50_idx.min(len - 1)],
            p95: samples[p95_idx.min(len - 1)],
            p99: samples[p99_idx.min(len - 1)],
            min: samples[0],
            max: samples[len - 1],
        }
    }

    fn print(&self, label: &str) {
        println!(
            "{:<28} p50={:>8.0?} p95={:>8.0?} p99={:>8.0?} min={:>8.0?} max={:>8.0?}",
            label, self.p50, self.p95, self.p99, self.min, self.max
        );
    }
}

fn bench<F: FnMut(usize)>(label: &str, mut f: F) {
    for i in 0..WARMUP_ITERATIONS {
        f(i);
    }
    let mut samples = Vec::with_capacity(ITERATIONS);
    for i in 0..ITERATIONS {
        let start = Instant::now();
        f(i);
        samples.push(start.elapsed());
    }
    LatencyStats::from_samples(samples).print(label);
}

fn main() {
    let sandbox = Sandbox::new(SandboxConfig::default());
    sandbox.set_report_queue_size(16);
    sandbox.allocate_report_queue(1);
    let consumer = sandbox.get_report_queue_memory_descriptor(1).unwrap();

    let fam = ManifestBuilder::new(1)
        .flags(FamFlags::REPORT_ALL)
        .root_cone(PolicyMask::ALLOW_ALL.union(PolicyMask::REPORT_ACCESS))
        .scope("/tmp/obj", PolicyMask::DENY, PolicyMask::DENY)
        .build()
        .unwrap();
    sandbox.track_root(1, 100, fam);
    let dispatcher = sandbox.dispatcher();

    // Untracked pid: the cheap early-out every hook takes for processes
    // outside any pip.
    bench("untracked pid", |_| {
        dispatcher.vnode_check(9999, b"/tmp/unrelated", Operation::Read);
    });

    // Warm cache: repeated access to one path, suppressed after the
    // first report.
    bench("tracked, warm cache", |_| {
        dispatcher.vnode_check(100, b"/tmp/hot/file.txt", Operation::Read);
    });

    // Cold cache: a new path every event, each one reported.
    let mut drained = 0usize;
    bench("tracked, cold cache", |i| {
        let path = format!("/tmp/cold/file-{i}.txt");
        dispatcher.vnode_check(100, path.as_bytes(), Operation::Read);
        // Keep the queue from filling so enqueue stays on the fast path.
        if i % 1024 == 0 {
            drained += consumer.drain().len();
        }
    });

    // Lookup hook: path capture plus probe policy.
    bench("lookup + last-path capture", |_| {
        dispatcher.lookup(100, b"/usr/include/stdio.h");
    });

    drained += consumer.drain().len();
    println!("reports drained: {}", drained);
}
