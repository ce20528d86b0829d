use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libc::pid_t;
use std::path::PathBuf;

use crate::fam::{FamFlags, FileAccessManifest, ManifestBuilder, ManifestTunables, ScopeRef};
use crate::policy::PolicyMask;
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::types::Operation;

#[derive(Parser)]
#[command(author, version, about = "Process sandbox core tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a File Access Manifest blob and render its scope tree
    Manifest {
        /// Manifest file to inspect
        file: PathBuf,
    },
    /// Compose a File Access Manifest from a text description
    Build {
        /// Manifest description file
        spec: PathBuf,
        /// Output manifest blob
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Replay a file-access trace through an in-process sandbox
    Trace {
        /// Manifest blob governing the traced pip
        #[arg(short, long)]
        manifest: PathBuf,
        /// Trace file (one event per line)
        trace: PathBuf,
        /// Report queue size in MiB
        #[arg(long, default_value_t = 1)]
        queue_mib: u32,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    if let Err(e) = crate::observability::init_audit_log(None) {
        log::warn!("audit log unavailable: {}", e);
    }
    let cli = Cli::parse();
    match cli.command {
        Commands::Manifest { file } => cmd_manifest(&file),
        Commands::Build { spec, output } => cmd_build(&spec, &output),
        Commands::Trace {
            manifest,
            trace,
            queue_mib,
        } => cmd_trace(&manifest, &trace, queue_mib),
    }
}

// ---- manifest inspection ------------------------------------------------

fn cmd_manifest(file: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("reading manifest {}", file.display()))?;
    let fam = FileAccessManifest::parse(bytes).context("parsing manifest")?;

    println!("pip id:        {}", fam.pip_id());
    println!("flags:         {}", render_flags(fam.flags()));
    println!(
        "root process:  {}",
        String::from_utf8_lossy(fam.root_process_path())
    );
    let tunables = fam.tunables();
    println!(
        "queue size:    {} MiB (effective {})",
        tunables.queue_size_mib,
        tunables.effective_queue_size_mib()
    );
    println!(
        "timeouts:      termination {:?}, starvation {:?}",
        tunables.nested_termination_timeout(),
        tunables.starvation_timeout()
    );
    println!("scopes:        {}", fam.scope_count());
    print_scope(fam.root_scope(), 0);
    Ok(())
}

fn render_flags(flags: FamFlags) -> String {
    let mut names = Vec::new();
    if flags.fail_unexpected() {
        names.push("fail_unexpected");
    }
    if flags.report_all() {
        names.push("report_all");
    }
    if flags.monitor_children() {
        names.push("monitor_children");
    }
    if flags.log_process_data() {
        names.push("log_process_data");
    }
    if flags.fail_on_queue_overflow() {
        names.push("fail_on_queue_overflow");
    }
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

fn print_scope(scope: ScopeRef<'_>, indent: usize) {
    let name = if scope.name().is_empty() {
        "/".to_string()
    } else {
        String::from_utf8_lossy(scope.name()).into_owned()
    };
    println!(
        "{}{} policy=[{}] cone=[{}]",
        "  ".repeat(indent),
        name,
        render_mask(scope.policy()),
        render_mask(scope.cone())
    );
    for child in scope.children() {
        print_scope(child, indent + 1);
    }
}

fn render_mask(mask: PolicyMask) -> String {
    let mut names = Vec::new();
    for (bit, name) in [
        (PolicyMask::ALLOW_READ, "read"),
        (PolicyMask::ALLOW_WRITE, "write"),
        (PolicyMask::ALLOW_PROBE, "probe"),
        (PolicyMask::ALLOW_ENUMERATE, "enumerate"),
        (PolicyMask::REPORT_ACCESS, "report"),
        (PolicyMask::REPORT_EXPLICIT_EXPECTED, "expected"),
        (PolicyMask::DENY, "deny"),
    ] {
        if mask.contains(bit) {
            names.push(name);
        }
    }
    names.join(",")
}

// ---- manifest building --------------------------------------------------

fn parse_mask(spec: &str) -> Result<PolicyMask> {
    let mut mask = PolicyMask::EMPTY;
    for token in spec.split(',').filter(|t| !t.is_empty()) {
        mask = mask.union(match token {
            "read" => PolicyMask::ALLOW_READ,
            "write" => PolicyMask::ALLOW_WRITE,
            "probe" => PolicyMask::ALLOW_PROBE,
            "enumerate" => PolicyMask::ALLOW_ENUMERATE,
            "allow_all" => PolicyMask::ALLOW_ALL,
            "report" => PolicyMask::REPORT_ACCESS,
            "expected" => PolicyMask::REPORT_EXPLICIT_EXPECTED,
            "deny" => PolicyMask::DENY,
            other => bail!("unknown policy token: {}", other),
        });
    }
    Ok(mask)
}

fn parse_flag(name: &str) -> Result<FamFlags> {
    Ok(match name {
        "fail_unexpected" => FamFlags::FAIL_UNEXPECTED,
        "report_all" => FamFlags::REPORT_ALL,
        "monitor_children" => FamFlags::MONITOR_CHILDREN,
        "log_process_data" => FamFlags::LOG_PROCESS_DATA,
        "fail_on_queue_overflow" => FamFlags::FAIL_ON_QUEUE_OVERFLOW,
        other => bail!("unknown flag: {}", other),
    })
}

/// Builds a manifest from a line-based description:
///
/// ```text
/// pip 42
/// flags report_all monitor_children
/// root-path /usr/bin/cc
/// queue-mib 4
/// termination-ms 30000
/// starvation-ms 30000
/// root-cone read,probe,report
/// scope /tmp/obj deny,report
/// scope /tmp/out - write,read,probe      # '-' policy, explicit cone
/// ```
fn cmd_build(spec: &PathBuf, output: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(spec)
        .with_context(|| format!("reading spec {}", spec.display()))?;

    let mut pip_id = 0u64;
    let mut flags = FamFlags::default();
    let mut tunables = ManifestTunables::default();
    let mut root_path: Vec<u8> = Vec::new();
    let mut scopes: Vec<(String, PolicyMask, PolicyMask)> = Vec::new();
    let mut root_policy = PolicyMask::EMPTY;
    let mut root_cone = PolicyMask::EMPTY;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or("");
        let context = || format!("{}:{}", spec.display(), lineno + 1);
        match keyword {
            "pip" => {
                pip_id = words
                    .next()
                    .with_context(context)?
                    .parse()
                    .with_context(context)?;
            }
            "flags" => {
                for word in words {
                    flags = flags.union(parse_flag(word).with_context(context)?);
                }
            }
            "root-path" => {
                root_path = words.next().with_context(context)?.as_bytes().to_vec();
            }
            "queue-mib" => {
                tunables.queue_size_mib = words
                    .next()
                    .with_context(context)?
                    .parse()
                    .with_context(context)?;
            }
            "termination-ms" => {
                tunables.nested_process_termination_timeout_ms = words
                    .next()
                    .with_context(context)?
                    .parse()
                    .with_context(context)?;
            }
            "starvation-ms" => {
                tunables.report_queue_starvation_timeout_ms = words
                    .next()
                    .with_context(context)?
                    .parse()
                    .with_context(context)?;
            }
            "root-policy" => {
                root_policy = parse_mask(words.next().with_context(context)?)
                    .with_context(context)?;
            }
            "root-cone" => {
                root_cone = parse_mask(words.next().with_context(context)?)
                    .with_context(context)?;
            }
            "scope" => {
                let path = words.next().with_context(context)?.to_string();
                let policy_spec = words.next().with_context(context)?;
                let policy = if policy_spec == "-" {
                    PolicyMask::EMPTY
                } else {
                    parse_mask(policy_spec).with_context(context)?
                };
                let cone = match words.next() {
                    Some(spec) => parse_mask(spec).with_context(context)?,
                    None => policy,
                };
                scopes.push((path, policy, cone));
            }
            other => bail!("{}: unknown keyword: {}", context(), other),
        }
    }

    let mut builder = ManifestBuilder::new(pip_id)
        .flags(flags)
        .tunables(tunables)
        .root_process_path(&root_path)
        .root_policy(root_policy)
        .root_cone(root_cone);
    for (path, policy, cone) in scopes {
        builder = builder.scope(&path, policy, cone);
    }
    let bytes = builder.build()?;
    std::fs::write(output, &bytes)
        .with_context(|| format!("writing manifest {}", output.display()))?;
    println!("wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

// ---- trace replay -------------------------------------------------------

/// Replays a trace through an in-process sandbox:
///
/// ```text
/// root 100                 # register the pip with root pid 100
/// lookup 100 /tmp/a.txt
/// read 100 /tmp/a.txt
/// fork 100 101
/// exec 101 /usr/bin/cc
/// exit 101
/// exit 100
/// ```
fn cmd_trace(manifest: &PathBuf, trace: &PathBuf, queue_mib: u32) -> Result<()> {
    let fam_bytes = std::fs::read(manifest)
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    let text = std::fs::read_to_string(trace)
        .with_context(|| format!("reading trace {}", trace.display()))?;

    let sandbox = Sandbox::new(SandboxConfig::default());
    let client_pid = std::process::id() as pid_t;
    sandbox.set_report_queue_size(queue_mib);
    let status = sandbox.allocate_report_queue(client_pid);
    if !status.is_success() {
        bail!("queue allocation failed: {:?}", status);
    }
    let consumer = sandbox
        .get_report_queue_memory_descriptor(client_pid)
        .context("no queue consumer")?;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let context = || format!("{}:{}", trace.display(), lineno + 1);
        let pid: pid_t = words
            .get(1)
            .with_context(context)?
            .parse()
            .with_context(context)?;
        let dispatcher = sandbox.dispatcher();
        match words[0] {
            "root" => {
                let (status, detail) = sandbox.track_root(client_pid, pid, fam_bytes.clone());
                if !status.is_success() {
                    bail!("{}: track_root failed: {:?} {}", context(), status, detail);
                }
            }
            "lookup" => {
                let path = words.get(2).with_context(context)?;
                dispatcher.lookup(pid, path.as_bytes());
            }
            "probe" | "read" | "write" | "enumerate" | "readlink" => {
                let op = match words[0] {
                    "probe" => Operation::Probe,
                    "read" => Operation::Read,
                    "write" => Operation::Write,
                    "enumerate" => Operation::Enumerate,
                    _ => Operation::Readlink,
                };
                let path = words.get(2).with_context(context)?;
                let verdict = dispatcher.vnode_check(pid, path.as_bytes(), op);
                println!("{:<9} {} {} -> {:?}", words[0], pid, path, verdict);
            }
            "exec" => {
                let verdict = dispatcher.exec(pid, words.get(2).map(|w| w.as_bytes()));
                println!("exec      {} -> {:?}", pid, verdict);
            }
            "create" => {
                let verdict = dispatcher.create(pid, words.get(2).map(|w| w.as_bytes()));
                println!("create    {} -> {:?}", pid, verdict);
            }
            "fork" => {
                let child: pid_t = words
                    .get(2)
                    .with_context(context)?
                    .parse()
                    .with_context(context)?;
                dispatcher.fork(pid, child);
            }
            "exit" => {
                dispatcher.exit(pid);
            }
            other => bail!("{}: unknown event: {}", context(), other),
        }
    }

    println!("--- reports ---");
    for report in consumer.drain() {
        println!(
            "{:<24} pid={:<7} {:<7} {}",
            report.operation().map(|op| op.name()).unwrap_or("?"),
            report.pid,
            if report.is_denied() { "denied" } else { "allowed" },
            report.path_lossy()
        );
    }
    for info in sandbox.introspect() {
        println!(
            "pip {} state {:?} tree {} cache {}",
            info.pip_id, info.state, info.tree_size, info.cache_size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mask_tokens() {
        let mask = parse_mask("read,probe,report").unwrap();
        assert!(mask.contains(PolicyMask::ALLOW_READ));
        assert!(mask.contains(PolicyMask::ALLOW_PROBE));
        assert!(mask.contains(PolicyMask::REPORT_ACCESS));
        assert!(parse_mask("bogus").is_err());
    }

    #[test]
    fn test_build_and_inspect_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dir.path().join("fam.spec");
        let output = dir.path().join("fam.bin");
        std::fs::write(
            &spec,
            "pip 42\nflags report_all\nroot-path /usr/bin/cc\nroot-cone read,probe,report\nscope /tmp/obj deny,report\n",
        )
        .unwrap();
        cmd_build(&spec, &output).unwrap();

        let fam = FileAccessManifest::parse(std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(fam.pip_id(), 42);
        assert!(fam.flags().report_all());
        cmd_manifest(&output).unwrap();
    }

    #[test]
    fn test_trace_replay_produces_reports() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dir.path().join("fam.spec");
        let manifest = dir.path().join("fam.bin");
        let trace = dir.path().join("trace.txt");
        std::fs::write(
            &spec,
            "pip 7\nflags report_all monitor_children\nroot-path /bin/build\nroot-cone allow_all,report\n",
        )
        .unwrap();
        cmd_build(&spec, &manifest).unwrap();
        std::fs::write(
            &trace,
            "root 100\nread 100 /tmp/a.txt\nfork 100 101\nexit 101\nexit 100\n",
        )
        .unwrap();
        cmd_trace(&manifest, &trace, 1).unwrap();
    }
}
