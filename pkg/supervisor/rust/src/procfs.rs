// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::unistd::Pid;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }
        "/proc".into()
    })
}

/// Signal target for `pid`. `None` for 0 and values outside pid_t, so a
/// bogus pid never turns into a process-group kill.
pub fn signal_target(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(Pid::from_raw)
}

/// What the supervisor needs to know about a pid from the process table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    /// `comm` as reported by the kernel (truncated to 15 bytes).
    pub comm: String,
    /// Target of `/proc/<pid>/exe`, unreadable for other users' processes.
    pub exe: Option<PathBuf>,
}

impl ProcessInfo {
    /// Whether this process looks like an instance of `program_name`.
    ///
    /// Either name is enough. The exe link resolves symlinks and points at
    /// the interpreter for scripts, while `comm` keeps the name the program
    /// was exec'd under, truncated by the kernel to 15 bytes.
    pub fn matches_program(&self, program_name: &str) -> bool {
        let exe_matches = self
            .exe
            .as_ref()
            .and_then(|e| e.file_name())
            .and_then(|n| n.to_str())
            // Replaced binaries show up as "<name> (deleted)".
            .map(|base| base.strip_suffix(" (deleted)").unwrap_or(base))
            .is_some_and(|base| base == program_name);
        let truncated = program_name.get(..15).unwrap_or(program_name);
        exe_matches || self.comm == program_name || self.comm == truncated
    }

    /// Reparented to init: no longer a child of whoever launched it.
    pub fn is_orphaned(&self) -> bool {
        self.ppid == 0 || self.ppid == 1
    }
}

/// Process table lookups, swappable so detection logic can be exercised
/// against synthetic process trees.
pub trait ProcessTable: Send + Sync {
    /// `None` when the pid does not exist (or is a zombie).
    fn inspect(&self, pid: u32) -> Option<ProcessInfo>;

    /// Resident set size in bytes.
    fn rss_bytes(&self, pid: u32) -> Option<u64>;

    fn is_alive(&self, pid: u32) -> bool {
        self.inspect(pid).is_some()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFs;

impl ProcessTable for ProcFs {
    fn inspect(&self, pid: u32) -> Option<ProcessInfo> {
        if pid == 0 {
            return None;
        }
        let dir = root_path().join(pid.to_string());
        let stat = fs::read_to_string(dir.join("stat")).ok()?;
        let (comm, state, ppid) = parse_stat(&stat)?;
        if state == 'Z' || state == 'X' {
            return None;
        }
        Some(ProcessInfo {
            pid,
            ppid,
            comm,
            exe: fs::read_link(dir.join("exe")).ok(),
        })
    }

    fn rss_bytes(&self, pid: u32) -> Option<u64> {
        let status = fs::read_to_string(root_path().join(pid.to_string()).join("status")).ok()?;
        parse_vm_rss(&status)
    }
}

/// Parse `/proc/<pid>/stat` into (comm, state, ppid).
///
/// comm sits in parentheses and may itself contain spaces and ')', so split
/// on the last ')'.
fn parse_stat(stat: &str) -> Option<(String, char, u32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let mut fields = stat.get(close + 1..)?.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((comm, state, ppid))
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb.saturating_mul(1024))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat() {
        let stat = "1234 (trace-agent) S 1 1234 1234 0 -1 4194560 1 0 0 0";
        assert_eq!(
            parse_stat(stat),
            Some(("trace-agent".to_string(), 'S', 1))
        );
    }

    #[test]
    fn test_parse_stat_comm_with_parens_and_spaces() {
        let stat = "42 (weird) name)) R 4242 42 42 0";
        assert_eq!(
            parse_stat(stat),
            Some(("weird) name)".to_string(), 'R', 4242))
        );
    }

    #[test]
    fn test_parse_stat_garbage() {
        assert_eq!(parse_stat(""), None);
        assert_eq!(parse_stat("1 (x)"), None);
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsleep\nVmPeak:\t  8000 kB\nVmRSS:\t  1024 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(1024 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn test_matches_program() {
        let mut info = ProcessInfo {
            pid: 10,
            ppid: 1,
            comm: "process-agent".into(),
            exe: Some(PathBuf::from("/opt/datadog-agent/bin/process-agent")),
        };
        assert!(info.matches_program("process-agent"));
        assert!(!info.matches_program("trace-agent"));

        info.exe = Some(PathBuf::from("/opt/datadog-agent/bin/process-agent (deleted)"));
        assert!(info.matches_program("process-agent"));

        info.exe = None;
        info.comm = "security-agent-".into();
        assert!(info.matches_program("security-agent-sidecar"));

        // Script run through its interpreter.
        info.exe = Some(PathBuf::from("/usr/bin/dash"));
        info.comm = "svc-wrapper".into();
        assert!(info.matches_program("svc-wrapper"));
        assert!(info.matches_program("dash"));
        assert!(!info.matches_program("trace-agent"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_procfs_matches_symlinked_and_script_programs() {
        use crate::test_utils::{spawn_program, wait_until, write_script};
        use std::os::unix::fs::symlink;
        use std::time::Duration;

        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("my-agent");
        symlink("/bin/sleep", &link).expect("symlink");
        let script =
            write_script(dir.path(), "svc-wrapper", "while :; do sleep 1; done").await;

        for (program, name) in [(&link, "my-agent"), (&script, "svc-wrapper")] {
            let mut child = spawn_program(program, &["60"]);
            let pid = child.id().expect("child pid");
            // comm is only renamed once the exec completed.
            let matched = wait_until(Duration::from_secs(5), || {
                ProcFs
                    .inspect(pid)
                    .is_some_and(|info| info.matches_program(name))
            })
            .await;
            child.kill().await.expect("kill child");
            assert!(matched, "{name} (pid={pid}) not recognised");
        }
    }

    #[test]
    fn test_signal_target() {
        assert_eq!(signal_target(42), Some(Pid::from_raw(42)));
        assert_eq!(signal_target(0), None);
        assert_eq!(signal_target(u32::MAX), None);
    }

    #[test]
    fn test_orphaned() {
        let mut info = ProcessInfo {
            pid: 10,
            ppid: 1,
            comm: "x".into(),
            exe: None,
        };
        assert!(info.is_orphaned());
        info.ppid = 0;
        assert!(info.is_orphaned());
        info.ppid = std::process::id();
        assert!(!info.is_orphaned());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_inspects_self() {
        let me = std::process::id();
        let info = ProcFs.inspect(me).expect("current process must be visible");
        assert_eq!(info.pid, me);
        assert_ne!(info.ppid, 0);
        assert!(ProcFs.rss_bytes(me).unwrap_or(0) > 0);
        assert!(ProcFs.is_alive(me));
        assert!(!ProcFs.is_alive(0));
    }
}
