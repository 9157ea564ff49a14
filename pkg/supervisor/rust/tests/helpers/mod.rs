// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a running dd-supervisord process.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _stdout_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

fn collect_lines(
    stream: impl std::io::Read + Send + 'static,
    tag: &'static str,
    lines: Arc<Mutex<Vec<String>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(l) => {
                    eprintln!("[{tag}] {l}");
                    lines.lock().unwrap().push(l);
                }
                Err(_) => break,
            }
        }
    })
}

impl DaemonHandle {
    /// Start the daemon with `DD_SUPERVISOR_CONFIG` pointing at `config`.
    pub fn start(config: &Path) -> Self {
        let bin = env!("CARGO_BIN_EXE_dd-supervisord");
        let mut child = Command::new(bin)
            .env("DD_SUPERVISOR_CONFIG", config)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dd-supervisord");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));

        Self {
            child,
            _stdout_thread: collect_lines(stdout, "daemon", Arc::clone(&log_lines)),
            _stderr_thread: collect_lines(stderr, "daemon:err", Arc::clone(&log_lines)),
            log_lines,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        wait_until(timeout, || {
            self.log_lines
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.contains(pattern))
        })
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = i32::try_from(self.child.id()).unwrap();
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to daemon");
    }

    /// Send SIGTERM and wait for the daemon to exit.
    pub fn stop(&mut self) -> ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Wait for the daemon to exit on its own; killed once `timeout` passes.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check daemon status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            // Let the daemon take its services down with it.
            self.send_signal(Signal::SIGTERM);
            self.wait_with_timeout(DEFAULT_TIMEOUT);
        }
    }
}

/// A supervisor sandbox: agent dir, run dir and config file in a tempdir.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn run_dir(&self) -> PathBuf {
        self.path().join("run")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("supervisor.yaml")
    }

    /// Write the top-level config. `extra` is appended verbatim and holds
    /// the `services:` section, if any. cgroups point at an empty directory
    /// so no test touches the host hierarchy.
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let cgroup_root = self.path().join("cgroup");
        std::fs::create_dir_all(&cgroup_root).unwrap();
        let yaml = format!(
            "agent_dir: {agent}\nlog_level: debug\npoll_interval: 0.1\ncgroup_root: {cgroup}\n{extra}",
            agent = self.path().display(),
            cgroup = cgroup_root.display(),
        );
        let path = self.config_path();
        std::fs::write(&path, yaml)
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
        path
    }

    /// Pid recorded in `<run_dir>/<name>.pid`, if any.
    pub fn service_pid(&self, name: &str) -> Option<u32> {
        let path = self.run_dir().join(format!("{name}.pid"));
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Wait until `<name>.pid` names a live process and return its pid.
    pub fn wait_for_service_pid(&self, name: &str) -> Option<u32> {
        let mut found = None;
        wait_until(DEFAULT_TIMEOUT, || {
            found = self.service_pid(name).filter(|pid| pid_is_alive(*pid));
            found.is_some()
        });
        found
    }
}

/// YAML for a long-sleeping service with fast restart and stop timings.
pub fn sleeper(name: &str) -> String {
    format!(
        "  {name}:\n    program: /bin/sleep\n    args: ['300']\n    restart_delay: 0\n    kill_wait: 2\n    final_wait: 2\n"
    )
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    pid > 0 && signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    wait_until(timeout, || !pid_is_alive(pid))
}
