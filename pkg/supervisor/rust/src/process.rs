// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{Directories, ServiceConfig, Ulimits};
use crate::env::{build_environment, expand_placeholders};
use crate::errors::{Error, Result};
use crate::procfs::signal_target;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

/// Captured stdout/stderr keep at most this many trailing bytes.
pub const CAPTURE_LIMIT: usize = 64 * 1024;

/// How long the exit watcher waits for the stdio drainers once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of one launched process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcState {
    pub pid: u32,
    pub running: bool,
    pub exited: bool,
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
    pub success: bool,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcState {
    fn launched(pid: u32) -> Self {
        Self {
            pid,
            running: true,
            exited: false,
            exit_code: None,
            signal: None,
            success: false,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn finish(&mut self, status: Option<ExitStatus>) {
        self.running = false;
        self.exited = true;
        self.end_time = Some(OffsetDateTime::now_utc());
        if let Some(status) = status {
            self.exit_code = status.code();
            self.signal = status.signal();
            self.success = status.success();
        }
    }

    /// How long the process lived, or has been living so far.
    pub fn uptime(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(OffsetDateTime::now_utc);
        let elapsed = end - self.start_time;
        Duration::try_from(elapsed).unwrap_or(Duration::ZERO)
    }
}

/// Bounded buffer that keeps the tail of a stream.
#[derive(Debug, Default)]
struct TailBuffer(Vec<u8>);

impl TailBuffer {
    fn push(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
        if self.0.len() > CAPTURE_LIMIT {
            let excess = self.0.len() - CAPTURE_LIMIT;
            self.0.drain(..excess);
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

type Capture = Arc<Mutex<TailBuffer>>;

fn drain<R>(mut reader: R, buf: Capture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let (Ok(mut b), Some(data)) = (buf.lock(), chunk.get(..n)) {
                        b.push(data);
                    }
                }
            }
        }
    })
}

fn read_capture(buf: &Capture) -> String {
    buf.lock().map(|b| b.text()).unwrap_or_default()
}

/// Launch/terminate primitive for one service. A handle is reused across
/// restarts; each `start` replaces the tracked process.
pub struct ProcessHandle {
    name: String,
    config: Arc<ServiceConfig>,
    dirs: Directories,
    current: Mutex<Option<watch::Receiver<ProcState>>>,
}

impl ProcessHandle {
    pub fn new(name: &str, config: Arc<ServiceConfig>, dirs: Directories) -> Self {
        Self {
            name: name.to_string(),
            config,
            dirs,
            current: Mutex::new(None),
        }
    }

    fn receiver(&self) -> Option<watch::Receiver<ProcState>> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    /// Launch the program. `params` are extra `${key}` substitutions and take
    /// precedence over the directory defaults. Returns the new pid.
    pub fn start(&self, params: &[(&str, &str)]) -> Result<u32> {
        if self.is_running() {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }

        let defaults = self.dirs.placeholders();
        let mut all: Vec<(&str, &str)> = defaults.iter().map(|(k, v)| (*k, v.as_str())).collect();
        all.push(("name", self.name.as_str()));
        all.extend_from_slice(params);

        let program = expand_placeholders(&self.config.program, &all);
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| expand_placeholders(a, &all))
            .collect();

        let mut cmd = if self.config.ulimits.is_empty() {
            let mut cmd = Command::new(&program);
            cmd.args(&args);
            cmd
        } else {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c")
                .arg(ulimit_script(&self.config.ulimits))
                .arg(&program)
                .args(&args);
            cmd
        };

        cmd.env_clear();
        cmd.envs(build_environment(&self.config, &all)?);
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(expand_placeholders(dir, &all));
        }
        self.apply_credentials(&mut cmd, &program)?;

        let stdout_path = self.config.stdout.as_deref().map(|p| expand_placeholders(p, &all));
        let stderr_path = self.config.stderr.as_deref().map(|p| expand_placeholders(p, &all));
        cmd.stdin(Stdio::null());
        cmd.stdout(redirect(stdout_path.as_deref(), &program)?);
        cmd.stderr(redirect(stderr_path.as_deref(), &program)?);

        let mut child = cmd.spawn().map_err(|source| Error::Launch {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let out = Capture::default();
        let err = Capture::default();
        let mut drains = Vec::new();
        if let Some(s) = child.stdout.take() {
            drains.push(drain(s, out.clone()));
        }
        if let Some(s) = child.stderr.take() {
            drains.push(drain(s, err.clone()));
        }

        let (tx, rx) = watch::channel(ProcState::launched(pid));
        if let Ok(mut current) = self.current.lock() {
            *current = Some(rx);
        }
        info!("[{}] started (pid={pid}, program={program})", self.name);

        let name = self.name.clone();
        tokio::spawn(watch_exit(name, child, tx, drains, out, err));
        Ok(pid)
    }

    fn apply_credentials(&self, cmd: &mut Command, program: &str) -> Result<()> {
        let unknown = |what: &str, who: &str| Error::Launch {
            program: program.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, format!("unknown {what} {who}")),
        };
        if let Some(ref user) = self.config.user {
            let u = uzers::get_user_by_name(user).ok_or_else(|| unknown("user", user))?;
            cmd.uid(u.uid());
            if self.config.group.is_none() {
                cmd.gid(u.primary_group_id());
            }
        }
        if let Some(ref group) = self.config.group {
            let g = uzers::get_group_by_name(group).ok_or_else(|| unknown("group", group))?;
            cmd.gid(g.gid());
        }
        Ok(())
    }

    /// Latest snapshot, `None` before the first start.
    pub fn state(&self) -> Option<ProcState> {
        self.receiver().map(|rx| rx.borrow().clone())
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().map(|s| s.pid)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some_and(|s| s.running)
    }

    /// Future resolving once the current process has exited. Detached from
    /// `self`, so it can sit in a `select!` next to other wake-ups. Resolves
    /// to `None` at once if nothing was ever started.
    pub fn done(&self) -> impl Future<Output = Option<ProcState>> + Send + 'static {
        let rx = self.receiver();
        async move {
            let mut rx = rx?;
            let exited = rx.wait_for(|s| s.exited).await.map(|s| s.clone());
            Some(exited.unwrap_or_else(|_| rx.borrow().clone()))
        }
    }

    pub async fn wait(&self) -> Option<ProcState> {
        self.done().await
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let Some(state) = self.state().filter(|s| s.running) else {
            return Ok(());
        };
        let Some(target) = signal_target(state.pid) else {
            return Ok(());
        };
        debug!("[{}] sending {sig} to pid {}", self.name, state.pid);
        match signal::kill(target, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::io(
                format!("sending {sig} to {} (pid={})", self.name, state.pid),
                io::Error::from(e),
            )),
        }
    }

    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    /// SIGTERM, then SIGKILL after `kill_wait`, then give up after
    /// `final_wait`. A zero wait skips its stage.
    pub async fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.signal(Signal::SIGTERM)?;

        let kill_wait = self.config.kill_wait();
        if !kill_wait.is_zero() {
            if timeout(kill_wait, self.done()).await.is_ok() {
                return Ok(());
            }
            warn!(
                "[{}] still running {kill_wait:?} after SIGTERM, sending SIGKILL",
                self.name
            );
            self.kill()?;
        }

        let final_wait = self.config.final_wait();
        if !final_wait.is_zero() && timeout(final_wait, self.done()).await.is_err() {
            return Err(Error::DeadlineExceeded {
                what: self.name.clone(),
                after: final_wait,
            });
        }
        Ok(())
    }
}

async fn watch_exit(
    name: String,
    mut child: Child,
    tx: watch::Sender<ProcState>,
    drains: Vec<JoinHandle<()>>,
    out: Capture,
    err: Capture,
) {
    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("[{name}] failed to wait for child: {e}");
            None
        }
    };
    for d in drains {
        let _ = timeout(DRAIN_TIMEOUT, d).await;
    }
    tx.send_modify(|s| {
        s.finish(status);
        s.stdout = read_capture(&out);
        s.stderr = read_capture(&err);
    });
    match status {
        Some(st) => info!("[{name}] exited with {st}"),
        None => info!("[{name}] exited"),
    }
}

fn redirect(path: Option<&str>, program: &str) -> Result<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::piped());
    };
    match path {
        "null" => Ok(Stdio::null()),
        "inherit" => Ok(Stdio::inherit()),
        _ => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Stdio::from)
            .map_err(|source| Error::Launch {
                program: program.to_string(),
                source,
            }),
    }
}

/// Shell prelude that applies `ulimits` and then execs the real program,
/// which the shell receives as `$0` with its arguments in `$@`.
fn ulimit_script(limits: &Ulimits) -> String {
    let mut script = String::new();
    if let Some(n) = limits.nofile {
        script.push_str(&format!("ulimit -n {n} && "));
    }
    if let Some(n) = limits.nproc {
        // bash spells it -u, dash -p
        script.push_str(&format!("{{ ulimit -u {n} 2>/dev/null || ulimit -p {n}; }} && "));
    }
    if let Some(n) = limits.core {
        script.push_str(&format!("ulimit -c {n} && "));
    }
    script.push_str("exec \"$0\" \"$@\"");
    script
}
