// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Keeps one service alive: launch, watch, restart within the quick-exit
//! budget, and stop on request.

use crate::config::{Directories, ServiceConfig};
use crate::control::query_status;
use crate::errors::{Error, Result};
use crate::limiter::{self, ResourceLimiter};
use crate::pidfile;
use crate::process::{ProcState, ProcessHandle};
use crate::procfs::ProcessTable;
use crate::state::{AtomicState, ServiceState};
use crate::status::ServiceStatus;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, sleep};

/// Fleet-wide settings every guard is built with.
#[derive(Clone)]
pub struct GuardOptions {
    pub dirs: Directories,
    pub poll_interval: Duration,
    pub status_timeout: Duration,
    pub cgroup_root: PathBuf,
    pub table: Arc<dyn ProcessTable>,
}

pub struct ServiceGuard {
    name: String,
    config: Arc<ServiceConfig>,
    options: GuardOptions,
    process: ProcessHandle,
    limiter: Box<dyn ResourceLimiter>,
    state: AtomicState,
    stop_requested: Notify,
    guard_loop: Mutex<Option<JoinHandle<()>>>,
    launches: AtomicU32,
    last_exit_code: Mutex<Option<i32>>,
}

impl ServiceGuard {
    pub fn new(name: &str, config: Arc<ServiceConfig>, options: GuardOptions) -> Self {
        let limiter = limiter::build(
            name,
            &config.quota,
            &options.cgroup_root,
            options.table.clone(),
        );
        Self {
            name: name.to_string(),
            process: ProcessHandle::new(name, config.clone(), options.dirs.clone()),
            config,
            options,
            limiter,
            state: AtomicState::default(),
            stop_requested: Notify::new(),
            guard_loop: Mutex::new(None),
            launches: AtomicU32::new(0),
            last_exit_code: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn coarse_state(&self) -> ServiceState {
        self.state.load()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.state().filter(|s| s.running).map(|s| s.pid)
    }

    fn run_dir(&self) -> &std::path::Path {
        &self.options.dirs.run_dir
    }

    /// Launch the service and hand it to a guard loop. Returns once the first
    /// process is up; readiness shows up later in `state()`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self
            .state
            .compare_and_swap(ServiceState::Stopped, ServiceState::Starting)
        {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        if let Some(description) = &self.config.description {
            info!("[{}] starting: {description}", self.name);
        }
        self.clear_residual_files();
        if let Err(e) = self.launch().await {
            error!("[{}] failed to start: {e}", self.name);
            self.state.store(ServiceState::Stopped);
            return Err(e);
        }
        let guard = self.clone();
        let handle = tokio::spawn(async move { guard.run().await });
        if let Ok(mut slot) = self.guard_loop.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Drop pid and socket files left behind by earlier runs. A live
    /// instance still holding the canonical pid file is moved to a backup
    /// pid file so the new process can claim the canonical name.
    fn clear_residual_files(&self) {
        let run_dir = self.run_dir();
        if let Err(e) = pidfile::ensure_run_dir(run_dir) {
            warn!("[{}] cannot create {}: {e}", self.name, run_dir.display());
        }
        pidfile::remove_stale(
            run_dir,
            &self.name,
            self.config.program_name(),
            self.options.table.as_ref(),
        );
        match pidfile::rotate_to_backup(run_dir, &self.name) {
            Ok(Some(pid)) => warn!(
                "[{}] previous instance (pid={pid}) is still running",
                self.name
            ),
            Ok(None) => {}
            Err(e) => warn!("[{}] failed to rotate pid file: {e}", self.name),
        }
    }

    async fn launch(&self) -> Result<u32> {
        let pid = self.process.start(&[])?;
        self.launches.fetch_add(1, Ordering::Relaxed);

        let pid_file = pidfile::canonical_path(self.run_dir(), &self.name);
        if let Err(e) = pidfile::create_exclusive(&pid_file, pid) {
            // Someone else owns the canonical pid file; never run two.
            if let Err(kill_err) = self.process.kill() {
                warn!("[{}] failed to kill pid {pid}: {kill_err}", self.name);
            }
            self.process.wait().await;
            return Err(Error::io(
                format!("claiming pid file {}", pid_file.display()),
                e,
            ));
        }
        self.limiter.limit_pid(pid);
        Ok(pid)
    }

    async fn run(self: Arc<Self>) {
        let _ = self
            .state
            .compare_and_swap(ServiceState::Starting, ServiceState::Running);

        let mut tick = interval(self.options.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut quick_exits = 0u32;

        loop {
            let exited = tokio::select! {
                st = self.process.done() => st,
                _ = self.stop_requested.notified() => None,
                _ = tick.tick() => None,
            };

            if self.state.load().is_winding_down() {
                self.wind_down().await;
                return;
            }
            let Some(exit) = exited.filter(|st| st.exited) else {
                continue;
            };
            self.record_exit(&exit);

            if exit.success {
                info!("[{}] exited cleanly, not restarting", self.name);
                self.finish();
                return;
            }

            let min_live = self.config.min_live_time();
            if !min_live.is_zero() && exit.uptime() < min_live {
                quick_exits += 1;
                warn!(
                    "[{}] exited after {:?}, quick exit {quick_exits}",
                    self.name,
                    exit.uptime()
                );
            } else {
                quick_exits = 0;
            }
            let limit = self.config.quick_exit_limit;
            if limit > 0 && quick_exits >= limit {
                let err = Error::QuickExitLimit {
                    name: self.name.clone(),
                    count: quick_exits,
                };
                error!("[{}] {err}", self.name);
                self.finish();
                return;
            }

            if !self
                .state
                .compare_and_swap(ServiceState::Running, ServiceState::Starting)
            {
                self.wind_down().await;
                return;
            }
            let delay = self.config.restart_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.stop_requested.notified() => {}
                }
            }
            if self.state.load() != ServiceState::Starting {
                self.wind_down().await;
                return;
            }

            info!("[{}] restarting", self.name);
            if let Err(e) = self.launch().await {
                error!("[{}] restart failed: {e}", self.name);
                self.finish();
                return;
            }
            if !self
                .state
                .compare_and_swap(ServiceState::Starting, ServiceState::Running)
            {
                self.wind_down().await;
                return;
            }
        }
    }

    fn record_exit(&self, exit: &ProcState) {
        if let Ok(mut code) = self.last_exit_code.lock() {
            *code = exit.exit_code;
        }
        let run_dir = self.run_dir();
        pidfile::remove_if_owned(&pidfile::canonical_path(run_dir, &self.name), exit.pid);
        pidfile::remove(&pidfile::socket_path(run_dir, &self.name, exit.pid));
        if !exit.stderr.is_empty() {
            debug!("[{}] stderr tail: {}", self.name, exit.stderr.trim_end());
        }
    }

    fn finish(&self) {
        self.limiter.release();
        self.state.store(ServiceState::Stopped);
    }

    /// Stop path of the loop: make sure nothing is left running, then settle.
    async fn wind_down(&self) {
        if self.process.is_running() {
            if let Err(e) = self.process.stop().await {
                warn!("[{}] {e}, killing", self.name);
                if let Err(e) = self.process.kill() {
                    warn!("[{}] failed to kill: {e}", self.name);
                }
            }
        }
        if let Some(exit) = self.process.state().filter(|s| s.exited) {
            self.record_exit(&exit);
        }
        self.finish();
        info!("[{}] stopped", self.name);
    }

    /// Stop the service and wait for its guard loop to end.
    pub async fn stop(&self) -> Result<()> {
        loop {
            match self.state.load() {
                ServiceState::Stopped => return Ok(()),
                ServiceState::Stopping => break,
                current => {
                    if self
                        .state
                        .compare_and_swap(current, ServiceState::Stopping)
                    {
                        break;
                    }
                }
            }
        }
        info!("[{}] stopping", self.name);
        self.stop_requested.notify_one();

        let result = match self.process.stop().await {
            Ok(()) => Ok(()),
            Err(_) if !self.process.is_running() => Ok(()),
            Err(e) => {
                warn!("[{}] {e}, killing", self.name);
                if let Err(kill_err) = self.process.kill() {
                    warn!("[{}] failed to kill: {kill_err}", self.name);
                }
                Err(e)
            }
        };

        let handle = self.guard_loop.lock().ok().and_then(|mut slot| slot.take());
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("[{}] guard loop ended abnormally: {e}", self.name);
                    self.state.store(ServiceState::Stopped);
                }
            }
            None => self.wait_stopped().await,
        }
        result
    }

    /// Covers a stop racing a start that has not published its loop yet.
    async fn wait_stopped(&self) {
        let deadline = Instant::now()
            + self.config.kill_wait()
            + self.config.final_wait()
            + self.options.poll_interval * 2;
        while self.state.load() != ServiceState::Stopped {
            if Instant::now() >= deadline {
                warn!("[{}] still {} after stop", self.name, self.state.load());
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Current status. A running service is asked over its own socket; when
    /// that fails the guard's view of the process is reported.
    pub async fn state(&self) -> ServiceStatus {
        let coarse = self.state.load();
        let proc_state = self.process.state();
        let running = proc_state.as_ref().filter(|s| s.running);

        let mut status = ServiceStatus {
            state: coarse,
            pid: running.map(|s| s.pid),
            start_time: running.map(|s| s.start_time),
            restarts: self.launches.load(Ordering::Relaxed).saturating_sub(1),
            last_exit_code: self.last_exit_code.lock().ok().and_then(|c| *c),
            limiter: self.limiter.kind(),
            from_peer: false,
        };

        let Some(pid) = status.pid else {
            if coarse == ServiceState::Running {
                // exited, the loop has not caught up yet
                status.state = ServiceState::Starting;
            }
            return status;
        };
        if self.options.status_timeout.is_zero() {
            return status;
        }
        let socket = pidfile::socket_path(self.run_dir(), &self.name, pid);
        if !socket.exists() {
            return status;
        }
        match query_status(&socket, self.options.status_timeout).await {
            Ok(peer) => match ServiceState::parse(&peer.state) {
                Some(state) => {
                    status.state = state;
                    status.start_time = Some(peer.start_time);
                    status.from_peer = true;
                }
                None => debug!("[{}] unknown peer state {:?}", self.name, peer.state),
            },
            Err(e) => debug!("[{}] status query failed: {e:#}", self.name),
        }
        status
    }
}
