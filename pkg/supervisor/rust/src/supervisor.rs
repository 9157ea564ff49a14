// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{Config, Directories};
use crate::control::{self, ControlListener, StatusSource};
use crate::errors::{Error, Result};
use crate::guard::{GuardOptions, ServiceGuard};
use crate::pidfile;
use crate::procfs::{ProcFs, ProcessTable, signal_target};
use crate::state::{AtomicState, ServiceState};
use crate::status::{AggregateStatus, DanglingService};
use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};

/// Program name recorded in our own pid file checks when the executable
/// path cannot be resolved.
const FALLBACK_PROGRAM: &str = "dd-supervisord";

pub struct Supervisor {
    name: String,
    pid: u32,
    program: String,
    start_time: OffsetDateTime,
    dirs: Directories,
    cleanup_dangling: bool,
    table: Arc<dyn ProcessTable>,
    guards: BTreeMap<String, Arc<ServiceGuard>>,
    state: AtomicState,
    listener: Mutex<Option<ControlListener>>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_process_table(config, Arc::new(ProcFs))
    }

    /// Build against a custom process table; dangling detection and
    /// housekeeping consult it instead of `/proc`.
    pub fn with_process_table(config: Config, table: Arc<dyn ProcessTable>) -> Result<Self> {
        let dirs = config.directories();
        let options = GuardOptions {
            dirs: dirs.clone(),
            poll_interval: config.poll_interval(),
            status_timeout: config.status_timeout(),
            cgroup_root: config.cgroup_root.clone(),
            table: table.clone(),
        };

        let mut guards = BTreeMap::new();
        for (name, svc) in config.services {
            svc.validate(&name)?;
            let guard = ServiceGuard::new(&name, Arc::new(svc), options.clone());
            guards.insert(name, Arc::new(guard));
        }

        let program = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .unwrap_or_else(|| FALLBACK_PROGRAM.to_string());

        Ok(Self {
            name: config.name,
            pid: std::process::id(),
            program,
            start_time: OffsetDateTime::now_utc(),
            dirs,
            cleanup_dangling: config.cleanup_dangling,
            table,
            guards,
            state: AtomicState::default(),
            listener: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.state.load()
    }

    pub fn socket_path(&self) -> PathBuf {
        pidfile::socket_path(&self.dirs.run_dir, &self.name, self.pid)
    }

    fn pid_file(&self) -> PathBuf {
        pidfile::canonical_path(&self.dirs.run_dir, &self.name)
    }

    fn guard(&self, name: &str) -> Result<&Arc<ServiceGuard>> {
        self.guards
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self
            .state
            .compare_and_swap(ServiceState::Stopped, ServiceState::Starting)
        {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        if let Err(e) = self.claim() {
            self.state.store(ServiceState::Stopped);
            return Err(e);
        }
        self.state.store(ServiceState::Running);
        info!(
            "[{}] supervisor started (pid={}, services={})",
            self.name,
            self.pid,
            self.guards.len()
        );

        for (name, guard) in &self.guards {
            if !guard.config().auto_start {
                info!("[{name}] auto_start=false, skipping");
                continue;
            }
            if let Err(e) = guard.start().await {
                error!("[{name}] failed to start: {e}");
            }
        }
        Ok(())
    }

    /// Take ownership of the run directory: own pid file, then the control
    /// socket.
    fn claim(self: &Arc<Self>) -> Result<()> {
        pidfile::ensure_run_dir(&self.dirs.run_dir).map_err(|e| {
            Error::io(format!("creating {}", self.dirs.run_dir.display()), e)
        })?;
        if self.cleanup_dangling {
            self.cleanup_dangling();
        }
        self.housekeeping();

        let pid_file = self.pid_file();
        pidfile::create_exclusive(&pid_file, self.pid)
            .map_err(|e| Error::io(format!("claiming {}", pid_file.display()), e))?;

        match control::serve(&self.socket_path(), self.clone()) {
            Ok(listener) => {
                if let Ok(mut slot) = self.listener.lock() {
                    *slot = Some(listener);
                }
                Ok(())
            }
            Err(e) => {
                pidfile::remove_if_owned(&pid_file, self.pid);
                Err(e)
            }
        }
    }

    /// Stop every service and release the run directory. A stop arriving
    /// while the supervisor is still starting waits for the start to settle.
    pub async fn stop(&self) -> Result<()> {
        loop {
            match self.state.load() {
                ServiceState::Stopped => return Ok(()),
                ServiceState::Starting => sleep(Duration::from_millis(10)).await,
                _ => break,
            }
        }
        if !self
            .state
            .compare_and_swap(ServiceState::Running, ServiceState::Stopping)
        {
            return Err(Error::NotRunning(self.name.clone()));
        }
        info!("[{}] stopping {} services", self.name, self.guards.len());

        let mut stops = JoinSet::new();
        for guard in self.guards.values() {
            let guard = guard.clone();
            stops.spawn(async move {
                let res = guard.stop().await;
                (guard.name().to_string(), res)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => error!("[{name}] failed to stop: {e}"),
                Err(e) => error!("[{}] stop task failed: {e}", self.name),
            }
        }

        self.state.store(ServiceState::Stopped);
        let listener = self.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = listener {
            listener.close();
        }
        pidfile::remove_if_owned(&self.pid_file(), self.pid);
        self.housekeeping();
        info!("[{}] supervisor stopped", self.name);
        Ok(())
    }

    /// Block until SIGTERM or SIGINT, then stop the fleet.
    pub async fn listen_signal(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::io("installing SIGTERM handler", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::io("installing SIGINT handler", e))?;
        tokio::select! {
            _ = sigterm.recv() => info!("[{}] received SIGTERM", self.name),
            _ = sigint.recv() => info!("[{}] received SIGINT", self.name),
        }
        self.stop().await
    }

    pub async fn start_service(&self, name: &str) -> Result<()> {
        match self.guard(name)?.start().await {
            Err(Error::AlreadyStarted(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn stop_service(&self, name: &str) -> Result<()> {
        self.guard(name)?.stop().await
    }

    pub async fn status(&self) -> AggregateStatus {
        let mut services = BTreeMap::new();
        for (name, guard) in &self.guards {
            services.insert(name.clone(), guard.state().await);
        }
        let state = self.state.load();
        let ready = state == ServiceState::Running
            && services.values().all(|s| s.state == ServiceState::Running);
        AggregateStatus {
            ready,
            state,
            pid: self.pid,
            socket: self.socket_path(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: self.start_time,
            services,
            dangling: self.detect_dangling(),
        }
    }

    /// Processes of known services that outlived the supervisor that
    /// launched them: alive, running the service's program, and reparented
    /// to init.
    pub fn detect_dangling(&self) -> Vec<DanglingService> {
        let run_dir = &self.dirs.run_dir;
        let mut dangling = Vec::new();
        for (name, guard) in &self.guards {
            let program = guard.config().program_name();
            let mut seen = BTreeSet::new();
            for (pid, pid_file) in pidfile::pid_files(run_dir, name) {
                let Some(pid) = pid else { continue };
                if !seen.insert(pid) {
                    continue;
                }
                let Some(info) = self.table.inspect(pid) else {
                    continue;
                };
                if info.matches_program(program) && info.is_orphaned() {
                    dangling.push(DanglingService {
                        name: name.clone(),
                        pid,
                        pid_file,
                        socket: pidfile::socket_path(run_dir, name, pid),
                    });
                }
            }
        }
        dangling
    }

    /// SIGTERM every dangling process. Returns how many were signalled.
    pub fn cleanup_dangling(&self) -> usize {
        let mut signalled = 0;
        for d in self.detect_dangling() {
            warn!("[{}] terminating dangling process (pid={})", d.name, d.pid);
            let Some(target) = signal_target(d.pid) else {
                continue;
            };
            match signal::kill(target, Signal::SIGTERM) {
                Ok(()) => signalled += 1,
                Err(e) => warn!("[{}] failed to signal pid {}: {e}", d.name, d.pid),
            }
        }
        signalled
    }

    /// Remove pid and socket files of the supervisor and its services that
    /// point at dead or foreign processes.
    pub fn housekeeping(&self) -> usize {
        let run_dir = &self.dirs.run_dir;
        let table = self.table.as_ref();
        let mut removed = pidfile::remove_stale(run_dir, &self.name, &self.program, table);
        for (name, guard) in &self.guards {
            removed += pidfile::remove_stale(run_dir, name, guard.config().program_name(), table);
        }
        removed
    }
}

impl StatusSource for Supervisor {
    async fn status_json(&self) -> serde_json::Value {
        let status = self.status().await;
        serde_json::to_value(&status).unwrap_or_else(|e| {
            error!("[{}] failed to encode status: {e}", self.name);
            serde_json::Value::Null
        })
    }
}
