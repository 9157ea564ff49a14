// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Shared helpers for unit tests.

#![allow(clippy::panic)]

use crate::config::ServiceConfig;
use crate::procfs::{ProcessInfo, ProcessTable, signal_target};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Synthetic process table built from (pid, ppid, comm) triples.
pub struct FakeTable(HashMap<u32, ProcessInfo>);

impl FakeTable {
    pub fn new(entries: &[(u32, u32, &str)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(pid, ppid, comm)| {
                    let info = ProcessInfo {
                        pid: *pid,
                        ppid: *ppid,
                        comm: comm.to_string(),
                        exe: None,
                    };
                    (*pid, info)
                })
                .collect(),
        )
    }

    /// Give `pid` a readable exe link.
    pub fn with_exe(mut self, pid: u32, exe: &str) -> Self {
        if let Some(info) = self.0.get_mut(&pid) {
            info.exe = Some(PathBuf::from(exe));
        }
        self
    }
}

impl ProcessTable for FakeTable {
    fn inspect(&self, pid: u32) -> Option<ProcessInfo> {
        self.0.get(&pid).cloned()
    }

    fn rss_bytes(&self, _pid: u32) -> Option<u64> {
        None
    }
}

/// A service config tuned for tests: no restart delay, short stop waits.
pub fn fast_config(program: &str, args: &[&str]) -> ServiceConfig {
    let mut cfg = ServiceConfig::new(program, args);
    cfg.restart_delay = 0.0;
    cfg.kill_wait = 1.0;
    cfg.final_wait = 2.0;
    cfg
}

/// Spawn `program`, retrying while a just-written executable is still
/// reported busy because another test thread forked with it open.
pub fn spawn_program(program: &Path, args: &[&str]) -> tokio::process::Child {
    let mut attempts = 0;
    loop {
        match tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => return child,
            Err(e) if e.raw_os_error() == Some(nix::libc::ETXTBSY) && attempts < 50 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("spawning {}: {e}", program.display()),
        }
    }
}

/// Write an executable `#!/bin/sh` script and run it once with `--noop`
/// so later spawns no longer race the write.
pub async fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\n[ \"$1\" = --noop ] && exit 0\n{body}\n");
    std::fs::write(&path, script).unwrap_or_else(|e| panic!("writing {name}: {e}"));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|e| panic!("chmod {name}: {e}"));
    let _ = spawn_program(&path, &["--noop"]).wait().await;
    path
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal_target(pid).is_some_and(|p| nix::sys::signal::kill(p, None).is_ok())
}

/// Poll `cond` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
