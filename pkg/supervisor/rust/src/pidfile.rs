// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! On-disk bookkeeping shared with the rest of the agent fleet:
//!
//! - `<run>/<name>.pid`: canonical pid file, created exclusively.
//! - `<run>/<name>.<pid>.pid`: backup of a previous occupant.
//! - `<run>/<name>.<pid>.sock`: a live process' status socket.

use crate::procfs::ProcessTable;
use glob_match::glob_match;
use log::{debug, info, warn};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub fn canonical_path(run_dir: &Path, name: &str) -> PathBuf {
    run_dir.join(format!("{name}.pid"))
}

pub fn backup_path(run_dir: &Path, name: &str, pid: u32) -> PathBuf {
    run_dir.join(format!("{name}.{pid}.pid"))
}

pub fn socket_path(run_dir: &Path, name: &str, pid: u32) -> PathBuf {
    run_dir.join(format!("{name}.{pid}.sock"))
}

pub fn ensure_run_dir(run_dir: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o755).create(run_dir)
}

/// Decimal pid as text, surrounding whitespace ignored.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Create `path` holding `pid`, failing with `AlreadyExists` if it is present.
pub fn create_exclusive(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(pid.to_string().as_bytes())?;
    debug!("created pid file {} (pid={pid})", path.display());
    Ok(())
}

/// Best-effort removal; a missing file is not an error.
pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {e}", path.display()),
    }
}

/// Remove the canonical pid file only if it still records `pid`, so a newer
/// occupant's file is never deleted.
pub fn remove_if_owned(path: &Path, pid: u32) {
    if read_pid(path) == Some(pid) {
        remove(path);
    }
}

fn matching_files(run_dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let entries = match fs::read_dir(run_dir) {
        Ok(e) => e,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to list {}: {e}", run_dir.display());
            }
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| glob_match(pattern, n))
        })
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}

/// Historical pid files (`<name>.*.pid`), with the pid each one records.
/// Files that do not hold a pid are reported with `None`.
pub fn backup_pid_files(run_dir: &Path, name: &str) -> Vec<(Option<u32>, PathBuf)> {
    matching_files(run_dir, &format!("{name}.*.pid"))
        .into_iter()
        .map(|p| (read_pid(&p), p))
        .collect()
}

/// Canonical plus backup pid files.
pub fn pid_files(run_dir: &Path, name: &str) -> Vec<(Option<u32>, PathBuf)> {
    let mut files = Vec::new();
    let canonical = canonical_path(run_dir, name);
    if canonical.exists() {
        files.push((read_pid(&canonical), canonical));
    }
    files.extend(backup_pid_files(run_dir, name));
    files
}

/// Socket files (`<name>.<pid>.sock`), keyed by the pid in the file name.
pub fn socket_files(run_dir: &Path, name: &str) -> Vec<(Option<u32>, PathBuf)> {
    let prefix = format!("{name}.");
    matching_files(run_dir, &format!("{name}.*.sock"))
        .into_iter()
        .map(|p| {
            let pid = p
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(".sock"))
                .and_then(|n| n.parse().ok());
            (pid, p)
        })
        .collect()
}

fn is_valid(pid: Option<u32>, program_name: &str, table: &dyn ProcessTable) -> bool {
    pid.and_then(|pid| table.inspect(pid))
        .is_some_and(|info| info.matches_program(program_name))
}

/// Remove every pid and socket file of `name` whose pid is dead or no longer
/// runs `program_name`. Files pointing at a valid process are left alone.
/// Returns the number of files removed.
pub fn remove_stale(
    run_dir: &Path,
    name: &str,
    program_name: &str,
    table: &dyn ProcessTable,
) -> usize {
    let mut removed = 0;
    let files = pid_files(run_dir, name)
        .into_iter()
        .chain(socket_files(run_dir, name));
    for (pid, path) in files {
        if is_valid(pid, program_name, table) {
            continue;
        }
        info!(
            "[{name}] removing stale {} (pid={})",
            path.display(),
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        remove(&path);
        removed += 1;
    }
    removed
}

/// Move the canonical pid file aside to `<name>.<pid>.pid` so its occupant
/// stays tracked while a new process takes the canonical name.
pub fn rotate_to_backup(run_dir: &Path, name: &str) -> io::Result<Option<u32>> {
    let canonical = canonical_path(run_dir, name);
    let Some(pid) = read_pid(&canonical) else {
        return Ok(None);
    };
    let backup = backup_path(run_dir, name, pid);
    fs::rename(&canonical, &backup)?;
    info!(
        "[{name}] moved pid file of previous occupant (pid={pid}) to {}",
        backup.display()
    );
    Ok(Some(pid))
}
