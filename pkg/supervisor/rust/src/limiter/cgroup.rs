// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{LimiterKind, ResourceLimiter};
use crate::config::Quota;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PARENT_GROUP: &str = "dd-supervisor";
const CPU_PERIOD_US: u64 = 100_000;
/// Smallest quota the kernel accepts in `cpu.max`.
const CPU_MIN_QUOTA_US: u64 = 1_000;

/// cgroup v2 group `<root>/dd-supervisor/<name>` carrying the quota.
#[derive(Debug)]
pub struct CgroupLimiter {
    name: String,
    path: PathBuf,
}

impl CgroupLimiter {
    pub fn new(name: &str, quota: &Quota, root: &Path) -> io::Result<Self> {
        let parent = root.join(PARENT_GROUP);
        fs::create_dir_all(&parent)?;
        enable_subtree_controllers(root);
        enable_subtree_controllers(&parent);

        let path = parent.join(name);
        fs::create_dir_all(&path)?;
        if quota.cpu > 0.0 {
            fs::write(path.join("cpu.max"), cpu_max(quota.cpu))?;
        }
        if quota.memory > 0 {
            fs::write(path.join("memory.max"), quota.memory.to_string())?;
        }
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `cpu.max` payload for a fraction of one CPU.
fn cpu_max(cpu: f64) -> String {
    let quota = ((cpu * CPU_PERIOD_US as f64).round() as u64).max(CPU_MIN_QUOTA_US);
    format!("{quota} {CPU_PERIOD_US}")
}

/// Best effort: without delegation the write fails and the knobs we write
/// next either fail too or have no effect.
fn enable_subtree_controllers(group: &Path) {
    let path = group.join("cgroup.subtree_control");
    if let Err(e) = fs::write(&path, "+cpu +memory") {
        debug!("could not enable controllers in {}: {e}", path.display());
    }
}

impl ResourceLimiter for CgroupLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Cgroup
    }

    fn limit_pid(&self, pid: u32) {
        if let Err(e) = fs::write(self.path.join("cgroup.procs"), pid.to_string()) {
            warn!(
                "[{}] failed to move pid {pid} into {}: {e}",
                self.name,
                self.path.display()
            );
        }
    }

    fn release(&self) {
        // Only succeeds once the group is empty.
        if let Err(e) = fs::remove_dir(&self.path) {
            debug!("[{}] kept {}: {e}", self.name, self.path.display());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_max() {
        assert_eq!(cpu_max(0.5), "50000 100000");
        assert_eq!(cpu_max(2.0), "200000 100000");
        assert_eq!(cpu_max(0.0001), "1000 100000");
    }

    #[test]
    fn test_writes_group_files() {
        let root = tempfile::tempdir().unwrap();
        let quota = Quota {
            cpu: 0.25,
            memory: 64 << 20,
        };
        let l = CgroupLimiter::new("trace-agent", &quota, root.path()).unwrap();
        let group = root.path().join("dd-supervisor/trace-agent");
        assert_eq!(l.path(), group);

        assert_eq!(
            fs::read_to_string(group.join("cpu.max")).unwrap(),
            "25000 100000"
        );
        assert_eq!(
            fs::read_to_string(group.join("memory.max")).unwrap(),
            (64u64 << 20).to_string()
        );
        assert_eq!(
            fs::read_to_string(root.path().join("dd-supervisor/cgroup.subtree_control")).unwrap(),
            "+cpu +memory"
        );

        l.limit_pid(4242);
        assert_eq!(
            fs::read_to_string(group.join("cgroup.procs")).unwrap(),
            "4242"
        );
    }

    #[test]
    fn test_memory_only_skips_cpu() {
        let root = tempfile::tempdir().unwrap();
        let quota = Quota {
            cpu: 0.0,
            memory: 1024,
        };
        let l = CgroupLimiter::new("svc", &quota, root.path()).unwrap();
        assert!(!l.path().join("cpu.max").exists());
        assert!(l.path().join("memory.max").exists());
    }

    #[test]
    fn test_unusable_root() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, "").unwrap();
        let quota = Quota {
            cpu: 1.0,
            memory: 0,
        };
        assert!(CgroupLimiter::new("svc", &quota, &file).is_err());
    }

    #[test]
    fn test_release_removes_empty_group() {
        let root = tempfile::tempdir().unwrap();
        let parent = root.path().join("dd-supervisor");
        fs::create_dir_all(parent.join("svc")).unwrap();
        let l = CgroupLimiter {
            name: "svc".into(),
            path: parent.join("svc"),
        };
        l.release();
        assert!(!parent.join("svc").exists());
    }
}
