// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! CPU/memory quota enforcement. The backend is picked at runtime; every
//! failure degrades to a weaker backend instead of failing the service.

mod cgroup;
mod watch;

pub use cgroup::CgroupLimiter;
pub use watch::WatchLimiter;

use crate::config::Quota;
use crate::procfs::ProcessTable;
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterKind {
    Cgroup,
    Watch,
    Noop,
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterKind::Cgroup => write!(f, "cgroup"),
            LimiterKind::Watch => write!(f, "watch"),
            LimiterKind::Noop => write!(f, "noop"),
        }
    }
}

pub trait ResourceLimiter: Send + Sync {
    fn kind(&self) -> LimiterKind;

    /// Put `pid` under the quota. Failures are logged, never returned.
    fn limit_pid(&self, pid: u32);

    /// Drop whatever the limiter holds for its service.
    fn release(&self);
}

pub struct NoopLimiter;

impl ResourceLimiter for NoopLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Noop
    }

    fn limit_pid(&self, _pid: u32) {}

    fn release(&self) {}
}

pub fn cgroup_v2_available(root: &Path) -> bool {
    root.join("cgroup.controllers").is_file()
}

/// Pick the strongest backend that works for `quota` on this host.
pub fn build(
    name: &str,
    quota: &Quota,
    cgroup_root: &Path,
    table: Arc<dyn ProcessTable>,
) -> Box<dyn ResourceLimiter> {
    if quota.is_empty() {
        return Box::new(NoopLimiter);
    }
    if cgroup_v2_available(cgroup_root) {
        match CgroupLimiter::new(name, quota, cgroup_root) {
            Ok(l) => {
                info!("[{name}] enforcing quota with cgroup {}", l.path().display());
                return Box::new(l);
            }
            Err(e) => warn!("[{name}] cgroup limiter unavailable: {e}"),
        }
    }
    if quota.memory > 0 {
        info!(
            "[{name}] enforcing memory quota of {} bytes by polling",
            quota.memory
        );
        return Box::new(WatchLimiter::new(name, quota.memory, table));
    }
    warn!("[{name}] cpu quota cannot be enforced on this host");
    Box::new(NoopLimiter)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::procfs::ProcFs;
    use std::fs;

    fn table() -> Arc<dyn ProcessTable> {
        Arc::new(ProcFs)
    }

    #[test]
    fn test_empty_quota_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let l = build("svc", &Quota::default(), dir.path(), table());
        assert_eq!(l.kind(), LimiterKind::Noop);
    }

    #[test]
    fn test_prefers_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let quota = Quota {
            cpu: 0.5,
            memory: 1 << 20,
        };
        let l = build("svc", &quota, dir.path(), table());
        assert_eq!(l.kind(), LimiterKind::Cgroup);
    }

    #[test]
    fn test_no_cgroup_support() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Quota {
            cpu: 0.0,
            memory: 1 << 20,
        };
        let cpu_only = Quota {
            cpu: 1.0,
            memory: 0,
        };
        assert_eq!(
            build("svc", &memory, dir.path(), table()).kind(),
            LimiterKind::Watch
        );
        assert_eq!(
            build("svc", &cpu_only, dir.path(), table()).kind(),
            LimiterKind::Noop
        );
    }

    #[test]
    fn test_broken_cgroup_degrades() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        // A file where the supervisor's parent group should go.
        fs::write(dir.path().join("dd-supervisor"), "").unwrap();
        let quota = Quota {
            cpu: 0.5,
            memory: 1 << 20,
        };
        assert_eq!(
            build("svc", &quota, dir.path(), table()).kind(),
            LimiterKind::Watch
        );
        let cpu_only = Quota {
            cpu: 0.5,
            memory: 0,
        };
        assert_eq!(
            build("svc", &cpu_only, dir.path(), table()).kind(),
            LimiterKind::Noop
        );
    }

    #[test]
    fn test_noop_ignores_everything() {
        let l = NoopLimiter;
        l.limit_pid(12345);
        l.release();
        assert_eq!(l.kind().to_string(), "noop");
    }
}
