// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{LimiterKind, ResourceLimiter};
use crate::procfs::{ProcessTable, signal_target};
use log::{debug, error, warn};
use nix::sys::signal::{self, Signal};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Polls the resident memory of the limited pid and SIGKILLs it once it goes
/// over quota. CPU is not enforced.
pub struct WatchLimiter {
    name: String,
    memory: u64,
    interval: Duration,
    table: Arc<dyn ProcessTable>,
    task: Mutex<Option<AbortHandle>>,
}

impl WatchLimiter {
    pub fn new(name: &str, memory: u64, table: Arc<dyn ProcessTable>) -> Self {
        Self::with_interval(name, memory, table, DEFAULT_INTERVAL)
    }

    pub fn with_interval(
        name: &str,
        memory: u64,
        table: Arc<dyn ProcessTable>,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            memory,
            interval,
            table,
            task: Mutex::new(None),
        }
    }

    fn replace_task(&self, task: Option<AbortHandle>) {
        if let Ok(mut current) = self.task.lock()
            && let Some(old) = std::mem::replace(&mut *current, task)
        {
            old.abort();
        }
    }
}

impl ResourceLimiter for WatchLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Watch
    }

    fn limit_pid(&self, pid: u32) {
        let Ok(rt) = Handle::try_current() else {
            warn!("[{}] no runtime to watch pid {pid} on", self.name);
            return;
        };
        let name = self.name.clone();
        let memory = self.memory;
        let table = self.table.clone();
        let period = self.interval;
        let task = rt.spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(rss) = table.rss_bytes(pid) else {
                    debug!("[{name}] pid {pid} gone, watch ends");
                    return;
                };
                if rss > memory {
                    error!(
                        "[{name}] pid {pid} uses {rss} bytes, over its {memory} byte quota, killing"
                    );
                    if let Some(target) = signal_target(pid)
                        && let Err(e) = signal::kill(target, Signal::SIGKILL)
                    {
                        warn!("[{name}] failed to kill pid {pid}: {e}");
                    }
                    return;
                }
            }
        });
        self.replace_task(Some(task.abort_handle()));
    }

    fn release(&self) {
        self.replace_task(None);
    }
}

impl Drop for WatchLimiter {
    fn drop(&mut self) {
        self.replace_task(None);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::procfs::{ProcFs, ProcessInfo};
    use tokio::process::Command;

    struct FixedRss(u64);

    impl ProcessTable for FixedRss {
        fn inspect(&self, _pid: u32) -> Option<ProcessInfo> {
            None
        }

        fn rss_bytes(&self, _pid: u32) -> Option<u64> {
            Some(self.0)
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kills_over_quota() {
        let mut child = Command::new("/bin/sleep").arg("60").spawn().unwrap();
        let pid = child.id().unwrap();
        let l = WatchLimiter::with_interval("svc", 1, Arc::new(ProcFs), Duration::from_millis(50));
        l.limit_pid(pid);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("watch limiter did not kill the process")
            .unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_under_quota_survives_and_release_stops_watch() {
        let mut child = Command::new("/bin/sleep").arg("60").spawn().unwrap();
        let pid = child.id().unwrap();
        let l = WatchLimiter::with_interval(
            "svc",
            u64::MAX,
            Arc::new(FixedRss(1024)),
            Duration::from_millis(20),
        );
        l.limit_pid(pid);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(child.try_wait().unwrap().is_none());

        l.release();
        assert!(l.task.lock().unwrap().is_none());
        child.kill().await.unwrap();
    }
}
