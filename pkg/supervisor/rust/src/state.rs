// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ServiceState {
    /// Initial, and terminal for one guard-loop lifetime.
    Stopped = 0,
    /// Launch requested, loop not yet confirmed.
    Starting = 1,
    /// Child process is alive and guarded.
    Running = 2,
    /// Stop requested, waiting for the loop to wind down.
    Stopping = 3,
}

impl ServiceState {
    /// Stopping or Stopped: the guard loop must not restart anything.
    pub fn is_winding_down(self) -> bool {
        matches!(self, ServiceState::Stopping | ServiceState::Stopped)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }

    /// Parse the state string a peer reports over its status socket.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stopped" => Some(ServiceState::Stopped),
            "starting" => Some(ServiceState::Starting),
            "running" => Some(ServiceState::Running),
            "stopping" => Some(ServiceState::Stopping),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Lock-free state cell shared between a guard loop and its Start/Stop callers.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: ServiceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Returns true when the swap happened.
    pub fn compare_and_swap(&self, current: ServiceState, new: ServiceState) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for AtomicState {
    fn default() -> Self {
        Self::new(ServiceState::Stopped)
    }
}
