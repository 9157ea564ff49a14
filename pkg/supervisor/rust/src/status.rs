// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::limiter::LimiterKind;
use crate::state::ServiceState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    /// Launches after the first one.
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    pub limiter: LimiterKind,
    /// Whether `state` came from the service's own status socket.
    pub from_peer: bool,
}

/// A previous instance still alive but reparented to init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingService {
    pub name: String,
    pub pid: u32,
    pub pid_file: PathBuf,
    pub socket: PathBuf,
}

/// What the supervisor reports about itself and its fleet. A superset of the
/// peer status body, so peers can query a supervisor like any service.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStatus {
    pub ready: bool,
    pub state: ServiceState,
    pub pid: u32,
    pub socket: PathBuf,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub services: BTreeMap<String, ServiceStatus>,
    pub dangling: Vec<DanglingService>,
}
