// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification handed to whatever control surface sits on top of
/// the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Already started / not running. Returned, never fatal.
    Precondition,
    NotFound,
    /// Process launch or I/O failure.
    Internal,
    /// A wait ran out of time; the caller decides what happens next.
    DeadlineExceeded,
    /// The guard gave up on its service. Siblings are unaffected.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} already started")]
    AlreadyStarted(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{what} still running after {after:?}")]
    DeadlineExceeded { what: String, after: Duration },

    #[error("{name} exited too quickly {count} times in a row, giving up")]
    QuickExitLimit { name: String, count: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyStarted(_) | Error::NotRunning(_) | Error::Config(_) => {
                ErrorKind::Precondition
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Launch { .. } | Error::Io { .. } => ErrorKind::Internal,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::QuickExitLimit { .. } => ErrorKind::Fatal,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
