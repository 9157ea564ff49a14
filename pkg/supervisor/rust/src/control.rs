// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Local status channel: HTTP/1.1 over a Unix socket. Every agent process
//! serves `GET /status` on `<run>/<name>.<pid>.sock`; the supervisor serves the
//! same endpoint and queries its services' sockets.

use crate::errors::{Error, Result};
use anyhow::{Context, anyhow, bail};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs::Permissions;
use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

static NOTFOUND: &[u8] = b"Not found";

/// Minimal body every peer answers `GET /status` with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub state: String,
    pub pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
}

/// Produces the JSON document served on `GET /status`.
pub trait StatusSource: Send + Sync + 'static {
    fn status_json(&self) -> impl Future<Output = serde_json::Value> + Send;
}

pub struct ControlListener {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ControlListener {
    /// Stop accepting connections and remove the socket file.
    pub fn close(self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            error!("failed to remove socket {}: {e}", self.path.display());
        }
    }
}

fn bind(path: &Path) -> Result<UnixListener> {
    std::fs::remove_file(path)
        .or_else(|e| {
            if e.kind() == ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })
        .map_err(|e| Error::io(format!("removing existing socket {}", path.display()), e))?;

    let sock = UnixListener::bind(path)
        .map_err(|e| Error::io(format!("binding {}", path.display()), e))?;
    std::fs::set_permissions(path, Permissions::from_mode(0o660))
        .map_err(|e| Error::io(format!("setting permissions on {}", path.display()), e))?;
    Ok(sock)
}

/// Serve `GET /status` from `source` on `path` until the listener is closed.
/// Must be called from within a tokio runtime.
pub fn serve<S: StatusSource>(path: &Path, source: Arc<S>) -> Result<ControlListener> {
    let sock = bind(path)?;
    info!("serving status on {}", path.display());

    let task = tokio::spawn(async move {
        loop {
            let stream = match sock.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("failed to accept control connection: {e}");
                    continue;
                }
            };
            let source = source.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let source = source.clone();
                    async move { Ok::<_, hyper::Error>(handle_request(req, source).await) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("control connection failed: {err:?}");
                }
            });
        }
    });

    Ok(ControlListener {
        path: path.to_path_buf(),
        task,
    })
}

async fn handle_request<S: StatusSource>(
    req: Request<hyper::body::Incoming>,
    source: Arc<S>,
) -> Response<BoxBody<Bytes, std::io::Error>> {
    if req.method() != Method::GET || req.uri().path() != "/status" {
        debug!(
            "{} Request to unknown endpoint: {}",
            req.method(),
            req.uri().path()
        );
        return respond(StatusCode::NOT_FOUND, NOTFOUND.to_vec(), false);
    }
    let body = serde_json::to_vec(&source.status_json().await).unwrap_or_else(|e| {
        error!("Failed to serialize response: {e}");
        b"{}".to_vec()
    });
    respond(StatusCode::OK, body, true)
}

fn respond(status: StatusCode, body: Vec<u8>, json: bool) -> Response<BoxBody<Bytes, std::io::Error>> {
    let mut res = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *res.status_mut() = status;
    if json {
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    res
}

/// Ask the process behind `path` for its status.
pub async fn query_status(path: &Path, timeout: Duration) -> anyhow::Result<PeerStatus> {
    tokio::time::timeout(timeout, fetch_status(path))
        .await
        .map_err(|_| anyhow!("no answer from {} within {timeout:?}", path.display()))?
}

async fn fetch_status(path: &Path) -> anyhow::Result<PeerStatus> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connecting to {}", path.display()))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("HTTP handshake")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("status connection closed: {e}");
        }
    });

    let req = Request::builder()
        .method(Method::GET)
        .uri("/status")
        .header(HOST, "localhost")
        .body(Empty::<Bytes>::new())?;
    let res = sender.send_request(req).await.context("sending request")?;
    if !res.status().is_success() {
        bail!("{} answered {}", path.display(), res.status());
    }
    let body = res.into_body().collect().await?.to_bytes();
    serde_json::from_slice(&body).context("decoding status")
}
