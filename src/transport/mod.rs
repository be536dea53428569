//! HTTP link to a Meshtastic device.
//!
//! The device's HTTP API is poll-only: `GET /api/v1/fromradio` returns at most one
//! `FromRadio` frame (empty body when nothing is queued) and `PUT /api/v1/toradio`
//! accepts one `ToRadio` frame. [`HttpTransport`] runs the poll loop on a tokio
//! task and turns it into an ordered stream of [`DeviceOutput`] events.
//!
//! Status events are deduplicated by kind: `Disconnected("timeout")` followed by
//! `Disconnected("refused")` yields one event. The stream ends (`None`) after
//! [`HttpTransport::disconnect`] once every queued event has been consumed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::logutil::hex_snippet;
use crate::metrics;

pub const FROMRADIO_PATH: &str = "/api/v1/fromradio";
pub const TORADIO_PATH: &str = "/api/v1/toradio";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Reason attached to the final status emitted by [`HttpTransport::disconnect`].
pub const USER_DISCONNECT_REASON: &str = "user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected(Option<String>),
}

impl ConnectionStatus {
    /// Kind comparison ignoring the disconnect reason.
    pub fn same_kind(&self, other: &ConnectionStatus) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected(None) => write!(f, "disconnected"),
            ConnectionStatus::Disconnected(Some(reason)) => write!(f, "disconnected ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutput {
    Status(ConnectionStatus),
    Frame(Bytes),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("device unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out after {}ms", .after.as_millis())]
    Timeout { url: String, after: Duration },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("device answered {url} with HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("transport is closed")]
    Closed,
}

/// Outbound half of a device link.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// Applies the status dedupe rule and owns the sending half of the event channel.
struct Emitter {
    last: Mutex<ConnectionStatus>,
    tx: Mutex<Option<mpsc::UnboundedSender<DeviceOutput>>>,
}

impl Emitter {
    fn new(tx: mpsc::UnboundedSender<DeviceOutput>) -> Self {
        Self {
            last: Mutex::new(ConnectionStatus::Disconnected(None)),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Returns whether the status was emitted.
    fn status(&self, status: ConnectionStatus) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.same_kind(&status) {
            return false;
        }
        match &status {
            ConnectionStatus::Disconnected(_) => warn!("device link {}", status),
            _ => info!("device link {}", status),
        }
        *last = status.clone();
        // Push while holding `last` so status order matches emission order.
        self.push(DeviceOutput::Status(status));
        true
    }

    fn frame(&self, bytes: Bytes) {
        trace!("fromradio {} bytes: {}", bytes.len(), hex_snippet(&bytes, 32));
        self.push(DeviceOutput::Frame(bytes));
    }

    fn push(&self, event: DeviceOutput) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn last(&self) -> ConnectionStatus {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    emitter: Arc<Emitter>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<DeviceOutput>>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Probe the device once and start polling. Fails if the device cannot be reached.
    pub async fn connect(address: &str, cfg: &DeviceConfig) -> Result<Arc<Self>, TransportError> {
        let base_url = base_url(address, cfg.tls)?;
        let request_timeout = Duration::from_millis(cfg.request_timeout_ms.max(1));
        let poll_interval = Duration::from_millis(cfg.poll_interval_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(TransportError::Client)?;

        let probe_url = format!("{}{}", base_url, FROMRADIO_PATH);
        debug!("probing {}", probe_url);
        let resp = client
            .get(&probe_url)
            .header(reqwest::header::ACCEPT, PROTOBUF_CONTENT_TYPE)
            .send()
            .await
            .map_err(|source| TransportError::Unreachable {
                url: probe_url.clone(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(TransportError::HttpStatus {
                url: probe_url,
                status: resp.status().as_u16(),
            });
        }
        let probe_body = resp
            .bytes()
            .await
            .map_err(|source| TransportError::Unreachable {
                url: probe_url.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(Emitter::new(tx));
        emitter.status(ConnectionStatus::Connecting);
        if !probe_body.is_empty() {
            emitter.frame(probe_body);
        }

        let cancel = CancellationToken::new();
        let poll = PollLoop {
            client: client.clone(),
            url: format!("{}{}?all=false", base_url, FROMRADIO_PATH),
            request_timeout,
            interval: poll_interval,
            drain_queue: cfg.drain_queue,
            emitter: Arc::clone(&emitter),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(poll.run());
        info!(
            "polling {} every {}ms",
            base_url,
            poll_interval.as_millis()
        );

        Ok(Arc::new(Self {
            client,
            base_url,
            request_timeout,
            emitter,
            events: tokio::sync::Mutex::new(rx),
            cancel,
            poll_task: Mutex::new(Some(handle)),
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Next event, in emission order. `None` once the transport is closed and drained.
    pub async fn next_event(&self) -> Option<DeviceOutput> {
        self.events.lock().await.recv().await
    }

    /// Last status emitted.
    pub fn status(&self) -> ConnectionStatus {
        self.emitter.last()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// PUT one `ToRadio` frame. Failures are returned to the caller and do not
    /// change the connection status.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let url = format!("{}{}", self.base_url, TORADIO_PATH);
        let len = frame.len();
        let result = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(frame)
            .send()
            .await
            .map_err(|e| request_error(&url, e, self.request_timeout))
            .and_then(|resp| {
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(TransportError::HttpStatus {
                        url: url.clone(),
                        status: resp.status().as_u16(),
                    })
                }
            });
        match &result {
            Ok(()) => {
                metrics::inc_frames_sent();
                debug!("toradio {} bytes sent", len);
            }
            Err(e) => {
                metrics::inc_send_failed();
                warn!("toradio send failed: {}", e);
            }
        }
        result
    }

    /// Stop polling, emit the final `Disconnected("user")` and close the stream.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let handle = self
            .poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.emitter.status(ConnectionStatus::Disconnected(Some(
            USER_DISCONNECT_REASON.to_string(),
        )));
        self.emitter.close();
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl FrameSink for HttpTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        HttpTransport::send(self, frame).await
    }
}

struct PollLoop {
    client: reqwest::Client,
    url: String,
    request_timeout: Duration,
    interval: Duration,
    drain_queue: bool,
    emitter: Arc<Emitter>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.poll_once() => r,
            };
            let mut poll_again_now = false;
            match outcome {
                Ok(body) => {
                    metrics::inc_polls_ok();
                    self.emitter.status(ConnectionStatus::Connected);
                    if !body.is_empty() {
                        self.emitter.frame(body);
                        poll_again_now = self.drain_queue;
                    }
                }
                Err(e) => {
                    metrics::inc_polls_failed();
                    debug!("poll failed: {}", e);
                    self.emitter
                        .status(ConnectionStatus::Disconnected(Some(e.to_string())));
                }
            }
            if poll_again_now {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("poll loop stopped");
    }

    async fn poll_once(&self) -> Result<Bytes, TransportError> {
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, PROTOBUF_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| request_error(&self.url, e, self.request_timeout))?;
        if !resp.status().is_success() {
            return Err(TransportError::HttpStatus {
                url: self.url.clone(),
                status: resp.status().as_u16(),
            });
        }
        resp.bytes()
            .await
            .map_err(|e| request_error(&self.url, e, self.request_timeout))
    }
}

fn request_error(url: &str, e: reqwest::Error, after: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
            after,
        }
    } else {
        TransportError::Request {
            url: url.to_string(),
            source: e,
        }
    }
}

/// `meshtastic.local` → `http://meshtastic.local`; explicit schemes are kept.
pub fn base_url(address: &str, tls: bool) -> Result<String, TransportError> {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", if tls { "https" } else { "http" }, trimmed)
    };
    let parsed = reqwest::Url::parse(&candidate)
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
    if parsed.host_str().is_none() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(candidate)
}
