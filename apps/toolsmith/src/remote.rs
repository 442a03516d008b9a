//! # HTTP Mirror
//!
//! Client side of the networked tool memory. [`HttpMirror`] implements the
//! core [`Mirror`] trait by queueing writes to a single background task on
//! the tokio runtime, which sends them in order:
//!
//! - `PUT /records/{hash}` with the full [`MemoryRecord`]
//! - `POST /edges` with the [`RelationEdge`]
//! - `PUT /notes/{hash}` with the full [`MemoryNote`]
//!
//! Publishing never blocks the caller. Failed requests are logged and
//! counted; the local store stays authoritative.

use reqwest::StatusCode;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use toolsmith_core::{MemoryNote, MemoryRecord, Mirror, RelationEdge, ToolsmithError};
use tracing::{debug, warn};

/// One queued write.
#[derive(Debug)]
enum MirrorWrite {
    Record(MemoryRecord),
    Edge(RelationEdge),
    Note(MemoryNote),
}

/// Everything the background task needs to send a request.
#[derive(Clone)]
struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteClient {
    /// Build a request with optional Bearer auth.
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn send(&self, write: &MirrorWrite) -> Result<(), ToolsmithError> {
        let req = match write {
            MirrorWrite::Record(record) => self
                .request(reqwest::Method::PUT, &format!("/records/{}", record.hash))
                .json(record),
            MirrorWrite::Edge(edge) => self.request(reqwest::Method::POST, "/edges").json(edge),
            MirrorWrite::Note(note) => self
                .request(reqwest::Method::PUT, &format!("/notes/{}", note.hash))
                .json(note),
        };
        let resp = req
            .send()
            .await
            .map_err(|e| ToolsmithError::Mirror(format!("cannot reach {}: {e}", self.base_url)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = match status {
            StatusCode::UNAUTHORIZED => "unauthorized: invalid or missing api key".to_string(),
            StatusCode::FORBIDDEN => "forbidden: api key does not grant writes".to_string(),
            StatusCode::TOO_MANY_REQUESTS => "rate limited".to_string(),
            _ => resp.text().await.unwrap_or_default(),
        };
        Err(ToolsmithError::Mirror(format!("{status}: {reason}")))
    }
}

// =============================================================================
// HTTP MIRROR
// =============================================================================

/// Best-effort replica writer for a memory server.
pub struct HttpMirror {
    base_url: String,
    handle: Handle,
    queue: Mutex<Option<mpsc::UnboundedSender<MirrorWrite>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicU64>,
}

impl std::fmt::Debug for HttpMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMirror")
            .field("base_url", &self.base_url)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HttpMirror {
    /// Start a mirror for the server at `base_url`.
    ///
    /// The background task runs on `handle`; `timeout` bounds each request.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        handle: Handle,
    ) -> Result<Self, ToolsmithError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolsmithError::Mirror(format!("cannot build http client: {e}")))?;
        let client = RemoteClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        };

        let failures = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = handle.spawn(run_worker(client.clone(), rx, Arc::clone(&failures)));

        Ok(Self {
            base_url: client.base_url,
            handle,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            failures,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn enqueue(&self, write: MirrorWrite) -> Result<(), ToolsmithError> {
        let queue = self
            .queue
            .lock()
            .map_err(|_| ToolsmithError::Mirror("mirror queue poisoned".to_string()))?;
        let Some(tx) = queue.as_ref() else {
            return Err(ToolsmithError::Mirror("mirror already flushed".to_string()));
        };
        tx.send(write)
            .map_err(|_| ToolsmithError::Mirror("mirror worker stopped".to_string()))
    }
}

async fn run_worker(
    client: RemoteClient,
    mut rx: mpsc::UnboundedReceiver<MirrorWrite>,
    failures: Arc<AtomicU64>,
) {
    while let Some(write) = rx.recv().await {
        match client.send(&write).await {
            Ok(()) => debug!(url = %client.base_url, "mirror write delivered"),
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(url = %client.base_url, error = %e, "mirror write failed");
            }
        }
    }
}

impl Mirror for HttpMirror {
    fn name(&self) -> &str {
        "http"
    }

    fn publish_record(&self, record: &MemoryRecord) -> Result<(), ToolsmithError> {
        self.enqueue(MirrorWrite::Record(record.clone()))
    }

    fn publish_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError> {
        self.enqueue(MirrorWrite::Edge(edge.clone()))
    }

    fn publish_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError> {
        self.enqueue(MirrorWrite::Note(note.clone()))
    }

    /// Close the queue and wait for queued writes.
    ///
    /// Must be called from outside async code (a blocking-pool thread or a
    /// plain thread), since it blocks on the runtime.
    fn flush(&self, timeout: Duration) -> Result<(), ToolsmithError> {
        // dropping the sender ends the worker loop once the queue drains
        drop(
            self.queue
                .lock()
                .map_err(|_| ToolsmithError::Mirror("mirror queue poisoned".to_string()))?
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .map_err(|_| ToolsmithError::Mirror("mirror worker poisoned".to_string()))?
            .take();
        let Some(mut worker) = worker else {
            return Ok(());
        };

        let finished = self
            .handle
            .block_on(async { tokio::time::timeout(timeout, &mut worker).await });
        match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ToolsmithError::Mirror(format!("mirror worker failed: {e}"))),
            Err(_) => {
                worker.abort();
                Err(ToolsmithError::Mirror(format!(
                    "mirror writes still pending after {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
