//! Broadcast + history log for background command output.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{CommandError, JobId, SessionId};

/// Default history size limit (4 MB).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Fixed per-entry overhead counted against the history budget.
const ENTRY_OVERHEAD: usize = 64;

/// Result of one background job, attributed to the session that ran it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundOutput {
    pub session: SessionId,
    pub job: JobId,
    pub result: Result<String, CommandError>,
}

impl BackgroundOutput {
    fn approx_bytes(&self) -> usize {
        let body = match &self.result {
            Ok(text) => text.len(),
            Err(e) => e.to_string().len(),
        };
        body + ENTRY_OVERHEAD
    }
}

impl fmt::Display for BackgroundOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(text) => write!(f, "[client {} job {}] {}", self.session, self.job, text.trim_end()),
            Err(e) => write!(f, "[client {} job {}] error: {e}", self.session, self.job),
        }
    }
}

#[derive(Clone)]
struct StoredOutput {
    output: BackgroundOutput,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredOutput>,
    total_bytes: usize,
}

/// Output log with broadcast and history support.
///
/// Background results arrive on session reader tasks; the console
/// subscribes here so late subscribers still see recent output.
pub struct OutputLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<BackgroundOutput>,
    limit: usize,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLog {
    /// Create a new output log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_BYTES)
    }

    /// Create an output log keeping at most `limit` bytes of history.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            limit,
        }
    }

    /// Push a result to both live listeners and history.
    pub fn push(&self, output: BackgroundOutput) {
        let _ = self.sender.send(output.clone()); // live listeners
        let bytes = output.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredOutput { output, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BackgroundOutput> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<BackgroundOutput> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.output.clone())
            .collect()
    }

    /// History for a single session.
    #[must_use]
    pub fn history_for(&self, session: SessionId) -> Vec<BackgroundOutput> {
        self.history()
            .into_iter()
            .filter(|o| o.session == session)
            .collect()
    }

    /// Stream of live updates only. Lagged receivers skip what they missed.
    #[must_use]
    pub fn live_stream(&self) -> futures::stream::BoxStream<'static, BackgroundOutput> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move {
                res.inspect_err(|e| tracing::warn!("Output listener fell behind: {e}"))
                    .ok()
            })
            .boxed()
    }

    /// Forward every live result to `sink` until the log is dropped.
    pub fn spawn_printer<F>(self: Arc<Self>, mut sink: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(BackgroundOutput) + Send + 'static,
    {
        let stream = self.live_stream();
        drop(self);
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(output) = stream.next().await {
                sink(output);
            }
        })
    }
}
