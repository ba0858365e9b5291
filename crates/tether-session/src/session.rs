//! One agent connection as seen by the controller.

use std::{
    collections::HashMap,
    sync::{
        Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use tether_core::{JobId, SessionId};
use tether_transport::{Envelope, FrameWriter, Request, RequestId, Response, WireError};
use tokio::{
    io::AsyncWrite,
    sync::{Mutex, oneshot, watch},
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session-level failure, mapped to `CommandError` by the controller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] WireError),
    #[error("Connection closed before a reply arrived")]
    Closed,
    #[error("Bad reply: {0}")]
    Protocol(String),
    #[error("No reply within {0:?}")]
    TimedOut(Duration),
}

/// A decoded reply, or why the frame carrying it could not be decoded.
pub type Reply = Result<Response, String>;

/// Where an incoming reply belongs.
#[derive(Debug)]
pub enum Dispatched {
    /// Delivered to a waiting foreground caller.
    Foreground,
    /// Result of a background job.
    Background { job: JobId, reply: Reply },
    /// Nobody is waiting for this id.
    Uncorrelated(RequestId),
}

/// One live agent connection.
///
/// The session owns the write half of the stream; the read half lives in the
/// controller's reader task, which feeds replies back through
/// [`Session::dispatch`].
pub struct Session {
    id: SessionId,
    peer: Option<String>,
    connected_at: SystemTime,
    connected: AtomicBool,
    writer: Mutex<Option<FrameWriter<BoxedWriter>>>,
    /// Held for the whole request/reply exchange of a foreground call.
    /// Tokio's mutex is fair, so queued callers run in FIFO order.
    foreground: Mutex<()>,
    pending: StdMutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    jobs: StdMutex<HashMap<RequestId, JobId>>,
    next_request: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Create a connected session around the write half of a stream.
    #[must_use]
    pub fn new<W>(id: SessionId, peer: Option<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            peer,
            connected_at: SystemTime::now(),
            connected: AtomicBool::new(true),
            writer: Mutex::new(Some(FrameWriter::new(Box::new(writer)))),
            foreground: Mutex::new(()),
            pending: StdMutex::new(HashMap::new()),
            jobs: StdMutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            closed,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address, if known.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    #[must_use]
    pub const fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of background jobs still waiting for a reply.
    #[must_use]
    pub fn outstanding_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Flip `connected` to false. Returns true only for the call that did
    /// the flip; later calls are no-ops.
    ///
    /// Waiting foreground callers are released with `Closed` and the reader
    /// task is told to stop.
    pub(crate) fn mark_disconnected(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.closed.send_replace(true);
        true
    }

    /// Receiver that flips to `true` once the session is disconnected.
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Take every outstanding background job. Used once the stream is gone
    /// so each job can be reported as lost.
    pub(crate) fn take_jobs(&self) -> Vec<JobId> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, job)| job)
            .collect()
    }

    /// Fail the waiting foreground call, if any, with a protocol error.
    ///
    /// Used when a frame arrives that cannot be matched to a request id.
    /// Only one foreground request is ever in flight, so that is the call
    /// the frame belonged to unless it was a background reply.
    pub(crate) fn fail_foreground(&self, reason: &str) -> bool {
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let failed = !waiters.is_empty();
        for (_, tx) in waiters {
            let _ = tx.send(Err(reason.to_string()));
        }
        failed
    }

    /// Shut down and drop the write half.
    pub(crate) async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(session = self.id, "Writer shutdown failed: {e}");
            }
        }
    }

    fn next_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, id: RequestId, request: Request) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        writer.send(&Envelope::new(id, request)).await?;
        Ok(())
    }

    /// Issue a foreground request and wait for its correlated reply.
    ///
    /// At most one foreground request is outstanding per session; later
    /// callers queue behind it.
    ///
    /// # Errors
    /// `NotConnected` if the session is already down, `Transport` if the
    /// write fails, `Closed` if the stream dies while waiting, `Protocol`
    /// if the reply cannot be decoded, `TimedOut` if `timeout` elapses
    /// first.
    pub async fn call(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, SessionError> {
        let _turn = self.foreground.lock().await;

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        // Checked after inserting so a concurrent disconnect either sees
        // our entry and drops it, or we see its flag.
        if !self.is_connected() {
            self.forget(id);
            return Err(SessionError::NotConnected);
        }

        if let Err(e) = self.send(id, request).await {
            self.forget(id);
            return Err(e);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(id);
                    return Err(SessionError::TimedOut(limit));
                }
            },
            None => rx.await,
        };
        reply
            .map_err(|_| SessionError::Closed)?
            .map_err(SessionError::Protocol)
    }

    /// Issue a background request without waiting for the reply.
    ///
    /// # Errors
    /// `NotConnected` or `Transport` if the request could not be written.
    pub async fn send_background(&self, request: Request, job: JobId) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let id = self.next_id();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, job);
        // Same ordering as `call`: a teardown that drained jobs before our
        // insert has already flipped the flag.
        if !self.is_connected() {
            self.forget_job(id);
            return Err(SessionError::NotConnected);
        }

        if let Err(e) = self.send(id, request).await {
            self.forget_job(id);
            return Err(e);
        }
        Ok(())
    }

    fn forget_job(&self, id: RequestId) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn forget(&self, id: RequestId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Route a reply for request `id` read from the stream.
    pub fn dispatch(&self, id: RequestId, reply: Reply) -> Dispatched {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(tx) = waiter {
            // The caller may have given up (timeout); the reply is dropped.
            let _ = tx.send(reply);
            return Dispatched::Foreground;
        }

        let job = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match job {
            Some(job) => Dispatched::Background { job, reply },
            None => Dispatched::Uncorrelated(id),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_transport::FrameReader;
    use uuid::Uuid;

    #[test]
    fn disconnect_flips_once() {
        let session = Session::new(1, None, tokio::io::sink());
        assert!(session.is_connected());
        assert!(session.mark_disconnected());
        assert!(!session.mark_disconnected());
        assert!(!session.is_connected());
        assert!(*session.closed().borrow());
    }

    #[tokio::test]
    async fn call_on_disconnected_session_fails_fast() {
        let session = Session::new(1, None, tokio::io::sink());
        session.mark_disconnected();
        assert!(matches!(
            session.call(Request::Ping, None).await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            session.send_background(Request::Ping, Uuid::new_v4()).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn background_reply_is_matched_to_job() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let session = Session::new(5, None, ours);
        let job = Uuid::new_v4();
        session
            .send_background(
                Request::RunCommand {
                    command: "true".into(),
                    args: vec![],
                    background: true,
                },
                job,
            )
            .await
            .unwrap();
        assert_eq!(session.outstanding_jobs(), 1);

        let mut reader = FrameReader::new(theirs);
        let sent: Envelope<Request> = reader.next().await.unwrap();
        assert!(sent.body.is_background());

        match session.dispatch(sent.id, Ok(Response::Ack)) {
            Dispatched::Background { job: got, reply } => {
                assert_eq!(got, job);
                assert_eq!(reply, Ok(Response::Ack));
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }
        assert_eq!(session.outstanding_jobs(), 0);
        assert!(matches!(
            session.dispatch(sent.id, Ok(Response::Ack)),
            Dispatched::Uncorrelated(id) if id == sent.id
        ));
    }

    #[tokio::test]
    async fn lost_jobs_are_drained_once() {
        let session = Session::new(3, None, tokio::io::sink());
        let job = Uuid::new_v4();
        session.send_background(Request::SystemInfo, job).await.unwrap();
        assert_eq!(session.outstanding_jobs(), 1);

        assert_eq!(session.take_jobs(), vec![job]);
        assert!(session.take_jobs().is_empty());
        assert_eq!(session.outstanding_jobs(), 0);
    }

    #[tokio::test]
    async fn unreadable_reply_fails_the_waiting_call() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let session = std::sync::Arc::new(Session::new(4, None, ours));
        assert!(!session.fail_foreground("nothing waiting"));

        let caller = {
            let session = std::sync::Arc::clone(&session);
            tokio::spawn(async move { session.call(Request::Ping, None).await })
        };
        while session
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            tokio::task::yield_now().await;
        }
        assert!(session.fail_foreground("expected value at line 1"));
        match caller.await.unwrap() {
            Err(SessionError::Protocol(reason)) => assert_eq!(reason, "expected value at line 1"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn disconnect_releases_waiting_caller() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let session = std::sync::Arc::new(Session::new(2, None, ours));
        let caller = {
            let session = std::sync::Arc::clone(&session);
            tokio::spawn(async move { session.call(Request::Ping, None).await })
        };
        // Let the caller write its request and start waiting.
        while session
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            tokio::task::yield_now().await;
        }
        session.mark_disconnected();
        assert!(matches!(caller.await.unwrap(), Err(SessionError::Closed)));
    }
}
