//! Remote command RPC over agent sessions.

use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tether_core::{BackgroundOutput, CommandError, JobId, OutputLog, SessionId};
use tether_transport::{
    Envelope, FrameReader, Request, RequestId, Response, SystemInfo, WireError,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    Registry, Session, capture,
    session::{Dispatched, Reply, SessionError},
};

/// Pause after an accept failure that is not about a single connection,
/// such as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

/// Caller-imposed bounds on blocking requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Upper bound for `ping`.
    pub ping_timeout: Duration,
    /// Upper bound for foreground commands; `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }
}

/// Result of `run_command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Foreground command finished; its output.
    Completed(String),
    /// Background command dispatched; output will arrive on the output log.
    Detached(JobId),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(output) => f.write_str(output.trim_end()),
            Self::Detached(job) => write!(f, "started background job {job}"),
        }
    }
}

/// Controller-side entry point: accepts agents and issues commands to them.
///
/// Cheap to clone; clones share the registry and output log.
#[derive(Clone)]
pub struct Controller {
    registry: Registry,
    output: Arc<OutputLog>,
    config: ControllerConfig,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl Controller {
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            registry: Registry::new(),
            output: Arc::new(OutputLog::new()),
            config,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Log receiving background command results.
    #[must_use]
    pub const fn output(&self) -> &Arc<OutputLog> {
        &self.output
    }

    #[must_use]
    pub const fn config(&self) -> ControllerConfig {
        self.config
    }

    /// Accept agents forever. Accept errors are logged and never end the
    /// loop.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Listening for agents on {addr}");
        }
        let listener = &listener;
        self.accept_loop(move || async move {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, "Failed to set TCP_NODELAY: {e}");
            }
            Ok::<_, io::Error>((stream, peer))
        })
        .await;
    }

    async fn accept_loop<S, F, Fut>(&self, mut accept: F)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<(S, SocketAddr)>>,
    {
        loop {
            match accept().await {
                Ok((stream, peer)) => {
                    self.attach(stream, Some(peer));
                }
                Err(e) if is_per_connection(&e) => {
                    tracing::debug!("Agent connection dropped during accept: {e}");
                }
                Err(e) => {
                    tracing::warn!("Failed to accept agent: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Register a new session around an accepted stream and start its
    /// reader task.
    pub fn attach<S>(&self, stream: S, peer: Option<SocketAddr>) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let id = self.registry.allocate_id();
        let session = Arc::new(Session::new(id, peer.map(|p| p.to_string()), writer));
        if let Err(e) = self.registry.register(Arc::clone(&session)) {
            // Ids come from the registry itself, so this is unreachable in
            // practice; the stream is dropped with the session.
            tracing::error!("Failed to register session: {e}");
            return session;
        }
        tracing::info!(session = id, peer = ?peer, "Client connected");

        tokio::spawn(read_loop(
            Arc::clone(&session),
            reader,
            self.registry.clone(),
            Arc::clone(&self.output),
        ));
        session
    }

    /// Resolve an operator capture token to sessions.
    ///
    /// # Errors
    /// Returns `NoMatch` if nothing is selected.
    pub fn resolve(&self, token: &str) -> Result<Vec<Arc<Session>>, CommandError> {
        capture::resolve(&self.registry, token)
    }

    /// Measure a ping round trip.
    ///
    /// # Errors
    /// `NotConnected` if the session is unknown or drops, `TimedOut` after
    /// the configured ping timeout.
    pub async fn ping(&self, id: SessionId) -> Result<Duration, CommandError> {
        let session = self.session(id)?;
        let started = Instant::now();
        let reply = self
            .call(&session, Request::Ping, Some(self.config.ping_timeout))
            .await?;
        let elapsed = started.elapsed();
        match reply {
            Response::Pong => Ok(elapsed),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Run a command line on the agent.
    ///
    /// Foreground calls wait for the output; background calls return as soon
    /// as the request is written and their output is pushed to
    /// [`Self::output`].
    ///
    /// # Errors
    /// `NotConnected` if the session is unknown or drops, `RemoteExecution`
    /// if the agent could not run the command.
    pub async fn run_command(
        &self,
        id: SessionId,
        command: &str,
        args: &[String],
        background: bool,
    ) -> Result<RunOutcome, CommandError> {
        let session = self.session(id)?;
        let request = Request::RunCommand {
            command: command.to_string(),
            args: args.to_vec(),
            background,
        };

        if background {
            let job = Uuid::new_v4();
            session
                .send_background(request, job)
                .await
                .map_err(|e| self.fail(id, e))?;
            tracing::debug!(session = id, %job, "Dispatched background command");
            return Ok(RunOutcome::Detached(job));
        }

        let reply = self
            .call(&session, request, self.config.command_timeout)
            .await?;
        into_output(reply).map(RunOutcome::Completed)
    }

    /// Ask the agent to fetch `url` and execute it with `args`.
    ///
    /// # Errors
    /// `RemoteExecution` carrying the agent's cause if the fetch or start
    /// failed; `NotConnected` if the session drops.
    pub async fn download_execute(
        &self,
        id: SessionId,
        url: &str,
        args: &[String],
    ) -> Result<String, CommandError> {
        let session = self.session(id)?;
        let request = Request::DownloadExecute {
            url: url.to_string(),
            args: args.to_vec(),
        };
        let reply = self
            .call(&session, request, self.config.command_timeout)
            .await?;
        into_output(reply)
    }

    /// Fetch the agent's host/OS snapshot.
    ///
    /// # Errors
    /// `NotConnected` if the session drops; the agent's error otherwise.
    pub async fn system_info(&self, id: SessionId) -> Result<SystemInfo, CommandError> {
        let session = self.session(id)?;
        let reply = self
            .call(&session, Request::SystemInfo, self.config.command_timeout)
            .await?;
        match reply {
            Response::SystemInfo { info } => Ok(info),
            Response::Error { kind, message } => Err(CommandError::from_remote(kind, message)),
            other => Err(unexpected("system_info", &other)),
        }
    }

    /// Tell the agent to shut down for good, then drop the session.
    ///
    /// # Errors
    /// `NotConnected` if the session is already gone.
    pub async fn disconnect(&self, id: SessionId) -> Result<(), CommandError> {
        let session = self.session(id)?;
        let reply = self
            .call(&session, Request::Shutdown, Some(self.config.ping_timeout))
            .await;
        self.registry.mark_disconnected(id);
        match reply {
            Ok(Response::Ack) => Ok(()),
            Ok(other) => Err(unexpected("shutdown", &other)),
            Err(e) => Err(e),
        }
    }

    /// Look up a session that can still take requests.
    fn session(&self, id: SessionId) -> Result<Arc<Session>, CommandError> {
        let session = self
            .registry
            .lookup(id)
            .map_err(|_| CommandError::NotConnected(id))?;
        if session.is_connected() {
            Ok(session)
        } else {
            Err(CommandError::NotConnected(id))
        }
    }

    async fn call(
        &self,
        session: &Session,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, CommandError> {
        session
            .call(request, timeout)
            .await
            .map_err(|e| self.fail(session.id(), e))
    }

    /// Fold a session error into the operator taxonomy, flagging the
    /// session when the stream is gone.
    fn fail(&self, id: SessionId, err: SessionError) -> CommandError {
        match err {
            SessionError::TimedOut(limit) => CommandError::TimedOut(limit),
            SessionError::Protocol(reason) => {
                tracing::warn!(session = id, "Bad reply: {reason}");
                CommandError::Protocol(reason)
            }
            SessionError::NotConnected | SessionError::Closed => {
                self.registry.mark_disconnected(id);
                CommandError::NotConnected(id)
            }
            SessionError::Transport(e) => {
                tracing::warn!(session = id, "Request failed: {e}");
                self.registry.mark_disconnected(id);
                CommandError::NotConnected(id)
            }
        }
    }
}

/// Per-session reader: routes replies until the stream ends or the session
/// is flagged disconnected.
async fn read_loop<R>(
    session: Arc<Session>,
    reader: R,
    registry: Registry,
    output: Arc<OutputLog>,
) where
    R: AsyncRead + Unpin,
{
    let id = session.id();
    let mut frames = FrameReader::new(reader);
    let mut closed = session.closed();

    while !*closed.borrow_and_update() {
        tokio::select! {
            frame = frames.next::<Envelope<Response>>() => match frame {
                // Id 0 is never issued: the agent could not read one of our
                // requests.
                Ok(Envelope { id: 0, body: Response::Error { message, .. } }) => {
                    tracing::warn!(session = id, "Client rejected a request: {message}");
                    session.fail_foreground(&message);
                }
                Ok(envelope) => route(&session, &output, envelope.id, Ok(envelope.body)),
                Err(WireError::InvalidBody { id: request, reason }) => {
                    tracing::warn!(session = id, request, "Undecodable reply: {reason}");
                    route(&session, &output, request, Err(reason));
                }
                Err(WireError::Malformed(e)) => {
                    tracing::warn!(session = id, "Malformed frame from client: {e}");
                    session.fail_foreground(&e);
                }
                Err(WireError::Closed) => break,
                Err(e) => {
                    tracing::warn!(session = id, "Read failed: {e}");
                    break;
                }
            },
            _ = closed.changed() => {}
        }
    }

    registry.mark_disconnected(id);
    for job in session.take_jobs() {
        output.push(BackgroundOutput {
            session: id,
            job,
            result: Err(CommandError::NotConnected(id)),
        });
    }
    session.close_writer().await;
}

fn route(session: &Session, output: &OutputLog, request: RequestId, reply: Reply) {
    match session.dispatch(request, reply) {
        Dispatched::Foreground => {}
        Dispatched::Background { job, reply } => {
            output.push(BackgroundOutput {
                session: session.id(),
                job,
                result: reply.map_err(CommandError::Protocol).and_then(into_output),
            });
        }
        Dispatched::Uncorrelated(request) => {
            tracing::warn!(session = session.id(), request, "Dropping uncorrelated reply");
        }
    }
}

fn is_per_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

/// Render a command reply as operator text.
fn into_output(response: Response) -> Result<String, CommandError> {
    match response {
        Response::Output { exit_code, .. } => {
            let text = response
                .decode_output()
                .ok_or_else(|| CommandError::Protocol("output is not valid base64".into()))?;
            match exit_code {
                Some(0) | None => Ok(text),
                Some(code) => Ok(format!("{}\n(exit code {code})", text.trim_end())),
            }
        }
        Response::Started { pid: Some(pid) } => Ok(format!("started (pid {pid})")),
        Response::Started { pid: None } => Ok("started".to_string()),
        Response::Ack => Ok("ok".to_string()),
        Response::Pong => Ok("pong".to_string()),
        Response::SystemInfo { info } => Ok(info.to_string()),
        Response::Error { kind, message } => Err(CommandError::from_remote(kind, message)),
    }
}

fn unexpected(what: &str, reply: &Response) -> CommandError {
    CommandError::Protocol(format!("unexpected reply to {what}: {reply:?}"))
}
