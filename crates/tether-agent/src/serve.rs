//! Request loop over one established controller stream.

use std::sync::Arc;

use tether_core::error::RemoteErrorKind;
use tether_executor::Handlers;
use tether_transport::{Envelope, FrameReader, FrameWriter, Request, Response, WireError};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinSet,
};

/// Why serving a connection stopped.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] WireError),
    #[error("Writer task stopped unexpectedly")]
    WriterStopped,
}

type Outbound = mpsc::UnboundedSender<Envelope<Response>>;

/// Serve controller requests until the stream fails or the controller asks
/// the agent to shut down.
///
/// Ping is answered inline; every other request runs on its own task so a
/// long command never stalls the read loop. All replies go through a single
/// writer task.
///
/// # Errors
/// Returns error on any read or write failure, including the controller
/// closing the stream without a `Shutdown`. `Ok(())` means a clean shutdown.
pub async fn serve<S>(stream: S, handlers: Arc<Handlers>) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FrameReader::new(reader);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut writer_task = tokio::spawn(write_loop(FrameWriter::new(writer), rx));
    let mut jobs = JoinSet::new();

    let result = loop {
        tokio::select! {
            frame = frames.next::<Envelope<Request>>() => match frame {
                Ok(Envelope { id, body: Request::Ping }) => {
                    reply(&tx, id, Response::Pong);
                }
                Ok(Envelope { id, body: Request::Shutdown }) => {
                    tracing::info!("Controller requested shutdown");
                    reply(&tx, id, Response::Ack);
                    break Ok(());
                }
                Ok(Envelope { id, body }) => {
                    tracing::debug!(request = id, kind = %body.kind(), "Dispatching request");
                    let handlers = Arc::clone(&handlers);
                    let tx = tx.clone();
                    jobs.spawn(async move {
                        let response = handlers.dispatch(body).await;
                        reply(&tx, id, response);
                    });
                }
                Err(WireError::InvalidBody { id, reason }) => {
                    tracing::warn!(request = id, "Undecodable request: {reason}");
                    reply(&tx, id, Response::error(RemoteErrorKind::Protocol, reason));
                }
                Err(WireError::Malformed(e)) => {
                    // No id to answer to; the controller fails whatever it
                    // is waiting for.
                    tracing::warn!("Malformed request: {e}");
                    reply(&tx, 0, Response::error(RemoteErrorKind::Protocol, e));
                }
                Err(e) => break Err(AgentError::Transport(e)),
            },
            written = &mut writer_task => {
                break Err(match written {
                    Ok(Err(e)) => AgentError::Transport(e),
                    _ => AgentError::WriterStopped,
                });
            }
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!("Request handler panicked: {e}");
                    }
                }
            }
        }
    };

    match result {
        Ok(()) => {
            // Running jobs are abandoned; the ack must still reach the wire.
            jobs.shutdown().await;
            drop(tx);
            match writer_task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AgentError::Transport(e)),
                Err(_) => Err(AgentError::WriterStopped),
            }
        }
        Err(e) => {
            writer_task.abort();
            Err(e)
        }
    }
}

fn reply(tx: &Outbound, id: u64, response: Response) {
    if tx.send(Envelope::new(id, response)).is_err() {
        tracing::debug!(request = id, "Dropping reply, writer is gone");
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Envelope<Response>>,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.send(&frame).await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tether_executor::{ExecError, Handler};
    use tether_transport::{RequestKind, SystemInfo};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::Notify;

    /// Run handler that waits for a signal before answering.
    struct Gated(Arc<Notify>);

    #[async_trait]
    impl Handler for Gated {
        fn kind(&self) -> RequestKind {
            RequestKind::RunCommand
        }

        async fn handle(&self, request: Request) -> Result<Response, ExecError> {
            self.0.notified().await;
            let Request::RunCommand { command, .. } = request else {
                unreachable!();
            };
            Ok(Response::output(command.as_bytes(), Some(0)))
        }
    }

    struct Info;

    #[async_trait]
    impl Handler for Info {
        fn kind(&self) -> RequestKind {
            RequestKind::SystemInfo
        }

        async fn handle(&self, _request: Request) -> Result<Response, ExecError> {
            Ok(Response::SystemInfo {
                info: SystemInfo {
                    hostname: Some("agent".into()),
                    ..SystemInfo::default()
                },
            })
        }
    }

    struct Controller {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Controller {
        async fn send(&mut self, id: u64, request: Request) {
            self.writer.send(&Envelope::new(id, request)).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope<Response> {
            self.reader.next().await.unwrap()
        }
    }

    fn start(handlers: Handlers) -> (Controller, tokio::task::JoinHandle<Result<(), AgentError>>) {
        let (agent_end, controller_end) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve(agent_end, Arc::new(handlers)));
        let (reader, writer) = tokio::io::split(controller_end);
        (
            Controller {
                reader: FrameReader::new(reader),
                writer: FrameWriter::new(writer),
            },
            task,
        )
    }

    #[tokio::test]
    async fn long_command_does_not_block_reads() {
        let gate = Arc::new(Notify::new());
        let mut handlers = Handlers::new();
        handlers.register(Arc::new(Gated(Arc::clone(&gate)))).unwrap();
        handlers.register(Arc::new(Info)).unwrap();
        let (mut controller, _task) = start(handlers);

        controller
            .send(
                1,
                Request::RunCommand {
                    command: "slow".into(),
                    args: vec![],
                    background: true,
                },
            )
            .await;
        controller.send(2, Request::Ping).await;
        controller.send(3, Request::SystemInfo).await;

        assert_eq!(controller.recv().await, Envelope::new(2, Response::Pong));
        let info = controller.recv().await;
        assert_eq!(info.id, 3);
        assert!(matches!(info.body, Response::SystemInfo { .. }));

        gate.notify_one();
        let output = controller.recv().await;
        assert_eq!(output.id, 1);
        assert_eq!(output.body.decode_output().unwrap(), "slow");
    }

    #[tokio::test]
    async fn shutdown_acks_and_ends_cleanly() {
        let (mut controller, task) = start(Handlers::new());
        controller.send(7, Request::Shutdown).await;
        assert_eq!(controller.recv().await, Envelope::new(7, Response::Ack));
        assert!(task.await.unwrap().is_ok());
        assert!(controller.reader.next::<Envelope<Response>>().await.is_err());
    }

    #[tokio::test]
    async fn closed_stream_is_a_failure() {
        let (controller, task) = start(Handlers::new());
        drop(controller);
        assert!(matches!(
            task.await.unwrap(),
            Err(AgentError::Transport(WireError::Closed))
        ));
    }

    #[tokio::test]
    async fn bad_input_is_reported_back() {
        let (agent_end, controller_end) = tokio::io::duplex(4096);
        let _task = tokio::spawn(serve(agent_end, Arc::new(Handlers::new())));
        let (reader, mut writer) = tokio::io::split(controller_end);
        let mut reader = FrameReader::new(reader);

        writer.write_all(b"{\"id\":1,\"body\":{\"type\":\"launch\"}}\n").await.unwrap();
        let reply: Envelope<Response> = reader.next().await.unwrap();
        assert_eq!(reply.id, 1);
        assert!(matches!(
            reply.body,
            Response::Error {
                kind: RemoteErrorKind::Protocol,
                ..
            }
        ));

        writer.write_all(b"launch everything\n").await.unwrap();
        let reply: Envelope<Response> = reader.next().await.unwrap();
        assert_eq!(reply.id, 0);
        assert!(matches!(
            reply.body,
            Response::Error {
                kind: RemoteErrorKind::Protocol,
                ..
            }
        ));

        let json = b"{\"id\":2,\"body\":{\"type\":\"download_execute\",\"url\":\"http://x/\"}}\n";
        writer.write_all(json).await.unwrap();
        let reply: Envelope<Response> = reader.next().await.unwrap();
        assert_eq!(reply.id, 2);
        assert!(matches!(
            reply.body,
            Response::Error {
                kind: RemoteErrorKind::Unsupported,
                ..
            }
        ));
    }
}
