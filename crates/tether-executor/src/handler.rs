//! Request handlers and the table that dispatches to them.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tether_core::error::RemoteErrorKind;
use tether_transport::{Request, RequestKind, Response};
use thiserror::Error;

use crate::command::CommandBuildError;

/// Failure while serving one request.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Download failed: {0}")]
    Download(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command build error: {0}")]
    CommandBuild(#[from] CommandBuildError),
    #[error("Handler for {expected} received {actual} request")]
    WrongRequest {
        expected: RequestKind,
        actual: RequestKind,
    },
}

impl ExecError {
    /// Wire-level kind reported to the controller.
    #[must_use]
    pub const fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            Self::Download(_) => RemoteErrorKind::Download,
            Self::WrongRequest { .. } => RemoteErrorKind::Protocol,
            Self::SpawnFailed(_) | Self::Io(_) | Self::CommandBuild(_) => {
                RemoteErrorKind::Execution
            }
        }
    }
}

/// Handler registration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("A handler for {0} is already registered")]
    Duplicate(RequestKind),
    #[error("{0} is answered by the connection itself and cannot be registered")]
    Reserved(RequestKind),
}

/// Trait for agent-side request handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Request kind this handler serves.
    fn kind(&self) -> RequestKind;

    /// Serve one request.
    async fn handle(&self, request: Request) -> Result<Response, ExecError>;
}

/// Table of handlers keyed by request kind.
#[derive(Clone, Default)]
pub struct Handlers {
    handlers: BTreeMap<RequestKind, Arc<dyn Handler>>,
}

impl Handlers {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the shell, download-and-execute and system-info handlers.
    ///
    /// # Errors
    /// Returns error if the built-ins collide, which indicates a bug.
    pub fn builtin() -> Result<Self, HandlerError> {
        let mut handlers = Self::new();
        handlers.register(Arc::new(crate::RunHandler::new()))?;
        handlers.register(Arc::new(crate::DownloadHandler::new()))?;
        handlers.register(Arc::new(crate::SystemInfoHandler))?;
        Ok(handlers)
    }

    /// Register a handler.
    ///
    /// # Errors
    /// Returns error if the kind already has a handler or is reserved for
    /// the connection loop (`Ping`, `Shutdown`).
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<(), HandlerError> {
        let kind = handler.kind();
        if matches!(kind, RequestKind::Ping | RequestKind::Shutdown) {
            return Err(HandlerError::Reserved(kind));
        }
        if self.handlers.contains_key(&kind) {
            return Err(HandlerError::Duplicate(kind));
        }
        tracing::debug!(%kind, "Registered handler");
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Registered kinds, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<RequestKind> {
        self.handlers.keys().copied().collect()
    }

    /// Serve a request, folding failures into an error response.
    pub async fn dispatch(&self, request: Request) -> Response {
        let kind = request.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            return Response::error(
                RemoteErrorKind::Unsupported,
                format!("No handler registered for {kind}"),
            );
        };
        match handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%kind, "Request failed: {e}");
                Response::error(e.remote_kind(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(RequestKind);

    #[async_trait]
    impl Handler for Fixed {
        fn kind(&self) -> RequestKind {
            self.0
        }

        async fn handle(&self, _request: Request) -> Result<Response, ExecError> {
            Err(ExecError::SpawnFailed("nope".into()))
        }
    }

    #[test]
    fn duplicate_and_reserved_kinds_are_rejected() {
        let mut handlers = Handlers::new();
        handlers
            .register(Arc::new(Fixed(RequestKind::SystemInfo)))
            .unwrap();
        assert_eq!(
            handlers.register(Arc::new(Fixed(RequestKind::SystemInfo))),
            Err(HandlerError::Duplicate(RequestKind::SystemInfo))
        );
        assert_eq!(
            handlers.register(Arc::new(Fixed(RequestKind::Ping))),
            Err(HandlerError::Reserved(RequestKind::Ping))
        );
    }

    #[test]
    fn builtin_covers_remote_commands() {
        let handlers = Handlers::builtin().unwrap();
        assert_eq!(
            handlers.kinds(),
            vec![
                RequestKind::RunCommand,
                RequestKind::DownloadExecute,
                RequestKind::SystemInfo
            ]
        );
    }

    #[tokio::test]
    async fn dispatch_reports_failures_as_responses() {
        let mut handlers = Handlers::new();
        handlers
            .register(Arc::new(Fixed(RequestKind::SystemInfo)))
            .unwrap();

        let failed = handlers.dispatch(Request::SystemInfo).await;
        assert_eq!(
            failed,
            Response::error(RemoteErrorKind::Execution, "Spawn failed: nope")
        );

        let missing = handlers
            .dispatch(Request::DownloadExecute {
                url: "http://example.invalid/".into(),
                args: vec![],
            })
            .await;
        assert!(matches!(
            missing,
            Response::Error {
                kind: RemoteErrorKind::Unsupported,
                ..
            }
        ));
    }
}
