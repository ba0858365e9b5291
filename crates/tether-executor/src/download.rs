//! Download-and-execute handler.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tether_transport::{Request, RequestKind, Response};
use tokio::process::Command;
use uuid::Uuid;

use crate::{ExecError, Handler};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetches a resource over HTTP(S), stores it as an executable file and
/// starts it without waiting for it to exit.
#[derive(Debug, Clone)]
pub struct DownloadHandler {
    client: reqwest::Client,
    dir: PathBuf,
}

impl Default for DownloadHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadHandler {
    /// Handler storing downloads in the system temp directory.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dir(std::env::temp_dir())
    }

    /// Handler storing downloads in `dir`.
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            dir: dir.into(),
        }
    }

    async fn fetch(&self, url: &str) -> Result<PathBuf, ExecError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExecError::Download(format!("{url}: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ExecError::Download(format!("{url}: {e}")))?;

        let path = self.dir.join(file_name_for(url));
        tokio::fs::write(&path, &body).await?;
        make_executable(&path).await?;
        tracing::info!(url, path = %path.display(), bytes = body.len(), "Downloaded resource");
        Ok(path)
    }

    async fn download_execute(&self, url: &str, args: Vec<String>) -> Result<Response, ExecError> {
        let path = self.fetch(url).await?;
        // The path goes to the OS as-is; no shell or word splitting.
        let child = Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecError::SpawnFailed(format!("{}: {e}", path.display())))?;

        let pid = child.id();
        tracing::info!(?pid, program = %path.display(), "Started downloaded resource");
        Ok(Response::Started { pid })
    }
}

/// Unique local file name, keeping the extension of the URL's last segment
/// so platforms that dispatch on extension still run it.
fn file_name_for(url: &str) -> String {
    let last = url
        .split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .unwrap_or_default();
    let extension = Path::new(last)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("tether-{}.{ext}", Uuid::new_v4()),
        None => format!("tether-{}", Uuid::new_v4()),
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl Handler for DownloadHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::DownloadExecute
    }

    async fn handle(&self, request: Request) -> Result<Response, ExecError> {
        match request {
            Request::DownloadExecute { url, args } => self.download_execute(&url, args).await,
            other => Err(ExecError::WrongRequest {
                expected: RequestKind::DownloadExecute,
                actual: other.kind(),
            }),
        }
    }
}
