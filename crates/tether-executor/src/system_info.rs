//! Host/OS identity snapshot.

use async_trait::async_trait;
use sysinfo::System;
use tether_transport::{Request, RequestKind, Response, SystemInfo};

use crate::{ExecError, Handler};

/// Collect a snapshot of this host.
#[must_use]
pub fn collect() -> SystemInfo {
    let mut sys = System::new();
    sys.refresh_memory();

    SystemInfo {
        hostname: System::host_name(),
        username: std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok(),
        os_name: System::name(),
        os_version: System::os_version(),
        kernel_version: System::kernel_version(),
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::FAMILY.to_string(),
        cpu_count: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        total_memory: sys.total_memory(),
    }
}

/// Answers `SystemInfo` requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInfoHandler;

#[async_trait]
impl Handler for SystemInfoHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::SystemInfo
    }

    async fn handle(&self, request: Request) -> Result<Response, ExecError> {
        if request.kind() != RequestKind::SystemInfo {
            return Err(ExecError::WrongRequest {
                expected: RequestKind::SystemInfo,
                actual: request.kind(),
            });
        }
        let info = tokio::task::spawn_blocking(collect)
            .await
            .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;
        Ok(Response::SystemInfo { info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_platform_identity() {
        let response = SystemInfoHandler.handle(Request::SystemInfo).await.unwrap();
        let Response::SystemInfo { info } = response else {
            panic!("expected system info, got {response:?}");
        };
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert_eq!(info.family, std::env::consts::FAMILY);
        assert!(info.cpu_count >= 1);
    }
}
