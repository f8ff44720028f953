//! `wagate serve` process bookkeeping: the PID file other subcommands use to
//! find a running gateway, and the shutdown signal wait.

use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, info, warn};

/// PID of the running gateway, `~/.wagate/wagate.pid` by default.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.wagate/wagate.pid`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".wagate").join("wagate.pid")
    }

    /// Records this process as the running gateway.
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pid = std::process::id().to_string();
        tokio::fs::write(&self.path, pid).await?;
        info!("PID file written: {}", self.path.display());
        Ok(())
    }

    /// PID recorded by a gateway; stale if that process crashed.
    pub async fn read(&self) -> Option<u32> {
        tokio::fs::read_to_string(&self.path)
            .await
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Deletes the PID file, unless another gateway has since claimed it.
    pub async fn remove(&self) {
        match self.read().await {
            Some(pid) if pid == std::process::id() => {
                let _ = tokio::fs::remove_file(&self.path).await;
                info!("PID file removed: {}", self.path.display());
            }
            Some(pid) => debug!(pid, "PID file belongs to another gateway, leaving it"),
            None => {}
        }
    }
}

/// Resolves on SIGINT or SIGTERM; `serve` then begins graceful shutdown.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler ({e}), waiting for Ctrl-C only");
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                info!("Received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
        }
        info!("Received Ctrl-C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_points_to_wagate_pid() {
        let path = PidFile::default_path();
        let text = path.to_string_lossy();
        assert!(text.contains(".wagate"));
        assert!(text.ends_with("wagate.pid"));
    }

    #[tokio::test]
    async fn write_read_and_remove_pid_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("nested/wagate.pid");
        let pid_file = PidFile::new(&pid_path);
        assert_eq!(pid_file.read().await, None);

        pid_file.write().await.expect("pid write");
        assert!(pid_path.exists());
        assert_eq!(pid_file.read().await, Some(std::process::id()));

        pid_file.remove().await;
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn remove_keeps_another_gateways_pid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("wagate.pid");
        let other = std::process::id().wrapping_add(1);
        std::fs::write(&pid_path, format!("{other}\n")).expect("seed pid");

        let pid_file = PidFile::new(&pid_path);
        assert_eq!(pid_file.read().await, Some(other));
        pid_file.remove().await;
        assert!(pid_path.exists());
    }
}
