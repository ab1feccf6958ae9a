//! `yt-dlp` backed media extractor.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{FetchError, MediaExtractor, MediaMetadata, run_tool};
use crate::config::MediaConfig;

const TOOL: &str = "yt-dlp";

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: String,
    timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.ytdlp_path.clone(),
            Duration::from_secs(config.command_timeout_seconds),
        )
    }

    fn base_command(&self, egress: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-playlist").arg("--no-warnings");
        if let Some(proxy) = egress {
            cmd.arg("--proxy").arg(proxy);
        }
        cmd
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn fetch_metadata(
        &self,
        url: &str,
        egress: Option<&str>,
    ) -> Result<MediaMetadata, FetchError> {
        let mut cmd = self.base_command(egress);
        cmd.arg("--dump-single-json").arg("--skip-download").arg(url);

        let output = run_tool(cmd, TOOL, self.timeout).await?;
        let metadata: MediaMetadata = serde_json::from_slice(&output.stdout)?;

        debug!(
            content_id = %metadata.content_id,
            duration = ?metadata.duration_seconds,
            "fetched media metadata"
        );
        Ok(metadata)
    }

    async fn fetch_media(
        &self,
        url: &str,
        egress: Option<&str>,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let mut cmd = self.base_command(egress);
        cmd.arg("-f")
            .arg("bestaudio/best")
            .arg("--no-part")
            .arg("--no-progress")
            .arg("--no-continue")
            .arg("-o")
            .arg(dest)
            .arg(url);

        run_tool(cmd, TOOL, self.timeout).await.map(|_| ())
    }
}
