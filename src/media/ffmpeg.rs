//! `ffmpeg` backed audio transcoder.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{FetchError, Transcoder, run_tool};
use crate::config::MediaConfig;

const TOOL: &str = "ffmpeg";

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            Duration::from_secs(config.command_timeout_seconds),
        )
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        codec: &str,
        bitrate: &str,
    ) -> Result<(), FetchError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y") // Overwrite output files
            .arg("-i")
            .arg(input)
            .arg("-vn") // Drop any video stream
            .arg("-acodec")
            .arg(codec)
            .arg("-b:a")
            .arg(bitrate)
            .arg(output);

        run_tool(cmd, TOOL, self.timeout).await.map(|_| ())
    }
}
