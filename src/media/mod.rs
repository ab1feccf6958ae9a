//! Media fetch client.
//!
//! Wraps the external extraction tool and the audio transcoder behind traits
//! and turns a video URL into a single MP3 file in the scratch directory.
//! Every scratch file created for a download is removed if the download fails.

pub mod ffmpeg;
pub mod sniff;
pub mod ytdlp;

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::MediaConfig;
use crate::egress::EgressSelection;

pub use ffmpeg::FfmpegTranscoder;
pub use sniff::Container;
pub use ytdlp::YtDlpExtractor;

/// Bytes per second of audio assumed when the remote size is unknown.
pub const BYTES_PER_SECOND_ESTIMATE: i64 = 25_000;

const STDERR_TAIL: usize = 500;

/// Remote media description as reported by the extraction tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Remote content id; deduplicates downloads
    #[serde(rename = "id")]
    pub content_id: String,
    pub title: String,
    #[serde(default, alias = "uploader")]
    pub channel: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "duration")]
    pub duration_seconds: Option<f64>,
    /// Exact size in bytes, when known
    #[serde(default)]
    pub filesize: Option<i64>,
    #[serde(default)]
    pub filesize_approx: Option<i64>,
}

/// Result of a successful download: an MP3 file in the scratch directory.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub size_bytes: i64,
    /// Container the extraction tool delivered before conversion
    pub source_container: Container,
}

impl FetchedMedia {
    /// Opens the fetched file for reading.
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status:?}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{tool} did not finish within {seconds}s")]
    Timeout { tool: &'static str, seconds: u64 },
    #[error("could not parse media metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
    #[error("download produced an empty file")]
    EmptyPayload,
    #[error("simulated download failure at retry {retry_count}")]
    Simulated { retry_count: i32 },
    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),
}

/// External tool that resolves metadata and fetches raw media.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn fetch_metadata(
        &self,
        url: &str,
        egress: Option<&str>,
    ) -> Result<MediaMetadata, FetchError>;

    /// Writes the raw media payload to `dest`.
    async fn fetch_media(
        &self,
        url: &str,
        egress: Option<&str>,
        dest: &Path,
    ) -> Result<(), FetchError>;
}

/// Converts a media file into the target audio format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        codec: &str,
        bitrate: &str,
    ) -> Result<(), FetchError>;
}

/// Estimated bytes a download will consume: exact size, else the
/// approximate size, else duration times [`BYTES_PER_SECOND_ESTIMATE`].
pub fn estimate_size_bytes(metadata: &MediaMetadata) -> i64 {
    if let Some(size) = metadata.filesize.filter(|size| *size > 0) {
        return size;
    }
    if let Some(size) = metadata.filesize_approx.filter(|size| *size > 0) {
        return size;
    }
    metadata
        .duration_seconds
        .filter(|duration| duration.is_finite() && *duration > 0.0)
        .map(|duration| (duration * BYTES_PER_SECOND_ESTIMATE as f64).ceil() as i64)
        .unwrap_or(0)
}

/// Runs an external tool to completion, mapping spawn errors, timeouts and
/// non-zero exits to [`FetchError`].
pub(crate) async fn run_tool(
    mut cmd: Command,
    tool: &'static str,
    limit: Duration,
) -> Result<Output, FetchError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|source| FetchError::Spawn { tool, source })?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(FetchError::Timeout {
                tool,
                seconds: limit.as_secs(),
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let trimmed = stderr.trim();
        let start = trimmed
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        return Err(FetchError::ToolFailed {
            tool,
            status: output.status.code(),
            stderr: trimmed[start..].to_string(),
        });
    }

    Ok(output)
}

fn remove_scratch(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed scratch file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove scratch file"),
        }
    }
}

pub struct MediaFetchClient {
    extractor: Arc<dyn MediaExtractor>,
    transcoder: Arc<dyn Transcoder>,
    scratch_dir: PathBuf,
    audio_codec: String,
    audio_bitrate: String,
    simulate_failures_below: Option<i32>,
}

impl MediaFetchClient {
    pub fn new(
        config: &MediaConfig,
        extractor: Arc<dyn MediaExtractor>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            extractor,
            transcoder,
            scratch_dir: config.scratch_dir.clone(),
            audio_codec: config.audio_codec.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
            simulate_failures_below: config.simulate_failures_below,
        }
    }

    /// Client backed by the `yt-dlp` and `ffmpeg` binaries.
    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config,
            Arc::new(YtDlpExtractor::from_config(config)),
            Arc::new(FfmpegTranscoder::from_config(config)),
        )
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    #[instrument(skip(self, egress), fields(egress = %egress.key))]
    pub async fn get_info(
        &self,
        url: &str,
        egress: &EgressSelection,
    ) -> Result<MediaMetadata, FetchError> {
        self.extractor
            .fetch_metadata(url, egress.endpoint.as_deref())
            .await
    }

    /// Downloads `url` and leaves an MP3 in the scratch directory.
    ///
    /// The raw payload is sniffed; anything that is not already MP3 is
    /// transcoded and the intermediate removed. On error every scratch file
    /// this call created is deleted before returning.
    #[instrument(
        skip(self, metadata, egress),
        fields(content_id = %metadata.content_id, egress = %egress.key)
    )]
    pub async fn download(
        &self,
        url: &str,
        metadata: &MediaMetadata,
        egress: &EgressSelection,
        retry_count: i32,
    ) -> Result<FetchedMedia, FetchError> {
        if let Some(below) = self.simulate_failures_below {
            if retry_count < below {
                warn!(retry_count, below, "simulating download failure");
                return Err(FetchError::Simulated { retry_count });
            }
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;

        let stem = format!(
            "{}-{}",
            sanitize_stem(&metadata.content_id),
            Uuid::new_v4().simple()
        );
        let raw_path = self.scratch_dir.join(format!("{stem}.download"));
        let output_path = self.scratch_dir.join(format!("{stem}.mp3"));

        let cleanup = scopeguard::guard(
            vec![raw_path.clone(), output_path.clone()],
            |paths| remove_scratch(&paths),
        );

        self.extractor
            .fetch_media(url, egress.endpoint.as_deref(), &raw_path)
            .await?;

        let raw_size = tokio::fs::metadata(&raw_path).await?.len();
        if raw_size == 0 {
            return Err(FetchError::EmptyPayload);
        }

        let container = sniff::sniff_file(&raw_path).await?;
        debug!(?container, raw_size, "raw payload downloaded");

        if container == Container::Mp3 {
            tokio::fs::rename(&raw_path, &output_path).await?;
        } else {
            self.transcoder
                .transcode(
                    &raw_path,
                    &output_path,
                    &self.audio_codec,
                    &self.audio_bitrate,
                )
                .await?;
            remove_scratch(std::slice::from_ref(&raw_path));
        }

        let size_bytes = tokio::fs::metadata(&output_path).await?.len() as i64;

        // Success: the caller owns the output file from here on.
        scopeguard::ScopeGuard::into_inner(cleanup);

        Ok(FetchedMedia {
            path: output_path,
            size_bytes,
            source_container: container,
        })
    }
}

fn sanitize_stem(content_id: &str) -> String {
    let cleaned: String = content_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "media".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct PayloadExtractor {
        payload: Vec<u8>,
    }

    #[async_trait]
    impl MediaExtractor for PayloadExtractor {
        async fn fetch_metadata(
            &self,
            _url: &str,
            _egress: Option<&str>,
        ) -> Result<MediaMetadata, FetchError> {
            Ok(metadata(None, None, Some(10.0)))
        }

        async fn fetch_media(
            &self,
            _url: &str,
            _egress: Option<&str>,
            dest: &Path,
        ) -> Result<(), FetchError> {
            tokio::fs::write(dest, &self.payload).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingTranscoder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Transcoder for CountingTranscoder {
        async fn transcode(
            &self,
            _input: &Path,
            output: &Path,
            _codec: &str,
            _bitrate: &str,
        ) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Leave a partial output behind like a crashed encoder would
            tokio::fs::write(output, b"ID3partial").await?;
            if self.fail {
                return Err(FetchError::ToolFailed {
                    tool: "ffmpeg",
                    status: Some(1),
                    stderr: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn metadata(
        filesize: Option<i64>,
        approx: Option<i64>,
        duration: Option<f64>,
    ) -> MediaMetadata {
        MediaMetadata {
            content_id: "dQw4w9WgXcQ".into(),
            title: "Song".into(),
            channel: None,
            description: None,
            duration_seconds: duration,
            filesize,
            filesize_approx: approx,
        }
    }

    fn client(
        scratch: &TempDir,
        payload: &[u8],
        transcoder: Arc<CountingTranscoder>,
        simulate: Option<i32>,
    ) -> MediaFetchClient {
        let config = MediaConfig {
            scratch_dir: scratch.path().to_path_buf(),
            simulate_failures_below: simulate,
            ..MediaConfig::default()
        };
        MediaFetchClient::new(
            &config,
            Arc::new(PayloadExtractor {
                payload: payload.to_vec(),
            }),
            transcoder,
        )
    }

    fn scratch_entries(dir: &TempDir) -> Vec<String> {
        std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn size_estimate_prefers_exact_then_approx_then_duration() {
        assert_eq!(estimate_size_bytes(&metadata(Some(10), Some(20), Some(1.0))), 10);
        assert_eq!(estimate_size_bytes(&metadata(None, Some(20), Some(1.0))), 20);
        assert_eq!(estimate_size_bytes(&metadata(None, None, Some(2.0))), 50_000);
        assert_eq!(estimate_size_bytes(&metadata(None, None, None)), 0);
    }

    #[test]
    fn metadata_parses_tool_json() {
        let json = r#"{"id":"abc","title":"T","uploader":"U","duration":12.5,"filesize_approx":100,"formats":[]}"#;
        let parsed: MediaMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content_id, "abc");
        assert_eq!(parsed.channel.as_deref(), Some("U"));
        assert_eq!(parsed.duration_seconds, Some(12.5));
        assert_eq!(parsed.filesize, None);
    }

    #[tokio::test]
    async fn mp3_payload_is_not_transcoded() {
        let scratch = TempDir::new().unwrap();
        let transcoder = Arc::new(CountingTranscoder::default());
        let client = client(&scratch, b"ID3\x04mp3-bytes", transcoder.clone(), None);

        let fetched = client
            .download("u", &metadata(None, None, None), &EgressSelection::direct(), 0)
            .await
            .unwrap();

        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fetched.source_container, Container::Mp3);
        assert_eq!(fetched.size_bytes, 13);
        assert_eq!(scratch_entries(&scratch).len(), 1);
        assert!(fetched.path.extension().is_some_and(|ext| ext == "mp3"));
    }

    #[tokio::test]
    async fn webm_payload_is_transcoded_and_intermediate_removed() {
        let scratch = TempDir::new().unwrap();
        let transcoder = Arc::new(CountingTranscoder::default());
        let client = client(
            &scratch,
            &[0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0],
            transcoder.clone(),
            None,
        );

        let fetched = client
            .download("u", &metadata(None, None, None), &EgressSelection::direct(), 0)
            .await
            .unwrap();

        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetched.source_container, Container::WebM);
        assert_eq!(scratch_entries(&scratch), vec![
            fetched.path.file_name().unwrap().to_string_lossy().into_owned()
        ]);
    }

    #[tokio::test]
    async fn transcode_failure_leaves_no_scratch_files() {
        let scratch = TempDir::new().unwrap();
        let transcoder = Arc::new(CountingTranscoder {
            fail: true,
            ..CountingTranscoder::default()
        });
        let client = client(&scratch, b"OggS\x00\x02", transcoder, None);

        let result = client
            .download("u", &metadata(None, None, None), &EgressSelection::direct(), 0)
            .await;

        assert!(matches!(result, Err(FetchError::ToolFailed { .. })));
        assert!(scratch_entries(&scratch).is_empty());
    }

    #[tokio::test]
    async fn empty_payload_is_an_error() {
        let scratch = TempDir::new().unwrap();
        let client = client(&scratch, b"", Arc::new(CountingTranscoder::default()), None);

        let result = client
            .download("u", &metadata(None, None, None), &EgressSelection::direct(), 0)
            .await;

        assert!(matches!(result, Err(FetchError::EmptyPayload)));
        assert!(scratch_entries(&scratch).is_empty());
    }

    #[tokio::test]
    async fn simulated_failures_stop_at_threshold() {
        let scratch = TempDir::new().unwrap();
        let client = client(
            &scratch,
            b"ID3ok",
            Arc::new(CountingTranscoder::default()),
            Some(2),
        );
        let meta = metadata(None, None, None);

        for retry_count in 0..2 {
            let result = client
                .download("u", &meta, &EgressSelection::direct(), retry_count)
                .await;
            assert!(matches!(result, Err(FetchError::Simulated { .. })));
        }
        assert!(
            client
                .download("u", &meta, &EgressSelection::direct(), 2)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let extractor = YtDlpExtractor::new("/nonexistent/yt-dlp", Duration::from_secs(5));
        let result = extractor.fetch_metadata("https://youtu.be/x", None).await;
        assert!(matches!(result, Err(FetchError::Spawn { .. })));
    }
}
