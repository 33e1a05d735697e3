//! `yt-dlp` subprocess backend.
//!
//! The binary writes the selected format to stdout, which we pump straight
//! into the response. Nothing touches the disk.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{DownloadBackend, ytdlp_format_selector};
use crate::{
    error::UpstreamError,
    model::DownloadRequest,
    normalize::classify_downloader_output,
    stream::{ByteStream, MediaStreamHandle, channel_stream},
};

const TITLE_TIMEOUT: Duration = Duration::from_secs(15);
const READ_CHUNK: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;
/// Longest gap between two stdout chunks once streaming has started.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ExternalBinaryBackend {
    binary: PathBuf,
    stall_timeout: Duration,
}

impl ExternalBinaryBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            stall_timeout: STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Arguments for one streaming download. Passed as a list, never through
    /// a shell.
    pub fn download_args(request: &DownloadRequest) -> Vec<String> {
        vec![
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--no-progress".into(),
            "--quiet".into(),
            "-f".into(),
            ytdlp_format_selector(request.quality, request.format),
            "-o".into(),
            "-".into(),
            request.identifier.source_url().into(),
        ]
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    async fn fetch_title(&self, request: &DownloadRequest) -> Option<String> {
        let run = self
            .command()
            .args(["--get-title", "--no-warnings", "--no-playlist"])
            .arg(request.identifier.source_url())
            .stderr(Stdio::null())
            .output();
        let output = match timeout(TITLE_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) | Ok(Err(_)) => return None,
            Err(_) => {
                debug!(video = %request.identifier, "title lookup timed out");
                return None;
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl DownloadBackend for ExternalBinaryBackend {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn probe(&self) -> bool {
        let status = self
            .command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                debug!(binary = %self.binary.display(), %status, "yt-dlp probe returned failure status");
                false
            }
            Err(err) => {
                debug!(binary = %self.binary.display(), error = %err, "yt-dlp is not installed or not in PATH");
                false
            }
        }
    }

    async fn fetch(&self, request: &DownloadRequest) -> Result<MediaStreamHandle, UpstreamError> {
        let title = self
            .fetch_title(request)
            .await
            .unwrap_or_else(|| request.identifier.default_title());

        let mut child = self
            .command()
            .args(Self::download_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                UpstreamError::extraction(format!(
                    "The external downloader {} could not be started.",
                    self.binary.display()
                ))
                .with_reason("spawn")
                .with_details(err.to_string())
            })?;
        let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(UpstreamError::internal("yt-dlp pipes were not captured."));
        };
        // Drained in the background so a chatty stderr never blocks stdout.
        let stderr_task = tokio::spawn(read_all(stderr));

        let mut first = vec![0u8; READ_CHUNK];
        let read = stdout.read(&mut first).await.map_err(|err| {
            UpstreamError::internal("Reading yt-dlp output failed.").with_details(err.to_string())
        })?;
        if read == 0 {
            let status = child.wait().await.map_err(|err| {
                UpstreamError::internal("Waiting for yt-dlp failed.").with_details(err.to_string())
            })?;
            let stderr_text = stderr_task.await.unwrap_or_default();
            let err = classify_downloader_output(&stderr_text, status.code());
            debug!(video = %request.identifier, code = ?status.code(), kind = %err.kind(), "yt-dlp produced no output");
            return Err(err);
        }
        first.truncate(read);

        let body = pump(
            child,
            stdout,
            Bytes::from(first),
            stderr_task,
            self.stall_timeout,
        );
        Ok(MediaStreamHandle::new(body, title, request.format))
    }
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf).await {
        debug!(error = %err, "reading yt-dlp stderr failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Forwards the rest of stdout through a bounded channel. When the receiver
/// goes away, or stdout stays silent for `stall_timeout`, the child is killed.
/// A failing exit or a stall after data was sent turns into an error item at
/// the end of the stream.
fn pump(
    mut child: Child,
    stdout: ChildStdout,
    first: Bytes,
    stderr_task: JoinHandle<String>,
    stall_timeout: Duration,
) -> ByteStream {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
    tokio::spawn(async move {
        if tx.send(Ok(first)).await.is_err() {
            stop_child(&mut child).await;
            return;
        }
        let mut reader = ReaderStream::with_capacity(stdout, READ_CHUNK);
        loop {
            let chunk = tokio::select! {
                chunk = timeout(stall_timeout, reader.next()) => chunk,
                _ = tx.closed() => {
                    debug!("stream receiver dropped, stopping yt-dlp");
                    stop_child(&mut child).await;
                    return;
                }
            };
            let Ok(chunk) = chunk else {
                warn!(stall = ?stall_timeout, "yt-dlp output stalled, stopping it");
                stop_child(&mut child).await;
                let err = UpstreamError::timeout("yt-dlp download");
                let _ = tx.send(Err(io::Error::other(err))).await;
                return;
            };
            let Some(chunk) = chunk else {
                break;
            };
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                stop_child(&mut child).await;
                return;
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                let stderr_text = stderr_task.await.unwrap_or_default();
                let err = classify_downloader_output(&stderr_text, status.code());
                warn!(code = ?status.code(), kind = %err.kind(), "yt-dlp failed after streaming started");
                let _ = tx.send(Err(io::Error::other(err))).await;
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
            }
        }
    });
    channel_stream(rx)
}

async fn stop_child(child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(error = %err, "yt-dlp already exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        model::{MediaFormat, Quality, VideoIdentifier},
        testing::install_stub,
    };

    // Echoes the -f selector as the payload and answers --get-title.
    const ECHO_STUB: &str = r#"
case "$1" in
  --version) echo "2025.01.01"; exit 0 ;;
  --get-title) echo "Stub Title: Part 1"; exit 0 ;;
esac
format=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-f" ]; then shift; format="$1"; fi
  shift
done
printf 'FORMAT=%s' "$format"
"#;

    fn request() -> DownloadRequest {
        DownloadRequest::new(VideoIdentifier::youtube("dQw4w9WgXcQ").unwrap())
    }

    async fn collect(body: ByteStream) -> (Vec<u8>, Option<io::Error>) {
        let mut body = body;
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(err) => return (data, Some(err)),
            }
        }
        (data, None)
    }

    #[tokio::test]
    async fn streams_stdout_with_requested_selector() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", ECHO_STUB));
        assert!(backend.probe().await);

        let handle = backend
            .fetch(&request().with_quality(Quality::P480))
            .await
            .unwrap();
        assert_eq!(handle.title(), "Stub Title: Part 1");
        assert_eq!(handle.suggested_filename(), "Stub_Title__Part_1.mp4");
        let (data, err) = collect(handle.into_body()).await;
        assert!(err.is_none());
        assert_eq!(
            String::from_utf8(data).unwrap(),
            "FORMAT=best[height<=480][ext=mp4]/best[height<=480]"
        );
    }

    #[tokio::test]
    async fn audio_requests_prefer_m4a_audio() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", ECHO_STUB));
        let handle = backend
            .fetch(&request().with_format(MediaFormat::Mp3))
            .await
            .unwrap();
        assert_eq!(handle.content_type(), "audio/mpeg");
        let (data, _) = collect(handle.into_body()).await;
        assert_eq!(data, b"FORMAT=bestaudio[ext=m4a]/bestaudio");
    }

    #[tokio::test]
    async fn title_falls_back_to_video_id() {
        let dir = tempfile::tempdir().unwrap();
        let stub = r#"
case "$1" in
  --get-title) exit 1 ;;
esac
printf 'data'
"#;
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", stub));
        let handle = backend.fetch(&request()).await.unwrap();
        assert_eq!(handle.title(), "video_dQw4w9WgXcQ");
    }

    #[tokio::test]
    async fn private_video_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let stub = r#"
echo "ERROR: [youtube] dQw4w9WgXcQ: Private video. Sign in if you've been granted access to this video" >&2
exit 1
"#;
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", stub));
        let err = backend.fetch(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamBlockedError);
        assert!(err.is_terminal());
        assert!(err.details().unwrap().contains("Private video"));
    }

    #[tokio::test]
    async fn rate_limit_is_not_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let stub = r#"
echo "ERROR: unable to download video data: HTTP Error 429: Too Many Requests" >&2
exit 1
"#;
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", stub));
        let err = backend.fetch(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamBlockedError);
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn missing_binary_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ExternalBinaryBackend::new(dir.path().join("does-not-exist"));
        assert!(!backend.probe().await);
        let err = backend.fetch(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionError);
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn failure_after_first_chunk_surfaces_in_body() {
        let dir = tempfile::tempdir().unwrap();
        let stub = r#"
case "$1" in
  --get-title) echo "Partial"; exit 0 ;;
esac
printf 'partial-bytes'
echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
exit 1
"#;
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", stub));
        let handle = backend.fetch(&request()).await.unwrap();
        let (data, err) = collect(handle.into_body()).await;
        assert_eq!(data, b"partial-bytes");
        let err = err.expect("stream should end with an error");
        assert!(err.to_string().contains("refusing"));
    }

    #[tokio::test]
    async fn dropping_the_body_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let stub = format!(
            r#"
case "$1" in
  --get-title) echo "Long"; exit 0 ;;
esac
echo $$ > "{}"
printf 'first-chunk'
exec sleep 30
"#,
            pid_file.display()
        );
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", &stub));
        let handle = backend.fetch(&request()).await.unwrap();
        let mut body = handle.into_body();
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"first-chunk"));
        drop(body);

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let mut alive = true;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let status = std::process::Command::new("kill")
                .args(["-0", &pid])
                .stderr(Stdio::null())
                .status()
                .unwrap();
            if !status.success() {
                alive = false;
                break;
            }
        }
        assert!(!alive, "yt-dlp stub {pid} survived the client disconnect");
    }

    #[tokio::test]
    async fn stalled_output_ends_stream_and_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let stub = format!(
            r#"
case "$1" in
  --get-title) echo "Stalled"; exit 0 ;;
esac
echo $$ > "{}"
printf 'first'
exec sleep 600
"#,
            pid_file.display()
        );
        let backend = ExternalBinaryBackend::new(install_stub(dir.path(), "yt-dlp", &stub))
            .with_stall_timeout(Duration::from_millis(500));
        let handle = backend.fetch(&request()).await.unwrap();
        let mut body = handle.into_body();
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"first"));

        let next = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("stalled stream should end on its own");
        let err = next.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(body.next().await.is_none());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let status = std::process::Command::new("kill")
            .args(["-0", &pid])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!status.success(), "yt-dlp stub {pid} survived the stall");
    }
}
