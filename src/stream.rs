use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Bytes;
use futures::{Stream, StreamExt, stream::BoxStream};
use tempfile::TempDir;
use tokio::{fs::File, sync::mpsc};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::model::MediaFormat;

pub const MAX_FILENAME_STEM: usize = 100;
const FALLBACK_FILENAME_STEM: &str = "video";

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A successful acquisition, ready to be piped into a response body.
///
/// Dropping the handle (or the body taken out of it) releases whatever the
/// backend holds for this request.
pub struct MediaStreamHandle {
    body: ByteStream,
    title: String,
    suggested_filename: String,
    content_type: String,
}

impl MediaStreamHandle {
    pub fn new(body: ByteStream, title: impl Into<String>, format: MediaFormat) -> Self {
        let title = title.into();
        let suggested_filename = format!(
            "{}.{}",
            sanitize_filename_stem(&title),
            format.extension()
        );
        Self {
            body,
            title,
            suggested_filename,
            content_type: format.content_type(),
        }
    }

    /// Streams `file` and removes `scope` once the stream ends, fails or is
    /// dropped.
    pub fn from_temp_file(
        file: File,
        scope: TempDir,
        title: impl Into<String>,
        format: MediaFormat,
    ) -> Self {
        let body = TempFileStream {
            inner: ReaderStream::new(file),
            scope: Some(scope),
        };
        Self::new(body.boxed(), title, format)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn suggested_filename(&self) -> &str {
        &self.suggested_filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn into_body(self) -> ByteStream {
        self.body
    }
}

impl fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("title", &self.title)
            .field("suggested_filename", &self.suggested_filename)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Replaces every non `[A-Za-z0-9]` char with `_` and caps the length.
pub fn sanitize_filename_stem(title: &str) -> String {
    let stem: String = title
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .take(MAX_FILENAME_STEM)
        .collect();
    if stem.is_empty() {
        FALLBACK_FILENAME_STEM.to_string()
    } else {
        stem
    }
}

/// Adapts the receiving half of a pump task into a body stream. The sender
/// observes the drop of this stream through `Sender::closed`.
pub fn channel_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> ByteStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

struct TempFileStream {
    inner: ReaderStream<File>,
    scope: Option<TempDir>,
}

impl TempFileStream {
    fn release(&mut self) {
        let Some(scope) = self.scope.take() else {
            return;
        };
        let path = scope.path().to_path_buf();
        match scope.close() {
            Ok(()) => debug!(path = %path.display(), "removed temporary media"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temporary media"),
        }
    }
}

impl Stream for TempFileStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.release();
        }
        polled
    }
}

impl Drop for TempFileStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_stem_keeps_only_ascii_alphanumerics() {
        assert_eq!(sanitize_filename_stem("Hello, World!"), "Hello__World_");
        assert_eq!(sanitize_filename_stem("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_filename_stem("naïve \"quote\""), "na_ve__quote_");
        assert_eq!(sanitize_filename_stem(""), "video");
    }

    #[test]
    fn filename_stem_is_capped() {
        let stem = sanitize_filename_stem(&"x".repeat(500));
        assert_eq!(stem.len(), MAX_FILENAME_STEM);
    }

    #[test]
    fn handle_derives_filename_and_content_type() {
        let body = futures::stream::empty().boxed();
        let handle = MediaStreamHandle::new(body, "My Clip", MediaFormat::Mp3);
        assert_eq!(handle.suggested_filename(), "My_Clip.mp3");
        assert_eq!(handle.content_type(), "audio/mpeg");
        assert_eq!(handle.title(), "My Clip");
    }

    #[tokio::test]
    async fn temp_file_is_removed_after_full_read() {
        let scratch = tempfile::tempdir().unwrap();
        let scope = tempfile::tempdir_in(scratch.path()).unwrap();
        let path = scope.path().join("media.mp4");
        tokio::fs::write(&path, b"payload").await.unwrap();
        let file = File::open(&path).await.unwrap();

        let handle = MediaStreamHandle::from_temp_file(file, scope, "clip", MediaFormat::Mp4);
        let mut body = handle.into_body();
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"payload");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn temp_file_is_removed_when_dropped_early() {
        let scratch = tempfile::tempdir().unwrap();
        let scope = tempfile::tempdir_in(scratch.path()).unwrap();
        let path = scope.path().join("media.mp4");
        tokio::fs::write(&path, vec![7u8; 64 * 1024]).await.unwrap();
        let file = File::open(&path).await.unwrap();

        let handle = MediaStreamHandle::from_temp_file(file, scope, "clip", MediaFormat::Mp4);
        let mut body = handle.into_body();
        assert!(body.next().await.unwrap().is_ok());
        drop(body);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn channel_stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(2);
        let mut body = channel_stream(rx);
        tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        drop(tx);
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(body.next().await.is_none());
    }
}
