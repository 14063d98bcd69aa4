//! Local capture stream ownership and the preview surface.
//!
//! The session holds at most one captured stream. Pausing only flips the
//! `enabled` flag on each track; device access is kept until [`MediaSession::release`].

mod synthetic;

pub use synthetic::SyntheticCapture;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("no camera or microphone found: {0}")]
    NotFound(String),
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture blocked by security policy")]
    SecurityRestricted,
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints {
                width: 720,
                height: 540,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.ended.store(true, Ordering::SeqCst);
    }
}

struct StreamInner {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

/// Shared handle to a captured or received stream. Equality is identity.
#[derive(Clone)]
pub struct MediaStreamHandle {
    inner: Arc<StreamInner>,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self::from_shared(id, tracks.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.inner.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.inner.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.tracks.iter().any(|track| track.is_enabled())
    }

    pub fn stop(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
    }
}

impl PartialEq for MediaStreamHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MediaStreamHandle {}

impl fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .finish()
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStreamHandle, MediaError>;
}

/// A surface that shows a stream. `None` clears it.
pub trait RenderSink: Send + Sync {
    fn attach(&self, stream: Option<MediaStreamHandle>);
}

/// Render sink that only records what it was told to show in the log.
pub struct LoggingRenderSink {
    label: &'static str,
}

impl LoggingRenderSink {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl RenderSink for LoggingRenderSink {
    fn attach(&self, stream: Option<MediaStreamHandle>) {
        match stream {
            Some(stream) => tracing::info!(
                target = "conch::media",
                surface = self.label,
                stream = stream.id(),
                tracks = stream.tracks().len(),
                "render surface attached"
            ),
            None => tracing::info!(
                target = "conch::media",
                surface = self.label,
                "render surface cleared"
            ),
        }
    }
}

pub struct MediaSession {
    capture: Arc<dyn MediaCapture>,
    constraints: CaptureConstraints,
    preview: Arc<dyn RenderSink>,
    stream: Option<MediaStreamHandle>,
}

impl MediaSession {
    pub fn new(
        capture: Arc<dyn MediaCapture>,
        constraints: CaptureConstraints,
        preview: Arc<dyn RenderSink>,
    ) -> Self {
        Self {
            capture,
            constraints,
            preview,
            stream: None,
        }
    }

    pub fn stream(&self) -> Option<&MediaStreamHandle> {
        self.stream.as_ref()
    }

    /// Returns the held stream, capturing one first if needed. A fresh capture
    /// starts paused.
    pub async fn acquire(&mut self) -> Result<MediaStreamHandle, MediaError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }
        let stream = self.capture.acquire(&self.constraints).await?;
        tracing::info!(
            target = "conch::media",
            stream = stream.id(),
            tracks = stream.tracks().len(),
            "local capture acquired"
        );
        self.stream = Some(stream.clone());
        self.pause();
        Ok(stream)
    }

    pub fn pause(&mut self) {
        if let Some(stream) = &self.stream {
            stream.set_enabled(false);
        }
        self.preview.attach(None);
    }

    pub fn resume(&mut self) {
        let Some(stream) = &self.stream else {
            tracing::debug!(target = "conch::media", "resume without a captured stream");
            return;
        };
        stream.set_enabled(true);
        self.preview.attach(Some(stream.clone()));
    }

    /// Puts the held stream on the preview without touching its tracks.
    pub fn show_preview(&self) {
        if let Some(stream) = &self.stream {
            self.preview.attach(Some(stream.clone()));
        }
    }

    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            tracing::info!(
                target = "conch::media",
                stream = stream.id(),
                "local capture released"
            );
        }
        self.preview.attach(None);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) attached: Mutex<Vec<Option<MediaStreamHandle>>>,
    }

    impl RecordingSink {
        pub(crate) fn last(&self) -> Option<Option<MediaStreamHandle>> {
            self.attached.lock().last().cloned()
        }
    }

    impl RenderSink for RecordingSink {
        fn attach(&self, stream: Option<MediaStreamHandle>) {
            self.attached.lock().push(stream);
        }
    }

    pub(crate) struct CountingCapture {
        pub(crate) calls: AtomicUsize,
        pub(crate) failure: Option<MediaError>,
    }

    impl CountingCapture {
        pub(crate) fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failure: None,
            }
        }

        pub(crate) fn failing(err: MediaError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failure: Some(err),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaCapture for CountingCapture {
        async fn acquire(
            &self,
            _constraints: &CaptureConstraints,
        ) -> Result<MediaStreamHandle, MediaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            Ok(MediaStreamHandle::new(
                "local",
                vec![
                    MediaTrack::new(TrackKind::Audio),
                    MediaTrack::new(TrackKind::Video),
                ],
            ))
        }
    }

    fn session(capture: Arc<CountingCapture>, sink: Arc<RecordingSink>) -> MediaSession {
        MediaSession::new(capture, CaptureConstraints::default(), sink)
    }

    #[test_timeout::tokio_timeout_test]
    async fn acquire_starts_paused() {
        let capture = Arc::new(CountingCapture::ok());
        let sink = Arc::new(RecordingSink::default());
        let mut media = session(capture.clone(), sink.clone());

        let stream = media.acquire().await.expect("acquire");
        assert!(!stream.is_enabled());
        assert_eq!(sink.last(), Some(None));
        assert_eq!(capture.calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn pause_resume_reuses_stream_without_recapture() {
        let capture = Arc::new(CountingCapture::ok());
        let sink = Arc::new(RecordingSink::default());
        let mut media = session(capture.clone(), sink.clone());

        let stream = media.acquire().await.expect("acquire");
        media.resume();
        media.pause();
        assert_eq!(sink.last(), Some(None));
        media.resume();

        assert_eq!(sink.last(), Some(Some(stream.clone())));
        assert!(stream.tracks().iter().all(|track| track.is_enabled()));
        let again = media.acquire().await.expect("second acquire");
        assert_eq!(again, stream);
        assert_eq!(capture.calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn acquire_failure_keeps_no_stream() {
        let capture = Arc::new(CountingCapture::failing(MediaError::PermissionDenied));
        let sink = Arc::new(RecordingSink::default());
        let mut media = session(capture, sink);

        let err = media.acquire().await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
        assert!(media.stream().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn release_ends_tracks() {
        let capture = Arc::new(CountingCapture::ok());
        let sink = Arc::new(RecordingSink::default());
        let mut media = session(capture, sink.clone());

        let stream = media.acquire().await.expect("acquire");
        media.resume();
        media.release();
        assert!(stream.tracks().iter().all(|track| track.is_ended()));
        assert!(media.stream().is_none());
        assert_eq!(sink.last(), Some(None));
    }

    #[test_timeout::timeout]
    fn resume_without_stream_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let mut media = session(Arc::new(CountingCapture::ok()), sink.clone());
        media.resume();
        assert!(sink.attached.lock().is_empty());
    }
}
