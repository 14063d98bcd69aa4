use super::{
    CaptureConstraints, MediaCapture, MediaError, MediaStreamHandle, MediaTrack, TrackKind,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Capture backend that grants a stream without opening any device.
#[derive(Debug, Default, Clone)]
pub struct SyntheticCapture {
    failure: Option<MediaError>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquire fails with `err`; useful for exercising the error paths.
    pub fn failing(err: MediaError) -> Self {
        Self { failure: Some(err) }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if let Some(video) = constraints.video {
            tracing::debug!(
                target = "conch::media",
                width = video.width,
                height = video.height,
                "synthetic video track"
            );
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(MediaError::Other(
                "capture constraints request neither audio nor video".into(),
            ));
        }
        Ok(MediaStreamHandle::new(Uuid::new_v4().to_string(), tracks))
    }
}
