use crate::media::MediaError;
use crate::peer::PeerError;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateConnection,
    AttachTracks,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationStep::CreateConnection => "create peer connection",
            NegotiationStep::AttachTracks => "attach local tracks",
            NegotiationStep::CreateOffer => "create offer",
            NegotiationStep::CreateAnswer => "create answer",
            NegotiationStep::SetLocalDescription => "set local description",
            NegotiationStep::SetRemoteDescription => "set remote description",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct NegotiationError {
    pub step: NegotiationStep,
    #[source]
    pub source: PeerError,
}

pub(crate) trait StepResultExt<T> {
    fn at(self, step: NegotiationStep) -> Result<T, NegotiationError>;
}

impl<T> StepResultExt<T> for Result<T, PeerError> {
    fn at(self, step: NegotiationStep) -> Result<T, NegotiationError> {
        self.map_err(|source| NegotiationError { step, source })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    PermissionDenied,
    SecurityRestricted,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

impl CallError {
    pub fn reason(&self) -> FailureReason {
        match self {
            CallError::Media(MediaError::NotFound(_)) => FailureReason::NotFound,
            CallError::Media(MediaError::PermissionDenied) => FailureReason::PermissionDenied,
            CallError::Media(MediaError::SecurityRestricted) => FailureReason::SecurityRestricted,
            CallError::Media(MediaError::Other(_)) | CallError::Negotiation(_) => {
                FailureReason::Other
            }
        }
    }

    /// What the user is told, if anything. A denied permission is the user's
    /// own choice and gets no notice.
    pub fn notice(&self) -> Option<String> {
        match self.reason() {
            FailureReason::NotFound => {
                Some("Unable to start the call: no camera or microphone was found.".to_owned())
            }
            FailureReason::PermissionDenied | FailureReason::SecurityRestricted => None,
            FailureReason::Other => Some(format!("Failed to open camera: {self}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn classifies_media_failures() {
        let cases = [
            (MediaError::NotFound("camera".into()), FailureReason::NotFound),
            (MediaError::PermissionDenied, FailureReason::PermissionDenied),
            (MediaError::SecurityRestricted, FailureReason::SecurityRestricted),
            (MediaError::Other("busy".into()), FailureReason::Other),
        ];
        for (err, reason) in cases {
            assert_eq!(CallError::from(err).reason(), reason);
        }
    }

    #[test_timeout::timeout]
    fn notices_only_for_not_found_and_other() {
        assert!(
            CallError::from(MediaError::NotFound("camera".into()))
                .notice()
                .is_some()
        );
        assert!(CallError::from(MediaError::PermissionDenied).notice().is_none());
        assert!(CallError::from(MediaError::SecurityRestricted).notice().is_none());

        let err: CallError = Err::<(), _>(PeerError::Closed)
            .at(NegotiationStep::CreateAnswer)
            .unwrap_err()
            .into();
        assert_eq!(
            err.notice().as_deref(),
            Some("Failed to open camera: create answer failed: peer connection closed")
        );
    }
}
