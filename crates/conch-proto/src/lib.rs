//! Wire protocol for the conch signaling relay.
//!
//! Every frame on the relay is a JSON object `{"type": ..., "data": ...}` where
//! `type` selects the shape of `data`. The shapes follow what browsers hand out
//! for `RTCSessionDescriptionInit` and `RTCIceCandidateInit`, so a browser peer
//! on the same relay interoperates without translation.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown signaling message type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Hangup => "hangup",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "offer" => Some(MessageType::Offer),
            "answer" => Some(MessageType::Answer),
            "ice-candidate" => Some(MessageType::IceCandidate),
            "hangup" => Some(MessageType::Hangup),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Raw envelope as it appears on the wire, before `type` is interpreted.
#[derive(Clone, Debug, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Frame")]
pub enum SignalingMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Hangup,
}

impl SignalingMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SignalingMessage::Offer(_) => MessageType::Offer,
            SignalingMessage::Answer(_) => MessageType::Answer,
            SignalingMessage::IceCandidate(_) => MessageType::IceCandidate,
            SignalingMessage::Hangup => MessageType::Hangup,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes one frame, keeping the failure class that serde would flatten.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let frame: Frame = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        Self::try_from(frame)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let frame: Frame = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
        Self::try_from(frame)
    }
}

#[derive(Serialize)]
struct FrameRef<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a T,
}

impl Serialize for SignalingMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let kind = self.message_type().as_str();
        match self {
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                FrameRef { kind, data: desc }.serialize(serializer)
            }
            SignalingMessage::IceCandidate(candidate) => FrameRef {
                kind,
                data: candidate,
            }
            .serialize(serializer),
            SignalingMessage::Hangup => FrameRef { kind, data: &"" }.serialize(serializer),
        }
    }
}

impl TryFrom<Frame> for SignalingMessage {
    type Error = DecodeError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let Some(kind) = MessageType::parse(&frame.kind) else {
            return Err(DecodeError::UnknownType(frame.kind));
        };
        match kind {
            MessageType::Offer => {
                description(kind, frame.data, SdpType::Offer).map(SignalingMessage::Offer)
            }
            MessageType::Answer => {
                description(kind, frame.data, SdpType::Answer).map(SignalingMessage::Answer)
            }
            MessageType::IceCandidate => serde_json::from_value(frame.data)
                .map(SignalingMessage::IceCandidate)
                .map_err(|err| DecodeError::InvalidPayload {
                    kind,
                    reason: err.to_string(),
                }),
            MessageType::Hangup => Ok(SignalingMessage::Hangup),
        }
    }
}

fn description(
    kind: MessageType,
    data: Value,
    expected: SdpType,
) -> Result<SessionDescription, DecodeError> {
    let desc: SessionDescription =
        serde_json::from_value(data).map_err(|err| DecodeError::InvalidPayload {
            kind,
            reason: err.to_string(),
        })?;
    if desc.kind != expected {
        return Err(DecodeError::InvalidPayload {
            kind,
            reason: format!("description type {:?} does not match message", desc.kind),
        });
    }
    Ok(desc)
}
