//! Relay connection carrying [`SignalingMessage`] frames between the two peers.

mod reconnect;
mod transport;

pub use conch_proto::SignalingMessage;
pub use reconnect::ReconnectPolicy;
pub use transport::SignalingTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
}

/// Outbound half of the relay as seen by the negotiation logic.
pub trait SignalSink: Send + Sync {
    /// Fire and forget. Dropped when no channel is open.
    fn send_message(&self, message: SignalingMessage);
}
