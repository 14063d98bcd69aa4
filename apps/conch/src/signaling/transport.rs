use super::reconnect::{Backoff, ReconnectPolicy, Wait};
use super::{SignalSink, SignalingMessage, TransportState};
use conch_proto::DecodeError;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

const INBOUND_CAPACITY: usize = 256;

struct Shared {
    url: Url,
    policy: ReconnectPolicy,
    outbound: Mutex<Option<mpsc::UnboundedSender<SignalingMessage>>>,
    inbound: broadcast::Sender<SignalingMessage>,
    state: watch::Sender<TransportState>,
    attempts: AtomicU64,
}

/// Single logical websocket to the relay, re-established whenever it closes.
pub struct SignalingTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    pub fn new(url: Url, policy: ReconnectPolicy) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                url,
                policy,
                outbound: Mutex::new(None),
                inbound,
                state,
                attempts: AtomicU64::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Starts the connection supervisor unless it is already running.
    pub fn connect(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *supervisor = Some(tokio::spawn(supervise(shared)));
    }

    pub fn messages(&self) -> broadcast::Receiver<SignalingMessage> {
        self.shared.inbound.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    pub fn connection_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn send_message(&self, message: SignalingMessage) {
        let outbound = self.shared.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            tracing::debug!(
                target = "conch::signaling",
                kind = %message.message_type(),
                "signaling channel not open; dropping message"
            );
            return;
        };
        if let Err(mpsc::error::SendError(message)) = tx.send(message) {
            tracing::debug!(
                target = "conch::signaling",
                kind = %message.message_type(),
                "signaling writer gone; dropping message"
            );
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.shared.outbound.lock().take();
        self.shared.state.send_replace(TransportState::Disconnected);
    }
}

impl SignalSink for SignalingTransport {
    fn send_message(&self, message: SignalingMessage) {
        SignalingTransport::send_message(self, message);
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn supervise(shared: Arc<Shared>) {
    let mut backoff = Backoff::new(shared.policy.clone());
    loop {
        shared.state.send_replace(TransportState::Connecting);
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let wait = match connect_async(shared.url.as_str()).await {
            Ok((stream, _)) => {
                tracing::info!(
                    target = "conch::signaling",
                    url = %shared.url,
                    attempt,
                    "signaling websocket connected"
                );
                let opened = Instant::now();
                run_session(&shared, stream).await;
                shared.state.send_replace(TransportState::Disconnected);
                let uptime = opened.elapsed();
                let wait = backoff.on_session_end(uptime);
                match wait {
                    None => tracing::info!(
                        target = "conch::signaling",
                        url = %shared.url,
                        "signaling websocket closed; reconnecting"
                    ),
                    Some(wait) => tracing::warn!(
                        target = "conch::signaling",
                        url = %shared.url,
                        attempt,
                        uptime_ms = uptime.as_millis() as u64,
                        delay_ms = wait.duration().as_millis() as u64,
                        cooldown = matches!(wait, Wait::Cooldown(_)),
                        "signaling websocket closed right after opening"
                    ),
                }
                wait
            }
            Err(err) => {
                shared.state.send_replace(TransportState::Disconnected);
                let wait = backoff.on_failure();
                match wait {
                    Wait::Retry(delay) => tracing::warn!(
                        target = "conch::signaling",
                        url = %shared.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "signaling connect failed: {err}"
                    ),
                    Wait::Cooldown(delay) => tracing::warn!(
                        target = "conch::signaling",
                        url = %shared.url,
                        attempt,
                        cooldown_ms = delay.as_millis() as u64,
                        "signaling connect keeps failing; cooling down: {err}"
                    ),
                }
                Some(wait)
            }
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait.duration()).await;
        }
    }
}

async fn run_session(shared: &Shared, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (mut ws_write, mut ws_read) = stream.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    *shared.outbound.lock() = Some(send_tx);
    shared.state.send_replace(TransportState::Open);

    let writer = tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(
                        target = "conch::signaling",
                        kind = %message.message_type(),
                        "failed to encode signaling message: {err}"
                    );
                    continue;
                }
            };
            tracing::trace!(
                target = "conch::signaling",
                event = "ws_out",
                kind = %message.message_type(),
                len = text.len()
            );
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                tracing::trace!(
                    target = "conch::signaling",
                    event = "ws_in",
                    kind = "text",
                    len = text.len()
                );
                dispatch(shared, SignalingMessage::from_json(&text));
            }
            Ok(Message::Binary(data)) => {
                tracing::trace!(
                    target = "conch::signaling",
                    event = "ws_in",
                    kind = "binary",
                    len = data.len()
                );
                dispatch(shared, SignalingMessage::from_slice(&data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(
                            target = "conch::signaling",
                            "signaling websocket closed: {err}"
                        );
                    }
                    _ => {
                        tracing::warn!(
                            target = "conch::signaling",
                            "signaling websocket error: {err}"
                        );
                    }
                }
                break;
            }
        }
    }

    shared.outbound.lock().take();
    writer.abort();
}

fn dispatch(shared: &Shared, decoded: Result<SignalingMessage, DecodeError>) {
    match decoded {
        Ok(message) => {
            // No subscribers is not an error; the frame just has no audience.
            let _ = shared.inbound.send(message);
        }
        Err(DecodeError::UnknownType(kind)) => {
            tracing::warn!(
                target = "conch::signaling",
                kind = %kind,
                "ignoring signaling message of unknown type"
            );
        }
        Err(err) => {
            tracing::warn!(
                target = "conch::signaling",
                "dropping undecodable signaling frame: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conch_proto::SessionDescription;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    async fn listener() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("accept timed out")
            .expect("accept");
        accept_async(stream).await.expect("handshake")
    }

    async fn wait_open(transport: &SignalingTransport) {
        let mut state = transport.state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == TransportState::Open),
        )
        .await
        .expect("transport never opened")
        .expect("state channel closed");
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("read timed out")
                .expect("stream ended")
                .expect("read frame");
            if let Message::Text(text) = frame {
                return text;
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnects_promptly_after_close() {
        let (listener, url) = listener().await;
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(3),
            min_uptime: Duration::from_millis(100),
            ..ReconnectPolicy::default()
        };
        let transport = SignalingTransport::new(url, policy);
        transport.connect();

        let mut first = accept(&listener).await;
        wait_open(&transport).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        first.close(None).await.expect("close");

        let started = tokio::time::Instant::now();
        let _second = accept(&listener).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        wait_open(&transport).await;
        assert_eq!(transport.connection_attempts(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_that_closes_on_accept_is_backed_off() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if let Ok(mut ws) = accept_async(stream).await {
                    let _ = ws.close(None).await;
                }
            }
        });
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            ..ReconnectPolicy::default()
        };
        let transport = SignalingTransport::new(url, policy);
        transport.connect();

        tokio::time::sleep(Duration::from_secs(1)).await;
        // Attempts at roughly 0, 100, 300 and 700ms.
        let attempts = transport.connection_attempts();
        assert!(attempts >= 2, "never retried: {attempts}");
        assert!(attempts <= 6, "reconnect loop not backed off: {attempts}");

        transport.shutdown();
        server.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn sends_while_closed_are_dropped() {
        let (listener, url) = listener().await;
        let transport = SignalingTransport::new(url, ReconnectPolicy::default());

        transport.send_message(SignalingMessage::Hangup);
        transport.connect();
        let mut server = accept(&listener).await;
        wait_open(&transport).await;
        transport.send_message(SignalingMessage::Offer(SessionDescription::offer("v=0")));

        let text = next_text(&mut server).await;
        assert_eq!(
            SignalingMessage::from_json(&text).expect("decode"),
            SignalingMessage::Offer(SessionDescription::offer("v=0"))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_frames_are_skipped_for_every_subscriber() {
        let (listener, url) = listener().await;
        let transport = SignalingTransport::new(url, ReconnectPolicy::default());
        let mut first = transport.messages();
        let mut second = transport.messages();
        transport.connect();

        let mut server = accept(&listener).await;
        server
            .send(Message::Text(r#"{"type":"renegotiate","data":{}}"#.into()))
            .await
            .expect("send unknown");
        server
            .send(Message::Text("not json".into()))
            .await
            .expect("send garbage");
        server
            .send(Message::Binary(br#"{"type":"hangup","data":""}"#.to_vec()))
            .await
            .expect("send hangup");

        for rx in [&mut first, &mut second] {
            let message = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("recv timed out")
                .expect("recv");
            assert_eq!(message, SignalingMessage::Hangup);
        }
        assert_eq!(*transport.state().borrow(), TransportState::Open);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_attempts_back_off() {
        let (listener, url) = listener().await;
        drop(listener);
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
            cooldown: Duration::ZERO,
            min_uptime: Duration::ZERO,
        };
        let transport = SignalingTransport::new(url, policy);
        transport.connect();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // 400ms then 800ms between attempts: at most two attempts so far.
        assert!(transport.connection_attempts() <= 2);
        transport.send_message(SignalingMessage::Hangup);
        transport.shutdown();
        assert_eq!(*transport.state().borrow(), TransportState::Disconnected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_is_idempotent() {
        let (listener, url) = listener().await;
        let transport = SignalingTransport::new(url, ReconnectPolicy::default());
        transport.connect();
        transport.connect();
        let _server = accept(&listener).await;
        wait_open(&transport).await;
        transport.connect();
        assert!(
            timeout(Duration::from_millis(300), listener.accept())
                .await
                .is_err()
        );
        assert_eq!(transport.connection_attempts(), 1);
    }
}
