//! Per-job push-channel connection management.
//!
//! One manager owns one WebSocket at a time. It connects, pumps envelopes
//! into an ordered event channel, reclassifies closures (clean / auth /
//! transient), and retries transient drops with exponential backoff until
//! the attempt budget runs out. Disabling the manager cancels any pending
//! backoff sleep and closes the socket with a normal code; that path never
//! schedules a retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::redacted_url;
use crate::errors::SyncError;
use crate::protocol::{ClientEnvelope, CloseClass, Envelope, decode};

/// Observable connection lifecycle. Owned exclusively by the manager; all
/// other components only read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    ClosedClean,
    ClosedError,
    Exhausted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ClosedClean => "closed-clean",
            Self::ClosedError => "closed-error",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Exponential backoff tuning for reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mult = 2u32.saturating_pow(attempt.min(16));
        self.base.checked_mul(mult).map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Events delivered to the consumer, strictly in occurrence order.
#[derive(Debug)]
pub enum ConnEvent {
    /// The socket was established. `resync` is true when this follows a
    /// drop, meaning REST state must be refetched before trusting further
    /// push events.
    Opened { resync: bool },
    Envelope(Envelope),
    State(ConnectionState),
    Fatal(SyncError),
}

/// Caller-side handle to an active manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
    enabled: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Queue an outbound envelope. Fails unless a socket is currently open;
    /// frames are never buffered across reconnects.
    pub async fn send(&self, envelope: &ClientEnvelope) -> Result<(), SyncError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        let text = serde_json::to_string(envelope)
            .map_err(|e| SyncError::Other(anyhow::Error::from(e)))?;
        self.outbound.send(text).await.map_err(|_| SyncError::NotConnected)
    }

    /// Disable the manager: cancel any pending reconnect sleep and close an
    /// open socket with a normal code. Idempotent.
    pub fn close(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Start a manager for the given connection URL.
///
/// The URL already carries the job id path and auth token query parameter;
/// only a redacted form of it is ever logged.
pub fn open(url: Url, policy: BackoffPolicy) -> (ConnectionHandle, mpsc::Receiver<ConnEvent>) {
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
    let (event_tx, event_rx) = mpsc::channel::<ConnEvent>(256);
    let shutdown = Arc::new(Notify::new());
    let enabled = Arc::new(AtomicBool::new(true));
    let connected = Arc::new(AtomicBool::new(false));

    let handle = ConnectionHandle {
        outbound: outbound_tx,
        shutdown: shutdown.clone(),
        enabled: enabled.clone(),
        connected: connected.clone(),
    };

    tokio::spawn(run_connection(url, policy, outbound_rx, shutdown, enabled, connected, event_tx));

    (handle, event_rx)
}

async fn run_connection(
    url: Url,
    policy: BackoffPolicy,
    mut outbound_rx: mpsc::Receiver<String>,
    shutdown: Arc<Notify>,
    enabled: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<ConnEvent>,
) {
    let mut attempt: u32 = 0;
    let mut ever_opened = false;
    let target = redacted_url(&url);

    loop {
        if !enabled.load(Ordering::SeqCst) {
            let _ = events.send(ConnEvent::State(ConnectionState::ClosedClean)).await;
            return;
        }

        let _ = events.send(ConnEvent::State(ConnectionState::Connecting)).await;
        debug!(target = %target, attempt, "connecting to job stream");

        let connect_result = tokio::select! {
            res = connect_async(url.as_str()) => res,
            _ = shutdown.notified() => {
                let _ = events.send(ConnEvent::State(ConnectionState::ClosedClean)).await;
                return;
            }
        };

        match connect_result {
            Ok((ws, _response)) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                info!(target = %target, "job stream open");
                let _ = events.send(ConnEvent::State(ConnectionState::Open)).await;
                let _ = events.send(ConnEvent::Opened { resync: ever_opened }).await;
                ever_opened = true;

                let close = drive_socket(ws, &mut outbound_rx, &shutdown, &events).await;
                connected.store(false, Ordering::SeqCst);
                match close {
                    CloseClass::Clean => {
                        let _ = events.send(ConnEvent::State(ConnectionState::ClosedClean)).await;
                        return;
                    }
                    CloseClass::Auth => {
                        let _ = events.send(ConnEvent::Fatal(SyncError::AuthRejected)).await;
                        let _ = events.send(ConnEvent::State(ConnectionState::ClosedError)).await;
                        return;
                    }
                    CloseClass::Transient => {
                        if !enabled.load(Ordering::SeqCst) {
                            let _ =
                                events.send(ConnEvent::State(ConnectionState::ClosedClean)).await;
                            return;
                        }
                        warn!(target = %target, "job stream dropped, will reconnect");
                    }
                }
            }
            Err(e) => {
                if is_auth_handshake_error(&e) {
                    let _ = events.send(ConnEvent::Fatal(SyncError::AuthRejected)).await;
                    let _ = events.send(ConnEvent::State(ConnectionState::ClosedError)).await;
                    return;
                }
                debug!(target = %target, error = %e, "connect attempt failed");
            }
        }

        if !enabled.load(Ordering::SeqCst) {
            let _ = events.send(ConnEvent::State(ConnectionState::ClosedClean)).await;
            return;
        }

        if attempt >= policy.max_attempts {
            let _ = events.send(ConnEvent::State(ConnectionState::Exhausted)).await;
            let _ = events
                .send(ConnEvent::Fatal(SyncError::RetriesExhausted { attempts: attempt }))
                .await;
            return;
        }

        let delay = policy.delay_for(attempt);
        attempt += 1;
        info!(target = %target, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => {
                let _ = events.send(ConnEvent::State(ConnectionState::ClosedClean)).await;
                return;
            }
        }
    }
}

/// Pump one established socket until it closes, returning how the closure
/// should be treated.
async fn drive_socket(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    outbound_rx: &mut mpsc::Receiver<String>,
    shutdown: &Notify,
    events: &mpsc::Sender<ConnEvent>,
) -> CloseClass {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            // Intentional teardown: flush frames queued before the close was
            // requested, send a normal close, never retry.
            _ = shutdown.notified() => {
                while let Ok(text) = outbound_rx.try_recv() {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let frame = CloseFrame { code: CloseCode::Normal, reason: "client teardown".into() };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return CloseClass::Clean;
            }

            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return CloseClass::Transient;
                        }
                    }
                    // Handle dropped without close(): treat as teardown.
                    None => {
                        let frame = CloseFrame { code: CloseCode::Normal, reason: "client gone".into() };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return CloseClass::Clean;
                    }
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(envelope) = decode(text.as_str()) {
                            if events.send(ConnEvent::Envelope(envelope)).await.is_err() {
                                return CloseClass::Clean;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return CloseClass::Transient;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1005);
                        return CloseClass::classify(code);
                    }
                    Some(Ok(_)) => {} // binary, pong: ignored
                    Some(Err(e)) => {
                        warn!(error = %e, "job stream read error");
                        return CloseClass::Transient;
                    }
                    None => return CloseClass::Transient,
                }
            }
        }
    }
}

/// A rejected upgrade with 401/403 is an auth failure, not a transient one.
fn is_auth_handshake_error(err: &WsError) -> bool {
    match err {
        WsError::Http(response) => {
            matches!(response.status().as_u16(), 401 | 403)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_for(attempt);
            assert!(delay >= prev);
            assert!(delay <= policy.cap);
            prev = delay;
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(30), Duration::from_secs(1));
    }

    #[test]
    fn test_connection_state_display_matches_wire_names() {
        assert_eq!(ConnectionState::ClosedClean.to_string(), "closed-clean");
        assert_eq!(ConnectionState::ClosedError.to_string(), "closed-error");
        assert_eq!(ConnectionState::Exhausted.to_string(), "exhausted");
    }

    #[tokio::test]
    async fn test_unreachable_target_exhausts_retry_budget() {
        // Port 1 on loopback refuses immediately, so this runs fast.
        let url = Url::parse("ws://127.0.0.1:1/ws/jobs/j-1?token=t").unwrap();
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 2,
        };
        let (_handle, mut events) = open(url, policy);

        let mut saw_exhausted = false;
        let mut saw_fatal = false;
        while let Some(ev) = events.recv().await {
            match ev {
                ConnEvent::State(ConnectionState::Exhausted) => saw_exhausted = true,
                ConnEvent::Fatal(SyncError::RetriesExhausted { attempts }) => {
                    assert_eq!(attempts, 2);
                    saw_fatal = true;
                }
                ConnEvent::Opened { .. } => panic!("must not open"),
                _ => {}
            }
        }
        assert!(saw_exhausted);
        assert!(saw_fatal);
    }

    #[tokio::test]
    async fn test_send_rejected_while_not_open() {
        let url = Url::parse("ws://127.0.0.1:1/ws/jobs/j-1?token=t").unwrap();
        let policy = BackoffPolicy {
            base: Duration::from_secs(60), // park the manager in backoff
            cap: Duration::from_secs(60),
            max_attempts: 5,
        };
        let (handle, _events) = open(url, policy);

        let err = handle
            .send(&ClientEnvelope::Chat { content: "too early".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
        handle.close();
    }

    #[tokio::test]
    async fn test_close_during_backoff_ends_cleanly_without_retry() {
        let url = Url::parse("ws://127.0.0.1:1/ws/jobs/j-1?token=t").unwrap();
        let policy = BackoffPolicy {
            base: Duration::from_secs(60), // long sleep the close must cancel
            cap: Duration::from_secs(60),
            max_attempts: 5,
        };
        let (handle, mut events) = open(url, policy);

        // Let the first connect fail, then tear down mid-backoff.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.close();

        let mut last_state = None;
        while let Some(ev) = events.recv().await {
            match ev {
                ConnEvent::State(s) => last_state = Some(s),
                ConnEvent::Fatal(_) => panic!("clean teardown must not be fatal"),
                _ => {}
            }
        }
        assert_eq!(last_state, Some(ConnectionState::ClosedClean));
    }
}
