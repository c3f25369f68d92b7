use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{AppError, AppResult};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;

/// Reconnection budget shared by both upstream connections: 1 s × attempt,
/// then permanent failure.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(attempt.max(1) as u64)
}

/// Close codes that end the connection for good. 1000 is a normal finish;
/// 1008 is a credential rejection that retrying cannot fix.
pub fn close_is_permanent(code: u16) -> bool {
    matches!(code, 1000 | 1008)
}

pub fn describe_close(code: u16) -> &'static str {
    match code {
        1000 => "normal closure",
        1005 => "no status (commonly malformed settings)",
        1008 => "policy violation (credential problem)",
        1011 => "server error",
        _ => "abnormal closure",
    }
}

/// Open a WebSocket to a speech upstream with the bearer credential in the
/// handshake headers.
pub async fn connect(url: &str, api_key: &str, timeout: Duration) -> AppResult<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| AppError::UpstreamHandshake(format!("invalid upstream url: {}", e)))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Token {}", api_key)
            .parse()
            .map_err(|_| AppError::UpstreamHandshake("invalid api key".to_string()))?,
    );

    let (stream, _response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| AppError::UpstreamHandshake("connect timed out".to_string()))?
        .map_err(|e| AppError::UpstreamHandshake(e.to_string()))?;

    Ok(stream)
}

/// Commands accepted by an upstream writer task. The writer is the sole
/// sender on its socket.
#[derive(Debug)]
pub enum WriteCmd {
    Audio(Vec<u8>),
    Control(String),
    Close,
}

/// Dropped-frame accounting for one upstream, reported at most once per 5 s.
pub struct BackpressureCounter {
    label: &'static str,
    dropped_since_report: AtomicU64,
    last_report: Mutex<Instant>,
}

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

impl BackpressureCounter {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            dropped_since_report: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
        }
    }

    pub fn note_drop(&self) {
        let dropped = self.dropped_since_report.fetch_add(1, Ordering::Relaxed) + 1;
        let mut last = self.last_report.lock().unwrap();
        if last.elapsed() >= REPORT_INTERVAL {
            *last = Instant::now();
            drop(last);
            let total = self.dropped_since_report.swap(0, Ordering::Relaxed);
            tracing::warn!(
                upstream = self.label,
                dropped = total.max(dropped),
                "audio frames dropped under backpressure"
            );
        }
    }

    #[allow(dead_code)]
    pub fn dropped_pending(&self) -> u64 {
        self.dropped_since_report.load(Ordering::Relaxed)
    }
}

/// Write-side handle to an upstream connection, shared with the router.
#[derive(Clone)]
pub struct UpstreamHandle {
    write_tx: mpsc::Sender<WriteCmd>,
    buffered: Arc<AtomicUsize>,
    max_buffered: usize,
    pressure: Arc<BackpressureCounter>,
}

impl UpstreamHandle {
    pub fn new(
        write_tx: mpsc::Sender<WriteCmd>,
        buffered: Arc<AtomicUsize>,
        max_buffered: usize,
        pressure: Arc<BackpressureCounter>,
    ) -> Self {
        Self {
            write_tx,
            buffered,
            max_buffered,
            pressure,
        }
    }

    /// Offer one audio frame. Returns true when the transport accepted it;
    /// false when it was dropped because the write buffer is above its
    /// ceiling, the queue is full, or the socket is gone. Frames are never
    /// queued beyond the ceiling.
    pub fn send_audio(&self, payload: Vec<u8>) -> bool {
        if self.buffered.load(Ordering::Relaxed) >= self.max_buffered {
            self.pressure.note_drop();
            return false;
        }
        let len = payload.len();
        match self.write_tx.try_send(WriteCmd::Audio(payload)) {
            Ok(()) => {
                self.buffered.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.pressure.note_drop();
                false
            }
        }
    }

    /// Queue a small JSON control message. Blocks until queued; errors on a
    /// closed socket.
    pub async fn send_control(&self, json: String) -> AppResult<()> {
        self.write_tx
            .send(WriteCmd::Control(json))
            .await
            .map_err(|_| AppError::UpstreamClosed)
    }

    /// Request a normal (1000) close of the current socket.
    pub async fn close(&self) {
        let _ = self.write_tx.send(WriteCmd::Close).await;
    }

    #[allow(dead_code)]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Gauge shared with the writer task of the current socket epoch.
    pub(crate) fn buffered_gauge(&self) -> Arc<AtomicUsize> {
        self.buffered.clone()
    }

    #[allow(dead_code)]
    pub fn pressure(&self) -> &BackpressureCounter {
        &self.pressure
    }
}

/// Build a handle plus the receiving half its writer tasks will own.
pub fn handle_pair(
    label: &'static str,
    queue_depth: usize,
    max_buffered: usize,
) -> (UpstreamHandle, mpsc::Receiver<WriteCmd>) {
    let (write_tx, write_rx) = mpsc::channel(queue_depth);
    let handle = UpstreamHandle::new(
        write_tx,
        Arc::new(AtomicUsize::new(0)),
        max_buffered,
        Arc::new(BackpressureCounter::new(label)),
    );
    (handle, write_rx)
}

/// Single-writer task for one socket epoch. Consumes `write_rx` until the
/// epoch ends (stop signal, `Close` command, or write failure) and hands
/// the receiver back so the next epoch can reuse it after a reconnect.
///
/// `idle_keepalive`, when set, emits a `{"type":"KeepAlive"}` control frame
/// whenever no write has happened for the given duration.
pub async fn writer_task(
    mut sink: WsSink,
    mut write_rx: mpsc::Receiver<WriteCmd>,
    buffered: Arc<AtomicUsize>,
    mut epoch_stop: oneshot::Receiver<()>,
    idle_keepalive: Option<Duration>,
) -> mpsc::Receiver<WriteCmd> {
    let idle = idle_keepalive.unwrap_or(Duration::from_secs(3600));
    let mut deadline = Instant::now() + idle;

    loop {
        tokio::select! {
            biased;
            _ = &mut epoch_stop => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                return write_rx;
            }
            _ = tokio::time::sleep_until(deadline), if idle_keepalive.is_some() => {
                deadline = Instant::now() + idle;
                if sink
                    .send(Message::Text("{\"type\":\"KeepAlive\"}".to_string()))
                    .await
                    .is_err()
                {
                    return write_rx;
                }
            }
            cmd = write_rx.recv() => {
                deadline = Instant::now() + idle;
                match cmd {
                    Some(WriteCmd::Audio(payload)) => {
                        let len = payload.len();
                        let result = sink.send(Message::Binary(payload)).await;
                        buffered.fetch_sub(len.min(buffered.load(Ordering::Relaxed)), Ordering::Relaxed);
                        if result.is_err() {
                            return write_rx;
                        }
                    }
                    Some(WriteCmd::Control(json)) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            return write_rx;
                        }
                    }
                    Some(WriteCmd::Close) | None => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            })))
                            .await;
                        return write_rx;
                    }
                }
            }
        }
    }
}

/// Discard queued audio left over from a dead socket epoch so a reconnect
/// starts clean, and zero the buffered-byte gauge. Control messages are
/// preserved in order.
pub fn drain_stale_audio(write_rx: &mut mpsc::Receiver<WriteCmd>, buffered: &AtomicUsize) -> Vec<WriteCmd> {
    let mut keep = Vec::new();
    while let Ok(cmd) = write_rx.try_recv() {
        match cmd {
            WriteCmd::Audio(_) => {}
            other => keep.push(other),
        }
    }
    buffered.store(0, Ordering::Relaxed);
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_audio_respects_buffer_ceiling() {
        let (handle, mut rx) = handle_pair("voice_agent", 16, 100);

        assert!(handle.send_audio(vec![0u8; 60]));
        assert!(handle.send_audio(vec![0u8; 60]));
        assert_eq!(handle.buffered_bytes(), 120);
        // Above the 100-byte ceiling: dropped, not queued.
        assert!(!handle.send_audio(vec![0u8; 60]));
        assert_eq!(handle.pressure().dropped_pending(), 1);

        // Two frames queued, no third.
        assert!(matches!(rx.try_recv(), Ok(WriteCmd::Audio(_))));
        assert!(matches!(rx.try_recv(), Ok(WriteCmd::Audio(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_audio_fails_on_closed_socket() {
        let (handle, rx) = handle_pair("voice_agent", 16, 1024);
        drop(rx);
        assert!(!handle.send_audio(vec![0u8; 10]));
        assert!(handle.send_control("{}".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn stale_audio_is_discarded_but_controls_survive() {
        let (handle, mut rx) = handle_pair("transcription", 16, 1024);
        assert!(handle.send_audio(vec![0u8; 10]));
        handle.send_control("{\"type\":\"KeepAlive\"}".into()).await.unwrap();
        assert!(handle.send_audio(vec![0u8; 10]));

        let buffered = Arc::new(AtomicUsize::new(20));
        let kept = drain_stale_audio(&mut rx, &buffered);
        assert_eq!(kept.len(), 1);
        assert!(matches!(kept[0], WriteCmd::Control(_)));
        assert_eq!(buffered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn close_code_classification() {
        assert!(close_is_permanent(1000));
        assert!(close_is_permanent(1008));
        assert!(!close_is_permanent(1005));
        assert!(!close_is_permanent(1011));
        assert!(!close_is_permanent(4000));
        assert_eq!(describe_close(1011), "server error");
    }

    #[test]
    fn backoff_is_linear_in_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(3));
    }
}
