use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::upstream::{
    self, backoff_delay, close_is_permanent, describe_close, drain_stale_audio, handle_pair,
    writer_task, UpstreamHandle, WriteCmd, MAX_RECONNECT_ATTEMPTS,
};

/// Idle gap after which the writer emits a keep-alive so the provider does
/// not drop a silent session.
const IDLE_KEEPALIVE: Duration = Duration::from_secs(5);

const WRITE_QUEUE_DEPTH: usize = 256;

// ─── Inbound wire format ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResultsMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    channel: Option<ResultsChannel>,
    is_final: Option<bool>,
    speech_final: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    alternatives: Option<Vec<ResultsAlternative>>,
}

#[derive(Debug, Deserialize)]
struct ResultsAlternative {
    transcript: Option<String>,
    confidence: Option<f64>,
    words: Option<Vec<ResultsWord>>,
}

#[derive(Debug, Deserialize)]
struct ResultsWord {
    speaker: Option<u32>,
}

/// One committable (or interim) transcription result.
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    pub alt: String,
    pub confidence: f64,
    pub is_final: bool,
    pub speech_final: bool,
    pub speaker_tag: Option<u32>,
}

#[derive(Debug)]
pub enum TranscriptionEvent {
    Result(TranscriptResult),
    Reconnecting { attempt: u32 },
    Lost { code: Option<u16> },
    PermanentFailure,
    Closed,
}

/// Parse one provider JSON frame into a result. Empty transcripts and
/// non-`Results` messages yield None.
fn parse_results(text: &str) -> Option<TranscriptResult> {
    let msg: ResultsMessage = serde_json::from_str(text).ok()?;
    if msg.kind.as_deref() != Some("Results") {
        return None;
    }

    let alt = msg.channel?.alternatives?.into_iter().next()?;
    let transcript = alt.transcript.unwrap_or_default().trim().to_string();
    if transcript.is_empty() {
        return None;
    }

    // Majority speaker across the words, when diarization is on.
    let speaker_tag = {
        let words = alt.words.as_deref().unwrap_or(&[]);
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for w in words {
            if let Some(s) = w.speaker {
                *counts.entry(s).or_insert(0) += 1;
            }
        }
        counts.into_iter().max_by_key(|(_, c)| *c).map(|(s, _)| s)
    };

    Some(TranscriptResult {
        alt: transcript,
        confidence: alt.confidence.unwrap_or(0.0),
        is_final: msg.is_final.unwrap_or(false),
        speech_final: msg.speech_final.unwrap_or(false),
        speaker_tag,
    })
}

// ─── Connection ─────────────────────────────────────────────────────────────

pub struct TranscriptionConnection;

impl TranscriptionConnection {
    /// Open the socket (failing fast) and spawn the connection task, which
    /// reconnects per the shared policy.
    pub async fn start(
        cfg: &AppConfig,
        events: mpsc::Sender<TranscriptionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<(UpstreamHandle, JoinHandle<()>)> {
        let stream = upstream::connect(
            &cfg.upstream.transcription_url,
            &cfg.upstream.transcription_api_key,
            cfg.connect_timeout(),
        )
        .await?;

        let (handle, write_rx) = handle_pair(
            "transcription",
            WRITE_QUEUE_DEPTH,
            cfg.limits.outbound_buffer_max_bytes,
        );

        let url = cfg.upstream.transcription_url.clone();
        let api_key = cfg.upstream.transcription_api_key.clone();
        let connect_timeout = cfg.connect_timeout();
        let task_handle = handle.clone();
        let task = tokio::spawn(run(
            url,
            api_key,
            connect_timeout,
            task_handle,
            Some(stream),
            write_rx,
            events,
            shutdown,
        ));
        Ok((handle, task))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    url: String,
    api_key: String,
    connect_timeout: Duration,
    handle: UpstreamHandle,
    mut ready_stream: Option<upstream::WsStream>,
    mut write_rx: mpsc::Receiver<WriteCmd>,
    events: mpsc::Sender<TranscriptionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let buffered = handle.buffered_gauge();
    let mut attempt: u32 = 0;

    loop {
        let ws = match ready_stream.take() {
            Some(ws) => ws,
            None => {
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    let _ = events.send(TranscriptionEvent::PermanentFailure).await;
                    return;
                }
                let _ = events.send(TranscriptionEvent::Reconnecting { attempt }).await;
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                    _ = shutdown.changed() => return,
                }
                match upstream::connect(&url, &api_key, connect_timeout).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        tracing::warn!(attempt, "transcription reconnect failed: {}", e);
                        continue;
                    }
                }
            }
        };

        let (sink, mut reader) = ws.split();
        drain_stale_audio(&mut write_rx, &buffered);

        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(writer_task(
            sink,
            write_rx,
            buffered.clone(),
            stop_rx,
            Some(IDLE_KEEPALIVE),
        ));

        let mut close_code: Option<u16> = None;
        let mut stopping = false;
        let mut saw_result = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    stopping = true;
                    break;
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(result) = parse_results(&text) {
                            saw_result = true;
                            let _ = events.send(TranscriptionEvent::Result(result)).await;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_code = frame.map(|f| f.code.into());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("transcription socket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }

        if saw_result {
            attempt = 0;
        }

        let _ = stop_tx.send(());
        write_rx = match writer.await {
            Ok(rx) => rx,
            Err(_) => {
                let _ = events.send(TranscriptionEvent::PermanentFailure).await;
                return;
            }
        };

        if stopping {
            return;
        }

        match close_code {
            Some(1000) => {
                let _ = events.send(TranscriptionEvent::Closed).await;
                return;
            }
            Some(code) if close_is_permanent(code) => {
                tracing::error!(code, "transcription closed: {}", describe_close(code));
                let _ = events.send(TranscriptionEvent::PermanentFailure).await;
                return;
            }
            code => {
                if let Some(code) = code {
                    tracing::warn!(code, "transcription closed: {}", describe_close(code));
                }
                let _ = events.send(TranscriptionEvent::Lost { code }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_results_parse_with_confidence() {
        let text = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "I slept badly", "confidence": 0.97}]},
            "is_final": true,
            "speech_final": true
        }"#;
        let result = parse_results(text).unwrap();
        assert_eq!(result.alt, "I slept badly");
        assert!(result.is_final);
        assert!(result.speech_final);
        assert!((result.confidence - 0.97).abs() < 1e-9);
        assert_eq!(result.speaker_tag, None);
    }

    #[test]
    fn interim_results_are_not_final() {
        let text = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "I sle"}]},
            "is_final": false
        }"#;
        let result = parse_results(text).unwrap();
        assert!(!result.is_final);
        assert!(!result.speech_final);
    }

    #[test]
    fn majority_speaker_tag_is_extracted() {
        let text = r#"{
            "type": "Results",
            "channel": {"alternatives": [{
                "transcript": "two voices",
                "words": [{"speaker": 1}, {"speaker": 1}, {"speaker": 0}]
            }]},
            "is_final": true
        }"#;
        let result = parse_results(text).unwrap();
        assert_eq!(result.speaker_tag, Some(1));
    }

    #[test]
    fn empty_and_foreign_messages_are_dropped() {
        assert!(parse_results(r#"{"type":"Metadata"}"#).is_none());
        assert!(parse_results(
            r#"{"type":"Results","channel":{"alternatives":[{"transcript":"  "}]}}"#
        )
        .is_none());
        assert!(parse_results("garbage").is_none());
    }
}
