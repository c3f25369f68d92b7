use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::models::SpeakerRole;
use crate::upstream::{
    self, backoff_delay, close_is_permanent, describe_close, drain_stale_audio, handle_pair,
    writer_task, UpstreamHandle, WriteCmd, MAX_RECONNECT_ATTEMPTS,
};

// ─── Settings (first message after open) ────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SettingsMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    pub audio: AudioSettings,
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioSettings {
    pub input: AudioInput,
    pub output: AudioOutput,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioInput {
    pub encoding: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioOutput {
    pub encoding: String,
    pub sample_rate: u32,
    pub container: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSettings {
    pub language: String,
    pub listen: ListenSettings,
    pub think: ThinkSettings,
    pub speak: SpeakSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenSettings {
    pub provider: ListenProvider,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenProvider {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub model: String,
    pub keyterms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkSettings {
    pub provider: ThinkProvider,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkProvider {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub model: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakSettings {
    pub provider: SpeakProvider,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakProvider {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub model: String,
}

impl SettingsMessage {
    /// Build the session settings from configuration, with the given
    /// (possibly whisper-augmented) reasoning prompt.
    pub fn from_config(cfg: &AppConfig, prompt: String) -> Self {
        Self {
            kind: "Settings",
            audio: AudioSettings {
                input: AudioInput {
                    encoding: "linear16".to_string(),
                    sample_rate: 24_000,
                },
                output: AudioOutput {
                    encoding: "linear16".to_string(),
                    sample_rate: 24_000,
                    container: "none".to_string(),
                },
            },
            agent: AgentSettings {
                language: cfg.agent.language.clone(),
                listen: ListenSettings {
                    provider: ListenProvider {
                        kind: "deepgram",
                        model: cfg.agent.stt_model.clone(),
                        keyterms: cfg.agent.keyterms.clone(),
                    },
                },
                think: ThinkSettings {
                    provider: ThinkProvider {
                        kind: "open_ai",
                        model: cfg.agent.llm_model.clone(),
                        temperature: cfg.agent.temperature,
                    },
                    prompt,
                },
                speak: SpeakSettings {
                    provider: SpeakProvider {
                        kind: "deepgram",
                        model: cfg.agent.tts_model.clone(),
                    },
                },
                greeting: cfg.agent.greeting.clone(),
            },
        }
    }

    pub fn set_prompt(&mut self, prompt: String) {
        self.agent.think.prompt = prompt;
    }
}

// ─── Outbound control builders ──────────────────────────────────────────────

pub fn keep_alive() -> String {
    "{\"type\":\"KeepAlive\"}".to_string()
}

pub fn update_prompt(prompt: &str) -> String {
    serde_json::json!({"type": "UpdatePrompt", "prompt": prompt}).to_string()
}

#[allow(dead_code)]
pub fn inject_user_message(content: &str) -> String {
    serde_json::json!({"type": "InjectUserMessage", "content": content}).to_string()
}

#[allow(dead_code)]
pub fn inject_agent_message(content: &str) -> String {
    serde_json::json!({"type": "InjectAgentMessage", "content": content}).to_string()
}

pub fn function_call_response(function_call_id: &str, output: &str) -> String {
    serde_json::json!({
        "type": "FunctionCallResponse",
        "function_call_id": function_call_id,
        "output": output,
    })
    .to_string()
}

// ─── Inbound wire events ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AgentWireEvent {
    Welcome {
        #[serde(default)]
        session_id: Option<String>,
    },
    SettingsApplied,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentStartedSpeaking,
    AgentAudioDone,
    ConversationText {
        role: SpeakerRole,
        content: String,
    },
    PromptUpdated,
    FunctionCallRequest {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Duplicates ConversationText; parsed so it can be dropped cleanly.
    History,
    Error {
        #[serde(default)]
        description: String,
    },
    #[serde(other)]
    Unknown,
}

/// Connection-level events surfaced to the orchestrator.
#[derive(Debug)]
pub enum AgentEvent {
    SessionWelcome { session_id: Option<String> },
    Ready,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentStartedSpeaking,
    AgentAudioDone,
    ConversationText { role: SpeakerRole, content: String },
    PromptUpdated,
    FunctionCallRequest {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Audio(Vec<u8>),
    UpstreamError { description: String },
    /// Abnormal close; a reconnect attempt will follow if budget remains.
    Lost { code: Option<u16> },
    Reconnecting { attempt: u32 },
    PermanentFailure,
    Closed,
}

// ─── Connection ─────────────────────────────────────────────────────────────

pub struct VoiceAgentConnection;

const WRITE_QUEUE_DEPTH: usize = 256;

impl VoiceAgentConnection {
    /// Open the socket (failing fast so the orchestrator never partially
    /// opens) and spawn the connection task that owns it for the rest of
    /// the orchestrator's life, reconnecting per policy.
    pub async fn start(
        cfg: &AppConfig,
        settings: Arc<Mutex<SettingsMessage>>,
        events: mpsc::Sender<AgentEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<(UpstreamHandle, JoinHandle<()>)> {
        let stream = upstream::connect(
            &cfg.upstream.voice_agent_url,
            &cfg.upstream.voice_agent_api_key,
            cfg.connect_timeout(),
        )
        .await?;

        let (handle, write_rx) = handle_pair(
            "voice_agent",
            WRITE_QUEUE_DEPTH,
            cfg.limits.outbound_buffer_max_bytes,
        );

        let ctx = ConnectionCtx {
            url: cfg.upstream.voice_agent_url.clone(),
            api_key: cfg.upstream.voice_agent_api_key.clone(),
            connect_timeout: cfg.connect_timeout(),
            settings,
            handle: handle.clone(),
            events,
            shutdown,
        };
        let task = tokio::spawn(run(ctx, Some(stream), write_rx));
        Ok((handle, task))
    }
}

struct ConnectionCtx {
    url: String,
    api_key: String,
    connect_timeout: Duration,
    settings: Arc<Mutex<SettingsMessage>>,
    handle: UpstreamHandle,
    events: mpsc::Sender<AgentEvent>,
    shutdown: watch::Receiver<bool>,
}

async fn run(mut ctx: ConnectionCtx, mut ready_stream: Option<upstream::WsStream>, write_rx: mpsc::Receiver<WriteCmd>) {
    let buffered = ctx.handle.buffered_gauge();
    let mut write_rx = write_rx;
    let mut attempt: u32 = 0;

    loop {
        let ws = match ready_stream.take() {
            Some(ws) => ws,
            None => {
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    let _ = ctx.events.send(AgentEvent::PermanentFailure).await;
                    return;
                }
                let _ = ctx.events.send(AgentEvent::Reconnecting { attempt }).await;
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                    _ = ctx.shutdown.changed() => return,
                }
                match upstream::connect(&ctx.url, &ctx.api_key, ctx.connect_timeout).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        tracing::warn!(attempt, "voice agent reconnect failed: {}", e);
                        continue;
                    }
                }
            }
        };

        let (mut sink, mut reader) = ws.split();

        // Settings must be the first frame of every socket epoch.
        let settings_result = serde_json::to_string(&*ctx.settings.lock().unwrap());
        let settings_json = match settings_result {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize agent settings: {}", e);
                let _ = ctx.events.send(AgentEvent::PermanentFailure).await;
                return;
            }
        };
        if sink.send(Message::Text(settings_json)).await.is_err() {
            continue;
        }
        // Controls queued while the previous epoch was down are still
        // meaningful (prompt updates, call responses); stale audio is not.
        for cmd in drain_stale_audio(&mut write_rx, &buffered) {
            if let WriteCmd::Control(json) = cmd {
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(writer_task(sink, write_rx, buffered.clone(), stop_rx, None));

        let mut close_code: Option<u16> = None;
        let mut stopping = false;

        loop {
            tokio::select! {
                _ = ctx.shutdown.changed() => {
                    stopping = true;
                    break;
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(payload))) => {
                        let _ = ctx.events.send(AgentEvent::Audio(payload)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = map_wire_event(&text) {
                            if matches!(event, AgentEvent::Ready) {
                                attempt = 0;
                            }
                            let _ = ctx.events.send(event).await;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_code = frame.map(|f| f.code.into());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("voice agent socket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }

        let _ = stop_tx.send(());
        write_rx = match writer.await {
            Ok(rx) => rx,
            Err(_) => {
                let _ = ctx.events.send(AgentEvent::PermanentFailure).await;
                return;
            }
        };

        if stopping {
            return;
        }

        match close_code {
            Some(1000) => {
                let _ = ctx.events.send(AgentEvent::Closed).await;
                return;
            }
            Some(code) if close_is_permanent(code) => {
                tracing::error!(code, "voice agent closed: {}", describe_close(code));
                let _ = ctx.events.send(AgentEvent::PermanentFailure).await;
                return;
            }
            code => {
                if let Some(code) = code {
                    tracing::warn!(code, "voice agent closed: {}", describe_close(code));
                }
                let _ = ctx.events.send(AgentEvent::Lost { code }).await;
            }
        }
    }
}

/// Classify one inbound JSON frame. Returns None for frames the
/// orchestrator has no use for (`History`, unrecognized types).
fn map_wire_event(text: &str) -> Option<AgentEvent> {
    let wire: AgentWireEvent = match serde_json::from_str(text) {
        Ok(wire) => wire,
        Err(e) => {
            tracing::debug!("unparseable voice agent event: {} — raw: {}", e, &text[..text.len().min(200)]);
            return None;
        }
    };

    match wire {
        AgentWireEvent::Welcome { session_id } => Some(AgentEvent::SessionWelcome { session_id }),
        AgentWireEvent::SettingsApplied => Some(AgentEvent::Ready),
        AgentWireEvent::UserStartedSpeaking => Some(AgentEvent::UserStartedSpeaking),
        AgentWireEvent::UserStoppedSpeaking => Some(AgentEvent::UserStoppedSpeaking),
        AgentWireEvent::AgentStartedSpeaking => Some(AgentEvent::AgentStartedSpeaking),
        AgentWireEvent::AgentAudioDone => Some(AgentEvent::AgentAudioDone),
        AgentWireEvent::ConversationText { role, content } => {
            Some(AgentEvent::ConversationText { role, content })
        }
        AgentWireEvent::PromptUpdated => Some(AgentEvent::PromptUpdated),
        AgentWireEvent::FunctionCallRequest { id, name, input } => {
            Some(AgentEvent::FunctionCallRequest { id, name, input })
        }
        AgentWireEvent::History => None,
        AgentWireEvent::Error { description } => {
            Some(AgentEvent::UpstreamError { description })
        }
        AgentWireEvent::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn test_config() -> AppConfig {
        serde_json::from_str("{}").unwrap()
    }

    #[test]
    fn settings_carry_the_wire_shape() {
        let cfg = test_config();
        let settings = SettingsMessage::from_config(&cfg, "Be kind.".to_string());
        let json = serde_json::to_value(&settings).unwrap();

        assert_eq!(json["type"], "Settings");
        assert_eq!(json["audio"]["input"]["encoding"], "linear16");
        assert_eq!(json["audio"]["input"]["sample_rate"], 24_000);
        assert_eq!(json["audio"]["output"]["container"], "none");
        assert_eq!(json["agent"]["language"], "en");
        assert_eq!(json["agent"]["listen"]["provider"]["type"], "deepgram");
        assert_eq!(json["agent"]["listen"]["provider"]["model"], "nova-3-medical");
        assert_eq!(json["agent"]["think"]["provider"]["type"], "open_ai");
        assert_eq!(json["agent"]["think"]["provider"]["model"], "gpt-4o-mini");
        assert_eq!(json["agent"]["think"]["prompt"], "Be kind.");
        assert_eq!(json["agent"]["speak"]["provider"]["model"], "aura-2-thalia-en");
        assert!(json["agent"].get("greeting").is_none());
    }

    #[test]
    fn control_builders_match_protocol() {
        assert_eq!(keep_alive(), "{\"type\":\"KeepAlive\"}");

        let v: serde_json::Value =
            serde_json::from_str(&update_prompt("Focus on sleep hygiene")).unwrap();
        assert_eq!(v["type"], "UpdatePrompt");
        assert_eq!(v["prompt"], "Focus on sleep hygiene");

        let v: serde_json::Value =
            serde_json::from_str(&function_call_response("fc1", "ok")).unwrap();
        assert_eq!(v["type"], "FunctionCallResponse");
        assert_eq!(v["function_call_id"], "fc1");
        assert_eq!(v["output"], "ok");
    }

    #[test]
    fn wire_events_are_classified() {
        assert!(matches!(
            map_wire_event(r#"{"type":"SettingsApplied"}"#),
            Some(AgentEvent::Ready)
        ));
        assert!(matches!(
            map_wire_event(r#"{"type":"UserStartedSpeaking"}"#),
            Some(AgentEvent::UserStartedSpeaking)
        ));
        match map_wire_event(
            r#"{"type":"ConversationText","role":"assistant","content":"hello"}"#,
        ) {
            Some(AgentEvent::ConversationText { role, content }) => {
                assert_eq!(role, SpeakerRole::Assistant);
                assert_eq!(content, "hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
        match map_wire_event(
            r#"{"type":"FunctionCallRequest","id":"fc1","name":"get_client_summary","input":{"client_id":"u1"}}"#,
        ) {
            Some(AgentEvent::FunctionCallRequest { id, name, input }) => {
                assert_eq!(id, "fc1");
                assert_eq!(name, "get_client_summary");
                assert_eq!(input["client_id"], "u1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn history_and_unknown_events_are_dropped() {
        assert!(map_wire_event(r#"{"type":"History","role":"user","content":"x"}"#).is_none());
        assert!(map_wire_event(r#"{"type":"SomethingNew","data":1}"#).is_none());
        assert!(map_wire_event("not json").is_none());
    }
}
