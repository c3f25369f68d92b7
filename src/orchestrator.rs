use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::functions::{FunctionDispatcher, FunctionRegistry, Settlement};
use crate::gate::MuteGate;
use crate::hub::{ParticipantSink, RoomHub};
use crate::models::{AgentState, PeerInfo, Role, SignalMessage, SpeakerRole, TranscriptSource};
use crate::router::AudioRouter;
use crate::transcript::{TranscriptLog, TranscriptStore};
use crate::transcription::{TranscriptionConnection, TranscriptionEvent};
use crate::upstream::UpstreamHandle;
use crate::voice_agent::{self, AgentEvent, SettingsMessage, VoiceAgentConnection};

/// Control commands accepted by a running orchestrator.
#[derive(Debug)]
pub enum AgentCommand {
    Whisper { from: String, text: String },
    PauseAll { paused: bool },
    Shutdown,
}

/// Hub-facing handle: where sessions push audio frames and coach
/// commands for this room's agent.
#[derive(Clone)]
pub struct OrchestratorHandle {
    pub identity: String,
    pub router: Arc<AudioRouter>,
    pub commands: mpsc::Sender<AgentCommand>,
}

const EVENT_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 32;
const SETTLE_QUEUE: usize = 64;
const AI_SINK_CAPACITY: usize = 64;
const KEEPALIVE_TICK: Duration = Duration::from_secs(1);

pub struct AgentOrchestrator;

impl AgentOrchestrator {
    /// Bring up one orchestrator for `room_id`: both upstreams connect in
    /// parallel and the whole spawn fails if either cannot; nothing is
    /// left partially open.
    pub async fn spawn(
        room_id: String,
        hub: Arc<RoomHub>,
        cfg: Arc<AppConfig>,
        registry: Arc<FunctionRegistry>,
        store: Option<Arc<dyn TranscriptStore>>,
    ) -> AppResult<(OrchestratorHandle, JoinHandle<()>)> {
        let session_id = Uuid::now_v7();
        let identity = format!("ai-{}", session_id.simple());

        let settings = Arc::new(Mutex::new(SettingsMessage::from_config(
            &cfg,
            cfg.agent.coaching_prompt.clone(),
        )));

        let (va_events_tx, va_events) = mpsc::channel(EVENT_QUEUE);
        let (stt_events_tx, stt_events) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connections = tokio::try_join!(
            VoiceAgentConnection::start(
                &cfg,
                settings.clone(),
                va_events_tx,
                shutdown_rx.clone(),
            ),
            TranscriptionConnection::start(&cfg, stt_events_tx, shutdown_rx.clone()),
        );
        let ((va, _va_task), (stt, _stt_task)) = match connections {
            Ok(pair) => pair,
            Err(e) => {
                // One side may have opened before the other failed.
                let _ = shutdown_tx.send(true);
                return Err(e);
            }
        };

        let gate = Arc::new(MuteGate::new(cfg.keepalive_interval()));
        let router = Arc::new(AudioRouter::new(gate.clone(), cfg.limits.audio_queue_frames));
        let dispatcher = FunctionDispatcher::new(registry, cfg.function_call_timeout());
        let (settle_tx, settle_rx) = mpsc::channel(SETTLE_QUEUE);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);

        // The agent joins the room like any participant; signaling
        // addressed to it is drained and discarded since its media plane
        // is brokered here, not negotiated peer-to-peer.
        let ai_sink = ParticipantSink::new(AI_SINK_CAPACITY);
        if let Err(e) = hub.join(
            &room_id,
            PeerInfo {
                user_id: identity.clone(),
                user_name: "Coach AI".to_string(),
                user_role: Role::Ai,
                participant_type: Some("ai".to_string()),
                should_initiate: None,
            },
            ai_sink.clone(),
        ) {
            let _ = shutdown_tx.send(true);
            return Err(e);
        }
        tokio::spawn({
            let ai_sink = ai_sink.clone();
            async move { while ai_sink.pop().await.is_some() {} }
        });

        tokio::spawn(router.clone().run(va.clone(), stt.clone(), shutdown_rx.clone()));
        tokio::spawn({
            let hub = hub.clone();
            let room = room_id.clone();
            router
                .clone()
                .run_agent_pump(shutdown_rx.clone(), move |chunk| {
                    hub.fanout_agent_audio(&room, chunk)
                })
        });

        let handle = OrchestratorHandle {
            identity: identity.clone(),
            router: router.clone(),
            commands: commands_tx,
        };

        let event_loop = EventLoop {
            room_id,
            identity,
            hub,
            base_prompt: cfg.agent.coaching_prompt.clone(),
            settings,
            gate,
            router,
            va,
            stt,
            va_events,
            stt_events,
            commands_rx,
            settle_rx,
            settle_tx,
            dispatcher,
            log: TranscriptLog::new(session_id),
            store,
            shutdown_tx,
            ai_sink,
            agent_speaking: false,
            last_state: None,
            pending_whisper: false,
            whisper_notes: Vec::new(),
        };
        let task = tokio::spawn(event_loop.run());

        Ok((handle, task))
    }
}

struct EventLoop {
    room_id: String,
    identity: String,
    hub: Arc<RoomHub>,
    base_prompt: String,
    settings: Arc<Mutex<SettingsMessage>>,
    gate: Arc<MuteGate>,
    router: Arc<AudioRouter>,
    va: UpstreamHandle,
    stt: UpstreamHandle,
    va_events: mpsc::Receiver<AgentEvent>,
    stt_events: mpsc::Receiver<TranscriptionEvent>,
    commands_rx: mpsc::Receiver<AgentCommand>,
    settle_rx: mpsc::Receiver<Settlement>,
    settle_tx: mpsc::Sender<Settlement>,
    dispatcher: FunctionDispatcher,
    log: TranscriptLog,
    store: Option<Arc<dyn TranscriptStore>>,
    shutdown_tx: watch::Sender<bool>,
    ai_sink: Arc<ParticipantSink>,
    agent_speaking: bool,
    last_state: Option<AgentState>,
    pending_whisper: bool,
    whisper_notes: Vec<String>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_TICK);
        keepalive.tick().await;

        loop {
            let stop = tokio::select! {
                Some(event) = self.va_events.recv() => self.on_agent_event(event).await,
                Some(event) = self.stt_events.recv() => self.on_transcription_event(event).await,
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
                Some(settlement) = self.settle_rx.recv() => {
                    self.on_settlement(settlement).await;
                    false
                }
                _ = keepalive.tick() => {
                    if self.gate.on_tick(Instant::now()) {
                        let _ = self.va.send_control(voice_agent::keep_alive()).await;
                    }
                    false
                }
                else => true,
            };
            if stop {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn on_agent_event(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::SessionWelcome { session_id } => {
                tracing::info!(
                    room = %self.room_id,
                    upstream_session = session_id.as_deref().unwrap_or("unknown"),
                    "voice agent session established"
                );
            }
            AgentEvent::Ready => {
                self.broadcast_state(AgentState::Ready);
            }
            AgentEvent::UserStartedSpeaking => {
                if self.agent_speaking {
                    let purged = self.router.clear_agent_audio();
                    self.agent_speaking = false;
                    self.broadcast_state(AgentState::Ready);
                    tracing::debug!(room = %self.room_id, purged, "barge-in, agent audio cleared");
                }
            }
            AgentEvent::UserStoppedSpeaking => {}
            AgentEvent::AgentStartedSpeaking => {
                self.agent_speaking = true;
                self.broadcast_state(AgentState::Speaking);
            }
            AgentEvent::AgentAudioDone => {
                self.agent_speaking = false;
                self.broadcast_state(AgentState::Ready);
            }
            AgentEvent::ConversationText { role, content } => {
                let entry =
                    self.log
                        .append(role, content, TranscriptSource::VoiceAgent, true);
                self.broadcast_transcript(role, entry.text, TranscriptSource::VoiceAgent, true);
            }
            AgentEvent::PromptUpdated => {
                if self.pending_whisper {
                    self.pending_whisper = false;
                    tracing::info!(room = %self.room_id, "coach whisper applied upstream");
                }
            }
            AgentEvent::FunctionCallRequest { id, name, input } => {
                tracing::info!(room = %self.room_id, call_id = %id, function = %name, "function call requested");
                self.dispatcher.dispatch(id, name, input, self.settle_tx.clone());
            }
            AgentEvent::Audio(chunk) => {
                // After a barge-in purge, trailing TTS chunks are dropped
                // until the next AgentStartedSpeaking.
                if self.agent_speaking {
                    self.router.push_agent_audio(chunk);
                }
            }
            AgentEvent::UpstreamError { description } => {
                tracing::warn!(room = %self.room_id, "voice agent error event: {}", description);
            }
            AgentEvent::Lost { code } => {
                tracing::warn!(room = %self.room_id, ?code, "voice agent connection lost");
                self.agent_speaking = false;
                self.router.clear_agent_audio();
                self.broadcast_state(AgentState::Failed);
            }
            AgentEvent::Reconnecting { attempt } => {
                tracing::info!(room = %self.room_id, attempt, "voice agent reconnecting");
                self.broadcast_state(AgentState::Spawning);
            }
            AgentEvent::PermanentFailure => {
                tracing::error!(room = %self.room_id, "voice agent permanently unavailable");
                self.broadcast_state(AgentState::Failed);
                return true;
            }
            AgentEvent::Closed => return true,
        }
        false
    }

    async fn on_transcription_event(&mut self, event: TranscriptionEvent) -> bool {
        match event {
            TranscriptionEvent::Result(result) => {
                if result.is_final {
                    tracing::debug!(
                        room = %self.room_id,
                        confidence = result.confidence,
                        speech_final = result.speech_final,
                        speaker = ?result.speaker_tag,
                        "committing final transcript"
                    );
                    let entry = self.log.append(
                        SpeakerRole::User,
                        result.alt,
                        TranscriptSource::Transcription,
                        true,
                    );
                    self.broadcast_transcript(
                        SpeakerRole::User,
                        entry.text,
                        TranscriptSource::Transcription,
                        true,
                    );
                } else {
                    self.broadcast_transcript(
                        SpeakerRole::User,
                        result.alt,
                        TranscriptSource::Transcription,
                        false,
                    );
                }
            }
            TranscriptionEvent::Reconnecting { attempt } => {
                tracing::info!(room = %self.room_id, attempt, "transcription reconnecting");
            }
            TranscriptionEvent::Lost { code } => {
                tracing::warn!(room = %self.room_id, ?code, "transcription connection lost");
            }
            TranscriptionEvent::PermanentFailure => {
                tracing::error!(room = %self.room_id, "transcription permanently unavailable");
                return true;
            }
            TranscriptionEvent::Closed => return true,
        }
        false
    }

    async fn on_command(&mut self, command: AgentCommand) -> bool {
        match command {
            AgentCommand::Whisper { from, text } => {
                tracing::info!(room = %self.room_id, coach = %from, "coach whisper received");
                self.whisper_notes.push(text);
                let merged = self.merged_prompt();
                self.settings.lock().unwrap().set_prompt(merged.clone());
                if self
                    .va
                    .send_control(voice_agent::update_prompt(&merged))
                    .await
                    .is_ok()
                {
                    self.pending_whisper = true;
                }
            }
            AgentCommand::PauseAll { paused } => {
                let humans = self.hub.human_identities(&self.room_id);
                tracing::info!(room = %self.room_id, paused, targets = humans.len(), "agent pause toggled");
                self.gate.set_all(&humans, paused);
            }
            AgentCommand::Shutdown => return true,
        }
        false
    }

    async fn on_settlement(&mut self, settlement: Settlement) {
        if settlement.ok {
            tracing::info!(room = %self.room_id, call_id = %settlement.call_id, "function call settled");
        } else {
            tracing::warn!(
                room = %self.room_id,
                call_id = %settlement.call_id,
                "function call settled with error: {}",
                settlement.output
            );
        }
        let _ = self
            .va
            .send_control(voice_agent::function_call_response(
                &settlement.call_id,
                &settlement.output,
            ))
            .await;
    }

    /// The base coaching prompt plus every whisper received so far.
    fn merged_prompt(&self) -> String {
        if self.whisper_notes.is_empty() {
            return self.base_prompt.clone();
        }
        let mut merged = self.base_prompt.clone();
        merged.push_str("\n\nCoach guidance:");
        for note in &self.whisper_notes {
            merged.push_str("\n- ");
            merged.push_str(note);
        }
        merged
    }

    fn broadcast_state(&mut self, state: AgentState) {
        if self.last_state == Some(state) {
            return;
        }
        self.last_state = Some(state);
        self.hub.broadcast(
            &self.room_id,
            &SignalMessage::AgentStateUpdate { state },
            None,
        );
    }

    fn broadcast_transcript(
        &self,
        role: SpeakerRole,
        content: String,
        source: TranscriptSource,
        is_final: bool,
    ) {
        self.hub.broadcast(
            &self.room_id,
            &SignalMessage::Transcript {
                role,
                content,
                is_final,
                source,
                ts: chrono::Utc::now(),
            },
            Some(&self.identity),
        );
    }

    /// Idempotent cascade: settle outstanding calls, close both upstreams
    /// with a normal close, stop the router tasks, persist the transcript,
    /// and leave the room.
    async fn shutdown(mut self) {
        tracing::info!(room = %self.room_id, "orchestrator shutting down");

        self.dispatcher.settle_all_pending(&self.settle_tx);
        while let Ok(settlement) = self.settle_rx.try_recv() {
            self.on_settlement(settlement).await;
        }

        self.va.close().await;
        self.stt.close().await;
        let _ = self.shutdown_tx.send(true);

        self.broadcast_state(AgentState::Offline);
        self.log.hand_off(self.store.as_deref());

        self.ai_sink.close();
        self.hub.leave(&self.room_id, &self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::upstream::{handle_pair, WriteCmd};

    fn test_config() -> Arc<AppConfig> {
        Arc::new(serde_json::from_str("{}").unwrap())
    }

    fn test_loop(
        hub: Arc<RoomHub>,
        va: UpstreamHandle,
        stt: UpstreamHandle,
    ) -> (
        EventLoop,
        mpsc::Sender<AgentEvent>,
        mpsc::Sender<TranscriptionEvent>,
        mpsc::Sender<AgentCommand>,
    ) {
        let cfg = test_config();
        let session_id = Uuid::now_v7();
        let gate = Arc::new(MuteGate::new(cfg.keepalive_interval()));
        let router = Arc::new(AudioRouter::new(gate.clone(), 64));
        let (va_tx, va_events) = mpsc::channel(64);
        let (stt_tx, stt_events) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (settle_tx, settle_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = watch::channel(false);
        let registry = Arc::new(FunctionRegistry::new());

        let event_loop = EventLoop {
            room_id: "r1".to_string(),
            identity: "ai-test".to_string(),
            hub,
            base_prompt: cfg.agent.coaching_prompt.clone(),
            settings: Arc::new(Mutex::new(SettingsMessage::from_config(
                &cfg,
                cfg.agent.coaching_prompt.clone(),
            ))),
            gate,
            router,
            va,
            stt,
            va_events,
            stt_events,
            commands_rx,
            settle_rx,
            settle_tx,
            dispatcher: FunctionDispatcher::new(registry, Duration::from_secs(10)),
            log: TranscriptLog::new(session_id),
            store: None,
            shutdown_tx,
            ai_sink: ParticipantSink::new(8),
            agent_speaking: false,
            last_state: None,
            pending_whisper: false,
            whisper_notes: Vec::new(),
        };
        (event_loop, va_tx, stt_tx, commands_tx)
    }

    fn drain_controls(rx: &mut mpsc::Receiver<WriteCmd>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let WriteCmd::Control(json) = cmd {
                out.push(serde_json::from_str(&json).unwrap());
            }
        }
        out
    }

    fn client_sink(hub: &Arc<RoomHub>) -> Arc<ParticipantSink> {
        let sink = ParticipantSink::new(64);
        hub.join(
            "r1",
            PeerInfo {
                user_id: "client-1".into(),
                user_name: "Dana".into(),
                user_role: Role::Client,
                participant_type: None,
                should_initiate: None,
            },
            sink.clone(),
        )
        .unwrap();
        // Clear the join messages.
        while sink_try_pop(&sink).is_some() {}
        sink
    }

    fn sink_try_pop(sink: &Arc<ParticipantSink>) -> Option<serde_json::Value> {
        // Non-blocking pop through the public API would await; tests poll
        // with a zero-duration timeout instead.
        futures_util::FutureExt::now_or_never(sink.pop()).flatten().and_then(|out| match out {
            Outbound::Text { payload, .. } => serde_json::from_str(&payload).ok(),
            Outbound::Audio(_) => Some(serde_json::json!({"type": "audio"})),
        })
    }

    #[tokio::test]
    async fn barge_in_clears_audio_and_broadcasts_ready() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let sink = client_sink(&hub);
        let (va, _va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop.on_agent_event(AgentEvent::AgentStartedSpeaking).await;
        for i in 0..10u8 {
            event_loop.on_agent_event(AgentEvent::Audio(vec![i; 16])).await;
        }
        assert_eq!(event_loop.router.pending_agent_audio(), 10);

        event_loop.on_agent_event(AgentEvent::UserStartedSpeaking).await;
        assert_eq!(event_loop.router.pending_agent_audio(), 0);
        assert!(!event_loop.agent_speaking);

        // Stale TTS after the purge is not requeued.
        event_loop.on_agent_event(AgentEvent::Audio(vec![9; 16])).await;
        assert_eq!(event_loop.router.pending_agent_audio(), 0);

        let states: Vec<String> = std::iter::from_fn(|| sink_try_pop(&sink))
            .filter(|m| m["type"] == "agent_state")
            .map(|m| m["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(states, ["speaking", "ready"]);
    }

    #[tokio::test]
    async fn conversation_text_appends_and_broadcasts() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let sink = client_sink(&hub);
        let (va, _va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop
            .on_agent_event(AgentEvent::ConversationText {
                role: SpeakerRole::Assistant,
                content: "How did you sleep?".into(),
            })
            .await;

        assert_eq!(event_loop.log.len(), 1);
        let msg = std::iter::from_fn(|| sink_try_pop(&sink))
            .find(|m| m["type"] == "transcript")
            .unwrap();
        assert_eq!(msg["role"], "assistant");
        assert_eq!(msg["content"], "How did you sleep?");
        assert_eq!(msg["source"], "voice_agent");
        assert_eq!(msg["final"], true);
    }

    #[tokio::test]
    async fn final_transcription_results_are_committed_interim_are_not() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let _sink = client_sink(&hub);
        let (va, _va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop
            .on_transcription_event(TranscriptionEvent::Result(
                crate::transcription::TranscriptResult {
                    alt: "I sle".into(),
                    confidence: 0.5,
                    is_final: false,
                    speech_final: false,
                    speaker_tag: None,
                },
            ))
            .await;
        assert_eq!(event_loop.log.len(), 0);

        event_loop
            .on_transcription_event(TranscriptionEvent::Result(
                crate::transcription::TranscriptResult {
                    alt: "I slept badly".into(),
                    confidence: 0.97,
                    is_final: true,
                    speech_final: true,
                    speaker_tag: None,
                },
            ))
            .await;
        assert_eq!(event_loop.log.len(), 1);
        let entries = event_loop.log.snapshot();
        assert_eq!(entries[0].source, TranscriptSource::Transcription);
        assert_eq!(entries[0].role, SpeakerRole::User);
    }

    #[tokio::test]
    async fn whisper_updates_prompt_without_transcript_broadcast() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let sink = client_sink(&hub);
        let (va, mut va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop
            .on_command(AgentCommand::Whisper {
                from: "coach-7".into(),
                text: "Focus on sleep hygiene".into(),
            })
            .await;

        let controls = drain_controls(&mut va_rx);
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0]["type"], "UpdatePrompt");
        let prompt = controls[0]["prompt"].as_str().unwrap();
        assert!(prompt.contains("Focus on sleep hygiene"));
        assert!(prompt.contains(&event_loop.base_prompt));
        assert!(event_loop.pending_whisper);

        // No transcript or TTS side effects for the room.
        assert!(std::iter::from_fn(|| sink_try_pop(&sink))
            .all(|m| m["type"] != "transcript"));

        event_loop.on_agent_event(AgentEvent::PromptUpdated).await;
        assert!(!event_loop.pending_whisper);
    }

    #[tokio::test]
    async fn pause_all_mutes_humans_only() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let _sink = client_sink(&hub);
        let (va, _va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop.on_command(AgentCommand::PauseAll { paused: true }).await;
        assert!(event_loop.gate.is_muted("client-1"));

        event_loop.on_command(AgentCommand::PauseAll { paused: false }).await;
        assert!(!event_loop.gate.is_muted("client-1"));
    }

    #[tokio::test]
    async fn settlement_sends_function_call_response() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let (va, mut va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop
            .on_settlement(Settlement {
                call_id: "fc1".into(),
                output: "Stress patterns improving; weekly sessions current".into(),
                ok: true,
            })
            .await;

        let controls = drain_controls(&mut va_rx);
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0]["type"], "FunctionCallResponse");
        assert_eq!(controls[0]["function_call_id"], "fc1");
        assert_eq!(
            controls[0]["output"],
            "Stress patterns improving; weekly sessions current"
        );
    }

    #[tokio::test]
    async fn reconnect_cycle_follows_failed_spawning_ready() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let sink = client_sink(&hub);
        let (va, _va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        event_loop.on_agent_event(AgentEvent::Ready).await;
        event_loop.on_agent_event(AgentEvent::Lost { code: Some(1011) }).await;
        event_loop.on_agent_event(AgentEvent::Reconnecting { attempt: 1 }).await;
        event_loop.on_agent_event(AgentEvent::Ready).await;

        let states: Vec<String> = std::iter::from_fn(|| sink_try_pop(&sink))
            .filter(|m| m["type"] == "agent_state")
            .map(|m| m["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(states, ["ready", "failed", "spawning", "ready"]);
    }

    #[tokio::test]
    async fn permanent_failure_requests_shutdown() {
        let hub = RoomHub::new(Duration::from_secs(30), 64);
        let (va, _va_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, _stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (mut event_loop, _va_tx, _stt_tx, _cmd) = test_loop(hub.clone(), va, stt);

        assert!(!event_loop.on_agent_event(AgentEvent::Lost { code: Some(1011) }).await);
        assert!(event_loop.on_agent_event(AgentEvent::PermanentFailure).await);
        assert!(event_loop.on_transcription_event(TranscriptionEvent::PermanentFailure).await);
    }
}
