use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

// ─── Participants ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Coach,
    Ai,
}

impl Role {
    /// Derive the role from an identity prefix (`client-*`, `coach-*`, `ai-*`).
    pub fn from_identity(identity: &str) -> Option<Role> {
        if identity.starts_with("client-") {
            Some(Role::Client)
        } else if identity.starts_with("coach-") {
            Some(Role::Coach)
        } else if identity.starts_with("ai-") {
            Some(Role::Ai)
        } else {
            None
        }
    }

    pub fn is_human(&self) -> bool {
        !matches!(self, Role::Ai)
    }
}

/// Public shape of a participant, as enumerated in `peer-discovery` and
/// `user-joined`. `should_initiate` is populated only in `peer-discovery`
/// sent to a joining human; the AI never initiates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "userRole")]
    pub user_role: Role,
    #[serde(
        rename = "participantType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub participant_type: Option<String>,
    #[serde(
        rename = "shouldInitiate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub should_initiate: Option<bool>,
}

// ─── Audio ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    Linear16,
    Opus,
}

impl AudioEncoding {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linear16" => Some(AudioEncoding::Linear16),
            "opus" => Some(AudioEncoding::Opus),
            _ => None,
        }
    }
}

/// 16-bit mono at 24 kHz: 48 payload bytes per millisecond.
const LINEAR16_BYTES_PER_MS: usize = 48;

/// Assumed packet duration when the transport does not declare one.
const OPUS_FRAME_MS: u32 = 20;

/// One frame of participant audio flowing toward the upstream forks.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Identity of the participant the frame was captured from.
    pub source: String,
    pub payload: Vec<u8>,
    /// Monotonic capture timestamp; non-decreasing per participant.
    pub captured_at: Instant,
    pub duration_ms: u32,
}

impl AudioFrame {
    pub fn new(
        source: impl Into<String>,
        payload: Vec<u8>,
        encoding: AudioEncoding,
        captured_at: Instant,
    ) -> Self {
        let duration_ms = match encoding {
            AudioEncoding::Linear16 => {
                ((payload.len() / LINEAR16_BYTES_PER_MS) as u32).max(1)
            }
            AudioEncoding::Opus => OPUS_FRAME_MS,
        };
        Self {
            source: source.into(),
            payload,
            captured_at,
            duration_ms,
        }
    }
}

// ─── Transcript ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    VoiceAgent,
    Transcription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub session_id: Uuid,
    pub role: SpeakerRole,
    pub text: String,
    pub ts: DateTime<Utc>,
    pub source: TranscriptSource,
    pub is_final: bool,
}

// ─── Agent state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Speaking,
    Ready,
    Spawning,
    Failed,
    Offline,
}

// ─── Participant signaling protocol ─────────────────────────────────────────

/// Hub-understood signaling messages. WebRTC payloads (`offer`, `answer`,
/// `ice-candidate`) and unknown types never appear here: they are handled
/// as raw JSON and forwarded opaquely by `toId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userName")]
        user_name: String,
        #[serde(rename = "userRole")]
        user_role: Role,
        #[serde(
            rename = "participantType",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        participant_type: Option<String>,
    },

    #[serde(rename = "peer-discovery")]
    PeerDiscovery {
        peers: Vec<PeerInfo>,
        #[serde(rename = "roomId")]
        room_id: String,
    },

    #[serde(rename = "user-joined")]
    UserJoined {
        #[serde(flatten)]
        peer: PeerInfo,
        #[serde(rename = "shouldInitiate")]
        should_initiate: bool,
    },

    #[serde(rename = "user-left")]
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "coach_whisper")]
    CoachWhisper { text: String },

    #[serde(rename = "pause_ai")]
    PauseAi { paused: bool },

    #[serde(rename = "transcript")]
    Transcript {
        role: SpeakerRole,
        content: String,
        #[serde(rename = "final")]
        is_final: bool,
        source: TranscriptSource,
        ts: DateTime<Utc>,
    },

    #[serde(rename = "agent_state")]
    AgentStateUpdate { state: AgentState },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl SignalMessage {
    /// Hub-level system events survive queue overflow; forwarded signaling
    /// and transcript traffic does not.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            SignalMessage::PeerDiscovery { .. }
                | SignalMessage::UserJoined { .. }
                | SignalMessage::UserLeft { .. }
                | SignalMessage::AgentStateUpdate { .. }
                | SignalMessage::Ping
                | SignalMessage::Pong
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_from_identity_prefixes() {
        assert_eq!(Role::from_identity("client-42"), Some(Role::Client));
        assert_eq!(Role::from_identity("coach-7"), Some(Role::Coach));
        assert_eq!(Role::from_identity("ai-1"), Some(Role::Ai));
        assert_eq!(Role::from_identity("observer-3"), None);
    }

    #[test]
    fn join_round_trip_uses_wire_field_names() {
        let json = r#"{"type":"join","roomId":"r1","userId":"client-42","userName":"Dana","userRole":"client"}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        match &msg {
            SignalMessage::Join {
                room_id, user_role, ..
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(*user_role, Role::Client);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["type"], "join");
        assert_eq!(out["roomId"], "r1");
        assert!(out.get("participantType").is_none());
    }

    #[test]
    fn user_joined_flattens_peer_fields() {
        let msg = SignalMessage::UserJoined {
            peer: PeerInfo {
                user_id: "coach-7".into(),
                user_name: "Sam".into(),
                user_role: Role::Coach,
                participant_type: None,
                should_initiate: None,
            },
            should_initiate: true,
        };
        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["type"], "user-joined");
        assert_eq!(out["userId"], "coach-7");
        assert_eq!(out["shouldInitiate"], true);
    }

    #[test]
    fn transcript_uses_final_and_snake_case_source() {
        let msg = SignalMessage::Transcript {
            role: SpeakerRole::Assistant,
            content: "hello".into(),
            is_final: true,
            source: TranscriptSource::VoiceAgent,
            ts: Utc::now(),
        };
        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["final"], true);
        assert_eq!(out["source"], "voice_agent");
    }

    #[test]
    fn linear16_frame_duration_is_derived_from_length() {
        let frame = AudioFrame::new(
            "client-1",
            vec![0u8; 960], // 20 ms at 24 kHz mono s16
            AudioEncoding::Linear16,
            Instant::now(),
        );
        assert_eq!(frame.duration_ms, 20);

        let opus = AudioFrame::new("client-1", vec![0u8; 120], AudioEncoding::Opus, Instant::now());
        assert_eq!(opus.duration_ms, 20);
    }

    #[test]
    fn ping_pong_are_tag_only() {
        let out = serde_json::to_value(SignalMessage::Pong).unwrap();
        assert_eq!(out, serde_json::json!({"type": "pong"}));
        let back: SignalMessage = serde_json::from_value(out).unwrap();
        assert!(matches!(back, SignalMessage::Pong));
    }
}
