use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::Role;

/// Tracks which participants are silenced on the voice-agent path and
/// decides when the silence has lasted long enough to require a
/// `KeepAlive` control message upstream.
///
/// Mute commands take effect at their receipt instant: a frame is gated
/// only when its capture timestamp is at or past that instant, so frames
/// already in flight may still be forwarded. Mutated only on validated
/// coach commands or by the supervisor; the router reads it through
/// cheap snapshot calls. The transcription path never consults this gate.
pub struct MuteGate {
    muted: Mutex<HashMap<String, Instant>>,
    /// Last moment an audio frame was accepted by the voice-agent sink.
    last_voice_send: Mutex<Instant>,
    keepalive_interval: Duration,
}

impl MuteGate {
    pub fn new(keepalive_interval: Duration) -> Self {
        Self {
            muted: Mutex::new(HashMap::new()),
            last_voice_send: Mutex::new(Instant::now()),
            keepalive_interval,
        }
    }

    /// Silence `identity` on the voice-agent path from this moment. The
    /// AI participant is never silenced: it does not consume its own
    /// output, so a mute request for it is an invariant violation and is
    /// discarded.
    pub fn mute(&self, identity: &str) {
        if Role::from_identity(identity) == Some(Role::Ai) {
            tracing::error!(identity, "refusing to add AI participant to mute set");
            return;
        }
        self.muted
            .lock()
            .unwrap()
            .entry(identity.to_string())
            .or_insert_with(Instant::now);
    }

    pub fn unmute(&self, identity: &str) {
        self.muted.lock().unwrap().remove(identity);
    }

    pub fn is_muted(&self, identity: &str) -> bool {
        self.muted.lock().unwrap().contains_key(identity)
    }

    /// Whether a frame captured at `captured_at` from `identity` is
    /// gated. Frames captured before the mute command was received pass.
    pub fn is_muted_at(&self, identity: &str, captured_at: Instant) -> bool {
        self.muted
            .lock()
            .unwrap()
            .get(identity)
            .map(|muted_at| captured_at >= *muted_at)
            .unwrap_or(false)
    }

    /// Apply a coach-wide pause/resume to a set of identities.
    pub fn set_all(&self, identities: &[String], paused: bool) {
        for identity in identities {
            if paused {
                self.mute(identity);
            } else {
                self.unmute(identity);
            }
        }
    }

    /// Record that a frame was accepted by the voice-agent transport,
    /// resetting the keep-alive clock.
    pub fn note_voice_send(&self) {
        *self.last_voice_send.lock().unwrap() = Instant::now();
    }

    /// Returns true when the gated channel has been silent for a full
    /// keep-alive interval. The clock resets on a positive answer so the
    /// next keep-alive is due one interval later.
    pub fn on_tick(&self, now: Instant) -> bool {
        let mut last = self.last_voice_send.lock().unwrap();
        if now.duration_since(*last) >= self.keepalive_interval {
            *last = now;
            true
        } else {
            false
        }
    }
}
