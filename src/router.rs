use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::gate::MuteGate;
use crate::models::{AudioFrame, Role};
use crate::upstream::UpstreamHandle;

/// Per-participant inbound queue depth, in frames. Overflow drops the
/// newest frame so forwarded audio stays in capture order.
const DEFAULT_FRAME_CAP: usize = 64;

/// Pending agent TTS chunks awaiting room fan-out.
const AGENT_OUT_CAP: usize = 1024;

struct InputQueues {
    queues: HashMap<String, VecDeque<AudioFrame>>,
    /// Round-robin drain order; grows as participants first send audio.
    order: Vec<String>,
    cursor: usize,
}

/// Forks participant audio into the gated voice-agent path and the
/// ungated transcription path, one instance per room with an active
/// orchestrator. Also buffers agent TTS audio on its way to the room so
/// barge-in can purge it.
pub struct AudioRouter {
    inputs: Mutex<InputQueues>,
    input_notify: Notify,
    agent_out: Mutex<VecDeque<Vec<u8>>>,
    agent_notify: Notify,
    gate: Arc<MuteGate>,
    frame_cap: usize,
    input_drops: AtomicU64,
    agent_drops: AtomicU64,
    /// Milliseconds of audio accepted by the voice-agent sink.
    forwarded_ms: AtomicU64,
}

impl AudioRouter {
    pub fn new(gate: Arc<MuteGate>, frame_cap: usize) -> Self {
        Self {
            inputs: Mutex::new(InputQueues {
                queues: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
            }),
            input_notify: Notify::new(),
            agent_out: Mutex::new(VecDeque::new()),
            agent_notify: Notify::new(),
            gate,
            frame_cap: if frame_cap == 0 { DEFAULT_FRAME_CAP } else { frame_cap },
            input_drops: AtomicU64::new(0),
            agent_drops: AtomicU64::new(0),
            forwarded_ms: AtomicU64::new(0),
        }
    }

    pub fn gate(&self) -> &Arc<MuteGate> {
        &self.gate
    }

    /// Enqueue one captured frame. The AI's own output never re-enters
    /// the router.
    pub fn offer_frame(&self, frame: AudioFrame) {
        if Role::from_identity(&frame.source) == Some(Role::Ai) {
            tracing::error!(source = %frame.source, "AI audio offered to the router, discarded");
            return;
        }

        {
            let mut inputs = self.inputs.lock().unwrap();
            if !inputs.queues.contains_key(&frame.source) {
                inputs.order.push(frame.source.clone());
            }
            let cap = self.frame_cap;
            let queue = inputs
                .queues
                .entry(frame.source.clone())
                .or_insert_with(VecDeque::new);
            if queue.len() >= cap {
                self.input_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            queue.push_back(frame);
        }
        self.input_notify.notify_one();
    }

    /// Pop the next frame in round-robin order across participants.
    fn try_next_frame(&self) -> Option<AudioFrame> {
        let mut inputs = self.inputs.lock().unwrap();
        let len = inputs.order.len();
        for i in 0..len {
            let idx = (inputs.cursor + i) % len;
            let identity = inputs.order[idx].clone();
            if let Some(frame) = inputs.queues.get_mut(&identity).and_then(|q| q.pop_front()) {
                inputs.cursor = (idx + 1) % len;
                return Some(frame);
            }
        }
        None
    }

    async fn next_frame(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.try_next_frame() {
                return frame;
            }
            self.input_notify.notified().await;
        }
    }

    /// Apply the forwarding rules to one frame: the transcription path is
    /// unconditional, the voice-agent path requires an unmuted human
    /// source. Accepted voice-agent sends reset the keep-alive clock.
    fn forward(&self, frame: AudioFrame, voice: &UpstreamHandle, transcription: &UpstreamHandle) {
        transcription.send_audio(frame.payload.clone());

        let human = Role::from_identity(&frame.source)
            .map(|r| r.is_human())
            .unwrap_or(false);
        if human
            && !self.gate.is_muted_at(&frame.source, frame.captured_at)
            && voice.send_audio(frame.payload)
        {
            self.forwarded_ms
                .fetch_add(frame.duration_ms as u64, Ordering::Relaxed);
            self.gate.note_voice_send();
        }
    }

    /// Router task: drains per-participant queues until shutdown, then
    /// drains whatever is left for up to one second.
    pub async fn run(
        self: Arc<Self>,
        voice: UpstreamHandle,
        transcription: UpstreamHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                frame = self.next_frame() => {
                    self.forward(frame, &voice, &transcription);
                }
            }
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        while let Some(frame) = self.try_next_frame() {
            if Instant::now() >= deadline {
                break;
            }
            self.forward(frame, &voice, &transcription);
        }
        tracing::debug!(
            forwarded_ms = self.forwarded_ms.load(Ordering::Relaxed),
            input_drops = self.input_drops.load(Ordering::Relaxed),
            "audio router stopped"
        );
    }

    // ── Agent audio buffer ──────────────────────────────────────────────

    /// Queue one synthesized chunk for room fan-out.
    pub fn push_agent_audio(&self, chunk: Vec<u8>) {
        {
            let mut out = self.agent_out.lock().unwrap();
            if out.len() >= AGENT_OUT_CAP {
                self.agent_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            out.push_back(chunk);
        }
        self.agent_notify.notify_one();
    }

    /// Barge-in purge: drop every chunk not yet fanned out. Returns the
    /// number of chunks discarded.
    pub fn clear_agent_audio(&self) -> usize {
        let mut out = self.agent_out.lock().unwrap();
        let dropped = out.len();
        out.clear();
        dropped
    }

    #[allow(dead_code)]
    pub fn pending_agent_audio(&self) -> usize {
        self.agent_out.lock().unwrap().len()
    }

    async fn next_agent_chunk(&self) -> Vec<u8> {
        loop {
            if let Some(chunk) = self.agent_out.lock().unwrap().pop_front() {
                return chunk;
            }
            self.agent_notify.notified().await;
        }
    }

    /// Fan-out task for agent TTS audio; `deliver` hands each chunk to
    /// the room's media sinks.
    pub async fn run_agent_pump(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut deliver: impl FnMut(Vec<u8>),
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                chunk = self.next_agent_chunk() => deliver(chunk),
            }
        }
        tracing::debug!(
            overflow_drops = self.agent_drops.load(Ordering::Relaxed),
            "agent audio pump stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AudioEncoding;
    use crate::upstream::{handle_pair, WriteCmd};

    fn frame(source: &str, fill: u8) -> AudioFrame {
        AudioFrame::new(source, vec![fill; 480], AudioEncoding::Linear16, Instant::now())
    }

    fn router() -> Arc<AudioRouter> {
        let gate = Arc::new(MuteGate::new(Duration::from_secs(4)));
        Arc::new(AudioRouter::new(gate, 64))
    }

    fn drain_audio(rx: &mut tokio::sync::mpsc::Receiver<WriteCmd>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let WriteCmd::Audio(payload) = cmd {
                out.push(payload);
            }
        }
        out
    }

    #[tokio::test]
    async fn frames_fork_to_both_paths_in_capture_order() {
        let router = router();
        let (voice, mut voice_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, mut stt_rx) = handle_pair("transcription", 64, 1 << 20);

        router.offer_frame(frame("client-1", 1));
        router.offer_frame(frame("client-1", 2));
        router.offer_frame(frame("client-1", 3));
        while let Some(f) = router.try_next_frame() {
            router.forward(f, &voice, &stt);
        }

        let voice_frames = drain_audio(&mut voice_rx);
        let stt_frames = drain_audio(&mut stt_rx);
        assert_eq!(voice_frames.iter().map(|f| f[0]).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(stt_frames.iter().map(|f| f[0]).collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[tokio::test]
    async fn muted_source_reaches_transcription_only() {
        let router = router();
        let (voice, mut voice_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, mut stt_rx) = handle_pair("transcription", 64, 1 << 20);

        router.gate().mute("client-1");
        router.offer_frame(frame("client-1", 1));
        router.offer_frame(frame("coach-2", 2));
        while let Some(f) = router.try_next_frame() {
            router.forward(f, &voice, &stt);
        }

        let voice_frames = drain_audio(&mut voice_rx);
        let stt_frames = drain_audio(&mut stt_rx);
        assert_eq!(voice_frames.len(), 1);
        assert_eq!(voice_frames[0][0], 2);
        assert_eq!(stt_frames.len(), 2);
    }

    #[tokio::test]
    async fn ai_frames_never_enter_the_router() {
        let router = router();
        router.offer_frame(frame("ai-1", 9));
        assert!(router.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn round_robin_interleaves_participants() {
        let router = router();
        for i in 0..3u8 {
            router.offer_frame(frame("client-1", i));
        }
        for i in 10..13u8 {
            router.offer_frame(frame("coach-2", i));
        }

        let mut sources = Vec::new();
        while let Some(f) = router.try_next_frame() {
            sources.push((f.source.clone(), f.payload[0]));
        }
        let firsts: Vec<&str> = sources.iter().take(2).map(|(s, _)| s.as_str()).collect();
        assert_eq!(firsts, ["client-1", "coach-2"]);
        // Per-participant order is preserved.
        let client: Vec<u8> = sources
            .iter()
            .filter(|(s, _)| s == "client-1")
            .map(|(_, b)| *b)
            .collect();
        assert_eq!(client, [0, 1, 2]);
    }

    #[tokio::test]
    async fn voice_backpressure_drops_but_transcription_continues() {
        let router = router();
        // Voice buffer ceiling below one frame: everything drops.
        let (voice, mut voice_rx) = handle_pair("voice_agent", 64, 10);
        let (stt, mut stt_rx) = handle_pair("transcription", 64, 1 << 20);

        router.offer_frame(frame("client-1", 1));
        router.offer_frame(frame("client-1", 2));
        while let Some(f) = router.try_next_frame() {
            router.forward(f, &voice, &stt);
        }

        // First frame is accepted (buffer was empty), second is dropped.
        assert_eq!(drain_audio(&mut voice_rx).len(), 1);
        assert_eq!(drain_audio(&mut stt_rx).len(), 2);
        assert_eq!(voice.pressure().dropped_pending(), 1);
    }

    #[tokio::test]
    async fn barge_in_purges_pending_agent_audio() {
        let router = router();
        for i in 0..10u8 {
            router.push_agent_audio(vec![i; 32]);
        }
        assert_eq!(router.pending_agent_audio(), 10);
        assert_eq!(router.clear_agent_audio(), 10);
        assert_eq!(router.pending_agent_audio(), 0);
    }

    #[tokio::test]
    async fn agent_pump_delivers_in_order_until_shutdown() {
        let router = router();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();

        let pump = tokio::spawn(router.clone().run_agent_pump(shutdown_rx, move |chunk| {
            let _ = out_tx.send(chunk);
        }));

        router.push_agent_audio(vec![1]);
        router.push_agent_audio(vec![2]);

        assert_eq!(out_rx.recv().await.unwrap(), vec![1]);
        assert_eq!(out_rx.recv().await.unwrap(), vec![2]);

        shutdown_tx.send(true).unwrap();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn router_task_forwards_and_drains_on_shutdown() {
        let router = router();
        let (voice, mut voice_rx) = handle_pair("voice_agent", 64, 1 << 20);
        let (stt, mut stt_rx) = handle_pair("transcription", 64, 1 << 20);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(router.clone().run(voice, stt, shutdown_rx));

        router.offer_frame(frame("client-1", 7));
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(drain_audio(&mut voice_rx).len(), 1);
        assert_eq!(drain_audio(&mut stt_rx).len(), 1);
    }
}
