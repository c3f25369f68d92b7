use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;

use crate::error::{AppError, AppResult};
use crate::models::{PeerInfo, Role, SignalMessage};
use crate::orchestrator::OrchestratorHandle;

// ─── Deterministic initiator selection ──────────────────────────────────────

/// Decide whether `me` should send the WebRTC offer to `other`.
///
/// AI legs are brokered server-side and never signal, so neither side of
/// an AI pair initiates. Between humans, the coach offers to the client;
/// same-role pairs fall back to lexicographic order so exactly one side
/// initiates regardless of join order.
pub fn should_initiate(me: (&str, Role), other: (&str, Role)) -> bool {
    match (me.1, other.1) {
        (Role::Ai, _) | (_, Role::Ai) => false,
        (Role::Coach, Role::Client) => true,
        (Role::Client, Role::Coach) => false,
        _ => me.0 < other.0,
    }
}

// ─── Participant sink ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Outbound {
    Text { payload: String, critical: bool },
    Audio(Vec<u8>),
}

impl Outbound {
    fn is_critical(&self) -> bool {
        matches!(self, Outbound::Text { critical: true, .. })
    }
}

/// Back-channel through which the hub delivers messages to one
/// participant. Bounded; overflow evicts the oldest non-critical entry so
/// hub-level system events survive a slow consumer.
pub struct ParticipantSink {
    queue: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

impl ParticipantSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity,
        })
    }

    /// Enqueue for delivery. Returns false when the message was dropped
    /// (sink closed, or overflow with nothing evictable).
    pub fn push(&self, out: Outbound) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|o| !o.is_critical()) {
                    queue.remove(pos);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                } else if !out.is_critical() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            queue.push_back(out);
        }
        self.notify.notify_one();
        true
    }

    /// Next message to deliver; None once the sink is closed and drained.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            if let Some(out) = self.queue.lock().unwrap().pop_front() {
                return Some(out);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Idempotent close; the first call wakes the pump.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ─── Rooms ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Reconnecting,
    Leaving,
}

struct Participant {
    info: PeerInfo,
    joined_at: DateTime<Utc>,
    last_activity: Instant,
    sink: Arc<ParticipantSink>,
    phase: Phase,
    reconnect_deadline: Option<Instant>,
}

pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    seq: AtomicU64,
    participants: Mutex<HashMap<String, Participant>>,
    agent: Mutex<Option<OrchestratorHandle>>,
}

impl Room {
    fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            created_at: Utc::now(),
            seq: AtomicU64::new(0),
            participants: Mutex::new(HashMap::new()),
            agent: Mutex::new(None),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialize a hub-originated message, stamped with the room's event
    /// sequence number so recipients can order fan-out.
    fn stamped(&self, msg: &SignalMessage) -> String {
        let mut value = serde_json::to_value(msg).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("seq".to_string(), self.next_seq().into());
        }
        value.to_string()
    }
}

/// Membership change notification for the supervisor.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub room_id: String,
    pub humans: usize,
    pub ai_present: bool,
}

#[derive(Debug, Serialize)]
pub struct ParticipantSnapshot {
    #[serde(flatten)]
    pub info: PeerInfo,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantSnapshot>,
    pub agent_active: bool,
}

/// Authoritative registry of rooms and participants; fans out signaling
/// and application messages. Locks guard only map mutation, never I/O —
/// sink pushes are non-blocking enqueues.
pub struct RoomHub {
    rooms: DashMap<String, Arc<Room>>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    grace: Duration,
    evict_threshold: u64,
}

const MEMBERSHIP_CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Backstop for sessions whose own liveness checks never fired.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

impl RoomHub {
    pub fn new(grace: Duration, evict_threshold: u64) -> Arc<Self> {
        let (membership_tx, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);
        Arc::new(Self {
            rooms: DashMap::new(),
            membership_tx,
            grace,
            evict_threshold,
        })
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }

    fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Add a participant, creating the room on first join.
    ///
    /// Rejects a second AI regardless of identity, and a duplicate exact
    /// identity while its holder is active. A re-join during the
    /// reconnect grace window replaces the sink atomically and replays
    /// the room view to the rejoiner without disturbing the others.
    pub fn join(
        &self,
        room_id: &str,
        peer: PeerInfo,
        sink: Arc<ParticipantSink>,
    ) -> AppResult<()> {
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id.to_string()))
            .clone();

        let identity = peer.user_id.clone();
        let role = peer.user_role;

        let (rejoin, peers_for_joiner, notify_others, humans, ai_present) = {
            let mut participants = room.participants.lock().unwrap();

            if role == Role::Ai
                && participants
                    .values()
                    .any(|p| p.info.user_role == Role::Ai && p.phase != Phase::Leaving)
            {
                return Err(AppError::AlreadyPresent(format!(
                    "room {} already has an AI participant",
                    room_id
                )));
            }

            let rejoin = match participants.get_mut(&identity) {
                Some(existing) if existing.phase == Phase::Reconnecting => {
                    existing.sink.close();
                    existing.sink = sink.clone();
                    existing.phase = Phase::Active;
                    existing.reconnect_deadline = None;
                    existing.last_activity = Instant::now();
                    true
                }
                Some(_) => {
                    return Err(AppError::AlreadyPresent(format!(
                        "identity {} already present in room {}",
                        identity, room_id
                    )));
                }
                None => false,
            };

            let peers_for_joiner: Vec<PeerInfo> = participants
                .values()
                .filter(|p| p.info.user_id != identity && p.phase != Phase::Leaving)
                .map(|p| {
                    let mut info = p.info.clone();
                    info.should_initiate = if role.is_human() {
                        Some(should_initiate(
                            (identity.as_str(), role),
                            (info.user_id.as_str(), info.user_role),
                        ))
                    } else {
                        None
                    };
                    info
                })
                .collect();

            let notify_others: Vec<(String, Role, Arc<ParticipantSink>)> = if rejoin {
                Vec::new()
            } else {
                participants
                    .values()
                    .filter(|p| p.info.user_id != identity && p.phase != Phase::Leaving)
                    .map(|p| (p.info.user_id.clone(), p.info.user_role, p.sink.clone()))
                    .collect()
            };

            if !rejoin {
                participants.insert(
                    identity.clone(),
                    Participant {
                        info: peer.clone(),
                        joined_at: Utc::now(),
                        last_activity: Instant::now(),
                        sink: sink.clone(),
                        phase: Phase::Active,
                        reconnect_deadline: None,
                    },
                );
            }

            let humans = participants
                .values()
                .filter(|p| p.info.user_role.is_human() && p.phase != Phase::Leaving)
                .count();
            let ai_present = participants
                .values()
                .any(|p| p.info.user_role == Role::Ai && p.phase != Phase::Leaving);

            (rejoin, peers_for_joiner, notify_others, humans, ai_present)
        };

        sink.push(Outbound::Text {
            payload: room.stamped(&SignalMessage::PeerDiscovery {
                peers: peers_for_joiner,
                room_id: room_id.to_string(),
            }),
            critical: true,
        });

        for (other_id, other_role, other_sink) in notify_others {
            let flag = should_initiate(
                (other_id.as_str(), other_role),
                (identity.as_str(), role),
            );
            let mut info = peer.clone();
            info.should_initiate = None;
            other_sink.push(Outbound::Text {
                payload: room.stamped(&SignalMessage::UserJoined {
                    peer: info,
                    should_initiate: flag,
                }),
                critical: true,
            });
        }

        if !rejoin {
            tracing::info!(room = room_id, identity = %identity, role = ?role, "participant joined");
            let _ = self.membership_tx.send(MembershipEvent {
                room_id: room_id.to_string(),
                humans,
                ai_present,
            });
        } else {
            tracing::info!(room = room_id, identity = %identity, "participant reconnected");
        }

        Ok(())
    }

    /// Remove a participant outright, emitting `user-left` to the rest.
    pub fn leave(&self, room_id: &str, identity: &str) {
        let Some(room) = self.room(room_id) else { return };

        let (removed, humans, ai_present) = {
            let mut participants = room.participants.lock().unwrap();
            let removed = participants.remove(identity);
            let humans = participants
                .values()
                .filter(|p| p.info.user_role.is_human())
                .count();
            let ai_present = participants
                .values()
                .any(|p| p.info.user_role == Role::Ai);
            (removed, humans, ai_present)
        };

        let Some(removed) = removed else { return };
        removed.sink.close();

        self.broadcast(
            room_id,
            &SignalMessage::UserLeft {
                user_id: identity.to_string(),
            },
            None,
        );

        tracing::info!(room = room_id, identity, "participant left");
        let _ = self.membership_tx.send(MembershipEvent {
            room_id: room_id.to_string(),
            humans,
            ai_present,
        });

        self.remove_room_if_empty(room_id);
    }

    /// Transport loss without an explicit leave: hold the identity for the
    /// grace window. Only the session that still owns the sink may
    /// transition the participant, so a replaced sink cannot demote its
    /// successor.
    pub fn disconnected(&self, room_id: &str, identity: &str, sink: &Arc<ParticipantSink>) {
        let Some(room) = self.room(room_id) else { return };
        let mut participants = room.participants.lock().unwrap();
        if let Some(p) = participants.get_mut(identity) {
            if Arc::ptr_eq(&p.sink, sink) && p.phase == Phase::Active {
                p.phase = Phase::Reconnecting;
                p.reconnect_deadline = Some(Instant::now() + self.grace);
                p.sink.close();
                tracing::info!(room = room_id, identity, "participant reconnecting");
            }
        }
    }

    /// Targeted or broadcast relay of an opaque signaling message.
    /// `offer`/`answer`/`ice-candidate` without `toId` fan out to the
    /// other participants; unknown types without `toId` are dropped.
    pub fn route(&self, room_id: &str, from: &str, mut message: serde_json::Value) {
        let Some(room) = self.room(room_id) else { return };

        let msg_type = message
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        let to_id = message
            .get("toId")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string());

        if let Some(obj) = message.as_object_mut() {
            obj.insert("fromId".to_string(), from.into());
        }
        let payload = message.to_string();

        let participants = room.participants.lock().unwrap();
        match to_id {
            Some(to_id) => {
                if let Some(target) = participants.get(&to_id) {
                    target.sink.push(Outbound::Text {
                        payload,
                        critical: false,
                    });
                }
            }
            None => {
                const RELAYED: &[&str] = &["offer", "answer", "ice-candidate"];
                if !RELAYED.contains(&msg_type.as_str()) {
                    tracing::debug!(room = room_id, %msg_type, "untargeted unknown message dropped");
                    return;
                }
                for p in participants.values().filter(|p| p.info.user_id != from) {
                    p.sink.push(Outbound::Text {
                        payload: payload.clone(),
                        critical: false,
                    });
                }
            }
        }
    }

    /// System-originated fan-out, excluding `exclude` when given.
    pub fn broadcast(&self, room_id: &str, msg: &SignalMessage, exclude: Option<&str>) {
        let Some(room) = self.room(room_id) else { return };
        let payload = room.stamped(msg);
        let critical = msg.is_critical();

        let mut evict = Vec::new();
        {
            let mut participants = room.participants.lock().unwrap();
            for p in participants.values_mut() {
                if Some(p.info.user_id.as_str()) == exclude {
                    continue;
                }
                p.sink.push(Outbound::Text {
                    payload: payload.clone(),
                    critical,
                });
                if p.sink.dropped_count() > self.evict_threshold && p.phase == Phase::Active {
                    p.phase = Phase::Leaving;
                    evict.push(p.info.user_id.clone());
                }
            }
        }
        for identity in evict {
            tracing::warn!(room = room_id, %identity, "participant marked for eviction after repeated drops");
        }
    }

    /// Agent-synthesized audio to every human media sink.
    pub fn fanout_agent_audio(&self, room_id: &str, chunk: Vec<u8>) {
        let Some(room) = self.room(room_id) else { return };
        let participants = room.participants.lock().unwrap();
        for p in participants
            .values()
            .filter(|p| p.info.user_role.is_human() && p.phase == Phase::Active)
        {
            p.sink.push(Outbound::Audio(chunk.clone()));
        }
    }

    pub fn touch(&self, room_id: &str, identity: &str) {
        if let Some(room) = self.room(room_id) {
            if let Some(p) = room.participants.lock().unwrap().get_mut(identity) {
                p.last_activity = Instant::now();
            }
        }
    }

    pub fn human_identities(&self, room_id: &str) -> Vec<String> {
        self.room(room_id)
            .map(|room| {
                room.participants
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|p| p.info.user_role.is_human())
                    .map(|p| p.info.user_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn human_count(&self, room_id: &str) -> usize {
        self.room(room_id)
            .map(|room| {
                room.participants
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|p| p.info.user_role.is_human() && p.phase != Phase::Leaving)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn orchestrator(&self, room_id: &str) -> Option<OrchestratorHandle> {
        let room = self.room(room_id)?;
        let agent = room.agent.lock().unwrap();
        agent.clone()
    }

    pub fn set_orchestrator(&self, room_id: &str, handle: OrchestratorHandle) {
        if let Some(room) = self.room(room_id) {
            *room.agent.lock().unwrap() = Some(handle);
        }
    }

    pub fn clear_orchestrator(&self, room_id: &str) {
        if let Some(room) = self.room(room_id) {
            *room.agent.lock().unwrap() = None;
        }
        self.remove_room_if_empty(room_id);
    }

    fn remove_room_if_empty(&self, room_id: &str) {
        let Some(room) = self.room(room_id) else { return };
        let empty = room.participants.lock().unwrap().is_empty();
        let no_agent = room.agent.lock().unwrap().is_none();
        if empty && no_agent {
            self.rooms.remove(room_id);
            tracing::info!(room = room_id, "room destroyed");
        }
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        self.rooms
            .iter()
            .map(|entry| {
                let room = entry.value();
                let participants = room
                    .participants
                    .lock()
                    .unwrap()
                    .values()
                    .map(|p| ParticipantSnapshot {
                        info: p.info.clone(),
                        joined_at: p.joined_at,
                    })
                    .collect();
                RoomSnapshot {
                    room_id: room.id.clone(),
                    created_at: room.created_at,
                    participants,
                    agent_active: room.agent.lock().unwrap().is_some(),
                }
            })
            .collect()
    }

    /// Periodic finalization of expired reconnect windows and eviction
    /// marks.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let mut expired: Vec<(String, String)> = Vec::new();
            for entry in self.rooms.iter() {
                let room = entry.value();
                let participants = room.participants.lock().unwrap();
                for p in participants.values() {
                    let gone = match p.phase {
                        Phase::Leaving => true,
                        Phase::Reconnecting => {
                            p.reconnect_deadline.map(|d| now >= d).unwrap_or(true)
                        }
                        // The agent participant has no inbound transport;
                        // its lifetime is governed by the supervisor.
                        Phase::Active => {
                            p.info.user_role.is_human()
                                && now.duration_since(p.last_activity) >= INACTIVITY_TIMEOUT
                        }
                    };
                    if gone {
                        expired.push((room.id.clone(), p.info.user_id.clone()));
                    }
                }
            }
            for (room_id, identity) in expired {
                tracing::info!(room = %room_id, identity = %identity, "sweeping participant");
                self.leave(&room_id, &identity);
            }
        }
        tracing::debug!("hub sweeper stopped");
    }
}
