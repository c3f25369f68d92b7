use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::AppConfig;
use crate::functions::FunctionRegistry;
use crate::hub::{MembershipEvent, RoomHub};
use crate::models::{AgentState, SignalMessage};
use crate::orchestrator::{AgentCommand, AgentOrchestrator};
use crate::transcript::TranscriptStore;

/// Join/leave churn absorbed before spawning an orchestrator.
const SPAWN_DEBOUNCE: Duration = Duration::from_millis(250);

enum RoomAgent {
    /// A spawn is scheduled and waiting out the debounce window.
    Debouncing,
    Running {
        commands: mpsc::Sender<AgentCommand>,
    },
    /// Spawn or runtime failure; respawn only when another human joins.
    Failed {
        last_humans: usize,
    },
}

/// Watches room membership and holds the policy: one orchestrator for any
/// room with at least one human, torn down when the last human leaves.
pub struct AgentSupervisor {
    hub: Arc<RoomHub>,
    cfg: Arc<AppConfig>,
    registry: Arc<FunctionRegistry>,
    store: Option<Arc<dyn TranscriptStore>>,
    rooms: DashMap<String, RoomAgent>,
}

impl AgentSupervisor {
    pub fn new(
        hub: Arc<RoomHub>,
        cfg: Arc<AppConfig>,
        registry: Arc<FunctionRegistry>,
        store: Option<Arc<dyn TranscriptStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            cfg,
            registry,
            store,
            rooms: DashMap::new(),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut membership = self.hub.subscribe_membership();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = membership.recv() => match event {
                    Ok(event) => self.clone().handle(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "supervisor lagged on membership events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        self.shutdown_all().await;
        tracing::info!("agent supervisor stopped");
    }

    fn handle(self: Arc<Self>, event: MembershipEvent) {
        let room_id = event.room_id.clone();

        if event.humans == 0 {
            match self.rooms.remove(&room_id) {
                Some((_, RoomAgent::Running { commands })) => {
                    tracing::info!(room = %room_id, "last human left, tearing down agent");
                    let _ = commands.try_send(AgentCommand::Shutdown);
                }
                Some((_, RoomAgent::Debouncing)) => {
                    tracing::debug!(room = %room_id, "spawn cancelled, room emptied");
                }
                _ => {}
            }
            return;
        }

        let mut schedule = false;
        match self.rooms.get_mut(&room_id) {
            None => {
                self.rooms.insert(room_id.clone(), RoomAgent::Debouncing);
                schedule = true;
            }
            Some(mut entry) => {
                if let RoomAgent::Failed { last_humans } = &mut *entry {
                    if event.humans > *last_humans {
                        // A fresh human join is grounds for another try.
                        *entry = RoomAgent::Debouncing;
                        schedule = true;
                    } else {
                        *last_humans = event.humans;
                    }
                }
            }
        }

        if schedule {
            let supervisor = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SPAWN_DEBOUNCE).await;
                supervisor.spawn_orchestrator(room_id).await;
            });
        }
    }

    async fn spawn_orchestrator(self: Arc<Self>, room_id: String) {
        // Re-check after the debounce: the room may have emptied, or the
        // scheduled spawn may have been cancelled.
        if !matches!(
            self.rooms.get(&room_id).as_deref(),
            Some(RoomAgent::Debouncing)
        ) {
            return;
        }
        if self.hub.human_count(&room_id) == 0 {
            self.rooms.remove(&room_id);
            return;
        }

        self.hub.broadcast(
            &room_id,
            &SignalMessage::AgentStateUpdate {
                state: AgentState::Spawning,
            },
            None,
        );

        match AgentOrchestrator::spawn(
            room_id.clone(),
            self.hub.clone(),
            self.cfg.clone(),
            self.registry.clone(),
            self.store.clone(),
        )
        .await
        {
            Ok((handle, task)) => {
                tracing::info!(room = %room_id, agent = %handle.identity, "orchestrator running");
                self.hub.set_orchestrator(&room_id, handle.clone());
                self.rooms.insert(
                    room_id.clone(),
                    RoomAgent::Running {
                        commands: handle.commands.clone(),
                    },
                );

                // Monitor: when the orchestrator exits on its own (permanent
                // upstream failure), record the failure so a later join can
                // trigger a respawn.
                let supervisor = self.clone();
                tokio::spawn(async move {
                    let _ = task.await;
                    supervisor.hub.clear_orchestrator(&room_id);
                    if let Some(mut entry) = supervisor.rooms.get_mut(&room_id) {
                        if matches!(*entry, RoomAgent::Running { .. }) {
                            *entry = RoomAgent::Failed {
                                last_humans: supervisor.hub.human_count(&room_id),
                            };
                            tracing::warn!(room = %room_id, "orchestrator exited, marked failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!(room = %room_id, "orchestrator spawn failed: {}", e);
                self.hub.broadcast(
                    &room_id,
                    &SignalMessage::AgentStateUpdate {
                        state: AgentState::Failed,
                    },
                    None,
                );
                self.rooms.insert(
                    room_id.clone(),
                    RoomAgent::Failed {
                        last_humans: self.hub.human_count(&room_id),
                    },
                );
            }
        }
    }

    /// Stop every running orchestrator; used on process shutdown.
    pub async fn shutdown_all(&self) {
        let commands: Vec<mpsc::Sender<AgentCommand>> = self
            .rooms
            .iter()
            .filter_map(|entry| match entry.value() {
                RoomAgent::Running { commands } => Some(commands.clone()),
                _ => None,
            })
            .collect();
        for tx in commands {
            let _ = tx.send(AgentCommand::Shutdown).await;
        }
        self.rooms.clear();
    }
}
