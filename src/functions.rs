use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// A named function the voice agent may ask the broker to execute.
/// Handlers returning structured values serialize them to JSON; the wire
/// contract is a UTF-8 string either way.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, input: serde_json::Value) -> anyhow::Result<String>;
}

/// Integrator-supplied table of `name → handler`, fixed at construction.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn FunctionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Outcome of one function call, ready to be sent upstream as a
/// `FunctionCallResponse`.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub call_id: String,
    pub output: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Pending,
    Settled,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CallRecord {
    pub call_id: String,
    pub name: String,
    pub issued_at: DateTime<Utc>,
    pub ok: Option<bool>,
}

/// Executes function-call requests on worker tasks and guarantees
/// exactly-once settlement per call id, within the configured timeout.
pub struct FunctionDispatcher {
    registry: Arc<FunctionRegistry>,
    pending: Arc<Mutex<HashMap<String, CallState>>>,
    log: Arc<Mutex<Vec<CallRecord>>>,
    timeout: Duration,
}

impl FunctionDispatcher {
    pub fn new(registry: Arc<FunctionRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            timeout,
        }
    }

    /// Record and execute one request. The settlement is delivered on
    /// `out`; a handler overrunning the timeout settles with a
    /// synthesized error and its eventual result is discarded.
    pub fn dispatch(
        &self,
        call_id: String,
        name: String,
        input: serde_json::Value,
        out: mpsc::Sender<Settlement>,
    ) {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&call_id) {
                tracing::error!(%call_id, "duplicate function call id, dropping request");
                return;
            }
            pending.insert(call_id.clone(), CallState::Pending);
        }
        self.log.lock().unwrap().push(CallRecord {
            call_id: call_id.clone(),
            name: name.clone(),
            issued_at: Utc::now(),
            ok: None,
        });

        let handler = self.registry.get(&name);
        let pending = self.pending.clone();
        let log = self.log.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let settlement = match handler {
                None => Settlement {
                    output: format!("Error: unknown function '{}'", name),
                    call_id: call_id.clone(),
                    ok: false,
                },
                Some(handler) => {
                    match tokio::time::timeout(timeout, handler.call(input)).await {
                        Ok(Ok(output)) => Settlement {
                            call_id: call_id.clone(),
                            output,
                            ok: true,
                        },
                        Ok(Err(e)) => Settlement {
                            call_id: call_id.clone(),
                            output: format!("Error: function '{}' failed: {}", name, e),
                            ok: false,
                        },
                        Err(_) => Settlement {
                            call_id: call_id.clone(),
                            output: format!(
                                "Error: function '{}' timed out after {} ms",
                                name,
                                timeout.as_millis()
                            ),
                            ok: false,
                        },
                    }
                }
            };

            if !settle(&pending, &call_id) {
                return;
            }
            if let Some(record) = log
                .lock()
                .unwrap()
                .iter_mut()
                .rev()
                .find(|r| r.call_id == call_id)
            {
                record.ok = Some(settlement.ok);
            }
            let _ = out.send(settlement).await;
        });
    }

    /// Synthesize failure settlements for every call still pending, for
    /// use during orchestrator shutdown.
    pub fn settle_all_pending(&self, out: &mpsc::Sender<Settlement>) {
        let unsettled: Vec<String> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(_, state)| **state == CallState::Pending)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for call_id in unsettled {
            if settle(&self.pending, &call_id) {
                let _ = out.try_send(Settlement {
                    call_id,
                    output: "Error: session ended before the function completed".to_string(),
                    ok: false,
                });
            }
        }
    }

    #[allow(dead_code)]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|s| **s == CallState::Pending)
            .count()
    }

    #[allow(dead_code)]
    pub fn call_log(&self) -> Vec<CallRecord> {
        self.log.lock().unwrap().clone()
    }
}

/// Transition a call to settled. Returns false (and logs) when the call
/// was already settled; the caller must then drop its settlement.
fn settle(pending: &Mutex<HashMap<String, CallState>>, call_id: &str) -> bool {
    let mut pending = pending.lock().unwrap();
    match pending.get_mut(call_id) {
        Some(state @ CallState::Pending) => {
            *state = CallState::Settled;
            true
        }
        Some(CallState::Settled) => {
            tracing::error!(%call_id, "second settlement attempt for function call, dropped");
            false
        }
        None => {
            tracing::error!(%call_id, "settlement for unknown function call, dropped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl FunctionHandler for Echo {
        async fn call(&self, input: serde_json::Value) -> anyhow::Result<String> {
            Ok(input["text"].as_str().unwrap_or("").to_string())
        }
    }

    struct Stall;

    #[async_trait]
    impl FunctionHandler for Stall {
        async fn call(&self, _input: serde_json::Value) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    fn dispatcher_with(
        name: &str,
        handler: Arc<dyn FunctionHandler>,
        timeout: Duration,
    ) -> FunctionDispatcher {
        let mut registry = FunctionRegistry::new();
        registry.register(name, handler);
        FunctionDispatcher::new(Arc::new(registry), timeout)
    }

    #[tokio::test]
    async fn successful_call_settles_once_with_output() {
        let dispatcher = dispatcher_with("echo", Arc::new(Echo), Duration::from_secs(10));
        let (tx, mut rx) = mpsc::channel(4);

        dispatcher.dispatch(
            "fc1".into(),
            "echo".into(),
            json!({"text": "Stress patterns improving; weekly sessions current"}),
            tx,
        );

        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.call_id, "fc1");
        assert!(settlement.ok);
        assert_eq!(
            settlement.output,
            "Stress patterns improving; weekly sessions current"
        );
        assert!(rx.recv().await.is_none());
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.call_log()[0].ok, Some(true));
    }

    #[tokio::test]
    async fn unknown_function_settles_with_error_string() {
        let dispatcher = dispatcher_with("echo", Arc::new(Echo), Duration::from_secs(10));
        let (tx, mut rx) = mpsc::channel(4);

        dispatcher.dispatch("fc2".into(), "missing".into(), json!({}), tx);

        let settlement = rx.recv().await.unwrap();
        assert!(!settlement.ok);
        assert!(settlement.output.contains("unknown function"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_synthesizes_error_and_discards_handler_result() {
        let dispatcher = dispatcher_with("stall", Arc::new(Stall), Duration::from_secs(10));
        let (tx, mut rx) = mpsc::channel(4);

        dispatcher.dispatch("fc3".into(), "stall".into(), json!({}), tx);

        let settlement = rx.recv().await.unwrap();
        assert!(!settlement.ok);
        assert!(settlement.output.contains("timed out"));
        assert_eq!(dispatcher.pending_count(), 0);
        // Only one settlement ever arrives.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_call_id_is_dropped() {
        let dispatcher = dispatcher_with("echo", Arc::new(Echo), Duration::from_secs(10));
        let (tx, mut rx) = mpsc::channel(4);

        dispatcher.dispatch("fc4".into(), "echo".into(), json!({"text": "a"}), tx.clone());
        dispatcher.dispatch("fc4".into(), "echo".into(), json!({"text": "b"}), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.output, "a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_settles_outstanding_calls() {
        let dispatcher = dispatcher_with("stall", Arc::new(Stall), Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(4);

        dispatcher.dispatch("fc5".into(), "stall".into(), json!({}), tx.clone());
        tokio::task::yield_now().await;
        dispatcher.settle_all_pending(&tx);

        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.call_id, "fc5");
        assert!(!settlement.ok);
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
