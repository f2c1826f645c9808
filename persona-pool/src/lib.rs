#![deny(missing_docs)]
//! The Worker Pool (§4.2): a WebSocket listener managing one duplex
//! session per connected worker, with token-gated accept, a hello
//! handshake, heartbeats, and a typed fan-out of pool events.
//!
//! Pool events are published on a `tokio::sync::broadcast` channel,
//! which supports multiple independent subscribers (the Dispatcher, and
//! any future observer) without a shared mutable listener list.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use persona_types::{ExecutionId, WorkerId};
use persona_wire::{decode, encode, AssignConfig, OrchestratorFrame, WorkerFrame};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tracing::{info, warn};

/// How often the pool pings each connected worker.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a worker may go without a heartbeat before the pool closes it.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// How long a newly accepted connection has to send `hello`.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

const POLICY_VIOLATION: u16 = 1008;
const GOING_AWAY: u16 = 1001;

/// A request to assign an execution to a worker (§4.3 step 5).
#[derive(Debug, Clone)]
pub struct AssignRequest {
    /// The execution being assigned.
    pub execution_id: ExecutionId,
    /// The persona driving this execution.
    pub persona_id: String,
    /// Assembled prompt text.
    pub prompt: String,
    /// Environment variables injected into the worker process.
    pub env: std::collections::BTreeMap<String, String>,
    /// Worker-side execution timeout.
    pub timeout_ms: u64,
    /// Cap on the worker's in-memory output buffer.
    pub max_output_bytes: u64,
}

/// Notifications published by the pool as workers connect, report
/// progress, and disconnect (§4.2 message routing).
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker completed the hello handshake and was admitted.
    WorkerConnected {
        /// The newly registered worker.
        worker_id: WorkerId,
    },
    /// A worker reported `ready`, meaning it can accept an assignment.
    WorkerReady {
        /// The worker that became ready.
        worker_id: WorkerId,
    },
    /// A chunk of stdout from a running execution.
    Stdout {
        /// The worker emitting this chunk.
        worker_id: WorkerId,
        /// The execution the chunk belongs to.
        execution_id: ExecutionId,
        /// Raw chunk text.
        chunk: String,
        /// Worker-side timestamp, Unix milliseconds.
        timestamp: u64,
    },
    /// A chunk of stderr from a running execution.
    Stderr {
        /// The worker emitting this chunk.
        worker_id: WorkerId,
        /// The execution the chunk belongs to.
        execution_id: ExecutionId,
        /// Raw chunk text.
        chunk: String,
        /// Worker-side timestamp, Unix milliseconds.
        timestamp: u64,
    },
    /// An execution reached a terminal state.
    Complete {
        /// The worker that ran the execution.
        worker_id: WorkerId,
        /// The execution that finished.
        execution_id: ExecutionId,
        /// Terminal status reported by the worker.
        status: persona_wire::CompletionStatus,
        /// Process exit code, if any.
        exit_code: Option<i32>,
        /// Wall-clock duration, in milliseconds.
        duration_ms: u64,
        /// Opaque upstream session id, if any.
        session_id: Option<String>,
        /// Upstream-reported cost, if any.
        total_cost_usd: Option<String>,
    },
    /// A persona-emitted event mid-execution.
    PersonaEvent {
        /// The worker emitting this event.
        worker_id: WorkerId,
        /// The execution emitting this event.
        execution_id: ExecutionId,
        /// The kind of persona event.
        event_type: persona_wire::PersonaEventType,
        /// Opaque payload.
        payload: serde_json::Value,
    },
    /// A worker's transport closed.
    WorkerDisconnected {
        /// The worker that disconnected.
        worker_id: WorkerId,
        /// The execution it was running, if any, so subscribers can fail it.
        execution_id: Option<ExecutionId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Executing,
}

struct Session {
    generation: u64,
    state: SessionState,
    current_execution_id: Option<ExecutionId>,
    last_heartbeat: Instant,
    outbox: mpsc::UnboundedSender<Message>,
}

/// Manages every connected worker's session and publishes [`PoolEvent`]s
/// as they progress.
pub struct WorkerPool {
    worker_token: String,
    sessions: RwLock<HashMap<WorkerId, Session>>,
    events: broadcast::Sender<PoolEvent>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl WorkerPool {
    /// Create a pool gated by the given shared-secret worker token.
    pub fn new(worker_token: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            worker_token: worker_token.into(),
            sessions: RwLock::new(HashMap::new()),
            events,
            next_generation: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Send a raw frame to a worker. Returns `false` if the worker is
    /// unknown or its outbox has closed.
    pub async fn send(&self, worker_id: &WorkerId, frame: OrchestratorFrame) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(worker_id) {
            Some(session) => match encode(&frame) {
                Ok(text) => session.outbox.send(Message::Text(text)).is_ok(),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Assign an execution to a worker (§4.2 operations). Requires the
    /// worker to be idle; on success the session transitions to
    /// `executing`. On send failure the caller must treat this as a
    /// rollback signal (the session state was already advanced, so a
    /// failed assign here means the worker is effectively gone).
    pub async fn assign(&self, worker_id: &WorkerId, request: AssignRequest) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(worker_id) {
                Some(session) if session.state == SessionState::Idle => {
                    session.state = SessionState::Executing;
                    session.current_execution_id = Some(request.execution_id.clone());
                }
                _ => return false,
            }
        }

        let frame = OrchestratorFrame::Assign {
            execution_id: request.execution_id.to_string(),
            persona_id: request.persona_id,
            prompt: request.prompt,
            env: request.env,
            config: AssignConfig {
                timeout_ms: request.timeout_ms,
                max_output_bytes: request.max_output_bytes,
            },
        };

        self.send(worker_id, frame).await
    }

    /// Returns any idle worker's id, or `None` if all workers are busy
    /// or none are connected (§4.2 operations: order unspecified).
    pub async fn get_idle_worker(&self) -> Option<WorkerId> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .find(|(_, session)| session.state == SessionState::Idle)
            .map(|(id, _)| id.clone())
    }

    /// Advisory cancellation: sends `cancel` to the worker running
    /// `execution_id`, if any.
    pub async fn cancel(&self, worker_id: &WorkerId, execution_id: &ExecutionId) -> bool {
        self.send(
            worker_id,
            OrchestratorFrame::Cancel {
                execution_id: execution_id.to_string(),
            },
        )
        .await
    }

    /// Broadcast `shutdown` to every connected worker, then drop all
    /// sessions. The caller is responsible for stopping the listener.
    pub async fn shutdown(&self, reason: &str, grace_period_ms: u64) {
        let worker_ids: Vec<WorkerId> = self.sessions.read().await.keys().cloned().collect();
        for worker_id in worker_ids {
            self.send(
                &worker_id,
                OrchestratorFrame::Shutdown {
                    reason: reason.to_string(),
                    grace_period_ms,
                },
            )
            .await;
        }
        self.sessions.write().await.clear();
    }

    /// Admit a worker session without a live socket, returning the
    /// channel its outbound frames would be written to. Used by callers
    /// that drive a pool without standing up a real WebSocket (tests,
    /// simulation harnesses).
    pub async fn simulate_connect(&self, worker_id: WorkerId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _generation = self.register(worker_id, tx).await;
        rx
    }

    /// Route a worker frame as if it had arrived over the transport.
    /// Used by the axum handler for real connections, and by callers
    /// that drive a pool without a live socket (tests, simulation).
    pub async fn simulate_frame(&self, worker_id: &WorkerId, frame: WorkerFrame) {
        self.route_frame(worker_id, frame).await;
    }

    /// Tear down a session as if its transport had closed, regardless of
    /// which generation currently occupies the slot. Used by callers
    /// simulating a disconnect without a live socket, where there is
    /// only ever one generation in flight.
    pub async fn simulate_disconnect(&self, worker_id: &WorkerId) {
        let current_execution_id = self
            .sessions
            .write()
            .await
            .remove(worker_id)
            .and_then(|s| s.current_execution_id);
        self.publish(PoolEvent::WorkerDisconnected {
            worker_id: worker_id.clone(),
            execution_id: current_execution_id,
        });
    }

    /// Register a new session for `worker_id`, evicting whatever session
    /// currently occupies that id (duplicate hello). Returns the
    /// generation assigned to the new session — the caller must pass
    /// this back to [`WorkerPool::unregister`] so a superseded
    /// connection's teardown can never remove the session that replaced
    /// it (the tail end of the evicted connection's own read loop
    /// reacting to the `Close` frame sent below).
    async fn register(&self, worker_id: WorkerId, outbox: mpsc::UnboundedSender<Message>) -> u64 {
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let existing = self.sessions.write().await.remove(&worker_id);
        if let Some(old) = existing {
            info!(%worker_id, "evicting existing session for duplicate hello");
            let _ = old.outbox.send(Message::Close(Some(CloseFrame {
                code: GOING_AWAY,
                reason: "superseded by new hello".into(),
            })));
        }

        self.sessions.write().await.insert(
            worker_id.clone(),
            Session {
                generation,
                state: SessionState::Idle,
                current_execution_id: None,
                last_heartbeat: Instant::now(),
                outbox,
            },
        );

        self.publish(PoolEvent::WorkerConnected { worker_id });
        generation
    }

    async fn touch_heartbeat(&self, worker_id: &WorkerId) {
        if let Some(session) = self.sessions.write().await.get_mut(worker_id) {
            session.last_heartbeat = Instant::now();
        }
    }

    async fn route_frame(&self, worker_id: &WorkerId, frame: WorkerFrame) {
        self.touch_heartbeat(worker_id).await;
        match frame {
            WorkerFrame::Hello { .. } => {
                warn!(%worker_id, "duplicate hello on an established session, ignoring");
            }
            WorkerFrame::Ready {} => {
                if let Some(session) = self.sessions.write().await.get_mut(worker_id) {
                    session.state = SessionState::Idle;
                    session.current_execution_id = None;
                }
                self.publish(PoolEvent::WorkerReady {
                    worker_id: worker_id.clone(),
                });
            }
            WorkerFrame::Stdout {
                execution_id,
                chunk,
                timestamp,
            } => self.publish(PoolEvent::Stdout {
                worker_id: worker_id.clone(),
                execution_id: ExecutionId::new(execution_id),
                chunk,
                timestamp,
            }),
            WorkerFrame::Stderr {
                execution_id,
                chunk,
                timestamp,
            } => self.publish(PoolEvent::Stderr {
                worker_id: worker_id.clone(),
                execution_id: ExecutionId::new(execution_id),
                chunk,
                timestamp,
            }),
            WorkerFrame::Complete {
                execution_id,
                status,
                exit_code,
                duration_ms,
                session_id,
                total_cost_usd,
            } => {
                if let Some(session) = self.sessions.write().await.get_mut(worker_id) {
                    session.state = SessionState::Idle;
                    session.current_execution_id = None;
                }
                self.publish(PoolEvent::Complete {
                    worker_id: worker_id.clone(),
                    execution_id: ExecutionId::new(execution_id),
                    status,
                    exit_code,
                    duration_ms,
                    session_id,
                    total_cost_usd,
                });
            }
            WorkerFrame::Event {
                execution_id,
                event_type,
                payload,
            } => self.publish(PoolEvent::PersonaEvent {
                worker_id: worker_id.clone(),
                execution_id: ExecutionId::new(execution_id),
                event_type,
                payload,
            }),
            WorkerFrame::Heartbeat { .. } => {}
        }
    }

    /// Remove `worker_id`'s session, but only if it is still the
    /// `generation` the caller originally registered. A connection that
    /// was superseded by a duplicate hello (see [`WorkerPool::register`])
    /// calls this with its own stale generation after its read loop
    /// ends, which must be a no-op: the slot it once held now belongs to
    /// the connection that replaced it.
    async fn unregister(&self, worker_id: &WorkerId, generation: u64) {
        let mut sessions = self.sessions.write().await;
        let still_current = matches!(sessions.get(worker_id), Some(session) if session.generation == generation);
        if !still_current {
            return;
        }
        let current_execution_id = sessions.remove(worker_id).and_then(|s| s.current_execution_id);
        drop(sessions);
        self.publish(PoolEvent::WorkerDisconnected {
            worker_id: worker_id.clone(),
            execution_id: current_execution_id,
        });
    }
}

/// Build the axum router exposing the worker WebSocket endpoint.
pub fn router(pool: Arc<WorkerPool>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(pool)
}

#[derive(serde::Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

async fn ws_handler(
    State(pool): State<Arc<WorkerPool>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(pool, params.token, socket))
}

async fn handle_connection(pool: Arc<WorkerPool>, token: Option<String>, socket: WebSocket) {
    if token.as_deref() != Some(pool.worker_token.as_str()) {
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "missing or invalid worker token".into(),
            })))
            .await;
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let worker_id = match tokio::time::timeout(HELLO_TIMEOUT, await_hello(&mut stream)).await {
        Ok(Some(worker_id)) => worker_id,
        _ => {
            let _ = outbox_tx.send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "hello not received in time".into(),
            })));
            forward_task.abort();
            return;
        }
    };

    let generation = pool.register(worker_id.clone(), outbox_tx.clone()).await;
    let session_token = uuid::Uuid::new_v4().to_string();
    let _ = pool
        .send(
            &worker_id,
            OrchestratorFrame::Ack {
                worker_id: worker_id.to_string(),
                session_token,
            },
        )
        .await;

    let heartbeat_pool = Arc::clone(&pool);
    let heartbeat_worker_id = worker_id.clone();
    let heartbeat_outbox = outbox_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let last_heartbeat = {
                let sessions = heartbeat_pool.sessions.read().await;
                match sessions.get(&heartbeat_worker_id) {
                    // A duplicate hello replaced this session; this
                    // heartbeat task belongs to the superseded
                    // connection and has nothing left to monitor.
                    Some(session) if session.generation != generation => break,
                    Some(session) => Some(session.last_heartbeat),
                    None => None,
                }
            };
            match last_heartbeat {
                Some(last) if last.elapsed() > HEARTBEAT_TIMEOUT => {
                    let _ = heartbeat_outbox.send(Message::Close(Some(CloseFrame {
                        code: GOING_AWAY,
                        reason: "heartbeat timeout".into(),
                    })));
                    break;
                }
                Some(_) => {
                    let timestamp = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    if heartbeat_outbox
                        .send(Message::Text(
                            encode(&OrchestratorFrame::Heartbeat { timestamp }).unwrap_or_default(),
                        ))
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match decode::<WorkerFrame>(&text) {
                Ok(frame) => pool.route_frame(&worker_id, frame).await,
                Err(e) => warn!(%worker_id, error = %e, "dropping unparseable worker frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    heartbeat_task.abort();
    forward_task.abort();
    pool.unregister(&worker_id, generation).await;
}

async fn await_hello(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<WorkerId> {
    while let Some(Ok(msg)) = stream.next().await {
        if let Message::Text(text) = msg {
            if let Ok(WorkerFrame::Hello { worker_id, .. }) = decode::<WorkerFrame>(&text) {
                return Some(WorkerId::new(worker_id));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_idle_worker_returns_none_when_empty() {
        let pool = WorkerPool::new("secret");
        assert!(pool.get_idle_worker().await.is_none());
    }

    #[tokio::test]
    async fn assign_fails_for_unknown_worker() {
        let pool = WorkerPool::new("secret");
        let assigned = pool
            .assign(
                &WorkerId::new("w-1"),
                AssignRequest {
                    execution_id: ExecutionId::new("e-1"),
                    persona_id: "p-1".to_string(),
                    prompt: "do it".to_string(),
                    env: Default::default(),
                    timeout_ms: 300_000,
                    max_output_bytes: 10 * 1024 * 1024,
                },
            )
            .await;
        assert!(!assigned);
    }

    #[tokio::test]
    async fn send_to_unknown_worker_returns_false() {
        let pool = WorkerPool::new("secret");
        let sent = pool
            .send(
                &WorkerId::new("ghost"),
                OrchestratorFrame::Heartbeat { timestamp: 0 },
            )
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn register_then_idle_is_visible() {
        let pool = WorkerPool::new("secret");
        let (tx, _rx) = mpsc::unbounded_channel();
        pool.register(WorkerId::new("w-1"), tx).await;
        assert_eq!(pool.get_idle_worker().await, Some(WorkerId::new("w-1")));
    }

    #[tokio::test]
    async fn assign_transitions_worker_out_of_idle() {
        let pool = WorkerPool::new("secret");
        let (tx, _rx) = mpsc::unbounded_channel();
        pool.register(WorkerId::new("w-1"), tx).await;

        let assigned = pool
            .assign(
                &WorkerId::new("w-1"),
                AssignRequest {
                    execution_id: ExecutionId::new("e-1"),
                    persona_id: "p-1".to_string(),
                    prompt: "do it".to_string(),
                    env: Default::default(),
                    timeout_ms: 300_000,
                    max_output_bytes: 10 * 1024 * 1024,
                },
            )
            .await;
        assert!(assigned);
        assert!(pool.get_idle_worker().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_register_evicts_old_session() {
        let pool = WorkerPool::new("secret");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        pool.register(WorkerId::new("w-1"), tx1).await;
        pool.register(WorkerId::new("w-1"), tx2).await;

        let closed = rx1.recv().await;
        assert!(matches!(closed, Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn unregister_publishes_disconnected_with_execution() {
        let pool = WorkerPool::new("secret");
        let mut events = pool.subscribe();
        let (tx, _rx) = mpsc::unbounded_channel();
        let generation = pool.register(WorkerId::new("w-1"), tx).await;
        let _ = events.recv().await; // WorkerConnected

        pool.assign(
            &WorkerId::new("w-1"),
            AssignRequest {
                execution_id: ExecutionId::new("e-1"),
                persona_id: "p-1".to_string(),
                prompt: "do it".to_string(),
                env: Default::default(),
                timeout_ms: 300_000,
                max_output_bytes: 10 * 1024 * 1024,
            },
        )
        .await;

        pool.unregister(&WorkerId::new("w-1"), generation).await;
        let event = events.recv().await.unwrap();
        match event {
            PoolEvent::WorkerDisconnected {
                worker_id,
                execution_id,
            } => {
                assert_eq!(worker_id, WorkerId::new("w-1"));
                assert_eq!(execution_id, Some(ExecutionId::new("e-1")));
            }
            _ => panic!("expected WorkerDisconnected"),
        }
    }

    #[tokio::test]
    async fn stale_generation_unregister_does_not_evict_replacement_session() {
        let pool = WorkerPool::new("secret");
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let old_generation = pool.register(WorkerId::new("w-1"), tx1).await;
        // Duplicate hello: the new connection takes over the slot, and
        // the old connection's read loop will eventually run its own
        // cleanup with the generation it captured at register time.
        pool.register(WorkerId::new("w-1"), tx2).await;

        // The old connection's teardown must not remove the session
        // that superseded it.
        pool.unregister(&WorkerId::new("w-1"), old_generation).await;

        assert_eq!(pool.get_idle_worker().await, Some(WorkerId::new("w-1")));
    }

    #[tokio::test]
    async fn ready_frame_returns_worker_to_idle() {
        let pool = WorkerPool::new("secret");
        let (tx, _rx) = mpsc::unbounded_channel();
        pool.register(WorkerId::new("w-1"), tx).await;
        pool.assign(
            &WorkerId::new("w-1"),
            AssignRequest {
                execution_id: ExecutionId::new("e-1"),
                persona_id: "p-1".to_string(),
                prompt: "do it".to_string(),
                env: Default::default(),
                timeout_ms: 300_000,
                max_output_bytes: 10 * 1024 * 1024,
            },
        )
        .await;
        assert!(pool.get_idle_worker().await.is_none());

        pool.route_frame(&WorkerId::new("w-1"), WorkerFrame::Ready {}).await;
        assert_eq!(pool.get_idle_worker().await, Some(WorkerId::new("w-1")));
    }
}
