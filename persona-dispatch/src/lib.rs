#![deny(missing_docs)]
//! The Dispatcher (§4.3): queues submitted requests, hands them to idle
//! workers, and keeps execution records in sync with what the Worker
//! Pool reports.
//!
//! Two pieces of mutable state — the FIFO `queue` and the `active` map
//! of in-flight executions — are each behind their own lock, acquired
//! in the fixed order `queue → active` wherever both are needed, so the
//! submit path and the Worker Pool notification loop never deadlock
//! against each other.

use persona_auth::TokenProvider;
use persona_bus::{topics, MessageBus};
use persona_pool::{AssignRequest, PoolEvent, WorkerPool};
use persona_secret::{BoundCredential, CredentialMaterializer, EncryptedCredential, MasterKey};
use persona_store::PersonaStore;
use persona_types::{
    CredentialId, ExecutionId, ExecutionRecord, ExecutionStatus, PersonaId, ProjectId,
};
use persona_wire::CompletionStatus;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Default worker-side execution timeout when a request doesn't specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Cap on the worker's in-memory output buffer.
pub const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// How long a terminal `active` entry is retained after its execution
/// completes, before being swept (REDESIGN FLAG #3, 10 min variant).
pub const RETAIN: Duration = Duration::from_secs(10 * 60);

const WORKER_DISCONNECTED_MESSAGE: &str = "Worker disconnected";

/// A request to run a persona, prior to queueing.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// The persona to run.
    pub persona_id: PersonaId,
    /// Prompt text, used verbatim when no stored persona is found.
    pub prompt: String,
    /// Input data made available to the Prompt Assembler.
    pub input_data: Option<serde_json::Value>,
    /// Worker-side execution timeout override.
    pub timeout_ms: Option<u64>,
}

struct QueuedRequest {
    execution_id: ExecutionId,
    request: DispatchRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveStatus {
    Running,
    Terminal,
}

struct ActiveExecution {
    worker_id: persona_types::WorkerId,
    status: ActiveStatus,
}

type ActiveMap = Arc<Mutex<HashMap<ExecutionId, ActiveExecution>>>;

/// Queues requests, assigns them to idle workers, and keeps execution
/// records current as the Worker Pool reports progress.
pub struct Dispatcher {
    store: Arc<dyn PersonaStore>,
    pool: Arc<WorkerPool>,
    bus: Arc<dyn MessageBus>,
    master_key: Arc<MasterKey>,
    token_provider: Option<Arc<TokenProvider>>,
    static_token: Option<String>,
    queue: Mutex<VecDeque<QueuedRequest>>,
    active: ActiveMap,
}

impl Dispatcher {
    /// Build a dispatcher. `token_provider` is consulted first for a
    /// bearer token (§4.5); `static_token` is the fallback used when no
    /// provider is configured or it has nothing seeded yet.
    pub fn new(
        store: Arc<dyn PersonaStore>,
        pool: Arc<WorkerPool>,
        bus: Arc<dyn MessageBus>,
        master_key: Arc<MasterKey>,
        token_provider: Option<Arc<TokenProvider>>,
        static_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            bus,
            master_key,
            token_provider,
            static_token,
            queue: Mutex::new(VecDeque::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawn the background task that drives this dispatcher off Worker
    /// Pool notifications (§4.3). Holds the returned handle for the life
    /// of the process.
    pub fn spawn_pool_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let mut events = dispatcher.pool.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => dispatcher.handle_pool_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "pool event loop lagged, some notifications dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of requests currently queued (diagnostics/tests).
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Number of in-flight executions tracked in `active` (diagnostics/tests).
    pub async fn active_len(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Submit a new request (§4.3 Submit). Creates the execution record
    /// in `queued` state, enqueues it, and kicks the queue.
    pub async fn submit(&self, request: DispatchRequest) -> ExecutionId {
        let execution_id = ExecutionId::new(uuid::Uuid::new_v4().to_string());
        let record = ExecutionRecord::queued(
            execution_id.clone(),
            request.project_id.clone(),
            request.persona_id.clone(),
        );
        if let Err(e) = self.store.insert_execution(record).await {
            warn!(%execution_id, error = %e, "failed to persist queued execution record");
        }

        self.queue.lock().await.push_back(QueuedRequest {
            execution_id: execution_id.clone(),
            request,
        });

        self.process_queue().await;
        execution_id
    }

    /// Advisory cancellation (§4.3 Cancel). Sends `cancel` to the
    /// worker running `execution_id` if it is currently `running`;
    /// otherwise a no-op returning `false`.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> bool {
        let worker_id = {
            let active = self.active.lock().await;
            match active.get(execution_id) {
                Some(entry) if entry.status == ActiveStatus::Running => {
                    Some(entry.worker_id.clone())
                }
                _ => None,
            }
        };
        match worker_id {
            Some(worker_id) => self.pool.cancel(&worker_id, execution_id).await,
            None => false,
        }
    }

    /// Ask the pool for an idle worker and dispatch the head of the
    /// queue to it, if both are available (§4.3 processQueue).
    pub async fn process_queue(&self) {
        if self.queue.lock().await.is_empty() {
            return;
        }
        let worker_id = match self.pool.get_idle_worker().await {
            Some(worker_id) => worker_id,
            None => return,
        };
        let queued = match self.queue.lock().await.pop_front() {
            Some(queued) => queued,
            None => return,
        };
        self.dispatch_to_worker(worker_id, queued).await;
    }

    async fn dispatch_to_worker(&self, worker_id: persona_types::WorkerId, queued: QueuedRequest) {
        let QueuedRequest {
            execution_id,
            request,
        } = queued;

        // Step 1: token acquisition.
        let token = match self.acquire_token().await {
            Some(token) => token,
            None => {
                error!(%execution_id, "no credential token available, re-queueing at head");
                self.requeue_front(execution_id, request).await;
                return;
            }
        };

        // Steps 2-3: env assembly and prompt assembly.
        let persona = self
            .store
            .load_persona(&request.persona_id)
            .await
            .unwrap_or_else(|e| {
                warn!(persona_id = %request.persona_id, error = %e, "failed to load persona, dispatching with request prompt only");
                None
            });

        let (env, prompt) = match persona {
            Some(persona) => {
                let tools = self
                    .store
                    .load_tools(&persona.bound_tools)
                    .await
                    .unwrap_or_default();
                let bound_credentials = self.load_bound_credentials(&persona.bound_credentials).await;
                let materializer = CredentialMaterializer::new(&self.master_key);
                let assembled = materializer.assemble_env(
                    &token,
                    &bound_credentials,
                    persona.model_profile.as_ref(),
                );
                let prompt = persona_prompt::assemble_prompt(
                    &persona,
                    &tools,
                    request.input_data.as_ref(),
                    &assembled.credential_hints,
                );
                (assembled.env, prompt)
            }
            None => {
                let mut env = std::collections::BTreeMap::new();
                env.insert(persona_secret::BEARER_ENV_VAR.to_string(), token);
                (env, request.prompt.clone())
            }
        };

        // Step 4: record.
        self.active.lock().await.insert(
            execution_id.clone(),
            ActiveExecution {
                worker_id: worker_id.clone(),
                status: ActiveStatus::Running,
            },
        );
        if let Err(e) = self.mark_running(&execution_id).await {
            warn!(%execution_id, error = %e, "failed to persist running execution record");
        }

        // Step 5: send.
        let assigned = self
            .pool
            .assign(
                &worker_id,
                AssignRequest {
                    execution_id: execution_id.clone(),
                    persona_id: request.persona_id.to_string(),
                    prompt,
                    env,
                    timeout_ms: request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                    max_output_bytes: MAX_OUTPUT_BYTES,
                },
            )
            .await;

        if !assigned {
            self.active.lock().await.remove(&execution_id);
            if let Err(e) = self.revert_to_queued(&execution_id).await {
                warn!(%execution_id, error = %e, "failed to revert execution record to queued");
            }
            self.requeue_front(execution_id, request).await;
        }
    }

    async fn acquire_token(&self) -> Option<String> {
        if let Some(provider) = &self.token_provider {
            if let Some(token) = provider.get_valid_access_token().await {
                return Some(token);
            }
        }
        self.static_token.clone()
    }

    async fn load_bound_credentials(&self, ids: &[CredentialId]) -> Vec<BoundCredential> {
        match self.store.load_credentials(ids).await {
            Ok(records) => records
                .into_iter()
                .map(|record| BoundCredential {
                    name: record.name,
                    ciphertext: EncryptedCredential::new(record.ciphertext_b64),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to load bound credentials, proceeding without them");
                Vec::new()
            }
        }
    }

    async fn requeue_front(&self, execution_id: ExecutionId, request: DispatchRequest) {
        self.queue
            .lock()
            .await
            .push_front(QueuedRequest { execution_id, request });
    }

    async fn mark_running(&self, execution_id: &ExecutionId) -> Result<(), persona_types::StoreError> {
        if let Some(mut record) = self.store.get_execution(execution_id).await? {
            record.status = ExecutionStatus::Running;
            record.started_at_ms = Some(now_ms());
            self.store.put_execution(record).await?;
        }
        Ok(())
    }

    async fn revert_to_queued(&self, execution_id: &ExecutionId) -> Result<(), persona_types::StoreError> {
        if let Some(mut record) = self.store.get_execution(execution_id).await? {
            record.status = ExecutionStatus::Queued;
            record.started_at_ms = None;
            self.store.put_execution(record).await?;
        }
        Ok(())
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::WorkerConnected { .. } | PoolEvent::WorkerReady { .. } => {
                self.process_queue().await;
            }
            PoolEvent::Stdout {
                execution_id,
                chunk,
                timestamp,
                ..
            } => self.append_output(&execution_id, &chunk, timestamp).await,
            PoolEvent::Stderr {
                execution_id,
                chunk,
                timestamp,
                ..
            } => {
                let prefixed = format!("[STDERR] {chunk}");
                self.append_output(&execution_id, &prefixed, timestamp).await;
            }
            PoolEvent::Complete {
                execution_id,
                status,
                exit_code,
                duration_ms,
                session_id,
                total_cost_usd,
                ..
            } => {
                self.finalize(
                    execution_id,
                    status,
                    exit_code,
                    duration_ms,
                    session_id,
                    total_cost_usd,
                    None,
                )
                .await;
            }
            PoolEvent::WorkerDisconnected { execution_id, .. } => {
                if let Some(execution_id) = execution_id {
                    self.finalize(
                        execution_id,
                        CompletionStatus::Failed,
                        None,
                        0,
                        None,
                        None,
                        Some(WORKER_DISCONNECTED_MESSAGE.to_string()),
                    )
                    .await;
                }
            }
            PoolEvent::PersonaEvent {
                execution_id,
                event_type,
                payload,
                ..
            } => {
                self.bus
                    .produce(
                        topics::EVENTS,
                        serde_json::json!({
                            "executionId": execution_id.to_string(),
                            "eventType": event_type,
                            "payload": payload,
                        }),
                        Some(execution_id.as_str()),
                    )
                    .await;
            }
        }
    }

    async fn append_output(&self, execution_id: &ExecutionId, chunk: &str, timestamp: u64) {
        {
            let active = self.active.lock().await;
            if !active.contains_key(execution_id) {
                return;
            }
        }
        match self.store.get_execution(execution_id).await {
            Ok(Some(mut record)) => {
                record.output_data.push_str(chunk);
                if let Err(e) = self.store.put_execution(record).await {
                    warn!(%execution_id, error = %e, "failed to persist appended output");
                }
            }
            Ok(None) => warn!(%execution_id, "output chunk for unknown execution record"),
            Err(e) => warn!(%execution_id, error = %e, "failed to load execution record for output append"),
        }
        self.bus
            .produce(
                topics::OUTPUT,
                serde_json::json!({
                    "executionId": execution_id.to_string(),
                    "chunk": chunk,
                    "timestamp": timestamp,
                }),
                Some(execution_id.as_str()),
            )
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        execution_id: ExecutionId,
        status: CompletionStatus,
        exit_code: Option<i32>,
        duration_ms: u64,
        session_id: Option<String>,
        total_cost_usd: Option<String>,
        error_message: Option<String>,
    ) {
        {
            let mut active = self.active.lock().await;
            if let Some(entry) = active.get_mut(&execution_id) {
                entry.status = ActiveStatus::Terminal;
            }
        }

        let mapped_status = match status {
            CompletionStatus::Completed => ExecutionStatus::Completed,
            CompletionStatus::Failed => ExecutionStatus::Failed,
            CompletionStatus::Cancelled => ExecutionStatus::Cancelled,
        };

        match self.store.get_execution(&execution_id).await {
            Ok(Some(mut record)) => {
                record.status = mapped_status;
                record.completed_at_ms = Some(now_ms());
                record.duration_ms = Some(persona_types::DurationMs::from_millis(duration_ms));
                record.session_id = session_id.clone();
                record.cost_usd = total_cost_usd
                    .as_deref()
                    .and_then(|s| Decimal::from_str(s).ok());
                record.error_message = error_message.clone();
                if let Err(e) = self.store.put_execution(record).await {
                    warn!(%execution_id, error = %e, "failed to persist finalized execution record");
                }
            }
            Ok(None) => warn!(%execution_id, "complete reported for unknown execution record"),
            Err(e) => warn!(%execution_id, error = %e, "failed to load execution record for finalize"),
        }

        self.bus
            .produce(
                topics::LIFECYCLE,
                serde_json::json!({
                    "executionId": execution_id.to_string(),
                    "status": format!("{mapped_status:?}"),
                    "exitCode": exit_code,
                    "durationMs": duration_ms,
                    "sessionId": session_id,
                    "totalCostUsd": total_cost_usd,
                    "errorMessage": error_message,
                }),
                Some(execution_id.as_str()),
            )
            .await;

        schedule_retention_sweep(Arc::clone(&self.active), execution_id.clone());
        self.process_queue().await;
    }
}

fn schedule_retention_sweep(active: ActiveMap, execution_id: ExecutionId) {
    tokio::spawn(async move {
        tokio::time::sleep(RETAIN).await;
        active.lock().await.remove(&execution_id);
    });
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
