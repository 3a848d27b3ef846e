//! Agent dispatcher: the long-poll loop and serialized command execution.
//!
//! Every received command goes through the idempotency cache first, then the
//! contract validators. Mutating commands are executed one at a time in
//! receipt order on a single worker; `status` bypasses the worker and answers
//! immediately. Each execution is bounded by a hard timeout and its outcome
//! is cached and posted back, win or lose.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tether_contract::{
    Command, CommandEnvelope, CommandResult, CodedError, ErrorCode, PolicyScope,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::client::{BackendClient, ClientError};
use crate::idempotency::{IdempotencyCache, KeyState};
use crate::policy::PolicyStore;
use crate::projects::ProjectStore;
use crate::supervisor::Supervisor;

/// Server-side long-poll bound.
pub const LONG_POLL: Duration = Duration::from_secs(25);
/// Hard ceiling on one command's execution.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(600);
/// Sleep between retries after a transport failure.
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(3);
/// Attempts to post a result before giving up and letting redelivery recover.
const RESULT_POST_ATTEMPTS: u32 = 3;

/// Owns the agent-side stores and runs validated commands against them.
pub struct CommandExecutor {
    agent_id: String,
    projects: std::sync::Mutex<ProjectStore>,
    policies: std::sync::Mutex<PolicyStore>,
    supervisor: Supervisor,
}

impl CommandExecutor {
    pub fn new(
        agent_id: String,
        projects: ProjectStore,
        policies: PolicyStore,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            agent_id,
            projects: std::sync::Mutex::new(projects),
            policies: std::sync::Mutex::new(policies),
            supervisor,
        }
    }

    /// Execute a mutating command to a Result. Contract validation has
    /// already happened; policy checks happen here, before any side effect.
    pub async fn execute(&self, command_id: &str, command: &Command) -> CommandResult {
        match self.try_execute(command).await {
            Ok(result_body) => result_body.into_result(command_id),
            Err(err) => {
                warn!(command_id = %command_id, error = %err, "Command failed");
                CommandResult::failure(command_id, &err)
            }
        }
    }

    async fn try_execute(&self, command: &Command) -> Result<Outcome, CodedError> {
        match command {
            Command::Status => Ok(self.status_snapshot().await),
            Command::RegisterProject { path } => {
                let project_id = {
                    let mut projects = lock(&self.projects)?;
                    projects.register(&self.agent_id, path)?
                };
                Ok(Outcome {
                    summary: format!("registered project {project_id}"),
                    stdout: String::new(),
                    stderr: String::new(),
                    meta: json!({ "project_id": project_id }),
                })
            }
            Command::ApplyProjectPolicy {
                project_id,
                decision,
            } => {
                {
                    let projects = lock(&self.projects)?;
                    projects.get(project_id)?;
                }
                let record = {
                    let mut policies = lock(&self.policies)?;
                    policies.apply(project_id, *decision, Utc::now())?
                };
                Ok(Outcome {
                    summary: format!(
                        "policy for {project_id} set to {:?} (scopes: {})",
                        record.decision,
                        record.scopes.len()
                    ),
                    stdout: String::new(),
                    stderr: String::new(),
                    meta: json!({
                        "project_id": project_id,
                        "expires_at": record.expires_at,
                    }),
                })
            }
            Command::StartServer { project_id } => {
                let path = {
                    let projects = lock(&self.projects)?;
                    let record = projects.get(project_id)?;
                    record.canonical_path.clone()
                };
                {
                    let policies = lock(&self.policies)?;
                    policies.authorize(project_id, PolicyScope::StartServer, Utc::now())?;
                }
                let port = self.supervisor.start_server(project_id, &path).await?;
                Ok(Outcome {
                    summary: format!("server ready on port {port}"),
                    stdout: String::new(),
                    stderr: String::new(),
                    meta: json!({ "project_id": project_id, "port": port }),
                })
            }
            Command::RunTask { project_id, prompt } => {
                let path = {
                    let projects = lock(&self.projects)?;
                    let record = projects.get(project_id)?;
                    record.canonical_path.clone()
                };
                {
                    let policies = lock(&self.policies)?;
                    policies.authorize(project_id, PolicyScope::RunTask, Utc::now())?;
                }
                let outcome = self.supervisor.run_task(project_id, &path, prompt).await?;
                Ok(Outcome {
                    summary: outcome.summary,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    meta: outcome.meta,
                })
            }
        }
    }

    /// Read-only status snapshot; safe to run concurrently with a mutating
    /// command.
    pub async fn status(&self, command_id: &str) -> CommandResult {
        self.status_snapshot().await.into_result(command_id)
    }

    async fn status_snapshot(&self) -> Outcome {
        let (project_count, policy_count) = {
            let projects = self.projects.lock().map(|p| p.len()).unwrap_or(0);
            let policies = self.policies.lock().map(|p| p.len()).unwrap_or(0);
            (projects, policies)
        };
        let servers = self.supervisor.statuses().await;
        Outcome {
            summary: format!(
                "{project_count} project(s), {policy_count} policy record(s), {} server(s)",
                servers.len()
            ),
            stdout: String::new(),
            stderr: String::new(),
            meta: json!({
                "agent_id": self.agent_id,
                "projects": project_count,
                "policies": policy_count,
                "servers": servers,
            }),
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown_all().await;
    }
}

struct Outcome {
    summary: String,
    stdout: String,
    stderr: String,
    meta: serde_json::Value,
}

impl Outcome {
    fn into_result(self, command_id: &str) -> CommandResult {
        CommandResult::success(command_id, self.summary)
            .with_output(&self.stdout, &self.stderr)
            .with_meta(self.meta)
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, CodedError> {
    mutex
        .lock()
        .map_err(|_| CodedError::internal("agent state lock poisoned"))
}

pub struct Dispatcher {
    client: Arc<BackendClient>,
    executor: Arc<CommandExecutor>,
    cache: Arc<Mutex<IdempotencyCache>>,
}

impl Dispatcher {
    pub fn new(client: BackendClient, executor: CommandExecutor) -> Self {
        Self {
            client: Arc::new(client),
            executor: Arc::new(executor),
            cache: Arc::new(Mutex::new(IdempotencyCache::new())),
        }
    }

    /// Poll-dispatch loop. Returns when `shutdown` flips; a command dequeued
    /// but not yet executed is left unposted so the queue redelivers it.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (worker_tx, worker_rx) = mpsc::channel::<(CommandEnvelope, Command)>(32);
        let worker = tokio::spawn(worker_loop(
            worker_rx,
            self.client.clone(),
            self.executor.clone(),
            self.cache.clone(),
            shutdown.clone(),
        ));

        info!("Dispatcher started, polling for work");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                polled = self.client.poll(LONG_POLL) => match polled {
                    Ok(Some(envelope)) => self.handle(envelope, &worker_tx).await,
                    Ok(None) => debug!("Poll returned no work"),
                    Err(ClientError::Unauthorized) => {
                        // Superseded by a newer pairing; nothing left to do.
                        error!("Agent key rejected by backend; stopping dispatcher");
                        break;
                    }
                    Err(err) => {
                        warn!("Poll failed: {err}; backing off");
                        tokio::time::sleep(TRANSPORT_BACKOFF).await;
                    }
                },
            }
        }

        drop(worker_tx);
        let _ = worker.await;
        self.executor.shutdown().await;
        info!("Dispatcher stopped");
    }

    async fn handle(
        &self,
        envelope: CommandEnvelope,
        worker_tx: &mpsc::Sender<(CommandEnvelope, Command)>,
    ) {
        let key_state = {
            let mut cache = self.cache.lock().await;
            cache.begin(&envelope.idempotency_key, Utc::now())
        };

        match key_state {
            KeyState::Cached(mut cached) => {
                // Replay: same outcome, no side effects. The backend keys
                // results by command_id, so answer under the id it asked with.
                info!(
                    command_id = %envelope.command_id,
                    idempotency_key = %envelope.idempotency_key,
                    "Replaying cached result"
                );
                cached.command_id = envelope.command_id.clone();
                post_result(&self.client, &cached).await;
            }
            KeyState::Running => {
                debug!(
                    command_id = %envelope.command_id,
                    "Duplicate delivery while execution in progress; dropping"
                );
            }
            KeyState::Fresh => match Command::parse(&envelope) {
                Err(err) => {
                    let result = CommandResult::failure(&envelope.command_id, &err);
                    finish(&self.cache, &envelope.idempotency_key, &result).await;
                    post_result(&self.client, &result).await;
                }
                Ok(Command::Status) => {
                    // Read-only: bypass the worker, answer concurrently.
                    let client = self.client.clone();
                    let executor = self.executor.clone();
                    let cache = self.cache.clone();
                    tokio::spawn(async move {
                        let result = executor.status(&envelope.command_id).await;
                        finish(&cache, &envelope.idempotency_key, &result).await;
                        post_result(&client, &result).await;
                    });
                }
                Ok(command) => {
                    if worker_tx.send((envelope, command)).await.is_err() {
                        warn!("Worker gone; command left inflight for redelivery");
                    }
                }
            },
        }
    }
}

/// Serialized execution of mutating commands, in receipt order.
async fn worker_loop(
    mut rx: mpsc::Receiver<(CommandEnvelope, Command)>,
    client: Arc<BackendClient>,
    executor: Arc<CommandExecutor>,
    cache: Arc<Mutex<IdempotencyCache>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (envelope, command) = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = rx.recv() => match received {
                Some(item) => item,
                None => break,
            },
        };

        info!(
            command_id = %envelope.command_id,
            command_type = command.command_type().as_str(),
            "Executing command"
        );

        let result = match tokio::time::timeout(
            EXEC_TIMEOUT,
            executor.execute(&envelope.command_id, &command),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(command_id = %envelope.command_id, "Execution exceeded hard timeout");
                CommandResult::failure(
                    &envelope.command_id,
                    &CodedError::new(
                        ErrorCode::InternalTimeout,
                        format!("execution exceeded {}s", EXEC_TIMEOUT.as_secs()),
                    ),
                )
            }
        };

        finish(&cache, &envelope.idempotency_key, &result).await;
        post_result(&client, &result).await;
    }

    // Anything still queued stays inflight on the backend and will be
    // redelivered after the liveness threshold.
    while let Ok((envelope, _)) = rx.try_recv() {
        let mut cache = cache.lock().await;
        cache.abandon(&envelope.idempotency_key);
    }
}

async fn finish(cache: &Mutex<IdempotencyCache>, key: &str, result: &CommandResult) {
    let mut cache = cache.lock().await;
    cache.finish(key, result.clone(), Utc::now());
}

async fn post_result(client: &BackendClient, result: &CommandResult) {
    for attempt in 1..=RESULT_POST_ATTEMPTS {
        match client.post_result(result).await {
            Ok(()) => return,
            Err(err) if attempt < RESULT_POST_ATTEMPTS => {
                warn!(
                    command_id = %result.command_id,
                    attempt,
                    "Failed to post result: {err}; retrying"
                );
                tokio::time::sleep(TRANSPORT_BACKOFF).await;
            }
            Err(err) => {
                // Give up; the queue's redelivery will bring the command back.
                error!(command_id = %result.command_id, "Failed to post result: {err}");
            }
        }
    }
}
