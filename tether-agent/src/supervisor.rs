//! Process supervisor: one assistant server per project.
//!
//! Ports come from a fixed pool and are handed back when the child is reaped
//! by the supervisor itself. Readiness is probed against the instance's
//! health endpoint with a hard timeout; a server that never becomes ready is
//! killed and its port released. Task invocations go against a ready
//! instance, starting one first when needed.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_contract::{CodedError, ErrorCode};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fixed port pool: 4096..=4196, 101 slots.
pub const PORT_RANGE_START: u16 = 4096;
pub const PORT_RANGE_END: u16 = 4196;

/// Readiness probe budget.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Assistant server binary and leading arguments.
    pub server_command: String,
    pub server_args: Vec<String>,
    pub ready_timeout: Duration,
    pub port_range: (u16, u16),
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_command: "tether-assistant-server".to_string(),
            server_args: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            port_range: (PORT_RANGE_START, PORT_RANGE_END),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// Recognized states of an assistant run. The terminal set is the single
/// allowlist every completion check goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskRunState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(TaskRunState::Queued),
            "running" => Some(TaskRunState::Running),
            "completed" => Some(TaskRunState::Completed),
            "failed" => Some(TaskRunState::Failed),
            "cancelled" => Some(TaskRunState::Cancelled),
            "timeout" => Some(TaskRunState::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            TaskRunState::Completed
            | TaskRunState::Failed
            | TaskRunState::Cancelled
            | TaskRunState::TimedOut => true,
            TaskRunState::Queued | TaskRunState::Running => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusInfo {
    pub project_id: String,
    pub port: u16,
    pub state: ServerState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub summary: String,
    pub stdout: String,
    pub stderr: String,
    pub meta: Value,
}

struct ServerHandle {
    port: u16,
    child: Child,
    state: ServerState,
}

/// Fixed-range port allocator; lowest free slot first.
pub struct PortPool {
    start: u16,
    end: u16,
    in_use: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            in_use: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        let port = (self.start..=self.end).find(|port| !self.in_use.contains(port))?;
        self.in_use.insert(port);
        Some(port)
    }

    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }

    pub fn free_count(&self) -> usize {
        (self.end - self.start + 1) as usize - self.in_use.len()
    }
}

struct SupervisorState {
    handles: HashMap<String, ServerHandle>,
    ports: PortPool,
}

pub struct Supervisor {
    config: SupervisorConfig,
    http: reqwest::Client,
    state: Mutex<SupervisorState>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, CodedError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| CodedError::internal(format!("build http client: {err}")))?;
        let (start, end) = config.port_range;
        Ok(Self {
            config,
            http,
            state: Mutex::new(SupervisorState {
                handles: HashMap::new(),
                ports: PortPool::new(start, end),
            }),
        })
    }

    /// Ensure a ready server for the project and return its port. A live
    /// handle short-circuits; otherwise the lowest free port is allocated and
    /// a fresh subprocess launched and probed.
    pub async fn start_server(
        &self,
        project_id: &str,
        canonical_path: &Path,
    ) -> Result<u16, CodedError> {
        let port = {
            let mut state = self.state.lock().await;
            reap_exited(&mut state);

            if let Some(handle) = state.handles.get(project_id) {
                if handle.state == ServerState::Ready {
                    debug!(project_id = %project_id, port = handle.port, "Server already running");
                    return Ok(handle.port);
                }
            }

            // A start cancelled mid-probe leaves a non-ready handle behind;
            // kill it and reclaim its port before allocating a fresh one.
            if let Some(mut stale) = state.handles.remove(project_id) {
                warn!(
                    project_id = %project_id,
                    port = stale.port,
                    "Discarding stale non-ready server"
                );
                let _ = stale.child.start_kill();
                let _ = stale.child.wait().await;
                state.ports.release(stale.port);
            }

            let port = state.ports.allocate().ok_or_else(|| {
                CodedError::new(
                    ErrorCode::PortExhausted,
                    format!(
                        "no free ports in {}-{}",
                        self.config.port_range.0, self.config.port_range.1
                    ),
                )
            })?;

            let child = match self.spawn_server(port, canonical_path) {
                Ok(child) => child,
                Err(err) => {
                    state.ports.release(port);
                    return Err(err);
                }
            };

            info!(project_id = %project_id, port, "Launched assistant server");
            state.handles.insert(
                project_id.to_string(),
                ServerHandle {
                    port,
                    child,
                    state: ServerState::Starting,
                },
            );
            port
        };

        // Probe readiness without holding the state lock.
        if self.await_ready(port).await {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.handles.get_mut(project_id) {
                handle.state = ServerState::Ready;
            }
            info!(project_id = %project_id, port, "Assistant server ready");
            return Ok(port);
        }

        warn!(project_id = %project_id, port, "Assistant server failed readiness probe");
        let mut state = self.state.lock().await;
        if let Some(mut handle) = state.handles.remove(project_id) {
            let _ = handle.child.start_kill();
            let _ = handle.child.wait().await;
            state.ports.release(handle.port);
        }
        Err(CodedError::new(
            ErrorCode::StartTimeout,
            format!(
                "server did not become ready within {}s",
                self.config.ready_timeout.as_secs()
            ),
        ))
    }

    /// Run a task against the project's server, starting it first when
    /// needed. Blocks until the run reaches a recognized terminal state.
    pub async fn run_task(
        &self,
        project_id: &str,
        canonical_path: &Path,
        prompt: &str,
    ) -> Result<TaskOutcome, CodedError> {
        let port = self.start_server(project_id, canonical_path).await?;
        let base = format!("http://127.0.0.1:{port}");

        let response = self
            .http
            .post(format!("{base}/task"))
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|err| CodedError::new(ErrorCode::TaskFailed, format!("task request: {err}")))?;

        if !response.status().is_success() {
            return Err(CodedError::new(
                ErrorCode::TaskFailed,
                format!("task endpoint returned {}", response.status()),
            ));
        }

        let mut task: TaskResponse = response
            .json()
            .await
            .map_err(|err| CodedError::new(ErrorCode::TaskFailed, format!("task response: {err}")))?;

        // Non-terminal answers are polled until the run settles; the
        // dispatcher's execution timeout bounds the whole exchange.
        loop {
            let state = TaskRunState::parse(&task.status).ok_or_else(|| {
                CodedError::new(
                    ErrorCode::TaskFailed,
                    format!("unrecognized run state '{}'", task.status),
                )
            })?;

            if state.is_terminal() {
                return finish_task(project_id, port, state, task);
            }

            let run_id = task.run_id.clone().ok_or_else(|| {
                CodedError::new(
                    ErrorCode::TaskFailed,
                    "non-terminal run without a run_id cannot be tracked",
                )
            })?;

            tokio::time::sleep(TASK_POLL_INTERVAL).await;
            task = self
                .http
                .get(format!("{base}/task/{run_id}"))
                .send()
                .await
                .map_err(|err| {
                    CodedError::new(ErrorCode::TaskFailed, format!("task poll: {err}"))
                })?
                .json()
                .await
                .map_err(|err| {
                    CodedError::new(ErrorCode::TaskFailed, format!("task poll response: {err}"))
                })?;
        }
    }

    /// Snapshot of live servers, reaping exited children first.
    pub async fn statuses(&self) -> Vec<ServerStatusInfo> {
        let mut state = self.state.lock().await;
        reap_exited(&mut state);
        let mut infos: Vec<ServerStatusInfo> = state
            .handles
            .iter()
            .map(|(project_id, handle)| ServerStatusInfo {
                project_id: project_id.clone(),
                port: handle.port,
                state: handle.state,
            })
            .collect();
        infos.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        infos
    }

    /// Terminate every child and release all ports.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.lock().await;
        let SupervisorState { handles, ports } = &mut *state;
        for (project_id, mut handle) in handles.drain() {
            info!(project_id = %project_id, port = handle.port, "Stopping assistant server");
            let _ = handle.child.start_kill();
            let _ = handle.child.wait().await;
            ports.release(handle.port);
        }
    }

    fn spawn_server(&self, port: u16, canonical_path: &Path) -> Result<Child, CodedError> {
        Command::new(&self.config.server_command)
            .args(&self.config.server_args)
            .arg("--port")
            .arg(port.to_string())
            .current_dir(canonical_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CodedError::internal(format!(
                    "failed to spawn '{}': {err}",
                    self.config.server_command
                ))
            })
    }

    async fn await_ready(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;

        while tokio::time::Instant::now() < deadline {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(_) | Err(_) => {}
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        false
    }
}

/// Release ports of children observed to have exited.
fn reap_exited(state: &mut SupervisorState) {
    let mut exited = Vec::new();
    for (project_id, handle) in state.handles.iter_mut() {
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                info!(
                    project_id = %project_id,
                    port = handle.port,
                    %status,
                    "Reaped exited assistant server"
                );
                exited.push(project_id.clone());
            }
            Ok(None) => {}
            Err(err) => {
                warn!(project_id = %project_id, "try_wait failed: {err}");
                exited.push(project_id.clone());
            }
        }
    }
    for project_id in exited {
        if let Some(handle) = state.handles.remove(&project_id) {
            state.ports.release(handle.port);
        }
    }
}

fn finish_task(
    project_id: &str,
    port: u16,
    state: TaskRunState,
    task: TaskResponse,
) -> Result<TaskOutcome, CodedError> {
    let summary = task.summary.unwrap_or_default();
    let stdout = task.stdout.unwrap_or_default();
    let stderr = task.stderr.unwrap_or_default();

    match state {
        TaskRunState::Completed => Ok(TaskOutcome {
            summary: if summary.is_empty() {
                "task completed".to_string()
            } else {
                summary
            },
            stdout,
            stderr,
            meta: json!({ "project_id": project_id, "port": port, "run_state": task.status }),
        }),
        TaskRunState::Failed | TaskRunState::Cancelled | TaskRunState::TimedOut => {
            Err(CodedError::new(
                ErrorCode::TaskFailed,
                if summary.is_empty() {
                    format!("run ended in state '{}'", task.status)
                } else {
                    summary
                },
            ))
        }
        TaskRunState::Queued | TaskRunState::Running => Err(CodedError::internal(
            "finish_task called with non-terminal state",
        )),
    }
}
