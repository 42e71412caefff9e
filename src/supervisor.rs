//! Lifecycle management for a single external worker process
//!
//! The [`Supervisor`] owns at most one child. Every transition (start, stop,
//! restart, status poll) runs under one async lock, so concurrent requests
//! observe a consistent state and can never launch two workers.
//!
//! ```text
//!            start                  stop
//!   Absent ─────────▶ Running ─────────────▶ Absent
//!     ▲                  │
//!     │ start            │ exits on its own
//!     └──────────── Stopped (handle kept until next start)
//! ```

use crate::config::SupervisorConfig;
use crate::error::{json_error_response, ApiError};
use crate::server::{json_value_response, Handler, HttpResponse};
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Observed state of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    /// No handle: never started, or stopped through the API
    #[serde(rename = "not running")]
    NotRunning,
    /// Handle present and the process has not exited
    #[serde(rename = "running")]
    Running,
    /// Handle present but the process exited on its own
    #[serde(rename = "stopped")]
    Stopped,
}

/// A launched worker
struct Worker {
    child: Child,
    pid: Option<u32>,
}

impl Worker {
    fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = ?self.pid, ?status, "Worker has exited");
                false
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to poll worker status");
                false
            }
        }
    }
}

/// Supervises exactly one worker process
pub struct Supervisor {
    config: SupervisorConfig,
    slot: Mutex<Option<Worker>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot: Mutex::new(None),
        })
    }

    /// Poll the worker without changing state
    pub async fn status(&self) -> WorkerStatus {
        let mut slot = self.slot.lock().await;
        match slot.as_mut().map(Worker::is_running) {
            None => WorkerStatus::NotRunning,
            Some(true) => WorkerStatus::Running,
            Some(false) => WorkerStatus::Stopped,
        }
    }

    /// Launch the worker unless one is already running
    pub async fn start(&self) -> Result<Option<u32>, ApiError> {
        let mut slot = self.slot.lock().await;
        self.start_locked(&mut slot).await
    }

    /// Terminate the running worker and wait for it to exit
    ///
    /// Without a configured grace period this waits as long as the worker
    /// takes to exit.
    pub async fn stop(&self) -> Result<(), ApiError> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot).await
    }

    /// Stop then start under a single lock. A worker that is not running is
    /// reported as an error and no start is attempted.
    pub async fn restart(&self) -> Result<Option<u32>, ApiError> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot).await?;
        self.start_locked(&mut slot).await
    }

    async fn start_locked(&self, slot: &mut Option<Worker>) -> Result<Option<u32>, ApiError> {
        if slot.as_mut().is_some_and(Worker::is_running) {
            return Err(ApiError::Conflict("Process is already running".to_string()));
        }

        let worker = self.spawn_worker()?;
        let pid = worker.pid;
        if let Some(pid) = pid {
            self.write_pid_file(pid).await;
        }
        *slot = Some(worker);
        Ok(pid)
    }

    async fn stop_locked(&self, slot: &mut Option<Worker>) -> Result<(), ApiError> {
        match slot.as_mut().map(Worker::is_running) {
            Some(true) => {}
            Some(false) => {
                // Exited on its own; the handle stays but the pid is dead
                self.remove_pid_file().await;
                return Err(ApiError::Conflict("Process is not running".to_string()));
            }
            None => return Err(ApiError::Conflict("Process is not running".to_string())),
        }
        let Some(mut worker) = slot.take() else {
            return Err(ApiError::Conflict("Process is not running".to_string()));
        };

        self.terminate(&mut worker).await;
        self.remove_pid_file().await;
        Ok(())
    }

    /// Called when the service shuts down
    pub async fn shutdown(&self) {
        if !self.config.stop_on_shutdown {
            if self.status().await == WorkerStatus::Running {
                info!("Leaving worker running (stop_on_shutdown is disabled)");
            }
            return;
        }
        match self.stop().await {
            Ok(()) => info!("Worker stopped for shutdown"),
            Err(ApiError::Conflict(_)) => {}
            Err(e) => warn!(error = %e, "Failed to stop worker during shutdown"),
        }
    }

    /// Inspect a pid file left by a previous run.
    ///
    /// Returns the pid of a still-alive orphan. The orphan is not adopted; it
    /// has to be stopped by hand before `/start` is useful again.
    pub async fn reconcile(&self) -> Option<u32> {
        let path = self.config.pid_file.as_deref()?;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read pid file");
                return None;
            }
        };

        match content.trim().parse::<u32>() {
            Ok(pid) if process_alive(pid) => {
                warn!(
                    pid,
                    path = %path.display(),
                    "Worker from a previous run is still alive; stop it manually"
                );
                Some(pid)
            }
            Ok(pid) => {
                info!(pid, path = %path.display(), "Removing stale pid file");
                remove_file_logged(path).await;
                None
            }
            Err(_) => {
                warn!(path = %path.display(), "Removing unparsable pid file");
                remove_file_logged(path).await;
                None
            }
        }
    }

    fn spawn_worker(&self) -> Result<Worker, ApiError> {
        let (program, args) = self.config.program().map_err(|e| {
            ApiError::Launch(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e.to_string(),
            ))
        })?;

        info!(command = %program, ?args, "Starting worker");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(command = %program, error = %e, "Failed to spawn worker");
            ApiError::Launch(e)
        })?;
        let pid = child.id();
        info!(pid, "Worker process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, pid, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, pid, "stderr");
        }

        Ok(Worker { child, pid })
    }

    async fn terminate(&self, worker: &mut Worker) {
        let child = &mut worker.child;

        if let Some(pid) = worker.pid {
            info!(pid, "Sending SIGTERM to worker");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        let wait_result = match self.config.shutdown_grace_period() {
            Some(grace_period) => match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        pid = ?worker.pid,
                        grace_period_secs = grace_period.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(pid = ?worker.pid, error = %e, "Failed to kill worker");
                    }
                    return;
                }
            },
            None => child.wait().await,
        };

        match wait_result {
            Ok(status) => info!(pid = ?worker.pid, ?status, "Worker exited"),
            Err(e) => warn!(pid = ?worker.pid, error = %e, "Error waiting for worker to exit"),
        }
    }

    async fn write_pid_file(&self, pid: u32) {
        if let Some(ref path) = self.config.pid_file {
            if let Err(e) = tokio::fs::write(path, format!("{}\n", pid)).await {
                warn!(path = %path.display(), error = %e, "Failed to write pid file");
            }
        }
    }

    async fn remove_pid_file(&self) {
        if let Some(ref path) = self.config.pid_file {
            remove_file_logged(path).await;
        }
    }
}

async fn remove_file_logged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists under another user
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Forward a worker output stream into the log, line by line
fn forward_output<R>(reader: R, pid: Option<u32>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if stream == "stderr" {
                        warn!(target: "worker", pid, stream, "{}", line);
                    } else {
                        info!(target: "worker", pid, stream, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(pid, stream, error = %e, "Worker output closed");
                    break;
                }
            }
        }
    });
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: WorkerStatus,
}

/// HTTP front of the supervisor
pub struct SupervisorService {
    supervisor: Arc<Supervisor>,
}

impl SupervisorService {
    pub fn new(supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(Self { supervisor })
    }

    fn action_result(
        result: Result<Option<u32>, ApiError>,
        message: &'static str,
    ) -> HttpResponse {
        match result {
            Ok(_) => json_value_response(
                StatusCode::OK,
                &ActionResponse {
                    status: "success",
                    message,
                },
            ),
            Err(e) => {
                if e.is_server_fault() {
                    error!(error = %e, "Supervisor action failed");
                }
                json_error_response(&e)
            }
        }
    }
}

impl Handler for SupervisorService {
    fn name(&self) -> &'static str {
        "supervisor"
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> HttpResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        drop(req);

        match (method, path.as_str()) {
            (Method::POST, "/start") => {
                Self::action_result(self.supervisor.start().await, "Process started")
            }
            (Method::POST, "/stop") => Self::action_result(
                self.supervisor.stop().await.map(|()| None),
                "Process stopped",
            ),
            (Method::POST, "/restart") => {
                Self::action_result(self.supervisor.restart().await, "Process restarted")
            }
            (Method::GET, "/status") => {
                let status = self.supervisor.status().await;
                json_value_response(StatusCode::OK, &StatusResponse { status })
            }
            _ => json_error_response(&ApiError::NotFound("not found".to_string())),
        }
    }
}
