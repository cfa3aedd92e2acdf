use std::sync::Arc;
use std::time::Duration;

use jackadi_common::constant::{HEALTH_PING_TASK, SPECS_ALL_TASK};
use jackadi_common::message::{InternalError, LockMode, TaskRequest, TaskResponse};
use jackadi_common::plugin::{parse_task_name, HostError, PluginHost, TaskOutput};
use tokio::select;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

#[cfg(test)]
mod test_engine;

/// Executes task requests under the agent's concurrency discipline:
/// a bounded admission queue, a slot pool for no-lock tasks, a single
/// slot for write/exclusive tasks, and a readers-writer lock that
/// exclusive tasks hold for themselves.
///
/// One engine is wired to each manager stream; the queue, slots, and
/// lock are shared through the global state so accounting survives
/// reconnects.
pub struct Engine {
    pub host: Arc<dyn PluginHost>,
    pub requests_queue: Arc<Semaphore>,
    pub running_tasks: Arc<Semaphore>,
    pub running_write_task: Arc<Semaphore>,
    pub exclusive_lock: Arc<RwLock<()>>,
    /// Fallback budget for requests that carry no timeout.
    pub task_timeout: Duration,
    pub responses: mpsc::UnboundedSender<TaskResponse>,
    /// The long-lived context tasks run under; stream loss does not
    /// cancel it.
    pub shutdown: CancellationToken,
    pub workers: TaskTracker,
}

impl Engine {
    /// Drain the inbound request stream until it closes.
    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<TaskRequest>) {
        while let Some(request) = requests.recv().await {
            self.handle(request);
        }
        debug!("engine input stream closed");
    }

    /// Admit one request. Never blocks the inbound stream: the fast
    /// path answers inline and everything else is either rejected
    /// here or handed to a worker.
    fn handle(&self, request: TaskRequest) {
        // health checks bypass every queue and lock
        if request.task_name == HEALTH_PING_TASK {
            self.respond(TaskResponse {
                task_id: request.task_id,
                group_id: request.group_id,
                output: b"true".to_vec(),
                ..Default::default()
            });
            return;
        }

        let lock_mode = match self.resolve_lock_mode(&request) {
            Ok(mode) => mode,
            Err(internal_error) => {
                self.respond(TaskResponse::internal(
                    request.task_id,
                    request.group_id,
                    internal_error,
                ));
                return;
            }
        };

        let slot = match lock_mode {
            LockMode::NoLock => Arc::clone(&self.running_tasks),
            _ => Arc::clone(&self.running_write_task),
        };

        // reject-new admission; the stream is never blocked on a full
        // queue
        let queue_permit = match Arc::clone(&self.requests_queue).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.respond(TaskResponse::internal(
                    request.task_id,
                    request.group_id,
                    InternalError::FullQueue,
                ));
                return;
            }
        };

        let timeout = match request.timeout_secs {
            0 => self.task_timeout,
            secs => Duration::from_secs(u64::from(secs)),
        };

        let worker = Worker {
            host: Arc::clone(&self.host),
            exclusive_lock: Arc::clone(&self.exclusive_lock),
            responses: self.responses.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.workers.spawn(async move {
            worker.run(request, lock_mode, slot, queue_permit, timeout).await;
        });
    }

    /// The discipline a request runs under: an explicit override wins,
    /// otherwise the plugin's declaration, with no-lock as the
    /// fallback when the plugin cannot be asked.
    fn resolve_lock_mode(&self, request: &TaskRequest) -> Result<LockMode, InternalError> {
        if request.lock_override != LockMode::Unspecified {
            return Ok(request.lock_override);
        }

        let Some(name) = parse_task_name(&request.task_name) else {
            return Err(InternalError::UnknownTask);
        };

        Ok(self
            .host
            .task_lock_mode(name.plugin, name.task)
            .unwrap_or(LockMode::NoLock))
    }

    fn respond(&self, response: TaskResponse) {
        if self.responses.send(response).is_err() {
            debug!("response channel closed, dropping response");
        }
    }
}

struct Worker {
    host: Arc<dyn PluginHost>,
    exclusive_lock: Arc<RwLock<()>>,
    responses: mpsc::UnboundedSender<TaskResponse>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(
        self,
        request: TaskRequest,
        lock_mode: LockMode,
        slot: Arc<Semaphore>,
        queue_permit: OwnedSemaphorePermit,
        timeout: Duration,
    ) {
        // one deadline spans both the slot wait and the execution
        let deadline = Instant::now() + timeout;

        let slot_permit = select! {
            permit = slot.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tokio::time::sleep_until(deadline) => {
                self.respond(TaskResponse::internal(
                    request.task_id,
                    request.group_id,
                    InternalError::Timeout,
                ));
                return;
            }
            _ = self.shutdown.cancelled() => return,
        };

        let lock_guard = select! {
            guard = async {
                match lock_mode {
                    LockMode::Exclusive => LockGuard::Write(self.exclusive_lock.write().await),
                    _ => LockGuard::Read(self.exclusive_lock.read().await),
                }
            } => guard,
            _ = self.shutdown.cancelled() => return,
        };

        // watch for the deadline passing mid-execution; the plugin is
        // not interrupted, the manager just learns it started and ran
        // long
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let watcher = {
            let responses = self.responses.clone();
            let task_id = request.task_id;
            let group_id = request.group_id;
            tokio::spawn(async move {
                select! {
                    _ = finished_rx => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        let started_timeout =
                            TaskResponse::internal(task_id, group_id, InternalError::StartedTimeout);
                        if responses.send(started_timeout).is_err() {
                            debug!("response channel closed, dropping started-timeout");
                        }
                    }
                }
            })
        };

        let result = self.invoke(&request).await;

        // stop the watcher; if the deadline already fired, the
        // started-timeout is on the wire and the real result follows
        let _ = finished_tx.send(());
        if let Err(e) = watcher.await {
            error!("timeout watcher panicked: {e}");
        }

        self.respond(shape_response(&request, result));

        drop(lock_guard);
        drop(slot_permit);
        drop(queue_permit);
    }

    /// Invoke the task through the plugin host, resolving the specs
    /// built-in internally.
    async fn invoke(&self, request: &TaskRequest) -> Result<TaskOutput, HostError> {
        if request.task_name == SPECS_ALL_TASK {
            let specs = self.host.collect_specs().await;
            return Ok(TaskOutput {
                output: serde_json::to_vec(&specs).unwrap_or_default(),
                ..Default::default()
            });
        }

        let Some(name) = parse_task_name(&request.task_name) else {
            return Err(HostError::UnknownTask(request.task_name.clone(), String::new()));
        };
        self.host
            .invoke(name.plugin, name.task, &request.args, &request.options)
            .await
    }

    fn respond(&self, response: TaskResponse) {
        if self.responses.send(response).is_err() {
            debug!("response channel closed, dropping response");
        }
    }
}

enum LockGuard<'a> {
    Read(tokio::sync::RwLockReadGuard<'a, ()>),
    Write(tokio::sync::RwLockWriteGuard<'a, ()>),
}

fn shape_response(request: &TaskRequest, result: Result<TaskOutput, HostError>) -> TaskResponse {
    match result {
        Ok(output) => TaskResponse {
            task_id: request.task_id,
            group_id: request.group_id,
            output: output.output,
            task_error: output.task_error,
            retcode: output.retcode,
            ..Default::default()
        },
        Err(e @ (HostError::UnknownPlugin(_) | HostError::UnknownTask(..))) => TaskResponse {
            task_id: request.task_id,
            group_id: request.group_id,
            internal_error: InternalError::UnknownTask,
            module_error: e.to_string(),
            ..Default::default()
        },
        Err(e) => TaskResponse {
            task_id: request.task_id,
            group_id: request.group_id,
            internal_error: InternalError::ModuleError,
            module_error: e.module_error(),
            ..Default::default()
        },
    }
}
