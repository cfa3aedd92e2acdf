use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use jackadi_common::constant::MAX_CONCURRENT_TASKS;
use jackadi_common::message::InputValue;
use jackadi_common::plugin::PluginManifest;
use jackadi_common::state::SpecsMap;
use serde_json::json;

use super::*;

/// Plugin host driven entirely by task names: `sleep`, `excl`, and
/// `write` plugins nap for `args[0]` milliseconds, tracing start/end
/// with the `tag` option.
#[derive(Default)]
struct StubHost {
    trace: Mutex<Vec<String>>,
}

impl StubHost {
    fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginHost for StubHost {
    fn task_lock_mode(&self, plugin: &str, _task: &str) -> Result<LockMode, HostError> {
        match plugin {
            "sleep" => Ok(LockMode::NoLock),
            "write" => Ok(LockMode::Write),
            "excl" => Ok(LockMode::Exclusive),
            other => Err(HostError::UnknownPlugin(other.to_string())),
        }
    }

    async fn invoke(
        &self,
        plugin: &str,
        task: &str,
        args: &[InputValue],
        options: &IndexMap<String, InputValue>,
    ) -> Result<TaskOutput, HostError> {
        match plugin {
            "sleep" | "write" | "excl" => {
                let millis = match args.first() {
                    Some(InputValue::Int(millis)) => *millis as u64,
                    _ => 0,
                };
                let tag = match options.get("tag") {
                    Some(InputValue::String(tag)) => tag.clone(),
                    _ => String::new(),
                };

                if !tag.is_empty() {
                    self.trace.lock().unwrap().push(format!("start:{tag}"));
                }
                tokio::time::sleep(Duration::from_millis(millis)).await;
                if !tag.is_empty() {
                    self.trace.lock().unwrap().push(format!("end:{tag}"));
                }

                Ok(TaskOutput {
                    output: b"\"done\"".to_vec(),
                    ..Default::default()
                })
            }
            "boom" => Err(HostError::Call {
                code: "Unknown".to_string(),
                message: "kaput".to_string(),
            }),
            other => Err(HostError::UnknownPlugin(format!("{other}:{task}"))),
        }
    }

    async fn collect_specs(&self) -> SpecsMap {
        json!({ "stub": { "os": "linux" } })
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    fn loaded(&self) -> PluginManifest {
        PluginManifest::new()
    }

    async fn reload(&self) -> Result<(), HostError> {
        Ok(())
    }
}

struct Harness {
    requests: mpsc::UnboundedSender<TaskRequest>,
    responses: mpsc::UnboundedReceiver<TaskResponse>,
    host: Arc<StubHost>,
}

fn spawn_engine(queue: usize, task_timeout: Duration) -> Harness {
    let host = Arc::new(StubHost::default());
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let engine = Engine {
        host: Arc::clone(&host) as Arc<dyn PluginHost>,
        requests_queue: Arc::new(Semaphore::new(queue)),
        running_tasks: Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS)),
        running_write_task: Arc::new(Semaphore::new(1)),
        exclusive_lock: Arc::new(RwLock::new(())),
        task_timeout,
        responses: response_tx,
        shutdown: CancellationToken::new(),
        workers: TaskTracker::new(),
    };
    tokio::spawn(engine.run(request_rx));

    Harness {
        requests: request_tx,
        responses: response_rx,
        host,
    }
}

fn sleep_request(task_id: i64, plugin: &str, millis: i64, tag: &str) -> TaskRequest {
    let mut options = IndexMap::new();
    if !tag.is_empty() {
        options.insert("tag".to_string(), InputValue::String(tag.to_string()));
    }
    TaskRequest {
        task_id,
        task_name: format!("{plugin}:run"),
        args: vec![InputValue::Int(millis)],
        options,
        ..Default::default()
    }
}

async fn recv(harness: &mut Harness) -> TaskResponse {
    tokio::time::timeout(Duration::from_secs(15), harness.responses.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("engine response channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_fast_path_bypasses_busy_slots() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    // occupy every no-lock slot and the write slot
    for task_id in 1..=MAX_CONCURRENT_TASKS as i64 {
        harness
            .requests
            .send(sleep_request(task_id, "sleep", 10_000, ""))
            .unwrap();
    }
    harness
        .requests
        .send(sleep_request(50, "excl", 10_000, ""))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    harness
        .requests
        .send(TaskRequest {
            task_id: 99,
            task_name: HEALTH_PING_TASK.to_string(),
            ..Default::default()
        })
        .unwrap();

    let response = recv(&mut harness).await;
    assert_eq!(response.task_id, 99);
    assert_eq!(response.internal_error, InternalError::Ok);
    assert_eq!(response.output, b"true");
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_overflow_rejects_new_requests() {
    let mut harness = spawn_engine(10, Duration::from_secs(30));

    for task_id in 1..=13 {
        harness
            .requests
            .send(sleep_request(task_id, "sleep", 100, ""))
            .unwrap();
    }

    let mut executed = 0;
    let mut full_queue = 0;
    for _ in 0..13 {
        let response = recv(&mut harness).await;
        match response.internal_error {
            InternalError::Ok => executed += 1,
            InternalError::FullQueue => full_queue += 1,
            other => panic!("unexpected internal error: {other:?}"),
        }
    }

    assert!(full_queue >= 1, "expected at least one FullQueue rejection");
    assert_eq!(executed + full_queue, 13);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_blocks_no_lock_tasks() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    harness
        .requests
        .send(sleep_request(1, "excl", 100, "1"))
        .unwrap();
    // give the exclusive task time to take the write lock
    tokio::time::sleep(Duration::from_millis(30)).await;
    harness
        .requests
        .send(sleep_request(2, "sleep", 10, "2"))
        .unwrap();

    let first = recv(&mut harness).await;
    let second = recv(&mut harness).await;
    assert_eq!(first.task_id, 1);
    assert_eq!(second.task_id, 2);

    assert_eq!(
        harness.host.trace(),
        vec!["start:1", "end:1", "start:2", "end:2"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_tasks_serialize_among_themselves() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    harness
        .requests
        .send(sleep_request(1, "write", 100, "w1"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    harness
        .requests
        .send(sleep_request(2, "write", 10, "w2"))
        .unwrap();
    // a no-lock task runs alongside the writer
    harness
        .requests
        .send(sleep_request(3, "sleep", 10, ""))
        .unwrap();

    let first = recv(&mut harness).await;
    assert_eq!(first.task_id, 3);

    let second = recv(&mut harness).await;
    let third = recv(&mut harness).await;
    assert_eq!(second.task_id, 1);
    assert_eq!(third.task_id, 2);

    let trace = harness.host.trace();
    let w1_end = trace.iter().position(|t| t == "end:w1").unwrap();
    let w2_start = trace.iter().position(|t| t == "start:w2").unwrap();
    assert!(w1_end < w2_start, "write tasks overlapped: {trace:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_before_slot() {
    let mut harness = spawn_engine(100, Duration::from_millis(100));

    for task_id in 1..=MAX_CONCURRENT_TASKS as i64 {
        harness
            .requests
            .send(sleep_request(task_id, "sleep", 10_000, ""))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    harness
        .requests
        .send(sleep_request(9, "sleep", 10, ""))
        .unwrap();

    // the slot-occupying tasks also time out; only task 9 matters here
    let response = loop {
        let response = recv(&mut harness).await;
        if response.task_id == 9 {
            break response;
        }
    };
    assert_eq!(response.internal_error, InternalError::Timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_started_timeout_then_real_result() {
    let mut harness = spawn_engine(100, Duration::from_millis(150));

    harness
        .requests
        .send(sleep_request(7, "sleep", 400, ""))
        .unwrap();

    let first = recv(&mut harness).await;
    assert_eq!(first.task_id, 7);
    assert_eq!(first.internal_error, InternalError::StartedTimeout);

    let second = recv(&mut harness).await;
    assert_eq!(second.task_id, 7);
    assert_eq!(second.internal_error, InternalError::Ok);
    assert_eq!(second.output, b"\"done\"");
}

#[tokio::test]
async fn test_malformed_task_name() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    harness
        .requests
        .send(TaskRequest {
            task_id: 4,
            task_name: "disk:usage:extra".to_string(),
            ..Default::default()
        })
        .unwrap();

    let response = recv(&mut harness).await;
    assert_eq!(response.task_id, 4);
    assert_eq!(response.internal_error, InternalError::UnknownTask);
}

#[tokio::test]
async fn test_unknown_plugin() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    harness
        .requests
        .send(TaskRequest {
            task_id: 5,
            task_name: "ghost:task".to_string(),
            ..Default::default()
        })
        .unwrap();

    let response = recv(&mut harness).await;
    assert_eq!(response.internal_error, InternalError::UnknownTask);
}

#[tokio::test]
async fn test_module_error_classification() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    harness
        .requests
        .send(TaskRequest {
            task_id: 6,
            task_name: "boom:now".to_string(),
            lock_override: LockMode::NoLock,
            ..Default::default()
        })
        .unwrap();

    let response = recv(&mut harness).await;
    assert_eq!(response.internal_error, InternalError::ModuleError);
    assert_eq!(response.module_error, "kaput");
}

#[tokio::test]
async fn test_specs_builtin() {
    let mut harness = spawn_engine(100, Duration::from_secs(30));

    harness
        .requests
        .send(TaskRequest {
            task_id: 8,
            task_name: SPECS_ALL_TASK.to_string(),
            ..Default::default()
        })
        .unwrap();

    let response = recv(&mut harness).await;
    assert_eq!(response.internal_error, InternalError::Ok);
    let specs: serde_json::Value = serde_json::from_slice(&response.output).unwrap();
    assert_eq!(specs["stub"]["os"], "linux");
}
