//! Control surface over real HTTP.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agent_daemon::builders::DaemonBuilder;
use agent_daemon::config::DaemonConfig;
use agent_daemon::runtime::DaemonHandle;
use common::{Script, ScriptedExecutor};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Server {
    base: String,
    handle: DaemonHandle,
    task: JoinHandle<anyhow::Result<()>>,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl Server {
    async fn start(exec: ScriptedExecutor) -> Self {
        Self::start_with(exec, |_| {}).await
    }

    async fn start_with(exec: ScriptedExecutor, tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig {
            database_path: dir.path().join("tasks.db"),
            check_interval_secs: 300,
            ..DaemonConfig::default()
        };
        tweak(&mut config);
        let daemon = DaemonBuilder::new(config)
            .with_executor(Arc::new(exec))
            .build()
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let handle = daemon.handle();
        let task = tokio::spawn(daemon.serve(listener));
        Self {
            base: format!("http://{addr}"),
            handle,
            task,
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> (u16, Value) {
        let resp = self.client.delete(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn wait_for_status(&self, id: i64, status: &str) -> Value {
        for _ in 0..250 {
            let (_, body) = self.get(&format!("/tasks/{id}")).await;
            if body["task"]["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never reached {status}");
    }

    async fn stop(self) {
        self.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn health_and_status() {
    let server = Server::start(ScriptedExecutor::named("claude", Script::Complete("ok"))).await;

    let (code, body) = server.get("/health").await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "ok");
    assert!(body["uptime_seconds"].is_u64());

    let (code, body) = server.get("/status").await;
    assert_eq!(code, 200);
    assert!(body["state"] == "idle" || body["state"] == "running");
    assert_eq!(body["counts"]["pending"], 0);
    assert_eq!(body["config"]["max_concurrent_tasks"], 3);
    assert_eq!(body["config"]["default_executor"], "claude");
    assert_eq!(body["running_task_ids"], json!([]));

    server.stop().await;
}

#[tokio::test]
async fn submit_runs_task_and_exposes_transcript() {
    let server = Server::start(ScriptedExecutor::new(Script::Talk(vec![
        "reading inbox",
        "archived 4 newsletters",
    ])))
    .await;

    let (code, body) = server
        .post("/tasks", json!({"title": "clean inbox", "priority": 7}))
        .await;
    assert_eq!(code, 201);
    assert_eq!(body["status"], "pending");
    let id = body["id"].as_i64().unwrap();

    let detail = server.wait_for_status(id, "completed").await;
    assert_eq!(detail["task"]["priority"], 7);
    assert_eq!(
        detail["task"]["result"],
        "reading inbox\narchived 4 newsletters"
    );
    let transcript = detail["transcript"].as_array().unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0]["kind"], "agent_text");

    let (code, list) = server.get("/tasks?status=completed&limit=5").await;
    assert_eq!(code, 200);
    assert_eq!(list.as_array().unwrap().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let server = Server::start(ScriptedExecutor::new(Script::Complete("ok"))).await;

    let (code, body) = server.post("/tasks", json!({"title": "  "})).await;
    assert_eq!(code, 400);
    assert!(body["error"].as_str().unwrap().contains("title"));

    let (code, body) = server
        .post("/tasks", json!({"title": "x", "recurring_rule": "every_tuesday"}))
        .await;
    assert_eq!(code, 400);
    assert!(body["error"].as_str().unwrap().contains("every_tuesday"));

    let (code, _) = server.get("/tasks/424242").await;
    assert_eq!(code, 404);
    let (code, _) = server.delete("/tasks/424242").await;
    assert_eq!(code, 404);

    server.stop().await;
}

#[tokio::test]
async fn cancel_and_report_endpoints() {
    let server = Server::start(ScriptedExecutor::new(Script::Complete("ok"))).await;

    let (_, body) = server
        .post(
            "/tasks",
            json!({"title": "tomorrow", "due_at": "2099-01-01T09:00:00Z", "wake_immediately": false}),
        )
        .await;
    let later = body["id"].as_i64().unwrap();
    let (code, body) = server.delete(&format!("/tasks/{later}")).await;
    assert_eq!(code, 200);
    assert_eq!(body, json!({"ok": true, "signalled": false}));
    let (code, _) = server.delete(&format!("/tasks/{later}")).await;
    assert_eq!(code, 404);

    let (_, body) = server
        .post(
            "/tasks",
            json!({"title": "by hand", "due_at": "2099-01-01T09:00:00Z", "wake_immediately": false}),
        )
        .await;
    let manual = body["id"].as_i64().unwrap();
    let (code, body) = server
        .post(&format!("/tasks/{manual}/complete"), json!({"result": "done manually"}))
        .await;
    assert_eq!(code, 200);
    assert_eq!(body["applied"], true);
    let (_, body) = server
        .post(&format!("/tasks/{manual}/fail"), json!({"error": "late"}))
        .await;
    assert_eq!(body["applied"], false);

    let (_, detail) = server.get(&format!("/tasks/{manual}")).await;
    assert_eq!(detail["task"]["status"], "completed");

    server.stop().await;
}

#[tokio::test]
async fn event_stream_starts_with_connected_frame() {
    let server = Server::start(ScriptedExecutor::new(Script::Complete("ok"))).await;

    let resp = server.client.get(server.url("/events")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let mut body = resp.bytes_stream();

    let mut buffer = String::new();
    let mut frames: Vec<Value> = Vec::new();
    let mut woke = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            while let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                for line in frame.lines() {
                    if let Some(data) = line.strip_prefix("data:") {
                        frames.push(serde_json::from_str(data.trim()).unwrap());
                    }
                }
            }
            if !woke && !frames.is_empty() {
                woke = true;
                let (code, _) = server.post("/tasks", json!({"title": "ping"})).await;
                assert_eq!(code, 201);
            }
            if frames.iter().any(|f| f["type"] == "cycle_end") {
                break;
            }
        }
    })
    .await
    .expect("no cycle_end on the event stream");

    assert_eq!(frames[0]["type"], "connected");
    assert_eq!(frames[0]["state"], "idle");
    let types: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
    assert!(types.contains(&"task_start"));
    assert!(types.contains(&"task_end"));
    drop(body);

    server.stop().await;
}

// ============================================================================
// Manual execution and listings
// ============================================================================

#[tokio::test]
async fn execute_task_runs_a_scheduled_task_now() {
    let server = Server::start(ScriptedExecutor::new(Script::Sleep(Duration::from_millis(500)))).await;

    let (_, body) = server
        .post(
            "/tasks",
            json!({"title": "quarterly report", "due_at": "2099-01-01T09:00:00Z", "wake_immediately": false}),
        )
        .await;
    let id = body["id"].as_i64().unwrap();

    let (code, scheduled) = server.get("/scheduled").await;
    assert_eq!(code, 200);
    assert_eq!(scheduled[0]["id"], id);
    let (_, running) = server.get("/running").await;
    assert_eq!(running, json!([]));

    let (code, body) = server.post(&format!("/execute_task/{id}"), json!({})).await;
    assert_eq!(code, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["task_id"], id);
    let (code, _) = server.post(&format!("/execute_task/{id}"), json!({})).await;
    assert_eq!(code, 400);
    let (code, _) = server.post("/execute_task/424242", json!({})).await;
    assert_eq!(code, 404);

    let mut seen_running = false;
    for _ in 0..50 {
        let (_, running) = server.get("/running").await;
        if running.as_array().is_some_and(|r| r.iter().any(|t| t["task_id"] == id)) {
            seen_running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen_running, "task {id} never listed as running");

    let detail = server.wait_for_status(id, "completed").await;
    assert_eq!(detail["task"]["result"], "quarterly report done");
    let (_, scheduled) = server.get("/scheduled").await;
    assert_eq!(scheduled, json!([]));

    server.stop().await;
}

// ============================================================================
// Webhook
// ============================================================================

#[tokio::test]
async fn cycle_summary_is_posted_to_webhook() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let hook = axum::Router::new().route(
        "/hook",
        axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
                "ok"
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hook_addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, hook).await });

    let server = Server::start_with(ScriptedExecutor::new(Script::Complete("ok")), |cfg| {
        cfg.webhook_url = Some(format!("http://{hook_addr}/hook"));
    })
    .await;
    let (_, body) = server.post("/tasks", json!({"title": "ping"})).await;
    let id = body["id"].as_i64().unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("webhook never called")
        .unwrap();
    assert_eq!(summary["event"], "cycle_summary");
    assert_eq!(summary["reason"], "manual");
    assert_eq!(summary["tasks_launched"], 1);
    assert_eq!(summary["outcomes"], json!([{"task_id": id, "status": "completed"}]));

    server.stop().await;
}
