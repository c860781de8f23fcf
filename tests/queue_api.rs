//! Integration tests for the queue control API.
//!
//! Each test spins up an Axum server on a random port backed by the in-memory
//! store, and exercises the real REST contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;

use harvest_agent::api::queue_routes;
use harvest_agent::chain::TemplateRegistry;
use harvest_agent::config::QueueConfig;
use harvest_agent::queue::{JobQueue, JobQueueDeps, QueueStatus};
use harvest_agent::store::MemoryStore;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    base: String,
    queue: Arc<JobQueue>,
    store: Arc<MemoryStore>,
    client: reqwest::Client,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: &str) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

/// Start an Axum server on a random port with a fresh queue.
async fn start_server(config: QueueConfig) -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(
        config,
        JobQueueDeps {
            factory: Arc::new(TemplateRegistry::with_builtins()),
            queue_store: store.clone(),
            status_store: store.clone(),
            result_store: store.clone(),
        },
    );
    let app = queue_routes(Arc::clone(&queue), Duration::from_secs(2));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        queue,
        store,
        client: reqwest::Client::new(),
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        queue_check_interval: Duration::from_millis(20),
        reporting_interval: Duration::from_millis(50),
        ..QueueConfig::default()
    }
}

async fn wait_for_chain(server: &TestServer, id: &str) -> bool {
    for _ in 0..200 {
        if server.queue.contains(id).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_health() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"], "initialized");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_start_then_start_again_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;

        let (status, body) = server.get("/queue/start").await;
        assert_eq!(status, 200);
        assert_eq!(body["result"], true);
        assert_eq!(body["status"], "running");

        let (status, body) = server.get("/queue/start").await;
        assert_eq!(status, 409);
        assert_eq!(body["result"], false);

        server.queue.stop(true, Duration::from_secs(1)).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_status_reports_every_chain_status() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        let (status, body) = server.get("/queue/status").await;
        assert_eq!(status, 200);

        let histogram = body["chain_status"].as_object().unwrap();
        for key in ["initialized", "running", "complete", "error", "skipped", "terminating"] {
            assert_eq!(histogram[key], 0, "missing {key}");
        }
        assert_eq!(body["total_in_flight"], 0);
        assert_eq!(body["capacity"], 10);
        assert!(body["stop_time"].is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unknown_chain_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        let (status, body) = server.get("/queue/chains/nope").await;
        assert_eq!(status, 404);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_intake_admits_from_remote_queue() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        server
            .store
            .enqueue(
                1,
                "abc",
                r#"{"task_template_name": "wait", "user_parameters": {"seconds": 30}}"#,
            )
            .await;

        server.get("/queue/start").await;
        assert!(wait_for_chain(&server, "abc").await);

        let (status, body) = server.get("/queue/chains/abc").await;
        assert_eq!(status, 200);
        assert_eq!(body["abc"]["name"], "wait");

        let (_, body) = server.get("/queue/status").await;
        assert_eq!(body["total_in_flight"], 1);

        let (status, body) = server
            .get("/queue/stop?finish_running_jobs=false&timeout=2")
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["outcome"], "drained");
        assert_eq!(body["status"], "stopped");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_inject_requires_running_queue() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        let payload = r#"{"task_template_name": "noop", "uuid": "injected"}"#;

        let (status, body) = server.post("/queue/inject", payload).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("not accepting"));

        server.get("/queue/start").await;
        let (status, body) = server.post("/queue/inject", payload).await;
        assert_eq!(status, 200);
        assert_eq!(body["id"], "injected");

        let (status, _) = server
            .post("/queue/inject", r#"{"task_template_name": "missing"}"#)
            .await;
        assert_eq!(status, 400);

        server.queue.stop(true, Duration::from_secs(1)).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_stop_when_not_running_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        let (status, body) = server.get("/queue/stop").await;
        assert_eq!(status, 409);
        assert_eq!(body["outcome"], "rejected");
        assert_eq!(server.queue.status(), QueueStatus::Initialized);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_drain_waits_for_running_chain() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        server.get("/queue/start").await;
        let (status, _) = server
            .post(
                "/queue/inject",
                r#"{"task_template_name": "wait", "user_parameters": {"seconds": 0.3}, "uuid": "w1"}"#,
            )
            .await;
        assert_eq!(status, 200);

        let (status, body) = server.get("/queue/stop?finish_running_jobs=true&timeout=3").await;
        assert_eq!(status, 200);
        assert_eq!(body["result"], true);
        assert_eq!(body["active_chains"], 0);

        let (_, body) = server.get("/queue/status").await;
        assert_eq!(body["status"], "stopped");
        assert!(!body["stop_time"].is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_invalid_stop_timeout_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(fast_config()).await;
        server.get("/queue/start").await;
        let (status, _) = server.get("/queue/stop?timeout=-1").await;
        assert_eq!(status, 400);
        assert_eq!(server.queue.status(), QueueStatus::Running);

        server.queue.stop(true, Duration::from_secs(1)).await;
    })
    .await
    .expect("test timed out");
}
