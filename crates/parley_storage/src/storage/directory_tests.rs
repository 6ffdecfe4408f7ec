#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{UserId, Username};
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::storage::directory::DirectoryService;
use crate::storage::store::{MessageStore, SqlMessageStore};

struct Harness {
	addr: SocketAddr,
	drain: CancellationToken,
	handle: JoinHandle<anyhow::Result<()>>,
	client: reqwest::Client,
}

impl Harness {
	async fn start(store: Arc<dyn MessageStore>) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let drain = CancellationToken::new();
		let service = DirectoryService::new(store);
		let handle = tokio::spawn(parley_util::http::serve(
			listener,
			move |req, remote| {
				let service = service.clone();
				async move { service.route(req, remote).await }
			},
			drain.clone(),
			Duration::from_secs(1),
		));
		Self {
			addr,
			drain,
			handle,
			client: reqwest::Client::new(),
		}
	}

	fn url(&self, path: &str) -> String {
		format!("http://{}{path}", self.addr)
	}

	async fn register(&self, body: &str) -> (reqwest::StatusCode, Value) {
		let resp = self
			.client
			.post(self.url("/register"))
			.header("content-type", "application/json")
			.body(body.to_string())
			.send()
			.await
			.unwrap();
		let status = resp.status();
		(status, resp.json().await.unwrap())
	}

	async fn stop(self) {
		self.drain.cancel();
		timeout(Duration::from_secs(3), self.handle)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
	}
}

async fn sqlite_store() -> Arc<dyn MessageStore> {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.unwrap();
	Arc::new(SqlMessageStore::from_sqlite_pool(pool).await.unwrap())
}

struct UnavailableStore;

#[async_trait::async_trait]
impl MessageStore for UnavailableStore {
	async fn add_message(&self, _user_id: UserId, _text: &str) -> anyhow::Result<()> {
		anyhow::bail!("store unavailable")
	}

	async fn add_user(&self, _username: &Username) -> anyhow::Result<UserId> {
		anyhow::bail!("store unavailable")
	}
}

#[tokio::test]
async fn register_issues_distinct_ids() {
	parley_util::telemetry::init_test_logging();

	let harness = Harness::start(sqlite_store().await).await;

	let (status, first) = harness.register(r#"{"username":"alice"}"#).await;
	assert_eq!(status, reqwest::StatusCode::CREATED);
	let (status, second) = harness.register(r#"{"username":"bob"}"#).await;
	assert_eq!(status, reqwest::StatusCode::CREATED);

	let first = first["user_id"].as_i64().unwrap();
	let second = second["user_id"].as_i64().unwrap();
	assert!(first > 0);
	assert_ne!(first, second);

	harness.stop().await;
}

#[tokio::test]
async fn register_rejects_bad_bodies() {
	let harness = Harness::start(sqlite_store().await).await;

	let (status, body) = harness.register("{not json").await;
	assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
	assert_eq!(body, json!({"error": "bad json"}));

	let (status, body) = harness.register(r#"{"name":"alice"}"#).await;
	assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
	assert_eq!(body, json!({"error": "bad json"}));

	let long = format!(r#"{{"username":"{}"}}"#, "a".repeat(51));
	let (status, body) = harness.register(&long).await;
	assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
	assert_eq!(body, json!({"error": "invalid username"}));

	harness.stop().await;
}

#[tokio::test]
async fn register_reports_store_failure() {
	let harness = Harness::start(Arc::new(UnavailableStore)).await;

	let (status, body) = harness.register(r#"{"username":"alice"}"#).await;
	assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(body, json!({"error": "failed to register"}));

	harness.stop().await;
}

#[tokio::test]
async fn health_and_unknown_routes() {
	let harness = Harness::start(Arc::new(UnavailableStore)).await;

	let resp = harness.client.get(harness.url("/healthz")).send().await.unwrap();
	assert_eq!(resp.status(), reqwest::StatusCode::OK);
	assert_eq!(resp.json::<Value>().await.unwrap(), json!({"status": "ok"}));

	let resp = harness.client.get(harness.url("/register")).send().await.unwrap();
	assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

	let resp = harness.client.get(harness.url("/chat")).send().await.unwrap();
	assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

	harness.stop().await;
}
