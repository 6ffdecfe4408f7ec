#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_domain::{ChatMessage, UserId, Username};
use parley_stream::{
	Committer, Consumer, ConsumerConfig, InMemoryStreamBackend, PersistentStreamBackend, StreamBackend,
};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::storage::processor::Processor;
use crate::storage::store::{MessageStore, SqlMessageStore};

#[derive(Default)]
struct RecordingStore {
	messages: Mutex<Vec<(UserId, String)>>,
	fail: bool,
	stall_on: Option<&'static str>,
}

impl RecordingStore {
	fn failing() -> Self {
		Self {
			fail: true,
			..Self::default()
		}
	}

	fn stalling_on(text: &'static str) -> Self {
		Self {
			stall_on: Some(text),
			..Self::default()
		}
	}

	fn texts(&self) -> Vec<String> {
		self.messages.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
	}
}

#[async_trait::async_trait]
impl MessageStore for RecordingStore {
	async fn add_message(&self, user_id: UserId, text: &str) -> anyhow::Result<()> {
		if self.stall_on == Some(text) {
			std::future::pending::<()>().await;
		}
		if self.fail {
			anyhow::bail!("store unavailable");
		}
		self.messages.lock().unwrap().push((user_id, text.to_string()));
		Ok(())
	}

	async fn add_user(&self, _username: &Username) -> anyhow::Result<UserId> {
		Ok(UserId::new(1))
	}
}

fn payload(user_id: i64, text: &str) -> Vec<u8> {
	ChatMessage::new(UserId::new(user_id), "alice", text).to_payload().unwrap()
}

fn consumer_cfg() -> ConsumerConfig {
	ConsumerConfig {
		poll_interval: Duration::from_millis(20),
		..ConsumerConfig::default()
	}
}

struct Pipeline {
	token: CancellationToken,
	committer: Committer,
	consumer: JoinHandle<Result<(), parley_stream::StreamError>>,
	processor: JoinHandle<anyhow::Result<()>>,
}

impl Pipeline {
	fn start(backend: Arc<dyn StreamBackend>, store: Arc<dyn MessageStore>) -> Self {
		let token = CancellationToken::new();
		let (consumer, records, committer) = Consumer::new(backend, consumer_cfg());
		let processor = Processor::new(store, committer.clone());
		Self {
			consumer: tokio::spawn(consumer.run(token.clone())),
			processor: tokio::spawn(processor.run(records, token.clone())),
			committer,
			token,
		}
	}

	async fn wait_committed(&self, offset: i64) {
		timeout(Duration::from_secs(2), async {
			while self.committer.committed_offset().await.unwrap() < offset {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("offset committed within timeout");
	}

	async fn stop(self) {
		self.token.cancel();
		timeout(Duration::from_secs(2), self.consumer)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
		timeout(Duration::from_secs(2), self.processor)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
	}
}

#[tokio::test]
async fn persists_messages_in_stream_order() {
	parley_util::telemetry::init_test_logging();

	let backend = Arc::new(InMemoryStreamBackend::new());
	let store = Arc::new(RecordingStore::default());
	let last = backend
		.append("chat", vec![payload(3, "one"), payload(3, "two"), payload(4, "three")])
		.await
		.unwrap();

	let pipeline = Pipeline::start(backend, store.clone());
	pipeline.wait_committed(last).await;
	pipeline.stop().await;

	assert_eq!(store.texts(), vec!["one", "two", "three"]);
	assert_eq!(store.messages.lock().unwrap()[2].0, UserId::new(4));
}

#[tokio::test]
async fn failed_store_write_still_commits() {
	let backend = Arc::new(InMemoryStreamBackend::new());
	let store = Arc::new(RecordingStore::failing());
	let last = backend.append("chat", vec![payload(5, "lost")]).await.unwrap();

	let pipeline = Pipeline::start(backend, store.clone());
	pipeline.wait_committed(last).await;
	pipeline.stop().await;

	assert!(store.texts().is_empty());
}

#[tokio::test]
async fn undecodable_and_anonymous_records_are_skipped_and_committed() {
	let backend = Arc::new(InMemoryStreamBackend::new());
	let store = Arc::new(RecordingStore::default());
	let last = backend
		.append(
			"chat",
			vec![b"not json".to_vec(), payload(0, "anonymous"), payload(2, "kept")],
		)
		.await
		.unwrap();

	let pipeline = Pipeline::start(backend, store.clone());
	pipeline.wait_committed(last).await;
	pipeline.stop().await;

	assert_eq!(store.texts(), vec!["kept"]);
}

#[tokio::test]
async fn interrupted_write_is_redelivered_after_restart() {
	let backend: Arc<InMemoryStreamBackend> = Arc::new(InMemoryStreamBackend::new());
	let first_offset = backend.append("chat", vec![payload(1, "one")]).await.unwrap();
	backend.append("chat", vec![payload(1, "two")]).await.unwrap();

	let stalled = Arc::new(RecordingStore::stalling_on("two"));
	let pipeline = Pipeline::start(backend.clone(), stalled.clone());
	pipeline.wait_committed(first_offset).await;
	// Give the processor time to block on "two".
	tokio::time::sleep(Duration::from_millis(50)).await;
	let committer = pipeline.committer.clone();
	pipeline.stop().await;

	assert_eq!(stalled.texts(), vec!["one"]);
	assert_eq!(committer.committed_offset().await.unwrap(), first_offset);

	let healthy = Arc::new(RecordingStore::default());
	let pipeline = Pipeline::start(backend, healthy.clone());
	pipeline.wait_committed(first_offset + 1).await;
	pipeline.stop().await;

	assert_eq!(healthy.texts(), vec!["two"]);
}

#[tokio::test]
async fn sqlite_pipeline_resumes_from_committed_offset() {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.unwrap();
	let backend = Arc::new(PersistentStreamBackend::from_sqlite_pool(pool.clone()).await.unwrap());
	let store = Arc::new(SqlMessageStore::from_sqlite_pool(pool.clone()).await.unwrap());
	let user = store.add_user(&Username::parse("alice").unwrap()).await.unwrap();

	let last = backend
		.append("chat", vec![payload(user.get(), "a"), payload(user.get(), "b")])
		.await
		.unwrap();
	let pipeline = Pipeline::start(backend.clone(), store.clone());
	pipeline.wait_committed(last).await;
	pipeline.stop().await;

	let last = backend.append("chat", vec![payload(user.get(), "c")]).await.unwrap();
	let pipeline = Pipeline::start(backend, store);
	pipeline.wait_committed(last).await;
	pipeline.stop().await;

	let rows: Vec<(String,)> = sqlx::query_as("SELECT content FROM messages ORDER BY id")
		.fetch_all(&pool)
		.await
		.unwrap();
	let contents: Vec<String> = rows.into_iter().map(|(c,)| c).collect();
	assert_eq!(contents, vec!["a", "b", "c"]);
}

struct BrokenCommits;

#[async_trait::async_trait]
impl StreamBackend for BrokenCommits {
	async fn append(&self, _topic: &str, _payloads: Vec<Vec<u8>>) -> Result<i64, parley_stream::StreamError> {
		Ok(1)
	}

	async fn read_after(
		&self,
		topic: &str,
		after: i64,
		_limit: usize,
	) -> Result<Vec<parley_stream::StreamRecord>, parley_stream::StreamError> {
		if after >= 1 {
			return Ok(Vec::new());
		}
		Ok(vec![parley_stream::StreamRecord {
			topic: topic.to_string(),
			offset: 1,
			payload: payload(1, "x"),
		}])
	}

	async fn committed_offset(&self, _topic: &str, _group_id: &str) -> Result<i64, parley_stream::StreamError> {
		Ok(0)
	}

	async fn commit(&self, _topic: &str, _group_id: &str, _offset: i64) -> Result<(), parley_stream::StreamError> {
		Err(parley_stream::StreamError::Database(sqlx::Error::PoolClosed))
	}

	async fn acquire_lease(
		&self,
		_topic: &str,
		_group_id: &str,
		_member: &str,
		_ttl: Duration,
	) -> Result<bool, parley_stream::StreamError> {
		Ok(true)
	}

	async fn release_lease(&self, _topic: &str, _group_id: &str, _member: &str) -> Result<(), parley_stream::StreamError> {
		Ok(())
	}
}

#[tokio::test]
async fn commit_failure_is_fatal() {
	let (consumer, records, committer) = Consumer::new(Arc::new(BrokenCommits), consumer_cfg());
	let token = CancellationToken::new();
	let consumer = tokio::spawn(consumer.run(token.clone()));

	let store = Arc::new(RecordingStore::default());
	let res = timeout(
		Duration::from_secs(2),
		Processor::new(store.clone(), committer).run(records, token.clone()),
	)
	.await
	.unwrap();

	assert!(res.is_err());
	assert_eq!(store.texts(), vec!["x"]);
	token.cancel();
	let _ = timeout(Duration::from_secs(2), consumer).await;
}
