#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_domain::{ChatMessage, UserId};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::server::registry::{Connection, ConnectionRegistry, FrameSink, RegistryError};

#[derive(Clone, Default)]
struct Recorder {
	frames: Arc<Mutex<Vec<String>>>,
	closes: Arc<AtomicUsize>,
}

impl Recorder {
	fn frames(&self) -> Vec<String> {
		self.frames.lock().unwrap().clone()
	}

	fn messages(&self) -> Vec<ChatMessage> {
		self.frames()
			.iter()
			.map(|f| ChatMessage::from_payload(f.as_bytes()).unwrap())
			.collect()
	}
}

struct RecordingSink {
	rec: Recorder,
	fail_writes: bool,
}

#[async_trait::async_trait]
impl FrameSink for RecordingSink {
	async fn send_text(&mut self, text: String) -> Result<(), RegistryError> {
		if self.fail_writes {
			return Err(RegistryError::Write(tungstenite::Error::ConnectionClosed));
		}
		self.rec.frames.lock().unwrap().push(text);
		Ok(())
	}

	async fn close(&mut self) -> Result<(), RegistryError> {
		self.rec.closes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

fn remote() -> SocketAddr {
	"127.0.0.1:40000".parse().unwrap()
}

fn conn(id: u64) -> (Arc<Connection>, Recorder) {
	let rec = Recorder::default();
	let sink = RecordingSink {
		rec: rec.clone(),
		fail_writes: false,
	};
	(Arc::new(Connection::new(id, remote(), Box::new(sink))), rec)
}

fn failing_conn(id: u64) -> Arc<Connection> {
	let sink = RecordingSink {
		rec: Recorder::default(),
		fail_writes: true,
	};
	Arc::new(Connection::new(id, remote(), Box::new(sink)))
}

fn msg(text: &str) -> ChatMessage {
	ChatMessage::new(UserId::new(1), "alice", text)
}

async fn wait_for_frames(rec: &Recorder, n: usize) {
	timeout(Duration::from_secs(2), async {
		while rec.frames().len() < n {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("frames within timeout");
}

#[tokio::test]
async fn store_is_unique_per_connection() {
	let registry = ConnectionRegistry::new();
	let (a, _) = conn(1);

	assert!(registry.store(&a).await);
	assert!(!registry.store(&a).await);
	assert_eq!(registry.len().await, 1);
	assert!(registry.contains(1).await);
}

#[tokio::test]
async fn release_closes_once_and_is_idempotent() {
	let registry = ConnectionRegistry::new();
	let (a, rec) = conn(1);
	registry.store(&a).await;

	registry.release(&a).await;
	registry.release(&a).await;

	assert!(a.is_closed());
	assert!(registry.is_empty().await);
	assert_eq!(rec.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_of_unregistered_connection_still_closes() {
	let registry = ConnectionRegistry::new();
	let (a, rec) = conn(7);

	registry.release(&a).await;
	assert_eq!(rec.closes.load(Ordering::SeqCst), 1);
	assert!(!registry.contains(7).await);
}

#[tokio::test]
async fn write_msg_after_release_is_rejected() {
	let registry = ConnectionRegistry::new();
	let (a, rec) = conn(1);
	registry.store(&a).await;

	registry.write_msg(&a, &msg("before")).await.unwrap();
	registry.release(&a).await;
	let err = registry.write_msg(&a, &msg("after")).await.unwrap_err();
	assert!(matches!(err, RegistryError::Closed(1)));
	assert_eq!(rec.messages(), vec![msg("before")]);
}

#[tokio::test]
async fn broadcaster_starts_only_once() {
	let registry = ConnectionRegistry::new();
	assert!(registry.start_broadcaster(2, 2).is_ok());
	assert!(matches!(
		registry.start_broadcaster(2, 2),
		Err(RegistryError::BroadcasterAlreadyStarted)
	));
}

#[tokio::test]
async fn fan_out_reaches_every_registered_connection() {
	let registry = ConnectionRegistry::new();
	let token = CancellationToken::new();
	let (broadcaster, workers) = registry.start_broadcaster(5, 5).unwrap();
	for w in workers {
		tokio::spawn(w.run(token.clone()));
	}

	let mut recs = Vec::new();
	for id in 1..=3 {
		let (c, rec) = conn(id);
		registry.store(&c).await;
		recs.push(rec);
	}
	registry.store(&failing_conn(99)).await;

	broadcaster.submit(msg("hello"), &token);

	for rec in &recs {
		wait_for_frames(rec, 1).await;
		assert_eq!(rec.messages(), vec![msg("hello")]);
	}
	// A failed write keeps the connection registered.
	assert!(registry.contains(99).await);

	token.cancel();
}

#[tokio::test]
async fn released_connection_receives_nothing() {
	let registry = ConnectionRegistry::new();
	let token = CancellationToken::new();
	let (broadcaster, workers) = registry.start_broadcaster(1, 1).unwrap();
	for w in workers {
		tokio::spawn(w.run(token.clone()));
	}

	let (stay, stay_rec) = conn(1);
	let (gone, gone_rec) = conn(2);
	registry.store(&stay).await;
	registry.store(&gone).await;
	registry.release(&gone).await;

	broadcaster.submit(msg("after release"), &token);
	wait_for_frames(&stay_rec, 1).await;
	assert!(gone_rec.frames().is_empty());

	token.cancel();
}

#[tokio::test]
async fn full_queue_defers_then_delivers() {
	let registry = ConnectionRegistry::new();
	let token = CancellationToken::new();
	let (broadcaster, workers) = registry.start_broadcaster(1, 1).unwrap();

	let (a, rec) = conn(1);
	registry.store(&a).await;

	// No worker yet: first fills the queue, second waits in a detached task.
	broadcaster.submit(msg("one"), &token);
	broadcaster.submit(msg("two"), &token);

	for w in workers {
		tokio::spawn(w.run(token.clone()));
	}

	wait_for_frames(&rec, 2).await;
	let mut texts: Vec<String> = rec.messages().into_iter().map(|m| m.text).collect();
	texts.sort();
	assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);

	token.cancel();
}

#[tokio::test]
async fn cancelled_submit_is_abandoned() {
	let registry = ConnectionRegistry::new();
	let worker_token = CancellationToken::new();
	let submit_token = CancellationToken::new();
	let (broadcaster, workers) = registry.start_broadcaster(1, 1).unwrap();

	let (a, rec) = conn(1);
	registry.store(&a).await;

	broadcaster.submit(msg("kept"), &submit_token);
	submit_token.cancel();
	broadcaster.submit(msg("abandoned"), &submit_token);
	tokio::time::sleep(Duration::from_millis(20)).await;

	for w in workers {
		tokio::spawn(w.run(worker_token.clone()));
	}

	wait_for_frames(&rec, 1).await;
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(rec.messages(), vec![msg("kept")]);

	worker_token.cancel();
}

#[tokio::test]
async fn workers_stop_on_cancel() {
	let registry = ConnectionRegistry::new();
	let token = CancellationToken::new();
	let (_broadcaster, workers) = registry.start_broadcaster(3, 3).unwrap();
	let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run(token.clone()))).collect();

	token.cancel();
	for h in handles {
		timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
	}
}
