#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{StreamBackend, StreamError, StreamRecord};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
	pub topic: String,
	pub group_id: String,
	/// Sleep between fetches once the topic is drained, and between lease
	/// attempts while another member owns the topic.
	pub poll_interval: Duration,
	/// How long a claimed fetch lease stays valid without renewal.
	pub lease_ttl: Duration,
}

impl Default for ConsumerConfig {
	fn default() -> Self {
		Self {
			topic: "chat".to_string(),
			group_id: "chat".to_string(),
			poll_interval: Duration::from_millis(250),
			lease_ttl: Duration::from_secs(10),
		}
	}
}

/// Fetch loop of a consumer group member.
///
/// Records are handed over one at a time on a capacity-1 channel, so at most
/// one record is fetched ahead of the last one taken by the processor.
///
/// Members of one group share the topic through a fetch lease: only the
/// holder fetches, the others stand by until it is released or expires. A
/// holder blocked for longer than `lease_ttl` may lose the topic to another
/// member, which then redelivers from the committed offset.
pub struct Consumer {
	backend: Arc<dyn StreamBackend>,
	cfg: ConsumerConfig,
	member: String,
	tx: mpsc::Sender<StreamRecord>,
}

/// Acknowledges processed records for the consumer's group.
#[derive(Clone)]
pub struct Committer {
	backend: Arc<dyn StreamBackend>,
	topic: Arc<str>,
	group_id: Arc<str>,
}

fn member_id() -> String {
	static NEXT: AtomicU64 = AtomicU64::new(0);
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.subsec_nanos())
		.unwrap_or(0);
	format!("{}-{nanos:x}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

impl Consumer {
	pub fn new(backend: Arc<dyn StreamBackend>, cfg: ConsumerConfig) -> (Consumer, mpsc::Receiver<StreamRecord>, Committer) {
		let (tx, rx) = mpsc::channel(1);
		let committer = Committer {
			backend: Arc::clone(&backend),
			topic: Arc::from(cfg.topic.as_str()),
			group_id: Arc::from(cfg.group_id.as_str()),
		};
		let consumer = Consumer {
			backend,
			cfg,
			member: member_id(),
			tx,
		};
		(consumer, rx, committer)
	}

	/// Fetch from the group's committed offset until cancelled.
	///
	/// `StreamError::Closed`, cancellation and a dropped receiver end the loop
	/// cleanly; any other fetch error is returned. The lease is released on
	/// every exit path.
	pub async fn run(self, token: CancellationToken) -> Result<(), StreamError> {
		let topic = self.cfg.topic.as_str();
		let group_id = self.cfg.group_id.as_str();
		info!(topic, group_id, member = %self.member, "stream consumer started");

		let res = self.fetch_loop(&token).await;

		if let Err(e) = self.backend.release_lease(topic, group_id, &self.member).await {
			debug!(topic, group_id, error = %e, "lease release failed");
		}
		info!(topic, group_id, member = %self.member, "stream consumer stopped");
		res
	}

	async fn fetch_loop(&self, token: &CancellationToken) -> Result<(), StreamError> {
		let topic = self.cfg.topic.as_str();
		let group_id = self.cfg.group_id.as_str();
		let renew_every = self.cfg.lease_ttl / 3;

		// `None` while another member owns the topic.
		let mut position: Option<i64> = None;
		let mut renew_at = Instant::now();

		loop {
			if position.is_none() || Instant::now() >= renew_at {
				let held = tokio::select! {
					biased;
					_ = token.cancelled() => return Ok(()),
					res = self.backend.acquire_lease(topic, group_id, &self.member, self.cfg.lease_ttl) => match res {
						Ok(held) => held,
						Err(StreamError::Closed) => {
							info!(topic, group_id, "stream closed; consumer stopping");
							return Ok(());
						}
						Err(e) => return Err(e),
					},
				};

				if !held {
					if position.take().is_some() {
						warn!(topic, group_id, "fetch lease lost to another member");
					} else {
						debug!(topic, group_id, "another member holds the fetch lease; standing by");
					}
					tokio::select! {
						biased;
						_ = token.cancelled() => return Ok(()),
						_ = tokio::time::sleep(self.cfg.poll_interval) => continue,
					}
				}
				renew_at = Instant::now() + renew_every;

				if position.is_none() {
					let offset = tokio::select! {
						biased;
						_ = token.cancelled() => return Ok(()),
						res = self.backend.committed_offset(topic, group_id) => match res {
							Ok(offset) => offset,
							Err(StreamError::Closed) => return Ok(()),
							Err(e) => return Err(e),
						},
					};
					info!(topic, group_id, position = offset, "fetch lease acquired");
					position = Some(offset);
				}
			}

			let Some(after) = position else {
				continue;
			};

			let fetched = tokio::select! {
				biased;
				_ = token.cancelled() => return Ok(()),
				res = self.backend.read_after(topic, after, 1) => res,
			};

			let record = match fetched {
				Ok(mut records) if !records.is_empty() => records.swap_remove(0),
				Ok(_) => {
					tokio::select! {
						biased;
						_ = token.cancelled() => return Ok(()),
						_ = self.backend.wait_for_records(topic, self.cfg.poll_interval) => continue,
					}
				}
				Err(StreamError::Closed) => {
					info!(topic, group_id, "stream closed; consumer stopping");
					return Ok(());
				}
				Err(e) => return Err(e),
			};

			position = Some(record.offset);
			debug!(topic, offset = record.offset, "stream record fetched");

			tokio::select! {
				biased;
				_ = token.cancelled() => return Ok(()),
				res = self.tx.send(record) => {
					if res.is_err() {
						return Ok(());
					}
				}
			}
		}
	}
}

impl Committer {
	/// Advance the group's checkpoint to at least `record.offset`.
	pub async fn commit(&self, record: &StreamRecord) -> Result<(), StreamError> {
		self.backend.commit(&self.topic, &self.group_id, record.offset).await
	}

	pub async fn committed_offset(&self) -> Result<i64, StreamError> {
		self.backend.committed_offset(&self.topic, &self.group_id).await
	}
}

#[cfg(test)]
mod tests {
	use tokio::time::timeout;

	use super::*;
	use crate::InMemoryStreamBackend;

	fn cfg() -> ConsumerConfig {
		ConsumerConfig {
			poll_interval: Duration::from_millis(20),
			..ConsumerConfig::default()
		}
	}

	#[tokio::test]
	async fn delivers_records_after_committed_offset() {
		parley_util::telemetry::init_test_logging();

		let backend = Arc::new(InMemoryStreamBackend::new());
		backend
			.append("chat", vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
			.await
			.unwrap();
		backend.commit("chat", "chat", 1).await.unwrap();

		let (consumer, mut rx, committer) = Consumer::new(backend.clone(), cfg());
		let token = CancellationToken::new();
		let handle = tokio::spawn(consumer.run(token.clone()));

		let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
		assert_eq!(first.offset, 2);
		assert_eq!(first.payload, b"b");
		committer.commit(&first).await.unwrap();

		let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
		assert_eq!(second.offset, 3);

		// Appended after the consumer drained the topic.
		backend.append("chat", vec![b"d".to_vec()]).await.unwrap();
		let third = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
		assert_eq!(third.payload, b"d");

		assert_eq!(committer.committed_offset().await.unwrap(), 2);

		token.cancel();
		timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
	}

	#[tokio::test]
	async fn closed_stream_is_a_clean_exit() {
		let backend = Arc::new(InMemoryStreamBackend::new());
		let (consumer, _rx, _committer) = Consumer::new(backend.clone(), cfg());
		let handle = tokio::spawn(consumer.run(CancellationToken::new()));

		backend.close().await;
		let res = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
		assert!(res.is_ok());
	}

	struct BrokenBackend;

	#[async_trait::async_trait]
	impl StreamBackend for BrokenBackend {
		async fn append(&self, _topic: &str, _payloads: Vec<Vec<u8>>) -> Result<i64, StreamError> {
			Err(StreamError::Database(sqlx::Error::PoolClosed))
		}

		async fn read_after(&self, _topic: &str, _after: i64, _limit: usize) -> Result<Vec<StreamRecord>, StreamError> {
			Err(StreamError::Database(sqlx::Error::PoolTimedOut))
		}

		async fn committed_offset(&self, _topic: &str, _group_id: &str) -> Result<i64, StreamError> {
			Ok(0)
		}

		async fn commit(&self, _topic: &str, _group_id: &str, _offset: i64) -> Result<(), StreamError> {
			Ok(())
		}

		async fn acquire_lease(&self, _topic: &str, _group_id: &str, _member: &str, _ttl: Duration) -> Result<bool, StreamError> {
			Ok(true)
		}

		async fn release_lease(&self, _topic: &str, _group_id: &str, _member: &str) -> Result<(), StreamError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn hard_fetch_error_is_returned() {
		let (consumer, _rx, _committer) = Consumer::new(Arc::new(BrokenBackend), cfg());
		let res = timeout(Duration::from_secs(1), consumer.run(CancellationToken::new()))
			.await
			.unwrap();
		assert!(matches!(res, Err(StreamError::Database(_))));
	}

	#[tokio::test]
	async fn restart_redelivers_uncommitted_record() {
		let backend = Arc::new(InMemoryStreamBackend::new());
		backend.append("chat", vec![b"m1".to_vec(), b"m2".to_vec()]).await.unwrap();

		let (consumer, mut rx, committer) = Consumer::new(backend.clone(), cfg());
		let token = CancellationToken::new();
		let handle = tokio::spawn(consumer.run(token.clone()));
		let m1 = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
		committer.commit(&m1).await.unwrap();
		let m2 = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
		assert_eq!(m2.payload, b"m2");
		// Crash before committing m2.
		token.cancel();
		timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
		drop(rx);

		let (consumer, mut rx, _committer) = Consumer::new(backend, cfg());
		let token = CancellationToken::new();
		let handle = tokio::spawn(consumer.run(token.clone()));
		let again = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
		assert_eq!(again.offset, m2.offset);
		assert_eq!(again.payload, b"m2");

		token.cancel();
		timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
	}

	#[tokio::test]
	async fn group_members_do_not_share_records() {
		let backend = Arc::new(InMemoryStreamBackend::new());
		backend.append("chat", vec![b"m1".to_vec()]).await.unwrap();

		let (first, mut first_rx, first_committer) = Consumer::new(backend.clone(), cfg());
		let first_token = CancellationToken::new();
		let first_handle = tokio::spawn(first.run(first_token.clone()));
		let m1 = timeout(Duration::from_secs(1), first_rx.recv()).await.unwrap().unwrap();
		assert_eq!(m1.payload, b"m1");

		let (second, mut second_rx, _second_committer) = Consumer::new(backend.clone(), cfg());
		let second_token = CancellationToken::new();
		let second_handle = tokio::spawn(second.run(second_token.clone()));

		// The first member owns the topic; the second stands by.
		assert!(timeout(Duration::from_millis(150), second_rx.recv()).await.is_err());
		first_committer.commit(&m1).await.unwrap();

		first_token.cancel();
		timeout(Duration::from_secs(1), first_handle).await.unwrap().unwrap().unwrap();

		backend.append("chat", vec![b"m2".to_vec()]).await.unwrap();
		let next = timeout(Duration::from_secs(1), second_rx.recv()).await.unwrap().unwrap();
		assert_eq!(next.payload, b"m2");
		assert!(timeout(Duration::from_millis(100), first_rx.recv()).await.unwrap().is_none());

		second_token.cancel();
		timeout(Duration::from_secs(1), second_handle).await.unwrap().unwrap().unwrap();
	}
}
