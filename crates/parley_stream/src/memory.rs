#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{StreamBackend, StreamError, StreamRecord};

#[derive(Debug, Default)]
struct MemoryLog {
	topics: HashMap<String, Vec<StreamRecord>>,
	offsets: HashMap<(String, String), i64>,
	leases: HashMap<(String, String), Lease>,
	closed: bool,
}

#[derive(Debug)]
struct Lease {
	owner: String,
	expires_at: Instant,
}

/// Process-local stream used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryStreamBackend {
	inner: Mutex<MemoryLog>,
	appended: Notify,
}

impl InMemoryStreamBackend {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reject further appends and reads with `StreamError::Closed`.
	pub async fn close(&self) {
		self.inner.lock().await.closed = true;
		self.appended.notify_waiters();
	}

	/// Snapshot of every record in `topic`.
	pub async fn records(&self, topic: &str) -> Vec<StreamRecord> {
		let guard = self.inner.lock().await;
		guard.topics.get(topic).cloned().unwrap_or_default()
	}
}

#[async_trait::async_trait]
impl StreamBackend for InMemoryStreamBackend {
	async fn append(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<i64, StreamError> {
		let mut guard = self.inner.lock().await;
		if guard.closed {
			return Err(StreamError::Closed);
		}

		let log = guard.topics.entry(topic.to_string()).or_default();
		let mut last = log.last().map(|r| r.offset).unwrap_or(0);
		for payload in payloads {
			last += 1;
			log.push(StreamRecord {
				topic: topic.to_string(),
				offset: last,
				payload,
			});
		}
		drop(guard);

		self.appended.notify_waiters();
		Ok(last)
	}

	async fn read_after(&self, topic: &str, after: i64, limit: usize) -> Result<Vec<StreamRecord>, StreamError> {
		let guard = self.inner.lock().await;
		if guard.closed {
			return Err(StreamError::Closed);
		}

		let Some(log) = guard.topics.get(topic) else {
			return Ok(Vec::new());
		};
		// Offsets are dense from 1, so `after` is also the index of the next record.
		let start = usize::try_from(after.max(0)).unwrap_or(usize::MAX).min(log.len());
		Ok(log[start..].iter().take(limit).cloned().collect())
	}

	async fn committed_offset(&self, topic: &str, group_id: &str) -> Result<i64, StreamError> {
		let guard = self.inner.lock().await;
		Ok(guard
			.offsets
			.get(&(topic.to_string(), group_id.to_string()))
			.copied()
			.unwrap_or(0))
	}

	async fn commit(&self, topic: &str, group_id: &str, offset: i64) -> Result<(), StreamError> {
		let mut guard = self.inner.lock().await;
		if guard.closed {
			return Err(StreamError::Closed);
		}
		let current = guard.offsets.entry((topic.to_string(), group_id.to_string())).or_insert(0);
		*current = (*current).max(offset);
		Ok(())
	}

	async fn acquire_lease(&self, topic: &str, group_id: &str, member: &str, ttl: Duration) -> Result<bool, StreamError> {
		let mut guard = self.inner.lock().await;
		if guard.closed {
			return Err(StreamError::Closed);
		}
		let now = Instant::now();
		let key = (topic.to_string(), group_id.to_string());
		let held_by_other = guard
			.leases
			.get(&key)
			.is_some_and(|l| l.owner != member && l.expires_at > now);
		if held_by_other {
			return Ok(false);
		}
		guard.leases.insert(
			key,
			Lease {
				owner: member.to_string(),
				expires_at: now + ttl,
			},
		);
		Ok(true)
	}

	async fn release_lease(&self, topic: &str, group_id: &str, member: &str) -> Result<(), StreamError> {
		let mut guard = self.inner.lock().await;
		let key = (topic.to_string(), group_id.to_string());
		if guard.leases.get(&key).is_some_and(|l| l.owner == member) {
			guard.leases.remove(&key);
		}
		Ok(())
	}

	async fn wait_for_records(&self, _topic: &str, poll_interval: Duration) {
		let _ = tokio::time::timeout(poll_interval, self.appended.notified()).await;
	}
}
