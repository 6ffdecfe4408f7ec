#![forbid(unsafe_code)]

use std::time::Duration;

use crate::{StreamError, StreamRecord};

/// Storage behind the stream: an append-only log per topic plus committed
/// offsets and a fetch lease per consumer group. Offsets start at 1 and strictly increase per
/// topic; a committed offset of 0 means nothing was committed yet.
#[async_trait::async_trait]
pub trait StreamBackend: Send + Sync {
	/// Append payloads in order and return the offset of the last one.
	async fn append(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<i64, StreamError>;

	/// Up to `limit` records with `offset > after`, oldest first.
	async fn read_after(&self, topic: &str, after: i64, limit: usize) -> Result<Vec<StreamRecord>, StreamError>;

	async fn committed_offset(&self, topic: &str, group_id: &str) -> Result<i64, StreamError>;

	/// Advance the group checkpoint to `max(current, offset)`.
	async fn commit(&self, topic: &str, group_id: &str, offset: i64) -> Result<(), StreamError>;

	/// Claim or renew the group's fetch lease on `topic` for `member`.
	///
	/// Returns `false` while another member holds an unexpired lease, so at
	/// most one member of a group fetches a topic at a time.
	async fn acquire_lease(&self, topic: &str, group_id: &str, member: &str, ttl: Duration) -> Result<bool, StreamError>;

	/// Give the lease up if `member` holds it.
	async fn release_lease(&self, topic: &str, group_id: &str, member: &str) -> Result<(), StreamError>;

	/// Park a drained consumer until new records may be available.
	async fn wait_for_records(&self, _topic: &str, poll_interval: Duration) {
		tokio::time::sleep(poll_interval).await;
	}
}
