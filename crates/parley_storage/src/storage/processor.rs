#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use parley_domain::ChatMessage;
use parley_stream::{Committer, StreamRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::store::MessageStore;

/// Moves consumed records into the durable store.
///
/// Delivery into the store is at most once per fetched record: the offset is
/// committed whether or not the write succeeded.
pub struct Processor {
	store: Arc<dyn MessageStore>,
	committer: Committer,
}

impl Processor {
	pub fn new(store: Arc<dyn MessageStore>, committer: Committer) -> Self {
		Self { store, committer }
	}

	/// Drain `records` until cancelled or the consumer hangs up.
	///
	/// A failed commit is returned as an error.
	pub async fn run(self, mut records: mpsc::Receiver<StreamRecord>, token: CancellationToken) -> anyhow::Result<()> {
		info!("stream processor started");
		loop {
			let record = tokio::select! {
				biased;
				_ = token.cancelled() => break,
				next = records.recv() => match next {
					Some(record) => record,
					None => break,
				},
			};

			// An interrupted write leaves the offset uncommitted for redelivery.
			tokio::select! {
				biased;
				_ = token.cancelled() => break,
				_ = self.process(&record) => {}
			}
			self.committer
				.commit(&record)
				.await
				.with_context(|| format!("commit offset {} on {}", record.offset, record.topic))?;
		}
		info!("stream processor stopped");
		Ok(())
	}

	async fn process(&self, record: &StreamRecord) {
		let msg = match ChatMessage::from_payload(&record.payload) {
			Ok(msg) => msg,
			Err(e) => {
				warn!(offset = record.offset, error = %e, "undecodable stream record; skipping");
				metrics::counter!("parley_storage_messages_dropped_total").increment(1);
				return;
			}
		};

		if msg.user_id.is_unset() {
			warn!(offset = record.offset, "stream record without user id; skipping");
			metrics::counter!("parley_storage_messages_dropped_total").increment(1);
			return;
		}

		match self.store.add_message(msg.user_id, &msg.text).await {
			Ok(()) => {
				debug!(offset = record.offset, user_id = %msg.user_id, "message persisted");
				metrics::counter!("parley_storage_messages_persisted_total").increment(1);
			}
			Err(e) => {
				warn!(offset = record.offset, user_id = %msg.user_id, error = %e, "failed to persist message");
				metrics::counter!("parley_storage_messages_failed_total").increment(1);
			}
		}
	}
}
