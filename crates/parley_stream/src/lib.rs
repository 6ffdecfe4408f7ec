#![forbid(unsafe_code)]

//! Durable, ordered message stream with a buffered producer and a
//! group-offset consumer (at-least-once delivery).

mod backend;
mod consumer;
mod memory;
mod producer;
mod sql;

use thiserror::Error;

pub use backend::StreamBackend;
pub use consumer::{Committer, Consumer, ConsumerConfig};
pub use memory::InMemoryStreamBackend;
pub use producer::{Producer, ProducerConfig, ProducerLoop};
pub use sql::PersistentStreamBackend;

/// One record fetched from a topic. `offset` is the acknowledgment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
	pub topic: String,
	pub offset: i64,
	pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StreamError {
	#[error("stream closed")]
	Closed,
	#[error("operation cancelled")]
	Cancelled,
	#[error("unsupported database_url (use sqlite: or postgres:)")]
	UnsupportedUrl,
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),
}
