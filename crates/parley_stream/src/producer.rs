#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{StreamBackend, StreamError};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
	/// Payloads buffered between `publish` and the write loop.
	pub buffer_capacity: usize,
	/// Max payloads appended per backend write.
	pub batch_size: usize,
}

impl Default for ProducerConfig {
	fn default() -> Self {
		Self {
			buffer_capacity: 100,
			batch_size: 10,
		}
	}
}

/// Cloneable publish handle. Publishing only enqueues; `ProducerLoop` writes.
#[derive(Clone)]
pub struct Producer {
	tx: mpsc::Sender<Vec<u8>>,
	topic: Arc<str>,
}

/// Background half of the producer. Must be spawned for publishes to reach
/// the backend.
pub struct ProducerLoop {
	rx: mpsc::Receiver<Vec<u8>>,
	backend: Arc<dyn StreamBackend>,
	topic: Arc<str>,
	batch_size: usize,
}

impl Producer {
	pub fn new(backend: Arc<dyn StreamBackend>, topic: impl Into<String>, cfg: ProducerConfig) -> (Producer, ProducerLoop) {
		let topic: Arc<str> = Arc::from(topic.into());
		let (tx, rx) = mpsc::channel(cfg.buffer_capacity.max(1));
		(
			Producer {
				tx,
				topic: Arc::clone(&topic),
			},
			ProducerLoop {
				rx,
				backend,
				topic,
				batch_size: cfg.batch_size.max(1),
			},
		)
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	/// Enqueue a payload. Waits while the buffer is full until space frees up
	/// or `token` is cancelled; a cancelled publish is not enqueued.
	pub async fn publish(&self, payload: Vec<u8>, token: &CancellationToken) -> Result<(), StreamError> {
		tokio::select! {
			biased;
			_ = token.cancelled() => Err(StreamError::Cancelled),
			res = self.tx.send(payload) => res.map_err(|_| StreamError::Closed),
		}
	}
}

impl ProducerLoop {
	/// Write buffered payloads until cancelled. Payloads still buffered at
	/// cancellation are dropped.
	pub async fn run(mut self, token: CancellationToken) {
		info!(topic = %self.topic, batch_size = self.batch_size, "stream producer started");

		loop {
			let first = tokio::select! {
				biased;
				_ = token.cancelled() => break,
				msg = self.rx.recv() => match msg {
					Some(p) => p,
					None => break,
				},
			};

			let mut batch = Vec::with_capacity(self.batch_size);
			batch.push(first);
			while batch.len() < self.batch_size {
				match self.rx.try_recv() {
					Ok(p) => batch.push(p),
					Err(_) => break,
				}
			}

			let n = batch.len() as u64;
			let started = Instant::now();
			match self.backend.append(&self.topic, batch).await {
				Ok(last_offset) => {
					metrics::counter!("parley_stream_published_total").increment(n);
					debug!(
						topic = %self.topic,
						count = n,
						last_offset,
						elapsed_ms = started.elapsed().as_millis() as u64,
						"stream batch appended"
					);
				}
				Err(e) => {
					metrics::counter!("parley_stream_publish_errors_total").increment(n);
					warn!(topic = %self.topic, count = n, error = %e, "stream append failed; batch dropped");
				}
			}
		}

		let dropped = self.rx.len();
		if dropped > 0 {
			metrics::counter!("parley_stream_dropped_on_shutdown_total").increment(dropped as u64);
			warn!(topic = %self.topic, dropped, "stream producer stopped with buffered payloads");
		} else {
			info!(topic = %self.topic, "stream producer stopped");
		}
	}
}
