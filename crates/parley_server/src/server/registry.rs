#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::SinkExt;
use futures::stream::SplitSink;
use parley_domain::ChatMessage;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("broadcaster already started")]
	BroadcasterAlreadyStarted,
	#[error("connection {0} is closed")]
	Closed(u64),
	#[error("encode message: {0}")]
	Encode(#[from] serde_json::Error),
	#[error("socket write failed: {0}")]
	Write(#[from] tungstenite::Error),
}

/// Write half of a message-framed socket.
#[async_trait::async_trait]
pub trait FrameSink: Send {
	async fn send_text(&mut self, text: String) -> Result<(), RegistryError>;

	async fn close(&mut self) -> Result<(), RegistryError>;
}

#[async_trait::async_trait]
impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	async fn send_text(&mut self, text: String) -> Result<(), RegistryError> {
		self.send(Message::Text(text.into())).await?;
		Ok(())
	}

	async fn close(&mut self) -> Result<(), RegistryError> {
		SinkExt::close(self).await?;
		Ok(())
	}
}

/// A live client socket as seen by the registry.
pub struct Connection {
	id: u64,
	remote: SocketAddr,
	sink: Mutex<Box<dyn FrameSink>>,
	closed: AtomicBool,
}

impl Connection {
	pub fn new(id: u64, remote: SocketAddr, sink: Box<dyn FrameSink>) -> Self {
		Self {
			id,
			remote,
			sink: Mutex::new(sink),
			closed: AtomicBool::new(false),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("remote", &self.remote)
			.field("closed", &self.is_closed())
			.finish()
	}
}

/// Set of registered connections and the fan-out machinery over it.
///
/// Every socket write in the process goes through one global write lock.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	conns: RwLock<HashMap<u64, Arc<Connection>>>,
	write_lock: Mutex<()>,
	broadcaster_started: AtomicBool,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a connection. Returns `false` if it was already present.
	pub async fn store(&self, conn: &Arc<Connection>) -> bool {
		let mut conns = self.inner.conns.write().await;
		if conns.contains_key(&conn.id) {
			return false;
		}
		conns.insert(conn.id, Arc::clone(conn));
		metrics::gauge!("parley_server_registered_connections").set(conns.len() as f64);
		debug!(conn_id = conn.id, registered = conns.len(), "connection stored");
		true
	}

	/// Close the socket (once) and drop the connection from the set.
	pub async fn release(&self, conn: &Connection) {
		if !conn.closed.swap(true, Ordering::AcqRel) {
			let _write = self.inner.write_lock.lock().await;
			let mut sink = conn.sink.lock().await;
			if let Err(e) = sink.close().await {
				debug!(conn_id = conn.id, error = %e, "socket close failed");
			}
		}

		let mut conns = self.inner.conns.write().await;
		if conns.remove(&conn.id).is_some() {
			metrics::gauge!("parley_server_registered_connections").set(conns.len() as f64);
			debug!(conn_id = conn.id, registered = conns.len(), "connection released");
		}
	}

	/// Serialize `msg` and write it as one text frame.
	pub async fn write_msg(&self, conn: &Connection, msg: &ChatMessage) -> Result<(), RegistryError> {
		let text = serde_json::to_string(msg)?;
		self.write_text(conn, text).await
	}

	async fn write_text(&self, conn: &Connection, text: String) -> Result<(), RegistryError> {
		if conn.is_closed() {
			return Err(RegistryError::Closed(conn.id));
		}
		let _write = self.inner.write_lock.lock().await;
		let mut sink = conn.sink.lock().await;
		sink.send_text(text).await
	}

	pub async fn len(&self) -> usize {
		self.inner.conns.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.inner.conns.read().await.is_empty()
	}

	pub async fn contains(&self, conn_id: u64) -> bool {
		self.inner.conns.read().await.contains_key(&conn_id)
	}

	/// Write `msg` to every registered connection. Returns the number of
	/// successful writes. Failures are logged and do not remove connections.
	pub async fn fan_out(&self, msg: &ChatMessage) -> usize {
		let text = match serde_json::to_string(msg) {
			Ok(t) => t,
			Err(e) => {
				warn!(error = %e, "failed to encode broadcast message");
				return 0;
			}
		};

		let conns = self.inner.conns.read().await;
		let mut delivered = 0;
		for conn in conns.values() {
			match self.write_text(conn, text.clone()).await {
				Ok(()) => {
					delivered += 1;
					metrics::counter!("parley_server_broadcast_writes_total").increment(1);
				}
				Err(e) => {
					metrics::counter!("parley_server_broadcast_write_errors_total").increment(1);
					warn!(conn_id = conn.id, remote = %conn.remote, error = %e, "broadcast write failed");
				}
			}
		}
		delivered
	}

	/// Create the broadcast queue and its workers. Allowed once per registry.
	///
	/// The caller spawns each returned worker.
	pub fn start_broadcaster(
		&self,
		workers: usize,
		queue_capacity: usize,
	) -> Result<(Broadcaster, Vec<BroadcastWorker>), RegistryError> {
		if self.inner.broadcaster_started.swap(true, Ordering::AcqRel) {
			return Err(RegistryError::BroadcasterAlreadyStarted);
		}

		let workers = workers.max(1);
		let (tx, rx) = mpsc::channel(queue_capacity.max(1));
		let rx = Arc::new(Mutex::new(rx));
		let pool = (0..workers)
			.map(|id| BroadcastWorker {
				id,
				rx: Arc::clone(&rx),
				registry: self.clone(),
			})
			.collect();

		info!(workers, queue_capacity, "broadcaster started");
		Ok((Broadcaster { tx }, pool))
	}
}

/// Submit handle for the broadcast queue.
#[derive(Clone)]
pub struct Broadcaster {
	tx: mpsc::Sender<ChatMessage>,
}

impl Broadcaster {
	/// Queue `msg` for fan-out without blocking the caller.
	///
	/// When the queue is full a detached task waits for space, and gives up
	/// once `token` is cancelled.
	pub fn submit(&self, msg: ChatMessage, token: &CancellationToken) {
		match self.tx.try_send(msg) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(msg)) => {
				metrics::counter!("parley_server_broadcast_queue_full_total").increment(1);
				let tx = self.tx.clone();
				let token = token.clone();
				tokio::spawn(async move {
					tokio::select! {
						biased;
						_ = token.cancelled() => debug!("broadcast abandoned on shutdown"),
						res = tx.send(msg) => {
							if res.is_err() {
								debug!("broadcast queue closed; message dropped");
							}
						}
					}
				});
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!("broadcast queue closed; message dropped");
			}
		}
	}
}

/// One fan-out worker. All workers share a single queue.
pub struct BroadcastWorker {
	id: usize,
	rx: Arc<Mutex<mpsc::Receiver<ChatMessage>>>,
	registry: ConnectionRegistry,
}

impl BroadcastWorker {
	pub async fn run(self, token: CancellationToken) {
		debug!(worker = self.id, "broadcast worker started");
		loop {
			let msg = {
				let mut rx = tokio::select! {
					biased;
					_ = token.cancelled() => break,
					rx = self.rx.lock() => rx,
				};
				tokio::select! {
					biased;
					_ = token.cancelled() => break,
					msg = rx.recv() => msg,
				}
			};

			let Some(msg) = msg else {
				break;
			};
			let delivered = self.registry.fan_out(&msg).await;
			debug!(worker = self.id, delivered, "broadcast delivered");
		}
		debug!(worker = self.id, "broadcast worker stopped");
	}
}
