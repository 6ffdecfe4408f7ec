#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, anyhow};
use futures::StreamExt;
use futures::stream::SplitStream;
use parley_domain::{ChatMessage, UserId, Username};
use parley_stream::Producer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::identity::IdentityDirectory;
use crate::server::recent::RecentMessageCache;
use crate::server::registry::{Broadcaster, Connection, ConnectionRegistry};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// Messages replayed to a newly registered client.
	pub head_size: usize,
	/// Frames buffered between the socket reader task and the state machine.
	pub inbound_queue_capacity: usize,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			head_size: 10,
			inbound_queue_capacity: 16,
		}
	}
}

/// Shared collaborators of every connection gateway.
#[derive(Clone)]
pub struct GatewayContext {
	pub registry: ConnectionRegistry,
	pub broadcaster: Broadcaster,
	pub producer: Producer,
	pub cache: RecentMessageCache,
	pub directory: Arc<dyn IdentityDirectory>,
	pub settings: GatewaySettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
	Connected,
	Active { user_id: UserId, username: Username },
	Closing,
	Closed,
}

#[derive(Debug)]
enum Inbound {
	Frame(Vec<u8>),
	Closed,
}

/// Drive one upgraded socket until it closes or `token` is cancelled.
///
/// The first data frame is the registration token. After registration every
/// frame is a chat message that is stamped with the bound identity, handed to
/// the stream and cache, then broadcast. Returns the final state, which is
/// always `ConnState::Closed`.
pub async fn handle_connection<S>(
	conn_id: u64,
	remote: SocketAddr,
	ws: WebSocketStream<S>,
	ctx: Arc<GatewayContext>,
	token: CancellationToken,
) -> ConnState
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("parley_server_connections_total").increment(1);
	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (sink, stream) = ws.split();
	let conn = Arc::new(Connection::new(conn_id, remote, Box::new(sink)));

	let (inbound_tx, mut inbound_rx) = mpsc::channel(ctx.settings.inbound_queue_capacity.max(1));
	let reader_task = tokio::spawn(read_frames(conn_id, stream, inbound_tx));

	let mut state = ConnState::Connected;
	debug!(conn_id, %remote, "connection upgraded");

	loop {
		let frame = tokio::select! {
			biased;
			_ = token.cancelled() => {
				debug!(conn_id, "gateway cancelled");
				break;
			}
			item = inbound_rx.recv() => match item {
				Some(Inbound::Frame(frame)) => frame,
				Some(Inbound::Closed) | None => break,
			},
		};

		match &state {
			ConnState::Connected => {
				let registered = tokio::select! {
					biased;
					_ = token.cancelled() => break,
					res = register(&ctx, &conn, &frame) => res,
				};
				match registered {
					Ok((user_id, username)) => {
						metrics::counter!("parley_server_registrations_total").increment(1);
						info!(conn_id, %user_id, username = %username, "client registered");
						tokio::select! {
							biased;
							_ = token.cancelled() => break,
							_ = replay_recent(&ctx, &conn) => {}
						}
						state = ConnState::Active { user_id, username };
					}
					Err(e) => {
						metrics::counter!("parley_server_registration_failures_total").increment(1);
						warn!(conn_id, error = %format!("{e:#}"), "registration failed; closing");
						break;
					}
				}
			}
			ConnState::Active { user_id, username } => {
				handle_chat_frame(&ctx, conn_id, *user_id, username, &frame, &token).await;
			}
			ConnState::Closing | ConnState::Closed => break,
		}
	}

	state = ConnState::Closing;
	debug!(conn_id, ?state, "connection closing");
	ctx.registry.release(&conn).await;
	reader_task.abort();

	state = ConnState::Closed;
	info!(conn_id, %remote, "connection closed");
	state
}

async fn read_frames<S>(conn_id: u64, mut stream: SplitStream<WebSocketStream<S>>, tx: mpsc::Sender<Inbound>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	loop {
		let item = match stream.next().await {
			Some(Ok(Message::Text(text))) => Inbound::Frame(text.as_bytes().to_vec()),
			Some(Ok(Message::Binary(bytes))) => Inbound::Frame(bytes.to_vec()),
			Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
			Some(Ok(Message::Close(_))) | None => {
				let _ = tx.send(Inbound::Closed).await;
				return;
			}
			Some(Err(e)) => {
				debug!(conn_id, error = %e, "socket read failed");
				let _ = tx.send(Inbound::Closed).await;
				return;
			}
		};

		if tx.send(item).await.is_err() {
			return;
		}
	}
}

/// Validate the registration token, obtain an id and store the connection.
async fn register(ctx: &GatewayContext, conn: &Arc<Connection>, frame: &[u8]) -> anyhow::Result<(UserId, Username)> {
	let raw = std::str::from_utf8(frame).context("registration token is not valid UTF-8")?;
	let username = Username::parse(raw)?;
	let user_id = ctx.directory.register(&username).await?;

	if !ctx.registry.store(conn).await {
		return Err(anyhow!("connection {} already registered", conn.id()));
	}
	Ok((user_id, username))
}

async fn replay_recent(ctx: &GatewayContext, conn: &Connection) {
	let payloads = match ctx.cache.read_recent(ctx.settings.head_size).await {
		Ok(p) => p,
		Err(e) => {
			warn!(conn_id = conn.id(), error = %format!("{e:#}"), "recent history unavailable; replay skipped");
			return;
		}
	};

	let mut replayed = 0usize;
	for payload in payloads {
		let msg = match ChatMessage::from_payload(&payload) {
			Ok(m) => m,
			Err(e) => {
				warn!(conn_id = conn.id(), error = %e, "undecodable cached message skipped");
				continue;
			}
		};
		if let Err(e) = ctx.registry.write_msg(conn, &msg).await {
			warn!(conn_id = conn.id(), error = %e, "replay write failed");
			return;
		}
		replayed += 1;
	}
	debug!(conn_id = conn.id(), replayed, "recent history replayed");
}

async fn handle_chat_frame(
	ctx: &GatewayContext,
	conn_id: u64,
	user_id: UserId,
	username: &Username,
	frame: &[u8],
	token: &CancellationToken,
) {
	let mut msg = match ChatMessage::from_payload(frame) {
		Ok(m) => m,
		Err(e) => {
			metrics::counter!("parley_server_messages_dropped_total").increment(1);
			warn!(conn_id, error = %e, "undecodable chat frame dropped");
			return;
		}
	};
	msg.stamp(user_id, username);
	info!(conn_id, %user_id, username = %msg.username, text = %msg.text, "chat message");

	let payload = match msg.to_payload() {
		Ok(p) => p,
		Err(e) => {
			metrics::counter!("parley_server_messages_dropped_total").increment(1);
			warn!(conn_id, error = %e, "failed to encode chat message");
			return;
		}
	};

	let started = Instant::now();
	if let Err(e) = ctx.producer.publish(payload.clone(), token).await {
		metrics::counter!("parley_server_messages_dropped_total").increment(1);
		warn!(conn_id, error = %e, "stream hand-off failed; message not broadcast");
		return;
	}
	debug!(conn_id, elapsed_us = started.elapsed().as_micros() as u64, "message published");

	let started = Instant::now();
	let cached = tokio::select! {
		biased;
		_ = token.cancelled() => Err(anyhow!("cancelled")),
		res = ctx.cache.push(payload) => res,
	};
	if let Err(e) = cached {
		metrics::counter!("parley_server_messages_dropped_total").increment(1);
		warn!(conn_id, error = %format!("{e:#}"), "cache write failed; message not broadcast");
		return;
	}
	debug!(conn_id, elapsed_us = started.elapsed().as_micros() as u64, "message cached");

	metrics::counter!("parley_server_messages_accepted_total").increment(1);
	ctx.broadcaster.submit(msg, token);
}
