#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hyper::body::Incoming;
use hyper::header::{
	CONNECTION, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use parley_util::http::{HttpResponse, empty_response, health_response};
use parley_util::lifecycle::TaskGroup;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use crate::server::gateway::{GatewayContext, handle_connection};

/// HTTP front of the gateway: `GET /chat` upgrades to a WebSocket, `GET /healthz`
/// reports liveness.
#[derive(Clone)]
pub struct GatewayService {
	ctx: Arc<GatewayContext>,
	group: TaskGroup,
	next_conn_id: Arc<AtomicU64>,
}

impl GatewayService {
	pub fn new(ctx: Arc<GatewayContext>, group: TaskGroup) -> Self {
		Self {
			ctx,
			group,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub async fn route(&self, req: Request<Incoming>, remote: SocketAddr) -> HttpResponse {
		match (req.method(), req.uri().path()) {
			(&Method::GET, "/chat") => self.upgrade(req, remote),
			(&Method::GET, "/healthz") => health_response(),
			(_, "/chat" | "/healthz") => empty_response(StatusCode::METHOD_NOT_ALLOWED),
			_ => empty_response(StatusCode::NOT_FOUND),
		}
	}

	fn upgrade(&self, mut req: Request<Incoming>, remote: SocketAddr) -> HttpResponse {
		let Some(key) = websocket_key(req.headers()) else {
			debug!(%remote, "rejected non-websocket request to /chat");
			return empty_response(StatusCode::BAD_REQUEST);
		};
		let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
			return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
		};

		let on_upgrade = hyper::upgrade::on(&mut req);
		let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let ctx = Arc::clone(&self.ctx);
		let token = self.group.token();

		self.group.spawn("gateway", async move {
			match on_upgrade.await {
				Ok(upgraded) => {
					let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
					handle_connection(conn_id, remote, ws, ctx, token).await;
				}
				Err(e) => warn!(conn_id, %remote, error = %e, "websocket upgrade failed"),
			}
			Ok(())
		});

		let mut resp = empty_response(StatusCode::SWITCHING_PROTOCOLS);
		let headers = resp.headers_mut();
		headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
		resp
	}
}

/// `Sec-WebSocket-Key` of a valid RFC 6455 upgrade request.
fn websocket_key(headers: &HeaderMap) -> Option<String> {
	let header_has_token = |name: HeaderName, token: &str| {
		headers.get_all(name).iter().any(|v| {
			v.to_str()
				.map(|s| s.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
				.unwrap_or(false)
		})
	};

	if !header_has_token(CONNECTION, "upgrade") || !header_has_token(UPGRADE, "websocket") {
		return None;
	}
	if headers.get(SEC_WEBSOCKET_VERSION).and_then(|v| v.to_str().ok()) != Some("13") {
		return None;
	}
	headers
		.get(SEC_WEBSOCKET_KEY)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
}
