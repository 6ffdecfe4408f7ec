#![forbid(unsafe_code)]

//! Minimal hyper HTTP/1 listener shared by the gateway and storage processes.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// Accept connections until `drain` is cancelled, then let in-flight requests
/// finish for at most `grace`.
///
/// Connections are served with upgrades enabled; an upgraded connection leaves
/// the listener's bookkeeping as soon as the upgrade response is written.
/// An accept failure is returned as an error.
pub async fn serve<H, Fut>(
	listener: TcpListener,
	handler: H,
	drain: CancellationToken,
	grace: Duration,
) -> anyhow::Result<()>
where
	H: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
	Fut: Future<Output = HttpResponse> + Send + 'static,
{
	let local = listener.local_addr().context("listener local addr")?;
	info!(%local, "http listener accepting");

	let in_flight = TaskTracker::new();
	loop {
		let (stream, remote) = tokio::select! {
			_ = drain.cancelled() => break,
			res = listener.accept() => res.context("accept http connection")?,
		};

		let io = TokioIo::new(stream);
		let handler = handler.clone();
		let drain = drain.clone();
		in_flight.spawn(async move {
			let service = service_fn(move |req| {
				let fut = handler(req, remote);
				async move { Ok::<_, Infallible>(fut.await) }
			});
			let conn = http1::Builder::new().serve_connection(io, service).with_upgrades();
			tokio::pin!(conn);

			let res = tokio::select! {
				res = conn.as_mut() => res,
				_ = drain.cancelled() => {
					conn.as_mut().graceful_shutdown();
					conn.await
				}
			};
			if let Err(e) = res {
				debug!(%remote, error = %e, "http connection error");
			}
		});
	}

	info!(%local, in_flight = in_flight.len(), "http listener draining");
	in_flight.close();
	if tokio::time::timeout(grace, in_flight.wait()).await.is_err() {
		warn!(%local, remaining = in_flight.len(), "http drain window elapsed");
	}
	Ok(())
}

/// JSON response with the given status. Serialization failure yields a bare 500.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
	match serde_json::to_vec(body) {
		Ok(bytes) => {
			let mut resp = Response::new(Full::new(Bytes::from(bytes)));
			*resp.status_mut() = status;
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "failed to encode json response");
			empty_response(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

pub fn empty_response(status: StatusCode) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

#[derive(Serialize)]
struct Health {
	status: &'static str,
}

/// `200 {"status":"ok"}`.
pub fn health_response() -> HttpResponse {
	json_response(StatusCode::OK, &Health { status: "ok" })
}

/// Collect a request body, refusing anything larger than `limit` bytes.
pub async fn read_body(body: Incoming, limit: usize) -> anyhow::Result<Bytes> {
	let collected = Limited::new(body, limit)
		.collect()
		.await
		.map_err(|e| anyhow::anyhow!(e))
		.context("read request body")?;
	Ok(collected.to_bytes())
}
