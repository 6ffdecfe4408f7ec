#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use parley_domain::{ErrorResponse, RegisterRequest, RegisterResponse, Username};
use parley_util::http::{HttpResponse, empty_response, health_response, json_response, read_body};
use tracing::{info, warn};

use crate::storage::store::MessageStore;

const MAX_REGISTER_BODY: usize = 4 * 1024;

/// HTTP front of the identity directory: `POST /register` and `GET /healthz`.
#[derive(Clone)]
pub struct DirectoryService {
	store: Arc<dyn MessageStore>,
}

impl DirectoryService {
	pub fn new(store: Arc<dyn MessageStore>) -> Self {
		Self { store }
	}

	pub async fn route(&self, req: Request<Incoming>, remote: SocketAddr) -> HttpResponse {
		match (req.method(), req.uri().path()) {
			(&Method::POST, "/register") => self.register(req, remote).await,
			(&Method::GET, "/healthz") => health_response(),
			(_, "/register" | "/healthz") => empty_response(StatusCode::METHOD_NOT_ALLOWED),
			_ => empty_response(StatusCode::NOT_FOUND),
		}
	}

	async fn register(&self, req: Request<Incoming>, remote: SocketAddr) -> HttpResponse {
		let parsed = read_body(req.into_body(), MAX_REGISTER_BODY)
			.await
			.and_then(|body| serde_json::from_slice::<RegisterRequest>(&body).map_err(anyhow::Error::from));
		let body = match parsed {
			Ok(body) => body,
			Err(e) => {
				warn!(%remote, error = %e, "register: bad request body");
				return error_response(StatusCode::BAD_REQUEST, "bad json");
			}
		};

		let username = match Username::parse(&body.username) {
			Ok(name) => name,
			Err(e) => {
				warn!(%remote, error = %e, "register: invalid username");
				return error_response(StatusCode::BAD_REQUEST, "invalid username");
			}
		};

		match self.store.add_user(&username).await {
			Ok(user_id) => {
				info!(%user_id, %username, "user registered");
				metrics::counter!("parley_storage_registrations_total").increment(1);
				json_response(StatusCode::CREATED, &RegisterResponse { user_id })
			}
			Err(e) => {
				warn!(%username, error = %e, "register: store failed");
				metrics::counter!("parley_storage_registration_failures_total").increment(1);
				error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to register")
			}
		}
	}
}

fn error_response(status: StatusCode, error: &str) -> HttpResponse {
	json_response(
		status,
		&ErrorResponse {
			error: error.to_string(),
		},
	)
}
