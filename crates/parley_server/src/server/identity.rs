#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use parley_domain::{RegisterRequest, RegisterResponse, UserId, Username};
use parley_util::endpoint::HostPort;

/// Issues user ids for validated usernames.
#[async_trait::async_trait]
pub trait IdentityDirectory: Send + Sync {
	async fn register(&self, username: &Username) -> anyhow::Result<UserId>;
}

/// `POST {base}/register` against the storage service.
#[derive(Debug, Clone)]
pub struct HttpIdentityDirectory {
	base_url: String,
	client: reqwest::Client,
}

impl HttpIdentityDirectory {
	pub fn new(addr: &HostPort) -> anyhow::Result<Self> {
		Self::with_base_url(addr.http_base())
	}

	/// Requests carry no deadline of their own; a stalled directory is cut
	/// off by the caller's shutdown token.
	pub fn with_base_url(base_url: impl Into<String>) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.build()
			.context("build identity directory client")?;
		Ok(Self {
			base_url: base_url.into(),
			client,
		})
	}
}

#[async_trait::async_trait]
impl IdentityDirectory for HttpIdentityDirectory {
	async fn register(&self, username: &Username) -> anyhow::Result<UserId> {
		let url = format!("{}/register", self.base_url.trim_end_matches('/'));
		let body = RegisterRequest {
			username: username.as_str().to_string(),
		};

		let resp = self
			.client
			.post(url)
			.json(&body)
			.send()
			.await
			.context("identity directory register")?;

		let status = resp.status();
		if !status.is_success() {
			return Err(anyhow!("identity directory register failed: status={}", status));
		}

		let parsed: RegisterResponse = resp.json().await.context("decode register response")?;
		if parsed.user_id.is_unset() {
			return Err(anyhow!("identity directory returned an unset user_id"));
		}
		Ok(parsed.user_id)
	}
}
