#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use parley_util::endpoint::HostPort;
use parley_util::env::{env_parse, env_string, non_empty, read_toml_if_exists};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/storage.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	parley_util::env::default_config_path("storage.toml")
}

/// Load the storage config from TOML and env overrides.
pub fn load_storage_config_from_path(path: &Path) -> anyhow::Result<StorageConfig> {
	let file_cfg: FileConfig = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = StorageConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.normalize();
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
	pub server: ServerSettings,
	pub store: StoreSettings,
	pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Directory listener bind address (host:port).
	pub bind: String,
	pub metrics_bind: Option<String>,
	pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
	pub database_url: String,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
	pub database_url: String,
	pub topic: String,
	pub group_id: String,
	pub poll_interval: Duration,
	/// Fetch lease lifetime shared by the members of `group_id`.
	pub lease_ttl: Duration,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl StorageConfig {
	pub fn bind_addr(&self) -> anyhow::Result<HostPort> {
		HostPort::parse(&self.server.bind).map_err(anyhow::Error::msg)
	}

	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or_else(|| "127.0.0.1:8000".to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
				shutdown_grace: Duration::from_secs(file.server.shutdown_grace_secs.unwrap_or(10)),
			},
			store: StoreSettings {
				database_url: non_empty(file.store.database_url)
					.unwrap_or_else(|| "sqlite://parley.db?mode=rwc".to_string()),
			},
			stream: StreamSettings {
				database_url: non_empty(file.stream.database_url)
					.unwrap_or_else(|| "sqlite://parley.db?mode=rwc".to_string()),
				topic: non_empty(file.stream.topic).unwrap_or_else(|| "chat".to_string()),
				group_id: non_empty(file.stream.group_id).unwrap_or_else(|| "chat".to_string()),
				poll_interval: Duration::from_millis(file.stream.poll_interval_ms.unwrap_or(250)),
				lease_ttl: Duration::from_millis(file.stream.lease_ttl_ms.unwrap_or(10_000)),
			},
		}
	}

	fn normalize(&mut self) {
		if self.stream.poll_interval.is_zero() {
			warn!("stream config: poll_interval_ms must be >= 1; using 1");
			self.stream.poll_interval = Duration::from_millis(1);
		}
		let min_ttl = self.stream.poll_interval * 4;
		if self.stream.lease_ttl < min_ttl {
			warn!(
				lease_ttl = ?self.stream.lease_ttl,
				min = ?min_ttl,
				"stream config: lease_ttl_ms below 4x poll_interval_ms; raising"
			);
			self.stream.lease_ttl = min_ttl;
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	stream: FileStreamSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStreamSettings {
	database_url: Option<String>,
	topic: Option<String>,
	group_id: Option<String>,
	poll_interval_ms: Option<u64>,
	lease_ttl_ms: Option<u64>,
}

fn apply_env_overrides(cfg: &mut StorageConfig) {
	if let Some(v) = env_string("PARLEY_STORAGE_BIND") {
		cfg.server.bind = v;
		info!("storage config: bind overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STORAGE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("storage config: metrics_bind overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("PARLEY_SHUTDOWN_GRACE_SECS") {
		cfg.server.shutdown_grace = Duration::from_secs(secs);
		info!(secs, "storage config: shutdown_grace overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STORE_DATABASE_URL") {
		cfg.store.database_url = v;
		info!("store config: database_url overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STREAM_DATABASE_URL") {
		cfg.stream.database_url = v;
		info!("stream config: database_url overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STREAM_TOPIC") {
		cfg.stream.topic = v;
		info!("stream config: topic overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STREAM_GROUP_ID") {
		cfg.stream.group_id = v;
		info!("stream config: group_id overridden by env");
	}

	if let Some(ms) = env_parse::<u64>("PARLEY_STREAM_POLL_INTERVAL_MS") {
		cfg.stream.poll_interval = Duration::from_millis(ms);
		info!(ms, "stream config: poll_interval overridden by env");
	}

	if let Some(ms) = env_parse::<u64>("PARLEY_STREAM_LEASE_TTL_MS") {
		cfg.stream.lease_ttl = Duration::from_millis(ms);
		info!(ms, "stream config: lease_ttl overridden by env");
	}
}
