#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use parley_util::endpoint::HostPort;
use parley_util::env::{env_parse, env_string, non_empty, read_toml_if_exists};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/server.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	parley_util::env::default_config_path("server.toml")
}

/// Load the gateway config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg: FileConfig = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.normalize();
	Ok(cfg)
}

/// Gateway config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub directory: DirectorySettings,
	pub stream: StreamSettings,
	pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Chat listener bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Drain window for in-flight HTTP requests on shutdown.
	pub shutdown_grace: Duration,
	pub broadcast_workers: usize,
	/// Broadcast queue capacity; defaults to the worker count.
	pub broadcast_queue_capacity: Option<usize>,
	pub inbound_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct DirectorySettings {
	/// Identity directory (storage service) address (host:port).
	pub addr: String,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
	pub database_url: String,
	pub topic: String,
	pub buffer_capacity: usize,
	pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
	/// Unset keeps the window in process memory.
	pub database_url: Option<String>,
	pub key: String,
	pub max_records: usize,
	pub head_size: usize,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl ServerConfig {
	pub fn bind_addr(&self) -> anyhow::Result<HostPort> {
		HostPort::parse(&self.server.bind).map_err(anyhow::Error::msg)
	}

	pub fn directory_addr(&self) -> anyhow::Result<HostPort> {
		HostPort::parse(&self.directory.addr).map_err(anyhow::Error::msg)
	}

	pub fn broadcast_queue_capacity(&self) -> usize {
		self.server
			.broadcast_queue_capacity
			.unwrap_or(self.server.broadcast_workers)
	}

	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or_else(|| "127.0.0.1:8080".to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
				shutdown_grace: Duration::from_secs(file.server.shutdown_grace_secs.unwrap_or(10)),
				broadcast_workers: file.server.broadcast_workers.unwrap_or(5),
				broadcast_queue_capacity: file.server.broadcast_queue_capacity,
				inbound_queue_capacity: file.server.inbound_queue_capacity.unwrap_or(16),
			},
			directory: DirectorySettings {
				addr: non_empty(file.directory.addr).unwrap_or_else(|| "127.0.0.1:8000".to_string()),
			},
			stream: StreamSettings {
				database_url: non_empty(file.stream.database_url)
					.unwrap_or_else(|| "sqlite://parley.db?mode=rwc".to_string()),
				topic: non_empty(file.stream.topic).unwrap_or_else(|| "chat".to_string()),
				buffer_capacity: file.stream.buffer_capacity.unwrap_or(100),
				batch_size: file.stream.batch_size.unwrap_or(10),
			},
			cache: CacheSettings {
				database_url: non_empty(file.cache.database_url),
				key: non_empty(file.cache.key).unwrap_or_else(|| "chat".to_string()),
				max_records: file.cache.max_records.unwrap_or(1000),
				head_size: file.cache.head_size.unwrap_or(10),
			},
		}
	}

	fn normalize(&mut self) {
		if self.server.broadcast_workers == 0 {
			warn!("server config: broadcast_workers must be >= 1; using 1");
			self.server.broadcast_workers = 1;
		}
		if self.stream.batch_size == 0 {
			warn!("stream config: batch_size must be >= 1; using 1");
			self.stream.batch_size = 1;
		}
		if self.cache.max_records == 0 {
			warn!("cache config: max_records must be >= 1; using 1");
			self.cache.max_records = 1;
		}
		if self.cache.head_size > self.cache.max_records {
			warn!(
				head_size = self.cache.head_size,
				max_records = self.cache.max_records,
				"cache config: head_size > max_records; clamping"
			);
			self.cache.head_size = self.cache.max_records;
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	directory: FileDirectorySettings,

	#[serde(default)]
	stream: FileStreamSettings,

	#[serde(default)]
	cache: FileCacheSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	shutdown_grace_secs: Option<u64>,
	broadcast_workers: Option<usize>,
	broadcast_queue_capacity: Option<usize>,
	inbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	addr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStreamSettings {
	database_url: Option<String>,
	topic: Option<String>,
	buffer_capacity: Option<usize>,
	batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	database_url: Option<String>,
	key: Option<String>,
	max_records: Option<usize>,
	head_size: Option<usize>,
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("PARLEY_SERVER_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("PARLEY_SHUTDOWN_GRACE_SECS") {
		cfg.server.shutdown_grace = Duration::from_secs(secs);
		info!(secs, "server config: shutdown_grace overridden by env");
	}

	if let Some(workers) = env_parse::<usize>("PARLEY_BROADCAST_WORKERS") {
		cfg.server.broadcast_workers = workers;
		info!(workers, "server config: broadcast_workers overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>("PARLEY_INBOUND_QUEUE_CAPACITY") {
		cfg.server.inbound_queue_capacity = capacity;
		info!(capacity, "server config: inbound_queue_capacity overridden by env");
	}

	if let Some(v) = env_string("PARLEY_DIRECTORY_ADDR") {
		cfg.directory.addr = v;
		info!("directory config: addr overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STREAM_DATABASE_URL") {
		cfg.stream.database_url = v;
		info!("stream config: database_url overridden by env");
	}

	if let Some(v) = env_string("PARLEY_STREAM_TOPIC") {
		cfg.stream.topic = v;
		info!("stream config: topic overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>("PARLEY_STREAM_BUFFER_CAPACITY") {
		cfg.stream.buffer_capacity = capacity;
		info!(capacity, "stream config: buffer_capacity overridden by env");
	}

	if let Some(batch) = env_parse::<usize>("PARLEY_STREAM_BATCH_SIZE") {
		cfg.stream.batch_size = batch;
		info!(batch, "stream config: batch_size overridden by env");
	}

	if let Some(v) = env_string("PARLEY_CACHE_DATABASE_URL") {
		cfg.cache.database_url = Some(v);
		info!("cache config: database_url overridden by env");
	}

	if let Some(v) = env_string("PARLEY_CACHE_KEY") {
		cfg.cache.key = v;
		info!("cache config: key overridden by env");
	}

	if let Some(max) = env_parse::<usize>("PARLEY_CACHE_MAX_RECORDS") {
		cfg.cache.max_records = max;
		info!(max, "cache config: max_records overridden by env");
	}

	if let Some(head) = env_parse::<usize>("PARLEY_CACHE_HEAD_SIZE") {
		cfg.cache.head_size = head;
		info!(head, "cache config: head_size overridden by env");
	}
}
