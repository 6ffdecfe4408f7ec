#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use parley_stream::{PersistentStreamBackend, Producer, ProducerConfig, StreamBackend};
use parley_util::lifecycle::Supervisor;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::gateway::{GatewayContext, GatewaySettings};
use crate::server::identity::HttpIdentityDirectory;
use crate::server::listener::GatewayService;
use crate::server::recent::{PersistentCacheBackend, RecentMessageCache};
use crate::server::registry::ConnectionRegistry;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--config path] [--bind host:port]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.parley/server.toml)\n\
\t--bind    Chat listener bind address (default: 127.0.0.1:8080)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	bind: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args { config: None, bind: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}
	args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	parley_util::telemetry::init_tracing("parley_server");

	let args = parse_args();
	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	parley_util::telemetry::init_metrics(cfg.server.metrics_bind.as_deref());

	let bind = cfg.bind_addr().context("invalid server bind address")?;
	let directory_addr = cfg.directory_addr().context("invalid directory address")?;

	let stream_backend: Arc<dyn StreamBackend> = Arc::new(
		PersistentStreamBackend::connect(&cfg.stream.database_url)
			.await
			.context("connect stream log")?,
	);

	let cache = match cfg.cache.database_url.as_deref() {
		Some(url) => {
			let backend = PersistentCacheBackend::connect(url, cfg.cache.key.clone())
				.await
				.context("connect recent message cache")?;
			RecentMessageCache::new(Arc::new(backend), cfg.cache.max_records)
		}
		None => RecentMessageCache::new_in_memory(cfg.cache.max_records),
	};

	let directory = Arc::new(HttpIdentityDirectory::new(&directory_addr)?);

	let listener = TcpListener::bind(bind.hostport())
		.await
		.with_context(|| format!("bind chat listener on {bind}"))?;

	let supervisor = Supervisor::new();

	let registry = ConnectionRegistry::new();
	let (broadcaster, workers) =
		registry.start_broadcaster(cfg.server.broadcast_workers, cfg.broadcast_queue_capacity())?;
	for worker in workers {
		let token = supervisor.token();
		supervisor.spawn("broadcast_worker", async move {
			worker.run(token).await;
			Ok(())
		});
	}

	let (producer, producer_loop) = Producer::new(
		stream_backend,
		cfg.stream.topic.clone(),
		ProducerConfig {
			buffer_capacity: cfg.stream.buffer_capacity,
			batch_size: cfg.stream.batch_size,
		},
	);
	let token = supervisor.token();
	supervisor.spawn("stream_producer", async move {
		producer_loop.run(token).await;
		Ok(())
	});

	let ctx = Arc::new(GatewayContext {
		registry,
		broadcaster,
		producer,
		cache,
		directory,
		settings: GatewaySettings {
			head_size: cfg.cache.head_size,
			inbound_queue_capacity: cfg.server.inbound_queue_capacity,
		},
	});

	let service = GatewayService::new(ctx, supervisor.group().clone());
	let grace = cfg.server.shutdown_grace;
	supervisor.spawn_drainable(
		"chat_listener",
		parley_util::http::serve(
			listener,
			move |req, remote| {
				let service = service.clone();
				async move { service.route(req, remote).await }
			},
			supervisor.drain_token(),
			grace,
		),
	);

	info!(%bind, "parley_server ready");
	supervisor.run_until_shutdown(grace).await
}
